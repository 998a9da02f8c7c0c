use std::path::{Path, PathBuf};

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cache::DEFAULT_MAXIMUM_CACHE_SIZE;
use crate::cli::{Cli, LogFormat};

fn default_maximum_cache_size() -> u64 {
    DEFAULT_MAXIMUM_CACHE_SIZE
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_maximum_cache_size")]
    pub maximum_cache_size: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

impl Settings {
    /// Layers, lowest first: configuration file, `NETDISKCACHE__*` environment
    /// variables, command line flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("NETDISKCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.apply_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if let Some(cache_dir) = self.cache_dir.clone() {
            self.cache_dir = Some(absolutize(&cache_dir, base_dir));
        }
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.cache_dir {
            self.cache_dir = Some(dir.clone());
        }
        if let Some(size) = cli.max_size {
            self.maximum_cache_size = size;
        }
        if let Some(log) = cli.log {
            self.log = log;
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cache_dir.is_some(),
            "cache_dir must be set in the configuration, via NETDISKCACHE__CACHE_DIR or --cache-dir"
        );
        ensure!(
            self.maximum_cache_size > 0,
            "maximum_cache_size must be greater than 0 (got {})",
            self.maximum_cache_size
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Some(path.to_path_buf());
    }
    default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/netdiskcache/netdiskcache.toml"),
        PathBuf::from("netdiskcache.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use clap::Parser;
    use std::fs;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["netdiskcache"];
        argv.extend_from_slice(args);
        argv.push("size");
        Cli::try_parse_from(argv).expect("parse cli")
    }

    #[test]
    fn config_file_paths_resolve_against_its_directory() -> Result<()> {
        let dir = TempDir::new()?;
        let config = dir.path().join("netdiskcache.toml");
        fs::write(
            &config,
            "cache_dir = \"cache\"\nmaximum_cache_size = 2048\nlog = \"json\"\n",
        )?;

        let settings = Settings::load(&cli(&["--config", config.to_str().expect("utf-8")]))?;
        assert_eq!(settings.cache_dir, Some(dir.path().join("cache")));
        assert_eq!(settings.maximum_cache_size, 2048);
        assert_eq!(settings.log, LogFormat::Json);
        Ok(())
    }

    #[test]
    fn command_line_overrides_config_file() -> Result<()> {
        let dir = TempDir::new()?;
        let config = dir.path().join("custom.toml");
        fs::write(&config, "cache_dir = \"/var/cache/a\"\nmaximum_cache_size = 2048\n")?;

        let settings = Settings::load(&cli(&[
            "--config",
            config.to_str().expect("utf-8"),
            "--cache-dir",
            "/var/cache/b",
            "--max-size",
            "4096",
        ]))?;
        assert_eq!(settings.cache_dir, Some(PathBuf::from("/var/cache/b")));
        assert_eq!(settings.maximum_cache_size, 4096);
        assert_eq!(settings.log, LogFormat::Text);
        Ok(())
    }

    #[test]
    fn explicit_config_must_exist() {
        let err = Settings::load(&cli(&["--config", "/nonexistent/netdiskcache.toml"]));
        assert!(err.is_err());
    }

    #[test]
    fn validation_requires_directory_and_budget() {
        let mut settings = Settings {
            cache_dir: None,
            maximum_cache_size: DEFAULT_MAXIMUM_CACHE_SIZE,
            log: LogFormat::Text,
        };
        assert!(settings.validate().is_err());

        settings.cache_dir = Some(PathBuf::from("/var/cache/netdiskcache"));
        assert!(settings.validate().is_ok());

        settings.maximum_cache_size = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("maximum_cache_size"));
    }
}
