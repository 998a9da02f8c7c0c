use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "netdiskcache", about = "Inspect and maintain an on-disk HTTP cache")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./netdiskcache.toml if present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Cache directory; overrides `cache_dir` from the configuration.
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum cache size in bytes; overrides `maximum_cache_size`.
    #[arg(long, global = true)]
    pub max_size: Option<u64>,

    #[arg(long, global = true, value_enum)]
    pub log: Option<LogFormat>,

    /// Print cache metrics in the prometheus text format when done.
    #[arg(long, global = true)]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the total size of all cache entries.
    Size,
    /// Evict the oldest entries until the cache fits its budget.
    Expire,
    /// Delete every cache entry.
    Clear,
    /// Print the entry file path for a URL.
    Path { url: String },
    /// Write a cached body to stdout or a file.
    Get {
        url: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Store a file as the cached response for a URL.
    Put {
        url: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Remove the entry for a URL.
    Remove { url: String },
    /// Print the metadata stored in an entry file.
    Inspect { file: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
