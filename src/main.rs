use std::io::{self, Write};

use anyhow::Result;
use clap::Parser;

use netdiskcache::{cli::Cli, logging, metrics, run, settings::Settings};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log)?;

    let mut stdout = io::stdout().lock();
    run(&settings, &cli.command, &mut stdout)?;
    if cli.metrics {
        stdout.write_all(&metrics::gather())?;
    }
    stdout.flush()?;
    Ok(())
}
