mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use dynein::conf::Config;
use dynein::{Exit, Options, Supervisor};
use log::info;

use crate::cli::Cli;

fn load(cli: &Cli) -> Result<Config> {
    Config::load(&cli.config).with_context(|| format!("failed to load {}", cli.config.display()))
}

fn level(cli: &Cli, config: &Config) -> Result<log::Level> {
    match cli.loglevel {
        Some(level) => Ok(level),
        None => config
            .supervisor
            .loglevel
            .parse()
            .with_context(|| format!("bad loglevel {:?}", config.supervisor.loglevel)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load(&cli)?;
    simple_logger::init_with_level(level(&cli, &config)?)?;
    info!("dynein starting (version {})", env!("CARGO_PKG_VERSION"));

    loop {
        let groups = config.groups().context("invalid configuration")?;
        let mut options = Options::from_conf(&config.supervisor);
        if let Some(pidfile) = &cli.pidfile {
            options.pidfile = Some(pidfile.clone());
        }

        let mut supervisor = Supervisor::new(options, groups)?;
        match supervisor.run()? {
            Exit::Shutdown => break,
            Exit::Restart => {
                drop(supervisor);
                info!("restarting with {}", cli.config.display());
                config = load(&cli)?;
                log::set_max_level(level(&cli, &config)?.to_level_filter());
            }
        }
    }

    info!("dynein shutting down");
    Ok(())
}
