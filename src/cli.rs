//! Uses clap to define the CLI interface declaratively.
use std::path::PathBuf;

use clap::{command, Parser};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// configuration file (.toml, .yaml, .yml or .json)
    #[arg(short, default_value = "dynein.toml", long, value_name = "FILE")]
    pub config: PathBuf,

    /// overrides the loglevel from the configuration
    #[arg(short, long, value_name = "LEVEL")]
    pub loglevel: Option<log::Level>,

    /// overrides the pidfile from the configuration
    #[arg(short, long, value_name = "FILE")]
    pub pidfile: Option<PathBuf>,
}
