//! Command-line interface for initg.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels by name.
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(pub LevelFilter);

impl LogLevelArg {
    /// String representation suitable for an `EnvFilter` directive.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let level = match value.trim().to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            other => return Err(format!("invalid log level '{other}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for initg.
#[derive(Parser)]
#[command(name = "initg", version, author)]
#[command(about = "A small init and service supervisor", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Use system paths (/etc/initg.d, /run/initg). Requires root.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for initg.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor in the foreground.
    Up {
        /// Configuration directory (defaults to the mode's config dir).
        #[arg(short, long)]
        config: Option<String>,

        /// Runlevel to enter after bootstrap, overriding the
        /// configuration's `runlevel` directive.
        #[arg(short, long)]
        runlevel: Option<u8>,
    },

    /// Parse the configuration and report every refused stanza.
    Check {
        /// Configuration directory (defaults to the mode's config dir).
        #[arg(short, long)]
        config: Option<String>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
