use std::{error::Error, io, path::PathBuf, process::ExitCode};

use nix::unistd::Uid;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use initg::{
    cli::{Cli, Commands, parse_args},
    config,
    runtime::{self, RuntimeMode},
    supervisor::{Settings, Supervisor},
};

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("initg: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode, Box<dyn Error>> {
    let args = parse_args();
    let euid = Uid::effective();

    let mode = if args.sys {
        if !euid.is_root() {
            return Err(Box::new(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "--sys requires root privileges",
            )));
        }
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };
    runtime::init(mode);
    init_logging(&args);

    if euid.is_root() && mode == RuntimeMode::User {
        warn!("running as root without --sys; state lives in userspace paths");
    }

    match args.command {
        Commands::Up { config, runlevel } => {
            let config_dir = resolve_config_dir(config);
            let state_dir = runtime::state_dir();
            let _lock = runtime::acquire_lock(&state_dir)?;

            info!("starting supervisor with config {}", config_dir.display());
            let mut supervisor = Supervisor::new(Settings {
                config_dir,
                state_dir,
                default_runlevel: runlevel,
            });
            supervisor.load_config()?;
            supervisor.run()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { config } => {
            let config_dir = resolve_config_dir(config);
            let conf = config::load_dir(&config_dir)?;

            for stanza in &conf.stanzas {
                println!(
                    "ok   {:<24} {} {}",
                    stanza.decl.display_name(),
                    stanza.decl.kind,
                    stanza.decl.runlevels
                );
            }
            for issue in &conf.issues {
                println!(
                    "FAIL {}:{}: {}",
                    issue.origin.display(),
                    issue.line,
                    issue.error
                );
            }
            println!(
                "{} service(s), {} refused",
                conf.stanzas.len(),
                conf.issues.len()
            );
            if conf.issues.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

fn resolve_config_dir(arg: Option<String>) -> PathBuf {
    arg.map(PathBuf::from).unwrap_or_else(runtime::config_dir)
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
