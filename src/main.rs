//! panebox - run a full-screen terminal program in a pane
//!
//! The program is started on its own pseudo terminal sized to the pane, and
//! its output is rewritten so that it draws only in the bottom rows of the
//! host terminal. Scrollback above the pane is left alone.
//!
//! # Quick Start
//!
//! ```text
//! panebox vim notes.txt            # 20-line pane at the bottom
//! panebox --height 12 htop         # smaller pane
//! panebox --quit-key ^] less -R x  # quit with Ctrl-] instead of Ctrl-Q
//! ```
//!
//! The quit key (Ctrl-Q by default) ends the session when a read from the
//! terminal starts with it. Later bytes of the same read, the key included,
//! go to the child like any other input.

mod config;
mod core;
mod wm;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Config, ConfigError};
#[cfg(unix)]
use crate::core::session::{Session, SessionError, SessionOptions};

/// Environment variable holding a log filter, e.g. `PANEBOX_LOG=debug`
const LOG_ENV: &str = "PANEBOX_LOG";
/// Exit status when the command cannot be started, as in POSIX shells
#[cfg(unix)]
const EXIT_SPAWN_FAILED: u8 = 127;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "panebox", version, about)]
struct Cli {
    /// Pane height in lines
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    height: Option<u16>,

    /// Key that ends the session (ctrl-q, ^Q, 0x11, ...)
    #[arg(long, value_name = "KEY")]
    quit_key: Option<String>,

    /// Configuration file [default: ~/.panebox/config.toml]
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Program to run in the pane, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

impl Cli {
    /// Configuration file values with command line overrides applied
    fn apply(&self, mut config: Config) -> Config {
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(quit_key) = &self.quit_key {
            config.quit_key = quit_key.clone();
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("panebox: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);
    info!("panebox {} starting: {:?}", env!("CARGO_PKG_VERSION"), cli.command);

    match run(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            // The terminal is already restored at this point
            eprintln!("panebox: {:#}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}

/// Config file merged with the command line, validated as a whole
fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let config = cli.apply(Config::load(cli.config.as_deref())?);
    config.validate()?;
    Ok(config)
}

/// Log to a file only; the terminal belongs to the pane.
/// Logging is skipped if the file cannot be opened.
fn init_logging(config: &Config) {
    let Some(log_path) = config.log_path() else {
        return;
    };
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) else {
        return;
    };

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(unix)]
fn run(command: Vec<String>, config: &Config) -> anyhow::Result<()> {
    let options = SessionOptions {
        command,
        height: config.height,
        quit_key: config.quit_byte()?,
        flush_interval_ms: config.flush_interval_ms,
        redraw_on_resize: config.redraw_on_resize,
        erase_policy: config.erase_policy,
    };

    let outcome = Session::start(options)?.run()?;
    info!("Exiting after {:?}, child status {:?}", outcome.reason, outcome.status);
    Ok(())
}

#[cfg(not(unix))]
fn run(_command: Vec<String>, _config: &Config) -> anyhow::Result<()> {
    anyhow::bail!("panebox needs a Unix pseudo terminal and does not run on this platform")
}

/// Process exit status for a failed run
fn exit_status(err: &anyhow::Error) -> u8 {
    #[cfg(unix)]
    if err
        .downcast_ref::<SessionError>()
        .map_or(false, SessionError::is_spawn_failure)
    {
        return EXIT_SPAWN_FAILED;
    }
    let _ = err;
    1
}
