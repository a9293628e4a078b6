//! hwauth CLI - authenticate hardware wallets and update their firmware.
//!
//! ## Features
//!
//! - Device challenge/response authentication against the verification server
//! - Four-card authentication with per-card retry
//! - Firmware check, download and install
//! - Interactive or scripted port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use hwauth::{CancelToken, GateDenial};
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Exit code for success.
const EXIT_OK: u8 = 0;
/// Exit code for any failure without a more specific code.
const EXIT_FAILURE: u8 = 1;
/// Exit code for usage errors (also used by clap).
const EXIT_USAGE: u8 = 2;
/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 3;
/// Exit code when no device is found or the link is gone.
const EXIT_NO_DEVICE: u8 = 4;
/// Exit code for terminal authentication failures.
const EXIT_TERMINAL: u8 = 5;
/// Exit code after Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

/// CLI-level failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or a prompt that cannot be shown.
    #[error("{0}")]
    Usage(String),
    /// Missing or inconsistent configuration.
    #[error("{0}")]
    Config(String),
    /// No wallet to talk to.
    #[error("{0}")]
    DeviceNotFound(String),
    /// Authentication failed for good.
    #[error("{0}")]
    Terminal(String),
    /// The user cancelled.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => EXIT_USAGE,
            Self::Config(_) => EXIT_CONFIG,
            Self::DeviceNotFound(_) => EXIT_NO_DEVICE,
            Self::Terminal(_) => EXIT_TERMINAL,
            Self::Cancelled(_) => EXIT_CANCELLED,
        }
    }
}

/// Map an error chain to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return cli.exit_code();
    }
    let Some(err) = err.downcast_ref::<hwauth::Error>() else {
        return EXIT_FAILURE;
    };
    match err {
        hwauth::Error::Cancelled => EXIT_CANCELLED,
        hwauth::Error::Config(_) => EXIT_CONFIG,
        hwauth::Error::DeviceNotFound | hwauth::Error::DeviceNotConnected => EXIT_NO_DEVICE,
        hwauth::Error::RetryRefused(GateDenial::Terminal(_)) => EXIT_TERMINAL,
        hwauth::Error::RetryRefused(GateDenial::DeviceDisconnected) => EXIT_NO_DEVICE,
        other => {
            let class = other.classify();
            if class.kind.terminal() {
                EXIT_TERMINAL
            } else if class.kind == hwauth::ErrorKind::DeviceNotConnected {
                EXIT_NO_DEVICE
            } else {
                EXIT_FAILURE
            }
        },
    }
}

/// hwauth - authenticate hardware wallets and update their firmware.
///
/// Environment variables:
///   HWAUTH_PORT              - Default serial port
///   HWAUTH_BAUD              - Default baud rate (default: 115200)
///   HWAUTH_SERVER            - Verification and firmware server URL
///   HWAUTH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "hwauth")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port of the wallet (auto-detected if not specified).
    #[arg(short, long, global = true, env = "HWAUTH_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate of the wallet link.
    #[arg(short, long, global = true, env = "HWAUTH_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Base URL of the verification and firmware server.
    #[arg(long, global = true, env = "HWAUTH_SERVER")]
    pub(crate) server: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "HWAUTH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Authenticate the connected wallet against the server.
    DeviceAuth,

    /// Authenticate the four backup cards one after another.
    CardAuth {
        /// Retry failed cards without asking.
        #[arg(long)]
        retry: bool,
    },

    /// Check for and install the latest firmware.
    Update {
        /// Only report whether an update is available.
        #[arg(long)]
        check: bool,

        /// Directory to download the image into.
        #[arg(long, value_name = "DIR")]
        download_dir: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "hwauth v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let mut config = match &cli.config_path {
        Some(path) => Config::load_with_override(path),
        None => Config::load(),
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        // A second Ctrl-C gives up on cooperative cancellation.
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(i32::from(EXIT_CANCELLED));
        }
        handler_token.cancel();
    }) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    match run(&cli, &mut config, &cancel) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(err) => {
            let code = exit_code(&err);
            eprintln!("{} {err:#}", style("Error:").red().bold());
            if code == EXIT_TERMINAL {
                eprintln!(
                    "{}",
                    style("This cannot be fixed by retrying. Please contact support.").yellow()
                );
            }
            ExitCode::from(code)
        },
    }
}

fn run(cli: &Cli, config: &mut Config, cancel: &CancelToken) -> Result<()> {
    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(config, *json),
        Commands::DeviceAuth => commands::auth::cmd_device_auth(cli, config, cancel),
        Commands::CardAuth { retry } => commands::auth::cmd_card_auth(cli, config, cancel, *retry),
        Commands::Update {
            check,
            download_dir,
        } => commands::update::cmd_update(cli, config, cancel, *check, download_dir.as_deref()),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g. `hwauth completions bash`, or use --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get the wallet port from CLI args, config or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
