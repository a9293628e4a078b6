//! Interactive wallet port selection.
//!
//! Supports:
//! - Auto-detection of wallet endpoints by USB VID/PID
//! - Interactive selection via dialoguer
//! - Remembering selected ports in configuration
//! - Non-interactive mode for scripts

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    hwauth::{DetectedPort, EndpointKind, detect_ports, select_port},
    log::{debug, error, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail instead of prompting).
    pub non_interactive: bool,
}

/// Selected port and whether it was recognized without asking.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port is a built-in or remembered wallet endpoint.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn not_found_err() -> anyhow::Error {
    CliError::DeviceNotFound("no wallet found; connect it over USB or pass --port".to_string())
        .into()
}

fn select_non_interactive_port(candidates: Vec<DetectedPort>) -> Result<SelectedPort> {
    match candidates.len().cmp(&1) {
        Ordering::Equal => {
            let port = select_port(&candidates).map_err(|_| not_found_err())?;
            Ok(SelectedPort {
                is_known: port.kind.is_wallet(),
                port,
            })
        },
        Ordering::Greater => Err(usage_err(
            "multiple wallets found; pass --port to choose one in non-interactive mode",
        )),
        Ordering::Less => Err(not_found_err()),
    }
}

/// Select a wallet port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    let registered = config.registered_pairs();

    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, &registered));
    }

    if let Some(port_name) = &config.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, &registered));
    }

    let ports = detect_ports(&registered);
    if ports.is_empty() {
        return Err(not_found_err());
    }

    let wallets: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| p.kind.is_wallet())
        .cloned()
        .collect();

    if options.non_interactive {
        return select_non_interactive_port(wallets);
    }

    if wallets.len() == 1 {
        let port = select_port(&wallets).map_err(|_| not_found_err())?;
        info!("Auto-selected port: {} [{}]", port.name, port.kind.name());
        return Ok(SelectedPort {
            port,
            is_known: true,
        });
    }

    // Nothing recognized: let the user pick among everything.
    let candidates = if wallets.is_empty() { ports } else { wallets };
    ensure_interactive_terminal()?;
    if candidates.len() == 1 {
        let port = candidates.into_iter().next().ok_or_else(not_found_err)?;
        confirm_single_port(port)
    } else {
        select_port_interactive(candidates)
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs an interactive terminal; pass --port instead",
        ))
    }
}

pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("selection cancelled".to_string()).into()
            } else {
                usage_err(&format!("prompt failed: {io_err}"))
            }
        },
    }
}

/// Find a port by name, falling back to a placeholder for unlisted names.
fn find_port_by_name(name: &str, registered: &[(u16, u16)]) -> SelectedPort {
    let ports = detect_ports(registered);

    if let Some(port) = ports
        .iter()
        .find(|p| p.name == name || p.name.eq_ignore_ascii_case(name))
    {
        return SelectedPort {
            port: port.clone(),
            is_known: port.kind.is_wallet(),
        };
    }

    // The user asked for it explicitly, so trust the name.
    SelectedPort {
        port: DetectedPort {
            name: name.to_string(),
            kind: EndpointKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        },
        is_known: true,
    }
}

fn port_label(port: &DetectedPort) -> String {
    let name = if port.kind.is_wallet() {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };
    let kind = if port.kind.is_wallet() {
        format!(" [{}]", style(port.kind.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{name}{kind}{product}")
}

fn select_port_interactive(mut ports: Vec<DetectedPort>) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    ports.sort_by_key(|p| !p.kind.is_wallet());

    // Keep labels on one line in narrow terminals.
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| console::truncate_str(&port_label(port), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the wallet port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = port.kind.is_wallet();
            Ok(SelectedPort { port, is_known })
        },
        None => Err(CliError::Cancelled("selection cancelled".to_string()).into()),
    }
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}?", port_label(&port)))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(CliError::Cancelled("selection cancelled".to_string()).into())
    }
}

/// Ask the user whether to remember an unrecognized port.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.registered_pairs().contains(&(vid, pid)) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this device for auto-detection?")
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }
    Ok(())
}
