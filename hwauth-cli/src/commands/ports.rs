//! `list-ports` command.

use anyhow::Result;
use console::style;
use hwauth::{DetectedPort, detect_ports, select_port};

use crate::config::Config;

/// List serial ports, marking wallet endpoints.
///
/// With `json`, the list goes to stdout and nothing is written to stderr.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) -> Result<()> {
    let detected = detect_ports(&config.registered_pairs());

    if json {
        println!("{}", ports_json(&detected)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let kind = if port.kind.is_wallet() {
            format!(" [{}]", style(port.kind.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{kind}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }

    if let Ok(best) = select_port(&detected) {
        eprintln!(
            "\n{} Auto-detected wallet: {}",
            style("→").green().bold(),
            style(&best.name).cyan().bold()
        );
    }
    Ok(())
}

fn ports_json(ports: &[DetectedPort]) -> Result<String> {
    let entries: Vec<serde_json::Value> = ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "kind": p.kind,
                "wallet": p.kind.is_wallet(),
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial,
            })
        })
        .collect();
    Ok(serde_json::to_string_pretty(&entries)?)
}
