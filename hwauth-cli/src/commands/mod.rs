//! Command implementations.
//!
//! Each subcommand lives in its own module; opening the wallet, building the
//! engine and rendering flow events are shared here.

pub(crate) mod auth;
pub(crate) mod completions;
pub(crate) mod ports;
pub(crate) mod update;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use hwauth::connection::serial::{DEFAULT_BAUD, SerialSettings};
use hwauth::{
    CancelToken, ConnectionContext, Engine, ErrorKind, EventSink, FlowEvent, HandshakeStage, HttpServer,
    SerialConnection, SequenceVerdict, UpdateStage,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::config::Config;
use crate::serial::map_prompt_error;
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

/// Open the wallet link and query its mode and versions.
pub(crate) fn open_device(cli: &Cli, config: &mut Config) -> Result<ConnectionContext> {
    let port = get_port(cli, config)?;
    let baud = cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);

    let mut settings = SerialSettings::new(&port, baud);
    if let Some(timeout) = config.reply_timeout() {
        settings = settings.with_reply_timeout(timeout);
    }
    if let Some(timeout) = config.confirm_timeout() {
        settings = settings.with_confirm_timeout(timeout);
    }

    if !cli.quiet {
        eprintln!("{} Connecting to {}", style("🔌").cyan(), style(&port).cyan());
    }
    let link = SerialConnection::open(settings).with_context(|| format!("Failed to open {port}"))?;
    let ctx = ConnectionContext::establish(Arc::new(link))?;

    if !cli.quiet {
        let firmware = ctx
            .firmware_version()
            .map_or_else(|| "none".to_string(), ToString::to_string);
        eprintln!(
            "{} Connected: {} mode, firmware {}, SDK {}",
            style("✓").green(),
            ctx.mode(),
            firmware,
            ctx.sdk_version()
        );
    }
    Ok(ctx)
}

/// Engine talking to the configured server, cancelled by `cancel`.
pub(crate) fn engine(
    cli: &Cli,
    config: &Config,
    cancel: &CancelToken,
) -> Result<Engine<HttpServer>> {
    let url = cli
        .server
        .clone()
        .or_else(|| config.server.url.clone())
        .ok_or_else(|| {
            CliError::Config(
                "no server URL; pass --server, set HWAUTH_SERVER or [server] url".to_string(),
            )
        })?;
    let timeout = config
        .server_timeout()
        .unwrap_or(hwauth::http::DEFAULT_TIMEOUT);
    debug!("Using server {url}");

    let server = HttpServer::new(url, timeout)?;
    Ok(Engine::new(server).with_cancel_token(cancel.clone()))
}

/// Ask whether to retry; never prompts when prompting is impossible.
pub(crate) fn ask_retry(cli: &Cli, prompt: &str) -> Result<bool> {
    if cli.non_interactive
        || was_interrupted()
        || !std::io::stdin().is_terminal()
        || !std::io::stderr().is_terminal()
    {
        return Ok(false);
    }
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false))
}

/// Advice for failures the user can fix without support.
pub(crate) fn hint(kind: ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::DeviceInBootloader => {
            Some("The wallet is in its bootloader; run `hwauth update` first")
        },
        ErrorKind::DeviceInTestApp => {
            Some("The wallet runs its test firmware; run `hwauth update` first")
        },
        ErrorKind::DeviceNotReady => Some("Unlock the wallet and try again"),
        ErrorKind::NetworkUnreachable => Some("Check your internet connection"),
        _ => None,
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Renders flow events on stderr.
pub(crate) struct Reporter {
    quiet: bool,
    bar: Option<(UpdateStage, ProgressBar)>,
}

impl Reporter {
    pub(crate) fn new(quiet: bool) -> Self {
        Self { quiet, bar: None }
    }

    fn line(&self, message: String) {
        if self.quiet {
            return;
        }
        match &self.bar {
            Some((_, bar)) if !bar.is_hidden() => bar.println(message),
            _ => eprintln!("{message}"),
        }
    }

    fn finish_bar(&mut self) {
        if let Some((_, bar)) = self.bar.take() {
            bar.finish();
        }
    }

    fn progress(&mut self, stage: UpdateStage, current: u64, total: Option<u64>) {
        if self.bar.as_ref().is_some_and(|(s, _)| *s != stage) {
            self.finish_bar();
        }
        let (_, bar) = self.bar.get_or_insert_with(|| {
            let bar = if self.quiet || !use_fancy_output() {
                ProgressBar::hidden()
            } else {
                let bar = ProgressBar::new(total.unwrap_or(0));
                bar.set_style(progress_style());
                bar.set_message(stage.to_string());
                bar
            };
            (stage, bar)
        });
        if let Some(total) = total {
            bar.set_length(total);
        }
        bar.set_position(current);
    }

    fn handshake(&self, who: &str, stage: HandshakeStage, error: Option<ErrorKind>) {
        match (stage, error) {
            (HandshakeStage::RequestSent, _) => self.line(format!(
                "{} {who}: confirm the request on the device",
                style("⏳").yellow()
            )),
            (HandshakeStage::Verified, _) => {
                self.line(format!("{} {who}: verified", style("✓").green()));
            },
            (stage, Some(kind)) if stage.is_failure() => {
                self.line(format!("{} {who}: {stage} ({kind})", style("✗").red()));
            },
            (stage, _) => self.line(format!("  {} {who}: {stage}", style("•").dim())),
        }
    }
}

impl EventSink for Reporter {
    fn emit(&mut self, event: FlowEvent) {
        debug!("{event:?}");
        match event {
            FlowEvent::Entered(_) | FlowEvent::Exited { .. } => {},
            FlowEvent::Device { stage, error } => self.handshake("Device", stage, error),
            FlowEvent::Card { slot, stage, error } => {
                self.handshake(&format!("Card {slot}"), stage, error);
            },
            FlowEvent::Sequence(verdict) => {
                let mark = match verdict {
                    SequenceVerdict::AllVerified => style("✓").green(),
                    SequenceVerdict::Incomplete => style("•").yellow(),
                    SequenceVerdict::PartialFailure | SequenceVerdict::AllFailed => {
                        style("✗").red()
                    },
                };
                self.line(format!("{mark} Cards: {verdict}"));
            },
            FlowEvent::Firmware { stage, error } => {
                self.finish_bar();
                match (stage, error) {
                    (_, Some(kind)) => {
                        self.line(format!("{} Firmware: {stage} ({kind})", style("✗").red()));
                    },
                    (UpdateStage::AwaitingDeviceConfirmation, None) => self.line(format!(
                        "{} Confirm the firmware update on the device",
                        style("⏳").yellow()
                    )),
                    (UpdateStage::Idle, None) => {
                        self.line(format!("{} Firmware update cancelled", style("•").yellow()));
                    },
                    (stage, None) => {
                        self.line(format!("  {} Firmware: {stage}", style("•").dim()));
                    },
                }
            },
            FlowEvent::SlowNetwork(true) => self.line(format!(
                "{} The network is slow, still downloading...",
                style("⚠").yellow()
            )),
            FlowEvent::SlowNetwork(false) => {},
            FlowEvent::Progress {
                stage,
                current,
                total,
            } => self.progress(stage, current, total),
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        self.finish_bar();
    }
}
