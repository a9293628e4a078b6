//! `update` command.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use hwauth::engine::DEFAULT_CHUNK_SIZE;
use hwauth::{
    CancelToken, ConnectionContext, FirmwareServer, FirmwareUpdate, LatestFirmware, UpdateOptions,
    UpdateOutcome, needs_update,
};
use log::warn;

use super::{Reporter, ask_retry, engine, hint, open_device};
use crate::config::Config;
use crate::{Cli, CliError};

/// Check for the latest firmware and install it when the device needs it.
///
/// With `check` only the comparison is printed (to stdout).
pub(crate) fn cmd_update(
    cli: &Cli,
    config: &mut Config,
    cancel: &CancelToken,
    check: bool,
    download_dir: Option<&Path>,
) -> Result<()> {
    let engine = engine(cli, config, cancel)?;
    let options = update_options(config, download_dir);
    if !check {
        options
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))?;
    }
    let ctx = open_device(cli, config)?;

    if check {
        let latest = engine
            .server()
            .latest_firmware()
            .context("Failed to fetch the latest firmware version")?;
        println!("{}", check_summary(&ctx, &latest));
        return Ok(());
    }

    fs::create_dir_all(&options.download_dir).with_context(|| {
        format!(
            "Failed to create download directory {}",
            options.download_dir.display()
        )
    })?;

    let mut reporter = Reporter::new(cli.quiet);
    let mut update = FirmwareUpdate::new();
    let mut result = engine.update_firmware(&ctx, &mut update, &options, &mut reporter);
    let outcome = loop {
        let err = match result {
            Ok(outcome) => break outcome,
            Err(err) => err,
        };
        if matches!(err, hwauth::Error::Cancelled | hwauth::Error::Config(_)) {
            return Err(err.into());
        }
        let failure = update.failure().unwrap_or_else(|| err.classify());
        if let Some(hint) = hint(failure.kind) {
            warn!("{hint}");
        }
        if failure.terminal {
            return Err(CliError::Terminal(format!("firmware update keeps failing: {err}")).into());
        }
        if !failure.retryable
            || !ask_retry(cli, &format!("Firmware update failed ({}). Retry?", failure.kind))?
        {
            return Err(err.into());
        }
        result = engine.retry_update(&ctx, &mut update, &options, &mut reporter);
    };
    drop(reporter);

    match &outcome {
        UpdateOutcome::UpToDate(version) => {
            if !cli.quiet {
                eprintln!(
                    "{} Firmware {} is up to date",
                    style("✓").green(),
                    style(version).cyan()
                );
            }
            println!("{version}");
        },
        UpdateOutcome::Installed(version) => {
            if !cli.quiet {
                eprintln!(
                    "\n{} Installed firmware {}",
                    style("🎉").green().bold(),
                    style(version).cyan().bold()
                );
            }
            println!("{version}");
        },
    }
    Ok(())
}

/// Options from the command line, then the config, then defaults.
fn update_options(config: &Config, download_dir: Option<&Path>) -> UpdateOptions {
    UpdateOptions {
        download_dir: download_dir
            .map(Path::to_path_buf)
            .or_else(|| config.update.download_dir.clone())
            .unwrap_or_else(|| env::temp_dir().join("hwauth")),
        chunk_size: config.update.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
        ..UpdateOptions::default()
    }
}

fn check_summary(ctx: &ConnectionContext, latest: &LatestFirmware) -> String {
    let latest = &latest.version;
    let current = ctx
        .firmware_version()
        .map_or_else(|| "none".to_string(), ToString::to_string);
    if needs_update(latest, ctx) {
        format!("update available: {current} -> {latest}")
    } else {
        format!("up to date: {current} (latest {latest})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_cli_download_dir_wins() {
        let mut config = Config::default();
        config.update.download_dir = Some(PathBuf::from("/from/config"));
        let options = update_options(&config, Some(Path::new("/from/cli")));
        assert_eq!(options.download_dir, PathBuf::from("/from/cli"));
    }

    #[test]
    fn test_config_fills_unset_options() {
        let mut config = Config::default();
        config.update.download_dir = Some(PathBuf::from("/from/config"));
        config.update.chunk_size = Some(256);
        let options = update_options(&config, None);
        assert_eq!(options.download_dir, PathBuf::from("/from/config"));
        assert_eq!(options.chunk_size, 256);
    }

    #[test]
    fn test_defaults_without_config() {
        let options = update_options(&Config::default(), None);
        assert_eq!(options.download_dir, env::temp_dir().join("hwauth"));
        assert_eq!(options.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
