//! Firmware update orchestration.
//!
//! ```text
//! Idle -> FetchingLatestVersion -> Downloading -> AwaitingDeviceConfirmation
//!      -> Flashing -> Verifying -> Done
//! ```
//!
//! [`FirmwareUpdate`] is the session state; [`crate::engine::Engine`] feeds
//! it network and device results. Fetch and download failures leave the
//! stage in place so a retry can pick up from there. `Flashing` cannot be
//! cancelled.

pub mod server;
pub mod watchdog;

use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use semver::Version;

use crate::classify::{Classification, ErrorKind};
use crate::connection::{ConnectionContext, DeviceMode};
use crate::error::{Error, Result};
use crate::events::FlowEvent;
use crate::gate::{GateDenial, RetryGate};
use server::LatestFirmware;

/// Identical consecutive flash/verify failures before giving up.
pub const MAX_FAILURE_RECURRENCE: u32 = 5;

/// Stage of a firmware update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateStage {
    /// No update running.
    Idle,
    /// Asking the server for the latest version.
    FetchingLatestVersion,
    /// Downloading the image.
    Downloading,
    /// Waiting for the user to confirm on the device.
    AwaitingDeviceConfirmation,
    /// Writing the image. Not cancellable.
    Flashing,
    /// The device is checking the written image.
    Verifying,
    /// Finished, with or without an error.
    Done,
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::FetchingLatestVersion => "fetching latest version",
            Self::Downloading => "downloading",
            Self::AwaitingDeviceConfirmation => "awaiting device confirmation",
            Self::Flashing => "flashing",
            Self::Verifying => "verifying",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Whether `remote` should be offered to the device in `ctx`.
///
/// Bootloader and test-app devices have no meaningful version and always
/// qualify; otherwise the remote version must be strictly greater.
pub fn needs_update(remote: &Version, ctx: &ConnectionContext) -> bool {
    match (ctx.mode(), ctx.firmware_version()) {
        (DeviceMode::Bootloader | DeviceMode::TestApp, _) | (DeviceMode::Main, None) => true,
        (DeviceMode::Main, Some(current)) => remote > current,
    }
}

/// State of one firmware update session.
#[derive(Debug, Clone, Default)]
pub struct FirmwareUpdate {
    stage: Option<UpdateStage>,
    failure: Option<Classification>,
    latest: Option<LatestFirmware>,
    download_path: Option<PathBuf>,
    downloaded: u64,
    download_total: Option<u64>,
    slow_network: bool,
    last_flash_failure: Option<ErrorKind>,
    recurrences: u32,
}

impl FirmwareUpdate {
    /// An idle session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stage.
    pub fn stage(&self) -> UpdateStage {
        self.stage.unwrap_or(UpdateStage::Idle)
    }

    /// Failure attached to the current stage.
    pub fn failure(&self) -> Option<Classification> {
        self.failure
    }

    /// Error kind attached to the current stage.
    pub fn error(&self) -> Option<ErrorKind> {
        self.failure.map(|c| c.kind)
    }

    /// Latest firmware as fetched from the server.
    pub fn latest(&self) -> Option<&LatestFirmware> {
        self.latest.as_ref()
    }

    /// Local path of the downloaded image.
    pub fn download_path(&self) -> Option<&Path> {
        self.download_path.as_deref()
    }

    /// Download progress.
    pub fn download_progress(&self) -> (u64, Option<u64>) {
        (self.downloaded, self.download_total)
    }

    /// Whether the download is taking longer than the watchdog interval.
    pub fn slow_network(&self) -> bool {
        self.slow_network
    }

    /// Transition event for the current state.
    pub fn event(&self) -> FlowEvent {
        FlowEvent::Firmware {
            stage: self.stage(),
            error: self.error(),
        }
    }

    /// Begin a fresh session.
    ///
    /// Refused while the last failure is terminal. The flash failure history
    /// carries over, so restarting does not reset the recurrence count.
    pub fn start(&mut self) -> Result<()> {
        match self.stage() {
            UpdateStage::Idle | UpdateStage::Done => {
                if let Some(failure) = self.failure.filter(|f| f.terminal) {
                    return Err(Error::RetryRefused(GateDenial::Terminal(failure.kind)));
                }
                *self = Self {
                    last_flash_failure: self.last_flash_failure,
                    recurrences: self.recurrences,
                    ..Self::default()
                };
                self.enter(UpdateStage::FetchingLatestVersion);
                Ok(())
            },
            stage => Err(Error::Protocol(format!(
                "cannot start an update while {stage}"
            ))),
        }
    }

    /// The server answered with its latest firmware.
    ///
    /// Moves to `Downloading` when `update_needed`, else straight to `Done`.
    pub fn on_latest(&mut self, latest: LatestFirmware, update_needed: bool) -> Result<()> {
        self.expect(UpdateStage::FetchingLatestVersion)?;
        self.failure = None;
        if update_needed {
            info!("Firmware {} available", latest.version);
            self.latest = Some(latest);
            self.enter(UpdateStage::Downloading);
        } else {
            info!("Firmware is up to date (latest {})", latest.version);
            self.latest = Some(latest);
            self.enter(UpdateStage::Done);
        }
        Ok(())
    }

    /// Fetching the latest version failed; the stage is kept for a retry.
    pub fn on_fetch_failed(&mut self, failure: Classification) -> Result<()> {
        self.expect(UpdateStage::FetchingLatestVersion)?;
        warn!("Fetching latest firmware failed: {}", failure.kind);
        self.failure = Some(failure);
        Ok(())
    }

    /// Download progress update.
    pub fn on_download_progress(&mut self, current: u64, total: Option<u64>) {
        if self.stage() == UpdateStage::Downloading {
            self.downloaded = current;
            self.download_total = total;
        }
    }

    /// The slow-network watchdog fired. Returns whether the flag changed.
    pub fn on_watchdog_expired(&mut self) -> bool {
        if self.stage() != UpdateStage::Downloading || self.slow_network {
            return false;
        }
        warn!("Download is slow");
        self.slow_network = true;
        true
    }

    /// The download finished. Returns whether the slow flag was cleared.
    pub fn on_downloaded(&mut self, path: PathBuf) -> Result<bool> {
        self.expect(UpdateStage::Downloading)?;
        let cleared = std::mem::take(&mut self.slow_network);
        debug!("Firmware downloaded to {}", path.display());
        self.download_path = Some(path);
        self.failure = None;
        self.enter(UpdateStage::AwaitingDeviceConfirmation);
        Ok(cleared)
    }

    /// The download failed. Returns whether the slow flag was cleared.
    pub fn on_download_failed(&mut self, failure: Classification) -> Result<bool> {
        self.expect(UpdateStage::Downloading)?;
        warn!("Firmware download failed: {}", failure.kind);
        self.failure = Some(failure);
        Ok(std::mem::take(&mut self.slow_network))
    }

    /// The device answered the update request.
    ///
    /// A rejection ends the session in `Done` with `RequestRejectedByUser`.
    pub fn on_confirmation(&mut self, accepted: bool) -> Result<()> {
        self.expect(UpdateStage::AwaitingDeviceConfirmation)?;
        if accepted {
            self.failure = None;
            self.enter(UpdateStage::Flashing);
        } else {
            warn!("Update rejected on the device");
            self.failure = Some(Classification::of(ErrorKind::RequestRejectedByUser));
            self.enter(UpdateStage::Done);
        }
        Ok(())
    }

    /// The confirmation exchange failed for another reason; the stage is kept.
    pub fn on_confirmation_failed(&mut self, failure: Classification) -> Result<()> {
        self.expect(UpdateStage::AwaitingDeviceConfirmation)?;
        self.failure = Some(failure);
        Ok(())
    }

    /// All chunks written.
    pub fn on_flashed(&mut self) -> Result<()> {
        self.expect(UpdateStage::Flashing)?;
        self.enter(UpdateStage::Verifying);
        Ok(())
    }

    /// The device accepted the image.
    pub fn on_verified(&mut self) -> Result<()> {
        self.expect(UpdateStage::Verifying)?;
        self.failure = None;
        self.last_flash_failure = None;
        self.recurrences = 0;
        self.enter(UpdateStage::Done);
        Ok(())
    }

    /// Flashing or verification failed.
    ///
    /// The session ends in `Done` with the failure attached. The same kind
    /// failing [`MAX_FAILURE_RECURRENCE`] times in a row becomes terminal.
    pub fn on_flash_failed(&mut self, failure: Classification) -> Result<Classification> {
        match self.stage() {
            UpdateStage::Flashing | UpdateStage::Verifying => {},
            stage => {
                return Err(Error::Protocol(format!("flash failure while {stage}")));
            },
        }
        if self.last_flash_failure == Some(failure.kind) {
            self.recurrences += 1;
        } else {
            self.last_flash_failure = Some(failure.kind);
            self.recurrences = 1;
        }

        let recorded = if self.recurrences >= MAX_FAILURE_RECURRENCE {
            warn!(
                "{} failed {} times in a row, giving up",
                failure.kind, self.recurrences
            );
            Classification::exhausted()
        } else {
            warn!(
                "Update failed while {} ({}/{MAX_FAILURE_RECURRENCE}): {}",
                self.stage(),
                self.recurrences,
                failure.kind
            );
            failure
        };
        self.failure = Some(recorded);
        self.enter(UpdateStage::Done);
        Ok(recorded)
    }

    /// Abandon the update.
    ///
    /// A no-op while flashing or when nothing is running; otherwise the
    /// session returns to a clean `Idle`. Returns whether anything changed.
    pub fn cancel(&mut self) -> bool {
        match self.stage() {
            UpdateStage::Flashing => {
                warn!("Cancel ignored: flashing cannot be interrupted");
                false
            },
            UpdateStage::Idle | UpdateStage::Done => false,
            stage => {
                debug!("Update cancelled while {stage}");
                self.failure = None;
                self.slow_network = false;
                self.enter(UpdateStage::Idle);
                true
            },
        }
    }

    /// Whether a cancel request would take effect now.
    pub fn cancellable(&self) -> std::result::Result<(), GateDenial> {
        match self.stage() {
            UpdateStage::Flashing => Err(GateDenial::NonCancellable),
            _ => Ok(()),
        }
    }

    /// Re-enter `FetchingLatestVersion` after a failure.
    ///
    /// Download and flash state are left alone.
    pub fn retry(&mut self, gate: &RetryGate, ctx: &ConnectionContext) -> Result<()> {
        let Some(failure) = self.failure else {
            return Err(Error::RetryRefused(GateDenial::NothingToRetry));
        };
        gate.authorize(ctx, failure).map_err(Error::RetryRefused)?;
        self.failure = None;
        self.enter(UpdateStage::FetchingLatestVersion);
        Ok(())
    }

    fn enter(&mut self, stage: UpdateStage) {
        if self.stage() != stage {
            debug!("Update: {} -> {stage}", self.stage());
        }
        self.stage = Some(stage);
    }

    fn expect(&self, stage: UpdateStage) -> Result<()> {
        if self.stage() == stage {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "expected update stage {stage}, in {}",
                self.stage()
            )))
        }
    }
}
