//! Blocking driver for the authentication and update flows.
//!
//! The state machines never touch the link or the network themselves. The
//! [`Engine`] performs each step they ask for, feeds the result back, emits
//! a [`FlowEvent`] for every transition, and checks its [`CancelToken`]
//! between steps. Only one flow runs per [`ConnectionContext`] at a time.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use semver::Version;
use sha2::{Digest, Sha256};

use crate::auth::card::CardSlot;
use crate::auth::device::DeviceAuth;
use crate::auth::sequence::{CardOutcome, CardSequence, SequenceVerdict};
use crate::auth::server::AuthServer;
use crate::auth::{HandshakeMachine, Step};
use crate::cancel::CancelToken;
use crate::classify::{Classification, FailureSignal};
use crate::connection::ConnectionContext;
use crate::error::{Error, Result};
use crate::events::{EventSink, Flow, FlowEvent};
use crate::firmware::server::FirmwareServer;
use crate::firmware::watchdog::{SLOW_NETWORK_AFTER, Watchdog};
use crate::firmware::{FirmwareUpdate, UpdateStage, needs_update};
use crate::gate::RetryGate;
use crate::protocol::{MAX_FIRMWARE_CHUNK, Request, Response};

/// Default size of one firmware chunk on the wire.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// A device that passed authentication.
///
/// Handed to whatever needs proof of a genuine device, such as a wallet
/// bridge.
#[derive(Debug, Clone)]
pub struct VerifiedDevice {
    /// Serial reported and signed by the device.
    pub serial: Vec<u8>,
    /// The connection the device was verified on.
    pub context: ConnectionContext,
}

/// Tunables for a firmware update.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Where the image is downloaded to.
    pub download_dir: PathBuf,
    /// Bytes per `FirmwareChunk`.
    pub chunk_size: usize,
    /// How long a download may take before the network counts as slow.
    pub slow_network_after: Duration,
}

impl UpdateOptions {
    /// Reject options the device protocol cannot carry.
    ///
    /// Checked before any traffic so a bad chunk size never leaves the
    /// device waiting in flash mode.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_FIRMWARE_CHUNK {
            return Err(Error::Config(format!(
                "chunk size {} is outside 1..={MAX_FIRMWARE_CHUNK}",
                self.chunk_size
            )));
        }
        Ok(())
    }
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            download_dir: std::env::temp_dir(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            slow_network_after: SLOW_NETWORK_AFTER,
        }
    }
}

/// How a firmware update ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The device already runs this version or newer.
    UpToDate(Version),
    /// This version was installed.
    Installed(Version),
}

/// Drives flows against a device link and a server.
#[derive(Debug)]
pub struct Engine<S> {
    server: S,
    gate: RetryGate,
    cancel: CancelToken,
}

impl<S> Engine<S> {
    /// Engine talking to `server` with a fresh gate and token.
    pub fn new(server: S) -> Self {
        Self {
            server,
            gate: RetryGate::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Share `gate` with whoever reports connectivity.
    #[must_use]
    pub fn with_gate(mut self, gate: RetryGate) -> Self {
        self.gate = gate;
        self
    }

    /// Share `token` with whoever requests cancellation.
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// The retry gate.
    pub fn gate(&self) -> &RetryGate {
        &self.gate
    }

    /// The cancellation token.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The server.
    pub fn server(&self) -> &S {
        &self.server
    }

    fn in_flow<T>(
        &self,
        ctx: &ConnectionContext,
        flow: Flow,
        sink: &mut dyn EventSink,
        f: impl FnOnce(&mut dyn EventSink) -> Result<T>,
    ) -> Result<T> {
        let _guard = ctx.acquire(flow)?;
        debug!("Starting {flow}");
        sink.emit(FlowEvent::Entered(flow));

        let result = f(&mut *sink);
        let error = match &result {
            Ok(_) | Err(Error::Cancelled) => None,
            Err(e) => Some(e.classify().kind),
        };
        if self.cancel.take() {
            debug!("Cancel arrived after {flow} could be interrupted");
        }
        debug!("Finished {flow}");
        sink.emit(FlowEvent::Exited { flow, error });
        result
    }

    fn cancel_on_device(ctx: &ConnectionContext) {
        if !ctx.is_open() {
            return;
        }
        match ctx.connection().cancel() {
            Ok(true) => debug!("Device acknowledged cancel"),
            Ok(false) => debug!("Device did not acknowledge cancel"),
            Err(e) => warn!("Failed to cancel on the device: {e}"),
        }
    }
}

fn emit_if_changed(last: &mut FlowEvent, now: FlowEvent, sink: &mut dyn EventSink) {
    if *last != now {
        *last = now.clone();
        sink.emit(now);
    }
}

fn expect_ack(response: Response) -> Result<()> {
    match response {
        Response::Ack => Ok(()),
        other => Err(match other.failure_signal() {
            Some(signal) => Error::Device(signal),
            None => Error::Protocol(format!("expected Ack, got {}", other.name())),
        }),
    }
}

impl<S: AuthServer> Engine<S> {
    fn drive<M: HandshakeMachine>(
        &self,
        ctx: &ConnectionContext,
        machine: &mut M,
        first: Step,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        let mut last = machine.event();
        sink.emit(last.clone());

        let mut step = first;
        loop {
            // A request the machine cannot act on stays pending for the caller.
            if self.cancel.is_cancelled() && machine.can_cancel() {
                self.cancel.take();
                machine.cancel();
                sink.emit(machine.event());
                Self::cancel_on_device(ctx);
                info!("{} cancelled", machine.target());
                return Err(Error::Cancelled);
            }

            let target = machine.target();
            let next = match step {
                Step::Complete => return Ok(()),
                Step::Send(request) => ctx.send(&request).and_then(|r| machine.on_response(r)),
                Step::VerifySerial { serial, signature } => self
                    .server
                    .verify_serial(target, &serial, &signature)
                    .and_then(|verdict| {
                        self.gate.observe_server_success();
                        machine.on_serial_verdict(verdict)
                    }),
                Step::VerifyChallenge {
                    serial,
                    challenge,
                    signature,
                } => self
                    .server
                    .verify_challenge(target, &serial, &challenge, &signature)
                    .and_then(|valid| {
                        self.gate.observe_server_success();
                        machine.on_challenge_verdict(valid)
                    }),
            };

            match next {
                Ok(s) => step = s,
                Err(e) => {
                    let kind = machine.on_failure(&e);
                    warn!("{target}: {e} ({kind})");
                    emit_if_changed(&mut last, machine.event(), sink);
                    return Err(e);
                },
            }
            emit_if_changed(&mut last, machine.event(), sink);
        }
    }

    /// Authenticate the device on `ctx`.
    ///
    /// A device running its factory test application fails with
    /// [`FailureSignal::TestApp`] before anything is sent.
    pub fn authenticate_device(
        &self,
        ctx: &ConnectionContext,
        sink: &mut dyn EventSink,
    ) -> Result<VerifiedDevice> {
        self.in_flow(ctx, Flow::DeviceAuth, sink, |sink| {
            let mut auth = DeviceAuth::new();
            let first = match auth.start(ctx) {
                Ok(step) => step,
                Err(e) => {
                    auth.on_failure(&e);
                    sink.emit(auth.event());
                    return Err(e);
                },
            };
            if auth.notice().is_some() {
                sink.emit(auth.event());
                return Err(Error::Device(FailureSignal::TestApp));
            }

            self.drive(ctx, &mut auth, first, sink)?;
            match auth.verified_serial() {
                Some(serial) => Ok(VerifiedDevice {
                    serial: serial.to_vec(),
                    context: ctx.clone(),
                }),
                None => Err(Error::VerificationFailed(format!(
                    "device ended in stage {}",
                    auth.stage()
                ))),
            }
        })
    }

    /// Run device authentication again after `failure`, if the gate allows.
    pub fn retry_device_auth(
        &self,
        ctx: &ConnectionContext,
        failure: Classification,
        sink: &mut dyn EventSink,
    ) -> Result<VerifiedDevice> {
        self.gate
            .authorize(ctx, failure)
            .map_err(Error::RetryRefused)?;
        self.authenticate_device(ctx, sink)
    }

    /// Authenticate the next pending card of `seq`.
    ///
    /// A card that fails is recorded and reported as its outcome; only a
    /// lost link or a cancel surface as errors. Returns `None` once no card
    /// is pending.
    pub fn authenticate_next_card(
        &self,
        ctx: &ConnectionContext,
        seq: &mut CardSequence,
        sink: &mut dyn EventSink,
    ) -> Result<Option<(CardSlot, CardOutcome)>> {
        self.in_flow(ctx, Flow::CardAuth, sink, |sink| self.advance(ctx, seq, sink))
    }

    /// Authenticate every pending card of `seq` in slot order.
    pub fn authenticate_cards(
        &self,
        ctx: &ConnectionContext,
        seq: &mut CardSequence,
        sink: &mut dyn EventSink,
    ) -> Result<SequenceVerdict> {
        self.in_flow(ctx, Flow::CardAuth, sink, |sink| {
            loop {
                if let Some(slot) = seq.next_slot() {
                    if self.cancel.take() {
                        info!("Card sequence cancelled before card {slot}");
                        return Err(Error::Cancelled);
                    }
                }
                if self.advance(ctx, seq, sink)?.is_none() {
                    break;
                }
            }
            let verdict = seq.verdict();
            info!("Card sequence: {verdict}");
            sink.emit(FlowEvent::Sequence(verdict));
            Ok(verdict)
        })
    }

    /// Reset a failed card and continue the sequence from it.
    pub fn retry_card(
        &self,
        ctx: &ConnectionContext,
        seq: &mut CardSequence,
        slot: CardSlot,
        sink: &mut dyn EventSink,
    ) -> Result<SequenceVerdict> {
        seq.retry(slot, &self.gate, ctx)?;
        self.authenticate_cards(ctx, seq, sink)
    }

    /// Continue a sequence frozen by a dropped link.
    pub fn resume_cards(
        &self,
        ctx: &ConnectionContext,
        seq: &mut CardSequence,
        sink: &mut dyn EventSink,
    ) -> Result<SequenceVerdict> {
        seq.resume(ctx)?;
        self.authenticate_cards(ctx, seq, sink)
    }

    fn advance(
        &self,
        ctx: &ConnectionContext,
        seq: &mut CardSequence,
        sink: &mut dyn EventSink,
    ) -> Result<Option<(CardSlot, CardOutcome)>> {
        let Some(mut auth) = seq.begin_next(ctx)? else {
            return Ok(None);
        };
        let slot = auth.slot();
        info!("Card {slot}: tap the card on the device");

        let result = match auth.start() {
            Ok(first) => self.drive(ctx, &mut auth, first, sink),
            Err(e) => Err(e),
        };
        let outcome = seq.finish(&auth);
        match result {
            Ok(()) => Ok(Some((slot, outcome))),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) if seq.is_frozen() => Err(e),
            Err(e) => {
                debug!("Card {slot} recorded as {outcome}: {e}");
                Ok(Some((slot, outcome)))
            },
        }
    }
}

impl<S: FirmwareServer + Sync> Engine<S> {
    /// Check for, download and install the latest firmware.
    ///
    /// `update` must be idle or done. On failure it keeps the stage the
    /// failure happened in; see [`Engine::retry_update`].
    pub fn update_firmware(
        &self,
        ctx: &ConnectionContext,
        update: &mut FirmwareUpdate,
        options: &UpdateOptions,
        sink: &mut dyn EventSink,
    ) -> Result<UpdateOutcome> {
        options.validate()?;
        self.in_flow(ctx, Flow::FirmwareUpdate, sink, |sink| {
            update.start()?;
            sink.emit(update.event());
            self.run_update(ctx, update, options, sink)
        })
    }

    /// Restart a failed update from the version check, if the gate allows.
    pub fn retry_update(
        &self,
        ctx: &ConnectionContext,
        update: &mut FirmwareUpdate,
        options: &UpdateOptions,
        sink: &mut dyn EventSink,
    ) -> Result<UpdateOutcome> {
        options.validate()?;
        self.in_flow(ctx, Flow::FirmwareUpdate, sink, |sink| {
            update.retry(&self.gate, ctx)?;
            sink.emit(update.event());
            self.run_update(ctx, update, options, sink)
        })
    }

    fn checkpoint(
        &self,
        ctx: &ConnectionContext,
        update: &mut FirmwareUpdate,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        if !self.cancel.take() {
            return Ok(());
        }
        let stage = update.stage();
        let was_slow = update.slow_network();
        if !update.cancel() {
            return Ok(());
        }
        if stage == UpdateStage::AwaitingDeviceConfirmation {
            Self::cancel_on_device(ctx);
        }
        if was_slow {
            sink.emit(FlowEvent::SlowNetwork(false));
        }
        sink.emit(update.event());
        info!("Update cancelled while {stage}");
        Err(Error::Cancelled)
    }

    fn run_update(
        &self,
        ctx: &ConnectionContext,
        update: &mut FirmwareUpdate,
        options: &UpdateOptions,
        sink: &mut dyn EventSink,
    ) -> Result<UpdateOutcome> {
        self.checkpoint(ctx, update, sink)?;
        let fetched = self
            .gate
            .network_ready()
            .map_err(Error::RetryRefused)
            .and_then(|()| self.server.latest_firmware());
        let latest = match fetched {
            Ok(latest) => {
                self.gate.observe_server_success();
                latest
            },
            Err(e) => {
                update.on_fetch_failed(e.classify())?;
                sink.emit(update.event());
                return Err(e);
            },
        };

        let version = latest.version.clone();
        let needed = needs_update(&version, ctx);
        update.on_latest(latest.clone(), needed)?;
        sink.emit(update.event());
        if !needed {
            return Ok(UpdateOutcome::UpToDate(version));
        }

        self.checkpoint(ctx, update, sink)?;
        let dest = ScratchFile(
            options
                .download_dir
                .join(format!("firmware-{version}.bin")),
        );
        let image = self
            .download(update, &latest.download_url, &dest.0, options, sink)
            .and_then(|_| read_verified(&dest.0, latest.sha256.as_deref()));
        let image = match image {
            Ok(image) => image,
            Err(Error::Cancelled) => {
                self.checkpoint(ctx, update, sink)?;
                return Err(Error::Cancelled);
            },
            Err(e) => {
                if update.on_download_failed(e.classify())? {
                    sink.emit(FlowEvent::SlowNetwork(false));
                }
                sink.emit(update.event());
                return Err(e);
            },
        };
        self.gate.observe_server_success();
        if update.on_downloaded(dest.0.clone())? {
            sink.emit(FlowEvent::SlowNetwork(false));
        }
        sink.emit(update.event());

        self.checkpoint(ctx, update, sink)?;
        let size = u32::try_from(image.bytes.len())
            .map_err(|_| Error::Protocol("firmware image larger than 4 GiB".to_string()))?;
        info!("Confirm the update to {version} on the device");
        let request = Request::FirmwareUpdateStart {
            version: version.to_string(),
            size,
        };
        match ctx.send(&request) {
            Ok(Response::Accepted) => update.on_confirmation(true)?,
            Ok(Response::Rejected) => {
                update.on_confirmation(false)?;
                sink.emit(update.event());
                return Err(Error::Device(FailureSignal::UserRejected));
            },
            other => {
                let e = match other {
                    Ok(response) => expect_ack(response)
                        .err()
                        .unwrap_or_else(|| Error::Protocol("unexpected Ack".to_string())),
                    Err(e) => e,
                };
                update.on_confirmation_failed(e.classify())?;
                sink.emit(update.event());
                return Err(e);
            },
        }
        sink.emit(update.event());

        let chunk_size = options.chunk_size;
        let total = image.bytes.len() as u64;
        let mut offset = 0u32;
        for chunk in image.bytes.chunks(chunk_size) {
            // Flashing is not interruptible; this only logs and clears a request.
            self.checkpoint(ctx, update, sink)?;
            let request = Request::FirmwareChunk {
                offset,
                data: chunk.to_vec(),
            };
            if let Err(e) = ctx.send(&request).and_then(expect_ack) {
                return Err(Self::flash_failed(update, e, sink));
            }
            // chunk.len() <= size, which fits in u32
            offset = offset.saturating_add(u32::try_from(chunk.len()).unwrap_or(u32::MAX));
            sink.emit(FlowEvent::Progress {
                stage: UpdateStage::Flashing,
                current: u64::from(offset),
                total: Some(total),
            });
        }
        update.on_flashed()?;
        sink.emit(update.event());

        let finish = Request::FirmwareFinish {
            sha256: image.sha256,
        };
        if let Err(e) = ctx.send(&finish).and_then(expect_ack) {
            return Err(Self::flash_failed(update, e, sink));
        }
        update.on_verified()?;
        sink.emit(update.event());
        info!("Firmware {version} installed");
        Ok(UpdateOutcome::Installed(version))
    }

    /// Download `url` to `dest` on a worker thread.
    ///
    /// This thread relays progress and the watchdog's expiry to `sink` as
    /// they happen, so a stalled transfer still reports a slow network.
    fn download(
        &self,
        update: &mut FirmwareUpdate,
        url: &str,
        dest: &Path,
        options: &UpdateOptions,
        sink: &mut dyn EventSink,
    ) -> Result<u64> {
        let (tx, rx) = mpsc::channel();
        let expiry = tx.clone();
        let watchdog = Watchdog::start(options.slow_network_after, move || {
            let _ = expiry.send(Transfer::Slow);
        });

        let result = thread::scope(|scope| {
            let cancel = &self.cancel;
            let server = &self.server;
            scope.spawn(move || {
                let mut progress = |current: u64, total: Option<u64>| {
                    let _ = tx.send(Transfer::Progress(current, total));
                    !cancel.is_cancelled()
                };
                let result = server.download(url, dest, &mut progress);
                let _ = tx.send(Transfer::Finished(result));
            });

            loop {
                match rx.recv() {
                    Ok(Transfer::Progress(current, total)) => {
                        update.on_download_progress(current, total);
                        sink.emit(FlowEvent::Progress {
                            stage: UpdateStage::Downloading,
                            current,
                            total,
                        });
                    },
                    Ok(Transfer::Slow) => {
                        if update.on_watchdog_expired() {
                            sink.emit(FlowEvent::SlowNetwork(true));
                        }
                    },
                    Ok(Transfer::Finished(result)) => break result,
                    Err(_) => {
                        break Err(Error::Protocol(
                            "download worker stopped without a result".to_string(),
                        ));
                    },
                }
            }
        });
        watchdog.stop();
        result
    }

    fn flash_failed(
        update: &mut FirmwareUpdate,
        error: Error,
        sink: &mut dyn EventSink,
    ) -> Error {
        match update.on_flash_failed(error.classify()) {
            Ok(recorded) if recorded.terminal => {
                warn!("Update failures keep recurring, contact support");
            },
            Ok(_) => {},
            Err(e) => warn!("{e}"),
        }
        sink.emit(update.event());
        error
    }
}

enum Transfer {
    Progress(u64, Option<u64>),
    Slow,
    Finished(Result<u64>),
}

/// Downloaded image on disk, removed however the update ends.
struct ScratchFile(PathBuf);

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.0) {
            Ok(()) => debug!("Removed {}", self.0.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!("Could not remove {}: {e}", self.0.display()),
        }
    }
}

struct Image {
    bytes: Vec<u8>,
    sha256: [u8; 32],
}

fn read_verified(path: &Path, expected: Option<&str>) -> Result<Image> {
    let bytes = fs::read(path)?;
    let sha256: [u8; 32] = Sha256::digest(&bytes).into();
    let actual = hex::encode(sha256);
    if let Some(expected) = expected {
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(Error::Integrity {
                expected: expected.to_string(),
                actual,
            });
        }
    }
    debug!("Image sha256 {actual}");
    Ok(Image { bytes, sha256 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::HandshakeStage;
    use crate::classify::ErrorKind;
    use crate::connection::DeviceMode;
    use crate::gate::GateDenial;
    use crate::mock::{MockConnection, MockServer, context, latest};

    fn device_script(conn: &MockConnection) {
        conn.push_all([
            Response::SerialSignature {
                serial: vec![0x0D, 0xEF],
                signature: vec![1; 64],
            },
            Response::ChallengeSignature {
                signature: vec![2; 64],
            },
            Response::Ack,
        ]);
    }

    fn card_script(conn: &MockConnection) {
        conn.push_all([
            Response::Accepted,
            Response::SerialSignature {
                serial: b"card".to_vec(),
                signature: vec![3; 64],
            },
            Response::ChallengeSignature {
                signature: vec![4; 64],
            },
            Response::Paired,
        ]);
    }

    fn device_stages(events: &[FlowEvent]) -> Vec<HandshakeStage> {
        events
            .iter()
            .filter_map(|e| match e {
                FlowEvent::Device { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }

    fn firmware_stages(events: &[FlowEvent]) -> Vec<UpdateStage> {
        events
            .iter()
            .filter_map(|e| match e {
                FlowEvent::Firmware { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }

    fn options(dir: &tempfile::TempDir) -> UpdateOptions {
        UpdateOptions {
            download_dir: dir.path().to_path_buf(),
            chunk_size: 1024,
            slow_network_after: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_device_auth_happy_path() {
        let conn = MockConnection::new();
        device_script(&conn);
        let ctx = context(DeviceMode::Main, conn.clone());
        let engine = Engine::new(MockServer::new());
        let mut events = Vec::new();

        let verified = engine.authenticate_device(&ctx, &mut events).unwrap();
        assert_eq!(verified.serial, vec![0x0D, 0xEF]);
        assert_eq!(
            device_stages(&events),
            [
                HandshakeStage::RequestSent,
                HandshakeStage::Accepted,
                HandshakeStage::ChallengeSigned,
                HandshakeStage::Verified,
            ]
        );
        assert_eq!(events.first(), Some(&FlowEvent::Entered(Flow::DeviceAuth)));
        assert_eq!(
            events.last(),
            Some(&FlowEvent::Exited {
                flow: Flow::DeviceAuth,
                error: None
            })
        );
        assert_eq!(
            conn.sent(),
            vec![
                Request::DeviceAuthStart,
                Request::DeviceSignChallenge {
                    challenge: vec![0xC0; 16]
                },
                Request::DeviceAuthResult { verified: true },
            ]
        );
        assert_eq!(ctx.current_flow(), None);
    }

    #[test]
    fn test_device_rejection_then_retry() {
        let conn = MockConnection::new();
        conn.push(Response::Rejected);
        let ctx = context(DeviceMode::Main, conn.clone());
        let engine = Engine::new(MockServer::new());
        let mut events = Vec::new();

        let err = engine.authenticate_device(&ctx, &mut events).unwrap_err();
        let failure = err.classify();
        assert_eq!(failure.kind, ErrorKind::RequestRejectedByUser);
        assert!(events.contains(&FlowEvent::Device {
            stage: HandshakeStage::Rejected,
            error: Some(ErrorKind::RequestRejectedByUser),
        }));

        device_script(&conn);
        let verified = engine
            .retry_device_auth(&ctx, failure, &mut events)
            .unwrap();
        assert_eq!(verified.serial, vec![0x0D, 0xEF]);
    }

    #[test]
    fn test_device_bad_signature_is_compromised_and_final() {
        let conn = MockConnection::new();
        device_script(&conn);
        let ctx = context(DeviceMode::Main, conn.clone());
        let server = MockServer::new();
        server.push_challenge(Ok(false));
        let engine = Engine::new(server);
        let mut events = Vec::new();

        let err = engine.authenticate_device(&ctx, &mut events).unwrap_err();
        let failure = err.classify();
        assert_eq!(failure.kind, ErrorKind::DeviceCompromised);
        assert!(conn.sent().contains(&Request::DeviceAuthResult { verified: false }));
        assert!(matches!(
            engine.retry_device_auth(&ctx, failure, &mut events),
            Err(Error::RetryRefused(GateDenial::Terminal(
                ErrorKind::DeviceCompromised
            )))
        ));
    }

    #[test]
    fn test_test_app_sends_nothing() {
        let conn = MockConnection::new();
        let ctx = context(DeviceMode::TestApp, conn.clone());
        let engine = Engine::new(MockServer::new());
        let mut events = Vec::new();

        let err = engine.authenticate_device(&ctx, &mut events).unwrap_err();
        assert_eq!(err.classify().kind, ErrorKind::DeviceInTestApp);
        assert!(conn.sent().is_empty());
        assert!(engine.server().calls().is_empty());
    }

    #[test]
    fn test_busy_connection_fails_fast() {
        let conn = MockConnection::new();
        let ctx = context(DeviceMode::Main, conn.clone());
        let engine = Engine::new(MockServer::new());
        let _guard = ctx.acquire(Flow::FirmwareUpdate).unwrap();

        let err = engine
            .authenticate_device(&ctx, &mut crate::events::NullSink)
            .unwrap_err();
        assert!(matches!(err, Error::Busy(Flow::FirmwareUpdate)));
        assert!(conn.sent().is_empty());
    }

    #[test]
    fn test_cancel_mid_handshake_resets_and_tells_device() {
        let conn = MockConnection::new();
        let ctx = context(DeviceMode::Main, conn.clone());
        let engine = Engine::new(MockServer::new());
        let token = engine.cancel_token().clone();
        let mut events = Vec::new();
        let mut sink = |e: &FlowEvent| {
            if matches!(
                e,
                FlowEvent::Device {
                    stage: HandshakeStage::RequestSent,
                    ..
                }
            ) {
                token.cancel();
            }
            events.push(e.clone());
        };

        let err = engine.authenticate_device(&ctx, &mut sink).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(conn.sent().is_empty());
        assert_eq!(conn.cancels(), 1);
        assert_eq!(
            device_stages(&events),
            [HandshakeStage::RequestSent, HandshakeStage::NotStarted]
        );
        assert!(events.contains(&FlowEvent::Exited {
            flow: Flow::DeviceAuth,
            error: None
        }));
    }

    #[test]
    fn test_cards_all_verified() {
        let conn = MockConnection::new();
        for _ in CardSlot::ALL {
            card_script(&conn);
        }
        let ctx = context(DeviceMode::Main, conn.clone());
        let engine = Engine::new(MockServer::new());
        let mut seq = CardSequence::new();
        let mut events = Vec::new();

        let verdict = engine.authenticate_cards(&ctx, &mut seq, &mut events).unwrap();
        assert_eq!(verdict, SequenceVerdict::AllVerified);
        assert!(events.contains(&FlowEvent::Sequence(SequenceVerdict::AllVerified)));

        let starts: Vec<_> = conn
            .sent()
            .into_iter()
            .filter_map(|r| match r {
                Request::CardAuthStart { slot } => Some(slot),
                _ => None,
            })
            .collect();
        assert_eq!(starts, CardSlot::ALL);
    }

    #[test]
    fn test_card_fault_partial_then_retry() {
        let conn = MockConnection::new();
        card_script(&conn);
        conn.push_all([Response::Accepted, Response::CardFault]);
        card_script(&conn);
        card_script(&conn);
        let ctx = context(DeviceMode::Main, conn.clone());
        let engine = Engine::new(MockServer::new());
        let mut seq = CardSequence::new();
        let mut events = Vec::new();

        let verdict = engine.authenticate_cards(&ctx, &mut seq, &mut events).unwrap();
        assert_eq!(verdict, SequenceVerdict::PartialFailure);
        assert_eq!(
            seq.outcome(CardSlot::Two),
            CardOutcome::Failed(ErrorKind::CardFault)
        );

        card_script(&conn);
        let verdict = engine
            .retry_card(&ctx, &mut seq, CardSlot::Two, &mut events)
            .unwrap();
        assert_eq!(verdict, SequenceVerdict::AllVerified);
    }

    #[test]
    fn test_link_drop_freezes_then_resumes() {
        let conn = MockConnection::new();
        card_script(&conn);
        card_script(&conn);
        conn.push(Response::Accepted);
        conn.push_drop();
        let ctx = context(DeviceMode::Main, conn.clone());
        let engine = Engine::new(MockServer::new());
        let mut seq = CardSequence::new();
        let mut events = Vec::new();

        let err = engine
            .authenticate_cards(&ctx, &mut seq, &mut events)
            .unwrap_err();
        assert_eq!(err.classify().kind, ErrorKind::DeviceNotConnected);
        assert!(seq.is_frozen());
        assert_eq!(seq.outcome(CardSlot::Two), CardOutcome::Verified);
        assert_eq!(seq.outcome(CardSlot::Three), CardOutcome::Pending);

        assert!(engine.resume_cards(&ctx, &mut seq, &mut events).is_err());
        conn.set_open(true);
        card_script(&conn);
        card_script(&conn);
        let verdict = engine.resume_cards(&ctx, &mut seq, &mut events).unwrap();
        assert_eq!(verdict, SequenceVerdict::AllVerified);
    }

    #[test]
    fn test_next_card_one_at_a_time() {
        let conn = MockConnection::new();
        card_script(&conn);
        let ctx = context(DeviceMode::Main, conn);
        let engine = Engine::new(MockServer::new());
        let mut seq = CardSequence::new();

        let done = engine
            .authenticate_next_card(&ctx, &mut seq, &mut crate::events::NullSink)
            .unwrap();
        assert_eq!(done, Some((CardSlot::One, CardOutcome::Verified)));
        assert_eq!(seq.next_slot(), Some(CardSlot::Two));
    }

    #[test]
    fn test_update_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        let ctx = context(DeviceMode::Main, conn.clone());
        let server = MockServer::new();
        server.push_latest(Ok(latest("1.2.0", None)));
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();

        let outcome = engine
            .update_firmware(&ctx, &mut update, &options(&dir), &mut Vec::new())
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::UpToDate(Version::new(1, 2, 0)));
        assert_eq!(update.stage(), UpdateStage::Done);
        assert!(conn.sent().is_empty());
    }

    #[test]
    fn test_update_installs() {
        let dir = tempfile::tempdir().unwrap();
        let image = vec![0x5A; 2500];
        let digest = hex::encode(Sha256::digest(&image));
        let conn = MockConnection::new();
        conn.push_all([Response::Accepted, Response::Ack, Response::Ack, Response::Ack]);
        conn.push(Response::Ack);
        let ctx = context(DeviceMode::Main, conn.clone());
        let server = MockServer::new();
        server.push_latest(Ok(latest("1.3.0", Some(digest))));
        server.set_image(image);
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();
        let mut events = Vec::new();

        let outcome = engine
            .update_firmware(&ctx, &mut update, &options(&dir), &mut events)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Installed(Version::new(1, 3, 0)));
        assert_eq!(
            firmware_stages(&events),
            [
                UpdateStage::FetchingLatestVersion,
                UpdateStage::Downloading,
                UpdateStage::AwaitingDeviceConfirmation,
                UpdateStage::Flashing,
                UpdateStage::Verifying,
                UpdateStage::Done,
            ]
        );
        let sent = conn.sent();
        assert_eq!(sent.len(), 5);
        assert_eq!(
            sent[0],
            Request::FirmwareUpdateStart {
                version: "1.3.0".to_string(),
                size: 2500
            }
        );
        assert!(matches!(sent[3], Request::FirmwareChunk { offset: 2048, .. }));
        assert!(matches!(sent[4], Request::FirmwareFinish { .. }));
    }

    #[test]
    fn test_server_error_keeps_fetch_stage_and_retry_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        let ctx = context(DeviceMode::Main, conn);
        let server = MockServer::new();
        server.push_latest(Err(Error::Server {
            status: 500,
            message: "internal".to_string(),
        }));
        server.push_latest(Ok(latest("1.0.0", None)));
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();
        let mut events = Vec::new();

        let err = engine
            .update_firmware(&ctx, &mut update, &options(&dir), &mut events)
            .unwrap_err();
        assert_eq!(err.classify().kind, ErrorKind::NetworkServerError);
        assert_eq!(update.stage(), UpdateStage::FetchingLatestVersion);
        assert_eq!(update.error(), Some(ErrorKind::NetworkServerError));
        assert_eq!(update.download_path(), None);

        let outcome = engine
            .retry_update(&ctx, &mut update, &options(&dir), &mut events)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::UpToDate(Version::new(1, 0, 0)));
    }

    #[test]
    fn test_network_down_skips_server() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(DeviceMode::Main, MockConnection::new());
        let engine = Engine::new(MockServer::new());
        engine.gate().set_network_reachable(false);
        let mut update = FirmwareUpdate::new();

        let err = engine
            .update_firmware(&ctx, &mut update, &options(&dir), &mut Vec::new())
            .unwrap_err();
        assert_eq!(err.classify().kind, ErrorKind::NetworkUnreachable);
        assert_eq!(update.error(), Some(ErrorKind::NetworkUnreachable));
        assert!(engine.server().calls().is_empty());
        assert!(matches!(
            engine.retry_update(&ctx, &mut update, &options(&dir), &mut Vec::new()),
            Err(Error::RetryRefused(GateDenial::NetworkUnreachable))
        ));
    }

    #[test]
    fn test_update_rejected_on_device() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        conn.push(Response::Rejected);
        let ctx = context(DeviceMode::Main, conn);
        let server = MockServer::new();
        server.push_latest(Ok(latest("1.3.0", None)));
        server.set_image(vec![1; 10]);
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();

        let err = engine
            .update_firmware(&ctx, &mut update, &options(&dir), &mut Vec::new())
            .unwrap_err();
        assert_eq!(err.classify().kind, ErrorKind::RequestRejectedByUser);
        assert_eq!(update.stage(), UpdateStage::Done);
        assert_eq!(update.error(), Some(ErrorKind::RequestRejectedByUser));
    }

    #[test]
    fn test_integrity_mismatch_fails_download() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        let ctx = context(DeviceMode::Main, conn.clone());
        let server = MockServer::new();
        server.push_latest(Ok(latest("1.3.0", Some("00".repeat(32)))));
        server.set_image(vec![7; 100]);
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();

        let err = engine
            .update_firmware(&ctx, &mut update, &options(&dir), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert_eq!(update.stage(), UpdateStage::Downloading);
        assert!(conn.sent().is_empty());
        assert!(!dir.path().join("firmware-1.3.0.bin").exists());
    }

    #[test]
    fn test_cancel_ignored_while_flashing() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        conn.push_all([Response::Accepted, Response::Ack, Response::Ack]);
        let ctx = context(DeviceMode::Main, conn);
        let server = MockServer::new();
        server.push_latest(Ok(latest("1.3.0", None)));
        server.set_image(vec![9; 1000]);
        let engine = Engine::new(server);
        let token = engine.cancel_token().clone();
        let mut update = FirmwareUpdate::new();
        let mut sink = |e: &FlowEvent| {
            if matches!(
                e,
                FlowEvent::Firmware {
                    stage: UpdateStage::Flashing,
                    ..
                }
            ) {
                token.cancel();
            }
        };

        let outcome = engine
            .update_firmware(&ctx, &mut update, &options(&dir), &mut sink)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Installed(Version::new(1, 3, 0)));
        assert!(!engine.cancel_token().is_cancelled());
    }

    #[test]
    fn test_cancel_during_download_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(DeviceMode::Main, MockConnection::new());
        let server = MockServer::new();
        server.push_latest(Ok(latest("1.3.0", None)));
        server.set_image(vec![9; 4096]);
        let engine = Engine::new(server);
        let token = engine.cancel_token().clone();
        let mut update = FirmwareUpdate::new();
        let mut sink = |e: &FlowEvent| {
            if matches!(e, FlowEvent::Progress { .. }) {
                token.cancel();
            }
        };

        let err = engine
            .update_firmware(&ctx, &mut update, &options(&dir), &mut sink)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(update.stage(), UpdateStage::Idle);
        assert_eq!(update.error(), None);
    }

    #[test]
    fn test_slow_download_raises_and_clears_flag() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        conn.push(Response::Rejected);
        let ctx = context(DeviceMode::Main, conn);
        let server = MockServer::new();
        server.push_latest(Ok(latest("1.3.0", None)));
        server.set_image(vec![9; 2048]);
        server.set_chunk_delay(Duration::from_millis(100));
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();
        let mut events = Vec::new();
        let mut opts = options(&dir);
        opts.slow_network_after = Duration::from_millis(20);

        let _ = engine.update_firmware(&ctx, &mut update, &opts, &mut events);
        let flags: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                FlowEvent::SlowNetwork(slow) => Some(*slow),
                _ => None,
            })
            .collect();
        assert_eq!(flags, [true, false]);
    }

    #[test]
    fn test_recurring_flash_failure_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        let ctx = context(DeviceMode::Main, conn.clone());
        let server = MockServer::new();
        server.set_image(vec![1; 10]);
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();

        for attempt in 1..=crate::firmware::MAX_FAILURE_RECURRENCE {
            engine.server().push_latest(Ok(latest("1.3.0", None)));
            conn.push_all([Response::Accepted, Response::NotReady]);
            let result = if attempt == 1 {
                engine.update_firmware(&ctx, &mut update, &options(&dir), &mut Vec::new())
            } else {
                engine.retry_update(&ctx, &mut update, &options(&dir), &mut Vec::new())
            };
            assert!(result.is_err());
        }
        let failure = update.failure().unwrap();
        assert!(failure.terminal);
        assert!(matches!(
            engine.retry_update(&ctx, &mut update, &options(&dir), &mut Vec::new()),
            Err(Error::RetryRefused(GateDenial::Terminal(_)))
        ));
    }

    #[test]
    fn test_bootloader_reply_mid_auth_is_not_retried() {
        let conn = MockConnection::new();
        conn.push(Response::Bootloader);
        let ctx = context(DeviceMode::Main, conn.clone());
        let engine = Engine::new(MockServer::new());
        let mut events = Vec::new();

        let err = engine.authenticate_device(&ctx, &mut events).unwrap_err();
        let failure = err.classify();
        assert_eq!(failure.kind, ErrorKind::DeviceInBootloader);
        assert!(!failure.retryable);
        assert!(matches!(
            engine.retry_device_auth(&ctx, failure, &mut events),
            Err(Error::RetryRefused(GateDenial::NotRetryable(
                ErrorKind::DeviceInBootloader
            )))
        ));
        assert_eq!(conn.sent(), vec![Request::DeviceAuthStart]);
    }

    #[test]
    fn test_cancel_between_cards_stops_the_sequence() {
        let conn = MockConnection::new();
        for _ in CardSlot::ALL {
            card_script(&conn);
        }
        let ctx = context(DeviceMode::Main, conn.clone());
        let engine = Engine::new(MockServer::new());
        let token = engine.cancel_token().clone();
        let mut seq = CardSequence::new();
        let mut sink = |e: &FlowEvent| {
            if matches!(
                e,
                FlowEvent::Card {
                    slot: CardSlot::One,
                    stage: HandshakeStage::Verified,
                    ..
                }
            ) {
                token.cancel();
            }
        };

        let err = engine
            .authenticate_cards(&ctx, &mut seq, &mut sink)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!engine.cancel_token().is_cancelled());
        assert_eq!(seq.outcome(CardSlot::One), CardOutcome::Verified);
        for slot in [CardSlot::Two, CardSlot::Three, CardSlot::Four] {
            assert_eq!(seq.outcome(slot), CardOutcome::Pending, "card {slot}");
        }
        let starts = conn
            .sent()
            .into_iter()
            .filter(|r| matches!(r, Request::CardAuthStart { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_restart_after_exhaustion_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        let ctx = context(DeviceMode::Main, conn.clone());
        let server = MockServer::new();
        server.set_image(vec![1; 10]);
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();

        for _ in 0..crate::firmware::MAX_FAILURE_RECURRENCE {
            engine.server().push_latest(Ok(latest("1.3.0", None)));
            conn.push_all([Response::Accepted, Response::NotReady]);
            let result =
                engine.update_firmware(&ctx, &mut update, &options(&dir), &mut Vec::new());
            assert!(result.is_err());
        }
        assert!(update.failure().is_some_and(|f| f.terminal));

        let sent = conn.sent().len();
        let calls = engine.server().calls().len();
        engine.server().push_latest(Ok(latest("1.3.0", None)));
        conn.push_all([Response::Accepted, Response::Ack, Response::Ack]);
        assert!(matches!(
            engine.update_firmware(&ctx, &mut update, &options(&dir), &mut Vec::new()),
            Err(Error::RetryRefused(GateDenial::Terminal(_)))
        ));
        assert_eq!(conn.sent().len(), sent);
        assert_eq!(engine.server().calls().len(), calls);
        assert_eq!(update.stage(), UpdateStage::Done);
    }

    #[test]
    fn test_slow_network_reported_while_stalled() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        conn.push(Response::Rejected);
        let ctx = context(DeviceMode::Main, conn);
        let server = MockServer::new();
        server.push_latest(Ok(latest("1.3.0", None)));
        server.set_image(vec![9; 2048]);
        server.set_chunk_delay(Duration::from_millis(400));
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();
        let mut opts = options(&dir);
        opts.slow_network_after = Duration::from_millis(50);

        let started = std::time::Instant::now();
        let mut slow_at = None;
        let mut first_progress_at = None;
        let mut sink = |e: &FlowEvent| match e {
            FlowEvent::SlowNetwork(true) => slow_at = slow_at.or(Some(started.elapsed())),
            FlowEvent::Progress {
                stage: UpdateStage::Downloading,
                ..
            } => first_progress_at = first_progress_at.or(Some(started.elapsed())),
            _ => {},
        };

        let _ = engine.update_firmware(&ctx, &mut update, &opts, &mut sink);
        let slow_at = slow_at.unwrap();
        let first_progress_at = first_progress_at.unwrap();
        assert!(slow_at < first_progress_at, "{slow_at:?} vs {first_progress_at:?}");
        assert!(slow_at < Duration::from_millis(300), "{slow_at:?}");
    }

    #[test]
    fn test_downloaded_image_removed_when_update_fails() {
        let scripts: [&[Response]; 3] = [
            &[Response::Rejected],
            // Nothing scripted: the confirmation times out.
            &[],
            &[Response::Accepted, Response::NotReady],
        ];
        for script in scripts {
            let dir = tempfile::tempdir().unwrap();
            let conn = MockConnection::new();
            conn.push_all(script.iter().cloned());
            let ctx = context(DeviceMode::Main, conn);
            let server = MockServer::new();
            server.push_latest(Ok(latest("1.3.0", None)));
            server.set_image(vec![3; 100]);
            let engine = Engine::new(server);
            let mut update = FirmwareUpdate::new();

            let result =
                engine.update_firmware(&ctx, &mut update, &options(&dir), &mut Vec::new());
            assert!(result.is_err(), "{script:?}");
            assert!(
                !dir.path().join("firmware-1.3.0.bin").exists(),
                "{script:?}"
            );
        }
    }

    #[test]
    fn test_oversized_chunk_rejected_before_any_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let conn = MockConnection::new();
        let ctx = context(DeviceMode::Main, conn.clone());
        let server = MockServer::new();
        server.push_latest(Ok(latest("1.3.0", None)));
        server.set_image(vec![3; 100]);
        let engine = Engine::new(server);
        let mut update = FirmwareUpdate::new();

        for chunk_size in [0, MAX_FIRMWARE_CHUNK + 1] {
            let opts = UpdateOptions {
                chunk_size,
                ..options(&dir)
            };
            let err = engine
                .update_firmware(&ctx, &mut update, &opts, &mut Vec::new())
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{chunk_size}: {err}");
        }
        assert!(conn.sent().is_empty());
        assert!(engine.server().calls().is_empty());
        assert_eq!(update.stage(), UpdateStage::Idle);

        let largest = UpdateOptions {
            chunk_size: MAX_FIRMWARE_CHUNK,
            ..options(&dir)
        };
        assert!(largest.validate().is_ok());
    }
}
