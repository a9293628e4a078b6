//! Scripted device link and server for unit tests.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use semver::Version;

use crate::auth::server::{AuthServer, AuthTarget, SerialVerdict};
use crate::connection::{ConnectionContext, DeviceConnection, DeviceMode};
use crate::error::{Error, Result};
use crate::firmware::server::{DownloadProgress, FirmwareServer, LatestFirmware};
use crate::protocol::{DeviceInfo, Request, Response};

enum Scripted {
    Reply(Response),
    Fail(Error),
    Drop,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Scripted>,
    sent: Vec<Request>,
}

/// Device link answering from a queue. Clones share the queue.
#[derive(Clone)]
pub struct MockConnection {
    script: Arc<Mutex<Script>>,
    open: Arc<AtomicBool>,
    cancels: Arc<AtomicUsize>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            script: Arc::default(),
            open: Arc::new(AtomicBool::new(true)),
            cancels: Arc::default(),
        }
    }

    pub fn push(&self, response: Response) {
        self.script
            .lock()
            .unwrap()
            .replies
            .push_back(Scripted::Reply(response));
    }

    pub fn push_all(&self, responses: impl IntoIterator<Item = Response>) {
        for response in responses {
            self.push(response);
        }
    }

    pub fn push_err(&self, error: Error) {
        self.script
            .lock()
            .unwrap()
            .replies
            .push_back(Scripted::Fail(error));
    }

    /// The link goes down when this entry is reached.
    pub fn push_drop(&self) {
        self.script.lock().unwrap().replies.push_back(Scripted::Drop);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Request> {
        self.script.lock().unwrap().sent.clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl DeviceConnection for MockConnection {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, request: &Request) -> Result<Response> {
        let mut script = self.script.lock().unwrap();
        script.sent.push(request.clone());
        match script.replies.pop_front() {
            Some(Scripted::Reply(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Drop) => {
                self.open.store(false, Ordering::SeqCst);
                Err(Error::DeviceNotConnected)
            },
            None => Err(Error::Timeout(format!("no reply scripted for {}", request.name()))),
        }
    }

    fn cancel(&self) -> Result<bool> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn close(&self) {
        self.set_open(false);
    }
}

pub fn device_info(mode: DeviceMode) -> DeviceInfo {
    DeviceInfo {
        mode,
        state: 1,
        sdk_version: "2.0.0".to_string(),
        firmware_version: (mode != DeviceMode::Bootloader).then(|| "1.2.0".to_string()),
    }
}

pub fn context(mode: DeviceMode, conn: MockConnection) -> ConnectionContext {
    ConnectionContext::new(Arc::new(conn), device_info(mode)).unwrap()
}

/// Verification and firmware server answering from queues.
///
/// Verification calls succeed when nothing is queued.
#[derive(Default)]
pub struct MockServer {
    serial: Mutex<VecDeque<Result<SerialVerdict>>>,
    challenge: Mutex<VecDeque<Result<bool>>>,
    latest: Mutex<VecDeque<Result<LatestFirmware>>>,
    image: Mutex<Vec<u8>>,
    chunk_delay: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_serial(&self, verdict: Result<SerialVerdict>) {
        self.serial.lock().unwrap().push_back(verdict);
    }

    pub fn push_challenge(&self, verdict: Result<bool>) {
        self.challenge.lock().unwrap().push_back(verdict);
    }

    pub fn push_latest(&self, latest: Result<LatestFirmware>) {
        self.latest.lock().unwrap().push_back(latest);
    }

    pub fn set_image(&self, image: Vec<u8>) {
        *self.image.lock().unwrap() = image;
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.chunk_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn latest(version: &str, sha256: Option<String>) -> LatestFirmware {
    LatestFirmware {
        version: Version::parse(version).unwrap(),
        download_url: format!("https://firmware.test/{version}.bin"),
        sha256,
    }
}

impl AuthServer for MockServer {
    fn verify_serial(
        &self,
        target: AuthTarget,
        _serial: &[u8],
        _signature: &[u8],
    ) -> Result<SerialVerdict> {
        self.record(format!("serial {target}"));
        self.serial
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SerialVerdict::Challenge(vec![0xC0; 16])))
    }

    fn verify_challenge(
        &self,
        target: AuthTarget,
        _serial: &[u8],
        _challenge: &[u8],
        _signature: &[u8],
    ) -> Result<bool> {
        self.record(format!("challenge {target}"));
        self.challenge.lock().unwrap().pop_front().unwrap_or(Ok(true))
    }
}

impl FirmwareServer for MockServer {
    fn latest_firmware(&self) -> Result<LatestFirmware> {
        self.record("latest".to_string());
        self.latest
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Server {
                status: 404,
                message: "no firmware scripted".to_string(),
            }))
    }

    fn download(&self, url: &str, dest: &Path, progress: DownloadProgress<'_>) -> Result<u64> {
        self.record(format!("download {url}"));
        let image = self.image.lock().unwrap().clone();
        let delay = *self.chunk_delay.lock().unwrap();
        let total = image.len() as u64;
        let mut done = 0u64;
        for chunk in image.chunks(1024) {
            thread::sleep(delay);
            done += chunk.len() as u64;
            if !progress(done, Some(total)) {
                return Err(Error::Cancelled);
            }
        }
        fs::write(dest, &image)?;
        Ok(total)
    }
}
