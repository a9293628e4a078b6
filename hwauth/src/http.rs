//! HTTP client for the verification and firmware server.
//!
//! Byte fields travel hex-encoded inside JSON bodies:
//!
//! | Call | Request | Response |
//! |------|---------|----------|
//! | `GET /firmware/latest` | | `{version, url, sha256?}` |
//! | `POST /verification/serial` | `{target, serial, signature}` | `{verified, challenge?}` |
//! | `POST /verification/challenge` | `{target, serial, challenge, signature}` | `{verified}` |

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use log::{debug, trace};
use reqwest::blocking::{Client, Response};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::server::{AuthServer, AuthTarget, SerialVerdict};
use crate::error::{Error, Result};
use crate::firmware::server::{DownloadProgress, FirmwareServer, LatestFirmware};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct LatestBody {
    version: String,
    url: String,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Serialize)]
struct SerialBody {
    target: String,
    serial: String,
    signature: String,
}

#[derive(Debug, Serialize)]
struct ChallengeBody {
    target: String,
    serial: String,
    challenge: String,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct VerdictBody {
    verified: bool,
    #[serde(default)]
    challenge: Option<String>,
}

/// [`AuthServer`] and [`FirmwareServer`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpServer {
    client: Client,
    base_url: String,
}

impl HttpServer {
    /// Client for the server at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hwauth/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn verdict(&self, path: &str, body: &impl Serialize) -> Result<VerdictBody> {
        let url = self.url(path);
        trace!("POST {url}");
        let response = check(self.client.post(&url).json(body).send()?)?;
        read_json(response, path)
    }
}

/// Read a JSON body. A body that arrives but does not parse is a protocol
/// error, not a transport one.
fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let bytes = response.bytes()?;
    decode_json(&bytes, what)
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Protocol(format!("malformed reply to {what}: {e}")))
}

/// Turn a non-success status into [`Error::Server`].
fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .ok()
        .filter(|body| !body.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
    Err(Error::Server {
        status: status.as_u16(),
        message,
    })
}

fn target_name(target: AuthTarget) -> String {
    match target {
        AuthTarget::Device => "device".to_string(),
        AuthTarget::Card(slot) => format!("card-{slot}"),
    }
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value)
        .map_err(|e| Error::Protocol(format!("server sent invalid hex in '{field}': {e}")))
}

impl AuthServer for HttpServer {
    fn verify_serial(
        &self,
        target: AuthTarget,
        serial: &[u8],
        signature: &[u8],
    ) -> Result<SerialVerdict> {
        let body = SerialBody {
            target: target_name(target),
            serial: hex::encode(serial),
            signature: hex::encode(signature),
        };
        let verdict = self.verdict("verification/serial", &body)?;
        debug!("Serial of {target}: verified = {}", verdict.verified);
        match (verdict.verified, verdict.challenge) {
            (false, _) => Ok(SerialVerdict::Rejected),
            (true, Some(challenge)) => Ok(SerialVerdict::Challenge(decode_hex(
                "challenge",
                &challenge,
            )?)),
            (true, None) => Err(Error::Protocol(
                "server verified the serial but sent no challenge".to_string(),
            )),
        }
    }

    fn verify_challenge(
        &self,
        target: AuthTarget,
        serial: &[u8],
        challenge: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let body = ChallengeBody {
            target: target_name(target),
            serial: hex::encode(serial),
            challenge: hex::encode(challenge),
            signature: hex::encode(signature),
        };
        let verdict = self.verdict("verification/challenge", &body)?;
        debug!("Challenge of {target}: verified = {}", verdict.verified);
        Ok(verdict.verified)
    }
}

impl FirmwareServer for HttpServer {
    fn latest_firmware(&self) -> Result<LatestFirmware> {
        let url = self.url("firmware/latest");
        trace!("GET {url}");
        let response = check(self.client.get(&url).send()?)?;
        let body: LatestBody = read_json(response, "firmware/latest")?;
        Ok(LatestFirmware {
            version: Version::parse(body.version.trim_start_matches('v'))?,
            download_url: body.url,
            sha256: body.sha256,
        })
    }

    fn download(&self, url: &str, dest: &Path, progress: DownloadProgress<'_>) -> Result<u64> {
        debug!("Downloading {url} to {}", dest.display());
        let mut response = check(self.client.get(url).send()?)?;
        let total = response.content_length();
        let mut file = File::create(dest)?;
        let mut buf = [0u8; 8192];
        let mut done = 0u64;
        loop {
            let n = response.read(&mut buf)?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            done += n as u64;
            if !progress(done, total) {
                return Err(Error::Cancelled);
            }
        }
        file.flush()?;
        Ok(done)
    }
}
