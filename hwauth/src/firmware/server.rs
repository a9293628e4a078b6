//! Firmware distribution server.

use std::path::Path;

use semver::Version;

use crate::error::Result;

/// Latest firmware as published by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestFirmware {
    /// Release version.
    pub version: Version,
    /// Where to download the image.
    pub download_url: String,
    /// Hex SHA-256 of the image, when published.
    pub sha256: Option<String>,
}

/// Download progress callback: bytes so far, total if known.
///
/// Returning `false` aborts the download with [`crate::Error::Cancelled`].
pub type DownloadProgress<'a> = &'a mut dyn FnMut(u64, Option<u64>) -> bool;

/// Firmware server.
pub trait FirmwareServer {
    /// Fetch the latest firmware metadata.
    fn latest_firmware(&self) -> Result<LatestFirmware>;

    /// Download `url` to `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path, progress: DownloadProgress<'_>) -> Result<u64>;
}

impl<T: FirmwareServer + ?Sized> FirmwareServer for &T {
    fn latest_firmware(&self) -> Result<LatestFirmware> {
        (**self).latest_firmware()
    }

    fn download(&self, url: &str, dest: &Path, progress: DownloadProgress<'_>) -> Result<u64> {
        (**self).download(url, dest, progress)
    }
}
