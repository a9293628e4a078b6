//! Configuration file support for hwauth.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (HWAUTH_*)
//! 3. `--config <PATH>` or the local config file (./hwauth.toml)
//! 4. Global config file (~/.config/hwauth/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG: &str = "hwauth.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

/// Device link configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Timeout for plain device replies, in milliseconds.
    pub reply_timeout_ms: Option<u64>,
    /// Timeout for replies that wait on the user, in seconds.
    pub confirm_timeout_secs: Option<u64>,
}

/// Verification and firmware server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL.
    pub url: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

/// Firmware update configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Where downloaded images are stored.
    pub download_dir: Option<PathBuf>,
    /// Bytes per firmware chunk sent to the device.
    pub chunk_size: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device link.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Remote server.
    #[serde(default)]
    pub server: ServerConfig,
    /// Firmware update.
    #[serde(default)]
    pub update: UpdateConfig,
    /// Remembered wallet endpoints.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load the global file overlaid with a specific file (--config flag).
    pub fn load_with_override(path: &Path) -> Self {
        let mut config = Self::global_config_path()
            .and_then(|global| Self::load_from_file(&global))
            .unwrap_or_default();
        match Self::load_from_file(path) {
            Some(local) => {
                debug!("Loaded config from {}", path.display());
                config.merge(local);
            },
            None => warn!("Could not load config from {}, ignoring it", path.display()),
        }
        config
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Ignoring invalid TOML in {}: {e}", path.display());
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {e}", path.display());
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "hwauth").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set fields in `other` win.
    fn merge(&mut self, other: Self) {
        let Self {
            connection,
            server,
            update,
            usb_device,
        } = other;

        if connection.serial.is_some() {
            self.connection.serial = connection.serial;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }
        if connection.reply_timeout_ms.is_some() {
            self.connection.reply_timeout_ms = connection.reply_timeout_ms;
        }
        if connection.confirm_timeout_secs.is_some() {
            self.connection.confirm_timeout_secs = connection.confirm_timeout_secs;
        }

        if server.url.is_some() {
            self.server.url = server.url;
        }
        if server.timeout_secs.is_some() {
            self.server.timeout_secs = server.timeout_secs;
        }

        if update.download_dir.is_some() {
            self.update.download_dir = update.download_dir;
        }
        if update.chunk_size.is_some() {
            self.update.chunk_size = update.chunk_size;
        }

        for device in usb_device {
            if !self.usb_device.contains(&device) {
                self.usb_device.push(device);
            }
        }
    }

    /// Remembered VID/PID pairs in the form the discovery code takes.
    pub fn registered_pairs(&self) -> Vec<(u16, u16)> {
        self.usb_device.iter().map(|d| (d.vid, d.pid)).collect()
    }

    /// Reply timeout, if configured.
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.connection.reply_timeout_ms.map(Duration::from_millis)
    }

    /// Confirmation timeout, if configured.
    pub fn confirm_timeout(&self) -> Option<Duration> {
        self.connection.confirm_timeout_secs.map(Duration::from_secs)
    }

    /// Server timeout, if configured.
    pub fn server_timeout(&self) -> Option<Duration> {
        self.server.timeout_secs.map(Duration::from_secs)
    }

    /// Save a USB device for future auto-detection.
    ///
    /// Writes to the local file when one exists, otherwise to the global one.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_CONFIG)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG)
        };

        // Only the file's own content is rewritten, not the merged view.
        let mut on_disk = Self::load_from_file(&path).unwrap_or_default();
        on_disk.usb_device.push(device);
        fs::write(&path, toml::to_string_pretty(&on_disk)?)?;
        info!("Saved USB device {vid:04X}:{pid:04X} to {}", path.display());

        self.usb_device.push(device);
        Ok(())
    }
}
