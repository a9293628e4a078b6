//! # hwauth
//!
//! Authentication and firmware-update orchestration for hardware wallets.
//!
//! This crate provides the core state machines and their driver:
//!
//! - Failure classification into a closed [`ErrorKind`] taxonomy
//! - Device and card challenge/response authentication
//! - Four-card sequencing with partial-failure verdicts
//! - Firmware fetch, download, confirmation and flashing
//! - A retry/cancel gate combining failure kind and connectivity
//!
//! The machines are sans-IO. [`Engine`] drives them over a
//! [`DeviceConnection`] and a remote server, emitting a [`FlowEvent`] for
//! every transition.
//!
//! ## Features
//!
//! - `native` (default): serial transport and port discovery via `serialport`
//! - `http` (default): blocking HTTP client for the verification and
//!   firmware server via `reqwest`
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hwauth::{CardSequence, ConnectionContext, Engine, FlowEvent};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(all(feature = "native", feature = "http"))]
//!     {
//!         use hwauth::connection::serial::{DEFAULT_BAUD, SerialSettings};
//!         use hwauth::{HttpServer, SerialConnection};
//!
//!         let link = SerialConnection::open(SerialSettings::new("/dev/ttyACM0", DEFAULT_BAUD))?;
//!         let ctx = ConnectionContext::establish(Arc::new(link))?;
//!         let server = HttpServer::new("https://auth.example.com", hwauth::http::DEFAULT_TIMEOUT)?;
//!         let engine = Engine::new(server);
//!
//!         let mut print = |event: &FlowEvent| println!("{event:?}");
//!         engine.authenticate_device(&ctx, &mut print)?;
//!
//!         let mut cards = CardSequence::new();
//!         let verdict = engine.authenticate_cards(&ctx, &mut cards, &mut print)?;
//!         println!("{verdict}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod cancel;
pub mod classify;
pub mod connection;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod firmware;
pub mod gate;
#[cfg(feature = "http")]
pub mod http;
pub mod protocol;

#[cfg(test)]
mod mock;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use connection::SerialConnection;
#[cfg(feature = "http")]
pub use http::HttpServer;
pub use {
    auth::{
        Handshake, HandshakeStage,
        card::{CardAuth, CardSlot},
        device::DeviceAuth,
        sequence::{CardOutcome, CardSequence, SequenceVerdict},
        server::{AuthServer, AuthTarget, SerialVerdict},
    },
    cancel::CancelToken,
    classify::{Classification, ErrorKind, FailureSignal, classify},
    connection::{ConnectionContext, DeviceConnection, DeviceMode, FlowGuard},
    device::{DetectedPort, EndpointKind, detect_ports, select_port},
    engine::{Engine, UpdateOptions, UpdateOutcome, VerifiedDevice},
    error::{Error, Result},
    events::{EventSink, Flow, FlowEvent, NullSink},
    firmware::{
        FirmwareUpdate, UpdateStage, needs_update,
        server::{FirmwareServer, LatestFirmware},
    },
    gate::{Connectivity, GateDenial, RetryGate},
    protocol::{DeviceInfo, Request, Response},
};
