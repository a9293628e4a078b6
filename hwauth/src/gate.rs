//! Retry/cancel gate.
//!
//! Merges the three independently arriving connectivity signals (device link,
//! network, remote server) with a failure's [`Classification`] into a single
//! allow/deny decision. Terminal failures are refused here regardless of what
//! the caller asks for.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::classify::{Classification, ErrorKind};
use crate::connection::ConnectionContext;

/// Reason a retry (or cancel) was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDenial {
    /// The failure is terminal; only support can resolve it.
    Terminal(ErrorKind),
    /// The failure kind is not retryable without another flow first.
    NotRetryable(ErrorKind),
    /// The device is not connected.
    DeviceDisconnected,
    /// The network is not reachable.
    NetworkUnreachable,
    /// The remote server is known to be unavailable.
    ServerUnavailable,
    /// There is no failure to retry.
    NothingToRetry,
    /// The current stage cannot be interrupted.
    NonCancellable,
}

impl fmt::Display for GateDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminal(kind) => write!(f, "{kind} is terminal, contact support"),
            Self::NotRetryable(kind) => write!(f, "{kind} cannot be retried directly"),
            Self::DeviceDisconnected => write!(f, "device is not connected"),
            Self::NetworkUnreachable => write!(f, "network is unreachable"),
            Self::ServerUnavailable => write!(f, "server is unavailable"),
            Self::NothingToRetry => write!(f, "nothing to retry"),
            Self::NonCancellable => write!(f, "operation cannot be interrupted"),
        }
    }
}

/// Snapshot of the connectivity signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    /// Physical device connectivity as reported by the connection layer.
    pub device: bool,
    /// Network reachability.
    pub network: bool,
    /// Remote server availability.
    pub server: bool,
}

/// Shared retry policy.
///
/// Clones share state, so the connection layer and a network monitor can
/// update the same gate the engine consults.
#[derive(Debug, Clone)]
pub struct RetryGate {
    device: Arc<AtomicBool>,
    network: Arc<AtomicBool>,
    server: Arc<AtomicBool>,
}

impl Default for RetryGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryGate {
    /// Create a gate with every signal up.
    pub fn new() -> Self {
        Self {
            device: Arc::new(AtomicBool::new(true)),
            network: Arc::new(AtomicBool::new(true)),
            server: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Update device connectivity.
    pub fn set_device_connected(&self, connected: bool) {
        debug!("Gate: device connected = {connected}");
        self.device.store(connected, Ordering::SeqCst);
    }

    /// Update network reachability.
    pub fn set_network_reachable(&self, reachable: bool) {
        debug!("Gate: network reachable = {reachable}");
        self.network.store(reachable, Ordering::SeqCst);
    }

    /// Update remote server availability.
    pub fn set_server_available(&self, available: bool) {
        debug!("Gate: server available = {available}");
        self.server.store(available, Ordering::SeqCst);
    }

    /// Record a successful exchange with the remote server.
    pub fn observe_server_success(&self) {
        self.network.store(true, Ordering::SeqCst);
        self.server.store(true, Ordering::SeqCst);
    }

    /// Current signal snapshot.
    pub fn connectivity(&self) -> Connectivity {
        Connectivity {
            device: self.device.load(Ordering::SeqCst),
            network: self.network.load(Ordering::SeqCst),
            server: self.server.load(Ordering::SeqCst),
        }
    }

    /// Whether the network precondition for server calls holds.
    pub fn network_ready(&self) -> Result<(), GateDenial> {
        let c = self.connectivity();
        if !c.network {
            return Err(GateDenial::NetworkUnreachable);
        }
        if !c.server {
            return Err(GateDenial::ServerUnavailable);
        }
        Ok(())
    }

    /// Decide whether `failure` may be retried on `ctx`.
    ///
    /// Every retry in this crate re-contacts the server, so network and
    /// server availability are always required alongside a live device link.
    pub fn authorize(
        &self,
        ctx: &ConnectionContext,
        failure: Classification,
    ) -> Result<(), GateDenial> {
        let decision = self.decide(ctx.is_open(), failure);
        if let Err(denial) = decision {
            warn!("Retry of {} refused: {denial}", failure.kind);
        }
        decision
    }

    fn decide(&self, link_open: bool, failure: Classification) -> Result<(), GateDenial> {
        if failure.terminal {
            return Err(GateDenial::Terminal(failure.kind));
        }
        if !failure.retryable {
            return Err(GateDenial::NotRetryable(failure.kind));
        }
        if !link_open || !self.connectivity().device {
            return Err(GateDenial::DeviceDisconnected);
        }
        self.network_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_always_refused() {
        let gate = RetryGate::new();
        for kind in [ErrorKind::DeviceCompromised, ErrorKind::CardPairingFailed] {
            assert_eq!(
                gate.decide(true, Classification::of(kind)),
                Err(GateDenial::Terminal(kind))
            );
        }
        assert_eq!(
            gate.decide(true, Classification::exhausted()),
            Err(GateDenial::Terminal(ErrorKind::Unknown))
        );
    }

    #[test]
    fn test_bootloader_not_retryable() {
        let gate = RetryGate::new();
        assert_eq!(
            gate.decide(true, Classification::of(ErrorKind::DeviceInBootloader)),
            Err(GateDenial::NotRetryable(ErrorKind::DeviceInBootloader))
        );
    }

    #[test]
    fn test_requires_all_signals() {
        let gate = RetryGate::new();
        let failure = Classification::of(ErrorKind::RequestRejectedByUser);
        assert_eq!(gate.decide(true, failure), Ok(()));
        assert_eq!(
            gate.decide(false, failure),
            Err(GateDenial::DeviceDisconnected)
        );

        gate.set_network_reachable(false);
        assert_eq!(
            gate.decide(true, failure),
            Err(GateDenial::NetworkUnreachable)
        );

        gate.set_network_reachable(true);
        gate.set_server_available(false);
        assert_eq!(
            gate.decide(true, failure),
            Err(GateDenial::ServerUnavailable)
        );

        gate.observe_server_success();
        gate.set_device_connected(false);
        assert_eq!(
            gate.decide(true, failure),
            Err(GateDenial::DeviceDisconnected)
        );
    }

    #[test]
    fn test_clones_share_signals() {
        let gate = RetryGate::new();
        let monitor = gate.clone();
        monitor.set_network_reachable(false);
        assert!(!gate.connectivity().network);
    }
}
