//! Transition events emitted by the state machines.
//!
//! The UI layer subscribes to these; the core never renders anything itself.
//! Any `FnMut(&FlowEvent)` closure, a `Vec<FlowEvent>` or an
//! `mpsc::Sender<FlowEvent>` can serve as a sink.

use std::fmt;
use std::sync::mpsc;

use crate::auth::HandshakeStage;
use crate::auth::card::CardSlot;
use crate::auth::sequence::SequenceVerdict;
use crate::classify::ErrorKind;
use crate::firmware::UpdateStage;

/// The flows that can hold a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Device challenge/response authentication.
    DeviceAuth,
    /// Four-card authentication sequence.
    CardAuth,
    /// Firmware download and flash.
    FirmwareUpdate,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceAuth => write!(f, "device authentication"),
            Self::CardAuth => write!(f, "card authentication"),
            Self::FirmwareUpdate => write!(f, "firmware update"),
        }
    }
}

/// A single transition event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    /// A flow acquired the connection and started running.
    Entered(Flow),
    /// A flow released the connection.
    Exited {
        /// The flow.
        flow: Flow,
        /// Failure the flow ended with, if any.
        error: Option<ErrorKind>,
    },
    /// Device handshake stage changed.
    Device {
        /// New stage.
        stage: HandshakeStage,
        /// Error attached to the stage.
        error: Option<ErrorKind>,
    },
    /// Card handshake stage changed.
    Card {
        /// Card slot.
        slot: CardSlot,
        /// New stage.
        stage: HandshakeStage,
        /// Error attached to the stage.
        error: Option<ErrorKind>,
    },
    /// The card sequence reached a verdict.
    Sequence(SequenceVerdict),
    /// Firmware update stage changed.
    Firmware {
        /// New stage.
        stage: UpdateStage,
        /// Error attached to the stage.
        error: Option<ErrorKind>,
    },
    /// Slow-network flag changed.
    SlowNetwork(bool),
    /// Byte progress of the current download or flash.
    Progress {
        /// Stage the progress belongs to.
        stage: UpdateStage,
        /// Bytes done.
        current: u64,
        /// Total bytes, when known.
        total: Option<u64>,
    },
}

/// Consumer of transition events.
pub trait EventSink {
    /// Deliver one event.
    fn emit(&mut self, event: FlowEvent);
}

impl<F> EventSink for F
where
    F: FnMut(&FlowEvent),
{
    fn emit(&mut self, event: FlowEvent) {
        self(&event);
    }
}

impl EventSink for Vec<FlowEvent> {
    fn emit(&mut self, event: FlowEvent) {
        self.push(event);
    }
}

impl EventSink for mpsc::Sender<FlowEvent> {
    fn emit(&mut self, event: FlowEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: FlowEvent) {}
}
