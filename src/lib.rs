//! Low-level protocol logic for the AMQP 1.0 transport layer
//!
//! amqp-proto contains a fully deterministic implementation of the AMQP 1.0
//! transport: framing, the Connection/Session/Link endpoint state machine,
//! idle-timeout ticking, and SASL sequencing. It contains no networking code
//! and does not get any timestamps from the operating system; the caller
//! feeds bytes in, drains bytes out, and supplies the current time to
//! [`Transport::tick`].
//!
//! The most important types are [`Transport`], which owns the byte buffers
//! and the frame loop for a single peer, and [`Connection`], which contains
//! the bulk of the protocol logic related to managing the endpoint hierarchy
//! and all the related state (such as sessions, links, and deliveries).

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]

use std::{fmt, ops};

mod types;

mod condition;
pub use crate::condition::{Condition, ErrorCondition};

pub mod frame;
pub use crate::frame::{Frame, Performative, ReceiverSettleMode, SenderSettleMode, Source, Target};

mod timer;

mod config;
pub use crate::config::TransportConfig;

mod link;
pub use crate::link::{DeliveryHandle, DeliveryState, LinkHandle};

mod session;
pub use crate::session::SessionHandle;

mod connection;
pub use crate::connection::{Connection, IllegalState};

mod sasl;
pub use crate::sasl::{Sasl, SaslCode};

mod transport;
pub use crate::transport::{Transport, TransportError};

#[cfg(test)]
mod tests;

/// The 8-byte protocol header that precedes plain AMQP frames
pub const AMQP_HEADER: [u8; 8] = *b"AMQP\x00\x01\x00\x00";

/// The 8-byte protocol header that precedes SASL frames
pub const SASL_HEADER: [u8; 8] = *b"AMQP\x03\x01\x00\x00";

/// The smallest max-frame-size an endpoint is permitted to declare
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Lifecycle state of one side (local or remote) of an endpoint
///
/// Each side progresses monotonically: `Uninitialized` → `Active` on the
/// corresponding Open/Begin/Attach, `Active` → `Closed` on the corresponding
/// Close/End/Detach. Neither side ever regresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum EndpointState {
    /// No opening performative has been sent or received for this side
    #[default]
    Uninitialized,
    /// The corresponding Open/Begin/Attach has been sent or received
    Active,
    /// The corresponding Close/End/Detach has been sent or received
    Closed,
}

/// Which end of a link an endpoint occupies
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Role {
    /// The end that transfers deliveries, spending credit
    Sender = 0,
    /// The end that grants credit and receives deliveries
    Receiver = 1,
}

impl Role {
    /// Shorthand for `self == Role::Sender`
    #[inline]
    pub fn is_sender(self) -> bool {
        self == Self::Sender
    }

    /// Shorthand for `self == Role::Receiver`
    #[inline]
    pub fn is_receiver(self) -> bool {
        self == Self::Receiver
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::Sender
    }
}

impl ops::Not for Role {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Sender => "sender",
            Self::Receiver => "receiver",
        })
    }
}
