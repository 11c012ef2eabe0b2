//! Link endpoints and the deliveries in flight on them

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use slab::Slab;

use crate::condition::ErrorCondition;
use crate::frame::{ReceiverSettleMode, SenderSettleMode, Source, Target};
use crate::session::SessionHandle;
use crate::{EndpointState, Role};

/// Handle to a link owned by a [`Connection`](crate::Connection)
///
/// Stable for the lifetime of the link; the underlying slot is reused only
/// after both sides have closed and the link has been reclaimed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LinkHandle {
    pub(crate) session: SessionHandle,
    pub(crate) index: usize,
}

/// Handle to a delivery in flight on a link
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DeliveryHandle {
    pub(crate) link: LinkHandle,
    pub(crate) index: usize,
}

/// Provisional or terminal outcome applied to a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryState {
    /// Partial delivery seen; not an outcome
    Received,
    /// The delivery was processed successfully
    Accepted,
    /// The delivery failed, with an optional reason
    Rejected(Option<ErrorCondition>),
    /// The delivery was not and will not be processed
    Released,
    /// The delivery was modified but not processed
    Modified,
}

/// One message transfer in flight on a link
///
/// Owned by the link's delivery arena until settlement frees it.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub tag: Bytes,
    /// Session-scoped transfer id; assigned on first emission for outgoing
    /// deliveries, taken from the wire for incoming ones
    pub delivery_id: Option<u32>,
    pub settled: bool,
    pub remote_settled: bool,
    pub local_state: Option<DeliveryState>,
    pub remote_state: Option<DeliveryState>,
    pub payload: BytesMut,
    /// All transfer frames for this delivery have been seen or emitted
    pub complete: bool,
    /// Payload bytes already emitted (outgoing multi-frame deliveries)
    pub sent: usize,
}

impl Delivery {
    pub fn outgoing(tag: Bytes, payload: Bytes, settled: bool) -> Self {
        Self {
            tag,
            delivery_id: None,
            settled,
            remote_settled: false,
            local_state: None,
            remote_state: None,
            payload: BytesMut::from(&payload[..]),
            complete: false,
            sent: 0,
        }
    }

    pub fn incoming(tag: Bytes, delivery_id: u32, settled: bool) -> Self {
        Self {
            tag,
            delivery_id: Some(delivery_id),
            settled: false,
            remote_settled: settled,
            local_state: None,
            remote_state: None,
            payload: BytesMut::new(),
            complete: false,
            sent: 0,
        }
    }
}

/// A sender or receiver link endpoint
#[derive(Debug)]
pub(crate) struct Link {
    pub name: String,
    pub role: Role,
    pub local_state: EndpointState,
    pub remote_state: EndpointState,
    pub error: Option<ErrorCondition>,
    pub remote_error: Option<ErrorCondition>,
    pub local_handle: u32,
    pub remote_handle: Option<u32>,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Source>,
    pub target: Option<Target>,
    /// Sender: transfers we may still send. Receiver: credit granted but
    /// not yet consumed by the peer. `u32::MAX` is the unlimited sentinel.
    pub credit: u32,
    pub delivery_count: u32,
    pub deliveries: Slab<Delivery>,
    pub by_tag: FxHashMap<Bytes, usize>,
    /// Sender: deliveries queued for (further) emission, in order
    pub unsent: VecDeque<usize>,
    /// Receiver: complete deliveries not yet taken by the application
    pub received: VecDeque<usize>,
    /// Receiver: delivery whose `more`-flagged chunks are still arriving
    pub current_incoming: Option<usize>,
    pub attach_sent: bool,
    pub detach_sent: bool,
    /// A Flow echoing this link's credit needs to go out
    pub flow_pending: bool,
}

impl Link {
    pub fn new(name: String, role: Role, local_handle: u32) -> Self {
        Self {
            name,
            role,
            local_state: EndpointState::Uninitialized,
            remote_state: EndpointState::Uninitialized,
            error: None,
            remote_error: None,
            local_handle,
            remote_handle: None,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            source: None,
            target: None,
            credit: 0,
            delivery_count: 0,
            deliveries: Slab::new(),
            by_tag: FxHashMap::default(),
            unsent: VecDeque::new(),
            received: VecDeque::new(),
            current_incoming: None,
            attach_sent: false,
            detach_sent: false,
            flow_pending: false,
        }
    }

    /// Both sides closed and our Detach has gone out; the slot may be reused
    pub fn is_reclaimable(&self) -> bool {
        self.local_state == EndpointState::Closed
            && self.remote_state == EndpointState::Closed
            && self.detach_sent
    }

    /// Consume one unit of credit, honoring the unlimited sentinel
    pub fn spend_credit(&mut self) -> bool {
        match self.credit {
            0 => false,
            u32::MAX => true,
            _ => {
                self.credit -= 1;
                true
            }
        }
    }
}
