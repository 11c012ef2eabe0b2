//! Session endpoints: flow-control windows and the link arena

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use slab::Slab;

use crate::condition::ErrorCondition;
use crate::link::{DeliveryState, Link};
use crate::{EndpointState, Role};

/// Handle to a session owned by a [`Connection`](crate::Connection)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SessionHandle(pub(crate) usize);

/// A disposition waiting to be written for a delivery we own
#[derive(Debug)]
pub(crate) struct PendingDisposition {
    pub role: Role,
    pub delivery_id: u32,
    pub state: Option<DeliveryState>,
    pub settled: bool,
}

#[derive(Debug)]
pub(crate) struct Session {
    pub local_state: EndpointState,
    pub remote_state: EndpointState,
    pub error: Option<ErrorCondition>,
    pub remote_error: Option<ErrorCondition>,
    pub local_channel: u16,
    /// Channel the peer speaks on, learned from its Begin
    pub remote_channel: Option<u16>,
    /// Configured incoming-window ceiling, restored on replenishment
    pub window: u32,
    pub next_outgoing_id: u32,
    pub next_incoming_id: u32,
    /// Frames we are still willing to accept; advertised to the peer
    pub incoming_window: u32,
    /// Frames we may still emit per our own advertisement
    pub outgoing_window: u32,
    /// Capacity the peer last advertised for our transfers
    pub remote_incoming_window: u32,
    pub remote_outgoing_window: u32,
    pub links: Slab<Link>,
    pub links_by_name: FxHashMap<String, usize>,
    pub remote_handles: FxHashMap<u32, usize>,
    /// Outgoing unsettled deliveries by delivery-id
    pub unsettled_out: FxHashMap<u32, (usize, usize)>,
    /// Incoming unsettled deliveries by delivery-id
    pub unsettled_in: FxHashMap<u32, (usize, usize)>,
    pub dispositions: VecDeque<PendingDisposition>,
    pub begin_sent: bool,
    pub end_sent: bool,
    /// A session-scoped Flow (window replenishment) needs to go out
    pub flow_pending: bool,
}

impl Session {
    pub fn new(local_channel: u16, window: u32) -> Self {
        Self {
            local_state: EndpointState::Uninitialized,
            remote_state: EndpointState::Uninitialized,
            error: None,
            remote_error: None,
            local_channel,
            remote_channel: None,
            window,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            incoming_window: window,
            outgoing_window: window,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            links: Slab::new(),
            links_by_name: FxHashMap::default(),
            remote_handles: FxHashMap::default(),
            unsettled_out: FxHashMap::default(),
            unsettled_in: FxHashMap::default(),
            dispositions: VecDeque::new(),
            begin_sent: false,
            end_sent: false,
            flow_pending: false,
        }
    }

    /// Both sides closed and our End has gone out; the channel may be reused
    pub fn is_reclaimable(&self) -> bool {
        self.local_state == EndpointState::Closed
            && self.remote_state == EndpointState::Closed
            && self.end_sent
    }

    /// Mark the remote side of this session and all its links closed
    ///
    /// Used both for a received End and for the cascade from a received
    /// Close; links already terminal are left untouched.
    pub fn remote_close(&mut self, error: Option<ErrorCondition>) {
        self.remote_state = EndpointState::Closed;
        if self.remote_error.is_none() {
            self.remote_error = error;
        }
        for (_, link) in self.links.iter_mut() {
            if link.remote_state != EndpointState::Closed {
                link.remote_state = EndpointState::Closed;
            }
        }
    }
}
