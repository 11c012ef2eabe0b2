//! The connection endpoint and the Session/Link tree hanging off it
//!
//! Local API calls mutate only local state and leave markers behind;
//! [`Connection::poll_frame`] turns those markers into outbound
//! performatives in causal order. Incoming performatives, dispatched by the
//! transport, mutate only remote state. The two sides of every endpoint
//! progress independently and monotonically.

use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::condition::{Condition, ErrorCondition};
use crate::frame::{
    self, Attach, Begin, Close, Detach, Disposition, End, Flow, Frame, Open, Performative,
    SenderSettleMode, Source, Target, Transfer,
};
use crate::link::{Delivery, DeliveryHandle, DeliveryState, Link, LinkHandle};
use crate::session::{PendingDisposition, Session, SessionHandle};
use crate::{EndpointState, Role};

/// The caller used the endpoint API against its documented preconditions
///
/// These are reported at the offending call; they never affect wire state.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum IllegalState {
    /// The referenced session does not exist (or was reclaimed)
    #[error("unknown session")]
    UnknownSession,
    /// The referenced link does not exist (or was reclaimed)
    #[error("unknown link")]
    UnknownLink,
    /// The referenced delivery does not exist (or was settled)
    #[error("unknown delivery")]
    UnknownDelivery,
    /// The operation requires the opposite link role
    #[error("operation requires a {expected} link")]
    WrongRole {
        /// Role the operation is defined for
        expected: Role,
    },
    /// The endpoint is already closed
    #[error("endpoint is already closed")]
    AlreadyClosed,
    /// Transfer attempted with zero link credit
    #[error("no link credit available")]
    InsufficientCredit,
    /// The delivery tag is already in use on this link
    #[error("delivery tag already in use")]
    DuplicateTag,
    /// Every channel number permitted by channel-max is occupied
    #[error("channel numbers exhausted")]
    ChannelsExhausted,
    /// A link with this name is already attached with a different role
    #[error("link name in use with a different role")]
    NameInUse,
    /// The delivery has not been carried by any transfer frame yet
    #[error("delivery has not been transferred yet")]
    Untransferred,
}

/// Connection-level parameters the transport supplies when draining frames
#[derive(Debug, Copy, Clone)]
pub(crate) struct WriteOpts {
    /// Value to advertise in our Open
    pub local_max_frame_size: u32,
    /// Cap for frames we emit (min of local and remote declarations)
    pub outgoing_max_frame_size: u32,
    pub channel_max: u16,
    /// Milliseconds to advertise as our idle-time-out
    pub idle_time_out: Option<u32>,
}

/// The root endpoint bound to a [`Transport`](crate::Transport)
///
/// Owns the session arena; sessions own links; links own deliveries. All of
/// these are addressed through copyable handles which stay valid until the
/// endpoint they denote is fully closed and reclaimed.
pub struct Connection {
    container_id: String,
    hostname: Option<String>,
    local_state: EndpointState,
    remote_state: EndpointState,
    error: Option<ErrorCondition>,
    remote_error: Option<ErrorCondition>,
    session_window: u32,
    channel_max: u16,
    sessions: Slab<Session>,
    local_channels: FxHashMap<u16, usize>,
    remote_channels: FxHashMap<u16, usize>,
    remote_container_id: Option<String>,
    remote_max_frame_size: u32,
    remote_channel_max: u16,
    remote_idle_timeout: Option<Duration>,
    open_sent: bool,
    close_sent: bool,
}

impl Connection {
    /// Create an unopened connection with the given container identifier
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            hostname: None,
            local_state: EndpointState::Uninitialized,
            remote_state: EndpointState::Uninitialized,
            error: None,
            remote_error: None,
            session_window: 2048,
            channel_max: u16::MAX,
            sessions: Slab::new(),
            local_channels: FxHashMap::default(),
            remote_channels: FxHashMap::default(),
            remote_container_id: None,
            remote_max_frame_size: u32::MAX,
            remote_channel_max: u16::MAX,
            remote_idle_timeout: None,
            open_sent: false,
            close_sent: false,
        }
    }

    /// Set the hostname carried in our Open
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = Some(hostname.into());
    }

    /// Local lifecycle state
    pub fn state(&self) -> EndpointState {
        self.local_state
    }

    /// Remote lifecycle state
    pub fn remote_state(&self) -> EndpointState {
        self.remote_state
    }

    /// Error condition set on local abnormal close, if any
    pub fn condition(&self) -> Option<&ErrorCondition> {
        self.error.as_ref()
    }

    /// Error condition the peer carried in its Close, if any
    pub fn remote_condition(&self) -> Option<&ErrorCondition> {
        self.remote_error.as_ref()
    }

    /// Container identifier the peer declared in its Open
    pub fn remote_container_id(&self) -> Option<&str> {
        self.remote_container_id.as_deref()
    }

    /// Idle timeout the peer declared in its Open
    pub fn remote_idle_timeout(&self) -> Option<Duration> {
        self.remote_idle_timeout
    }

    pub(crate) fn remote_max_frame_size(&self) -> u32 {
        self.remote_max_frame_size
    }

    /// Channel-max the peer declared in its Open
    pub fn remote_channel_max(&self) -> u16 {
        self.remote_channel_max
    }

    pub(crate) fn set_session_window(&mut self, window: u32) {
        self.session_window = window;
    }

    pub(crate) fn set_channel_max(&mut self, channel_max: u16) {
        self.channel_max = channel_max;
    }

    // ===== local API =====

    /// Transition the local side to active, queueing an Open
    pub fn open(&mut self) {
        if self.local_state == EndpointState::Uninitialized {
            self.local_state = EndpointState::Active;
        }
    }

    /// Transition the local side to closed, queueing a Close
    pub fn close(&mut self, error: Option<ErrorCondition>) {
        if self.local_state != EndpointState::Closed {
            self.local_state = EndpointState::Closed;
            if self.error.is_none() {
                self.error = error;
            }
        }
    }

    /// Force an abnormal local close with `error`; used by the transport
    /// for wire-triggered violations
    pub(crate) fn force_close(&mut self, error: ErrorCondition) {
        if self.local_state != EndpointState::Closed {
            warn!(condition = %error, "closing connection");
            self.local_state = EndpointState::Closed;
        }
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Create a session and mark it locally active, queueing a Begin
    pub fn begin(&mut self) -> Result<SessionHandle, IllegalState> {
        if self.local_state == EndpointState::Closed {
            return Err(IllegalState::AlreadyClosed);
        }
        let channel = self.alloc_channel()?;
        let mut session = Session::new(channel, self.session_window);
        session.local_state = EndpointState::Active;
        let index = self.sessions.insert(session);
        self.local_channels.insert(channel, index);
        trace!(channel, "session begun");
        Ok(SessionHandle(index))
    }

    /// Mark a remotely initiated session locally active, queueing a Begin
    /// answer
    ///
    /// No-op for sessions that are already active.
    pub fn accept(&mut self, session: SessionHandle) -> Result<(), IllegalState> {
        let s = self
            .sessions
            .get_mut(session.0)
            .ok_or(IllegalState::UnknownSession)?;
        if s.local_state == EndpointState::Closed {
            return Err(IllegalState::AlreadyClosed);
        }
        s.local_state = EndpointState::Active;
        Ok(())
    }

    /// Mark a session locally closed, queueing an End
    pub fn end(
        &mut self,
        session: SessionHandle,
        error: Option<ErrorCondition>,
    ) -> Result<(), IllegalState> {
        let s = self
            .sessions
            .get_mut(session.0)
            .ok_or(IllegalState::UnknownSession)?;
        if s.local_state != EndpointState::Closed {
            s.local_state = EndpointState::Closed;
            if s.error.is_none() {
                s.error = error;
            }
        }
        Ok(())
    }

    /// Create (or adopt a remotely initiated) link and mark it locally
    /// active, queueing an Attach
    pub fn attach(
        &mut self,
        session: SessionHandle,
        name: impl Into<String>,
        role: Role,
        source: Option<Source>,
        target: Option<Target>,
    ) -> Result<LinkHandle, IllegalState> {
        let s = self
            .sessions
            .get_mut(session.0)
            .ok_or(IllegalState::UnknownSession)?;
        if s.local_state == EndpointState::Closed {
            return Err(IllegalState::AlreadyClosed);
        }
        let name = name.into();
        let index = match s.links_by_name.get(&name) {
            Some(&index) => {
                let link = &mut s.links[index];
                if link.role != role {
                    return Err(IllegalState::NameInUse);
                }
                index
            }
            None => {
                let entry = s.links.vacant_entry();
                let handle = entry.key() as u32;
                let index = entry.key();
                entry.insert(Link::new(name.clone(), role, handle));
                s.links_by_name.insert(name, index);
                index
            }
        };
        let link = &mut s.links[index];
        if link.local_state == EndpointState::Uninitialized {
            link.local_state = EndpointState::Active;
        }
        if source.is_some() {
            link.source = source;
        }
        if target.is_some() {
            link.target = target;
        }
        Ok(LinkHandle { session, index })
    }

    /// Mark a link locally closed, queueing a Detach
    pub fn detach(
        &mut self,
        link: LinkHandle,
        error: Option<ErrorCondition>,
    ) -> Result<(), IllegalState> {
        let l = self.link_mut(link)?;
        if l.local_state != EndpointState::Closed {
            l.local_state = EndpointState::Closed;
            if l.error.is_none() {
                l.error = error;
            }
        }
        Ok(())
    }

    /// Grant `credit` further transfers to the peer's sender, queueing a
    /// Flow
    ///
    /// Passing `u32::MAX` makes the credit effectively unlimited.
    pub fn flow(&mut self, link: LinkHandle, credit: u32) -> Result<(), IllegalState> {
        let l = self.link_mut(link)?;
        if l.role != Role::Receiver {
            return Err(IllegalState::WrongRole {
                expected: Role::Receiver,
            });
        }
        l.credit = l.credit.saturating_add(credit);
        l.flow_pending = true;
        // Granting credit also replenishes the session's incoming window
        let s = &mut self.sessions[link.session.0];
        s.incoming_window = s.window;
        Ok(())
    }

    /// Queue one delivery on a sender link, spending one unit of credit
    ///
    /// Rejected with [`IllegalState::InsufficientCredit`] while the link has
    /// no credit; a Flow from the peer replenishes it.
    pub fn transfer(
        &mut self,
        link: LinkHandle,
        tag: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<DeliveryHandle, IllegalState> {
        let l = self.link_mut(link)?;
        if l.role != Role::Sender {
            return Err(IllegalState::WrongRole {
                expected: Role::Sender,
            });
        }
        if l.local_state != EndpointState::Active {
            return Err(IllegalState::AlreadyClosed);
        }
        let tag = tag.into();
        if l.by_tag.contains_key(&tag) {
            return Err(IllegalState::DuplicateTag);
        }
        if !l.spend_credit() {
            return Err(IllegalState::InsufficientCredit);
        }
        let settled = l.snd_settle_mode == SenderSettleMode::Settled;
        let delivery = Delivery::outgoing(tag.clone(), payload.into(), settled);
        let index = l.deliveries.insert(delivery);
        l.by_tag.insert(tag, index);
        l.unsent.push_back(index);
        Ok(DeliveryHandle { link, index })
    }

    /// Apply a local outcome to a delivery, queueing a Disposition
    ///
    /// Settling frees the delivery once the frame is queued.
    pub fn disposition(
        &mut self,
        delivery: DeliveryHandle,
        state: DeliveryState,
        settled: bool,
    ) -> Result<(), IllegalState> {
        let role = self.link(delivery.link)?.role;
        let l = self.link_mut(delivery.link)?;
        let d = l
            .deliveries
            .get_mut(delivery.index)
            .ok_or(IllegalState::UnknownDelivery)?;
        let delivery_id = d.delivery_id.ok_or(IllegalState::Untransferred)?;
        d.local_state = Some(state.clone());
        d.settled |= settled;
        let s = &mut self.sessions[delivery.link.session.0];
        s.dispositions.push_back(PendingDisposition {
            role,
            delivery_id,
            state: Some(state),
            settled,
        });
        if settled {
            self.free_delivery(delivery);
        }
        Ok(())
    }

    /// Settle a delivery locally, freeing it without any further frame
    pub fn settle(&mut self, delivery: DeliveryHandle) -> Result<(), IllegalState> {
        let l = self.link_mut(delivery.link)?;
        let d = l
            .deliveries
            .get_mut(delivery.index)
            .ok_or(IllegalState::UnknownDelivery)?;
        d.settled = true;
        self.free_delivery(delivery);
        Ok(())
    }

    /// Take the next complete delivery received on a receiver link
    pub fn poll_delivery(&mut self, link: LinkHandle) -> Option<DeliveryHandle> {
        let l = self.link_mut(link).ok()?;
        let index = l.received.pop_front()?;
        Some(DeliveryHandle { link, index })
    }

    /// Payload of a delivery, if it still exists
    pub fn delivery_payload(&self, delivery: DeliveryHandle) -> Option<&[u8]> {
        let l = self.link(delivery.link).ok()?;
        l.deliveries.get(delivery.index).map(|d| &d.payload[..])
    }

    /// Tag of a delivery, if it still exists
    pub fn delivery_tag(&self, delivery: DeliveryHandle) -> Option<&[u8]> {
        let l = self.link(delivery.link).ok()?;
        l.deliveries.get(delivery.index).map(|d| &d.tag[..])
    }

    /// Outcome the peer applied to a delivery, if any yet
    pub fn delivery_remote_state(&self, delivery: DeliveryHandle) -> Option<DeliveryState> {
        let l = self.link(delivery.link).ok()?;
        l.deliveries
            .get(delivery.index)
            .and_then(|d| d.remote_state.clone())
    }

    /// Whether the peer has settled a delivery
    pub fn delivery_remote_settled(&self, delivery: DeliveryHandle) -> bool {
        self.link(delivery.link)
            .ok()
            .and_then(|l| l.deliveries.get(delivery.index))
            .is_some_and(|d| d.remote_settled)
    }

    // ===== introspection =====

    /// Handles of all live sessions, locally or remotely initiated
    pub fn sessions(&self) -> impl Iterator<Item = SessionHandle> + '_ {
        self.sessions.iter().map(|(index, _)| SessionHandle(index))
    }

    /// Handles of all live links on a session
    pub fn links(&self, session: SessionHandle) -> impl Iterator<Item = LinkHandle> + '_ {
        self.sessions
            .get(session.0)
            .into_iter()
            .flat_map(move |s| s.links.iter().map(move |(index, _)| LinkHandle { session, index }))
    }

    /// Find a link by name within a session
    pub fn link_by_name(&self, session: SessionHandle, name: &str) -> Option<LinkHandle> {
        let s = self.sessions.get(session.0)?;
        let index = *s.links_by_name.get(name)?;
        Some(LinkHandle { session, index })
    }

    /// Local lifecycle state of a session
    pub fn session_state(&self, session: SessionHandle) -> Option<EndpointState> {
        self.sessions.get(session.0).map(|s| s.local_state)
    }

    /// Remote lifecycle state of a session
    pub fn session_remote_state(&self, session: SessionHandle) -> Option<EndpointState> {
        self.sessions.get(session.0).map(|s| s.remote_state)
    }

    /// Local lifecycle state of a link
    pub fn link_state(&self, link: LinkHandle) -> Option<EndpointState> {
        self.link(link).ok().map(|l| l.local_state)
    }

    /// Remote lifecycle state of a link
    pub fn link_remote_state(&self, link: LinkHandle) -> Option<EndpointState> {
        self.link(link).ok().map(|l| l.remote_state)
    }

    /// Current credit on a link
    pub fn link_credit(&self, link: LinkHandle) -> Option<u32> {
        self.link(link).ok().map(|l| l.credit)
    }

    /// Role of a link
    pub fn link_role(&self, link: LinkHandle) -> Option<Role> {
        self.link(link).ok().map(|l| l.role)
    }

    /// Error condition the peer carried when detaching a link
    pub fn link_remote_condition(&self, link: LinkHandle) -> Option<&ErrorCondition> {
        self.link(link).ok().and_then(|l| l.remote_error.as_ref())
    }

    // ===== internals =====

    fn link(&self, link: LinkHandle) -> Result<&Link, IllegalState> {
        self.sessions
            .get(link.session.0)
            .ok_or(IllegalState::UnknownSession)?
            .links
            .get(link.index)
            .ok_or(IllegalState::UnknownLink)
    }

    fn link_mut(&mut self, link: LinkHandle) -> Result<&mut Link, IllegalState> {
        self.sessions
            .get_mut(link.session.0)
            .ok_or(IllegalState::UnknownSession)?
            .links
            .get_mut(link.index)
            .ok_or(IllegalState::UnknownLink)
    }

    fn alloc_channel(&self) -> Result<u16, IllegalState> {
        // Both declared maxima are inclusive upper bounds
        let cap = self.channel_max.min(self.remote_channel_max);
        (0..=cap)
            .find(|ch| !self.local_channels.contains_key(ch))
            .ok_or(IllegalState::ChannelsExhausted)
    }

    fn free_delivery(&mut self, delivery: DeliveryHandle) {
        let session = delivery.link.session.0;
        let Some(s) = self.sessions.get_mut(session) else {
            return;
        };
        let Some(l) = s.links.get_mut(delivery.link.index) else {
            return;
        };
        if let Some(d) = l.deliveries.try_remove(delivery.index) {
            l.by_tag.remove(&d.tag);
            if let Some(id) = d.delivery_id {
                s.unsettled_out.remove(&id);
                s.unsettled_in.remove(&id);
            }
        }
    }

    // ===== incoming performatives =====

    /// Apply one decoded performative to the remote side of the endpoint
    /// tree; `Err` indicates a wire-level protocol violation to be carried
    /// back to the peer in our Close
    pub(crate) fn handle_performative(
        &mut self,
        channel: u16,
        performative: Performative,
        payload: Bytes,
    ) -> Result<(), ErrorCondition> {
        trace!(channel, performative = performative.name(), "frame received");
        match performative {
            Performative::Open(open) => self.handle_open(open),
            Performative::Begin(begin) => self.handle_begin(channel, begin),
            Performative::Attach(attach) => self.handle_attach(channel, attach),
            Performative::Flow(flow) => self.handle_flow(channel, flow),
            Performative::Transfer(transfer) => self.handle_transfer(channel, transfer, payload),
            Performative::Disposition(disposition) => {
                self.handle_disposition(channel, disposition)
            }
            Performative::Detach(detach) => self.handle_detach(channel, detach),
            Performative::End(end) => self.handle_end(channel, end),
            Performative::Close(close) => self.handle_close(close),
        }
    }

    fn handle_open(&mut self, open: Open) -> Result<(), ErrorCondition> {
        if self.remote_state != EndpointState::Uninitialized {
            return Err(ErrorCondition::new(
                Condition::ILLEGAL_STATE,
                "open received twice",
            ));
        }
        if open.max_frame_size < crate::MIN_MAX_FRAME_SIZE {
            return Err(ErrorCondition::new(
                Condition::FRAME_SIZE_TOO_SMALL,
                "max-frame-size below the protocol minimum",
            ));
        }
        debug!(container_id = %open.container_id, "remote open");
        self.remote_state = EndpointState::Active;
        self.remote_container_id = Some(open.container_id);
        self.remote_max_frame_size = open.max_frame_size;
        self.remote_channel_max = open.channel_max;
        self.remote_idle_timeout = match open.idle_time_out {
            None | Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms as u64)),
        };
        Ok(())
    }

    fn handle_begin(&mut self, channel: u16, begin: Begin) -> Result<(), ErrorCondition> {
        if self.remote_state != EndpointState::Active {
            return Err(ErrorCondition::new(
                Condition::ILLEGAL_STATE,
                "begin received before open",
            ));
        }
        if self.remote_channels.contains_key(&channel) {
            return Err(ErrorCondition::new(
                Condition::ILLEGAL_STATE,
                "begin on a channel already in use",
            ));
        }
        let index = match begin.remote_channel {
            // The peer is answering a session we initiated
            Some(ours) => *self.local_channels.get(&ours).ok_or_else(|| {
                ErrorCondition::new(Condition::ILLEGAL_STATE, "begin answers an unknown channel")
            })?,
            // The peer initiated; mirror a local session
            None => {
                let local = self.alloc_channel().map_err(|_| {
                    ErrorCondition::new(
                        Condition::RESOURCE_LIMIT_EXCEEDED,
                        "channel numbers exhausted",
                    )
                })?;
                let index = self.sessions.insert(Session::new(local, self.session_window));
                self.local_channels.insert(local, index);
                index
            }
        };
        let s = &mut self.sessions[index];
        s.remote_channel = Some(channel);
        if s.remote_state == EndpointState::Uninitialized {
            s.remote_state = EndpointState::Active;
        }
        s.next_incoming_id = begin.next_outgoing_id;
        s.remote_incoming_window = begin.incoming_window;
        s.remote_outgoing_window = begin.outgoing_window;
        self.remote_channels.insert(channel, index);
        Ok(())
    }

    fn session_by_remote_channel(&mut self, channel: u16) -> Result<usize, ErrorCondition> {
        self.remote_channels.get(&channel).copied().ok_or_else(|| {
            ErrorCondition::new(Condition::ILLEGAL_STATE, "frame on an unknown channel")
        })
    }

    fn handle_attach(&mut self, channel: u16, attach: Attach) -> Result<(), ErrorCondition> {
        let index = self.session_by_remote_channel(channel)?;
        let s = &mut self.sessions[index];
        if s.remote_handles.contains_key(&attach.handle) {
            return Err(ErrorCondition::new(
                Condition::HANDLE_IN_USE,
                "attach on a handle already in use",
            ));
        }
        let link_index = match s.links_by_name.get(&attach.name) {
            Some(&link_index) => link_index,
            None => {
                // The peer initiated; mirror a local link of the opposite role
                let entry = s.links.vacant_entry();
                let handle = entry.key() as u32;
                let link_index = entry.key();
                let mut link = Link::new(attach.name.clone(), !attach.role, handle);
                link.snd_settle_mode = attach.snd_settle_mode;
                link.rcv_settle_mode = attach.rcv_settle_mode;
                link.source = attach.source.clone();
                link.target = attach.target.clone();
                entry.insert(link);
                s.links_by_name.insert(attach.name.clone(), link_index);
                link_index
            }
        };
        let link = &mut s.links[link_index];
        link.remote_handle = Some(attach.handle);
        if link.remote_state == EndpointState::Uninitialized {
            link.remote_state = EndpointState::Active;
        }
        if attach.role == Role::Sender {
            // Our receiver adopts the sender's delivery-count baseline
            link.delivery_count = attach.initial_delivery_count.unwrap_or(0);
        }
        s.remote_handles.insert(attach.handle, link_index);
        Ok(())
    }

    fn handle_flow(&mut self, channel: u16, flow: Flow) -> Result<(), ErrorCondition> {
        let index = self.session_by_remote_channel(channel)?;
        let s = &mut self.sessions[index];
        s.remote_incoming_window = match flow.next_incoming_id {
            Some(next_incoming) => next_incoming
                .wrapping_add(flow.incoming_window)
                .wrapping_sub(s.next_outgoing_id),
            None => flow.incoming_window,
        };
        s.remote_outgoing_window = flow.outgoing_window;
        let Some(handle) = flow.handle else {
            return Ok(());
        };
        let link_index = *s.remote_handles.get(&handle).ok_or_else(|| {
            ErrorCondition::new(Condition::UNATTACHED_HANDLE, "flow on an unattached handle")
        })?;
        let link = &mut s.links[link_index];
        if link.role == Role::Sender {
            link.credit = flow
                .delivery_count
                .unwrap_or(0)
                .wrapping_add(flow.link_credit.unwrap_or(0))
                .wrapping_sub(link.delivery_count);
            if flow.drain {
                // Fast-forward and echo so the peer can observe exhaustion
                link.delivery_count = link.delivery_count.wrapping_add(link.credit);
                link.credit = 0;
                link.flow_pending = true;
            }
            trace!(credit = link.credit, "sender credit updated");
        }
        Ok(())
    }

    fn handle_transfer(
        &mut self,
        channel: u16,
        transfer: Transfer,
        payload: Bytes,
    ) -> Result<(), ErrorCondition> {
        let index = self.session_by_remote_channel(channel)?;
        let s = &mut self.sessions[index];
        if s.incoming_window == 0 {
            return Err(ErrorCondition::new(
                Condition::WINDOW_VIOLATION,
                "transfer exceeds the session incoming window",
            ));
        }
        s.next_incoming_id = s.next_incoming_id.wrapping_add(1);
        s.incoming_window -= 1;
        if s.incoming_window < s.window / 2 {
            s.incoming_window = s.window;
            s.flow_pending = true;
        }
        let link_index = *s.remote_handles.get(&transfer.handle).ok_or_else(|| {
            ErrorCondition::new(
                Condition::UNATTACHED_HANDLE,
                "transfer on an unattached handle",
            )
        })?;
        let link = &mut s.links[link_index];
        if link.role != Role::Receiver {
            return Err(ErrorCondition::new(
                Condition::NOT_ALLOWED,
                "transfer on a sender link",
            ));
        }
        if let Some(index) = link.current_incoming {
            // Continuation of a multi-frame delivery
            let d = &mut link.deliveries[index];
            d.payload.extend_from_slice(&payload);
            if transfer.settled == Some(true) {
                d.remote_settled = true;
            }
            if !transfer.more {
                d.complete = true;
                link.current_incoming = None;
                link.received.push_back(index);
            }
            return Ok(());
        }
        let tag = transfer.delivery_tag.ok_or_else(|| {
            ErrorCondition::new(Condition::DECODE_ERROR, "transfer without a delivery-tag")
        })?;
        let delivery_id = transfer.delivery_id.ok_or_else(|| {
            ErrorCondition::new(Condition::DECODE_ERROR, "transfer without a delivery-id")
        })?;
        if link.by_tag.contains_key(&tag) {
            return Err(ErrorCondition::new(
                Condition::ILLEGAL_STATE,
                "delivery-tag already in use",
            ));
        }
        if !link.spend_credit() {
            return Err(ErrorCondition::new(
                Condition::TRANSFER_LIMIT_EXCEEDED,
                "transfer without link credit",
            ));
        }
        link.delivery_count = link.delivery_count.wrapping_add(1);
        let settled = transfer.settled.unwrap_or(false);
        let mut delivery = Delivery::incoming(tag.clone(), delivery_id, settled);
        delivery.payload.extend_from_slice(&payload);
        let more = transfer.more;
        delivery.complete = !more;
        let di = link.deliveries.insert(delivery);
        link.by_tag.insert(tag, di);
        if more {
            link.current_incoming = Some(di);
        } else {
            link.received.push_back(di);
        }
        if !settled {
            s.unsettled_in.insert(delivery_id, (link_index, di));
        }
        Ok(())
    }

    fn handle_disposition(
        &mut self,
        channel: u16,
        disposition: Disposition,
    ) -> Result<(), ErrorCondition> {
        let index = self.session_by_remote_channel(channel)?;
        let s = &mut self.sessions[index];
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        // The role names the disposition's sender, so a receiver's
        // disposition addresses our outgoing deliveries
        let map = match disposition.role {
            Role::Receiver => &s.unsettled_out,
            Role::Sender => &s.unsettled_in,
        };
        let span = last.wrapping_sub(first);
        let ids: Vec<u32> = map
            .keys()
            .copied()
            .filter(|&id| id.wrapping_sub(first) <= span)
            .collect();
        for id in ids {
            let map = match disposition.role {
                Role::Receiver => &mut s.unsettled_out,
                Role::Sender => &mut s.unsettled_in,
            };
            let &(link_index, di) = map.get(&id).expect("id collected from this map");
            if disposition.settled {
                map.remove(&id);
            }
            let Some(d) = s.links[link_index].deliveries.get_mut(di) else {
                continue;
            };
            d.remote_state = disposition.state.clone();
            d.remote_settled |= disposition.settled;
        }
        Ok(())
    }

    fn handle_detach(&mut self, channel: u16, detach: Detach) -> Result<(), ErrorCondition> {
        let index = self.session_by_remote_channel(channel)?;
        let s = &mut self.sessions[index];
        let link_index = *s.remote_handles.get(&detach.handle).ok_or_else(|| {
            ErrorCondition::new(
                Condition::UNATTACHED_HANDLE,
                "detach on an unattached handle",
            )
        })?;
        let link = &mut s.links[link_index];
        link.remote_state = EndpointState::Closed;
        if link.remote_error.is_none() {
            link.remote_error = detach.error;
        }
        // The peer may reuse the handle immediately after its detach
        s.remote_handles.remove(&detach.handle);
        Ok(())
    }

    fn handle_end(&mut self, channel: u16, end: End) -> Result<(), ErrorCondition> {
        let index = self.session_by_remote_channel(channel)?;
        let s = &mut self.sessions[index];
        s.remote_close(end.error);
        s.remote_handles.clear();
        self.remote_channels.remove(&channel);
        Ok(())
    }

    fn handle_close(&mut self, close: Close) -> Result<(), ErrorCondition> {
        if let Some(error) = &close.error {
            debug!(condition = %error, "remote closed with error");
        }
        self.remote_state = EndpointState::Closed;
        if self.remote_error.is_none() {
            self.remote_error = close.error;
        }
        // Cascade: everything below the connection is remotely dead too
        for (_, s) in self.sessions.iter_mut() {
            if s.remote_state != EndpointState::Closed {
                s.remote_close(None);
            }
        }
        self.remote_channels.clear();
        Ok(())
    }

    // ===== outgoing performatives =====

    /// Produce the next outbound frame implied by pending local state
    /// changes, or `None` when the connection is fully flushed
    ///
    /// Frames come out in causal order: Open before Begin before Attach
    /// before Transfer, with Detach/End/Close trailing everything else.
    pub(crate) fn poll_frame(&mut self, opts: &WriteOpts) -> Option<Frame> {
        if let Some(frame) = self.poll_open(opts) {
            return Some(frame);
        }
        if let Some(frame) = self.poll_begin() {
            return Some(frame);
        }
        if let Some(frame) = self.poll_attach() {
            return Some(frame);
        }
        if let Some(frame) = self.poll_flow() {
            return Some(frame);
        }
        if let Some(frame) = self.poll_transfer(opts) {
            return Some(frame);
        }
        if let Some(frame) = self.poll_disposition() {
            return Some(frame);
        }
        if let Some(frame) = self.poll_detach() {
            return Some(frame);
        }
        if let Some(frame) = self.poll_end() {
            return Some(frame);
        }
        if let Some(frame) = self.poll_close() {
            return Some(frame);
        }
        self.reap();
        None
    }

    fn poll_open(&mut self, opts: &WriteOpts) -> Option<Frame> {
        if self.local_state == EndpointState::Uninitialized || self.open_sent {
            return None;
        }
        self.open_sent = true;
        Some(Frame::amqp(
            0,
            Performative::Open(Open {
                container_id: self.container_id.clone(),
                hostname: self.hostname.clone(),
                max_frame_size: opts.local_max_frame_size,
                channel_max: opts.channel_max,
                idle_time_out: opts.idle_time_out,
            }),
        ))
    }

    fn poll_begin(&mut self) -> Option<Frame> {
        if !self.open_sent {
            return None;
        }
        for (_, s) in self.sessions.iter_mut() {
            if s.local_state == EndpointState::Uninitialized || s.begin_sent {
                continue;
            }
            s.begin_sent = true;
            return Some(Frame::amqp(
                s.local_channel,
                Performative::Begin(Begin {
                    remote_channel: s.remote_channel,
                    next_outgoing_id: s.next_outgoing_id,
                    incoming_window: s.incoming_window,
                    outgoing_window: s.outgoing_window,
                    handle_max: u32::MAX,
                }),
            ));
        }
        None
    }

    fn poll_attach(&mut self) -> Option<Frame> {
        for (_, s) in self.sessions.iter_mut() {
            if !s.begin_sent || s.end_sent {
                continue;
            }
            for (_, l) in s.links.iter_mut() {
                if l.local_state == EndpointState::Uninitialized || l.attach_sent {
                    continue;
                }
                l.attach_sent = true;
                return Some(Frame::amqp(
                    s.local_channel,
                    Performative::Attach(Attach {
                        name: l.name.clone(),
                        handle: l.local_handle,
                        role: l.role,
                        snd_settle_mode: l.snd_settle_mode,
                        rcv_settle_mode: l.rcv_settle_mode,
                        source: l.source.clone(),
                        target: l.target.clone(),
                        initial_delivery_count: l
                            .role
                            .is_sender()
                            .then_some(l.delivery_count),
                    }),
                ));
            }
        }
        None
    }

    fn poll_flow(&mut self) -> Option<Frame> {
        for (_, s) in self.sessions.iter_mut() {
            if !s.begin_sent || s.end_sent {
                continue;
            }
            if s.flow_pending {
                s.flow_pending = false;
                return Some(Frame::amqp(
                    s.local_channel,
                    Performative::Flow(Flow {
                        next_incoming_id: Some(s.next_incoming_id),
                        incoming_window: s.incoming_window,
                        next_outgoing_id: s.next_outgoing_id,
                        outgoing_window: s.outgoing_window,
                        handle: None,
                        delivery_count: None,
                        link_credit: None,
                        drain: false,
                    }),
                ));
            }
            for (_, l) in s.links.iter_mut() {
                if !l.flow_pending || !l.attach_sent || l.detach_sent {
                    continue;
                }
                l.flow_pending = false;
                return Some(Frame::amqp(
                    s.local_channel,
                    Performative::Flow(Flow {
                        next_incoming_id: Some(s.next_incoming_id),
                        incoming_window: s.incoming_window,
                        next_outgoing_id: s.next_outgoing_id,
                        outgoing_window: s.outgoing_window,
                        handle: Some(l.local_handle),
                        delivery_count: Some(l.delivery_count),
                        link_credit: Some(l.credit),
                        drain: false,
                    }),
                ));
            }
        }
        None
    }

    fn poll_transfer(&mut self, opts: &WriteOpts) -> Option<Frame> {
        for (_, s) in self.sessions.iter_mut() {
            if !s.begin_sent || s.end_sent {
                continue;
            }
            for (link_index, l) in s.links.iter_mut() {
                if l.role != Role::Sender || !l.attach_sent || l.detach_sent {
                    continue;
                }
                let Some(&di) = l.unsent.front() else {
                    continue;
                };
                if s.remote_incoming_window == 0 {
                    // The peer's window is session-wide; nothing else on
                    // this session can move either
                    break;
                }
                let d = &mut l.deliveries[di];
                if d.delivery_id.is_none() {
                    d.delivery_id = Some(s.next_outgoing_id);
                    l.delivery_count = l.delivery_count.wrapping_add(1);
                }
                let delivery_id = d.delivery_id;
                let mut performative = Transfer {
                    handle: l.local_handle,
                    delivery_id,
                    delivery_tag: Some(d.tag.clone()),
                    message_format: Some(0),
                    settled: Some(d.settled),
                    more: false,
                };
                // Probe the performative's encoded size to learn how much
                // payload fits alongside it
                let mut probe = Vec::new();
                Performative::Transfer(performative.clone()).encode(&mut probe);
                let fit = (opts.outgoing_max_frame_size as usize)
                    .saturating_sub(frame::FRAME_HEADER_SIZE + probe.len());
                let remaining = d.payload.len() - d.sent;
                let chunk = remaining.min(fit);
                if chunk == 0 && remaining > 0 {
                    // Cannot make progress within the negotiated frame size
                    warn!("transfer stalled: frame overhead exceeds max-frame-size");
                    break;
                }
                performative.more = chunk < remaining;
                let payload = Bytes::copy_from_slice(&d.payload[d.sent..d.sent + chunk]);
                d.sent += chunk;
                s.next_outgoing_id = s.next_outgoing_id.wrapping_add(1);
                s.remote_incoming_window -= 1;
                if !performative.more {
                    d.complete = true;
                    let settled = d.settled;
                    l.unsent.pop_front();
                    if settled {
                        let d = l.deliveries.remove(di);
                        l.by_tag.remove(&d.tag);
                    } else if let Some(id) = delivery_id {
                        s.unsettled_out.insert(id, (link_index, di));
                    }
                }
                return Some(Frame {
                    channel: s.local_channel,
                    body: frame::Body::Amqp(Some(Performative::Transfer(performative))),
                    payload,
                });
            }
        }
        None
    }

    fn poll_disposition(&mut self) -> Option<Frame> {
        for (_, s) in self.sessions.iter_mut() {
            if !s.begin_sent || s.end_sent {
                continue;
            }
            let Some(p) = s.dispositions.pop_front() else {
                continue;
            };
            return Some(Frame::amqp(
                s.local_channel,
                Performative::Disposition(Disposition {
                    role: p.role,
                    first: p.delivery_id,
                    last: None,
                    settled: p.settled,
                    state: p.state,
                }),
            ));
        }
        None
    }

    fn poll_detach(&mut self) -> Option<Frame> {
        for (_, s) in self.sessions.iter_mut() {
            if !s.begin_sent || s.end_sent {
                continue;
            }
            for (_, l) in s.links.iter_mut() {
                if l.local_state != EndpointState::Closed || !l.attach_sent || l.detach_sent {
                    continue;
                }
                l.detach_sent = true;
                return Some(Frame::amqp(
                    s.local_channel,
                    Performative::Detach(Detach {
                        handle: l.local_handle,
                        closed: true,
                        error: l.error.clone(),
                    }),
                ));
            }
        }
        None
    }

    fn poll_end(&mut self) -> Option<Frame> {
        for (_, s) in self.sessions.iter_mut() {
            if s.local_state != EndpointState::Closed || !s.begin_sent || s.end_sent {
                continue;
            }
            s.end_sent = true;
            return Some(Frame::amqp(
                s.local_channel,
                Performative::End(End {
                    error: s.error.clone(),
                }),
            ));
        }
        None
    }

    fn poll_close(&mut self) -> Option<Frame> {
        if self.local_state != EndpointState::Closed || !self.open_sent || self.close_sent {
            return None;
        }
        self.close_sent = true;
        Some(Frame::amqp(
            0,
            Performative::Close(Close {
                error: self.error.clone(),
            }),
        ))
    }

    /// Reclaim endpoints whose both sides are closed and whose closing
    /// frames have gone out; their channel and handle numbers become
    /// reusable only now
    fn reap(&mut self) {
        for (_, s) in self.sessions.iter_mut() {
            let dead: Vec<usize> = s
                .links
                .iter()
                .filter(|(_, l)| l.is_reclaimable())
                .map(|(index, _)| index)
                .collect();
            for index in dead {
                let l = s.links.remove(index);
                s.links_by_name.remove(&l.name);
                if let Some(handle) = l.remote_handle {
                    s.remote_handles.remove(&handle);
                }
            }
        }
        let dead: Vec<usize> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_reclaimable())
            .map(|(index, _)| index)
            .collect();
        for index in dead {
            let s = self.sessions.remove(index);
            self.local_channels.remove(&s.local_channel);
            if let Some(channel) = s.remote_channel {
                self.remote_channels.remove(&channel);
            }
        }
    }
}
