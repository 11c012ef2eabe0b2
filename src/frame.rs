//! AMQP 1.0 frame codec
//!
//! A frame is a length-prefixed envelope: 4-byte big-endian total size,
//! 1-byte data offset in 4-byte words, 1-byte frame type (0 = AMQP,
//! 1 = SASL), 2-byte channel number, then the performative as a described
//! list and, for Transfer frames, raw payload bytes. [`decode`] never fails
//! on legitimately truncated input; it reports `None` until a complete
//! frame is buffered.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::condition::ErrorCondition;
use crate::link::DeliveryState;
use crate::types::{self, ListReader, ListWriter};
use crate::Role;

/// Fixed envelope size: size, doff, type, channel
pub(crate) const FRAME_HEADER_SIZE: usize = 8;
pub(crate) const AMQP_FRAME_TYPE: u8 = 0;
pub(crate) const SASL_FRAME_TYPE: u8 = 1;

/// Descriptor code identifying a described list on the wire
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct Descriptor(pub(crate) u64);

macro_rules! descriptors {
    {$($name:ident = $val:expr,)*} => {
        impl Descriptor {
            $(pub(crate) const $name: Self = Self($val);)*
        }

        impl fmt::Debug for Descriptor {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x => write!(f, "Descriptor({x:#04x})"),
                }
            }
        }
    }
}

descriptors! {
    OPEN = 0x10,
    BEGIN = 0x11,
    ATTACH = 0x12,
    FLOW = 0x13,
    TRANSFER = 0x14,
    DISPOSITION = 0x15,
    DETACH = 0x16,
    END = 0x17,
    CLOSE = 0x18,
    ERROR = 0x1d,
    RECEIVED = 0x23,
    ACCEPTED = 0x24,
    REJECTED = 0x25,
    RELEASED = 0x26,
    MODIFIED = 0x27,
    SOURCE = 0x28,
    TARGET = 0x29,
    SASL_MECHANISMS = 0x40,
    SASL_INIT = 0x41,
    SASL_CHALLENGE = 0x42,
    SASL_RESPONSE = 0x43,
    SASL_OUTCOME = 0x44,
}

/// Sender-side settlement policy declared on Attach
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SenderSettleMode {
    /// Every delivery is sent unsettled
    Unsettled = 0,
    /// Every delivery is sent settled
    Settled = 1,
    /// Deliveries may be sent either way
    #[default]
    Mixed = 2,
}

/// Receiver-side settlement policy declared on Attach
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ReceiverSettleMode {
    /// The receiver settles as soon as it applies an outcome
    #[default]
    First = 0,
    /// The receiver settles only after the sender settles
    Second = 1,
}

/// The source terminus of a link
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Source {
    /// Address messages are consumed from
    pub address: Option<String>,
}

/// The target terminus of a link
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Target {
    /// Address messages are sent to
    pub address: Option<String>,
}

/// Open performative: negotiates connection-level limits
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Open {
    /// Globally unique identifier for the sending container
    pub container_id: String,
    /// Virtual host the sender wants to connect to
    pub hostname: Option<String>,
    /// Largest frame the sender will accept
    pub max_frame_size: u32,
    /// Highest channel number the sender will accept
    pub channel_max: u16,
    /// Idle timeout in milliseconds the sender will tolerate
    pub idle_time_out: Option<u32>,
}

impl Default for Open {
    fn default() -> Self {
        Self {
            container_id: String::new(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_time_out: None,
        }
    }
}

/// Begin performative: creates a session on a channel
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Begin {
    /// Set when this Begin answers a remotely initiated session
    pub remote_channel: Option<u16>,
    /// Transfer id the sender will assign to its next transfer frame
    pub next_outgoing_id: u32,
    /// Transfer frames the sender is prepared to receive
    pub incoming_window: u32,
    /// Transfer frames the sender may emit
    pub outgoing_window: u32,
    /// Highest link handle the sender will accept
    pub handle_max: u32,
}

impl Default for Begin {
    fn default() -> Self {
        Self {
            remote_channel: None,
            next_outgoing_id: 0,
            incoming_window: 0,
            outgoing_window: 0,
            handle_max: u32::MAX,
        }
    }
}

/// Attach performative: creates a link within a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attach {
    /// Link name, unique within the session
    pub name: String,
    /// Handle the sender will use for this link
    pub handle: u32,
    /// Which end of the link the sender occupies
    pub role: Role,
    /// Settlement policy of the link's sender
    pub snd_settle_mode: SenderSettleMode,
    /// Settlement policy of the link's receiver
    pub rcv_settle_mode: ReceiverSettleMode,
    /// Source terminus
    pub source: Option<Source>,
    /// Target terminus
    pub target: Option<Target>,
    /// Mandatory when the sender speaks; echoes its delivery-count
    pub initial_delivery_count: Option<u32>,
}

/// Flow performative: updates session windows and link credit
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Flow {
    /// Transfer id the sender expects next from its peer
    pub next_incoming_id: Option<u32>,
    /// Transfer frames the sender is prepared to receive
    pub incoming_window: u32,
    /// Transfer id the sender will assign to its next transfer frame
    pub next_outgoing_id: u32,
    /// Transfer frames the sender may emit
    pub outgoing_window: u32,
    /// Absent for session-scoped flow
    pub handle: Option<u32>,
    /// The sending endpoint's delivery-count
    pub delivery_count: Option<u32>,
    /// Transfers the link's sender may still initiate
    pub link_credit: Option<u32>,
    /// The sender wants outstanding credit consumed or returned now
    pub drain: bool,
}

/// Transfer performative: carries (a chunk of) one delivery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transfer {
    /// Link the delivery travels on
    pub handle: u32,
    /// Session-scoped delivery number; may be elided on continuations
    pub delivery_id: Option<u32>,
    /// Tag uniquely identifying the delivery on its link
    pub delivery_tag: Option<Bytes>,
    /// Format of the payload; zero is the standard AMQP message format
    pub message_format: Option<u32>,
    /// The sender considers the delivery settled already
    pub settled: Option<bool>,
    /// Further transfer frames for this delivery follow
    pub more: bool,
}

/// Disposition performative: applies an outcome to a delivery-id range
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Disposition {
    /// Which end's deliveries the disposition addresses
    pub role: Role,
    /// First delivery-id in the range
    pub first: u32,
    /// Last delivery-id in the range; defaults to `first`
    pub last: Option<u32>,
    /// The deliveries are settled and may be forgotten
    pub settled: bool,
    /// Outcome applied to the range
    pub state: Option<DeliveryState>,
}

/// Detach performative: closes a link
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detach {
    /// Link being detached
    pub handle: u32,
    /// The link is closed for good, not just detached
    pub closed: bool,
    /// Why the link was closed, if abnormally
    pub error: Option<ErrorCondition>,
}

/// End performative: closes a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct End {
    /// Why the session was ended, if abnormally
    pub error: Option<ErrorCondition>,
}

/// Close performative: closes the connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Close {
    /// Why the connection was closed, if abnormally
    pub error: Option<ErrorCondition>,
}

/// A typed AMQP protocol message carried inside a frame
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    /// Wire name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Begin(_) => "begin",
            Self::Attach(_) => "attach",
            Self::Flow(_) => "flow",
            Self::Transfer(_) => "transfer",
            Self::Disposition(_) => "disposition",
            Self::Detach(_) => "detach",
            Self::End(_) => "end",
            Self::Close(_) => "close",
        }
    }
}

/// SASL negotiation frame bodies
#[derive(Debug, Clone, PartialEq)]
pub enum SaslBody {
    /// Server advertises the mechanisms it supports
    Mechanisms(Vec<String>),
    /// Client selects a mechanism, with an optional initial response
    Init {
        /// Selected mechanism
        mechanism: String,
        /// Mechanism-specific initial response
        initial_response: Option<Bytes>,
        /// Virtual host the client wants
        hostname: Option<String>,
    },
    /// Server challenge
    Challenge(Bytes),
    /// Client response to a challenge
    Response(Bytes),
    /// Final outcome of the negotiation
    Outcome {
        /// Outcome code; zero is success
        code: u8,
        /// Mechanism-specific data accompanying the outcome
        additional_data: Option<Bytes>,
    },
}

/// The body of one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// An AMQP frame; `None` is the empty keep-alive frame
    Amqp(Option<Performative>),
    /// A SASL negotiation frame
    Sasl(SaslBody),
}

/// One decoded or to-be-encoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Channel the frame addresses
    pub channel: u16,
    /// Frame body
    pub body: Body,
    /// Raw payload following the performative (Transfer frames only)
    pub payload: Bytes,
}

impl Frame {
    /// A frame carrying a performative and no payload
    pub fn amqp(channel: u16, performative: Performative) -> Self {
        Self {
            channel,
            body: Body::Amqp(Some(performative)),
            payload: Bytes::new(),
        }
    }

    /// The empty keep-alive frame
    pub fn keepalive() -> Self {
        Self {
            channel: 0,
            body: Body::Amqp(None),
            payload: Bytes::new(),
        }
    }

    /// A SASL negotiation frame; always travels on channel 0
    pub fn sasl(body: SaslBody) -> Self {
        Self {
            channel: 0,
            body: Body::Sasl(body),
            payload: Bytes::new(),
        }
    }
}

/// The frame is well formed but cannot be interpreted; terminal for the
/// owning transport
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum Malformed {
    /// Declared size below the minimum or above the negotiated maximum
    #[error("frame size {size} outside the allowed range [8, {max}]")]
    InvalidSize {
        /// Declared total frame size
        size: u32,
        /// Negotiated max-frame-size
        max: u32,
    },
    /// Data offset points outside the frame
    #[error("data offset {doff} words lies outside the frame body")]
    InvalidDoff {
        /// Declared data offset in 4-byte words
        doff: u8,
    },
    /// Neither an AMQP nor a SASL frame
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    /// The performative could not be decoded
    #[error("malformed performative: {0}")]
    Body(#[from] types::Error),
}

/// A frame that does not fit within the negotiated max-frame-size
///
/// `payload_fit` reports how many payload bytes would fit alongside the
/// performative, enabling the session layer to split the delivery across
/// multiple Transfer frames.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("frame does not fit in {max_frame_size} bytes ({payload_fit} payload bytes would)")]
pub struct WouldOverflow {
    /// The limit the frame exceeded
    pub max_frame_size: u32,
    /// Payload bytes that would fit alongside the performative
    pub payload_fit: usize,
}

fn decode_error(r: &mut ListReader<'_>) -> Result<Option<ErrorCondition>, types::Error> {
    let Some((descriptor, mut fields)) = r.described_field()? else {
        return Ok(None);
    };
    if Descriptor(descriptor) != Descriptor::ERROR {
        return Err(types::Error::Malformed("expected an error condition"));
    }
    let condition = fields
        .symbol()?
        .ok_or(types::Error::Malformed("error without a condition"))?;
    let description = fields.string()?;
    Ok(Some(ErrorCondition {
        condition: condition.into(),
        description,
    }))
}

fn encode_error(w: &mut ListWriter, error: &Option<ErrorCondition>) {
    match error {
        None => w.null(),
        Some(e) => {
            let mut fields = ListWriter::new();
            fields.symbol(e.condition.name());
            fields.opt_string(e.description.as_deref());
            w.described(Descriptor::ERROR.0, fields);
        }
    }
}

fn decode_state(
    descriptor: u64,
    fields: &mut ListReader<'_>,
) -> Result<DeliveryState, types::Error> {
    match Descriptor(descriptor) {
        Descriptor::RECEIVED => Ok(DeliveryState::Received),
        Descriptor::ACCEPTED => Ok(DeliveryState::Accepted),
        Descriptor::REJECTED => Ok(DeliveryState::Rejected(decode_error(fields)?)),
        Descriptor::RELEASED => Ok(DeliveryState::Released),
        Descriptor::MODIFIED => Ok(DeliveryState::Modified),
        _ => Err(types::Error::Malformed("unknown delivery state")),
    }
}

fn encode_state(w: &mut ListWriter, state: &Option<DeliveryState>) {
    let Some(state) = state else {
        w.null();
        return;
    };
    let (descriptor, fields) = match state {
        DeliveryState::Received => (Descriptor::RECEIVED, ListWriter::new()),
        DeliveryState::Accepted => (Descriptor::ACCEPTED, ListWriter::new()),
        DeliveryState::Rejected(error) => {
            let mut fields = ListWriter::new();
            encode_error(&mut fields, error);
            (Descriptor::REJECTED, fields)
        }
        DeliveryState::Released => (Descriptor::RELEASED, ListWriter::new()),
        DeliveryState::Modified => (Descriptor::MODIFIED, ListWriter::new()),
    };
    w.described(descriptor.0, fields);
}

fn decode_terminus(r: &mut ListReader<'_>) -> Result<Option<(u64, Option<String>)>, types::Error> {
    let Some((descriptor, mut fields)) = r.described_field()? else {
        return Ok(None);
    };
    let address = fields.string()?;
    Ok(Some((descriptor, address)))
}

impl Performative {
    pub(crate) fn decode(buf: &mut &[u8]) -> Result<Self, types::Error> {
        let (descriptor, mut r) = ListReader::described(buf)?;
        match Descriptor(descriptor) {
            Descriptor::OPEN => {
                let container_id = r.string()?.unwrap_or_default();
                let hostname = r.string()?;
                let max_frame_size = r.uint()?.unwrap_or(u32::MAX);
                let channel_max = r.ushort()?.unwrap_or(u16::MAX);
                let idle_time_out = r.uint()?;
                Ok(Self::Open(Open {
                    container_id,
                    hostname,
                    max_frame_size,
                    channel_max,
                    idle_time_out,
                }))
            }
            Descriptor::BEGIN => {
                let remote_channel = r.ushort()?;
                let next_outgoing_id = r
                    .uint()?
                    .ok_or(types::Error::Malformed("begin without next-outgoing-id"))?;
                let incoming_window = r
                    .uint()?
                    .ok_or(types::Error::Malformed("begin without incoming-window"))?;
                let outgoing_window = r
                    .uint()?
                    .ok_or(types::Error::Malformed("begin without outgoing-window"))?;
                let handle_max = r.uint()?.unwrap_or(u32::MAX);
                Ok(Self::Begin(Begin {
                    remote_channel,
                    next_outgoing_id,
                    incoming_window,
                    outgoing_window,
                    handle_max,
                }))
            }
            Descriptor::ATTACH => {
                let name = r
                    .string()?
                    .ok_or(types::Error::Malformed("attach without a name"))?;
                let handle = r
                    .uint()?
                    .ok_or(types::Error::Malformed("attach without a handle"))?;
                let role = match r.bool()?.unwrap_or(false) {
                    false => Role::Sender,
                    true => Role::Receiver,
                };
                let snd_settle_mode = match r.ubyte()?.unwrap_or(2) {
                    0 => SenderSettleMode::Unsettled,
                    1 => SenderSettleMode::Settled,
                    2 => SenderSettleMode::Mixed,
                    _ => return Err(types::Error::Malformed("invalid snd-settle-mode")),
                };
                let rcv_settle_mode = match r.ubyte()?.unwrap_or(0) {
                    0 => ReceiverSettleMode::First,
                    1 => ReceiverSettleMode::Second,
                    _ => return Err(types::Error::Malformed("invalid rcv-settle-mode")),
                };
                let source = decode_terminus(&mut r)?.map(|(_, address)| Source { address });
                let target = decode_terminus(&mut r)?.map(|(_, address)| Target { address });
                r.skip()?; // unsettled map
                r.skip()?; // incomplete-unsettled
                let initial_delivery_count = r.uint()?;
                Ok(Self::Attach(Attach {
                    name,
                    handle,
                    role,
                    snd_settle_mode,
                    rcv_settle_mode,
                    source,
                    target,
                    initial_delivery_count,
                }))
            }
            Descriptor::FLOW => {
                let next_incoming_id = r.uint()?;
                let incoming_window = r
                    .uint()?
                    .ok_or(types::Error::Malformed("flow without incoming-window"))?;
                let next_outgoing_id = r
                    .uint()?
                    .ok_or(types::Error::Malformed("flow without next-outgoing-id"))?;
                let outgoing_window = r
                    .uint()?
                    .ok_or(types::Error::Malformed("flow without outgoing-window"))?;
                let handle = r.uint()?;
                let delivery_count = r.uint()?;
                let link_credit = r.uint()?;
                r.skip()?; // available
                let drain = r.bool()?.unwrap_or(false);
                Ok(Self::Flow(Flow {
                    next_incoming_id,
                    incoming_window,
                    next_outgoing_id,
                    outgoing_window,
                    handle,
                    delivery_count,
                    link_credit,
                    drain,
                }))
            }
            Descriptor::TRANSFER => {
                let handle = r
                    .uint()?
                    .ok_or(types::Error::Malformed("transfer without a handle"))?;
                let delivery_id = r.uint()?;
                let delivery_tag = r.binary()?;
                let message_format = r.uint()?;
                let settled = r.bool()?;
                let more = r.bool()?.unwrap_or(false);
                Ok(Self::Transfer(Transfer {
                    handle,
                    delivery_id,
                    delivery_tag,
                    message_format,
                    settled,
                    more,
                }))
            }
            Descriptor::DISPOSITION => {
                let role = match r.bool()?.unwrap_or(false) {
                    false => Role::Sender,
                    true => Role::Receiver,
                };
                let first = r
                    .uint()?
                    .ok_or(types::Error::Malformed("disposition without first"))?;
                let last = r.uint()?;
                let settled = r.bool()?.unwrap_or(false);
                let state = match r.described_field()? {
                    None => None,
                    Some((descriptor, mut fields)) => {
                        Some(decode_state(descriptor, &mut fields)?)
                    }
                };
                Ok(Self::Disposition(Disposition {
                    role,
                    first,
                    last,
                    settled,
                    state,
                }))
            }
            Descriptor::DETACH => {
                let handle = r
                    .uint()?
                    .ok_or(types::Error::Malformed("detach without a handle"))?;
                let closed = r.bool()?.unwrap_or(false);
                let error = decode_error(&mut r)?;
                Ok(Self::Detach(Detach {
                    handle,
                    closed,
                    error,
                }))
            }
            Descriptor::END => Ok(Self::End(End {
                error: decode_error(&mut r)?,
            })),
            Descriptor::CLOSE => Ok(Self::Close(Close {
                error: decode_error(&mut r)?,
            })),
            _ => Err(types::Error::Malformed("unknown performative")),
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ListWriter::new();
        let descriptor = match self {
            Self::Open(x) => {
                w.string(&x.container_id);
                w.opt_string(x.hostname.as_deref());
                w.uint(x.max_frame_size);
                w.ushort(x.channel_max);
                w.opt_uint(x.idle_time_out);
                Descriptor::OPEN
            }
            Self::Begin(x) => {
                w.opt_ushort(x.remote_channel);
                w.uint(x.next_outgoing_id);
                w.uint(x.incoming_window);
                w.uint(x.outgoing_window);
                w.uint(x.handle_max);
                Descriptor::BEGIN
            }
            Self::Attach(x) => {
                w.string(&x.name);
                w.uint(x.handle);
                w.bool(x.role.is_receiver());
                w.ubyte(x.snd_settle_mode as u8);
                w.ubyte(x.rcv_settle_mode as u8);
                match &x.source {
                    None => w.null(),
                    Some(s) => {
                        let mut fields = ListWriter::new();
                        fields.opt_string(s.address.as_deref());
                        w.described(Descriptor::SOURCE.0, fields);
                    }
                }
                match &x.target {
                    None => w.null(),
                    Some(t) => {
                        let mut fields = ListWriter::new();
                        fields.opt_string(t.address.as_deref());
                        w.described(Descriptor::TARGET.0, fields);
                    }
                }
                w.null(); // unsettled
                w.null(); // incomplete-unsettled
                w.opt_uint(x.initial_delivery_count);
                Descriptor::ATTACH
            }
            Self::Flow(x) => {
                w.opt_uint(x.next_incoming_id);
                w.uint(x.incoming_window);
                w.uint(x.next_outgoing_id);
                w.uint(x.outgoing_window);
                w.opt_uint(x.handle);
                w.opt_uint(x.delivery_count);
                w.opt_uint(x.link_credit);
                w.null(); // available
                w.bool(x.drain);
                Descriptor::FLOW
            }
            Self::Transfer(x) => {
                w.uint(x.handle);
                w.opt_uint(x.delivery_id);
                w.opt_binary(x.delivery_tag.as_deref());
                w.opt_uint(x.message_format);
                w.opt_bool(x.settled);
                w.bool(x.more);
                Descriptor::TRANSFER
            }
            Self::Disposition(x) => {
                w.bool(x.role.is_receiver());
                w.uint(x.first);
                w.opt_uint(x.last);
                w.bool(x.settled);
                encode_state(&mut w, &x.state);
                Descriptor::DISPOSITION
            }
            Self::Detach(x) => {
                w.uint(x.handle);
                w.bool(x.closed);
                encode_error(&mut w, &x.error);
                Descriptor::DETACH
            }
            Self::End(x) => {
                encode_error(&mut w, &x.error);
                Descriptor::END
            }
            Self::Close(x) => {
                encode_error(&mut w, &x.error);
                Descriptor::CLOSE
            }
        };
        types::encode_described(descriptor.0, w, out);
    }
}

impl SaslBody {
    pub(crate) fn decode(buf: &mut &[u8]) -> Result<Self, types::Error> {
        let (descriptor, mut r) = ListReader::described(buf)?;
        match Descriptor(descriptor) {
            Descriptor::SASL_MECHANISMS => Ok(Self::Mechanisms(r.symbols()?)),
            Descriptor::SASL_INIT => {
                let mechanism = r
                    .symbol()?
                    .ok_or(types::Error::Malformed("sasl-init without a mechanism"))?;
                let initial_response = r.binary()?;
                let hostname = r.string()?;
                Ok(Self::Init {
                    mechanism,
                    initial_response,
                    hostname,
                })
            }
            Descriptor::SASL_CHALLENGE => Ok(Self::Challenge(
                r.binary()?
                    .ok_or(types::Error::Malformed("sasl-challenge without data"))?,
            )),
            Descriptor::SASL_RESPONSE => Ok(Self::Response(
                r.binary()?
                    .ok_or(types::Error::Malformed("sasl-response without data"))?,
            )),
            Descriptor::SASL_OUTCOME => {
                let code = r
                    .ubyte()?
                    .ok_or(types::Error::Malformed("sasl-outcome without a code"))?;
                let additional_data = r.binary()?;
                Ok(Self::Outcome {
                    code,
                    additional_data,
                })
            }
            _ => Err(types::Error::Malformed("unknown sasl frame body")),
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut w = ListWriter::new();
        let descriptor = match self {
            Self::Mechanisms(mechs) => {
                w.symbols(mechs);
                Descriptor::SASL_MECHANISMS
            }
            Self::Init {
                mechanism,
                initial_response,
                hostname,
            } => {
                w.symbol(mechanism);
                w.opt_binary(initial_response.as_deref());
                w.opt_string(hostname.as_deref());
                Descriptor::SASL_INIT
            }
            Self::Challenge(data) => {
                w.binary(data);
                Descriptor::SASL_CHALLENGE
            }
            Self::Response(data) => {
                w.binary(data);
                Descriptor::SASL_RESPONSE
            }
            Self::Outcome {
                code,
                additional_data,
            } => {
                w.ubyte(*code);
                w.opt_binary(additional_data.as_deref());
                Descriptor::SASL_OUTCOME
            }
        };
        types::encode_described(descriptor.0, w, out);
    }
}

/// Attempt to decode one frame from the front of `buf`
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame; no
/// input is consumed in that case. On success the frame and the number of
/// bytes it occupied are returned.
pub fn decode(buf: &[u8], max_frame_size: u32) -> Result<Option<(Frame, usize)>, Malformed> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if size < FRAME_HEADER_SIZE as u32 || size > max_frame_size {
        return Err(Malformed::InvalidSize {
            size,
            max: max_frame_size,
        });
    }
    if buf.len() < size as usize {
        return Ok(None);
    }
    let doff = buf[4];
    let body_start = doff as usize * 4;
    if body_start < FRAME_HEADER_SIZE || body_start > size as usize {
        return Err(Malformed::InvalidDoff { doff });
    }
    let frame_type = buf[5];
    let channel = u16::from_be_bytes([buf[6], buf[7]]);
    let mut body = &buf[body_start..size as usize];
    let frame = match frame_type {
        AMQP_FRAME_TYPE => {
            if body.is_empty() {
                Frame {
                    channel,
                    body: Body::Amqp(None),
                    payload: Bytes::new(),
                }
            } else {
                let performative = Performative::decode(&mut body)?;
                Frame {
                    channel,
                    body: Body::Amqp(Some(performative)),
                    payload: Bytes::copy_from_slice(body),
                }
            }
        }
        SASL_FRAME_TYPE => {
            if body.is_empty() {
                return Err(Malformed::Body(types::Error::Malformed(
                    "empty sasl frame",
                )));
            }
            let sasl = SaslBody::decode(&mut body)?;
            Frame {
                channel,
                body: Body::Sasl(sasl),
                payload: Bytes::new(),
            }
        }
        other => return Err(Malformed::UnknownType(other)),
    };
    Ok(Some((frame, size as usize)))
}

/// Encode `frame`, bounded by the negotiated max-frame-size
pub fn encode(frame: &Frame, max_frame_size: u32) -> Result<Vec<u8>, WouldOverflow> {
    let mut body = Vec::new();
    let frame_type = match &frame.body {
        Body::Amqp(None) => AMQP_FRAME_TYPE,
        Body::Amqp(Some(performative)) => {
            performative.encode(&mut body);
            AMQP_FRAME_TYPE
        }
        Body::Sasl(sasl) => {
            sasl.encode(&mut body);
            SASL_FRAME_TYPE
        }
    };
    let size = FRAME_HEADER_SIZE + body.len() + frame.payload.len();
    if size > max_frame_size as usize {
        let payload_fit = (max_frame_size as usize).saturating_sub(FRAME_HEADER_SIZE + body.len());
        return Err(WouldOverflow {
            max_frame_size,
            payload_fit,
        });
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(size as u32).to_be_bytes());
    out.push(2); // doff: no extended header
    out.push(frame_type);
    out.extend_from_slice(&frame.channel.to_be_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&frame.payload);
    Ok(out)
}
