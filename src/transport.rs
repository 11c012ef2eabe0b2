//! Byte-level engine binding a [`Connection`] to a pair of buffers
//!
//! The transport owns the input and output byte streams for one peer. The
//! caller moves bytes between these buffers and its socket (or test
//! harness) and calls [`Transport::tick`] with the current time; everything
//! else, from the protocol header handshake through SASL and the frame
//! loop, happens inside [`Transport::process_input`] and the output
//! accessors. No call blocks and no call performs I/O.

use std::time::Instant;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::condition::{Condition, ErrorCondition};
use crate::connection::{Connection, WriteOpts};
use crate::frame::{self, Body, Frame, Malformed};
use crate::sasl::{Sasl, SaslCode};
use crate::timer::{Timer, TimerTable};
use crate::{
    EndpointState, TransportConfig, AMQP_HEADER, MIN_MAX_FRAME_SIZE, SASL_HEADER,
};

/// Reasons a transport stops exchanging bytes
///
/// All of these are terminal for the instance; the connection's local state
/// and error condition record what happened for the application, and a
/// Close frame is queued for the peer where the protocol still allows one.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The input stream contained an undecodable frame
    #[error("malformed input: {0}")]
    Malformed(#[from] Malformed),
    /// The first 8 input bytes were not the expected protocol header
    #[error("unexpected protocol header")]
    InvalidHeader,
    /// The peer violated protocol sequencing rules
    #[error("protocol violation: {0}")]
    Violation(ErrorCondition),
    /// The input stream ended while the remote connection was still open
    #[error("end of stream before the remote connection closed")]
    UnexpectedEos,
    /// SASL negotiation concluded without success
    #[error("sasl negotiation failed: {0:?}")]
    SaslRejected(SaslCode),
    /// The transport already failed and cannot be used further
    #[error("transport is no longer usable")]
    Closed,
}

/// What the next chunk of input bytes is expected to be
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum InputPhase {
    SaslHeader,
    Sasl,
    AmqpHeader,
    Amqp,
}

/// Sans-IO transport engine for a single peer
///
/// Input side: append bytes with [`fill_input`](Self::fill_input), then
/// interpret them with [`process_input`](Self::process_input). Output side:
/// inspect with [`pending`](Self::pending)/[`head`](Self::head) and drain
/// with [`pop`](Self::pop), or use the
/// [`output_buffer`](Self::output_buffer)/
/// [`output_consumed`](Self::output_consumed) handoff pair. The visible
/// output window never exceeds the configured max-frame-size per drain, so
/// a caller with a fixed-size scratch buffer always makes progress.
pub struct Transport {
    config: TransportConfig,
    connection: Option<Connection>,
    sasl: Option<Sasl>,
    input_phase: InputPhase,
    input: BytesMut,
    out: BytesMut,
    header_sent: bool,
    amqp_header_sent: bool,
    processing_started: bool,
    handling_frames: bool,
    dead: bool,
    head_closed: bool,
    tail_closed: bool,
    lent: usize,
    bytes_input: u64,
    bytes_output: u64,
    last_bytes_input: u64,
    last_bytes_output: u64,
    timers: TimerTable,
}

impl Transport {
    /// Create a transport in plain AMQP mode
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            connection: None,
            sasl: None,
            input_phase: InputPhase::AmqpHeader,
            input: BytesMut::new(),
            out: BytesMut::new(),
            header_sent: false,
            amqp_header_sent: false,
            processing_started: false,
            handling_frames: true,
            dead: false,
            head_closed: false,
            tail_closed: false,
            lent: 0,
            bytes_input: 0,
            bytes_output: 0,
            last_bytes_input: 0,
            last_bytes_output: 0,
            timers: TimerTable::default(),
        }
    }

    /// Layer client-side SASL in front of the AMQP handshake
    ///
    /// # Panics
    ///
    /// Panics if any input or output has already been processed; SASL must
    /// come first on the wire.
    pub fn sasl_client(&mut self) -> &mut Sasl {
        self.install_sasl(Sasl::client())
    }

    /// Layer server-side SASL in front of the AMQP handshake
    ///
    /// # Panics
    ///
    /// Panics if any input or output has already been processed.
    pub fn sasl_server(&mut self) -> &mut Sasl {
        self.install_sasl(Sasl::server())
    }

    fn install_sasl(&mut self, sasl: Sasl) -> &mut Sasl {
        assert!(
            !self.processing_started,
            "cannot initiate sasl after the transport started processing"
        );
        assert!(self.sasl.is_none(), "sasl already initiated");
        self.input_phase = InputPhase::SaslHeader;
        self.sasl.insert(sasl)
    }

    /// The SASL negotiator, if one was installed
    pub fn sasl(&mut self) -> Option<&mut Sasl> {
        self.sasl.as_mut()
    }

    /// Associate a connection endpoint with this transport
    ///
    /// Binding may happen before or after processing starts; frames that
    /// arrive while unbound terminate frame handling instead.
    pub fn bind(&mut self, mut connection: Connection) {
        connection.set_session_window(self.config.session_window);
        connection.set_channel_max(self.config.channel_max);
        self.connection = Some(connection);
    }

    /// Detach and return the bound connection, if any
    ///
    /// A frame arriving after unbind terminates frame handling.
    pub fn unbind(&mut self) -> Option<Connection> {
        self.connection.take()
    }

    /// The bound connection
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// The bound connection, mutably; this is the handle for all local
    /// endpoint API calls
    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    /// Whether incoming frames are still being interpreted
    ///
    /// Turns false on any terminal condition: a malformed frame, a protocol
    /// violation, a frame arriving after the remote Close, or a frame
    /// arriving while unbound.
    pub fn is_handling_frames(&self) -> bool {
        self.handling_frames
    }

    /// Whether the transport hit a terminal error
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    // ===== input side =====

    /// Append raw bytes from the peer; interpretation waits for
    /// [`process_input`](Self::process_input)
    pub fn fill_input(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
        self.bytes_input += bytes.len() as u64;
    }

    /// Interpret everything appended so far
    ///
    /// Frames are dispatched to the SASL negotiator or the bound
    /// connection; partial frames stay buffered for the next call. Calling
    /// with nothing new appended is a no-op, never an error.
    pub fn process_input(&mut self) -> Result<(), TransportError> {
        if self.dead {
            return Err(TransportError::Closed);
        }
        self.processing_started = true;
        loop {
            match self.input_phase {
                InputPhase::SaslHeader | InputPhase::AmqpHeader => {
                    if self.input.len() < 8 {
                        break;
                    }
                    let expected = match self.input_phase {
                        InputPhase::SaslHeader => SASL_HEADER,
                        _ => AMQP_HEADER,
                    };
                    if self.input[..8] != expected {
                        warn!(got = ?&self.input[..8], "bad protocol header");
                        self.fail(ErrorCondition::new(
                            Condition::DECODE_ERROR,
                            "unexpected protocol header",
                        ));
                        return Err(TransportError::InvalidHeader);
                    }
                    trace!("protocol header received");
                    self.input.advance(8);
                    self.input_phase = match self.input_phase {
                        InputPhase::SaslHeader => InputPhase::Sasl,
                        _ => InputPhase::Amqp,
                    };
                }
                InputPhase::Sasl => {
                    // The application may have concluded the exchange (a
                    // server's `done`) since the last call
                    if self
                        .sasl
                        .as_ref()
                        .is_some_and(|sasl| sasl.is_done() && sasl.outcome() == Some(SaslCode::Ok))
                    {
                        self.input_phase = InputPhase::AmqpHeader;
                        continue;
                    }
                    let (frame, consumed) =
                        match frame::decode(&self.input, self.config.max_frame_size) {
                            Ok(Some(decoded)) => decoded,
                            Ok(None) => break,
                            Err(malformed) => {
                                self.fail(ErrorCondition::new(
                                    Condition::FRAMING_ERROR,
                                    malformed.to_string(),
                                ));
                                return Err(malformed.into());
                            }
                        };
                    self.input.advance(consumed);
                    let Body::Sasl(body) = frame.body else {
                        let error = ErrorCondition::new(
                            Condition::ILLEGAL_STATE,
                            "amqp frame during sasl negotiation",
                        );
                        self.fail(error.clone());
                        return Err(TransportError::Violation(error));
                    };
                    let sasl = self.sasl.as_mut().expect("sasl phase without negotiator");
                    if let Err(error) = sasl.handle(body) {
                        self.fail(error.clone());
                        return Err(TransportError::Violation(error));
                    }
                    if sasl.is_done() {
                        match sasl.outcome() {
                            Some(SaslCode::Ok) | None => {
                                debug!("sasl complete");
                                self.input_phase = InputPhase::AmqpHeader;
                            }
                            Some(code) => {
                                self.dead = true;
                                self.handling_frames = false;
                                return Err(TransportError::SaslRejected(code));
                            }
                        }
                    }
                }
                InputPhase::Amqp => {
                    if !self.handling_frames {
                        // Terminal: whatever follows is never interpreted
                        self.input.clear();
                        break;
                    }
                    let (frame, consumed) =
                        match frame::decode(&self.input, self.config.max_frame_size) {
                            Ok(Some(decoded)) => decoded,
                            Ok(None) => break,
                            Err(malformed) => {
                                self.fail(ErrorCondition::new(
                                    Condition::FRAMING_ERROR,
                                    malformed.to_string(),
                                ));
                                return Err(malformed.into());
                            }
                        };
                    self.input.advance(consumed);
                    self.handle_frame(frame)?;
                }
            }
        }
        Ok(())
    }

    /// Dispatch one already-decoded frame
    ///
    /// Exposed for driving the transport above the byte level; the input
    /// loop uses the same path.
    ///
    /// # Panics
    ///
    /// Panics if called when [`is_handling_frames`](Self::is_handling_frames)
    /// is false; that is a caller bug, not a wire condition.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        assert!(
            self.handling_frames,
            "frame handled while the transport is not handling frames"
        );
        let Some(connection) = self.connection.as_mut() else {
            warn!("frame received while unbound");
            self.handling_frames = false;
            return Ok(());
        };
        let Body::Amqp(performative) = frame.body else {
            let error =
                ErrorCondition::new(Condition::ILLEGAL_STATE, "sasl frame after negotiation");
            self.fail(error.clone());
            return Err(TransportError::Violation(error));
        };
        let Some(performative) = performative else {
            // Empty keep-alive; its bytes already fed the idle tracking
            return Ok(());
        };
        if connection.remote_state() == EndpointState::Closed {
            warn!(
                performative = performative.name(),
                "frame after close discarded"
            );
            self.handling_frames = false;
            return Ok(());
        }
        if let Err(error) = connection.handle_performative(frame.channel, performative, frame.payload)
        {
            self.fail(error.clone());
            return Err(TransportError::Violation(error));
        }
        Ok(())
    }

    /// Legacy combined entry point: append and interpret in one call
    ///
    /// An empty slice signals end-of-stream, which is only legal once the
    /// remote connection is known closed; otherwise the transport dies.
    pub fn input(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if self.dead {
            return Err(TransportError::Closed);
        }
        if bytes.is_empty() {
            self.close_tail()?;
            return Ok(0);
        }
        self.fill_input(bytes);
        self.process_input()?;
        Ok(bytes.len())
    }

    /// Signal that the input stream reached end-of-stream
    ///
    /// Legal only after the remote Close was processed; a stream that ends
    /// earlier was aborted, which is fatal.
    pub fn close_tail(&mut self) -> Result<(), TransportError> {
        self.tail_closed = true;
        let remote_closed = self
            .connection
            .as_ref()
            .is_some_and(|c| c.remote_state() == EndpointState::Closed);
        if remote_closed {
            return Ok(());
        }
        warn!("input stream ended while the remote connection was open");
        self.fail(ErrorCondition::new(
            Condition::FRAMING_ERROR,
            "connection aborted",
        ));
        Err(TransportError::UnexpectedEos)
    }

    /// Signal that no further output will be drained; pending output is
    /// discarded
    pub fn close_head(&mut self) {
        self.head_closed = true;
        self.out.clear();
    }

    // ===== output side =====

    /// Bytes currently available to drain, capped at max-frame-size
    ///
    /// The cap means a single oversized backlog is surfaced in successive
    /// windows; drain and call again.
    pub fn pending(&mut self) -> usize {
        self.pump();
        self.window()
    }

    /// The drainable byte window; stable until [`pop`](Self::pop)
    pub fn head(&self) -> &[u8] {
        &self.out[..self.window()]
    }

    /// Discard `n` drained bytes from the front of the output stream
    pub fn pop(&mut self, n: usize) {
        assert!(n <= self.window(), "popped more than the visible window");
        self.out.advance(n);
        self.bytes_output += n as u64;
    }

    /// Acquire the output window for draining; pair with
    /// [`output_consumed`](Self::output_consumed)
    pub fn output_buffer(&mut self) -> &[u8] {
        self.pump();
        self.lent = self.window();
        &self.out[..self.lent]
    }

    /// Report that the slice from the last
    /// [`output_buffer`](Self::output_buffer) call was fully drained
    pub fn output_consumed(&mut self) {
        let lent = std::mem::take(&mut self.lent);
        self.pop(lent);
    }

    fn window(&self) -> usize {
        self.out.len().min(self.config.max_frame_size as usize)
    }

    /// Run one full engine step: interpret buffered input, then refresh
    /// the output backlog
    pub fn process(&mut self) -> Result<(), TransportError> {
        self.process_input()?;
        self.pump();
        Ok(())
    }

    /// Move everything the endpoints want to say into the output backlog
    fn pump(&mut self) {
        if self.head_closed {
            return;
        }
        self.processing_started = true;
        if !self.header_sent {
            self.header_sent = true;
            let header = match self.sasl {
                Some(_) => SASL_HEADER,
                None => AMQP_HEADER,
            };
            self.out.extend_from_slice(&header);
        }
        if let Some(sasl) = &mut self.sasl {
            while let Some(frame) = sasl.poll_frame() {
                match frame::encode(&frame, u32::MAX) {
                    Ok(bytes) => self.out.extend_from_slice(&bytes),
                    Err(overflow) => warn!(?overflow, "dropping unencodable sasl frame"),
                }
            }
            if !sasl.is_done() || sasl.outcome().is_some_and(|code| code != SaslCode::Ok) {
                return;
            }
            if !self.amqp_header_sent {
                self.amqp_header_sent = true;
                self.out.extend_from_slice(&AMQP_HEADER);
            }
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let opts = WriteOpts {
            local_max_frame_size: self.config.max_frame_size,
            outgoing_max_frame_size: connection
                .remote_max_frame_size()
                .min(self.config.max_frame_size)
                .max(MIN_MAX_FRAME_SIZE),
            channel_max: self.config.channel_max,
            idle_time_out: self
                .config
                .idle_timeout
                .map(|timeout| (timeout.as_millis() / 2) as u32),
        };
        while let Some(frame) = connection.poll_frame(&opts) {
            match frame::encode(&frame, opts.outgoing_max_frame_size) {
                Ok(bytes) => self.out.extend_from_slice(&bytes),
                Err(overflow) => {
                    // Only reachable when a control performative alone
                    // exceeds the peer's max-frame-size
                    warn!(?overflow, "frame exceeds the peer's max-frame-size");
                    connection.force_close(ErrorCondition::new(
                        Condition::INTERNAL_ERROR,
                        "frame exceeds the negotiated max-frame-size",
                    ));
                    break;
                }
            }
        }
    }

    // ===== liveness =====

    /// Advance idle-timeout tracking to `now`
    ///
    /// Emits an empty keep-alive frame every half remote-declared idle
    /// interval of output silence, and forces the connection closed after a
    /// full locally configured interval of input silence. Returns the next
    /// instant by which the caller must tick again, if any timeout is in
    /// play. Re-ticking without time advancing changes nothing.
    pub fn tick(&mut self, now: Instant) -> Option<Instant> {
        self.pump();
        if let Some(timeout) = self.config.idle_timeout {
            match self.timers[Timer::LocalIdle] {
                Some(deadline) if self.last_bytes_input == self.bytes_input => {
                    if deadline <= now {
                        self.timers.set(Timer::LocalIdle, now + timeout);
                        self.expire_local_idle();
                    }
                }
                // First tick, or input arrived since the last one
                _ => {
                    self.timers.set(Timer::LocalIdle, now + timeout);
                    self.last_bytes_input = self.bytes_input;
                }
            }
        }
        let remote = self
            .connection
            .as_ref()
            .and_then(|c| c.remote_idle_timeout())
            .filter(|_| !self.head_closed);
        match remote {
            Some(timeout) => {
                let half = timeout / 2;
                match self.timers[Timer::KeepAlive] {
                    Some(deadline) if self.last_bytes_output == self.bytes_output => {
                        if deadline <= now {
                            self.timers.set(Timer::KeepAlive, now + half);
                            if self.out.is_empty() {
                                trace!("keep-alive");
                                let bytes = frame::encode(&Frame::keepalive(), u32::MAX)
                                    .expect("keep-alive frames are 8 bytes");
                                // Pre-credit the drain so the keep-alive
                                // itself does not count as fresh activity
                                self.last_bytes_output =
                                    self.bytes_output + bytes.len() as u64;
                                self.out.extend_from_slice(&bytes);
                            }
                        }
                    }
                    // First tick, or output drained since the last one
                    _ => {
                        self.timers.set(Timer::KeepAlive, now + half);
                        self.last_bytes_output = self.bytes_output;
                    }
                }
            }
            None => self.timers.stop(Timer::KeepAlive),
        }
        self.timers.next_timeout()
    }

    fn expire_local_idle(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        if connection.state() != EndpointState::Closed {
            warn!("local idle timeout expired");
            connection.force_close(ErrorCondition::new(
                Condition::RESOURCE_LIMIT_EXCEEDED,
                "local-idle-timeout expired",
            ));
            self.pump();
        }
    }

    /// Terminal wire fault: record the condition, close toward the peer,
    /// stop interpreting frames
    fn fail(&mut self, error: ErrorCondition) {
        self.handling_frames = false;
        self.dead = true;
        self.input.clear();
        if let Some(connection) = self.connection.as_mut() {
            connection.force_close(error);
        }
        self.pump();
    }
}
