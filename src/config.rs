//! Transport configuration

use std::fmt;
use std::time::Duration;

use crate::MIN_MAX_FRAME_SIZE;

/// Parameters governing one [`Transport`](crate::Transport) instance
///
/// Defaults are suitable for a broker-facing client; constrained callers
/// mainly lower `max_frame_size`.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) max_frame_size: u32,
    pub(crate) channel_max: u16,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) session_window: u32,
}

impl TransportConfig {
    /// Largest frame this transport will accept, advertised in Open
    ///
    /// Also bounds the slice handed out by a single `output_buffer` call.
    ///
    /// # Panics
    ///
    /// If `value` is below [`MIN_MAX_FRAME_SIZE`].
    pub fn max_frame_size(&mut self, value: u32) -> &mut Self {
        assert!(
            value >= MIN_MAX_FRAME_SIZE,
            "max_frame_size must be at least {MIN_MAX_FRAME_SIZE}"
        );
        self.max_frame_size = value;
        self
    }

    /// Highest channel number sessions may occupy, advertised in Open
    pub fn channel_max(&mut self, value: u16) -> &mut Self {
        self.channel_max = value;
        self
    }

    /// Silence interval after which the peer is presumed dead
    ///
    /// Half this value is advertised to the peer as our idle-time-out, so a
    /// live peer keep-alives well inside the enforcement window.
    pub fn idle_timeout(&mut self, value: Option<Duration>) -> &mut Self {
        self.idle_timeout = value;
        self
    }

    /// Incoming-window advertised for each session, in frames
    pub fn session_window(&mut self, value: u32) -> &mut Self {
        self.session_window = value;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
            channel_max: u16::MAX,
            idle_timeout: None,
            session_window: 2048,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("max_frame_size", &self.max_frame_size)
            .field("channel_max", &self.channel_max)
            .field("idle_timeout", &self.idle_timeout)
            .field("session_window", &self.session_window)
            .finish()
    }
}
