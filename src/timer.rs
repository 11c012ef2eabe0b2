use std::ops::{Index, IndexMut};
use std::time::Instant;

/// Kinds of timeouts needed to run the protocol logic
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When to send an empty frame to prove liveness to the peer
    KeepAlive = 0,
    /// When to declare the peer dead after receiving nothing
    LocalIdle = 1,
}

/// A table of deadlines for each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 2],
}

impl TimerTable {
    pub fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    /// The earliest armed deadline, if any
    pub fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }
}

impl Index<Timer> for TimerTable {
    type Output = Option<Instant>;
    fn index(&self, index: Timer) -> &Self::Output {
        &self.data[index as usize]
    }
}

impl IndexMut<Timer> for TimerTable {
    fn index_mut(&mut self, index: Timer) -> &mut Self::Output {
        &mut self.data[index as usize]
    }
}
