use std::time::Instant;

/// Kinds of timeouts needed to run the transport logic
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When to abandon an in-progress TCP connect
    Connect = 0,
    /// When to abandon a handshake that got no valid response
    Handshake = 1,
    /// When to send the next heartbeat probe and check liveness
    Heartbeat = 2,
    /// When to next scan resp-pending items for expired deadlines
    CheckTimeout = 3,
    /// When to start the next reconnect attempt
    Reconnect = 4,
}

impl Timer {
    pub(crate) const VALUES: [Self; 5] = [
        Self::Connect,
        Self::Handshake,
        Self::Heartbeat,
        Self::CheckTimeout,
        Self::Reconnect,
    ];
}

/// A table of deadlines for each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 5],
}

impl TimerTable {
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    pub(crate) fn stop_all(&mut self) {
        self.data = Default::default();
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    pub(crate) fn is_expired(&self, timer: Timer, now: Instant) -> bool {
        self.data[timer as usize].map_or(false, |x| x <= now)
    }
}
