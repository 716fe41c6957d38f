use std::fmt;
use std::time::Duration;

/// Parameters governing the transport state machine
///
/// Defaults suit an interactive client on an internet path: generous connect
/// and handshake timeouts, a bounded exponential reconnect backoff, and a
/// small preallocated write-item pool sized for bursts of a dozen-odd
/// concurrent requests.
pub struct TransportConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) heartbeat_timeout_factor: u32,
    pub(crate) reconnect_max_attempts: Option<u32>,
    pub(crate) reconnect_delay_base: Duration,
    pub(crate) reconnect_delay_max: Duration,
    pub(crate) pool_slots: usize,
    pub(crate) send_retry_limit: u32,
    pub(crate) timeout_check_interval: Duration,
}

impl TransportConfig {
    /// Time allowed for the raw TCP connect before the attempt is abandoned
    pub fn connect_timeout(&mut self, value: Duration) -> &mut Self {
        self.connect_timeout = value;
        self
    }

    /// Time allowed between TCP establishment and a valid handshake response
    pub fn handshake_timeout(&mut self, value: Duration) -> &mut Self {
        self.handshake_timeout = value;
        self
    }

    /// Multiple of the negotiated heartbeat interval after which a silent
    /// connection is declared dead
    ///
    /// Applies to packets of any kind, not just heartbeats. Must be at
    /// least 2 for a single delayed heartbeat not to kill the connection.
    pub fn heartbeat_timeout_factor(&mut self, value: u32) -> &mut Self {
        self.heartbeat_timeout_factor = value;
        self
    }

    /// Consecutive failed connection attempts to tolerate before giving up
    ///
    /// `None` retries forever. The counter resets every time a handshake
    /// completes.
    pub fn reconnect_max_attempts(&mut self, value: Option<u32>) -> &mut Self {
        self.reconnect_max_attempts = value;
        self
    }

    /// First reconnect delay; doubled on each further failed attempt
    pub fn reconnect_delay_base(&mut self, value: Duration) -> &mut Self {
        self.reconnect_delay_base = value;
        self
    }

    /// Upper bound on the reconnect delay
    pub fn reconnect_delay_max(&mut self, value: Duration) -> &mut Self {
        self.reconnect_delay_max = value;
        self
    }

    /// Number of preallocated write-item slots
    ///
    /// Sends beyond this many in flight fall back to heap allocation; they
    /// still work, they just cost an allocation each.
    pub fn pool_slots(&mut self, value: usize) -> &mut Self {
        self.pool_slots = value;
        self
    }

    /// How many reconnect cycles a written-but-unanswered request survives
    ///
    /// With the default of 0, a failure-driven disconnect fails every
    /// request that was already written with a timeout error. A value of
    /// `n` instead replays such requests across up to `n` reconnect cycles
    /// before failing them. Requests that were queued but never written are
    /// always preserved until an explicit disconnect or shutdown.
    pub fn send_retry_limit(&mut self, value: u32) -> &mut Self {
        self.send_retry_limit = value;
        self
    }

    /// Period of the scan that expires requests whose response deadline passed
    pub fn timeout_check_interval(&mut self, value: Duration) -> &mut Self {
        self.timeout_check_interval = value;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_timeout_factor: 2,
            reconnect_max_attempts: Some(10),
            reconnect_delay_base: Duration::from_secs(2),
            reconnect_delay_max: Duration::from_secs(30),
            pool_slots: 16,
            send_retry_limit: 0,
            timeout_check_interval: Duration::from_secs(1),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("heartbeat_timeout_factor", &self.heartbeat_timeout_factor)
            .field("reconnect_max_attempts", &self.reconnect_max_attempts)
            .field("reconnect_delay_base", &self.reconnect_delay_base)
            .field("reconnect_delay_max", &self.reconnect_delay_max)
            .field("pool_slots", &self.pool_slots)
            .field("send_retry_limit", &self.send_retry_limit)
            .field("timeout_check_interval", &self.timeout_check_interval)
            .finish()
    }
}
