use std::time::{Duration, Instant};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Liveness bookkeeping for the live connection.
///
/// Any inbound frame counts as proof of life, not only heartbeats.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_inbound: Instant,
    last_sent: Instant,
}

impl HeartbeatMonitor {
    pub fn new(now: Instant) -> Self {
        Self::with_timing(HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT, now)
    }

    pub fn with_timing(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            last_inbound: now,
            last_sent: now,
        }
    }

    /// Restarts both clocks, used when a new socket is adopted.
    pub fn reset(&mut self, now: Instant) {
        self.last_inbound = now;
        self.last_sent = now;
    }

    pub fn record_inbound(&mut self, at: Instant) {
        if at > self.last_inbound {
            self.last_inbound = at;
        }
    }

    pub fn record_sent(&mut self, at: Instant) {
        self.last_sent = at;
    }

    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sent) >= self.interval
    }

    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_inbound)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.silence(now) > self.timeout
    }
}
