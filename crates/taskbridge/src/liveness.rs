//! Heartbeat bookkeeping and reconnect-attempt counting
//!
//! Liveness here is observational: missed heartbeats never close the
//! connection, and the bridge never dials the peer. After a disconnect the
//! bridge counts reconnect windows until the peer comes back or the budget
//! runs out.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result of counting one reconnect window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Still within budget
    Waiting {
        /// Windows counted so far
        attempt: u32,
        /// Budget
        max: u32,
    },
    /// Budget exceeded; reported exactly once per outage
    Exhausted {
        /// Windows counted
        attempts: u32,
    },
    /// Budget was already exceeded earlier in this outage
    AlreadyLost,
}

/// Heartbeat and reconnect state for the single peer
#[derive(Debug)]
pub struct LivenessMonitor {
    heartbeat_interval: Duration,
    max_reconnect_attempts: u32,
    reconnect_attempts: u32,
    lost: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    last_heartbeat_ack: Option<DateTime<Utc>>,
    connected_since: Option<DateTime<Utc>>,
}

impl LivenessMonitor {
    /// Create a monitor
    pub fn new(heartbeat_interval: Duration, max_reconnect_attempts: u32) -> Self {
        Self {
            heartbeat_interval,
            max_reconnect_attempts,
            reconnect_attempts: 0,
            lost: false,
            last_heartbeat: None,
            last_heartbeat_ack: None,
            connected_since: None,
        }
    }

    /// A peer attached; the reconnect budget is restored
    pub fn on_connected(&mut self, now: DateTime<Utc>) {
        self.reconnect_attempts = 0;
        self.lost = false;
        self.connected_since = Some(now);
        self.last_heartbeat = None;
        self.last_heartbeat_ack = None;
    }

    /// The peer detached
    pub fn on_disconnected(&mut self) {
        self.connected_since = None;
    }

    /// Count one reconnect window without a peer
    pub fn record_reconnect_attempt(&mut self) -> ReconnectOutcome {
        if self.lost {
            return ReconnectOutcome::AlreadyLost;
        }

        self.reconnect_attempts += 1;
        if self.reconnect_attempts > self.max_reconnect_attempts {
            self.lost = true;
            ReconnectOutcome::Exhausted {
                attempts: self.reconnect_attempts,
            }
        } else {
            ReconnectOutcome::Waiting {
                attempt: self.reconnect_attempts,
                max: self.max_reconnect_attempts,
            }
        }
    }

    /// The peer sent a heartbeat
    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
    }

    /// The peer answered one of our heartbeats
    pub fn record_heartbeat_ack(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat_ack = Some(now);
    }

    /// Interval between outgoing heartbeats
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Reconnect windows counted in the current outage
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Whether the reconnect budget ran out
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// Last heartbeat received from the peer
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    /// Last heartbeat response received from the peer
    pub fn last_heartbeat_ack(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_ack
    }

    /// When the current peer attached
    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.connected_since
    }
}
