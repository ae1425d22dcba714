//! Events delivered to the connection manager through its single intake.

use std::fmt;

use crate::endpoint::Endpoint;

/// Identifies one socket over the lifetime of the process. Never reused, so
/// events from a socket that has since been replaced are recognisably stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifies one subscriber registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// One-shot escalation to offline for an endpoint that never connected.
    Grace,
    /// Escalation to offline after a close, cancelled by a reopen.
    Debounce,
    /// Next connection attempt.
    Reconnect,
    /// Teardown of an endpoint nobody is subscribed to.
    Idle,
}

/// A scheduled timer. `token` tells a live timer apart from one that was
/// cancelled or superseded but fired anyway.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub endpoint: Endpoint,
    pub kind: TimerKind,
    pub token: u64,
}

/// Everything that can happen to the manager besides direct API calls.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Opened { conn: ConnId },
    FrameReceived { conn: ConnId, text: String },
    Closed { conn: ConnId, reason: String },
    ConstructionFailed { conn: ConnId, error: String },
    TimerFired { key: TimerKey },
}
