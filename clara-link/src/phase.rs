//! Connection phase state machine.
//!
//! The phase is the coarse connectivity status shown to the UI. It is kept
//! per endpoint and outlives both individual sockets and individual
//! subscribers.

use serde::Serialize;

/// Connectivity status exposed to the UI.
///
/// `Connected` and `Offline` are the stable phases; the other two are
/// transient and are escalated to `Offline` by the grace and debounce timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    InitialConnecting,
    Connected,
    Reconnecting,
    Offline,
}

impl Phase {
    pub fn is_connected(self) -> bool {
        self == Phase::Connected
    }

    pub fn is_stable(self) -> bool {
        matches!(self, Phase::Connected | Phase::Offline)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::InitialConnecting => "initial_connecting",
            Phase::Connected => "connected",
            Phase::Reconnecting => "reconnecting",
            Phase::Offline => "offline",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseInput {
    /// A connection attempt is starting because of a new subscriber or a
    /// user retry. `resumed` is true when the endpoint has connected before.
    Attempt { resumed: bool },
    /// The socket opened.
    Opened,
    /// The socket closed or could not be constructed.
    Closed,
    /// The one-shot grace timer fired.
    GraceElapsed,
    /// The reconnect debounce timer fired.
    DebounceElapsed,
}

#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: Phase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: Phase::InitialConnecting,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Apply an input. Returns the new phase only if it actually changed, so
    /// callers notify subscribers exactly once per transition.
    pub fn apply(&mut self, input: PhaseInput) -> Option<Phase> {
        let next = transition(self.phase, input);
        if next == self.phase {
            return None;
        }
        self.phase = next;
        Some(next)
    }
}

/// The transition table.
///
/// A close only demotes `Connected`: while connecting, reconnecting or
/// offline, a further failed attempt leaves the phase alone so the UI does
/// not flap between `reconnecting` and `offline` on every retry.
pub fn transition(from: Phase, input: PhaseInput) -> Phase {
    use Phase::*;
    match (from, input) {
        (_, PhaseInput::Opened) => Connected,
        (_, PhaseInput::Attempt { resumed: true }) => Reconnecting,
        (_, PhaseInput::Attempt { resumed: false }) => InitialConnecting,
        (Connected, PhaseInput::Closed) => Reconnecting,
        (InitialConnecting, PhaseInput::GraceElapsed) => Offline,
        (Reconnecting, PhaseInput::DebounceElapsed) => Offline,
        (phase, _) => phase,
    }
}
