//! Events written to stdout, one JSON envelope per line.

use clara_link::{AppState, Payload, Phase, SessionView};
use serde::Serialize;
use serde_json::Value;

/// What the kiosk reports on stdout. A consumer dispatches on `type`;
/// `data` holds the fields of that variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    PhaseChanged { phase: Phase, is_connected: bool },
    StateChanged { state: AppState, payload: Payload },
    SendFailed { message: Value, phase: Phase },
    Notice { text: String },
}

/// Current envelope layout. Bumped when a consumer has to change.
pub const ENVELOPE_VERSION: u32 = 1;

/// One stdout line. `seq` starts at 1 and never repeats within a process, so
/// a consumer tailing the stream can spot dropped lines.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub version: u32,
    pub seq: u64,
    /// Wall-clock UTC, in milliseconds.
    pub timestamp_ms: i64,
    pub event: DomainEvent,
}

impl EventEnvelope {
    pub fn stamped(seq: u64, event: DomainEvent) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            seq,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }
}

/// Numbers envelopes and turns session views into change events.
#[derive(Debug, Default)]
pub struct Emitter {
    seq: u64,
    last: Option<SessionView>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(&mut self, event: DomainEvent) -> EventEnvelope {
        self.seq += 1;
        EventEnvelope::stamped(self.seq, event)
    }

    /// Events for whatever differs from the previous view. The first view
    /// reports both phase and state.
    pub fn diff(&mut self, view: &SessionView) -> Vec<EventEnvelope> {
        let (phase_changed, state_changed) = match &self.last {
            Some(last) => (
                last.phase != view.phase,
                last.state != view.state || last.payload != view.payload,
            ),
            None => (true, true),
        };
        self.last = Some(view.clone());

        let mut events = Vec::new();
        if phase_changed {
            events.push(phase_event(view));
        }
        if state_changed {
            events.push(state_event(view));
        }
        events.into_iter().map(|e| self.wrap(e)).collect()
    }

    /// Both events for `view`, changed or not.
    pub fn status(&mut self, view: &SessionView) -> Vec<EventEnvelope> {
        vec![self.wrap(phase_event(view)), self.wrap(state_event(view))]
    }
}

fn phase_event(view: &SessionView) -> DomainEvent {
    DomainEvent::PhaseChanged {
        phase: view.phase,
        is_connected: view.is_connected(),
    }
}

fn state_event(view: &SessionView) -> DomainEvent {
    DomainEvent::StateChanged {
        state: view.state,
        payload: view.payload.clone(),
    }
}
