//! Connection registry: one shared entry per endpoint.
//!
//! An entry is "live" while it holds a socket, whether connecting or open.
//! When the socket goes away the entry drops out of the live view, so a
//! subscriber can never attach to a dead socket, but the entry keeps its
//! subscribers, phase and last accepted state until the next socket
//! replaces it. It is removed outright only once the socket is closed, no
//! reconnect is scheduled and nobody is subscribed.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::backoff::Backoff;
use crate::endpoint::Endpoint;
use crate::event::{ConnId, SubscriptionId, TimerKind};
use crate::phase::{Phase, PhaseTracker};
use crate::protocol::{AppState, Payload};

/// Receives fanned-out copies of an entry's state. Never owns the socket.
pub trait Subscriber: Send {
    fn on_phase_change(&mut self, phase: Phase);
    fn on_state_change(&mut self, snapshot: &Snapshot);
}

/// Last accepted application state together with its payload. The two are
/// only ever replaced as a pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Snapshot {
    pub state: AppState,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    /// Close requested by the manager; waiting for the transport to confirm.
    Closing,
}

#[derive(Debug, Clone, Copy)]
pub struct Socket {
    pub conn: ConnId,
    pub state: SocketState,
}

/// What to do once a socket that is `Closing` reports `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfterClose {
    /// Normal close handling: backoff and reconnect.
    #[default]
    Reconnect,
    /// User retry: open a replacement straight away.
    ReopenNow,
    /// Idle teardown: remove the entry.
    Remove,
}

/// Tokens of the currently armed timers. At most one per kind.
#[derive(Debug, Clone, Default)]
pub struct ArmedTimers {
    pub grace: Option<u64>,
    pub debounce: Option<u64>,
    pub reconnect: Option<u64>,
    pub idle: Option<u64>,
}

impl ArmedTimers {
    pub fn slot(&mut self, kind: TimerKind) -> &mut Option<u64> {
        match kind {
            TimerKind::Grace => &mut self.grace,
            TimerKind::Debounce => &mut self.debounce,
            TimerKind::Reconnect => &mut self.reconnect,
            TimerKind::Idle => &mut self.idle,
        }
    }
}

pub struct SharedEntry {
    pub socket: Option<Socket>,
    pub snapshot: Snapshot,
    pub tracker: PhaseTracker,
    pub backoff: Backoff,
    pub timers: ArmedTimers,
    pub after_close: AfterClose,
    /// The grace timer has been armed for the current never-connected run.
    pub grace_started: bool,
    subscribers: Vec<(SubscriptionId, Box<dyn Subscriber>)>,
}

impl SharedEntry {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            socket: None,
            snapshot: Snapshot::default(),
            tracker: PhaseTracker::new(),
            backoff,
            timers: ArmedTimers::default(),
            after_close: AfterClose::default(),
            grace_started: false,
            subscribers: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.tracker.phase()
    }

    pub fn ref_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_live(&self) -> bool {
        self.socket.is_some()
    }

    /// Connection id of the socket, if it is open for writing.
    pub fn open_conn(&self) -> Option<ConnId> {
        self.socket
            .filter(|s| s.state == SocketState::Open)
            .map(|s| s.conn)
    }

    pub fn attach(&mut self, id: SubscriptionId, mut subscriber: Box<dyn Subscriber>) {
        subscriber.on_state_change(&self.snapshot);
        subscriber.on_phase_change(self.phase());
        self.subscribers.push((id, subscriber));
    }

    pub fn detach(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    pub fn notify_phase(&mut self, phase: Phase) {
        for (_, s) in &mut self.subscribers {
            s.on_phase_change(phase);
        }
    }

    /// Replace state and payload together and fan the pair out.
    pub fn publish(&mut self, state: AppState, payload: Payload) {
        self.snapshot = Snapshot { state, payload };
        for (_, s) in &mut self.subscribers {
            s.on_state_change(&self.snapshot);
        }
    }

    /// Eligible for removal: no socket, no reconnect pending, no subscribers.
    pub fn is_reapable(&self) -> bool {
        self.socket.is_none() && self.timers.reconnect.is_none() && self.subscribers.is_empty()
    }
}

/// Owns every entry. Constructed once at startup and owned by the manager.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<Endpoint, SharedEntry>,
    by_conn: HashMap<ConnId, Endpoint>,
    by_subscription: HashMap<SubscriptionId, Endpoint>,
    /// Endpoints that have opened successfully at least once in this process.
    ever_connected: HashSet<Endpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<&SharedEntry> {
        self.entries.get(endpoint)
    }

    pub fn get_mut(&mut self, endpoint: &Endpoint) -> Option<&mut SharedEntry> {
        self.entries.get_mut(endpoint)
    }

    /// Entry with a connecting or open socket.
    pub fn live(&self, endpoint: &Endpoint) -> Option<&SharedEntry> {
        self.entries.get(endpoint).filter(|e| e.is_live())
    }

    pub fn get_or_insert_with(
        &mut self,
        endpoint: &Endpoint,
        make: impl FnOnce() -> SharedEntry,
    ) -> &mut SharedEntry {
        self.entries.entry(endpoint.clone()).or_insert_with(make)
    }

    pub fn remove(&mut self, endpoint: &Endpoint) -> Option<SharedEntry> {
        let entry = self.entries.remove(endpoint)?;
        self.by_conn.retain(|_, e| e != endpoint);
        self.by_subscription.retain(|_, e| e != endpoint);
        Some(entry)
    }

    pub fn bind_conn(&mut self, conn: ConnId, endpoint: &Endpoint) {
        self.by_conn.insert(conn, endpoint.clone());
    }

    pub fn unbind_conn(&mut self, conn: ConnId) -> Option<Endpoint> {
        self.by_conn.remove(&conn)
    }

    pub fn endpoint_for_conn(&self, conn: ConnId) -> Option<&Endpoint> {
        self.by_conn.get(&conn)
    }

    pub fn bind_subscription(&mut self, id: SubscriptionId, endpoint: &Endpoint) {
        self.by_subscription.insert(id, endpoint.clone());
    }

    pub fn unbind_subscription(&mut self, id: SubscriptionId) -> Option<Endpoint> {
        self.by_subscription.remove(&id)
    }

    pub fn mark_connected(&mut self, endpoint: &Endpoint) {
        self.ever_connected.insert(endpoint.clone());
    }

    pub fn has_connected(&self, endpoint: &Endpoint) -> bool {
        self.ever_connected.contains(endpoint)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
