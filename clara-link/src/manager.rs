//! Connection manager: the orchestrator.
//!
//! A sans-IO state machine. Socket lifecycle, inbound frames and timer
//! expiry arrive through [`ConnectionManager::intake`]; subscribers attach
//! and intents leave through the public methods. Every mutation of a
//! shared entry happens here, so each entry has exactly one writer.
//!
//! The manager never blocks. It talks to the world through a [`Transport`]
//! and a [`TimerQueue`], which report back with more events.

use std::time::Duration;

use serde::Serialize;

use crate::backoff::Backoff;
use crate::config::LinkConfig;
use crate::dispatch;
use crate::endpoint::Endpoint;
use crate::error::LinkError;
use crate::event::{ConnId, LinkEvent, SubscriptionId, TimerKey, TimerKind};
use crate::phase::{Phase, PhaseInput};
use crate::protocol::{self, AppState, Payload};
use crate::registry::{AfterClose, Registry, SharedEntry, Snapshot, Socket, SocketState, Subscriber};
use crate::sync;
use crate::transport::{TimerQueue, Transport};

pub struct ConnectionManager<T: Transport, Q: TimerQueue> {
    config: LinkConfig,
    registry: Registry,
    transport: T,
    timers: Q,
    next_conn: u64,
    next_subscription: u64,
    next_token: u64,
}

impl<T: Transport, Q: TimerQueue> ConnectionManager<T, Q> {
    pub fn new(config: LinkConfig, transport: T, timers: Q) -> Self {
        Self {
            config,
            registry: Registry::new(),
            transport,
            timers,
            next_conn: 1,
            next_subscription: 1,
            next_token: 1,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn timers(&self) -> &Q {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut Q {
        &mut self.timers
    }

    pub fn phase(&self, endpoint: &Endpoint) -> Option<Phase> {
        self.registry.get(endpoint).map(SharedEntry::phase)
    }

    pub fn snapshot(&self, endpoint: &Endpoint) -> Option<&Snapshot> {
        self.registry.get(endpoint).map(|e| &e.snapshot)
    }

    pub fn ref_count(&self, endpoint: &Endpoint) -> usize {
        self.registry.get(endpoint).map_or(0, SharedEntry::ref_count)
    }

    // ── Subscriber contract ──

    /// Attach a subscriber to `endpoint`.
    ///
    /// The subscriber is replayed the entry's current state, payload and
    /// phase before this returns. A socket is opened only if the endpoint
    /// has none and no reconnect is already scheduled.
    pub fn subscribe(
        &mut self,
        endpoint: &Endpoint,
        subscriber: Box<dyn Subscriber>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;

        let resumed = self.registry.has_connected(endpoint);
        let backoff = Backoff::new(self.config.initial_delay(), self.config.max_delay());
        self.registry.bind_subscription(id, endpoint);
        let entry = self
            .registry
            .get_or_insert_with(endpoint, || SharedEntry::new(backoff));

        // An idle teardown still waiting for its close becomes a fresh attempt
        // on the replacement socket.
        let revived = entry.after_close == AfterClose::Remove;
        if revived {
            entry.after_close = AfterClose::ReopenNow;
            if !resumed {
                entry.grace_started = true;
            }
        }
        let attach_only = !revived && (entry.is_live() || entry.timers.reconnect.is_some());
        if !attach_only {
            if let Some(phase) = entry.tracker.apply(PhaseInput::Attempt { resumed }) {
                entry.notify_phase(phase);
            }
        }
        entry.attach(id, subscriber);
        let refs = entry.ref_count();

        tracing::debug!(%endpoint, subscription = id.0, refs, attach_only, revived, "Subscriber attached");
        self.cancel_timer(endpoint, TimerKind::Idle);
        if revived {
            if resumed {
                self.arm_timer(endpoint, TimerKind::Debounce, self.config.debounce());
            } else {
                self.arm_timer(endpoint, TimerKind::Grace, self.config.grace());
            }
        } else if !attach_only {
            self.open_socket(endpoint);
        }
        id
    }

    /// Detach a subscriber. Stops its callbacks immediately; the socket and
    /// reconnect schedule are shared and stay untouched.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(endpoint) = self.registry.unbind_subscription(id) else {
            return false;
        };
        let Some(entry) = self.registry.get_mut(&endpoint) else {
            return false;
        };
        let removed = entry.detach(id);
        if !removed || entry.ref_count() > 0 {
            return removed;
        }
        if entry.is_reapable() {
            self.cancel_all_timers(&endpoint);
            self.registry.remove(&endpoint);
            tracing::debug!(%endpoint, "Removed unused entry");
        } else if let Some(idle) = self.config.idle_timeout() {
            self.arm_timer(&endpoint, TimerKind::Idle, idle);
        }
        true
    }

    /// Best-effort send over the endpoint's open socket. Never queued.
    pub fn send<M: Serialize + ?Sized>(&mut self, endpoint: &Endpoint, message: &M) -> bool {
        let conn = self.registry.live(endpoint).and_then(SharedEntry::open_conn);
        dispatch::dispatch(&mut self.transport, conn, message)
    }

    /// User-initiated retry: reset the backoff and start a fresh attempt.
    ///
    /// A socket that is still around is closed first; its replacement is
    /// opened once the transport confirms the close.
    pub fn force_reconnect(&mut self, endpoint: &Endpoint) -> bool {
        let resumed = self.registry.has_connected(endpoint);
        let Some(entry) = self.registry.get_mut(endpoint) else {
            tracing::debug!(%endpoint, "Retry requested for unknown endpoint");
            return false;
        };

        entry.backoff.reset();
        if let Some(phase) = entry.tracker.apply(PhaseInput::Attempt { resumed }) {
            entry.notify_phase(phase);
        }
        if !resumed {
            entry.grace_started = true;
        }
        let socket = entry.socket;
        if let Some(s) = socket {
            entry.after_close = AfterClose::ReopenNow;
            if s.state != SocketState::Closing {
                entry.socket = Some(Socket {
                    state: SocketState::Closing,
                    ..s
                });
                self.transport.close(s.conn);
            }
        }

        tracing::info!(%endpoint, "Retry requested");
        self.cancel_timer(endpoint, TimerKind::Reconnect);
        if resumed {
            self.arm_timer(endpoint, TimerKind::Debounce, self.config.debounce());
        } else {
            self.arm_timer(endpoint, TimerKind::Grace, self.config.grace());
        }
        if socket.is_none() {
            self.open_socket(endpoint);
        }
        true
    }

    /// Set state and payload locally, bypassing the monotonicity guard.
    /// Used for optimistic transitions the UI makes on its own.
    pub fn override_state(&mut self, endpoint: &Endpoint, state: AppState, payload: Payload) -> bool {
        let Some(entry) = self.registry.get_mut(endpoint) else {
            return false;
        };
        tracing::debug!(%endpoint, %state, "Local state override");
        entry.publish(state, payload);
        true
    }

    /// Close every socket and cancel every timer.
    pub fn shutdown(&mut self) {
        let endpoints: Vec<Endpoint> = self.registry.endpoints().cloned().collect();
        for endpoint in endpoints {
            self.cancel_all_timers(&endpoint);
            if let Some(entry) = self.registry.remove(&endpoint) {
                if let Some(s) = entry.socket {
                    self.transport.close(s.conn);
                }
            }
        }
    }

    // ── Event intake ──

    pub fn intake(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { conn } => self.on_opened(conn),
            LinkEvent::FrameReceived { conn, text } => self.on_frame(conn, &text),
            LinkEvent::Closed { conn, reason } => self.on_socket_gone(conn, &reason),
            LinkEvent::ConstructionFailed { conn, error } => {
                tracing::warn!(%conn, %error, "Socket construction failed");
                self.on_socket_gone(conn, &error);
            }
            LinkEvent::TimerFired { key } => self.on_timer(key),
        }
    }

    fn on_opened(&mut self, conn: ConnId) {
        let Some(endpoint) = self.registry.endpoint_for_conn(conn).cloned() else {
            tracing::debug!(%conn, "Ignoring open for unknown socket");
            return;
        };
        let Some(entry) = self.registry.get_mut(&endpoint) else {
            return;
        };
        match entry.socket {
            Some(s) if s.conn == conn && s.state == SocketState::Connecting => {}
            _ => {
                tracing::debug!(%endpoint, %conn, "Ignoring open for superseded socket");
                return;
            }
        }

        entry.socket = Some(Socket {
            conn,
            state: SocketState::Open,
        });
        entry.backoff.reset();
        if let Some(phase) = entry.tracker.apply(PhaseInput::Opened) {
            entry.notify_phase(phase);
        }
        self.registry.mark_connected(&endpoint);
        self.cancel_timer(&endpoint, TimerKind::Grace);
        self.cancel_timer(&endpoint, TimerKind::Debounce);
        tracing::info!(%endpoint, %conn, "Connected");
    }

    fn on_frame(&mut self, conn: ConnId, text: &str) {
        let Some(endpoint) = self.registry.endpoint_for_conn(conn).cloned() else {
            tracing::debug!(%conn, "Ignoring frame from unknown socket");
            return;
        };
        let limit = self.config.max_frame_bytes;
        let Some(entry) = self.registry.get_mut(&endpoint) else {
            return;
        };
        if entry.open_conn() != Some(conn) {
            tracing::debug!(%endpoint, %conn, "Ignoring frame from socket that is not open");
            return;
        }
        if text.len() > limit {
            let e = LinkError::FrameTooLarge {
                size: text.len(),
                limit,
            };
            tracing::warn!(%endpoint, error = %e, "Dropping inbound frame");
            return;
        }

        let mut frame = match protocol::decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "Dropping inbound frame");
                return;
            }
        };
        let payload = frame.take_payload();
        match sync::accept(entry.snapshot.state, &frame.state, payload) {
            Ok((state, payload)) => {
                tracing::debug!(%endpoint, %state, "State accepted");
                entry.publish(state, payload);
            }
            Err(rejection) => {
                tracing::debug!(%endpoint, %rejection, "State rejected");
            }
        }
    }

    /// Close and construction failure share this path.
    fn on_socket_gone(&mut self, conn: ConnId, reason: &str) {
        let Some(endpoint) = self.registry.unbind_conn(conn) else {
            tracing::debug!(%conn, "Ignoring close for unknown socket");
            return;
        };
        let resumed = self.registry.has_connected(&endpoint);
        let Some(entry) = self.registry.get_mut(&endpoint) else {
            return;
        };
        if entry.socket.map(|s| s.conn) != Some(conn) {
            return;
        }
        entry.socket = None;

        match std::mem::take(&mut entry.after_close) {
            AfterClose::Remove => {
                self.cancel_all_timers(&endpoint);
                self.registry.remove(&endpoint);
                tracing::info!(%endpoint, %conn, "Closed idle connection");
                return;
            }
            AfterClose::ReopenNow => {
                tracing::info!(%endpoint, %conn, "Previous socket closed, reconnecting now");
                self.open_socket(&endpoint);
                return;
            }
            AfterClose::Reconnect => {}
        }

        if let Some(phase) = entry.tracker.apply(PhaseInput::Closed) {
            entry.notify_phase(phase);
        }
        let arm_debounce =
            resumed && entry.phase() == Phase::Reconnecting && entry.timers.debounce.is_none();
        let delay = entry.backoff.record_failure();
        let attempt = entry.backoff.attempt();

        tracing::info!(
            %endpoint,
            %conn,
            reason,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Connection lost, will reconnect"
        );
        if arm_debounce {
            self.arm_timer(&endpoint, TimerKind::Debounce, self.config.debounce());
        }
        self.arm_timer(&endpoint, TimerKind::Reconnect, delay);
    }

    fn on_timer(&mut self, key: TimerKey) {
        let Some(entry) = self.registry.get_mut(&key.endpoint) else {
            tracing::debug!(endpoint = %key.endpoint, kind = ?key.kind, "Timer for removed entry");
            return;
        };
        let armed = entry.timers.slot(key.kind);
        if *armed != Some(key.token) {
            tracing::debug!(endpoint = %key.endpoint, kind = ?key.kind, "Ignoring stale timer");
            return;
        }
        *armed = None;

        let endpoint = key.endpoint;
        match key.kind {
            TimerKind::Grace => {
                if let Some(phase) = entry.tracker.apply(PhaseInput::GraceElapsed) {
                    tracing::info!(%endpoint, "Never connected within grace period, offline");
                    entry.notify_phase(phase);
                }
            }
            TimerKind::Debounce => {
                if let Some(phase) = entry.tracker.apply(PhaseInput::DebounceElapsed) {
                    tracing::info!(%endpoint, "Reconnect did not succeed in time, offline");
                    entry.notify_phase(phase);
                }
            }
            TimerKind::Reconnect => {
                if entry.socket.is_none() {
                    self.open_socket(&endpoint);
                }
            }
            TimerKind::Idle => {
                if entry.ref_count() == 0 {
                    self.teardown(&endpoint);
                }
            }
        }
    }

    // ── Internals ──

    fn open_socket(&mut self, endpoint: &Endpoint) {
        let conn = ConnId(self.next_conn);
        self.next_conn += 1;
        let resumed = self.registry.has_connected(endpoint);
        let Some(entry) = self.registry.get_mut(endpoint) else {
            return;
        };

        entry.socket = Some(Socket {
            conn,
            state: SocketState::Connecting,
        });
        entry.after_close = AfterClose::Reconnect;
        let arm_grace = !resumed && !entry.grace_started;
        if arm_grace {
            entry.grace_started = true;
        }
        let arm_debounce =
            resumed && entry.phase() == Phase::Reconnecting && entry.timers.debounce.is_none();
        self.registry.bind_conn(conn, endpoint);

        if arm_grace {
            self.arm_timer(endpoint, TimerKind::Grace, self.config.grace());
        }
        if arm_debounce {
            self.arm_timer(endpoint, TimerKind::Debounce, self.config.debounce());
        }

        tracing::debug!(%endpoint, %conn, "Opening socket");
        if let Err(e) = self.transport.open(endpoint, conn) {
            tracing::warn!(%endpoint, %conn, error = %e, "Socket construction failed");
            self.on_socket_gone(conn, &e.to_string());
        }
    }

    fn teardown(&mut self, endpoint: &Endpoint) {
        self.cancel_timer(endpoint, TimerKind::Grace);
        self.cancel_timer(endpoint, TimerKind::Debounce);
        self.cancel_timer(endpoint, TimerKind::Reconnect);
        let Some(entry) = self.registry.get_mut(endpoint) else {
            return;
        };
        let socket = entry.socket;
        match socket {
            Some(s) => {
                entry.after_close = AfterClose::Remove;
                if s.state != SocketState::Closing {
                    entry.socket = Some(Socket {
                        state: SocketState::Closing,
                        ..s
                    });
                    self.transport.close(s.conn);
                }
                tracing::info!(%endpoint, conn = %s.conn, "Closing idle connection");
            }
            None => {
                self.registry.remove(endpoint);
                tracing::info!(%endpoint, "Removed idle entry");
            }
        }
    }

    fn arm_timer(&mut self, endpoint: &Endpoint, kind: TimerKind, after: Duration) {
        self.cancel_timer(endpoint, kind);
        let Some(entry) = self.registry.get_mut(endpoint) else {
            return;
        };
        let token = self.next_token;
        self.next_token += 1;
        *entry.timers.slot(kind) = Some(token);
        self.timers.schedule(
            TimerKey {
                endpoint: endpoint.clone(),
                kind,
                token,
            },
            after,
        );
    }

    fn cancel_timer(&mut self, endpoint: &Endpoint, kind: TimerKind) {
        let Some(entry) = self.registry.get_mut(endpoint) else {
            return;
        };
        if let Some(token) = entry.timers.slot(kind).take() {
            self.timers.cancel(&TimerKey {
                endpoint: endpoint.clone(),
                kind,
                token,
            });
        }
    }

    fn cancel_all_timers(&mut self, endpoint: &Endpoint) {
        for kind in [
            TimerKind::Grace,
            TimerKind::Debounce,
            TimerKind::Reconnect,
            TimerKind::Idle,
        ] {
            self.cancel_timer(endpoint, kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::protocol::Intent;

    #[derive(Default)]
    struct FakeTransport {
        opens: Vec<(Endpoint, ConnId)>,
        sends: Vec<(ConnId, String)>,
        closes: Vec<ConnId>,
        /// Fail every open synchronously, as a construction failure.
        refuse: bool,
    }

    impl Transport for FakeTransport {
        fn open(&mut self, endpoint: &Endpoint, conn: ConnId) -> crate::error::Result<()> {
            self.opens.push((endpoint.clone(), conn));
            if self.refuse {
                return Err(LinkError::InvalidEndpoint {
                    endpoint: endpoint.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }

        fn send(&mut self, conn: ConnId, text: String) -> crate::error::Result<()> {
            self.sends.push((conn, text));
            Ok(())
        }

        fn close(&mut self, conn: ConnId) {
            self.closes.push(conn);
        }
    }

    /// Virtual clock. Timers only fire when a test advances time.
    #[derive(Default)]
    struct FakeTimers {
        now: Duration,
        pending: Vec<(Duration, TimerKey)>,
        scheduled: Vec<(TimerKind, Duration)>,
    }

    impl TimerQueue for FakeTimers {
        fn schedule(&mut self, key: TimerKey, after: Duration) {
            self.scheduled.push((key.kind, after));
            self.pending.push((self.now + after, key));
        }

        fn cancel(&mut self, key: &TimerKey) {
            self.pending.retain(|(_, k)| k != key);
        }
    }

    type Manager = ConnectionManager<FakeTransport, FakeTimers>;

    #[derive(Debug, Clone, PartialEq)]
    enum Note {
        Phase(Phase),
        State(u8, Value),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Note>>>);

    impl Recorder {
        fn boxed(&self) -> Box<dyn Subscriber> {
            Box::new(self.clone())
        }

        fn notes(&self) -> Vec<Note> {
            self.0.lock().clone()
        }

        fn phases(&self) -> Vec<Phase> {
            self.notes()
                .into_iter()
                .filter_map(|n| match n {
                    Note::Phase(p) => Some(p),
                    Note::State(..) => None,
                })
                .collect()
        }

        fn last_phase(&self) -> Option<Phase> {
            self.phases().last().copied()
        }

        fn last_state(&self) -> Option<(u8, Value)> {
            self.notes().into_iter().rev().find_map(|n| match n {
                Note::State(s, p) => Some((s, p)),
                Note::Phase(_) => None,
            })
        }

        fn count(&self, phase: Phase) -> usize {
            self.phases().into_iter().filter(|p| *p == phase).count()
        }
    }

    impl Subscriber for Recorder {
        fn on_phase_change(&mut self, phase: Phase) {
            self.0.lock().push(Note::Phase(phase));
        }

        fn on_state_change(&mut self, snapshot: &Snapshot) {
            self.0.lock().push(Note::State(
                snapshot.state.code(),
                snapshot.payload.as_value().clone(),
            ));
        }
    }

    fn ep() -> Endpoint {
        Endpoint::new("ws://kiosk.test:8000/ws/clara")
    }

    fn config() -> LinkConfig {
        LinkConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            grace_ms: 10_000,
            debounce_ms: 4_000,
            ..LinkConfig::default()
        }
    }

    fn manager_with(config: LinkConfig) -> Manager {
        ConnectionManager::new(config, FakeTransport::default(), FakeTimers::default())
    }

    fn manager() -> Manager {
        manager_with(config())
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    /// Advance the virtual clock, firing due timers in order.
    fn advance(m: &mut Manager, by: Duration) {
        let target = m.timers().now + by;
        loop {
            let next = m
                .timers()
                .pending
                .iter()
                .enumerate()
                .filter(|(_, (due, _))| *due <= target)
                .min_by_key(|(_, (due, _))| *due)
                .map(|(i, _)| i);
            let Some(i) = next else { break };
            let (due, key) = m.timers_mut().pending.remove(i);
            m.timers_mut().now = due;
            m.intake(LinkEvent::TimerFired { key });
        }
        m.timers_mut().now = target;
    }

    fn opens(m: &Manager) -> usize {
        m.transport().opens.len()
    }

    fn last_conn(m: &Manager) -> ConnId {
        m.transport().opens.last().unwrap().1
    }

    fn open_last(m: &mut Manager) {
        let conn = last_conn(m);
        m.intake(LinkEvent::Opened { conn });
    }

    fn close_last(m: &mut Manager) {
        let conn = last_conn(m);
        m.intake(LinkEvent::Closed {
            conn,
            reason: "connection reset".to_string(),
        });
    }

    fn push(m: &mut Manager, text: &str) {
        let conn = last_conn(m);
        m.intake(LinkEvent::FrameReceived {
            conn,
            text: text.to_string(),
        });
    }

    fn state_of(m: &Manager) -> u8 {
        m.snapshot(&ep()).unwrap().state.code()
    }

    fn pending_reconnects(m: &Manager) -> usize {
        m.timers()
            .pending
            .iter()
            .filter(|(_, k)| k.kind == TimerKind::Reconnect)
            .count()
    }

    #[test]
    fn test_subscribe_opens_socket_and_replays() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());

        assert_eq!(opens(&m), 1);
        assert_eq!(
            a.notes(),
            vec![Note::State(0, Value::Null), Note::Phase(Phase::InitialConnecting)]
        );
        assert_eq!(m.ref_count(&ep()), 1);
    }

    #[test]
    fn test_late_subscriber_shares_open_connection() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);
        push(&mut m, r#"{"state":3,"payload":{"messages":[]}}"#);

        let b = Recorder::default();
        m.subscribe(&ep(), b.boxed());

        assert_eq!(opens(&m), 1, "second subscriber must not open a socket");
        assert_eq!(
            b.notes(),
            vec![
                Note::State(3, json!({"messages": []})),
                Note::Phase(Phase::Connected)
            ]
        );
        assert_eq!(a.last_state(), b.last_state());
        assert_eq!(a.last_phase(), b.last_phase());
        assert_eq!(m.ref_count(&ep()), 2);
    }

    #[test]
    fn test_accepted_frames_fan_out() {
        let mut m = manager();
        let a = Recorder::default();
        let b = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);
        m.subscribe(&ep(), b.boxed());

        push(
            &mut m,
            r#"{"state":5,"payload":{"messages":[{"id":"greeting","role":"clara","text":"Hello"}],"isSpeaking":true}}"#,
        );
        let expected = Some((
            5,
            json!({"messages": [{"id": "greeting", "role": "clara", "text": "Hello"}], "isSpeaking": true}),
        ));
        assert_eq!(a.last_state(), expected);
        assert_eq!(b.last_state(), expected);
    }

    #[test]
    fn test_non_integer_state_dropped() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);
        push(&mut m, r#"{"state":3,"payload":{"k":1}}"#);
        let before = a.notes();

        push(&mut m, r#"{"state":"5"}"#);

        assert_eq!(state_of(&m), 3);
        assert_eq!(m.snapshot(&ep()).unwrap().payload.as_value(), &json!({"k": 1}));
        assert_eq!(a.notes(), before);
    }

    #[test]
    fn test_malformed_frame_is_not_fatal() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);

        push(&mut m, "{not json");
        push(&mut m, "");
        assert_eq!(m.phase(&ep()), Some(Phase::Connected));
        assert_eq!(state_of(&m), 0);

        push(&mut m, r#"{"state":3}"#);
        assert_eq!(state_of(&m), 3);
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let mut m = manager_with(LinkConfig {
            max_frame_bytes: 64,
            ..config()
        });
        m.subscribe(&ep(), Recorder::default().boxed());
        open_last(&mut m);

        let big = format!(r#"{{"state":3,"payload":{{"audioBase64":"{}"}}}}"#, "A".repeat(128));
        push(&mut m, &big);
        assert_eq!(state_of(&m), 0);
    }

    #[test]
    fn test_guard_applies_to_pushed_frames() {
        let mut m = manager();
        m.subscribe(&ep(), Recorder::default().boxed());
        open_last(&mut m);

        push(&mut m, r#"{"state":5,"payload":null}"#);
        push(&mut m, r#"{"state":0,"payload":null}"#);
        assert_eq!(state_of(&m), 5, "sleep must not override chat");
        push(&mut m, r#"{"state":4,"payload":null}"#);
        assert_eq!(state_of(&m), 5, "stale menu must not override chat");
        push(&mut m, r#"{"state":3,"payload":null}"#);
        push(&mut m, r#"{"state":4,"payload":null}"#);
        assert_eq!(state_of(&m), 4);
    }

    #[test]
    fn test_quick_reopen_never_goes_offline() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);

        close_last(&mut m);
        assert_eq!(a.last_phase(), Some(Phase::Reconnecting));
        advance(&mut m, secs(1));
        assert_eq!(opens(&m), 2);
        open_last(&mut m);
        advance(&mut m, secs(30));

        assert_eq!(a.count(Phase::Offline), 0);
        assert_eq!(a.last_phase(), Some(Phase::Connected));
    }

    #[test]
    fn test_lasting_outage_goes_offline_exactly_once() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);

        // t=0 close; debounce due at 4s, reconnects at 1s, 3s, 7s, 15s.
        close_last(&mut m);
        advance(&mut m, secs(1));
        close_last(&mut m);
        advance(&mut m, secs(2));
        close_last(&mut m);
        assert_eq!(a.last_phase(), Some(Phase::Reconnecting));

        advance(&mut m, secs(1));
        assert_eq!(a.last_phase(), Some(Phase::Offline));

        advance(&mut m, secs(3));
        close_last(&mut m);
        advance(&mut m, secs(8));
        close_last(&mut m);

        assert_eq!(opens(&m), 5);
        assert_eq!(a.count(Phase::Offline), 1);
        assert_eq!(
            a.phases(),
            vec![Phase::InitialConnecting, Phase::Connected, Phase::Reconnecting, Phase::Offline]
        );
    }

    #[test]
    fn test_never_reachable_goes_offline_after_grace() {
        let mut m = manager();
        m.transport_mut().refuse = true;
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());

        // Attempts at 0s, 1s, 3s, 7s, 15s.
        assert_eq!(opens(&m), 1);
        advance(&mut m, Duration::from_millis(999));
        assert_eq!(opens(&m), 1);
        advance(&mut m, Duration::from_millis(1));
        assert_eq!(opens(&m), 2);
        advance(&mut m, secs(2));
        assert_eq!(opens(&m), 3);
        advance(&mut m, secs(4));
        assert_eq!(opens(&m), 4);

        advance(&mut m, secs(2));
        assert_eq!(a.last_phase(), Some(Phase::InitialConnecting));
        advance(&mut m, secs(1));
        assert_eq!(a.last_phase(), Some(Phase::Offline));
        assert_eq!(opens(&m), 4);

        advance(&mut m, secs(5));
        assert_eq!(opens(&m), 5);
        assert_eq!(a.phases(), vec![Phase::InitialConnecting, Phase::Offline]);

        let reconnect_delays: Vec<u64> = m
            .timers()
            .scheduled
            .iter()
            .filter(|(kind, _)| *kind == TimerKind::Reconnect)
            .map(|(_, d)| d.as_secs())
            .collect();
        assert_eq!(reconnect_delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_grace_cancelled_by_open() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        advance(&mut m, secs(2));
        open_last(&mut m);
        advance(&mut m, secs(60));

        assert_eq!(a.phases(), vec![Phase::InitialConnecting, Phase::Connected]);
        assert!(m.timers().pending.is_empty());
    }

    #[test]
    fn test_backoff_resets_after_successful_open() {
        let mut m = manager();
        m.subscribe(&ep(), Recorder::default().boxed());
        close_last(&mut m);
        advance(&mut m, secs(1));
        close_last(&mut m);
        advance(&mut m, secs(2));
        open_last(&mut m);
        assert_eq!(m.registry().get(&ep()).unwrap().backoff.attempt(), 0);

        close_last(&mut m);
        let last = m
            .timers()
            .scheduled
            .iter()
            .rev()
            .find(|(kind, _)| *kind == TimerKind::Reconnect)
            .map(|(_, d)| *d);
        assert_eq!(last, Some(secs(1)));
    }

    #[test]
    fn test_send_while_offline_is_noop() {
        let mut m = manager();
        m.transport_mut().refuse = true;
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        advance(&mut m, secs(10));
        assert_eq!(a.last_phase(), Some(Phase::Offline));
        let opens_before = opens(&m);

        assert!(!m.send(&ep(), &Intent::Wake));
        assert!(m.transport().sends.is_empty());
        assert!(m.transport().closes.is_empty());
        assert_eq!(opens(&m), opens_before);
    }

    #[test]
    fn test_send_while_connecting_or_unknown_is_rejected() {
        let mut m = manager();
        assert!(!m.send(&ep(), &Intent::Wake));
        m.subscribe(&ep(), Recorder::default().boxed());
        assert!(!m.send(&ep(), &Intent::Wake));
        assert!(m.transport().sends.is_empty());
    }

    #[test]
    fn test_send_while_connected() {
        let mut m = manager();
        m.subscribe(&ep(), Recorder::default().boxed());
        open_last(&mut m);

        assert!(m.send(&ep(), &Intent::UserMessage { text: "hostel fees".into() }));
        assert!(m.send(&ep(), &json!({"action": "wake"})));

        let sent: Vec<Value> = m
            .transport()
            .sends
            .iter()
            .map(|(_, text)| serde_json::from_str(text).unwrap())
            .collect();
        assert_eq!(
            sent,
            vec![
                json!({"action": "user_message", "text": "hostel fees"}),
                json!({"action": "wake"})
            ]
        );
    }

    #[test]
    fn test_unsubscribe_keeps_connection() {
        let mut m = manager();
        let a = Recorder::default();
        let id = m.subscribe(&ep(), a.boxed());
        open_last(&mut m);

        assert!(m.unsubscribe(id));
        assert!(!m.unsubscribe(id));
        assert_eq!(m.ref_count(&ep()), 0);
        assert!(m.transport().closes.is_empty());
        assert!(m.registry().live(&ep()).is_some());

        let before = a.notes();
        push(&mut m, r#"{"state":3}"#);
        assert_eq!(a.notes(), before, "detached subscriber must not be called");

        let b = Recorder::default();
        m.subscribe(&ep(), b.boxed());
        assert_eq!(opens(&m), 1);
        assert_eq!(b.last_state(), Some((3, Value::Null)));
    }

    #[test]
    fn test_idle_timeout_tears_down() {
        let mut m = manager_with(LinkConfig {
            idle_timeout_ms: Some(60_000),
            ..config()
        });
        let id = m.subscribe(&ep(), Recorder::default().boxed());
        open_last(&mut m);
        let conn = last_conn(&m);
        m.unsubscribe(id);

        advance(&mut m, secs(59));
        assert!(m.transport().closes.is_empty());
        advance(&mut m, secs(1));
        assert_eq!(m.transport().closes, vec![conn]);

        m.intake(LinkEvent::Closed {
            conn,
            reason: "closed by client".into(),
        });
        assert!(m.registry().is_empty());
        assert!(m.timers().pending.is_empty());

        let b = Recorder::default();
        m.subscribe(&ep(), b.boxed());
        assert_eq!(opens(&m), 2);
        assert_eq!(b.last_phase(), Some(Phase::Reconnecting));
    }

    #[test]
    fn test_resubscribe_cancels_idle_teardown() {
        let mut m = manager_with(LinkConfig {
            idle_timeout_ms: Some(60_000),
            ..config()
        });
        let id = m.subscribe(&ep(), Recorder::default().boxed());
        open_last(&mut m);
        m.unsubscribe(id);
        advance(&mut m, secs(30));
        m.subscribe(&ep(), Recorder::default().boxed());
        advance(&mut m, secs(120));

        assert!(m.transport().closes.is_empty());
        assert_eq!(m.phase(&ep()), Some(Phase::Connected));
    }

    #[test]
    fn test_resubscribe_during_idle_close_restarts_grace() {
        let mut m = manager_with(LinkConfig {
            idle_timeout_ms: Some(1_000),
            ..config()
        });
        let id = m.subscribe(&ep(), Recorder::default().boxed());
        m.unsubscribe(id);
        advance(&mut m, secs(1));
        let first = last_conn(&m);
        assert_eq!(m.transport().closes, vec![first]);

        let b = Recorder::default();
        m.subscribe(&ep(), b.boxed());
        assert_eq!(opens(&m), 1, "replacement must wait for the close");
        m.intake(LinkEvent::Closed {
            conn: first,
            reason: "closed by client".into(),
        });
        assert_eq!(opens(&m), 2);

        for _ in 0..20 {
            close_last(&mut m);
            advance(&mut m, secs(30));
        }
        assert_eq!(b.phases(), vec![Phase::InitialConnecting, Phase::Offline]);
    }

    #[test]
    fn test_resubscribe_during_idle_close_is_not_connected() {
        let mut m = manager_with(LinkConfig {
            idle_timeout_ms: Some(1_000),
            ..config()
        });
        let id = m.subscribe(&ep(), Recorder::default().boxed());
        open_last(&mut m);
        let first = last_conn(&m);
        m.unsubscribe(id);
        advance(&mut m, secs(1));
        assert_eq!(m.transport().closes, vec![first]);

        let b = Recorder::default();
        m.subscribe(&ep(), b.boxed());
        assert_eq!(b.last_phase(), Some(Phase::Reconnecting));
        assert!(!m.send(&ep(), &Intent::Wake));

        m.intake(LinkEvent::Closed {
            conn: first,
            reason: "closed by client".into(),
        });
        assert_eq!(opens(&m), 2);
        close_last(&mut m);
        advance(&mut m, secs(4));

        assert_eq!(b.count(Phase::Offline), 1);
        assert_eq!(b.last_phase(), Some(Phase::Offline));
    }

    #[test]
    fn test_force_reconnect_waits_for_close() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);
        let first = last_conn(&m);

        assert!(m.force_reconnect(&ep()));
        assert_eq!(m.transport().closes, vec![first]);
        assert_eq!(opens(&m), 1, "replacement must wait for the close");
        assert_eq!(a.last_phase(), Some(Phase::Reconnecting));

        m.intake(LinkEvent::Closed {
            conn: first,
            reason: "closed by client".into(),
        });
        assert_eq!(opens(&m), 2);
        assert_eq!(pending_reconnects(&m), 0);
        open_last(&mut m);
        assert_eq!(a.last_phase(), Some(Phase::Connected));
    }

    #[test]
    fn test_force_reconnect_from_offline() {
        let mut m = manager();
        m.transport_mut().refuse = true;
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        advance(&mut m, secs(10));
        assert_eq!(a.last_phase(), Some(Phase::Offline));
        assert!(m.registry().get(&ep()).unwrap().backoff.attempt() > 0);

        m.transport_mut().refuse = false;
        let before = opens(&m);
        assert!(m.force_reconnect(&ep()));
        assert_eq!(opens(&m), before + 1);
        assert_eq!(pending_reconnects(&m), 0);
        assert_eq!(a.last_phase(), Some(Phase::InitialConnecting));

        open_last(&mut m);
        assert_eq!(a.last_phase(), Some(Phase::Connected));
        assert_eq!(m.registry().get(&ep()).unwrap().backoff.attempt(), 0);
        advance(&mut m, secs(60));
        assert_eq!(a.last_phase(), Some(Phase::Connected));
    }

    #[test]
    fn test_force_reconnect_unknown_endpoint() {
        let mut m = manager();
        assert!(!m.force_reconnect(&ep()));
        assert_eq!(opens(&m), 0);
    }

    #[test]
    fn test_subscribe_during_pending_reconnect_does_not_open() {
        let mut m = manager();
        m.subscribe(&ep(), Recorder::default().boxed());
        open_last(&mut m);
        close_last(&mut m);

        let b = Recorder::default();
        m.subscribe(&ep(), b.boxed());
        assert_eq!(opens(&m), 1);
        assert_eq!(b.last_phase(), Some(Phase::Reconnecting));

        advance(&mut m, secs(1));
        assert_eq!(opens(&m), 2);
    }

    #[test]
    fn test_events_from_replaced_socket_ignored() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);
        let old = last_conn(&m);
        m.force_reconnect(&ep());
        m.intake(LinkEvent::Closed {
            conn: old,
            reason: "closed by client".into(),
        });
        open_last(&mut m);
        let before = a.notes();

        m.intake(LinkEvent::FrameReceived {
            conn: old,
            text: r#"{"state":3}"#.into(),
        });
        m.intake(LinkEvent::Opened { conn: old });
        m.intake(LinkEvent::Closed {
            conn: old,
            reason: "late".into(),
        });

        assert_eq!(a.notes(), before);
        assert_eq!(pending_reconnects(&m), 0);
        assert_eq!(m.phase(&ep()), Some(Phase::Connected));
    }

    #[test]
    fn test_backend_restart_keeps_progress() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);
        push(&mut m, r#"{"state":0,"payload":null}"#);
        push(&mut m, r#"{"state":5,"payload":{"messages":[{"id":"greeting"}]}}"#);

        close_last(&mut m);
        advance(&mut m, secs(1));
        open_last(&mut m);
        // A restarted backend greets every new socket with sleep.
        push(&mut m, r#"{"state":0,"payload":null}"#);

        assert_eq!(
            a.last_state(),
            Some((5, json!({"messages": [{"id": "greeting"}]})))
        );
    }

    #[test]
    fn test_override_state_bypasses_guard() {
        let mut m = manager();
        let a = Recorder::default();
        m.subscribe(&ep(), a.boxed());
        open_last(&mut m);
        push(&mut m, r#"{"state":5,"payload":{"messages":[]}}"#);

        assert!(m.override_state(&ep(), AppState::SLEEP, Payload::null()));
        assert_eq!(a.last_state(), Some((0, Value::Null)));
        assert!(!m.override_state(
            &Endpoint::new("ws://elsewhere/ws"),
            AppState::CHAT,
            Payload::null()
        ));
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let mut m = manager();
        let other = Endpoint::new("ws://second.test/ws/clara");
        m.subscribe(&ep(), Recorder::default().boxed());
        open_last(&mut m);
        close_last(&mut m);
        m.subscribe(&other, Recorder::default().boxed());
        let live = last_conn(&m);

        m.shutdown();
        assert_eq!(m.transport().closes, vec![live]);
        assert!(m.registry().is_empty());
        assert!(m.timers().pending.is_empty());
    }
}
