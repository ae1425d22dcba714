//! Async front end for the connection manager.
//!
//! [`LinkHandle::spawn`] moves a manager onto its own tokio task. Socket
//! and timer events and API commands all arrive on that task, so the
//! manager keeps a single writer. Callers hold a cheap, cloneable
//! [`LinkHandle`] and one [`Session`] per UI component.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::LinkConfig;
use crate::endpoint::Endpoint;
use crate::error::{LinkError, Result};
use crate::event::{LinkEvent, SubscriptionId};
use crate::manager::ConnectionManager;
use crate::phase::Phase;
use crate::protocol::{AppState, Payload};
use crate::registry::{Snapshot, Subscriber};
use crate::timers::TokioTimers;
use crate::ws::TungsteniteTransport;

type Manager = ConnectionManager<TungsteniteTransport, TokioTimers>;

/// What a subscribed component sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub state: AppState,
    pub payload: Payload,
    pub phase: Phase,
}

impl SessionView {
    pub fn is_connected(&self) -> bool {
        self.phase.is_connected()
    }
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            state: AppState::default(),
            payload: Payload::null(),
            phase: Phase::InitialConnecting,
        }
    }
}

/// Commands sent from the public API to the event loop.
enum Command {
    Subscribe {
        endpoint: Endpoint,
        reply: oneshot::Sender<(SubscriptionId, watch::Receiver<SessionView>)>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Send {
        endpoint: Endpoint,
        message: Value,
        reply: oneshot::Sender<bool>,
    },
    ForceReconnect {
        endpoint: Endpoint,
        reply: oneshot::Sender<bool>,
    },
    Override {
        endpoint: Endpoint,
        state: AppState,
        payload: Payload,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Forwards fan-out into a watch channel.
struct WatchSubscriber {
    tx: watch::Sender<SessionView>,
}

impl Subscriber for WatchSubscriber {
    fn on_phase_change(&mut self, phase: Phase) {
        self.tx.send_modify(|view| view.phase = phase);
    }

    fn on_state_change(&mut self, snapshot: &Snapshot) {
        self.tx.send_modify(|view| {
            view.state = snapshot.state;
            view.payload = snapshot.payload.clone();
        });
    }
}

#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl LinkHandle {
    /// Start the event loop on the current tokio runtime.
    ///
    /// The loop runs until [`shutdown`](Self::shutdown) is called or every
    /// handle and session has been dropped.
    pub fn spawn(config: LinkConfig) -> (Self, JoinHandle<()>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let transport = TungsteniteTransport::new(event_tx.clone(), config.connect_timeout());
        let timers = TokioTimers::new(event_tx);
        let manager = ConnectionManager::new(config, transport, timers);
        let task = tokio::spawn(run(manager, event_rx, command_rx));
        (
            Self {
                commands: command_tx,
            },
            task,
        )
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| LinkError::RuntimeClosed)?;
        rx.await.map_err(|_| LinkError::RuntimeClosed)
    }

    /// Attach to `endpoint`, opening a connection if there is none yet.
    pub async fn subscribe(&self, endpoint: impl Into<Endpoint>) -> Result<Session> {
        let endpoint = endpoint.into();
        let (id, mut view) = self
            .request(|reply| Command::Subscribe {
                endpoint: endpoint.clone(),
                reply,
            })
            .await?;
        // The replay is the starting point, not a change.
        view.borrow_and_update();
        Ok(Session {
            id,
            endpoint,
            view,
            link: self.clone(),
        })
    }

    /// Best-effort send. `false` when the endpoint is not connected, the
    /// message can't be encoded, or the loop is gone.
    pub async fn send<M: Serialize + ?Sized>(&self, endpoint: &Endpoint, message: &M) -> bool {
        let message = match serde_json::to_value(message) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "Dropping outbound message");
                return false;
            }
        };
        self.request(|reply| Command::Send {
            endpoint: endpoint.clone(),
            message,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn force_reconnect(&self, endpoint: &Endpoint) -> bool {
        self.request(|reply| Command::ForceReconnect {
            endpoint: endpoint.clone(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn override_state(&self, endpoint: &Endpoint, state: AppState, payload: Payload) -> bool {
        self.request(|reply| Command::Override {
            endpoint: endpoint.clone(),
            state,
            payload,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Close every connection and stop the loop.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            tracing::debug!("Link runtime already stopped");
        }
    }
}

/// One component's subscription. Dropping it unsubscribes.
pub struct Session {
    id: SubscriptionId,
    endpoint: Endpoint,
    view: watch::Receiver<SessionView>,
    link: LinkHandle,
}

impl Session {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Wait for the next state or phase change.
    pub async fn changed(&mut self) -> Result<SessionView> {
        self.view
            .changed()
            .await
            .map_err(|_| LinkError::RuntimeClosed)?;
        Ok(self.view.borrow_and_update().clone())
    }

    pub async fn send<M: Serialize + ?Sized>(&self, message: &M) -> bool {
        self.link.send(&self.endpoint, message).await
    }

    pub async fn retry_connect(&self) -> bool {
        self.link.force_reconnect(&self.endpoint).await
    }

    pub async fn override_state(&self, state: AppState, payload: Payload) -> bool {
        self.link.override_state(&self.endpoint, state, payload).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.link.commands.send(Command::Unsubscribe { id: self.id });
    }
}

async fn run(
    mut manager: Manager,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    tracing::debug!("Link runtime started");
    loop {
        tokio::select! {
            Some(event) = events.recv() => manager.intake(event),
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    manager.shutdown();
                    let _ = reply.send(());
                    break;
                }
                Some(command) => handle(&mut manager, command),
                None => {
                    manager.shutdown();
                    break;
                }
            },
        }
    }
    tracing::info!("Link runtime stopped");
}

fn handle(manager: &mut Manager, command: Command) {
    match command {
        Command::Subscribe { endpoint, reply } => {
            let (tx, rx) = watch::channel(SessionView::default());
            let id = manager.subscribe(&endpoint, Box::new(WatchSubscriber { tx }));
            if reply.send((id, rx)).is_err() {
                manager.unsubscribe(id);
            }
        }
        Command::Unsubscribe { id } => {
            manager.unsubscribe(id);
        }
        Command::Send {
            endpoint,
            message,
            reply,
        } => {
            let _ = reply.send(manager.send(&endpoint, &message));
        }
        Command::ForceReconnect { endpoint, reply } => {
            let _ = reply.send(manager.force_reconnect(&endpoint));
        }
        Command::Override {
            endpoint,
            state,
            payload,
            reply,
        } => {
            let _ = reply.send(manager.override_state(&endpoint, state, payload));
        }
        Command::Shutdown { reply } => {
            manager.shutdown();
            let _ = reply.send(());
        }
    }
}
