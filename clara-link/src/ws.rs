//! WebSocket transport over tokio-tungstenite.
//!
//! Each socket runs in its own task. The manager only ever sees the task
//! through [`LinkEvent`]s: `Opened` once the handshake completes, one
//! `FrameReceived` per text frame, and exactly one `Closed` when the task
//! ends for any reason.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::endpoint::Endpoint;
use crate::error::{LinkError, Result};
use crate::event::{ConnId, LinkEvent};
use crate::transport::Transport;

pub struct TungsteniteTransport {
    events: mpsc::UnboundedSender<LinkEvent>,
    connect_timeout: Duration,
    /// Outbound queues by socket. Dropping a sender closes its socket.
    sockets: HashMap<ConnId, mpsc::UnboundedSender<String>>,
}

impl TungsteniteTransport {
    pub fn new(events: mpsc::UnboundedSender<LinkEvent>, connect_timeout: Duration) -> Self {
        Self {
            events,
            connect_timeout,
            sockets: HashMap::new(),
        }
    }
}

/// Build the handshake request, rejecting anything but plain `ws://`.
fn client_request(endpoint: &Endpoint) -> Result<Request> {
    let invalid = |reason: String| LinkError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| invalid(e.to_string()))?;
    match request.uri().scheme_str() {
        Some("ws") => Ok(request),
        Some(other) => Err(invalid(format!("unsupported scheme {other}"))),
        None => Err(invalid("missing scheme".to_string())),
    }
}

impl Transport for TungsteniteTransport {
    fn open(&mut self, endpoint: &Endpoint, conn: ConnId) -> Result<()> {
        let request = client_request(endpoint)?;
        // Sockets that ended on their own leave a dead sender behind.
        self.sockets.retain(|_, tx| !tx.is_closed());

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.sockets.insert(conn, out_tx);
        tokio::spawn(socket_task(
            conn,
            request,
            self.connect_timeout,
            out_rx,
            self.events.clone(),
        ));
        Ok(())
    }

    fn send(&mut self, conn: ConnId, text: String) -> Result<()> {
        let tx = self
            .sockets
            .get(&conn)
            .ok_or_else(|| LinkError::SendFailed(format!("{conn} is not open")))?;
        tx.send(text)
            .map_err(|_| LinkError::SendFailed(format!("{conn} has closed")))
    }

    fn close(&mut self, conn: ConnId) {
        self.sockets.remove(&conn);
    }
}

async fn socket_task(
    conn: ConnId,
    request: Request,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let reason = run_socket(conn, request, connect_timeout, &mut outbound, &events).await;
    tracing::debug!(%conn, %reason, "Socket task finished");
    let _ = events.send(LinkEvent::Closed { conn, reason });
}

/// Drive one socket to completion and return why it ended.
async fn run_socket(
    conn: ConnId,
    request: Request,
    connect_timeout: Duration,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> String {
    let connect = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request));
    let mut ws = tokio::select! {
        result = connect => match result {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return format!("connect failed: {e}"),
            Err(_) => {
                return format!("connect timed out after {}ms", connect_timeout.as_millis());
            }
        },
        // Nothing is written before `Opened`, so only the close matters here.
        None = outbound.recv() => return "closed by client before open".to_string(),
    };

    if events.send(LinkEvent::Opened { conn }).is_err() {
        let _ = ws.close(None).await;
        return "link runtime stopped".to_string();
    }

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = ws.send(Message::Text(text.into())).await {
                        return format!("send failed: {e}");
                    }
                }
                None => {
                    let _ = ws.close(None).await;
                    return "closed by client".to_string();
                }
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let event = LinkEvent::FrameReceived {
                        conn,
                        text: text.as_str().to_owned(),
                    };
                    if events.send(event).is_err() {
                        let _ = ws.close(None).await;
                        return "link runtime stopped".to_string();
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(f) => format!(
                            "server closed connection ({}): {}",
                            u16::from(f.code),
                            f.reason.as_str()
                        ),
                        None => "server closed connection".to_string(),
                    };
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!(%conn, len = data.len(), "Ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return format!("websocket error: {e}"),
                None => return "stream ended".to_string(),
            },
        }
    }
}
