//! Outbound dispatch: best-effort, fire-and-forget.
//!
//! A frame is either written to the current open socket or dropped. There
//! is no queue and no retry: an intent sent during an outage must not be
//! replayed after reconnecting, since the audio window it referred to may
//! be gone.

use serde::Serialize;

use crate::error::{LinkError, Result};
use crate::event::ConnId;
use crate::transport::Transport;

pub fn encode<M: Serialize + ?Sized>(message: &M) -> Result<String> {
    serde_json::to_string(message).map_err(|e| LinkError::Encode(e.to_string()))
}

/// Write `message` to `conn` if there is an open socket. Returns whether
/// the transport accepted the frame.
pub fn dispatch<T, M>(transport: &mut T, conn: Option<ConnId>, message: &M) -> bool
where
    T: Transport + ?Sized,
    M: Serialize + ?Sized,
{
    let Some(conn) = conn else {
        tracing::debug!("Dropping outbound message: not connected");
        return false;
    };
    let text = match encode(message) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(%conn, error = %e, "Dropping outbound message");
            return false;
        }
    };
    match transport.send(conn, text) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(%conn, error = %e, "Outbound send failed");
            false
        }
    }
}
