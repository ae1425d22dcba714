//! Monotonicity guard for inbound state updates.
//!
//! Stale or duplicate pushes must never regress the visible stage. The
//! guard is a pure function of the current state and the incoming frame.

use serde_json::Value;

use crate::protocol::{AppState, Payload};

/// Why a frame was dropped. Not an error: rejected frames are expected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("state is not an integer: {0}")]
    NotAnInteger(String),
    #[error("state {0} is outside the supported range")]
    OutOfRange(i64),
    #[error("sleep push ignored after progressing to state {current}")]
    SleepRegression { current: AppState },
    #[error("menu push ignored during active chat")]
    StaleMenu,
}

/// Accepted `(state, payload)` pair. Both always replace the current ones.
pub type Accepted = (AppState, Payload);

/// Apply the guard rules in order:
///
/// 1. the state must be an integer in `0..=AppState::MAX`;
/// 2. sleep (0) is rejected once the current state is past sleep;
/// 3. menu (4) is rejected while in active chat (5);
/// 4. anything else is accepted.
pub fn accept(
    current: AppState,
    incoming_state: &Value,
    incoming_payload: Payload,
) -> Result<Accepted, Rejection> {
    let Some(code) = incoming_state.as_i64() else {
        return Err(Rejection::NotAnInteger(incoming_state.to_string()));
    };
    let incoming = u8::try_from(code)
        .ok()
        .and_then(AppState::new)
        .ok_or(Rejection::OutOfRange(code))?;

    if incoming == AppState::SLEEP && current > AppState::SLEEP {
        return Err(Rejection::SleepRegression { current });
    }
    if incoming == AppState::MENU && current == AppState::CHAT {
        return Err(Rejection::StaleMenu);
    }
    Ok((incoming, incoming_payload))
}
