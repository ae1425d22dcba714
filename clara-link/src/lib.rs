//! clara-link: shared backend connection and state synchronization for the
//! CLARA kiosk.
//!
//! Every UI component that needs the backend subscribes to one endpoint.
//! All subscribers of an endpoint share a single WebSocket, see the same
//! application state, and observe the same connection phase. The socket
//! reconnects with backoff, and short drops are hidden from the UI.
//!
//! The core is [`ConnectionManager`], a sans-IO state machine. [`LinkHandle`]
//! runs it on a tokio task with a tokio-tungstenite transport.

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod manager;
pub mod phase;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod sync;
pub mod timers;
pub mod transport;
pub mod ws;

pub use config::LinkConfig;
pub use endpoint::Endpoint;
pub use error::{LinkError, Result};
pub use manager::ConnectionManager;
pub use phase::Phase;
pub use protocol::{AppState, ChatView, Intent, Payload};
pub use runtime::{LinkHandle, Session, SessionView};
pub use sync::Rejection;
