//! Seams between the sans-IO manager and the outside world.
//!
//! The manager calls these synchronously from inside its event loop; they
//! must not block. Results come back later as [`LinkEvent`]s.
//!
//! [`LinkEvent`]: crate::event::LinkEvent

use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::event::{ConnId, TimerKey};

/// Opens, writes to, and closes sockets.
pub trait Transport: Send {
    /// Start opening a socket. An `Err` is a construction failure; success
    /// is later reported as `Opened` and any failure after this returns as
    /// `Closed`.
    fn open(&mut self, endpoint: &Endpoint, conn: ConnId) -> Result<()>;

    /// Queue a text frame on an open socket.
    fn send(&mut self, conn: ConnId, text: String) -> Result<()>;

    /// Start closing a socket. The transport must eventually report
    /// `Closed` for it, even if it was still connecting.
    fn close(&mut self, conn: ConnId);
}

/// Wall-clock timers that fire back into the manager as `TimerFired`.
pub trait TimerQueue: Send {
    fn schedule(&mut self, key: TimerKey, after: Duration);
    fn cancel(&mut self, key: &TimerKey);
}
