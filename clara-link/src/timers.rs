//! Timers on the tokio clock.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{LinkEvent, TimerKey};
use crate::transport::TimerQueue;

/// One sleeping task per timer. Cancelling aborts the task; a timer that
/// fires anyway is dropped by the manager's token check.
pub struct TokioTimers {
    events: mpsc::UnboundedSender<LinkEvent>,
    tasks: HashMap<TimerKey, JoinHandle<()>>,
}

impl TokioTimers {
    pub fn new(events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            events,
            tasks: HashMap::new(),
        }
    }
}

impl TimerQueue for TokioTimers {
    fn schedule(&mut self, key: TimerKey, after: Duration) {
        self.tasks.retain(|_, task| !task.is_finished());

        let events = self.events.clone();
        let fired = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(LinkEvent::TimerFired { key: fired });
        });
        if let Some(previous) = self.tasks.insert(key, task) {
            previous.abort();
        }
    }

    fn cancel(&mut self, key: &TimerKey) {
        if let Some(task) = self.tasks.remove(key) {
            task.abort();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}
