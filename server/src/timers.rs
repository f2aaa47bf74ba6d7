//! One-shot timers that report back through the event loop.
//!
//! A fired timer is just another `ServerEvent`, so it never touches
//! coordinator state directly. Dropping or cancelling a handle aborts the
//! sleeping task; a timer that already fired and is queued is filtered out by
//! the handler's existence check.

use crate::event::{ServerEvent, TimerEvent};
use log::debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Timers {
    event_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Timers {
    pub fn new(event_tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { event_tx }
    }

    /// Schedules `timer` to be delivered after `delay`. Must be called from
    /// within a tokio runtime.
    pub fn arm(&self, delay: Duration, timer: TimerEvent) -> TimerHandle {
        let event_tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = event_tx.send(ServerEvent::Timer(timer)) {
                debug!("Timer fired after event loop closed: {:?}", e.0);
            }
        });
        TimerHandle { task }
    }
}

/// Owner of an armed timer. The timer is aborted when the handle goes away.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
