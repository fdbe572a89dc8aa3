//! Timer primitive.
//!
//! The engine arms one wakeup per job through [`TimerService`]. When a
//! wakeup elapses the implementation reports a [`TimerEvent`] on the channel
//! it was built with; the [`JobDispatcher`](crate::JobDispatcher) takes it
//! from there.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::SchedulerError;

/// Opaque id of one armed wakeup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerHandle(String);

impl TimerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A wakeup that elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub job_id: String,
    pub handle: TimerHandle,
}

/// Per-process wakeup primitive.
#[async_trait]
pub trait TimerService: Send + Sync {
    /// Arm a wakeup for `job_id` after `delay`.
    async fn schedule(
        &self,
        job_id: &str,
        delay: std::time::Duration,
    ) -> Result<TimerHandle, SchedulerError>;

    /// Disarm a wakeup. Returns false if it already fired or is unknown.
    async fn cancel(&self, handle: &TimerHandle) -> bool;
}

/// [`TimerService`] backed by one sleeping tokio task per wakeup.
pub struct TokioTimerService {
    next_id: AtomicU64,
    timers: Arc<DashMap<TimerHandle, AbortHandle>>,
    events: mpsc::UnboundedSender<TimerEvent>,
}

impl TokioTimerService {
    /// Create a timer service and the receiver its wakeups are delivered on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                next_id: AtomicU64::new(1),
                timers: Arc::new(DashMap::new()),
                events,
            },
            rx,
        )
    }

    /// Number of wakeups currently armed.
    pub fn armed(&self) -> usize {
        self.timers.len()
    }
}

#[async_trait]
impl TimerService for TokioTimerService {
    async fn schedule(
        &self,
        job_id: &str,
        delay: std::time::Duration,
    ) -> Result<TimerHandle, SchedulerError> {
        if self.events.is_closed() {
            return Err(SchedulerError::Timer(
                "timer event receiver dropped".to_string(),
            ));
        }

        let handle = TimerHandle(format!(
            "timer-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        let event = TimerEvent {
            job_id: job_id.to_string(),
            handle: handle.clone(),
        };
        let timers = Arc::clone(&self.timers);
        let events = self.events.clone();

        // Hold the map entry while spawning so a zero delay cannot fire
        // before the abort handle is recorded.
        let entry = self.timers.entry(handle.clone());
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if timers.remove(&event.handle).is_some() {
                trace!(job_id = %event.job_id, handle = %event.handle, "timer elapsed");
                let _ = events.send(event);
            }
        });
        entry.insert(task.abort_handle());

        debug!(job_id, handle = %handle, delay_ms = delay.as_millis() as u64, "timer armed");
        Ok(handle)
    }

    async fn cancel(&self, handle: &TimerHandle) -> bool {
        match self.timers.remove(handle) {
            Some((_, task)) => {
                task.abort();
                debug!(handle = %handle, "timer canceled");
                true
            }
            None => false,
        }
    }
}
