use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Snapshot of everything a presentation layer needs to render a controller.
///
/// Snapshots are published whole through a single watch channel, so a
/// subscriber always sees a consistent state and never needs its own locking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub is_running: bool,
    pub output_text: String,
    pub load_status: String,
    pub stats_text: String,
}

/// Publishes [`ControllerState`] updates to any number of subscribers.
///
/// Every mutation goes through `send_modify` on the one sender, which is the
/// only place controller state is ever written.
#[derive(Clone)]
pub struct StateTracker {
    sender: Arc<watch::Sender<ControllerState>>,
    receiver: watch::Receiver<ControllerState>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(ControllerState::default());
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.receiver.clone()
    }

    pub fn snapshot(&self) -> ControllerState {
        self.receiver.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.receiver.borrow().is_running
    }

    pub fn set_load_status(&self, status: &str) {
        self.sender
            .send_modify(|state| state.load_status = status.to_string());
    }

    pub fn set_stats(&self, stats: &str) {
        self.sender
            .send_modify(|state| state.stats_text = stats.to_string());
    }

    pub fn set_output(&self, text: &str) {
        self.sender
            .send_modify(|state| state.output_text = text.to_string());
    }

    /// Mark the start of a generation run: running, with a cleared buffer.
    pub fn begin_run(&self) {
        self.sender.send_modify(|state| {
            state.is_running = true;
            state.output_text.clear();
        });
    }

    /// Terminal update for a successful run, applied as one atomic snapshot:
    /// the output is corrected if the last cadenced publish was stale, the
    /// run flag drops, and the throughput suffix lands on the stats line.
    pub fn finish(&self, final_text: &str, stats_suffix: &str) {
        self.sender.send_modify(|state| {
            if state.output_text != final_text {
                state.output_text = final_text.to_string();
            }
            state.is_running = false;
            state.stats_text.push_str(stats_suffix);
        });
    }

    /// Terminal update for a failed run.
    pub fn fail(&self, message: &str) {
        self.sender.send_modify(|state| {
            state.is_running = false;
            state.output_text = message.to_string();
        });
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation flag, polled between token-production steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
