use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives "changes are ready" signals from the dirty-state aggregator
///
/// Implementations must tolerate spurious calls: a signal may arrive after
/// the changes it announced were already consumed by a sync.
pub trait UpdateNotifier: Send + Sync {
    fn notify(&self);
}

impl UpdateNotifier for Notify {
    fn notify(&self) {
        // a single stored permit coalesces repeated signals
        self.notify_one();
    }
}

impl UpdateNotifier for mpsc::Sender<()> {
    fn notify(&self) {
        // a full channel already carries a pending signal
        let _ = self.try_send(());
    }
}

/// One-shot timer armed by the first change of a quiet period
///
/// Further changes leave an armed timer alone. `reset` cancels it and
/// re-enables arming for the next burst.
pub(crate) struct DebounceTimer {
    delay: Duration,
    notifier: Arc<dyn UpdateNotifier>,
    armed: bool,
    task: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    pub(crate) fn new(delay: Duration, notifier: Arc<dyn UpdateNotifier>) -> Self {
        Self {
            delay,
            notifier,
            armed: false,
            task: None,
        }
    }

    /// Arm the timer unless it already is; returns whether it was armed now
    pub(crate) fn arm(&mut self) -> bool {
        if self.armed {
            return false;
        }
        self.armed = true;
        let notifier = Arc::clone(&self.notifier);
        let delay = self.delay;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.task = Some(runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    debug!("⏰ Debounce window closed, notifying consumer");
                    notifier.notify();
                }));
            }
            Err(_) => {
                warn!("No async runtime for the debounce timer, notifying immediately");
                notifier.notify();
            }
        }
        true
    }

    #[must_use]
    pub(crate) const fn is_armed(&self) -> bool {
        self.armed
    }

    pub(crate) fn reset(&mut self) {
        self.armed = false;
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for DebounceTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceTimer")
            .field("delay", &self.delay)
            .field("armed", &self.is_armed())
            .finish_non_exhaustive()
    }
}
