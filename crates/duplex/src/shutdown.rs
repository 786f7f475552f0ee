use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Handle for shutting down a background loop
///
/// Cloned handles share one flag. Loops sleep through
/// [`sleep`](Self::sleep), which returns early once shutdown is signalled.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until shutdown, whichever comes first.
    pub async fn sleep(&self, duration: Duration) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent shutdown is not missed.
        notified.as_mut().enable();
        if self.is_shutdown() {
            return;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}
