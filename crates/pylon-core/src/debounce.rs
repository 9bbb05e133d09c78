//! Write-after-quiet-period persistence helper.
//!
//! Arm on every write; the flush callback runs once the writes go quiet
//! for the configured delay, on an explicit `flush_now`, or when the
//! debouncer is dropped and its channel drains.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

/// Debounced flush trigger.
///
/// The callback is synchronous by design: stores flush with plain
/// best-effort file writes.
pub struct Debouncer {
    notify: mpsc::UnboundedSender<()>,
    flush: Arc<dyn Fn() + Send + Sync>,
}

impl Debouncer {
    /// Create a debouncer and spawn its timer task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(delay: Duration, flush: Arc<dyn Fn() + Send + Sync>) -> Self {
        let (notify, mut rx) = mpsc::unbounded_channel::<()>();
        let task_flush = Arc::clone(&flush);

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Restart the quiet period on every further write.
                loop {
                    match tokio::time::timeout(delay, rx.recv()).await {
                        Ok(Some(())) => {}
                        Ok(None) => {
                            task_flush();
                            return;
                        }
                        Err(_) => break,
                    }
                }
                task_flush();
            }
        });

        Self { notify, flush }
    }

    /// Arm the timer; called after every write.
    pub fn arm(&self) {
        let _ = self.notify.send(());
    }

    /// Flush immediately, bypassing the timer.
    pub fn flush_now(&self) {
        (self.flush)();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn flushes_once_after_quiet_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let debouncer = Debouncer::new(
            Duration::from_millis(20),
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for _ in 0..5 {
            debouncer.arm();
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn explicit_flush_is_immediate() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let debouncer = Debouncer::new(
            Duration::from_secs(60),
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        debouncer.arm();
        debouncer.flush_now();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
