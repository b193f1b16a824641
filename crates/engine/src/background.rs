//! Interval-driven background compaction.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

/// Runs one task on a fixed interval until stopped.
///
/// The worker sleeps on a condvar so shutdown interrupts it immediately
/// instead of waiting out the interval.
pub(crate) struct BackgroundCompactor {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundCompactor {
    pub(crate) fn spawn(interval: Duration, task: impl Fn() + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("limestone-compaction".to_string())
            .spawn(move || loop {
                {
                    let mut stop = worker_shared.stop.lock();
                    if *stop {
                        break;
                    }
                    let _ = worker_shared.wake.wait_for(&mut stop, interval);
                    if *stop {
                        break;
                    }
                }
                task();
            })
            .expect("failed to spawn background compaction thread");

        BackgroundCompactor {
            shared,
            handle: Some(handle),
        }
    }

    /// Signal the worker and join it.
    pub(crate) fn stop(&mut self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(
                    target: "limestone::engine",
                    "background compaction thread panicked"
                );
            }
        }
    }
}

impl Drop for BackgroundCompactor {
    fn drop(&mut self) {
        self.stop();
    }
}
