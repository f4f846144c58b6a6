//! Named background thread running a task at a fixed interval.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

enum Signal {
    Wake,
    Stop,
}

struct Running {
    signals: Sender<Signal>,
    thread: JoinHandle<()>,
}

/// Polling loop with an interruptible sleep.
///
/// The task runs once right after `start` and then every `interval`, or
/// sooner when woken.
pub struct BackgroundWorker {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl BackgroundWorker {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn the loop. Returns `false` when it was already running or the
    /// thread could not be spawned.
    pub fn start(&self, interval: Duration, mut task: impl FnMut() + Send + 'static) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            tracing::info!(worker = self.name, "Worker already running");
            return false;
        }

        let (signals, receiver) = mpsc::channel();
        let name = self.name;
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tracing::info!(worker = name, ?interval, "Worker started");
                loop {
                    task();
                    match receiver.recv_timeout(interval) {
                        Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
                        Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!(worker = name, "Worker stopped");
            });

        match spawned {
            Ok(thread) => {
                *running = Some(Running { signals, thread });
                true
            }
            Err(error) => {
                tracing::error!(worker = self.name, %error, "Failed to spawn worker thread");
                false
            }
        }
    }

    /// Run the task as soon as the current iteration finishes.
    pub fn wake(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = running.as_ref() {
            // A closed channel means the thread is already exiting
            let _ = running.signals.send(Signal::Wake);
        }
    }

    /// Signal the loop to exit and join it. Waits for an in-flight task.
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };
        let _ = running.signals.send(Signal::Stop);
        if running.thread.join().is_err() {
            tracing::error!(worker = self.name, "Worker thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn wait_for(counter: &AtomicUsize, at_least: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < at_least {
            assert!(Instant::now() < deadline, "worker did not run");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn runs_immediately_and_on_wake() {
        let worker = BackgroundWorker::new("test-worker");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        assert!(worker.start(Duration::from_secs(3600), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        wait_for(&runs, 1);

        worker.wake();
        wait_for(&runs, 2);

        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn start_twice_is_a_no_op() {
        let worker = BackgroundWorker::new("test-worker");
        assert!(worker.start(Duration::from_secs(3600), || {}));
        assert!(!worker.start(Duration::from_secs(3600), || {}));
        assert!(worker.is_running());
        worker.stop();
        worker.stop();
        assert!(worker.start(Duration::from_secs(3600), || {}));
    }

    #[test]
    fn short_interval_keeps_polling() {
        let worker = BackgroundWorker::new("test-worker");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        worker.start(Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        wait_for(&runs, 3);
    }
}
