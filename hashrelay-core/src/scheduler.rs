//! Background delivery loop.
//!
//! One worker thread wakes every poll interval, checks the queue, resolves
//! the collector and calls [`DeliveryEngine::send_now`]. Stopping interrupts
//! only the wait between cycles; a send in progress runs to completion.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::collector::DeliveryEngine;
use crate::error::Result;

const WORKER_NAME: &str = "hashrelay-sender";

struct Worker {
    handle: JoinHandle<()>,
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
}

/// Owner of the single background worker
pub struct Scheduler {
    engine: Arc<DeliveryEngine>,
    enabled: Arc<AtomicBool>,
    poll_interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    pub fn new(engine: Arc<DeliveryEngine>, enabled: Arc<AtomicBool>) -> Self {
        let poll_interval = engine.settings().poll_interval;
        Self {
            engine,
            enabled,
            poll_interval,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker unless it is already running or sending is disabled.
    pub fn start(&self) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            tracing::info!("Background sender is disabled; not starting worker");
            return Ok(());
        }

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            tracing::info!("Background worker already running");
            return Ok(());
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        let enabled = Arc::clone(&self.enabled);
        let poll_interval = self.poll_interval;

        let handle = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || {
                run_worker(&engine, &enabled, poll_interval, &stop_rx);
                let _ = done_tx.send(());
            })?;

        *worker = Some(Worker {
            handle,
            stop_tx,
            done_rx,
        });
        tracing::info!(poll_interval_secs = poll_interval.as_secs(), "Background worker started");
        Ok(())
    }

    /// Signal the worker to stop and wait up to `timeout` for it to exit.
    ///
    /// Returns false if the worker was still running when the timeout expired.
    /// It then stays registered, so `start()` will not spawn a second worker
    /// until it has finished, and a later `stop()` can still join it.
    pub fn stop(&self, timeout: Duration) -> bool {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(worker) = slot.as_ref() else {
            return true;
        };

        tracing::info!("Stopping background worker");
        let _ = worker.stop_tx.send(());

        match worker.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = slot.take() {
                    if worker.handle.join().is_err() {
                        tracing::error!("Background worker panicked");
                    }
                }
                tracing::info!("Background worker stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Background worker did not stop within timeout"
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Dropping the stop sender wakes the worker, which then exits on its own
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.stop_tx.send(());
        }
    }
}

fn run_worker(
    engine: &DeliveryEngine,
    enabled: &AtomicBool,
    poll_interval: Duration,
    stop_rx: &Receiver<()>,
) {
    tracing::info!(poll_interval_secs = poll_interval.as_secs(), "Worker running");

    loop {
        if enabled.load(Ordering::Acquire) {
            run_cycle(engine);
        }

        match stop_rx.recv_timeout(poll_interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!("Worker exiting");
}

/// One scheduler cycle. Never panics and never returns an error: the loop
/// must outlive any single failed delivery.
pub(crate) fn run_cycle(engine: &DeliveryEngine) {
    if panic::catch_unwind(AssertUnwindSafe(|| cycle(engine))).is_err() {
        tracing::error!("Worker: send cycle panicked");
        engine.mark_failure("send cycle panicked");
    }
}

fn cycle(engine: &DeliveryEngine) {
    match engine.store().len() {
        Ok(0) => {
            tracing::debug!("Worker: no pending records");
            return;
        }
        Ok(count) => tracing::info!(count, "Worker: found pending records"),
        Err(e) => {
            tracing::error!(error = %e, "Worker: error reading pending records");
            engine.mark_failure(&format!("Read error: {}", e));
            return;
        }
    }

    if !engine.resolver().resolve() {
        engine.mark_no_connection("cannot fetch collector address");
        return;
    }

    let status = engine.send_now();
    tracing::info!(status = %status, "Worker: send cycle finished");
}
