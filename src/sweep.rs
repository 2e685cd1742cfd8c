//! Recurring deadline sweep
//!
//! Deadline transitions are never evaluated on caller paths. A sweep tick
//! walks every ANNOUNCED record, evaluates it against ingested usage and
//! persists whatever changed. [`Sweeper`] runs ticks on a background thread.

use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::SchemaRegistry;

/// Outcome of one sweep tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub at: Option<DateTime<Utc>>,
    /// ANNOUNCED records evaluated
    pub evaluated: usize,
    pub approaching: usize,
    pub ready: usize,
    /// Records pushed back to ANNOUNCED by post-deadline usage
    pub escalated: usize,
    /// Records whose evaluation or persistence failed; retried next tick
    pub failures: usize,
    /// Usage samples dropped as older than the trailing window
    pub pruned: usize,
    /// REMOVED records archived after retention
    pub archived: usize,
}

impl SweepReport {
    pub fn transitions(&self) -> usize {
        self.ready + self.escalated
    }
}

/// Background thread running `sweep_tick` on an interval
///
/// Dropping the handle stops the thread and waits for the current tick.
pub struct Sweeper {
    shutdown: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(registry: Arc<SchemaRegistry>, interval: Duration) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("schema-evolution-sweep".to_string())
            .spawn(move || sweep_loop(registry, rx, interval))?;
        Ok(Self {
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("sweep thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn sweep_loop(registry: Arc<SchemaRegistry>, rx: mpsc::Receiver<()>, interval: Duration) {
    tracing::info!(interval_ms = interval.as_millis() as u64, "sweep started");
    loop {
        match rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Some(report) = registry.sweep_tick() {
                    if report.transitions() > 0 || report.failures > 0 {
                        tracing::info!(
                            evaluated = report.evaluated,
                            ready = report.ready,
                            escalated = report.escalated,
                            failures = report.failures,
                            "sweep tick"
                        );
                    }
                }
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::info!("sweep stopped");
}
