//! Shutdown coordinator
//!
//! Cancels every active worker, waits for each to finish its teardown and
//! makes sure its connection is closed. Runs at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::table::SlotTable;

/// What a shutdown pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers cancelled and joined
    pub workers_joined: usize,
    /// True if another shutdown had already started; nothing was done
    pub already_in_progress: bool,
}

pub struct ShutdownCoordinator {
    table: Arc<SlotTable>,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(table: Arc<SlotTable>, tracker: TaskTracker) -> Self {
        Self {
            table,
            tracker,
            started: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Cancel and join every worker
    ///
    /// The listener must already be closed so no new slot is reserved
    /// while workers are drained. Later calls return immediately.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return ShutdownReport {
                already_in_progress: true,
                ..ShutdownReport::default()
            };
        }

        let entries = self.table.drain_workers();
        info!("Shutting down {} client(s)", entries.len());

        // Signal everyone before joining anyone. Aborting the handles fails any
        // fan-out stuck on a peer that stopped reading, so its sender can
        // reach the cancellation check.
        for entry in &entries {
            entry.cancel.cancel();
            if let Some(outbound) = &entry.outbound {
                outbound.abort();
            }
        }

        let mut report = ShutdownReport::default();
        for entry in entries {
            if let Some(join) = entry.join {
                if let Err(e) = join.await {
                    error!("Worker for slot {} ended abnormally: {}", entry.lease, e);
                }
                report.workers_joined += 1;
            }

            if let Some(outbound) = entry.outbound {
                if let Err(e) = outbound.close().await {
                    debug!("Closing slot {}: {}", entry.lease, e);
                }
            }

            // A worker that panicked never reached its own release.
            if self.table.release(&entry.lease) {
                debug!("Released slot {} on behalf of its worker", entry.lease);
            }
            debug!(
                "Slot {} ({}) shut down",
                entry.lease,
                entry.identifier.unwrap_or_default()
            );
        }

        // Workers that released their slot before the drain may still be
        // sending their log-out notice.
        self.tracker.close();
        self.tracker.wait().await;

        report
    }
}
