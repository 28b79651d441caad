//! Broadcast relay
//!
//! Fans a sender's text out to every other active slot. Recipients are
//! collected from the table under its lock; the writes happen after the
//! lock is dropped, so a slow socket never stalls reserve or release.
//! A write stuck on a peer that stopped reading only ends when that peer's
//! handle is closed.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::message::RelayMessage;
use crate::slot::Outbound;
use crate::table::SlotTable;
use crate::types::{SlotIndex, SlotLease};

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct BroadcastRelay {
    table: Arc<SlotTable>,
    /// Serializes fan-outs: first to acquire is first delivered everywhere
    order: Mutex<()>,
}

impl BroadcastRelay {
    pub fn new(table: Arc<SlotTable>) -> Self {
        Self {
            table,
            order: Mutex::new(()),
        }
    }

    /// Relay `body` from the holder of `sender` to everyone else
    ///
    /// Uses the identifier recorded for the sender at call time. Returns
    /// once every recipient write has completed or failed.
    pub async fn broadcast(&self, sender: &SlotLease, body: impl Into<Vec<u8>>) -> DeliveryReport {
        let from = self.table.identifier(sender).unwrap_or_default();
        self.deliver(sender, &RelayMessage::new(from, body)).await
    }

    /// Deliver a prebuilt frame to every active slot except `sender`
    ///
    /// Used for notices sent after the sender has already released its slot.
    pub async fn deliver(&self, sender: &SlotLease, message: &RelayMessage) -> DeliveryReport {
        let frame = message.encode();
        let _turn = self.order.lock().await;

        let mut recipients: Vec<(SlotIndex, Outbound)> = Vec::new();
        self.table.for_each_active_except(sender, |index, outbound| {
            recipients.push((index, outbound.clone()));
        });

        debug!("{}", message);

        let mut report = DeliveryReport::default();
        for (index, outbound) in recipients {
            match outbound.send(&frame).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    // The recipient's own worker tears itself down on its next read.
                    warn!("Delivery to slot {} failed: {}", index, e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}
