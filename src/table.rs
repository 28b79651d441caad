//! Client slot table
//!
//! Fixed-capacity registry of active connections. Reservation, release,
//! identifier assignment and broadcast iteration all share one lock, held
//! only for short non-blocking sections: no socket I/O happens under it.

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TableError;
use crate::slot::{ClientSlot, Outbound};
use crate::types::{Identifier, SlotIndex, SlotLease};

/// Public view of one active slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub index: SlotIndex,
    pub identifier: Option<Identifier>,
}

/// Handles taken out of the table for the shutdown coordinator
#[derive(Debug)]
pub struct WorkerEntry {
    pub lease: SlotLease,
    pub identifier: Option<Identifier>,
    pub cancel: CancellationToken,
    pub join: Option<JoinHandle<()>>,
    pub outbound: Option<Outbound>,
}

#[derive(Debug)]
pub struct SlotTable {
    slots: Mutex<Vec<ClientSlot>>,
}

impl SlotTable {
    /// Create a table of `capacity` inactive slots
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|i| ClientSlot::new(SlotIndex(i))).collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Claim the first inactive slot
    ///
    /// The slot takes ownership of the connection's write side and the
    /// worker's cancellation token in the same critical section.
    pub fn reserve(
        &self,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> Result<SlotLease, TableError> {
        let mut slots = self.slots.lock();
        let capacity = slots.len();
        let Some(slot) = slots.iter_mut().find(|s| !s.active) else {
            return Err(TableError::Full { capacity });
        };
        let lease = slot.occupy(outbound, cancel);
        debug!("Reserved slot {}", lease);
        Ok(lease)
    }

    /// Return a slot to the free pool
    ///
    /// Returns false if the lease is stale (already released, or the index
    /// has since been handed to another worker); the slot is left untouched.
    pub fn release(&self, lease: &SlotLease) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(lease.index.0) {
            Some(slot) if slot.is_held_by(lease) => {
                slot.vacate();
                debug!("Released slot {}", lease);
                true
            }
            _ => false,
        }
    }

    /// Record the handshake identifier, once per reservation
    pub fn set_identifier(&self, lease: &SlotLease, identifier: Identifier) -> Result<(), TableError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(lease.index.0)
            .filter(|s| s.is_held_by(lease))
            .ok_or(TableError::StaleLease(lease.index))?;
        if slot.identifier.is_some() {
            return Err(TableError::IdentifierAlreadySet(lease.index));
        }
        slot.identifier = Some(identifier);
        Ok(())
    }

    /// Identifier recorded for this reservation, if any
    pub fn identifier(&self, lease: &SlotLease) -> Option<Identifier> {
        let slots = self.slots.lock();
        slots
            .get(lease.index.0)
            .filter(|s| s.is_held_by(lease))
            .and_then(|s| s.identifier.clone())
    }

    /// Visit every active slot except the one held by `except`
    ///
    /// Runs under the table lock, so `f` sees one consistent snapshot and
    /// must not block. A slot re-reserved at the same index with a newer
    /// generation is not excluded.
    pub fn for_each_active_except<F>(&self, except: &SlotLease, mut f: F)
    where
        F: FnMut(SlotIndex, &Outbound),
    {
        let slots = self.slots.lock();
        for slot in slots.iter().filter(|s| s.active && !s.is_held_by(except)) {
            if let Some(outbound) = &slot.outbound {
                f(slot.index, outbound);
            }
        }
    }

    /// Store the task handle of the worker serving `lease`
    ///
    /// Hands the join handle back if the worker already released its slot.
    pub fn attach_worker(
        &self,
        lease: &SlotLease,
        join: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let mut slots = self.slots.lock();
        match slots
            .get_mut(lease.index.0)
            .filter(|s| s.is_held_by(lease))
            .and_then(|s| s.worker.as_mut())
        {
            Some(worker) => {
                worker.join = Some(join);
                Ok(())
            }
            None => Err(join),
        }
    }

    /// Take the worker handles of every active slot
    ///
    /// Slots stay active; each worker releases its own slot during teardown.
    pub fn drain_workers(&self) -> Vec<WorkerEntry> {
        let mut slots = self.slots.lock();
        slots
            .iter_mut()
            .filter(|s| s.active)
            .filter_map(|s| {
                let lease = s.lease();
                let identifier = s.identifier.clone();
                let outbound = s.outbound.clone();
                s.worker.as_mut().map(|w| WorkerEntry {
                    lease,
                    identifier,
                    cancel: w.cancel.clone(),
                    join: w.join.take(),
                    outbound,
                })
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.active).count()
    }

    /// Active slots in index order
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.active)
            .map(|s| SlotInfo {
                index: s.index,
                identifier: s.identifier.clone(),
            })
            .collect()
    }
}
