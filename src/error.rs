//! Error types for the relay
//!
//! Defines setup/admission errors, slot table errors and per-recipient
//! delivery errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::SlotIndex;

/// Application-level errors
///
/// Only setup failures (bind, invalid configuration) are fatal to the
/// process; everything else is contained in the owning worker.
#[derive(Debug, Error)]
pub enum RelayError {
    /// IO error (listener setup, accept)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Slot table refused the operation
    #[error(transparent)]
    Table(#[from] TableError),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Slot table errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    /// Every slot is active
    #[error("Slot table is full ({capacity} clients)")]
    Full { capacity: usize },

    /// The lease no longer matches the slot (released or re-reserved)
    #[error("Stale lease for slot {0}")]
    StaleLease(SlotIndex),

    /// Identifier may only be recorded once per reservation
    #[error("Identifier already set for slot {0}")]
    IdentifierAlreadySet(SlotIndex),
}

/// Message delivery errors
///
/// Occurs when writing a frame to one recipient's connection fails.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}
