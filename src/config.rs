//! Relay configuration
//!
//! Size limits and table capacity, fixed for the lifetime of a server.

use crate::error::RelayError;

/// Default number of simultaneous clients
pub const DEFAULT_CAPACITY: usize = 5;

/// Default maximum identifier length in bytes
pub const DEFAULT_MAX_IDENTIFIER_LEN: usize = 32;

/// Default size of one chat read in bytes
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Number of slots in the client table
    pub capacity: usize,
    /// Handshake read size; longer identifiers are truncated
    pub max_identifier_len: usize,
    /// Chat read size; one read is one relayed fragment
    pub max_message_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_identifier_len: DEFAULT_MAX_IDENTIFIER_LEN,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

impl RelayConfig {
    /// Config with the given capacity and default size limits
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.max_identifier_len == 0 {
            return Err(RelayError::InvalidConfig(
                "max identifier length must be at least 1".to_string(),
            ));
        }
        if self.max_message_len == 0 {
            return Err(RelayError::InvalidConfig(
                "max message length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
