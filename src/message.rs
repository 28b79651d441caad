//! Broadcast wire format
//!
//! Every relayed frame is ASCII text `"<identifier>> <body>"` followed by a
//! NUL terminator. There is no length prefix. Only the prefix is built
//! here; the body bytes are relayed exactly as received.

use crate::types::Identifier;

/// Body of the notice sent when a client leaves
pub const LOGOUT_BODY: &str = "log-out.....\n";

/// One frame to fan out to other clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// Sender's identifier at the time the frame was built
    pub from: Identifier,
    /// Raw bytes received from the sender
    pub body: Vec<u8>,
}

impl RelayMessage {
    pub fn new(from: Identifier, body: impl Into<Vec<u8>>) -> Self {
        Self {
            from,
            body: body.into(),
        }
    }

    /// Notice announcing that `from` left
    pub fn logout(from: Identifier) -> Self {
        Self::new(from, LOGOUT_BODY)
    }

    /// Formatted text without the terminator, for logs
    pub fn text(&self) -> String {
        self.to_string()
    }

    /// Bytes as written to the wire, NUL-terminated
    pub fn encode(&self) -> Vec<u8> {
        let prefix = self.from.as_str().as_bytes();
        let mut frame = Vec::with_capacity(prefix.len() + 2 + self.body.len() + 1);
        frame.extend_from_slice(prefix);
        frame.extend_from_slice(b"> ");
        frame.extend_from_slice(&self.body);
        frame.push(0);
        frame
    }
}

impl std::fmt::Display for RelayMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}> {}", self.from, String::from_utf8_lossy(&self.body))
    }
}
