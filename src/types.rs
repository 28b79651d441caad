//! Basic type definitions for the relay
//!
//! Provides newtype wrappers for type safety:
//! - `SlotIndex`: position of a client in the slot table
//! - `SlotLease`: a worker's claim on one reservation of a slot
//! - `Identifier`: display name announced during the handshake

/// Position of a slot within the client table (newtype pattern)
///
/// Stable for the lifetime of the table; used as the broadcast
/// exclusion key together with the lease generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(pub usize);

impl std::fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One reservation of a slot
///
/// The generation is bumped on every reservation, so a lease held by a
/// departed worker never matches the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotLease {
    pub index: SlotIndex,
    pub generation: u64,
}

impl SlotLease {
    pub fn new(index: SlotIndex, generation: u64) -> Self {
        Self { index, generation }
    }
}

impl std::fmt::Display for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Client display identifier
///
/// Not unique: two clients may announce the same name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Build an identifier from handshake bytes
    ///
    /// Input ends at the first NUL and is truncated to `max_len` bytes
    /// (on a char boundary).
    pub fn from_bytes(raw: &[u8], max_len: usize) -> Self {
        let text = String::from_utf8_lossy(until_nul(raw));
        let mut end = text.len().min(max_len);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        Self(text[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bytes up to, not including, the first NUL
///
/// A NUL ends the fragment, as it would for a C string; anything after it
/// is dropped so a client cannot smuggle a second frame onto the wire.
pub fn until_nul(raw: &[u8]) -> &[u8] {
    match raw.iter().position(|&b| b == 0) {
        Some(end) => &raw[..end],
        None => raw,
    }
}

/// Length of an unfinished UTF-8 sequence at the end of `bytes`
///
/// Returns 0 when the buffer ends on a character boundary (or on bytes that
/// are not UTF-8 at all, which are passed through untouched).
pub fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let b = bytes[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if have < width { have } else { 0 };
    }
    0
}
