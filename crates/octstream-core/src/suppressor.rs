//! Duplicate-payload suppression.
//!
//! A static scene re-encodes to byte-identical packets. Those are dropped
//! instead of sent, but never for longer than
//! [`MAX_TIME_BETWEEN_DUPLICATE_PACKETS`], so the client still gets a periodic
//! keep-alive.

use std::time::{Duration, Instant};

/// Longest stretch of consecutive suppressed duplicates.
pub const MAX_TIME_BETWEEN_DUPLICATE_PACKETS: Duration = Duration::from_secs(1);

/// Remembers the last payload handed to the transport.
#[derive(Debug, Default)]
pub struct DuplicateSuppressor {
    last_payload: Vec<u8>,
    duplicate_count: u32,
    first_suppressed_at: Option<Instant>,
}

impl DuplicateSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the payload a packet held before it was reset.
    pub fn remember(&mut self, payload: Vec<u8>) {
        self.last_payload = payload;
    }

    /// Decide whether `payload` should be dropped.
    ///
    /// Only payload bytes are compared; stream headers carry a sequence number
    /// and timestamp that always differ. While the view is changing nothing is
    /// suppressed.
    pub fn should_suppress(&mut self, payload: &[u8], view_changing: bool, now: Instant) -> bool {
        if view_changing || payload.is_empty() || payload != self.last_payload.as_slice() {
            self.reset_count();
            return false;
        }

        self.duplicate_count += 1;
        let first = *self.first_suppressed_at.get_or_insert(now);
        if now.duration_since(first) < MAX_TIME_BETWEEN_DUPLICATE_PACKETS {
            true
        } else {
            self.reset_count();
            false
        }
    }

    /// Consecutive duplicates seen so far.
    pub fn duplicate_count(&self) -> u32 {
        self.duplicate_count
    }

    pub fn last_payload(&self) -> &[u8] {
        &self.last_payload
    }

    fn reset_count(&mut self) {
        self.duplicate_count = 0;
        self.first_suppressed_at = None;
    }
}
