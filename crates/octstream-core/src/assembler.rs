//! Byte accumulator the tree encoder writes into.
//!
//! The assembler holds one section of encoded tree content. In compressed
//! mode the size limit applies to the LZ4-compressed form, so an append is
//! only accepted if the whole section still compresses within the target.

use lz4_flex::compress_prepend_size;

/// Accumulates encoded bytes for one packet section.
#[derive(Debug, Clone)]
pub struct PacketAssembler {
    compressed: bool,
    target_size: usize,
    buffer: Vec<u8>,
    /// Size of the compressed form of `buffer`, kept in step with appends.
    compressed_size: usize,
}

impl PacketAssembler {
    pub fn new(compressed: bool, target_size: usize) -> Self {
        Self {
            compressed,
            target_size,
            buffer: Vec::with_capacity(target_size),
            compressed_size: 0,
        }
    }

    /// Switch mode and size limit. Discards any content.
    pub fn change_settings(&mut self, compressed: bool, target_size: usize) {
        self.compressed = compressed;
        self.target_size = target_size;
        self.reset();
    }

    /// Discard content, keeping the current settings.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.compressed_size = 0;
    }

    /// Append `bytes` if the section stays within the target size. Returns
    /// `false` and leaves the section untouched otherwise.
    pub fn try_append(&mut self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        if !self.compressed {
            if self.buffer.len() + bytes.len() > self.target_size {
                return false;
            }
            self.buffer.extend_from_slice(bytes);
            return true;
        }

        let mark = self.buffer.len();
        self.buffer.extend_from_slice(bytes);
        let size = compress_prepend_size(&self.buffer).len();
        if size > self.target_size {
            self.buffer.truncate(mark);
            return false;
        }
        self.compressed_size = size;
        true
    }

    pub fn has_content(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Uncompressed bytes held so far.
    pub fn uncompressed_len(&self) -> usize {
        self.buffer.len()
    }

    /// Size of what [`finalized`](Self::finalized) would return.
    pub fn finalized_size(&self) -> usize {
        if self.compressed {
            self.compressed_size
        } else {
            self.buffer.len()
        }
    }

    /// The section as it goes on the wire: an LZ4 size-prepended block in
    /// compressed mode, the raw bytes otherwise.
    pub fn finalized(&self) -> Vec<u8> {
        if !self.has_content() {
            return Vec::new();
        }
        if self.compressed {
            compress_prepend_size(&self.buffer)
        } else {
            self.buffer.clone()
        }
    }

    /// Finalize and clear in one step.
    pub fn take_finalized(&mut self) -> Vec<u8> {
        let out = self.finalized();
        self.reset();
        out
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Uncompressed bytes that still fit. Only exact in uncompressed mode; in
    /// compressed mode it is a lower bound on what the encoder may try.
    pub fn remaining(&self) -> usize {
        self.target_size.saturating_sub(self.finalized_size())
    }
}
