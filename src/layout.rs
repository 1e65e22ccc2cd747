//! Tunables and the byte-offset arithmetic for the on-disk file and segment
//! layout: the segment header plus the bitset, hash index and entry space
//! that follow it.
//!
//! Grounded on `shm/layout.rs`'s `Header`/`Bucket`/`region_size`/`ht_offset`/
//! `slab_offset` family: fixed `#[repr(C)]` structs with compile-time size
//! assertions, plain functions computing byte offsets rather than a type
//! hierarchy. Generalized from a single fixed cache layout to a
//! bitset-allocator-plus-packed-index layout.

use std::sync::atomic::AtomicU64;

use crate::error::{Error, Result};

/// Bytes reserved for the segment header (lock word, counters, search hint).
/// Matches the fixed 64-byte `Header` convention in `shm/layout.rs`.
pub const SEGMENT_HEADER_SIZE: usize = 64;

/// Physical width of one hash-index slot. The packed hash index defines
/// `slotByteSize` as `ceil((keyBits+valueBits)/8)`, which may be narrower
/// than a word; this crate fixes the physical storage slot at 8 bytes
/// (`u64`) so every slot is natively atomic on every mmap-supporting target,
/// and uses `slotByteSize` only in the index's own `hlPos`/`step`/
/// `entryMask` arithmetic (see DESIGN.md, Open Question 1).
pub const SLOT_PHYS_SIZE: usize = 8;

/// All structures in a segment are aligned to this boundary.
const REGION_ALIGN: usize = 64;

/// Bytes reserved for the whole-file header preceding segment 0.
pub const GLOBAL_HEADER_SIZE: usize = 64;

pub const MAGIC: [u8; 8] = *b"SEGMAP01";

/// Fixed-address per-segment header: lock word, live-entry count, deleted
/// counter, and the bitset allocator's search hint.
///
/// All fields are atomics because the header is shared across threads and
/// processes mapping the same file; `AtomicU64` has the same size and
/// alignment as `u64`, so this struct's layout is stable across builds.
#[repr(C)]
pub struct SegmentHeader {
    /// Packed reader/update/write/wait-counter word, see `lock.rs`.
    pub lock_word: AtomicU64,
    /// Count of live entries in this segment.
    pub entries: AtomicU64,
    /// Count of entries removed since segment creation (monotonic).
    pub deleted: AtomicU64,
    /// Hint into the bitset allocator: search starts here.
    pub next_pos_to_search_from: AtomicU64,
    _pad: [u8; SEGMENT_HEADER_SIZE - 32],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == SEGMENT_HEADER_SIZE);

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Tunables governing a segment's on-disk layout.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLayout {
    pub chunk_size: u32,
    pub chunks_per_segment: u32,
    pub max_chunks_per_entry: u32,
    pub meta_data_bytes: u32,
    /// Value alignment, power of two bytes.
    pub alignment: u32,
    pub constantly_sized_entry: bool,
    pub worst_alignment: u32,
    pub actual_segments: u32,
    pub entries_per_segment: u32,
    pub lock_timeout_nanos: u64,
    /// Bits of partial hash packed into each hash-index slot.
    pub key_bits: u32,
    /// Bits of chunk position packed into each hash-index slot.
    pub value_bits: u32,
}

impl SegmentLayout {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chunk_size: u32,
        chunks_per_segment: u32,
        max_chunks_per_entry: u32,
        meta_data_bytes: u32,
        alignment: u32,
        constantly_sized_entry: bool,
        worst_alignment: u32,
        actual_segments: u32,
        entries_per_segment: u32,
        lock_timeout_nanos: u64,
        key_bits: u32,
        value_bits: u32,
    ) -> Result<Self> {
        if chunk_size == 0 || chunks_per_segment == 0 || entries_per_segment == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "chunk_size, chunks_per_segment and entries_per_segment must be non-zero",
            )));
        }
        if !alignment.is_power_of_two() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            )));
        }
        if max_chunks_per_entry == 0 || max_chunks_per_entry > chunks_per_segment {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "max_chunks_per_entry must be in (0, chunks_per_segment]",
            )));
        }
        if key_bits + value_bits == 0 || key_bits + value_bits > 64 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "key_bits + value_bits must be in (0, 64]",
            )));
        }
        Ok(SegmentLayout {
            chunk_size,
            chunks_per_segment,
            max_chunks_per_entry,
            meta_data_bytes,
            alignment,
            constantly_sized_entry,
            worst_alignment,
            actual_segments,
            entries_per_segment,
            lock_timeout_nanos,
            key_bits,
            value_bits,
        })
    }

    /// Hash table capacity: smallest power of two `>= ceil(1.5 * maxEntries)`.
    pub fn capacity(&self) -> u64 {
        let min = (self.entries_per_segment as u64 * 3).div_ceil(2);
        min.max(2).next_power_of_two()
    }

    pub fn capacity_mask(&self) -> u64 {
        self.capacity() - 1
    }

    /// `slotByteSize` used only for the hash index's own probe-position
    /// arithmetic, not for physical storage (see `SLOT_PHYS_SIZE`).
    pub fn slot_byte_size(&self) -> usize {
        ((self.key_bits + self.value_bits) as usize).div_ceil(8)
    }

    pub fn key_mask(&self) -> u64 {
        if self.key_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.key_bits) - 1
        }
    }

    pub fn entry_mask(&self) -> u64 {
        let bits = self.key_bits + self.value_bits;
        if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }

    pub fn hash_table_bytes(&self) -> usize {
        self.capacity() as usize * SLOT_PHYS_SIZE
    }

    pub fn free_list_bytes(&self) -> usize {
        (self.chunks_per_segment as usize).div_ceil(8)
    }

    pub fn entry_space_bytes(&self) -> usize {
        self.chunks_per_segment as usize * self.chunk_size as usize
    }

    pub fn hash_table_offset(&self) -> usize {
        round_up(SEGMENT_HEADER_SIZE, REGION_ALIGN)
    }

    pub fn free_list_offset(&self) -> usize {
        round_up(self.hash_table_offset() + self.hash_table_bytes(), REGION_ALIGN)
    }

    pub fn entry_space_offset(&self) -> usize {
        round_up(self.free_list_offset() + self.free_list_bytes(), REGION_ALIGN)
    }

    /// Total segment size, rounded so that `(segmentSize & 4093) >= 64`
    /// — this staggers segment headers across L1 cache sets.
    pub fn segment_size(&self) -> usize {
        let raw = self.entry_space_offset() + self.entry_space_bytes();
        let mut size = round_up(raw, REGION_ALIGN);
        while (size & 4093) < 64 {
            size += REGION_ALIGN;
        }
        size
    }

    pub fn segment_offset(&self, i: u32) -> usize {
        GLOBAL_HEADER_SIZE + i as usize * self.segment_size()
    }

    pub fn segment_header_offset(&self, i: u32) -> usize {
        self.segment_offset(i)
    }

    pub fn total_file_size(&self) -> usize {
        GLOBAL_HEADER_SIZE + self.actual_segments as usize * self.segment_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> SegmentLayout {
        SegmentLayout::new(64, 1024, 64, 0, 8, false, 8, 4, 600, 1_000_000_000, 24, 32).unwrap()
    }

    #[test]
    fn capacity_is_power_of_two_and_covers_load_factor() {
        let l = layout();
        assert!(l.capacity().is_power_of_two());
        assert!(l.capacity() as f64 >= l.entries_per_segment as f64 * 1.5);
    }

    #[test]
    fn offsets_are_monotonic_and_aligned() {
        let l = layout();
        assert_eq!(l.hash_table_offset() % REGION_ALIGN, 0);
        assert_eq!(l.free_list_offset() % REGION_ALIGN, 0);
        assert_eq!(l.entry_space_offset() % REGION_ALIGN, 0);
        assert!(l.hash_table_offset() < l.free_list_offset());
        assert!(l.free_list_offset() < l.entry_space_offset());
    }

    #[test]
    fn segment_size_obeys_cache_set_rule() {
        let l = layout();
        assert!((l.segment_size() & 4093) >= 64);
    }

    #[test]
    fn rejects_bad_alignment() {
        assert!(SegmentLayout::new(64, 1024, 64, 0, 3, false, 8, 4, 600, 0, 24, 32).is_err());
    }
}
