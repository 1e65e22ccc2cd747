//! Component B: the packed open-addressed hash index.
//!
//! Grounded directly on `shm/hashtable.rs`'s `ht_lookup`/`ht_insert`/
//! `ht_remove` — linear probing over a power-of-two-sized table with
//! backward-shift deletion. That teacher code uses a fixed 16-byte `Bucket`
//! (`hash: u64, slot_index: i32`); this generalizes the bucket to a single
//! bit-packed `u64` word (`keyBits` of partial hash, `valueBits` of chunk
//! position, remaining high bits left untouched for future layouts) because
//! the physical slot here is fixed at one word (see `layout::SLOT_PHYS_SIZE`).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::layout::SegmentLayout;

/// A view over one segment's hash-index words. Does not own the memory —
/// `slots` borrows directly from the mapped region (or, in tests, from a
/// `Vec<AtomicU64>`).
pub struct HashIndex<'a> {
    slots: &'a [AtomicU64],
    capacity_mask: u64,
    key_bits: u32,
    key_mask: u64,
    value_mask: u64,
    entry_mask: u64,
}

impl<'a> HashIndex<'a> {
    pub fn new(slots: &'a [AtomicU64], layout: &SegmentLayout) -> Self {
        debug_assert_eq!(slots.len() as u64, layout.capacity());
        let value_mask = if layout.value_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << layout.value_bits) - 1
        };
        HashIndex {
            slots,
            capacity_mask: layout.capacity_mask(),
            key_bits: layout.key_bits,
            key_mask: layout.key_mask(),
            value_mask,
            entry_mask: layout.entry_mask(),
        }
    }

    /// `maskPartialHash`: fold a full hash down to `keyBits`, reserving 0
    /// for "empty".
    pub fn mask_partial_hash(&self, h: u64) -> u64 {
        let masked = h & self.key_mask;
        if masked == 0 {
            self.key_mask
        } else {
            masked
        }
    }

    #[inline]
    fn hl_pos(&self, partial_hash: u64) -> u64 {
        partial_hash & self.capacity_mask
    }

    #[inline]
    fn step(&self, pos: u64) -> u64 {
        (pos + 1) & self.capacity_mask
    }

    #[inline]
    fn step_back(&self, pos: u64) -> u64 {
        (pos.wrapping_add(self.capacity_mask)) & self.capacity_mask
    }

    #[inline]
    fn load(&self, pos: u64) -> u64 {
        self.slots[pos as usize].load(Ordering::Acquire)
    }

    #[inline]
    fn key_field(&self, word: u64) -> u64 {
        word & self.key_mask
    }

    #[inline]
    fn value_field(&self, word: u64) -> u64 {
        (word >> self.key_bits) & self.value_mask
    }

    #[inline]
    fn is_empty_word(&self, word: u64) -> bool {
        self.key_field(word) == 0
    }

    #[inline]
    fn pack(&self, key: u64, value: u64) -> u64 {
        (key & self.key_mask) | ((value & self.value_mask) << self.key_bits)
    }

    /// Read-modify-write masked to `entryMask`, preserving whatever lives in
    /// the word's unused high bits.
    fn store_masked(&self, pos: u64, low_bits: u64) {
        let dest_old = self.load(pos);
        let new = (dest_old & !self.entry_mask) | (low_bits & self.entry_mask);
        self.slots[pos as usize].store(new, Ordering::Release);
    }

    fn clear_slot(&self, pos: u64) {
        let old = self.load(pos);
        self.slots[pos as usize].store(old & !self.entry_mask, Ordering::Release);
    }

    /// `find`: positions whose key field equals `partial_hash`, walking from
    /// `hlPos` and stopping at the first empty slot.
    pub fn find(&self, partial_hash: u64) -> Find<'_, 'a> {
        Find {
            index: self,
            partial_hash,
            pos: self.hl_pos(partial_hash),
            done: false,
        }
    }

    /// `insert`: walk from `hlPos`, publish into the first empty slot.
    /// Never overwrites an occupied slot. Returns the slot position.
    pub fn insert(&self, partial_hash: u64, chunk_pos: u64) -> u64 {
        let mut pos = self.hl_pos(partial_hash);
        loop {
            let word = self.load(pos);
            if self.is_empty_word(word) {
                self.store_masked(pos, self.pack(partial_hash, chunk_pos));
                log::trace!(target: "segmap::index", "inserted hash=0x{partial_hash:x} chunk_pos={chunk_pos} at slot {pos}");
                return pos;
            }
            pos = self.step(pos);
        }
    }

    /// `remove`: backward-shift deletion starting at `remove_pos`. Returns
    /// the final cleared position — callers compare it against their
    /// original probe position to decide whether to step their iteration
    /// cursor back.
    pub fn remove(&self, remove_pos: u64) -> u64 {
        let mut pos_to_remove = remove_pos;
        let mut pos_to_shift = self.step(pos_to_remove);
        loop {
            let word = self.load(pos_to_shift);
            if self.is_empty_word(word) {
                break;
            }
            let home = self.hl_pos(self.key_field(word));
            if Self::belongs_before(home, pos_to_remove, pos_to_shift) {
                self.store_masked(pos_to_remove, word);
                pos_to_remove = pos_to_shift;
            }
            pos_to_shift = self.step(pos_to_shift);
        }
        self.clear_slot(pos_to_remove);
        log::trace!(target: "segmap::index", "removed slot {remove_pos}, backward-shift cleared {pos_to_remove}");
        pos_to_remove
    }

    fn belongs_before(home: u64, pos_to_remove: u64, pos_to_shift: u64) -> bool {
        if home <= pos_to_remove && pos_to_remove <= pos_to_shift {
            true
        } else if pos_to_shift < home {
            home <= pos_to_remove || pos_to_remove <= pos_to_shift
        } else {
            false
        }
    }

    /// `putValueVolatile`: update only the value field of an occupied slot,
    /// preserving its key field and any unused high bits.
    pub fn put_value_volatile(&self, slot_pos: u64, new_chunk_pos: u64) {
        let word = self.load(slot_pos);
        let key = self.key_field(word);
        self.store_masked(slot_pos, self.pack(key, new_chunk_pos));
        log::trace!(target: "segmap::index", "republished slot {slot_pos} -> chunk_pos={new_chunk_pos}");
    }

    /// Value field of whatever currently occupies `pos`.
    pub fn value_at(&self, pos: u64) -> u64 {
        self.value_field(self.load(pos))
    }

    /// True if `pos` holds no entry.
    pub fn is_empty(&self, pos: u64) -> bool {
        self.is_empty_word(self.load(pos))
    }

    /// Walk forward from slot 0 to the first empty slot — used to pick a
    /// scan starting point that is guaranteed not to be mid-probe-run.
    pub fn first_empty_from_zero(&self) -> u64 {
        let mut pos = 0u64;
        while !self.is_empty(pos) {
            pos = self.step(pos);
        }
        pos
    }

    pub fn step_forward(&self, pos: u64) -> u64 {
        self.step(pos)
    }

    pub fn step_backward(&self, pos: u64) -> u64 {
        self.step_back(pos)
    }
}

pub struct Find<'b, 'a> {
    index: &'b HashIndex<'a>,
    partial_hash: u64,
    pos: u64,
    done: bool,
}

impl Iterator for Find<'_, '_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        loop {
            if self.done {
                return None;
            }
            let word = self.index.load(self.pos);
            if self.index.is_empty_word(word) {
                self.done = true;
                return None;
            }
            let candidate = self.pos;
            self.pos = self.index.step(self.pos);
            if self.index.key_field(word) == self.partial_hash {
                return Some(candidate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn layout(entries_per_segment: u32, key_bits: u32, value_bits: u32) -> SegmentLayout {
        SegmentLayout::new(64, 1024, 64, 0, 8, false, 8, 1, entries_per_segment, 1_000_000_000, key_bits, value_bits)
            .unwrap()
    }

    fn slots(n: usize) -> Vec<AtomicU64> {
        (0..n).map(|_| AtomicU64::new(0)).collect()
    }

    #[test]
    fn insert_find_roundtrip() -> Result<()> {
        let l = layout(4, 24, 32);
        let s = slots(l.capacity() as usize);
        let idx = HashIndex::new(&s, &l);
        let h = idx.mask_partial_hash(0xABCDEF);
        let pos = idx.insert(h, 777);
        let found: Vec<u64> = idx.find(h).collect();
        assert_eq!(found, vec![pos]);
        assert_eq!(idx.value_at(pos), 777);
        Ok(())
    }

    #[test]
    fn linear_probe_wraps_past_capacity() {
        let l = layout(2, 4, 4); // tiny capacity forces collisions
        let s = slots(l.capacity() as usize);
        let idx = HashIndex::new(&s, &l);
        let cap = l.capacity();
        // Force every insert into the same home slot to exercise probing.
        let h = idx.mask_partial_hash(1);
        let mut positions = vec![];
        for v in 0..cap {
            positions.push(idx.insert(h, v));
        }
        let unique: std::collections::HashSet<_> = positions.iter().collect();
        assert_eq!(unique.len(), positions.len() as usize, "no two entries share a slot");
    }

    #[test]
    fn backward_shift_deletion_reconnects_probe_chain() {
        let l = layout(4, 4, 4);
        let s = slots(l.capacity() as usize);
        let idx = HashIndex::new(&s, &l);
        let h = idx.mask_partial_hash(1);
        let p0 = idx.insert(h, 10);
        let p1 = idx.insert(h, 20);
        let p2 = idx.insert(h, 30);

        idx.remove(p0);

        // p0 is now either empty (if nothing shifted back) or holds what
        // used to be at p1; either way all remaining values must still be
        // reachable via find(h), and find must not see a phantom empty gap
        // cutting off entries that still exist.
        let remaining: std::collections::HashSet<u64> = idx.find(h).map(|pos| idx.value_at(pos)).collect();
        assert!(remaining.contains(&20));
        assert!(remaining.contains(&30));
        let _ = p1;
        let _ = p2;
    }

    /// Capacity 8, keys homed at slots 6, 7, 0, 1 (the
    /// entry at slot 1 arrived there by colliding with slot 0's home and
    /// probing forward, so its *natural* home is 0, not 1). Deleting the
    /// slot-0 entry must pull the slot-1 entry back into slot 0, since home
    /// 0 is `<=` the vacated slot (0) walking forward — the entry
    /// "belongs before" slot 1 in probe order. A sibling entry at slot 7,
    /// whose natural home is 7 (not involved in the slot-0 collision
    /// chain), must be left exactly where it is.
    #[test]
    fn linear_probe_wrap_backward_shift_matches_spec_scenario() {
        let l = layout(4, 4, 4); // capacity 8 for 4 entries at a 1.5x load factor
        let s = slots(l.capacity() as usize);
        let idx = HashIndex::new(&s, &l);
        assert_eq!(l.capacity(), 8);

        let home6 = idx.mask_partial_hash(6);
        let home7 = idx.mask_partial_hash(7);
        let home0 = idx.mask_partial_hash(8); // 8 & 7 == 0

        let p6 = idx.insert(home6, 100);
        let p7 = idx.insert(home7, 200);
        let p0 = idx.insert(home0, 300); // lands at its own home, slot 0
        let p1 = idx.insert(home0, 400); // collides, probes forward to slot 1
        assert_eq!((p6, p7, p0, p1), (6, 7, 0, 1));

        idx.remove(p0);

        // Slot 1's entry's natural home is 0, which is <= the vacated slot
        // (0) walking forward from slot 0 — it belongs before slot 1 in the
        // probe order, so backward-shift must have pulled it into slot 0.
        assert!(idx.is_empty(1), "slot 1 must have been vacated by the shift");
        assert_eq!(idx.value_at(0), 400, "slot 0 must now hold what was at slot 1");
        assert_eq!(idx.value_at(6), 100);
        assert_eq!(idx.value_at(7), 200);
    }

    #[test]
    fn put_value_volatile_preserves_key_field() {
        let l = layout(4, 24, 32);
        let s = slots(l.capacity() as usize);
        let idx = HashIndex::new(&s, &l);
        let h = idx.mask_partial_hash(42);
        let pos = idx.insert(h, 1);
        idx.put_value_volatile(pos, 999);
        assert_eq!(idx.value_at(pos), 999);
        assert_eq!(idx.find(h).next(), Some(pos));
    }

    #[test]
    fn mask_partial_hash_never_returns_zero() {
        let l = layout(4, 4, 4);
        let s = slots(l.capacity() as usize);
        let idx = HashIndex::new(&s, &l);
        assert_eq!(idx.mask_partial_hash(0), l.key_mask());
        assert_ne!(idx.mask_partial_hash(16), 0); // 16 & 0xF == 0 -> folds to key_mask
    }
}
