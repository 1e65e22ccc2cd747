//! Point operations, wiring components A–F behind `{put, remove, replace,
//! containsKey, clear, size}`.
//!
//! Grounded on `shm/mod.rs`'s `ShmCache`, which wires `ShmRegion` +
//! `ht_lookup`/`ht_insert` + the eviction list behind `get`/`insert`/`clear`;
//! this crate's `Segment` wires `layout` + `bitset` + `index` + `entry` +
//! `lock`/`reentrant` the same way, minus the eviction bookkeeping, which
//! has no counterpart here (see DESIGN.md).
//!
//! Callers supply an already-hashed `partial_hash` per key: hashing and
//! dispatch to a segment is the map façade's job (out of scope here).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::bitset::Bitset;
use crate::entry::{self, EntryLayout};
use crate::error::{Error, LockLevel, Result};
use crate::index::HashIndex;
use crate::layout::SegmentHeader;
use crate::layout::SegmentLayout;
use crate::reentrant::LockContext;
use crate::scan::{for_each_removing, ScanResources, ScanStats, View};
use crate::traits::{KeyReader, KeySizeMarshaller, ValueReader, ValueSizeMarshaller};

pub struct Segment<'a, KM, VM> {
    header: &'a SegmentHeader,
    hash_table: &'a [AtomicU64],
    free_list: &'a mut [u8],
    entry_space: &'a mut [u8],
    layout: SegmentLayout,
    key_size_marshaller: KM,
    value_size_marshaller: VM,
}

impl<'a, KM: KeySizeMarshaller, VM: ValueSizeMarshaller> Segment<'a, KM, VM> {
    pub fn new(
        header: &'a SegmentHeader,
        hash_table: &'a [AtomicU64],
        free_list: &'a mut [u8],
        entry_space: &'a mut [u8],
        layout: SegmentLayout,
        key_size_marshaller: KM,
        value_size_marshaller: VM,
    ) -> Self {
        Segment {
            header,
            hash_table,
            free_list,
            entry_space,
            layout,
            key_size_marshaller,
            value_size_marshaller,
        }
    }

    fn index(&self) -> HashIndex<'a> {
        HashIndex::new(self.hash_table, &self.layout)
    }

    /// Live entry count. A plain acquire load — no segment lock needed;
    /// size reads are defined to observe an acquire snapshot of the counter.
    pub fn size(&self) -> u64 {
        self.header.entries.load(Ordering::Acquire)
    }

    fn find_matching(&self, masked_hash: u64, key: &[u8]) -> Option<(u64, u64)> {
        let index = self.index();
        for pos in index.find(masked_hash) {
            let chunk_pos = index.value_at(pos);
            let start = chunk_pos as usize * self.layout.chunk_size as usize;
            let (key_size, key_offset) = entry::read_key_header(&self.entry_space[start..], &self.layout, &self.key_size_marshaller);
            if &self.entry_space[start + key_offset..start + key_offset + key_size] == key {
                return Some((pos, chunk_pos));
            }
        }
        None
    }

    pub fn contains_key(&self, partial_hash: u64, key: &[u8], timeout: Option<Duration>) -> Result<bool> {
        let ctx = LockContext::new(&self.header.lock_word)?;
        if !ctx.acquire(LockLevel::Read, timeout)? {
            return Err(Error::LockTimeout { level: LockLevel::Read, nanos: timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
        }
        let masked = self.index().mask_partial_hash(partial_hash);
        let found = self.find_matching(masked, key).is_some();
        ctx.release()?;
        Ok(found)
    }

    pub fn put(&mut self, partial_hash: u64, key: &[u8], value: &[u8], timeout: Option<Duration>) -> Result<()> {
        let ctx = LockContext::new(&self.header.lock_word)?;
        if !ctx.acquire(LockLevel::Update, timeout)? {
            return Err(Error::LockTimeout { level: LockLevel::Update, nanos: timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
        }
        let masked = self.index().mask_partial_hash(partial_hash);
        let existing = self.find_matching(masked, key);

        if !ctx.escalate_to_write(timeout)? {
            ctx.release()?;
            return Err(Error::LockTimeout { level: LockLevel::Write, nanos: timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
        }
        let overwriting = existing.is_some();
        let result = match existing {
            Some((slot_pos, chunk_pos)) => self.overwrite_value(slot_pos, chunk_pos, key, value),
            None => self.insert_new(masked, key, value),
        };
        ctx.de_escalate_to_update()?;
        ctx.release()?;
        if result.is_ok() {
            log::trace!(target: "segmap::segment", "put {} bytes under hash=0x{partial_hash:x} ({})", value.len(), if overwriting { "overwrite" } else { "insert" });
        }
        result
    }

    pub fn replace(&mut self, partial_hash: u64, key: &[u8], new_value: &[u8], timeout: Option<Duration>) -> Result<bool> {
        let ctx = LockContext::new(&self.header.lock_word)?;
        if !ctx.acquire(LockLevel::Update, timeout)? {
            return Err(Error::LockTimeout { level: LockLevel::Update, nanos: timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
        }
        let masked = self.index().mask_partial_hash(partial_hash);
        let existing = self.find_matching(masked, key);
        let replaced = match existing {
            None => false,
            Some((slot_pos, chunk_pos)) => {
                if !ctx.escalate_to_write(timeout)? {
                    ctx.release()?;
                    return Err(Error::LockTimeout { level: LockLevel::Write, nanos: timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
                }
                self.overwrite_value(slot_pos, chunk_pos, key, new_value)?;
                ctx.de_escalate_to_update()?;
                true
            }
        };
        ctx.release()?;
        Ok(replaced)
    }

    pub fn remove(&mut self, partial_hash: u64, key: &[u8], timeout: Option<Duration>) -> Result<bool> {
        let ctx = LockContext::new(&self.header.lock_word)?;
        if !ctx.acquire(LockLevel::Update, timeout)? {
            return Err(Error::LockTimeout { level: LockLevel::Update, nanos: timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
        }
        let masked = self.index().mask_partial_hash(partial_hash);
        let existing = self.find_matching(masked, key);
        let removed = match existing {
            None => false,
            Some((slot_pos, chunk_pos)) => {
                if !ctx.escalate_to_write(timeout)? {
                    ctx.release()?;
                    return Err(Error::LockTimeout { level: LockLevel::Write, nanos: timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
                }
                self.remove_at(slot_pos, chunk_pos)?;
                ctx.de_escalate_to_update()?;
                true
            }
        };
        ctx.release()?;
        if removed {
            log::trace!(target: "segmap::segment", "removed entry under hash=0x{partial_hash:x}");
        }
        Ok(removed)
    }

    pub fn clear(&mut self, timeout: Option<Duration>) -> Result<()> {
        let ctx = LockContext::new(&self.header.lock_word)?;
        if !ctx.acquire(LockLevel::Write, timeout)? {
            return Err(Error::LockTimeout { level: LockLevel::Write, nanos: timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
        }
        let dropped = self.header.entries.load(Ordering::Relaxed);
        for w in self.hash_table {
            w.store(0, Ordering::Relaxed);
        }
        self.free_list.fill(0);
        self.header.entries.store(0, Ordering::Relaxed);
        self.header.deleted.store(0, Ordering::Relaxed);
        self.header.next_pos_to_search_from.store(0, Ordering::Relaxed);
        ctx.release()?;
        log::debug!(target: "segmap::segment", "cleared segment ({dropped} entries dropped)");
        Ok(())
    }

    /// Scans the segment under an update lock, invoking `predicate` for
    /// every live entry; see [`crate::scan::for_each_removing`].
    pub fn for_each_removing<K, V>(
        &mut self,
        key_reader: &dyn KeyReader<K>,
        value_reader: &dyn ValueReader<V>,
        timeout: Option<Duration>,
        predicate: impl FnMut(&mut View<K, V>) -> bool,
    ) -> Result<ScanStats> {
        let ctx = LockContext::new(&self.header.lock_word)?;
        let index = self.index();
        let res = ScanResources {
            header: self.header,
            index,
            free_list: &mut *self.free_list,
            entry_space: &mut *self.entry_space,
            layout: &self.layout,
            key_size_marshaller: &self.key_size_marshaller,
            value_size_marshaller: &self.value_size_marshaller,
        };
        for_each_removing(&ctx, res, key_reader, value_reader, timeout, predicate)
    }

    fn insert_new(&mut self, masked_hash: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let el = EntryLayout::compute(&self.layout, &self.key_size_marshaller, &self.value_size_marshaller, key.len(), value.len());
        let mut bitset = Bitset::new(self.free_list, self.layout.chunks_per_segment);
        let hint = self.header.next_pos_to_search_from.load(Ordering::Relaxed);
        let (pos, new_hint) = bitset.allocate(hint as u32, el.entry_chunks, self.layout.max_chunks_per_entry)?;
        self.header.next_pos_to_search_from.store(new_hint as u64, Ordering::Relaxed);

        let start = pos as usize * self.layout.chunk_size as usize;
        let end = start + el.entry_size;
        entry::write(&mut self.entry_space[start..end], &self.layout, &self.key_size_marshaller, &self.value_size_marshaller, key, value);

        self.index().insert(masked_hash, pos as u64);
        self.header.entries.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn overwrite_value(&mut self, slot_pos: u64, chunk_pos: u64, key: &[u8], new_value: &[u8]) -> Result<()> {
        let start = chunk_pos as usize * self.layout.chunk_size as usize;
        let (key_size, key_offset) = entry::read_key_header(&self.entry_space[start..], &self.layout, &self.key_size_marshaller);
        debug_assert_eq!(&self.entry_space[start + key_offset..start + key_offset + key_size], key);
        let key_end = key_offset + key_size;
        let (old_value_size, consumed) = self.value_size_marshaller.read_size(&self.entry_space[start + key_end..]);
        let size_before_value = key_end + consumed;
        let value_offset = entry::value_offset_from(size_before_value, self.layout.alignment);

        if new_value.len() == old_value_size {
            entry::rewrite_value_in_place(&mut self.entry_space[start..], value_offset, new_value);
            self.index().put_value_volatile(slot_pos, chunk_pos);
            return Ok(());
        }

        // Simpler than the scan view's grow/shrink-in-place optimization
        // a direct `put`/`replace` always relocates on a size
        // change. See DESIGN.md for why that's an acceptable narrowing.
        let old_chunks = (self.entry_chunk_span(chunk_pos) as u32).max(1);
        let new_chunks = EntryLayout::compute(&self.layout, &self.key_size_marshaller, &self.value_size_marshaller, key_size, new_value.len()).entry_chunks;
        if new_chunks > self.layout.max_chunks_per_entry {
            return Err(Error::EntryTooLarge { requested: new_chunks, max: self.layout.max_chunks_per_entry });
        }

        // Re-derive the whole entry layout rather than patching the old
        // bytes in place: the new value's size field may not even be the
        // same width as the old one (e.g. a varint crossing a byte
        // boundary), so `value_offset` above cannot be trusted for it.
        let new_el = EntryLayout::compute(&self.layout, &self.key_size_marshaller, &self.value_size_marshaller, key_size, new_value.len());
        let hint = self.header.next_pos_to_search_from.load(Ordering::Relaxed);
        let (new_pos, new_hint) = {
            let mut bitset = Bitset::new(self.free_list, self.layout.chunks_per_segment);
            bitset.allocate(hint as u32, new_chunks, self.layout.max_chunks_per_entry)?
        };
        {
            let mut bitset = Bitset::new(self.free_list, self.layout.chunks_per_segment);
            let freed_hint = bitset.free(chunk_pos as u32, old_chunks, new_hint);
            self.header.next_pos_to_search_from.store(freed_hint as u64, Ordering::Relaxed);
        }

        let new_start = new_pos as usize * self.layout.chunk_size as usize;
        entry::write(
            &mut self.entry_space[new_start..new_start + new_el.entry_size],
            &self.layout,
            &self.key_size_marshaller,
            &self.value_size_marshaller,
            key,
            new_value,
        );

        self.index().put_value_volatile(slot_pos, new_pos);
        Ok(())
    }

    fn remove_at(&mut self, slot_pos: u64, chunk_pos: u64) -> Result<()> {
        let chunks = self.entry_chunk_span(chunk_pos);
        let final_pos = self.index().remove(slot_pos);
        debug_assert_eq!(final_pos, slot_pos, "point-op remove must clear its own slot, never shift past itself");

        let hint = self.header.next_pos_to_search_from.load(Ordering::Relaxed);
        let mut bitset = Bitset::new(self.free_list, self.layout.chunks_per_segment);
        let new_hint = bitset.free(chunk_pos as u32, chunks, hint as u32);
        self.header.next_pos_to_search_from.store(new_hint as u64, Ordering::Relaxed);

        self.header.entries.fetch_sub(1, Ordering::AcqRel);
        self.header.deleted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn entry_chunk_span(&self, chunk_pos: u64) -> u32 {
        let start = chunk_pos as usize * self.layout.chunk_size as usize;
        let (key_size, key_offset) = entry::read_key_header(&self.entry_space[start..], &self.layout, &self.key_size_marshaller);
        let key_end = key_offset + key_size;
        let (value_size, consumed) = self.value_size_marshaller.read_size(&self.entry_space[start + key_end..]);
        let value_offset = entry::value_offset_from(key_end + consumed, self.layout.alignment);
        ((value_offset + value_size) as u32).div_ceil(self.layout.chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{SliceReader, VarIntMarshaller};
    use std::sync::atomic::AtomicU64;

    fn fresh_segment(layout: SegmentLayout) -> (Box<SegmentHeader>, Vec<AtomicU64>, Vec<u8>, Vec<u8>) {
        let header = Box::new(unsafe { std::mem::zeroed::<SegmentHeader>() });
        let table: Vec<AtomicU64> = (0..layout.capacity()).map(|_| AtomicU64::new(0)).collect();
        let free_list = vec![0u8; (layout.chunks_per_segment as usize).div_ceil(8)];
        let entries = vec![0u8; layout.chunks_per_segment as usize * layout.chunk_size as usize];
        (header, table, free_list, entries)
    }

    fn test_layout() -> SegmentLayout {
        SegmentLayout::new(32, 256, 16, 0, 8, true, 8, 1, 64, 1_000_000_000, 24, 16).unwrap()
    }

    #[test]
    fn put_then_contains_then_remove() {
        let layout = test_layout();
        let (header, mut table, mut free_list, mut entries) = fresh_segment(layout);
        let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entries, layout, VarIntMarshaller, VarIntMarshaller);

        seg.put(42, b"alpha", b"1", None).unwrap();
        assert!(seg.contains_key(42, b"alpha", None).unwrap());
        assert_eq!(seg.size(), 1);

        assert!(seg.remove(42, b"alpha", None).unwrap());
        assert!(!seg.contains_key(42, b"alpha", None).unwrap());
        assert_eq!(seg.size(), 0);
    }

    #[test]
    fn put_same_key_overwrites_value() {
        let layout = test_layout();
        let (header, mut table, mut free_list, mut entries) = fresh_segment(layout);
        let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entries, layout, VarIntMarshaller, VarIntMarshaller);

        seg.put(7, b"k", b"short", None).unwrap();
        seg.put(7, b"k", b"a much longer value than before", None).unwrap();
        assert_eq!(seg.size(), 1);
        assert!(seg.contains_key(7, b"k", None).unwrap());
    }

    #[test]
    fn replace_on_missing_key_returns_false() {
        let layout = test_layout();
        let (header, mut table, mut free_list, mut entries) = fresh_segment(layout);
        let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entries, layout, VarIntMarshaller, VarIntMarshaller);
        assert!(!seg.replace(1, b"missing", b"x", None).unwrap());
    }

    #[test]
    fn scan_visits_every_entry_and_can_remove() {
        let layout = test_layout();
        let (header, mut table, mut free_list, mut entries) = fresh_segment(layout);
        let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entries, layout, VarIntMarshaller, VarIntMarshaller);
        for i in 0..5u8 {
            seg.put(i as u64, &[i], &[i], None).unwrap();
        }
        let reader = SliceReader;
        let stats = seg
            .for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
                if view.key().unwrap() == vec![2u8] {
                    view.remove().unwrap();
                }
                true
            })
            .unwrap();
        assert_eq!(stats.visited, 5);
        assert!(!stats.interrupted);
        assert_eq!(seg.size(), 4);
        assert!(!seg.contains_key(2, &[2u8], None).unwrap());
    }

    /// Populate a segment so backward-shift moves the
    /// slot after the scan's cursor into the cursor position on `remove`,
    /// and confirm the shifted-in entry is still visited this same scan
    /// (no skip). Three keys share one partial hash so the second and
    /// third collide into the slots right after the first's home.
    #[test]
    fn scan_remove_back_steps_so_shifted_entry_is_not_skipped() {
        let layout = SegmentLayout::new(32, 256, 16, 0, 8, true, 8, 1, 4, 1_000_000_000, 4, 16).unwrap();
        assert_eq!(layout.capacity(), 8);
        let (header, mut table, mut free_list, mut entries) = fresh_segment(layout);
        let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entries, layout, VarIntMarshaller, VarIntMarshaller);

        // All three land in the same collision chain: 'a' at its home slot,
        // 'b' and 'c' probing forward past it.
        seg.put(8, b"a", b"1", None).unwrap();
        seg.put(8, b"b", b"2", None).unwrap();
        seg.put(8, b"c", b"3", None).unwrap();
        assert_eq!(seg.size(), 3);

        let reader = SliceReader;
        let mut seen = std::collections::HashSet::new();
        let stats = seg
            .for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
                let key = view.key().unwrap();
                seen.insert(key.clone());
                if key == b"a".to_vec() {
                    view.remove().unwrap();
                }
                true
            })
            .unwrap();

        assert_eq!(stats.visited, 3, "the shifted-in entries must not be skipped");
        assert!(!stats.interrupted);
        assert!(seen.contains(&b"a".to_vec()));
        assert!(seen.contains(&b"b".to_vec()));
        assert!(seen.contains(&b"c".to_vec()));
        assert_eq!(seg.size(), 2);
        assert!(!seg.contains_key(8, b"a", None).unwrap());
        assert!(seg.contains_key(8, b"b", None).unwrap());
        assert!(seg.contains_key(8, b"c", None).unwrap());
    }
}
