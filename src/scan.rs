//! Component F: the segment-scoped iteration context.
//!
//! Grounded on `shm/mod.rs`'s `ShmCache::get_inner`/`insert_inner` — lock,
//! look up, mutate, unlock, all under one guard — generalized from a single
//! point operation into a resumable external walk that exposes a mutating
//! view per visited entry, since nothing upstream scans a whole table under
//! one held lock the way `forEachRemoving` does.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::bitset::Bitset;
use crate::entry::{self, EntryLayout};
use crate::error::{Error, LockLevel, Result};
use crate::index::HashIndex;
use crate::layout::{SegmentHeader, SegmentLayout};
use crate::reentrant::LockContext;
use crate::traits::{KeyReader, KeySizeMarshaller, ValueReader, ValueSizeMarshaller};

pub struct ScanStats {
    pub visited: u64,
    pub interrupted: bool,
}

/// Everything a scan needs read/write access to, borrowed from `Segment`
/// for the duration of one `for_each_removing` call.
pub struct ScanResources<'a> {
    pub header: &'a SegmentHeader,
    pub index: HashIndex<'a>,
    pub free_list: &'a mut [u8],
    pub entry_space: &'a mut [u8],
    pub layout: &'a SegmentLayout,
    pub key_size_marshaller: &'a dyn KeySizeMarshaller,
    pub value_size_marshaller: &'a dyn ValueSizeMarshaller,
}

/// A view onto one visited entry, exposed to the scan predicate. Mutating
/// methods escalate the context's lock level as needed; once `remove()` has
/// been called, every other method fails `StaleEntryAccess`.
pub struct View<'r, 'b, K, V> {
    ctx: &'b LockContext<'b>,
    res: &'b mut ScanResources<'r>,
    cursor: &'b mut u64,
    chunk_pos: u64,
    entry_chunks: u32,
    key_size: usize,
    key_offset: usize,
    removed: bool,
    key_reader: &'b dyn KeyReader<K>,
    value_reader: &'b dyn ValueReader<V>,
    timeout: Option<Duration>,
}

impl<'r, 'b, K, V> View<'r, 'b, K, V> {
    fn check(&self) -> Result<()> {
        self.ctx.check_owner()?;
        if self.removed {
            return Err(Error::StaleEntryAccess);
        }
        Ok(())
    }

    fn entry_bytes(&self) -> &[u8] {
        let start = self.chunk_pos as usize * self.res.layout.chunk_size as usize;
        &self.res.entry_space[start..]
    }

    pub fn key(&self) -> Result<K> {
        self.check()?;
        let bytes = &self.entry_bytes()[self.key_offset..self.key_offset + self.key_size];
        Ok(self.key_reader.read_key(bytes))
    }

    pub fn value(&self) -> Result<V> {
        self.check()?;
        let (value_size, value_offset) = self.value_location();
        let bytes = &self.entry_bytes()[value_offset..value_offset + value_size];
        Ok(self.value_reader.read_value(bytes, None))
    }

    fn value_location(&self) -> (usize, usize) {
        let key_end = self.key_offset + self.key_size;
        let (value_size, consumed) = self.res.value_size_marshaller.read_size(&self.entry_bytes()[key_end..]);
        let value_offset = entry::value_offset_from(key_end + consumed, self.res.layout.alignment);
        (value_size, value_offset)
    }

    /// `remove` via the view: escalate to write, backward-shift the
    /// index slot, free the entry's chunks, update counters, de-escalate.
    pub fn remove(&mut self) -> Result<()> {
        self.check()?;
        let was_update = self.ctx.local_level() == LockLevel::Update;
        if was_update && !self.ctx.escalate_to_write(self.timeout)? {
            return Err(Error::LockTimeout { level: LockLevel::Write, nanos: self.timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
        }

        let final_pos = self.res.index.remove(*self.cursor);
        {
            let mut bitset = Bitset::new(self.res.free_list, self.res.layout.chunks_per_segment);
            let hint = self.res.header.next_pos_to_search_from.load(Ordering::Relaxed);
            let new_hint = bitset.free(self.chunk_pos as u32, self.entry_chunks, hint as u32);
            self.res.header.next_pos_to_search_from.store(new_hint as u64, Ordering::Relaxed);
        }
        self.res.header.entries.fetch_sub(1, Ordering::AcqRel);
        self.res.header.deleted.fetch_add(1, Ordering::AcqRel);

        if was_update {
            self.ctx.de_escalate_to_update()?;
        }

        if final_pos != *self.cursor {
            *self.cursor = self.res.index.step_backward(*self.cursor);
        }
        self.removed = true;
        Ok(())
    }

    /// `replaceValue` via the view.
    pub fn replace_value(&mut self, new_value: &[u8]) -> Result<()> {
        self.check()?;
        let was_update = self.ctx.local_level() == LockLevel::Update;
        if was_update && !self.ctx.escalate_to_write(self.timeout)? {
            return Err(Error::LockTimeout { level: LockLevel::Write, nanos: self.timeout.map(|d| d.as_nanos() as u64).unwrap_or(0) });
        }

        let (old_value_size, old_value_offset) = self.value_location();
        let result = self.replace_value_locked(new_value, old_value_size, old_value_offset);

        if was_update {
            self.ctx.de_escalate_to_update()?;
        }
        result
    }

    fn replace_value_locked(&mut self, new_value: &[u8], old_value_size: usize, old_value_offset: usize) -> Result<()> {
        let layout = self.res.layout;
        if new_value.len() == old_value_size {
            let start = self.chunk_pos as usize * layout.chunk_size as usize;
            self.res.entry_space[start + old_value_offset..start + old_value_offset + new_value.len()].copy_from_slice(new_value);
            self.res.index.put_value_volatile(*self.cursor, self.chunk_pos);
            return Ok(());
        }

        let key_end = self.key_offset + self.key_size;
        let (_, consumed) = self.res.value_size_marshaller.read_size(&self.entry_bytes()[key_end..]);
        let size_before_value = key_end + consumed;
        let el = EntryLayout::compute(layout, self.res.key_size_marshaller, self.res.value_size_marshaller, self.key_size, new_value.len());
        let new_chunks = el.entry_chunks;

        if new_chunks > layout.max_chunks_per_entry {
            return Err(Error::EntryTooLarge {
                requested: new_chunks,
                max: layout.max_chunks_per_entry,
            });
        }

        let mut bitset = Bitset::new(self.res.free_list, layout.chunks_per_segment);
        let hint = self.res.header.next_pos_to_search_from.load(Ordering::Relaxed);

        if new_chunks > self.entry_chunks && bitset.all_clear(self.chunk_pos as u32 + self.entry_chunks, self.chunk_pos as u32 + new_chunks) {
            bitset.set_range(self.chunk_pos as u32 + self.entry_chunks, self.chunk_pos as u32 + new_chunks);
            let start = self.chunk_pos as usize * layout.chunk_size as usize;
            entry::rewrite_value_in_place(&mut self.res.entry_space[start..], value_offset_for(size_before_value, layout.alignment), new_value);
            self.entry_chunks = new_chunks;
        } else if new_chunks < self.entry_chunks {
            bitset.clear_range(self.chunk_pos as u32 + new_chunks, self.chunk_pos as u32 + self.entry_chunks);
            let start = self.chunk_pos as usize * layout.chunk_size as usize;
            entry::rewrite_value_in_place(&mut self.res.entry_space[start..], value_offset_for(size_before_value, layout.alignment), new_value);
            self.entry_chunks = new_chunks;
        } else if new_chunks == self.entry_chunks {
            let start = self.chunk_pos as usize * layout.chunk_size as usize;
            entry::rewrite_value_in_place(&mut self.res.entry_space[start..], value_offset_for(size_before_value, layout.alignment), new_value);
        } else {
            let (new_pos, new_hint) = bitset.allocate(hint as u32, new_chunks, layout.max_chunks_per_entry)?;
            drop(bitset);
            {
                let mut bitset = Bitset::new(self.res.free_list, layout.chunks_per_segment);
                let freed_hint = bitset.free(self.chunk_pos as u32, self.entry_chunks, new_hint);
                self.res.header.next_pos_to_search_from.store(freed_hint as u64, Ordering::Relaxed);
            }
            // Key (and its size fields) must carry over to the new position;
            // copy it through an owned buffer rather than juggling two
            // overlapping-lifetime windows into the same slice.
            let key_prefix_len = size_before_value;
            let old_start = self.chunk_pos as usize * layout.chunk_size as usize;
            let mut prefix = vec![0u8; key_prefix_len];
            prefix.copy_from_slice(&self.res.entry_space[old_start..old_start + key_prefix_len]);

            let new_start = new_pos as usize * layout.chunk_size as usize;
            self.res.entry_space[new_start..new_start + key_prefix_len].copy_from_slice(&prefix);
            entry::rewrite_value_in_place(&mut self.res.entry_space[new_start..], value_offset_for(key_prefix_len, layout.alignment), new_value);

            self.res.index.put_value_volatile(*self.cursor, new_pos);
            self.chunk_pos = new_pos;
            self.entry_chunks = new_chunks;
            return Ok(());
        }
        self.res.index.put_value_volatile(*self.cursor, self.chunk_pos);
        Ok(())
    }
}

fn value_offset_for(size_before_value: usize, alignment: u32) -> usize {
    entry::value_offset_from(size_before_value, alignment)
}

/// `forEachRemoving(predicate)`. Takes the update lock, walks the
/// index from a guaranteed-empty starting slot, and invokes `predicate` for
/// every live entry until it returns `false` or every entry has been
/// visited once.
#[allow(clippy::too_many_arguments)]
pub fn for_each_removing<K, V>(
    ctx: &LockContext,
    mut res: ScanResources,
    key_reader: &dyn KeyReader<K>,
    value_reader: &dyn ValueReader<V>,
    timeout: Option<Duration>,
    mut predicate: impl FnMut(&mut View<K, V>) -> bool,
) -> Result<ScanStats> {
    if !ctx.acquire(LockLevel::Update, timeout)? {
        return Err(Error::LockTimeout {
            level: LockLevel::Update,
            nanos: timeout.map(|d| d.as_nanos() as u64).unwrap_or(0),
        });
    }

    let mut remaining = res.header.entries.load(Ordering::Acquire);
    if remaining == 0 {
        ctx.release()?;
        return Ok(ScanStats { visited: 0, interrupted: false });
    }

    let start = res.index.first_empty_from_zero();
    let mut cursor = start;
    let mut visited = 0u64;
    let mut interrupted = false;

    loop {
        cursor = res.index.step_forward(cursor);
        if cursor == start {
            break;
        }
        if res.index.is_empty(cursor) {
            continue;
        }

        let chunk_pos = res.index.value_at(cursor);
        let start_byte = chunk_pos as usize * res.layout.chunk_size as usize;
        let (key_size, key_offset_abs) = entry::read_key_header(&res.entry_space[start_byte..], res.layout, res.key_size_marshaller);
        let key_end = key_offset_abs + key_size;
        let (value_size, consumed) = res.value_size_marshaller.read_size(&res.entry_space[start_byte + key_end..]);
        let value_offset = entry::value_offset_from(key_end + consumed, res.layout.alignment);
        let entry_size = value_offset + value_size;
        let entry_chunks = (entry_size as u32).div_ceil(res.layout.chunk_size);

        let mut view = View {
            ctx,
            res: &mut res,
            cursor: &mut cursor,
            chunk_pos,
            entry_chunks,
            key_size,
            key_offset: key_offset_abs,
            removed: false,
            key_reader,
            value_reader,
            timeout,
        };

        if !predicate(&mut view) {
            interrupted = true;
            break;
        }
        visited += 1;
        remaining -= 1;
        if remaining == 0 {
            break;
        }
    }

    ctx.release()?;
    Ok(ScanStats { visited, interrupted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{SliceReader, VarIntMarshaller};
    use crate::segment::Segment;

    fn fresh(layout: SegmentLayout) -> (Box<SegmentHeader>, Vec<std::sync::atomic::AtomicU64>, Vec<u8>, Vec<u8>) {
        let header = Box::new(unsafe { std::mem::zeroed::<SegmentHeader>() });
        let table: Vec<std::sync::atomic::AtomicU64> = (0..layout.capacity()).map(|_| std::sync::atomic::AtomicU64::new(0)).collect();
        let free_list = vec![0u8; (layout.chunks_per_segment as usize).div_ceil(8)];
        let entry_space = vec![0u8; layout.chunks_per_segment as usize * layout.chunk_size as usize];
        (header, table, free_list, entry_space)
    }

    /// `alignment = 1` and `meta_data_bytes = 0` make `entry_size` exactly
    /// `3 (key header) + value_len`, so picking `value_len` precisely
    /// controls how many 8-byte chunks an entry spans — needed to drive
    /// the grow/shrink/relocate branches of `replace_value` deterministically.
    fn shrink_grow_layout() -> SegmentLayout {
        SegmentLayout::new(8, 64, 16, 0, 1, true, 1, 1, 8, 1_000_000_000, 24, 32).unwrap()
    }

    #[test]
    fn replace_value_same_size_rewrites_in_place_and_republishes() {
        let layout = shrink_grow_layout();
        let (header, mut table, mut free_list, mut entry_space) = fresh(layout);
        let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entry_space, layout, VarIntMarshaller, VarIntMarshaller);
        seg.put(1, b"k", &[1u8, 2, 3, 4], None).unwrap();
        let reader = SliceReader;
        seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
            view.replace_value(&[9u8, 9, 9, 9]).unwrap();
            true
        })
        .unwrap();
        seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
            assert_eq!(view.value().unwrap(), vec![9u8, 9, 9, 9]);
            true
        })
        .unwrap();
    }

    /// A 3-chunk entry at pos 0, shrunk to 1 chunk
    /// (clearing bits `[1,3)`, slot and position unchanged), then grown
    /// back to 3 chunks in place because those bits are still clear.
    #[test]
    fn replace_value_shrinks_in_place_then_grows_back_when_bits_stay_clear() {
        let layout = shrink_grow_layout();
        let (header, mut table, mut free_list, mut entry_space) = fresh(layout);
        let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entry_space, layout, VarIntMarshaller, VarIntMarshaller);
        seg.put(1, b"k", &[7u8; 18], None).unwrap(); // 3 chunks at pos 0

        let reader = SliceReader;
        seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
            view.replace_value(&[9u8]).unwrap(); // shrink to 1 chunk
            true
        })
        .unwrap();
        assert!(seg.contains_key(1, b"k", None).unwrap());
        seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
            assert_eq!(view.value().unwrap(), vec![9u8]);
            true
        })
        .unwrap();

        seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
            view.replace_value(&[7u8; 18]).unwrap(); // grow back in place
            true
        })
        .unwrap();
        seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
            assert_eq!(view.value().unwrap(), vec![7u8; 18]);
            true
        })
        .unwrap();
    }

    /// The "relocate" branch of the same shrink-then-grow shape: the same shrink as
    /// above, but something else occupies the freed bits before the entry
    /// is grown back, so `replaceValue` must relocate instead of growing
    /// in place, and the hash slot's value-field must point at the entry's
    /// new chunk position afterward.
    #[test]
    fn replace_value_relocates_when_grown_region_is_occupied() {
        let layout = shrink_grow_layout();
        let (header, mut table, mut free_list, mut entry_space) = fresh(layout);
        {
            let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entry_space, layout, VarIntMarshaller, VarIntMarshaller);
            seg.put(1, b"k", &[7u8; 18], None).unwrap();
            let reader = SliceReader;
            seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
                view.replace_value(&[9u8]).unwrap(); // shrink, frees chunks [1,3)
                true
            })
            .unwrap();
        }
        {
            // Something else now occupies the freed region, so growing the
            // entry back in place is no longer possible.
            let mut bs = crate::bitset::Bitset::new(&mut free_list, layout.chunks_per_segment);
            bs.set_range(1, 3);
        }
        {
            let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entry_space, layout, VarIntMarshaller, VarIntMarshaller);
            let reader = SliceReader;
            seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
                view.replace_value(&[7u8; 18]).unwrap(); // must relocate
                true
            })
            .unwrap();
            seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
                assert_eq!(view.value().unwrap(), vec![7u8; 18]);
                true
            })
            .unwrap();
            assert!(seg.contains_key(1, b"k", None).unwrap());
        }
    }

    #[test]
    fn remove_via_view_frees_bits_and_updates_counters() {
        let layout = shrink_grow_layout();
        let (header, mut table, mut free_list, mut entry_space) = fresh(layout);
        let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entry_space, layout, VarIntMarshaller, VarIntMarshaller);
        seg.put(1, b"k", &[7u8; 18], None).unwrap();
        assert_eq!(seg.size(), 1);

        let reader = SliceReader;
        seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
            view.remove().unwrap();
            true
        })
        .unwrap();
        assert_eq!(seg.size(), 0);
        assert!(!seg.contains_key(1, b"k", None).unwrap());

        // The freed 3 chunks must be available again.
        seg.put(1, b"k2", &[3u8; 18], None).unwrap();
        assert!(seg.contains_key(1, b"k2", None).unwrap());
    }

    #[test]
    fn view_used_after_remove_fails_stale_entry_access() {
        let layout = shrink_grow_layout();
        let (header, mut table, mut free_list, mut entry_space) = fresh(layout);
        let mut seg = Segment::new(&header, &mut table, &mut free_list, &mut entry_space, layout, VarIntMarshaller, VarIntMarshaller);
        seg.put(1, b"k", &[7u8; 4], None).unwrap();

        let reader = SliceReader;
        seg.for_each_removing::<Vec<u8>, Vec<u8>>(&reader, &reader, None, |view| {
            view.remove().unwrap();
            assert!(matches!(view.key(), Err(Error::StaleEntryAccess)));
            assert!(matches!(view.value(), Err(Error::StaleEntryAccess)));
            assert!(matches!(view.replace_value(&[1u8; 4]), Err(Error::StaleEntryAccess)));
            true
        })
        .unwrap();
    }
}
