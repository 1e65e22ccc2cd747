//! The out-of-scope "file mapping and header creation" collaborator,
//! implemented only far enough to host integration tests of components
//! A–F: open/create the global-header-plus-segments file and hand back
//! [`Segment`] handles over the mapping. It does not grow into a public
//! builder or CLI — that is the map façade's job and out of scope here.
//!
//! Grounded on `shm/region.rs`'s `ShmRegion::create`/`open`/`create_or_open`:
//! same shape (create zero-fills and stamps a magic, open validates it,
//! `create_or_open` falls back to create on a missing or stale file), but
//! generalized from `shm/region.rs`'s single fixed region to `actual_segments`
//! independently-lockable segments back-to-back in one file, per
//! `layout::SegmentLayout::segment_offset`.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicU64;

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::layout::{SegmentHeader, SegmentLayout, GLOBAL_HEADER_SIZE, MAGIC};
use crate::segment::Segment;

/// An open mapping over the global-header-plus-segments file, with the
/// tunables that describe how to carve it into per-segment regions.
pub struct MappedFile {
    mmap: MmapMut,
    layout: SegmentLayout,
}

impl MappedFile {
    /// Creates a fresh file at `path`, sized per `layout.total_file_size()`,
    /// zero-filled, with the global header's magic stamped at offset 0.
    pub fn create(path: &Path, layout: SegmentLayout) -> Result<Self> {
        let file = open_rw(path, true)?;
        file.set_len(layout.total_file_size() as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0);
        mmap[..MAGIC.len()].copy_from_slice(&MAGIC);
        mmap.flush()?;
        log::debug!(target: "segmap::mapped_file", "created {} ({} bytes, {} segments)", path.display(), layout.total_file_size(), layout.actual_segments);
        Ok(MappedFile { mmap, layout })
    }

    /// Opens an existing file at `path`, validating the magic and the
    /// file's length against `layout`.
    pub fn open(path: &Path, layout: SegmentLayout) -> Result<Self> {
        let file = open_rw(path, false)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < layout.total_file_size() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "mapped file is shorter than the layout's total_file_size",
            )));
        }
        if mmap[..MAGIC.len()] != MAGIC {
            return Err(Error::Io(io::Error::new(io::ErrorKind::InvalidData, "bad magic: not a segmap file")));
        }
        log::debug!(target: "segmap::mapped_file", "opened {} ({} bytes)", path.display(), mmap.len());
        Ok(MappedFile { mmap, layout })
    }

    /// Opens `path` if it exists and matches `layout`'s size, otherwise
    /// creates it fresh. Mirrors `shm/region.rs`'s `create_or_open`, including
    /// its "stale or mismatched file gets recreated" fallback.
    pub fn create_or_open(path: &Path, layout: SegmentLayout) -> Result<Self> {
        if path.exists() {
            match Self::open(path, layout) {
                Ok(mapped) => return Ok(mapped),
                Err(_) => {
                    log::warn!(target: "segmap::mapped_file", "{} exists but is stale/invalid, recreating", path.display());
                }
            }
        }
        Self::create(path, layout)
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// Borrows segment `i`'s header, hash index and chunk arena out of the
    /// mapping and wires them behind a [`Segment`] handle. The returned
    /// handle borrows `self` mutably for its lifetime — callers needing
    /// concurrent segments from one thread should open each in its own
    /// scope, same as `shm/region.rs` never holds two `ShmRegion`s open for
    /// what is, in that design, always one region.
    ///
    /// # Panics
    /// If `i >= layout.actual_segments`.
    pub fn segment<KM, VM>(&mut self, i: u32, key_size_marshaller: KM, value_size_marshaller: VM) -> Segment<'_, KM, VM>
    where
        KM: crate::traits::KeySizeMarshaller,
        VM: crate::traits::ValueSizeMarshaller,
    {
        assert!(i < self.layout.actual_segments, "segment index {i} out of range (actual_segments = {})", self.layout.actual_segments);

        let seg_off = self.layout.segment_offset(i);
        let ht_off = seg_off + self.layout.hash_table_offset();
        let fl_off = seg_off + self.layout.free_list_offset();
        let es_off = seg_off + self.layout.entry_space_offset();
        let capacity = self.layout.capacity() as usize;
        let free_list_bytes = self.layout.free_list_bytes();
        let entry_space_bytes = self.layout.entry_space_bytes();

        // Safety: the four regions below are disjoint, non-overlapping byte
        // ranges within `self.mmap` (established by `SegmentLayout`'s
        // monotonic offset arithmetic, asserted in `layout`'s own tests),
        // so handing out a shared reference into one and mutable slices
        // into the others from the same base pointer does not alias.
        // `SegmentHeader`'s fields are all atomics, matching the mapping's
        // cross-thread/cross-process shared nature.
        unsafe {
            let base = self.mmap.as_mut_ptr();
            let header = &*(base.add(seg_off) as *const SegmentHeader);
            let hash_table = std::slice::from_raw_parts(base.add(ht_off) as *const AtomicU64, capacity);
            let free_list = std::slice::from_raw_parts_mut(base.add(fl_off), free_list_bytes);
            let entry_space = std::slice::from_raw_parts_mut(base.add(es_off), entry_space_bytes);
            Segment::new(header, hash_table, free_list, entry_space, self.layout, key_size_marshaller, value_size_marshaller)
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

fn open_rw(path: &Path, create_new: bool) -> Result<File> {
    if create_new {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    if create_new {
        opts.create(true).truncate(true);
    }
    Ok(opts.open(path)?)
}
