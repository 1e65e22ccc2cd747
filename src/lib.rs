//! A shared, persistent, off-heap segmented hash map: key-value storage
//! living entirely in a memory-mapped file, partitioned into fixed-layout
//! segments that multiple threads and multiple processes mapping the same
//! file can read, update and write concurrently.
//!
//! This crate covers the three coupled subsystems that make that hard:
//! segment storage layout (a chunk allocator plus a packed open-addressed
//! hash index), the inter-process read/update/write lock protocol with
//! thread-local reentrancy, and a segment-scoped iteration context that
//! combines the two into a safe, resumable scan-with-mutation. Hashing a
//! key and dispatching it to one of several segments, key/value
//! serialization, and the public builder/CLI surface are the map façade's
//! job and live outside this crate.
//!
//! Modules map one-to-one onto those subsystems:
//!
//! - [`layout`] — tunables and the byte-offset arithmetic for the on-disk
//!   file and segment layout.
//! - [`bitset`] — the free-chunk allocator (component A).
//! - [`index`] — the packed open-addressed hash index (component B).
//! - [`entry`] — the entry layout codec (component C).
//! - [`lock`] — the cross-process segment header lock word (component D).
//! - [`reentrant`] — thread-local reentrancy over [`lock`] (component E).
//! - [`scan`] — the segment-scoped iteration context (component F).
//! - [`segment`] — wires A–F behind `{put, remove, replace, containsKey,
//!   clear, size}`.
//! - [`traits`] / [`marshal`] — the consumed key/value codec interfaces and
//!   one concrete implementation of them.
//! - [`mapped_file`] — the thinnest possible file-mapping adapter needed to
//!   exercise `segment` end to end.

pub mod bitset;
pub mod entry;
pub mod error;
pub mod index;
pub mod layout;
pub mod lock;
pub mod mapped_file;
pub mod marshal;
pub mod reentrant;
pub mod scan;
pub mod segment;
pub mod traits;

pub use error::{Error, LockLevel, Result};
pub use layout::SegmentLayout;
pub use mapped_file::MappedFile;
pub use marshal::{SliceReader, VarIntMarshaller};
pub use scan::{ScanStats, View};
pub use segment::Segment;
pub use traits::{EntryOperations, KeyChecker, KeyReader, KeySizeMarshaller, ValueChecker, ValueReader, ValueSizeMarshaller};
