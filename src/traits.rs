//! Consumed interfaces: the boundary this crate expects from the
//! surrounding map façade (key hashing and dispatch, builder configuration,
//! and the public CLI all live on the far side of that boundary and are out
//! of scope here).
//!
//! Grounded on `serde.rs`'s tagged encode/decode shape — a small trait
//! surface around "how many bytes does this size take, write it, read it
//! back" — generalized from `serde.rs`'s fixed `u32` length prefix (`TAG_STR`,
//! `TAG_BYTES`) to a variable-width codec, because spec entries are packed
//! far more tightly than a cache value blob.

use crate::error::Result;

/// Variable-width integer codec for a key's encoded size.
pub trait KeySizeMarshaller {
    /// Bytes `write_size` will need to encode `n`.
    fn size_encoding_size(&self, n: usize) -> usize;
    /// Write the encoded size to `dst`, returning bytes written.
    fn write_size(&self, dst: &mut [u8], n: usize) -> usize;
    /// Decode a size from `src`, returning `(value, bytes_consumed)`.
    fn read_size(&self, src: &[u8]) -> (usize, usize);
}

/// Variable-width integer codec for a value's encoded size. Kept distinct
/// from [`KeySizeMarshaller`] even though the shape is identical, since a
/// caller may configure a different codec per side (e.g. keys capped at 255
/// bytes with a one-byte length, values needing a full varint).
pub trait ValueSizeMarshaller {
    fn size_encoding_size(&self, n: usize) -> usize;
    fn write_size(&self, dst: &mut [u8], n: usize) -> usize;
    fn read_size(&self, src: &[u8]) -> (usize, usize);
}

/// Decodes a key view from raw bytes, given a size. Implementations may
/// borrow straight from the mapping (view-into-mapping without copy) or
/// copy into an owned `K`.
pub trait KeyReader<K> {
    fn read_key(&self, bytes: &[u8]) -> K;
}

/// Decodes a value view from raw bytes, given a size and an optional
/// caller-supplied scratch buffer to reuse across calls.
pub trait ValueReader<V> {
    fn read_value(&self, bytes: &[u8], reuse: Option<&mut V>) -> V;
}

/// Callbacks wrapping the view's mutating operations for user
/// customization — e.g. computing a default on miss, or observing
/// replace/remove. All have no-op defaults so a façade only overrides what
/// it needs.
pub trait EntryOperations<K, V> {
    /// Value to insert when a key is absent, or `None` to leave it absent.
    fn default_value(&self, key: &K) -> Option<V> {
        let _ = key;
        None
    }
    fn on_insert(&self, key: &K, value: &V) {
        let _ = (key, value);
    }
    fn on_replace(&self, key: &K, old_value: &V, new_value: &V) {
        let _ = (key, old_value, new_value);
    }
    fn on_remove(&self, key: &K, value: &V) {
        let _ = (key, value);
    }
}

/// Type assertion hook for keys (size limits, forbidden byte patterns, etc).
pub trait KeyChecker<K> {
    fn check_key(&self, key: &K) -> Result<()>;
}

/// Type assertion hook for values.
pub trait ValueChecker<V> {
    fn check_value(&self, value: &V) -> Result<()>;
}
