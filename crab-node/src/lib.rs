#![no_std]

//! Packed node representations and the radix-trie engine built on top of
//! them. This crate has no knowledge of files, mmaps, or segments; it only
//! knows how to encode/decode nodes into byte slices handed to it by the
//! allocator, and how to walk/edit a tree of [`ObjectId`]s given a callback
//! that resolves an id to bytes.

extern crate alloc;

mod object_id;
mod key6;
mod node;
mod trie;
mod cursor;

pub use object_id::{ObjectId, MAX_OBJECT_ID};
pub use key6::{from_key6, to_key6};
pub use node::{InnerNode, NodeType, ValueNode, ValuePayload};
pub use trie::{
    common_prefix, get_greater_equal, get_less_than, get_max_in_prefix, insert, lookup,
    lookup_value_id, remove, Resolver, Writer,
};
pub use cursor::{
    first, first_with_prefix, last, last_with_prefix, lower_bound, reverse_lower_bound,
    upper_bound, Cursor, Frame,
};

/// Maximum original (pre-6-bit-expansion) key length, in bytes.
///
/// Chosen per the file-format version: large enough for any realistic key
/// while keeping the packed digit-length field well clear of `u16`
/// overflow (512 bytes expands to 683 six-bit digits).
pub const MAX_KEY_BYTES: usize = 512;

#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageError {
    /// I/O error in storage system.
    Io(&'static str),
    /// Database corruption detected.
    Corruption(&'static str),
    /// Rust memory safety violation detected.
    Safety(&'static str),
    /// Out of range request was made.
    OutOfRange(u64),
}

impl From<StorageError> for Error {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O Error: {}", s),
            Self::Corruption(s) => write!(f, "Database corruption: {}", s),
            Self::Safety(s) => write!(f, "Safety violation: {}", s),
            Self::OutOfRange(r) => write!(
                f,
                "Page outside of storage range was requested: Page 0x{:x}",
                r
            ),
        }
    }
}

impl core::error::Error for StorageError {}

/// Error that can arise while decoding or editing a node.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    OutofSpace(usize),
    DataCorruption,
    WriteTooLarge,
    KeyTooLong,
    InvalidRoot,
    Storage(StorageError),
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        if let Self::Storage(e) = self {
            Some(e)
        } else {
            None
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutofSpace(s) => write!(f, "No space left to insert, needed {s} bytes"),
            Self::DataCorruption => f.write_str("Data Corruption"),
            Self::WriteTooLarge => f.write_str("Provided Key/Value is too large to encode"),
            Self::KeyTooLong => f.write_str("Key exceeds the maximum key length"),
            Self::InvalidRoot => f.write_str("roots-value contained a null object-id"),
            Self::Storage(_) => f.write_str("Storage system error"),
        }
    }
}
