use thiserror::Error;

/// Errors surfaced by the store, the segment allocator, and the mapping
/// layer beneath it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open the backing file.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file for exclusive writer access.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize to the backing file.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize the backing file.
    #[error(
        "can't resize the backing file. Have 0x{size:x} bytes, wanted to get 0x{requested:x} bytes"
    )]
    ResizeFailed {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    /// Couldn't allocate any more virtual address space.
    #[error("can't allocate any more memory map space. Tried to get 0x{requested:x} bytes")]
    AllocFailed {
        requested: usize,
        source: std::io::Error,
    },
    #[error("punching a hole in the sparse memory map failed")]
    HolePunch(#[source] std::io::Error),
    #[error("invalid access on the memory map was attempted: offset 0x{offset:x}, length 0x{len:x}")]
    InvalidAccess { offset: usize, len: usize },
    #[error("data integrity hash failed for data at offset 0x{offset:x} with length {len}")]
    HashFailed { offset: usize, len: usize },
    /// A structural invariant of the file format was violated.
    #[error("data corruption detected: {0}")]
    DataCorruption(&'static str),
    /// The file's magic or version didn't match what this build understands.
    #[error("unrecognized or incompatible database file version")]
    VersionMismatch,
    /// No segment in the requested tier (or any tier, for growth) could be produced.
    #[error("out of space: needed {0} bytes and no segment could be produced")]
    OutOfSpace(usize),
    /// A key or value exceeded an encodable size.
    #[error("key or value is too large to encode")]
    WriteTooLarge,
    /// A key exceeded [`crab_node::MAX_KEY_BYTES`].
    #[error("key exceeds the maximum key length")]
    KeyTooLong,
    /// A roots-value contained a null object-id on read.
    #[error("roots-value contained a null object-id")]
    InvalidRoot,
    /// A second writer session was requested while one was already active.
    #[error("a writer session is already active")]
    WriterBusy,
    /// Catch-all for conditions not worth a dedicated variant.
    #[error("{0}")]
    Other(&'static str),
}

impl From<crab_node::Error> for Error {
    fn from(value: crab_node::Error) -> Self {
        match value {
            crab_node::Error::OutofSpace(n) => Error::OutOfSpace(n),
            crab_node::Error::DataCorruption => Error::DataCorruption("node decode failed"),
            crab_node::Error::WriteTooLarge => Error::WriteTooLarge,
            crab_node::Error::KeyTooLong => Error::KeyTooLong,
            crab_node::Error::InvalidRoot => Error::InvalidRoot,
            crab_node::Error::Storage(e) => Error::DataCorruption(match e {
                crab_node::StorageError::Io(s) => s,
                crab_node::StorageError::Corruption(s) => s,
                crab_node::StorageError::Safety(s) => s,
                crab_node::StorageError::OutOfRange(_) => "object id out of range",
            }),
        }
    }
}
