use thiserror::Error;

use crate::config::Lba;
use crate::flash::FlashError;

/// Errors surfaced by the translation layer.
///
/// Only power-loss style partial operations are repaired, and only at mount.
/// Nothing here is retried: a transport failure is fatal for the call and a
/// structural violation means the device has to be formatted again.
#[derive(Debug, Error)]
pub enum Error {
    /// Capacity probe failed or the device is too small to hold a layout.
    #[error("flash identification failed: {0}")]
    Identify(String),

    /// On-media structure is inconsistent beyond the repairable crash states.
    #[error("device not formatted: {0}")]
    Mount(String),

    /// Raw read, program or erase failure reported by the transport.
    #[error("flash I/O error: {0}")]
    Io(#[from] FlashError),

    /// Reclaim could not free enough slots for the next write.
    #[error("no free slots left after reclaim")]
    CapacityExhausted,

    #[error("block {lba} out of range (block count {block_count})")]
    OutOfRange { lba: Lba, block_count: Lba },

    #[error("buffer of {len} bytes does not hold {count} blocks")]
    BufferSize { len: usize, count: usize },

    #[error("device not mounted")]
    NotMounted,
}

pub type Result<T> = std::result::Result<T, Error>;
