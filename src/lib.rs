//! Flash translation layer for serial NOR flash.
//!
//! Turns a raw device of erase units into a crash-safe, wear-leveled array
//! of fixed-size logical blocks for a FAT filesystem. See [`ftl`] for the
//! block API, [`codec`] for the on-media header format and [`sim`] for the
//! RAM-backed flash used by the demo and the tests.

pub mod codec;
pub mod config;
pub mod error;
pub mod flash;
pub mod ftl;
pub mod sim;

pub use config::{FtlConfig, Geometry, Lba, BLOCK_SIZE};
pub use error::{Error, Result};
pub use flash::{FlashError, NorFlash};
pub use ftl::{DeviceInfo, FlashTranslationLayer, ReclaimState, Stats};
pub use sim::RamFlash;
