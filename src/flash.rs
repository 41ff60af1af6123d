use thiserror::Error;

use crate::config::{BaseType, ERASE_UNIT_SIZE, PAGE_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("address {addr:#x} (+{len}) beyond device end")]
    OutOfRange { addr: BaseType, len: usize },
    #[error("program at {addr:#x} crosses a page boundary")]
    PageCross { addr: BaseType },
    #[error("erase at {addr:#x} not aligned to an erase unit")]
    Unaligned { addr: BaseType },
    #[error("device stopped responding")]
    PowerLoss,
    #[error("bus error: {0}")]
    Bus(String),
}

/// Raw serial NOR flash as seen by the translation layer.
///
/// Every call blocks until the device is done. Programming can only clear
/// bits; `erase_unit` sets a whole erase unit back to `0xFF`.
pub trait NorFlash {
    /// Total addressable capacity in bytes.
    fn identify(&mut self) -> Result<u64, FlashError>;

    fn read(&mut self, addr: BaseType, buf: &mut [u8]) -> Result<(), FlashError>;

    /// `data` must not cross a `PAGE_SIZE` boundary.
    fn program_page(&mut self, addr: BaseType, data: &[u8]) -> Result<(), FlashError>;

    /// `addr` must be aligned to `ERASE_UNIT_SIZE`.
    fn erase_unit(&mut self, addr: BaseType) -> Result<(), FlashError>;

    /// Programs an arbitrary range, split at page boundaries.
    fn program(&mut self, mut addr: BaseType, mut data: &[u8]) -> Result<(), FlashError> {
        while !data.is_empty() {
            let room = (PAGE_SIZE - addr % PAGE_SIZE) as usize;
            let (head, tail) = data.split_at(room.min(data.len()));
            self.program_page(addr, head)?;
            addr += head.len() as BaseType;
            data = tail;
        }
        Ok(())
    }
}

impl<T: NorFlash + ?Sized> NorFlash for &mut T {
    fn identify(&mut self) -> Result<u64, FlashError> {
        (**self).identify()
    }

    fn read(&mut self, addr: BaseType, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(addr, buf)
    }

    fn program_page(&mut self, addr: BaseType, data: &[u8]) -> Result<(), FlashError> {
        (**self).program_page(addr, data)
    }

    fn erase_unit(&mut self, addr: BaseType) -> Result<(), FlashError> {
        (**self).erase_unit(addr)
    }
}

pub fn is_unit_aligned(addr: BaseType) -> bool {
    addr % ERASE_UNIT_SIZE == 0
}
