//! RAM-backed NOR flash with NOR programming semantics and power-cut
//! injection, used by the demo binary and the tests.

use byte_unit::Byte;
use log::*;

use crate::config::{BaseType, ERASE_UNIT_SIZE, PAGE_SIZE};
use crate::flash::{is_unit_aligned, FlashError, NorFlash};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounters {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
}

#[derive(Clone)]
pub struct RamFlash {
    mem: Vec<u8>,
    /// Mutating operations still allowed before the simulated power cut.
    budget: Option<u64>,
    counters: OpCounters,
    unit_erases: Vec<u32>,
}

impl RamFlash {
    pub fn new(capacity: usize) -> Self {
        trace!(
            "RamFlash: {} bytes, {}",
            capacity,
            Byte::from_bytes(capacity as u128).get_appropriate_unit(true)
        );
        RamFlash {
            mem: vec![0xFF; capacity],
            budget: None,
            counters: OpCounters::default(),
            unit_erases: vec![0; capacity / ERASE_UNIT_SIZE as usize],
        }
    }

    pub fn with_units(units: usize) -> Self {
        RamFlash::new(units * ERASE_UNIT_SIZE as usize)
    }

    /// After `ops` more programs or erases every mutation fails and leaves
    /// the contents untouched, as if power dropped.
    pub fn cut_power_after(&mut self, ops: u64) {
        self.budget = Some(ops);
    }

    pub fn restore_power(&mut self) {
        self.budget = None;
    }

    pub fn is_powered(&self) -> bool {
        self.budget != Some(0)
    }

    pub fn counters(&self) -> OpCounters {
        self.counters
    }

    /// Physical erase cycles per unit since construction.
    pub fn unit_erases(&self) -> &[u32] {
        &self.unit_erases
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mem
    }

    fn spend(&mut self) -> Result<(), FlashError> {
        match self.budget.as_mut() {
            Some(0) => Err(FlashError::PowerLoss),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn range(&self, addr: BaseType, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.mem.len() => Ok(start..end),
            _ => Err(FlashError::OutOfRange { addr, len }),
        }
    }
}

impl NorFlash for RamFlash {
    fn identify(&mut self) -> Result<u64, FlashError> {
        Ok(self.mem.len() as u64)
    }

    fn read(&mut self, addr: BaseType, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.mem[range]);
        self.counters.reads += 1;
        Ok(())
    }

    fn program_page(&mut self, addr: BaseType, data: &[u8]) -> Result<(), FlashError> {
        let range = self.range(addr, data.len())?;
        if !data.is_empty() && addr / PAGE_SIZE != (addr + data.len() as BaseType - 1) / PAGE_SIZE {
            return Err(FlashError::PageCross { addr });
        }
        self.spend()?;
        for (cell, byte) in self.mem[range].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.counters.programs += 1;
        Ok(())
    }

    fn erase_unit(&mut self, addr: BaseType) -> Result<(), FlashError> {
        if !is_unit_aligned(addr) {
            return Err(FlashError::Unaligned { addr });
        }
        let range = self.range(addr, ERASE_UNIT_SIZE as usize)?;
        self.spend()?;
        self.mem[range].fill(0xFF);
        self.unit_erases[(addr / ERASE_UNIT_SIZE) as usize] += 1;
        self.counters.erases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn program_only_clears_bits() {
        let mut flash = RamFlash::with_units(1);
        flash.program(0, &[0xF0, 0x0F]).unwrap();
        flash.program(0, &[0x3C, 0xFF]).unwrap();
        let mut buf = [0u8; 2];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0x30, 0x0F]);

        flash.erase_unit(0).unwrap();
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF]);
        assert_eq!(flash.unit_erases(), &[1]);
    }

    #[test]
    fn program_splits_at_pages() {
        let mut flash = RamFlash::with_units(1);
        flash.program(PAGE_SIZE - 2, &[0u8; 4]).unwrap();
        assert_eq!(flash.counters().programs, 2);
        assert_eq!(
            flash.program_page(PAGE_SIZE - 2, &[0u8; 4]),
            Err(FlashError::PageCross { addr: PAGE_SIZE - 2 })
        );
        assert_eq!(flash.erase_unit(4), Err(FlashError::Unaligned { addr: 4 }));
    }

    #[test]
    fn power_cut_freezes_contents() {
        let mut flash = RamFlash::with_units(1);
        flash.cut_power_after(1);
        flash.program(0, &[0x00]).unwrap();
        assert_eq!(flash.program(1, &[0x00]), Err(FlashError::PowerLoss));
        assert_eq!(flash.erase_unit(0), Err(FlashError::PowerLoss));
        assert!(!flash.is_powered());
        assert_eq!(&flash.bytes()[0..2], &[0x00, 0xFF]);

        flash.restore_power();
        flash.program(1, &[0x00]).unwrap();
        assert_eq!(&flash.bytes()[0..2], &[0x00, 0x00]);
    }
}
