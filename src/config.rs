use num_integer::Integer;

use crate::error::{Error, Result};

pub type BaseType = u32;

pub type Lba = BaseType;
pub type Sector = usize;
pub type Segment = usize;
/// Sector-relative slot address: `sector * SLOTS_PER_UNIT + slot`.
pub type Ptr = u16;

pub const ERASE_UNIT_SIZE: BaseType = 64 * 1024;
pub const BLOCK_SIZE: usize = 512;
pub const PAGE_SIZE: BaseType = 256;

pub const INFO_WORD_SIZE: usize = 4;
pub const SLOTS_PER_UNIT: usize = ERASE_UNIT_SIZE as usize / BLOCK_SIZE;
pub const HEADER_SIZE: usize = SLOTS_PER_UNIT * INFO_WORD_SIZE;
/// Info words whose sideband byte carries the unit record.
pub const RECORD_WORDS: usize = 16;

pub const SEGMENT_ENTRIES: usize = BLOCK_SIZE / 2;
/// Logical blocks below this are mapped by the in-memory direct table.
pub const XLATE_OFFSET: Lba = 256;

/// Free slots a write needs: one data block plus a directory merge.
pub const HEADROOM: BaseType = 3;

pub const MIN_UNITS: usize = 4;
/// Keeps every working slot addressable by a 16-bit pointer.
pub const MAX_UNITS: usize = 512;

pub const MAGIC_1: u32 = 0x4E4F_5246;
pub const MAGIC_2: u32 = 0x544C_2101;

pub const DEFAULT_OP: f64 = 7.0;

const _: () = assert!(HEADER_SIZE == BLOCK_SIZE);
const _: () = assert!(SLOTS_PER_UNIT == 128);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FtlConfig {
    /// Percentage of the data slots withheld from the logical address
    /// space so the reclaimer always finds dead slots to recover.
    pub over_provisioning: f64,
}

impl Default for FtlConfig {
    fn default() -> Self {
        FtlConfig { over_provisioning: DEFAULT_OP }
    }
}

impl FtlConfig {
    pub fn new_with_op(op: f64) -> Self {
        FtlConfig { over_provisioning: op }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Erase units in use, spare included.
    pub units: usize,
    /// Working sectors; sector index `sectors` is the spare.
    pub sectors: usize,
    pub block_count: Lba,
    pub segments: usize,
}

impl Geometry {
    pub fn from_capacity(capacity: u64, config: &FtlConfig) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Identify("device reported zero capacity".into()));
        }
        let units = ((capacity / ERASE_UNIT_SIZE as u64) as usize).min(MAX_UNITS);
        if units < MIN_UNITS {
            return Err(Error::Identify(format!(
                "{} erase units is below the minimum of {}",
                units, MIN_UNITS
            )));
        }
        if !(0.0..100.0).contains(&config.over_provisioning) {
            return Err(Error::Identify(format!(
                "over-provisioning {} out of range",
                config.over_provisioning
            )));
        }

        let sectors = units - 1;
        let data_slots = (sectors * (SLOTS_PER_UNIT - 1)) as BaseType;
        let usable = data_slots.saturating_sub(HEADROOM + (SLOTS_PER_UNIT - 1) as BaseType);
        let op_slots = (usable as f64 * (config.over_provisioning / 100.)).ceil() as BaseType;
        let budget = usable - op_slots.min(usable);

        // Each segment may hold a primary and a secondary meta-block.
        let segs_for = |blocks: BaseType| {
            Integer::div_ceil(&blocks.saturating_sub(XLATE_OFFSET), &(SEGMENT_ENTRIES as BaseType))
        };
        let mut block_count = budget;
        while block_count > 0 && block_count + 2 * segs_for(block_count) > budget {
            block_count -= 1;
        }
        if block_count == 0 {
            return Err(Error::Identify("no room left for logical blocks".into()));
        }

        Ok(Geometry {
            units,
            sectors,
            block_count,
            segments: segs_for(block_count) as usize,
        })
    }

    pub fn spare(&self) -> Sector {
        self.sectors
    }

    pub fn unit_addr(unit: u16) -> BaseType {
        unit as BaseType * ERASE_UNIT_SIZE
    }
}

pub fn ptr_of(sector: Sector, slot: usize) -> Ptr {
    (sector * SLOTS_PER_UNIT + slot) as Ptr
}

pub fn sector_of(ptr: Ptr) -> Sector {
    ptr as usize / SLOTS_PER_UNIT
}

pub fn slot_of(ptr: Ptr) -> usize {
    ptr as usize % SLOTS_PER_UNIT
}

/// Splits a logical address above the direct range into `(segment, index)`.
pub fn segment_of(lba: Lba) -> (Segment, usize) {
    let (seg, idx) = (lba - XLATE_OFFSET).div_rem(&(SEGMENT_ENTRIES as Lba));
    (seg as Segment, idx as usize)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn geometry_reserves_spare_and_directory() {
        let g = Geometry::from_capacity(2 * 1024 * 1024, &FtlConfig::default()).unwrap();
        assert_eq!(g.units, 32);
        assert_eq!(g.sectors, 31);
        assert_eq!(g.spare(), 31);
        let data_slots = (31 * (SLOTS_PER_UNIT - 1)) as u32;
        assert!(g.block_count + 2 * g.segments as u32 + HEADROOM < data_slots);
        assert!(g.block_count > 3000);
    }

    #[test]
    fn geometry_rejects_small_or_empty() {
        assert!(matches!(
            Geometry::from_capacity(0, &FtlConfig::default()),
            Err(Error::Identify(_))
        ));
        assert!(matches!(
            Geometry::from_capacity(3 * ERASE_UNIT_SIZE as u64, &FtlConfig::default()),
            Err(Error::Identify(_))
        ));
    }

    #[test]
    fn geometry_caps_unit_count() {
        let g = Geometry::from_capacity(64 * 1024 * 1024, &FtlConfig::default()).unwrap();
        assert_eq!(g.units, MAX_UNITS);
        let max_ptr = ptr_of(g.sectors - 1, SLOTS_PER_UNIT - 1);
        assert!(max_ptr < u16::MAX);
    }

    #[test]
    fn segment_math() {
        assert_eq!(segment_of(XLATE_OFFSET), (0, 0));
        assert_eq!(segment_of(XLATE_OFFSET + 257), (1, 1));
        assert_eq!(sector_of(ptr_of(7, 5)), 7);
        assert_eq!(slot_of(ptr_of(7, 5)), 5);
    }
}
