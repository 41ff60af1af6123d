use byte_unit::Byte;
use log::*;

use crate::codec::{words_from_bytes, Decoded, Info, Kind, UnitHeader, PAYLOAD_MASK};
use crate::config::*;
use crate::error::{Error, Result};
use crate::flash::NorFlash;

mod directory;
mod mount;
mod reclaim;


use directory::MetaPage;
pub use reclaim::ReclaimState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub block_count: Lba,
    pub block_size: usize,
    pub erase_unit_size: BaseType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub free_slots: BaseType,
    pub reclaims: u64,
    pub min_erase_count: u32,
    pub max_erase_count: u32,
}

/// Maps fixed-size logical blocks onto erase units of a NOR flash.
///
/// Single-threaded and synchronous: the caller serializes access, and every
/// operation (including the reclaims it triggers) is durable on return.
pub struct FlashTranslationLayer<F: NorFlash> {
    flash: F,
    geometry: Geometry,
    mounted: bool,

    /// Sector to physical erase unit; the last entry is the spare.
    units: Vec<u16>,
    erase_counts: Vec<u32>,
    max_erase_count: u32,
    delta: Vec<u8>,
    score: Vec<u16>,
    free: Vec<u16>,

    free_total: BaseType,
    alloc_sector: Sector,
    alloc_map: u128,
    last_victim: Sector,

    direct: Vec<Option<Ptr>>,
    xlate: Vec<Option<Ptr>>,
    xlate2: Vec<Option<Ptr>>,
    cache: Option<MetaPage>,

    recovered: ReclaimState,
    reclaims: u64,
}

impl<F: NorFlash> FlashTranslationLayer<F> {
    /// Identifies the device and derives the layout; does not touch media.
    pub fn new(mut flash: F, config: FtlConfig) -> Result<Self> {
        let capacity = flash.identify().map_err(|e| Error::Identify(e.to_string()))?;
        let geometry = Geometry::from_capacity(capacity, &config)?;

        info!(
            "flash {}: {} erase units, {} logical blocks ({}), op {}%",
            Byte::from_bytes(capacity as u128).get_appropriate_unit(true),
            geometry.units,
            geometry.block_count,
            Byte::from_bytes(geometry.block_count as u128 * BLOCK_SIZE as u128)
                .get_appropriate_unit(true),
            config.over_provisioning
        );

        Ok(FlashTranslationLayer {
            flash,
            geometry,
            mounted: false,
            units: Vec::new(),
            erase_counts: Vec::new(),
            max_erase_count: 0,
            delta: Vec::new(),
            score: Vec::new(),
            free: Vec::new(),
            free_total: 0,
            alloc_sector: 0,
            alloc_map: 0,
            last_victim: 0,
            direct: Vec::new(),
            xlate: Vec::new(),
            xlate2: Vec::new(),
            cache: None,
            recovered: ReclaimState::Normal,
            reclaims: 0,
        })
    }

    /// Identifies and mounts in one step.
    pub fn open(flash: F, config: FtlConfig) -> Result<Self> {
        let mut ftl = Self::new(flash, config)?;
        ftl.mount()?;
        Ok(ftl)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            block_count: self.geometry.block_count,
            block_size: BLOCK_SIZE,
            erase_unit_size: ERASE_UNIT_SIZE,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Crash state found and repaired by the last mount.
    pub fn recovered(&self) -> ReclaimState {
        self.recovered
    }

    pub fn stats(&self) -> Stats {
        Stats {
            free_slots: self.free_total,
            reclaims: self.reclaims,
            min_erase_count: self.erase_counts.iter().copied().min().unwrap_or(0),
            max_erase_count: self.max_erase_count,
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Erases every unit, writes fresh headers and mounts the empty device.
    pub fn format(&mut self) -> Result<()> {
        self.mounted = false;
        self.cache = None;
        let spare = self.geometry.spare();
        for unit in 0..self.geometry.units {
            let unit = unit as u16;
            self.flash.erase_unit(Geometry::unit_addr(unit))?;
            let sector = (unit as usize).min(spare) as u32;
            self.program_header(unit, UnitHeader::new(Kind::Erase, sector, 1))?;
        }
        info!("formatted {} erase units", self.geometry.units);
        self.mount()
    }

    /// Readiness check only; writes are durable when they return.
    pub fn sync(&mut self) -> Result<()> {
        self.ensure_mounted()
    }

    pub fn read(&mut self, lba: Lba, count: usize, buf: &mut [u8]) -> Result<()> {
        self.check_request(lba, count, buf.len())?;
        for (i, block) in buf.chunks_exact_mut(BLOCK_SIZE).take(count).enumerate() {
            self.read_block(lba + i as Lba, block)?;
        }
        Ok(())
    }

    pub fn write(&mut self, lba: Lba, count: usize, data: &[u8]) -> Result<()> {
        self.check_request(lba, count, data.len())?;
        for (i, block) in data.chunks_exact(BLOCK_SIZE).take(count).enumerate() {
            self.write_block(lba + i as Lba, block)?;
        }
        Ok(())
    }

    pub fn discard(&mut self, lba: Lba, count: usize) -> Result<()> {
        self.check_request(lba, count, count.saturating_mul(BLOCK_SIZE))?;
        for i in 0..count {
            self.discard_block(lba + i as Lba)?;
        }
        Ok(())
    }

    fn ensure_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(Error::NotMounted)
        }
    }

    /// Range first: once `count` fits the device, `count * BLOCK_SIZE`
    /// cannot overflow.
    fn check_request(&self, lba: Lba, count: usize, len: usize) -> Result<()> {
        self.ensure_mounted()?;
        let end = (lba as u64).saturating_add(count as u64);
        if end > self.geometry.block_count as u64 {
            return Err(Error::OutOfRange {
                lba: end.saturating_sub(1).min(Lba::MAX as u64) as Lba,
                block_count: self.geometry.block_count,
            });
        }
        if len < count * BLOCK_SIZE {
            return Err(Error::BufferSize { len, count });
        }
        Ok(())
    }

    fn read_block(&mut self, lba: Lba, block: &mut [u8]) -> Result<()> {
        match self.resolve(lba)? {
            Some(ptr) => {
                let addr = self.slot_addr(ptr);
                self.flash.read(addr, block)?;
            }
            None => block.fill(0xFF),
        }
        Ok(())
    }

    fn write_block(&mut self, lba: Lba, block: &[u8]) -> Result<()> {
        self.ensure_headroom()?;
        let ptr = self.allocate()?;
        trace!("write lba {} -> {:#06x}", lba, ptr);

        self.program_info(ptr, Info::new(Kind::Reserved, lba))?;
        let addr = self.slot_addr(ptr);
        self.flash.program(addr, block)?;
        self.program_info(ptr, Info::new(Kind::DataWritten, lba))?;
        self.commit(lba, ptr)?;
        self.program_info(ptr, Info::new(Kind::DataCommitted, lba))
    }

    fn discard_block(&mut self, lba: Lba) -> Result<()> {
        let Some(ptr) = self.resolve(lba)? else {
            return Ok(());
        };
        trace!("discard lba {} at {:#06x}", lba, ptr);

        self.program_info(ptr, Info::new(Kind::DataDeleted, lba))?;
        self.unmap(lba, ptr)?;
        self.program_info(ptr, Info::new(Kind::Deleted, lba))?;
        self.score[sector_of(ptr)] += 1;
        Ok(())
    }

    /// Hands out the lowest free slot of the allocation sector, moving on
    /// round-robin when it runs dry.
    fn allocate(&mut self) -> Result<Ptr> {
        let mut hops = 0;
        while self.alloc_map == 0 {
            if hops > self.geometry.sectors {
                return Err(Error::CapacityExhausted);
            }
            hops += 1;
            self.alloc_sector = (self.alloc_sector + 1) % self.geometry.sectors;
            if self.free[self.alloc_sector] > 0 {
                self.alloc_map = self.free_map(self.alloc_sector)?;
            }
        }

        let slot = self.alloc_map.trailing_zeros() as usize;
        self.alloc_map &= !(1u128 << slot);
        self.free[self.alloc_sector] -= 1;
        self.free_total -= 1;
        Ok(ptr_of(self.alloc_sector, slot))
    }

    fn free_map(&mut self, sector: Sector) -> Result<u128> {
        let words = self.read_header_words(self.units[sector])?;
        Ok(unwritten_map(&words))
    }

    fn slot_addr(&self, ptr: Ptr) -> BaseType {
        Geometry::unit_addr(self.units[sector_of(ptr)]) + (slot_of(ptr) * BLOCK_SIZE) as BaseType
    }

    fn info_addr(&self, ptr: Ptr) -> BaseType {
        Geometry::unit_addr(self.units[sector_of(ptr)]) + (slot_of(ptr) * INFO_WORD_SIZE) as BaseType
    }

    fn read_info(&mut self, ptr: Ptr) -> Result<Decoded> {
        let mut word = [0u8; INFO_WORD_SIZE];
        let addr = self.info_addr(ptr);
        self.flash.read(addr, &mut word)?;
        Ok(Info::decode(u32::from_le_bytes(word)))
    }

    fn program_info(&mut self, ptr: Ptr, info: Info) -> Result<()> {
        let addr = self.info_addr(ptr);
        self.flash.program(addr, &info.encode().to_le_bytes())?;
        Ok(())
    }

    /// Moves a slot to `kind` without disturbing its payload.
    fn retag(&mut self, ptr: Ptr, kind: Kind) -> Result<()> {
        self.program_info(ptr, Info::new(kind, PAYLOAD_MASK))
    }

    fn program_header(&mut self, unit: u16, header: UnitHeader) -> Result<()> {
        self.flash.program(Geometry::unit_addr(unit), &header.encode())?;
        Ok(())
    }

    fn read_header_words(&mut self, unit: u16) -> Result<Vec<u32>> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        self.flash.read(Geometry::unit_addr(unit), &mut bytes)?;
        Ok(words_from_bytes(&bytes).collect())
    }
}

/// Bit `i` set when header word `i` (slot 0 excluded) was never programmed.
fn unwritten_map(words: &[u32]) -> u128 {
    words
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, w)| Info::decode(**w) == Decoded::Unwritten)
        .fold(0u128, |map, (slot, _)| map | (1u128 << slot))
}
