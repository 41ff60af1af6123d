//! Logical to physical directory.
//!
//! Logical blocks below `XLATE_OFFSET` live in the in-memory direct table,
//! rebuilt at mount from the data slots' own tags. Everything above goes
//! through per-segment meta-blocks of 256 little-endian `u16` pointers: the
//! primary `xlate` block and, while entries are being overwritten, a
//! secondary `xlate2` block. A primary entry that has moved to the
//! secondary is zeroed so lookups fall through. Entries are only ever
//! programmed in place (erased -> pointer -> zero); once the secondary
//! would need a second value for an index, both blocks are merged.

use log::*;

use super::FlashTranslationLayer;
use crate::codec::{Decoded, Info, Kind};
use crate::config::*;
use crate::error::Result;
use crate::flash::NorFlash;

pub const UNALLOCATED: u16 = 0xFFFF;
pub const DELETED: u16 = 0x0000;

pub(super) struct MetaPage {
    ptr: Ptr,
    entries: Vec<u16>,
}

fn live(entry: u16) -> Option<Ptr> {
    match entry {
        UNALLOCATED | DELETED => None,
        ptr => Some(ptr),
    }
}

impl<F: NorFlash> FlashTranslationLayer<F> {
    pub(super) fn resolve(&mut self, lba: Lba) -> Result<Option<Ptr>> {
        if lba < XLATE_OFFSET {
            return Ok(self.direct[lba as usize]);
        }
        let (seg, idx) = segment_of(lba);
        let Some(x) = self.xlate[seg] else {
            return Ok(None);
        };
        match self.meta_entry(x, idx)? {
            UNALLOCATED => Ok(None),
            DELETED => match self.xlate2[seg] {
                Some(s) => Ok(live(self.meta_entry(s, idx)?)),
                None => Ok(None),
            },
            ptr => Ok(Some(ptr)),
        }
    }

    /// Points `lba` at `ptr`, retiring whatever it pointed at before.
    /// Committing the pointer already in place is a no-op.
    pub(super) fn commit(&mut self, lba: Lba, ptr: Ptr) -> Result<()> {
        let old = self.resolve(lba)?;
        if old == Some(ptr) {
            return Ok(());
        }
        if let Some(old) = old {
            self.retire(old)?;
        }

        if lba < XLATE_OFFSET {
            self.direct[lba as usize] = Some(ptr);
            return Ok(());
        }

        let (seg, idx) = segment_of(lba);
        let x = match self.xlate[seg] {
            Some(x) => x,
            None => {
                let x = self.write_meta_page(seg, idx, ptr, Kind::Xlate)?;
                self.xlate[seg] = Some(x);
                return Ok(());
            }
        };
        if self.meta_entry(x, idx)? == UNALLOCATED {
            return self.program_meta_entry(x, idx, ptr);
        }

        let primary = match self.xlate2[seg] {
            None => {
                self.xlate2[seg] = Some(self.write_meta_page(seg, idx, ptr, Kind::XlateSecondary)?);
                x
            }
            Some(s) => match self.meta_entry(s, idx)? {
                UNALLOCATED => {
                    self.program_meta_entry(s, idx, ptr)?;
                    x
                }
                entry if entry == ptr => x,
                _ => {
                    let merged = self.merge(seg, x, s)?;
                    self.xlate2[seg] =
                        Some(self.write_meta_page(seg, idx, ptr, Kind::XlateSecondary)?);
                    merged
                }
            },
        };
        if self.meta_entry(primary, idx)? != DELETED {
            self.program_meta_entry(primary, idx, DELETED)?;
        }
        Ok(())
    }

    /// Folds the secondary block into a fresh primary.
    ///
    /// The merged block is tagged secondary first, then the old secondary
    /// and primary are retired, then it is promoted. Every intermediate
    /// state resolves identically, and mount finishes the promotion.
    fn merge(&mut self, seg: Segment, x: Ptr, s: Ptr) -> Result<Ptr> {
        let mut merged = self.meta_entries(x)?;
        let secondary = self.meta_entries(s)?;
        for (dst, src) in merged.iter_mut().zip(&secondary) {
            if *src != UNALLOCATED {
                *dst = *src;
            }
        }

        let m = self.write_meta_entries(seg, merged, Kind::XlateSecondary)?;
        self.retire(s)?;
        self.retire(x)?;
        self.retag(m, Kind::Xlate)?;
        self.xlate[seg] = Some(m);
        self.xlate2[seg] = None;
        debug!("segment {}: merged {:#06x} + {:#06x} into {:#06x}", seg, x, s, m);
        Ok(m)
    }

    /// Drops the mapping of `lba` if it still points at `ptr`.
    pub(super) fn unmap(&mut self, lba: Lba, ptr: Ptr) -> Result<()> {
        if lba < XLATE_OFFSET {
            if self.direct[lba as usize] == Some(ptr) {
                self.direct[lba as usize] = None;
            }
            return Ok(());
        }
        let (seg, idx) = segment_of(lba);
        let Some(x) = self.xlate[seg] else {
            return Ok(());
        };
        let secondary = self.xlate2[seg];
        match (self.meta_entry(x, idx)?, secondary) {
            (entry, _) if entry == ptr => self.program_meta_entry(x, idx, DELETED),
            (DELETED, Some(s)) => {
                if self.meta_entry(s, idx)? == ptr {
                    self.program_meta_entry(s, idx, DELETED)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Marks a superseded slot `Deleted` and charges it to its sector.
    /// A slot that is already dead or reads unwritten is left alone.
    pub(super) fn retire(&mut self, ptr: Ptr) -> Result<()> {
        match self.read_info(ptr)? {
            Decoded::Unwritten => {
                warn!("retire of unwritten slot {:#06x} skipped", ptr);
                return Ok(());
            }
            Decoded::Entry(info) if info.kind == Kind::Deleted => return Ok(()),
            _ => {}
        }
        self.retag(ptr, Kind::Deleted)?;
        self.score[sector_of(ptr)] += 1;
        Ok(())
    }

    fn write_meta_page(&mut self, seg: Segment, idx: usize, ptr: Ptr, kind: Kind) -> Result<Ptr> {
        let mut entries = vec![UNALLOCATED; SEGMENT_ENTRIES];
        entries[idx] = ptr;
        self.write_meta_entries(seg, entries, kind)
    }

    fn write_meta_entries(&mut self, seg: Segment, entries: Vec<u16>, kind: Kind) -> Result<Ptr> {
        let m = self.allocate()?;
        let payload = seg as u32;
        self.program_info(m, Info::new(Kind::Reserved, payload))?;
        let bytes: Vec<u8> = entries.iter().flat_map(|e| e.to_le_bytes()).collect();
        let addr = self.slot_addr(m);
        self.flash.program(addr, &bytes)?;
        self.program_info(m, Info::new(kind, payload))?;
        self.cache = Some(MetaPage { ptr: m, entries });
        Ok(m)
    }

    fn load_meta(&mut self, ptr: Ptr) -> Result<&MetaPage> {
        let page = match self.cache.take() {
            Some(page) if page.ptr == ptr => page,
            _ => {
                let mut bytes = vec![0u8; BLOCK_SIZE];
                let addr = self.slot_addr(ptr);
                self.flash.read(addr, &mut bytes)?;
                let entries = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                MetaPage { ptr, entries }
            }
        };
        Ok(self.cache.insert(page))
    }

    fn meta_entry(&mut self, ptr: Ptr, idx: usize) -> Result<u16> {
        Ok(self.load_meta(ptr)?.entries[idx])
    }

    fn meta_entries(&mut self, ptr: Ptr) -> Result<Vec<u16>> {
        Ok(self.load_meta(ptr)?.entries.clone())
    }

    fn program_meta_entry(&mut self, ptr: Ptr, idx: usize, value: u16) -> Result<()> {
        let addr = self.slot_addr(ptr) + (idx * 2) as BaseType;
        self.flash.program(addr, &value.to_le_bytes())?;
        if let Some(page) = self.cache.as_mut().filter(|c| c.ptr == ptr) {
            page.entries[idx] &= value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinels_are_not_pointers() {
        assert_eq!(live(UNALLOCATED), None);
        assert_eq!(live(DELETED), None);
        assert_eq!(live(0x0181), Some(0x0181));
    }
}
