//! Mount-time scan and crash repair.
//!
//! Pass one reads every unit's slot-0 record, classifies the in-flight
//! reclaim (if any) and drives it to completion. Pass two reads every
//! working sector's full header to rebuild the directory, free-slot
//! accounting and wear metrics, then finishes an interrupted directory
//! merge and replays the single write or discard that may have been cut
//! short.

use log::*;

use super::reclaim::{ReclaimJob, ReclaimState};
use super::{unwritten_map, FlashTranslationLayer};
use crate::codec::{Decoded, HeaderState, Info, Kind, UnitHeader};
use crate::config::*;
use crate::error::{Error, Result};
use crate::flash::NorFlash;

fn corrupt(detail: String) -> Error {
    error!("mount failed: {}", detail);
    Error::Mount(detail)
}

/// Units found in pass one, before any repair.
#[derive(Default)]
struct Census {
    homes: Vec<Option<(u16, u32)>>,
    victim: Option<(u16, UnitHeader)>,
    reclaim: Option<(u16, UnitHeader)>,
    blank: Option<u16>,
    max_erase_count: u32,
}

impl Census {
    fn place(&mut self, sector: usize, unit: u16, erase_count: u32) -> Result<()> {
        match self.homes[sector].replace((unit, erase_count)) {
            Some((other, _)) => Err(corrupt(format!(
                "units {} and {} both claim sector {}",
                other, unit, sector
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct Pending {
    write: Option<(Lba, Ptr)>,
    delete: Option<(Lba, Ptr)>,
}

impl<F: NorFlash> FlashTranslationLayer<F> {
    pub fn mount(&mut self) -> Result<()> {
        self.mounted = false;
        self.cache = None;
        self.recovered = ReclaimState::Normal;

        let census = self.census()?;
        self.repair_reclaim(census)?;
        let pending = self.collect_all()?;
        self.replay(pending)?;

        self.mounted = true;
        info!(
            "mounted: {} blocks, {} free slots, max erase count {}, recovered {:?}",
            self.geometry.block_count, self.free_total, self.max_erase_count, self.recovered
        );
        Ok(())
    }

    fn census(&mut self) -> Result<Census> {
        let sectors = self.geometry.sectors;
        let mut census = Census {
            homes: vec![None; sectors + 1],
            ..Census::default()
        };
        let mut bytes = [0u8; RECORD_WORDS * INFO_WORD_SIZE];

        for unit in 0..self.geometry.units as u16 {
            self.flash.read(Geometry::unit_addr(unit), &mut bytes)?;
            let header = match UnitHeader::decode(&bytes) {
                HeaderState::Blank => {
                    if let Some(other) = census.blank.replace(unit) {
                        return Err(corrupt(format!("units {} and {} are both blank", other, unit)));
                    }
                    continue;
                }
                HeaderState::Corrupt(why) => return Err(corrupt(format!("unit {}: {}", unit, why))),
                HeaderState::Valid(header) => header,
            };
            if header.sector as usize > sectors {
                return Err(corrupt(format!("unit {}: sector {} out of range", unit, header.sector)));
            }
            census.max_erase_count = census.max_erase_count.max(header.erase_count);

            let duplicate = match header.kind {
                Kind::Victim => census.victim.replace((unit, header)).is_some(),
                Kind::Reclaim => census.reclaim.replace((unit, header)).is_some(),
                _ => {
                    census.place(header.sector as usize, unit, header.erase_count)?;
                    false
                }
            };
            if duplicate {
                return Err(corrupt(format!("more than one {:?} unit", header.kind)));
            }
        }
        Ok(census)
    }

    /// Restores "one spare, no victim" from whatever pass one found.
    fn repair_reclaim(&mut self, mut census: Census) -> Result<()> {
        let spare = self.geometry.spare();
        let max = census.max_erase_count;
        let mut job = None;
        let mut settle = None;

        match (census.victim, census.reclaim, census.blank) {
            (None, None, None) => {}
            (Some((unit, victim)), None, blank) => {
                if victim.reclaim_erase_count == u32::MAX {
                    return Err(corrupt(format!("victim unit {} lacks a reclaim erase count", unit)));
                }
                census.place(victim.sector as usize, unit, victim.erase_count)?;
                self.recovered = match blank {
                    Some(b) => {
                        census.place(spare, b, victim.reclaim_erase_count.saturating_sub(1))?;
                        ReclaimState::ErasePending
                    }
                    None => ReclaimState::VictimMarked,
                };
                job = Some(ReclaimJob {
                    victim: victim.sector as Sector,
                    state: self.recovered,
                    reclaim_erase_count: victim.reclaim_erase_count,
                });
            }
            (Some((vunit, victim)), Some((runit, reclaim)), None) => {
                if victim.sector != reclaim.sector {
                    return Err(corrupt(format!(
                        "victim sector {} and reclaim sector {} differ",
                        victim.sector, reclaim.sector
                    )));
                }
                census.place(reclaim.sector as usize, runit, reclaim.erase_count)?;
                census.place(spare, vunit, victim.erase_count)?;
                self.recovered = ReclaimState::ReclaimMarked;
                job = Some(ReclaimJob {
                    victim: reclaim.sector as Sector,
                    state: ReclaimState::ReclaimMarked,
                    reclaim_erase_count: reclaim.erase_count,
                });
            }
            (None, Some((runit, reclaim)), blank) => {
                census.place(reclaim.sector as usize, runit, reclaim.erase_count)?;
                self.recovered = ReclaimState::ReclaimMarked;
                match blank {
                    // victim erased, its spare header never written
                    Some(b) => {
                        census.place(spare, b, max)?;
                        job = Some(ReclaimJob {
                            victim: reclaim.sector as Sector,
                            state: ReclaimState::ReclaimMarked,
                            reclaim_erase_count: reclaim.erase_count,
                        });
                    }
                    None => settle = Some(reclaim.sector as Sector),
                }
            }
            (None, None, Some(b)) => {
                warn!("unit {} is blank, adopting it as the spare", b);
                census.place(spare, b, max)?;
                self.program_header(b, UnitHeader::new(Kind::Erase, spare as u32, max))?;
            }
            (Some(_), Some(_), Some(_)) => {
                return Err(corrupt("victim, reclaim and blank units all present".into()));
            }
        }

        self.units.clear();
        self.erase_counts.clear();
        for (sector, home) in census.homes.iter().enumerate() {
            let Some((unit, erase_count)) = *home else {
                return Err(corrupt(format!("sector {} has no erase unit", sector)));
            };
            self.units.push(unit);
            self.erase_counts.push(erase_count);
        }
        self.max_erase_count = max;

        if let Some(job) = job {
            warn!("finishing reclaim of sector {} from {:?}", job.victim, job.state);
            self.drive(job)?;
        }
        if let Some(sector) = settle {
            warn!("settling reclaimed sector {}", sector);
            self.settle_reclaim(sector)?;
        }
        Ok(())
    }

    /// Rebuilds every in-memory table from the working sectors' headers.
    fn collect_all(&mut self) -> Result<Pending> {
        let sectors = self.geometry.sectors;
        let block_count = self.geometry.block_count;
        let segments = self.geometry.segments;

        self.direct = vec![None; XLATE_OFFSET.min(block_count) as usize];
        self.xlate = vec![None; segments];
        self.xlate2 = vec![None; segments];
        self.score = vec![0; sectors];
        self.free = vec![0; sectors];
        self.delta = self.erase_counts[..sectors]
            .iter()
            .map(|ec| self.max_erase_count.saturating_sub(*ec).min(u8::MAX as u32) as u8)
            .collect();

        let mut pending = Pending::default();
        let mut extra_secondaries = Vec::new();

        for sector in 0..sectors {
            let words = self.read_header_words(self.units[sector])?;
            let map = unwritten_map(&words);
            self.free[sector] = map.count_ones() as u16;
            if sector == 0 {
                self.alloc_map = map;
            }

            for (slot, word) in words.iter().enumerate().skip(1) {
                let ptr = ptr_of(sector, slot);
                let info = match Info::decode(*word) {
                    Decoded::Unwritten => continue,
                    Decoded::Unknown(tag) => {
                        return Err(corrupt(format!("slot {:#06x}: unknown tag {:#x}", ptr, tag)));
                    }
                    Decoded::Entry(info) => info,
                };
                let lba = info.payload;
                let seg = info.payload as Segment;
                match info.kind {
                    Kind::Deleted | Kind::Reserved => self.score[sector] += 1,
                    Kind::DataDeleted => {
                        self.score[sector] += 1;
                        check_lba(ptr, lba, block_count)?;
                        if pending.delete.replace((lba, ptr)).is_some() {
                            return Err(corrupt("more than one pending discard".into()));
                        }
                    }
                    Kind::DataWritten => {
                        check_lba(ptr, lba, block_count)?;
                        if pending.write.replace((lba, ptr)).is_some() {
                            return Err(corrupt("more than one pending write".into()));
                        }
                    }
                    Kind::DataCommitted => {
                        check_lba(ptr, lba, block_count)?;
                        if lba < XLATE_OFFSET && self.direct[lba as usize].replace(ptr).is_some() {
                            return Err(corrupt(format!("block {} committed twice", lba)));
                        }
                    }
                    Kind::Xlate => {
                        check_segment(ptr, seg, segments)?;
                        if self.xlate[seg].replace(ptr).is_some() {
                            return Err(corrupt(format!("segment {} has two primaries", seg)));
                        }
                    }
                    Kind::XlateSecondary => {
                        check_segment(ptr, seg, segments)?;
                        if self.xlate2[seg].is_some() {
                            extra_secondaries.push((seg, ptr));
                        } else {
                            self.xlate2[seg] = Some(ptr);
                        }
                    }
                    Kind::Victim | Kind::Erase | Kind::Reclaim => {
                        return Err(corrupt(format!("slot {:#06x}: unit tag in a data slot", ptr)));
                    }
                }
            }
        }

        self.free_total = self.free.iter().map(|f| *f as BaseType).sum();
        self.alloc_sector = 0;
        self.last_victim = sectors - 1;

        self.finish_merges(extra_secondaries)?;
        Ok(pending)
    }

    /// A merge cut short leaves either two secondaries beside a live
    /// primary, where both resolve alike and one is dropped, or a lone
    /// secondary, which is the merged block awaiting promotion.
    fn finish_merges(&mut self, extra_secondaries: Vec<(Segment, Ptr)>) -> Result<()> {
        let mut seen = vec![false; self.geometry.segments];
        for (seg, ptr) in extra_secondaries {
            if self.xlate[seg].is_none() || std::mem::replace(&mut seen[seg], true) {
                return Err(corrupt(format!("segment {} has conflicting secondaries", seg)));
            }
            warn!("segment {}: dropping duplicate secondary {:#06x}", seg, ptr);
            self.retire(ptr)?;
        }

        for seg in 0..self.geometry.segments {
            if let (None, Some(s)) = (self.xlate[seg], self.xlate2[seg]) {
                warn!("segment {}: promoting secondary {:#06x}", seg, s);
                self.retag(s, Kind::Xlate)?;
                self.xlate[seg] = Some(s);
                self.xlate2[seg] = None;
            }
        }
        Ok(())
    }

    /// Drives the interrupted write or discard through the directory once.
    ///
    /// A reclaim recycles dead slots, so no directory entry may point at one
    /// when `ensure_headroom` runs: the discarded slot is unmapped first, and
    /// the copy a pending write supersedes is retired and unmapped first.
    fn replay(&mut self, pending: Pending) -> Result<()> {
        if let Some((lba, ptr)) = pending.delete {
            warn!("replaying discard of block {} at {:#06x}", lba, ptr);
            self.unmap(lba, ptr)?;
            if let Decoded::Entry(info) = self.read_info(ptr)? {
                if info.kind == Kind::DataDeleted {
                    self.retag(ptr, Kind::Deleted)?;
                }
            }
        }
        if let Some((lba, ptr)) = pending.write {
            warn!("replaying write of block {} at {:#06x}", lba, ptr);
            if let Some(old) = self.resolve(lba)?.filter(|old| *old != ptr) {
                self.retire(old)?;
                self.unmap(lba, old)?;
            }
            self.ensure_headroom()?;
            self.commit(lba, ptr)?;
            self.retag(ptr, Kind::DataCommitted)?;
        }
        Ok(())
    }
}

fn check_lba(ptr: Ptr, lba: Lba, block_count: Lba) -> Result<()> {
    if lba >= block_count {
        return Err(corrupt(format!("slot {:#06x}: block {} out of range", ptr, lba)));
    }
    Ok(())
}

fn check_segment(ptr: Ptr, seg: Segment, segments: usize) -> Result<()> {
    if seg >= segments {
        return Err(corrupt(format!("slot {:#06x}: segment {} out of range", ptr, seg)));
    }
    Ok(())
}
