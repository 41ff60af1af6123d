use log::*;

use super::FlashTranslationLayer;
use crate::codec::{without_sideband, Decoded, Info, Kind, UnitHeader};
use crate::config::*;
use crate::error::{Error, Result};
use crate::flash::NorFlash;

/// Where a reclaim stands, as recorded on media by its commit points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReclaimState {
    /// No reclaim in flight.
    #[default]
    Normal,
    /// Victim header tagged `Victim`; the spare still carries its own header.
    VictimMarked,
    /// Victim tagged and the copy target is blank, possibly half filled.
    ErasePending,
    /// Copy finished and the target tagged `Reclaim`; the old victim still
    /// has to become the spare.
    ReclaimMarked,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct ReclaimJob {
    pub victim: Sector,
    pub state: ReclaimState,
    pub reclaim_erase_count: u32,
}

impl<F: NorFlash> FlashTranslationLayer<F> {
    /// Reclaims until a write is guaranteed its data slot plus directory
    /// updates.
    pub(super) fn ensure_headroom(&mut self) -> Result<()> {
        let limit = (self.geometry.sectors + 1) * (HEADROOM as usize + 1);
        let mut rounds = 0;
        while self.free_total < HEADROOM {
            if rounds == limit {
                warn!("{} reclaims left only {} free slots", rounds, self.free_total);
                return Err(Error::CapacityExhausted);
            }
            rounds += 1;
            let victim = self.select_victim();
            self.reclaim(victim)?;
        }
        Ok(())
    }

    /// Round-robin scan from just past the last victim for the strictly
    /// greatest `delta + score`; the first sector seen wins a tie.
    pub(super) fn select_victim(&self) -> Sector {
        let sectors = self.geometry.sectors;
        let mut best = (self.last_victim + 1) % sectors;
        let mut best_value = None;
        for i in 1..=sectors {
            let sector = (self.last_victim + i) % sectors;
            let value = self.delta[sector] as u32 + self.score[sector] as u32;
            if best_value.map_or(true, |b| value > b) {
                best = sector;
                best_value = Some(value);
            }
        }
        best
    }

    pub(super) fn reclaim(&mut self, victim: Sector) -> Result<()> {
        let job = ReclaimJob {
            victim,
            state: ReclaimState::Normal,
            reclaim_erase_count: 0,
        };
        let map = self.drive(job)?.unwrap_or_default();

        let free = map.count_ones() as u16;
        self.free_total += free.saturating_sub(self.free[victim]) as BaseType;
        debug!(
            "reclaimed sector {} into unit {}: {} -> {} free slots",
            victim, self.units[victim], self.free[victim], free
        );
        self.free[victim] = free;
        if self.alloc_sector == victim {
            self.alloc_map = map;
        }
        self.score[victim] = 0;
        self.roll_delta(victim);
        self.last_victim = victim;
        self.reclaims += 1;
        Ok(())
    }

    /// Ages every sector but the one just reclaimed, halving the table
    /// when a counter would saturate.
    pub(super) fn roll_delta(&mut self, victim: Sector) {
        if self
            .delta
            .iter()
            .enumerate()
            .any(|(s, d)| s != victim && *d == u8::MAX)
        {
            for d in self.delta.iter_mut() {
                *d /= 2;
            }
        }
        for (s, d) in self.delta.iter_mut().enumerate() {
            if s != victim {
                *d += 1;
            }
        }
        self.delta[victim] = 0;
    }

    /// Runs a reclaim from `job.state` to completion. Returns the free-slot
    /// map of the victim's new unit when this call did the copy.
    pub(super) fn drive(&mut self, mut job: ReclaimJob) -> Result<Option<u128>> {
        let mut map = None;
        loop {
            job.state = match job.state {
                ReclaimState::Normal => {
                    job.reclaim_erase_count = self.mark_victim(job.victim)?;
                    ReclaimState::VictimMarked
                }
                ReclaimState::VictimMarked | ReclaimState::ErasePending => {
                    map = Some(self.copy_to_spare(job.victim, job.reclaim_erase_count)?);
                    ReclaimState::ReclaimMarked
                }
                ReclaimState::ReclaimMarked => {
                    self.finish_swap(job.victim)?;
                    return Ok(map);
                }
            };
        }
    }

    /// Copy-commit point: once the victim is tagged, recovery always
    /// finishes the copy.
    fn mark_victim(&mut self, victim: Sector) -> Result<u32> {
        let spare = self.geometry.spare();
        let reclaim_erase_count = self.erase_counts[spare] + 1;
        let header = UnitHeader {
            kind: Kind::Victim,
            sector: victim as u32,
            erase_count: self.erase_counts[victim],
            reclaim_erase_count,
        };
        self.program_header(self.units[victim], header)?;
        Ok(reclaim_erase_count)
    }

    /// Erases the spare, copies every live slot to the same index, then
    /// tags it `Reclaim` (the swap-commit point) and swaps the sector table.
    fn copy_to_spare(&mut self, victim: Sector, reclaim_erase_count: u32) -> Result<u128> {
        let spare = self.geometry.spare();
        let src = self.units[victim];
        let dst = self.units[spare];
        self.flash.erase_unit(Geometry::unit_addr(dst))?;

        let words = self.read_header_words(src)?;
        let mut map = 0u128;
        let mut block = vec![0u8; BLOCK_SIZE];
        for (slot, word) in words.iter().enumerate().skip(1) {
            match Info::decode(*word) {
                Decoded::Entry(info) if !info.kind.is_dead() => {
                    let offset = (slot * BLOCK_SIZE) as BaseType;
                    self.flash.read(Geometry::unit_addr(src) + offset, &mut block)?;
                    self.flash.program(Geometry::unit_addr(dst) + offset, &block)?;
                    let info_addr = Geometry::unit_addr(dst) + (slot * INFO_WORD_SIZE) as BaseType;
                    self.flash.program(info_addr, &without_sideband(*word).to_le_bytes())?;
                }
                _ => map |= 1u128 << slot,
            }
        }

        let header = UnitHeader::new(Kind::Reclaim, victim as u32, reclaim_erase_count);
        self.program_header(dst, header)?;

        self.units.swap(victim, spare);
        self.erase_counts[spare] = self.erase_counts[victim];
        self.erase_counts[victim] = reclaim_erase_count;
        self.max_erase_count = self.max_erase_count.max(reclaim_erase_count);
        Ok(map)
    }

    /// Erases the old victim into the new spare and settles the reclaimed
    /// unit's tag.
    fn finish_swap(&mut self, victim: Sector) -> Result<()> {
        let spare = self.geometry.spare();
        let old = self.units[spare];
        let erase_count = self.erase_counts[spare] + 1;
        self.flash.erase_unit(Geometry::unit_addr(old))?;
        self.program_header(old, UnitHeader::new(Kind::Erase, spare as u32, erase_count))?;
        self.erase_counts[spare] = erase_count;
        self.max_erase_count = self.max_erase_count.max(erase_count);
        self.settle_reclaim(victim)
    }

    pub(super) fn settle_reclaim(&mut self, sector: Sector) -> Result<()> {
        self.retag(ptr_of(sector, 0), Kind::Erase)
    }
}
