//! Sector cache backing the FAT32 cluster usage bitmap.
//!
//! A FAT32 volume can have tens of millions of clusters, so the usage bitmap
//! lives on disk inside the secondary FAT for the duration of a check. Only a
//! handful of its sectors are resident at any time. Each slot is stamped with
//! a logical clock that advances on every miss; the slot with the oldest
//! stamp is evicted (written back first if dirty). Writes are stamped a few
//! ticks into the future so recently modified bitmap regions stay resident
//! longer than regions that were only read.

use log::debug;

use super::bitmap::BitOp;
use crate::device::SectorDevice;
use crate::error::{ChkdskError, Result};

/// Number of bitmap sectors held in memory.
pub const MAX_CACHES: usize = 5;

/// Extra clock ticks granted to a slot on write.
const WRITE_RETENTION: u64 = 5;

struct CacheSlot {
    sector: u64,
    valid: bool,
    dirty: bool,
    stamp: u64,
    data: Vec<u8>,
}

/// Hit/miss counters, logged at the end of pass 1.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub write_backs: u64,
}

pub struct BitmapSectorCache {
    slots: Vec<CacheSlot>,
    clock: u64,
    stats: CacheStats,
}

impl BitmapSectorCache {
    pub fn new(slot_count: usize, sector_size: usize) -> Self {
        let slots = (0..slot_count.max(1))
            .map(|_| CacheSlot {
                sector: 0,
                valid: false,
                dirty: false,
                stamp: 0,
                data: vec![0u8; sector_size],
            })
            .collect();
        Self {
            slots,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Apply `op` to bit `bit` of bitmap sector `sector`.
    ///
    /// Returns the previous bit value for `Get`/`Set` and `false` for `Free`.
    pub fn update<D: SectorDevice>(
        &mut self,
        dev: &mut D,
        sector: u64,
        bit: usize,
        op: BitOp,
    ) -> Result<bool> {
        let idx = self.lookup(dev, sector)?;
        let slot = &mut self.slots[idx];

        let byte = bit / 8;
        let mask = 1u8 << (bit % 8);
        let previous = slot.data[byte] & mask != 0;

        match op {
            BitOp::Get => {
                slot.stamp = self.clock;
                Ok(previous)
            }
            BitOp::Set => {
                slot.data[byte] |= mask;
                slot.dirty = true;
                slot.stamp = self.clock + WRITE_RETENTION;
                Ok(previous)
            }
            BitOp::Free => {
                slot.data[byte] &= !mask;
                slot.dirty = true;
                slot.stamp = self.clock + WRITE_RETENTION;
                Ok(false)
            }
        }
    }

    /// Find the slot holding `sector`, loading it on a miss.
    fn lookup<D: SectorDevice>(&mut self, dev: &mut D, sector: u64) -> Result<usize> {
        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| s.valid && s.sector == sector)
        {
            self.stats.hits += 1;
            return Ok(idx);
        }

        self.stats.misses += 1;
        let idx = self.victim();
        self.write_back(dev, idx)?;

        let slot = &mut self.slots[idx];
        slot.valid = false;
        dev.read_sector(sector, &mut slot.data)
            .map_err(|e| ChkdskError::sector(sector, e))?;
        slot.sector = sector;
        slot.valid = true;
        slot.dirty = false;

        self.clock += 1;
        Ok(idx)
    }

    /// First free slot, otherwise the one with the oldest stamp.
    fn victim(&self) -> usize {
        if let Some(idx) = self.slots.iter().position(|s| !s.valid) {
            return idx;
        }
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.stamp)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    fn write_back<D: SectorDevice>(&mut self, dev: &mut D, idx: usize) -> Result<()> {
        let slot = &mut self.slots[idx];
        if slot.valid && slot.dirty {
            debug!("bitmap cache: writing back sector {}", slot.sector);
            dev.write_sector(slot.sector, &slot.data)
                .map_err(|e| ChkdskError::sector(slot.sector, e))?;
            slot.dirty = false;
            self.stats.write_backs += 1;
        }
        Ok(())
    }

    /// Drop all cached sectors and hand the slot buffers out as scratch space.
    ///
    /// Dirty contents are discarded: the caller is about to overwrite the
    /// region the bitmap lived in.
    pub fn take_buffers(&mut self) -> Vec<&mut [u8]> {
        for slot in &mut self.slots {
            slot.valid = false;
            slot.dirty = false;
        }
        self.slots.iter_mut().map(|s| s.data.as_mut_slice()).collect()
    }
}
