use log::debug;

use super::bitmap_cache::{BitmapSectorCache, CacheStats};
use super::geometry::{FatType, VolumeGeometry, FLAT_BITMAP_BITS};
use crate::device::SectorDevice;
use crate::error::{ChkdskError, Result};

const BITS_PER_WORD: u32 = u32::BITS;

/// Operation applied to one cluster's usage bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    Get,
    Set,
    Free,
}

/// One bit per cluster: set once a file or directory chain claims it.
///
/// FAT16 volumes keep the whole table in memory. FAT32 volumes keep it on
/// disk in the secondary FAT, accessed through a small sector cache.
pub enum ClusterUsageBitmap {
    Flat {
        words: Vec<u32>,
    },
    Cached {
        cache: BitmapSectorCache,
        /// First sector of the bitmap (the secondary FAT).
        base_sector: u64,
        /// log2 of the bits held by one sector.
        shift: u32,
        sectors: u64,
    },
}

impl ClusterUsageBitmap {
    /// Build an empty bitmap for the volume with clusters 0 and 1 reserved.
    ///
    /// On FAT32 this zero-fills the part of the secondary FAT used as
    /// backing store.
    pub fn new<D: SectorDevice>(
        dev: &mut D,
        geometry: &VolumeGeometry,
        cache_slots: usize,
    ) -> Result<Self> {
        let mut bitmap = match geometry.fat_type {
            FatType::Fat32 => {
                let base_sector = geometry.secondary_fat_start();
                let sectors = geometry.bitmap_sectors();
                let zero = vec![0u8; geometry.bytes_per_sector as usize];
                for i in 0..sectors {
                    dev.write_sector(base_sector + i, &zero)
                        .map_err(|e| ChkdskError::sector(base_sector + i, e))?;
                }
                debug!(
                    "usage bitmap: {} sectors at {} in the secondary FAT",
                    sectors, base_sector
                );
                ClusterUsageBitmap::Cached {
                    cache: BitmapSectorCache::new(
                        cache_slots,
                        geometry.bytes_per_sector as usize,
                    ),
                    base_sector,
                    shift: geometry.bitmap_bits_per_sector_shift(),
                    sectors,
                }
            }
            _ => {
                let bits = geometry.cluster_entries();
                let len = ((bits + BITS_PER_WORD as u64 - 1) / BITS_PER_WORD as u64) as usize;
                if bits > FLAT_BITMAP_BITS || (len as u64) * (BITS_PER_WORD as u64) < bits {
                    return Err(ChkdskError::BitmapRange {
                        cluster: geometry.max_cluster(),
                        capacity: FLAT_BITMAP_BITS,
                    });
                }
                ClusterUsageBitmap::Flat {
                    words: vec![0u32; len],
                }
            }
        };

        bitmap.update(dev, 0, BitOp::Set)?;
        bitmap.update(dev, 1, BitOp::Set)?;
        Ok(bitmap)
    }

    /// Apply `op` to the usage bit of `cluster`.
    ///
    /// Returns the bit's previous value for `Get` and `Set`, `false` for
    /// `Free`.
    pub fn update<D: SectorDevice>(
        &mut self,
        dev: &mut D,
        cluster: u32,
        op: BitOp,
    ) -> Result<bool> {
        match self {
            ClusterUsageBitmap::Flat { words } => {
                let index = (cluster / BITS_PER_WORD) as usize;
                let mask = 1u32 << (cluster % BITS_PER_WORD);
                let capacity = words.len() as u64 * BITS_PER_WORD as u64;
                let word = words
                    .get_mut(index)
                    .ok_or(ChkdskError::BitmapRange { cluster, capacity })?;
                let previous = *word & mask != 0;
                match op {
                    BitOp::Get => Ok(previous),
                    BitOp::Set => {
                        *word |= mask;
                        Ok(previous)
                    }
                    BitOp::Free => {
                        *word &= !mask;
                        Ok(false)
                    }
                }
            }
            ClusterUsageBitmap::Cached {
                cache,
                base_sector,
                shift,
                sectors,
            } => {
                let index = (cluster >> *shift) as u64;
                if index >= *sectors {
                    return Err(ChkdskError::BitmapRange {
                        cluster,
                        capacity: *sectors << *shift,
                    });
                }
                let bit = (cluster & ((1u32 << *shift) - 1)) as usize;
                cache.update(dev, *base_sector + index, bit, op)
            }
        }
    }

    pub fn is_used<D: SectorDevice>(&mut self, dev: &mut D, cluster: u32) -> Result<bool> {
        self.update(dev, cluster, BitOp::Get)
    }

    /// Mark `cluster` used; returns whether it already was.
    pub fn mark<D: SectorDevice>(&mut self, dev: &mut D, cluster: u32) -> Result<bool> {
        self.update(dev, cluster, BitOp::Set)
    }

    pub fn release<D: SectorDevice>(&mut self, dev: &mut D, cluster: u32) -> Result<()> {
        self.update(dev, cluster, BitOp::Free).map(|_| ())
    }

    /// Sectors of the secondary FAT currently holding bitmap data.
    pub fn scratch_sectors(&self) -> u64 {
        match self {
            ClusterUsageBitmap::Flat { .. } => 0,
            ClusterUsageBitmap::Cached { sectors, .. } => *sectors,
        }
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        match self {
            ClusterUsageBitmap::Flat { .. } => None,
            ClusterUsageBitmap::Cached { cache, .. } => Some(cache.stats()),
        }
    }

    /// Retire the bitmap and reuse its cache slots as copy buffers.
    ///
    /// Returns `None` for the in-memory variant.
    pub fn take_scratch_buffers(&mut self) -> Option<Vec<&mut [u8]>> {
        match self {
            ClusterUsageBitmap::Flat { .. } => None,
            ClusterUsageBitmap::Cached { cache, .. } => Some(cache.take_buffers()),
        }
    }
}
