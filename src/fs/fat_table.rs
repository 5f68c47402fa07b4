use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use super::geometry::{FatType, VolumeGeometry};
use crate::device::SectorDevice;
use crate::error::{ChkdskError, Result};

/// Consecutive primary-FAT sectors held in memory at once.
pub const NUM_CACHED_SECTORS: u64 = 3;

/// Where a FAT entry leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainLink {
    /// Another data cluster.
    Next(u32),
    /// End-of-chain marker.
    End,
    /// Free, reserved, bad or out of range: the chain is broken here.
    Invalid(u32),
}

/// Windowed access to the primary FAT.
///
/// A group of [`NUM_CACHED_SECTORS`] sectors is resident at a time. Loading
/// another group writes the current one back first if it was modified. Only
/// sectors inside the primary FAT are ever read or written: on FAT32 the
/// secondary FAT right behind it is holding the usage bitmap.
pub struct FatTable {
    fat_type: FatType,
    fat_start: u64,
    fat_sectors: u64,
    sector_size: usize,
    max_cluster: u32,
    buffer: Vec<u8>,
    /// First sector of the resident group.
    cached: Option<u64>,
    dirty: bool,
}

impl FatTable {
    pub fn new(geometry: &VolumeGeometry) -> Self {
        let sector_size = geometry.bytes_per_sector as usize;
        Self {
            fat_type: geometry.fat_type,
            fat_start: geometry.fat_start,
            fat_sectors: geometry.fat_sectors,
            sector_size,
            max_cluster: geometry.max_cluster(),
            buffer: vec![0u8; sector_size * NUM_CACHED_SECTORS as usize],
            cached: None,
            dirty: false,
        }
    }

    fn fat_end(&self) -> u64 {
        self.fat_start + self.fat_sectors
    }

    /// Make the group starting at `sector` resident.
    pub fn load<D: SectorDevice>(&mut self, dev: &mut D, sector: u64) -> Result<()> {
        if sector < self.fat_start || sector >= self.fat_end() {
            return Err(ChkdskError::FatRange { sector });
        }
        if self.cached == Some(sector) {
            return Ok(());
        }
        self.flush(dev)?;

        self.cached = None;
        let end = self.fat_end();
        for i in 0..NUM_CACHED_SECTORS {
            let s = sector + i;
            let chunk = &mut self.buffer[i as usize * self.sector_size..][..self.sector_size];
            if s < end {
                dev.read_sector(s, chunk)
                    .map_err(|e| ChkdskError::sector(s, e))?;
            } else {
                chunk.fill(0);
            }
        }
        self.cached = Some(sector);
        Ok(())
    }

    /// Write the resident group back if it was modified.
    ///
    /// Sectors of a group that extend past the primary FAT are dropped rather
    /// than written.
    pub fn flush<D: SectorDevice>(&mut self, dev: &mut D) -> Result<()> {
        let Some(start) = self.cached else {
            self.dirty = false;
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        for i in 0..NUM_CACHED_SECTORS {
            let s = start + i;
            if s >= self.fat_end() {
                debug!(
                    "FAT cache: group at {start} clipped at primary FAT end {}",
                    self.fat_end()
                );
                break;
            }
            let chunk = &self.buffer[i as usize * self.sector_size..][..self.sector_size];
            dev.write_sector(s, chunk)
                .map_err(|e| ChkdskError::sector(s, e))?;
        }
        self.dirty = false;
        Ok(())
    }

    fn entry_bytes(&self) -> u64 {
        match self.fat_type {
            FatType::Fat16 => 2,
            _ => 4,
        }
    }

    /// Group start sector and byte offset inside the group for `cluster`.
    fn locate(&self, cluster: u32) -> (u64, usize) {
        let byte = cluster as u64 * self.entry_bytes();
        let group_bytes = self.sector_size as u64 * NUM_CACHED_SECTORS;
        let group = byte / group_bytes;
        (
            self.fat_start + group * NUM_CACHED_SECTORS,
            (byte % group_bytes) as usize,
        )
    }

    /// Raw FAT entry for `cluster` (FAT32 entries without the reserved top nibble).
    pub fn next_cluster<D: SectorDevice>(&mut self, dev: &mut D, cluster: u32) -> Result<u32> {
        let (group, offset) = self.locate(cluster);
        self.load(dev, group)?;
        Ok(match self.fat_type {
            FatType::Fat16 => LittleEndian::read_u16(&self.buffer[offset..]) as u32,
            _ => LittleEndian::read_u32(&self.buffer[offset..]) & 0x0FFF_FFFF,
        })
    }

    /// Mark `cluster` free in the FAT. Returns `false` if it already was.
    pub fn free_entry<D: SectorDevice>(&mut self, dev: &mut D, cluster: u32) -> Result<bool> {
        if self.next_cluster(dev, cluster)? == 0 {
            return Ok(false);
        }

        let (_, offset) = self.locate(cluster);
        match self.fat_type {
            FatType::Fat16 => LittleEndian::write_u16(&mut self.buffer[offset..], 0),
            _ => {
                // Upper 4 bits are reserved
                let existing = LittleEndian::read_u32(&self.buffer[offset..]);
                LittleEndian::write_u32(&mut self.buffer[offset..], existing & 0xF000_0000);
            }
        }
        self.dirty = true;
        Ok(true)
    }

    /// True for the terminal marker written by formatters, and for the rest
    /// of the end-of-chain range that other implementations use.
    pub fn is_last_cluster(&self, value: u32) -> bool {
        value == self.fat_type.last_cluster_marker() || value >= self.fat_type.end_of_chain_min()
    }

    pub fn is_bad_cluster(&self, value: u32) -> bool {
        value == self.fat_type.bad_cluster_marker()
    }

    pub fn classify(&self, value: u32) -> ChainLink {
        if self.is_last_cluster(value) {
            ChainLink::End
        } else if value < 2 || value > self.max_cluster {
            ChainLink::Invalid(value)
        } else {
            ChainLink::Next(value)
        }
    }

    /// Read the entry for `cluster` and classify it.
    pub fn link<D: SectorDevice>(&mut self, dev: &mut D, cluster: u32) -> Result<ChainLink> {
        let value = self.next_cluster(dev, cluster)?;
        Ok(self.classify(value))
    }
}
