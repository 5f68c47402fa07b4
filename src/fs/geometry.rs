use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::error::{ChkdskError, Result};

/// Size of one on-disk directory record.
pub const DIR_ENTRY_SIZE: usize = 32;

/// Bits held by the in-memory FAT16 usage bitmap (one per cluster entry).
pub const FLAT_BITMAP_BITS: u64 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn name(&self) -> &'static str {
        match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }

    /// Classify a volume by its data cluster count.
    pub fn from_cluster_count(clusters: u64) -> Self {
        if clusters < 4085 {
            FatType::Fat12
        } else if clusters < 65525 {
            FatType::Fat16
        } else {
            FatType::Fat32
        }
    }

    /// Terminal marker a formatter writes at the end of a chain.
    pub fn last_cluster_marker(&self) -> u32 {
        match self {
            FatType::Fat12 => 0x0000_0FFF,
            FatType::Fat16 => 0x0000_FFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Start of the end-of-chain range.
    pub fn end_of_chain_min(&self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    pub fn bad_cluster_marker(&self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }
}

impl std::fmt::Display for FatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Layout of a mounted FAT volume, in sectors relative to the volume start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub fat_type: FatType,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub num_fats: u8,
    /// Number of data clusters (clusters 2 ..= total_clusters + 1).
    pub total_clusters: u32,
    /// First sector of the primary FAT.
    pub fat_start: u64,
    /// Sectors in one FAT copy.
    pub fat_sectors: u64,
    /// First sector of the fixed root directory (FAT16) or of the data area (FAT32).
    pub root_dir_start: u64,
    /// Root directory entry count (FAT16 only; 0 for FAT32).
    pub root_entry_count: u16,
    pub root_dir_sectors: u64,
    pub data_start: u64,
    /// Root directory start cluster (FAT32 only; 0 for FAT16).
    pub root_cluster: u32,
}

impl VolumeGeometry {
    /// Parse the BIOS parameter block of a FAT boot sector.
    ///
    /// Only structural problems that make the layout meaningless are reported
    /// here; whether the checker can run on the volume is decided by
    /// [`VolumeGeometry::validate`].
    pub fn parse(bpb: &[u8]) -> Result<Self> {
        if bpb.len() < 512 {
            return Err(ChkdskError::InvalidGeometry(format!(
                "boot sector too short: {} bytes",
                bpb.len()
            )));
        }

        // Validate jump instruction (EB xx 90 or E9 xx xx)
        if bpb[0] != 0xEB && bpb[0] != 0xE9 {
            return Err(ChkdskError::InvalidGeometry("bad jump instruction".into()));
        }

        let bytes_per_sector = LittleEndian::read_u16(&bpb[11..13]) as u32;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(ChkdskError::InvalidGeometry(format!(
                "invalid bytes per sector: {bytes_per_sector}"
            )));
        }

        let sectors_per_cluster = bpb[13] as u32;
        let reserved_sectors = LittleEndian::read_u16(&bpb[14..16]) as u64;
        let num_fats = bpb[16];
        let root_entry_count = LittleEndian::read_u16(&bpb[17..19]);

        let total_sectors_16 = LittleEndian::read_u16(&bpb[19..21]) as u64;
        let total_sectors_32 = LittleEndian::read_u32(&bpb[32..36]) as u64;
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16
        } else {
            total_sectors_32
        };

        let sectors_per_fat_16 = LittleEndian::read_u16(&bpb[22..24]) as u64;
        let sectors_per_fat_32 = LittleEndian::read_u32(&bpb[36..40]) as u64;
        let fat_sectors = if sectors_per_fat_16 != 0 {
            sectors_per_fat_16
        } else {
            sectors_per_fat_32
        };

        if sectors_per_cluster == 0 {
            return Err(ChkdskError::InvalidGeometry(
                "invalid sectors per cluster: 0".into(),
            ));
        }
        if num_fats == 0 || fat_sectors == 0 {
            return Err(ChkdskError::InvalidGeometry(format!(
                "no FAT region (fats = {num_fats}, sectors per FAT = {fat_sectors})"
            )));
        }

        let bps = bytes_per_sector as u64;
        let root_dir_sectors = (root_entry_count as u64 * DIR_ENTRY_SIZE as u64 + bps - 1) / bps;
        let root_dir_start = reserved_sectors + num_fats as u64 * fat_sectors;
        let data_start = root_dir_start + root_dir_sectors;
        if data_start >= total_sectors {
            return Err(ChkdskError::InvalidGeometry(format!(
                "data area starts at sector {data_start} beyond volume end {total_sectors}"
            )));
        }

        let clusters = (total_sectors - data_start) / sectors_per_cluster as u64;
        if clusters > 0x0FFF_FFF5 {
            return Err(ChkdskError::InvalidGeometry(format!(
                "too many clusters: {clusters}"
            )));
        }
        let fat_type = FatType::from_cluster_count(clusters);

        let root_cluster = if fat_type == FatType::Fat32 {
            LittleEndian::read_u32(&bpb[44..48])
        } else {
            0
        };

        Ok(Self {
            fat_type,
            bytes_per_sector,
            sectors_per_cluster,
            num_fats,
            total_clusters: clusters as u32,
            fat_start: reserved_sectors,
            fat_sectors,
            root_dir_start,
            root_entry_count,
            root_dir_sectors,
            data_start,
            root_cluster,
        })
    }

    /// Check that the volume is one this checker can repair.
    ///
    /// FAT12 is refused outright. The remaining checks make sure every
    /// cluster entry is addressable inside the primary FAT and that the
    /// usage bitmap fits either in memory (FAT16) or in the secondary FAT
    /// (FAT32).
    pub fn validate(&self) -> Result<()> {
        if self.fat_type == FatType::Fat12 {
            return Err(ChkdskError::UnsupportedFilesystem(self.fat_type));
        }

        let spc = self.sectors_per_cluster;
        if spc == 0 || spc > 128 || !spc.is_power_of_two() {
            return Err(ChkdskError::InvalidGeometry(format!(
                "invalid sectors per cluster: {spc}"
            )));
        }

        let entry_bytes: u64 = match self.fat_type {
            FatType::Fat16 => 2,
            _ => 4,
        };
        let needed = self.cluster_entries() * entry_bytes;
        if needed > self.fat_sectors * self.bytes_per_sector as u64 {
            return Err(ChkdskError::InvalidGeometry(format!(
                "FAT of {} sectors cannot hold {} entries",
                self.fat_sectors,
                self.cluster_entries()
            )));
        }

        match self.fat_type {
            FatType::Fat32 => {
                if self.num_fats < 2 {
                    return Err(ChkdskError::InvalidGeometry(
                        "FAT32 volume needs a second FAT for the usage bitmap".into(),
                    ));
                }
                if self.bitmap_sectors() > self.fat_sectors {
                    return Err(ChkdskError::InvalidGeometry(format!(
                        "usage bitmap needs {} sectors, secondary FAT has {}",
                        self.bitmap_sectors(),
                        self.fat_sectors
                    )));
                }
                if !self.is_data_cluster(self.root_cluster) {
                    return Err(ChkdskError::InvalidGeometry(format!(
                        "root cluster {} outside data area",
                        self.root_cluster
                    )));
                }
            }
            _ => {
                if self.cluster_entries() > FLAT_BITMAP_BITS {
                    return Err(ChkdskError::InvalidGeometry(format!(
                        "{} clusters do not fit the in-memory bitmap",
                        self.total_clusters
                    )));
                }
            }
        }

        Ok(())
    }

    /// First sector of the secondary FAT.
    pub fn secondary_fat_start(&self) -> u64 {
        self.fat_start + self.fat_sectors
    }

    /// Highest valid data cluster number.
    pub fn max_cluster(&self) -> u32 {
        self.total_clusters + 1
    }

    /// Number of FAT entries that describe clusters, including the two
    /// reserved entries.
    pub fn cluster_entries(&self) -> u64 {
        self.total_clusters as u64 + 2
    }

    pub fn is_data_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster <= self.max_cluster()
    }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    /// First sector of a data cluster.
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.data_start + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    pub fn records_per_sector(&self) -> usize {
        self.bytes_per_sector as usize / DIR_ENTRY_SIZE
    }

    /// log2 of the number of usage bits held by one sector.
    pub fn bitmap_bits_per_sector_shift(&self) -> u32 {
        (self.bytes_per_sector * 8).trailing_zeros()
    }

    /// Sectors needed to hold one usage bit per cluster entry.
    pub fn bitmap_sectors(&self) -> u64 {
        let bits_per_sector = 1u64 << self.bitmap_bits_per_sector_shift();
        (self.cluster_entries() + bits_per_sector - 1) / bits_per_sector
    }
}
