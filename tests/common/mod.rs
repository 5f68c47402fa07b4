//! Hand-built FAT volumes for end-to-end tests.
//!
//! Volumes live in a sparse in-memory sector map: untouched sectors read as
//! zeros, so only the boot sector, the FAT entries and the directory sectors
//! a test cares about are ever materialised.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};

use fat_chkdsk::SectorDevice;

pub const SECTOR_SIZE: usize = 512;

pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_LONG_NAME: u8 = 0x0F;
pub const DELETED: u8 = 0xE5;

#[derive(Default, Clone)]
pub struct MemDisk {
    pub sectors: HashMap<u64, Vec<u8>>,
    pub reads: usize,
    pub writes: usize,
    /// Reads of this sector fail.
    pub fail_sector: Option<u64>,
}

impl MemDisk {
    pub fn sector_mut(&mut self, sector: u64) -> &mut Vec<u8> {
        self.sectors
            .entry(sector)
            .or_insert_with(|| vec![0u8; SECTOR_SIZE])
    }

    pub fn sector(&self, sector: u64) -> Vec<u8> {
        self.sectors
            .get(&sector)
            .cloned()
            .unwrap_or_else(|| vec![0u8; SECTOR_SIZE])
    }

    /// Non-zero sectors, for comparing disk states.
    pub fn snapshot(&self) -> BTreeMap<u64, Vec<u8>> {
        self.sectors
            .iter()
            .filter(|(_, data)| data.iter().any(|&b| b != 0))
            .map(|(&s, data)| (s, data.clone()))
            .collect()
    }

    /// Flat image of the first `sectors` sectors.
    pub fn to_image(&self, sectors: u64) -> Vec<u8> {
        let mut image = vec![0u8; sectors as usize * SECTOR_SIZE];
        for (&s, data) in &self.sectors {
            if s < sectors {
                let off = s as usize * SECTOR_SIZE;
                image[off..off + SECTOR_SIZE].copy_from_slice(data);
            }
        }
        image
    }
}

impl SectorDevice for MemDisk {
    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> std::io::Result<()> {
        self.reads += 1;
        if self.fail_sector == Some(sector) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected read failure at sector {sector}"),
            ));
        }
        match self.sectors.get(&sector) {
            Some(data) => buf.copy_from_slice(&data[..buf.len()]),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> std::io::Result<()> {
        self.writes += 1;
        self.sectors.insert(sector, buf.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn make_boot_sector(
    reserved: u16,
    fats: u8,
    root_entries: u16,
    total_sectors: u32,
    fat_size: u32,
    fat32: bool,
) -> Vec<u8> {
    let mut bpb = vec![0u8; SECTOR_SIZE];
    bpb[0] = 0xEB;
    bpb[1] = 0x3C;
    bpb[2] = 0x90;
    bpb[3..11].copy_from_slice(b"MSWIN4.1");
    bpb[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    bpb[13] = 1;
    bpb[14..16].copy_from_slice(&reserved.to_le_bytes());
    bpb[16] = fats;
    bpb[17..19].copy_from_slice(&root_entries.to_le_bytes());
    bpb[21] = 0xF8;
    bpb[32..36].copy_from_slice(&total_sectors.to_le_bytes());
    if fat32 {
        bpb[36..40].copy_from_slice(&fat_size.to_le_bytes());
        bpb[44..48].copy_from_slice(&2u32.to_le_bytes());
    } else {
        bpb[22..24].copy_from_slice(&(fat_size as u16).to_le_bytes());
    }
    bpb[510] = 0x55;
    bpb[511] = 0xAA;
    bpb
}

pub fn make_record(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
    let mut raw = [0u8; 32];
    raw[0..11].copy_from_slice(name);
    raw[11] = attr;
    raw[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    raw[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    raw[28..32].copy_from_slice(&size.to_le_bytes());
    raw
}

/// Long-name fragment with sequence byte `seq`.
pub fn make_lfn(seq: u8) -> [u8; 32] {
    let mut raw = [0u8; 32];
    raw[0] = seq;
    raw[1..11].copy_from_slice(b"n\0a\0m\0e\0x\0");
    raw[11] = ATTR_LONG_NAME;
    raw
}

/// A volume with one sector per cluster and 512-byte sectors.
pub struct Volume {
    pub disk: MemDisk,
    pub fat32: bool,
    pub fat_start: u64,
    pub fat_sectors: u64,
    pub root_dir_start: u64,
    pub data_start: u64,
    pub total_sectors: u64,
}

impl Volume {
    /// FAT16: 5000 clusters, FATs at 1 and 21, root at 41..73, data at 73.
    pub fn fat16() -> Self {
        let total = 1 + 2 * 20 + 32 + 5000;
        let mut vol = Volume {
            disk: MemDisk::default(),
            fat32: false,
            fat_start: 1,
            fat_sectors: 20,
            root_dir_start: 41,
            data_start: 73,
            total_sectors: total,
        };
        vol.disk
            .sectors
            .insert(0, make_boot_sector(1, 2, 512, total as u32, 20, false));
        vol.set_fat(0, 0xFFF8);
        vol.set_fat(1, 0xFFFF);
        vol
    }

    /// FAT32: 66000 clusters, FATs at 32 and 548, data at 1064, root at cluster 2.
    pub fn fat32() -> Self {
        let total = 32 + 2 * 516 + 66000;
        let mut vol = Volume {
            disk: MemDisk::default(),
            fat32: true,
            fat_start: 32,
            fat_sectors: 516,
            root_dir_start: 1064,
            data_start: 1064,
            total_sectors: total,
        };
        vol.disk
            .sectors
            .insert(0, make_boot_sector(32, 2, 0, total as u32, 516, true));
        vol.set_fat(0, 0x0FFF_FFF8);
        vol.set_fat(1, 0x0FFF_FFFF);
        vol.set_fat(2, vol.eoc());
        vol
    }

    pub fn eoc(&self) -> u32 {
        if self.fat32 {
            0x0FFF_FFFF
        } else {
            0xFFFF
        }
    }

    pub fn bad(&self) -> u32 {
        if self.fat32 {
            0x0FFF_FFF7
        } else {
            0xFFF7
        }
    }

    fn entry_location(&self, fat_base: u64, cluster: u32) -> (u64, usize, usize) {
        let width = if self.fat32 { 4 } else { 2 };
        let byte = cluster as u64 * width as u64;
        (
            fat_base + byte / SECTOR_SIZE as u64,
            (byte % SECTOR_SIZE as u64) as usize,
            width,
        )
    }

    fn read_entry(&self, fat_base: u64, cluster: u32) -> u32 {
        let (sector, off, width) = self.entry_location(fat_base, cluster);
        let data = self.disk.sector(sector);
        if width == 4 {
            u32::from_le_bytes(data[off..off + 4].try_into().unwrap()) & 0x0FFF_FFFF
        } else {
            u16::from_le_bytes(data[off..off + 2].try_into().unwrap()) as u32
        }
    }

    /// Set a FAT entry in both FAT copies.
    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        for base in [self.fat_start, self.fat_start + self.fat_sectors] {
            let (sector, off, width) = self.entry_location(base, cluster);
            let data = self.disk.sector_mut(sector);
            if width == 4 {
                data[off..off + 4].copy_from_slice(&value.to_le_bytes());
            } else {
                data[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
        }
    }

    /// Primary FAT entry.
    pub fn fat(&self, cluster: u32) -> u32 {
        self.read_entry(self.fat_start, cluster)
    }

    pub fn secondary_fat(&self, cluster: u32) -> u32 {
        self.read_entry(self.fat_start + self.fat_sectors, cluster)
    }

    /// Link `clusters` into one chain terminated by end-of-chain.
    pub fn chain(&mut self, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(&last) = clusters.last() {
            let eoc = self.eoc();
            self.set_fat(last, eoc);
        }
    }

    pub fn cluster_sector(&self, cluster: u32) -> u64 {
        self.data_start + cluster as u64 - 2
    }

    /// First sector of the root directory.
    pub fn root_sector(&self) -> u64 {
        if self.fat32 {
            self.cluster_sector(2)
        } else {
            self.root_dir_start
        }
    }

    pub fn put_record(&mut self, sector: u64, index: usize, raw: [u8; 32]) {
        self.disk.sector_mut(sector)[index * 32..index * 32 + 32].copy_from_slice(&raw);
    }

    pub fn record(&self, sector: u64, index: usize) -> Vec<u8> {
        self.disk.sector(sector)[index * 32..index * 32 + 32].to_vec()
    }

    pub fn is_deleted(&self, sector: u64, index: usize) -> bool {
        self.record(sector, index)[0] == DELETED
    }

    /// Add a single-cluster subdirectory at `cluster`, recorded in `parent_sector`.
    pub fn add_dir(
        &mut self,
        parent_sector: u64,
        index: usize,
        name: &[u8; 11],
        cluster: u32,
        parent_cluster: u32,
    ) {
        self.put_record(parent_sector, index, make_record(name, ATTR_DIRECTORY, cluster, 0));
        let sector = self.cluster_sector(cluster);
        self.put_record(sector, 0, make_record(b".          ", ATTR_DIRECTORY, cluster, 0));
        self.put_record(
            sector,
            1,
            make_record(b"..         ", ATTR_DIRECTORY, parent_cluster, 0),
        );
        let eoc = self.eoc();
        self.set_fat(cluster, eoc);
    }

    /// Add a file whose chain is `clusters`.
    pub fn add_file(
        &mut self,
        dir_sector: u64,
        index: usize,
        name: &[u8; 11],
        clusters: &[u32],
        size: u32,
    ) {
        let start = clusters.first().copied().unwrap_or(0);
        self.put_record(dir_sector, index, make_record(name, ATTR_ARCHIVE, start, size));
        self.chain(clusters);
    }
}
