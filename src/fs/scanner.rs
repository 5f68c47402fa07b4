//! Pass 1 of a check: depth-first walk of the directory tree.
//!
//! Every cluster chain reachable from a directory record is claimed in the
//! usage bitmap. Records whose chain is broken, cross-linked with an earlier
//! chain or inconsistent with the recorded size are deleted in place.
//! Directory sectors go through one shared buffer; each recursion level only
//! keeps an immutable cursor (sector, record index, the sectors scanned just
//! before it) so nothing has to be saved and restored around a descent.

use log::{debug, warn};

use super::bitmap::ClusterUsageBitmap;
use super::dir_entry::{DirRecord, FastHandle, RecordKind, DELETED_MARKER};
use super::fat_table::{ChainLink, FatTable};
use super::geometry::{FatType, VolumeGeometry, DIR_ENTRY_SIZE};
use crate::device::SectorDevice;
use crate::error::{ChkdskError, Result};

/// Upper bound on long-name records removed in front of a deleted record.
pub const MAX_ENTRIES_LONG_FILE_NAME: usize = 20;

/// Previously scanned sectors remembered per level for long-name cleanup.
const TRAIL_LEN: usize = 2;

/// What pass 1 found and changed.
#[derive(Debug, Default, Clone)]
pub struct ScanFindings {
    pub corrupted_files: u32,
    pub directories_deleted: bool,
    pub deleted_handles: Vec<FastHandle>,
    /// Deleted records that did not fit in `deleted_handles`.
    pub handles_dropped: u32,
    pub trailing_records_cleared: u32,
    /// A directory deeper than the nesting limit was left unscanned.
    pub depth_limit_hit: bool,
}

/// Position of one record, plus the sectors of the same directory scanned
/// immediately before it (most recent first).
#[derive(Debug, Clone, Copy)]
struct RecordCursor {
    sector: u64,
    index: usize,
    trail: [Option<u64>; TRAIL_LEN],
}

struct SectorBuffer {
    sector: Option<u64>,
    dirty: bool,
    data: Vec<u8>,
}

impl SectorBuffer {
    fn record(&self, index: usize) -> &[u8] {
        &self.data[index * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE]
    }

    fn record_mut(&mut self, index: usize) -> &mut [u8] {
        self.dirty = true;
        &mut self.data[index * DIR_ENTRY_SIZE..][..DIR_ENTRY_SIZE]
    }
}

pub struct DirectoryScanner<'a, D: SectorDevice> {
    dev: &'a mut D,
    geometry: &'a VolumeGeometry,
    fat: &'a mut FatTable,
    bitmap: &'a mut ClusterUsageBitmap,
    buffer: SectorBuffer,
    max_nesting_level: u32,
    max_fast_handles: usize,
    findings: ScanFindings,
}

impl<'a, D: SectorDevice> DirectoryScanner<'a, D> {
    pub fn new(
        dev: &'a mut D,
        geometry: &'a VolumeGeometry,
        fat: &'a mut FatTable,
        bitmap: &'a mut ClusterUsageBitmap,
        max_nesting_level: u32,
        max_fast_handles: usize,
    ) -> Self {
        Self {
            dev,
            geometry,
            fat,
            bitmap,
            buffer: SectorBuffer {
                sector: None,
                dirty: false,
                data: vec![0u8; geometry.bytes_per_sector as usize],
            },
            max_nesting_level,
            max_fast_handles,
            findings: ScanFindings::default(),
        }
    }

    /// Write back the directory buffer and hand over the findings.
    pub fn finish(mut self) -> Result<ScanFindings> {
        self.flush_buffer()?;
        Ok(self.findings)
    }

    fn load(&mut self, sector: u64) -> Result<()> {
        if self.buffer.sector == Some(sector) {
            return Ok(());
        }
        self.flush_buffer()?;
        self.buffer.sector = None;
        self.dev
            .read_sector(sector, &mut self.buffer.data)
            .map_err(|e| ChkdskError::sector(sector, e))?;
        self.buffer.sector = Some(sector);
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if let (Some(sector), true) = (self.buffer.sector, self.buffer.dirty) {
            self.dev
                .write_sector(sector, &self.buffer.data)
                .map_err(|e| ChkdskError::sector(sector, e))?;
        }
        self.buffer.dirty = false;
        Ok(())
    }

    /// Claim every cluster of the root directory chain before anything else
    /// is claimed. Returns the number of clusters in the chain.
    ///
    /// A root chain that loops back on itself or ends in an invalid link
    /// cannot be scanned, so it is reported as
    /// [`ChkdskError::CorruptDirectoryChain`] while nothing on disk has been
    /// modified yet.
    pub fn reserve_cluster(&mut self, start: u32) -> Result<u32> {
        if !self.geometry.is_data_cluster(start) {
            return Err(ChkdskError::InvalidGeometry(format!(
                "root cluster {start} outside data area"
            )));
        }
        if self.bitmap.mark(self.dev, start)? {
            return Err(ChkdskError::CorruptDirectoryChain {
                cluster: start,
                next: start,
            });
        }

        // Every step claims a fresh cluster, so the walk ends within the
        // volume's cluster count.
        let mut count = 1;
        let mut cluster = start;
        loop {
            match self.fat.link(self.dev, cluster)? {
                ChainLink::End => return Ok(count),
                ChainLink::Invalid(next) => {
                    warn!("root chain broken at cluster {cluster} (0x{next:08X})");
                    return Err(ChkdskError::CorruptDirectoryChain { cluster, next });
                }
                ChainLink::Next(next) => {
                    if self.bitmap.mark(self.dev, next)? {
                        warn!("root chain loops from cluster {cluster} back to {next}");
                        return Err(ChkdskError::CorruptDirectoryChain { cluster, next });
                    }
                    count += 1;
                    cluster = next;
                }
            }
        }
    }

    /// Claim the chain starting at `start`, failing on any cross-link.
    ///
    /// `Ok(Some(n))` is the chain length (0 for `start == 0`). `Ok(None)`
    /// means the chain is unusable; any clusters it had already claimed are
    /// released again.
    pub fn check_cross_link_file(&mut self, start: u32) -> Result<Option<u32>> {
        if start == 0 {
            return Ok(Some(0));
        }
        if !self.geometry.is_data_cluster(start) {
            debug!("start cluster {start} outside data area");
            return Ok(None);
        }

        let mut count = 0u32;
        let mut cluster = start;
        loop {
            if count >= self.geometry.total_clusters {
                debug!("chain from cluster {start} longer than the volume");
                self.release_chain(start, count)?;
                return Ok(None);
            }
            if self.bitmap.mark(self.dev, cluster)? {
                debug!("chain from cluster {start} cross-links at cluster {cluster}");
                self.release_chain(start, count)?;
                return Ok(None);
            }
            count += 1;

            match self.fat.link(self.dev, cluster)? {
                ChainLink::Next(next) => cluster = next,
                ChainLink::End => return Ok(Some(count)),
                ChainLink::Invalid(value) => {
                    debug!("chain from cluster {start} broken at {cluster} (0x{value:08X})");
                    self.release_chain(start, count)?;
                    return Ok(None);
                }
            }
        }
    }

    /// Release the usage bits of the first `count` clusters of a chain.
    fn release_chain(&mut self, start: u32, count: u32) -> Result<()> {
        let mut cluster = start;
        for i in 0..count {
            self.bitmap.release(self.dev, cluster)?;
            if i + 1 == count {
                break;
            }
            match self.fat.link(self.dev, cluster)? {
                ChainLink::Next(next) => cluster = next,
                _ => break,
            }
        }
        Ok(())
    }

    /// Check that `record` describes a usable subdirectory and claim its chain.
    pub fn scan_directory(&mut self, record: &DirRecord) -> Result<bool> {
        let start = record.start_cluster;
        if !self.geometry.is_data_cluster(start) {
            return Ok(false);
        }

        self.load(self.geometry.cluster_to_sector(start))?;
        let dot = DirRecord::parse(self.buffer.record(0));
        let dot_dot = DirRecord::parse(self.buffer.record(1));

        let header_ok = dot.is_dot()
            && dot.is_directory()
            && dot.size == 0
            && dot.start_cluster != 0
            && dot_dot.is_dot_dot()
            && dot_dot.is_directory()
            && dot_dot.size == 0;
        if !header_ok {
            debug!("directory {} has no valid . and .. entries", record.display_name());
            return Ok(false);
        }

        Ok(self.check_cross_link_file(start)?.is_some())
    }

    /// Scan the root directory and everything below it.
    pub fn scan_root(&mut self) -> Result<()> {
        let start = match self.geometry.fat_type {
            FatType::Fat32 => self.geometry.root_cluster,
            _ => 0,
        };
        self.scan_files_and_subdirs(start, 1)
    }

    /// Scan one directory. `start_cluster` 0 is the fixed FAT16 root; the
    /// root is `level` 1.
    pub fn scan_files_and_subdirs(&mut self, start_cluster: u32, level: u32) -> Result<()> {
        if level > self.max_nesting_level {
            if !self.findings.depth_limit_hit {
                warn!(
                    "directory at cluster {start_cluster} is below level {}, not scanned",
                    self.max_nesting_level
                );
            }
            self.findings.depth_limit_hit = true;
            return Ok(());
        }

        let fixed_root = start_cluster == 0;
        let (mut sector, mut run) = if fixed_root {
            (self.geometry.root_dir_start, self.geometry.root_dir_sectors)
        } else {
            (
                self.geometry.cluster_to_sector(start_cluster),
                self.geometry.sectors_per_cluster as u64,
            )
        };
        let mut cluster = start_cluster;
        let mut clusters_walked = 0u32;
        let mut trail = [None; TRAIL_LEN];
        let mut end_seen = false;

        loop {
            for s in sector..sector + run {
                self.load(s)?;
                for index in 0..self.geometry.records_per_sector() {
                    let cursor = RecordCursor { sector: s, index, trail };
                    if end_seen {
                        self.clear_trailing_record(cursor)?;
                    } else {
                        end_seen = self.scan_record(cursor, level)?;
                    }
                }
                trail.rotate_right(1);
                trail[0] = Some(s);
            }

            if fixed_root {
                return Ok(());
            }
            clusters_walked += 1;
            match self.fat.link(self.dev, cluster)? {
                ChainLink::End => return Ok(()),
                ChainLink::Next(next) if clusters_walked < self.geometry.total_clusters => {
                    cluster = next;
                    sector = self.geometry.cluster_to_sector(next);
                    run = self.geometry.sectors_per_cluster as u64;
                }
                ChainLink::Next(next) | ChainLink::Invalid(next) => {
                    return Err(ChkdskError::CorruptDirectoryChain { cluster, next });
                }
            }
        }
    }

    /// Handle one record. Returns true if it is the end-of-directory marker.
    fn scan_record(&mut self, cursor: RecordCursor, level: u32) -> Result<bool> {
        self.load(cursor.sector)?;
        let record = DirRecord::parse(self.buffer.record(cursor.index));

        match record.kind() {
            RecordKind::EndOfDirectory => return Ok(true),
            RecordKind::Deleted | RecordKind::DotEntry | RecordKind::LongName => {}
            RecordKind::Directory => {
                self.flush_buffer()?;
                if self.scan_directory(&record)? {
                    self.scan_files_and_subdirs(record.start_cluster, level + 1)?;
                } else {
                    debug!("deleting directory {}", record.display_name());
                    self.delete_file_record(cursor)?;
                    self.findings.directories_deleted = true;
                }
            }
            RecordKind::VolumeId => {
                if level != 1 || record.start_cluster != 0 {
                    debug!("deleting misplaced volume label {}", record.display_name());
                    self.delete_file_record(cursor)?;
                }
            }
            RecordKind::File => {
                if !self.check_file(&record)? {
                    debug!("deleting file {}", record.display_name());
                    self.delete_file_record(cursor)?;
                }
            }
        }
        Ok(false)
    }

    /// Validate a file record's chain against its size.
    fn check_file(&mut self, record: &DirRecord) -> Result<bool> {
        match (record.start_cluster, record.size) {
            (0, 0) => return Ok(true),
            (0, _) | (_, 0) => return Ok(false),
            _ => {}
        }

        let Some(count) = self.check_cross_link_file(record.start_cluster)? else {
            return Ok(false);
        };

        let size_clusters = record.size as u64 / self.geometry.cluster_size();
        let count = count as u64;
        if size_clusters > count || size_clusters + 1 < count {
            debug!(
                "{}: {} clusters in chain, size {} implies {}",
                record.display_name(),
                count,
                record.size,
                size_clusters
            );
            self.release_chain(record.start_cluster, count as u32)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Zero a non-empty record found after the end-of-directory marker.
    fn clear_trailing_record(&mut self, cursor: RecordCursor) -> Result<()> {
        self.load(cursor.sector)?;
        if self.buffer.record(cursor.index).iter().any(|&b| b != 0) {
            debug!(
                "clearing stray record {} of sector {} past end of directory",
                cursor.index, cursor.sector
            );
            self.buffer.record_mut(cursor.index).fill(0);
            self.findings.trailing_records_cleared += 1;
        }
        Ok(())
    }

    /// Mark a record deleted along with the long-name records in front of it.
    ///
    /// The long-name chain is located first. If it is longer than
    /// [`MAX_ENTRIES_LONG_FILE_NAME`] nothing is deleted and the check fails
    /// with [`ChkdskError::MalformedLongName`].
    fn delete_file_record(&mut self, cursor: RecordCursor) -> Result<()> {
        let long_names = self.preceding_long_names(cursor)?;

        self.findings.corrupted_files += 1;
        self.load(cursor.sector)?;
        self.buffer.record_mut(cursor.index)[0] = DELETED_MARKER;

        if self.findings.deleted_handles.len() < self.max_fast_handles {
            self.findings.deleted_handles.push(FastHandle::new(
                self.dev.drive_number(),
                cursor.sector,
                cursor.index,
            ));
        } else {
            self.findings.handles_dropped += 1;
        }

        for (sector, index) in long_names {
            self.load(sector)?;
            self.buffer.record_mut(index)[0] = DELETED_MARKER;
        }
        Ok(())
    }

    /// Positions of the live long-name records directly in front of
    /// `cursor`, nearest first.
    fn preceding_long_names(&mut self, cursor: RecordCursor) -> Result<Vec<(u64, usize)>> {
        let records_per_sector = self.geometry.records_per_sector();
        let mut found = Vec::new();
        let mut sector = cursor.sector;
        let mut index = cursor.index;
        let mut previous = cursor.trail.iter().flatten();
        loop {
            if index == 0 {
                let Some(&prev) = previous.next() else {
                    return Ok(found);
                };
                sector = prev;
                index = records_per_sector;
            }
            index -= 1;

            self.load(sector)?;
            let record = DirRecord::parse(self.buffer.record(index));
            if !record.is_long_name() || record.first_byte == DELETED_MARKER {
                return Ok(found);
            }
            if found.len() == MAX_ENTRIES_LONG_FILE_NAME {
                warn!(
                    "long-name chain before record {} of sector {} exceeds {} entries",
                    cursor.index, cursor.sector, MAX_ENTRIES_LONG_FILE_NAME
                );
                return Err(ChkdskError::MalformedLongName {
                    sector: cursor.sector,
                    index: cursor.index,
                    limit: MAX_ENTRIES_LONG_FILE_NAME,
                });
            }
            found.push((sector, index));
        }
    }
}
