//! Two-pass consistency check and repair of a FAT16/FAT32 volume.
//!
//! Pass 1 walks the directory tree and claims every cluster chain reachable
//! from a valid record in the usage bitmap, deleting records whose chains
//! are broken, cross-linked or inconsistent with their size. Pass 2 runs
//! only when pass 1 deleted something: every FAT entry whose cluster was
//! never claimed is freed. Finally the primary FAT is copied over the parts
//! of the secondary FAT that need it and the device is flushed.

use log::{debug, info, warn};
use serde::Serialize;

use crate::device::SectorDevice;
use crate::error::{ChkdskError, Result};
use crate::fs::bitmap::ClusterUsageBitmap;
use crate::fs::bitmap_cache::MAX_CACHES;
use crate::fs::dir_entry::FastHandle;
use crate::fs::fat_table::FatTable;
use crate::fs::geometry::{FatType, VolumeGeometry};
use crate::fs::scanner::{DirectoryScanner, ScanFindings};

/// Size of the buffer used to read the boot sector.
const BOOT_SECTOR_SIZE: usize = 512;

/// Tunables for a check run.
#[derive(Debug, Clone)]
pub struct CheckOptions {
    /// Deepest directory level scanned; the root is level 1.
    pub max_nesting_level: u32,
    /// Deleted records whose location is reported back.
    pub max_fast_handles: usize,
    /// Resident sectors of the FAT32 usage bitmap.
    pub bitmap_cache_slots: usize,
    /// Free unclaimed FAT entries after records were deleted.
    pub sweep_orphans: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            max_nesting_level: 16,
            max_fast_handles: 10,
            bitmap_cache_slots: MAX_CACHES,
            sweep_orphans: true,
        }
    }
}

/// Summary of a completed check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub fat_type: FatType,
    /// Directory records deleted (files, directories, misplaced labels).
    pub corrupted_files: u32,
    pub directories_deleted: bool,
    /// Where the first deleted records were, see [`FastHandle::pack`].
    pub deleted_handles: Vec<FastHandle>,
    pub deleted_handles_dropped: u32,
    pub trailing_records_cleared: u32,
    /// Whether pass 2 ran.
    pub orphan_sweep: bool,
    pub orphan_clusters_freed: u32,
    pub fat_sectors_resynced: u64,
    /// Part of the tree was too deep to scan.
    pub depth_limit_hit: bool,
}

impl CheckReport {
    fn new(fat_type: FatType, findings: ScanFindings) -> Self {
        Self {
            fat_type,
            corrupted_files: findings.corrupted_files,
            directories_deleted: findings.directories_deleted,
            deleted_handles: findings.deleted_handles,
            deleted_handles_dropped: findings.handles_dropped,
            trailing_records_cleared: findings.trailing_records_cleared,
            orphan_sweep: false,
            orphan_clusters_freed: 0,
            fat_sectors_resynced: 0,
            depth_limit_hit: findings.depth_limit_hit,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.corrupted_files == 0 && self.trailing_records_cleared == 0
    }
}

/// Check the volume whose boot sector is sector 0 of `dev`.
pub fn check_disk<D: SectorDevice>(
    dev: &mut D,
    options: &CheckOptions,
    log_cb: &mut impl FnMut(&str),
) -> Result<CheckReport> {
    let mut boot = [0u8; BOOT_SECTOR_SIZE];
    dev.read_sector(0, &mut boot)
        .map_err(|e| ChkdskError::sector(0, e))?;
    let geometry = VolumeGeometry::parse(&boot)?;
    check_volume(dev, &geometry, options, log_cb)
}

/// Check a volume with already known geometry.
///
/// Unsupported or unusable geometry is rejected before any sector access.
pub fn check_volume<D: SectorDevice>(
    dev: &mut D,
    geometry: &VolumeGeometry,
    options: &CheckOptions,
    log_cb: &mut impl FnMut(&str),
) -> Result<CheckReport> {
    geometry.validate()?;

    log_cb(&format!(
        "{}: {} clusters of {} bytes, {} FAT sectors",
        geometry.fat_type,
        geometry.total_clusters,
        geometry.cluster_size(),
        geometry.fat_sectors,
    ));

    let mut fat = FatTable::new(geometry);
    let mut bitmap = ClusterUsageBitmap::new(dev, geometry, options.bitmap_cache_slots)?;

    let result = run_passes(dev, geometry, options, &mut fat, &mut bitmap, log_cb);
    let mut report = match result {
        Ok(report) => report,
        Err(e) if e.is_structural() => {
            // Pass 1 never writes the FAT, so the primary copy is still the
            // one on disk before the check.
            warn!("check aborted: {e}");
            let restored = copy_primary_fat_to_secondary(dev, geometry, &mut bitmap, false)?;
            if restored > 0 {
                log_cb(&format!(
                    "Restored {restored} secondary FAT sectors after aborting"
                ));
            }
            dev.flush()?;
            return Err(e);
        }
        Err(e) => {
            warn!("check aborted, secondary FAT not resynchronised: {e}");
            return Err(e);
        }
    };

    if let Some(stats) = bitmap.cache_stats() {
        debug!(
            "bitmap cache: {} hits, {} misses, {} write-backs",
            stats.hits, stats.misses, stats.write_backs
        );
    }

    let full = report.corrupted_files > 0;
    report.fat_sectors_resynced =
        copy_primary_fat_to_secondary(dev, geometry, &mut bitmap, full)?;
    if report.fat_sectors_resynced > 0 {
        log_cb(&format!(
            "Copied {} primary FAT sectors to the secondary FAT",
            report.fat_sectors_resynced
        ));
    }

    dev.flush()?;

    if report.is_clean() {
        log_cb("Check complete: no problems found");
    } else {
        log_cb(&format!(
            "Check complete: {} record(s) deleted, {} orphan cluster(s) freed",
            report.corrupted_files, report.orphan_clusters_freed
        ));
    }
    Ok(report)
}

fn run_passes<D: SectorDevice>(
    dev: &mut D,
    geometry: &VolumeGeometry,
    options: &CheckOptions,
    fat: &mut FatTable,
    bitmap: &mut ClusterUsageBitmap,
    log_cb: &mut impl FnMut(&str),
) -> Result<CheckReport> {
    info!("pass 1: scanning directories");
    let findings = {
        let mut scanner = DirectoryScanner::new(
            dev,
            geometry,
            fat,
            bitmap,
            options.max_nesting_level,
            options.max_fast_handles,
        );
        if geometry.fat_type == FatType::Fat32 {
            let reserved = scanner.reserve_cluster(geometry.root_cluster)?;
            debug!("root directory: {reserved} cluster(s) reserved");
        }
        // Repairs made before a failure are still written back.
        let scanned = scanner.scan_root();
        let findings = scanner.finish();
        scanned?;
        findings?
    };

    let mut report = CheckReport::new(geometry.fat_type, findings);
    if report.corrupted_files > 0 {
        log_cb(&format!(
            "Deleted {} corrupt directory record(s)",
            report.corrupted_files
        ));
    }
    if report.trailing_records_cleared > 0 {
        log_cb(&format!(
            "Cleared {} stray record(s) past end of directory",
            report.trailing_records_cleared
        ));
    }

    if report.corrupted_files > 0 {
        if !options.sweep_orphans {
            log_cb("Orphan sweep disabled, unreferenced clusters left allocated");
        } else if report.depth_limit_hit {
            log_cb("Orphan sweep skipped: directory tree too deep to scan completely");
        } else {
            info!("pass 2: freeing unreferenced clusters");
            report.orphan_sweep = true;
            report.orphan_clusters_freed = scan_and_update_fat(dev, geometry, fat, bitmap)?;
        }
    }

    fat.flush(dev)?;
    Ok(report)
}

/// Free every FAT entry whose cluster was not claimed in pass 1.
///
/// Entries holding the bad-cluster marker are left alone. Returns the number
/// of entries freed.
pub fn scan_and_update_fat<D: SectorDevice>(
    dev: &mut D,
    geometry: &VolumeGeometry,
    fat: &mut FatTable,
    bitmap: &mut ClusterUsageBitmap,
) -> Result<u32> {
    let mut freed = 0;
    for cluster in 2..=geometry.max_cluster() {
        if bitmap.is_used(dev, cluster)? {
            continue;
        }
        let value = fat.next_cluster(dev, cluster)?;
        if value == 0 || fat.is_bad_cluster(value) {
            continue;
        }
        if fat.free_entry(dev, cluster)? {
            debug!("freed orphan cluster {cluster} (was 0x{value:08X})");
            freed += 1;
        }
    }
    Ok(freed)
}

/// Copy the primary FAT over the secondary FAT.
///
/// After repairs the whole FAT is copied. Otherwise only the sectors that
/// held the FAT32 usage bitmap need restoring. Copies go through the bitmap
/// cache buffers, so the bitmap is unusable afterwards. Returns the number
/// of sectors copied.
pub fn copy_primary_fat_to_secondary<D: SectorDevice>(
    dev: &mut D,
    geometry: &VolumeGeometry,
    bitmap: &mut ClusterUsageBitmap,
    full: bool,
) -> Result<u64> {
    let count = if full {
        geometry.fat_sectors
    } else {
        bitmap.scratch_sectors()
    };
    if geometry.num_fats < 2 || count == 0 {
        return Ok(0);
    }

    let mut owned: Vec<Vec<u8>>;
    let mut buffers = match bitmap.take_scratch_buffers() {
        Some(buffers) => buffers,
        None => {
            owned = vec![vec![0u8; geometry.bytes_per_sector as usize]; MAX_CACHES];
            owned.iter_mut().map(|b| b.as_mut_slice()).collect()
        }
    };

    let src = geometry.fat_start;
    let dst = geometry.secondary_fat_start();
    let mut copied = 0u64;
    while copied < count {
        let group = (count - copied).min(buffers.len() as u64) as usize;
        for (i, buf) in buffers.iter_mut().take(group).enumerate() {
            let sector = src + copied + i as u64;
            dev.read_sector(sector, buf)
                .map_err(|e| ChkdskError::sector(sector, e))?;
        }
        for (i, buf) in buffers.iter().take(group).enumerate() {
            let sector = dst + copied + i as u64;
            dev.write_sector(sector, buf)
                .map_err(|e| ChkdskError::sector(sector, e))?;
        }
        copied += group as u64;
    }
    debug!("secondary FAT: {copied} sectors rewritten from primary");
    Ok(copied)
}
