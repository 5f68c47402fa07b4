//! Consistency checker and repairer for FAT16 and FAT32 volumes.
//!
//! The check needs very little memory: cluster usage is tracked with one bit
//! per cluster, kept in RAM for FAT16 and in the secondary FAT behind a small
//! sector cache for FAT32.

pub mod chkdsk;
pub mod device;
pub mod error;
pub mod fs;

pub use chkdsk::{check_disk, check_volume, CheckOptions, CheckReport};
pub use device::{ImageDevice, SectorDevice};
pub use error::{CheckStatus, ChkdskError};
