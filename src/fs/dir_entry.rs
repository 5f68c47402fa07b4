use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use super::geometry::DIR_ENTRY_SIZE;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = ATTR_READ_ONLY | ATTR_HIDDEN | ATTR_SYSTEM | ATTR_VOLUME_ID;

/// First name byte of a record that has never been used; nothing follows it.
pub const END_OF_DIRECTORY: u8 = 0x00;
/// First name byte of a deleted record.
pub const DELETED_MARKER: u8 = 0xE5;

/// How the scanner treats a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    EndOfDirectory,
    Deleted,
    /// `.` or `..`
    DotEntry,
    LongName,
    Directory,
    VolumeId,
    File,
}

/// Decoded view of one 32-byte directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirRecord {
    pub first_byte: u8,
    pub attr: u8,
    pub size: u32,
    pub start_cluster: u32,
    /// Bytes 26..28 on their own, used to tell long-name fragments apart.
    pub cluster_lo: u16,
    /// Raw 8.3 name field.
    pub name: [u8; 11],
}

impl DirRecord {
    /// Decode the record at the start of `raw` (at least 32 bytes).
    pub fn parse(raw: &[u8]) -> Self {
        let cluster_hi = LittleEndian::read_u16(&raw[20..22]) as u32;
        let cluster_lo = LittleEndian::read_u16(&raw[26..28]);
        let mut name = [0u8; 11];
        name.copy_from_slice(&raw[0..11]);
        Self {
            first_byte: raw[0],
            attr: raw[11],
            size: LittleEndian::read_u32(&raw[28..32]),
            start_cluster: (cluster_hi << 16) | cluster_lo as u32,
            cluster_lo,
            name,
        }
    }

    pub fn is_long_name(&self) -> bool {
        self.attr == ATTR_LONG_NAME && self.cluster_lo == 0
    }

    pub fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_volume_id(&self) -> bool {
        self.attr & ATTR_VOLUME_ID != 0
    }

    /// Classification used by the scanner, in precedence order.
    pub fn kind(&self) -> RecordKind {
        match self.first_byte {
            END_OF_DIRECTORY => RecordKind::EndOfDirectory,
            DELETED_MARKER => RecordKind::Deleted,
            b'.' => RecordKind::DotEntry,
            _ if self.is_long_name() => RecordKind::LongName,
            _ if self.is_directory() => RecordKind::Directory,
            _ if self.is_volume_id() => RecordKind::VolumeId,
            _ => RecordKind::File,
        }
    }

    /// True for the `.` entry of a directory.
    pub fn is_dot(&self) -> bool {
        self.name[0] == b'.' && self.name[1] == b' '
    }

    /// True for the `..` entry of a directory.
    pub fn is_dot_dot(&self) -> bool {
        self.name[0] == b'.' && self.name[1] == b'.'
    }

    /// Human-readable 8.3 name for log messages.
    pub fn display_name(&self) -> String {
        let base = String::from_utf8_lossy(&self.name[0..8]).trim_end().to_string();
        let ext = String::from_utf8_lossy(&self.name[8..11]).trim_end().to_string();
        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }
}

/// Location of a directory record deleted by a check run.
///
/// Lets a caller holding open-file state recognise which of its files went
/// away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FastHandle {
    pub drive: u16,
    pub sector: u64,
    /// Byte offset of the record within its sector.
    pub record_offset: u16,
}

impl FastHandle {
    pub fn new(drive: u16, sector: u64, record_index: usize) -> Self {
        Self {
            drive,
            sector,
            record_offset: (record_index * DIR_ENTRY_SIZE) as u16,
        }
    }

    /// Pack as `sector << 32 | offset << 16 | drive`.
    pub fn pack(&self) -> u64 {
        ((self.sector & 0xFFFF_FFFF) << 32)
            | ((self.record_offset as u64) << 16)
            | self.drive as u64
    }
}
