use serde::Serialize;
use thiserror::Error;

use crate::fs::geometry::FatType;

#[derive(Error, Debug)]
pub enum ChkdskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error at sector {sector}: {source}")]
    SectorIo {
        sector: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid volume geometry: {0}")]
    InvalidGeometry(String),

    #[error("Unsupported filesystem type: {0}")]
    UnsupportedFilesystem(FatType),

    #[error("Cluster {cluster} is outside the usage bitmap ({capacity} bits)")]
    BitmapRange { cluster: u32, capacity: u64 },

    #[error("Sector {sector} is outside the primary FAT")]
    FatRange { sector: u64 },

    #[error("Directory chain broken at cluster {cluster} (next = 0x{next:08X})")]
    CorruptDirectoryChain { cluster: u32, next: u32 },

    #[error("More than {limit} long-name records precede record {index} of sector {sector}")]
    MalformedLongName {
        sector: u64,
        index: usize,
        limit: usize,
    },
}

impl ChkdskError {
    /// Wrap an I/O error with the sector that was being accessed.
    pub fn sector(sector: u64, source: std::io::Error) -> Self {
        ChkdskError::SectorIo { sector, source }
    }

    /// Caller-visible status for this failure.
    pub fn status(&self) -> CheckStatus {
        match self {
            ChkdskError::UnsupportedFilesystem(_) => CheckStatus::UnsupportedFilesystem,
            _ => CheckStatus::GeneralError,
        }
    }

    /// Directory structure too damaged to walk. Raised during pass 1, before
    /// any FAT entry is modified.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ChkdskError::CorruptDirectoryChain { .. } | ChkdskError::MalformedLongName { .. }
        )
    }
}

/// Outcome of a check run as seen by a caller that only wants a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckStatus {
    Success,
    /// I/O failure, invalid geometry or an unusable bitmap.
    GeneralError,
    /// FAT12 or an unrecognised type.
    UnsupportedFilesystem,
}

impl<T> From<&Result<T, ChkdskError>> for CheckStatus {
    fn from(result: &Result<T, ChkdskError>) -> Self {
        match result {
            Ok(_) => CheckStatus::Success,
            Err(e) => e.status(),
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Success => write!(f, "success"),
            CheckStatus::GeneralError => write!(f, "general filesystem error"),
            CheckStatus::UnsupportedFilesystem => write!(f, "unsupported filesystem type"),
        }
    }
}

pub type Result<T, E = ChkdskError> = std::result::Result<T, E>;
