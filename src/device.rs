use std::io::{Read, Seek, SeekFrom, Write};

/// Sector-granular access to the device holding a FAT volume.
///
/// The sector size is the length of the buffer passed in; the checker always
/// uses the volume's bytes-per-sector once the boot sector has been parsed.
/// Methods take `&mut self`, so a single check run is serialized by the
/// borrow checker rather than by a lock.
pub trait SectorDevice {
    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> std::io::Result<()>;

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> std::io::Result<()>;

    /// Push any cached sectors down to the medium.
    fn flush(&mut self) -> std::io::Result<()>;

    /// Drive number recorded in fast handles of deleted files.
    fn drive_number(&self) -> u16 {
        0
    }
}

impl<D: SectorDevice + ?Sized> SectorDevice for &mut D {
    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> std::io::Result<()> {
        (**self).read_sector(sector, buf)
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> std::io::Result<()> {
        (**self).write_sector(sector, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (**self).flush()
    }

    fn drive_number(&self) -> u16 {
        (**self).drive_number()
    }
}

/// A FAT volume inside a disk image or raw block device, starting at
/// `partition_offset` bytes.
pub struct ImageDevice<F> {
    inner: F,
    partition_offset: u64,
    drive_number: u16,
}

impl<F: Read + Write + Seek> ImageDevice<F> {
    pub fn new(inner: F, partition_offset: u64) -> Self {
        Self {
            inner,
            partition_offset,
            drive_number: 0,
        }
    }

    pub fn with_drive_number(mut self, drive_number: u16) -> Self {
        self.drive_number = drive_number;
        self
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    /// Absolute byte offset for a given sector number.
    fn sector_offset(&self, sector: u64, sector_size: usize) -> u64 {
        self.partition_offset + sector * sector_size as u64
    }
}

impl<F: Read + Write + Seek> SectorDevice for ImageDevice<F> {
    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let offset = self.sector_offset(sector, buf.len());
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buf)
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> std::io::Result<()> {
        let offset = self.sector_offset(sector, buf.len());
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    fn drive_number(&self) -> u16 {
        self.drive_number
    }
}
