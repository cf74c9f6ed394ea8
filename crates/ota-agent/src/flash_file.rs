//! Flash backed by an image file on the host.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use ota_client::flash::{SECTOR_SIZE, SENTINEL_UNCOMMITTED};
use ota_client::{FlashError, FlashStorage};
use parking_lot::Mutex;

/// NOR-style flash stored in a file.
///
/// Erase sets a sector to `0xFF`; writes can only clear bits, as on the
/// device.
#[derive(Debug)]
pub struct FileFlash {
    file: Mutex<File>,
    size: u32,
}

impl FileFlash {
    /// Open the image at `path`, creating an erased image of `size` bytes
    /// when the file does not exist. An existing image keeps its size.
    pub fn open(path: &Path, size: u32) -> std::io::Result<Self> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if !exists {
            tracing::info!("Creating erased flash image {:?} ({} bytes)", path, size);
            let erased = vec![SENTINEL_UNCOMMITTED; SECTOR_SIZE as usize];
            for _ in 0..size.div_ceil(SECTOR_SIZE) {
                file.write_all(&erased)?;
            }
            file.flush()?;
        }

        let len = file.metadata()?.len();
        let size = u32::try_from(len).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("flash image of {len} bytes is too large"),
            )
        })?;
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }

    fn in_bounds(&self, addr: u32, len: usize) -> bool {
        addr as u64 + len as u64 <= self.size as u64
    }

    fn read_raw(file: &mut File, addr: u32, buf: &mut [u8]) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(addr as u64))?;
        file.read_exact(buf)
    }

    fn write_raw(file: &mut File, addr: u32, data: &[u8]) -> std::io::Result<()> {
        file.seek(SeekFrom::Start(addr as u64))?;
        file.write_all(data)?;
        file.flush()
    }
}

impl FlashStorage for FileFlash {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let error = FlashError::Read {
            addr,
            len: buf.len(),
        };
        if !self.in_bounds(addr, buf.len()) {
            return Err(error);
        }
        Self::read_raw(&mut self.file.lock(), addr, buf).map_err(|e| {
            tracing::error!("Flash read at {:#x} failed: {}", addr, e);
            error
        })
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        if addr % SECTOR_SIZE != 0 {
            return Err(FlashError::Misaligned { addr });
        }
        if !self.in_bounds(addr, SECTOR_SIZE as usize) {
            return Err(FlashError::Erase { addr });
        }
        let erased = [SENTINEL_UNCOMMITTED; SECTOR_SIZE as usize];
        Self::write_raw(self.file.get_mut(), addr, &erased).map_err(|e| {
            tracing::error!("Flash erase at {:#x} failed: {}", addr, e);
            FlashError::Erase { addr }
        })
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let error = FlashError::Write {
            addr,
            len: data.len(),
        };
        if !self.in_bounds(addr, data.len()) {
            return Err(error);
        }
        if data.is_empty() {
            return Ok(());
        }

        let file = self.file.get_mut();
        let mut current = vec![0u8; data.len()];
        Self::read_raw(file, addr, &mut current)
            .and_then(|()| {
                for (cell, byte) in current.iter_mut().zip(data) {
                    *cell &= byte;
                }
                Self::write_raw(file, addr, &current)
            })
            .map_err(|e| {
                tracing::error!("Flash write at {:#x} failed: {}", addr, e);
                error
            })
    }

    fn capacity(&self) -> u32 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_created_image_is_erased() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flash.bin");
        let flash = FileFlash::open(&path, 3 * SECTOR_SIZE).unwrap();

        assert_eq!(flash.capacity(), 3 * SECTOR_SIZE);
        let mut buf = [0u8; 16];
        flash.read(2 * SECTOR_SIZE, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
        assert!(flash.read(3 * SECTOR_SIZE, &mut buf).is_err());
    }

    #[test]
    fn test_nor_semantics_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flash.bin");
        {
            let mut flash = FileFlash::open(&path, 2 * SECTOR_SIZE).unwrap();
            flash.write(10, &[0xF0, 0x0F]).unwrap();
            flash.write(10, &[0x3C, 0xFF]).unwrap();
            assert!(matches!(
                flash.erase_sector(100),
                Err(FlashError::Misaligned { addr: 100 })
            ));
        }

        let mut flash = FileFlash::open(&path, 8 * SECTOR_SIZE).unwrap();
        assert_eq!(flash.capacity(), 2 * SECTOR_SIZE);
        let mut buf = [0u8; 2];
        flash.read(10, &mut buf).unwrap();
        assert_eq!(buf, [0x30, 0x0F]);

        flash.erase_sector(0).unwrap();
        flash.read(10, &mut buf).unwrap();
        assert_eq!(buf, [0xFF, 0xFF]);
    }
}
