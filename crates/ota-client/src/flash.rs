//! Raw flash access and region bookkeeping.
//!
//! Flash is addressed in bytes and erased in [`SECTOR_SIZE`] sectors. Bits
//! can only be cleared by a write; an erase sets a whole sector back to
//! `0xFF`. Every region carries its activation state in-band in its first
//! byte:
//!
//! | first byte | meaning |
//! |---|---|
//! | [`SENTINEL_UNCOMMITTED`] | erased, never finalized |
//! | live value ([`IMAGE_MAGIC`], [`CERT_MAGIC`]) | committed, bootable/usable |
//! | [`SENTINEL_RETIRED`] | explicitly retired |

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::FlashError;

/// Erase granularity in bytes.
pub const SECTOR_SIZE: u32 = 4096;

/// First byte of an erased, never-finalized region.
pub const SENTINEL_UNCOMMITTED: u8 = 0xFF;

/// First byte of a region that has been retired.
pub const SENTINEL_RETIRED: u8 = 0x00;

/// First byte of a committed firmware image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// First byte of a committed certificate sector (DER `SEQUENCE` tag).
pub const CERT_MAGIC: u8 = 0x30;

/// Raw flash routines supplied by the platform.
pub trait FlashStorage: Send {
    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Erase the sector starting at `addr` (must be sector aligned).
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError>;

    /// Program `data` at `addr`. Only clears bits.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Total addressable size in bytes.
    fn capacity(&self) -> u32;
}

impl<T: FlashStorage + ?Sized> FlashStorage for Box<T> {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(addr, buf)
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        (**self).erase_sector(addr)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(addr, data)
    }

    fn capacity(&self) -> u32 {
        (**self).capacity()
    }
}

/// A contiguous, sector-aligned span of flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlashRegion {
    /// Index of the first sector.
    pub start_sector: u32,
    /// Size of the region in bytes.
    pub size_bytes: u32,
}

impl FlashRegion {
    pub const fn new(start_sector: u32, size_bytes: u32) -> Self {
        Self {
            start_sector,
            size_bytes,
        }
    }

    /// Absolute byte address of the region start.
    pub fn start_address(&self) -> u32 {
        self.start_sector * SECTOR_SIZE
    }

    /// Absolute byte address one past the region end.
    pub fn end_address(&self) -> u32 {
        self.start_address() + self.size_bytes
    }

    /// End address, or `None` when the region does not fit a 32-bit address
    /// space.
    pub fn checked_end_address(&self) -> Option<u32> {
        self.start_sector
            .checked_mul(SECTOR_SIZE)?
            .checked_add(self.size_bytes)
    }

    /// Whether two regions share any byte.
    pub fn overlaps(&self, other: &FlashRegion) -> bool {
        self.start_address() < other.end_address() && other.start_address() < self.end_address()
    }
}

impl std::fmt::Display for FlashRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#08x}..{:#08x}",
            self.start_address(),
            self.end_address()
        )
    }
}

/// Activation state decoded from a region's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Uncommitted,
    Live,
    Retired,
    /// Any other first byte: not something this client wrote.
    Foreign(u8),
}

/// Decode the state of `region` given the byte that marks it live.
pub fn region_state(
    flash: &dyn FlashStorage,
    region: FlashRegion,
    live: u8,
) -> Result<RegionState, FlashError> {
    let mut first = [0u8; 1];
    flash.read(region.start_address(), &mut first)?;
    Ok(match first[0] {
        b if b == live => RegionState::Live,
        SENTINEL_UNCOMMITTED => RegionState::Uncommitted,
        SENTINEL_RETIRED => RegionState::Retired,
        other => RegionState::Foreign(other),
    })
}

/// The region of a pair currently in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveRegion(pub FlashRegion);

/// The region of a pair free to receive the next candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupRegion(pub FlashRegion);

/// Result of probing a region pair at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankSelection {
    Selected {
        active: ActiveRegion,
        backup: BackupRegion,
    },
    /// Neither region is live.
    Disabled,
}

/// Select the live region of `pair`, preferring the first.
pub fn select_bank(
    flash: &dyn FlashStorage,
    pair: [FlashRegion; 2],
    live: u8,
) -> Result<BankSelection, FlashError> {
    let [a, b] = pair;
    if region_state(flash, a, live)? == RegionState::Live {
        return Ok(BankSelection::Selected {
            active: ActiveRegion(a),
            backup: BackupRegion(b),
        });
    }
    if region_state(flash, b, live)? == RegionState::Live {
        return Ok(BankSelection::Selected {
            active: ActiveRegion(b),
            backup: BackupRegion(a),
        });
    }
    Ok(BankSelection::Disabled)
}

/// In-memory flash with NOR semantics.
///
/// Cloning yields another handle onto the same memory, so a test can keep a
/// handle while the client owns another.
#[derive(Debug, Clone)]
pub struct MemFlash {
    inner: Arc<Mutex<MemFlashInner>>,
}

#[derive(Debug)]
struct MemFlashInner {
    data: Vec<u8>,
    erased: Vec<u32>,
    fail_writes: bool,
}

impl MemFlash {
    /// Create erased flash of `size` bytes.
    pub fn new(size: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemFlashInner {
                data: vec![SENTINEL_UNCOMMITTED; size as usize],
                erased: Vec::new(),
                fail_writes: false,
            })),
        }
    }

    /// Copy of `len` bytes starting at `addr`.
    pub fn snapshot(&self, addr: u32, len: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        let start = addr as usize;
        inner.data[start..start + len].to_vec()
    }

    /// Byte at `addr`.
    pub fn byte_at(&self, addr: u32) -> u8 {
        self.inner.lock().data[addr as usize]
    }

    /// Addresses of every sector erase so far, in order.
    pub fn erase_log(&self) -> Vec<u32> {
        self.inner.lock().erased.clone()
    }

    /// Make every following write fail.
    pub fn set_write_failure(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Overwrite raw contents, bypassing NOR semantics.
    pub fn load(&self, addr: u32, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        let start = addr as usize;
        inner.data[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl MemFlashInner {
    fn check(&self, addr: u32, len: usize) -> bool {
        (addr as usize)
            .checked_add(len)
            .is_some_and(|end| end <= self.data.len())
    }
}

impl FlashStorage for MemFlash {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let inner = self.inner.lock();
        if !inner.check(addr, buf.len()) {
            return Err(FlashError::Read {
                addr,
                len: buf.len(),
            });
        }
        let start = addr as usize;
        buf.copy_from_slice(&inner.data[start..start + buf.len()]);
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        if addr % SECTOR_SIZE != 0 {
            return Err(FlashError::Misaligned { addr });
        }
        let mut inner = self.inner.lock();
        if !inner.check(addr, SECTOR_SIZE as usize) {
            return Err(FlashError::Erase { addr });
        }
        let start = addr as usize;
        inner.data[start..start + SECTOR_SIZE as usize].fill(SENTINEL_UNCOMMITTED);
        inner.erased.push(addr);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let mut inner = self.inner.lock();
        if inner.fail_writes || !inner.check(addr, data.len()) {
            return Err(FlashError::Write {
                addr,
                len: data.len(),
            });
        }
        let start = addr as usize;
        for (cell, byte) in inner.data[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        Ok(())
    }

    fn capacity(&self) -> u32 {
        self.inner.lock().data.len() as u32
    }
}
