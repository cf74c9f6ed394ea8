//! Deferred-commit flash writer.
//!
//! A region becomes live only when its first byte is written. The writer
//! holds that byte back for the whole download and writes it last, in
//! [`DeferredCommitWriter::finalize`], after the image has been verified.
//! Power loss at any earlier point leaves the first byte at
//! [`SENTINEL_UNCOMMITTED`] and the region is never booted.

use tracing::{debug, info, warn};

use crate::error::FlashError;
use crate::flash::{FlashRegion, FlashStorage, SECTOR_SIZE, SENTINEL_RETIRED, SENTINEL_UNCOMMITTED};

/// First byte captured at the start of a download session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingByte {
    pub region: FlashRegion,
    pub value: u8,
}

/// Erase and write progress of the current session.
#[derive(Debug, Clone, Copy)]
struct Session {
    region: FlashRegion,
    /// Absolute address up to which sectors have been erased.
    erased_until: u32,
    /// Next region offset a write is expected at.
    next_offset: u32,
}

/// Streams sequential writes into a region, deferring its first byte.
pub struct DeferredCommitWriter<F> {
    flash: F,
    pending: Option<PendingByte>,
    session: Option<Session>,
}

impl<F: FlashStorage> DeferredCommitWriter<F> {
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            pending: None,
            session: None,
        }
    }

    /// The underlying flash, for read-back.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Captured first byte for `region`, if a session is open on it.
    pub fn pending_first_byte(&self, region: FlashRegion) -> Option<u8> {
        self.pending
            .filter(|pending| pending.region == region)
            .map(|pending| pending.value)
    }

    /// Write `bytes` at `offset` within `region`.
    ///
    /// A write at offset 0 opens a new session: the first byte is captured
    /// instead of written, and erase tracking restarts. Later writes must
    /// continue exactly where the previous one ended. Each sector touched is
    /// erased exactly once per session, just before its first write.
    pub fn write(&mut self, region: FlashRegion, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        if bytes.is_empty() {
            return Ok(());
        }

        let end = offset as u64 + bytes.len() as u64;
        if end > region.size_bytes as u64 {
            return Err(FlashError::OutOfBounds {
                offset,
                len: bytes.len(),
                size: region.size_bytes,
            });
        }

        if offset == 0 {
            debug!(region = %region, "Opening write session");
            self.session = Some(Session {
                region,
                erased_until: region.start_address(),
                next_offset: 0,
            });
            self.pending = Some(PendingByte {
                region,
                value: bytes[0],
            });
        }

        let mut session = match self.session {
            Some(session) if session.region == region && session.next_offset == offset => session,
            Some(session) if session.region == region => {
                return Err(FlashError::OutOfOrder {
                    offset,
                    expected: session.next_offset,
                })
            }
            _ => return Err(FlashError::OutOfOrder { offset, expected: 0 }),
        };

        let write_end = region.start_address() + end as u32;
        while session.erased_until < write_end {
            self.flash.erase_sector(session.erased_until)?;
            session.erased_until += SECTOR_SIZE;
        }

        if offset == 0 {
            self.flash.write(region.start_address() + 1, &bytes[1..])?;
        } else {
            self.flash.write(region.start_address() + offset, bytes)?;
        }

        session.next_offset = end as u32;
        self.session = Some(session);
        Ok(())
    }

    /// Commit `region` by writing its captured first byte.
    pub fn finalize(&mut self, region: FlashRegion) -> Result<(), FlashError> {
        let value = self
            .pending_first_byte(region)
            .ok_or(FlashError::NothingPending {
                start_sector: region.start_sector,
            })?;

        self.flash.write(region.start_address(), &[value])?;
        self.pending = None;
        self.session = None;
        info!(region = %region, first_byte = value, "Region finalized");
        Ok(())
    }

    /// Make sure `region` is never treated as live.
    ///
    /// A captured first byte for the region is dropped, which leaves an
    /// unfinalized region at [`SENTINEL_UNCOMMITTED`]. A region whose first
    /// byte is already committed is overwritten with [`SENTINEL_RETIRED`].
    pub fn invalidate(&mut self, region: FlashRegion) -> Result<(), FlashError> {
        if self.pending_first_byte(region).is_some() {
            self.pending = None;
            self.session = None;
            debug!(region = %region, "Dropped pending first byte");
        }

        let mut first = [0u8; 1];
        self.flash.read(region.start_address(), &mut first)?;
        if first[0] != SENTINEL_UNCOMMITTED && first[0] != SENTINEL_RETIRED {
            self.flash.write(region.start_address(), &[SENTINEL_RETIRED])?;
            warn!(region = %region, "Region retired");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{MemFlash, IMAGE_MAGIC};

    fn region() -> FlashRegion {
        FlashRegion::new(1, 4 * SECTOR_SIZE)
    }

    fn writer() -> (MemFlash, DeferredCommitWriter<MemFlash>) {
        let flash = MemFlash::new(8 * SECTOR_SIZE);
        (flash.clone(), DeferredCommitWriter::new(flash))
    }

    #[test]
    fn test_first_byte_deferred_until_finalize() {
        let (flash, mut writer) = writer();
        let region = region();

        writer.write(region, 0, &[IMAGE_MAGIC, 1, 2, 3]).unwrap();
        assert_eq!(flash.byte_at(region.start_address()), SENTINEL_UNCOMMITTED);
        assert_eq!(flash.snapshot(region.start_address() + 1, 3), vec![1, 2, 3]);
        assert_eq!(writer.pending_first_byte(region), Some(IMAGE_MAGIC));

        writer.finalize(region).unwrap();
        assert_eq!(flash.byte_at(region.start_address()), IMAGE_MAGIC);
        assert_eq!(writer.pending_first_byte(region), None);
    }

    #[test]
    fn test_each_sector_erased_once() {
        let (flash, mut writer) = writer();
        let region = region();
        let data = vec![0x5Au8; 10_000];

        for (i, chunk) in data.chunks(1390).enumerate() {
            writer.write(region, (i * 1390) as u32, chunk).unwrap();
        }

        let base = region.start_address();
        assert_eq!(
            flash.erase_log(),
            vec![base, base + SECTOR_SIZE, base + 2 * SECTOR_SIZE]
        );
    }

    #[test]
    fn test_new_session_erases_again() {
        let (flash, mut writer) = writer();
        let region = region();

        writer.write(region, 0, &[1; 100]).unwrap();
        writer.write(region, 0, &[2; 100]).unwrap();

        assert_eq!(flash.erase_log().len(), 2);
        assert_eq!(flash.byte_at(region.start_address() + 50), 2);
        assert_eq!(writer.pending_first_byte(region), Some(2));
    }

    #[test]
    fn test_out_of_order_write_rejected() {
        let (_flash, mut writer) = writer();
        let region = region();

        assert!(matches!(
            writer.write(region, 10, &[1]),
            Err(FlashError::OutOfOrder { .. })
        ));

        writer.write(region, 0, &[1; 10]).unwrap();
        assert!(matches!(
            writer.write(region, 20, &[1]),
            Err(FlashError::OutOfOrder { offset: 20, expected: 10 })
        ));
    }

    #[test]
    fn test_write_past_region_rejected() {
        let (_flash, mut writer) = writer();
        let region = FlashRegion::new(1, SECTOR_SIZE);
        writer.write(region, 0, &[0; 4000]).unwrap();
        assert!(matches!(
            writer.write(region, 4000, &[0; 200]),
            Err(FlashError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_finalize_without_session_fails() {
        let (_flash, mut writer) = writer();
        assert!(matches!(
            writer.finalize(region()),
            Err(FlashError::NothingPending { start_sector: 1 })
        ));
    }

    #[test]
    fn test_invalidate_unfinalized_keeps_sentinel() {
        let (flash, mut writer) = writer();
        let region = region();

        writer.write(region, 0, &[IMAGE_MAGIC, 9, 9]).unwrap();
        writer.invalidate(region).unwrap();

        assert_eq!(flash.byte_at(region.start_address()), SENTINEL_UNCOMMITTED);
        assert!(writer.finalize(region).is_err());
    }

    #[test]
    fn test_invalidate_committed_region_retires_it() {
        let (flash, mut writer) = writer();
        let region = region();

        writer.write(region, 0, &[IMAGE_MAGIC, 9, 9]).unwrap();
        writer.finalize(region).unwrap();
        writer.invalidate(region).unwrap();

        assert_eq!(flash.byte_at(region.start_address()), SENTINEL_RETIRED);
    }

    #[test]
    fn test_flash_failure_propagates() {
        let (flash, mut writer) = writer();
        flash.set_write_failure(true);
        assert!(matches!(
            writer.write(region(), 0, &[1, 2, 3]),
            Err(FlashError::Write { .. })
        ));
    }
}
