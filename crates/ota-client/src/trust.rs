//! TLS trust anchors kept in flash.
//!
//! Anchors live in one sector of a two-sector bank. A sector holds DER
//! certificates back to back, padded with `0xFF`; since every certificate
//! starts with the DER `SEQUENCE` tag, a live sector starts with
//! [`CERT_MAGIC`].

use tracing::{debug, warn};

use crate::error::FlashError;
use crate::flash::{select_bank, BankSelection, FlashRegion, FlashStorage, CERT_MAGIC};

/// DER certificates accepted as TLS roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustAnchors {
    certificates: Vec<Vec<u8>>,
}

impl TrustAnchors {
    pub fn new(certificates: Vec<Vec<u8>>) -> Self {
        Self { certificates }
    }

    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Split a sector image into its certificates.
    ///
    /// Parsing stops at the first byte that does not open a DER sequence or
    /// at a length running past the end of `sector`.
    pub fn parse_sector(sector: &[u8]) -> Self {
        let mut certificates = Vec::new();
        let mut rest = sector;

        while let Some(len) = der_element_len(rest) {
            let (cert, tail) = rest.split_at(len);
            certificates.push(cert.to_vec());
            rest = tail;
        }

        if rest.first().is_some_and(|b| *b != 0xFF) {
            warn!(
                parsed = certificates.len(),
                "Certificate sector has trailing data"
            );
        }
        Self { certificates }
    }

    /// Concatenate into a sector image (without padding).
    pub fn to_sector(&self) -> Vec<u8> {
        self.certificates.concat()
    }
}

/// Total length of the DER `SEQUENCE` at the start of `bytes`.
fn der_element_len(bytes: &[u8]) -> Option<usize> {
    if *bytes.first()? != CERT_MAGIC {
        return None;
    }
    let (header, body) = match *bytes.get(1)? {
        len if len < 0x80 => (2, len as usize),
        0x81 => (3, *bytes.get(2)? as usize),
        0x82 => (4, u16::from_be_bytes([*bytes.get(2)?, *bytes.get(3)?]) as usize),
        _ => return None,
    };
    let total = header + body;
    (total <= bytes.len()).then_some(total)
}

/// Load the anchors from the live sector of `bank`, if any.
pub fn load_active(
    flash: &dyn FlashStorage,
    bank: [FlashRegion; 2],
) -> Result<Option<TrustAnchors>, FlashError> {
    let active = match select_bank(flash, bank, CERT_MAGIC)? {
        BankSelection::Selected { active, .. } => active.0,
        BankSelection::Disabled => {
            debug!("No live certificate sector");
            return Ok(None);
        }
    };

    let mut sector = vec![0u8; active.size_bytes as usize];
    flash.read(active.start_address(), &mut sector)?;
    let anchors = TrustAnchors::parse_sector(&sector);
    debug!(region = %active, count = anchors.certificates.len(), "Loaded trust anchors");
    Ok((!anchors.is_empty()).then_some(anchors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{MemFlash, SECTOR_SIZE};

    fn fake_cert(body_len: usize, fill: u8) -> Vec<u8> {
        let mut cert = vec![0x30, 0x82];
        cert.extend_from_slice(&(body_len as u16).to_be_bytes());
        cert.extend(std::iter::repeat(fill).take(body_len));
        cert
    }

    #[test]
    fn test_parse_sector_splits_certificates() {
        let a = fake_cert(300, 0x11);
        let b = vec![0x30, 0x03, 1, 2, 3];
        let mut sector = [a.clone(), b.clone()].concat();
        sector.resize(SECTOR_SIZE as usize, 0xFF);

        let anchors = TrustAnchors::parse_sector(&sector);
        assert_eq!(anchors.certificates(), &[a, b]);
    }

    #[test]
    fn test_parse_sector_stops_on_overrun() {
        let mut cert = fake_cert(300, 0x11);
        cert.truncate(100);
        assert!(TrustAnchors::parse_sector(&cert).is_empty());
        assert!(TrustAnchors::parse_sector(&[0xFF; 16]).is_empty());
    }

    #[test]
    fn test_load_active_follows_bank_selection() {
        let flash = MemFlash::new(4 * SECTOR_SIZE);
        let bank = [
            FlashRegion::new(1, SECTOR_SIZE),
            FlashRegion::new(2, SECTOR_SIZE),
        ];
        assert_eq!(load_active(&flash, bank).unwrap(), None);

        let anchors = TrustAnchors::new(vec![fake_cert(64, 0x22)]);
        flash.load(bank[1].start_address(), &anchors.to_sector());
        assert_eq!(load_active(&flash, bank).unwrap(), Some(anchors));
    }
}
