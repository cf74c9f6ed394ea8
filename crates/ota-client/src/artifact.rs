//! Image verification.
//!
//! Every image is accompanied by a signature asset carrying the SHA-384
//! digest of the image, its exact size and an ECDSA P-384 signature over
//! that digest made with the publisher's key.
//!
//! # Security
//!
//! - The digest is recomputed from flash, not from the network stream
//! - Digests are compared in constant time
//! - The signature is checked over the digest (prehash) with the single
//!   trusted publisher key
//! - Nothing is finalized unless [`ImageVerifier::verify_region`] passes

use p384::ecdsa::signature::hazmat::PrehashVerifier;
use p384::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha384};
use subtle::ConstantTimeEq;

use crate::error::{FlashError, UpdateError};
use crate::flash::{FlashRegion, FlashStorage};

/// Length of a SHA-384 digest.
pub const HASH_LEN: usize = 48;

/// Space reserved for the DER signature, zero padded.
pub const SIGN_LEN: usize = 104;

/// Total length of a signature asset.
pub const SIGNATURE_FILE_LEN: usize = HASH_LEN + 4 + SIGN_LEN;

/// Length of the publisher public key record.
pub const PUBLIC_KEY_LEN: usize = 120;

/// Fixed SubjectPublicKeyInfo header for an uncompressed secp384r1 key.
pub const PUBLIC_KEY_PREFIX: [u8; 24] = [
    0x30, 0x76, 0x30, 0x10, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06, 0x05,
    0x2B, 0x81, 0x04, 0x00, 0x22, 0x03, 0x62, 0x00, 0x04,
];

/// Offset of the SEC1 point (starting with its `0x04` tag) in the record.
const PUBLIC_KEY_POINT_OFFSET: usize = 23;

/// Flash is hashed in blocks of this size.
const HASH_BLOCK_SIZE: usize = 1024;

/// SHA-384 digest.
pub type Digest384 = [u8; HASH_LEN];

/// Parsed signature asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSignature {
    /// SHA-384 of the image.
    pub hash: Digest384,
    /// DER ECDSA signature over `hash`, zero padded.
    pub sign: [u8; SIGN_LEN],
    /// Exact image size in bytes.
    pub size: u32,
}

impl ImageSignature {
    /// Parse `hash || size (big endian) || sign`.
    ///
    /// A signature field shorter than [`SIGN_LEN`] is zero padded; the digest
    /// and size fields are mandatory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UpdateError> {
        if bytes.len() < HASH_LEN + 4 {
            return Err(UpdateError::MalformedSignature(format!(
                "{} bytes, need at least {}",
                bytes.len(),
                HASH_LEN + 4
            )));
        }
        if bytes.len() > SIGNATURE_FILE_LEN {
            return Err(UpdateError::MalformedSignature(format!(
                "{} bytes, at most {} expected",
                bytes.len(),
                SIGNATURE_FILE_LEN
            )));
        }

        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&bytes[..HASH_LEN]);

        let mut size = [0u8; 4];
        size.copy_from_slice(&bytes[HASH_LEN..HASH_LEN + 4]);

        let mut sign = [0u8; SIGN_LEN];
        let tail = &bytes[HASH_LEN + 4..];
        sign[..tail.len()].copy_from_slice(tail);

        Ok(Self {
            hash,
            sign,
            size: u32::from_be_bytes(size),
        })
    }

    /// Serialize into the asset layout.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_FILE_LEN] {
        let mut out = [0u8; SIGNATURE_FILE_LEN];
        out[..HASH_LEN].copy_from_slice(&self.hash);
        out[HASH_LEN..HASH_LEN + 4].copy_from_slice(&self.size.to_be_bytes());
        out[HASH_LEN + 4..].copy_from_slice(&self.sign);
        out
    }

    /// The DER signature without its zero padding.
    fn der(&self) -> Result<&[u8], UpdateError> {
        let len = match (self.sign[0], self.sign[1]) {
            (0x30, 0x81) => 3 + self.sign[2] as usize,
            (0x30, len) if len < 0x80 => 2 + len as usize,
            _ => {
                return Err(UpdateError::MalformedSignature(
                    "signature is not a DER sequence".to_string(),
                ))
            }
        };
        self.sign.get(..len).ok_or_else(|| {
            UpdateError::MalformedSignature(format!("DER length {len} exceeds field"))
        })
    }
}

/// The publisher's verifying key.
#[derive(Debug, Clone)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse the fixed 120-byte public key record.
    pub fn from_record(record: &[u8]) -> Result<Self, UpdateError> {
        if record.len() != PUBLIC_KEY_LEN {
            return Err(UpdateError::InvalidKey(format!(
                "public key record is {} bytes, expected {}",
                record.len(),
                PUBLIC_KEY_LEN
            )));
        }
        if record[..PUBLIC_KEY_PREFIX.len()] != PUBLIC_KEY_PREFIX {
            return Err(UpdateError::InvalidKey(
                "not a secp384r1 public key record".to_string(),
            ));
        }
        VerifyingKey::from_sec1_bytes(&record[PUBLIC_KEY_POINT_OFFSET..])
            .map(Self)
            .map_err(|e| UpdateError::InvalidKey(e.to_string()))
    }

    /// Parse a hex-encoded public key record.
    pub fn from_hex(hex_record: &str) -> Result<Self, UpdateError> {
        let record = hex::decode(hex_record.trim())
            .map_err(|e| UpdateError::InvalidKey(format!("invalid hex: {e}")))?;
        Self::from_record(&record)
    }

    pub(crate) fn from_verifying_key(key: VerifyingKey) -> Self {
        Self(key)
    }
}

/// SHA-384 over the first `size` bytes of `region`.
///
/// When `first_byte` is given it stands in for the byte at offset 0, which is
/// how a region whose first byte is still deferred gets hashed.
pub fn hash_region(
    flash: &dyn FlashStorage,
    region: FlashRegion,
    size: u32,
    first_byte: Option<u8>,
) -> Result<Digest384, FlashError> {
    if size > region.size_bytes {
        return Err(FlashError::OutOfBounds {
            offset: 0,
            len: size as usize,
            size: region.size_bytes,
        });
    }

    let mut hasher = Sha384::new();
    let mut block = [0u8; HASH_BLOCK_SIZE];
    let mut offset = 0u32;

    while offset < size {
        let len = HASH_BLOCK_SIZE.min((size - offset) as usize);
        flash.read(region.start_address() + offset, &mut block[..len])?;
        if offset == 0 {
            if let Some(byte) = first_byte {
                block[0] = byte;
            }
        }
        hasher.update(&block[..len]);
        offset += len as u32;
    }

    let mut digest = [0u8; HASH_LEN];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// SHA-384 of an in-memory buffer.
pub fn sha384(bytes: &[u8]) -> Digest384 {
    let mut digest = [0u8; HASH_LEN];
    digest.copy_from_slice(&Sha384::digest(bytes));
    digest
}

/// Check `digest` against the signed digest, then the signature itself.
pub fn verify(
    digest: &Digest384,
    signature: &ImageSignature,
    key: &PublicKey,
) -> Result<(), UpdateError> {
    if digest[..].ct_eq(&signature.hash[..]).unwrap_u8() != 1 {
        tracing::error!(
            expected = %hex::encode(signature.hash),
            actual = %hex::encode(digest),
            "Image hash mismatch"
        );
        return Err(UpdateError::HashMismatch {
            expected: hex::encode(signature.hash),
            actual: hex::encode(digest),
        });
    }

    let sig = Signature::from_der(signature.der()?)
        .map_err(|e| UpdateError::MalformedSignature(e.to_string()))?;
    key.0.verify_prehash(digest, &sig).map_err(|e| {
        tracing::error!(hash = %hex::encode(digest), "Image signature rejected");
        UpdateError::SignatureInvalid(e.to_string())
    })?;

    tracing::debug!(hash = %hex::encode(digest), "Image signature verified");
    Ok(())
}

/// Verifies regions against signature assets with the pinned publisher key.
#[derive(Debug, Clone)]
pub struct ImageVerifier {
    key: PublicKey,
}

impl ImageVerifier {
    pub fn new(key: PublicKey) -> Self {
        Self { key }
    }

    /// Hash `region` as described by `signature` and check it.
    ///
    /// # Arguments
    ///
    /// * `flash` - Flash holding the downloaded image
    /// * `region` - Region the image was streamed into
    /// * `signature` - Signature asset fetched for this image
    /// * `first_byte` - Deferred first byte, if the region is not finalized
    pub fn verify_region(
        &self,
        flash: &dyn FlashStorage,
        region: FlashRegion,
        signature: &ImageSignature,
        first_byte: Option<u8>,
    ) -> Result<(), UpdateError> {
        let digest = hash_region(flash, region, signature.size, first_byte)?;
        verify(&digest, signature, &self.key)
    }
}
