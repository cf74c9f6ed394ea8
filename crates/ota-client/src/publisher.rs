//! Publisher-side signing.
//!
//! The publisher's private key is kept as a fixed-layout SEC1
//! `ECPrivateKey` record for secp384r1 whose scalar sits at a known offset.
//! From it this module produces the signature assets and the public key
//! record that devices pin.

use p384::ecdsa::signature::hazmat::PrehashSigner;
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};

use crate::artifact::{
    sha384, ImageSignature, PublicKey, PUBLIC_KEY_LEN, PUBLIC_KEY_PREFIX, SIGN_LEN,
};
use crate::error::UpdateError;

/// Length of the private key record.
pub const PRIVATE_KEY_LEN: usize = 167;

const SCALAR_OFFSET: usize = 8;
const SCALAR_LEN: usize = 48;
/// Offset of the SEC1 point (its `0x04` tag).
const POINT_OFFSET: usize = 70;

/// Record bytes before the scalar.
const PRIVATE_KEY_HEAD: [u8; SCALAR_OFFSET] = [0x30, 0x81, 0xA4, 0x02, 0x01, 0x01, 0x04, 0x30];

/// Record bytes between the scalar and the public point (curve OID, point tag).
const PRIVATE_KEY_MIDDLE: [u8; 14] = [
    0xA0, 0x07, 0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x22, 0xA1, 0x64, 0x03, 0x62, 0x00,
];

/// The publisher's signing key.
pub struct PublisherKey {
    key: SigningKey,
}

impl PublisherKey {
    /// Load from the fixed-layout private key record.
    pub fn from_record(record: &[u8]) -> Result<Self, UpdateError> {
        if record.len() != PRIVATE_KEY_LEN {
            return Err(UpdateError::InvalidKey(format!(
                "private key record is {} bytes, expected {}",
                record.len(),
                PRIVATE_KEY_LEN
            )));
        }
        if record[..SCALAR_OFFSET] != PRIVATE_KEY_HEAD
            || record[SCALAR_OFFSET + SCALAR_LEN..POINT_OFFSET] != PRIVATE_KEY_MIDDLE
        {
            return Err(UpdateError::InvalidKey(
                "not a secp384r1 private key record".to_string(),
            ));
        }
        Self::from_scalar(&record[SCALAR_OFFSET..SCALAR_OFFSET + SCALAR_LEN])
    }

    /// Generate a fresh key from the operating system RNG.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Build from a raw 48-byte scalar.
    pub fn from_scalar(scalar: &[u8]) -> Result<Self, UpdateError> {
        let key =
            SigningKey::from_slice(scalar).map_err(|e| UpdateError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Serialize into the private key record layout.
    pub fn to_record(&self) -> [u8; PRIVATE_KEY_LEN] {
        let mut record = [0u8; PRIVATE_KEY_LEN];
        record[..SCALAR_OFFSET].copy_from_slice(&PRIVATE_KEY_HEAD);
        record[SCALAR_OFFSET..SCALAR_OFFSET + SCALAR_LEN].copy_from_slice(&self.key.to_bytes());
        record[SCALAR_OFFSET + SCALAR_LEN..POINT_OFFSET].copy_from_slice(&PRIVATE_KEY_MIDDLE);
        record[POINT_OFFSET..].copy_from_slice(self.encoded_point().as_bytes());
        record
    }

    /// The 120-byte public key record devices pin.
    pub fn public_record(&self) -> [u8; PUBLIC_KEY_LEN] {
        let mut record = [0u8; PUBLIC_KEY_LEN];
        record[..PUBLIC_KEY_PREFIX.len() - 1]
            .copy_from_slice(&PUBLIC_KEY_PREFIX[..PUBLIC_KEY_PREFIX.len() - 1]);
        record[PUBLIC_KEY_PREFIX.len() - 1..].copy_from_slice(self.encoded_point().as_bytes());
        record
    }

    /// The matching verification key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(VerifyingKey::from(&self.key))
    }

    /// Produce the signature asset for `image`.
    pub fn sign_image(&self, image: &[u8]) -> Result<ImageSignature, UpdateError> {
        let size = u32::try_from(image.len())
            .map_err(|_| UpdateError::TooLarge { size: u32::MAX, limit: u32::MAX })?;
        let hash = sha384(image);

        let signature: Signature = self
            .key
            .sign_prehash(&hash)
            .map_err(|e| UpdateError::SignatureInvalid(e.to_string()))?;
        let der = signature.to_der();
        let der = der.as_bytes();

        let mut sign = [0u8; SIGN_LEN];
        sign.get_mut(..der.len())
            .ok_or_else(|| {
                UpdateError::MalformedSignature(format!("DER signature of {} bytes", der.len()))
            })?
            .copy_from_slice(der);

        Ok(ImageSignature { hash, sign, size })
    }

    fn encoded_point(&self) -> p384::EncodedPoint {
        self.key.verifying_key().to_encoded_point(false)
    }
}
