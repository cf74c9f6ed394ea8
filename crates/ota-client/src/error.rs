//! Error types for the update client.
//!
//! Errors are layered the same way the pipeline is: the connection layer
//! reports [`ConnError`], the flash layer reports [`FlashError`], and
//! everything above them speaks [`UpdateError`].

use thiserror::Error;

/// Errors raised while establishing or using a network session.
#[derive(Debug, Error)]
pub enum ConnError {
    /// Host name could not be resolved to an address
    #[error("DNS lookup failed for {host}")]
    Dns {
        host: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Socket could not be created or bound to the local port
    #[error("socket setup failed on local port {local_port}: {source}")]
    Socket {
        local_port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Remote end refused or dropped the TCP connection attempt
    #[error("connection to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// TLS handshake failed for a reason other than certificate validation
    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    /// Server certificate was rejected by the configured trust anchors
    #[error("certificate for {host} rejected: {reason}")]
    TlsVerify { host: String, reason: String },

    /// Read or write on an established session failed
    #[error("session I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded network operation did not complete in time
    #[error("network operation timed out")]
    Timeout,
}

/// Errors raised by the flash layer.
#[derive(Debug, Error)]
pub enum FlashError {
    /// Raw read failed
    #[error("flash read failed at {addr:#08x} ({len} bytes)")]
    Read { addr: u32, len: usize },

    /// Sector erase failed
    #[error("flash erase failed at {addr:#08x}")]
    Erase { addr: u32 },

    /// Raw write failed
    #[error("flash write failed at {addr:#08x} ({len} bytes)")]
    Write { addr: u32, len: usize },

    /// Erase address is not on a sector boundary
    #[error("address {addr:#08x} is not sector aligned")]
    Misaligned { addr: u32 },

    /// Write would leave the target region
    #[error("write of {len} bytes at offset {offset} exceeds region of {size} bytes")]
    OutOfBounds { offset: u32, len: usize, size: u32 },

    /// Write does not continue the current download session
    #[error("write at offset {offset} does not continue the session (expected {expected})")]
    OutOfOrder { offset: u32, expected: u32 },

    /// Finalize requested for a region with no captured first byte
    #[error("no pending first byte for region at sector {start_sector:#x}")]
    NothingPending { start_sector: u32 },
}

/// Errors that can occur during update operations.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Network session error
    #[error(transparent)]
    Connection(#[from] ConnError),

    /// Flash access error
    #[error(transparent)]
    Flash(#[from] FlashError),

    /// Server answered with an unexpected HTTP status
    #[error("server responded with status {status}")]
    Server { status: u16 },

    /// Response violated the expected HTTP shape
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Redirect chain longer than the allowed bound
    #[error("too many redirects (limit {limit})")]
    TooManyRedirects { limit: usize },

    /// Memory sink cannot hold the downloaded content
    #[error("buffer too small: capacity {capacity}, needed {needed}")]
    BufferTooSmall { capacity: usize, needed: usize },

    /// Advertised content larger than the destination allows
    #[error("content of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u32, limit: u32 },

    /// Range download gave up after a failed retry
    #[error("download failed at byte {offset}: {source}")]
    DownloadFailed {
        offset: u32,
        #[source]
        source: Box<UpdateError>,
    },

    /// Downloaded byte count differs from the signed size
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u32, actual: u32 },

    /// Downloaded content does not start with the byte that marks it live
    #[error("content starts with {actual:#04x}, expected {expected:#04x}")]
    BadMagic { expected: u8, actual: u8 },

    /// Image digest does not match the signed digest
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// ECDSA signature did not verify against the publisher key
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Signature asset is truncated or malformed
    #[error("malformed signature file: {0}")]
    MalformedSignature(String),

    /// Public or private key record is malformed
    #[error("invalid key record: {0}")]
    InvalidKey(String),

    /// Version asset is empty or not printable
    #[error("invalid version string: {0}")]
    InvalidVersion(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Persisted state store error
    #[error("state store error: {0}")]
    StoreError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl UpdateError {
    /// Whether the failure is worth one reconnect-and-retry at the point it
    /// occurred.
    ///
    /// Certificate rejection is excluded: retrying against the same anchors
    /// gives the same answer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(
                ConnError::Dns { .. }
                    | ConnError::Socket { .. }
                    | ConnError::Connect { .. }
                    | ConnError::Tls { .. }
                    | ConnError::Io(_)
                    | ConnError::Timeout
            )
        )
    }

    /// Whether the failure came from the signature or hash gate.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. }
                | Self::SignatureInvalid(_)
                | Self::SizeMismatch { .. }
                | Self::BadMagic { .. }
        )
    }
}

impl From<toml::de::Error> for UpdateError {
    fn from(e: toml::de::Error) -> Self {
        UpdateError::ConfigError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(UpdateError::from(ConnError::Timeout).is_transient());
        assert!(UpdateError::from(ConnError::Dns {
            host: "example.com".into(),
            source: None,
        })
        .is_transient());
        assert!(!UpdateError::from(ConnError::TlsVerify {
            host: "example.com".into(),
            reason: "unknown issuer".into(),
        })
        .is_transient());
        assert!(!UpdateError::Server { status: 404 }.is_transient());
        assert!(!UpdateError::Protocol("missing header".into()).is_transient());
    }

    #[test]
    fn test_download_failed_keeps_cause() {
        let err = UpdateError::DownloadFailed {
            offset: 4096,
            source: Box::new(ConnError::Timeout.into()),
        };
        let text = err.to_string();
        assert!(text.contains("4096"));
        assert!(text.contains("timed out"));
    }
}
