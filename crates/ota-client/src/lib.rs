//! # ota-client
//!
//! Secure over-the-air firmware update client for dual-slot flash devices.
//!
//! This crate handles:
//! - Locating release assets through HTTP redirect chains
//! - Chunked `Range` downloads over TCP or TLS, streamed straight into flash
//! - Deferred commit: an image only becomes bootable once verified
//! - SHA-384 / ECDSA P-384 verification against a pinned publisher key
//! - Version discovery, channel selection and the update loop
//!
//! ## Security
//!
//! - Every image is checked against a signature asset before its first byte
//!   is written, so a corrupted or forged image is never booted
//! - Power loss during download or verification leaves the target slot
//!   uncommitted
//! - TLS server certificates are checked against anchors kept in flash
//!   whenever the device clock can be trusted

pub mod artifact;
pub mod channel;
pub mod config;
pub mod connection;
pub mod device;
pub mod download;
pub mod error;
pub mod flash;
pub mod http;
pub mod manager;
#[cfg(test)]
mod proptests;
pub mod publisher;
pub mod redirect;
pub mod store;
pub mod testing;
pub mod trust;
pub mod version;
pub mod writer;

// Re-export main types for convenience
pub use artifact::{hash_region, verify, ImageSignature, ImageVerifier, PublicKey};
pub use channel::UpdateChannel;
pub use config::{FlashLayout, NetworkConfig, OtaConfig, RepositoryConfig, RetryConfig};
pub use connection::{BoxedSession, ConnectionConfig, ConnectionManager, Connector};
pub use device::{Device, RestartRequest, SimulatedDevice, Slot};
pub use download::{DownloadProgress, Downloader, FlashSink, MemorySink, Sink};
pub use error::{ConnError, FlashError, UpdateError};
pub use flash::{select_bank, BankSelection, FlashRegion, FlashStorage, MemFlash};
pub use manager::{AttemptOutcome, UpdateManager, UpdateState};
pub use publisher::PublisherKey;
pub use redirect::{Endpoint, RedirectResolver};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use trust::TrustAnchors;
pub use version::{compare, VersionOrdering};
pub use writer::DeferredCommitWriter;
