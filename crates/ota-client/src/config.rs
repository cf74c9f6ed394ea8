//! Configuration structures for the update client.
//!
//! Defines where firmware is published, how the flash is laid out, and the
//! network and retry behaviour of the update loop.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::artifact::PublicKey;
use crate::channel::UpdateChannel;
use crate::connection::ConnectionConfig;
use crate::error::UpdateError;
use crate::flash::{FlashRegion, SECTOR_SIZE};

/// Where a product's releases are published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository base, `host/owner/product`.
    pub repo: String,

    /// Asset holding the latest release version
    pub version_file: String,

    /// Main firmware image asset
    pub main_file: String,

    /// Boot-stage image asset, when the device manages one
    #[serde(default)]
    pub boot_file: Option<String>,

    /// Asset holding the latest pre-release version
    #[serde(default)]
    pub prerelease_file: Option<String>,

    /// Certificate sector asset
    #[serde(default)]
    pub cert_file: Option<String>,
}

/// Flash layout managed by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashLayout {
    /// Boot slots A and B.
    pub boot: [FlashRegion; 2],

    /// Trust-certificate sectors, if the device keeps any.
    #[serde(default)]
    pub certs: Option<[FlashRegion; 2]>,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            boot: [
                FlashRegion::new(0x002, 0x7E000),
                FlashRegion::new(0x082, 0x7E000),
            ],
            certs: Some([
                FlashRegion::new(0x100, SECTOR_SIZE),
                FlashRegion::new(0x101, SECTOR_SIZE),
            ]),
        }
    }
}

impl FlashLayout {
    fn regions(&self) -> Vec<FlashRegion> {
        let mut regions = self.boot.to_vec();
        if let Some(certs) = self.certs {
            regions.extend(certs);
        }
        regions
    }
}

/// Network behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bound on TCP connect plus TLS handshake, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Bound on each socket read or write, in seconds
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    /// Pause before a reconnect-and-retry, in milliseconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            user_agent: default_user_agent(),
        }
    }
}

impl NetworkConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

/// Pacing of the update loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Pause after a failed attempt, in seconds
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,

    /// Pause after finding the device up to date, in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_secs: default_backoff(),
            check_interval_secs: default_check_interval(),
        }
    }
}

/// Main client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaConfig {
    /// Release repository
    pub repository: RepositoryConfig,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether to wrap connections in TLS
    #[serde(default = "default_true")]
    pub use_tls: bool,

    /// Release channel (stable or prerelease)
    #[serde(default)]
    pub channel: UpdateChannel,

    /// Hex-encoded 120-byte publisher public key record
    pub publisher_key: String,

    /// Flash layout
    #[serde(default)]
    pub layout: FlashLayout,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
}

impl OtaConfig {
    /// Configuration with defaults for everything but the repository and key.
    pub fn new(repository: RepositoryConfig, publisher_key: impl Into<String>) -> Self {
        Self {
            repository,
            port: default_port(),
            use_tls: true,
            channel: UpdateChannel::default(),
            publisher_key: publisher_key.into(),
            layout: FlashLayout::default(),
            network: NetworkConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The publisher key this configuration pins.
    pub fn public_key(&self) -> Result<PublicKey, UpdateError> {
        PublicKey::from_hex(&self.publisher_key)
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<(), UpdateError> {
        let repo = &self.repository;
        if repo.repo.trim().is_empty() {
            return Err(UpdateError::ConfigError("repository is empty".to_string()));
        }
        for (name, value) in [
            ("version_file", Some(&repo.version_file)),
            ("main_file", Some(&repo.main_file)),
            ("boot_file", repo.boot_file.as_ref()),
            ("prerelease_file", repo.prerelease_file.as_ref()),
            ("cert_file", repo.cert_file.as_ref()),
        ] {
            if value.is_some_and(|v| v.trim().is_empty()) {
                return Err(UpdateError::ConfigError(format!("{name} is empty")));
            }
        }

        let regions = self.layout.regions();
        if let Some(region) = regions.iter().find(|r| r.checked_end_address().is_none()) {
            return Err(UpdateError::ConfigError(format!(
                "flash region at sector {:#x} ({} bytes) exceeds the address space",
                region.start_sector, region.size_bytes
            )));
        }
        for (i, region) in regions.iter().enumerate() {
            if region.size_bytes == 0 {
                return Err(UpdateError::ConfigError(format!(
                    "flash region {region} is empty"
                )));
            }
            if let Some(other) = regions[i + 1..].iter().find(|other| region.overlaps(other)) {
                return Err(UpdateError::ConfigError(format!(
                    "flash regions {region} and {other} overlap"
                )));
            }
        }

        if repo.cert_file.is_some() && self.layout.certs.is_none() {
            return Err(UpdateError::ConfigError(
                "cert_file requires certificate sectors in the layout".to_string(),
            ));
        }

        self.public_key()
            .map_err(|e| UpdateError::ConfigError(format!("publisher_key: {e}")))?;
        Ok(())
    }
}

fn default_port() -> u16 {
    443
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_io_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    2000
}

fn default_user_agent() -> String {
    format!("ota-client/{}", env!("CARGO_PKG_VERSION"))
}

fn default_backoff() -> u64 {
    30
}

fn default_check_interval() -> u64 {
    6 * 3600
}
