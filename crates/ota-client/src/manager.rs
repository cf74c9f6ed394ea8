//! Update manager - orchestrates the complete update flow.
//!
//! One attempt walks the pipeline below and either finds the device up to
//! date, restarts it into a freshly installed image, or fails:
//!
//! 1. Refresh the TLS trust anchors (and rotate them when a new certificate
//!    sector is published)
//! 2. Discover the latest version
//! 3. Pick at most one image to install: the boot stage when it is behind,
//!    otherwise the main image
//! 4. Download the signature asset into memory
//! 5. Stream the image into the slot the device is not running from
//! 6. Verify it with the first byte still deferred
//! 7. Commit the first byte, persist the version and restart
//!
//! A region is only ever finalized after step 6 succeeded. Any failure
//! before that leaves it uncommitted.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::artifact::{hash_region, ImageSignature, ImageVerifier, SIGNATURE_FILE_LEN};
use crate::channel::UpdateChannel;
use crate::config::OtaConfig;
use crate::connection::Connector;
use crate::device::{Device, RestartRequest, Slot};
use crate::download::{Downloader, FlashSink, MemorySink};
use crate::error::UpdateError;
use crate::flash::{
    select_bank, BankSelection, FlashRegion, FlashStorage, CERT_MAGIC, IMAGE_MAGIC,
};
use crate::redirect::{Endpoint, RedirectResolver};
use crate::store::{KeyValueStore, BOOT_VERSION_KEY, MAIN_VERSION_KEY};
use crate::trust;
use crate::version::{compare, is_prerelease, VersionOrdering};
use crate::writer::DeferredCommitWriter;

/// Largest accepted version asset.
pub const VERSION_MAX_LEN: u32 = 64;

/// Version assumed when nothing has been recorded yet.
pub const UNKNOWN_VERSION: &str = "0.0.0";

/// Current state of the update manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpdateState {
    /// Idle, no attempt in progress
    #[default]
    Idle,
    /// Fetching the latest version
    DiscoveringVersion,
    /// Fetching the signature asset
    DownloadingSignature,
    /// Streaming the image into flash
    DownloadingImage,
    /// Hashing and checking the signature
    Verifying,
    /// Committing the first byte and recording the version
    Finalizing,
    /// Restart requested
    Rebooting,
    /// The last attempt failed
    Failed(String),
}

/// Which of the two images an attempt installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// The application image
    Main,
    /// The boot-stage image that installs itself on a temporary boot
    BootStage,
}

impl ImageKind {
    fn version_key(self) -> &'static str {
        match self {
            Self::Main => MAIN_VERSION_KEY,
            Self::BootStage => BOOT_VERSION_KEY,
        }
    }

    fn restart(self, slot: Slot) -> RestartRequest {
        match self {
            Self::Main => RestartRequest::Boot(slot),
            Self::BootStage => RestartRequest::TempBoot(slot),
        }
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main => write!(f, "main image"),
            Self::BootStage => write!(f, "boot stage"),
        }
    }
}

/// The image chosen for this attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTarget {
    pub kind: ImageKind,
    pub version: String,
    /// Asset name in the release.
    pub file: String,
    /// Slot the image is written to.
    pub slot: Slot,
    pub region: FlashRegion,
}

/// How an attempt ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Nothing newer to install
    UpToDate,
    /// An image was installed and the device asked to restart
    Rebooting(RestartRequest),
}

/// Main update manager that orchestrates the complete update flow.
///
/// # Example
///
/// ```ignore
/// use ota_client::manager::UpdateManager;
///
/// let mut manager = UpdateManager::new(config, connector, flash, store, device)?;
/// let request = manager.run().await;
/// ```
pub struct UpdateManager {
    /// Configuration
    config: OtaConfig,
    /// Opens sessions to the release server
    connector: Box<dyn Connector>,
    /// Flash writer owning the device flash
    writer: DeferredCommitWriter<Box<dyn FlashStorage>>,
    /// Installed version records
    store: Box<dyn KeyValueStore>,
    /// Boot slot, clock trust and restart control
    device: Box<dyn Device>,
    /// Signature checks against the pinned publisher key
    verifier: ImageVerifier,
    /// Current state
    state: UpdateState,
}

impl UpdateManager {
    /// Create an update manager.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration does not validate
    /// - A configured region lies beyond the end of `flash`
    pub fn new(
        config: OtaConfig,
        connector: Box<dyn Connector>,
        flash: Box<dyn FlashStorage>,
        store: Box<dyn KeyValueStore>,
        device: Box<dyn Device>,
    ) -> Result<Self, UpdateError> {
        config.validate()?;

        let capacity = flash.capacity();
        let regions = config
            .layout
            .boot
            .iter()
            .chain(config.layout.certs.iter().flatten());
        for region in regions {
            if region.end_address() > capacity {
                return Err(UpdateError::ConfigError(format!(
                    "flash region {region} ends beyond flash of {capacity} bytes"
                )));
            }
        }

        let verifier = ImageVerifier::new(config.public_key()?);
        Ok(Self {
            config,
            connector,
            writer: DeferredCommitWriter::new(flash),
            store,
            device,
            verifier,
            state: UpdateState::Idle,
        })
    }

    /// Get the current state of the update manager.
    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    /// Get the configuration.
    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    /// Installed main image version.
    pub fn installed_version(&self) -> String {
        self.recorded_version(ImageKind::Main)
    }

    /// Run attempts until one restarts the device.
    ///
    /// A failed attempt is retried after `retry.backoff_secs`; an up-to-date
    /// device is checked again after `retry.check_interval_secs`.
    pub async fn run(&mut self) -> RestartRequest {
        loop {
            let pause = match self.run_once().await {
                Ok(AttemptOutcome::Rebooting(request)) => return request,
                Ok(AttemptOutcome::UpToDate) => {
                    Duration::from_secs(self.config.retry.check_interval_secs)
                }
                Err(_) => Duration::from_secs(self.config.retry.backoff_secs),
            };
            debug!("Next update attempt in {:?}", pause);
            tokio::time::sleep(pause).await;
        }
    }

    /// Run a single update attempt.
    pub async fn run_once(&mut self) -> Result<AttemptOutcome, UpdateError> {
        self.state = UpdateState::Idle;
        let result = self.attempt().await;
        if let Err(e) = &result {
            error!("Update attempt failed: {}", e);
            self.state = UpdateState::Failed(e.to_string());
        }
        result
    }

    async fn attempt(&mut self) -> Result<AttemptOutcome, UpdateError> {
        self.refresh_trust_anchors()?;
        if self.config.repository.cert_file.is_some() {
            if let Err(e) = self.update_certificates().await {
                warn!("Certificate update failed: {}", e);
            }
        }

        let latest = self.discover_version().await?;
        let Some(target) = self.select_target(&latest) else {
            info!("Up to date (installed {})", self.installed_version());
            self.state = UpdateState::Idle;
            return Ok(AttemptOutcome::UpToDate);
        };

        let request = self.install(&target).await?;
        Ok(AttemptOutcome::Rebooting(request))
    }

    /// Point the connector at the anchors in the live certificate sector.
    ///
    /// Verification needs both anchors and a trusted clock; anything less
    /// selects the no-verify mode.
    fn refresh_trust_anchors(&mut self) -> Result<(), UpdateError> {
        let anchors = match self.config.layout.certs {
            Some(bank) if self.device.time_is_trusted() => {
                trust::load_active(self.writer.flash(), bank)?
            }
            Some(_) => {
                debug!("Clock not trusted, skipping certificate validation");
                None
            }
            None => None,
        };
        info!(
            "TLS trust mode: {}",
            if anchors.is_some() { "verify" } else { "no-verify" }
        );
        self.connector.set_trust_anchors(anchors);
        Ok(())
    }

    /// Install a newly published certificate sector, if there is one.
    ///
    /// Returns whether the anchors changed.
    pub async fn update_certificates(&mut self) -> Result<bool, UpdateError> {
        let (Some(file), Some(bank)) = (
            self.config.repository.cert_file.clone(),
            self.config.layout.certs,
        ) else {
            return Ok(false);
        };

        let signature = self
            .fetch_signature(&format!("releases/latest/download/{file}.sig"))
            .await?;

        let (target, previous) = match select_bank(self.writer.flash(), bank, CERT_MAGIC)? {
            BankSelection::Selected { active, backup } => {
                if signature.size <= active.0.size_bytes {
                    let digest = hash_region(self.writer.flash(), active.0, signature.size, None)?;
                    if digest == signature.hash {
                        debug!("Certificate sector {} is current", active.0);
                        return Ok(false);
                    }
                }
                (backup.0, Some(active.0))
            }
            BankSelection::Disabled => (bank[0], None),
        };

        info!("Installing new certificate sector into {}", target);
        let asset = format!("releases/latest/download/{file}");
        self.stream_and_verify(&asset, target, &signature, CERT_MAGIC)
            .await?;
        self.writer.finalize(target)?;
        if let Some(previous) = previous {
            self.writer.invalidate(previous)?;
        }

        self.refresh_trust_anchors()?;
        Ok(true)
    }

    /// Fetch the version to compare against the installed one.
    pub async fn discover_version(&mut self) -> Result<String, UpdateError> {
        self.state = UpdateState::DiscoveringVersion;
        let installed = self.installed_version();

        let release_file = self.config.repository.version_file.clone();
        let mut latest = self
            .fetch_version(&format!("releases/latest/download/{release_file}"))
            .await?;
        info!("Latest release: {}", latest);

        if self.config.channel == UpdateChannel::PreRelease {
            if let Some(file) = self.config.repository.prerelease_file.clone() {
                match self
                    .fetch_version(&format!("releases/latest/download/{file}"))
                    .await
                {
                    Ok(pre) if supersedes(&pre, &latest) => {
                        info!("Latest pre-release: {}", pre);
                        latest = pre;
                    }
                    Ok(pre) => debug!("Pre-release {} is behind release {}", pre, latest),
                    Err(e) => warn!("No pre-release version available: {}", e),
                }
            }
        }

        if self.device.is_first_boot() && compare(&latest, &installed) == VersionOrdering::Older
        {
            info!(
                "First boot: keeping installed {} over published {}",
                installed, latest
            );
            latest = installed;
        }

        Ok(latest)
    }

    /// Decide which image, if any, to install for `latest`.
    pub fn select_target(&self, latest: &str) -> Option<UpdateTarget> {
        let channel = self.config.channel;
        let repository = &self.config.repository;
        let slot = self.device.running_slot().other();
        let region = self.config.layout.boot[slot.index()];

        let boot_stage = repository.boot_file.as_ref().filter(|_| {
            channel.should_install(latest, &self.recorded_version(ImageKind::BootStage))
        });
        let (kind, file) = match boot_stage {
            Some(file) => (ImageKind::BootStage, file),
            None if channel.should_install(latest, &self.installed_version()) => {
                (ImageKind::Main, &repository.main_file)
            }
            None => return None,
        };

        Some(UpdateTarget {
            kind,
            version: latest.to_string(),
            file: file.clone(),
            slot,
            region,
        })
    }

    /// Install `target` and request the restart into it.
    pub async fn install(&mut self, target: &UpdateTarget) -> Result<RestartRequest, UpdateError> {
        info!(
            "Installing {} {} into slot {} ({})",
            target.kind, target.version, target.slot, target.region
        );

        self.state = UpdateState::DownloadingSignature;
        let base = format!("releases/download/{}/{}", target.version, target.file);
        let signature = self.fetch_signature(&format!("{base}.sig")).await?;

        self.stream_and_verify(&base, target.region, &signature, IMAGE_MAGIC)
            .await?;

        self.state = UpdateState::Finalizing;
        self.writer.finalize(target.region)?;
        self.store
            .set(target.kind.version_key(), &target.version)?;
        info!("{} {} committed", target.kind, target.version);

        self.state = UpdateState::Rebooting;
        let request = target.kind.restart(target.slot);
        self.device.restart(request);
        Ok(request)
    }

    /// Download `asset` into `region` and verify it against `signature`.
    ///
    /// On success the region holds the image with its first byte still
    /// pending. A failure after the first byte was captured invalidates the
    /// region; a failure before that leaves it untouched.
    async fn stream_and_verify(
        &mut self,
        asset: &str,
        region: FlashRegion,
        signature: &ImageSignature,
        live: u8,
    ) -> Result<(), UpdateError> {
        if signature.size == 0 {
            return Err(UpdateError::MalformedSignature(
                "signed size is zero".to_string(),
            ));
        }
        if signature.size > region.size_bytes {
            return Err(UpdateError::TooLarge {
                size: signature.size,
                limit: region.size_bytes,
            });
        }

        let result = self.stream_into(asset, region, signature, live).await;
        if let Err(e) = &result {
            if self.writer.pending_first_byte(region).is_some() {
                warn!("Discarding {}: {}", region, e);
                self.writer.invalidate(region)?;
            }
        }
        result
    }

    async fn stream_into(
        &mut self,
        asset: &str,
        region: FlashRegion,
        signature: &ImageSignature,
        live: u8,
    ) -> Result<(), UpdateError> {
        self.state = UpdateState::DownloadingImage;
        let endpoint = self.locate(asset).await?;
        let received = Downloader::new(self.connector.as_mut(), &self.config.network)
            .download(
                &endpoint,
                &mut FlashSink::new(&mut self.writer, region),
                region.size_bytes,
            )
            .await?;
        if received != signature.size {
            return Err(UpdateError::SizeMismatch {
                expected: signature.size,
                actual: received,
            });
        }

        let first = self.writer.pending_first_byte(region);
        if first != Some(live) {
            return Err(UpdateError::BadMagic {
                expected: live,
                actual: first.unwrap_or(crate::flash::SENTINEL_UNCOMMITTED),
            });
        }

        self.state = UpdateState::Verifying;
        self.verifier
            .verify_region(self.writer.flash(), region, signature, first)?;
        info!("Verified {} bytes in {}", received, region);
        Ok(())
    }

    async fn fetch_signature(&mut self, asset: &str) -> Result<ImageSignature, UpdateError> {
        let mut buf = [0u8; SIGNATURE_FILE_LEN];
        let len = self.fetch_small(asset, &mut buf).await?;
        ImageSignature::from_bytes(&buf[..len])
    }

    async fn fetch_version(&mut self, asset: &str) -> Result<String, UpdateError> {
        let mut buf = [0u8; VERSION_MAX_LEN as usize];
        let len = self.fetch_small(asset, &mut buf).await?;
        parse_version(&buf[..len])
    }

    /// Download a small asset into `buf`, returning its length.
    async fn fetch_small(&mut self, asset: &str, buf: &mut [u8]) -> Result<usize, UpdateError> {
        let endpoint = self.locate(asset).await?;
        let limit = buf.len() as u32;
        let mut sink = MemorySink::new(buf);
        let len = Downloader::new(self.connector.as_mut(), &self.config.network)
            .download(&endpoint, &mut sink, limit)
            .await?;
        Ok(len as usize)
    }

    async fn locate(&mut self, asset: &str) -> Result<Endpoint, UpdateError> {
        RedirectResolver::new(self.connector.as_mut(), &self.config.network)
            .resolve(
                &self.config.repository.repo,
                asset,
                self.config.port,
                self.config.use_tls,
            )
            .await
    }

    fn recorded_version(&self, kind: ImageKind) -> String {
        self.store
            .get(kind.version_key())
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
    }
}

/// Trim a version asset and reject anything that is not a printable token.
fn parse_version(bytes: &[u8]) -> Result<String, UpdateError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| UpdateError::InvalidVersion("not UTF-8".to_string()))?
        .trim();
    if text.is_empty() {
        return Err(UpdateError::InvalidVersion("empty".to_string()));
    }
    if !text.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(UpdateError::InvalidVersion(format!("{text:?}")));
    }
    Ok(text.to_string())
}

/// Whether pre-release `pre` is ahead of release `release`.
///
/// The numbers in front of the suffix decide: `2.1.0-rc1` supersedes
/// `2.0.0`, while `2.0.0-rc1` is behind the `2.0.0` release.
fn supersedes(pre: &str, release: &str) -> bool {
    if !is_prerelease(pre) {
        return compare(pre, release) == VersionOrdering::Newer;
    }
    let base = pre.split('-').next().unwrap_or(pre);
    compare(base, release) == VersionOrdering::Newer
}
