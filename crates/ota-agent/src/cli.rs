//! CLI command definitions and argument parsing

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ota_client::artifact::SIGNATURE_FILE_LEN;
use ota_client::publisher::PRIVATE_KEY_LEN;
use ota_client::version::compare;
use ota_client::{
    AttemptOutcome, ConnectionManager, FileStore, FlashLayout, OtaConfig, PublisherKey,
    RepositoryConfig, Slot, UpdateError, UpdateManager,
};
use tracing::{info, warn};

use crate::flash_file::FileFlash;
use crate::host_device::{BootRecord, HostDevice};
use crate::ExitCode;

/// OTA agent - secure firmware updates for dual-slot devices
#[derive(Parser, Debug)]
#[command(name = "ota-agent")]
#[command(version, about = "OTA agent - secure firmware updates for dual-slot devices")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> anyhow::Result<ExitCode> {
        match self.command {
            Commands::Run(args) => args.execute().await,
            Commands::Sign(args) => args.execute(),
            Commands::PublicKey(args) => args.execute(),
            Commands::Keygen(args) => args.execute(),
            Commands::InitConfig(args) => args.execute(),
            Commands::Compare { new, old } => {
                println!("{:?}", compare(&new, &old));
                Ok(ExitCode::Success)
            }
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the update loop against a flash image file
    Run(RunArgs),

    /// Produce the signature asset for a firmware image
    Sign(SignArgs),

    /// Print the hex public key record for a private key record
    PublicKey(PublicKeyArgs),

    /// Generate a new publisher key
    Keygen(KeygenArgs),

    /// Write a starter configuration file
    InitConfig(InitConfigArgs),

    /// Compare two version strings
    Compare {
        /// Candidate version
        new: String,
        /// Installed version
        old: String,
    },
}

/// Arguments for `run`
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration file
    #[arg(long, env = "OTA_CONFIG")]
    pub config: PathBuf,

    /// Flash image file (created erased if missing)
    #[arg(long)]
    pub flash: PathBuf,

    /// Persisted state file (installed versions)
    #[arg(long)]
    pub state: PathBuf,

    /// Boot record file (defaults to the flash path with a `.boot.toml` suffix)
    #[arg(long)]
    pub boot_record: Option<PathBuf>,

    /// Running slot (defaults to the boot record, then slot a)
    #[arg(long)]
    pub slot: Option<Slot>,

    /// Treat this as the first boot after flashing
    #[arg(long)]
    pub first_boot: bool,

    /// The clock cannot be trusted; skip certificate validation
    #[arg(long)]
    pub untrusted_clock: bool,

    /// Make a single attempt instead of looping until a restart
    #[arg(long)]
    pub once: bool,
}

impl RunArgs {
    pub async fn execute(self) -> anyhow::Result<ExitCode> {
        let config = match OtaConfig::load_from_file(&self.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {e}");
                return Ok(ExitCode::InvalidInput);
            }
        };

        let boot_record = self
            .boot_record
            .clone()
            .unwrap_or_else(|| suffixed(&self.flash, ".boot.toml"));
        let slot = match self.slot {
            Some(slot) => slot,
            None => match BootRecord::load(&boot_record)? {
                Some(record) => record.slot()?,
                None => Slot::A,
            },
        };
        info!("Running from slot {}", slot);

        let flash = FileFlash::open(&self.flash, flash_size(&config.layout))
            .with_context(|| format!("opening flash image {}", self.flash.display()))?;
        let store = FileStore::open(&self.state)?;
        let connector = ConnectionManager::new(config.network.connection_config())?;
        let device = HostDevice::new(slot, boot_record)
            .with_first_boot(self.first_boot)
            .with_trusted_time(!self.untrusted_clock);

        let mut manager = match UpdateManager::new(
            config,
            Box::new(connector),
            Box::new(flash),
            Box::new(store),
            Box::new(device),
        ) {
            Ok(manager) => manager,
            Err(e) => {
                eprintln!("Error: {e}");
                return Ok(ExitCode::InvalidInput);
            }
        };
        info!("Installed version {}", manager.installed_version());

        if !self.once {
            let request = manager.run().await;
            println!("Restart requested: {request:?}");
            return Ok(ExitCode::Success);
        }

        match manager.run_once().await {
            Ok(AttemptOutcome::UpToDate) => {
                println!("Up to date ({})", manager.installed_version());
                Ok(ExitCode::Success)
            }
            Ok(AttemptOutcome::Rebooting(request)) => {
                println!("Restart requested: {request:?}");
                Ok(ExitCode::Success)
            }
            Err(e) => {
                eprintln!("Error: {e}");
                Ok(ExitCode::from(&e))
            }
        }
    }
}

/// Arguments for `sign`
#[derive(Args, Debug)]
pub struct SignArgs {
    /// Private key record file
    #[arg(long, env = "OTA_SIGNING_KEY")]
    pub key: PathBuf,

    /// Firmware image to sign
    #[arg(long)]
    pub image: PathBuf,

    /// Output file (defaults to the image path with a `.sig` suffix)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

impl SignArgs {
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        let key = load_key(&self.key)?;
        let image = std::fs::read(&self.image)
            .with_context(|| format!("reading image {}", self.image.display()))?;
        if image.is_empty() {
            eprintln!("Error: image {} is empty", self.image.display());
            return Ok(ExitCode::InvalidInput);
        }

        let signature = key.sign_image(&image)?;
        let out = self.out.unwrap_or_else(|| suffixed(&self.image, ".sig"));
        std::fs::write(&out, signature.to_bytes())?;

        info!(
            size = signature.size,
            hash = %hex::encode(signature.hash),
            "Signed image"
        );
        println!("Wrote {} ({} bytes)", out.display(), SIGNATURE_FILE_LEN);
        Ok(ExitCode::Success)
    }
}

/// Arguments for `public-key`
#[derive(Args, Debug)]
pub struct PublicKeyArgs {
    /// Private key record file
    #[arg(long, env = "OTA_SIGNING_KEY")]
    pub key: PathBuf,
}

impl PublicKeyArgs {
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        let key = load_key(&self.key)?;
        println!("{}", hex::encode(key.public_record()));
        Ok(ExitCode::Success)
    }
}

/// Arguments for `keygen`
#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Where to write the private key record
    #[arg(long)]
    pub out: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

impl KeygenArgs {
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        if self.out.exists() && !self.force {
            eprintln!(
                "Error: {} exists (use --force to overwrite)",
                self.out.display()
            );
            return Ok(ExitCode::InvalidInput);
        }

        let key = PublisherKey::generate();
        std::fs::write(&self.out, key.to_record())?;
        println!("Wrote {} ({} bytes)", self.out.display(), PRIVATE_KEY_LEN);
        println!("Public key: {}", hex::encode(key.public_record()));
        Ok(ExitCode::Success)
    }
}

/// Arguments for `init-config`
#[derive(Args, Debug)]
pub struct InitConfigArgs {
    /// Where to write the configuration
    #[arg(long)]
    pub out: PathBuf,

    /// Repository base, `host/owner/product`
    #[arg(long)]
    pub repo: String,

    /// Hex public key record to pin
    #[arg(long)]
    pub public_key: String,

    /// Version asset name
    #[arg(long, default_value = "version.txt")]
    pub version_file: String,

    /// Main image asset name
    #[arg(long, default_value = "firmware.bin")]
    pub main_file: String,

    /// Boot-stage image asset name
    #[arg(long)]
    pub boot_file: Option<String>,
}

impl InitConfigArgs {
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        let repository = RepositoryConfig {
            repo: self.repo,
            version_file: self.version_file,
            main_file: self.main_file,
            boot_file: self.boot_file,
            prerelease_file: None,
            cert_file: None,
        };
        let config = OtaConfig::new(repository, self.public_key);
        if let Err(e) = config.validate() {
            eprintln!("Error: {e}");
            return Ok(ExitCode::InvalidInput);
        }
        config.save_to_file(&self.out)?;
        println!("Wrote {}", self.out.display());
        Ok(ExitCode::Success)
    }
}

fn load_key(path: &Path) -> anyhow::Result<PublisherKey> {
    let record =
        std::fs::read(path).with_context(|| format!("reading key {}", path.display()))?;
    Ok(PublisherKey::from_record(&record)?)
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Smallest flash image holding every region of `layout`.
pub fn flash_size(layout: &FlashLayout) -> u32 {
    let boot = layout.boot.iter();
    let certs = layout.certs.iter().flatten();
    let size = boot.chain(certs).map(|r| r.end_address()).max().unwrap_or(0);
    if size == 0 {
        warn!("Flash layout is empty");
    }
    size
}

impl From<&UpdateError> for ExitCode {
    fn from(e: &UpdateError) -> Self {
        if e.is_verification_failure() {
            return ExitCode::VerificationFailed;
        }
        match e {
            UpdateError::Connection(_)
            | UpdateError::Server { .. }
            | UpdateError::Protocol(_)
            | UpdateError::TooManyRedirects { .. }
            | UpdateError::DownloadFailed { .. } => ExitCode::ConnectionFailed,
            UpdateError::ConfigError(_) | UpdateError::InvalidKey(_) => ExitCode::InvalidInput,
            _ => ExitCode::GeneralError,
        }
    }
}
