//! Device implementation for running the agent on a host.
//!
//! A restart request is written to a boot record next to the flash image,
//! so the next invocation starts from the slot the update selected.

use std::path::{Path, PathBuf};

use ota_client::{Device, RestartRequest, Slot};
use serde::{Deserialize, Serialize};

/// Contents of the boot record file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRecord {
    /// Slot to boot next
    pub slot: String,

    /// Boot the slot once only (boot-stage install)
    #[serde(default)]
    pub temporary: bool,
}

impl BootRecord {
    /// Read the record at `path`, if one exists.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(toml::from_str(&content)?))
    }

    /// Slot named by the record.
    pub fn slot(&self) -> anyhow::Result<Slot> {
        self.slot.parse().map_err(anyhow::Error::msg)
    }
}

impl From<RestartRequest> for BootRecord {
    fn from(request: RestartRequest) -> Self {
        match request {
            RestartRequest::Boot(slot) => Self {
                slot: slot.to_string(),
                temporary: false,
            },
            RestartRequest::TempBoot(slot) => Self {
                slot: slot.to_string(),
                temporary: true,
            },
        }
    }
}

/// The host running the agent.
#[derive(Debug)]
pub struct HostDevice {
    running: Slot,
    first_boot: bool,
    time_trusted: bool,
    boot_record: PathBuf,
}

impl HostDevice {
    pub fn new(running: Slot, boot_record: PathBuf) -> Self {
        Self {
            running,
            first_boot: false,
            time_trusted: true,
            boot_record,
        }
    }

    pub fn with_first_boot(mut self, first_boot: bool) -> Self {
        self.first_boot = first_boot;
        self
    }

    pub fn with_trusted_time(mut self, trusted: bool) -> Self {
        self.time_trusted = trusted;
        self
    }

    fn write_record(&self, request: RestartRequest) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(&BootRecord::from(request))?;
        std::fs::write(&self.boot_record, content)?;
        Ok(())
    }
}

impl Device for HostDevice {
    fn running_slot(&self) -> Slot {
        self.running
    }

    fn is_first_boot(&self) -> bool {
        self.first_boot
    }

    fn time_is_trusted(&self) -> bool {
        self.time_trusted
    }

    fn restart(&mut self, request: RestartRequest) {
        tracing::info!(
            ?request,
            record = %self.boot_record.display(),
            "Restart requested"
        );
        if let Err(e) = self.write_record(request) {
            tracing::error!("Failed to write boot record: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_restart_writes_boot_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("boot.toml");
        assert!(BootRecord::load(&path).unwrap().is_none());

        let mut device = HostDevice::new(Slot::A, path.clone()).with_trusted_time(false);
        assert!(!device.time_is_trusted());
        device.restart(RestartRequest::TempBoot(Slot::B));

        let record = BootRecord::load(&path).unwrap().unwrap();
        assert!(record.temporary);
        assert_eq!(record.slot().unwrap(), Slot::B);

        device.restart(RestartRequest::Boot(Slot::B));
        let record = BootRecord::load(&path).unwrap().unwrap();
        assert!(!record.temporary);
    }
}
