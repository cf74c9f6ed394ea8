//! Update channel selection.
//!
//! # Channels
//!
//! - **Stable**: only releases strictly newer than the installed version
//! - **PreRelease**: additionally tracks the repository's pre-release
//!   version; a pre-release is installed whenever it differs from what is
//!   installed
//!
//! Pre-release ordering is deliberately not numeric: [`compare`] always
//! ranks a pre-release below a release, so the channel flag is what lets a
//! device move onto one.

use serde::{Deserialize, Serialize};

use crate::version::{compare, is_prerelease, VersionOrdering};

/// Release track followed by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    /// Tagged releases only
    #[default]
    Stable,
    /// Releases and pre-releases
    PreRelease,
}

impl UpdateChannel {
    /// Whether `latest` should replace `installed` on this channel.
    pub fn should_install(&self, latest: &str, installed: &str) -> bool {
        match self {
            Self::PreRelease if is_prerelease(latest) => latest != installed,
            _ => compare(latest, installed) == VersionOrdering::Newer,
        }
    }
}

impl std::fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::PreRelease => write!(f, "prerelease"),
        }
    }
}

impl std::str::FromStr for UpdateChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Ok(Self::Stable),
            "prerelease" | "pre-release" | "beta" => Ok(Self::PreRelease),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}
