//! Update availability and image retrieval.
//!
//! An update is described by a small TOML manifest next to the image file:
//!
//! ```toml
//! version = "1.4.0"
//! image = "band-1.4.0.bin"
//! size = 48128
//! crc32 = 0x1C291CA3
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::control::UpdateControl;

/// Manifest file name inside a local update directory.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Read granularity for local fetches; one progress report per chunk.
const FETCH_CHUNK: usize = 4096;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] toml::de::Error),
    #[error("Invalid version string '{0}'")]
    InvalidVersion(String),
    #[error("Downloaded {actual} bytes, manifest says {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("Manifest image '{0}' is not a plain file name")]
    InvalidImagePath(String),
    #[error("Download canceled")]
    Canceled,
}

/// Dotted firmware version, compared numerically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl FirmwareVersion {
    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = SourceError;

    /// Accepts `1`, `1.4` or `1.4.2`, with an optional leading `v`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SourceError::InvalidVersion(s.to_string());
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let mut parts = [0u16; 3];
        let mut count = 0;
        for part in trimmed.split('.') {
            if count == parts.len() {
                return Err(invalid());
            }
            parts[count] = part.parse().map_err(|_| invalid())?;
            count += 1;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = SourceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FirmwareVersion> for String {
    fn from(v: FirmwareVersion) -> Self {
        v.to_string()
    }
}

/// Description of an available firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    pub version: FirmwareVersion,
    /// Image file name, relative to the manifest.
    pub image: String,
    /// Unpadded image size in bytes.
    pub size: usize,
    /// CRC-32/ISO-HDLC of the image.
    #[serde(default)]
    pub crc32: Option<u32>,
}

impl UpdateManifest {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Image location inside `dir`. Only a bare file name is accepted.
    pub fn image_path(&self, dir: &Path) -> Result<PathBuf, SourceError> {
        let name = Path::new(&self.image);
        let mut components = name.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(dir.join(name)),
            _ => Err(SourceError::InvalidImagePath(self.image.clone())),
        }
    }
}

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateAvailability {
    UpToDate { current: FirmwareVersion },
    Available(UpdateManifest),
}

impl UpdateAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, UpdateAvailability::Available(_))
    }
}

/// Where update packages come from.
pub trait UpdateSource: Send {
    /// Manifest of the newest image offered.
    fn latest_manifest(&self) -> Result<UpdateManifest, SourceError>;

    /// Retrieve the image bytes. `progress` receives the fraction done;
    /// a cancel on `control` aborts with [`SourceError::Canceled`].
    fn fetch(
        &self,
        manifest: &UpdateManifest,
        progress: &mut dyn FnMut(f64),
        control: &UpdateControl,
    ) -> Result<Vec<u8>, SourceError>;

    /// Compare the offered image against the running version.
    fn check(&self, current: &FirmwareVersion) -> Result<UpdateAvailability, SourceError> {
        let manifest = self.latest_manifest()?;
        if manifest.version > *current {
            info!(current = %current, latest = %manifest.version, "Update available");
            Ok(UpdateAvailability::Available(manifest))
        } else {
            debug!(current = %current, latest = %manifest.version, "Firmware up to date");
            Ok(UpdateAvailability::UpToDate { current: *current })
        }
    }
}

/// Update packages laid out in a local directory.
#[derive(Debug, Clone)]
pub struct LocalUpdateSource {
    dir: PathBuf,
}

impl LocalUpdateSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl UpdateSource for LocalUpdateSource {
    fn latest_manifest(&self) -> Result<UpdateManifest, SourceError> {
        UpdateManifest::load_from_file(self.dir.join(MANIFEST_FILE))
    }

    fn fetch(
        &self,
        manifest: &UpdateManifest,
        progress: &mut dyn FnMut(f64),
        control: &UpdateControl,
    ) -> Result<Vec<u8>, SourceError> {
        let path = manifest.image_path(&self.dir)?;
        info!(path = %path.display(), "Fetching firmware image");

        let mut file = File::open(&path)?;
        let mut data = Vec::with_capacity(manifest.size);
        let mut buf = [0u8; FETCH_CHUNK];
        loop {
            if control.is_canceled() {
                return Err(SourceError::Canceled);
            }
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if manifest.size > 0 {
                progress((data.len() as f64 / manifest.size as f64).min(1.0));
            }
        }

        if data.len() != manifest.size {
            return Err(SourceError::SizeMismatch {
                expected: manifest.size,
                actual: data.len(),
            });
        }
        progress(1.0);
        Ok(data)
    }
}
