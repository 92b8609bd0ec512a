//! Crypto device contract used by the mount state machine.
//!
//! Concrete backends live in their own crates (`volmount-dmcrypt`). The core
//! only needs to turn a container into a block device and back.

use crate::error::VolmountResult;
use crate::mtab::CmtabEntry;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const DEV_MAPPER: &str = "/dev/mapper";

/// Everything a backend needs to expose a container as a decrypted device.
#[derive(Debug, Clone)]
pub struct EhdMountRequest {
    pub container: PathBuf,
    pub mountpoint: Option<PathBuf>,
    pub fs_cipher: Option<String>,
    pub fs_hash: Option<String>,
    pub key: Zeroizing<Vec<u8>>,
    /// Use only this many leading key bytes.
    pub trunc_keysize: Option<usize>,
    pub readonly: bool,
}

impl EhdMountRequest {
    pub fn new(container: impl Into<PathBuf>, key: Zeroizing<Vec<u8>>) -> Self {
        Self {
            container: container.into(),
            mountpoint: None,
            fs_cipher: None,
            fs_hash: None,
            key,
            trunc_keysize: None,
            readonly: false,
        }
    }

    /// Key bytes after truncation.
    pub fn key_material(&self) -> &[u8] {
        match self.trunc_keysize {
            Some(size) if size < self.key.len() => &self.key[..size],
            _ => &self.key,
        }
    }

    pub fn crypto_name(&self) -> String {
        crypto_name(&self.container.to_string_lossy())
    }
}

/// Result of a successful load; exactly what `unload` needs to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EhdMountInfo {
    pub container: PathBuf,
    /// Block device under the mapping: the container itself or its loop device.
    pub lower_device: PathBuf,
    pub loop_device: Option<PathBuf>,
    pub crypto_name: String,
    pub crypto_device: PathBuf,
}

impl EhdMountInfo {
    pub fn to_cmtab(&self, mountpoint: &Path) -> CmtabEntry {
        CmtabEntry {
            mountpoint: mountpoint.to_string_lossy().into_owned(),
            container: self.container.to_string_lossy().into_owned(),
            loop_device: self
                .loop_device
                .as_ref()
                .map(|dev| dev.to_string_lossy().into_owned()),
            crypto_device: Some(self.crypto_device.to_string_lossy().into_owned()),
        }
    }

    /// Rebuild from a cmtab record written by [`EhdMountInfo::to_cmtab`].
    pub fn from_cmtab(entry: &CmtabEntry) -> Self {
        let container = PathBuf::from(&entry.container);
        let loop_device = entry.loop_device.as_ref().map(PathBuf::from);
        let crypto_name = match &entry.crypto_device {
            Some(device) => Path::new(device)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| crypto_name(&entry.container)),
            None => crypto_name(&entry.container),
        };
        let crypto_device = entry
            .crypto_device
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(DEV_MAPPER).join(&crypto_name));
        Self {
            lower_device: loop_device.clone().unwrap_or_else(|| container.clone()),
            container,
            loop_device,
            crypto_name,
            crypto_device,
        }
    }
}

/// Whether `unload` should also release the loop device under the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerDevice {
    Release,
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    Removed,
    /// The mapping was already gone.
    NothingToDo,
}

/// Backend that sets up and tears down crypto mappings.
pub trait CryptoProvider {
    /// Attach the container (via loop if needed) and open the mapping.
    /// Anything allocated before a failure is released again.
    fn load(&self, request: &EhdMountRequest) -> VolmountResult<EhdMountInfo>;

    /// Remove the mapping and, unless told to keep it, the loop device.
    fn unload(&self, info: &EhdMountInfo, lower: LowerDevice) -> VolmountResult<UnloadOutcome>;
}

impl<P: CryptoProvider + ?Sized> CryptoProvider for &P {
    fn load(&self, request: &EhdMountRequest) -> VolmountResult<EhdMountInfo> {
        (**self).load(request)
    }

    fn unload(&self, info: &EhdMountInfo, lower: LowerDevice) -> VolmountResult<UnloadOutcome> {
        (**self).unload(info, lower)
    }
}

/// Device-mapper name for a container: every non-alphanumeric byte becomes `_`.
pub fn crypto_name(container: &str) -> String {
    container
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
