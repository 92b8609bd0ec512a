//! System-backed `CryptoProvider` implementation.
//!
//! Wraps `losetup` for file containers and `cryptsetup` for the mapping.

use crate::command::{CryptsetupCommand, MappingStatus, PlainParams};
use crate::loopdev::LosetupCommand;
use log::{debug, info, warn};
use std::env;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use volmount_core::crypto::{
    CryptoProvider, EhdMountInfo, EhdMountRequest, LowerDevice, UnloadOutcome, DEV_MAPPER,
};
use volmount_core::error::{VolmountError, VolmountResult};
use volmount_core::logging::AUDIT;
use volmount_core::VolmountConfig;

const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];

const DEFAULT_LOSETUP_PATHS: &[&str] = &[
    "/usr/sbin/losetup",
    "/usr/bin/losetup",
    "/sbin/losetup",
    "/bin/losetup",
];

/// Hash used for plain mappings when the volume names none.
const DEFAULT_PLAIN_HASH: &str = "plain";

/// Provider that manages dm-crypt mappings via the host tools.
#[derive(Debug, Clone)]
pub struct SystemDmCryptProvider {
    cryptsetup: CryptsetupCommand,
    losetup: LosetupCommand,
}

impl SystemDmCryptProvider {
    /// Build a provider from configuration, resolving the `cryptsetup` and
    /// `losetup` binaries.
    pub fn from_config(config: &VolmountConfig) -> VolmountResult<Self> {
        let cryptsetup = resolve_binary(
            "cryptsetup",
            config.tools.cryptsetup_path.as_deref(),
            DEFAULT_CRYPTSETUP_PATHS,
        )?;
        let losetup = resolve_binary(
            "losetup",
            config.tools.losetup_path.as_deref(),
            DEFAULT_LOSETUP_PATHS,
        )?;
        debug!(
            "using {} and {}",
            cryptsetup.display(),
            losetup.display()
        );

        Ok(Self {
            cryptsetup: CryptsetupCommand::new(cryptsetup),
            losetup: LosetupCommand::new(losetup),
        })
    }

    fn open(&self, request: &EhdMountRequest, lower: &Path, name: &str) -> VolmountResult<()> {
        let key = request.key_material();
        if self.cryptsetup.is_luks(lower)? {
            debug!("{} has a LUKS header", lower.display());
            return self
                .cryptsetup
                .open_luks(lower, name, key, request.readonly);
        }

        let params = PlainParams {
            cipher: request.fs_cipher.as_deref(),
            hash: request.fs_hash.as_deref().unwrap_or(DEFAULT_PLAIN_HASH),
            key_bits: request.trunc_keysize.map(|bytes| bytes * 8),
        };
        self.cryptsetup
            .open_plain(lower, name, key, &params, request.readonly)
    }
}

impl CryptoProvider for SystemDmCryptProvider {
    fn load(&self, request: &EhdMountRequest) -> VolmountResult<EhdMountInfo> {
        let container = &request.container;
        let meta = fs::metadata(container).map_err(|err| {
            VolmountError::Validation(format!("cannot stat {}: {err}", container.display()))
        })?;

        let loop_device = if meta.file_type().is_block_device() {
            None
        } else {
            let device = self.losetup.attach(container, request.readonly)?;
            info!(
                target: AUDIT,
                "using {} for {}",
                device.display(),
                container.display()
            );
            Some(device)
        };
        let lower_device = loop_device.clone().unwrap_or_else(|| container.clone());

        let crypto_name = request.crypto_name();
        if let Err(err) = self.open(request, &lower_device, &crypto_name) {
            if let Some(device) = &loop_device {
                if let Err(release_err) = self.losetup.release(device) {
                    warn!(
                        target: AUDIT,
                        "could not release {} after failed open: {release_err}",
                        device.display()
                    );
                }
            }
            return Err(err);
        }

        Ok(EhdMountInfo {
            container: container.clone(),
            lower_device,
            loop_device,
            crypto_device: Path::new(DEV_MAPPER).join(&crypto_name),
            crypto_name,
        })
    }

    fn unload(&self, info: &EhdMountInfo, lower: LowerDevice) -> VolmountResult<UnloadOutcome> {
        let lower_device = match self.cryptsetup.mapping_status(&info.crypto_name)? {
            MappingStatus::Active { lower_device } => {
                lower_device.or_else(|| info.loop_device.clone())
            }
            MappingStatus::Inactive => {
                debug!("{} is not active; nothing to do", info.crypto_name);
                return Ok(UnloadOutcome::NothingToDo);
            }
            MappingStatus::Unknown(reason) => return Err(VolmountError::Indeterminate(reason)),
        };

        if !self.cryptsetup.close_mapping(&info.crypto_name)? {
            return Ok(UnloadOutcome::NothingToDo);
        }

        if lower == LowerDevice::Release {
            if let Some(device) = lower_device.filter(|device| *device != info.container) {
                self.losetup.release(&device)?;
            }
        }
        Ok(UnloadOutcome::Removed)
    }
}

fn resolve_binary(
    name: &str,
    configured: Option<&str>,
    defaults: &[&str],
) -> VolmountResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(VolmountError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for candidate in defaults {
        let p = Path::new(candidate);
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }

    find_in_path(name).ok_or_else(|| {
        VolmountError::InvalidConfig(format!(
            "unable to locate {name} binary; tried {defaults:?} and PATH"
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
