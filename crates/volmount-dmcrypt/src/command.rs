//! Execution wrapper for invoking `cryptsetup`.
//!
//! Key material always travels over stdin (`--key-file -`); it never shows
//! up in argv.

use log::debug;
use std::path::{Path, PathBuf};
use volmount_core::crypto::DEV_MAPPER;
use volmount_core::error::{VolmountError, VolmountResult};
use volmount_core::spawn::{self, ExitReport, Identity};

#[derive(Debug, Clone)]
pub(crate) struct CryptsetupCommand {
    binary: PathBuf,
}

/// What `cryptsetup status` tells us about a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MappingStatus {
    Active { lower_device: Option<PathBuf> },
    Inactive,
    Unknown(String),
}

/// Parameters of a plain (header-less) dm-crypt mapping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlainParams<'a> {
    pub cipher: Option<&'a str>,
    pub hash: &'a str,
    pub key_bits: Option<usize>,
}

impl CryptsetupCommand {
    pub(crate) fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Does `device` carry a LUKS header?
    pub(crate) fn is_luks(&self, device: &Path) -> VolmountResult<bool> {
        let device = device.to_string_lossy().into_owned();
        let out = self.run(&["isLuks", device.as_str()], None)?;
        match out.status {
            0 => Ok(true),
            1 => Ok(false),
            status => Err(VolmountError::ToolFailed {
                tool: "cryptsetup isLuks".to_string(),
                status,
                diagnostic: describe(&out.diagnostic()),
            }),
        }
    }

    pub(crate) fn open_luks(
        &self,
        device: &Path,
        name: &str,
        key: &[u8],
        readonly: bool,
    ) -> VolmountResult<()> {
        let device = device.to_string_lossy().into_owned();
        let mut options = vec!["--batch-mode", "--key-file", "-"];
        if readonly {
            options.push("--readonly");
        }

        let mut primary = vec!["open", "--type", "luks"];
        primary.extend(&options);
        primary.extend([device.as_str(), name]);

        let mut fallback = vec!["luksOpen"];
        fallback.extend(&options);
        fallback.extend([device.as_str(), name]);

        self.open_mapping(&primary, &fallback, key, name, &device, "LUKS")
    }

    pub(crate) fn open_plain(
        &self,
        device: &Path,
        name: &str,
        key: &[u8],
        params: &PlainParams<'_>,
        readonly: bool,
    ) -> VolmountResult<()> {
        let device = device.to_string_lossy().into_owned();
        let key_bits = params.key_bits.map(|bits| bits.to_string());

        let mut options = vec!["--batch-mode", "--key-file", "-", "--hash", params.hash];
        if let Some(cipher) = params.cipher {
            options.extend(["--cipher", cipher]);
        }
        if let Some(bits) = key_bits.as_deref() {
            options.extend(["--key-size", bits]);
        }
        if readonly {
            options.push("--readonly");
        }

        let mut primary = vec!["open", "--type", "plain"];
        primary.extend(&options);
        primary.extend([device.as_str(), name]);

        // Pre-1.6 syntax puts the mapping name first.
        let mut fallback = vec!["create"];
        fallback.extend(&options);
        fallback.extend([name, device.as_str()]);

        self.open_mapping(&primary, &fallback, key, name, &device, "plain")
    }

    pub(crate) fn mapping_status(&self, name: &str) -> VolmountResult<MappingStatus> {
        let out = self.run(&["status", name], None)?;
        Ok(classify_status(name, &out))
    }

    /// Remove a mapping. Returns false when it was already gone.
    pub(crate) fn close_mapping(&self, name: &str) -> VolmountResult<bool> {
        let mut out = self.run(&["close", name], None)?;
        if out.status != 0 && action_unsupported(&out) {
            out = self.run(&["remove", name], None)?;
        }

        if out.status == 0 {
            return Ok(true);
        }

        let diagnostic = out.diagnostic();
        let diagnostic_lower = diagnostic.to_ascii_lowercase();
        if diagnostic_lower.contains("does not exist")
            || diagnostic_lower.contains("doesn't exist")
            || diagnostic_lower.contains("not active")
        {
            return Ok(false);
        }

        let message = classify_close_failure(name, &diagnostic);
        Err(VolmountError::Provider(format!(
            "{message} (exit code {})",
            out.status
        )))
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> VolmountResult<ExitReport> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.binary.to_string_lossy().into_owned());
        argv.extend(args.iter().map(|arg| arg.to_string()));
        let out = spawn::run(&argv, &Identity::Inherit, input, &[])?;
        if out.status != 0 {
            debug!("cryptsetup {} exited with {}", args[0], out.status);
        }
        Ok(out)
    }

    fn open_mapping(
        &self,
        primary: &[&str],
        fallback: &[&str],
        key: &[u8],
        name: &str,
        source: &str,
        mode: &str,
    ) -> VolmountResult<()> {
        let mut out = self.run(primary, Some(key))?;

        if out.status != 0 && action_unsupported(&out) {
            out = self.run(fallback, Some(key))?;
        }

        if out.status == 0 {
            return Ok(());
        }

        let message = classify_open_failure(name, source, mode, &out.diagnostic());
        Err(VolmountError::Provider(format!(
            "{message} (exit code {})",
            out.status
        )))
    }
}

fn dev_mapper_node_exists(name: &str) -> bool {
    let root = Path::new(DEV_MAPPER);
    root.is_dir() && root.join(name).exists()
}

fn action_unsupported(output: &ExitReport) -> bool {
    let diagnostic_lower = output.diagnostic().to_ascii_lowercase();
    diagnostic_lower.contains("unknown action")
        || diagnostic_lower.contains("unknown command")
        || diagnostic_lower.contains("invalid action")
        || diagnostic_lower.contains("invalid command")
        || diagnostic_lower.contains("unknown option")
}

fn describe(diagnostic: &str) -> String {
    let trimmed = diagnostic.trim();
    if trimmed.is_empty() {
        "no additional output".to_string()
    } else {
        trimmed.to_string()
    }
}

fn classify_open_failure(name: &str, source: &str, mode: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("keyslot")
        || lower.contains("key slot")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        return format!(
            "cryptsetup rejected the key for {mode} mapping `{name}` from `{source}`: {diagnostic}. Check the login password or the key file"
        );
    }

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return format!(
            "cryptsetup could not open {mode} mapping `{name}` from `{source}`: {diagnostic}. Setting up dm-crypt mappings requires root"
        );
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
    {
        return format!(
            "cryptsetup could not access `{source}` for mapping `{name}`: {diagnostic}"
        );
    }

    if lower.contains("already exists") && dev_mapper_node_exists(name) {
        return format!(
            "mapping `{name}` is already active under {DEV_MAPPER}; cryptsetup reported: {diagnostic}"
        );
    }

    format!("cryptsetup failed to open {mode} mapping `{name}` from `{source}`: {diagnostic}")
}

fn classify_close_failure(name: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = describe(diagnostic);

    if lower.contains("device or resource busy") || lower.contains("is busy") {
        return format!(
            "cryptsetup could not close mapping `{name}`: {diagnostic}. It is probably still mounted"
        );
    }

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
    {
        return format!(
            "cryptsetup could not close mapping `{name}`: {diagnostic}. Removing dm-crypt mappings requires root"
        );
    }

    format!("cryptsetup failed to close mapping `{name}`: {diagnostic}")
}

fn classify_status(name: &str, output: &ExitReport) -> MappingStatus {
    match output.status {
        0 => {
            return MappingStatus::Active {
                lower_device: parse_status_device(&output.stdout),
            }
        }
        4 => return MappingStatus::Inactive,
        _ => {}
    }

    let diagnostic = output.diagnostic();
    let diagnostic_lower = diagnostic.to_ascii_lowercase();

    if diagnostic_lower.contains("is inactive")
        || diagnostic_lower.contains("not active")
        || diagnostic_lower.contains("does not exist")
        || diagnostic_lower.contains("doesn't exist")
    {
        return MappingStatus::Inactive;
    }

    MappingStatus::Unknown(if diagnostic.is_empty() {
        format!(
            "cryptsetup status {name} exited with code {}",
            output.status
        )
    } else {
        format!(
            "cryptsetup status {name} exited with code {}: {}",
            output.status, diagnostic
        )
    })
}

/// Pull the `device:` line out of `cryptsetup status` output.
fn parse_status_device(stdout: &str) -> Option<PathBuf> {
    stdout.lines().find_map(|line| {
        let value = line.trim_start().strip_prefix("device:")?.trim();
        (!value.is_empty()).then(|| PathBuf::from(value))
    })
}
