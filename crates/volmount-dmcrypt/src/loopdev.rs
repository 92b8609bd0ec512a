//! Loop device allocation through `losetup`.

use log::debug;
use std::path::{Path, PathBuf};
use volmount_core::error::{VolmountError, VolmountResult};
use volmount_core::spawn::{self, Identity};

#[derive(Debug, Clone)]
pub(crate) struct LosetupCommand {
    binary: PathBuf,
}

impl LosetupCommand {
    pub(crate) fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Bind `file` to the first free loop device and return its node.
    pub(crate) fn attach(&self, file: &Path, readonly: bool) -> VolmountResult<PathBuf> {
        let file = file.to_string_lossy().into_owned();
        let mut args = vec!["--find", "--show"];
        if readonly {
            args.push("--read-only");
        }
        args.push(file.as_str());

        let out = self.run(&args)?;
        if out.status == 0 {
            let device = out.stdout.trim();
            if device.is_empty() {
                return Err(VolmountError::Provider(format!(
                    "losetup attached {file} but did not print a device"
                )));
            }
            debug!("{file} attached to {device}");
            return Ok(PathBuf::from(device));
        }

        let diagnostic = out.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("free loop") || lower.contains("unused loop") {
            return Err(VolmountError::ResourceExhausted(format!(
                "no free loop device for {file}"
            )));
        }
        Err(VolmountError::ToolFailed {
            tool: "losetup".to_string(),
            status: out.status,
            diagnostic,
        })
    }

    /// Detach `device`. Returns false when it was not attached or not a loop
    /// device at all.
    pub(crate) fn release(&self, device: &Path) -> VolmountResult<bool> {
        let device = device.to_string_lossy().into_owned();
        let out = self.run(&["--detach", device.as_str()])?;
        if out.status == 0 {
            return Ok(true);
        }

        let diagnostic = out.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("no such device")
            || lower.contains("inappropriate ioctl")
            || lower.contains("not a loop")
        {
            debug!("{device} was not attached: {diagnostic}");
            return Ok(false);
        }
        Err(VolmountError::ToolFailed {
            tool: "losetup".to_string(),
            status: out.status,
            diagnostic,
        })
    }

    fn run(&self, args: &[&str]) -> VolmountResult<spawn::ExitReport> {
        let mut argv = vec![self.binary.to_string_lossy().into_owned()];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        spawn::run(&argv, &Identity::Inherit, None, &[])
    }
}
