//! On-demand mountpoint creation, owned by the volume user.

use crate::error::{VolmountError, VolmountResult};
use crate::privilege::{run_as, UserIdentity};
use log::debug;
use nix::unistd::{chown, Gid, Uid};
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

const MOUNTPOINT_MODE: u32 = 0o711;

/// Create `path` and missing parents for `user`. Returns true if we created it.
///
/// Creation is attempted with the user's effective identity first; if that
/// fails the directories are created as root and handed over with `chown`.
pub fn create_mountpoint(path: &Path, user: &UserIdentity) -> VolmountResult<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    if path.exists() {
        return Err(VolmountError::Validation(format!(
            "mountpoint {} exists and is not a directory",
            path.display()
        )));
    }

    match run_as(user, || make_dirs(path, None)) {
        Ok(()) => {
            debug!("created mountpoint {} as {}", path.display(), user.name);
            return Ok(true);
        }
        Err(err) => debug!(
            "creating {} as {} failed ({err}); retrying as root",
            path.display(),
            user.name
        ),
    }

    make_dirs(path, Some(user))?;
    debug!("created mountpoint {} as root", path.display());
    Ok(true)
}

fn make_dirs(path: &Path, owner: Option<&UserIdentity>) -> VolmountResult<()> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        make_dirs(parent, owner)?;
    }

    match DirBuilder::new().mode(MOUNTPOINT_MODE).create(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => return Ok(()),
        Err(err) => return Err(err.into()),
    }

    if let Some(owner) = owner {
        chown(
            path,
            Some(Uid::from_raw(owner.uid)),
            Some(Gid::from_raw(owner.gid)),
        )
        .map_err(|errno| VolmountError::errno(format!("chown {}", path.display()), errno))?;
    }
    Ok(())
}
