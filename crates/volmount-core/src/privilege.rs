//! User lookup and scoped effective-identity switching.

use crate::error::{VolmountError, VolmountResult};
use log::warn;
use nix::unistd::{self, Gid, Uid, User};
use std::ffi::CString;
use std::path::PathBuf;

/// Resolved account the state machine acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    /// Supplementary groups, primary group included.
    pub groups: Vec<u32>,
}

impl UserIdentity {
    /// Look `name` up in the password database.
    pub fn lookup(name: &str) -> VolmountResult<Self> {
        let user = User::from_name(name)
            .map_err(|errno| VolmountError::errno(format!("looking up user {name}"), errno))?
            .ok_or_else(|| VolmountError::Privilege(format!("unknown user {name}")))?;
        Ok(Self::from_user(user))
    }

    /// The account of the real uid of this process.
    pub fn current() -> VolmountResult<Self> {
        let uid = unistd::getuid();
        let user = User::from_uid(uid)
            .map_err(|errno| VolmountError::errno("looking up current user", errno))?
            .ok_or_else(|| VolmountError::Privilege(format!("no passwd entry for uid {uid}")))?;
        Ok(Self::from_user(user))
    }

    fn from_user(user: User) -> Self {
        let groups = CString::new(user.name.as_str())
            .ok()
            .and_then(|name| unistd::getgrouplist(&name, user.gid).ok())
            .map(|groups| groups.into_iter().map(Gid::as_raw).collect())
            .unwrap_or_else(|| vec![user.gid.as_raw()]);
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
            groups,
        }
    }
}

/// Returns true when the effective uid is 0.
pub fn running_as_root() -> bool {
    unistd::geteuid().is_root()
}

/// Switches the effective uid/gid and restores the saved ids on drop.
#[derive(Debug)]
pub struct EffectiveIdentityGuard {
    saved_uid: Uid,
    saved_gid: Gid,
    active: bool,
}

impl EffectiveIdentityGuard {
    pub fn assume(user: &UserIdentity) -> VolmountResult<Self> {
        let saved_uid = unistd::geteuid();
        let saved_gid = unistd::getegid();
        let uid = Uid::from_raw(user.uid);
        let gid = Gid::from_raw(user.gid);

        if saved_uid == uid && saved_gid == gid {
            return Ok(Self {
                saved_uid,
                saved_gid,
                active: false,
            });
        }

        unistd::setegid(gid)
            .map_err(|errno| VolmountError::errno(format!("setegid({gid})"), errno))?;
        if let Err(errno) = unistd::seteuid(uid) {
            let _ = unistd::setegid(saved_gid);
            return Err(VolmountError::errno(format!("seteuid({uid})"), errno));
        }

        Ok(Self {
            saved_uid,
            saved_gid,
            active: true,
        })
    }
}

impl Drop for EffectiveIdentityGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(errno) = unistd::seteuid(self.saved_uid) {
            warn!("failed to restore effective uid {}: {errno}", self.saved_uid);
        }
        if let Err(errno) = unistd::setegid(self.saved_gid) {
            warn!("failed to restore effective gid {}: {errno}", self.saved_gid);
        }
    }
}

/// Run `op` with the effective identity of `user`, restoring ours afterwards.
pub fn run_as<T>(
    user: &UserIdentity,
    op: impl FnOnce() -> VolmountResult<T>,
) -> VolmountResult<T> {
    let _guard = EffectiveIdentityGuard::assume(user)?;
    op()
}
