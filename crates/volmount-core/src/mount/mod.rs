//! Mount state machine.
//!
//! Mount: already-mounted probe, mountpoint creation, key decryption,
//! filesystem check (local volumes), optional crypto device, then the kind's
//! mount template. Unmount: optional open-file listing and killing, the
//! unmount template, crypto teardown, then optional mountpoint removal.
//! Every step returns a result; [`MountService::mount_op`] reduces the
//! outcome to a boolean after writing it to the audit log.

mod check;
mod mountpoint;

#[cfg(test)]
mod tests;

pub use check::{
    already_mounted, fstype_nodev, loop_backing_file, parse_mount_table, MountState,
    MountTableEntry,
};
pub use mountpoint::create_mountpoint;

use crate::argv::{build_argv, format_argv, ArgvBuilder};
use crate::config::{CommandKind, VolmountConfig, Volume, VolumeKind, VolumeSource};
use crate::crypto::{CryptoProvider, EhdMountInfo, EhdMountRequest, LowerDevice, UnloadOutcome};
use crate::error::{VolmountError, VolmountResult};
use crate::keyfile::{cipher_digest_security, decrypt_key_file, SecurityLevel};
use crate::logging::AUDIT;
use crate::mtab::{Cmtab, CmtabField, CreatedMountpoints, Smtab, SmtabEntry, SmtabField};
use crate::ofl;
use crate::privilege::UserIdentity;
use crate::spawn::{self, Identity};
use crate::template::TemplateContext;
use log::{debug, error, info, warn};
use std::fmt;
use std::fs;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Longest login token used verbatim as a volume password.
pub const MAX_PASSWORD_LEN: usize = 126;

/// Exit statuses `fsck` may return without blocking the mount.
const FSCK_ACCEPTED: &[i32] = &[0, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Mount,
    Unmount,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Mount => "mount",
            Direction::Unmount => "unmount",
        })
    }
}

/// Drives volumes through their mount and unmount pipelines.
pub struct MountService<P> {
    config: Arc<VolmountConfig>,
    crypto: P,
}

impl<P: CryptoProvider> MountService<P> {
    pub fn new(config: Arc<VolmountConfig>, crypto: P) -> Self {
        Self { config, crypto }
    }

    pub fn config(&self) -> &VolmountConfig {
        &self.config
    }

    pub fn cmtab(&self) -> Cmtab {
        Cmtab::new(self.config.paths.cmtab.clone())
    }

    pub fn smtab(&self) -> Smtab {
        Smtab::new(self.config.paths.smtab.clone())
    }

    pub fn created_mountpoints(&self) -> CreatedMountpoints {
        CreatedMountpoints::new(self.config.paths.created_mountpoints.clone())
    }

    /// Mount or unmount one volume. `password` is the login token.
    pub fn mount_op(&self, direction: Direction, volume: &mut Volume, password: Option<&[u8]>) -> bool {
        let result = match direction {
            Direction::Mount => self.mount_volume(volume, password),
            Direction::Unmount => self.unmount_volume(volume),
        };
        match result {
            Ok(()) => {
                info!(
                    target: AUDIT,
                    "{direction} of {} ({}) on {} for {} succeeded",
                    volume.device_spec(),
                    volume.kind(),
                    volume.mountpoint.display(),
                    volume.user
                );
                true
            }
            Err(err) => {
                error!(
                    target: AUDIT,
                    "{direction} of {} on {} for {} failed [{}]: {err}",
                    volume.device_spec(),
                    volume.mountpoint.display(),
                    volume.user,
                    err.kind()
                );
                false
            }
        }
    }

    /// Mount every volume not yet processed. One failure does not stop the rest.
    pub fn mount_all(&self, volumes: &mut [Volume], password: Option<&[u8]>) -> bool {
        let mut ok = true;
        for volume in volumes.iter_mut().filter(|volume| !volume.state.processed) {
            volume.state.processed = true;
            ok &= self.mount_op(Direction::Mount, volume, password);
        }
        ok
    }

    /// Unmount every volume, last mounted first.
    pub fn unmount_all(&self, volumes: &mut [Volume]) -> bool {
        let mut ok = true;
        for volume in volumes.iter_mut().rev() {
            ok &= self.mount_op(Direction::Unmount, volume, None);
            volume.state.processed = false;
        }
        ok
    }

    fn mount_volume(&self, volume: &mut Volume, token: Option<&[u8]>) -> VolmountResult<()> {
        let user = UserIdentity::lookup(&volume.user)?;
        volume.expand(&user);
        volume.validate()?;
        if !volume.from_global_config {
            let issues = self.config.options.check(&volume.options);
            if !issues.is_empty() {
                return Err(VolmountError::Validation(issues.join("; ")));
            }
        }

        match already_mounted(volume, &self.config.paths) {
            MountState::NotMounted => {}
            MountState::Mounted => {
                info!(
                    target: AUDIT,
                    "{} already mounted on {}",
                    volume.device_spec(),
                    volume.mountpoint.display()
                );
                return Ok(());
            }
            MountState::Indeterminate(reason) => return Err(VolmountError::Indeterminate(reason)),
        }

        let template = self.config.require_command(volume.dispatch().mount)?;
        let ssh_prefix = if volume.uses_ssh {
            Some(self.config.require_command(CommandKind::Fd0ssh)?)
        } else {
            None
        };

        self.ensure_mountpoint(volume, &user)?;
        let password = self.volume_password(volume, token)?;
        let mut ctx = self.build_context(volume, &user);

        match volume.kind() {
            VolumeKind::Local => self.check_filesystem(volume, &mut ctx, &password)?,
            VolumeKind::Crypt => return self.mount_crypt(volume, &mut ctx, template, password),
            _ => {}
        }

        let mut builder = ArgvBuilder::new();
        if let Some(prefix) = ssh_prefix {
            builder.extend(&mut ctx, prefix);
        }
        builder.extend(&mut ctx, template);
        let argv = builder.finish();

        let identity = if volume.kind() == VolumeKind::Fuse || volume.noroot {
            Identity::User(user)
        } else {
            Identity::Root
        };
        let env: &[(&str, &str)] = match volume.kind() {
            VolumeKind::Smbfs | VolumeKind::Cifs => &[("PASSWD_FD", "0")],
            _ => &[],
        };
        let input = volume
            .dispatch()
            .pipes_password
            .then_some(password.as_slice());
        execute(&argv, &identity, input, env, &[0])
    }

    fn unmount_volume(&self, volume: &mut Volume) -> VolmountResult<()> {
        let user = UserIdentity::lookup(&volume.user)?;
        volume.expand(&user);
        volume.validate()?;

        let template = self.config.require_command(self.config.unmount_kind(volume))?;
        let mut ctx = self.build_context(volume, &user);

        if self.config.policy.debug {
            self.list_open_files(&mut ctx);
        }
        if self.config.logout.enabled() {
            let signalled = ofl::kill_holders(
                &self.config.paths.proc_root,
                &volume.mountpoint,
                &self.config.logout,
            );
            debug!(
                "signalled {signalled} process(es) under {}",
                volume.mountpoint.display()
            );
        }

        let argv = build_argv(&mut ctx, template);
        let mut result = execute(&argv, &Identity::Root, None, &[], &[0]);
        if result.is_ok() && volume.kind() == VolumeKind::Crypt {
            result = self.release_crypt(volume);
        }

        self.remove_created_mountpoint(volume);
        result
    }

    /// Drop a mountpoint created by this or an earlier mount, if policy allows.
    fn remove_created_mountpoint(&self, volume: &mut Volume) {
        let created = self.created_mountpoints();
        let recorded = created.contains(&volume.mountpoint).unwrap_or_else(|err| {
            warn!(target: AUDIT, "reading created mountpoints failed: {err}");
            false
        });
        if !volume.state.created_mntpt && !recorded {
            return;
        }

        let policy = &self.config.policy;
        let mut forget = true;
        if policy.mkmountpoint && policy.rmdir_mountpoint {
            match fs::remove_dir(&volume.mountpoint) {
                Ok(()) => {
                    volume.state.created_mntpt = false;
                    debug!("removed mountpoint {}", volume.mountpoint.display());
                }
                Err(err) => {
                    forget = false;
                    warn!(
                        target: AUDIT,
                        "could not remove mountpoint {}: {err}",
                        volume.mountpoint.display()
                    );
                }
            }
        }
        if forget && recorded {
            if let Err(err) = created.remove(&volume.mountpoint) {
                warn!(target: AUDIT, "updating created mountpoints failed: {err}");
            }
        }
    }

    fn ensure_mountpoint(&self, volume: &mut Volume, user: &UserIdentity) -> VolmountResult<()> {
        if volume.mountpoint.is_dir() {
            return Ok(());
        }
        if !self.config.policy.mkmountpoint {
            return Err(VolmountError::Validation(format!(
                "mountpoint {} does not exist",
                volume.mountpoint.display()
            )));
        }
        if create_mountpoint(&volume.mountpoint, user)? {
            volume.state.created_mntpt = true;
            if let Err(err) = self.created_mountpoints().add(&volume.mountpoint) {
                warn!(
                    target: AUDIT,
                    "could not record created mountpoint {}: {err}",
                    volume.mountpoint.display()
                );
            }
        }
        Ok(())
    }

    /// The key file's plaintext when the volume has one, else the token.
    fn volume_password(
        &self,
        volume: &Volume,
        token: Option<&[u8]>,
    ) -> VolmountResult<Zeroizing<Vec<u8>>> {
        let token = token.unwrap_or_default();
        let Some(key) = &volume.key else {
            let len = token.len().min(MAX_PASSWORD_LEN);
            return Ok(Zeroizing::new(token[..len].to_vec()));
        };

        for spec in [&key.cipher, &key.digest] {
            warn_if_blacklisted(spec);
        }
        debug!(
            "decrypting {} with {}/{}",
            key.path.display(),
            key.cipher,
            key.digest
        );
        decrypt_key_file(&key.path, &key.digest, &key.cipher, token)
    }

    fn build_context(&self, volume: &Volume, user: &UserIdentity) -> TemplateContext {
        let mut ctx = TemplateContext::new();
        ctx.set("MNTPT", volume.mountpoint.to_string_lossy());
        ctx.set("FSCKLOOP", &self.config.policy.fsck_loop);
        ctx.set("FSTYPE", volume.fstype());
        ctx.set("VOLUME", volume.source.remote());
        if let Some(server) = volume.source.server() {
            ctx.set("SERVER", server);
        }
        ctx.set("USER", &user.name);
        match user.name.split_once('\\') {
            Some((domain, name)) => {
                ctx.set("DOMAIN_NAME", domain);
                ctx.set("DOMAIN_USER", name);
            }
            None => ctx.set("DOMAIN_USER", &user.name),
        }
        ctx.set("USERUID", user.uid.to_string());
        ctx.set("USERGID", user.gid.to_string());
        ctx.set("OPTIONS", volume.options.to_option_string());
        if let VolumeSource::Crypt { container, .. } | VolumeSource::Truecrypt { container } =
            &volume.source
        {
            ctx.set("CONTAINER", container);
        }
        ctx
    }

    fn check_filesystem(
        &self,
        volume: &Volume,
        ctx: &mut TemplateContext,
        password: &[u8],
    ) -> VolmountResult<()> {
        if volume.options.contains("bind") || volume.options.contains("move") {
            debug!("bind/move mount of {}; no fsck", volume.source.remote());
            return Ok(());
        }
        match fstype_nodev(&self.config.paths.filesystems, volume.fstype()) {
            Some(false) => {}
            Some(true) => {
                debug!("{} is a nodev filesystem; no fsck", volume.fstype());
                return Ok(());
            }
            None => {
                debug!("{} is not a registered filesystem; no fsck", volume.fstype());
                return Ok(());
            }
        }

        let fsck = self.config.require_command(CommandKind::Fsck)?;
        if !volume.options.contains("loop") {
            ctx.set("FSCKTARGET", volume.source.remote());
            let argv = build_argv(ctx, fsck);
            return execute(&argv, &Identity::Root, None, &[], FSCK_ACCEPTED);
        }

        let losetup = self.config.require_command(CommandKind::Losetup)?;
        let unlosetup = self.config.require_command(CommandKind::Unlosetup)?;
        let cipher = volume.options.value("encryption");
        if let Some(cipher) = cipher {
            ctx.set("CIPHER", cipher);
        }
        if let Some(bits) = volume.options.value("keybits") {
            ctx.set("KEYBITS", bits);
        }
        ctx.set("FSCKTARGET", &self.config.policy.fsck_loop);

        let argv = build_argv(ctx, losetup);
        execute(
            &argv,
            &Identity::Root,
            cipher.is_some().then_some(password),
            &[],
            &[0],
        )?;

        let argv = build_argv(ctx, fsck);
        let checked = execute(&argv, &Identity::Root, None, &[], FSCK_ACCEPTED);

        let argv = build_argv(ctx, unlosetup);
        if let Err(err) = execute(&argv, &Identity::Root, None, &[], &[0]) {
            warn!(
                target: AUDIT,
                "releasing {} failed: {err}",
                self.config.policy.fsck_loop
            );
        }
        checked
    }

    fn mount_crypt(
        &self,
        volume: &Volume,
        ctx: &mut TemplateContext,
        template: &[String],
        password: Zeroizing<Vec<u8>>,
    ) -> VolmountResult<()> {
        let VolumeSource::Crypt {
            container,
            fs_cipher,
            fs_hash,
            key_size,
        } = &volume.source
        else {
            return Err(VolmountError::Validation(format!(
                "{} is not a crypt volume",
                volume.source.remote()
            )));
        };
        for spec in fs_cipher.iter().chain(fs_hash.iter()) {
            warn_if_blacklisted(spec);
        }

        let mut request = EhdMountRequest::new(container, password);
        request.mountpoint = Some(volume.mountpoint.clone());
        request.fs_cipher = fs_cipher.clone();
        request.fs_hash = fs_hash.clone();
        request.trunc_keysize = key_size.map(|size| size as usize);
        request.readonly = volume.readonly();

        let info = self.crypto.load(&request)?;
        debug!(
            "{} attached as {} (lower device {})",
            container,
            info.crypto_device.display(),
            info.lower_device.display()
        );
        ctx.set("CRYPTO_DEVICE", info.crypto_device.to_string_lossy());

        let argv = build_argv(ctx, template);
        if let Err(err) = execute(&argv, &Identity::Root, None, &[], &[0]) {
            if let Err(unload_err) = self.crypto.unload(&info, LowerDevice::Release) {
                warn!(
                    target: AUDIT,
                    "rolling back {} failed: {unload_err}",
                    info.crypto_device.display()
                );
            }
            return Err(err);
        }

        if let Err(err) = self.record_crypt(volume, container, &info) {
            self.undo_crypt_mount(volume, ctx, &info);
            return Err(err);
        }
        Ok(())
    }

    /// Add the cmtab and smtab records; a half-written pair is taken back.
    fn record_crypt(&self, volume: &Volume, container: &str, info: &EhdMountInfo) -> VolmountResult<()> {
        let cmtab = self.cmtab();
        cmtab.add(&info.to_cmtab(&volume.mountpoint))?;
        let added = self.smtab().add(&SmtabEntry {
            device: container.to_string(),
            mountpoint: volume.mountpoint.to_string_lossy().into_owned(),
            fstype: volume.fstype().to_string(),
            options: volume.options.to_option_string(),
        });
        if added.is_err() {
            let mountpoint = volume.mountpoint.to_string_lossy();
            if let Err(err) = cmtab.remove(CmtabField::Mountpoint, &mountpoint) {
                warn!(target: AUDIT, "could not drop cmtab record for {mountpoint}: {err}");
            }
        }
        added
    }

    /// Unmount and unload a crypt volume whose records could not be written.
    fn undo_crypt_mount(&self, volume: &Volume, ctx: &mut TemplateContext, info: &EhdMountInfo) {
        let unmounted = self
            .config
            .require_command(self.config.unmount_kind(volume))
            .and_then(|template| {
                let argv = build_argv(ctx, template);
                execute(&argv, &Identity::Root, None, &[], &[0])
            });
        if let Err(err) = unmounted {
            warn!(
                target: AUDIT,
                "rolling back mount of {} failed: {err}",
                volume.mountpoint.display()
            );
        }
        if let Err(err) = self.crypto.unload(info, LowerDevice::Release) {
            warn!(
                target: AUDIT,
                "rolling back {} failed: {err}",
                info.crypto_device.display()
            );
        }
    }

    fn release_crypt(&self, volume: &Volume) -> VolmountResult<()> {
        let mountpoint = volume.mountpoint.to_string_lossy();
        let cmtab = self.cmtab();
        let Some(entry) = cmtab.get(CmtabField::Mountpoint, &mountpoint)? else {
            warn!(
                target: AUDIT,
                "no cmtab record for {mountpoint}; leaving crypto device alone"
            );
            return Ok(());
        };

        let info = EhdMountInfo::from_cmtab(&entry);
        match self.crypto.unload(&info, LowerDevice::Release)? {
            UnloadOutcome::Removed => debug!("{} removed", info.crypto_device.display()),
            UnloadOutcome::NothingToDo => {
                debug!("{} was already gone", info.crypto_device.display())
            }
        }

        cmtab.remove(CmtabField::Mountpoint, &mountpoint)?;
        self.smtab().remove(SmtabField::Mountpoint, &mountpoint)?;
        Ok(())
    }

    fn list_open_files(&self, ctx: &mut TemplateContext) {
        let Some(template) = self.config.command(CommandKind::Lsof) else {
            return;
        };
        let argv = build_argv(ctx, template);
        match spawn::run(&argv, &Identity::Root, None, &[]) {
            Ok(report) => {
                for line in report.stdout.lines() {
                    debug!("open: {line}");
                }
            }
            Err(err) => debug!("{} failed: {err}", format_argv(&argv)),
        }
    }
}

/// Run a helper and map any status outside `accepted` to `ToolFailed`.
fn execute(
    argv: &[String],
    identity: &Identity,
    input: Option<&[u8]>,
    env: &[(&str, &str)],
    accepted: &[i32],
) -> VolmountResult<()> {
    let report = spawn::run(argv, identity, input, env)?;
    let program = argv.first().map(String::as_str).unwrap_or_default();
    for line in report.stdout.lines().chain(report.stderr.lines()) {
        debug!("{program}: {line}");
    }
    if accepted.contains(&report.status) {
        Ok(())
    } else {
        Err(VolmountError::ToolFailed {
            tool: program.to_string(),
            status: report.status,
            diagnostic: report.diagnostic(),
        })
    }
}

fn warn_if_blacklisted(spec: &str) {
    if cipher_digest_security(spec) == SecurityLevel::Blacklisted {
        warn!(target: AUDIT, "`{spec}` is considered insecure");
    }
}
