use super::*;
use crate::config::{KeySpec, MountOptions, PathsCfg};
use crate::crypto::DEV_MAPPER;
use crate::mtab::CmtabEntry;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::{tempdir, TempDir};

#[derive(Debug, Default)]
struct MockState {
    keys: Vec<Vec<u8>>,
    active: Vec<String>,
    unloads: Vec<(EhdMountInfo, LowerDevice)>,
}

#[derive(Debug, Clone, Default)]
struct MockCrypto {
    state: Arc<Mutex<MockState>>,
}

impl CryptoProvider for MockCrypto {
    fn load(&self, request: &EhdMountRequest) -> VolmountResult<EhdMountInfo> {
        let name = request.crypto_name();
        let mut state = self.state.lock().unwrap();
        state.keys.push(request.key_material().to_vec());
        state.active.push(name.clone());
        Ok(EhdMountInfo {
            container: request.container.clone(),
            lower_device: PathBuf::from("/dev/loop9"),
            loop_device: Some(PathBuf::from("/dev/loop9")),
            crypto_device: Path::new(DEV_MAPPER).join(&name),
            crypto_name: name,
        })
    }

    fn unload(&self, info: &EhdMountInfo, lower: LowerDevice) -> VolmountResult<UnloadOutcome> {
        let mut state = self.state.lock().unwrap();
        state.unloads.push((info.clone(), lower));
        match state.active.iter().position(|name| *name == info.crypto_name) {
            Some(index) => {
                state.active.remove(index);
                Ok(UnloadOutcome::Removed)
            }
            None => Ok(UnloadOutcome::NothingToDo),
        }
    }
}

struct Sandbox {
    dir: TempDir,
    log: PathBuf,
    config: VolmountConfig,
    crypto: MockCrypto,
    user: UserIdentity,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::write(root.join("mounts"), "").unwrap();
        fs::write(root.join("filesystems"), "nodev\ttmpfs\nnodev\tproc\n\text4\n").unwrap();
        fs::create_dir(root.join("proc")).unwrap();

        let config = VolmountConfig {
            paths: PathsCfg {
                mount_table: root.join("mounts"),
                filesystems: root.join("filesystems"),
                proc_root: root.join("proc"),
                sysfs_root: root.join("sys"),
                cmtab: root.join("cmtab"),
                smtab: Some(root.join("smtab")),
                created_mountpoints: Some(root.join("created")),
            },
            ..VolmountConfig::default()
        };

        Self {
            log: root.join("calls.log"),
            dir,
            config,
            crypto: MockCrypto::default(),
            user: UserIdentity::current().unwrap(),
        }
    }

    fn path(&self, relative: &str) -> PathBuf {
        fs::canonicalize(self.dir.path()).unwrap().join(relative)
    }

    /// Install a fake helper that appends `name <args>` to the call log.
    fn command(&mut self, kind: CommandKind, name: &str, body: &str, args: &[&str]) {
        let bin = self.path("bin");
        fs::create_dir_all(&bin).unwrap();
        let script = bin.join(name);
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"{name} $*\" >> '{}'\n{body}\n",
                self.log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut template = vec![script.to_string_lossy().into_owned()];
        template.extend(args.iter().map(|arg| arg.to_string()));
        self.config.commands.insert(kind, template);
    }

    fn service(&self) -> MountService<MockCrypto> {
        MountService::new(Arc::new(self.config.clone()), self.crypto.clone())
    }

    fn calls(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn volume(&self, source: VolumeSource, mountpoint: &str) -> Volume {
        Volume::new(&self.user.name, source, self.path(mountpoint))
    }

    fn local(&self, fstype: &str) -> Volume {
        let mut volume = self.volume(
            VolumeSource::Local {
                device: self.path("disk.img").to_string_lossy().into_owned(),
            },
            "mnt/vol",
        );
        volume.fstype = Some(fstype.to_string());
        volume
    }

    fn crypt(&self, key_size: Option<u32>) -> Volume {
        self.volume(
            VolumeSource::Crypt {
                container: self.path("vault.img").to_string_lossy().into_owned(),
                fs_cipher: Some("aes-cbc-essiv:sha256".into()),
                fs_hash: None,
                key_size,
            },
            "mnt/vault",
        )
    }
}

#[test]
fn local_volume_creates_mountpoint_checks_and_mounts() {
    let mut sandbox = Sandbox::new();
    let stdin = sandbox.path("mount.stdin");
    sandbox.command(CommandKind::Fsck, "fsck", "exit 0", &["%(FSCKTARGET)"]);
    sandbox.command(
        CommandKind::Lclmount,
        "mount",
        &format!("cat > '{}'", stdin.display()),
        &["%(VOLUME)", "%(MNTPT)"],
    );
    let mut volume = sandbox.local("ext4");
    let device = volume.source.remote().to_string();
    let mountpoint = volume.mountpoint.clone();

    assert!(sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, Some(b"pw")));

    assert!(mountpoint.is_dir());
    assert!(volume.state.created_mntpt);
    assert_eq!(
        sandbox.calls(),
        vec![
            format!("fsck {device}"),
            format!("mount {device} {}", mountpoint.display()),
        ]
    );
    assert_eq!(fs::read(&stdin).unwrap(), b"pw");
}

#[test]
fn already_mounted_volume_spawns_nothing() {
    let mut sandbox = Sandbox::new();
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    let mut volume = sandbox.local("ext4");
    fs::write(
        &sandbox.config.paths.mount_table,
        format!(
            "{} {} ext4 rw 0 0\n",
            volume.source.remote(),
            volume.mountpoint.display()
        ),
    )
    .unwrap();

    assert!(sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, Some(b"pw")));
    assert!(sandbox.calls().is_empty());
    assert!(!volume.mountpoint.exists());
}

#[test]
fn crypt_volume_records_and_releases_cmtab_entry() {
    let mut sandbox = Sandbox::new();
    sandbox.command(
        CommandKind::Cryptmount,
        "mount",
        "exit 0",
        &["%(CRYPTO_DEVICE)", "%(MNTPT)"],
    );
    sandbox.command(CommandKind::Cryptumount, "umount", "exit 0", &["%(MNTPT)"]);
    let service = sandbox.service();

    let unrelated = CmtabEntry {
        mountpoint: "/mnt/other".into(),
        container: "/srv/other.img".into(),
        loop_device: Some("/dev/loop1".into()),
        crypto_device: Some("/dev/mapper/_srv_other_img".into()),
    };
    service.cmtab().add(&unrelated).unwrap();

    let mut volume = sandbox.crypt(Some(4));
    let mountpoint = volume.mountpoint.to_string_lossy().into_owned();
    let container = volume.source.remote().to_string();
    assert!(service.mount_op(Direction::Mount, &mut volume, Some(b"secretpw")));

    let record = service
        .cmtab()
        .get(CmtabField::Mountpoint, &mountpoint)
        .unwrap()
        .unwrap();
    let mapper = format!("{DEV_MAPPER}/{}", crate::crypto::crypto_name(&container));
    assert_eq!(record.container, container);
    assert_eq!(record.loop_device.as_deref(), Some("/dev/loop9"));
    assert_eq!(record.crypto_device.as_deref(), Some(mapper.as_str()));
    assert_eq!(
        sandbox.calls(),
        vec![format!("mount {mapper} {mountpoint}")]
    );
    let smtab = service
        .smtab()
        .get(SmtabField::Mountpoint, &mountpoint)
        .unwrap()
        .unwrap();
    assert_eq!(smtab.device, container);
    assert_eq!(sandbox.crypto.state.lock().unwrap().keys, vec![b"secr".to_vec()]);

    assert!(service.mount_op(Direction::Unmount, &mut volume, None));

    assert_eq!(service.cmtab().entries().unwrap(), vec![unrelated]);
    assert!(service
        .smtab()
        .get(SmtabField::Mountpoint, &mountpoint)
        .unwrap()
        .is_none());
    let state = sandbox.crypto.state.lock().unwrap();
    assert!(state.active.is_empty());
    assert_eq!(state.unloads.len(), 1);
    assert_eq!(state.unloads[0].1, LowerDevice::Release);
    assert_eq!(
        state.unloads[0].0.loop_device.as_deref(),
        Some(Path::new("/dev/loop9"))
    );
}

#[test]
fn failed_crypt_mount_unloads_device() {
    let mut sandbox = Sandbox::new();
    sandbox.command(CommandKind::Cryptmount, "mount", "exit 32", &["%(MNTPT)"]);
    let service = sandbox.service();
    let mut volume = sandbox.crypt(None);

    assert!(!service.mount_op(Direction::Mount, &mut volume, Some(b"pw")));

    let state = sandbox.crypto.state.lock().unwrap();
    assert!(state.active.is_empty());
    assert_eq!(state.unloads.len(), 1);
    assert!(service.cmtab().entries().unwrap().is_empty());
}

#[test]
fn unwritable_cmtab_rolls_crypt_mount_back() {
    let mut sandbox = Sandbox::new();
    sandbox.command(
        CommandKind::Cryptmount,
        "mount",
        "exit 0",
        &["%(CRYPTO_DEVICE)", "%(MNTPT)"],
    );
    sandbox.command(CommandKind::Cryptumount, "umount", "exit 0", &["%(MNTPT)"]);
    let cmtab = sandbox.path("cmtab");
    fs::create_dir(&cmtab).unwrap();
    sandbox.config.paths.cmtab = cmtab;
    let service = sandbox.service();
    let mut volume = sandbox.crypt(None);
    let mountpoint = volume.mountpoint.to_string_lossy().into_owned();

    assert!(!service.mount_op(Direction::Mount, &mut volume, Some(b"pw")));

    let calls = sandbox.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("mount "));
    assert_eq!(calls[1], format!("umount {mountpoint}"));
    let state = sandbox.crypto.state.lock().unwrap();
    assert!(state.active.is_empty());
    assert_eq!(state.unloads.len(), 1);
    assert_eq!(state.unloads[0].1, LowerDevice::Release);
    assert!(service
        .smtab()
        .get(SmtabField::Mountpoint, &mountpoint)
        .unwrap()
        .is_none());
}

#[test]
fn unwritable_smtab_drops_cmtab_record_and_unloads() {
    let mut sandbox = Sandbox::new();
    sandbox.command(CommandKind::Cryptmount, "mount", "exit 0", &["%(MNTPT)"]);
    sandbox.command(CommandKind::Cryptumount, "umount", "exit 0", &["%(MNTPT)"]);
    let smtab = sandbox.path("smtab");
    fs::create_dir(&smtab).unwrap();
    sandbox.config.paths.smtab = Some(smtab);
    let service = sandbox.service();
    let mut volume = sandbox.crypt(None);

    assert!(!service.mount_op(Direction::Mount, &mut volume, Some(b"pw")));

    assert!(service.cmtab().entries().unwrap().is_empty());
    assert_eq!(sandbox.calls().len(), 2);
    let state = sandbox.crypto.state.lock().unwrap();
    assert!(state.active.is_empty());
    assert_eq!(state.unloads.len(), 1);
}

#[test]
fn ssh_volume_runs_through_fd0ssh() {
    let mut sandbox = Sandbox::new();
    let stdin = sandbox.path("fd0ssh.stdin");
    sandbox.command(
        CommandKind::Fd0ssh,
        "fd0ssh",
        &format!("cat > '{}'\nexec \"$@\"", stdin.display()),
        &["-q"],
    );
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    let mount_bin = sandbox.config.commands[&CommandKind::Lclmount][0].clone();
    let mut volume = sandbox.local("tmpfs");
    volume.uses_ssh = true;
    let mountpoint = volume.mountpoint.display().to_string();

    assert!(sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, Some(b"sshpw")));
    assert_eq!(
        sandbox.calls(),
        vec![
            format!("fd0ssh -q {mount_bin} {mountpoint}"),
            format!("mount {mountpoint}"),
        ]
    );
    assert_eq!(fs::read(&stdin).unwrap(), b"sshpw");
}

#[test]
fn ssh_volume_without_fd0ssh_template_spawns_nothing() {
    let mut sandbox = Sandbox::new();
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    sandbox.config.commands.insert(CommandKind::Fd0ssh, Vec::new());
    let mut volume = sandbox.local("tmpfs");
    volume.uses_ssh = true;

    let err = sandbox
        .service()
        .mount_volume(&mut volume, Some(b"pw"))
        .unwrap_err();
    assert!(matches!(
        err,
        VolmountError::CommandNotDefined(CommandKind::Fd0ssh)
    ));
    assert!(sandbox.calls().is_empty());
    assert!(!volume.mountpoint.exists());
}

#[test]
fn undefined_template_aborts_before_any_side_effect() {
    let sandbox = Sandbox::new();
    let service = sandbox.service();
    let mut volume = sandbox.volume(
        VolumeSource::Truecrypt {
            container: sandbox.path("tc.img").to_string_lossy().into_owned(),
        },
        "mnt/tc",
    );

    let err = service.mount_volume(&mut volume, Some(b"pw")).unwrap_err();
    assert!(matches!(
        err,
        VolmountError::CommandNotDefined(CommandKind::Truecryptmount)
    ));
    assert!(sandbox.calls().is_empty());
    assert!(!volume.mountpoint.exists());
    assert!(!service.mount_op(Direction::Mount, &mut volume, Some(b"pw")));
}

#[test]
fn fsck_failure_blocks_mount() {
    let mut sandbox = Sandbox::new();
    sandbox.command(CommandKind::Fsck, "fsck", "exit 4", &["%(FSCKTARGET)"]);
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    let mut volume = sandbox.local("ext4");

    let err = sandbox
        .service()
        .mount_volume(&mut volume, Some(b"pw"))
        .unwrap_err();
    assert!(matches!(err, VolmountError::ToolFailed { status: 4, .. }));
    assert_eq!(sandbox.calls().len(), 1);
}

#[test]
fn fsck_corrections_are_accepted() {
    let mut sandbox = Sandbox::new();
    sandbox.command(CommandKind::Fsck, "fsck", "exit 1", &["%(FSCKTARGET)"]);
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    let mut volume = sandbox.local("ext4");

    assert!(sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, Some(b"pw")));
    assert_eq!(sandbox.calls().len(), 2);
}

#[test]
fn loop_fsck_always_releases_loop_device() {
    let mut sandbox = Sandbox::new();
    let stdin = sandbox.path("losetup.stdin");
    sandbox.config.policy.fsck_loop = "/dev/loop6".into();
    sandbox.command(
        CommandKind::Losetup,
        "losetup",
        &format!("cat > '{}'", stdin.display()),
        &["%(before=\"-e\" CIPHER)", "%(FSCKLOOP)", "%(VOLUME)"],
    );
    sandbox.command(CommandKind::Fsck, "fsck", "exit 8", &["%(FSCKTARGET)"]);
    sandbox.command(CommandKind::Unlosetup, "unlosetup", "exit 0", &["%(FSCKLOOP)"]);
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    let mut volume = sandbox.local("ext4");
    volume.options = MountOptions::parse("loop,encryption=aes").unwrap();
    let device = volume.source.remote().to_string();

    assert!(!sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, Some(b"pw")));
    assert_eq!(
        sandbox.calls(),
        vec![
            format!("losetup -eaes /dev/loop6 {device}"),
            "fsck /dev/loop6".to_string(),
            "unlosetup /dev/loop6".to_string(),
        ]
    );
    assert_eq!(fs::read(&stdin).unwrap(), b"pw");
}

#[test]
fn nodev_and_bind_mounts_skip_fsck() {
    let mut sandbox = Sandbox::new();
    sandbox.command(CommandKind::Fsck, "fsck", "exit 4", &["%(FSCKTARGET)"]);
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    let service = sandbox.service();

    let mut tmpfs = sandbox.local("tmpfs");
    assert!(service.mount_op(Direction::Mount, &mut tmpfs, None));

    let mut bind = sandbox.local("ext4");
    bind.mountpoint = sandbox.path("mnt/bind");
    bind.options = MountOptions::parse("bind").unwrap();
    assert!(service.mount_op(Direction::Mount, &mut bind, None));

    assert!(sandbox.calls().iter().all(|call| call.starts_with("mount ")));
}

#[test]
fn key_file_plaintext_becomes_password() {
    let mut sandbox = Sandbox::new();
    let stdin = sandbox.path("mount.stdin");
    sandbox.command(
        CommandKind::Lclmount,
        "mount",
        &format!("cat > '{}'", stdin.display()),
        &["%(MNTPT)"],
    );
    let key_path = sandbox.path("volume.key");
    fs::write(
        &key_path,
        hex::decode("53616c7465645f5f440fe692a3a71af0a9def0576ca6d3e4091aed23f566c790").unwrap(),
    )
    .unwrap();

    let mut volume = sandbox.local("tmpfs");
    volume.key = Some(KeySpec {
        path: key_path,
        cipher: "aes-256-cbc".into(),
        digest: "sha256".into(),
    });

    assert!(sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, Some(b"hunter2")));
    assert_eq!(fs::read(&stdin).unwrap(), b"volume password");
}

#[test]
fn wrong_key_passphrase_spawns_nothing() {
    let mut sandbox = Sandbox::new();
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    let key_path = sandbox.path("volume.key");
    fs::write(&key_path, b"not an encrypted key at all").unwrap();

    let mut volume = sandbox.local("tmpfs");
    volume.key = Some(KeySpec {
        path: key_path,
        cipher: "aes-256-cbc".into(),
        digest: "sha256".into(),
    });

    assert!(!sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, Some(b"hunter2")));
    assert!(sandbox.calls().is_empty());
}

#[test]
fn long_token_is_truncated() {
    let mut sandbox = Sandbox::new();
    let stdin = sandbox.path("mount.stdin");
    sandbox.command(
        CommandKind::Lclmount,
        "mount",
        &format!("cat > '{}'", stdin.display()),
        &["%(MNTPT)"],
    );
    let mut volume = sandbox.local("tmpfs");
    let token = vec![b'x'; 300];

    assert!(sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, Some(&token)));
    assert_eq!(fs::read(&stdin).unwrap().len(), MAX_PASSWORD_LEN);
}

#[test]
fn cifs_helper_gets_password_fd() {
    let mut sandbox = Sandbox::new();
    let env = sandbox.path("mount.env");
    sandbox.command(
        CommandKind::Cifsmount,
        "mount.cifs",
        &format!("echo \"$PASSWD_FD\" > '{}'; cat > /dev/null", env.display()),
        &["//%(SERVER)/%(VOLUME)", "%(MNTPT)", "%(before=\"-o\" OPTIONS)"],
    );
    let mut volume = sandbox.volume(
        VolumeSource::Cifs {
            server: "files".into(),
            share: "%(USER)".into(),
        },
        "mnt/share",
    );
    volume.options = MountOptions::parse("nosuid").unwrap();
    let name = sandbox.user.name.clone();

    assert!(sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, Some(b"pw")));
    assert_eq!(fs::read_to_string(&env).unwrap().trim(), "0");
    assert_eq!(
        sandbox.calls(),
        vec![format!(
            "mount.cifs //files/{name} {} -onosuid",
            volume.mountpoint.display()
        )]
    );
}

#[test]
fn option_policy_rejects_user_volume() {
    let mut sandbox = Sandbox::new();
    sandbox.config.options.deny = vec!["suid".into()];
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    let mut volume = sandbox.local("tmpfs");
    volume.from_global_config = false;
    volume.options = MountOptions::parse("suid").unwrap();

    let err = sandbox.service().mount_volume(&mut volume, None).unwrap_err();
    assert!(matches!(err, VolmountError::Validation(_)));
    assert!(sandbox.calls().is_empty());
}

#[test]
fn missing_mountpoint_without_mkmountpoint_fails() {
    let mut sandbox = Sandbox::new();
    sandbox.config.policy.mkmountpoint = false;
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    let mut volume = sandbox.local("tmpfs");

    assert!(!sandbox
        .service()
        .mount_op(Direction::Mount, &mut volume, None));
    assert!(!volume.mountpoint.exists());
    assert!(sandbox.calls().is_empty());
}

#[test]
fn unmount_lists_open_files_and_removes_created_mountpoint() {
    let mut sandbox = Sandbox::new();
    sandbox.config.policy.debug = true;
    sandbox.config.policy.rmdir_mountpoint = true;
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    sandbox.command(CommandKind::Umount, "umount", "exit 0", &["%(MNTPT)"]);
    sandbox.command(CommandKind::Lsof, "lsof", "exit 0", &["%(MNTPT)"]);
    let service = sandbox.service();
    let mut volume = sandbox.local("tmpfs");
    let mountpoint = volume.mountpoint.clone();

    assert!(service.mount_op(Direction::Mount, &mut volume, None));
    assert!(mountpoint.is_dir());
    assert!(service.mount_op(Direction::Unmount, &mut volume, None));

    assert!(!mountpoint.exists());
    assert!(!volume.state.created_mntpt);
    assert_eq!(
        sandbox.calls()[1..],
        [
            format!("lsof {}", mountpoint.display()),
            format!("umount {}", mountpoint.display()),
        ]
    );
}

#[test]
fn failed_unmount_still_removes_created_mountpoint() {
    let mut sandbox = Sandbox::new();
    sandbox.config.policy.rmdir_mountpoint = true;
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    sandbox.command(CommandKind::Umount, "umount", "exit 1", &["%(MNTPT)"]);
    let service = sandbox.service();
    let mut volume = sandbox.local("tmpfs");

    assert!(service.mount_op(Direction::Mount, &mut volume, None));
    assert!(!service.mount_op(Direction::Unmount, &mut volume, None));
    assert!(!volume.mountpoint.exists());
}

#[test]
fn separate_unmount_removes_mountpoint_created_earlier() {
    let mut sandbox = Sandbox::new();
    sandbox.config.policy.rmdir_mountpoint = true;
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    sandbox.command(CommandKind::Umount, "umount", "exit 0", &["%(MNTPT)"]);
    let registry = sandbox.path("created");

    let mut mounted = sandbox.local("tmpfs");
    assert!(sandbox
        .service()
        .mount_op(Direction::Mount, &mut mounted, None));
    assert!(fs::read_to_string(&registry)
        .unwrap()
        .contains(&*mounted.mountpoint.to_string_lossy()));

    // Fresh volume and service, as a later `umount` invocation sees them.
    let mut later = sandbox.local("tmpfs");
    assert!(!later.state.created_mntpt);
    assert!(sandbox
        .service()
        .mount_op(Direction::Unmount, &mut later, None));

    assert!(!later.mountpoint.exists());
    assert_eq!(fs::read_to_string(&registry).unwrap(), "");
}

#[test]
fn preexisting_mountpoint_is_never_removed() {
    let mut sandbox = Sandbox::new();
    sandbox.config.policy.rmdir_mountpoint = true;
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    sandbox.command(CommandKind::Umount, "umount", "exit 0", &["%(MNTPT)"]);
    let mut volume = sandbox.local("tmpfs");
    fs::create_dir_all(&volume.mountpoint).unwrap();
    let service = sandbox.service();

    assert!(service.mount_op(Direction::Mount, &mut volume, None));
    assert!(service.mount_op(Direction::Unmount, &mut volume, None));
    assert!(volume.mountpoint.is_dir());
}

#[test]
fn batch_mount_continues_after_failure_and_skips_processed() {
    let mut sandbox = Sandbox::new();
    sandbox.command(CommandKind::Lclmount, "mount", "exit 0", &["%(MNTPT)"]);
    sandbox.command(CommandKind::Umount, "umount", "exit 0", &["%(MNTPT)"]);
    let service = sandbox.service();

    let broken = sandbox.volume(
        VolumeSource::Truecrypt {
            container: sandbox.path("tc.img").to_string_lossy().into_owned(),
        },
        "mnt/tc",
    );
    let mut first = sandbox.local("tmpfs");
    first.mountpoint = sandbox.path("mnt/first");
    let mut second = sandbox.local("tmpfs");
    second.mountpoint = sandbox.path("mnt/second");
    let mut volumes = vec![broken, first, second];

    assert!(!service.mount_all(&mut volumes, None));
    assert!(volumes.iter().all(|volume| volume.state.processed));
    assert_eq!(sandbox.calls().len(), 2);

    assert!(service.mount_all(&mut volumes, None));
    assert_eq!(sandbox.calls().len(), 2);

    let mut mounted = volumes.split_off(1);
    assert!(service.unmount_all(&mut mounted));
    let calls = sandbox.calls();
    assert_eq!(
        calls[2..],
        [
            format!("umount {}", sandbox.path("mnt/second").display()),
            format!("umount {}", sandbox.path("mnt/first").display()),
        ]
    );
    assert!(mounted.iter().all(|volume| !volume.state.processed));
}
