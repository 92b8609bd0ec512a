//! Read-only probes of the live system: mount table, loop backing files and
//! the kernel filesystem registry.

use crate::config::{PathsCfg, Volume};
use crate::mtab::unescape;
use std::fs;
use std::path::{Path, PathBuf};

/// Outcome of the already-mounted probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    NotMounted,
    Mounted,
    Indeterminate(String),
}

/// One line of `/proc/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTableEntry {
    pub device: String,
    pub mountpoint: PathBuf,
    pub fstype: String,
}

pub fn parse_mount_table(contents: &str) -> Vec<MountTableEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = unescape(parts.next()?);
            let mountpoint = PathBuf::from(unescape(parts.next()?));
            let fstype = parts.next().map(unescape).unwrap_or_default();
            Some(MountTableEntry {
                device,
                mountpoint,
                fstype,
            })
        })
        .collect()
}

/// Is `volume` already mounted on its mountpoint?
#[cfg(target_os = "linux")]
pub fn already_mounted(volume: &Volume, paths: &PathsCfg) -> MountState {
    let contents = match fs::read_to_string(&paths.mount_table) {
        Ok(contents) => contents,
        Err(err) => {
            return MountState::Indeterminate(format!(
                "cannot read {}: {err}",
                paths.mount_table.display()
            ))
        }
    };

    let wanted = volume.device_spec();
    let case_insensitive = volume.dispatch().case_insensitive;
    let real_mountpoint = fs::canonicalize(&volume.mountpoint).ok();

    let mounted = parse_mount_table(&contents).into_iter().any(|entry| {
        let device = loop_backing_file(&paths.sysfs_root, &entry.device)
            .unwrap_or(entry.device);
        let device_matches = if case_insensitive {
            device.eq_ignore_ascii_case(&wanted)
        } else {
            device == wanted
        };
        device_matches
            && (entry.mountpoint == volume.mountpoint
                || real_mountpoint.as_deref() == Some(entry.mountpoint.as_path()))
    });

    if mounted {
        MountState::Mounted
    } else {
        MountState::NotMounted
    }
}

#[cfg(not(target_os = "linux"))]
pub fn already_mounted(_volume: &Volume, _paths: &PathsCfg) -> MountState {
    MountState::Indeterminate("mount table probing is only implemented for Linux".to_string())
}

/// Backing file of `/dev/loopN`, read from sysfs.
pub fn loop_backing_file(sysfs_root: &Path, device: &str) -> Option<String> {
    let name = device.strip_prefix("/dev/")?;
    if !name.starts_with("loop") {
        return None;
    }
    let backing = sysfs_root
        .join("block")
        .join(name)
        .join("loop")
        .join("backing_file");
    let contents = fs::read_to_string(backing).ok()?;
    let trimmed = contents.trim_end_matches('\n');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Look `fstype` up in the registry: `Some(true)` for `nodev` types,
/// `Some(false)` for block-device types, `None` when unknown.
pub fn fstype_nodev(registry: &Path, fstype: &str) -> Option<bool> {
    let contents = fs::read_to_string(registry).ok()?;
    contents.lines().find_map(|line| {
        let (flags, name) = match line.split_once('\t') {
            Some((flags, name)) => (flags.trim(), name.trim()),
            None => ("", line.trim()),
        };
        (name == fstype).then_some(flags == "nodev")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeSource;
    use tempfile::tempdir;

    fn paths_in(dir: &Path, table: &str) -> PathsCfg {
        let mount_table = dir.join("mounts");
        fs::write(&mount_table, table).unwrap();
        PathsCfg {
            mount_table,
            sysfs_root: dir.join("sys"),
            ..PathsCfg::default()
        }
    }

    #[test]
    fn parses_escaped_fields() {
        let entries = parse_mount_table("/dev/sda1 /mnt/my\\040disk ext4 rw 0 0\n\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mountpoint, PathBuf::from("/mnt/my disk"));
        assert_eq!(entries[0].fstype, "ext4");
    }

    #[test]
    fn matches_device_and_mountpoint() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path(), "/dev/sdb1 /mnt/data ext4 rw 0 0\n");
        let mut volume = Volume::new(
            "u",
            VolumeSource::Local {
                device: "/dev/sdb1".into(),
            },
            "/mnt/data",
        );
        assert_eq!(already_mounted(&volume, &paths), MountState::Mounted);

        volume.mountpoint = PathBuf::from("/mnt/other");
        assert_eq!(already_mounted(&volume, &paths), MountState::NotMounted);
    }

    #[test]
    fn network_shares_compare_case_insensitively() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path(), "//FILES/Share /mnt/s cifs rw 0 0\n");
        let cifs = Volume::new(
            "u",
            VolumeSource::Cifs {
                server: "files".into(),
                share: "share".into(),
            },
            "/mnt/s",
        );
        assert_eq!(already_mounted(&cifs, &paths), MountState::Mounted);

        let paths = paths_in(dir.path(), "NAS:/Export /mnt/s nfs rw 0 0\n");
        let nfs = Volume::new(
            "u",
            VolumeSource::Nfs {
                server: "nas".into(),
                export: "/export".into(),
            },
            "/mnt/s",
        );
        assert_eq!(already_mounted(&nfs, &paths), MountState::NotMounted);
    }

    #[test]
    fn loop_devices_resolve_to_backing_file() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path(), "/dev/loop3 /mnt/img ext4 rw 0 0\n");
        let backing = paths.sysfs_root.join("block/loop3/loop");
        fs::create_dir_all(&backing).unwrap();
        fs::write(backing.join("backing_file"), "/srv/disk.img\n").unwrap();

        let volume = Volume::new(
            "u",
            VolumeSource::Local {
                device: "/srv/disk.img".into(),
            },
            "/mnt/img",
        );
        assert_eq!(already_mounted(&volume, &paths), MountState::Mounted);
        assert_eq!(loop_backing_file(&paths.sysfs_root, "/dev/sda"), None);
    }

    #[test]
    fn resolved_mountpoint_also_matches() {
        let dir = tempdir().unwrap();
        let real = fs::canonicalize(dir.path()).unwrap().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let table = format!("/dev/sdc1 {} ext4 rw 0 0\n", real.display());
        let paths = paths_in(dir.path(), &table);
        let volume = Volume::new(
            "u",
            VolumeSource::Local {
                device: "/dev/sdc1".into(),
            },
            &link,
        );
        assert_eq!(already_mounted(&volume, &paths), MountState::Mounted);
    }

    #[test]
    fn unreadable_table_is_indeterminate() {
        let paths = PathsCfg {
            mount_table: PathBuf::from("/nonexistent/volmount/mounts"),
            ..PathsCfg::default()
        };
        let volume = Volume::new(
            "u",
            VolumeSource::Local {
                device: "/dev/sdb1".into(),
            },
            "/mnt/data",
        );
        assert!(matches!(
            already_mounted(&volume, &paths),
            MountState::Indeterminate(_)
        ));
    }

    #[test]
    fn registry_lookup() {
        let dir = tempdir().unwrap();
        let registry = dir.path().join("filesystems");
        fs::write(&registry, "nodev\tsysfs\nnodev\ttmpfs\n\text4\n\tvfat\n").unwrap();
        assert_eq!(fstype_nodev(&registry, "ext4"), Some(false));
        assert_eq!(fstype_nodev(&registry, "tmpfs"), Some(true));
        assert_eq!(fstype_nodev(&registry, "auto"), None);
        assert_eq!(fstype_nodev(Path::new("/nonexistent"), "ext4"), None);
    }
}
