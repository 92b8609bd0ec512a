//! Configuration model: global policy, command templates and the volume list.

use crate::argv::MAX_ARGS;
use crate::crypto::crypto_name;
use crate::error::{VolmountError, VolmountResult};
use crate::privilege::UserIdentity;
use crate::template::TemplateContext;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/volmount.toml";

/// Longest accepted user, server or share name, in bytes.
pub const MAX_NAME_LEN: usize = 127;
/// Longest accepted path, in bytes.
pub const MAX_PATH_LEN: usize = 4095;

/// Every external helper the state machine knows how to invoke.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Smbmount,
    Smbumount,
    Cifsmount,
    Ncpmount,
    Ncpumount,
    Fusemount,
    Fuseumount,
    Lclmount,
    Cryptmount,
    Cryptumount,
    Nfsmount,
    Umount,
    Fsck,
    Losetup,
    Unlosetup,
    Truecryptmount,
    Truecryptumount,
    Fd0ssh,
    Lsof,
}

impl CommandKind {
    pub const ALL: [CommandKind; 19] = [
        CommandKind::Smbmount,
        CommandKind::Smbumount,
        CommandKind::Cifsmount,
        CommandKind::Ncpmount,
        CommandKind::Ncpumount,
        CommandKind::Fusemount,
        CommandKind::Fuseumount,
        CommandKind::Lclmount,
        CommandKind::Cryptmount,
        CommandKind::Cryptumount,
        CommandKind::Nfsmount,
        CommandKind::Umount,
        CommandKind::Fsck,
        CommandKind::Losetup,
        CommandKind::Unlosetup,
        CommandKind::Truecryptmount,
        CommandKind::Truecryptumount,
        CommandKind::Fd0ssh,
        CommandKind::Lsof,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Smbmount => "smbmount",
            CommandKind::Smbumount => "smbumount",
            CommandKind::Cifsmount => "cifsmount",
            CommandKind::Ncpmount => "ncpmount",
            CommandKind::Ncpumount => "ncpumount",
            CommandKind::Fusemount => "fusemount",
            CommandKind::Fuseumount => "fuseumount",
            CommandKind::Lclmount => "lclmount",
            CommandKind::Cryptmount => "cryptmount",
            CommandKind::Cryptumount => "cryptumount",
            CommandKind::Nfsmount => "nfsmount",
            CommandKind::Umount => "umount",
            CommandKind::Fsck => "fsck",
            CommandKind::Losetup => "losetup",
            CommandKind::Unlosetup => "unlosetup",
            CommandKind::Truecryptmount => "truecryptmount",
            CommandKind::Truecryptumount => "truecryptumount",
            CommandKind::Fd0ssh => "fd0ssh",
            CommandKind::Lsof => "lsof",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a volume comes from. Each variant carries only the fields its kind uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VolumeSource {
    Smbfs {
        server: String,
        share: String,
    },
    Cifs {
        server: String,
        share: String,
    },
    Ncpfs {
        server: String,
        volume: String,
    },
    Nfs {
        server: String,
        export: String,
    },
    Local {
        device: String,
    },
    Crypt {
        container: String,
        #[serde(default)]
        fs_cipher: Option<String>,
        #[serde(default)]
        fs_hash: Option<String>,
        /// Key truncation length in bytes.
        #[serde(default)]
        key_size: Option<u32>,
    },
    Fuse {
        source: String,
    },
    Truecrypt {
        container: String,
    },
}

/// Field-less discriminant of [`VolumeSource`], used to index the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeKind {
    Smbfs,
    Cifs,
    Ncpfs,
    Nfs,
    Local,
    Crypt,
    Fuse,
    Truecrypt,
}

/// Per-kind behaviour of the mount state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindDispatch {
    pub mount: CommandKind,
    pub unmount: CommandKind,
    pub pipes_password: bool,
    pub case_insensitive: bool,
    pub needs_server: bool,
    pub default_fstype: &'static str,
}

const DISPATCH: [KindDispatch; 8] = [
    KindDispatch {
        mount: CommandKind::Smbmount,
        unmount: CommandKind::Smbumount,
        pipes_password: true,
        case_insensitive: true,
        needs_server: true,
        default_fstype: "smbfs",
    },
    KindDispatch {
        mount: CommandKind::Cifsmount,
        unmount: CommandKind::Umount,
        pipes_password: true,
        case_insensitive: true,
        needs_server: true,
        default_fstype: "cifs",
    },
    KindDispatch {
        mount: CommandKind::Ncpmount,
        unmount: CommandKind::Ncpumount,
        pipes_password: true,
        case_insensitive: true,
        needs_server: true,
        default_fstype: "ncpfs",
    },
    KindDispatch {
        mount: CommandKind::Nfsmount,
        unmount: CommandKind::Umount,
        pipes_password: false,
        case_insensitive: false,
        needs_server: true,
        default_fstype: "nfs",
    },
    KindDispatch {
        mount: CommandKind::Lclmount,
        unmount: CommandKind::Umount,
        pipes_password: true,
        case_insensitive: false,
        needs_server: false,
        default_fstype: "auto",
    },
    // The key reaches cryptsetup through the provider, never the mount helper.
    KindDispatch {
        mount: CommandKind::Cryptmount,
        unmount: CommandKind::Cryptumount,
        pipes_password: false,
        case_insensitive: false,
        needs_server: false,
        default_fstype: "auto",
    },
    KindDispatch {
        mount: CommandKind::Fusemount,
        unmount: CommandKind::Fuseumount,
        pipes_password: true,
        case_insensitive: false,
        needs_server: false,
        default_fstype: "fuse",
    },
    KindDispatch {
        mount: CommandKind::Truecryptmount,
        unmount: CommandKind::Truecryptumount,
        pipes_password: true,
        case_insensitive: false,
        needs_server: false,
        default_fstype: "auto",
    },
];

impl VolumeKind {
    pub fn dispatch(self) -> &'static KindDispatch {
        &DISPATCH[self as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            VolumeKind::Smbfs => "smbfs",
            VolumeKind::Cifs => "cifs",
            VolumeKind::Ncpfs => "ncpfs",
            VolumeKind::Nfs => "nfs",
            VolumeKind::Local => "local",
            VolumeKind::Crypt => "crypt",
            VolumeKind::Fuse => "fuse",
            VolumeKind::Truecrypt => "truecrypt",
        }
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl VolumeSource {
    pub fn kind(&self) -> VolumeKind {
        match self {
            VolumeSource::Smbfs { .. } => VolumeKind::Smbfs,
            VolumeSource::Cifs { .. } => VolumeKind::Cifs,
            VolumeSource::Ncpfs { .. } => VolumeKind::Ncpfs,
            VolumeSource::Nfs { .. } => VolumeKind::Nfs,
            VolumeSource::Local { .. } => VolumeKind::Local,
            VolumeSource::Crypt { .. } => VolumeKind::Crypt,
            VolumeSource::Fuse { .. } => VolumeKind::Fuse,
            VolumeSource::Truecrypt { .. } => VolumeKind::Truecrypt,
        }
    }

    pub fn server(&self) -> Option<&str> {
        match self {
            VolumeSource::Smbfs { server, .. }
            | VolumeSource::Cifs { server, .. }
            | VolumeSource::Ncpfs { server, .. }
            | VolumeSource::Nfs { server, .. } => Some(server),
            _ => None,
        }
    }

    /// The value exposed to templates as `VOLUME`.
    pub fn remote(&self) -> &str {
        match self {
            VolumeSource::Smbfs { share, .. } | VolumeSource::Cifs { share, .. } => share,
            VolumeSource::Ncpfs { volume, .. } => volume,
            VolumeSource::Nfs { export, .. } => export,
            VolumeSource::Local { device } => device,
            VolumeSource::Crypt { container, .. } | VolumeSource::Truecrypt { container } => {
                container
            }
            VolumeSource::Fuse { source } => source,
        }
    }

    fn strings_mut(&mut self) -> Vec<&mut String> {
        match self {
            VolumeSource::Smbfs { server, share } | VolumeSource::Cifs { server, share } => {
                vec![server, share]
            }
            VolumeSource::Ncpfs { server, volume } => vec![server, volume],
            VolumeSource::Nfs { server, export } => vec![server, export],
            VolumeSource::Local { device } => vec![device],
            VolumeSource::Crypt { container, .. } | VolumeSource::Truecrypt { container } => {
                vec![container]
            }
            VolumeSource::Fuse { source } => vec![source],
        }
    }
}

/// Mount option set. Keys are unique; equality ignores order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MountOptions {
    entries: Vec<(String, Option<String>)>,
}

impl MountOptions {
    /// Parse a `key[=value],...` list. Empty elements are rejected.
    pub fn parse(raw: &str) -> VolmountResult<Self> {
        let mut options = Self::default();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(options);
        }
        for item in trimmed.split(',') {
            let item = item.trim();
            if item.is_empty() {
                return Err(VolmountError::InvalidConfig(format!(
                    "empty element in option list `{raw}`"
                )));
            }
            match item.split_once('=') {
                Some(("", _)) => {
                    return Err(VolmountError::InvalidConfig(format!(
                        "option without a name in `{raw}`"
                    )))
                }
                Some((key, value)) => options.insert(key, Some(value.to_string())),
                None => options.insert(item, None),
            }
        }
        Ok(options)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Option<String>> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// `None` if absent, `Some(None)` for a bare flag.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref())
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).flatten()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render as the comma-joined list handed to mount helpers.
    pub fn to_option_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(key);
            if let Some(value) = value {
                out.push('=');
                out.push_str(value);
            }
        }
        out
    }
}

impl PartialEq for MountOptions {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl Eq for MountOptions {}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_option_string())
    }
}

impl TryFrom<String> for MountOptions {
    type Error = VolmountError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        MountOptions::parse(&raw)
    }
}

impl From<MountOptions> for String {
    fn from(options: MountOptions) -> Self {
        options.to_option_string()
    }
}

/// Encrypted key file protecting the volume password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KeySpec {
    pub path: PathBuf,
    pub cipher: String,
    #[serde(default = "default_key_digest")]
    pub digest: String,
}

fn default_key_digest() -> String {
    "md5".to_string()
}

/// Runtime bookkeeping; never read from or written to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeState {
    pub created_mntpt: bool,
    pub expanded: bool,
    pub processed: bool,
}

/// One mount intent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Volume {
    pub user: String,

    pub source: VolumeSource,

    pub mountpoint: PathBuf,

    #[serde(default)]
    pub fstype: Option<String>,

    #[serde(default, skip_serializing_if = "MountOptions::is_empty")]
    #[schemars(with = "String")]
    pub options: MountOptions,

    #[serde(default)]
    pub key: Option<KeySpec>,

    #[serde(default = "default_true")]
    pub from_global_config: bool,

    #[serde(default)]
    pub uses_ssh: bool,

    #[serde(default)]
    pub noroot: bool,

    #[serde(skip)]
    pub state: VolumeState,
}

fn default_true() -> bool {
    true
}

impl Volume {
    pub fn new(user: impl Into<String>, source: VolumeSource, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            source,
            mountpoint: mountpoint.into(),
            fstype: None,
            options: MountOptions::default(),
            key: None,
            from_global_config: true,
            uses_ssh: false,
            noroot: false,
            state: VolumeState::default(),
        }
    }

    pub fn kind(&self) -> VolumeKind {
        self.source.kind()
    }

    pub fn dispatch(&self) -> &'static KindDispatch {
        self.kind().dispatch()
    }

    /// Explicit filesystem type, or the kind's default.
    pub fn fstype(&self) -> &str {
        self.fstype
            .as_deref()
            .filter(|fstype| !fstype.is_empty())
            .unwrap_or(self.dispatch().default_fstype)
    }

    pub fn readonly(&self) -> bool {
        self.options.contains("ro")
    }

    /// Device string as the kernel reports it in the mount table.
    pub fn device_spec(&self) -> String {
        match &self.source {
            VolumeSource::Smbfs { server, share } | VolumeSource::Cifs { server, share } => {
                format!("//{server}/{share}")
            }
            VolumeSource::Ncpfs { server, .. } => {
                let user = self.options.value("user").unwrap_or(&self.user);
                format!("{server}/{user}")
            }
            VolumeSource::Nfs { server, export } => format!("{server}:{export}"),
            VolumeSource::Crypt { container, .. } => {
                format!("/dev/mapper/{}", crypto_name(container))
            }
            VolumeSource::Local { device } => device.clone(),
            VolumeSource::Fuse { source } => source.clone(),
            VolumeSource::Truecrypt { container } => container.clone(),
        }
    }

    /// Reject malformed volumes before any privileged action.
    pub fn validate(&self) -> VolmountResult<()> {
        check_field("user", &self.user, MAX_NAME_LEN)?;
        let mountpoint = self.mountpoint.to_string_lossy();
        check_field("mountpoint", &mountpoint, MAX_PATH_LEN)?;
        if !self.mountpoint.is_absolute() {
            return Err(VolmountError::Validation(format!(
                "mountpoint {mountpoint} is not absolute"
            )));
        }

        let dispatch = self.dispatch();
        match self.source.server() {
            Some(server) if dispatch.needs_server => check_field("server", server, MAX_NAME_LEN)?,
            _ => {}
        }
        check_field("volume", self.source.remote(), MAX_PATH_LEN)?;

        if let Some(key) = &self.key {
            check_field("key cipher", &key.cipher, MAX_NAME_LEN)?;
            check_field("key digest", &key.digest, MAX_NAME_LEN)?;
            check_field("key path", &key.path.to_string_lossy(), MAX_PATH_LEN)?;
        }

        if let VolumeSource::Crypt {
            key_size: Some(0), ..
        } = &self.source
        {
            return Err(VolmountError::Validation(
                "crypt key_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Substitute `~` and user placeholders in the path-like fields once.
    pub fn expand(&mut self, user: &UserIdentity) {
        if self.state.expanded {
            return;
        }
        let mut ctx = TemplateContext::new();
        ctx.set("USER", &user.name);
        ctx.set("USERUID", user.uid.to_string());
        ctx.set("USERGID", user.gid.to_string());

        let mountpoint = ctx.resolve(&self.mountpoint.to_string_lossy());
        self.mountpoint = expand_home(&mountpoint, &user.home);
        if let Some(key) = &mut self.key {
            let path = ctx.resolve(&key.path.to_string_lossy());
            key.path = expand_home(&path, &user.home);
        }
        for field in self.source.strings_mut() {
            *field = ctx.resolve(field);
        }
        for diagnostic in ctx.drain_diagnostics() {
            debug!("expanding volume for {}: {diagnostic}", user.name);
        }
        self.state.expanded = true;
    }
}

fn expand_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    match value.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(value),
    }
}

fn check_field(name: &str, value: &str, max: usize) -> VolmountResult<()> {
    if value.is_empty() {
        return Err(VolmountError::Validation(format!("{name} is empty")));
    }
    if value.len() > max {
        return Err(VolmountError::Validation(format!(
            "{name} exceeds {max} bytes"
        )));
    }
    if value.contains('\0') {
        return Err(VolmountError::Validation(format!(
            "{name} contains a NUL byte"
        )));
    }
    Ok(())
}

/// Global switches for the mount state machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Policy {
    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_true")]
    pub mkmountpoint: bool,

    #[serde(default)]
    pub rmdir_mountpoint: bool,

    #[serde(default = "default_fsck_loop")]
    pub fsck_loop: String,
}

fn default_fsck_loop() -> String {
    "/dev/loop7".to_string()
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            debug: false,
            mkmountpoint: true,
            rmdir_mountpoint: false,
            fsck_loop: default_fsck_loop(),
        }
    }
}

/// Signals sent to processes still using a mountpoint at unmount time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SignalPolicy {
    #[serde(default)]
    pub hup: bool,

    #[serde(default)]
    pub term: bool,

    #[serde(default)]
    pub kill: bool,

    /// Pause after each signal stage.
    #[serde(default)]
    pub wait_ms: u64,
}

impl SignalPolicy {
    pub fn enabled(&self) -> bool {
        self.hup || self.term || self.kill
    }
}

/// Constraints on options of user-supplied volumes. `*` matches everything.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OptionPolicy {
    #[serde(default)]
    pub require: Vec<String>,

    #[serde(default = "default_allow")]
    pub allow: Vec<String>,

    #[serde(default)]
    pub deny: Vec<String>,
}

fn default_allow() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for OptionPolicy {
    fn default() -> Self {
        Self {
            require: Vec::new(),
            allow: default_allow(),
            deny: Vec::new(),
        }
    }
}

impl OptionPolicy {
    /// Human-readable violations; empty when `options` passes.
    pub fn check(&self, options: &MountOptions) -> Vec<String> {
        let mut issues = Vec::new();
        for required in &self.require {
            if !options.contains(required) {
                issues.push(format!("required option `{required}` missing"));
            }
        }

        let allow_all = self.allow.iter().any(|a| a == "*");
        let deny_all = self.deny.iter().any(|d| d == "*");
        for key in options.keys() {
            if deny_all || self.deny.iter().any(|d| d == key) {
                issues.push(format!("option `{key}` is denied"));
            } else if !allow_all
                && !self.allow.iter().any(|a| a == key)
                && !self.require.iter().any(|r| r == key)
            {
                issues.push(format!("option `{key}` is not allowed"));
            }
        }
        issues
    }
}

/// Files the state machine reads and writes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PathsCfg {
    #[serde(default = "default_mount_table")]
    pub mount_table: PathBuf,

    #[serde(default = "default_filesystems")]
    pub filesystems: PathBuf,

    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    #[serde(default = "default_cmtab")]
    pub cmtab: PathBuf,

    /// Unset disables smtab bookkeeping.
    #[serde(default = "default_smtab")]
    pub smtab: Option<PathBuf>,

    /// Mountpoints created on demand, kept across processes so `umount`
    /// can remove them. Unset keeps the record in memory only.
    #[serde(default = "default_created_mountpoints")]
    pub created_mountpoints: Option<PathBuf>,
}

fn default_mount_table() -> PathBuf {
    PathBuf::from("/proc/mounts")
}

fn default_filesystems() -> PathBuf {
    PathBuf::from("/proc/filesystems")
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_cmtab() -> PathBuf {
    PathBuf::from("/etc/cmtab")
}

fn default_smtab() -> Option<PathBuf> {
    Some(PathBuf::from("/etc/mtab"))
}

fn default_created_mountpoints() -> Option<PathBuf> {
    Some(PathBuf::from("/run/volmount/mountpoints"))
}

impl Default for PathsCfg {
    fn default() -> Self {
        Self {
            mount_table: default_mount_table(),
            filesystems: default_filesystems(),
            proc_root: default_proc_root(),
            sysfs_root: default_sysfs_root(),
            cmtab: default_cmtab(),
            smtab: default_smtab(),
            created_mountpoints: default_created_mountpoints(),
        }
    }
}

/// Binary overrides for the system crypto provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ToolsCfg {
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub losetup_path: Option<String>,
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VolmountConfig {
    #[serde(default)]
    pub policy: Policy,

    #[serde(default)]
    pub logout: SignalPolicy,

    #[serde(default)]
    pub options: OptionPolicy,

    #[serde(default)]
    pub paths: PathsCfg,

    #[serde(default)]
    pub tools: ToolsCfg,

    #[serde(default = "default_commands")]
    pub commands: BTreeMap<CommandKind, Vec<String>>,

    #[serde(default)]
    pub volumes: Vec<Volume>,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

fn template(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

/// Stock command templates. Kinds without a sensible default stay empty.
pub fn default_commands() -> BTreeMap<CommandKind, Vec<String>> {
    let mut commands = BTreeMap::new();
    commands.insert(
        CommandKind::Smbmount,
        template(&[
            "smbmount",
            "//%(SERVER)/%(VOLUME)",
            "%(MNTPT)",
            "-o",
            "username=%(USER),uid=%(USERUID),gid=%(USERGID)%(before=\",\" OPTIONS)",
        ]),
    );
    commands.insert(CommandKind::Smbumount, template(&["smbumount", "%(MNTPT)"]));
    commands.insert(
        CommandKind::Cifsmount,
        template(&[
            "mount",
            "-t",
            "cifs",
            "//%(SERVER)/%(VOLUME)",
            "%(MNTPT)",
            "-o",
            "username=%(USER),uid=%(USERUID),gid=%(USERGID)%(before=\",\" OPTIONS)",
        ]),
    );
    commands.insert(
        CommandKind::Ncpmount,
        template(&[
            "ncpmount",
            "%(SERVER)/%(USER)",
            "%(MNTPT)",
            "-o",
            "pass-fd=0,volume=%(VOLUME)%(before=\",\" OPTIONS)",
        ]),
    );
    commands.insert(CommandKind::Ncpumount, template(&["ncpumount", "%(MNTPT)"]));
    commands.insert(
        CommandKind::Fusemount,
        template(&["mount.fuse", "%(VOLUME)", "%(MNTPT)", "%(before=\"-o\" OPTIONS)"]),
    );
    commands.insert(
        CommandKind::Fuseumount,
        template(&["fusermount", "-u", "%(MNTPT)"]),
    );
    commands.insert(
        CommandKind::Lclmount,
        template(&[
            "mount",
            "-p0",
            "-t",
            "%(FSTYPE)",
            "%(VOLUME)",
            "%(MNTPT)",
            "%(before=\"-o\" OPTIONS)",
        ]),
    );
    commands.insert(
        CommandKind::Cryptmount,
        template(&[
            "mount",
            "-t",
            "%(FSTYPE)",
            "%(CRYPTO_DEVICE)",
            "%(MNTPT)",
            "%(before=\"-o\" OPTIONS)",
        ]),
    );
    commands.insert(CommandKind::Cryptumount, template(&["umount", "%(MNTPT)"]));
    commands.insert(
        CommandKind::Nfsmount,
        template(&[
            "mount",
            "%(SERVER):%(VOLUME)",
            "%(MNTPT)",
            "%(before=\"-o\" OPTIONS)",
        ]),
    );
    commands.insert(CommandKind::Umount, template(&["umount", "%(MNTPT)"]));
    commands.insert(CommandKind::Fsck, template(&["fsck", "-p", "%(FSCKTARGET)"]));
    commands.insert(
        CommandKind::Losetup,
        template(&[
            "losetup",
            "-p0",
            "%(before=\"-e\" CIPHER)",
            "%(before=\"-k\" KEYBITS)",
            "%(FSCKLOOP)",
            "%(VOLUME)",
        ]),
    );
    commands.insert(
        CommandKind::Unlosetup,
        template(&["losetup", "-d", "%(FSCKLOOP)"]),
    );
    commands.insert(CommandKind::Truecryptmount, Vec::new());
    commands.insert(CommandKind::Truecryptumount, Vec::new());
    commands.insert(CommandKind::Fd0ssh, template(&["pmt-fd0ssh"]));
    commands.insert(CommandKind::Lsof, template(&["lsof", "%(MNTPT)"]));
    commands
}

impl Default for VolmountConfig {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            logout: SignalPolicy::default(),
            options: OptionPolicy::default(),
            paths: PathsCfg::default(),
            tools: ToolsCfg::default(),
            commands: default_commands(),
            volumes: Vec::new(),
            path: PathBuf::new(),
            format: ConfigFormat::default(),
        }
    }
}

impl VolmountConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Read a config file from disk, detecting TOML or YAML by extension.
    ///
    /// Command kinds the file leaves out keep their stock templates; a kind
    /// set to an empty list stays undefined.
    pub fn load<P: AsRef<Path>>(path: P) -> VolmountResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        for (kind, stock) in default_commands() {
            cfg.commands.entry(kind).or_insert(stock);
        }
        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };
        Ok(cfg)
    }

    /// Template for `kind`, or `None` when it is missing or empty.
    pub fn command(&self, kind: CommandKind) -> Option<&[String]> {
        self.commands
            .get(&kind)
            .map(Vec::as_slice)
            .filter(|template| !template.is_empty())
    }

    /// Template for `kind`, failing with [`VolmountError::CommandNotDefined`].
    pub fn require_command(&self, kind: CommandKind) -> VolmountResult<&[String]> {
        self.command(kind)
            .ok_or(VolmountError::CommandNotDefined(kind))
    }

    /// Unmount template for a volume; crypt volumes fall back to `umount`.
    pub fn unmount_kind(&self, volume: &Volume) -> CommandKind {
        let kind = volume.dispatch().unmount;
        if kind == CommandKind::Cryptumount && self.command(kind).is_none() {
            CommandKind::Umount
        } else {
            kind
        }
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for (kind, template) in &self.commands {
            if template.len() > MAX_ARGS {
                issues.push(format!(
                    "commands.{kind} has {} elements (limit {MAX_ARGS})",
                    template.len()
                ));
            }
        }

        if self.policy.fsck_loop.trim().is_empty() {
            issues.push("policy.fsck_loop must not be empty".to_string());
        }

        for (index, volume) in self.volumes.iter().enumerate() {
            let label = format!("volumes[{index}] ({})", volume.mountpoint.display());

            if let Err(err) = volume.validate() {
                issues.push(format!("{label}: {err}"));
            }

            let mount = volume.dispatch().mount;
            if self.command(mount).is_none() {
                issues.push(format!("{label}: commands.{mount} is not defined"));
            }
            let unmount = self.unmount_kind(volume);
            if self.command(unmount).is_none() {
                issues.push(format!("{label}: commands.{unmount} is not defined"));
            }
            if volume.uses_ssh {
                match (self.command(CommandKind::Fd0ssh), self.command(mount)) {
                    (None, _) => {
                        issues.push(format!("{label}: uses_ssh requires commands.fd0ssh"));
                    }
                    (Some(prefix), Some(template)) if prefix.len() + template.len() > MAX_ARGS => {
                        issues.push(format!(
                            "{label}: commands.fd0ssh plus commands.{mount} has {} elements (limit {MAX_ARGS})",
                            prefix.len() + template.len()
                        ));
                    }
                    _ => {}
                }
            }

            if !volume.from_global_config {
                for issue in self.options.check(&volume.options) {
                    issues.push(format!("{label}: {issue}"));
                }
            }
        }

        issues
    }
}
