//! Flat-file association store (`cmtab`, `smtab` and the list of
//! mountpoints created on demand).
//!
//! Both files are line oriented and append only. Readers take a shared
//! `flock`, writers an exclusive one. Lookups and removals always target the
//! most recently appended match, so stacked mounts on one mountpoint unwind
//! in reverse order.

use crate::error::{VolmountError, VolmountResult};
use log::debug;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

const ABSENT: &str = "-";

/// Escape space, tab, newline and backslash as `\ooo`.
pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            ' ' | '\t' | '\n' | '\\' => out.push_str(&format!("\\{:03o}", ch as u32)),
            other => out.push(other),
        }
    }
    out
}

/// Decode `\ooo` octal escapes. Malformed sequences are kept verbatim.
pub fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\' {
            let digits = &bytes[index + 1..(index + 4).min(bytes.len())];
            if digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    index += 4;
                    continue;
                }
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Key a cmtab lookup or removal matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmtabField {
    Mountpoint,
    Container,
    LoopDevice,
    CryptoDevice,
}

/// One container-to-device association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmtabEntry {
    pub mountpoint: String,
    pub container: String,
    pub loop_device: Option<String>,
    pub crypto_device: Option<String>,
}

impl CmtabEntry {
    pub fn field(&self, field: CmtabField) -> Option<&str> {
        match field {
            CmtabField::Mountpoint => Some(&self.mountpoint),
            CmtabField::Container => Some(&self.container),
            CmtabField::LoopDevice => self.loop_device.as_deref(),
            CmtabField::CryptoDevice => self.crypto_device.as_deref(),
        }
    }

    fn encode(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\n",
            escape(&self.mountpoint),
            escape(&self.container),
            encode_optional(self.loop_device.as_deref()),
            encode_optional(self.crypto_device.as_deref()),
        )
    }

    fn decode(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let mountpoint = unescape(fields.next()?);
        let container = unescape(fields.next()?);
        let loop_device = decode_optional(fields.next()?);
        let crypto_device = decode_optional(fields.next()?);
        if mountpoint.is_empty() {
            return None;
        }
        Some(Self {
            mountpoint,
            container,
            loop_device,
            crypto_device,
        })
    }
}

fn encode_optional(value: Option<&str>) -> String {
    match value {
        Some(value) if !value.is_empty() => escape(value),
        _ => ABSENT.to_string(),
    }
}

fn decode_optional(field: &str) -> Option<String> {
    if field == ABSENT || field.is_empty() {
        None
    } else {
        Some(unescape(field))
    }
}

/// Container/loop/crypto associations for volumes this process set up.
#[derive(Debug, Clone)]
pub struct Cmtab {
    path: PathBuf,
}

impl Cmtab {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add(&self, entry: &CmtabEntry) -> VolmountResult<()> {
        append_line(&self.path, &entry.encode())
    }

    /// Most recent entry whose `field` equals `value`.
    pub fn get(&self, field: CmtabField, value: &str) -> VolmountResult<Option<CmtabEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.field(field) == Some(value))
            .last())
    }

    /// Remove the most recent match. Returns false when nothing matched.
    pub fn remove(&self, field: CmtabField, value: &str) -> VolmountResult<bool> {
        remove_last_match(&self.path, |line| {
            CmtabEntry::decode(line).is_some_and(|entry| entry.field(field) == Some(value))
        })
    }

    pub fn entries(&self) -> VolmountResult<Vec<CmtabEntry>> {
        Ok(read_lines(&self.path)?
            .iter()
            .filter_map(|line| CmtabEntry::decode(line))
            .collect())
    }
}

/// Key an smtab lookup or removal matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtabField {
    Device,
    Mountpoint,
}

/// One `/etc/mtab`-style mount record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtabEntry {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    pub options: String,
}

impl SmtabEntry {
    pub fn field(&self, field: SmtabField) -> &str {
        match field {
            SmtabField::Device => &self.device,
            SmtabField::Mountpoint => &self.mountpoint,
        }
    }

    fn encode(&self) -> String {
        let options = if self.options.is_empty() {
            "defaults"
        } else {
            &self.options
        };
        format!(
            "{} {} {} {} 0 0\n",
            escape(&self.device),
            escape(&self.mountpoint),
            escape(&self.fstype),
            escape(options),
        )
    }

    fn decode(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        Some(Self {
            device: unescape(fields.next()?),
            mountpoint: unescape(fields.next()?),
            fstype: unescape(fields.next()?),
            options: unescape(fields.next().unwrap_or("defaults")),
        })
    }
}

/// Userspace mount table. Writes are skipped when no path is configured or
/// the path is a symlink into the kernel's read-only table.
#[derive(Debug, Clone)]
pub struct Smtab {
    path: Option<PathBuf>,
}

impl Smtab {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn writable_path(&self) -> Option<&Path> {
        let path = self.path.as_deref().filter(|p| !p.as_os_str().is_empty())?;
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                debug!("smtab {} is a symlink; not updating", path.display());
                None
            }
            _ => Some(path),
        }
    }

    pub fn add(&self, entry: &SmtabEntry) -> VolmountResult<()> {
        match self.writable_path() {
            Some(path) => append_line(path, &entry.encode()),
            None => Ok(()),
        }
    }

    pub fn get(&self, field: SmtabField, value: &str) -> VolmountResult<Option<SmtabEntry>> {
        let Some(path) = self.path.as_deref() else {
            return Ok(None);
        };
        Ok(read_lines(path)?
            .iter()
            .filter_map(|line| SmtabEntry::decode(line))
            .filter(|entry| entry.field(field) == value)
            .last())
    }

    pub fn remove(&self, field: SmtabField, value: &str) -> VolmountResult<bool> {
        match self.writable_path() {
            Some(path) => remove_last_match(path, |line| {
                SmtabEntry::decode(line).is_some_and(|entry| entry.field(field) == value)
            }),
            None => Ok(false),
        }
    }
}

/// Mountpoints this host created on demand, one escaped path per line.
///
/// Lets a later process (a separate `umount` run) know which directories
/// it may remove. Unset disables the list.
#[derive(Debug, Clone)]
pub struct CreatedMountpoints {
    path: Option<PathBuf>,
}

impl CreatedMountpoints {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn add(&self, mountpoint: &Path) -> VolmountResult<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        append_line(path, &format!("{}\n", escape(&mountpoint.to_string_lossy())))
    }

    pub fn contains(&self, mountpoint: &Path) -> VolmountResult<bool> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        let wanted = mountpoint.to_string_lossy();
        Ok(read_lines(path)?.iter().any(|line| unescape(line) == wanted))
    }

    pub fn remove(&self, mountpoint: &Path) -> VolmountResult<bool> {
        let Some(path) = self.path.as_deref() else {
            return Ok(false);
        };
        let wanted = mountpoint.to_string_lossy();
        remove_last_match(path, |line| unescape(line) == wanted)
    }
}

fn lock(file: File, arg: FlockArg, path: &Path) -> VolmountResult<Flock<File>> {
    Flock::lock(file, arg)
        .map_err(|(_, errno)| VolmountError::errno(format!("locking {}", path.display()), errno))
}

fn append_line(path: &Path, line: &str) -> VolmountResult<()> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o644)
        .open(path)?;
    let mut locked = lock(file, FlockArg::LockExclusive, path)?;
    locked.write_all(line.as_bytes())?;
    Ok(())
}

fn read_lines(path: &Path) -> VolmountResult<Vec<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut locked = lock(file, FlockArg::LockShared, path)?;
    let mut contents = Vec::new();
    locked.read_to_end(&mut contents)?;
    Ok(String::from_utf8_lossy(&contents)
        .lines()
        .map(str::to_string)
        .collect())
}

/// Cut the last line accepted by `matches` out of the file in place.
fn remove_last_match(path: &Path, matches: impl Fn(&str) -> bool) -> VolmountResult<bool> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    let mut locked = lock(file, FlockArg::LockExclusive, path)?;
    let mut contents = Vec::new();
    locked.read_to_end(&mut contents)?;

    let mut found = None;
    let mut start = 0;
    for line in contents.split_inclusive(|byte| *byte == b'\n') {
        let end = start + line.len();
        let text = String::from_utf8_lossy(line);
        if matches(text.trim_end_matches('\n')) {
            found = Some((start, end));
        }
        start = end;
    }
    let Some((start, end)) = found else {
        return Ok(false);
    };

    locked.seek(SeekFrom::Start(start as u64))?;
    locked.write_all(&contents[end..])?;
    locked.set_len((contents.len() - (end - start)) as u64)?;
    Ok(true)
}
