//! Error taxonomy shared by the volmount crates.

use crate::config::CommandKind;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type VolmountResult<T> = Result<T, VolmountError>;

/// Coarse failure class, mirrored into the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    ResourceExhausted,
    ExternalTool,
    System,
    Indeterminate,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ResourceExhausted => "resource-exhausted",
            ErrorKind::ExternalTool => "external-tool",
            ErrorKind::System => "system",
            ErrorKind::Indeterminate => "indeterminate",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum VolmountError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("volume rejected: {0}")]
    Validation(String),

    #[error("{0} not defined in configuration")]
    CommandNotDefined(CommandKind),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{tool} exited with status {status}: {diagnostic}")]
    ToolFailed {
        tool: String,
        status: i32,
        diagnostic: String,
    },

    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{context}: {source}")]
    Errno {
        context: String,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("cannot determine state: {0}")]
    Indeterminate(String),

    #[error("unknown digest `{0}`")]
    UnknownDigest(String),

    #[error("unknown cipher `{0}`")]
    UnknownCipher(String),

    #[error("cannot decrypt key file {path}: {reason}")]
    KeyDecryption { path: PathBuf, reason: String },

    #[error("privilege error: {0}")]
    Privilege(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl VolmountError {
    pub fn errno(context: impl Into<String>, source: nix::errno::Errno) -> Self {
        VolmountError::Errno {
            context: context.into(),
            source,
        }
    }

    /// Which taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VolmountError::InvalidConfig(_)
            | VolmountError::Validation(_)
            | VolmountError::CommandNotDefined(_)
            | VolmountError::UnknownDigest(_)
            | VolmountError::UnknownCipher(_)
            | VolmountError::KeyDecryption { .. }
            | VolmountError::Toml(_)
            | VolmountError::Yaml(_) => ErrorKind::Validation,
            VolmountError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            VolmountError::ToolFailed { .. } | VolmountError::Provider(_) => {
                ErrorKind::ExternalTool
            }
            VolmountError::Spawn { .. }
            | VolmountError::Io(_)
            | VolmountError::Errno { .. }
            | VolmountError::Privilege(_) => ErrorKind::System,
            VolmountError::Indeterminate(_) => ErrorKind::Indeterminate,
        }
    }
}
