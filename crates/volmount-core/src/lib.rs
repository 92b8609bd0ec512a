//! Core building blocks shared by volmount binaries.
//!
//! Configuration, command templating, privileged spawning, the association
//! store and the mount state machine live here. Crypto backends implement
//! [`crypto::CryptoProvider`] in their own crates.

pub mod argv;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keyfile;
pub mod logging;
pub mod mount;
pub mod mtab;
pub mod ofl;
pub mod privilege;
pub mod spawn;
pub mod template;

pub use config::{
    CommandKind, ConfigFormat, MountOptions, Policy, Volume, VolumeKind, VolumeSource,
    VolmountConfig,
};
pub use crypto::{CryptoProvider, EhdMountInfo, EhdMountRequest, LowerDevice, UnloadOutcome};
pub use error::{ErrorKind, VolmountError, VolmountResult};
pub use mount::{Direction, MountService};
pub use mtab::{Cmtab, CmtabEntry, CmtabField, CreatedMountpoints, Smtab, SmtabField};
