#![forbid(unsafe_code)]

//! System provider for dm-crypt backed volumes.
//!
//! Integrates with the host via:
//! - `losetup` (attach file containers, detach on unload)
//! - `cryptsetup` (isLuks/open/status/close)

mod command;
mod loopdev;
mod system;

pub use system::SystemDmCryptProvider;
