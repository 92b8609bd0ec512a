//! Logging bootstrap shared by volmount binaries.

use env_logger::Builder;
use log::LevelFilter;
use std::env;

/// Target for messages that must reach the log regardless of verbosity.
pub const AUDIT: &str = "volmount::audit";

/// Environment variable overriding the default filter.
pub const LOG_ENV: &str = "VOLMOUNT_LOG";

/// Install the process-wide logger.
///
/// `default_level` uses `env_logger` filter syntax and applies unless
/// `VOLMOUNT_LOG` is set. The audit target never drops below `info`.
pub fn init(default_level: &str) {
    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_filters(default_level);
    if let Ok(spec) = env::var(LOG_ENV) {
        if !spec.trim().is_empty() {
            builder.parse_filters(&spec);
        }
    }
    builder.filter_module(AUDIT, LevelFilter::Info);
    builder.format_timestamp_secs();
    let _ = builder.try_init();
}

/// Default filter for the given debug switch.
pub fn level_for(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "warn"
    }
}
