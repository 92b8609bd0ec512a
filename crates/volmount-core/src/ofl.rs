//! Open-file killer: signal processes that pin a mountpoint.
//!
//! A process holds the mountpoint when its cwd, root, executable or any open
//! descriptor resolves below it. Stages run HUP, TERM, KILL in that order,
//! each only if enabled, pausing `wait_ms` after every stage that signalled.

use crate::config::SignalPolicy;
use crate::logging::AUDIT;
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

const PROCESS_LINKS: [&str; 3] = ["cwd", "root", "exe"];

/// Pids under `proc_root` holding anything below `mountpoint`, excluding us.
pub fn holders(proc_root: &Path, mountpoint: &Path) -> Vec<i32> {
    let own = getpid().as_raw();
    let Ok(entries) = fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut pids: Vec<i32> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| *pid != own)
        .filter(|pid| process_holds(&proc_root.join(pid.to_string()), mountpoint))
        .collect();
    pids.sort_unstable();
    pids
}

fn process_holds(process: &Path, mountpoint: &Path) -> bool {
    let below = |link: &Path| {
        fs::read_link(link)
            .map(|target| target.starts_with(mountpoint))
            .unwrap_or(false)
    };

    if PROCESS_LINKS
        .iter()
        .any(|name| below(&process.join(name)))
    {
        return true;
    }

    match fs::read_dir(process.join("fd")) {
        Ok(fds) => fds.flatten().any(|fd| below(&fd.path())),
        Err(_) => false,
    }
}

/// Apply the configured escalation. Returns how many signals were delivered.
pub fn kill_holders(proc_root: &Path, mountpoint: &Path, policy: &SignalPolicy) -> usize {
    let stages = [
        (policy.hup, Signal::SIGHUP),
        (policy.term, Signal::SIGTERM),
        (policy.kill, Signal::SIGKILL),
    ];
    let mut delivered = 0;

    for (enabled, signal) in stages {
        if !enabled {
            continue;
        }
        let pids = holders(proc_root, mountpoint);
        if pids.is_empty() {
            debug!("no processes left under {}", mountpoint.display());
            break;
        }
        for pid in pids {
            match kill(Pid::from_raw(pid), signal) {
                Ok(()) => {
                    warn!(
                        target: AUDIT,
                        "sent {signal} to pid {pid} holding {}",
                        mountpoint.display()
                    );
                    delivered += 1;
                }
                Err(errno) => debug!("kill({pid}, {signal}) failed: {errno}"),
            }
        }
        if policy.wait_ms > 0 {
            thread::sleep(Duration::from_millis(policy.wait_ms));
        }
    }

    delivered
}
