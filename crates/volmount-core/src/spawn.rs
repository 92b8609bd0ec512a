//! Launch external helpers with optional privilege drop and piped stdio.
//!
//! Children start a new session and run from `/`. Depending on
//! [`Identity`] they either keep our credentials, re-assert root, or switch
//! to a user (groups, gid, then uid). A failed switch aborts the exec so no
//! helper ever runs with credentials it was not meant to have.

use crate::argv::format_argv;
use crate::error::{VolmountError, VolmountResult};
use crate::logging::AUDIT;
use crate::privilege::UserIdentity;
use log::{debug, error};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

/// Credentials a child runs with.
#[derive(Debug, Clone)]
pub enum Identity {
    /// Whatever this process has.
    Inherit,
    /// Full root when we are root; otherwise the same as `Inherit`.
    Root,
    User(UserIdentity),
}

/// Which standard streams are connected to pipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StdioPipes {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl StdioPipes {
    pub const NONE: StdioPipes = StdioPipes {
        stdin: false,
        stdout: false,
        stderr: false,
    };

    /// stdin for secrets, stdout/stderr captured for diagnostics.
    pub const ALL: StdioPipes = StdioPipes {
        stdin: true,
        stdout: true,
        stderr: true,
    };

    /// Only stdout/stderr captured.
    pub const CAPTURE: StdioPipes = StdioPipes {
        stdin: false,
        stdout: true,
        stderr: true,
    };
}

/// Exit status plus whatever was captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Trimmed stderr, falling back to stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// A running helper. Call [`SpawnedChild::wait`] to reap it.
#[derive(Debug)]
pub struct SpawnedChild {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<JoinHandle<io::Result<String>>>,
    stderr: Option<JoinHandle<io::Result<String>>>,
    _sigchld: SignalDisposition,
}

impl SpawnedChild {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Write `payload` to the child's stdin and close it.
    ///
    /// Fails when stdin was not requested or the child went away.
    pub fn write_stdin(&mut self, payload: &[u8]) -> VolmountResult<()> {
        let Some(mut stdin) = self.stdin.take() else {
            return Err(VolmountError::Provider(format!(
                "{} was spawned without a stdin pipe",
                self.program
            )));
        };
        pipe_write(&mut stdin, payload).map_err(VolmountError::Io)
    }

    /// Close stdin, reap the child and collect captured output.
    pub fn wait(mut self) -> VolmountResult<ExitReport> {
        drop(self.stdin.take());
        let status = self.child.wait()?;
        let stdout = join_reader(self.stdout.take(), "stdout")?;
        let stderr = join_reader(self.stderr.take(), "stderr")?;
        let status = status.code().unwrap_or(-1);
        debug!("{} (pid {}) exited with {status}", self.program, self.child.id());
        Ok(ExitReport {
            status,
            stdout,
            stderr,
        })
    }
}

/// Start `argv[0]` with `argv[1..]` and `env` added to our environment.
pub fn spawn(
    argv: &[String],
    pipes: StdioPipes,
    identity: &Identity,
    env: &[(&str, &str)],
) -> VolmountResult<SpawnedChild> {
    let Some((program, args)) = argv.split_first() else {
        return Err(VolmountError::InvalidConfig(
            "cannot spawn an empty command".to_string(),
        ));
    };
    debug!("command: {}", format_argv(argv));

    let mut command = Command::new(program);
    command.args(args);
    command.stdin(if pipes.stdin {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });
    command.stdout(if pipes.stdout {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });
    command.stderr(if pipes.stderr {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });

    command.envs(env.iter().copied());
    if let Identity::User(user) = identity {
        command.env("HOME", &user.home);
        command.env("USER", &user.name);
    }

    let credentials = ChildCredentials::from(identity);
    // SAFETY: the hook only issues async-signal-safe syscalls and touches
    // no memory allocated after fork.
    unsafe {
        command.pre_exec(move || credentials.apply());
    }

    let sigchld = SignalDisposition::set(Signal::SIGCHLD, SigHandler::SigDfl);
    let mut child = command.spawn().map_err(|source| VolmountError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take().map(spawn_output_reader);
    let stderr = child.stderr.take().map(spawn_output_reader);

    Ok(SpawnedChild {
        program: program.clone(),
        child,
        stdin,
        stdout,
        stderr,
        _sigchld: sigchld,
    })
}

/// Spawn, feed `input` (if any) on stdin, and wait.
///
/// A failed stdin write is logged; the exit status still decides the outcome.
pub fn run(
    argv: &[String],
    identity: &Identity,
    input: Option<&[u8]>,
    env: &[(&str, &str)],
) -> VolmountResult<ExitReport> {
    let pipes = StdioPipes {
        stdin: input.is_some(),
        ..StdioPipes::CAPTURE
    };
    let mut child = spawn(argv, pipes, identity, env)?;
    if let Some(payload) = input {
        if let Err(err) = child.write_stdin(payload) {
            error!(target: AUDIT, "writing to {} failed: {err}", child.program());
        }
    }
    child.wait()
}

/// Write to a pipe with SIGPIPE ignored for the duration.
pub fn pipe_write<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let _sigpipe = SignalDisposition::set(Signal::SIGPIPE, SigHandler::SigIgn);
    writer.write_all(payload)?;
    writer.flush()
}

/// Installs a signal disposition and puts the previous one back on drop.
#[derive(Debug)]
struct SignalDisposition {
    signal: Signal,
    previous: Option<SigAction>,
}

impl SignalDisposition {
    fn set(signal: Signal, handler: SigHandler) -> Self {
        let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
        // SAFETY: only SIG_DFL/SIG_IGN are installed, never a Rust handler.
        let previous = unsafe { signal::sigaction(signal, &action) }.ok();
        Self { signal, previous }
    }
}

impl Drop for SignalDisposition {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            // SAFETY: restores the disposition that was active before `set`.
            let _ = unsafe { signal::sigaction(self.signal, &previous) };
        }
    }
}

/// Plain-data copy of [`Identity`] that is safe to use after fork.
#[derive(Debug, Clone)]
enum ChildCredentials {
    Inherit,
    Root,
    User {
        uid: libc::uid_t,
        gid: libc::gid_t,
        groups: Vec<libc::gid_t>,
    },
}

impl From<&Identity> for ChildCredentials {
    fn from(identity: &Identity) -> Self {
        match identity {
            Identity::Inherit => ChildCredentials::Inherit,
            Identity::Root => ChildCredentials::Root,
            Identity::User(user) => ChildCredentials::User {
                uid: user.uid,
                gid: user.gid,
                groups: user.groups.clone(),
            },
        }
    }
}

impl ChildCredentials {
    fn apply(&self) -> io::Result<()> {
        unsafe {
            libc::setsid();
            if libc::chdir(c"/".as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            match self {
                ChildCredentials::Inherit => {}
                ChildCredentials::Root => {
                    if libc::geteuid() == 0 && libc::setuid(0) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                ChildCredentials::User { uid, gid, groups } => {
                    if libc::geteuid() == 0
                        && !groups.is_empty()
                        && libc::setgroups(groups.len() as _, groups.as_ptr()) != 0
                    {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setgid(*gid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setuid(*uid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
            }
        }
        Ok(())
    }
}

fn spawn_output_reader<R>(mut pipe: R) -> JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> io::Result<String> {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

fn join_reader(
    handle: Option<JoinHandle<io::Result<String>>>,
    stream: &str,
) -> VolmountResult<String> {
    match handle {
        Some(handle) => Ok(handle.join().map_err(|_| {
            VolmountError::Provider(format!("{stream} reader thread panicked"))
        })??),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn captures_output_and_status() {
        let report = run(&sh("echo out; echo err >&2; exit 3"), &Identity::Inherit, None, &[]).unwrap();
        assert_eq!(report.status, 3);
        assert_eq!(report.stdout, "out\n");
        assert_eq!(report.diagnostic(), "err");
        assert!(!report.success());
    }

    #[test]
    fn stdin_payload_reaches_child() {
        let dir = tempdir().unwrap();
        let sink = dir.path().join("stdin");
        let script = format!("cat > {}", sink.display());
        let report = run(&sh(&script), &Identity::Root, Some(b"s3cret"), &[]).unwrap();
        assert!(report.success());
        assert_eq!(fs::read(&sink).unwrap(), b"s3cret");
    }

    #[test]
    fn extra_environment_is_exported() {
        let report = run(
            &sh("printf %s \"$PASSWD_FD\""),
            &Identity::Inherit,
            None,
            &[("PASSWD_FD", "0")],
        )
        .unwrap();
        assert_eq!(report.stdout, "0");
    }

    #[test]
    fn child_runs_from_root_directory() {
        let report = run(&sh("pwd"), &Identity::Inherit, None, &[]).unwrap();
        assert_eq!(report.stdout.trim(), "/");
    }

    #[test]
    fn user_identity_exports_home_and_user() {
        let me = UserIdentity::current().unwrap();
        let report = run(
            &sh("printf '%s:%s' \"$USER\" \"$HOME\""),
            &Identity::User(me.clone()),
            None,
            &[],
        )
        .unwrap();
        assert_eq!(report.stdout, format!("{}:{}", me.name, me.home.display()));
    }

    #[test]
    fn writing_to_exited_child_is_not_fatal() {
        let report = run(&sh("exit 0"), &Identity::Inherit, Some(&[0u8; 1 << 20]), &[]).unwrap();
        assert!(report.success());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = spawn(
            &["/nonexistent/volmount-helper".to_string()],
            StdioPipes::NONE,
            &Identity::Inherit,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, VolmountError::Spawn { .. }));
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(spawn(&[], StdioPipes::NONE, &Identity::Inherit, &[]).is_err());
    }
}
