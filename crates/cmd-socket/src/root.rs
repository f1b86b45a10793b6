//! Re-rooting the daemon: `chdir` into the new root, `chroot(".")`,
//! `chdir("/")`, then re-execute the same image with the same arguments.
//!
//! A step failing with `ENOENT` is logged and skipped, which can leave the
//! process half way between roots. Any other failure is fatal.
//!
//! The listening socket survives the exec: its close-on-exec flag is cleared
//! and its number is passed in [`LISTEN_FD_ENV`] for
//! [`Listener::open`](crate::socket::Listener::open) to pick up.

use std::ffi::{CStr, CString};
use std::fmt;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::ffi::OsStringExt;

use nix::errno::Errno;
use tracing::{info, warn};

use crate::error::FatalError;
use crate::params::{DaemonParams, LISTEN_FD_ENV};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStep {
    EnterNewRoot,
    ChangeRoot,
    EnterRootDir,
    KeepListener,
    Exec,
}

impl fmt::Display for RootStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::EnterNewRoot => "can't change to working directory",
            Self::ChangeRoot => "can't change root directory",
            Self::EnterRootDir => "can't change to working directory",
            Self::KeepListener => "can't keep command socket open across restart",
            Self::Exec => "can't restart",
        };
        f.write_str(msg)
    }
}

/// System calls used by the transition.
pub trait RootOps {
    fn chdir(&mut self, path: &CStr) -> Result<(), Errno>;
    fn chroot(&mut self, path: &CStr) -> Result<(), Errno>;
    fn set_cloexec(&mut self, fd: RawFd, on: bool) -> Result<(), Errno>;
    /// Replace the process image. Returns only on failure.
    fn execve(&mut self, path: &CStr, argv: &[CString], env: &[CString]) -> Errno;
}

/// The real system calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRoot;

impl RootOps for SystemRoot {
    fn chdir(&mut self, path: &CStr) -> Result<(), Errno> {
        nix::unistd::chdir(path)
    }

    fn chroot(&mut self, path: &CStr) -> Result<(), Errno> {
        nix::unistd::chroot(path)
    }

    fn set_cloexec(&mut self, fd: RawFd, on: bool) -> Result<(), Errno> {
        crate::socket::set_cloexec(fd, on)
    }

    fn execve(&mut self, path: &CStr, argv: &[CString], env: &[CString]) -> Errno {
        match nix::unistd::execve(path, argv, env) {
            Ok(never) => match never {},
            Err(errno) => errno,
        }
    }
}

/// Moves the daemon into a new root and re-executes it.
pub struct RootTransition<'a, O = SystemRoot> {
    params: &'a DaemonParams,
    listener: Option<BorrowedFd<'a>>,
    ops: O,
}

impl<'a> RootTransition<'a, SystemRoot> {
    pub fn new(params: &'a DaemonParams, listener: Option<BorrowedFd<'a>>) -> Self {
        Self::with_ops(params, listener, SystemRoot)
    }
}

impl<'a, O: RootOps> RootTransition<'a, O> {
    pub fn with_ops(params: &'a DaemonParams, listener: Option<BorrowedFd<'a>>, ops: O) -> Self {
        Self {
            params,
            listener,
            ops,
        }
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Run the transition. Does not return if the exec succeeds.
    ///
    /// `Ok(())` means every failing step failed softly and the process is
    /// still running the old image, possibly inside the new root.
    pub fn run(&mut self, new_root: &CStr) -> Result<(), FatalError> {
        let root = new_root.to_string_lossy();
        info!(daemon = %self.params.name, root = %root, "restart in new root");

        let result = self.ops.chdir(new_root);
        self.check(RootStep::EnterNewRoot, &root, result)?;

        let result = self.ops.chroot(c".");
        self.check(RootStep::ChangeRoot, "", result)?;

        let result = self.ops.chdir(c"/");
        self.check(RootStep::EnterRootDir, "/", result)?;

        let listen_fd = self.listener.map(|fd| fd.as_raw_fd());
        if let Some(fd) = listen_fd {
            let result = self.ops.set_cloexec(fd, false);
            self.check(RootStep::KeepListener, &fd.to_string(), result)?;
        }

        let env = exec_env(listen_fd);
        let errno = self
            .ops
            .execve(&self.params.executable, &self.params.argv, &env);
        if let Some(fd) = listen_fd {
            let _ = self.ops.set_cloexec(fd, true);
        }
        let executable = self.params.executable.to_string_lossy();
        self.check(RootStep::Exec, &executable, Err(errno))
    }

    fn check(&self, step: RootStep, target: &str, result: Result<(), Errno>) -> Result<(), FatalError> {
        match result {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) => {
                warn!(daemon = %self.params.name, ?step, "{step} {target}");
                Ok(())
            }
            Err(source) => Err(FatalError::RootTransition {
                step,
                target: target.to_string(),
                source,
            }),
        }
    }
}

/// The current environment with [`LISTEN_FD_ENV`] set to `listen_fd`.
fn exec_env(listen_fd: Option<RawFd>) -> Vec<CString> {
    let mut env: Vec<CString> = std::env::vars_os()
        .filter(|(key, _)| key != LISTEN_FD_ENV)
        .filter_map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            CString::new(entry).ok()
        })
        .collect();
    if let Some(fd) = listen_fd
        && let Ok(entry) = CString::new(format!("{LISTEN_FD_ENV}={fd}"))
    {
        env.push(entry);
    }
    env
}
