use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::errno::Errno;

use crate::root::RootStep;

/// Errors after which the control channel can no longer be trusted.
///
/// The core never exits on its own; whoever owns the process passes these to
/// [`terminate`].
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("unable to {op} socket {fd}: {source}")]
    Io {
        op: &'static str,
        fd: RawFd,
        source: io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] cmd_proto::ProtocolError),

    #[error("{step} {target}: {source}")]
    RootTransition {
        step: RootStep,
        target: String,
        source: Errno,
    },
}

/// Socket setup failures. None of these terminate the process.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("address already in use")]
    AddressInUse,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("socket name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("can not {op} UNIX socket: {source}")]
    Os {
        op: &'static str,
        source: io::Error,
    },
}

/// Peer credentials could not be established.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("can not get credentials from UNIX socket: {0}")]
    Os(#[source] io::Error),

    #[error("short credentials from UNIX socket: got {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("can not resolve executable path: {0}")]
    Executable(#[source] io::Error),

    #[error("{0} contains an interior NUL byte")]
    InteriorNul(&'static str),
}

/// Sender-side failures.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Token(#[from] cmd_proto::TokenError),

    #[error(transparent)]
    Protocol(#[from] cmd_proto::ProtocolError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("poll failed: {0}")]
    Poll(#[source] Errno),

    #[error("no reply within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("connection closed before reply")]
    Closed,
}

/// Report a fatal error and exit.
pub fn terminate(daemon: &str, err: &FatalError) -> ! {
    tracing::error!(daemon, "{err}");
    std::process::exit(1)
}
