//! Peer credentials of a connected Unix socket.
//!
//! The kernel records the peer's pid/uid/gid at `connect()` time, so the
//! values cannot be forged by the peer afterwards.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use crate::error::CredentialError;

/// The uid allowed to issue commands.
pub const SUPERUSER_UID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredential {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCredential {
    pub fn is_superuser(&self) -> bool {
        self.uid == SUPERUSER_UID
    }
}

/// Where the dispatcher gets peer credentials from.
pub trait CredentialSource {
    fn peer_credentials(&self, fd: BorrowedFd<'_>) -> Result<PeerCredential, CredentialError>;
}

/// Reads credentials from the kernel with `SO_PEERCRED`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelCredentials;

impl CredentialSource for KernelCredentials {
    fn peer_credentials(&self, fd: BorrowedFd<'_>) -> Result<PeerCredential, CredentialError> {
        peer_credentials(fd)
    }
}

/// Query `SO_PEERCRED` on a connected socket.
///
/// The returned record must be exactly `sizeof(struct ucred)`; anything else
/// is a [`CredentialError::SizeMismatch`].
pub fn peer_credentials<F: AsFd>(fd: F) -> Result<PeerCredential, CredentialError> {
    let expected = std::mem::size_of::<libc::ucred>();
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = expected as libc::socklen_t;

    // SAFETY: cred is a writable ucred and len holds its size; the kernel
    // writes at most len bytes and updates len.
    let ret = unsafe {
        libc::getsockopt(
            fd.as_fd().as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast(),
            &mut len,
        )
    };
    if ret < 0 {
        return Err(CredentialError::Os(io::Error::last_os_error()));
    }

    let actual = len as usize;
    if actual != expected {
        return Err(CredentialError::SizeMismatch { expected, actual });
    }

    Ok(PeerCredential {
        pid: cred.pid,
        uid: cred.uid,
        gid: cred.gid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn socketpair_reports_own_process() {
        let (a, _b) = UnixStream::pair().unwrap();
        let cred = peer_credentials(&a).unwrap();
        assert_eq!(cred.pid, std::process::id() as i32);
        assert_eq!(cred.uid, nix::unistd::getuid().as_raw());
        assert_eq!(cred.gid, nix::unistd::getgid().as_raw());
    }

    #[test]
    fn non_socket_is_os_error() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let err = peer_credentials(&file).unwrap_err();
        assert!(matches!(err, CredentialError::Os(_)));
    }

    #[test]
    fn superuser_check() {
        let root = PeerCredential {
            pid: 1,
            uid: 0,
            gid: 0,
        };
        assert!(root.is_superuser());
        let user = PeerCredential { uid: 1000, ..root };
        assert!(!user.is_superuser());
    }
}
