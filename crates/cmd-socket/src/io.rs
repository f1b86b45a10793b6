//! Non-blocking partial I/O on the command socket.
//!
//! Both primitives do one bounded burst and return. Interrupts are retried,
//! would-block ends the burst early, and anything else is a [`FatalError`].
//! `errno` is restored on return so callers see the value they had before.

use std::io;
use std::os::fd::{AsFd, AsRawFd};

use nix::errno::Errno;
use tracing::debug;

use crate::error::FatalError;

/// Restores the thread's `errno` on drop.
struct ErrnoGuard(i32);

impl ErrnoGuard {
    fn save() -> Self {
        Self(Errno::last() as i32)
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        // SAFETY: __errno_location returns a valid pointer to this thread's errno.
        unsafe {
            *libc::__errno_location() = self.0;
        }
    }
}

/// Receive whatever is already queued, up to `buf.len()` bytes.
///
/// Returns 0 without blocking when nothing is queued. An orderly shutdown by
/// the peer also shows up as 0.
pub fn receive_available<F: AsFd>(fd: F, buf: &mut [u8]) -> Result<usize, FatalError> {
    let _errno = ErrnoGuard::save();
    let raw = fd.as_fd().as_raw_fd();

    let mut queued: libc::c_int = 0;
    // SAFETY: FIONREAD stores a single c_int into `queued`, which outlives the call.
    let ret = unsafe { libc::ioctl(raw, libc::FIONREAD, std::ptr::addr_of_mut!(queued)) };
    if ret < 0 || queued <= 0 {
        return Ok(0);
    }

    let mut want = usize::try_from(queued).unwrap_or(0).min(buf.len());
    let mut total = 0;
    while want > 0 {
        let Some(dst) = buf.get_mut(total..total + want) else {
            break;
        };
        // SAFETY: dst is a writable region of exactly dst.len() bytes.
        let n = unsafe { libc::recv(raw, dst.as_mut_ptr().cast(), dst.len(), libc::MSG_DONTWAIT) };
        if n < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                // EWOULDBLOCK aliases EAGAIN on Linux
                Errno::EAGAIN => break,
                errno => {
                    return Err(FatalError::Io {
                        op: "read from",
                        fd: raw,
                        source: io::Error::from(errno),
                    });
                }
            }
        }
        if n == 0 {
            break;
        }
        let n = n.unsigned_abs();
        total += n;
        want = want.saturating_sub(n);
    }
    Ok(total)
}

/// Send `buf`, stopping early if the peer is gone or the socket is full.
///
/// Returns the number of bytes written. A disconnected peer (`EPIPE`,
/// `ECONNRESET`) is not an error.
pub fn send_all<F: AsFd>(fd: F, buf: &[u8]) -> Result<usize, FatalError> {
    let _errno = ErrnoGuard::save();
    let raw = fd.as_fd().as_raw_fd();

    let mut sent = 0;
    while let Some(src) = buf.get(sent..).filter(|s| !s.is_empty()) {
        // SAFETY: src is a readable region of exactly src.len() bytes.
        let n = unsafe { libc::send(raw, src.as_ptr().cast(), src.len(), libc::MSG_NOSIGNAL) };
        if n < 0 {
            match Errno::last() {
                Errno::EINTR => continue,
                errno @ (Errno::EPIPE | Errno::ECONNRESET | Errno::EAGAIN) => {
                    debug!(fd = raw, %errno, sent, "send stopped early");
                    break;
                }
                errno => {
                    return Err(FatalError::Io {
                        op: "write to",
                        fd: raw,
                        source: io::Error::from(errno),
                    });
                }
            }
        }
        sent += n.unsigned_abs();
    }
    Ok(sent)
}
