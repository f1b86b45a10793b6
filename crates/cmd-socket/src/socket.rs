//! Abstract-namespace socket setup for the daemon (listener) and senders
//! (connector).

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use tracing::{error, info, warn};

use crate::error::SocketError;
use crate::params::{DaemonParams, Endpoint, LISTEN_FD_ENV};

/// Set once the inherited listener has been adopted, so the descriptor is
/// never wrapped twice.
static INHERITED_TAKEN: AtomicBool = AtomicBool::new(false);

/// Listening command socket.
///
/// Owned by the daemon for its whole lifetime and borrowed by the accept loop
/// and the root transition.
#[derive(Debug)]
pub struct Listener {
    inner: UnixListener,
}

impl Listener {
    /// Open the listening socket.
    ///
    /// A descriptor handed over by a previous image (see [`LISTEN_FD_ENV`]) is
    /// adopted instead of binding a new one.
    /// [`SocketError::AddressInUse`] means another instance already owns the
    /// endpoint.
    pub fn open(params: &DaemonParams) -> Result<Self, SocketError> {
        if let Some(listener) = Self::inherit(&params.endpoint) {
            info!(daemon = %params.name, fd = listener.as_raw_fd(), "reusing inherited command socket");
            return Ok(listener);
        }

        let fd = new_socket().inspect_err(|e| error!(daemon = %params.name, "{e}"))?;
        let (addr, len) = abstract_addr(&params.endpoint)?;

        // SAFETY: addr is an initialised sockaddr_un and len does not exceed its size.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast(),
                len,
            )
        };
        if ret < 0 {
            let source = io::Error::last_os_error();
            if source.raw_os_error() == Some(libc::EADDRINUSE) {
                return Err(SocketError::AddressInUse);
            }
            let err = SocketError::Os {
                op: "bind a name to",
                source,
            };
            error!(daemon = %params.name, "{err}");
            return Err(err);
        }

        // SAFETY: fd is a bound stream socket.
        if unsafe { libc::listen(fd.as_raw_fd(), libc::SOMAXCONN) } < 0 {
            let err = SocketError::Os {
                op: "listen on",
                source: io::Error::last_os_error(),
            };
            error!(daemon = %params.name, "{err}");
            return Err(err);
        }

        Ok(Self {
            inner: UnixListener::from(fd),
        })
    }

    /// Accept one pending connection, if any.
    ///
    /// The returned stream is non-blocking and close-on-exec.
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        match self.inner.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true)?;
                Ok(Some(stream))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn inherit(endpoint: &Endpoint) -> Option<Self> {
        let raw: RawFd = std::env::var(LISTEN_FD_ENV).ok()?.parse().ok()?;
        if INHERITED_TAKEN.swap(true, Ordering::SeqCst) {
            return None;
        }
        let listener = Self::adopt(raw, endpoint);
        if listener.is_none() {
            warn!(fd = raw, "ignoring {LISTEN_FD_ENV}: not our command socket");
        }
        listener
    }

    /// Take ownership of `raw` if it is a listening socket bound to `endpoint`.
    ///
    /// When this returns `None` the descriptor is left untouched.
    fn adopt(raw: RawFd, endpoint: &Endpoint) -> Option<Self> {
        if raw < 0 || !is_listener_for(raw, endpoint) {
            return None;
        }
        set_cloexec(raw, true).ok()?;
        // SAFETY: raw is an open listening socket handed over by the previous
        // image; nothing else in this process owns it.
        let inner = unsafe { UnixListener::from_raw_fd(raw) };
        if inner.set_nonblocking(true).is_err() {
            // Leave it open; ownership was never really ours.
            let _ = inner.into_raw_fd();
            return None;
        }
        Some(Self { inner })
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl From<Listener> for OwnedFd {
    fn from(listener: Listener) -> Self {
        listener.inner.into()
    }
}

/// Connect to the daemon's command socket.
///
/// [`SocketError::ConnectionRefused`] (no daemon listening) is returned
/// without any diagnostic; other failures are logged.
pub fn open_connection(params: &DaemonParams) -> Result<UnixStream, SocketError> {
    let fd = new_socket().inspect_err(|e| error!(daemon = %params.name, "{e}"))?;
    let (addr, len) = abstract_addr(&params.endpoint)?;

    // SAFETY: addr is an initialised sockaddr_un and len does not exceed its size.
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr).cast(),
            len,
        )
    };
    if ret < 0 {
        let source = io::Error::last_os_error();
        if source.raw_os_error() == Some(libc::ECONNREFUSED) {
            return Err(SocketError::ConnectionRefused);
        }
        let err = SocketError::Os {
            op: "connect on",
            source,
        };
        error!(daemon = %params.name, "{err}");
        return Err(err);
    }

    Ok(UnixStream::from(fd))
}

/// Non-blocking, close-on-exec stream socket with `SO_PASSCRED` enabled.
fn new_socket() -> Result<OwnedFd, SocketError> {
    // SAFETY: socket(2) with constant arguments; the result is checked below.
    let raw = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if raw < 0 {
        return Err(SocketError::Os {
            op: "open",
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: raw is a freshly created descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let one: libc::c_int = 1;
    // SAFETY: `one` is a c_int that outlives the call and its size is passed.
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SocketError::Os {
            op: "set option for",
            source: io::Error::last_os_error(),
        });
    }
    Ok(fd)
}

/// Build the abstract address for `endpoint`: `sun_path[0]` is NUL and the
/// length covers only the name bytes.
fn abstract_addr(endpoint: &Endpoint) -> Result<(libc::sockaddr_un, libc::socklen_t), SocketError> {
    // SAFETY: sockaddr_un is plain old data; all zeroes is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let name = endpoint.name().as_bytes();
    let dst = addr
        .sun_path
        .get_mut(1..1 + name.len())
        .ok_or(SocketError::NameTooLong(name.len()))?;
    for (d, s) in dst.iter_mut().zip(name) {
        *d = *s as libc::c_char;
    }

    let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + 1 + name.len();
    Ok((addr, len as libc::socklen_t))
}

/// Whether `raw` is an open, listening Unix socket bound to `endpoint`.
fn is_listener_for(raw: RawFd, endpoint: &Endpoint) -> bool {
    let mut accepting: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: accepting is a writable c_int and len holds its size. A closed
    // descriptor just makes the call fail with EBADF.
    let ret = unsafe {
        libc::getsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            std::ptr::addr_of_mut!(accepting).cast(),
            &mut len,
        )
    };
    if ret < 0 || accepting == 0 {
        return false;
    }

    let Ok((expected, expected_len)) = abstract_addr(endpoint) else {
        return false;
    };
    // SAFETY: sockaddr_un is plain old data; all zeroes is a valid value.
    let mut actual: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    let mut actual_len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    // SAFETY: actual is a writable sockaddr_un and actual_len holds its size.
    let ret = unsafe {
        libc::getsockname(
            raw,
            std::ptr::addr_of_mut!(actual).cast(),
            &mut actual_len,
        )
    };
    ret == 0
        && actual.sun_family == expected.sun_family
        && actual_len == expected_len
        && actual.sun_path == expected.sun_path
}

/// Set or clear `FD_CLOEXEC` on `fd`.
pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> Result<(), Errno> {
    // SAFETY: F_GETFD takes no argument and only reads descriptor flags.
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let flags = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    // SAFETY: F_SETFD with an int flag set derived from F_GETFD.
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags) })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    fn params() -> DaemonParams {
        let name = format!(
            "/cmd-socket/unit/{}/{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        );
        DaemonParams::new(
            "test",
            Path::new("/bin/true"),
            [OsString::from("true")],
            Endpoint::new(name),
        )
        .unwrap()
    }

    fn cloexec(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn abstract_addr_layout() {
        let (addr, len) = abstract_addr(&Endpoint::new("abc")).unwrap();
        assert_eq!(addr.sun_path[0], 0);
        assert_eq!(addr.sun_path[1] as u8, b'a');
        assert_eq!(addr.sun_path[3] as u8, b'c');
        assert_eq!(
            len as usize,
            std::mem::offset_of!(libc::sockaddr_un, sun_path) + 4
        );
    }

    #[test]
    fn abstract_addr_rejects_long_name() {
        let err = abstract_addr(&Endpoint::new("x".repeat(200))).unwrap_err();
        assert!(matches!(err, SocketError::NameTooLong(200)));
    }

    #[test]
    fn listener_is_cloexec_and_accepts_nothing() {
        let params = params();
        let listener = Listener::open(&params).unwrap();
        assert!(cloexec(listener.as_raw_fd()));
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn second_listener_reports_address_in_use() {
        let params = params();
        let _first = Listener::open(&params).unwrap();
        let err = Listener::open(&params).unwrap_err();
        assert!(matches!(err, SocketError::AddressInUse));
    }

    #[test]
    fn connect_and_accept() {
        let params = params();
        let listener = Listener::open(&params).unwrap();
        let _client = open_connection(&params).unwrap();
        let server = listener.accept().unwrap().expect("pending connection");
        assert!(cloexec(server.as_raw_fd()));
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let err = open_connection(&params()).unwrap_err();
        assert!(matches!(err, SocketError::ConnectionRefused));
    }

    #[test]
    fn adopt_own_listener() {
        let params = params();
        let listener = Listener::open(&params).unwrap();
        let raw = OwnedFd::from(listener).into_raw_fd();
        set_cloexec(raw, false).unwrap();

        let adopted = Listener::adopt(raw, &params.endpoint).expect("adopted");
        assert_eq!(adopted.as_raw_fd(), raw);
        assert!(cloexec(raw));

        let _client = open_connection(&params).unwrap();
        assert!(adopted.accept().unwrap().is_some());
    }

    #[test]
    fn adopt_rejects_foreign_descriptors() {
        let params = params();
        let other = params_with_name("elsewhere");
        let listener = Listener::open(&other).unwrap();
        assert!(Listener::adopt(listener.as_raw_fd(), &params.endpoint).is_none());

        let (a, _b) = UnixStream::pair().unwrap();
        assert!(Listener::adopt(a.as_raw_fd(), &params.endpoint).is_none());
        assert!(Listener::adopt(-1, &params.endpoint).is_none());
    }

    fn params_with_name(suffix: &str) -> DaemonParams {
        let mut p = params();
        p.endpoint = Endpoint::new(format!("{}/{suffix}", p.endpoint.name()));
        p
    }

    #[test]
    fn set_cloexec_toggles() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        set_cloexec(fd, false).unwrap();
        assert!(!cloexec(fd));
        set_cloexec(fd, true).unwrap();
        assert!(cloexec(fd));
    }
}
