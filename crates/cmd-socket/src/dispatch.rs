//! Per-connection command handling.
//!
//! One request per connection, strictly in order:
//!
//! 1. read the 2-byte header, then the length byte and argument if announced
//! 2. fetch the peer's credentials; drop the connection if that fails
//! 3. reject non-root peers with [`NAK`] and stop
//! 4. run the command, replying [`ACK`] before acting or [`NAK`] if unknown
//! 5. close the connection
//!
//! Reads never block. When the frame is incomplete, [`Connection::advance`]
//! hands the connection back as [`Progress::Pending`] with its partial state
//! intact.

use std::ffi::{CStr, CString};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use cmd_proto::{ACK, CommandKind, FrameReader, NAK, Request};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, warn};

use crate::credentials::CredentialSource;
use crate::error::{CredentialError, FatalError};
use crate::io;
use crate::root::{RootOps, RootTransition};

/// Privileged actions a command can trigger.
pub trait CommandActions {
    /// Move into `new_root` and restart. Returns only if the restart did not
    /// happen and every failure along the way was soft.
    fn change_root(&mut self, new_root: &CStr) -> Result<(), FatalError>;
}

impl<O: RootOps> CommandActions for RootTransition<'_, O> {
    fn change_root(&mut self, new_root: &CStr) -> Result<(), FatalError> {
        self.run(new_root)
    }
}

/// Why a request was answered with [`NAK`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unauthorized { uid: u32 },
    UnknownCommand(u8),
    MissingArgument(CommandKind),
    InvalidArgument(CommandKind),
}

/// Why a connection was dropped without a reply.
#[derive(Debug)]
pub enum Abandon {
    /// The frame was not complete when reading stopped.
    Incomplete,
    /// The peer closed the connection mid-frame.
    PeerClosed,
    /// The frame did not complete before the deadline.
    TimedOut,
    Credentials(CredentialError),
}

#[derive(Debug)]
pub enum Outcome {
    Rejected(Rejection),
    Abandoned(Abandon),
    /// The root transition ran but did not replace the process image.
    RootTransitionReturned,
}

/// Authorizes and executes complete requests.
pub struct Dispatcher<C, A> {
    credentials: C,
    actions: A,
}

impl<C: CredentialSource, A: CommandActions> Dispatcher<C, A> {
    pub fn new(credentials: C, actions: A) -> Self {
        Self {
            credentials,
            actions,
        }
    }

    pub fn actions(&self) -> &A {
        &self.actions
    }

    fn dispatch(&mut self, stream: &UnixStream, request: Request) -> Result<Outcome, FatalError> {
        let cred = match self.credentials.peer_credentials(stream.as_fd()) {
            Ok(cred) => cred,
            Err(e) => {
                warn!("{e}");
                return Ok(Outcome::Abandoned(Abandon::Credentials(e)));
            }
        };
        if !cred.is_superuser() {
            warn!(
                pid = cred.pid,
                uid = cred.uid,
                code = request.code,
                "rejecting command from unprivileged peer"
            );
            reply(stream, NAK)?;
            return Ok(Outcome::Rejected(Rejection::Unauthorized { uid: cred.uid }));
        }

        info!(pid = cred.pid, code = request.code, "received command");
        match request.kind() {
            Some(CommandKind::Chroot) => self.change_root(stream, request.argument),
            None => {
                reply(stream, NAK)?;
                Ok(Outcome::Rejected(Rejection::UnknownCommand(request.code)))
            }
        }
    }

    fn change_root(
        &mut self,
        stream: &UnixStream,
        argument: Option<Vec<u8>>,
    ) -> Result<Outcome, FatalError> {
        let kind = CommandKind::Chroot;
        let Some(argument) = argument.filter(|a| !a.is_empty()) else {
            reply(stream, NAK)?;
            return Ok(Outcome::Rejected(Rejection::MissingArgument(kind)));
        };
        let Ok(new_root) = CString::new(argument) else {
            reply(stream, NAK)?;
            return Ok(Outcome::Rejected(Rejection::InvalidArgument(kind)));
        };

        reply(stream, ACK)?;
        self.actions.change_root(&new_root)?;
        Ok(Outcome::RootTransitionReturned)
    }
}

fn reply(stream: &UnixStream, byte: u8) -> Result<(), FatalError> {
    io::send_all(stream, &[byte]).map(|_| ())
}

/// Result of driving a connection once.
#[derive(Debug)]
pub enum Progress {
    /// More bytes are needed; call [`Connection::advance`] again later.
    Pending(Connection),
    /// The request was handled and the connection closed.
    Done(Outcome),
}

/// An accepted connection and its partially read request.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    reader: FrameReader,
    received: usize,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            reader: FrameReader::new(),
            received: 0,
        }
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Total request bytes read so far.
    pub fn received(&self) -> usize {
        self.received
    }

    /// Read what is queued and, once the request is complete, authorize and
    /// run it. The connection is closed when this returns [`Progress::Done`].
    pub fn advance<C, A>(mut self, dispatcher: &mut Dispatcher<C, A>) -> Result<Progress, FatalError>
    where
        C: CredentialSource,
        A: CommandActions,
    {
        let request = loop {
            let n = io::receive_available(&self.stream, self.reader.unfilled())?;
            if n == 0 {
                return Ok(Progress::Pending(self));
            }
            self.received += n;
            if let Some(request) = self.reader.advance(n)? {
                break request;
            }
        };
        let outcome = dispatcher.dispatch(&self.stream, request)?;
        Ok(Progress::Done(outcome))
    }
}

/// Handle a connection with whatever has already arrived.
///
/// An incomplete frame is abandoned rather than waited for.
pub fn handle_connection<C, A>(
    stream: UnixStream,
    dispatcher: &mut Dispatcher<C, A>,
) -> Result<Outcome, FatalError>
where
    C: CredentialSource,
    A: CommandActions,
{
    match Connection::new(stream).advance(dispatcher)? {
        Progress::Done(outcome) => Ok(outcome),
        Progress::Pending(conn) => {
            debug!(received = conn.received(), "abandoning incomplete request");
            Ok(Outcome::Abandoned(Abandon::Incomplete))
        }
    }
}

/// Handle a connection, waiting up to `timeout` for the frame to complete.
pub fn drive_connection<C, A>(
    stream: UnixStream,
    dispatcher: &mut Dispatcher<C, A>,
    timeout: Duration,
) -> Result<Outcome, FatalError>
where
    C: CredentialSource,
    A: CommandActions,
{
    let deadline = Instant::now() + timeout;
    let mut conn = Connection::new(stream);
    loop {
        let before = conn.received();
        let readable = wait_readable(conn.stream(), deadline);
        conn = match conn.advance(dispatcher)? {
            Progress::Done(outcome) => return Ok(outcome),
            Progress::Pending(conn) => conn,
        };
        match readable {
            Readiness::Ready if conn.received() == before => {
                debug!(
                    fd = conn.stream().as_raw_fd(),
                    received = before,
                    "peer closed mid-request"
                );
                return Ok(Outcome::Abandoned(Abandon::PeerClosed));
            }
            Readiness::Ready => {}
            Readiness::Expired => {
                debug!(received = conn.received(), "request timed out");
                return Ok(Outcome::Abandoned(Abandon::TimedOut));
            }
        }
    }
}

enum Readiness {
    Ready,
    Expired,
}

/// Wait until `stream` is readable or hung up, or the deadline passes.
fn wait_readable(stream: &UnixStream, deadline: Instant) -> Readiness {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Readiness::Expired;
        }
        let ms = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => return Readiness::Ready,
            Err(errno) => {
                warn!(%errno, "poll on command connection failed");
                return Readiness::Expired;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::PeerCredential;
    use std::io::{Read, Write};
    use std::os::fd::BorrowedFd;

    struct FakeCredentials(Result<u32, ()>);

    impl CredentialSource for FakeCredentials {
        fn peer_credentials(&self, _fd: BorrowedFd<'_>) -> Result<PeerCredential, CredentialError> {
            match self.0 {
                Ok(uid) => Ok(PeerCredential {
                    pid: 42,
                    uid,
                    gid: uid,
                }),
                Err(()) => Err(CredentialError::SizeMismatch {
                    expected: 12,
                    actual: 4,
                }),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        roots: Vec<CString>,
    }

    impl CommandActions for Recorder {
        fn change_root(&mut self, new_root: &CStr) -> Result<(), FatalError> {
            self.roots.push(new_root.to_owned());
            Ok(())
        }
    }

    fn dispatcher(uid: Result<u32, ()>) -> Dispatcher<FakeCredentials, Recorder> {
        Dispatcher::new(FakeCredentials(uid), Recorder::default())
    }

    fn pair() -> (UnixStream, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        (server, client)
    }

    fn replies(mut client: UnixStream) -> Vec<u8> {
        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn unknown_command_is_rejected() {
        let (server, mut client) = pair();
        client.write_all(&[b'Q', 0]).unwrap();
        let mut d = dispatcher(Ok(0));

        let outcome = handle_connection(server, &mut d).unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(Rejection::UnknownCommand(b'Q'))
        ));
        assert_eq!(replies(client), vec![NAK]);
        assert!(d.actions().roots.is_empty());
    }

    #[test]
    fn chroot_is_acknowledged_then_run() {
        let (server, mut client) = pair();
        let frame = cmd_proto::encode_request(CommandKind::Chroot, Some(b"/mnt/new")).unwrap();
        client.write_all(&frame).unwrap();
        let mut d = dispatcher(Ok(0));

        let outcome = handle_connection(server, &mut d).unwrap();
        assert!(matches!(outcome, Outcome::RootTransitionReturned));
        assert_eq!(replies(client), vec![ACK]);
        assert_eq!(d.actions().roots, vec![c"/mnt/new".to_owned()]);
    }

    #[test]
    fn unprivileged_peer_is_rejected_and_not_dispatched() {
        let (server, mut client) = pair();
        let frame = cmd_proto::encode_request(CommandKind::Chroot, Some(b"/mnt/new")).unwrap();
        client.write_all(&frame).unwrap();
        let mut d = dispatcher(Ok(1000));

        let outcome = handle_connection(server, &mut d).unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(Rejection::Unauthorized { uid: 1000 })
        ));
        assert_eq!(replies(client), vec![NAK]);
        assert!(d.actions().roots.is_empty());
    }

    #[test]
    fn credential_failure_drops_connection_silently() {
        let (server, mut client) = pair();
        client.write_all(&[b'R', 0]).unwrap();
        let mut d = dispatcher(Err(()));

        let outcome = handle_connection(server, &mut d).unwrap();
        assert!(matches!(
            outcome,
            Outcome::Abandoned(Abandon::Credentials(_))
        ));
        assert!(replies(client).is_empty());
        assert!(d.actions().roots.is_empty());
    }

    #[test]
    fn chroot_without_argument_is_rejected() {
        for frame in [vec![b'R', 0], vec![b'R', cmd_proto::ARG_PRESENT, 0]] {
            let (server, mut client) = pair();
            client.write_all(&frame).unwrap();
            let mut d = dispatcher(Ok(0));

            let outcome = handle_connection(server, &mut d).unwrap();
            assert!(matches!(
                outcome,
                Outcome::Rejected(Rejection::MissingArgument(CommandKind::Chroot))
            ));
            assert_eq!(replies(client), vec![NAK]);
        }
    }

    #[test]
    fn chroot_with_nul_in_path_is_rejected() {
        let (server, mut client) = pair();
        let frame = cmd_proto::encode_request(CommandKind::Chroot, Some(b"/a\0b")).unwrap();
        client.write_all(&frame).unwrap();
        let mut d = dispatcher(Ok(0));

        let outcome = handle_connection(server, &mut d).unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(Rejection::InvalidArgument(CommandKind::Chroot))
        ));
        assert!(d.actions().roots.is_empty());
    }

    #[test]
    fn incomplete_frame_is_abandoned_without_action() {
        let (server, mut client) = pair();
        let frame = cmd_proto::encode_request(CommandKind::Chroot, Some(b"/mnt/new")).unwrap();
        client.write_all(&frame[..5]).unwrap();
        let mut d = dispatcher(Ok(0));

        let outcome = handle_connection(server, &mut d).unwrap();
        assert!(matches!(outcome, Outcome::Abandoned(Abandon::Incomplete)));
        assert!(replies(client).is_empty());
        assert!(d.actions().roots.is_empty());
    }

    #[test]
    fn pending_connection_resumes() {
        let (server, mut client) = pair();
        let frame = cmd_proto::encode_request(CommandKind::Chroot, Some(b"/mnt/new")).unwrap();
        let mut d = dispatcher(Ok(0));

        let conn = match Connection::new(server).advance(&mut d).unwrap() {
            Progress::Pending(conn) => conn,
            Progress::Done(outcome) => panic!("unexpected outcome {outcome:?}"),
        };
        assert_eq!(conn.received(), 0);

        client.write_all(&frame[..4]).unwrap();
        let conn = match conn.advance(&mut d).unwrap() {
            Progress::Pending(conn) => conn,
            Progress::Done(outcome) => panic!("unexpected outcome {outcome:?}"),
        };
        assert_eq!(conn.received(), 4);
        assert!(d.actions().roots.is_empty());

        client.write_all(&frame[4..]).unwrap();
        assert!(matches!(
            conn.advance(&mut d).unwrap(),
            Progress::Done(Outcome::RootTransitionReturned)
        ));
        assert_eq!(d.actions().roots, vec![c"/mnt/new".to_owned()]);
    }

    #[test]
    fn reply_to_departed_peer_is_harmless() {
        let (server, mut client) = pair();
        client.write_all(&[b'Q', 0]).unwrap();
        drop(client);
        let mut d = dispatcher(Ok(0));

        let outcome = handle_connection(server, &mut d).unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected(Rejection::UnknownCommand(b'Q'))
        ));
    }

    #[test]
    fn drive_waits_for_late_bytes() {
        let (server, mut client) = pair();
        let frame = cmd_proto::encode_request(CommandKind::Chroot, Some(b"/late")).unwrap();
        let writer = std::thread::spawn(move || {
            client.write_all(&frame[..3]).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            client.write_all(&frame[3..]).unwrap();
            replies(client)
        });
        let mut d = dispatcher(Ok(0));

        let outcome = drive_connection(server, &mut d, Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, Outcome::RootTransitionReturned));
        assert_eq!(writer.join().unwrap(), vec![ACK]);
        assert_eq!(d.actions().roots, vec![c"/late".to_owned()]);
    }

    #[test]
    fn drive_times_out() {
        let (server, client) = pair();
        let mut d = dispatcher(Ok(0));
        let outcome = drive_connection(server, &mut d, Duration::from_millis(50)).unwrap();
        assert!(matches!(outcome, Outcome::Abandoned(Abandon::TimedOut)));
        drop(client);
    }

    #[test]
    fn drive_notices_peer_close() {
        let (server, mut client) = pair();
        client.write_all(&[b'R', cmd_proto::ARG_PRESENT]).unwrap();
        drop(client);
        let mut d = dispatcher(Ok(0));
        let outcome = drive_connection(server, &mut d, Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, Outcome::Abandoned(Abandon::PeerClosed)));
        assert!(d.actions().roots.is_empty());
    }
}
