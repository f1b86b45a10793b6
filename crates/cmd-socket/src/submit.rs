//! Sending a command to a running daemon.

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use cmd_proto::{ParsedToken, Reply};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info};

use crate::error::SubmitError;
use crate::io;
use crate::params::DaemonParams;
use crate::socket;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// How long to wait for the daemon's reply byte.
    pub reply_timeout: Duration,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

/// Send one command and wait for the daemon's answer.
pub fn submit(
    params: &DaemonParams,
    token: &ParsedToken<'_>,
    options: &SubmitOptions,
) -> Result<Reply, SubmitError> {
    let frame = cmd_proto::encode_request(token.kind, token.argument.map(str::as_bytes))?;
    let stream = socket::open_connection(params)?;
    info!(
        daemon = %params.name,
        command = token.kind.token_name(),
        argument = token.argument.unwrap_or_default(),
        "sending command"
    );

    let sent = io::send_all(&stream, &frame)?;
    if sent != frame.len() {
        debug!(sent, expected = frame.len(), "short write");
        return Err(SubmitError::Closed);
    }
    await_reply(&stream, options.reply_timeout)
}

/// Wait for a single reply byte on `stream`.
pub fn await_reply(stream: &UnixStream, timeout: Duration) -> Result<Reply, SubmitError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SubmitError::Timeout(timeout));
        }
        let ms = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(errno) => return Err(SubmitError::Poll(errno)),
        }

        let mut byte = [0u8; 1];
        if io::receive_available(stream, &mut byte)? == 1 {
            let [b] = byte;
            return Ok(Reply::from(b));
        }
        // Readable with nothing queued: the daemon hung up.
        return Err(SubmitError::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reply_byte_is_decoded() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.write_all(&[cmd_proto::ACK]).unwrap();
        assert_eq!(await_reply(&a, Duration::from_secs(1)).unwrap(), Reply::Ack);
    }

    #[test]
    fn hangup_without_reply_is_closed() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let err = await_reply(&a, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SubmitError::Closed));
    }

    #[test]
    fn silence_times_out() {
        let (a, _b) = UnixStream::pair().unwrap();
        let err = await_reply(&a, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, SubmitError::Timeout(_)));
    }
}
