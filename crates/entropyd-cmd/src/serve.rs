//! Reference accept loop: one connection at a time, each driven to completion
//! before the next is accepted.

use std::os::fd::AsFd;
use std::process::ExitCode;
use std::time::Duration;

use clap::Args;
use cmd_socket::{
    DaemonParams, Dispatcher, KernelCredentials, Listener, RootTransition, SocketError,
    drive_connection, terminate,
};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{info, warn};

use crate::SocketArgs;
use crate::error::CliResult;
use crate::signals;

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub socket: SocketArgs,

    /// Time allowed for a connected peer to deliver its full request
    #[arg(long, env = "CMDSOCK_FRAME_TIMEOUT_MS", default_value_t = 1000)]
    pub frame_timeout_ms: u64,

    /// How often the loop wakes up to check for shutdown
    #[arg(long, env = "CMDSOCK_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u16,
}

pub fn run(args: &ServeArgs) -> CliResult<ExitCode> {
    let params = DaemonParams::from_env(args.socket.endpoint())?;

    let listener = match Listener::open(&params) {
        Ok(listener) => listener,
        Err(SocketError::AddressInUse) => {
            warn!(
                daemon = %params.name,
                socket = params.endpoint.name(),
                "command socket in use, another instance is already running"
            );
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e.into()),
    };
    info!(daemon = %params.name, socket = params.endpoint.name(), "listening for commands");

    signals::install();
    let frame_timeout = Duration::from_millis(args.frame_timeout_ms);

    while !signals::shutdown_requested() {
        let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(args.poll_interval_ms)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        while let Some(stream) = listener.accept()? {
            serve_one(&params, &listener, stream, frame_timeout);
        }
    }

    info!(daemon = %params.name, "shutting down");
    Ok(ExitCode::SUCCESS)
}

fn serve_one(
    params: &DaemonParams,
    listener: &Listener,
    stream: std::os::unix::net::UnixStream,
    frame_timeout: Duration,
) {
    let actions = RootTransition::new(params, Some(listener.as_fd()));
    let mut dispatcher = Dispatcher::new(KernelCredentials, actions);
    match drive_connection(stream, &mut dispatcher, frame_timeout) {
        Ok(outcome) => info!(daemon = %params.name, ?outcome, "connection closed"),
        Err(fatal) => terminate(&params.name, &fatal),
    }
}
