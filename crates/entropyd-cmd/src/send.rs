use std::process::ExitCode;
use std::time::Duration;

use clap::Args;
use cmd_proto::Reply;
use cmd_socket::{DaemonParams, SocketError, SubmitError, SubmitOptions, submit};
use tracing::{error, info};

use crate::SocketArgs;
use crate::error::CliResult;

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Command token, e.g. `root=/new/root`
    pub token: String,

    #[command(flatten)]
    pub socket: SocketArgs,

    /// Time to wait for the daemon's reply
    #[arg(long, env = "CMDSOCK_REPLY_TIMEOUT_MS", default_value_t = 5000)]
    pub reply_timeout_ms: u64,
}

pub fn run(args: &SendArgs) -> CliResult<ExitCode> {
    let token = cmd_proto::parse_token(&args.token)?;
    let params = DaemonParams::from_env(args.socket.endpoint())?;
    let options = SubmitOptions {
        reply_timeout: Duration::from_millis(args.reply_timeout_ms),
    };

    match submit(&params, &token, &options) {
        Ok(Reply::Ack) => {
            info!(command = %args.token, "command accepted");
            Ok(ExitCode::SUCCESS)
        }
        Ok(Reply::Nak) => {
            error!(command = %args.token, "command rejected");
            Ok(ExitCode::FAILURE)
        }
        Ok(Reply::Unknown(byte)) => {
            error!(command = %args.token, reply = byte, "unexpected reply");
            Ok(ExitCode::FAILURE)
        }
        Err(SubmitError::Socket(SocketError::ConnectionRefused)) => {
            error!(socket = params.endpoint.name(), "no daemon is listening");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}
