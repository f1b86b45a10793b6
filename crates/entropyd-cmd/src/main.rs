mod error;
mod send;
mod serve;
mod signals;

use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use cmd_socket::{DEFAULT_SOCKET_NAME, Endpoint};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "entropyd-cmd", version)]
struct Cli {
    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "CMDSOCK_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen on the command socket and execute commands from root peers
    Serve(serve::ServeArgs),
    /// Send a command token (e.g. `root=/new/root`) to a running daemon
    Send(send::SendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SocketArgs {
    /// Abstract socket name (without the leading NUL)
    #[arg(long, env = "CMDSOCK_SOCKET_NAME", default_value = DEFAULT_SOCKET_NAME)]
    pub socket_name: String,
}

impl SocketArgs {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.socket_name.clone())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .with_max_level(cli.log_level)
        .init();

    let result = match cli.command {
        Command::Serve(args) => serve::run(&args),
        Command::Send(args) => send::run(&args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
