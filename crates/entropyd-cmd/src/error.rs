#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("params error: {0}")]
    Params(#[from] cmd_socket::ParamsError),

    #[error("socket error: {0}")]
    Socket(#[from] cmd_socket::SocketError),

    #[error(transparent)]
    Submit(#[from] cmd_socket::SubmitError),

    #[error(transparent)]
    Token(#[from] cmd_proto::TokenError),

    #[error("poll error: {0}")]
    Poll(#[from] nix::errno::Errno),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CliResult<T> = Result<T, CliError>;
