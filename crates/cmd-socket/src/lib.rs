//! Credential-gated command socket for the entropy daemon.
//!
//! The daemon listens on an abstract-namespace Unix socket. A peer running as
//! root connects, sends one request frame (see `cmd-proto`), and receives a
//! single reply byte. The only command today re-roots the daemon and
//! re-executes it in place.
//!
//! Layout:
//! - [`socket`]: listener and connector setup
//! - [`io`]: non-blocking partial read/write primitives
//! - [`credentials`]: kernel-supplied peer credentials
//! - [`dispatch`]: per-connection state machine
//! - [`root`]: chroot and re-exec
//! - [`submit`]: sender side
//!
//! The accept loop itself belongs to the host process; [`dispatch::drive_connection`]
//! is the per-connection entry point it calls.

pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod params;
pub mod root;
pub mod socket;
pub mod submit;

pub use credentials::{CredentialSource, KernelCredentials, PeerCredential};
pub use dispatch::{
    Abandon, CommandActions, Connection, Dispatcher, Outcome, Progress, Rejection,
    drive_connection, handle_connection,
};
pub use error::{CredentialError, FatalError, ParamsError, SocketError, SubmitError, terminate};
pub use params::{DEFAULT_SOCKET_NAME, DaemonParams, Endpoint, LISTEN_FD_ENV};
pub use root::{RootOps, RootStep, RootTransition, SystemRoot};
pub use socket::{Listener, open_connection};
pub use submit::{SubmitOptions, await_reply, submit};
