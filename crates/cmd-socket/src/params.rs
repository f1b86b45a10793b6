//! Daemon parameters consumed by the command socket.

use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStringExt;
use std::path::Path;

use crate::error::ParamsError;

/// Abstract socket name shared by the daemon and its command senders.
pub const DEFAULT_SOCKET_NAME: &str = "/sys/entropy/haveged";

/// Environment variable carrying the listening descriptor across re-exec.
pub const LISTEN_FD_ENV: &str = "CMDSOCK_LISTEN_FD";

/// Abstract-namespace socket name (without the leading NUL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_NAME)
    }
}

/// Immutable view of the running daemon needed by the command socket.
#[derive(Debug, Clone)]
pub struct DaemonParams {
    /// Name used as a prefix in diagnostics.
    pub name: String,
    /// Image to re-execute after a root change.
    pub executable: CString,
    /// Original argument vector, passed unchanged to the new image.
    pub argv: Vec<CString>,
    pub endpoint: Endpoint,
}

impl DaemonParams {
    pub fn new(
        name: impl Into<String>,
        executable: &Path,
        argv: impl IntoIterator<Item = OsString>,
        endpoint: Endpoint,
    ) -> Result<Self, ParamsError> {
        let executable = CString::new(executable.as_os_str().to_owned().into_vec())
            .map_err(|_| ParamsError::InteriorNul("executable path"))?;
        let argv = argv
            .into_iter()
            .map(|arg| CString::new(arg.into_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ParamsError::InteriorNul("argument"))?;
        Ok(Self {
            name: name.into(),
            executable,
            argv,
            endpoint,
        })
    }

    /// Build parameters for the current process.
    pub fn from_env(endpoint: Endpoint) -> Result<Self, ParamsError> {
        let executable = std::env::current_exe().map_err(ParamsError::Executable)?;
        let name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        Self::new(name, &executable, std::env::args_os(), endpoint)
    }
}
