//! Wire format and command registry for the entropy daemon command socket.
//!
//! ## Wire Format
//!
//! ```text
//! [1-byte code][1-byte sentinel]                         (no argument)
//! [1-byte code][0x02][1-byte len][len bytes argument]    (with argument)
//! ```
//!
//! - **code**: command byte, see [`CommandKind::wire_byte`]
//! - **sentinel**: `0x02` means an argument follows, any other value means none
//! - **len**: argument length, 0..=255
//!
//! The daemon answers every request with a single byte: [`ACK`] or [`NAK`].
//!
//! ## Commands
//!
//! | Code | Token     | Argument | Action                           |
//! |------|-----------|----------|----------------------------------|
//! | `R`  | `root=`   | path     | chroot into path and re-execute  |

/// Size of the fixed frame header: code + sentinel.
pub const HEADER_SIZE: usize = 2;

/// Sentinel in header byte 1 announcing a length-prefixed argument.
pub const ARG_PRESENT: u8 = 0x02;

/// Sentinel written by senders when no argument follows.
pub const ARG_ABSENT: u8 = 0x00;

/// Largest argument a one-byte length can describe.
pub const MAX_ARGUMENT_LEN: usize = u8::MAX as usize;

/// Acknowledgement reply byte.
pub const ACK: u8 = 0x06;

/// Rejection reply byte.
pub const NAK: u8 = 0x15;

/// Protocol error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("argument too long: {0} bytes (max 255)")]
    ArgumentTooLong(usize),

    #[error("can not allocate {0} bytes for command argument")]
    AllocationFailed(usize),

    #[error("frame reader advanced by {advanced} bytes with only {remaining} outstanding")]
    Overrun { advanced: usize, remaining: usize },
}

/// Token parsing error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("unknown command: {0:?}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Command registry
// ---------------------------------------------------------------------------

/// Commands understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Change the root directory and re-execute the daemon there.
    Chroot,
}

impl CommandKind {
    /// Every known command, in token-matching order.
    pub const ALL: &'static [CommandKind] = &[CommandKind::Chroot];

    /// Token name as written on the command line.
    ///
    /// Names of commands that take an argument end with `=`.
    pub const fn token_name(self) -> &'static str {
        match self {
            Self::Chroot => "root=",
        }
    }

    /// Byte identifying the command on the wire.
    pub const fn wire_byte(self) -> u8 {
        match self {
            Self::Chroot => b'R',
        }
    }

    pub const fn expects_argument(self) -> bool {
        match self {
            Self::Chroot => true,
        }
    }

    /// Map a wire byte back to a command. Returns `None` for unknown codes.
    pub fn from_wire(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.wire_byte() == code)
    }
}

/// A command-line token resolved against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedToken<'a> {
    pub kind: CommandKind,
    pub argument: Option<&'a str>,
}

/// Resolve a `name` or `name=value` token.
///
/// Commands that take an argument match on their `name=` prefix
/// (case-sensitive, anchored at the start) and everything after the prefix is
/// the argument. Other commands must match exactly.
pub fn parse_token(token: &str) -> Result<ParsedToken<'_>, TokenError> {
    if token.is_empty() {
        return Err(TokenError::NotFound(String::new()));
    }
    CommandKind::ALL
        .iter()
        .copied()
        .find_map(|kind| {
            if kind.expects_argument() {
                token
                    .strip_prefix(kind.token_name())
                    .map(|argument| ParsedToken {
                        kind,
                        argument: Some(argument),
                    })
            } else {
                (token == kind.token_name()).then_some(ParsedToken {
                    kind,
                    argument: None,
                })
            }
        })
        .ok_or_else(|| TokenError::NotFound(token.to_string()))
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a request for a known command.
pub fn encode_request(kind: CommandKind, argument: Option<&[u8]>) -> Result<Vec<u8>, ProtocolError> {
    encode_raw(kind.wire_byte(), argument)
}

/// Encode a request with an arbitrary code byte.
pub fn encode_raw(code: u8, argument: Option<&[u8]>) -> Result<Vec<u8>, ProtocolError> {
    let Some(arg) = argument else {
        return Ok(vec![code, ARG_ABSENT]);
    };
    let len = u8::try_from(arg.len()).map_err(|_| ProtocolError::ArgumentTooLong(arg.len()))?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + 1 + arg.len());
    buf.push(code);
    buf.push(ARG_PRESENT);
    buf.push(len);
    buf.extend_from_slice(arg);
    Ok(buf)
}

/// Daemon reply to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nak,
    Unknown(u8),
}

impl From<u8> for Reply {
    fn from(byte: u8) -> Self {
        match byte {
            ACK => Self::Ack,
            NAK => Self::Nak,
            other => Self::Unknown(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Decode (incremental, handles partial reads)
// ---------------------------------------------------------------------------

/// A fully received request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub code: u8,
    pub argument: Option<Vec<u8>>,
}

impl Request {
    /// The registered command for this code, if any.
    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_wire(self.code)
    }
}

#[derive(Debug)]
enum FrameState {
    Header { buf: [u8; HEADER_SIZE], filled: usize },
    ArgLength { code: u8, buf: [u8; 1] },
    ArgData { code: u8, buf: Vec<u8>, filled: usize },
    Done,
}

/// Incremental request reader.
///
/// The caller reads into [`FrameReader::unfilled`] and reports how many bytes
/// landed via [`FrameReader::advance`]. A [`Request`] is produced only once
/// every byte of the frame has arrived; a partially received argument is
/// never exposed.
#[derive(Debug)]
pub struct FrameReader {
    state: FrameState,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            state: FrameState::Header {
                buf: [0; HEADER_SIZE],
                filled: 0,
            },
        }
    }

    /// Bytes still missing for the field currently being read.
    ///
    /// Empty once the request has been produced.
    pub fn unfilled(&mut self) -> &mut [u8] {
        match &mut self.state {
            FrameState::Header { buf, filled } => buf.get_mut(*filled..).unwrap_or_default(),
            FrameState::ArgLength { buf, .. } => buf.as_mut_slice(),
            FrameState::ArgData { buf, filled, .. } => buf.get_mut(*filled..).unwrap_or_default(),
            FrameState::Done => &mut [],
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, FrameState::Done)
    }

    /// Record `n` bytes written into [`FrameReader::unfilled`].
    ///
    /// Returns the request once the frame is complete. The argument buffer is
    /// reserved with exactly the announced length after the length byte is
    /// received; a failed reservation is reported as
    /// [`ProtocolError::AllocationFailed`].
    pub fn advance(&mut self, n: usize) -> Result<Option<Request>, ProtocolError> {
        let remaining = self.unfilled().len();
        if n > remaining {
            return Err(ProtocolError::Overrun {
                advanced: n,
                remaining,
            });
        }
        if n == 0 {
            return Ok(None);
        }

        self.state = match std::mem::replace(&mut self.state, FrameState::Done) {
            FrameState::Header { buf, filled } if filled + n < HEADER_SIZE => FrameState::Header {
                buf,
                filled: filled + n,
            },
            FrameState::Header {
                buf: [code, sentinel],
                ..
            } => {
                if sentinel != ARG_PRESENT {
                    return Ok(Some(Request {
                        code,
                        argument: None,
                    }));
                }
                FrameState::ArgLength { code, buf: [0] }
            }
            FrameState::ArgLength { code, buf: [len] } => {
                let len = usize::from(len);
                let mut data = Vec::new();
                data.try_reserve_exact(len)
                    .map_err(|_| ProtocolError::AllocationFailed(len))?;
                data.resize(len, 0);
                if len == 0 {
                    return Ok(Some(Request {
                        code,
                        argument: Some(data),
                    }));
                }
                FrameState::ArgData {
                    code,
                    buf: data,
                    filled: 0,
                }
            }
            FrameState::ArgData { code, buf, filled } => {
                let filled = filled + n;
                if filled < buf.len() {
                    FrameState::ArgData { code, buf, filled }
                } else {
                    return Ok(Some(Request {
                        code,
                        argument: Some(buf),
                    }));
                }
            }
            FrameState::Done => FrameState::Done,
        };
        Ok(None)
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
