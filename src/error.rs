use std::error;
use std::fmt;
use std::io;

/// Errors produced while speaking the plugin protocol.
///
/// Transport errors are sticky: the reader that produced one is poisoned
/// and returns a clone of the same error on every subsequent read, so the
/// error type is cheaply clonable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The underlying byte channel failed, or ended mid-command.
    Transport {
        kind: io::ErrorKind,
        message: String,
    },
    /// A command opening line that does not match the wire grammar.
    MalformedStanza(String),
    /// A header token that is empty or contains bytes outside the
    /// printable-ASCII range 33-126.
    InvalidToken(String),
    /// A body line that is not valid wrapped base64.
    MalformedBody(String),
    /// The fault budget was exhausted by consecutive malformed commands.
    TooManyFaults,
    /// The session was cancelled from outside.
    Cancelled,
    /// The state machine selector named an unsupported machine.
    UnknownStateMachine(String),
    /// The plugin failed while wrapping a file key.
    Plugin { code: u16, message: String },
}

impl Error {
    pub(crate) fn transport(e: io::Error) -> Self {
        Error::Transport {
            kind: e.kind(),
            message: e.to_string(),
        }
    }

    /// Whether this error poisons the reader that produced it.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// Whether this error is a recoverable framing fault, counted against
    /// the fault budget instead of ending the session.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Error::MalformedStanza(_) | Error::InvalidToken(_) | Error::MalformedBody(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport { message, .. } => write!(f, "transport error: {}", message),
            Error::MalformedStanza(line) => write!(f, "malformed stanza: {:?}", line),
            Error::InvalidToken(token) => write!(f, "malformed stanza: invalid token {:?}", token),
            Error::MalformedBody(message) => write!(f, "malformed body line: {}", message),
            Error::TooManyFaults => write!(f, "too many malformed commands"),
            Error::Cancelled => write!(f, "session cancelled"),
            Error::UnknownStateMachine(name) => write!(f, "unknown state machine {:?}", name),
            Error::Plugin { code, message } => write!(f, "plugin error {}: {}", code, message),
        }
    }
}

impl error::Error for Error {}
