//! Crate-wide error type and the `logged_err!` convenience macro.

use std::fmt;
use std::io;

/// Coarse error taxonomy from the design doc: callers match on kind where
/// the handling policy differs (fatal vs. logged-and-continue); everything
/// still flows through a single `?`-compatible type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket bind/send/receive failure. Bind errors are fatal at startup;
    /// per-send failures are logged and the frame dropped.
    Transport,
    /// Malformed frame read off the wire. Always non-fatal; the frame is
    /// dropped and a counter incremented.
    Decode,
    /// Term regression, duplicate vote, or prev-log mismatch. Non-fatal:
    /// the higher term is adopted or the message is rejected.
    Protocol,
    /// A round failed to collect enough votes before its deadline.
    DeadlineMiss,
    /// The local PHY control endpoint was unreachable or replied non-OK.
    Control,
    /// Invalid CLI arguments or config. Fatal, exit code 1.
    Config,
    /// Anything else (used sparingly; prefer a specific kind above).
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "Transport",
            ErrorKind::Decode => "Decode",
            ErrorKind::Protocol => "Protocol",
            ErrorKind::DeadlineMiss => "DeadlineMiss",
            ErrorKind::Control => "Control",
            ErrorKind::Config => "Config",
            ErrorKind::Other => "Other",
        };
        write!(f, "{}", s)
    }
}

/// Crate-wide error type. Carries a kind (for call sites that branch on
/// fatal vs. non-fatal handling) and a message.
#[derive(Clone, PartialEq, Eq)]
pub struct VRaftError(pub ErrorKind, pub String);

impl VRaftError {
    pub fn msg<S: Into<String>>(s: S) -> Self {
        VRaftError(ErrorKind::Other, s.into())
    }

    pub fn of<S: Into<String>>(kind: ErrorKind, s: S) -> Self {
        VRaftError(kind, s.into())
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

impl fmt::Debug for VRaftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VRaftError::{}({})", self.0, self.1)
    }
}

impl fmt::Display for VRaftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.1)
    }
}

impl std::error::Error for VRaftError {}

impl From<io::Error> for VRaftError {
    fn from(e: io::Error) -> Self {
        VRaftError::of(ErrorKind::Transport, e.to_string())
    }
}

impl From<serde_json::Error> for VRaftError {
    fn from(e: serde_json::Error) -> Self {
        VRaftError::of(ErrorKind::Decode, e.to_string())
    }
}

impl From<std::net::AddrParseError> for VRaftError {
    fn from(e: std::net::AddrParseError) -> Self {
        VRaftError::of(ErrorKind::Config, e.to_string())
    }
}

impl From<toml::de::Error> for VRaftError {
    fn from(e: toml::de::Error) -> Self {
        VRaftError::of(ErrorKind::Config, e.to_string())
    }
}

/// Logs an error-level message with the current node's `ME` prefix and
/// returns it as an `Err(VRaftError)` in one expression. First argument may
/// be an `ErrorKind` variant name as a bare tag (e.g. `"t"` for transport,
/// `"d"` for decode, ...); defaults to `Other` when omitted.
#[macro_export]
macro_rules! logged_err {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::pf_error!("{}", msg);
        Err($crate::utils::VRaftError::msg(msg))
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_message() {
        let e = VRaftError::of(ErrorKind::Protocol, "term regression");
        assert_eq!(format!("{}", e), "term regression");
        assert_eq!(*e.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn io_conversion() {
        let io_err =
            io::Error::new(io::ErrorKind::AddrInUse, "addr in use");
        let e: VRaftError = io_err.into();
        assert_eq!(*e.kind(), ErrorKind::Transport);
    }
}
