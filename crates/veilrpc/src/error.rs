//! # Error Definitions
//!
//! The ledger of protocol failures, and the classification of remote faults
//! carried by error replies.

/// A malformed or out-of-sequence envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A frame map was missing a required field.
    MissingField(&'static str),
    /// The top-level frame type tag was not recognized.
    UnknownFrame(String),
    /// An error reply carried an unrecognized fault tag.
    UnknownFault(String),
    /// A frame field held the wrong kind of wire value.
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },
    /// A stream frame arrived out of order or duplicated an index.
    OutOfSequence { expected: u64, received: u64 },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "Frame missing field: {:?}", field),
            Self::UnknownFrame(tag) => write!(f, "Unknown frame type: {:?}", tag),
            Self::UnknownFault(tag) => write!(f, "Unknown fault tag: {:?}", tag),
            Self::TypeMismatch { field, expected } => {
                write!(f, "Frame field {:?} is not a {}", field, expected)
            }
            Self::OutOfSequence { expected, received } => {
                write!(
                    f,
                    "Stream index out of sequence: expected {}, received {}",
                    expected, received
                )
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Specialized `Result` for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Classification of a remote failure (the payload of an error reply).
///
/// Distinct from [`ProtocolError`]: a `Fault` is the *remote* side reporting
/// why a call failed, whereas `ProtocolError` is the local side rejecting a
/// malformed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The named method does not exist on the remote implementation.
    MethodNotFound,
    /// The remote implementation ran and failed.
    Execution,
    /// The remote side could not make sense of a frame it received.
    Protocol,
}

impl Fault {
    /// Stable wire tag for this fault.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Fault::MethodNotFound => "not-found",
            Fault::Execution => "execution",
            Fault::Protocol => "protocol",
        }
    }

    /// Parses a wire tag back into a fault.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "not-found" => Ok(Fault::MethodNotFound),
            "execution" => Ok(Fault::Execution),
            "protocol" => Ok(Fault::Protocol),
            other => Err(ProtocolError::UnknownFault(other.to_string())),
        }
    }
}
