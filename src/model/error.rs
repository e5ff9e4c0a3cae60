use num_enum::{TryFromPrimitive, TryFromPrimitiveError};
use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::string::String;
use uuid;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KmsErrorKind {
    /// Unexpected data
    InvalidData,
    /// A reader ran past the end of its buffer
    ShortBuffer,
    /// A field decoded but carries an impossible value,
    /// e.g. non zero padding after the terminator of a
    /// fixed width string
    MalformedField,
    /// The request version is not one of 4, 5 or 6
    UnknownVersion,
    /// The activation interface has a single operation;
    /// any other opnum is answered with a fault
    UnknownOpnum,
    /// V4 hash or V6 HMAC mismatch.
    /// The connection is closed without a reply so the
    /// peer cannot use the server as a verification oracle
    AuthFailure,
    /// The decrypted inner version does not match the
    /// outer one
    DecryptMismatch,
    /// The client store failed; advisory only, the
    /// response is still produced
    PersistenceError,
    /// The server is above its connection high water mark
    Overloaded,
    /// Protocol automata transition is not expected
    InvalidAutomata,
    /// All messages are based on the Message trait.
    /// To retrieve the original data we use
    /// a visitor pattern; if the expected
    /// type is not found an InvalidCast error is emitted
    InvalidCast,
    /// If an expected constant value is not equal
    InvalidConst,
    InvalidOptionalField,
    InvalidSize,
    /// Disconnect received from the peer
    Disconnect,
    /// Indicate an unknown field
    Unknown,
}

#[derive(Debug)]
pub struct KmsError {
    /// Kind of error
    kind: KmsErrorKind,
    /// Associated message of the context
    message: String,
}

impl KmsError {
    /// Create a new KMS error
    /// # Example
    /// ```
    /// use kms::model::error::{KmsError, KmsErrorKind};
    /// let error = KmsError::new(KmsErrorKind::Disconnect, "disconnected");
    /// ```
    pub fn new(kind: KmsErrorKind, message: &str) -> Self {
        KmsError {
            kind,
            message: String::from(message),
        }
    }

    /// Return the kind of error
    ///
    /// # Example
    /// ```
    /// use kms::model::error::{KmsError, KmsErrorKind};
    /// let error = KmsError::new(KmsErrorKind::Disconnect, "disconnected");
    /// assert_eq!(error.kind(), KmsErrorKind::Disconnect)
    /// ```
    pub fn kind(&self) -> KmsErrorKind {
        self.kind
    }

    /// Associated message
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub enum Error {
    /// KMS protocol error
    KmsError(KmsError),
    /// All kind of IO error
    Io(IoError),
    /// try error
    TryError(String),
    // All kind of parse error
    FromError(String),
}

impl Error {
    /// Kind of the underlying protocol error,
    /// `Unknown` for transport level failures
    pub fn kind(&self) -> KmsErrorKind {
        match self {
            Error::KmsError(e) => e.kind(),
            _ => KmsErrorKind::Unknown,
        }
    }
}

impl From<uuid::Error> for Error {
    fn from(_e: uuid::Error) -> Self {
        Error::FromError(String::from("identifier is not a valid UUID"))
    }
}

/// From IO Error
///
/// A truncated read is a protocol level `ShortBuffer`,
/// anything else stays an IO error.
impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        if e.kind() == IoErrorKind::UnexpectedEof {
            Error::KmsError(KmsError::new(KmsErrorKind::ShortBuffer, "truncated read"))
        } else {
            Error::Io(e)
        }
    }
}

impl<T: TryFromPrimitive> From<TryFromPrimitiveError<T>> for Error {
    fn from(_: TryFromPrimitiveError<T>) -> Self {
        Error::KmsError(KmsError::new(
            KmsErrorKind::InvalidCast,
            "invalid enum conversion",
        ))
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(err: std::num::TryFromIntError) -> Self {
        Error::TryError(err.to_string())
    }
}

pub type KmsResult<T> = Result<T, Error>;

/// Try option is waiting for the try trait of the next rust
#[macro_export]
macro_rules! try_option {
    ($val: expr, $expr: expr) => {
        if let Some(x) = $val {
            Ok(x)
        } else {
            Err($crate::model::error::Error::KmsError(
                $crate::model::error::KmsError::new(
                    $crate::model::error::KmsErrorKind::InvalidOptionalField,
                    $expr,
                ),
            ))
        }
    };
}

#[macro_export]
macro_rules! try_let {
    ($ident: path, $val: expr) => {
        if let $ident(x) = $val {
            Ok(x)
        } else {
            Err($crate::model::error::Error::KmsError(
                $crate::model::error::KmsError::new(
                    $crate::model::error::KmsErrorKind::InvalidCast,
                    "invalid cast",
                ),
            ))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_eof_maps_to_short_buffer() {
        let io = IoError::new(IoErrorKind::UnexpectedEof, "eof");
        assert_eq!(Error::from(io).kind(), KmsErrorKind::ShortBuffer);
    }

    #[test]
    fn test_other_io_errors_stay_io() {
        let io = IoError::new(IoErrorKind::ConnectionReset, "reset");
        match Error::from(io) {
            Error::Io(_) => (),
            _ => panic!("expected Io"),
        }
    }
}
