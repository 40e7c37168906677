//! Decoder and encoder error codes.
//!
//! Every layer of the library reports failures through [`Error`]. The
//! variants correspond one-to-one to the wire-stable integer codes of the
//! trace format specification; [`Error::code`] exposes that presentation
//! for callers that pass results across a foreign boundary.

use thiserror::Error;

/// Error for decoding and encoding
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Internal decoder error, an invariant was violated
    #[error("Internal decoder error")]
    Internal,
    /// Invalid argument
    #[error("Invalid argument")]
    Invalid,
    /// Decoder out of sync
    #[error("Decoder out of sync")]
    Nosync,
    /// Unknown opcode
    #[error("Unknown opcode")]
    BadOpc,
    /// Unknown payload or malformed packet
    #[error("Unknown packet payload")]
    BadPacket,
    /// Unexpected packet in this context
    #[error("Unexpected packet context")]
    BadContext,
    /// Reached the end of the trace stream
    #[error("Reached end of trace stream")]
    Eos,
    /// There is no packet answering this query
    #[error("No packet answering this query")]
    BadQuery,
    /// Not enough memory
    #[error("Not enough memory")]
    Nomem,
    /// Bad configuration
    #[error("Bad configuration")]
    BadConfig,
    /// There is no IP
    #[error("There is no IP")]
    Noip,
    /// The IP has been suppressed
    #[error("The IP has been suppressed")]
    IpSuppressed,
    /// There is no memory mapped at the requested address
    #[error("Nothing mapped at this address")]
    Nomap,
    /// An instruction could not be decoded
    #[error("Unknown instruction")]
    BadInsn,
    /// No wall-clock time is available
    #[error("No timing information")]
    NoTime,
    /// No core:bus ratio is available
    #[error("No core:bus ratio")]
    NoCbr,
    /// Image sections overlap
    #[error("Image sections overlap")]
    BadImage,
    /// A locking error occurred
    #[error("Locking error")]
    BadLock,
    /// The requested feature is not supported
    #[error("Not supported")]
    NotSupported,
}

impl Error {
    /// The wire-stable integer presentation of this error.
    ///
    /// Success is 0, every error is a negative value. The numbering is
    /// fixed and must not change between releases.
    #[must_use]
    pub const fn code(self) -> i32 {
        let positive = match self {
            Error::Internal => 1,
            Error::Invalid => 2,
            Error::Nosync => 3,
            Error::BadOpc => 4,
            Error::BadPacket => 5,
            Error::BadContext => 6,
            Error::Eos => 7,
            Error::BadQuery => 8,
            Error::Nomem => 9,
            Error::BadConfig => 10,
            Error::Noip => 11,
            Error::IpSuppressed => 12,
            Error::Nomap => 13,
            Error::BadInsn => 14,
            Error::NoTime => 15,
            Error::NoCbr => 16,
            Error::BadImage => 17,
            Error::BadLock => 18,
            Error::NotSupported => 19,
        };
        -positive
    }

    /// Recover an [`Error`] from its integer presentation.
    ///
    /// Returns `None` for 0 (success) and for codes outside the table.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Error::Internal,
            -2 => Error::Invalid,
            -3 => Error::Nosync,
            -4 => Error::BadOpc,
            -5 => Error::BadPacket,
            -6 => Error::BadContext,
            -7 => Error::Eos,
            -8 => Error::BadQuery,
            -9 => Error::Nomem,
            -10 => Error::BadConfig,
            -11 => Error::Noip,
            -12 => Error::IpSuppressed,
            -13 => Error::Nomap,
            -14 => Error::BadInsn,
            -15 => Error::NoTime,
            -16 => Error::NoCbr,
            -17 => Error::BadImage,
            -18 => Error::BadLock,
            -19 => Error::NotSupported,
            _ => return None,
        })
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in -19..0 {
            let error = Error::from_code(code).unwrap();
            assert_eq!(error.code(), code);
        }
        assert!(Error::from_code(0).is_none());
        assert!(Error::from_code(-20).is_none());
        assert!(Error::from_code(1).is_none());
    }
}
