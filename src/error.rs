use std::fmt;

/// Error taxonomy for header parsing, key derivation and session setup.
///
/// Exactly one of these is surfaced per `read`/`write` call. `WrongPassword` is the
/// only recoverable variant; callers may retry with another candidate. Everything
/// else is fatal for the current operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// The 4-byte magic did not match any supported header format.
    NotAVolume,
    /// Structural inconsistency in the header packets (bad length, unknown packet
    /// id, cipher not legal for the format). Never caused by a wrong password.
    BadFormat,
    /// The derived key-check word did not match the stored one.
    WrongPassword,
    /// The key-schedule self-test vectors did not reproduce. Indicates a broken
    /// arithmetic/endian environment, not a bad password; must abort before any
    /// password is accepted.
    SelfTestFailed,
    /// Allocation failure in key-derivation scratch buffers.
    OutOfMemory,
}

impl fmt::Display for VolumeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VolumeError::NotAVolume => write!(f, "Not an encrypted volume"),
            VolumeError::BadFormat => write!(f, "Corrupt volume header"),
            VolumeError::WrongPassword => write!(f, "Wrong password"),
            VolumeError::SelfTestFailed => write!(f, "Cipher self-test failed"),
            VolumeError::OutOfMemory => write!(f, "Out of memory during key derivation"),
        }
    }
}

impl std::error::Error for VolumeError {}
