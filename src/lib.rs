//! Volume encryption core: header codec, key derivation and per-sector ciphers
//! for the CAV, SFS1 and E4M2 container formats.
//!
//! A mount starts with [`open`], which recognizes the header format, stretches
//! the candidate password with the format's key-derivation scheme, verifies the
//! key-check word and decrypts the master key. The resulting [`CryptoInfo`]
//! then serves `encrypt_sector`/`decrypt_sector` calls from the I/O layer until
//! [`close`] wipes it.
//!
//! All key material is zeroized on every exit path, including parse failures;
//! the extended Blowfish schedule refuses to run at all if its arithmetic
//! self-tests do not reproduce.

mod bf_tables;

pub mod blowfish;
pub mod cache;
pub mod crypto;
pub mod entropy;
pub mod error;
pub mod header;
pub mod kdf;
pub mod mdc;
pub mod sector;
pub mod volume;

pub use cache::PasswordCache;
pub use crypto::CipherId;
pub use entropy::{EntropySource, OsEntropy};
pub use error::VolumeError;
pub use header::{recognize, FilesystemInfo, HeaderFormat, ParsedHeader, VolumeInfo, WriteParams};
pub use kdf::Prf;
pub use volume::{close, open, CryptoInfo};
