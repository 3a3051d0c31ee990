//! Mount-session layer: unlocking a volume yields a `CryptoInfo` that owns the
//! key schedule and sector engine for the life of the mount.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cache::PasswordCache;
use crate::crypto::CipherId;
use crate::error::VolumeError;
use crate::header::{self, ParsedHeader};
use crate::kdf::Prf;
use crate::sector::{SectorEngine, SECTOR_SIZE};

/// Runtime session state for one mounted volume.
///
/// Owned exclusively by its mount session; the engine's key material is wiped
/// when the session is dropped or closed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CryptoInfo {
    #[zeroize(skip)]
    cipher: CipherId,
    engine: SectorEngine,
    /// Byte offset of the encrypted master key within the header, kept so a
    /// password change can re-encrypt in place.
    #[zeroize(skip)]
    master_key_offset: usize,
    #[zeroize(skip)]
    prf: Option<Prf>,
    #[zeroize(skip)]
    iterations: u32,
}

impl core::fmt::Debug for CryptoInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("CryptoInfo")
            .field("cipher", &self.cipher)
            .field("master_key_offset", &self.master_key_offset)
            .field("prf", &self.prf)
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl CryptoInfo {
    pub(crate) fn new(
        cipher: CipherId,
        engine: SectorEngine,
        master_key_offset: usize,
        prf: Option<Prf>,
        iterations: u32,
    ) -> Self {
        CryptoInfo {
            cipher,
            engine,
            master_key_offset,
            prf,
            iterations,
        }
    }

    pub fn cipher(&self) -> CipherId {
        self.cipher
    }

    pub fn prf(&self) -> Option<Prf> {
        self.prf
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn master_key_offset(&self) -> usize {
        self.master_key_offset
    }

    /// Encrypt `count` sectors in place, numbering them from `first_sector`.
    /// The buffer must have been validated by the I/O layer.
    pub fn encrypt_sector(&self, buf: &mut [u8], first_sector: u64, count: usize) {
        debug_assert!(buf.len() >= count * SECTOR_SIZE);
        self.engine
            .encrypt_sectors(&mut buf[..count * SECTOR_SIZE], first_sector);
    }

    /// Decrypt `count` sectors in place, numbering them from `first_sector`.
    pub fn decrypt_sector(&self, buf: &mut [u8], first_sector: u64, count: usize) {
        debug_assert!(buf.len() >= count * SECTOR_SIZE);
        self.engine
            .decrypt_sectors(&mut buf[..count * SECTOR_SIZE], first_sector);
    }
}

/// Unlock a volume from its header bytes.
///
/// The candidate password is tried first. On `WrongPassword` with `use_cache`
/// set, every cached password is tried in turn; if none fits, the original
/// `WrongPassword` stands. A successful direct unlock remembers the password
/// when `use_cache` is set.
pub fn open(
    dev: &[u8],
    password: &[u8],
    cache: &mut PasswordCache,
    use_cache: bool,
) -> Result<CryptoInfo, VolumeError> {
    match header::read(dev, password) {
        Ok(ParsedHeader { crypto, .. }) => {
            // Direct hit; remember the password if the caller allows caching.
            cache.remember(password, use_cache);
            Ok(crypto)
        }
        Err(VolumeError::WrongPassword) if use_cache => {
            // The candidate failed the key check; fall back to the cached slots.
            for cached in cache.iter() {
                if let Ok(ParsedHeader { crypto, .. }) = header::read(dev, cached) {
                    log::debug!("volume unlocked with a cached password");
                    return Ok(crypto);
                }
            }
            Err(VolumeError::WrongPassword)
        }
        Err(e) => Err(e),
    }
}

/// Tear down a session, wiping its key material.
pub fn close(info: CryptoInfo) {
    drop(info);
}
