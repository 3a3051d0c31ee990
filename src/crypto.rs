//! Cipher registry: wire identifiers, key/block sizes, per-format legality, and
//! the runtime block-cipher enum for format-2 volumes.

use cast5::Cast5;
use cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use des::{Des, TdesEde3};
use idea::Idea;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::blowfish::Blowfish;
use crate::error::VolumeError;
use crate::header::HeaderFormat;
use crate::mdc::{MDC_BLOCK_LEN, MDC_KEY_LEN};

pub const BLOCK_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherId {
    None,
    Des56,
    TripleDes,
    Idea,
    Cast,
    Blowfish,
    MdcSha,
}

impl CipherId {
    pub fn from_wire(value: u16) -> Option<CipherId> {
        match value {
            0 => Some(CipherId::None),
            1 => Some(CipherId::Des56),
            2 => Some(CipherId::TripleDes),
            3 => Some(CipherId::Idea),
            4 => Some(CipherId::Cast),
            5 => Some(CipherId::Blowfish),
            6 => Some(CipherId::MdcSha),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            CipherId::None => 0,
            CipherId::Des56 => 1,
            CipherId::TripleDes => 2,
            CipherId::Idea => 3,
            CipherId::Cast => 4,
            CipherId::Blowfish => 5,
            CipherId::MdcSha => 6,
        }
    }

    /// Bytes of master key consumed when keying this cipher.
    pub fn key_len(self) -> usize {
        match self {
            CipherId::None => 0,
            CipherId::Des56 => 8,
            CipherId::TripleDes => 24,
            CipherId::Idea => 16,
            CipherId::Cast => 16,
            CipherId::Blowfish => 32,
            CipherId::MdcSha => MDC_KEY_LEN,
        }
    }

    pub fn block_len(self) -> usize {
        match self {
            CipherId::None => 0,
            CipherId::MdcSha => MDC_BLOCK_LEN,
            _ => BLOCK_LEN,
        }
    }

    /// The legacy formats and format 2 have mutually exclusive cipher sets.
    pub fn is_legal_for(self, format: HeaderFormat) -> bool {
        match format {
            HeaderFormat::Legacy | HeaderFormat::Sfs => {
                matches!(self, CipherId::None | CipherId::MdcSha)
            }
            HeaderFormat::V2 => matches!(
                self,
                CipherId::Des56
                    | CipherId::TripleDes
                    | CipherId::Idea
                    | CipherId::Cast
                    | CipherId::Blowfish
            ),
        }
    }
}

/// Block cipher for format-2 volumes, one variant per supported primitive.
/// The registry crates wipe their round keys on drop via their `zeroize` features.
#[derive(Zeroize, ZeroizeOnDrop)]
pub enum FormatTwoCipher {
    Des(#[zeroize(skip)] Des),
    TripleDes(#[zeroize(skip)] TdesEde3),
    Idea(#[zeroize(skip)] Idea),
    Cast(#[zeroize(skip)] Cast5),
    Blowfish(Blowfish),
}

impl FormatTwoCipher {
    pub fn new(id: CipherId, key: &[u8]) -> Result<Self, VolumeError> {
        if key.len() < id.key_len() {
            return Err(VolumeError::BadFormat);
        }
        let key = &key[..id.key_len()];
        match id {
            CipherId::Des56 => Des::new_from_slice(key)
                .map(FormatTwoCipher::Des)
                .map_err(|_| VolumeError::BadFormat),
            CipherId::TripleDes => TdesEde3::new_from_slice(key)
                .map(FormatTwoCipher::TripleDes)
                .map_err(|_| VolumeError::BadFormat),
            CipherId::Idea => Idea::new_from_slice(key)
                .map(FormatTwoCipher::Idea)
                .map_err(|_| VolumeError::BadFormat),
            CipherId::Cast => Cast5::new_from_slice(key)
                .map(FormatTwoCipher::Cast)
                .map_err(|_| VolumeError::BadFormat),
            CipherId::Blowfish => Ok(FormatTwoCipher::Blowfish(Blowfish::new(key))),
            CipherId::None | CipherId::MdcSha => Err(VolumeError::BadFormat),
        }
    }

    pub fn encrypt_block(&self, block: &mut [u8]) {
        match self {
            FormatTwoCipher::Des(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            FormatTwoCipher::TripleDes(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            FormatTwoCipher::Idea(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            FormatTwoCipher::Cast(c) => c.encrypt_block(GenericArray::from_mut_slice(block)),
            FormatTwoCipher::Blowfish(c) => c.encrypt_block(block),
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8]) {
        match self {
            FormatTwoCipher::Des(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            FormatTwoCipher::TripleDes(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            FormatTwoCipher::Idea(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            FormatTwoCipher::Cast(c) => c.decrypt_block(GenericArray::from_mut_slice(block)),
            FormatTwoCipher::Blowfish(c) => c.decrypt_block(block),
        }
    }
}
