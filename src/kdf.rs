//! Password stretching: the pre-PKCS5 iterated CFB stretch over the MDC transform,
//! and PKCS#5 with a header-selected PRF.

use byteorder::{BigEndian, ByteOrder};
use hmac::Hmac;
use md5::Md5;
use pbkdf2::pbkdf2;
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::error::VolumeError;
use crate::mdc::{MdcCfb, MDC_KEY_LEN};

pub const SALT_LEN: usize = 20;
pub const DERIVED_KEY_LEN: usize = 256;

/// PRF selector stored in format-2 headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prf {
    Sha1,
    Md5,
}

impl Prf {
    pub fn from_wire(value: u16) -> Option<Prf> {
        match value {
            0 => Some(Prf::Sha1),
            1 => Some(Prf::Md5),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            Prf::Sha1 => 0,
            Prf::Md5 => 1,
        }
    }
}

/// Stretch input block shared by both legacy derivations: big-endian 16-bit
/// password length, up to 254 password bytes (longer passwords truncated),
/// zero padding.
pub(crate) fn stretch_buffer(password: &[u8]) -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
    let mut buf = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    BigEndian::write_u16(&mut buf[0..2], password.len().min(usize::from(u16::MAX)) as u16);
    let n = password.len().min(DERIVED_KEY_LEN - 2);
    buf[2..2 + n].copy_from_slice(&password[..n]);
    buf
}

/// The trailing two bytes of a derived block double as the key-check word.
pub fn key_check(derived: &[u8; DERIVED_KEY_LEN]) -> u16 {
    BigEndian::read_u16(&derived[DERIVED_KEY_LEN - 2..])
}

/// Legacy CFB-mode iterated stretch over the MDC transform, as used by SFS-era
/// volumes. The CFB state starts from the salt and carries across iterations; the
/// key block is re-loaded from the evolving buffer after every full pass.
pub fn derive_legacy(
    password: &[u8],
    salt: &[u8; SALT_LEN],
    iterations: u32,
) -> Zeroizing<[u8; DERIVED_KEY_LEN]> {
    let mut buf = stretch_buffer(password);
    let mut key = Zeroizing::new([0u8; MDC_KEY_LEN]);
    key.copy_from_slice(&buf[..MDC_KEY_LEN]);

    let mut cfb = MdcCfb::new(&key, salt);
    for _ in 0..iterations {
        cfb.encrypt(&mut buf[..]);
        key.copy_from_slice(&buf[..MDC_KEY_LEN]);
        cfb.set_key(&key);
    }
    buf
}

/// PKCS#5 stretch producing the full 256-byte derived block, bit-for-bit
/// reproducible for either PRF since volumes record which one was used.
pub fn derive_pkcs5(
    password: &[u8],
    salt: &[u8; SALT_LEN],
    iterations: u32,
    prf: Prf,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, VolumeError> {
    let mut out = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    let res = match prf {
        Prf::Sha1 => pbkdf2::<Hmac<Sha1>>(password, salt, iterations, &mut out[..]),
        Prf::Md5 => pbkdf2::<Hmac<Md5>>(password, salt, iterations, &mut out[..]),
    };
    res.map_err(|_| VolumeError::OutOfMemory)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; SALT_LEN] = [0x42; SALT_LEN];

    #[test]
    fn stretch_buffer_layout() {
        let buf = stretch_buffer(b"abc");
        assert_eq!(&buf[0..2], &[0, 3]);
        assert_eq!(&buf[2..5], b"abc");
        assert!(buf[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stretch_buffer_truncates_oversized_passwords() {
        let long = vec![0x61u8; 300];
        let buf = stretch_buffer(&long);
        assert_eq!(BigEndian::read_u16(&buf[0..2]), 300);
        assert!(buf[2..].iter().all(|&b| b == 0x61));
    }

    #[test]
    fn legacy_stretch_is_deterministic_and_sensitive() {
        let a = derive_legacy(b"password", &SALT, 32);
        let b = derive_legacy(b"password", &SALT, 32);
        assert_eq!(&a[..], &b[..]);

        let other_pw = derive_legacy(b"passwore", &SALT, 32);
        assert_ne!(&a[..], &other_pw[..]);

        let mut other_salt = SALT;
        other_salt[0] ^= 1;
        let c = derive_legacy(b"password", &other_salt, 32);
        assert_ne!(&a[..], &c[..]);

        let fewer = derive_legacy(b"password", &SALT, 31);
        assert_ne!(&a[..], &fewer[..]);
    }

    #[test]
    fn pkcs5_prfs_differ_and_reproduce() {
        let sha = derive_pkcs5(b"password", &SALT, 100, Prf::Sha1).unwrap();
        let sha2 = derive_pkcs5(b"password", &SALT, 100, Prf::Sha1).unwrap();
        let md5 = derive_pkcs5(b"password", &SALT, 100, Prf::Md5).unwrap();
        assert_eq!(&sha[..], &sha2[..]);
        assert_ne!(&sha[..], &md5[..]);
    }

    #[test]
    fn key_check_reads_trailing_word() {
        let mut block = [0u8; DERIVED_KEY_LEN];
        block[254] = 0xBE;
        block[255] = 0xEF;
        assert_eq!(key_check(&block), 0xBEEF);
    }

    #[test]
    fn prf_wire_values() {
        assert_eq!(Prf::from_wire(0), Some(Prf::Sha1));
        assert_eq!(Prf::from_wire(1), Some(Prf::Md5));
        assert_eq!(Prf::from_wire(2), None);
        assert_eq!(Prf::Sha1.to_wire(), 0);
        assert_eq!(Prf::Md5.to_wire(), 1);
    }
}
