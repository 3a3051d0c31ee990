//! Blowfish with the extended self-test-gated key schedule used by the legacy
//! volume format.
//!
//! This is the one primitive implemented in-crate: the extended schedule re-derives
//! the P-array and S-boxes from evolving CFB output, which the registry cipher
//! crates do not expose. The plain schedule doubles as the format-2 session cipher.

use byteorder::{BigEndian, ByteOrder};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::bf_tables::{P_INIT, S_INIT};
use crate::error::VolumeError;
use crate::kdf;

pub const BLOWFISH_MAX_KEY: usize = 56;

const ROUNDS: usize = 16;

/// Fixed self-test vector: plaintext and its ciphertext under the LCRNG-derived key.
const SELF_TEST_PLAIN: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
const SELF_TEST_CIPHER: [u8; 8] = [0x47, 0x45, 0xBD, 0x96, 0xBA, 0x2C, 0x9F, 0x66];

/// MINSTD checkpoints: state after 10 000 and 20 000 steps from seed 1.
/// The first is the published Park-Miller value 1043618065.
const LCRNG_CHECK_A: u32 = 0x3E34_5911;
const LCRNG_CHECK_B: u32 = 0x281F_9ED2;

/// Park-Miller minimal standard generator, x' = 16807 * x mod (2^31 - 1).
struct Lcrng(u32);

impl Lcrng {
    fn next(&mut self) -> u32 {
        self.0 = ((16807u64 * u64::from(self.0)) % 0x7FFF_FFFF) as u32;
        self.0
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Blowfish {
    p: [u32; 18],
    s: [[u32; 256]; 4],
}

impl Blowfish {
    /// Standard key schedule: XOR the key cyclically into the pi-digit P-array,
    /// then self-encrypt an all-zero block to fill P and the S-boxes.
    pub fn new(key: &[u8]) -> Self {
        let mut cipher = Blowfish { p: P_INIT, s: S_INIT };
        cipher.rekey(key);
        cipher
    }

    /// Re-run the standard schedule with a new key, discarding the old state.
    pub fn rekey(&mut self, key: &[u8]) {
        let key: &[u8] = if key.is_empty() { &[0u8] } else { key };
        self.p = P_INIT;
        self.s = S_INIT;

        let mut j = 0usize;
        for i in 0..18 {
            let mut word = 0u32;
            for _ in 0..4 {
                word = (word << 8) | u32::from(key[j]);
                j = (j + 1) % key.len();
            }
            self.p[i] ^= word;
        }

        let (mut l, mut r) = (0u32, 0u32);
        for i in (0..18).step_by(2) {
            let (nl, nr) = self.encrypt_words(l, r);
            l = nl;
            r = nr;
            self.p[i] = l;
            self.p[i + 1] = r;
        }
        for sbox in 0..4 {
            for i in (0..256).step_by(2) {
                let (nl, nr) = self.encrypt_words(l, r);
                l = nl;
                r = nr;
                self.s[sbox][i] = l;
                self.s[sbox][i + 1] = r;
            }
        }
    }

    #[inline]
    fn feistel(&self, x: u32) -> u32 {
        let a = (x >> 24) as usize;
        let b = (x >> 16) as usize & 0xFF;
        let c = (x >> 8) as usize & 0xFF;
        let d = x as usize & 0xFF;
        (self.s[0][a]
            .wrapping_add(self.s[1][b])
            ^ self.s[2][c])
            .wrapping_add(self.s[3][d])
    }

    pub fn encrypt_words(&self, mut l: u32, mut r: u32) -> (u32, u32) {
        for i in 0..ROUNDS {
            l ^= self.p[i];
            r ^= self.feistel(l);
            std::mem::swap(&mut l, &mut r);
        }
        std::mem::swap(&mut l, &mut r);
        r ^= self.p[16];
        l ^= self.p[17];
        (l, r)
    }

    pub fn decrypt_words(&self, mut l: u32, mut r: u32) -> (u32, u32) {
        for i in (2..18).rev() {
            l ^= self.p[i];
            r ^= self.feistel(l);
            std::mem::swap(&mut l, &mut r);
        }
        std::mem::swap(&mut l, &mut r);
        r ^= self.p[1];
        l ^= self.p[0];
        (l, r)
    }

    pub fn encrypt_block(&self, block: &mut [u8]) {
        let (l, r) = self.encrypt_words(
            BigEndian::read_u32(&block[0..4]),
            BigEndian::read_u32(&block[4..8]),
        );
        BigEndian::write_u32(&mut block[0..4], l);
        BigEndian::write_u32(&mut block[4..8], r);
    }

    pub fn decrypt_block(&self, block: &mut [u8]) {
        let (l, r) = self.decrypt_words(
            BigEndian::read_u32(&block[0..4]),
            BigEndian::read_u32(&block[4..8]),
        );
        BigEndian::write_u32(&mut block[0..4], l);
        BigEndian::write_u32(&mut block[4..8], r);
    }

    /// CFB-64 encryption in place. The IV carries across calls; a trailing partial
    /// block consumes keystream without advancing the feedback register.
    pub fn cfb_encrypt(&self, iv: &mut [u8; 8], data: &mut [u8]) {
        for chunk in data.chunks_mut(8) {
            let mut ks = *iv;
            self.encrypt_block(&mut ks);
            for (byte, k) in chunk.iter_mut().zip(ks.iter()) {
                *byte ^= k;
            }
            if chunk.len() == 8 {
                iv.copy_from_slice(chunk);
            }
            ks.zeroize();
        }
    }

    /// CFB-64 decryption in place. The ciphertext block is captured before the XOR
    /// so the feedback register sees what the encryptor produced.
    pub fn cfb_decrypt(&self, iv: &mut [u8; 8], data: &mut [u8]) {
        for chunk in data.chunks_mut(8) {
            let mut ks = *iv;
            self.encrypt_block(&mut ks);
            let mut feedback = [0u8; 8];
            feedback[..chunk.len()].copy_from_slice(chunk);
            for (byte, k) in chunk.iter_mut().zip(ks.iter()) {
                *byte ^= k;
            }
            if chunk.len() == 8 {
                *iv = feedback;
            }
            ks.zeroize();
            feedback.zeroize();
        }
    }
}

/// Result of the extended schedule: the final cipher state, the 256-byte derived
/// block (its trailing two bytes are the key-check word) and the CFB register as it
/// stood after the last stretch pass, ready to continue over the master key.
pub struct LegacyKey {
    pub cipher: Blowfish,
    pub derived: Zeroizing<[u8; 256]>,
    pub iv: [u8; 8],
}

/// Extended "stretch" schedule gated by arithmetic and cipher self-tests.
///
/// Fails closed with `SelfTestFailed` if either the LCRNG checkpoints or the fixed
/// known-answer vector do not reproduce; that signals a miscompiling environment,
/// not a bad password, and no password may be accepted afterwards.
pub fn key_init_extended(
    user_key: &[u8],
    iterations: u32,
    iv: [u8; 8],
) -> Result<LegacyKey, VolumeError> {
    let mut cipher = run_self_test(LCRNG_CHECK_A, LCRNG_CHECK_B, SELF_TEST_CIPHER)?;

    let mut derived = kdf::stretch_buffer(user_key);
    let mut iv = iv;
    for _ in 0..iterations {
        cipher.cfb_encrypt(&mut iv, &mut derived[..]);
        // The encryption output is the next key.
        cipher.rekey(&derived[..BLOWFISH_MAX_KEY]);
    }
    if iterations == 0 {
        cipher.rekey(&derived[..BLOWFISH_MAX_KEY]);
    }

    Ok(LegacyKey { cipher, derived, iv })
}

/// Shared by `key_init_extended` and the gating tests, which deliberately perturb
/// the expected values.
pub(crate) fn run_self_test(
    check_a: u32,
    check_b: u32,
    expected: [u8; 8],
) -> Result<Blowfish, VolumeError> {
    let mut rng = Lcrng(1);
    let mut x = 0u32;
    for _ in 0..10_000 {
        x = rng.next();
    }
    if x != check_a {
        log::error!("LCRNG checkpoint A mismatch");
        return Err(VolumeError::SelfTestFailed);
    }
    for _ in 0..10_000 {
        x = rng.next();
    }
    if x != check_b {
        log::error!("LCRNG checkpoint B mismatch");
        return Err(VolumeError::SelfTestFailed);
    }

    let mut key = Zeroizing::new([0u8; BLOWFISH_MAX_KEY]);
    for byte in key.iter_mut() {
        *byte = (rng.next() & 0xFF) as u8;
    }
    let cipher = Blowfish::new(&key[..]);

    let mut block = SELF_TEST_PLAIN;
    cipher.encrypt_block(&mut block);
    if block != expected {
        log::error!("Blowfish self-test ciphertext mismatch");
        return Err(VolumeError::SelfTestFailed);
    }
    cipher.decrypt_block(&mut block);
    if block != SELF_TEST_PLAIN {
        log::error!("Blowfish self-test round-trip mismatch");
        return Err(VolumeError::SelfTestFailed);
    }

    Ok(cipher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt_hex(key: &[u8], plain: &[u8]) -> String {
        let cipher = Blowfish::new(key);
        let mut block = [0u8; 8];
        block.copy_from_slice(plain);
        cipher.encrypt_block(&mut block);
        hex::encode(block)
    }

    #[test]
    fn known_answer_vectors() {
        assert_eq!(encrypt_hex(&[0u8; 8], &[0u8; 8]), "4ef997456198dd78");
        assert_eq!(encrypt_hex(&[0xFFu8; 8], &[0xFFu8; 8]), "51866fd5b85ecb8a");
        assert_eq!(
            encrypt_hex(
                &hex::decode("0123456789abcdef").unwrap(),
                &hex::decode("1111111111111111").unwrap()
            ),
            "61f9c3802281b096"
        );
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let cipher = Blowfish::new(b"some passphrase");
        let mut block = *b"8 bytes!";
        cipher.encrypt_block(&mut block);
        assert_ne!(&block, b"8 bytes!");
        cipher.decrypt_block(&mut block);
        assert_eq!(&block, b"8 bytes!");
    }

    #[test]
    fn cfb_round_trip_with_partial_tail() {
        let cipher = Blowfish::new(b"key material");
        let mut data = [0u8; 29];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = data;
        let mut iv = [7u8; 8];
        cipher.cfb_encrypt(&mut iv, &mut data);
        assert_ne!(data, original);

        let mut iv = [7u8; 8];
        cipher.cfb_decrypt(&mut iv, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn cfb_iv_carries_across_calls() {
        let cipher = Blowfish::new(b"key material");
        let mut whole = [0x5Au8; 32];
        let mut split = whole;

        let mut iv = [0u8; 8];
        cipher.cfb_encrypt(&mut iv, &mut whole);

        let mut iv = [0u8; 8];
        let (head, tail) = split.split_at_mut(16);
        cipher.cfb_encrypt(&mut iv, head);
        cipher.cfb_encrypt(&mut iv, tail);
        assert_eq!(whole, split);
    }

    #[test]
    fn self_test_passes_with_real_constants() {
        assert!(run_self_test(LCRNG_CHECK_A, LCRNG_CHECK_B, SELF_TEST_CIPHER).is_ok());
    }

    #[test]
    fn self_test_rejects_perturbed_lcrng_checkpoints() {
        assert!(matches!(
            run_self_test(LCRNG_CHECK_A ^ 1, LCRNG_CHECK_B, SELF_TEST_CIPHER),
            Err(VolumeError::SelfTestFailed)
        ));
        assert!(matches!(
            run_self_test(LCRNG_CHECK_A, LCRNG_CHECK_B ^ 1, SELF_TEST_CIPHER),
            Err(VolumeError::SelfTestFailed)
        ));
    }

    #[test]
    fn self_test_rejects_tampered_ciphertext() {
        let mut bad = SELF_TEST_CIPHER;
        bad[0] ^= 0x80;
        assert!(matches!(
            run_self_test(LCRNG_CHECK_A, LCRNG_CHECK_B, bad),
            Err(VolumeError::SelfTestFailed)
        ));
    }

    #[test]
    fn extended_schedule_is_deterministic() {
        let a = key_init_extended(b"password", 16, [1u8; 8]).unwrap();
        let b = key_init_extended(b"password", 16, [1u8; 8]).unwrap();
        assert_eq!(&a.derived[..], &b.derived[..]);
        assert_eq!(a.iv, b.iv);

        let c = key_init_extended(b"password", 17, [1u8; 8]).unwrap();
        assert_ne!(&a.derived[..], &c.derived[..]);
    }

    #[test]
    fn extended_schedule_zero_iterations_is_defined() {
        let key = key_init_extended(b"password", 0, [1u8; 8]).unwrap();
        // No stretch pass ran: buffer is the plain stretch buffer, IV untouched.
        assert_eq!(key.iv, [1u8; 8]);
        assert_eq!(&key.derived[2..10], b"password");
    }
}
