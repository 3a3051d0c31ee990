//! Per-sector cipher engines.
//!
//! Both engines share one idea: derive a sector-unique IV by adding the absolute
//! sector number into a multi-word master IV with ripple carry, run a rotating
//! XOR-register pass over the sector words, then a chained keyed second pass
//! (hash compression for the legacy 5-word engine, block-cipher CBC for format
//! 2) over the whole sector. The second pass seeds its chaining value from the
//! tail of the first pass's output, captured before it is overwritten; on
//! decrypt every group but the first chains on ciphertext that is still on
//! disk, so the sector is undone back to front and the recovered plaintext
//! tail then unlocks the first group.

use byteorder::{BigEndian, ByteOrder};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::FormatTwoCipher;
use crate::mdc::{self, MDC_KEY_LEN};

pub const SECTOR_SIZE: usize = 512;

const SECTOR_WORDS: usize = 128;
// 128 words = 25 full 5-word groups plus a 3-word remainder.
const FULL_GROUPS: usize = 25;
const CBC_BLOCKS: usize = SECTOR_SIZE / 8;

/// Sector transform selected at header-parse time.
#[derive(Zeroize, ZeroizeOnDrop)]
pub enum SectorEngine {
    /// Unencrypted volume (legacy formats with cipher None).
    Identity,
    /// Legacy 5-word scramble keyed by the MDC compression primitive.
    LegacyFiveWord { iv: [u32; 5], key: [u8; MDC_KEY_LEN] },
    /// Format-2 rotating-register pass plus block-cipher CBC cascade.
    V2CbcCascade { iv: [u32; 2], cipher: FormatTwoCipher },
}

impl SectorEngine {
    pub fn encrypt_sectors(&self, data: &mut [u8], first_sector: u64) {
        // The I/O layer only ever hands over whole sectors.
        debug_assert!(data.len() % SECTOR_SIZE == 0);
        for (i, sector) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.encrypt_one(sector, first_sector.wrapping_add(i as u64));
        }
    }

    pub fn decrypt_sectors(&self, data: &mut [u8], first_sector: u64) {
        debug_assert!(data.len() % SECTOR_SIZE == 0);
        for (i, sector) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.decrypt_one(sector, first_sector.wrapping_add(i as u64));
        }
    }

    fn encrypt_one(&self, sector: &mut [u8], sector_no: u64) {
        match self {
            SectorEngine::Identity => {}
            SectorEngine::LegacyFiveWord { iv, key } => {
                legacy_encrypt(sector, sector_iv(*iv, sector_no), key)
            }
            SectorEngine::V2CbcCascade { iv, cipher } => {
                v2_encrypt(sector, sector_iv(*iv, sector_no), cipher)
            }
        }
    }

    fn decrypt_one(&self, sector: &mut [u8], sector_no: u64) {
        match self {
            SectorEngine::Identity => {}
            SectorEngine::LegacyFiveWord { iv, key } => {
                legacy_decrypt(sector, sector_iv(*iv, sector_no), key)
            }
            SectorEngine::V2CbcCascade { iv, cipher } => {
                v2_decrypt(sector, sector_iv(*iv, sector_no), cipher)
            }
        }
    }
}

/// Add the absolute sector number into the last IV word, rippling the carry
/// leftward; each word wraps at 2^32 and any carry past the first word is lost.
pub(crate) fn add_sector<const N: usize>(iv: &mut [u32; N], sector_no: u64) {
    let mut carry = sector_no;
    for i in (0..N).rev() {
        if carry == 0 {
            break;
        }
        let sum = u64::from(iv[i]) + (carry & 0xFFFF_FFFF);
        iv[i] = sum as u32;
        carry = (carry >> 32) + (sum >> 32);
    }
}

fn sector_iv<const N: usize>(mut iv: [u32; N], sector_no: u64) -> [u32; N] {
    add_sector(&mut iv, sector_no);
    iv
}

/// Endianness flip of every 32-bit group, applied on entry and exit of the legacy
/// engine (compatibility requirement; self-inverse).
fn byte_reverse(sector: &mut [u8]) {
    for group in sector.chunks_exact_mut(4) {
        group.reverse();
    }
}

/// Rotating-register XOR pass: `out[i] = in[i] ^ reg[i]`, then
/// `reg[i] = out[i] ^ reg[(i+1) % N]`, registers updated sequentially. The final
/// partial group (3 words for N = 5) uses the same discipline on its first slots.
fn register_pass_forward<const N: usize>(words: &mut [u32], mut reg: [u32; N]) {
    for group in words.chunks_mut(N) {
        for i in 0..group.len() {
            let out = group[i] ^ reg[i];
            group[i] = out;
            reg[i] = out ^ reg[(i + 1) % N];
        }
    }
    reg.zeroize();
}

/// Inverse of the forward pass. The register evolution depends only on the
/// ciphertext words, which both directions see, so the streams are identical.
fn register_pass_inverse<const N: usize>(words: &mut [u32], mut reg: [u32; N]) {
    for group in words.chunks_mut(N) {
        for i in 0..group.len() {
            let cipher = group[i];
            group[i] = cipher ^ reg[i];
            reg[i] = cipher ^ reg[(i + 1) % N];
        }
    }
    reg.zeroize();
}

/// XOR-fold the compression primitive over all 25 full groups and the 3-word
/// remainder, chaining on ciphertext groups. The chain is seeded from the last
/// five forward-pass output words, read before the pass overwrites them.
fn compress_pass_encrypt(words: &mut [u32; SECTOR_WORDS], key: &[u8; MDC_KEY_LEN]) {
    let mut state = [0u32; 5];
    state.copy_from_slice(&words[SECTOR_WORDS - 5..]);
    for group in words.chunks_mut(5) {
        let ks = mdc::compress(&state, key);
        for (w, k) in group.iter_mut().zip(ks.iter()) {
            *w ^= k;
        }
        // The remainder group is last and chains nothing further.
        if group.len() == 5 {
            state.copy_from_slice(group);
        }
    }
    state.zeroize();
}

/// Inverse, run back to front. Every group after the first took its keystream
/// from the preceding ciphertext group, which is still intact when walking
/// backwards; the first group's keystream came from the plaintext tail, which
/// the backward sweep has recovered by the time it is needed.
fn compress_pass_decrypt(words: &mut [u32; SECTOR_WORDS], key: &[u8; MDC_KEY_LEN]) {
    let mut state = [0u32; 5];

    // Remainder group, chained on the last full ciphertext group.
    state.copy_from_slice(&words[(FULL_GROUPS - 1) * 5..FULL_GROUPS * 5]);
    let ks = mdc::compress(&state, key);
    for (w, k) in words[FULL_GROUPS * 5..].iter_mut().zip(ks.iter()) {
        *w ^= k;
    }

    // Full groups 24 down to 1, each chained on its intact predecessor.
    for g in (1..FULL_GROUPS).rev() {
        state.copy_from_slice(&words[(g - 1) * 5..g * 5]);
        let ks = mdc::compress(&state, key);
        for (w, k) in words[g * 5..(g + 1) * 5].iter_mut().zip(ks.iter()) {
            *w ^= k;
        }
    }

    // Group 0, chained on the now-recovered plaintext tail.
    state.copy_from_slice(&words[SECTOR_WORDS - 5..]);
    let ks = mdc::compress(&state, key);
    for (w, k) in words[..5].iter_mut().zip(ks.iter()) {
        *w ^= k;
    }
    state.zeroize();
}

fn legacy_encrypt(sector: &mut [u8], iv: [u32; 5], key: &[u8; MDC_KEY_LEN]) {
    byte_reverse(sector);
    let mut words = [0u32; SECTOR_WORDS];
    BigEndian::read_u32_into(sector, &mut words);
    register_pass_forward(&mut words, iv);
    compress_pass_encrypt(&mut words, key);
    BigEndian::write_u32_into(&words, sector);
    words.zeroize();
    byte_reverse(sector);
}

fn legacy_decrypt(sector: &mut [u8], iv: [u32; 5], key: &[u8; MDC_KEY_LEN]) {
    byte_reverse(sector);
    let mut words = [0u32; SECTOR_WORDS];
    BigEndian::read_u32_into(sector, &mut words);
    compress_pass_decrypt(&mut words, key);
    register_pass_inverse(&mut words, iv);
    BigEndian::write_u32_into(&words, sector);
    words.zeroize();
    byte_reverse(sector);
}

fn v2_encrypt(sector: &mut [u8], iv: [u32; 2], cipher: &FormatTwoCipher) {
    let mut words = [0u32; SECTOR_WORDS];
    BigEndian::read_u32_into(sector, &mut words);
    register_pass_forward(&mut words, iv);
    BigEndian::write_u32_into(&words, sector);
    words.zeroize();

    // Chaining value seeded from the last forward-pass block, captured before
    // the CBC sweep reaches and overwrites it.
    let mut chain = [0u8; 8];
    chain.copy_from_slice(&sector[SECTOR_SIZE - 8..]);
    for block in sector.chunks_exact_mut(8) {
        for (b, c) in block.iter_mut().zip(chain.iter()) {
            *b ^= c;
        }
        cipher.encrypt_block(block);
        chain.copy_from_slice(block);
    }
    chain.zeroize();
}

fn v2_decrypt(sector: &mut [u8], iv: [u32; 2], cipher: &FormatTwoCipher) {
    // CBC undone first, back to front: blocks 63..1 each chain on the preceding
    // ciphertext block, still intact when walking backwards; block 0 chained on
    // the plaintext tail, which the sweep has recovered by then.
    let mut chain = [0u8; 8];
    for i in (1..CBC_BLOCKS).rev() {
        chain.copy_from_slice(&sector[(i - 1) * 8..i * 8]);
        let block = &mut sector[i * 8..(i + 1) * 8];
        cipher.decrypt_block(block);
        for (b, c) in block.iter_mut().zip(chain.iter()) {
            *b ^= c;
        }
    }
    chain.copy_from_slice(&sector[SECTOR_SIZE - 8..]);
    let block = &mut sector[..8];
    cipher.decrypt_block(block);
    for (b, c) in block.iter_mut().zip(chain.iter()) {
        *b ^= c;
    }
    chain.zeroize();

    let mut words = [0u32; SECTOR_WORDS];
    BigEndian::read_u32_into(sector, &mut words);
    register_pass_inverse(&mut words, iv);
    BigEndian::write_u32_into(&words, sector);
    words.zeroize();
}
