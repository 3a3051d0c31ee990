//! The MDC/SHA mixing transform: the SHA compression function keyed by a 64-byte
//! block, used as the legacy formats' stream primitive and as the 5-word sector
//! scramble primitive.

use byteorder::{BigEndian, ByteOrder};
use sha1::digest::generic_array::{typenum::U64, GenericArray};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const MDC_KEY_LEN: usize = 64;
pub const MDC_BLOCK_LEN: usize = 20;

/// One application of the compression primitive: the 5-word chaining state is
/// compressed with the key block as the message schedule input.
pub fn compress(state: &[u32; 5], key: &[u8; MDC_KEY_LEN]) -> [u32; 5] {
    let mut out = *state;
    let block: &GenericArray<u8, U64> = GenericArray::from_slice(&key[..]);
    sha1::compress(&mut out, core::slice::from_ref(block));
    out
}

/// CFB over the MDC transform with a 20-byte feedback register.
///
/// Keystream position and feedback persist across calls: the Sfs header decrypts
/// the master key and then the filesystem packet with one continuing keystream,
/// and the legacy stretch re-keys mid-stream (256-byte passes over a 20-byte
/// block size never align).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MdcCfb {
    key: [u8; MDC_KEY_LEN],
    feedback: [u8; MDC_BLOCK_LEN],
    keystream: [u8; MDC_BLOCK_LEN],
    pos: usize,
}

impl MdcCfb {
    pub fn new(key: &[u8; MDC_KEY_LEN], iv: &[u8; MDC_BLOCK_LEN]) -> Self {
        MdcCfb {
            key: *key,
            feedback: *iv,
            keystream: [0u8; MDC_BLOCK_LEN],
            // Forces a keystream refill from the IV on first use.
            pos: MDC_BLOCK_LEN,
        }
    }

    /// Swap in a new key block; feedback and keystream position carry on.
    pub fn set_key(&mut self, key: &[u8; MDC_KEY_LEN]) {
        self.key.copy_from_slice(key);
    }

    fn refill(&mut self) {
        let mut state = [0u32; 5];
        BigEndian::read_u32_into(&self.feedback, &mut state);
        let out = compress(&state, &self.key);
        BigEndian::write_u32_into(&out, &mut self.keystream);
        state.zeroize();
        self.pos = 0;
    }

    pub fn encrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.pos == MDC_BLOCK_LEN {
                self.refill();
            }
            let c = *byte ^ self.keystream[self.pos];
            self.feedback[self.pos] = c;
            *byte = c;
            self.pos += 1;
        }
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            if self.pos == MDC_BLOCK_LEN {
                self.refill();
            }
            let c = *byte;
            self.feedback[self.pos] = c;
            *byte = c ^ self.keystream[self.pos];
            self.pos += 1;
        }
    }
}
