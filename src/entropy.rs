//! Entropy collaborator used when writing fresh headers.

use rand::RngCore;

/// Source of random bytes for salts, master keys and IVs. Header writing takes
/// this as a parameter so tests can supply a deterministic source.
pub trait EntropySource {
    fn fill_random(&mut self, buf: &mut [u8]);
}

/// The operating system's CSPRNG.
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill_random(&mut self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_entropy_produces_distinct_buffers() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        OsEntropy.fill_random(&mut a);
        OsEntropy.fill_random(&mut b);
        assert_ne!(a, b);
        assert_ne!(a, [0u8; 32]);
    }
}
