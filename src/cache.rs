//! Fixed-capacity password cache used by the open path's retry loop.
//!
//! Four slots, round-robin replacement, linear lookup. The cache is a plain
//! value owned by the mount orchestrator, which serializes access to it;
//! nothing here is process-global.

use zeroize::{Zeroize, ZeroizeOnDrop};

pub const CACHE_SLOTS: usize = 4;
pub const MAX_CACHED_PASSWORD: usize = 64;

#[derive(Zeroize, ZeroizeOnDrop)]
struct Slot {
    password: [u8; MAX_CACHED_PASSWORD],
    /// 0 marks an empty slot.
    len: usize,
}

impl Slot {
    const EMPTY: Slot = Slot {
        password: [0u8; MAX_CACHED_PASSWORD],
        len: 0,
    };

    fn matches(&self, password: &[u8]) -> bool {
        self.len == password.len() && &self.password[..self.len] == password
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PasswordCache {
    slots: [Slot; CACHE_SLOTS],
    next: usize,
}

impl Default for PasswordCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordCache {
    pub fn new() -> Self {
        PasswordCache {
            slots: [Slot::EMPTY; CACHE_SLOTS],
            next: 0,
        }
    }

    /// Insert at the round-robin index unless caching is declined, the password
    /// is already present, or it does not fit a slot.
    pub fn remember(&mut self, password: &[u8], should_cache: bool) {
        if !should_cache
            || password.is_empty()
            || password.len() > MAX_CACHED_PASSWORD
            || self.contains(password)
        {
            return;
        }
        let slot = &mut self.slots[self.next];
        slot.password.zeroize();
        slot.password[..password.len()].copy_from_slice(password);
        slot.len = password.len();
        self.next = (self.next + 1) % CACHE_SLOTS;
    }

    pub fn contains(&self, password: &[u8]) -> bool {
        self.slots.iter().any(|s| s.matches(password))
    }

    /// Occupied slots in storage order; insertion order is irrelevant to lookup.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.slots
            .iter()
            .filter(|s| s.len > 0)
            .map(|s| &s.password[..s.len])
    }

    /// Overwrite all slot storage and reset the replacement index.
    pub fn wipe(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.zeroize();
        }
        self.next = 0;
    }
}
