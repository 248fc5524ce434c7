//! Deterministic seed derivation (§4.7).
//!
//! Sub-seed for validation method `m`, trial index `i`:
//! `fold32(SHA256(seed_root || m || i))`. Identical `seed_root` always
//! produces identical per-trial RNG streams.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

/// `fold32`: XOR-fold a 32-byte SHA-256 digest down to a `u64` by treating
/// it as four little-endian `u64` words and XORing them together.
fn fold32(bytes: &[u8; 32]) -> u64 {
    let mut acc = 0u64;
    for chunk in bytes.chunks_exact(8) {
        let word = u64::from_le_bytes(chunk.try_into().unwrap());
        acc ^= word;
    }
    acc
}

pub fn sub_seed(seed_root: u64, method: &str, index: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed_root.to_le_bytes());
    hasher.update(method.as_bytes());
    hasher.update(index.to_le_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    fold32(&digest)
}

pub fn rng_for(seed_root: u64, method: &str, index: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(sub_seed(seed_root, method, index))
}
