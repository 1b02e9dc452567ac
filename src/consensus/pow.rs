// Proof of Work implementation

use crate::core::{BlockHeader, Hash256, hash256};
use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// Difficulty target: `1 << (256 - bits)` as a 256-bit big-endian integer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Required leading zero bits
    pub bits: u32,
}

impl Target {
    /// `bits` must be in `1..=255`
    pub fn from_bits(bits: u32) -> Self {
        Self { bits }
    }

    /// Full 256-bit target
    pub fn to_hash256(&self) -> Hash256 {
        let shift = 256 - self.bits as usize;
        let mut target = [0u8; 32];
        target[31 - shift / 8] = 1 << (shift % 8);
        Hash256::new(target)
    }

    /// Check if a hash meets this target (hash < target)
    pub fn is_valid_hash(&self, hash: &Hash256) -> bool {
        hash.as_bytes() < self.to_hash256().as_bytes()
    }
}

/// Nonce search and validation against a fixed target
#[derive(Debug, Clone)]
pub struct ProofOfWork {
    pub target: Target,
    /// Cached target hash for fast comparison
    target_hash: Hash256,
}

impl ProofOfWork {
    pub fn new(bits: u32) -> Self {
        let target = Target::from_bits(bits);
        let target_hash = target.to_hash256();
        Self { target, target_hash }
    }

    pub fn target_bits(&self) -> u32 {
        self.target.bits
    }

    /// Find the first nonce whose header double-hash is below the target.
    /// The header's own nonce is ignored.
    pub fn search(&self, header: &BlockHeader) -> Result<MiningResult> {
        let start_time = Instant::now();
        let mut data = header.hashing_bytes();
        let nonce_at = data.len() - 4;
        let mut attempts = 0u64;

        for nonce in 0..=u32::MAX {
            data[nonce_at..].copy_from_slice(&nonce.to_le_bytes());
            let hash = hash256(&data);
            attempts += 1;

            if self.is_valid_hash_fast(&hash) {
                return Ok(MiningResult {
                    nonce,
                    hash,
                    attempts,
                    duration: start_time.elapsed(),
                });
            }

            if attempts % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!("Mining attempts: {} ({:.1} KH/s)",
                    attempts,
                    attempts as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }
        }

        Err(Error::NonceSpaceExhausted)
    }

    #[inline]
    fn is_valid_hash_fast(&self, hash: &Hash256) -> bool {
        hash.as_bytes() < self.target_hash.as_bytes()
    }

    /// Recompute the header hash with its stored nonce and check it against the target
    pub fn validate(&self, header: &BlockHeader) -> bool {
        self.is_valid_hash_fast(&header.hash())
    }
}

/// Outcome of a successful nonce search
#[derive(Debug)]
pub struct MiningResult {
    pub nonce: u32,
    pub hash: Hash256,
    pub attempts: u64,
    pub duration: Duration,
}

impl MiningResult {
    /// Hashes per second
    pub fn hash_rate(&self) -> f64 {
        self.attempts as f64 / self.duration.as_secs_f64()
    }
}
