//! Hashcash proof-of-work over a [`DataId`].
//!
//! ```text
//! hash  = SHA-256(data_id || nonce_be)
//! valid = leading_zero_bits(hash) >= difficulty
//! ```
//!
//! Minting is CPU-bound. Async callers go through
//! `tokio::task::spawn_blocking`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::item::DataId;
use crate::config::MAX_POW_DIFFICULTY;

/// Upper bound on minting attempts.
const MAX_ITERATIONS: u64 = 1 << 30;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PowError {
    #[error("difficulty {0} exceeds maximum {max}", max = MAX_POW_DIFFICULTY)]
    DifficultyTooHigh(u8),

    #[error("no valid nonce found within {max} iterations", max = MAX_ITERATIONS)]
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfWork {
    pub nonce: u64,
    pub difficulty: u8,
}

fn pow_hash(data_id: &DataId, nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data_id.as_bytes());
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().into()
}

fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Searches for a nonce meeting `difficulty`.
pub fn mint(data_id: &DataId, difficulty: u8) -> Result<ProofOfWork, PowError> {
    if difficulty > MAX_POW_DIFFICULTY {
        return Err(PowError::DifficultyTooHigh(difficulty));
    }
    (0..MAX_ITERATIONS)
        .find(|nonce| leading_zero_bits(&pow_hash(data_id, *nonce)) >= u32::from(difficulty))
        .map(|nonce| ProofOfWork { nonce, difficulty })
        .ok_or(PowError::Exhausted)
}

/// Checks `proof` against `data_id`, requiring at least `min_difficulty`.
pub fn verify(data_id: &DataId, proof: &ProofOfWork, min_difficulty: u8) -> bool {
    proof.difficulty >= min_difficulty
        && proof.difficulty <= MAX_POW_DIFFICULTY
        && leading_zero_bits(&pow_hash(data_id, proof.nonce)) >= u32::from(proof.difficulty)
}
