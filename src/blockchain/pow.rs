// Proof of work
//
// A block hash is the digest of the header prefix (height, time, root,
// prev) followed by the big-endian nonce. It is valid when, read as an
// unsigned big-endian integer, it is strictly below `mine_base / mine_difficulty`.

use log::debug;
use primitive_types::U512;
use thiserror::Error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::block::{Block, BlockError, BlockHeader};
use super::crypto::digest;
use crate::config::Settings;

/// Errors that can occur while mining
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MiningError {
    #[error("Mining difficulty must not be zero")]
    ZeroDifficulty,

    #[error("Nonce space exhausted after {0} attempts")]
    NonceExhausted(u64),

    #[error("Mining cancelled after {0} attempts")]
    Cancelled(u64),

    #[error("Not enough coinbase: available {available}, reward {reward}")]
    InsufficientCoinbase { available: i64, reward: i64 },

    #[error("Failed to compute Merkle root: {0}")]
    MerkleRoot(#[from] BlockError),
}

/// Cancellation flag shared between a miner and whoever wants to stop it
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation of every search polling this token
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }
}

/// Computes the mining target
pub fn mine_target(settings: &Settings) -> Result<U512, MiningError> {
    if settings.mine_difficulty.is_zero() {
        return Err(MiningError::ZeroDifficulty);
    }
    Ok(settings.mine_base / settings.mine_difficulty)
}

/// Serializes the nonce-independent part of the header
pub fn header_prefix(header: &BlockHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + header.root.len() + header.prev.len());
    buf.extend_from_slice(&header.height.to_be_bytes());
    buf.extend_from_slice(&header.time.timestamp().to_be_bytes());
    buf.extend_from_slice(&header.root);
    buf.extend_from_slice(&header.prev);
    buf
}

/// Hash of a header prefix combined with a nonce
pub fn block_hash(prefix: &[u8], nonce: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(prefix.len() + 8);
    msg.extend_from_slice(prefix);
    msg.extend_from_slice(&nonce.to_be_bytes());
    digest(&msg)
}

fn below_target(hash: &[u8], target: &U512) -> bool {
    hash.len() <= 64 && U512::from_big_endian(hash) < *target
}

/// Searches for a nonce that satisfies the target
///
/// The Merkle root is computed (and cached on the header) first. Nonces are
/// tried in order from 0 up to `settings.nonce_max` (exclusive).
///
/// # Arguments
///
/// * `block` - The block to mine
/// * `settings` - Engine settings (target and nonce bound)
/// * `cancel` - Token polled before every attempt
///
/// # Returns
///
/// The winning `(nonce, hash)`
pub fn mine(
    block: &mut Block,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<(u64, Vec<u8>), MiningError> {
    let target = mine_target(settings)?;
    block.merkle_root()?;
    let prefix = header_prefix(&block.header);

    for nonce in 0..settings.nonce_max {
        if cancel.is_cancelled() {
            return Err(MiningError::Cancelled(nonce));
        }

        let hash = block_hash(&prefix, nonce);
        if below_target(&hash, &target) {
            debug!("Found nonce {} for block at height {}", nonce, block.header.height);
            return Ok((nonce, hash));
        }
    }

    Err(MiningError::NonceExhausted(settings.nonce_max))
}

/// Re-checks the proof of work stored in a block
///
/// The hash is recomputed from the header and the stored nonce; it must
/// equal the stored hash and be below the target.
pub fn check_nonce(block: &Block, settings: &Settings) -> bool {
    let target = match mine_target(settings) {
        Ok(target) => target,
        Err(_) => return false,
    };

    let hash = block_hash(&header_prefix(&block.header), block.header.nonce);
    hash == block.header.hash && below_target(&hash, &target)
}
