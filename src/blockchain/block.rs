use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{digest, to_hex};
use super::transaction::Transaction;
use crate::config::{Settings, COINBASE_ADDR, GENESIS_BLOCK_PREV};

/// Errors that can occur while working with a block
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Block has no transactions")]
    NoTransactions,
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Position of the block in the chain
    pub height: u64,

    /// Time the block candidate was created
    pub time: DateTime<Utc>,

    /// Merkle root of the transactions (empty until computed)
    pub root: Vec<u8>,

    /// Hash of the parent block, or the genesis sentinel
    pub prev: Vec<u8>,

    /// Proof of work
    pub nonce: u64,

    /// Hash of the header fields above (empty until mined)
    pub hash: Vec<u8>,
}

/// Block body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    /// Coinbase balance left after this block
    pub coinbase: i64,

    /// Ordered transactions, the reward transaction first once mined
    pub transactions: Vec<Transaction>,
}

/// Represents a block in the chain
///
/// `Clone` is a deep copy, so a cloned block can be edited freely without
/// touching the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Default for Block {
    fn default() -> Self {
        Block::new()
    }
}

impl Block {
    /// Creates an empty block stamped with the current time
    pub fn new() -> Self {
        Block {
            header: BlockHeader {
                height: 0,
                time: Utc::now(),
                root: Vec::new(),
                prev: Vec::new(),
                nonce: 0,
                hash: Vec::new(),
            },
            body: BlockBody::default(),
        }
    }

    /// Creates the genesis block candidate
    ///
    /// It carries a single declaration transaction that creates the
    /// coinbase pool with the configured starting amount.
    pub fn genesis(settings: &Settings) -> Self {
        let mut block = Block::new();
        block.header.prev = vec![GENESIS_BLOCK_PREV];
        block.body.coinbase = settings.coinbase_start;

        let mut declaration = Transaction::new();
        declaration
            .output_utxo
            .put(COINBASE_ADDR, COINBASE_ADDR, settings.coinbase_start);
        block.body.transactions.push(declaration);

        block
    }

    /// Appends a transaction, returning its index in the block
    pub fn add_transaction(&mut self, transaction: Transaction) -> usize {
        self.body.transactions.push(transaction);
        self.body.transactions.len() - 1
    }

    /// Returns the Merkle root, computing and caching it when the header has none
    pub fn merkle_root(&mut self) -> Result<Vec<u8>, BlockError> {
        if self.header.root.is_empty() {
            self.header.root = self.calc_merkle_root()?;
        }
        Ok(self.header.root.clone())
    }

    /// Recomputes the Merkle root from the transactions, ignoring the header
    pub fn calc_merkle_root(&self) -> Result<Vec<u8>, BlockError> {
        merkle_root(&self.transaction_bytes())
    }

    /// Canonical bytes of every transaction, in block order
    pub fn transaction_bytes(&self) -> Vec<Vec<u8>> {
        self.body.transactions.iter().map(Transaction::bytes).collect()
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 0
    }

    pub fn hash_hex(&self) -> String {
        to_hex(&self.header.hash)
    }

    pub fn root_hex(&self) -> String {
        to_hex(&self.header.root)
    }

    pub fn prev_hex(&self) -> String {
        to_hex(&self.header.prev)
    }
}

/// Computes the Merkle root of a list of leaves
///
/// A single leaf is simply hashed. Otherwise every level hashes each node
/// individually and concatenates the two hashes of each pair into the node
/// of the next level; an odd last node is paired with itself. This repeats
/// until one node remains, whose hash is the root.
pub fn merkle_root(leaves: &[Vec<u8>]) -> Result<Vec<u8>, BlockError> {
    if leaves.is_empty() {
        return Err(BlockError::NoTransactions);
    }

    let mut level: Vec<Vec<u8>> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 != 0 {
            let last = level[level.len() - 1].clone();
            level.push(last);
        }

        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut node = digest(&pair[0]);
                node.extend_from_slice(&digest(&pair[1]));
                node
            })
            .collect();
    }

    Ok(digest(&level[0]))
}
