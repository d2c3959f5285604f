// Blockchain module
//
// This module contains the ledger engine including:
// - UTXO records and lists
// - Transaction and block structures
// - Cryptography utilities
// - Proof of work
// - Wallets, nodes and the multi-node manager

pub mod block;
pub mod crypto;
pub mod manager;
pub mod node;
pub mod pow;
pub mod transaction;
pub mod utxo;
pub mod view;
pub mod wallet;

// Re-export main components for easier access
pub use block::{Block, BlockBody, BlockHeader};
pub use manager::{BlockRef, BroadcastReport, ConsensusOutcome, LedgerError, LedgerManager, TickReport};
pub use node::{Node, NodeError, TransactionVerificationError, VerificationError};
pub use pow::{CancellationToken, MiningError};
pub use transaction::Transaction;
pub use utxo::{Utxo, UtxoList};
pub use wallet::{Wallet, WalletError};
