// Read-only projections
//
// Plain serializable snapshots of engine state for printing or JSON output.
// Building a view never mutates the source.

use serde::Serialize;

use super::block::Block;
use super::node::Node;
use super::transaction::Transaction;
use super::utxo::UtxoList;
use super::wallet::Wallet;
use crate::config::Settings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UtxoEntry {
    pub id: String,
    pub addr: String,
    pub amount: i64,
}

/// Entries of a list in ascending id order
pub fn utxo_entries(list: &UtxoList) -> Vec<UtxoEntry> {
    list.sorted_items()
        .map(|(id, utxo)| UtxoEntry {
            id: id.clone(),
            addr: utxo.address.clone(),
            amount: utxo.amount,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockSummary {
    pub height: u64,
    pub coinbase: i64,
    pub nonce: u64,
    pub hash: String,
    pub root: String,
    pub prev: String,
    /// RFC 3339 timestamp
    pub time: String,
    pub transactions: usize,
}

impl From<&Block> for BlockSummary {
    fn from(block: &Block) -> Self {
        BlockSummary {
            height: block.header.height,
            coinbase: block.body.coinbase,
            nonce: block.header.nonce,
            hash: block.hash_hex(),
            root: block.root_hex(),
            prev: block.prev_hex(),
            time: block.header.time.to_rfc3339(),
            transactions: block.body.transactions.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionSummary {
    /// Position of the transaction in its block
    pub index: usize,
    pub signature: String,
    pub public_key: String,
    pub inputs: Vec<UtxoEntry>,
    pub outputs: Vec<UtxoEntry>,
}

impl TransactionSummary {
    pub fn new(index: usize, transaction: &Transaction) -> Self {
        TransactionSummary {
            index,
            signature: transaction.signature_hex(),
            public_key: transaction.public_key_hex(),
            inputs: utxo_entries(&transaction.input_utxo),
            outputs: utxo_entries(&transaction.output_utxo),
        }
    }
}

/// Summaries of every transaction of a block, in block order
pub fn transaction_summaries(block: &Block) -> Vec<TransactionSummary> {
    block
        .body
        .transactions
        .iter()
        .enumerate()
        .map(|(index, t)| TransactionSummary::new(index, t))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub id: String,
    pub coinbase: i64,
    pub utxo_count: usize,
    pub chain_length: usize,
    /// Whether the node is the current main (mining) node
    pub miner: bool,
}

impl NodeSummary {
    pub fn new(node: &Node, miner: bool) -> Self {
        NodeSummary {
            name: node.name().to_string(),
            id: node.id().to_string(),
            coinbase: node.coinbase_amount(),
            utxo_count: node.utxo().len(),
            chain_length: node.block_chain().len(),
            miner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletSummary {
    pub name: String,
    pub addr: String,
    pub balance: i64,
}

impl From<&Wallet> for WalletSummary {
    fn from(wallet: &Wallet) -> Self {
        WalletSummary {
            name: wallet.name().to_string(),
            addr: wallet.addr().to_string(),
            balance: wallet.balance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingsSummary {
    pub coinbase_start: i64,
    pub reward: i64,
    /// Decimal string, the value does not fit any JSON number
    pub mine_base: String,
    pub mine_difficulty: String,
    pub nonce_max: u64,
}

impl From<&Settings> for SettingsSummary {
    fn from(settings: &Settings) -> Self {
        SettingsSummary {
            coinbase_start: settings.coinbase_start,
            reward: settings.reward,
            mine_base: settings.mine_base.to_string(),
            mine_difficulty: settings.mine_difficulty.to_string(),
            nonce_max: settings.nonce_max,
        }
    }
}
