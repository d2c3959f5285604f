// Ledger manager
//
// Owns every node and every user wallet of a simulation. One node at a time
// is the main node: it collects transactions into its block candidate and
// mines. Mined blocks are offered to every other node, each of which
// verifies them on its own.

use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use thiserror::Error;

use std::collections::BTreeMap;
use std::sync::Arc;

use super::block::Block;
use super::node::{Node, NodeError};
use super::wallet::{Wallet, WalletError};
use super::view::{utxo_entries, NodeSummary, UtxoEntry, WalletSummary};
use crate::config::Settings;

/// Errors that can occur while driving a simulation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Node [{0}] not found")]
    NodeNotFound(String),

    #[error("Wallet [{0}] not found")]
    WalletNotFound(String),

    #[error("No nodes exist")]
    NoNodes,

    #[error("Main node not set")]
    NoMainNode,

    #[error("Node [{0}]: no block candidate")]
    NoBlockCandidate(String),

    #[error("Node [{node}]: invalid block height {height}")]
    BlockNotFound { node: String, height: u64 },

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

/// Which block of a node to look up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Candidate,
    Height(u64),
}

/// Per-node outcome of offering a block to the network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Names of the nodes that appended the block
    pub accepted: Vec<String>,

    /// Errors of the nodes that refused it
    pub rejected: Vec<NodeError>,
}

/// Result of a majority vote on a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusOutcome {
    /// False when strictly more than half of the nodes rejected the block
    pub passed: bool,

    /// Number of nodes that voted
    pub nodes: usize,

    /// Every rejection, kept for diagnostics
    pub errors: Vec<NodeError>,
}

/// What happened during one simulation tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Tick number, starting at 1
    pub tick: u64,
    pub miner: String,
    pub block: Block,
    pub broadcast: BroadcastReport,
    /// The main node selected for the next tick
    pub next_miner: String,
}

/// Multi-node orchestrator
#[derive(Debug)]
pub struct LedgerManager {
    settings: Arc<Settings>,
    // Keyed by node id
    nodes: BTreeMap<String, Node>,
    // User wallets keyed by address; node wallets live in their node
    wallets: BTreeMap<String, Wallet>,
    main_node: Option<String>,
    tick: u64,
}

impl LedgerManager {
    /// Creates an empty manager
    pub fn new(settings: Settings) -> Self {
        LedgerManager {
            settings: Arc::new(settings),
            nodes: BTreeMap::new(),
            wallets: BTreeMap::new(),
            main_node: None,
            tick: 0,
        }
    }

    /// Creates a manager with nodes `Node1`..`Node3` and wallet `User1`
    pub fn with_defaults(settings: Settings) -> Self {
        let mut manager = LedgerManager::new(settings);
        for name in ["Node1", "Node2", "Node3"] {
            manager.create_node(name);
        }
        manager.create_wallet("User1");
        manager
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Number of completed ticks
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Adds a node and returns its id
    pub fn create_node(&mut self, name: &str) -> String {
        let node = Node::new(name, Arc::clone(&self.settings));
        let id = node.id().to_string();
        info!("Node {} created with id {}", name, id);
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Adds a user wallet and returns its address
    pub fn create_wallet(&mut self, name: &str) -> String {
        let wallet = Wallet::new(name);
        let addr = wallet.addr().to_string();
        info!("Wallet {} created with address {}", name, addr);
        self.wallets.insert(addr.clone(), wallet);
        addr
    }

    pub fn node(&self, id: &str) -> Result<&Node, LedgerError> {
        self.nodes
            .get(id)
            .ok_or_else(|| LedgerError::NodeNotFound(id.to_string()))
    }

    /// Node ids in ascending order
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Finds a user or node wallet by address
    pub fn wallet(&self, addr: &str) -> Result<&Wallet, LedgerError> {
        self.wallets
            .get(addr)
            .or_else(|| {
                self.nodes
                    .values()
                    .map(Node::wallet)
                    .find(|w| w.addr() == addr)
            })
            .ok_or_else(|| LedgerError::WalletNotFound(addr.to_string()))
    }

    fn wallet_mut(&mut self, addr: &str) -> Option<&mut Wallet> {
        match self.wallets.get_mut(addr) {
            Some(wallet) => Some(wallet),
            None => self
                .nodes
                .values_mut()
                .map(Node::wallet_mut)
                .find(|w| w.addr() == addr),
        }
    }

    /// Picks a new main node uniformly at random
    ///
    /// The previous main node's block candidate is dropped and the new main
    /// node starts a fresh one.
    ///
    /// # Returns
    ///
    /// The id of the selected node
    pub fn select_main_node(&mut self) -> Result<String, LedgerError> {
        let ids = self.node_ids();
        let id = ids
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(LedgerError::NoNodes)?;
        self.select_main_node_by_id(&id)?;
        Ok(id)
    }

    /// Makes the given node the main node
    pub fn select_main_node_by_id(&mut self, id: &str) -> Result<(), LedgerError> {
        if !self.nodes.contains_key(id) {
            return Err(LedgerError::NodeNotFound(id.to_string()));
        }

        if let Some(old) = self.main_node.take() {
            if let Some(node) = self.nodes.get_mut(&old) {
                node.clear_block_candidate();
            }
        }

        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| LedgerError::NodeNotFound(id.to_string()))?;
        node.new_block_candidate();
        info!("Main node selected: {}", node.name());
        self.main_node = Some(id.to_string());
        Ok(())
    }

    /// The current main node, if any
    pub fn main_node(&self) -> Option<&Node> {
        self.main_node.as_ref().and_then(|id| self.nodes.get(id))
    }

    fn main_node_mut(&mut self) -> Result<&mut Node, LedgerError> {
        let id = self.main_node.as_ref().ok_or(LedgerError::NoMainNode)?;
        self.nodes
            .get_mut(id)
            .ok_or_else(|| LedgerError::NodeNotFound(id.clone()))
    }

    /// Returns the main node id, selecting one first when none is set
    pub fn get_or_select_main_node(&mut self) -> Result<String, LedgerError> {
        match &self.main_node {
            Some(id) => Ok(id.clone()),
            None => self.select_main_node(),
        }
    }

    /// Mines on the main node and syncs the wallets touched by the block
    pub fn mine(&mut self) -> Result<Block, LedgerError> {
        self.get_or_select_main_node()?;
        let block = self.main_node_mut()?.mine()?;
        self.update_wallets_utxo(&block);
        Ok(block)
    }

    /// Mirrors a block's UTXO changes into every known wallet
    ///
    /// Inputs owned by a known address leave its wallet, outputs owned by a
    /// known address are added to it.
    pub fn update_wallets_utxo(&mut self, block: &Block) {
        for transaction in &block.body.transactions {
            for (id, utxo) in &transaction.input_utxo {
                if let Some(wallet) = self.wallet_mut(&utxo.address) {
                    wallet.remove_utxo(id);
                }
            }
            for (id, utxo) in &transaction.output_utxo {
                if let Some(wallet) = self.wallet_mut(&utxo.address) {
                    wallet.add_utxo(id.clone(), utxo.address.clone(), utxo.amount);
                }
            }
        }
    }

    /// Builds a transfer from a wallet and stages it on the main node
    ///
    /// # Arguments
    ///
    /// * `from_addr` - Address of the sending wallet
    /// * `input_ids` - Ids of the sender's outputs to spend
    /// * `amounts` - Amount to send out of each input
    /// * `to_addr` - The recipient's address
    pub fn submit_transaction(
        &mut self,
        from_addr: &str,
        input_ids: &[String],
        amounts: &[i64],
        to_addr: &str,
    ) -> Result<(), LedgerError> {
        let transaction = self
            .wallet(from_addr)?
            .new_transaction(input_ids, amounts, to_addr)?;

        self.get_or_select_main_node()?;
        let node = self.main_node_mut()?;
        node.add_verify_transaction(transaction)?;
        info!("Node {}: transaction from {} staged", node.name(), from_addr);
        Ok(())
    }

    /// Offers a block to every node except the main node
    ///
    /// Rejections are collected, never propagated.
    pub fn broadcast_block(&mut self, block: &Block) -> Result<BroadcastReport, LedgerError> {
        let main_id = self.main_node.clone().ok_or(LedgerError::NoMainNode)?;
        let mut report = BroadcastReport::default();

        for (id, node) in self.nodes.iter_mut() {
            if *id == main_id {
                continue;
            }
            match node.add_verify_block(block) {
                Ok(()) => report.accepted.push(node.name().to_string()),
                Err(err) => report.rejected.push(err),
            }
        }

        debug!(
            "Block {} broadcast: {} accepted, {} rejected",
            block.header.height,
            report.accepted.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    /// Runs one round of the simulation
    ///
    /// The first tick turns the main node's candidate into the genesis block.
    /// Every tick mines, offers the block to the other nodes and then selects
    /// the main node for the next round. When the main node refuses its own
    /// block it keeps its turn with a fresh candidate.
    pub fn tick(&mut self) -> Result<TickReport, LedgerError> {
        if self.nodes.is_empty() {
            return Err(LedgerError::NoNodes);
        }

        self.get_or_select_main_node()?;
        if self.tick == 0 {
            let node = self.main_node_mut()?;
            info!("First tick: node {} creating genesis block", node.name());
            node.init_genesis_block()?;
        }

        let block = match self.mine() {
            Ok(block) => block,
            Err(err) => {
                error!("Tick {}: mining failed: {}", self.tick + 1, err);
                // A block refused by its own miner consumes the candidate
                let node = self.main_node_mut()?;
                if node.block_candidate().is_none() {
                    node.new_block_candidate();
                }
                return Err(err);
            }
        };
        let miner = self
            .main_node()
            .map(|n| n.name().to_string())
            .ok_or(LedgerError::NoMainNode)?;

        let broadcast = self.broadcast_block(&block)?;
        for err in &broadcast.rejected {
            warn!("Tick {}: {}", self.tick + 1, err);
        }

        self.tick += 1;
        let next_id = self.select_main_node()?;
        let next_miner = self.node(&next_id)?.name().to_string();

        info!(
            "Tick {} done: block {} mined by {}, next miner {}",
            self.tick, block.header.height, miner, next_miner
        );
        Ok(TickReport {
            tick: self.tick,
            miner,
            block,
            broadcast,
            next_miner,
        })
    }

    /// Asks every node to verify a block and tallies the votes
    ///
    /// The check fails when strictly more than half of the nodes reject the
    /// block. Nothing is appended anywhere.
    pub fn consensus_check(&self, block: &Block) -> ConsensusOutcome {
        let errors: Vec<NodeError> = self
            .nodes
            .values()
            .filter_map(|node| node.verify_block(block).err())
            .collect();

        let nodes = self.nodes.len();
        let passed = errors.len() <= nodes / 2;
        info!(
            "Consensus on block {}: {} of {} nodes rejected, {}",
            block.header.height,
            errors.len(),
            nodes,
            if passed { "passed" } else { "failed" }
        );

        ConsensusOutcome {
            passed,
            nodes,
            errors,
        }
    }

    /// Looks up a node's block candidate or a block of its chain
    pub fn node_block(&self, node_id: &str, block: BlockRef) -> Result<&Block, LedgerError> {
        let node = self.node(node_id)?;
        match block {
            BlockRef::Candidate => node
                .block_candidate()
                .ok_or_else(|| LedgerError::NoBlockCandidate(node_id.to_string())),
            BlockRef::Height(height) => node.block(height).ok_or_else(|| LedgerError::BlockNotFound {
                node: node_id.to_string(),
                height,
            }),
        }
    }

    /// A copy of the main node's block candidate, free to be edited
    pub fn steal_candidate(&self) -> Result<Block, LedgerError> {
        let node = self.main_node().ok_or(LedgerError::NoMainNode)?;
        node.block_candidate()
            .cloned()
            .ok_or_else(|| LedgerError::NoBlockCandidate(node.id().to_string()))
    }

    /// Replaces the main node's candidate WITHOUT any checks
    pub fn inject_candidate_unchecked(&mut self, block: Block) -> Result<(), LedgerError> {
        self.main_node_mut()?.inject_candidate_unchecked(block);
        Ok(())
    }

    /// Mines the main node's candidate and appends it WITHOUT verification
    pub fn mine_unchecked(&mut self) -> Result<Block, LedgerError> {
        let block = self.main_node_mut()?.mine_unchecked()?;
        self.update_wallets_utxo(&block);
        Ok(block)
    }

    /// Summaries of every node in id order
    pub fn node_summaries(&self) -> Vec<NodeSummary> {
        self.nodes
            .iter()
            .map(|(id, node)| NodeSummary::new(node, self.main_node.as_deref() == Some(id.as_str())))
            .collect()
    }

    /// Summaries of the user wallets followed by the node wallets
    pub fn wallet_summaries(&self) -> Vec<WalletSummary> {
        self.wallets
            .values()
            .chain(self.nodes.values().map(Node::wallet))
            .map(WalletSummary::from)
            .collect()
    }

    /// The cached outputs of one wallet
    pub fn wallet_utxos(&self, addr: &str) -> Result<Vec<UtxoEntry>, LedgerError> {
        Ok(utxo_entries(self.wallet(addr)?.utxo()))
    }
}
