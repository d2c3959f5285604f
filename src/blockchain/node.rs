use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;

use std::collections::HashSet;
use std::sync::Arc;

use super::block::{Block, BlockError};
use super::pow::{self, CancellationToken, MiningError};
use super::transaction::{Transaction, TransactionError};
use super::utxo::{new_unique_id, UtxoList};
use super::wallet::Wallet;
use crate::config::{Settings, COINBASE_ADDR, GENESIS_BLOCK_PREV};

/// Reasons a block is refused by a node
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("failed to calculate Merkle root: {0}")]
    MerkleRootCalculation(#[from] BlockError),

    #[error("Merkle root check failed")]
    MerkleRoot,

    #[error("Nonce check failed")]
    Nonce,

    #[error("Height check failed: expected {expected}, got {got}")]
    Height { expected: u64, got: u64 },

    #[error("Reward transaction: no transactions in block")]
    NoTransactions,

    #[error("Reward transaction: expected 1 input utxo, got {0}")]
    RewardInputCount(usize),

    #[error("Reward transaction: expected 2 output utxo, got {0}")]
    RewardOutputCount(usize),

    #[error("Reward transaction: no coinbase input utxo")]
    RewardMissingCoinbaseInput,

    #[error("Reward transaction: coinbase input amount {got} is not equal to node coinbase {expected}")]
    RewardInputAmount { expected: i64, got: i64 },

    #[error("Reward transaction: no coinbase output utxo")]
    RewardMissingCoinbaseOutput,

    #[error("Reward transaction: coinbase output amount is {got}, expected {expected}")]
    RewardCoinbaseOutput { expected: i64, got: i64 },

    #[error("Reward transaction: miner reward is {got}, expected {expected}")]
    RewardAmount { expected: i64, got: i64 },

    #[error("Reward transaction: node coinbase {available} cannot pay reward {reward}")]
    RewardExceedsCoinbase { available: i64, reward: i64 },

    #[error("Genesis block: block chain is not empty")]
    GenesisChainNotEmpty,

    #[error("Genesis block: invalid prev hash")]
    GenesisPrev,

    #[error("Genesis block: time is in the future")]
    GenesisTime,

    #[error("Genesis block: invalid block coinbase {got}, expected {expected}")]
    GenesisCoinbase { expected: i64, got: i64 },

    #[error("Prev hash check failed")]
    PrevHash,

    #[error("Time check failed")]
    Time,

    #[error("Coinbase check failed: got {got}, expected {expected}")]
    Coinbase { expected: i64, got: i64 },

    #[error("Transaction {0}: input utxo check failed")]
    InputUtxo(usize),

    #[error("Transaction {index}: balance check failed: {source}")]
    Balance {
        index: usize,
        source: TransactionError,
    },

    #[error("Transaction {0}: signature check failed")]
    Signature(usize),
}

/// Reasons a transaction is refused admission to a block candidate
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionVerificationError {
    #[error("input utxo {0} used more than once")]
    DuplicateInput(String),

    #[error("output utxo {0} used more than once")]
    DuplicateOutput(String),

    #[error("input utxo {0} already in block candidate transactions")]
    InputInCandidate(String),

    #[error("output utxo {0} already in block candidate transactions")]
    OutputInCandidate(String),

    #[error("input and output sums are not equal: inputs {inputs}, outputs {outputs}")]
    Unbalanced { inputs: i64, outputs: i64 },

    #[error("utxo {0} holds a negative amount")]
    NegativeAmount(String),
}

/// Errors reported by a node, tagged with the node's name
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Node {node}: block verification failed: {source}")]
    BlockVerification {
        node: String,
        source: VerificationError,
    },

    #[error("Node {node}: transaction verification failed: {source}")]
    TransactionVerification {
        node: String,
        source: TransactionVerificationError,
    },

    #[error("Node {node}: no block candidate")]
    NoBlockCandidate { node: String },

    #[error("Node {node}: block chain is not empty")]
    ChainNotEmpty { node: String },

    #[error("Node {node}: mining failed: {source}")]
    Mining { node: String, source: MiningError },
}

/// A participant holding its own chain and UTXO set
///
/// A node is not internally synchronized; callers serialize access to it.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    id: String,
    utxo: UtxoList,
    wallet: Wallet,
    block_chain: Vec<Block>,
    block_candidate: Option<Block>,
    settings: Arc<Settings>,
}

impl Node {
    /// Creates a node with an empty chain and its own miner wallet
    ///
    /// # Arguments
    ///
    /// * `name` - Display name, also used for the node's wallet
    /// * `settings` - Shared engine settings
    pub fn new(name: impl Into<String>, settings: Arc<Settings>) -> Self {
        let name = name.into();
        let mut utxo = UtxoList::new();
        utxo.put(COINBASE_ADDR, COINBASE_ADDR, settings.coinbase_start);

        Node {
            wallet: Wallet::new(name.clone()),
            name,
            id: new_unique_id(),
            utxo,
            block_chain: Vec::new(),
            block_candidate: None,
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn utxo(&self) -> &UtxoList {
        &self.utxo
    }

    /// The wallet that receives this node's mining rewards
    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub(crate) fn wallet_mut(&mut self) -> &mut Wallet {
        &mut self.wallet
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn block_chain(&self) -> &[Block] {
        &self.block_chain
    }

    pub fn block(&self, height: u64) -> Option<&Block> {
        usize::try_from(height)
            .ok()
            .and_then(|h| self.block_chain.get(h))
    }

    pub fn block_candidate(&self) -> Option<&Block> {
        self.block_candidate.as_ref()
    }

    pub fn last_block(&self) -> Option<&Block> {
        self.block_chain.last()
    }

    fn chain_height(&self) -> u64 {
        self.block_chain.len() as u64
    }

    /// Current balance of the coinbase pseudo-UTXO
    pub fn coinbase_amount(&self) -> i64 {
        self.utxo.get(COINBASE_ADDR).map(|u| u.amount).unwrap_or(0)
    }

    /// Sets the genesis block as the block candidate
    pub fn init_genesis_block(&mut self) -> Result<&Block, NodeError> {
        if !self.block_chain.is_empty() {
            return Err(NodeError::ChainNotEmpty {
                node: self.name.clone(),
            });
        }
        Ok(self.block_candidate.insert(Block::genesis(&self.settings)))
    }

    /// Creates, mines and appends the genesis block
    pub fn create_genesis_block(&mut self) -> Result<Block, NodeError> {
        self.init_genesis_block()?;
        let result = self.mine();
        self.block_candidate = None;
        result
    }

    /// Replaces the block candidate with an empty block on top of the chain
    pub fn new_block_candidate(&mut self) -> &Block {
        let mut block = Block::new();
        block.header.height = self.chain_height();
        if let Some(last) = self.last_block() {
            block.header.prev = last.header.hash.clone();
            block.body.coinbase = last.body.coinbase;
        }
        self.block_candidate.insert(block)
    }

    pub fn clear_block_candidate(&mut self) {
        self.block_candidate = None;
    }

    /// Appends a transaction to the block candidate without any checks
    ///
    /// A candidate is opened first when there is none.
    pub fn add_transaction(&mut self, transaction: Transaction) {
        if self.block_candidate.is_none() {
            self.new_block_candidate();
        }
        if let Some(candidate) = self.block_candidate.as_mut() {
            candidate.add_transaction(transaction);
        }
    }

    /// Checks a transaction before it is admitted to the block candidate
    ///
    /// Every input and output id must be used once within the transaction,
    /// must not appear in any transaction already in the candidate, no amount
    /// may be negative, and the input and output sums must match.
    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<(), NodeError> {
        self.check_transaction(transaction)
            .map_err(|source| NodeError::TransactionVerification {
                node: self.name.clone(),
                source,
            })
    }

    fn check_transaction(&self, transaction: &Transaction) -> Result<(), TransactionVerificationError> {
        let staged = self.candidate_utxo_ids();
        let mut seen: HashSet<&str> = HashSet::new();

        for id in transaction.input_utxo.ids() {
            if !seen.insert(id) {
                return Err(TransactionVerificationError::DuplicateInput(id.to_string()));
            }
            if staged.contains(id) {
                return Err(TransactionVerificationError::InputInCandidate(id.to_string()));
            }
        }

        for id in transaction.output_utxo.ids() {
            if !seen.insert(id) {
                return Err(TransactionVerificationError::DuplicateOutput(id.to_string()));
            }
            if staged.contains(id) {
                return Err(TransactionVerificationError::OutputInCandidate(id.to_string()));
            }
        }

        match transaction.verify_balance() {
            Ok(()) => Ok(()),
            Err(TransactionError::NegativeAmount(id)) => {
                Err(TransactionVerificationError::NegativeAmount(id))
            }
            Err(_) => Err(TransactionVerificationError::Unbalanced {
                inputs: transaction.input_utxo.sum(),
                outputs: transaction.output_utxo.sum(),
            }),
        }
    }

    /// Verifies a transaction and, when valid, stages it in the block candidate
    pub fn add_verify_transaction(&mut self, transaction: Transaction) -> Result<(), NodeError> {
        self.verify_transaction(&transaction)?;
        self.add_transaction(transaction);
        debug!("Node {}: transaction added to block candidate", self.name);
        Ok(())
    }

    fn candidate_utxo_ids(&self) -> HashSet<&str> {
        self.block_candidate
            .iter()
            .flat_map(|b| b.body.transactions.iter())
            .flat_map(|t| t.input_utxo.ids().chain(t.output_utxo.ids()))
            .collect()
    }

    /// Mines the block candidate and appends it after full verification
    ///
    /// The candidate is consumed once mining succeeds, whether or not the
    /// mined block then passes verification.
    pub fn mine(&mut self) -> Result<Block, NodeError> {
        self.mine_cancellable(&CancellationToken::new())
    }

    /// Same as [`Node::mine`], stopping early when `cancel` is triggered
    pub fn mine_cancellable(&mut self, cancel: &CancellationToken) -> Result<Block, NodeError> {
        let block = self.mine_block_candidate(cancel)?;
        self.add_verify_block(&block)?;
        info!(
            "Node {}: mined block {} with nonce {}",
            self.name, block.header.height, block.header.nonce
        );
        Ok(block)
    }

    /// Mines the block candidate and appends it WITHOUT verification
    ///
    /// Lets an operator forge blocks that break consensus rules. Never called
    /// by the regular mining flow.
    pub fn mine_unchecked(&mut self) -> Result<Block, NodeError> {
        let block = self.mine_block_candidate(&CancellationToken::new())?;
        warn!(
            "Node {}: appending unchecked block at height {}",
            self.name, block.header.height
        );
        self.append_block(&block);
        Ok(block)
    }

    /// Replaces the block candidate with an arbitrary block, WITHOUT checks
    pub fn inject_candidate_unchecked(&mut self, block: Block) {
        warn!("Node {}: block candidate replaced without checks", self.name);
        self.block_candidate = Some(block);
    }

    // Works on a copy of the candidate so a failed search leaves it as it was.
    fn mine_block_candidate(&mut self, cancel: &CancellationToken) -> Result<Block, NodeError> {
        let mut block = self
            .block_candidate
            .clone()
            .ok_or_else(|| NodeError::NoBlockCandidate {
                node: self.name.clone(),
            })?;

        if let Err(source) = self.seal_block(&mut block, cancel) {
            return Err(NodeError::Mining {
                node: self.name.clone(),
                source,
            });
        }

        self.block_candidate = None;
        Ok(block)
    }

    fn seal_block(&self, block: &mut Block, cancel: &CancellationToken) -> Result<(), MiningError> {
        self.add_reward_transaction(block)?;
        let (nonce, hash) = pow::mine(block, &self.settings, cancel)?;
        block.header.nonce = nonce;
        block.header.hash = hash;
        block.body.coinbase = block
            .body
            .coinbase
            .checked_sub(self.settings.reward)
            .ok_or(MiningError::InsufficientCoinbase {
                available: block.body.coinbase,
                reward: self.settings.reward,
            })?;
        Ok(())
    }

    /// Inserts the reward transaction at the front of `block`
    ///
    /// It spends the whole coinbase pseudo-UTXO into a reward output for this
    /// node's wallet and the decremented coinbase remainder.
    pub fn add_reward_transaction(&self, block: &mut Block) -> Result<(), MiningError> {
        let coinbase = self.coinbase_amount();
        let reward = self.settings.reward;
        if coinbase < reward {
            return Err(MiningError::InsufficientCoinbase {
                available: coinbase,
                reward,
            });
        }

        let mut reward_tx = Transaction::new();
        reward_tx.input_utxo.put(COINBASE_ADDR, COINBASE_ADDR, coinbase);
        reward_tx.output_utxo.new_record(self.wallet.addr(), reward);
        reward_tx
            .output_utxo
            .put(COINBASE_ADDR, COINBASE_ADDR, coinbase - reward);
        block.body.transactions.insert(0, reward_tx);
        Ok(())
    }

    /// Runs every consensus check against a block without applying it
    pub fn verify_block(&self, block: &Block) -> Result<(), NodeError> {
        self.check_block(block)
            .map_err(|source| NodeError::BlockVerification {
                node: self.name.clone(),
                source,
            })
    }

    /// Verifies a block and, when valid, appends it and applies its transactions
    pub fn add_verify_block(&mut self, block: &Block) -> Result<(), NodeError> {
        if let Err(err) = self.verify_block(block) {
            warn!("{}", err);
            return Err(err);
        }
        self.append_block(block);
        info!(
            "Node {}: block {} accepted, coinbase {}",
            self.name,
            block.header.height,
            self.coinbase_amount()
        );
        Ok(())
    }

    fn check_block(&self, block: &Block) -> Result<(), VerificationError> {
        self.check_structure(block)?;
        self.check_reward_transaction(block)?;
        if block.header.height == 0 {
            self.check_genesis_block(block)
        } else {
            self.check_common_block(block)
        }
    }

    fn check_structure(&self, block: &Block) -> Result<(), VerificationError> {
        if block.calc_merkle_root()? != block.header.root {
            return Err(VerificationError::MerkleRoot);
        }

        if !pow::check_nonce(block, &self.settings) {
            return Err(VerificationError::Nonce);
        }

        let expected = self.chain_height();
        if block.header.height != expected {
            return Err(VerificationError::Height {
                expected,
                got: block.header.height,
            });
        }
        Ok(())
    }

    fn check_reward_transaction(&self, block: &Block) -> Result<(), VerificationError> {
        let reward_tx = block
            .body
            .transactions
            .first()
            .ok_or(VerificationError::NoTransactions)?;

        if reward_tx.input_utxo.len() != 1 {
            return Err(VerificationError::RewardInputCount(reward_tx.input_utxo.len()));
        }
        if reward_tx.output_utxo.len() != 2 {
            return Err(VerificationError::RewardOutputCount(reward_tx.output_utxo.len()));
        }

        let coinbase = self.coinbase_amount();
        let reward = self.settings.reward;
        let remainder = coinbase
            .checked_sub(reward)
            .filter(|r| *r >= 0)
            .ok_or(VerificationError::RewardExceedsCoinbase {
                available: coinbase,
                reward,
            })?;

        let input = reward_tx
            .input_utxo
            .get(COINBASE_ADDR)
            .filter(|u| u.address == COINBASE_ADDR)
            .ok_or(VerificationError::RewardMissingCoinbaseInput)?;
        if input.amount != coinbase {
            return Err(VerificationError::RewardInputAmount {
                expected: coinbase,
                got: input.amount,
            });
        }

        let coinbase_output = reward_tx.output_utxo.get(COINBASE_ADDR);
        if coinbase_output.map_or(true, |u| u.address != COINBASE_ADDR) {
            return Err(VerificationError::RewardMissingCoinbaseOutput);
        }

        for (id, output) in &reward_tx.output_utxo {
            if id == COINBASE_ADDR {
                if output.amount != remainder {
                    return Err(VerificationError::RewardCoinbaseOutput {
                        expected: remainder,
                        got: output.amount,
                    });
                }
            } else if output.amount != reward {
                return Err(VerificationError::RewardAmount {
                    expected: reward,
                    got: output.amount,
                });
            }
        }
        Ok(())
    }

    fn check_genesis_block(&self, block: &Block) -> Result<(), VerificationError> {
        if !self.block_chain.is_empty() {
            return Err(VerificationError::GenesisChainNotEmpty);
        }
        if block.header.prev != [GENESIS_BLOCK_PREV] {
            return Err(VerificationError::GenesisPrev);
        }
        if block.header.time > Utc::now() {
            return Err(VerificationError::GenesisTime);
        }

        let expected = self.settings.coinbase_start.saturating_sub(self.settings.reward);
        if block.body.coinbase != expected {
            return Err(VerificationError::GenesisCoinbase {
                expected,
                got: block.body.coinbase,
            });
        }
        Ok(())
    }

    fn check_common_block(&self, block: &Block) -> Result<(), VerificationError> {
        // Height was checked against the chain length, so a parent exists
        let last = self.last_block().ok_or(VerificationError::Height {
            expected: 0,
            got: block.header.height,
        })?;

        if block.header.prev != last.header.hash {
            return Err(VerificationError::PrevHash);
        }

        if last.header.time > block.header.time {
            return Err(VerificationError::Time);
        }

        let expected = last.body.coinbase.checked_sub(self.settings.reward);
        if block.body.coinbase < 0 || expected != Some(block.body.coinbase) {
            return Err(VerificationError::Coinbase {
                expected: last.body.coinbase.saturating_sub(self.settings.reward),
                got: block.body.coinbase,
            });
        }

        for (index, transaction) in block.body.transactions.iter().enumerate().skip(1) {
            if !self.utxo.contains(&transaction.input_utxo) {
                return Err(VerificationError::InputUtxo(index));
            }
            // Only the first transaction may mint coins
            if let Err(source) = transaction.verify_balance() {
                return Err(VerificationError::Balance { index, source });
            }
            if !transaction.verify_signature() {
                return Err(VerificationError::Signature(index));
            }
        }
        Ok(())
    }

    fn append_block(&mut self, block: &Block) {
        let stored = block.clone();
        for transaction in &stored.body.transactions {
            self.utxo.remove_records(&transaction.input_utxo);
            self.utxo.add_records(&transaction.output_utxo);
        }
        self.utxo
            .put(COINBASE_ADDR, COINBASE_ADDR, stored.body.coinbase);
        self.block_chain.push(stored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::utxo::Utxo;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn node(name: &str) -> Node {
        Node::new(name, settings())
    }

    /// A signed transfer from `wallet` spending `utxo_id`
    fn transfer(wallet: &Wallet, utxo_id: &str, amount: i64, to: &str) -> Transaction {
        wallet
            .new_transaction(&[utxo_id.to_string()], &[amount], to)
            .unwrap()
    }

    /// Id of the first output the node's chain pays to its own wallet
    fn reward_id(miner: &Node) -> String {
        miner
            .utxo()
            .filter_by_address(miner.wallet().addr())
            .ids()
            .next()
            .unwrap()
            .to_string()
    }

    /// Copies the node's reward outputs into its wallet cache
    fn sync_wallet(node: &mut Node) {
        let addr = node.wallet().addr().to_string();
        let owned: Vec<(String, Utxo)> = node
            .utxo()
            .filter_by_address(&addr)
            .sorted_items()
            .map(|(id, u)| (id.clone(), u.clone()))
            .collect();
        for (id, utxo) in owned {
            node.wallet_mut().add_utxo(id, utxo.address, utxo.amount);
        }
    }

    /// A genesis block whose reward transaction was edited by `tamper`
    /// before the nonce search, so only the reward rules can catch it
    fn forge_genesis_reward(miner: &mut Node, tamper: impl FnOnce(&mut Transaction, &str)) -> Block {
        miner.init_genesis_block().unwrap();
        let mut forged = miner.block_candidate().cloned().unwrap();
        miner.add_reward_transaction(&mut forged).unwrap();

        let addr = miner.wallet().addr().to_string();
        let reward_output = forged.body.transactions[0]
            .output_utxo
            .filter_by_address(&addr)
            .ids()
            .next()
            .unwrap()
            .to_string();
        tamper(&mut forged.body.transactions[0], &reward_output);

        let (nonce, hash) =
            pow::mine(&mut forged, miner.settings(), &CancellationToken::new()).unwrap();
        forged.header.nonce = nonce;
        forged.header.hash = hash;
        forged.body.coinbase -= 5;
        forged
    }

    /// Miner and follower sharing a genesis block, with the miner's reward
    /// output synced into its wallet
    fn pair() -> (Node, Node) {
        let mut miner = node("Node1");
        let mut follower = node("Node2");
        let genesis = miner.create_genesis_block().unwrap();
        follower.add_verify_block(&genesis).unwrap();
        sync_wallet(&mut miner);
        (miner, follower)
    }

    #[test]
    fn test_new_node() {
        let n = node("Node1");
        assert_eq!(n.name(), "Node1");
        assert_eq!(n.wallet().name(), "Node1");
        assert_eq!(n.coinbase_amount(), 1_000_000);
        assert!(n.block_chain().is_empty());
        assert!(n.block_candidate().is_none());
        assert!(n.last_block().is_none());
    }

    #[test]
    fn test_create_genesis_block() {
        let mut n = node("Node1");
        let block = n.create_genesis_block().unwrap();

        assert_eq!(block.header.height, 0);
        assert_eq!(block.body.coinbase, 999_995);
        assert!(block.body.transactions[0].is_reward());
        assert_eq!(n.block_chain().len(), 1);
        assert_eq!(n.coinbase_amount(), 999_995);
        assert_eq!(n.utxo().filter_by_address(n.wallet().addr()).sum(), 5);
        assert!(n.block_candidate().is_none());

        assert!(matches!(
            n.create_genesis_block(),
            Err(NodeError::ChainNotEmpty { .. })
        ));
    }

    #[test]
    fn test_genesis_verified_by_other_nodes() {
        let mut miner = node("Node1");
        let block = miner.create_genesis_block().unwrap();

        for name in ["Node2", "Node3"] {
            let mut other = node(name);
            other.add_verify_block(&block).unwrap();
            assert_eq!(other.coinbase_amount(), 999_995);
            assert_eq!(other.block_chain()[0], block);
        }
    }

    #[test]
    fn test_candidate_links_to_last_block() {
        let mut n = node("Node1");
        let genesis = n.create_genesis_block().unwrap();

        let candidate = n.new_block_candidate().clone();
        assert_eq!(candidate.header.height, 1);
        assert_eq!(candidate.header.prev, genesis.header.hash);
        assert_eq!(candidate.body.coinbase, genesis.body.coinbase);
        assert!(candidate.body.transactions.is_empty());
    }

    #[test]
    fn test_mine_without_candidate_fails() {
        let mut n = node("Node1");
        assert!(matches!(n.mine(), Err(NodeError::NoBlockCandidate { .. })));
    }

    #[test]
    fn test_failed_mining_leaves_state_untouched() {
        let mut n = Node::new("Node1", Arc::new(Settings::default().with_nonce_max(0)));
        n.init_genesis_block().unwrap();
        let before = n.block_candidate().cloned();

        assert!(matches!(
            n.mine(),
            Err(NodeError::Mining {
                source: MiningError::NonceExhausted(0),
                ..
            })
        ));
        assert_eq!(n.block_candidate().cloned(), before);
        assert!(n.block_chain().is_empty());
        assert_eq!(n.coinbase_amount(), 1_000_000);
    }

    #[test]
    fn test_cancelled_mining() {
        let mut n = node("Node1");
        n.init_genesis_block().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            n.mine_cancellable(&token),
            Err(NodeError::Mining {
                source: MiningError::Cancelled(_),
                ..
            })
        ));
        assert!(n.block_candidate().is_some());
    }

    #[test]
    fn test_insufficient_coinbase() {
        let mut s = Settings::default();
        s.coinbase_start = 3;
        let mut n = Node::new("Node1", Arc::new(s));
        n.init_genesis_block().unwrap();

        assert!(matches!(
            n.mine(),
            Err(NodeError::Mining {
                source: MiningError::InsufficientCoinbase {
                    available: 3,
                    reward: 5
                },
                ..
            })
        ));
    }

    #[test]
    fn test_verify_transaction_rejects_double_spend_in_candidate() {
        let mut n = node("Node1");
        n.create_genesis_block().unwrap();
        sync_wallet(&mut n);
        n.new_block_candidate();

        let spend = reward_id(&n);
        let bob = Wallet::new("bob");
        let first = transfer(n.wallet(), &spend, 2, bob.addr());
        let second = transfer(n.wallet(), &spend, 3, bob.addr());

        n.add_verify_transaction(first).unwrap();
        let err = n.add_verify_transaction(second).unwrap_err();
        assert_eq!(
            err,
            NodeError::TransactionVerification {
                node: "Node1".to_string(),
                source: TransactionVerificationError::InputInCandidate(spend),
            }
        );
        assert_eq!(n.block_candidate().unwrap().body.transactions.len(), 1);
    }

    #[test]
    fn test_verify_transaction_rejects_malformed() {
        let n = node("Node1");

        let mut shared_id = Transaction::new();
        shared_id.input_utxo.put("x", "alice", 5);
        shared_id.output_utxo.put("x", "bob", 5);
        assert!(matches!(
            n.verify_transaction(&shared_id),
            Err(NodeError::TransactionVerification {
                source: TransactionVerificationError::DuplicateOutput(_),
                ..
            })
        ));

        let mut unbalanced = Transaction::new();
        unbalanced.input_utxo.put("a", "alice", 5);
        unbalanced.output_utxo.put("b", "bob", 6);
        assert!(matches!(
            n.verify_transaction(&unbalanced),
            Err(NodeError::TransactionVerification {
                source: TransactionVerificationError::Unbalanced { inputs: 5, outputs: 6 },
                ..
            })
        ));

        let mut overflowing = Transaction::new();
        overflowing.input_utxo.put("c", "alice", 1);
        overflowing.output_utxo.put("a", "bob", i64::MAX);
        overflowing.output_utxo.put("b", "bob", 1);
        assert!(matches!(
            n.verify_transaction(&overflowing),
            Err(NodeError::TransactionVerification {
                source: TransactionVerificationError::Unbalanced { .. },
                ..
            })
        ));

        let mut negative = Transaction::new();
        negative.input_utxo.put("a", "alice", 5);
        negative.output_utxo.put("b", "bob", 10);
        negative.output_utxo.put("c", "alice", -5);
        assert_eq!(
            n.verify_transaction(&negative),
            Err(NodeError::TransactionVerification {
                node: "Node1".to_string(),
                source: TransactionVerificationError::NegativeAmount("c".to_string()),
            })
        );
    }

    #[test]
    fn test_block_with_transfer_is_applied() {
        let mut miner = node("Node1");
        let mut follower = node("Node2");
        let genesis = miner.create_genesis_block().unwrap();
        follower.add_verify_block(&genesis).unwrap();
        sync_wallet(&mut miner);

        let spend = reward_id(&miner);
        let bob = Wallet::new("bob");
        miner.new_block_candidate();
        miner
            .add_verify_transaction(transfer(miner.wallet(), &spend, 2, bob.addr()))
            .unwrap();
        let block = miner.mine().unwrap();

        assert_eq!(block.body.transactions.len(), 2);
        assert_eq!(block.body.coinbase, 999_990);
        assert_eq!(block.header.prev, genesis.header.hash);

        follower.add_verify_block(&block).unwrap();
        for n in [&miner, &follower] {
            assert!(!n.utxo().check_id(&spend));
            assert_eq!(n.utxo().filter_by_address(bob.addr()).sum(), 2);
            assert_eq!(n.coinbase_amount(), 999_990);
            assert_eq!(n.block_chain().len(), 2);
        }
    }

    #[test]
    fn test_verification_is_idempotent() {
        let mut miner = node("Node1");
        let block = miner.create_genesis_block().unwrap();
        let other = node("Node2");

        assert!(other.verify_block(&block).is_ok());
        assert!(other.verify_block(&block).is_ok());
        assert!(other.block_chain().is_empty());
        assert_eq!(other.coinbase_amount(), 1_000_000);
    }

    #[test]
    fn test_rejects_wrong_height_and_replay() {
        let mut miner = node("Node1");
        let block = miner.create_genesis_block().unwrap();

        // Replaying the genesis block on the miner fails the height check
        assert!(matches!(
            miner.add_verify_block(&block),
            Err(NodeError::BlockVerification {
                source: VerificationError::Height { expected: 1, got: 0 },
                ..
            })
        ));
        assert_eq!(miner.block_chain().len(), 1);
    }

    #[test]
    fn test_rejects_tampered_fields() {
        let mut miner = node("Node1");
        let block = miner.create_genesis_block().unwrap();
        let other = node("Node2");

        let mut bad_root = block.clone();
        bad_root.header.root[0] ^= 0x01;
        assert!(matches!(
            other.verify_block(&bad_root),
            Err(NodeError::BlockVerification {
                source: VerificationError::MerkleRoot,
                ..
            })
        ));

        let mut bad_hash = block.clone();
        bad_hash.header.hash[31] ^= 0x01;
        assert!(matches!(
            other.verify_block(&bad_hash),
            Err(NodeError::BlockVerification {
                source: VerificationError::Nonce,
                ..
            })
        ));

        let mut bad_prev = block.clone();
        bad_prev.header.prev = vec![1];
        assert!(other.verify_block(&bad_prev).is_err());

        let mut bad_coinbase = block.clone();
        bad_coinbase.body.coinbase += 1;
        // Coinbase is not part of the hashed header, so the genesis rule catches it
        assert!(matches!(
            other.verify_block(&bad_coinbase),
            Err(NodeError::BlockVerification {
                source: VerificationError::GenesisCoinbase { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_greedy_reward() {
        let mut miner = node("Node1");
        let addr = miner.wallet().addr().to_string();

        // Pays the miner double
        let forged = forge_genesis_reward(&mut miner, |tx, reward_output| {
            tx.update_output_utxo(reward_output, 10, &addr).unwrap();
        });

        assert!(matches!(
            node("Node2").verify_block(&forged),
            Err(NodeError::BlockVerification {
                source: VerificationError::RewardAmount { expected: 5, got: 10 },
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_coinbase_moved_to_other_address() {
        let mut miner = node("Node1");

        // Amounts are untouched, only the owner of the coinbase output changes
        let forged = forge_genesis_reward(&mut miner, |tx, _| {
            tx.update_output_utxo(COINBASE_ADDR, 999_995, "mallory").unwrap();
        });
        assert!(matches!(
            node("Node2").verify_block(&forged),
            Err(NodeError::BlockVerification {
                source: VerificationError::RewardMissingCoinbaseOutput,
                ..
            })
        ));

        let mut miner = node("Node1");
        let forged = forge_genesis_reward(&mut miner, |tx, _| {
            tx.update_input_utxo(COINBASE_ADDR, 1_000_000, "mallory").unwrap();
        });
        assert!(matches!(
            node("Node2").verify_block(&forged),
            Err(NodeError::BlockVerification {
                source: VerificationError::RewardMissingCoinbaseInput,
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_tampered_signature() {
        let (mut miner, follower) = pair();
        let spend = reward_id(&miner);
        let bob = Wallet::new("bob");

        miner.new_block_candidate();
        miner
            .add_verify_transaction(transfer(miner.wallet(), &spend, 2, bob.addr()))
            .unwrap();
        let block = miner.mine().unwrap();
        assert!(follower.verify_block(&block).is_ok());

        // The signature is not hashed into the Merkle root or the header
        let mut forged = block.clone();
        forged.body.transactions[1].signature[0] ^= 0x01;
        assert_eq!(
            follower.verify_block(&forged),
            Err(NodeError::BlockVerification {
                node: "Node2".to_string(),
                source: VerificationError::Signature(1),
            })
        );

        let mut foreign_key = block;
        foreign_key.body.transactions[1].public_key = Wallet::new("mallory").public_key_raw();
        assert!(matches!(
            follower.verify_block(&foreign_key),
            Err(NodeError::BlockVerification {
                source: VerificationError::Signature(1),
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_inflated_transfer() {
        let (mut miner, mut follower) = pair();
        let spend = reward_id(&miner);
        let bob = Wallet::new("bob");
        let mallory = Wallet::new("mallory");

        // Spend the 5 coin reward but pay out a million, signed by anyone
        let inflated = || {
            let mut tx = transfer(miner.wallet(), &spend, 5, bob.addr());
            let output = tx.output_utxo.ids().next().unwrap().to_string();
            tx.update_output_utxo(&output, 1_000_000, bob.addr()).unwrap();
            mallory.sign_transaction(&mut tx);
            assert!(tx.verify_signature());
            tx
        };
        let expected = VerificationError::Balance {
            index: 1,
            source: TransactionError::Unbalanced {
                inputs: 5,
                outputs: 1_000_000,
            },
        };

        // The miner refuses its own block
        let tx = inflated();
        miner.new_block_candidate();
        miner.add_transaction(tx.clone());
        assert_eq!(
            miner.mine(),
            Err(NodeError::BlockVerification {
                node: "Node1".to_string(),
                source: expected.clone(),
            })
        );
        assert_eq!(miner.block_chain().len(), 1);
        assert!(miner.utxo().check_id(&spend));

        // Peers refuse it when it is forced onto a chain
        miner.new_block_candidate();
        miner.add_transaction(tx);
        let forged = miner.mine_unchecked().unwrap();
        assert_eq!(
            follower.add_verify_block(&forged),
            Err(NodeError::BlockVerification {
                node: "Node2".to_string(),
                source: expected,
            })
        );
        assert_eq!(follower.block_chain().len(), 1);
        assert!(follower.utxo().filter_by_address(bob.addr()).is_empty());
    }

    #[test]
    fn test_rejects_negative_output() {
        let (mut miner, follower) = pair();
        let spend = reward_id(&miner);
        let bob = Wallet::new("bob");

        // Sums still match: 5 == 10 - 5
        let mut tx = transfer(miner.wallet(), &spend, 2, bob.addr());
        let outputs: Vec<(String, String)> = tx
            .output_utxo
            .sorted_items()
            .map(|(id, u)| (id.clone(), u.address.clone()))
            .collect();
        for (id, addr) in &outputs {
            let amount = if addr == bob.addr() { 10 } else { -5 };
            tx.update_output_utxo(id, amount, addr).unwrap();
        }
        miner.wallet().sign_transaction(&mut tx);

        miner.new_block_candidate();
        miner.add_transaction(tx);
        let forged = miner.mine_unchecked().unwrap();
        assert!(matches!(
            follower.verify_block(&forged),
            Err(NodeError::BlockVerification {
                source: VerificationError::Balance {
                    index: 1,
                    source: TransactionError::NegativeAmount(_),
                },
                ..
            })
        ));
    }

    #[test]
    fn test_sealing_refuses_coinbase_underflow() {
        let mut miner = node("Node1");
        miner.create_genesis_block().unwrap();

        let mut forged = miner.new_block_candidate().clone();
        forged.body.coinbase = i64::MIN;
        miner.inject_candidate_unchecked(forged);

        assert_eq!(
            miner.mine_unchecked(),
            Err(NodeError::Mining {
                node: "Node1".to_string(),
                source: MiningError::InsufficientCoinbase {
                    available: i64::MIN,
                    reward: 5,
                },
            })
        );
        assert_eq!(miner.block_chain().len(), 1);
        assert!(miner.block_candidate().is_some());
    }

    #[test]
    fn test_mine_unchecked_appends_invalid_block() {
        let mut miner = node("Node1");
        miner.create_genesis_block().unwrap();

        // A candidate claiming a height far in the future
        let mut forged = miner.new_block_candidate().clone();
        forged.header.height = 7;
        miner.inject_candidate_unchecked(forged);

        let block = miner.mine_unchecked().unwrap();
        assert_eq!(block.header.height, 7);
        assert_eq!(miner.block_chain().len(), 2);

        let mut honest = node("Node2");
        assert!(honest.add_verify_block(&block).is_err());
        assert!(honest.block_chain().is_empty());
    }
}
