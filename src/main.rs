use anyhow::{bail, Context};
use clap::Parser;
use log::{info, warn};
use serde::Serialize;

use ledger_emulator::blockchain::view::{
    transaction_summaries, BlockSummary, NodeSummary, SettingsSummary, TransactionSummary,
    WalletSummary,
};
use ledger_emulator::blockchain::{BlockRef, LedgerManager};
use ledger_emulator::config::Settings;

/// Runs a multi-node ledger simulation and prints the resulting state
#[derive(Parser, Debug)]
#[command(name = "ledger_emulator", version, about)]
struct Cli {
    /// Number of nodes
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Number of user wallets
    #[arg(short, long, default_value_t = 1)]
    wallets: usize,

    /// Number of ticks to run
    #[arg(short, long, default_value_t = 3)]
    ticks: u64,

    /// After the first tick, send this amount from the genesis miner to User1
    #[arg(long)]
    transfer: Option<i64>,

    /// After the last tick, forge a block on the main node and show that the
    /// network rejects it
    #[arg(long)]
    tamper: bool,

    /// Print the final state as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Snapshot {
    settings: SettingsSummary,
    ticks: u64,
    nodes: Vec<NodeSummary>,
    wallets: Vec<WalletSummary>,
    chain: Vec<BlockSummary>,
    last_block_transactions: Vec<TransactionSummary>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();
    if cli.nodes == 0 {
        bail!("at least one node is required");
    }

    let settings = Settings::from_env().context("failed to load settings")?;
    let mut manager = LedgerManager::new(settings);
    for i in 1..=cli.nodes {
        manager.create_node(&format!("Node{}", i));
    }
    let users: Vec<String> = (1..=cli.wallets)
        .map(|i| manager.create_wallet(&format!("User{}", i)))
        .collect();

    for tick in 1..=cli.ticks {
        let report = manager.tick().with_context(|| format!("tick {} failed", tick))?;

        if tick == 1 {
            if let (Some(amount), Some(to)) = (cli.transfer, users.first()) {
                transfer_from_miner(&mut manager, &report.miner, amount, to)?;
            }
        }
    }

    if cli.tamper {
        tamper(&mut manager)?;
    }

    let snapshot = snapshot(&manager)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

fn transfer_from_miner(
    manager: &mut LedgerManager,
    miner: &str,
    amount: i64,
    to: &str,
) -> anyhow::Result<()> {
    let miner_id = manager
        .node_summaries()
        .into_iter()
        .find(|n| n.name == miner)
        .map(|n| n.id)
        .context("genesis miner not found")?;
    let from = manager.node(&miner_id)?.wallet().addr().to_string();

    let utxo = manager
        .wallet_utxos(&from)?
        .into_iter()
        .next()
        .context("genesis miner has no outputs to spend")?;

    info!("Sending {} from {} to {}", amount, miner, to);
    manager
        .submit_transaction(&from, &[utxo.id], &[amount], to)
        .context("transfer rejected")?;
    Ok(())
}

fn tamper(manager: &mut LedgerManager) -> anyhow::Result<()> {
    let mut forged = manager.steal_candidate()?;
    forged.header.height += 100;
    manager.inject_candidate_unchecked(forged)?;
    let block = manager.mine_unchecked()?;

    let outcome = manager.consensus_check(&block);
    warn!(
        "Forged block {}: consensus {} with {} of {} rejections",
        block.header.height,
        if outcome.passed { "passed" } else { "failed" },
        outcome.errors.len(),
        outcome.nodes
    );

    let report = manager.broadcast_block(&block)?;
    for err in &report.rejected {
        warn!("{}", err);
    }
    Ok(())
}

fn snapshot(manager: &LedgerManager) -> anyhow::Result<Snapshot> {
    let mut chain = Vec::new();
    let mut last_block_transactions = Vec::new();

    // Show the chain held by the first node
    if let Some(id) = manager.node_ids().first() {
        let node = manager.node(id)?;
        chain = node.block_chain().iter().map(BlockSummary::from).collect();
        if let Some(height) = node.block_chain().len().checked_sub(1) {
            let block = manager.node_block(id, BlockRef::Height(height as u64))?;
            last_block_transactions = transaction_summaries(block);
        }
    }

    Ok(Snapshot {
        settings: SettingsSummary::from(manager.settings()),
        ticks: manager.tick_count(),
        nodes: manager.node_summaries(),
        wallets: manager.wallet_summaries(),
        chain,
        last_block_transactions,
    })
}

fn print_snapshot(snapshot: &Snapshot) {
    println!(
        "Ticks: {}  reward: {}  difficulty: {}",
        snapshot.ticks, snapshot.settings.reward, snapshot.settings.mine_difficulty
    );

    println!("\nNodes:");
    for n in &snapshot.nodes {
        println!(
            "  {:<8} {}  coinbase {:>9}  utxo {:>3}  blocks {:>3}{}",
            n.name,
            n.id,
            n.coinbase,
            n.utxo_count,
            n.chain_length,
            if n.miner { "  [main]" } else { "" }
        );
    }

    println!("\nWallets:");
    for w in &snapshot.wallets {
        println!("  {:<8} {}  balance {}", w.name, w.addr, w.balance);
    }

    println!("\nChain:");
    for b in &snapshot.chain {
        println!(
            "  #{:<4} {}  nonce {:<6} txs {}  coinbase {}",
            b.height, b.hash, b.nonce, b.transactions, b.coinbase
        );
    }
}
