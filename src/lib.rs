//! Multi-node UTXO ledger emulator
//!
//! In-process nodes each keep their own chain and UTXO set, verify blocks
//! against the consensus rules and take turns mining with proof of work.

pub mod blockchain;
pub mod config;
