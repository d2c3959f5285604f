use thiserror::Error;

use std::collections::HashSet;

use super::crypto::{digest, to_hex, Signer};
use super::transaction::Transaction;
use super::utxo::UtxoList;

/// Errors that can occur while building a transaction from a wallet
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Wallet {wallet}: sending coins to self is not allowed")]
    SelfTransfer { wallet: String },

    #[error("Wallet {wallet}: no amounts to spend given")]
    EmptyRequest { wallet: String },

    #[error("Wallet {wallet}: {inputs} input utxo ids but {amounts} amounts")]
    CountMismatch {
        wallet: String,
        inputs: usize,
        amounts: usize,
    },

    #[error("Wallet {wallet}: out amount #{index} ({amount}) is less than 1")]
    InvalidAmount {
        wallet: String,
        index: usize,
        amount: i64,
    },

    #[error("Wallet {wallet}: input ids have duplicates")]
    DuplicateInputs { wallet: String },

    #[error("Wallet {wallet}: utxo {id}: record not found")]
    UtxoNotFound { wallet: String, id: String },

    #[error("Wallet {wallet}: utxo {id}: not enough coins: required {required}, available {available}")]
    NotEnoughCoins {
        wallet: String,
        id: String,
        required: i64,
        available: i64,
    },

    #[error("Wallet {wallet}: input and output sums are not equal")]
    Unbalanced { wallet: String },
}

/// A named keypair together with its view of spendable outputs
#[derive(Debug, Clone)]
pub struct Wallet {
    name: String,
    signer: Signer,
    addr: String,
    utxo: UtxoList,
}

impl Wallet {
    /// Creates a wallet with a fresh keypair
    ///
    /// The address is the hex digest of the private key material.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_signer(name, Signer::new())
    }

    /// Creates a wallet around an existing keypair
    pub fn from_signer(name: impl Into<String>, signer: Signer) -> Self {
        let addr = to_hex(&digest(&signer.secret_key_raw()));
        Wallet {
            name: name.into(),
            signer,
            addr,
            utxo: UtxoList::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The wallet's cached spendable outputs
    pub fn utxo(&self) -> &UtxoList {
        &self.utxo
    }

    pub fn public_key_raw(&self) -> Vec<u8> {
        self.signer.public_key_raw()
    }

    /// Sum of all cached outputs
    pub fn balance(&self) -> i64 {
        self.utxo.sum()
    }

    /// Builds and signs a transfer to `to_addr`
    ///
    /// Every listed input is spent whole: `amounts[i]` goes to `to_addr` and
    /// whatever remains of input `i` comes back to this wallet as change.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - Ids of the wallet's outputs to spend
    /// * `amounts` - Amount to send out of each input
    /// * `to_addr` - The recipient's address
    ///
    /// # Returns
    ///
    /// The signed transaction
    pub fn new_transaction(
        &self,
        input_ids: &[String],
        amounts: &[i64],
        to_addr: &str,
    ) -> Result<Transaction, WalletError> {
        if to_addr == self.addr {
            return Err(WalletError::SelfTransfer {
                wallet: self.name.clone(),
            });
        }
        if input_ids.len() != amounts.len() {
            return Err(WalletError::CountMismatch {
                wallet: self.name.clone(),
                inputs: input_ids.len(),
                amounts: amounts.len(),
            });
        }
        if input_ids.is_empty() {
            return Err(WalletError::EmptyRequest {
                wallet: self.name.clone(),
            });
        }
        if let Some((index, &amount)) = amounts.iter().enumerate().find(|(_, &a)| a < 1) {
            return Err(WalletError::InvalidAmount {
                wallet: self.name.clone(),
                index,
                amount,
            });
        }
        let mut seen = HashSet::new();
        if !input_ids.iter().all(|id| seen.insert(id)) {
            return Err(WalletError::DuplicateInputs {
                wallet: self.name.clone(),
            });
        }

        let mut input_utxo = UtxoList::new();
        let mut output_utxo = UtxoList::new();

        for (id, &amount) in input_ids.iter().zip(amounts) {
            let utxo = self.utxo.get(id).ok_or_else(|| WalletError::UtxoNotFound {
                wallet: self.name.clone(),
                id: id.clone(),
            })?;
            if utxo.amount < amount {
                return Err(WalletError::NotEnoughCoins {
                    wallet: self.name.clone(),
                    id: id.clone(),
                    required: amount,
                    available: utxo.amount,
                });
            }

            input_utxo.put(id.clone(), utxo.address.clone(), utxo.amount);
            output_utxo.new_record(to_addr, amount);
            let change = utxo.amount - amount;
            if change > 0 {
                output_utxo.new_record(self.addr.clone(), change);
            }
        }

        let mut transaction = Transaction::with_utxo(input_utxo, output_utxo);
        if transaction.verify_balance().is_err() {
            return Err(WalletError::Unbalanced {
                wallet: self.name.clone(),
            });
        }
        self.sign_transaction(&mut transaction);
        Ok(transaction)
    }

    /// Signs a transaction with this wallet's key
    pub fn sign_transaction(&self, transaction: &mut Transaction) {
        transaction.sign(&self.signer);
    }

    pub fn add_utxo(&mut self, id: impl Into<String>, addr: impl Into<String>, amount: i64) {
        self.utxo.put(id, addr, amount);
    }

    pub fn remove_utxo(&mut self, id: &str) {
        self.utxo.remove(id);
    }
}
