use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{check_signature, to_hex, Signer};
use super::utxo::UtxoList;
use crate::config::COINBASE_ADDR;

/// Errors that can occur during transaction operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Input utxo with id [{0}] not found")]
    InputNotFound(String),

    #[error("Output utxo with id [{0}] not found")]
    OutputNotFound(String),

    #[error("Input and output sums are not equal: inputs {inputs}, outputs {outputs}")]
    Unbalanced { inputs: i64, outputs: i64 },

    #[error("Utxo with id [{0}] holds a negative amount")]
    NegativeAmount(String),
}

/// A transfer of value from a set of spent outputs to a set of new outputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Outputs consumed by this transaction
    pub input_utxo: UtxoList,

    /// Outputs created by this transaction
    pub output_utxo: UtxoList,

    /// Signature over [`Transaction::bytes`]
    pub signature: Vec<u8>,

    /// Raw public key of the signer
    pub public_key: Vec<u8>,
}

impl Transaction {
    /// Creates an empty, unsigned transaction
    pub fn new() -> Self {
        Transaction::default()
    }

    /// Creates an unsigned transaction from its inputs and outputs
    pub fn with_utxo(input_utxo: UtxoList, output_utxo: UtxoList) -> Self {
        Transaction {
            input_utxo,
            output_utxo,
            signature: Vec::new(),
            public_key: Vec::new(),
        }
    }

    /// Inputs and outputs belonging to `addr`, as `(inputs, outputs)`
    pub fn filter_by_wallet(&self, addr: &str) -> (UtxoList, UtxoList) {
        (
            self.input_utxo.filter_by_address(addr),
            self.output_utxo.filter_by_address(addr),
        )
    }

    /// Looks like the reward transaction of a mined block
    ///
    /// One coinbase input, two outputs and no signature.
    pub fn is_reward(&self) -> bool {
        self.input_utxo.len() == 1
            && self.input_utxo.check_id(COINBASE_ADDR)
            && self.output_utxo.len() == 2
            && self.signature.is_empty()
            && self.public_key.is_empty()
    }

    /// Checks that inputs and outputs sum to the same amount
    ///
    /// Reward transactions follow their own accounting rule and are skipped.
    pub fn verify_own_balance(&self) -> Result<(), TransactionError> {
        if self.is_reward() {
            return Ok(());
        }
        self.verify_balance()
    }

    /// Checks that no amount is negative and that inputs and outputs sum to
    /// the same amount, whatever the shape of the transaction
    ///
    /// A sum that overflows `i64` counts as unbalanced.
    pub fn verify_balance(&self) -> Result<(), TransactionError> {
        if let Some(id) = self
            .input_utxo
            .find_negative()
            .or_else(|| self.output_utxo.find_negative())
        {
            return Err(TransactionError::NegativeAmount(id.to_string()));
        }

        match (self.input_utxo.checked_sum(), self.output_utxo.checked_sum()) {
            (Some(inputs), Some(outputs)) if inputs == outputs => Ok(()),
            _ => Err(TransactionError::Unbalanced {
                inputs: self.input_utxo.sum(),
                outputs: self.output_utxo.sum(),
            }),
        }
    }

    /// Signs the transaction and records the signer's public key
    pub fn sign(&mut self, signer: &Signer) {
        self.signature = signer.sign(&self.bytes());
        self.public_key = signer.public_key_raw();
    }

    /// Verifies the stored signature against the stored public key
    pub fn verify_signature(&self) -> bool {
        check_signature(&self.bytes(), &self.signature, &self.public_key)
    }

    /// Canonical bytes: input list bytes followed by output list bytes
    pub fn bytes(&self) -> Vec<u8> {
        let mut buf = self.input_utxo.bytes();
        buf.extend_from_slice(&self.output_utxo.bytes());
        buf
    }

    pub fn signature_hex(&self) -> String {
        to_hex(&self.signature)
    }

    pub fn public_key_hex(&self) -> String {
        to_hex(&self.public_key)
    }

    // Raw mutators below do not re-sign or re-check anything.

    /// Overwrites signature and public key
    pub fn set_signature(&mut self, signature: Vec<u8>, public_key: Vec<u8>) {
        self.signature = signature;
        self.public_key = public_key;
    }

    /// Rewrites an existing input record
    pub fn update_input_utxo(&mut self, id: &str, amount: i64, addr: &str) -> Result<(), TransactionError> {
        let utxo = self
            .input_utxo
            .get_mut(id)
            .ok_or_else(|| TransactionError::InputNotFound(id.to_string()))?;
        utxo.amount = amount;
        utxo.address = addr.to_string();
        Ok(())
    }

    /// Rewrites an existing output record
    pub fn update_output_utxo(&mut self, id: &str, amount: i64, addr: &str) -> Result<(), TransactionError> {
        let utxo = self
            .output_utxo
            .get_mut(id)
            .ok_or_else(|| TransactionError::OutputNotFound(id.to_string()))?;
        utxo.amount = amount;
        utxo.address = addr.to_string();
        Ok(())
    }

    pub fn delete_input_utxo(&mut self, id: &str) -> Result<(), TransactionError> {
        self.input_utxo
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TransactionError::InputNotFound(id.to_string()))
    }

    pub fn delete_output_utxo(&mut self, id: &str) -> Result<(), TransactionError> {
        self.output_utxo
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TransactionError::OutputNotFound(id.to_string()))
    }
}
