use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;

/// Length in bytes of every digest produced by [`digest`]
pub const HASH_LEN: usize = 32;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Computes the SHA-256 digest of the input
pub fn digest(input: &[u8]) -> Vec<u8> {
    Sha256::digest(input).to_vec()
}

/// Hex encoding used for every byte string shown outside the engine
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decodes a hex string produced by [`to_hex`]
pub fn from_hex(s: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(s).map_err(|e| CryptoError::DecodingError(e.to_string()))
}

/// An Ed25519 keypair used to sign transactions
#[derive(Clone)]
pub struct Signer {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &to_hex(self.verifying_key.as_bytes()))
            .finish()
    }
}

impl Default for Signer {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer {
    /// Creates a signer with a freshly generated keypair
    pub fn new() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();

        Signer {
            signing_key,
            verifying_key,
        }
    }

    /// Restores a signer from raw secret key bytes
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        let signing_key = SigningKey::from_bytes(&bytes_array);
        let verifying_key = signing_key.verifying_key();

        Ok(Signer {
            signing_key,
            verifying_key,
        })
    }

    /// Signs a message with the private key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Checks a signature made by this signer
    pub fn check(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(signature) => self.verifying_key.verify(message, &signature).is_ok(),
            Err(_) => false,
        }
    }

    /// Raw encoding of the public key, as carried by transactions
    pub fn public_key_raw(&self) -> Vec<u8> {
        self.verifying_key.to_bytes().to_vec()
    }

    /// Raw secret key material
    pub fn secret_key_raw(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

/// Rebuilds a public key from its raw encoding
pub fn public_key_from_raw(raw: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey("Invalid pub key length".to_string()))?;

    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Verifies a signature against a message and a raw public key
///
/// Malformed keys or signatures never verify.
pub fn check_signature(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let public_key = match public_key_from_raw(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let signature = match Signature::from_slice(signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };

    public_key.verify(message, &signature).is_ok()
}
