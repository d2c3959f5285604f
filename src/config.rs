// Configuration module
//
// Engine settings are built once at startup and then shared read-only
// (behind an `Arc`) by every node and by the mining code.

use std::collections::HashMap;
use std::str::FromStr;

use primitive_types::U512;
use thiserror::Error;

/// Id and address of the coinbase pseudo-UTXO every node carries
pub const COINBASE_ADDR: &str = "coinbase";

/// The single byte stored as `prev` in the genesis block header
pub const GENESIS_BLOCK_PREV: u8 = 0x00;

pub const DEFAULT_COINBASE_START_AMOUNT: i64 = 1_000_000;
pub const DEFAULT_REWARD_AMOUNT: i64 = 5;
pub const DEFAULT_MINE_DIFF: u64 = 20;
pub const DEFAULT_NONCE_MAX: u64 = 2_147_483_647;

pub const ENV_COINBASE_START_AMOUNT: &str = "COINBASE_START_AMOUNT";
pub const ENV_REWARD_AMOUNT: &str = "REWARD_AMOUNT";
pub const ENV_MINE_BASE: &str = "MINE_BASE";
pub const ENV_MINE_DIFF: &str = "MINE_DIFF";
pub const ENV_NONCE_MAX: &str = "NONCE_MAX";

/// Errors that can occur while loading settings
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Every problem found while loading, reported together
    #[error("Invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Immutable engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Coinbase balance every node starts with
    pub coinbase_start: i64,

    /// Amount paid to the miner of every block
    pub reward: i64,

    /// Numerator of the mining target (2^256 by default)
    pub mine_base: U512,

    /// Denominator of the mining target
    pub mine_difficulty: U512,

    /// Upper bound (exclusive) of the nonce search
    pub nonce_max: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            coinbase_start: DEFAULT_COINBASE_START_AMOUNT,
            reward: DEFAULT_REWARD_AMOUNT,
            mine_base: U512::from(2u64).pow(U512::from(256u64)),
            mine_difficulty: U512::from(DEFAULT_MINE_DIFF),
            nonce_max: DEFAULT_NONCE_MAX,
        }
    }
}

impl Settings {
    /// Loads settings from the process environment
    ///
    /// Unset or empty variables keep their default value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Loads settings from an arbitrary set of `(name, value)` pairs
    ///
    /// # Arguments
    ///
    /// * `vars` - The variables to read from
    ///
    /// # Returns
    ///
    /// The settings, or every invalid value collected into one error
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut settings = Settings::default();
        let mut errors = Vec::new();

        if let Some(v) = parse_var::<i64>(&vars, ENV_COINBASE_START_AMOUNT, &mut errors) {
            if v < 0 {
                errors.push(format!("{} must not be negative", ENV_COINBASE_START_AMOUNT));
            } else {
                settings.coinbase_start = v;
            }
        }

        if let Some(v) = parse_var::<i64>(&vars, ENV_REWARD_AMOUNT, &mut errors) {
            if v < 1 {
                errors.push(format!("{} must be at least 1", ENV_REWARD_AMOUNT));
            } else {
                settings.reward = v;
            }
        }

        if let Some(v) = parse_big(&vars, ENV_MINE_BASE, &mut errors) {
            if v.is_zero() {
                errors.push(format!("{} must not be zero", ENV_MINE_BASE));
            } else {
                settings.mine_base = v;
            }
        }

        if let Some(v) = parse_big(&vars, ENV_MINE_DIFF, &mut errors) {
            if v.is_zero() {
                errors.push(format!("{} must not be zero", ENV_MINE_DIFF));
            } else {
                settings.mine_difficulty = v;
            }
        }

        if let Some(v) = parse_var::<u64>(&vars, ENV_NONCE_MAX, &mut errors) {
            settings.nonce_max = v;
        }

        if errors.is_empty() {
            Ok(settings)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Returns a copy with a different difficulty
    pub fn with_difficulty(mut self, difficulty: u64) -> Self {
        self.mine_difficulty = U512::from(difficulty);
        self
    }

    /// Returns a copy with a different nonce bound
    pub fn with_nonce_max(mut self, nonce_max: u64) -> Self {
        self.nonce_max = nonce_max;
        self
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    errors: &mut Vec<String>,
) -> Option<T> {
    let raw = vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(format!("Failed to parse {} env variable: {:?}", key, raw));
            None
        }
    }
}

fn parse_big(vars: &HashMap<String, String>, key: &str, errors: &mut Vec<String>) -> Option<U512> {
    let raw = vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())?;
    match U512::from_dec_str(raw) {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(format!("Failed to parse {} env variable: {:?}", key, raw));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.coinbase_start, 1_000_000);
        assert_eq!(settings.reward, 5);
        assert_eq!(settings.mine_difficulty, U512::from(20u64));
        assert_eq!(
            settings.mine_base,
            U512::from_dec_str(
                "115792089237316195423570985008687907853269984665640564039457584007913129639936"
            )
            .unwrap()
        );
    }

    #[test]
    fn test_from_vars_overrides() {
        let settings = Settings::from_vars(vec![
            (ENV_COINBASE_START_AMOUNT, "500"),
            (ENV_REWARD_AMOUNT, "7"),
            (ENV_MINE_DIFF, "3"),
            (ENV_NONCE_MAX, "1000"),
        ])
        .unwrap();

        assert_eq!(settings.coinbase_start, 500);
        assert_eq!(settings.reward, 7);
        assert_eq!(settings.mine_difficulty, U512::from(3u64));
        assert_eq!(settings.nonce_max, 1000);
    }

    #[test]
    fn test_empty_values_keep_defaults() {
        let settings = Settings::from_vars(vec![(ENV_REWARD_AMOUNT, ""), ("UNRELATED", "x")]).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_errors_are_aggregated() {
        let err = Settings::from_vars(vec![
            (ENV_COINBASE_START_AMOUNT, "lots"),
            (ENV_REWARD_AMOUNT, "0"),
            (ENV_MINE_DIFF, "0"),
            (ENV_NONCE_MAX, "-1"),
        ])
        .unwrap_err();

        let ConfigError::Invalid(errors) = err;
        assert_eq!(errors.len(), 4);
        assert!(errors[0].contains(ENV_COINBASE_START_AMOUNT));
        assert!(errors[1].contains(ENV_REWARD_AMOUNT));
        assert!(errors[2].contains(ENV_MINE_DIFF));
        assert!(errors[3].contains(ENV_NONCE_MAX));
    }
}
