use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use std::collections::btree_map;
use std::collections::BTreeMap;

/// Errors that can occur during UTXO operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("Utxo id {0}: record not found")]
    NotFound(String),

    #[error("Utxo id {id}: not enough amount: required {required}, available {available}")]
    InsufficientAmount {
        id: String,
        required: i64,
        available: i64,
    },
}

/// Generates a new globally unique id for UTXO records and nodes
pub fn new_unique_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// An unspent output: an amount owned by an address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    /// The owner's address
    pub address: String,

    /// The amount held by this output
    pub amount: i64,
}

impl Utxo {
    pub fn new(address: impl Into<String>, amount: i64) -> Self {
        Utxo {
            address: address.into(),
            amount,
        }
    }
}

/// A set of UTXO records keyed by id
///
/// Records are kept ordered by id, so iteration and [`UtxoList::bytes`]
/// never depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoList {
    records: BTreeMap<String, Utxo>,
}

impl UtxoList {
    /// Creates an empty list
    pub fn new() -> Self {
        UtxoList {
            records: BTreeMap::new(),
        }
    }

    /// Inserts or replaces a record under an explicit id
    ///
    /// # Arguments
    ///
    /// * `id` - The record id
    /// * `addr` - The owner's address
    /// * `amount` - The amount
    pub fn put(&mut self, id: impl Into<String>, addr: impl Into<String>, amount: i64) {
        self.records.insert(id.into(), Utxo::new(addr, amount));
    }

    /// Creates a new record under a generated id
    ///
    /// # Arguments
    ///
    /// * `addr` - The owner's address
    /// * `amount` - The amount
    ///
    /// # Returns
    ///
    /// The id of the new record
    pub fn new_record(&mut self, addr: impl Into<String>, amount: i64) -> String {
        let id = new_unique_id();
        self.records.insert(id.clone(), Utxo::new(addr, amount));
        id
    }

    /// Gets a record by id
    pub fn get(&self, id: &str) -> Option<&Utxo> {
        self.records.get(id)
    }

    /// Gets a record by id, failing with a "not found" error
    pub fn try_get(&self, id: &str) -> Result<&Utxo, UtxoError> {
        self.records
            .get(id)
            .ok_or_else(|| UtxoError::NotFound(id.to_string()))
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Utxo> {
        self.records.get_mut(id)
    }

    /// Checks whether a record with the given id exists
    pub fn check_id(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Removes a record, returning it if it existed
    pub fn remove(&mut self, id: &str) -> Option<Utxo> {
        self.records.remove(id)
    }

    /// Removes every record whose id appears in `other`
    pub fn remove_records(&mut self, other: &UtxoList) {
        for id in other.records.keys() {
            self.records.remove(id);
        }
    }

    /// Removes every listed id
    pub fn remove_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) {
        for id in ids {
            self.records.remove(id);
        }
    }

    /// Merges `other` into this list; records with the same id are replaced
    pub fn add_records(&mut self, other: &UtxoList) {
        for (id, utxo) in &other.records {
            self.records.insert(id.clone(), utxo.clone());
        }
    }

    /// Sum of all amounts, saturating at the `i64` bounds
    pub fn sum(&self) -> i64 {
        self.records
            .values()
            .fold(0i64, |acc, u| acc.saturating_add(u.amount))
    }

    /// Sum of all amounts, or `None` if it does not fit in an `i64`
    pub fn checked_sum(&self) -> Option<i64> {
        self.records
            .values()
            .try_fold(0i64, |acc, u| acc.checked_add(u.amount))
    }

    /// Id of the first record (in id order) holding a negative amount
    pub fn find_negative(&self) -> Option<&str> {
        self.records
            .iter()
            .find(|(_, u)| u.amount < 0)
            .map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Checks if this list contains every record of `other`
    ///
    /// Both the id and the record value (address and amount) must match.
    pub fn contains(&self, other: &UtxoList) -> bool {
        if self.records.len() < other.records.len() {
            return false;
        }

        other
            .records
            .iter()
            .all(|(id, utxo)| self.records.get(id) == Some(utxo))
    }

    /// Records owned by the given address
    pub fn filter_by_address(&self, addr: &str) -> UtxoList {
        self.filter(|_, utxo| utxo.address == addr)
    }

    /// Records holding exactly the given amount
    pub fn filter_by_amount(&self, amount: i64) -> UtxoList {
        self.filter(|_, utxo| utxo.amount == amount)
    }

    /// Records for which `f` returns true
    pub fn filter<F>(&self, f: F) -> UtxoList
    where
        F: Fn(&str, &Utxo) -> bool,
    {
        UtxoList {
            records: self
                .records
                .iter()
                .filter(|(id, utxo)| f(id, utxo))
                .map(|(id, utxo)| (id.clone(), utxo.clone()))
                .collect(),
        }
    }

    /// Checks that the record exists and holds at least `amount`
    pub fn validate_amount(&self, id: &str, amount: i64) -> Result<(), UtxoError> {
        let utxo = self.try_get(id)?;
        if utxo.amount < amount {
            return Err(UtxoError::InsufficientAmount {
                id: id.to_string(),
                required: amount,
                available: utxo.amount,
            });
        }
        Ok(())
    }

    /// Iterates over records in ascending id order
    pub fn sorted_items(&self) -> btree_map::Iter<'_, String, Utxo> {
        self.records.iter()
    }

    /// Ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Deterministic byte representation
    ///
    /// For every record in ascending id order: the address bytes followed by
    /// the amount as a big-endian 64-bit integer. Ids are not included.
    pub fn bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for utxo in self.records.values() {
            buf.extend_from_slice(utxo.address.as_bytes());
            buf.extend_from_slice(&utxo.amount.to_be_bytes());
        }
        buf
    }
}

impl<'a> IntoIterator for &'a UtxoList {
    type Item = (&'a String, &'a Utxo);
    type IntoIter = btree_map::Iter<'a, String, Utxo>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<(String, Utxo)> for UtxoList {
    fn from_iter<T: IntoIterator<Item = (String, Utxo)>>(iter: T) -> Self {
        UtxoList {
            records: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> UtxoList {
        let mut list = UtxoList::new();
        list.put("a", "alice", 10);
        list.put("b", "bob", 20);
        list.put("c", "alice", 30);
        list
    }

    #[test]
    fn test_new_record_ids_are_unique() {
        let mut list = UtxoList::new();
        let first = list.new_record("alice", 1);
        let second = list.new_record("alice", 1);

        assert_ne!(first, second);
        assert_eq!(list.len(), 2);
        assert_eq!(list.sum(), 2);
    }

    #[test]
    fn test_missing_id_is_not_found() {
        let list = sample();
        assert!(list.get("zzz").is_none());
        assert_eq!(list.try_get("zzz"), Err(UtxoError::NotFound("zzz".to_string())));
        assert!(list.validate_amount("zzz", 1).is_err());
    }

    #[test]
    fn test_validate_amount() {
        let list = sample();
        assert!(list.validate_amount("b", 20).is_ok());
        assert_eq!(
            list.validate_amount("b", 21),
            Err(UtxoError::InsufficientAmount {
                id: "b".to_string(),
                required: 21,
                available: 20
            })
        );
    }

    #[test]
    fn test_filters() {
        let list = sample();

        let alice = list.filter_by_address("alice");
        assert_eq!(alice.len(), 2);
        assert_eq!(alice.sum(), 40);

        let twenty = list.filter_by_amount(20);
        assert_eq!(twenty.ids().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_contains() {
        let list = sample();

        let mut subset = UtxoList::new();
        subset.put("a", "alice", 10);
        assert!(list.contains(&subset));
        assert!(list.contains(&UtxoList::new()));

        // Same id, different amount
        subset.put("a", "alice", 11);
        assert!(!list.contains(&subset));

        // Same id, different owner
        let mut forged = UtxoList::new();
        forged.put("b", "mallory", 20);
        assert!(!list.contains(&forged));

        assert!(!UtxoList::new().contains(&list));
    }

    #[test]
    fn test_add_and_remove_records() {
        let mut list = sample();

        let mut spent = UtxoList::new();
        spent.put("a", "alice", 10);
        list.remove_records(&spent);
        assert!(!list.check_id("a"));

        let mut created = UtxoList::new();
        created.put("d", "dave", 5);
        list.add_records(&created);
        assert_eq!(list.get("d"), Some(&Utxo::new("dave", 5)));

        list.remove_all(["b", "c"]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.remove("d"), Some(Utxo::new("dave", 5)));
        assert!(list.is_empty());
    }

    #[test]
    fn test_sum_overflow() {
        let mut list = UtxoList::new();
        list.put("a", "alice", i64::MAX);
        list.put("b", "bob", 1);

        assert_eq!(list.checked_sum(), None);
        assert_eq!(list.sum(), i64::MAX);

        list.put("b", "bob", -1);
        assert_eq!(list.checked_sum(), Some(i64::MAX - 1));
        assert_eq!(list.find_negative(), Some("b"));
        assert_eq!(sample().find_negative(), None);
    }

    #[test]
    fn test_bytes_layout() {
        let mut list = UtxoList::new();
        list.put("2", "b", 2);
        list.put("1", "a", 1);

        let mut expected = Vec::new();
        expected.extend_from_slice(b"a");
        expected.extend_from_slice(&1i64.to_be_bytes());
        expected.extend_from_slice(b"b");
        expected.extend_from_slice(&2i64.to_be_bytes());

        assert_eq!(list.bytes(), expected);
    }

    proptest! {
        #[test]
        fn prop_bytes_ignore_insertion_order(
            entries in prop::collection::btree_map("[a-z0-9]{1,12}", ("[a-z]{1,8}", 0i64..1_000_000), 0..20)
        ) {
            let mut forward = UtxoList::new();
            for (id, (addr, amount)) in entries.iter() {
                forward.put(id.clone(), addr.clone(), *amount);
            }

            let mut backward = UtxoList::new();
            for (id, (addr, amount)) in entries.iter().rev() {
                backward.put(id.clone(), addr.clone(), *amount);
            }

            prop_assert_eq!(forward.bytes(), backward.bytes());
            prop_assert_eq!(forward.sum(), entries.values().map(|(_, a)| *a).sum::<i64>());
            prop_assert_eq!(forward.checked_sum(), Some(forward.sum()));
        }
    }
}
