//! Compiled filter conditions.
//!
//! [`FilterCondition::from_filters`] turns the filter definitions of a fetch
//! into a tree evaluated against each cache entry. `test` returns a bitmask:
//! zero means the entry is filtered out, otherwise the bits identify the
//! matching filters and are reported to the consumer.

use bytes::Bytes;
use streamgate_core::filter::{Condition, Filter, ValueMatch};
use streamgate_core::offset::Evaluation;

use crate::entry::Entry;

/// CRC32C hash of a key; null keys hash to zero.
pub fn compute_hash(key: Option<&Bytes>) -> u32 {
    key.map_or(0, |key| crc32c::crc32c(key))
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterCondition {
    /// Matches every entry
    None,
    Key { hash: u32, key: Option<Bytes> },
    Header { name: Bytes, value: Option<Bytes> },
    Not(Box<FilterCondition>),
    Headers { name: Bytes, matches: Vec<ValueMatch> },
    And(Vec<FilterCondition>),
    /// First matching filter wins
    LazyOr(Vec<FilterCondition>),
    /// Every matching filter contributes its bit
    EagerOr(Vec<FilterCondition>),
}

impl FilterCondition {
    pub fn from_filters(filters: &[Filter], evaluation: Evaluation) -> Self {
        match filters {
            [] => FilterCondition::None,
            [filter] => Self::from_filter(filter),
            filters => {
                let conditions = filters.iter().map(Self::from_filter).collect();
                match evaluation {
                    Evaluation::Eager => FilterCondition::EagerOr(conditions),
                    Evaluation::Lazy => FilterCondition::LazyOr(conditions),
                }
            }
        }
    }

    fn from_filter(filter: &Filter) -> Self {
        match filter.conditions.as_slice() {
            [] => FilterCondition::None,
            [condition] => Self::from_condition(condition),
            conditions => FilterCondition::And(conditions.iter().map(Self::from_condition).collect()),
        }
    }

    fn from_condition(condition: &Condition) -> Self {
        match condition {
            Condition::Key(key) => FilterCondition::Key {
                hash: compute_hash(key.as_ref()),
                key: key.clone(),
            },
            Condition::Header { name, value } => FilterCondition::Header {
                name: name.clone(),
                value: value.clone(),
            },
            Condition::Not(inner) => match inner.as_ref() {
                Condition::Not(twice) => Self::from_condition(twice),
                inner => FilterCondition::Not(Box::new(Self::from_condition(inner))),
            },
            Condition::Headers { name, matches } => FilterCondition::Headers {
                name: name.clone(),
                matches: matches.clone(),
            },
        }
    }

    pub fn test(&self, entry: &Entry) -> u64 {
        match self {
            FilterCondition::None => 1,
            FilterCondition::Key { hash, key } => {
                u64::from(entry.key_hash == *hash && entry.key == *key)
            }
            FilterCondition::Header { name, value } => u64::from(
                entry
                    .headers
                    .iter()
                    .any(|header| header.name == *name && header.value == *value),
            ),
            FilterCondition::Not(inner) => u64::from(inner.test(entry) == 0),
            FilterCondition::Headers { name, matches } => u64::from(headers_match(entry, name, matches)),
            FilterCondition::And(conditions) => {
                u64::from(conditions.iter().all(|condition| condition.test(entry) != 0))
            }
            FilterCondition::LazyOr(conditions) => conditions
                .iter()
                .enumerate()
                .find(|(_, condition)| condition.test(entry) != 0)
                .map_or(0, |(index, _)| 1 << index),
            FilterCondition::EagerOr(conditions) => conditions
                .iter()
                .enumerate()
                .filter(|(_, condition)| condition.test(entry) != 0)
                .fold(0, |mask, (index, _)| mask | 1 << index),
        }
    }
}

fn headers_match(entry: &Entry, name: &Bytes, matches: &[ValueMatch]) -> bool {
    let mut remaining = matches.iter();
    let mut skip_many = false;

    for header in entry.headers.iter().filter(|header| header.name == *name) {
        match remaining.next() {
            Some(ValueMatch::Value(expected)) => {
                if header.value.as_ref() != Some(expected) {
                    return false;
                }
            }
            Some(ValueMatch::Skip) => {}
            Some(ValueMatch::SkipMany) => skip_many = true,
            None if skip_many => {}
            None => return false,
        }
    }

    // a trailing SkipMany also matches zero further headers
    remaining.all(|value_match| *value_match == ValueMatch::SkipMany)
}
