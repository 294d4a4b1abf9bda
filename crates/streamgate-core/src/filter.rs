//! Filter definitions carried by fetch BEGIN and FLUSH extensions.
//!
//! A fetch lists zero or more [`Filter`]s. An entry is delivered when any
//! filter matches; a filter matches when all of its conditions match.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Match the record key; `None` matches records without a key.
    Key(Option<Bytes>),
    /// Match when any header has this name and value.
    Header { name: Bytes, value: Option<Bytes> },
    Not(Box<Condition>),
    /// Match the ordered values of every header with this name.
    Headers { name: Bytes, matches: Vec<ValueMatch> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueMatch {
    Value(Bytes),
    /// Any single value.
    Skip,
    /// Any number of values, including none.
    SkipMany,
}
