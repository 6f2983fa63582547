//! Subscription filters (NIP-01 `REQ` payloads).
//!
//! A [`Filter`] compares and hashes by value. Every list-valued field is kept
//! as an ordered set, so two filters built from the same values in a different
//! order, or with duplicates, are equal. Unsubscribe-by-filter depends on this.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors raised while building a filter from untrusted input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid tag query key: {0} (expected '#' followed by a single letter)")]
    InvalidTagKey(String),
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawFilter")]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<u16>>,

    /// Events since timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries keyed by `#<letter>` (e.g. `#e`, `#p`).
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Deserialize)]
struct RawFilter {
    ids: Option<BTreeSet<String>>,
    authors: Option<BTreeSet<String>>,
    kinds: Option<BTreeSet<u16>>,
    since: Option<u64>,
    until: Option<u64>,
    limit: Option<u64>,
    #[serde(flatten)]
    tags: BTreeMap<String, BTreeSet<String>>,
}

impl TryFrom<RawFilter> for Filter {
    type Error = FilterError;

    fn try_from(raw: RawFilter) -> Result<Self, Self::Error> {
        if let Some(key) = raw.tags.keys().find(|key| !is_tag_query_key(key)) {
            return Err(FilterError::InvalidTagKey(key.clone()));
        }
        Ok(Self {
            ids: raw.ids,
            authors: raw.authors,
            kinds: raw.kinds,
            since: raw.since,
            until: raw.until,
            limit: raw.limit,
            tags: raw.tags,
        })
    }
}

fn is_tag_query_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some('#'), Some(letter), None) if letter.is_ascii_alphabetic()
    )
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by authors.
    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Filter by a single kind.
    pub fn kind(self, kind: u16) -> Self {
        self.kinds([kind])
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag query. `letter` is the bare tag name (e.g. `e`, `p`).
    pub fn tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(format!("#{letter}"))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs<I, S>(self, event_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag('e', event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs<I, S>(self, pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag('p', pubkeys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::QuickCheck;
    use serde_json::json;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(filter: &Filter) -> u64 {
        let mut hasher = DefaultHasher::new();
        filter.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn array_order_does_not_affect_equality() {
        let left = Filter::new()
            .kinds([1, 7, 30023])
            .authors(["bob", "alice"])
            .event_refs(["x", "y"]);
        let right = Filter::new()
            .kinds([30023, 1, 7, 1])
            .authors(["alice", "bob"])
            .event_refs(["y", "x"]);
        assert_eq!(left, right);
        assert_eq!(hash_of(&left), hash_of(&right));
    }

    #[test]
    fn different_fields_are_not_equal() {
        let cases = vec![
            (Filter::new().kind(1), Filter::new().kind(2)),
            (Filter::new().kind(1), Filter::new().kind(1).limit(10)),
            (Filter::new().since(5), Filter::new().until(5)),
            (
                Filter::new().event_refs(["a"]),
                Filter::new().pubkey_refs(["a"]),
            ),
            (Filter::new(), Filter::new().kinds(Vec::<u16>::new())),
        ];
        for (left, right) in cases {
            assert_ne!(left, right, "{left:?} should differ from {right:?}");
        }
    }

    #[test]
    fn deserialized_filter_equals_built_filter() -> Result<(), serde_json::Error> {
        let parsed: Filter = serde_json::from_value(json!({
            "kinds": [7, 1],
            "#p": ["carol", "alice"],
            "limit": 20
        }))?;
        let built = Filter::new()
            .kinds([1, 7])
            .pubkey_refs(["alice", "carol"])
            .limit(20);
        assert_eq!(parsed, built);
        Ok(())
    }

    #[test]
    fn serializes_tag_queries_flat() -> Result<(), serde_json::Error> {
        let filter = Filter::new().kind(1).event_refs(["abc"]);
        let value = serde_json::to_value(&filter)?;
        assert_eq!(value, json!({ "kinds": [1], "#e": ["abc"] }));
        Ok(())
    }

    #[test]
    fn rejects_malformed_tag_keys() {
        for input in [
            json!({ "search": ["x"] }),
            json!({ "#": ["x"] }),
            json!({ "#ee": ["x"] }),
            json!({ "#1": ["x"] }),
        ] {
            let result: Result<Filter, _> = serde_json::from_value(input.clone());
            assert!(result.is_err(), "expected {input} to be rejected");
        }
    }

    #[test]
    fn equality_is_permutation_invariant() {
        fn prop(kinds: Vec<u16>, authors: Vec<String>) -> bool {
            let mut reversed_kinds = kinds.clone();
            reversed_kinds.reverse();
            let mut reversed_authors = authors.clone();
            reversed_authors.reverse();

            let forward = Filter::new().kinds(kinds).authors(authors);
            let backward = Filter::new()
                .kinds(reversed_kinds)
                .authors(reversed_authors);
            forward == backward && hash_of(&forward) == hash_of(&backward)
        }
        QuickCheck::new().quickcheck(prop as fn(Vec<u16>, Vec<String>) -> bool);
    }
}
