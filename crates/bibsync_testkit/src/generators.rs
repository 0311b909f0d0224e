//! Property-based test generators using proptest.
//!
//! Strategies produce keys, version maps and object payloads that keep the
//! shapes the API guarantees.

use bibsync_protocol::{LibraryIdentifier, ObjectKind};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Characters used in object keys.
pub const KEY_ALPHABET: &str = "23456789ABCDEFGHIJKLMNPQRSTUVWXYZ";

/// Strategy for generating valid object keys (8 characters).
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[23456789ABCDEFGHIJKLMNPQRSTUVWXYZ]{8}").expect("Invalid regex")
}

/// Strategy for generating distinct object keys.
pub fn keys_strategy(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(key_strategy(), 0..=max).prop_map(|keys| keys.into_iter().collect())
}

/// Strategy for generating library identifiers.
pub fn library_strategy() -> impl Strategy<Value = LibraryIdentifier> {
    prop_oneof![
        Just(LibraryIdentifier::MY_LIBRARY),
        (1i64..10_000).prop_map(LibraryIdentifier::Group),
    ]
}

/// Strategy for generating object kinds.
pub fn kind_strategy() -> impl Strategy<Value = ObjectKind> {
    prop_oneof![
        Just(ObjectKind::Collection),
        Just(ObjectKind::Search),
        Just(ObjectKind::Item),
    ]
}

/// Strategy for generating a remote `{key: version}` map with versions in `1..=max_version`.
pub fn version_map_strategy(max_keys: usize, max_version: u64) -> impl Strategy<Value = BTreeMap<String, u64>> {
    prop::collection::btree_map(key_strategy(), 1..=max_version.max(1), 0..=max_keys)
}

/// Strategy for generating a sequence of library versions as reported by successive responses.
pub fn version_sequence_strategy(len: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..1_000, 1..=len.max(1))
}

/// Strategy for generating collection payloads.
pub fn collection_data_strategy() -> impl Strategy<Value = Value> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9 ]{0,30}")
        .expect("Invalid regex")
        .prop_map(|name| json!({"name": name, "parentCollection": false}))
}

/// Strategy for generating book payloads.
pub fn book_data_strategy() -> impl Strategy<Value = Value> {
    (
        prop::string::string_regex("[A-Za-z][A-Za-z0-9 ]{0,60}").expect("Invalid regex"),
        prop::option::of(1000u32..2100),
    )
        .prop_map(|(title, year)| {
            let mut data = json!({"itemType": "book", "title": title});
            if let Some(year) = year {
                data["date"] = json!(year.to_string());
            }
            data
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{assert_parses, object_json};
    use bibsync_protocol::SyncObject;

    proptest! {
        #[test]
        fn keys_use_the_key_alphabet(key in key_strategy()) {
            prop_assert_eq!(key.len(), 8);
            prop_assert!(key.chars().all(|c| KEY_ALPHABET.contains(c)));
        }

        #[test]
        fn generated_payloads_parse(
            key in key_strategy(),
            collection in collection_data_strategy(),
            book in book_data_strategy(),
        ) {
            assert_parses(SyncObject::Collection, &object_json(&key, 1, collection));
            assert_parses(SyncObject::Item, &object_json(&key, 1, book));
        }
    }
}
