//! Deterministic fingerprints.
//!
//! The evaluation id keys per-user storage; the user-evaluations id lets
//! SDKs skip payloads they already hold. Both must be stable across input
//! ordering, so every multi-valued input is sorted before hashing.

use crate::model::Feature;
use std::collections::BTreeMap;

pub fn evaluation_id(feature_id: &str, feature_version: u32, user_id: &str) -> String {
    format!("{feature_id}:{feature_version}:{user_id}")
}

/// Fingerprint of (user id, user metadata, evaluated feature set). Changes
/// iff any input changes; an empty feature set has no fingerprint.
pub fn user_evaluations_id<'a>(
    user_id: &str,
    data: &BTreeMap<String, String>,
    features: impl IntoIterator<Item = &'a Feature>,
) -> String {
    let mut versions: Vec<(&str, u32)> = features
        .into_iter()
        .map(|f| (f.id.as_str(), f.version))
        .collect();
    if versions.is_empty() {
        return String::new();
    }
    versions.sort_unstable();

    let mut input = String::new();
    input.push_str(user_id);
    for (key, value) in data {
        input.push_str(key);
        input.push_str(value);
    }
    for (id, version) in versions {
        input.push_str(id);
        input.push_str(&version.to_string());
    }
    format!("{:x}", md5::compute(input.as_bytes()))
}
