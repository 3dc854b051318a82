//! Feature domain: flag model, rule evaluation, fingerprints, typed caches,
//! the feature-service client seam, and per-user evaluation storage.

pub mod cache;
pub mod client;
pub mod evaluator;
pub mod model;
pub mod storage;
pub mod ueid;
