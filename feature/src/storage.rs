//! Per-user evaluation storage.
//!
//! Keyed `(user_id, environment_namespace, tag)`; the gateway upserts on
//! every served evaluation and the persister reads the set back to enrich
//! goal events. The production column-store driver lives outside this
//! repository; the in-memory implementation backs tests and the
//! single-process mode.

use crate::model::Evaluation;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Key not found")]
    KeyNotFound,
    #[error("Storage failure: {0}")]
    Internal(String),
}

#[async_trait]
pub trait UserEvaluationsStorage: Send + Sync {
    async fn upsert_user_evaluation(
        &self,
        evaluation: &Evaluation,
        environment_namespace: &str,
        tag: &str,
    ) -> Result<(), StorageError>;

    /// All stored evaluations for the key. Absent keys are
    /// [`StorageError::KeyNotFound`], which callers treat differently from
    /// transient failures.
    async fn get_user_evaluations(
        &self,
        user_id: &str,
        environment_namespace: &str,
        tag: &str,
    ) -> Result<Vec<Evaluation>, StorageError>;
}

type Key = (String, String, String);

#[derive(Default)]
pub struct InMemoryUserEvaluationsStorage {
    rows: RwLock<HashMap<Key, BTreeMap<String, Evaluation>>>,
}

impl InMemoryUserEvaluationsStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserEvaluationsStorage for InMemoryUserEvaluationsStorage {
    async fn upsert_user_evaluation(
        &self,
        evaluation: &Evaluation,
        environment_namespace: &str,
        tag: &str,
    ) -> Result<(), StorageError> {
        let key = (
            evaluation.user_id.clone(),
            environment_namespace.to_string(),
            tag.to_string(),
        );
        self.rows
            .write()
            .entry(key)
            .or_default()
            .insert(evaluation.id.clone(), evaluation.clone());
        Ok(())
    }

    async fn get_user_evaluations(
        &self,
        user_id: &str,
        environment_namespace: &str,
        tag: &str,
    ) -> Result<Vec<Evaluation>, StorageError> {
        let key = (
            user_id.to_string(),
            environment_namespace.to_string(),
            tag.to_string(),
        );
        self.rows
            .read()
            .get(&key)
            .map(|rows| rows.values().cloned().collect())
            .ok_or(StorageError::KeyNotFound)
    }
}
