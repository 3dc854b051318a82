//! Sink seams: the blob/warehouse writer and the auxiliary row store.

use async_trait::async_trait;
use serde_json::Value;
use shared::event::{EvaluationEvent, GoalEvent, UserEvent};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Datastore unavailable: {0}")]
    Unavailable(String),
}

/// Blob/warehouse sink. One call per environment per flush; the result maps
/// failed record ids to whether a retry may succeed.
#[async_trait]
pub trait DatastoreWriter: Send + Sync {
    async fn write(
        &self,
        environment_namespace: &str,
        records: HashMap<String, Value>,
    ) -> Result<HashMap<String, bool>, WriteError>;
}

/// Auxiliary row-oriented materialization. Errors are logged by the caller
/// and never influence acking.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn create_evaluation_event(
        &self,
        event: &EvaluationEvent,
        id: &str,
        environment_namespace: &str,
    ) -> Result<(), WriteError>;

    async fn create_goal_event(
        &self,
        event: &GoalEvent,
        id: &str,
        environment_namespace: &str,
        evaluations: &[String],
    ) -> Result<(), WriteError>;

    async fn create_user_event(
        &self,
        event: &UserEvent,
        id: &str,
        environment_namespace: &str,
    ) -> Result<(), WriteError>;
}

/// Filesystem-backed writer: one JSONL file per environment under a
/// directory. Stands in for the object-store sink in tests and the
/// single-process mode.
pub struct FsDatastoreWriter {
    dir: PathBuf,
}

impl FsDatastoreWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_name(environment_namespace: &str) -> String {
        if environment_namespace.is_empty() {
            return "default.jsonl".to_string();
        }
        format!("{environment_namespace}.jsonl")
    }
}

#[async_trait]
impl DatastoreWriter for FsDatastoreWriter {
    async fn write(
        &self,
        environment_namespace: &str,
        records: HashMap<String, Value>,
    ) -> Result<HashMap<String, bool>, WriteError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| WriteError::Unavailable(e.to_string()))?;
        let path = self.dir.join(Self::file_name(environment_namespace));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| WriteError::Unavailable(e.to_string()))?;

        let mut lines = String::new();
        for record in records.values() {
            lines.push_str(&record.to_string());
            lines.push('\n');
        }
        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| WriteError::Unavailable(e.to_string()))?;

        Ok(HashMap::new())
    }
}
