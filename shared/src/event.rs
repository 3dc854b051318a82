//! Telemetry event contracts shared by the gateway (producer) and the
//! persister (consumer).
//!
//! The outer [`Event`] envelope travels on the bus as JSON bytes. The inner
//! payload is a tagged variant over the fixed event set; consumers dispatch
//! on the discriminator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed event envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Producer of an event, carried through to the warehouse records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceId {
    #[default]
    Unknown,
    Android,
    Ios,
    Web,
    GoalBatch,
    Gateway,
}

impl SourceId {
    pub const fn as_str_name(&self) -> &'static str {
        match self {
            SourceId::Unknown => "UNKNOWN",
            SourceId::Android => "ANDROID",
            SourceId::Ios => "IOS",
            SourceId::Web => "WEB",
            SourceId::GoalBatch => "GOAL_BATCH",
            SourceId::Gateway => "GATEWAY",
        }
    }
}

/// End user as presented by the SDK. `data` is opaque string metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonType {
    Target,
    Rule,
    #[default]
    Default,
    Client,
    OffVariation,
    Prerequisite,
}

impl ReasonType {
    pub const fn as_str_name(&self) -> &'static str {
        match self {
            ReasonType::Target => "TARGET",
            ReasonType::Rule => "RULE",
            ReasonType::Default => "DEFAULT",
            ReasonType::Client => "CLIENT",
            ReasonType::OffVariation => "OFF_VARIATION",
            ReasonType::Prerequisite => "PREREQUISITE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Reason {
    #[serde(rename = "type")]
    pub reason_type: ReasonType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// A single flag decision for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Evaluation {
    pub id: String,
    pub feature_id: String,
    pub feature_version: u32,
    pub user_id: String,
    pub variation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvaluationEvent {
    pub timestamp: i64,
    pub feature_id: String,
    pub feature_version: u32,
    pub user_id: String,
    pub variation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub source_id: SourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GoalEvent {
    pub timestamp: i64,
    pub goal_id: String,
    pub user_id: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// Inline decisions from legacy SDKs that predate server-side lookup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluations: Vec<Evaluation>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub source_id: SourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserGoalEventsOverTag {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default)]
    pub goal_events: Vec<GoalEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GoalBatchEvent {
    pub user_id: String,
    #[serde(default)]
    pub user_goal_events_over_tags: Vec<UserGoalEventsOverTag>,
}

/// SDK-side operational telemetry reported alongside flag traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsPayload {
    GetEvaluationLatency {
        #[serde(default)]
        labels: BTreeMap<String, String>,
        duration_millis: u64,
    },
    GetEvaluationSize {
        #[serde(default)]
        labels: BTreeMap<String, String>,
        size_byte: u64,
    },
    TimeoutErrorCount {
        tag: String,
    },
    InternalErrorCount {
        tag: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
    pub timestamp: i64,
    pub event: MetricsPayload,
}

/// Last-seen marker published by the gateway on every evaluation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserEvent {
    pub user_id: String,
    #[serde(default)]
    pub source_id: SourceId,
    #[serde(default)]
    pub tag: String,
    pub last_seen: i64,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Evaluation(EvaluationEvent),
    Goal(GoalEvent),
    GoalBatch(GoalBatchEvent),
    Metrics(MetricsEvent),
    User(UserEvent),
}

impl EventPayload {
    pub const fn kind(&self) -> &'static str {
        match self {
            EventPayload::Evaluation(_) => "evaluation",
            EventPayload::Goal(_) => "goal",
            EventPayload::GoalBatch(_) => "goal_batch",
            EventPayload::Metrics(_) => "metrics",
            EventPayload::User(_) => "user",
        }
    }
}

/// Outer bus envelope. `id` is a uuid string, globally unique per
/// environment; the persister deduplicates on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub environment_namespace: String,
    #[serde(rename = "event")]
    pub payload: EventPayload,
}

impl Event {
    pub fn encode(&self) -> Vec<u8> {
        // The envelope is a closed set of map-shaped types; serialization
        // cannot fail.
        serde_json::to_vec(self).expect("event envelope is always serializable")
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(data)?)
    }
}
