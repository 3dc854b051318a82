//! Flag configuration as served by the feature service and cached by the
//! gateway.

use serde::{Deserialize, Serialize};

pub use shared::event::{Evaluation, Reason, ReasonType, User};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Variation {
    pub id: String,
    /// Opaque value handed back to the SDK (flag payloads are not typed
    /// server-side).
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutVariation {
    pub variation: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    Fixed { variation: String },
    Rollout { variations: Vec<RolloutVariation> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClauseOperator {
    Equals,
    In,
    StartsWith,
    EndsWith,
    Greater,
    Less,
    Before,
    After,
    Segment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub id: String,
    /// User attribute the clause inspects; `"id"` addresses the user id
    /// itself. Ignored for `Segment` clauses, whose `values` name segments.
    #[serde(default)]
    pub attribute: String,
    pub operator: ClauseOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub strategy: Strategy,
    /// AND-composed; an empty clause list never matches.
    #[serde(default)]
    pub clauses: Vec<Clause>,
}

/// Individual user targeting, checked before rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub variation: String,
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub variations: Vec<Variation>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_strategy: Option<Strategy>,
    #[serde(default)]
    pub off_variation: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub version: u32,
}

impl Feature {
    pub fn variation(&self, id: &str) -> Option<&Variation> {
        self.variations.iter().find(|v| v.id == id)
    }

    /// A feature with no tags applies to every tag.
    pub fn matches_tag(&self, tag: &str) -> bool {
        self.tags.is_empty() || self.tags.iter().any(|t| t == tag)
    }
}

/// The cached per-environment flag bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Features {
    #[serde(default)]
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentUserState {
    Included,
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUser {
    pub segment_id: String,
    pub user_id: String,
    pub state: SegmentUserState,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SegmentUsers {
    pub segment_id: String,
    #[serde(default)]
    pub users: Vec<SegmentUser>,
}

impl SegmentUsers {
    /// Deleted rows are filtered on read; only `Included` members count.
    pub fn contains(&self, user_id: &str) -> bool {
        self.users.iter().any(|u| {
            u.user_id == user_id && u.state == SegmentUserState::Included && !u.deleted
        })
    }
}

/// The evaluated set for one user plus its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserEvaluations {
    pub id: String,
    #[serde(default)]
    pub evaluations: Vec<Evaluation>,
}
