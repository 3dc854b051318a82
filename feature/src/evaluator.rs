//! Rule evaluation.
//!
//! The engine owns no state: it maps (features, segment lists, user, tag)
//! to evaluations. Segment lists are pulled through a capability interface,
//! lazily, only when a `Segment` clause is actually reached.

use crate::model::{
    Clause, ClauseOperator, Evaluation, Feature, Reason, ReasonType, SegmentUsers, Strategy, User,
    UserEvaluations,
};
use crate::ueid;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegmentsError {
    #[error("Failed to fetch segment users: {0}")]
    Fetch(String),
}

/// Source of segment membership lists. The gateway backs this with the
/// segment cache and the feature service; tests use static maps.
#[async_trait]
pub trait SegmentsProvider: Send + Sync {
    async fn segment_users(&self, segment_id: &str) -> Result<Arc<SegmentUsers>, SegmentsError>;
}

#[derive(Error, Debug)]
pub enum EvaluateError {
    #[error("Variation {variation_id} not found in feature {feature_id}")]
    VariationNotFound {
        feature_id: String,
        variation_id: String,
    },
    #[error("Feature {0} has no default strategy")]
    DefaultStrategyMissing(String),
    #[error("Feature {0} rollout has zero total weight")]
    ZeroRolloutWeight(String),
    #[error(transparent)]
    Segments(#[from] SegmentsError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Evaluator;

impl Evaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates every feature applicable to `tag` for `user`. Repeated
    /// calls with the same inputs yield identical output.
    pub async fn evaluate(
        &self,
        features: &[Feature],
        segments: &dyn SegmentsProvider,
        user: &User,
        tag: &str,
    ) -> Result<UserEvaluations, EvaluateError> {
        let selected: Vec<&Feature> = features.iter().filter(|f| f.matches_tag(tag)).collect();
        // Memoized per call so one fetch serves every clause naming the
        // same segment.
        let mut fetched: HashMap<String, Arc<SegmentUsers>> = HashMap::new();

        let mut evaluations = Vec::with_capacity(selected.len());
        for feature in &selected {
            let (variation_id, reason) = self
                .assign_user(feature, user, segments, &mut fetched)
                .await?;
            evaluations.push(Evaluation {
                id: ueid::evaluation_id(&feature.id, feature.version, &user.id),
                feature_id: feature.id.clone(),
                feature_version: feature.version,
                user_id: user.id.clone(),
                variation_id,
                reason: Some(reason),
            });
        }

        Ok(UserEvaluations {
            id: ueid::user_evaluations_id(&user.id, &user.data, selected.iter().copied()),
            evaluations,
        })
    }

    async fn assign_user(
        &self,
        feature: &Feature,
        user: &User,
        segments: &dyn SegmentsProvider,
        fetched: &mut HashMap<String, Arc<SegmentUsers>>,
    ) -> Result<(String, Reason), EvaluateError> {
        if !feature.enabled && !feature.off_variation.is_empty() {
            let variation = self.resolve_variation(feature, &feature.off_variation)?;
            return Ok((
                variation,
                Reason {
                    reason_type: ReasonType::OffVariation,
                    rule_id: None,
                },
            ));
        }

        for target in &feature.targets {
            if target.users.iter().any(|u| u == &user.id) {
                let variation = self.resolve_variation(feature, &target.variation)?;
                return Ok((
                    variation,
                    Reason {
                        reason_type: ReasonType::Target,
                        rule_id: None,
                    },
                ));
            }
        }

        for rule in &feature.rules {
            if self.rule_matches(rule, user, segments, fetched).await? {
                let variation = self.resolve_strategy(feature, &rule.strategy, user)?;
                return Ok((
                    variation,
                    Reason {
                        reason_type: ReasonType::Rule,
                        rule_id: Some(rule.id.clone()),
                    },
                ));
            }
        }

        let strategy = feature
            .default_strategy
            .as_ref()
            .ok_or_else(|| EvaluateError::DefaultStrategyMissing(feature.id.clone()))?;
        let variation = self.resolve_strategy(feature, strategy, user)?;
        Ok((
            variation,
            Reason {
                reason_type: ReasonType::Default,
                rule_id: None,
            },
        ))
    }

    async fn rule_matches(
        &self,
        rule: &crate::model::Rule,
        user: &User,
        segments: &dyn SegmentsProvider,
        fetched: &mut HashMap<String, Arc<SegmentUsers>>,
    ) -> Result<bool, EvaluateError> {
        if rule.clauses.is_empty() {
            return Ok(false);
        }
        for clause in &rule.clauses {
            if !self.clause_matches(clause, user, segments, fetched).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn clause_matches(
        &self,
        clause: &Clause,
        user: &User,
        segments: &dyn SegmentsProvider,
        fetched: &mut HashMap<String, Arc<SegmentUsers>>,
    ) -> Result<bool, EvaluateError> {
        if clause.operator == ClauseOperator::Segment {
            for segment_id in &clause.values {
                let users = match fetched.get(segment_id) {
                    Some(users) => users.clone(),
                    None => {
                        let users = segments.segment_users(segment_id).await?;
                        fetched.insert(segment_id.clone(), users.clone());
                        users
                    }
                };
                if users.contains(&user.id) {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        Ok(compare(clause, user))
    }

    fn resolve_variation(
        &self,
        feature: &Feature,
        variation_id: &str,
    ) -> Result<String, EvaluateError> {
        feature
            .variation(variation_id)
            .map(|v| v.id.clone())
            .ok_or_else(|| EvaluateError::VariationNotFound {
                feature_id: feature.id.clone(),
                variation_id: variation_id.to_string(),
            })
    }

    fn resolve_strategy(
        &self,
        feature: &Feature,
        strategy: &Strategy,
        user: &User,
    ) -> Result<String, EvaluateError> {
        match strategy {
            Strategy::Fixed { variation } => self.resolve_variation(feature, variation),
            Strategy::Rollout { variations } => {
                let total: u64 = variations.iter().map(|v| u64::from(v.weight)).sum();
                if total == 0 {
                    return Err(EvaluateError::ZeroRolloutWeight(feature.id.clone()));
                }
                let bucket = bucket(&feature.id, &user.id, total);
                let mut cumulative = 0u64;
                for rollout in variations {
                    cumulative += u64::from(rollout.weight);
                    if bucket < cumulative {
                        return self.resolve_variation(feature, &rollout.variation);
                    }
                }
                // bucket < total and the cumulative sum reaches total, so a
                // slot always matched above.
                unreachable!("rollout bucket {bucket} exceeded total weight {total}")
            }
        }
    }
}

/// Stable bucket in `[0, total_weight)` for a (feature, user) pair.
fn bucket(feature_id: &str, user_id: &str, total_weight: u64) -> u64 {
    let digest = md5::compute(format!("{feature_id}-{user_id}"));
    let value = u64::from_be_bytes(digest[0..8].try_into().expect("md5 digest is 16 bytes"));
    value % total_weight
}

fn compare(clause: &Clause, user: &User) -> bool {
    let target = match user_value(user, &clause.attribute) {
        Some(value) => value,
        None => return false,
    };
    match clause.operator {
        ClauseOperator::Equals => clause.values.first().is_some_and(|v| v == target),
        ClauseOperator::In => clause.values.iter().any(|v| v == target),
        ClauseOperator::StartsWith => clause.values.iter().any(|v| target.starts_with(v.as_str())),
        ClauseOperator::EndsWith => clause.values.iter().any(|v| target.ends_with(v.as_str())),
        ClauseOperator::Greater => compare_numeric(target, &clause.values, |t, v| t > v),
        ClauseOperator::Less => compare_numeric(target, &clause.values, |t, v| t < v),
        ClauseOperator::Before => compare_timestamp(target, &clause.values, |t, v| t < v),
        ClauseOperator::After => compare_timestamp(target, &clause.values, |t, v| t > v),
        // Handled in clause_matches; a segment clause never reaches the
        // attribute comparison path.
        ClauseOperator::Segment => false,
    }
}

fn user_value<'a>(user: &'a User, attribute: &str) -> Option<&'a str> {
    if attribute == "id" {
        return Some(&user.id);
    }
    user.data.get(attribute).map(String::as_str)
}

/// Operands that do not parse fail the clause rather than erroring the
/// evaluation.
fn compare_numeric(target: &str, values: &[String], cmp: impl Fn(f64, f64) -> bool) -> bool {
    let target: f64 = match target.parse() {
        Ok(value) => value,
        Err(_) => return false,
    };
    values
        .iter()
        .filter_map(|v| v.parse::<f64>().ok())
        .any(|v| cmp(target, v))
}

fn compare_timestamp(target: &str, values: &[String], cmp: impl Fn(i64, i64) -> bool) -> bool {
    let target: i64 = match target.parse() {
        Ok(value) => value,
        Err(_) => return false,
    };
    values
        .iter()
        .filter_map(|v| v.parse::<i64>().ok())
        .any(|v| cmp(target, v))
}
