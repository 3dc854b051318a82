//! Warehouse record marshaling and goal enrichment.
//!
//! Records are flat JSON maps; user metadata keys are namespaced per
//! environment so tenants sharing a warehouse table cannot collide.

use chrono::{DateTime, SecondsFormat};
use feature::client::FeatureClient;
use feature::model::{Evaluation, User};
use feature::storage::{StorageError, UserEvaluationsStorage};
use serde_json::{json, Map, Value};
use shared::event::{EvaluationEvent, GoalEvent, SourceId, UserEvent};

/// Enrichment failure plus whether redelivery may succeed.
#[derive(Debug)]
pub struct EnrichError {
    pub retriable: bool,
    pub message: String,
}

pub fn user_metadata_column(environment_namespace: &str, key: &str) -> String {
    if environment_namespace.is_empty() {
        return format!("user.data.{key}");
    }
    format!("{environment_namespace}.user.data.{key}")
}

pub fn rfc3339(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `featureId:featureVersion:variationId:reasonType`; the reason is empty
/// when the evaluation carries none.
pub fn format_evaluation(evaluation: &Evaluation) -> String {
    let reason = evaluation
        .reason
        .as_ref()
        .map(|r| r.reason_type.as_str_name())
        .unwrap_or("");
    format!(
        "{}:{}:{}:{}",
        evaluation.feature_id, evaluation.feature_version, evaluation.variation_id, reason
    )
}

fn insert_user_data(map: &mut Map<String, Value>, environment_namespace: &str, user: Option<&User>) {
    if let Some(user) = user {
        for (key, value) in &user.data {
            map.insert(
                user_metadata_column(environment_namespace, key),
                json!(value),
            );
        }
    }
}

pub fn marshal_evaluation_event(
    event: &EvaluationEvent,
    environment_namespace: &str,
) -> Value {
    let mut map = Map::new();
    map.insert("environmentNamespace".into(), json!(environment_namespace));
    map.insert("sourceId".into(), json!(event.source_id.as_str_name()));
    map.insert("tag".into(), json!(event.tag));
    map.insert("timestamp".into(), json!(rfc3339(event.timestamp)));
    map.insert("featureId".into(), json!(event.feature_id));
    map.insert(
        "featureVersion".into(),
        json!(event.feature_version.to_string()),
    );
    map.insert("userId".into(), json!(event.user_id));
    map.insert("metric.userId".into(), json!(event.user_id));
    map.insert("variationId".into(), json!(event.variation_id));
    if let Some(reason) = &event.reason {
        map.insert("reason".into(), json!(reason.reason_type.as_str_name()));
    }
    insert_user_data(&mut map, environment_namespace, event.user.as_ref());
    Value::Object(map)
}

pub fn marshal_user_event(event: &UserEvent, environment_namespace: &str) -> Value {
    let mut map = Map::new();
    map.insert("environmentNamespace".into(), json!(environment_namespace));
    map.insert("sourceId".into(), json!(event.source_id.as_str_name()));
    map.insert("tag".into(), json!(event.tag));
    map.insert("timestamp".into(), json!(rfc3339(event.last_seen)));
    map.insert("userId".into(), json!(event.user_id));
    Value::Object(map)
}

pub fn marshal_goal_event(
    event: &GoalEvent,
    environment_namespace: &str,
    evaluations: &[Evaluation],
) -> Value {
    let mut map = Map::new();
    map.insert("environmentNamespace".into(), json!(environment_namespace));
    map.insert("sourceId".into(), json!(event.source_id.as_str_name()));
    map.insert("tag".into(), json!(event.tag));
    map.insert("timestamp".into(), json!(rfc3339(event.timestamp)));
    map.insert("goalId".into(), json!(event.goal_id));
    map.insert("userId".into(), json!(event.user_id));
    map.insert("metric.userId".into(), json!(event.user_id));
    insert_user_data(&mut map, environment_namespace, event.user.as_ref());
    // Shortest decimal form, never scientific notation.
    map.insert("value".into(), json!(event.value.to_string()));

    let formatted: Vec<String> = evaluations.iter().map(format_evaluation).collect();
    if formatted.is_empty() {
        tracing::warn!(
            environment_namespace,
            source_id = event.source_id.as_str_name(),
            goal_id = %event.goal_id,
            user_id = %event.user_id,
            tag = %event.tag,
            "Goal event has no evaluations"
        );
    }
    map.insert("evaluations".into(), json!(formatted));
    Value::Object(map)
}

/// Contemporaneous evaluations for a goal event, per its provenance.
///
/// Goal-batch events check stored evaluations first and fall back to a live
/// evaluation for SDKs that never stored theirs. Tagless legacy SDKs inline
/// their evaluations in the event. Everything else reads storage, where an
/// absent key simply means an empty list.
pub async fn goal_evaluations(
    event: &GoalEvent,
    environment_namespace: &str,
    storage: &dyn UserEvaluationsStorage,
    feature_client: &dyn FeatureClient,
) -> Result<Vec<Evaluation>, EnrichError> {
    if event.source_id == SourceId::GoalBatch {
        return match storage
            .get_user_evaluations(&event.user_id, environment_namespace, &event.tag)
            .await
        {
            Ok(evaluations) => Ok(evaluations),
            Err(StorageError::KeyNotFound) => {
                let user = event.user.clone().unwrap_or_else(|| User {
                    id: event.user_id.clone(),
                    ..Default::default()
                });
                feature_client
                    .evaluate_features(environment_namespace, &user, &event.tag)
                    .await
                    .map(|ue| ue.evaluations)
                    .map_err(|err| EnrichError {
                        retriable: false,
                        message: err.to_string(),
                    })
            }
            Err(err) => Err(EnrichError {
                retriable: true,
                message: err.to_string(),
            }),
        };
    }

    if event.tag.is_empty() {
        return Ok(event.evaluations.clone());
    }

    match storage
        .get_user_evaluations(&event.user_id, environment_namespace, &event.tag)
        .await
    {
        Ok(evaluations) => Ok(evaluations),
        Err(StorageError::KeyNotFound) => Ok(Vec::new()),
        Err(err) => {
            tracing::error!(
                error = %err,
                environment_namespace,
                goal_id = %event.goal_id,
                user_id = %event.user_id,
                tag = %event.tag,
                "Failed to get user evaluations"
            );
            Err(EnrichError {
                retriable: true,
                message: err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feature::model::{Reason, ReasonType};
    use std::collections::BTreeMap;

    fn goal_event() -> GoalEvent {
        GoalEvent {
            timestamp: 1_700_000_000,
            goal_id: "signup".into(),
            user_id: "user-1".into(),
            value: 1.5,
            user: Some(User {
                id: "user-1".into(),
                data: BTreeMap::from([("plan".to_string(), "pro".to_string())]),
            }),
            tag: "ios".into(),
            source_id: SourceId::Ios,
            ..Default::default()
        }
    }

    fn evaluation() -> Evaluation {
        Evaluation {
            id: "feature-a:2:user-1".into(),
            feature_id: "feature-a".into(),
            feature_version: 2,
            user_id: "user-1".into(),
            variation_id: "variation-a".into(),
            reason: Some(Reason {
                reason_type: ReasonType::Default,
                rule_id: None,
            }),
        }
    }

    #[test]
    fn evaluation_record_keys() {
        let event = EvaluationEvent {
            timestamp: 1_700_000_000,
            feature_id: "feature-a".into(),
            feature_version: 2,
            user_id: "user-1".into(),
            variation_id: "variation-a".into(),
            user: Some(User {
                id: "user-1".into(),
                data: BTreeMap::from([("plan".to_string(), "pro".to_string())]),
            }),
            reason: Some(Reason {
                reason_type: ReasonType::Default,
                rule_id: None,
            }),
            tag: "ios".into(),
            source_id: SourceId::Ios,
        };

        let record = marshal_evaluation_event(&event, "ns0");
        assert_eq!(record["environmentNamespace"], "ns0");
        assert_eq!(record["sourceId"], "IOS");
        assert_eq!(record["featureVersion"], "2");
        assert_eq!(record["timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(record["reason"], "DEFAULT");
        assert_eq!(record["metric.userId"], "user-1");
        assert_eq!(record["ns0.user.data.plan"], "pro");
    }

    #[test]
    fn user_metadata_columns_are_environment_scoped() {
        assert_eq!(user_metadata_column("", "plan"), "user.data.plan");
        assert_eq!(user_metadata_column("ns0", "plan"), "ns0.user.data.plan");
    }

    #[test]
    fn goal_record_formats_value_and_evaluations() {
        let record = marshal_goal_event(&goal_event(), "ns0", &[evaluation()]);
        assert_eq!(record["goalId"], "signup");
        assert_eq!(record["value"], "1.5");
        assert_eq!(
            record["evaluations"][0],
            "feature-a:2:variation-a:DEFAULT"
        );

        let whole = GoalEvent {
            value: 2.0,
            ..goal_event()
        };
        let record = marshal_goal_event(&whole, "ns0", &[]);
        assert_eq!(record["value"], "2");
        assert_eq!(record["evaluations"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn evaluation_without_reason_formats_with_an_empty_slot() {
        let mut evaluation = evaluation();
        evaluation.reason = None;
        assert_eq!(format_evaluation(&evaluation), "feature-a:2:variation-a:");
    }

    mod enrichment {
        use super::*;
        use crate::testutils::StubFeatureClient;
        use async_trait::async_trait;
        use feature::storage::{InMemoryUserEvaluationsStorage, StorageError,
            UserEvaluationsStorage};

        struct BrokenStorage;

        #[async_trait]
        impl UserEvaluationsStorage for BrokenStorage {
            async fn upsert_user_evaluation(
                &self,
                _evaluation: &Evaluation,
                _env: &str,
                _tag: &str,
            ) -> Result<(), StorageError> {
                Err(StorageError::Internal("storage: internal".into()))
            }

            async fn get_user_evaluations(
                &self,
                _user_id: &str,
                _env: &str,
                _tag: &str,
            ) -> Result<Vec<Evaluation>, StorageError> {
                Err(StorageError::Internal("storage: internal".into()))
            }
        }

        #[tokio::test]
        async fn stored_evaluations_win_for_tagged_events() {
            let storage = InMemoryUserEvaluationsStorage::new();
            storage
                .upsert_user_evaluation(&evaluation(), "ns0", "ios")
                .await
                .unwrap();
            let client = StubFeatureClient::default();

            let evaluations = goal_evaluations(&goal_event(), "ns0", &storage, &client)
                .await
                .unwrap();
            assert_eq!(evaluations.len(), 1);
            assert_eq!(client.evaluate_calls(), 0);
        }

        #[tokio::test]
        async fn missing_key_means_an_empty_list() {
            let storage = InMemoryUserEvaluationsStorage::new();
            let client = StubFeatureClient::default();

            let evaluations = goal_evaluations(&goal_event(), "ns0", &storage, &client)
                .await
                .unwrap();
            assert!(evaluations.is_empty());
        }

        #[tokio::test]
        async fn legacy_tagless_events_use_inline_evaluations() {
            let mut event = goal_event();
            event.tag = String::new();
            event.evaluations = vec![evaluation()];
            let storage = InMemoryUserEvaluationsStorage::new();
            let client = StubFeatureClient::default();

            let evaluations = goal_evaluations(&event, "ns0", &storage, &client)
                .await
                .unwrap();
            assert_eq!(evaluations.len(), 1);
        }

        #[tokio::test]
        async fn storage_outage_is_retriable() {
            let client = StubFeatureClient::default();
            let err = goal_evaluations(&goal_event(), "ns0", &BrokenStorage, &client)
                .await
                .unwrap_err();
            assert!(err.retriable);

            let mut batch = goal_event();
            batch.source_id = SourceId::GoalBatch;
            let err = goal_evaluations(&batch, "ns0", &BrokenStorage, &client)
                .await
                .unwrap_err();
            assert!(err.retriable);
        }

        #[tokio::test]
        async fn goal_batch_missing_key_falls_back_to_live_evaluation() {
            let mut event = goal_event();
            event.source_id = SourceId::GoalBatch;
            let storage = InMemoryUserEvaluationsStorage::new();
            let client = StubFeatureClient::default();
            client.set_evaluations(vec![evaluation()]);

            let evaluations = goal_evaluations(&event, "ns0", &storage, &client)
                .await
                .unwrap();
            assert_eq!(evaluations.len(), 1);
            assert_eq!(client.evaluate_calls(), 1);
        }
    }

    #[test]
    fn user_record_keys() {
        let event = UserEvent {
            user_id: "user-1".into(),
            source_id: SourceId::Gateway,
            tag: "ios".into(),
            last_seen: 1_700_000_000,
            data: BTreeMap::new(),
        };
        let record = marshal_user_event(&event, "ns0");
        assert_eq!(record["userId"], "user-1");
        assert_eq!(record["sourceId"], "GATEWAY");
        assert!(record.get("goalId").is_none());
    }
}
