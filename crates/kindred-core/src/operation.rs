//! Operation ledger records
//!
//! Every merge, split, link, unlink and graph-level action leaves one
//! [`EntityOperation`]. Records are append-only: after creation only the
//! status and the terminal payload keys (`error`, `rollback`) change, and a
//! terminal record never changes again.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::collection::LifecycleState;
use crate::error::GraphError;
use crate::ids::DisplayId;

/// Payload key holding the failure message of a failed operation
pub const PAYLOAD_ERROR_KEY: &str = "error";
/// Payload key holding compensating-action data
pub const PAYLOAD_ROLLBACK_KEY: &str = "rollback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Created,
    Merged,
    Split,
    Deleted,
    Updated,
    Unmerged,
    Link,
    Unlink,
    InitializeGraph,
    SyncGraph,
    DriftDetected,
    ForceUnlock,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Created => "created",
            OperationType::Merged => "merged",
            OperationType::Split => "split",
            OperationType::Deleted => "deleted",
            OperationType::Updated => "updated",
            OperationType::Unmerged => "unmerged",
            OperationType::Link => "link",
            OperationType::Unlink => "unlink",
            OperationType::InitializeGraph => "initialize_graph",
            OperationType::SyncGraph => "sync_graph",
            OperationType::DriftDetected => "drift_detected",
            OperationType::ForceUnlock => "force_unlock",
        }
    }

    /// Operations whose effects a compensating action can undo
    pub fn supports_rollback(&self) -> bool {
        matches!(
            self,
            OperationType::Merged | OperationType::Split | OperationType::Unmerged
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(OperationType::Created),
            "merged" => Ok(OperationType::Merged),
            "split" => Ok(OperationType::Split),
            "deleted" => Ok(OperationType::Deleted),
            "updated" => Ok(OperationType::Updated),
            "unmerged" => Ok(OperationType::Unmerged),
            "link" => Ok(OperationType::Link),
            "unlink" => Ok(OperationType::Unlink),
            "initialize_graph" => Ok(OperationType::InitializeGraph),
            "sync_graph" => Ok(OperationType::SyncGraph),
            "drift_detected" => Ok(OperationType::DriftDetected),
            "force_unlock" => Ok(OperationType::ForceUnlock),
            other => Err(GraphError::validation(format!("unknown operation type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Completed) | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }

    /// Validate a transition, naming the operation in the error
    pub fn check_transition(&self, next: OperationStatus, op: &DisplayId) -> Result<(), GraphError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(GraphError::validation(format!(
                "operation {} cannot move from {} to {}",
                op, self, next
            )))
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_progress" => Ok(OperationStatus::InProgress),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(GraphError::validation(format!("unknown operation status: {}", other))),
        }
    }
}

/// Audit record of one action against a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityOperation {
    pub uuid: Uuid,
    pub display_id: DisplayId,
    pub collection_uuid: Uuid,
    pub operation_type: OperationType,
    /// Affected entity uuids (collection or graph entities, per operation)
    pub entity_ids: Vec<Uuid>,
    pub description: Option<String>,
    /// Structured operation data; always a JSON object
    pub payload: Value,
    pub performed_by: String,
    pub status: OperationStatus,
    pub performed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sequence: i64,
}

impl EntityOperation {
    /// Failure message, for failed operations
    pub fn error(&self) -> Option<&str> {
        self.payload.get(PAYLOAD_ERROR_KEY).and_then(Value::as_str)
    }

    /// Rollback data, if the operation stored any
    pub fn rollback(&self) -> Option<RollbackData> {
        self.payload
            .get(PAYLOAD_ROLLBACK_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Input for appending an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
    pub collection_uuid: Uuid,
    pub operation_type: OperationType,
    #[serde(default)]
    pub entity_ids: Vec<Uuid>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub details: Value,
    pub performed_by: String,
}

impl NewOperation {
    pub fn new(
        collection_uuid: Uuid,
        operation_type: OperationType,
        performed_by: impl Into<String>,
    ) -> Self {
        Self {
            collection_uuid,
            operation_type,
            entity_ids: Vec::new(),
            description: None,
            details: Value::Object(Map::new()),
            performed_by: performed_by.into(),
        }
    }

    pub fn with_entities(mut self, entity_ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.entity_ids = entity_ids.into_iter().collect();
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Normalized payload: details must be an object (null becomes `{}`)
    pub fn payload(&self) -> Result<Value, GraphError> {
        match &self.details {
            Value::Null => Ok(Value::Object(Map::new())),
            Value::Object(_) => Ok(self.details.clone()),
            other => Err(GraphError::validation(format!(
                "operation details must be a JSON object, got {}",
                other
            ))),
        }
    }
}

/// State of one collection entity before an operation touched it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorEntityState {
    pub uuid: Uuid,
    pub entity_id: String,
    pub lifecycle_state: LifecycleState,
    pub is_merged: bool,
    pub source_entity_uuids: Vec<Uuid>,
}

/// Enough pre-operation state to compensate a merge, split or unmerge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackData {
    pub source_entity_uuids: Vec<Uuid>,
    pub prior_entities: Vec<PriorEntityState>,
}

impl RollbackData {
    /// Prior lifecycle of an entity, if the operation captured it
    pub fn prior_state_of(&self, uuid: Uuid) -> Option<LifecycleState> {
        self.prior_entities
            .iter()
            .find(|p| p.uuid == uuid)
            .map(|p| p.lifecycle_state)
    }
}

/// Insert one key into an object payload
pub fn payload_with(payload: &Value, key: &str, value: Value) -> Value {
    let mut map = match payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert(key.to_string(), value);
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use OperationStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(Completed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn test_payload_helpers_keep_existing_keys() {
        let payload = json!({"sources": ["a", "b"]});
        let failed = payload_with(&payload, PAYLOAD_ERROR_KEY, json!("disk full"));
        assert_eq!(failed["sources"], json!(["a", "b"]));
        assert_eq!(failed[PAYLOAD_ERROR_KEY], "disk full");

        let from_null = payload_with(&Value::Null, PAYLOAD_ROLLBACK_KEY, json!({}));
        assert!(from_null.is_object());
    }

    #[test]
    fn test_details_must_be_object() {
        let op = NewOperation::new(Uuid::new_v4(), OperationType::Link, "user:alice");
        assert_eq!(op.payload().unwrap(), json!({}));

        let op = op.with_details(json!([1, 2]));
        assert!(op.payload().is_err());
    }

    #[test]
    fn test_rollback_accessor() {
        let entity = Uuid::new_v4();
        let rollback = RollbackData {
            source_entity_uuids: vec![Uuid::new_v4()],
            prior_entities: vec![PriorEntityState {
                uuid: entity,
                entity_id: "abcd1234:e1".to_string(),
                lifecycle_state: LifecycleState::Individual,
                is_merged: false,
                source_entity_uuids: vec![],
            }],
        };
        let identity = crate::ids::RecordIdentity::generate();
        let op = EntityOperation {
            uuid: identity.uuid,
            display_id: identity.display_id,
            collection_uuid: Uuid::new_v4(),
            operation_type: OperationType::Merged,
            entity_ids: vec![entity],
            description: None,
            payload: payload_with(
                &json!({}),
                PAYLOAD_ROLLBACK_KEY,
                serde_json::to_value(&rollback).unwrap(),
            ),
            performed_by: "user:alice".to_string(),
            status: OperationStatus::InProgress,
            performed_at: Utc::now(),
            completed_at: None,
            sequence: 1,
        };

        let restored = op.rollback().unwrap();
        assert_eq!(restored, rollback);
        assert_eq!(restored.prior_state_of(entity), Some(LifecycleState::Individual));
        assert_eq!(op.error(), None);
    }

    #[test]
    fn test_rollback_support() {
        assert!(OperationType::Merged.supports_rollback());
        assert!(!OperationType::SyncGraph.supports_rollback());
    }
}
