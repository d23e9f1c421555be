//! Collections and their merged graph views
//!
//! A [`Collection`] groups documents and materializes a collection-scoped
//! graph over their extracted entities: one [`CollectionEntity`] per distinct
//! real-world thing, backed by one or more source graph entities, and
//! [`CollectionRelationship`]s between them. The collection's [`GraphState`]
//! tracks whether that view is in step with its sources.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::GraphError;
use crate::ids::DisplayId;

// ============================================================================
// Graph state
// ============================================================================

/// Aggregate synchronization state of a collection graph
///
/// ```text
/// uninitialized -> initializing -> synchronized -> out_of_sync <-> updating -> synchronized
///                        \_______________\_______________\____________\__> error -> updating
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphState {
    Uninitialized,
    Initializing,
    Synchronized,
    OutOfSync,
    Updating,
    Error,
}

impl GraphState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphState::Uninitialized => "uninitialized",
            GraphState::Initializing => "initializing",
            GraphState::Synchronized => "synchronized",
            GraphState::OutOfSync => "out_of_sync",
            GraphState::Updating => "updating",
            GraphState::Error => "error",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`
    ///
    /// A sync leaves `updating` only for `synchronized` or `error`; drift
    /// found later goes back through `synchronized -> out_of_sync`.
    pub fn can_transition_to(&self, next: GraphState) -> bool {
        use GraphState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Synchronized)
                | (Synchronized, OutOfSync)
                | (OutOfSync, Updating)
                | (Updating, Synchronized)
                | (Error, Updating)
                | (Initializing, Error)
                | (Synchronized, Error)
                | (OutOfSync, Error)
                | (Updating, Error)
        )
    }

    /// A collection-wide operation owns the graph; everything else must wait
    pub fn is_busy(&self) -> bool {
        matches!(self, GraphState::Initializing | GraphState::Updating)
    }

    /// The graph has been built and entity-level operations may run on it
    pub fn accepts_entity_operations(&self) -> bool {
        matches!(self, GraphState::Synchronized | GraphState::OutOfSync)
    }

    /// Reject entity-level operations in states that cannot take them
    ///
    /// Busy states are conflicts (the caller may retry once the collection
    /// operation finishes); an unbuilt or failed graph is a validation failure.
    pub fn guard_entity_operation(&self, operation: &str) -> Result<(), GraphError> {
        if self.is_busy() {
            return Err(GraphError::conflict(format!(
                "cannot {} while collection graph is {}",
                operation, self
            )));
        }
        if !self.accepts_entity_operations() {
            return Err(GraphError::validation(format!(
                "cannot {} while collection graph is {}",
                operation, self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GraphState {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(GraphState::Uninitialized),
            "initializing" => Ok(GraphState::Initializing),
            "synchronized" => Ok(GraphState::Synchronized),
            "out_of_sync" => Ok(GraphState::OutOfSync),
            "updating" => Ok(GraphState::Updating),
            "error" => Ok(GraphState::Error),
            other => Err(GraphError::validation(format!("unknown graph state: {}", other))),
        }
    }
}

// ============================================================================
// Lifecycle state
// ============================================================================

/// Merge status of a single collection entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Individual,
    Linked,
    Merging,
    Merged,
    Unmerging,
    Error,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Individual => "individual",
            LifecycleState::Linked => "linked",
            LifecycleState::Merging => "merging",
            LifecycleState::Merged => "merged",
            LifecycleState::Unmerging => "unmerging",
            LifecycleState::Error => "error",
        }
    }

    /// Transitional states only exist while an operation holds the lock
    pub fn is_transitional(&self) -> bool {
        matches!(self, LifecycleState::Merging | LifecycleState::Unmerging)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "individual" => Ok(LifecycleState::Individual),
            "linked" => Ok(LifecycleState::Linked),
            "merging" => Ok(LifecycleState::Merging),
            "merged" => Ok(LifecycleState::Merged),
            "unmerging" => Ok(LifecycleState::Unmerging),
            "error" => Ok(LifecycleState::Error),
            other => Err(GraphError::validation(format!("unknown lifecycle state: {}", other))),
        }
    }
}

// ============================================================================
// Collection
// ============================================================================

/// Cached row counts of a collection graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCounts {
    pub entity_count: i64,
    pub relationship_count: i64,
    pub document_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub uuid: Uuid,
    pub display_id: DisplayId,
    pub name: String,
    pub description: Option<String>,
    pub owner: String,
    pub parent_uuid: Option<Uuid>,
    pub graph_state: GraphState,
    /// Fingerprint of the source entities the graph was last built from
    pub entities_hash: Option<String>,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub is_graph_generated: bool,
    pub graph_generated_at: Option<DateTime<Utc>>,
    pub counts: CollectionCounts,
    pub default_visibility_profile_uuid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCollection {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner: String,
    #[serde(default)]
    pub parent_uuid: Option<Uuid>,
}

impl NewCollection {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            owner: owner.into(),
            parent_uuid: None,
        }
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_uuid = Some(parent);
        self
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if self.name.trim().is_empty() {
            return Err(GraphError::validation("collection name must not be blank"));
        }
        if self.owner.trim().is_empty() {
            return Err(GraphError::validation("collection owner must not be blank"));
        }
        Ok(())
    }
}

/// Read model for the graph state query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStatus {
    pub collection_uuid: Uuid,
    pub graph_state: GraphState,
    pub entities_hash: Option<String>,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub counts: CollectionCounts,
    pub locked_entities: i64,
}

// ============================================================================
// Collection entities and relationships
// ============================================================================

/// Logical id of an individual collection entity
///
/// Extraction tools number entities per source, so the raw `entity_id` is
/// qualified by the display id of the source that produced it.
pub fn individual_entity_id(source_display_id: &DisplayId, entity_id: &str) -> String {
    format!("{}:{}", source_display_id, entity_id)
}

/// Logical id of a merged collection entity
pub fn merged_entity_id(display_id: &DisplayId) -> String {
    format!("merged:{}", display_id)
}

/// Entity materialized within one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntity {
    pub uuid: Uuid,
    pub display_id: DisplayId,
    pub collection_uuid: Uuid,
    /// Logical identifier, unique within the collection
    pub entity_id: String,
    pub entity_type: String,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub properties: Option<Value>,
    pub is_merged: bool,
    pub created_from_link_uuid: Option<Uuid>,
    pub lifecycle_state: LifecycleState,
    /// In-flight operation holding this entity, if any
    pub operation_lock: Option<Uuid>,
    pub operation_locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionEntity {
    /// Name to show in listings
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_locked(&self) -> bool {
        self.operation_lock.is_some()
    }

    /// Check the source cardinality rule for this entity's state
    pub fn check_source_count(&self, source_count: usize) -> Result<(), GraphError> {
        if self.is_merged && source_count < 2 {
            return Err(GraphError::corruption(format!(
                "merged entity {} has {} source(s)",
                self.display_id, source_count
            )));
        }
        if self.lifecycle_state == LifecycleState::Individual && source_count != 1 {
            return Err(GraphError::corruption(format!(
                "individual entity {} has {} source(s)",
                self.display_id, source_count
            )));
        }
        Ok(())
    }
}

/// Edge within a collection between logical entity ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRelationship {
    pub uuid: Uuid,
    pub display_id: DisplayId,
    pub collection_uuid: Uuid,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relationship_type: String,
    /// Undirected edges keep their endpoints in ascending order
    pub is_directed: bool,
    pub description: Option<String>,
    pub properties: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Collection relationship with both endpoints resolved against the current
/// merge state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRelationship {
    pub relationship: CollectionRelationship,
    pub source: CollectionEntity,
    pub target: CollectionEntity,
    pub source_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RecordIdentity;

    const ALL_STATES: [GraphState; 6] = [
        GraphState::Uninitialized,
        GraphState::Initializing,
        GraphState::Synchronized,
        GraphState::OutOfSync,
        GraphState::Updating,
        GraphState::Error,
    ];

    #[test]
    fn test_happy_path_transitions() {
        use GraphState::*;
        let path = [Uninitialized, Initializing, Synchronized, OutOfSync, Updating, Synchronized];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_error_reachable_from_active_states_only() {
        for state in ALL_STATES {
            let expected = !matches!(state, GraphState::Uninitialized | GraphState::Error);
            assert_eq!(state.can_transition_to(GraphState::Error), expected, "{}", state);
        }
    }

    #[test]
    fn test_sync_entry_points() {
        let entries: Vec<_> = ALL_STATES
            .iter()
            .filter(|s| s.can_transition_to(GraphState::Updating))
            .copied()
            .collect();
        assert_eq!(entries, vec![GraphState::OutOfSync, GraphState::Error]);
    }

    #[test]
    fn test_updating_exits_to_synchronized_or_error() {
        let exits: Vec<_> = ALL_STATES
            .iter()
            .filter(|s| GraphState::Updating.can_transition_to(**s))
            .copied()
            .collect();
        assert_eq!(exits, vec![GraphState::Synchronized, GraphState::Error]);
    }

    #[test]
    fn test_initialize_only_from_uninitialized() {
        for state in ALL_STATES {
            assert_eq!(
                state.can_transition_to(GraphState::Initializing),
                state == GraphState::Uninitialized
            );
        }
    }

    #[test]
    fn test_entity_operation_guard() {
        assert!(GraphState::Synchronized.guard_entity_operation("merge").is_ok());
        assert!(GraphState::OutOfSync.guard_entity_operation("merge").is_ok());
        assert!(matches!(
            GraphState::Updating.guard_entity_operation("merge"),
            Err(GraphError::Conflict(_))
        ));
        assert!(matches!(
            GraphState::Uninitialized.guard_entity_operation("merge"),
            Err(GraphError::Validation(_))
        ));
    }

    #[test]
    fn test_state_strings_round_trip() {
        for state in ALL_STATES {
            assert_eq!(state.as_str().parse::<GraphState>().unwrap(), state);
        }
        for state in [
            LifecycleState::Individual,
            LifecycleState::Linked,
            LifecycleState::Merging,
            LifecycleState::Merged,
            LifecycleState::Unmerging,
            LifecycleState::Error,
        ] {
            assert_eq!(state.as_str().parse::<LifecycleState>().unwrap(), state);
        }
    }

    #[test]
    fn test_logical_ids() {
        let identity = RecordIdentity::generate();
        let individual = individual_entity_id(&identity.display_id, "e1");
        assert_eq!(individual, format!("{}:e1", identity.display_id));
        assert_eq!(
            merged_entity_id(&identity.display_id),
            format!("merged:{}", identity.display_id)
        );
    }

    fn entity(is_merged: bool, lifecycle_state: LifecycleState) -> CollectionEntity {
        let identity = RecordIdentity::generate();
        let now = Utc::now();
        CollectionEntity {
            uuid: identity.uuid,
            display_id: identity.display_id,
            collection_uuid: Uuid::new_v4(),
            entity_id: "doc:e1".to_string(),
            entity_type: "organization".to_string(),
            name: "Acme Corp".to_string(),
            display_name: None,
            description: None,
            properties: None,
            is_merged,
            created_from_link_uuid: None,
            lifecycle_state,
            operation_lock: None,
            operation_locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_source_cardinality() {
        let merged = entity(true, LifecycleState::Merged);
        assert!(merged.check_source_count(2).is_ok());
        assert!(merged.check_source_count(1).is_err());

        let individual = entity(false, LifecycleState::Individual);
        assert!(individual.check_source_count(1).is_ok());
        assert!(individual.check_source_count(0).is_err());
        assert!(individual.check_source_count(2).is_err());
    }

    #[test]
    fn test_label_prefers_display_name() {
        let mut e = entity(false, LifecycleState::Individual);
        assert_eq!(e.label(), "Acme Corp");
        e.display_name = Some("ACME".to_string());
        assert_eq!(e.label(), "ACME");
    }
}
