//! Storage and engine ports
//!
//! Backend-agnostic async traits for the collection graph subsystem, split by
//! responsibility:
//!
//! - **GraphStore**: documents, collections, per-source graph rows and reads
//!   over the materialized collection graph
//! - **MergeEngine**: merge, unmerge and split of collection entities
//! - **LinkResolver**: candidate correspondences and their confirmation
//! - **OperationLedger**: the append-only audit trail
//! - **GraphStateMachine**: collection graph initialization, drift and sync
//! - **LockMaintenance**: stale lock detection and ledgered release
//! - **VisibilityStore**: visibility profiles and filtered graph views
//!
//! Write operations take uuids; lookups accept a [`RecordRef`] so callers can
//! pass either identifier.

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collection::{Collection, CollectionEntity, GraphStatus, NewCollection, ResolvedRelationship};
use crate::document::{Document, ExtractionStatus, NewDocument};
use crate::error::GraphResult;
use crate::graph::{GraphBatch, GraphEntity};
use crate::ids::RecordRef;
use crate::link::{EntityLink, LinkProposal};
use crate::merge::{MergeOutcome, MergeRequest, SplitOutcome, SplitRequest};
use crate::operation::{EntityOperation, NewOperation, OperationStatus, RollbackData};
use crate::visibility::{GraphView, NewVisibilityProfile, VisibilityProfile};

// ============================================================================
// Outcomes
// ============================================================================

/// Rows written by one graph ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_uuid: Uuid,
    pub entity_count: usize,
    pub relationship_count: usize,
    /// Graph rows of the previous extraction that were replaced
    pub replaced_entities: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkOutcome {
    pub link: EntityLink,
    pub operation: EntityOperation,
}

/// A confirmed link and the merge it drove
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmOutcome {
    pub link: EntityLink,
    pub merge: MergeOutcome,
}

/// Collection after a graph state transition, with its ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateOutcome {
    pub collection: Collection,
    pub operation: EntityOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub collection: Collection,
    pub drifted: bool,
    pub stored_hash: Option<String>,
    pub current_hash: String,
    /// Present when drift moved the collection out of sync
    pub operation: Option<EntityOperation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasedLock {
    pub entity: CollectionEntity,
    /// Operation that held the lock
    pub owner: Option<EntityOperation>,
    /// The `force_unlock` ledger entry
    pub operation: EntityOperation,
}

/// Filter for operation history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub collection_uuid: Uuid,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<OperationStatus>,
}

impl HistoryQuery {
    pub fn for_collection(collection_uuid: Uuid) -> Self {
        Self {
            collection_uuid,
            limit: None,
            status: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }
}

// ============================================================================
// Ports
// ============================================================================

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn create_document(&self, document: NewDocument) -> GraphResult<Document>;

    async fn get_document(&self, id: &RecordRef) -> GraphResult<Option<Document>>;

    /// Record the extraction collaborator's progress for a document
    async fn set_extraction_status(
        &self,
        document: Uuid,
        status: ExtractionStatus,
        error: Option<String>,
    ) -> GraphResult<Document>;

    /// Delete a document and everything extracted from it
    ///
    /// Collection entities left without sources are removed; merged entities
    /// left with one source are demoted. Affected collections move out of sync.
    async fn delete_document(&self, document: Uuid) -> GraphResult<()>;

    async fn create_collection(&self, collection: NewCollection) -> GraphResult<Collection>;

    async fn get_collection(&self, id: &RecordRef) -> GraphResult<Option<Collection>>;

    async fn child_collections(&self, parent: Uuid) -> GraphResult<Vec<Collection>>;

    async fn add_document(&self, collection: Uuid, document: Uuid) -> GraphResult<Collection>;

    async fn remove_document(&self, collection: Uuid, document: Uuid) -> GraphResult<Collection>;

    /// Replace a document's extracted graph and mark extraction complete
    async fn ingest_graph(&self, document: Uuid, batch: GraphBatch) -> GraphResult<IngestReport>;

    async fn graph_entities(&self, document: Uuid) -> GraphResult<Vec<GraphEntity>>;

    async fn get_graph_entity(&self, id: &RecordRef) -> GraphResult<Option<GraphEntity>>;

    async fn collection_entities(&self, collection: Uuid) -> GraphResult<Vec<CollectionEntity>>;

    async fn get_collection_entity(&self, id: &RecordRef) -> GraphResult<Option<CollectionEntity>>;

    /// Source graph entities of a collection entity, via the junction table
    async fn entity_sources(&self, entity: Uuid) -> GraphResult<Vec<GraphEntity>>;

    /// Collection relationships resolved against the current merge state
    async fn collection_relationships(
        &self,
        collection: Uuid,
    ) -> GraphResult<Vec<ResolvedRelationship>>;
}

#[async_trait]
pub trait MergeEngine: Send + Sync {
    /// Fold source graph entities into one merged collection entity
    ///
    /// Fails with `Validation` before touching any row when a source lies
    /// outside the collection, and with `Conflict` when an affected entity is
    /// locked or the collection graph is busy.
    async fn merge(&self, request: MergeRequest) -> GraphResult<MergeOutcome>;

    /// Split a merged entity back into one individual entity per source
    async fn unmerge(&self, entity: Uuid, performed_by: &str) -> GraphResult<SplitOutcome>;

    /// Split a merged entity along an arbitrary partition of its sources
    async fn split(&self, request: SplitRequest) -> GraphResult<SplitOutcome>;
}

#[async_trait]
pub trait LinkResolver: Send + Sync {
    async fn propose_link(&self, proposal: LinkProposal) -> GraphResult<LinkOutcome>;

    /// Drive the link's target through the merge engine
    async fn confirm_link(&self, link: Uuid, performed_by: &str) -> GraphResult<ConfirmOutcome>;

    /// Deactivate a link; a completed merge is left in place
    async fn deactivate_link(&self, link: Uuid, performed_by: &str) -> GraphResult<LinkOutcome>;

    async fn get_link(&self, id: &RecordRef) -> GraphResult<Option<EntityLink>>;

    /// Active links pointing at a collection entity
    async fn active_links(&self, entity: Uuid) -> GraphResult<Vec<EntityLink>>;

    /// Best active, unconfirmed candidate target for a source graph entity
    async fn best_candidate(
        &self,
        collection: Uuid,
        graph_entity: Uuid,
    ) -> GraphResult<Option<EntityLink>>;
}

#[async_trait]
pub trait OperationLedger: Send + Sync {
    /// Append a `pending` operation
    async fn record(&self, operation: NewOperation) -> GraphResult<EntityOperation>;

    async fn mark_in_progress(&self, operation: Uuid) -> GraphResult<EntityOperation>;

    async fn mark_completed(&self, operation: Uuid) -> GraphResult<EntityOperation>;

    async fn mark_failed(&self, operation: Uuid, error: &str) -> GraphResult<EntityOperation>;

    async fn set_rollback_data(
        &self,
        operation: Uuid,
        data: &RollbackData,
    ) -> GraphResult<EntityOperation>;

    async fn get_operation(&self, id: &RecordRef) -> GraphResult<Option<EntityOperation>>;

    /// Operations of a collection in commit order
    async fn history(&self, query: HistoryQuery) -> GraphResult<Vec<EntityOperation>>;
}

#[async_trait]
pub trait GraphStateMachine: Send + Sync {
    async fn initialize(&self, collection: Uuid, performed_by: &str) -> GraphResult<StateOutcome>;

    async fn detect_drift(&self, collection: Uuid, performed_by: &str) -> GraphResult<DriftReport>;

    async fn sync(&self, collection: Uuid, performed_by: &str) -> GraphResult<StateOutcome>;

    async fn graph_status(&self, collection: Uuid) -> GraphResult<GraphStatus>;
}

#[async_trait]
pub trait LockMaintenance: Send + Sync {
    /// Locked entities whose lock is older than `older_than` (or the
    /// configured threshold)
    async fn stale_locks(&self, older_than: Option<Duration>) -> GraphResult<Vec<CollectionEntity>>;

    async fn force_release(
        &self,
        entity: Uuid,
        performed_by: &str,
        reason: &str,
    ) -> GraphResult<ReleasedLock>;
}

#[async_trait]
pub trait VisibilityStore: Send + Sync {
    async fn create_profile(&self, profile: NewVisibilityProfile) -> GraphResult<VisibilityProfile>;

    async fn get_profile(&self, id: &RecordRef) -> GraphResult<Option<VisibilityProfile>>;

    async fn collection_profiles(&self, collection: Uuid) -> GraphResult<Vec<VisibilityProfile>>;

    async fn set_default_profile(
        &self,
        collection: Uuid,
        profile: Option<Uuid>,
    ) -> GraphResult<Collection>;

    /// The collection graph filtered by `profile`, or by the collection's
    /// default profile when none is given
    async fn visible_graph(&self, collection: Uuid, profile: Option<Uuid>) -> GraphResult<GraphView>;
}
