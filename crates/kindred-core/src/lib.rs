//! Domain model for Kindred collection graphs
//!
//! Documents carry graphs extracted by an external tool. Collections group
//! documents and materialize a deduplicated, collection-scoped view of those
//! graphs: collection entities backed by one or more source entities through
//! junction rows, entity links proposing correspondences, an append-only
//! operation ledger, and a per-collection graph state machine.
//!
//! This crate holds the backend-agnostic types, rules and async ports;
//! `kindred-sqlite` implements the ports.

pub mod collection;
pub mod config;
pub mod document;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod ids;
pub mod link;
pub mod merge;
pub mod operation;
pub mod traits;
pub mod visibility;

pub use collection::{
    individual_entity_id, merged_entity_id, Collection, CollectionCounts, CollectionEntity,
    CollectionRelationship, GraphState, GraphStatus, LifecycleState, NewCollection,
    ResolvedRelationship,
};
pub use config::EngineConfig;
pub use document::{Document, ExtractionStatus, NewDocument};
pub use error::{GraphError, GraphResult};
pub use fingerprint::entities_hash;
pub use graph::{
    GraphBatch, GraphEntity, GraphRelationship, NewGraphEntity, NewGraphRelationship, SourceType,
};
pub use ids::{DisplayId, RecordIdentity, RecordRef, DISPLAY_ID_LEN};
pub use link::{candidate_order, EntityLink, LinkProposal, LinkType, MAX_LINK_CONFIDENCE};
pub use merge::{
    resolve_fields, validate_partition, MergeOutcome, MergeOverrides, MergeRequest,
    ResolvedFields, SplitOutcome, SplitRequest,
};
pub use operation::{
    EntityOperation, NewOperation, OperationStatus, OperationType, PriorEntityState, RollbackData,
};

// Ports implemented by storage backends
pub use traits::{
    ConfirmOutcome, DriftReport, GraphStateMachine, GraphStore, HistoryQuery, IngestReport,
    LinkOutcome, LinkResolver, LockMaintenance, MergeEngine, OperationLedger, ReleasedLock,
    StateOutcome, VisibilityStore,
};
pub use visibility::{GraphView, NewVisibilityProfile, ProfileType, VisibilityProfile};
