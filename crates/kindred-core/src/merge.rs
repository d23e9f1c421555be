//! Merge requests and field resolution
//!
//! A merge names *source* graph entities, not collection entities: the
//! engine looks up which collection entities currently hold those sources,
//! locks them, and folds them into one merged entity. Splits partition the
//! sources of one merged entity.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::collection::CollectionEntity;
use crate::error::GraphError;
use crate::graph::GraphEntity;
use crate::operation::EntityOperation;

/// Caller-supplied field values that win over resolved ones
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOverrides {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Merged over the resolved property union, key by key
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

impl MergeOverrides {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.properties.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub collection_uuid: Uuid,
    /// Graph entity uuids to fold into one collection entity
    pub source_entity_uuids: BTreeSet<Uuid>,
    /// Existing merged entity to grow instead of creating a new one
    #[serde(default)]
    pub target: Option<Uuid>,
    #[serde(default)]
    pub overrides: MergeOverrides,
    pub performed_by: String,
    /// Link whose confirmation drives this merge
    #[serde(default)]
    pub link_uuid: Option<Uuid>,
}

impl MergeRequest {
    pub fn new(
        collection_uuid: Uuid,
        source_entity_uuids: impl IntoIterator<Item = Uuid>,
        performed_by: impl Into<String>,
    ) -> Self {
        Self {
            collection_uuid,
            source_entity_uuids: source_entity_uuids.into_iter().collect(),
            target: None,
            overrides: MergeOverrides::default(),
            performed_by: performed_by.into(),
            link_uuid: None,
        }
    }

    pub fn into_target(mut self, target: Uuid) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_overrides(mut self, overrides: MergeOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn from_link(mut self, link_uuid: Uuid) -> Self {
        self.link_uuid = Some(link_uuid);
        self
    }

    /// Shape checks that need no storage access
    ///
    /// A merge into an existing target may name a single new source; a fresh
    /// merge needs at least two.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.performed_by.trim().is_empty() {
            return Err(GraphError::validation("performed_by must not be blank"));
        }
        let minimum = if self.target.is_some() { 1 } else { 2 };
        if self.source_entity_uuids.len() < minimum {
            return Err(GraphError::validation(format!(
                "merge needs at least {} distinct source entit{}, got {}",
                minimum,
                if minimum == 1 { "y" } else { "ies" },
                self.source_entity_uuids.len()
            )));
        }
        if let Some(name) = &self.overrides.name {
            if name.trim().is_empty() {
                return Err(GraphError::validation("override name must not be blank"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub collection_uuid: Uuid,
    /// Merged collection entity to split
    pub entity_uuid: Uuid,
    /// Disjoint groups of source graph entity uuids covering every source
    pub partition: Vec<BTreeSet<Uuid>>,
    pub performed_by: String,
}

/// Check that `partition` splits `sources` into at least two disjoint,
/// non-empty parts with nothing missing or extra
pub fn validate_partition(
    sources: &BTreeSet<Uuid>,
    partition: &[BTreeSet<Uuid>],
) -> Result<(), GraphError> {
    if partition.is_empty() {
        return Err(GraphError::validation("partition must not be empty"));
    }
    let mut seen = BTreeSet::new();
    for part in partition {
        if part.is_empty() {
            return Err(GraphError::validation("partition parts must not be empty"));
        }
        for source in part {
            if !seen.insert(*source) {
                return Err(GraphError::validation(format!(
                    "source {} appears in more than one part",
                    source
                )));
            }
        }
    }
    if let Some(extra) = seen.difference(sources).next() {
        return Err(GraphError::validation(format!(
            "source {} does not belong to the entity being split",
            extra
        )));
    }
    if let Some(missing) = sources.difference(&seen).next() {
        return Err(GraphError::validation(format!(
            "partition leaves source {} unassigned",
            missing
        )));
    }
    if partition.len() < 2 {
        return Err(GraphError::validation(
            "partition with a single part leaves the entity unchanged",
        ));
    }
    Ok(())
}

/// Field values of a merged entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFields {
    pub entity_type: String,
    pub name: String,
    pub description: Option<String>,
    pub properties: Option<Value>,
}

/// Recency order of source entities, oldest first
fn recency(a: &GraphEntity, b: &GraphEntity) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.uuid.cmp(&b.uuid))
}

/// Resolve merged field values from source entities
///
/// `name` and `description` come from the most recently created source (ties
/// go to the larger uuid). Properties are the union of all source property
/// objects, newer sources overriding older keys. Overrides win over both.
/// All sources must share one `entity_type`.
pub fn resolve_fields(
    sources: &[GraphEntity],
    overrides: &MergeOverrides,
) -> Result<ResolvedFields, GraphError> {
    let mut ordered: Vec<&GraphEntity> = sources.iter().collect();
    ordered.sort_by(|a, b| recency(a, b));

    let newest = ordered
        .last()
        .ok_or_else(|| GraphError::validation("cannot resolve fields of zero sources"))?;

    if let Some(other) = ordered.iter().find(|e| e.entity_type != newest.entity_type) {
        return Err(GraphError::validation(format!(
            "cannot merge entities of different types: {} and {}",
            newest.entity_type, other.entity_type
        )));
    }

    let mut properties = Map::new();
    for source in &ordered {
        if let Some(Value::Object(props)) = &source.properties {
            for (key, value) in props {
                properties.insert(key.clone(), value.clone());
            }
        }
    }
    if let Some(extra) = &overrides.properties {
        for (key, value) in extra {
            properties.insert(key.clone(), value.clone());
        }
    }

    Ok(ResolvedFields {
        entity_type: newest.entity_type.clone(),
        name: overrides.name.clone().unwrap_or_else(|| newest.name.clone()),
        description: overrides
            .description
            .clone()
            .or_else(|| newest.description.clone()),
        properties: if properties.is_empty() {
            None
        } else {
            Some(Value::Object(properties))
        },
    })
}

/// Result of a merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub entity: CollectionEntity,
    /// Collection entities folded into the result and removed
    pub absorbed: Vec<Uuid>,
    pub operation: EntityOperation,
}

/// Result of a split or unmerge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitOutcome {
    pub entities: Vec<CollectionEntity>,
    pub operation: EntityOperation,
}
