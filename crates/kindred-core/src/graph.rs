//! Per-source graph facts
//!
//! [`GraphEntity`] and [`GraphRelationship`] rows are produced by an external
//! extraction tool, one batch per source document. They are never merged in
//! place; collections build merged views over them.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::GraphError;
use crate::ids::DisplayId;

/// Where a graph entity or relationship came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    File,
    CollectionGenerated,
    Document,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::CollectionGenerated => "collection_generated",
            SourceType::Document => "document",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(SourceType::File),
            "collection_generated" => Ok(SourceType::CollectionGenerated),
            "document" => Ok(SourceType::Document),
            other => Err(GraphError::validation(format!("unknown source type: {}", other))),
        }
    }
}

/// Atomic node extracted from one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub uuid: Uuid,
    pub display_id: DisplayId,
    /// Identifier assigned by the extraction tool, stable within its source
    pub entity_id: String,
    pub entity_type: String,
    pub name: String,
    pub description: Option<String>,
    pub properties: Option<Value>,
    pub source_type: Option<SourceType>,
    pub source_file_uuid: Option<Uuid>,
    pub source_collection_uuid: Option<Uuid>,
    pub created_by_tool: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GraphEntity {
    /// The record that owns this entity (document first, then collection)
    pub fn source_uuid(&self) -> Option<Uuid> {
        self.source_file_uuid.or(self.source_collection_uuid)
    }
}

/// Edge between two graph entities of the same source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub uuid: Uuid,
    pub display_id: DisplayId,
    pub source_entity_uuid: Uuid,
    pub target_entity_uuid: Uuid,
    pub relationship_id: Option<String>,
    pub relationship_type: String,
    pub source_type: Option<SourceType>,
    pub source_file_uuid: Option<Uuid>,
    pub source_collection_uuid: Option<Uuid>,
    pub is_directed: bool,
    pub weight: Option<f64>,
    pub confidence_score: Option<f64>,
    pub properties: Option<Value>,
    pub created_by_tool: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Entity as delivered by the extraction tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGraphEntity {
    pub entity_id: String,
    pub entity_type: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Option<Value>,
}

impl NewGraphEntity {
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            name: name.into(),
            description: None,
            properties: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Relationship as delivered by the extraction tool
///
/// Endpoints are named by the `entity_id` of entities in the same batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGraphRelationship {
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub relationship_type: String,
    #[serde(default)]
    pub relationship_id: Option<String>,
    #[serde(default = "default_directed")]
    pub is_directed: bool,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub properties: Option<Value>,
}

fn default_directed() -> bool {
    true
}

impl NewGraphRelationship {
    pub fn new(
        source_entity_id: impl Into<String>,
        target_entity_id: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Self {
        Self {
            source_entity_id: source_entity_id.into(),
            target_entity_id: target_entity_id.into(),
            relationship_type: relationship_type.into(),
            relationship_id: None,
            is_directed: true,
            weight: None,
            confidence_score: None,
            properties: None,
        }
    }

    pub fn undirected(mut self) -> Self {
        self.is_directed = false;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_score = Some(confidence);
        self
    }
}

/// One extraction result for a source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphBatch {
    /// Tool that produced the batch
    pub created_by_tool: String,
    #[serde(default)]
    pub entities: Vec<NewGraphEntity>,
    #[serde(default)]
    pub relationships: Vec<NewGraphRelationship>,
}

impl GraphBatch {
    pub fn new(created_by_tool: impl Into<String>) -> Self {
        Self {
            created_by_tool: created_by_tool.into(),
            ..Self::default()
        }
    }

    pub fn entity(mut self, entity: NewGraphEntity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn relationship(mut self, relationship: NewGraphRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Check the batch against the per-source invariants
    ///
    /// Entity ids are unique and non-blank, names and types are non-blank,
    /// relationships reference entities of this batch, `weight > 0` and
    /// `confidence_score` lies in `[0, 1]`.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.created_by_tool.trim().is_empty() {
            return Err(GraphError::validation("created_by_tool must not be blank"));
        }

        let mut seen = HashSet::new();
        for entity in &self.entities {
            if entity.entity_id.trim().is_empty() {
                return Err(GraphError::validation("entity_id must not be blank"));
            }
            if entity.entity_type.trim().is_empty() || entity.name.trim().is_empty() {
                return Err(GraphError::validation(format!(
                    "entity {} needs a type and a name",
                    entity.entity_id
                )));
            }
            if !seen.insert(entity.entity_id.as_str()) {
                return Err(GraphError::validation(format!(
                    "duplicate entity_id in batch: {}",
                    entity.entity_id
                )));
            }
        }

        for rel in &self.relationships {
            for endpoint in [&rel.source_entity_id, &rel.target_entity_id] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(GraphError::validation(format!(
                        "relationship endpoint {} is not an entity of this batch",
                        endpoint
                    )));
                }
            }
            if rel.relationship_type.trim().is_empty() {
                return Err(GraphError::validation("relationship_type must not be blank"));
            }
            if let Some(weight) = rel.weight {
                if !(weight > 0.0) {
                    return Err(GraphError::validation(format!(
                        "relationship weight must be > 0, got {}",
                        weight
                    )));
                }
            }
            if let Some(confidence) = rel.confidence_score {
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(GraphError::validation(format!(
                        "relationship confidence must be within [0, 1], got {}",
                        confidence
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme_batch() -> GraphBatch {
        GraphBatch::new("extractor-v2")
            .entity(NewGraphEntity::new("e1", "organization", "Acme Corp"))
            .entity(NewGraphEntity::new("e2", "person", "Wile E. Coyote"))
            .relationship(NewGraphRelationship::new("e2", "e1", "customer_of").with_weight(2.5))
    }

    #[test]
    fn test_valid_batch() {
        assert!(acme_batch().validate().is_ok());
    }

    #[test]
    fn test_duplicate_entity_ids_rejected() {
        let batch = acme_batch().entity(NewGraphEntity::new("e1", "organization", "Acme again"));
        assert!(matches!(batch.validate(), Err(GraphError::Validation(_))));
    }

    #[test]
    fn test_dangling_relationship_rejected() {
        let batch = acme_batch().relationship(NewGraphRelationship::new("e1", "e9", "owns"));
        let err = batch.validate().unwrap_err();
        assert!(err.to_string().contains("e9"));
    }

    #[test]
    fn test_weight_and_confidence_bounds() {
        let zero_weight =
            acme_batch().relationship(NewGraphRelationship::new("e1", "e2", "employs").with_weight(0.0));
        assert!(zero_weight.validate().is_err());

        let nan_weight = acme_batch()
            .relationship(NewGraphRelationship::new("e1", "e2", "employs").with_weight(f64::NAN));
        assert!(nan_weight.validate().is_err());

        let high_confidence = acme_batch()
            .relationship(NewGraphRelationship::new("e1", "e2", "employs").with_confidence(1.2));
        assert!(high_confidence.validate().is_err());

        let edge_confidence = acme_batch()
            .relationship(NewGraphRelationship::new("e1", "e2", "employs").with_confidence(1.0));
        assert!(edge_confidence.validate().is_ok());
    }

    #[test]
    fn test_relationship_defaults_to_directed() {
        let rel: NewGraphRelationship = serde_json::from_value(serde_json::json!({
            "source_entity_id": "e1",
            "target_entity_id": "e2",
            "relationship_type": "mentions"
        }))
        .unwrap();
        assert!(rel.is_directed);
        assert_eq!(rel.weight, None);
    }

    #[test]
    fn test_source_type_round_trip() {
        for source in [SourceType::File, SourceType::CollectionGenerated, SourceType::Document] {
            assert_eq!(source.as_str().parse::<SourceType>().unwrap(), source);
        }
    }
}
