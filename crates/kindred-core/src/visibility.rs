//! Visibility profiles
//!
//! Stored filters over a graph: which entity and relationship types to show
//! and which specific records to hide. Hidden ids may be given as a logical
//! entity id, a uuid or a display id.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collection::{CollectionEntity, ResolvedRelationship};
use crate::error::GraphError;
use crate::ids::DisplayId;

/// Scope a profile applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProfileType {
    File,
    Collection,
    Global,
}

impl ProfileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::File => "FILE",
            ProfileType::Collection => "COLLECTION",
            ProfileType::Global => "GLOBAL",
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FILE" => Ok(ProfileType::File),
            "COLLECTION" => Ok(ProfileType::Collection),
            "GLOBAL" => Ok(ProfileType::Global),
            other => Err(GraphError::validation(format!("unknown profile type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibilityProfile {
    pub uuid: Uuid,
    pub display_id: DisplayId,
    pub name: String,
    pub description: Option<String>,
    pub owner: String,
    pub profile_type: ProfileType,
    pub file_uuid: Option<Uuid>,
    pub collection_uuid: Option<Uuid>,
    /// Empty means every type is visible
    pub visible_entity_types: Vec<String>,
    pub visible_relationship_types: Vec<String>,
    pub hidden_entities: Vec<String>,
    pub hidden_relationships: Vec<String>,
    pub auto_include_new: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VisibilityProfile {
    fn shows_entity(&self, entity: &CollectionEntity, hidden: &HashSet<&str>) -> bool {
        if !self.visible_entity_types.is_empty()
            && !self.visible_entity_types.iter().any(|t| t == &entity.entity_type)
        {
            return false;
        }
        let uuid = entity.uuid.to_string();
        !(hidden.contains(entity.entity_id.as_str())
            || hidden.contains(uuid.as_str())
            || hidden.contains(entity.display_id.as_str()))
    }

    fn shows_relationship(&self, rel: &ResolvedRelationship, hidden: &HashSet<&str>) -> bool {
        let r = &rel.relationship;
        if !self.visible_relationship_types.is_empty()
            && !self.visible_relationship_types.iter().any(|t| t == &r.relationship_type)
        {
            return false;
        }
        let uuid = r.uuid.to_string();
        !(hidden.contains(uuid.as_str()) || hidden.contains(r.display_id.as_str()))
    }

    /// Apply the profile to a graph
    ///
    /// A relationship is only shown when both of its endpoints are.
    pub fn apply(
        &self,
        entities: Vec<CollectionEntity>,
        relationships: Vec<ResolvedRelationship>,
    ) -> (Vec<CollectionEntity>, Vec<ResolvedRelationship>) {
        let hidden_entities: HashSet<&str> = self.hidden_entities.iter().map(String::as_str).collect();
        let hidden_rels: HashSet<&str> =
            self.hidden_relationships.iter().map(String::as_str).collect();

        let entities: Vec<CollectionEntity> = entities
            .into_iter()
            .filter(|e| self.shows_entity(e, &hidden_entities))
            .collect();
        let shown: HashSet<Uuid> = entities.iter().map(|e| e.uuid).collect();

        let relationships = relationships
            .into_iter()
            .filter(|r| shown.contains(&r.source.uuid) && shown.contains(&r.target.uuid))
            .filter(|r| self.shows_relationship(r, &hidden_rels))
            .collect();

        (entities, relationships)
    }
}

/// Input for creating a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVisibilityProfile {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner: String,
    pub profile_type: ProfileType,
    #[serde(default)]
    pub file_uuid: Option<Uuid>,
    #[serde(default)]
    pub collection_uuid: Option<Uuid>,
    #[serde(default)]
    pub visible_entity_types: Vec<String>,
    #[serde(default)]
    pub visible_relationship_types: Vec<String>,
    #[serde(default)]
    pub hidden_entities: Vec<String>,
    #[serde(default)]
    pub hidden_relationships: Vec<String>,
    #[serde(default = "default_auto_include")]
    pub auto_include_new: bool,
}

fn default_auto_include() -> bool {
    true
}

impl NewVisibilityProfile {
    pub fn for_collection(
        name: impl Into<String>,
        owner: impl Into<String>,
        collection_uuid: Uuid,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            owner: owner.into(),
            profile_type: ProfileType::Collection,
            file_uuid: None,
            collection_uuid: Some(collection_uuid),
            visible_entity_types: Vec::new(),
            visible_relationship_types: Vec::new(),
            hidden_entities: Vec::new(),
            hidden_relationships: Vec::new(),
            auto_include_new: true,
        }
    }

    /// The scope pointer must match the profile type
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.name.trim().is_empty() {
            return Err(GraphError::validation("profile name must not be blank"));
        }
        let scoped = match self.profile_type {
            ProfileType::File => self.file_uuid.is_some() && self.collection_uuid.is_none(),
            ProfileType::Collection => self.collection_uuid.is_some() && self.file_uuid.is_none(),
            ProfileType::Global => self.file_uuid.is_none() && self.collection_uuid.is_none(),
        };
        if !scoped {
            return Err(GraphError::validation(format!(
                "{} profile has a mismatched scope",
                self.profile_type
            )));
        }
        Ok(())
    }
}

/// Filtered collection graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphView {
    pub collection_uuid: Uuid,
    /// Profile applied, if any
    pub profile_uuid: Option<Uuid>,
    pub entities: Vec<CollectionEntity>,
    pub relationships: Vec<ResolvedRelationship>,
}
