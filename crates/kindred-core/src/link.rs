//! Entity links
//!
//! An [`EntityLink`] records that a source graph entity probably denotes the
//! same thing as a collection entity. Links are proposals until confirmed;
//! confirming one drives a merge.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GraphError;
use crate::ids::DisplayId;

/// Upper bound of a link confidence score
pub const MAX_LINK_CONFIDENCE: i64 = 100;

/// How a link was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    ExactMatch,
    FuzzyMatch,
    Manual,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::ExactMatch => "exact_match",
            LinkType::FuzzyMatch => "fuzzy_match",
            LinkType::Manual => "manual",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact_match" | "exact" => Ok(LinkType::ExactMatch),
            "fuzzy_match" | "fuzzy" => Ok(LinkType::FuzzyMatch),
            "manual" => Ok(LinkType::Manual),
            other => Err(GraphError::validation(format!("unknown link type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLink {
    pub uuid: Uuid,
    pub display_id: DisplayId,
    pub collection_uuid: Uuid,
    pub graph_entity_uuid: Option<Uuid>,
    pub collection_entity_uuid: Option<Uuid>,
    pub entity_type: Option<String>,
    /// 0-100
    pub confidence_score: Option<i64>,
    pub link_type: Option<LinkType>,
    pub is_active: bool,
    /// Collection entity produced when this link was confirmed
    pub merged_entity_uuid: Option<Uuid>,
    pub common_name: Option<String>,
    pub description: Option<String>,
    pub created_by_tool: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Insertion order, the final tie-break between equal proposals
    #[serde(default)]
    pub sequence: i64,
}

impl EntityLink {
    /// A confirmed link has produced a merge
    pub fn is_confirmed(&self) -> bool {
        self.merged_entity_uuid.is_some()
    }
}

/// Order links best candidate first
///
/// Higher confidence wins; among equal confidence the earliest proposal wins.
/// Missing scores rank below any score.
pub fn candidate_order(a: &EntityLink, b: &EntityLink) -> Ordering {
    b.confidence_score
        .cmp(&a.confidence_score)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.sequence.cmp(&b.sequence))
}

/// Input for proposing a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkProposal {
    pub collection_uuid: Uuid,
    pub graph_entity_uuid: Uuid,
    #[serde(default)]
    pub collection_entity_uuid: Option<Uuid>,
    pub confidence_score: i64,
    pub link_type: LinkType,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by_tool: Option<String>,
    pub performed_by: String,
}

impl LinkProposal {
    pub fn new(
        collection_uuid: Uuid,
        graph_entity_uuid: Uuid,
        collection_entity_uuid: Option<Uuid>,
        confidence_score: i64,
        link_type: LinkType,
        performed_by: impl Into<String>,
    ) -> Self {
        Self {
            collection_uuid,
            graph_entity_uuid,
            collection_entity_uuid,
            confidence_score,
            link_type,
            common_name: None,
            description: None,
            created_by_tool: None,
            performed_by: performed_by.into(),
        }
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if !(0..=MAX_LINK_CONFIDENCE).contains(&self.confidence_score) {
            return Err(GraphError::validation(format!(
                "link confidence must be within 0..={}, got {}",
                MAX_LINK_CONFIDENCE, self.confidence_score
            )));
        }
        if self.performed_by.trim().is_empty() {
            return Err(GraphError::validation("performed_by must not be blank"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RecordIdentity;
    use chrono::Duration;

    fn link(confidence: Option<i64>, age_secs: i64, sequence: i64) -> EntityLink {
        let identity = RecordIdentity::generate();
        let created_at = Utc::now() - Duration::seconds(age_secs);
        EntityLink {
            uuid: identity.uuid,
            display_id: identity.display_id,
            collection_uuid: Uuid::nil(),
            graph_entity_uuid: Some(Uuid::nil()),
            collection_entity_uuid: Some(Uuid::new_v4()),
            entity_type: None,
            confidence_score: confidence,
            link_type: Some(LinkType::FuzzyMatch),
            is_active: true,
            merged_entity_uuid: None,
            common_name: None,
            description: None,
            created_by_tool: None,
            created_at,
            updated_at: created_at,
            sequence,
        }
    }

    #[test]
    fn test_higher_confidence_first() {
        let mut links = vec![link(Some(40), 10, 1), link(Some(92), 0, 2), link(None, 100, 3)];
        links.sort_by(candidate_order);
        let scores: Vec<_> = links.iter().map(|l| l.confidence_score).collect();
        assert_eq!(scores, vec![Some(92), Some(40), None]);
    }

    #[test]
    fn test_earliest_proposal_wins_ties() {
        let older = link(Some(80), 60, 5);
        let newer = link(Some(80), 1, 1);
        let mut links = vec![newer.clone(), older.clone()];
        links.sort_by(candidate_order);
        assert_eq!(links[0].uuid, older.uuid);
    }

    #[test]
    fn test_sequence_breaks_identical_timestamps() {
        let first = link(Some(80), 0, 1);
        let mut second = link(Some(80), 0, 2);
        second.created_at = first.created_at;
        let mut links = vec![second.clone(), first.clone()];
        links.sort_by(candidate_order);
        assert_eq!(links[0].uuid, first.uuid);
    }

    #[test]
    fn test_proposal_confidence_bounds() {
        let mut proposal = LinkProposal::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            92,
            LinkType::FuzzyMatch,
            "user:alice",
        );
        assert!(proposal.validate().is_ok());

        proposal.confidence_score = 101;
        assert!(proposal.validate().is_err());

        proposal.confidence_score = -1;
        assert!(proposal.validate().is_err());
    }

    #[test]
    fn test_link_type_aliases() {
        assert_eq!("fuzzy".parse::<LinkType>().unwrap(), LinkType::FuzzyMatch);
        assert_eq!("exact_match".parse::<LinkType>().unwrap(), LinkType::ExactMatch);
        assert!("guess".parse::<LinkType>().is_err());
    }
}
