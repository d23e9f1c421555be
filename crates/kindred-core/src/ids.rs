//! Dual record identity
//!
//! Every persisted record has a stable internal [`Uuid`] used for all
//! cross-references, and a short [`DisplayId`] shown to external consumers.
//! The display id is a pure function of the uuid (the last eight hex digits of
//! its simple form) and is computed once, when the record is created. Storage
//! backends check it for collisions at write time and draw a new uuid when one
//! is taken.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GraphError;

/// Length of a display id in characters
pub const DISPLAY_ID_LEN: usize = 8;

/// Short, external identifier derived from a record uuid
///
/// # Examples
///
/// ```rust
/// use kindred_core::ids::DisplayId;
/// use uuid::Uuid;
///
/// let uuid = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
/// assert_eq!(DisplayId::derive(&uuid).as_str(), "0e5fe0c8");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayId(String);

impl DisplayId {
    /// Derive the display id for a uuid
    pub fn derive(uuid: &Uuid) -> Self {
        let simple = uuid.simple().to_string();
        Self(simple[simple.len() - DISPLAY_ID_LEN..].to_string())
    }

    /// Parse an externally supplied display id
    pub fn parse(value: &str) -> Result<Self, GraphError> {
        let value = value.trim();
        if value.len() != DISPLAY_ID_LEN || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(GraphError::validation(format!(
                "display id must be {} hex characters, got {:?}",
                DISPLAY_ID_LEN, value
            )));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity pair assigned to a record at creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub uuid: Uuid,
    pub display_id: DisplayId,
}

impl RecordIdentity {
    /// Draw a fresh random identity
    pub fn generate() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            display_id: DisplayId::derive(&uuid),
            uuid,
        }
    }
}

/// Reference to a record by either of its identifiers
///
/// Accepts a full uuid (hyphenated or simple) or an eight character display
/// id, the same lookup rule the external API layer applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordRef {
    Uuid(Uuid),
    Display(DisplayId),
}

impl RecordRef {
    /// The uuid, when the reference carries one
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            RecordRef::Uuid(uuid) => Some(*uuid),
            RecordRef::Display(_) => None,
        }
    }
}

impl From<Uuid> for RecordRef {
    fn from(uuid: Uuid) -> Self {
        RecordRef::Uuid(uuid)
    }
}

impl From<DisplayId> for RecordRef {
    fn from(id: DisplayId) -> Self {
        RecordRef::Display(id)
    }
}

impl FromStr for RecordRef {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() == DISPLAY_ID_LEN {
            return DisplayId::parse(trimmed).map(RecordRef::Display);
        }
        Uuid::parse_str(trimmed)
            .map(RecordRef::Uuid)
            .map_err(|e| GraphError::validation(format!("invalid record reference {:?}: {}", s, e)))
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordRef::Uuid(uuid) => write!(f, "{}", uuid),
            RecordRef::Display(id) => write!(f, "{}", id),
        }
    }
}
