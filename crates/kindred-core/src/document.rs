//! Source documents
//!
//! Only the fields the graph subsystem depends on: ownership, the extraction
//! status reported by the extraction collaborator, and timestamps.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GraphError;
use crate::ids::DisplayId;

/// Graph extraction status of a document, tracked by the extraction tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Processing => "processing",
            ExtractionStatus::Complete => "complete",
            ExtractionStatus::Error => "error",
        }
    }

    /// Extraction has not finished yet
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ExtractionStatus::Pending | ExtractionStatus::Processing)
    }
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionStatus {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExtractionStatus::Pending),
            "processing" => Ok(ExtractionStatus::Processing),
            "complete" => Ok(ExtractionStatus::Complete),
            "error" => Ok(ExtractionStatus::Error),
            other => Err(GraphError::validation(format!(
                "unknown extraction status: {}",
                other
            ))),
        }
    }
}

/// A source document whose extracted graph feeds collections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub uuid: Uuid,
    pub display_id: DisplayId,
    pub title: String,
    pub filename: Option<String>,
    pub owner: String,
    pub content_hash: Option<String>,
    pub extraction_status: ExtractionStatus,
    pub extraction_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub title: String,
    #[serde(default)]
    pub filename: Option<String>,
    pub owner: String,
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl NewDocument {
    pub fn new(title: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            filename: None,
            owner: owner.into(),
            content_hash: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if self.title.trim().is_empty() {
            return Err(GraphError::validation("document title must not be blank"));
        }
        if self.owner.trim().is_empty() {
            return Err(GraphError::validation("document owner must not be blank"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_status_round_trip() {
        for status in [
            ExtractionStatus::Pending,
            ExtractionStatus::Processing,
            ExtractionStatus::Complete,
            ExtractionStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ExtractionStatus>().unwrap(), status);
        }
        assert!("done".parse::<ExtractionStatus>().is_err());
    }

    #[test]
    fn test_in_flight() {
        assert!(ExtractionStatus::Pending.is_in_flight());
        assert!(ExtractionStatus::Processing.is_in_flight());
        assert!(!ExtractionStatus::Complete.is_in_flight());
        assert!(!ExtractionStatus::Error.is_in_flight());
    }

    #[test]
    fn test_new_document_validation() {
        assert!(NewDocument::new("Annual report", "user:alice").validate().is_ok());
        assert!(NewDocument::new("   ", "user:alice").validate().is_err());
        assert!(NewDocument::new("Annual report", "").validate().is_err());
    }
}
