//! Vision provider contract: face collections, text detection and
//! asynchronous video label detection.

use crate::types::ObjectRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("resource already exists: {0}")]
    AlreadyExists(String),
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
}

/// One face indexed into a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub descriptor_id: String,
}

/// One candidate returned by a face search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub descriptor_id: String,
    /// External identity label attached at indexing time, if any.
    pub external_id: Option<String>,
    /// Similarity in [0, 100].
    pub similarity: f32,
}

/// A face stored in a collection, as listed by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedFace {
    pub descriptor_id: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

/// One page of a collection listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacePage {
    #[serde(default)]
    pub faces: Vec<IndexedFace>,
    #[serde(default)]
    pub next_token: Option<String>,
}

/// Granularity of a text detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextKind {
    Word,
    Line,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDetection {
    pub text: String,
    pub confidence: f32,
    pub kind: TextKind,
}

/// Status reported by the provider for a label-detection job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A label seen at a video timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelObservation {
    pub timestamp_ms: u64,
    pub name: String,
    pub confidence: f32,
}

/// One poll result: status plus a (possibly partial) page of labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelPage {
    pub status: JobStatus,
    #[serde(default)]
    pub labels: Vec<LabelObservation>,
    #[serde(default)]
    pub next_token: Option<String>,
}

/// Blocking vision provider. Implementations must be shareable across threads.
pub trait VisionService: Send + Sync {
    /// `Err(VisionError::NotFound)` when the collection does not exist.
    fn describe_collection(&self, collection: &str) -> Result<(), VisionError>;

    /// `Err(VisionError::AlreadyExists)` when another caller created it first.
    fn create_collection(&self, collection: &str) -> Result<(), VisionError>;

    fn index_face(
        &self,
        collection: &str,
        image: &ObjectRef,
        external_id: &str,
        max_faces: u32,
    ) -> Result<Vec<FaceRecord>, VisionError>;

    fn search_faces(
        &self,
        collection: &str,
        image: &ObjectRef,
        max_candidates: u32,
        min_similarity: f32,
    ) -> Result<Vec<FaceMatch>, VisionError>;

    fn delete_faces(&self, collection: &str, descriptor_ids: &[String]) -> Result<(), VisionError>;

    /// One page of the faces stored in `collection`; `next_token` continues a listing.
    fn list_faces(
        &self,
        collection: &str,
        next_token: Option<&str>,
    ) -> Result<FacePage, VisionError>;

    fn detect_text(&self, image: &ObjectRef) -> Result<Vec<TextDetection>, VisionError>;

    /// Start an asynchronous label-detection job, returning its id.
    fn start_label_detection(
        &self,
        video: &ObjectRef,
        min_confidence: f32,
    ) -> Result<String, VisionError>;

    fn get_label_detection(
        &self,
        job_id: &str,
        next_token: Option<&str>,
    ) -> Result<LabelPage, VisionError>;
}

/// Create `collection` if it does not exist.
///
/// Only `NotFound` from the describe call leads to a create; any other
/// describe error propagates. `AlreadyExists` from the create call means a
/// concurrent caller won the race and counts as success.
pub fn ensure_collection(vision: &dyn VisionService, collection: &str) -> Result<(), VisionError> {
    match vision.describe_collection(collection) {
        Ok(()) => Ok(()),
        Err(VisionError::NotFound(_)) => match vision.create_collection(collection) {
            Ok(()) => {
                tracing::info!(collection, "face collection created");
                Ok(())
            }
            Err(VisionError::AlreadyExists(_)) => {
                tracing::debug!(collection, "face collection created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    }
}
