use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a stored enum column holds an unknown value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle of an enrolled face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    /// The provider returned a descriptor for the enrollment image.
    Registered,
    /// No face was indexed (none found or quality too low).
    Pending,
    Active,
    /// Soft-deleted; never resolves on match.
    Revoked,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }
}

impl FromStr for IdentityStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Self::Registered),
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            other => Err(UnknownVariant {
                kind: "identity status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an identity belongs to a resident or to a visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    #[default]
    Regular,
    Visitor,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Visitor => "visitor",
        }
    }
}

impl FromStr for IdentityKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(Self::Regular),
            "visitor" => Ok(Self::Visitor),
            other => Err(UnknownVariant {
                kind: "identity kind",
                value: other.to_string(),
            }),
        }
    }
}

/// An application user's enrolled face within one collection.
///
/// `(user_id, collection_id)` is unique; a second enrollment overwrites
/// descriptor, storage key and status in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceIdentity {
    /// Row id, `None` until persisted.
    pub id: Option<i64>,
    pub user_id: i64,
    pub collection_id: String,
    /// Always `user_id.to_string()`; travels through the provider as an opaque label.
    pub external_image_id: String,
    pub face_descriptor_id: Option<String>,
    pub storage_key: String,
    pub status: IdentityStatus,
    pub kind: IdentityKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable marker for an enrollment whose provider side effect succeeded
/// but whose local row could not be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationEntry {
    pub user_id: i64,
    pub collection_id: String,
    pub face_descriptor_id: Option<String>,
    pub storage_key: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// One visitor physical presence, opened by a face login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorSession {
    pub id: i64,
    pub user_id: i64,
    pub login_at: DateTime<Utc>,
    pub logout_at: Option<DateTime<Utc>>,
    pub similarity: f32,
    pub storage_key: String,
    pub event_type: String,
}

impl VisitorSession {
    pub fn is_open(&self) -> bool {
        self.logout_at.is_none()
    }
}

/// Closed set of alert types accepted by persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    DogLoose,
    DogWaste,
    BadParking,
}

impl AlertType {
    pub const ALL: [AlertType; 3] = [Self::DogLoose, Self::DogWaste, Self::BadParking];

    /// Type name written by older releases, now stored as `bad_parking`.
    pub const LEGACY_VEHICLE_SEEN: &'static str = "vehicle_seen";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DogLoose => "dog_loose",
            Self::DogWaste => "dog_waste",
            Self::BadParking => "bad_parking",
        }
    }

    /// Parse a stored type name, mapping the legacy `vehicle_seen` to `BadParking`.
    pub fn from_stored(s: &str) -> Result<Self, UnknownVariant> {
        if s == Self::LEGACY_VEHICLE_SEEN {
            return Ok(Self::BadParking);
        }
        s.parse()
    }
}

impl FromStr for AlertType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "alert type",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert produced by the video pipeline, not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDraft {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub camera_id: Option<String>,
    #[serde(rename = "s3_video_key")]
    pub video_key: String,
    #[serde(rename = "s3_image_key")]
    pub image_key: Option<String>,
    pub timestamp_ms: u64,
    pub confidence: f32,
    pub extra: serde_json::Value,
}

/// A persisted alert row. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    #[serde(flatten)]
    pub draft: AlertDraft,
    pub created_at: DateTime<Utc>,
}

/// A plate number assigned to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plate {
    pub id: i64,
    pub number: String,
    pub user_id: i64,
}

/// Trim and uppercase a plate number.
pub fn normalize_plate(number: &str) -> String {
    number.trim().to_uppercase()
}

/// Location of a blob in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}
