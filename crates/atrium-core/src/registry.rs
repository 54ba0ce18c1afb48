//! Face identity registry: enrollment and match-by-image against a
//! provider-side face collection.

use crate::storage::{fresh_key, ObjectStore, StorageError};
use crate::types::{FaceIdentity, IdentityKind, IdentityStatus, ReconciliationEntry};
use crate::vision::{ensure_collection, FaceMatch, IndexedFace, VisionError, VisionService};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_SIMILARITY_THRESHOLD: f32 = 85.0;
const DEFAULT_MAX_CANDIDATES: u32 = 5;
const DEFAULT_PERSIST_ATTEMPTS: u32 = 3;
const ENROLL_MAX_FACES: u32 = 1;
const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("configuration incomplete: {0}")]
    Configuration(String),
    #[error("vision provider: {0}")]
    Provider(#[from] VisionError),
    #[error("object store: {0}")]
    Storage(#[from] StorageError),
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
}

/// Persistence for face identities, keyed by `(user_id, collection_id)`.
pub trait IdentityStore: Send + Sync {
    /// Insert or overwrite the row for `(user_id, collection_id)`, returning the stored row.
    fn upsert_identity(&self, identity: &FaceIdentity) -> Result<FaceIdentity, StoreError>;

    fn find_identity(
        &self,
        user_id: i64,
        collection: &str,
    ) -> Result<Option<FaceIdentity>, StoreError>;

    fn find_by_external_id(
        &self,
        collection: &str,
        external_id: &str,
    ) -> Result<Option<FaceIdentity>, StoreError>;

    fn record_reconciliation(&self, entry: &ReconciliationEntry) -> Result<(), StoreError>;
}

/// Storage key prefixes for enrollment and login images.
#[derive(Debug, Clone)]
pub struct KeyPrefixes {
    pub enroll: String,
    pub login: String,
    pub visitor_enroll: String,
    pub visitor_login: String,
}

impl Default for KeyPrefixes {
    fn default() -> Self {
        Self {
            enroll: "faces/enroll/".into(),
            login: "faces/login/".into(),
            visitor_enroll: "faces/visitors/enroll/".into(),
            visitor_login: "faces/visitors/login/".into(),
        }
    }
}

impl KeyPrefixes {
    pub fn enroll_for(&self, kind: IdentityKind) -> &str {
        match kind {
            IdentityKind::Regular => &self.enroll,
            IdentityKind::Visitor => &self.visitor_enroll,
        }
    }

    pub fn login_for(&self, kind: IdentityKind) -> &str {
        match kind {
            IdentityKind::Regular => &self.login,
            IdentityKind::Visitor => &self.visitor_login,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Default face collection.
    pub collection: String,
    /// Minimum provider similarity (0–100) for a search candidate.
    pub similarity_threshold: f32,
    pub max_candidates: u32,
    /// Local persistence attempts after a successful provider enrollment.
    pub persist_attempts: u32,
    pub prefixes: KeyPrefixes,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            collection: "usuarios_faces".into(),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            persist_attempts: DEFAULT_PERSIST_ATTEMPTS,
            prefixes: KeyPrefixes::default(),
        }
    }
}

/// Result of an enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub external_image_id: String,
    pub face_descriptor_id: Option<String>,
    pub storage_key: String,
    pub collection_id: String,
    pub status: IdentityStatus,
    /// Stored row; `None` when local persistence failed and a
    /// reconciliation entry was recorded instead.
    pub identity: Option<FaceIdentity>,
}

impl EnrollOutcome {
    pub fn persisted(&self) -> bool {
        self.identity.is_some()
    }
}

/// Result of a match. A miss is `external_image_id == None`, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatchOutcome {
    pub external_image_id: Option<String>,
    pub similarity: Option<f32>,
    pub storage_key: String,
}

impl FaceMatchOutcome {
    pub fn is_match(&self) -> bool {
        self.external_image_id.is_some()
    }
}

/// Size of a collection plus the first few faces in it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceListing {
    pub collection: String,
    pub count: usize,
    pub faces: Vec<IndexedFace>,
}

/// Pick the highest-similarity candidate. Ties keep the earliest entry.
pub fn best_match(matches: &[FaceMatch]) -> Option<&FaceMatch> {
    let mut best: Option<&FaceMatch> = None;
    for m in matches {
        let is_better = match best {
            None => true,
            Some(prev) => m.similarity > prev.similarity,
        };
        if is_better {
            best = Some(m);
        }
    }
    best
}

pub struct FaceRegistry {
    vision: Arc<dyn VisionService>,
    objects: Arc<dyn ObjectStore>,
    identities: Arc<dyn IdentityStore>,
    config: RegistryConfig,
}

impl FaceRegistry {
    pub fn new(
        vision: Arc<dyn VisionService>,
        objects: Arc<dyn ObjectStore>,
        identities: Arc<dyn IdentityStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            vision,
            objects,
            identities,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    fn check_config(&self, collection: &str) -> Result<(), RegistryError> {
        if self.objects.bucket().trim().is_empty() {
            return Err(RegistryError::Configuration("bucket is not set".into()));
        }
        if collection.trim().is_empty() {
            return Err(RegistryError::Configuration("collection is not set".into()));
        }
        Ok(())
    }

    /// Upload `image`, index it under `external_id = user_id` and persist the identity row.
    pub fn enroll(
        &self,
        user_id: i64,
        image: &[u8],
        collection: &str,
        key_prefix: &str,
        kind: IdentityKind,
    ) -> Result<EnrollOutcome, RegistryError> {
        self.check_config(collection)?;
        ensure_collection(self.vision.as_ref(), collection)?;

        let storage_key = fresh_key(key_prefix, ".jpg");
        self.objects.put(&storage_key, image, IMAGE_CONTENT_TYPE)?;

        let external_image_id = user_id.to_string();
        let records = self.vision.index_face(
            collection,
            &self.objects.object_ref(&storage_key),
            &external_image_id,
            ENROLL_MAX_FACES,
        )?;
        let face_descriptor_id = records.into_iter().next().map(|r| r.descriptor_id);

        let status = if face_descriptor_id.is_some() {
            IdentityStatus::Registered
        } else {
            IdentityStatus::Pending
        };

        tracing::info!(
            user_id,
            collection,
            key = %storage_key,
            status = %status,
            "face enrolled"
        );

        let now = Utc::now();
        let draft = FaceIdentity {
            id: None,
            user_id,
            collection_id: collection.to_string(),
            external_image_id: external_image_id.clone(),
            face_descriptor_id: face_descriptor_id.clone(),
            storage_key: storage_key.clone(),
            status,
            kind,
            created_at: now,
            updated_at: now,
        };
        let identity = self.persist_identity(&draft);

        Ok(EnrollOutcome {
            external_image_id,
            face_descriptor_id,
            storage_key,
            collection_id: collection.to_string(),
            status,
            identity,
        })
    }

    /// Write the identity row, retrying, and fall back to a reconciliation
    /// entry. Never fails the enrollment.
    fn persist_identity(&self, identity: &FaceIdentity) -> Option<FaceIdentity> {
        let attempts = self.config.persist_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.identities.upsert_identity(identity) {
                Ok(row) => return Some(row),
                Err(e) => {
                    tracing::warn!(
                        user_id = identity.user_id,
                        attempt,
                        attempts,
                        error = %e,
                        "identity persistence failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        let entry = ReconciliationEntry {
            user_id: identity.user_id,
            collection_id: identity.collection_id.clone(),
            face_descriptor_id: identity.face_descriptor_id.clone(),
            storage_key: identity.storage_key.clone(),
            reason: last_error,
            created_at: Utc::now(),
        };
        match self.identities.record_reconciliation(&entry) {
            Ok(()) => tracing::warn!(
                user_id = identity.user_id,
                "identity queued for reconciliation"
            ),
            Err(e) => tracing::error!(
                user_id = identity.user_id,
                descriptor = ?identity.face_descriptor_id,
                error = %e,
                "failed to record reconciliation entry"
            ),
        }
        None
    }

    /// Upload a probe image and search the collection.
    pub fn match_face(
        &self,
        image: &[u8],
        collection: &str,
        key_prefix: &str,
    ) -> Result<FaceMatchOutcome, RegistryError> {
        self.check_config(collection)?;
        ensure_collection(self.vision.as_ref(), collection)?;

        let storage_key = fresh_key(key_prefix, ".jpg");
        self.objects.put(&storage_key, image, IMAGE_CONTENT_TYPE)?;

        let matches = self.vision.search_faces(
            collection,
            &self.objects.object_ref(&storage_key),
            self.config.max_candidates,
            self.config.similarity_threshold,
        )?;

        let outcome = match best_match(&matches) {
            Some(best) => FaceMatchOutcome {
                external_image_id: best.external_id.clone(),
                similarity: Some(best.similarity),
                storage_key,
            },
            None => FaceMatchOutcome {
                external_image_id: None,
                similarity: None,
                storage_key,
            },
        };

        tracing::info!(
            collection,
            candidates = matches.len(),
            matched = outcome.is_match(),
            similarity = ?outcome.similarity,
            "face match"
        );
        Ok(outcome)
    }

    /// Map a match back to its identity row.
    ///
    /// Unknown external ids and revoked identities resolve to `None`, the same
    /// as a miss. Store failures propagate.
    pub fn resolve(
        &self,
        outcome: &FaceMatchOutcome,
        collection: &str,
    ) -> Result<Option<FaceIdentity>, RegistryError> {
        let Some(external_id) = outcome.external_image_id.as_deref() else {
            return Ok(None);
        };
        let identity = self.identities.find_by_external_id(collection, external_id)?;
        match identity {
            Some(i) if i.status != IdentityStatus::Revoked => Ok(Some(i)),
            Some(_) => {
                tracing::info!(external_id, "matched identity is revoked");
                Ok(None)
            }
            None => {
                tracing::warn!(external_id, collection, "matched face has no identity row");
                Ok(None)
            }
        }
    }

    pub fn status(
        &self,
        user_id: i64,
        collection: &str,
    ) -> Result<Option<FaceIdentity>, RegistryError> {
        Ok(self.identities.find_identity(user_id, collection)?)
    }

    /// Mark the identity revoked without touching the provider.
    /// Returns `false` when the user has no identity in `collection`.
    pub fn revoke(&self, user_id: i64, collection: &str) -> Result<bool, RegistryError> {
        let Some(mut identity) = self.identities.find_identity(user_id, collection)? else {
            return Ok(false);
        };
        identity.status = IdentityStatus::Revoked;
        identity.updated_at = Utc::now();
        self.identities.upsert_identity(&identity)?;
        tracing::info!(user_id, collection, "identity revoked");
        Ok(true)
    }

    /// Walk every page of the provider collection. A collection that does
    /// not exist yet lists as empty.
    pub fn list_faces(
        &self,
        collection: &str,
        sample: usize,
    ) -> Result<FaceListing, RegistryError> {
        if collection.trim().is_empty() {
            return Err(RegistryError::Configuration("collection is not set".into()));
        }

        let mut count = 0;
        let mut faces = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = match self.vision.list_faces(collection, token.as_deref()) {
                Ok(page) => page,
                Err(VisionError::NotFound(_)) if token.is_none() => break,
                Err(e) => return Err(e.into()),
            };
            count += page.faces.len();
            let room = sample.saturating_sub(faces.len());
            faces.extend(page.faces.into_iter().take(room));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }

        tracing::debug!(collection, count, "collection listed");
        Ok(FaceListing {
            collection: collection.to_string(),
            count,
            faces,
        })
    }

    /// Remove the descriptor from the provider collection and revoke locally.
    pub fn purge_from_provider(
        &self,
        user_id: i64,
        collection: &str,
    ) -> Result<bool, RegistryError> {
        let Some(mut identity) = self.identities.find_identity(user_id, collection)? else {
            return Ok(false);
        };
        if let Some(descriptor) = identity.face_descriptor_id.take() {
            self.vision.delete_faces(collection, &[descriptor])?;
        }
        identity.status = IdentityStatus::Revoked;
        identity.updated_at = Utc::now();
        self.identities.upsert_identity(&identity)?;
        tracing::info!(user_id, collection, "identity purged from provider");
        Ok(true)
    }
}
