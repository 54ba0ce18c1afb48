//! In-memory doubles for the adapter traits.

use crate::registry::{IdentityStore, StoreError};
use crate::storage::{validate_key, LocalCopy, ObjectStore, StorageError};
use crate::types::{FaceIdentity, ObjectRef, ReconciliationEntry};
use crate::video::{FrameError, FrameExtractor};
use crate::vision::{
    FaceMatch, FacePage, FaceRecord, JobStatus, LabelPage, TextDetection, VisionError,
    VisionService,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Default)]
struct VisionState {
    collections: BTreeSet<String>,
    create_calls: usize,
    describe_error: Option<fn() -> VisionError>,
    create_error: Option<fn() -> VisionError>,
    index_no_face: bool,
    indexed: usize,
    search_results: Vec<FaceMatch>,
    last_search: Option<(u32, f32)>,
    deleted: Vec<String>,
    text: Vec<TextDetection>,
    pages: VecDeque<LabelPage>,
    poll_tokens: Vec<Option<String>>,
    started_min_confidence: Option<f32>,
    face_pages: VecDeque<FacePage>,
    list_tokens: Vec<Option<String>>,
}

#[derive(Default)]
pub struct FakeVision {
    state: Mutex<VisionState>,
}

impl FakeVision {
    pub fn add_collection(&self, name: &str) {
        self.state.lock().unwrap().collections.insert(name.into());
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.state.lock().unwrap().collections.contains(name)
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn set_describe_error(&self, f: fn() -> VisionError) {
        self.state.lock().unwrap().describe_error = Some(f);
    }

    pub fn set_create_error(&self, f: fn() -> VisionError) {
        self.state.lock().unwrap().create_error = Some(f);
    }

    pub fn set_index_yields_no_face(&self, no_face: bool) {
        self.state.lock().unwrap().index_no_face = no_face;
    }

    pub fn set_search_results(&self, results: Vec<FaceMatch>) {
        self.state.lock().unwrap().search_results = results;
    }

    pub fn last_search_params(&self) -> Option<(u32, f32)> {
        self.state.lock().unwrap().last_search
    }

    pub fn deleted_faces(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn set_text_detections(&self, text: Vec<TextDetection>) {
        self.state.lock().unwrap().text = text;
    }

    pub fn push_label_pages(&self, pages: Vec<LabelPage>) {
        self.state.lock().unwrap().pages.extend(pages);
    }

    pub fn push_face_pages(&self, pages: Vec<FacePage>) {
        self.state.lock().unwrap().face_pages.extend(pages);
    }

    pub fn list_tokens(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().list_tokens.clone()
    }

    pub fn poll_tokens(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().poll_tokens.clone()
    }

    pub fn started_min_confidence(&self) -> Option<f32> {
        self.state.lock().unwrap().started_min_confidence
    }
}

impl VisionService for FakeVision {
    fn describe_collection(&self, collection: &str) -> Result<(), VisionError> {
        let s = self.state.lock().unwrap();
        if let Some(f) = s.describe_error {
            return Err(f());
        }
        if s.collections.contains(collection) {
            Ok(())
        } else {
            Err(VisionError::NotFound(collection.into()))
        }
    }

    fn create_collection(&self, collection: &str) -> Result<(), VisionError> {
        let mut s = self.state.lock().unwrap();
        s.create_calls += 1;
        if let Some(f) = s.create_error {
            return Err(f());
        }
        s.collections.insert(collection.into());
        Ok(())
    }

    fn index_face(
        &self,
        _collection: &str,
        _image: &ObjectRef,
        _external_id: &str,
        _max_faces: u32,
    ) -> Result<Vec<FaceRecord>, VisionError> {
        let mut s = self.state.lock().unwrap();
        if s.index_no_face {
            return Ok(Vec::new());
        }
        s.indexed += 1;
        Ok(vec![FaceRecord {
            descriptor_id: format!("face-{}", s.indexed),
        }])
    }

    fn search_faces(
        &self,
        _collection: &str,
        _image: &ObjectRef,
        max_candidates: u32,
        min_similarity: f32,
    ) -> Result<Vec<FaceMatch>, VisionError> {
        let mut s = self.state.lock().unwrap();
        s.last_search = Some((max_candidates, min_similarity));
        Ok(s.search_results.clone())
    }

    fn delete_faces(&self, _collection: &str, descriptor_ids: &[String]) -> Result<(), VisionError> {
        self.state
            .lock()
            .unwrap()
            .deleted
            .extend(descriptor_ids.iter().cloned());
        Ok(())
    }

    fn list_faces(
        &self,
        collection: &str,
        next_token: Option<&str>,
    ) -> Result<FacePage, VisionError> {
        let mut s = self.state.lock().unwrap();
        if !s.collections.contains(collection) {
            return Err(VisionError::NotFound(collection.into()));
        }
        s.list_tokens.push(next_token.map(str::to_string));
        Ok(s.face_pages.pop_front().unwrap_or(FacePage {
            faces: Vec::new(),
            next_token: None,
        }))
    }

    fn detect_text(&self, _image: &ObjectRef) -> Result<Vec<TextDetection>, VisionError> {
        Ok(self.state.lock().unwrap().text.clone())
    }

    fn start_label_detection(
        &self,
        _video: &ObjectRef,
        min_confidence: f32,
    ) -> Result<String, VisionError> {
        self.state.lock().unwrap().started_min_confidence = Some(min_confidence);
        Ok("job-1".into())
    }

    fn get_label_detection(
        &self,
        _job_id: &str,
        next_token: Option<&str>,
    ) -> Result<LabelPage, VisionError> {
        let mut s = self.state.lock().unwrap();
        s.poll_tokens.push(next_token.map(str::to_string));
        Ok(s.pages.pop_front().unwrap_or(LabelPage {
            status: JobStatus::InProgress,
            labels: Vec::new(),
            next_token: None,
        }))
    }
}

pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    local_copies: Mutex<Vec<PathBuf>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Mutex::new(HashMap::new()),
            local_copies: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, key: &str, bytes: &[u8]) {
        self.objects.lock().unwrap().insert(key.into(), bytes.to_vec());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    /// True once every local copy handed out has been deleted.
    pub fn local_copies_removed(&self) -> bool {
        let copies = self.local_copies.lock().unwrap();
        !copies.is_empty() && copies.iter().all(|p| !p.exists())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.insert(key, bytes);
        Ok(())
    }

    fn get_to_local(&self, key: &str) -> Result<LocalCopy, StorageError> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.into()))?;
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&bytes)?;
        let path = file.into_temp_path();
        self.local_copies.lock().unwrap().push(path.to_path_buf());
        Ok(LocalCopy::new(path))
    }

    fn presigned_read_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError> {
        Ok(format!("mem://{}/{key}?ttl={ttl_secs}", self.bucket))
    }
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    rows: Mutex<Vec<FaceIdentity>>,
    fail_upserts: Mutex<u32>,
    reconciliations: Mutex<Vec<ReconciliationEntry>>,
}

impl MemoryIdentityStore {
    pub fn fail_next_upserts(&self, n: u32) {
        *self.fail_upserts.lock().unwrap() = n;
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn reconciliations(&self) -> Vec<ReconciliationEntry> {
        self.reconciliations.lock().unwrap().clone()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn upsert_identity(&self, identity: &FaceIdentity) -> Result<FaceIdentity, StoreError> {
        {
            let mut fail = self.fail_upserts.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(StoreError::Backend("database is locked".into()));
            }
        }
        let mut rows = self.rows.lock().unwrap();
        let existing = rows.iter_mut().find(|r| {
            r.user_id == identity.user_id && r.collection_id == identity.collection_id
        });
        let stored = match existing {
            Some(row) => {
                let created_at = row.created_at;
                let id = row.id;
                *row = FaceIdentity {
                    id,
                    created_at,
                    ..identity.clone()
                };
                row.clone()
            }
            None => {
                let row = FaceIdentity {
                    id: Some(rows.len() as i64 + 1),
                    ..identity.clone()
                };
                rows.push(row.clone());
                row
            }
        };
        Ok(stored)
    }

    fn find_identity(
        &self,
        user_id: i64,
        collection: &str,
    ) -> Result<Option<FaceIdentity>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.user_id == user_id && r.collection_id == collection)
            .cloned())
    }

    fn find_by_external_id(
        &self,
        collection: &str,
        external_id: &str,
    ) -> Result<Option<FaceIdentity>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.external_image_id == external_id && r.collection_id == collection)
            .cloned())
    }

    fn record_reconciliation(&self, entry: &ReconciliationEntry) -> Result<(), StoreError> {
        self.reconciliations.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFrames {
    calls: Mutex<Vec<u64>>,
    failing: Mutex<HashSet<u64>>,
}

impl FakeFrames {
    pub fn fail_at(&self, timestamp_ms: u64) {
        self.failing.lock().unwrap().insert(timestamp_ms);
    }

    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

impl FrameExtractor for FakeFrames {
    fn extract_jpeg(&self, video: &Path, timestamp_ms: u64) -> Result<Vec<u8>, FrameError> {
        self.calls.lock().unwrap().push(timestamp_ms);
        if !video.exists() {
            return Err(FrameError::Unavailable("video missing".into()));
        }
        if self.failing.lock().unwrap().contains(&timestamp_ms) {
            return Err(FrameError::OutOfRange {
                frame_index: timestamp_ms,
            });
        }
        Ok(vec![0xFF, 0xD8, 0xFF, 0xD9])
    }
}
