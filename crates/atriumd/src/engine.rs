use crate::store::{SessionQuery, SessionStats, Store};
use atrium_core::plate::{PlateError, PlateReader, PlateReading};
use atrium_core::registry::{EnrollOutcome, FaceListing, FaceMatchOutcome};
use atrium_core::storage::{content_type, fresh_key};
use atrium_core::video::VideoError;
use atrium_core::{
    Alert, CancelToken, FaceIdentity, FaceRegistry, IdentityKind, IdentityStore, ObjectStore,
    Plate, RegistryError, StorageError, StoreError, VideoEventDetector, VisitorSession,
};
use atrium_io::{verify_signature, FsObjectStore, SignedUrlParams};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const FACE_DEBUG_SAMPLE: usize = 5;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Plate(#[from] PlateError),
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("video queue is full")]
    Busy,
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker task failed: {0}")]
    Join(String),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Everything a request needs, shared by the HTTP layer and the video workers.
pub struct Services {
    pub registry: FaceRegistry,
    pub plates: PlateReader,
    pub video: VideoEventDetector,
    pub store: Arc<Store>,
    pub media: Arc<FsObjectStore>,
    pub evidence: Arc<FsObjectStore>,
    pub presign_ttl_secs: u64,
    pub alerts_limit: u32,
    pub frames_available: bool,
}

/// Result of a face login: the raw match plus the identity it resolved to.
#[derive(Debug, Serialize)]
pub struct FaceLogin {
    #[serde(flatten)]
    pub outcome: FaceMatchOutcome,
    pub identity: Option<FaceIdentity>,
}

#[derive(Debug, Serialize)]
pub struct VideoOutcome {
    pub video_key: String,
    pub alerts: Vec<Alert>,
}

struct VideoJob {
    video_key: String,
    camera_id: Option<String>,
    reply: oneshot::Sender<Result<Vec<Alert>, EngineError>>,
}

/// Clone-safe handle to the services and the video workers.
#[derive(Clone)]
pub struct EngineHandle {
    services: Arc<Services>,
    video_tx: mpsc::Sender<VideoJob>,
}

/// Join handles for the video worker threads.
pub struct VideoWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl VideoWorkers {
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("video worker panicked");
            }
        }
    }
}

impl EngineHandle {
    /// Run a blocking closure against the services on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Services) -> Result<T, EngineError> + Send + 'static,
    {
        let services = Arc::clone(&self.services);
        tokio::task::spawn_blocking(move || f(&services))
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?
    }

    pub async fn enroll(
        &self,
        user_id: i64,
        image: Vec<u8>,
        kind: IdentityKind,
    ) -> Result<EnrollOutcome, EngineError> {
        self.blocking(move |s| {
            let collection = s.registry.collection().to_string();
            let prefix = s.registry.config().prefixes.enroll_for(kind).to_string();
            Ok(s.registry.enroll(user_id, &image, &collection, &prefix, kind)?)
        })
        .await
    }

    /// Match a probe image and resolve it to a live identity.
    pub async fn face_login(
        &self,
        image: Vec<u8>,
        kind: IdentityKind,
    ) -> Result<FaceLogin, EngineError> {
        self.blocking(move |s| login(s, &image, kind)).await
    }

    pub async fn face_status(&self, user_id: i64) -> Result<Option<FaceIdentity>, EngineError> {
        self.blocking(move |s| Ok(s.registry.status(user_id, s.registry.collection())?))
            .await
    }

    /// Face count of the configured collection with a small sample of its entries.
    pub async fn face_debug(&self) -> Result<FaceListing, EngineError> {
        self.blocking(|s| {
            let listing = s.registry.list_faces(s.registry.collection(), FACE_DEBUG_SAMPLE)?;
            Ok(listing)
        })
        .await
    }

    /// Revoke locally, or also delete the descriptor from the provider when `purge` is set.
    pub async fn revoke(&self, user_id: i64, purge: bool) -> Result<bool, EngineError> {
        self.blocking(move |s| {
            let collection = s.registry.collection();
            let done = if purge {
                s.registry.purge_from_provider(user_id, collection)?
            } else {
                s.registry.revoke(user_id, collection)?
            };
            Ok(done)
        })
        .await
    }

    /// Face login restricted to visitors; opens a session on success.
    pub async fn visitor_login(
        &self,
        image: Vec<u8>,
    ) -> Result<(FaceIdentity, VisitorSession), EngineError> {
        self.blocking(move |s| {
            let result = login(s, &image, IdentityKind::Visitor)?;
            let Some(identity) = result.identity else {
                return Err(EngineError::NotFound("NOT_VISITOR".into()));
            };
            if identity.kind != IdentityKind::Visitor {
                return Err(EngineError::Forbidden("NOT_VISITOR".into()));
            }
            let session = s.store.open_session(
                identity.user_id,
                result.outcome.similarity.unwrap_or(0.0),
                &result.outcome.storage_key,
                Utc::now(),
            )?;
            tracing::info!(user_id = identity.user_id, session = session.id, "visitor session opened");
            Ok((identity, session))
        })
        .await
    }

    pub async fn visitor_logout(&self, user_id: i64) -> Result<VisitorSession, EngineError> {
        self.blocking(move |s| {
            let identity = s
                .store
                .find_identity(user_id, s.registry.collection())?
                .ok_or_else(|| EngineError::NotFound(format!("user {user_id} is not enrolled")))?;
            if identity.kind != IdentityKind::Visitor {
                return Err(EngineError::Forbidden(format!("user {user_id} is not a visitor")));
            }
            let session = s.store.close_latest_session(user_id, Utc::now())?;
            tracing::info!(user_id, session = session.id, "visitor session closed");
            Ok(session)
        })
        .await
    }

    pub async fn visitor_status(&self, user_id: i64) -> Result<Option<VisitorSession>, EngineError> {
        self.blocking(move |s| Ok(s.store.last_session(user_id)?)).await
    }

    pub async fn sessions(&self, query: SessionQuery) -> Result<Vec<VisitorSession>, EngineError> {
        self.blocking(move |s| Ok(s.store.list_sessions(&query)?)).await
    }

    pub async fn session_stats(&self) -> Result<SessionStats, EngineError> {
        self.blocking(|s| Ok(s.store.session_stats(Utc::now())?)).await
    }

    pub async fn detect_plate(&self, image: Vec<u8>) -> Result<PlateReading, EngineError> {
        self.blocking(move |s| Ok(s.plates.detect(&image)?)).await
    }

    pub async fn assign_plate(&self, user_id: i64, number: String) -> Result<Plate, EngineError> {
        self.blocking(move |s| Ok(s.store.assign_plate(user_id, &number)?))
            .await
    }

    pub async fn verify_plate(&self, number: String) -> Result<bool, EngineError> {
        self.blocking(move |s| Ok(s.store.verify_plate(&number)?)).await
    }

    /// Store the upload, then run the label pipeline on a video worker and persist its alerts.
    pub async fn process_video(
        &self,
        bytes: Vec<u8>,
        extension: String,
        camera_id: Option<String>,
    ) -> Result<VideoOutcome, EngineError> {
        let video_key = self
            .blocking(move |s| {
                let key = fresh_key("videos/", &extension);
                s.media.put(&key, &bytes, content_type(&key))?;
                Ok(key)
            })
            .await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = self.video_tx.try_send(VideoJob {
            video_key: video_key.clone(),
            camera_id,
            reply: reply_tx,
        });
        if let Err(e) = queued {
            let err = match e {
                mpsc::error::TrySendError::Full(_) => EngineError::Busy,
                mpsc::error::TrySendError::Closed(_) => EngineError::ChannelClosed,
            };
            // The upload is never analysed, so it must not linger in the bucket.
            let key = video_key.clone();
            let removed = self.blocking(move |s| Ok(s.media.delete(&key)?)).await;
            if let Err(e) = removed {
                tracing::warn!(key = %video_key, error = %e, "failed to remove rejected upload");
            }
            return Err(err);
        }

        let alerts = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
        Ok(VideoOutcome { video_key, alerts })
    }

    pub async fn alerts(&self) -> Result<Vec<Alert>, EngineError> {
        self.blocking(|s| Ok(s.store.list_alerts(s.alerts_limit)?)).await
    }

    /// Signed read URL for a media object.
    pub fn media_url(&self, key: &str) -> Result<String, EngineError> {
        let s = &self.services;
        Ok(s.media.presigned_read_url(key, s.presign_ttl_secs)?)
    }

    /// Bytes behind a signed URL, after checking its signature and expiry.
    pub async fn read_signed(
        &self,
        bucket: String,
        key: String,
        params: SignedUrlParams,
    ) -> Result<Vec<u8>, EngineError> {
        self.blocking(move |s| {
            let store = [&s.media, &s.evidence]
                .into_iter()
                .find(|store| store.bucket() == bucket)
                .ok_or_else(|| EngineError::NotFound(format!("unknown bucket {bucket}")))?;
            if !verify_signature(store.secret(), &bucket, &key, &params, Utc::now().timestamp()) {
                return Err(EngineError::Forbidden("invalid or expired signature".into()));
            }
            Ok(store.read(&key)?)
        })
        .await
    }

    pub async fn status(&self) -> Result<serde_json::Value, EngineError> {
        self.blocking(|s| {
            let pending = s.store.list_reconciliations()?.len();
            Ok(serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "collection": s.registry.collection(),
                "media_bucket": s.media.bucket(),
                "alerts_bucket": s.evidence.bucket(),
                "frame_extraction": s.frames_available,
                "pending_reconciliations": pending,
            }))
        })
        .await
    }
}

fn login(s: &Services, image: &[u8], kind: IdentityKind) -> Result<FaceLogin, EngineError> {
    let collection = s.registry.collection();
    let prefix = s.registry.config().prefixes.login_for(kind);
    let outcome = s.registry.match_face(image, collection, prefix)?;
    let identity = s.registry.resolve(&outcome, collection)?;
    Ok(FaceLogin { outcome, identity })
}

fn run_video_job(
    services: &Services,
    job: &VideoJob,
    cancel: &CancelToken,
    timeout: Duration,
) -> Result<Vec<Alert>, EngineError> {
    let deadline = Instant::now() + timeout;
    let drafts = services.video.process(
        &job.video_key,
        job.camera_id.as_deref(),
        cancel,
        Some(deadline),
    )?;
    Ok(services.store.insert_alerts(&drafts, Utc::now())?)
}

/// Spawn `workers` dedicated video threads behind a bounded queue.
///
/// Each job runs under `timeout` and the shared `cancel` token. Workers exit
/// once every [`EngineHandle`] is dropped and the queue drains.
pub fn spawn_engine(
    services: Services,
    workers: usize,
    queue: usize,
    timeout: Duration,
    cancel: CancelToken,
) -> Result<(EngineHandle, VideoWorkers), EngineError> {
    let services = Arc::new(services);
    let (tx, rx) = mpsc::channel::<VideoJob>(queue.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let mut handles = Vec::with_capacity(workers.max(1));
    for index in 0..workers.max(1) {
        let services = Arc::clone(&services);
        let rx = Arc::clone(&rx);
        let cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(format!("atrium-video-{index}"))
            .spawn(move || {
                tracing::info!(worker = index, "video worker started");
                loop {
                    // Only the receive is serialized; jobs run in parallel.
                    let job = match rx.lock() {
                        Ok(mut rx) => rx.blocking_recv(),
                        Err(_) => None,
                    };
                    let Some(job) = job else { break };

                    tracing::info!(worker = index, key = %job.video_key, "video job started");
                    let result = run_video_job(&services, &job, &cancel, timeout);
                    if let Err(e) = &result {
                        tracing::warn!(worker = index, key = %job.video_key, error = %e, "video job failed");
                    }
                    let _ = job.reply.send(result);
                }
                tracing::info!(worker = index, "video worker exiting");
            })?;
        handles.push(handle);
    }

    Ok((
        EngineHandle {
            services,
            video_tx: tx,
        },
        VideoWorkers { handles },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_core::plate::PlateConfig;
    use atrium_core::registry::RegistryConfig;
    use atrium_core::video::{PollPolicy, VideoConfig};
    use atrium_core::vision::{
        FaceMatch, FacePage, FaceRecord, IndexedFace, JobStatus, LabelObservation, LabelPage,
        TextDetection, TextKind,
    };
    use atrium_core::{IdentityStatus, ObjectRef, VisionError, VisionService};
    use std::sync::Mutex as StdMutex;

    /// Vision stand-in: one collection, scripted search results and label pages.
    #[derive(Default)]
    pub(crate) struct ScriptedVision {
        pub matches: StdMutex<Vec<FaceMatch>>,
        pub text: StdMutex<Vec<TextDetection>>,
        pub labels: StdMutex<Option<LabelPage>>,
        pub faces: StdMutex<Vec<IndexedFace>>,
    }

    impl VisionService for ScriptedVision {
        fn describe_collection(&self, _: &str) -> Result<(), VisionError> {
            Ok(())
        }
        fn create_collection(&self, _: &str) -> Result<(), VisionError> {
            Ok(())
        }
        fn index_face(
            &self,
            _: &str,
            _: &ObjectRef,
            external_id: &str,
            _: u32,
        ) -> Result<Vec<FaceRecord>, VisionError> {
            Ok(vec![FaceRecord {
                descriptor_id: format!("face-{external_id}"),
            }])
        }
        fn search_faces(
            &self,
            _: &str,
            _: &ObjectRef,
            _: u32,
            _: f32,
        ) -> Result<Vec<FaceMatch>, VisionError> {
            Ok(self.matches.lock().unwrap().clone())
        }
        fn delete_faces(&self, _: &str, _: &[String]) -> Result<(), VisionError> {
            Ok(())
        }
        fn list_faces(&self, _: &str, _: Option<&str>) -> Result<FacePage, VisionError> {
            Ok(FacePage {
                faces: self.faces.lock().unwrap().clone(),
                next_token: None,
            })
        }
        fn detect_text(&self, _: &ObjectRef) -> Result<Vec<TextDetection>, VisionError> {
            Ok(self.text.lock().unwrap().clone())
        }
        fn start_label_detection(&self, _: &ObjectRef, _: f32) -> Result<String, VisionError> {
            Ok("job-1".into())
        }
        fn get_label_detection(&self, _: &str, _: Option<&str>) -> Result<LabelPage, VisionError> {
            Ok(self.labels.lock().unwrap().clone().unwrap_or(LabelPage {
                status: JobStatus::Failed,
                labels: vec![],
                next_token: None,
            }))
        }
    }

    pub(crate) struct Harness {
        pub engine: EngineHandle,
        pub workers: VideoWorkers,
        pub vision: Arc<ScriptedVision>,
        pub _dir: tempfile::TempDir,
    }

    fn test_services(root: &std::path::Path, vision: Arc<ScriptedVision>) -> Services {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let media = Arc::new(FsObjectStore::new(root, "condo-media", "http://test", "k"));
        let evidence = Arc::new(FsObjectStore::new(root, "condo-alerts", "http://test", "k"));

        Services {
            registry: FaceRegistry::new(
                vision.clone(),
                media.clone(),
                store.clone(),
                RegistryConfig::default(),
            ),
            plates: PlateReader::new(vision.clone(), media.clone(), PlateConfig::default()),
            video: VideoEventDetector::new(
                vision.clone(),
                media.clone(),
                evidence.clone(),
                None,
                VideoConfig {
                    poll: PollPolicy {
                        interval: Duration::ZERO,
                        max_attempts: 3,
                    },
                    ..VideoConfig::default()
                },
            ),
            store,
            media,
            evidence,
            presign_ttl_secs: 60,
            alerts_limit: 50,
            frames_available: false,
        }
    }

    pub(crate) fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let vision = Arc::new(ScriptedVision::default());
        let services = test_services(dir.path(), vision.clone());
        let (engine, workers) =
            spawn_engine(services, 1, 2, Duration::from_secs(30), CancelToken::new()).unwrap();
        Harness {
            engine,
            workers,
            vision,
            _dir: dir,
        }
    }

    pub(crate) fn hit(user_id: i64, similarity: f32) -> FaceMatch {
        FaceMatch {
            descriptor_id: format!("face-{user_id}"),
            external_id: Some(user_id.to_string()),
            similarity,
        }
    }

    #[tokio::test]
    async fn test_enroll_then_login_resolves_identity() {
        let h = harness();
        h.engine
            .enroll(42, b"jpeg".to_vec(), IdentityKind::Regular)
            .await
            .unwrap();
        *h.vision.matches.lock().unwrap() = vec![hit(42, 97.0)];

        let login = h
            .engine
            .face_login(b"probe".to_vec(), IdentityKind::Regular)
            .await
            .unwrap();

        assert_eq!(login.identity.unwrap().user_id, 42);
        assert!(login.outcome.storage_key.starts_with("faces/login/"));
    }

    #[tokio::test]
    async fn test_face_debug_samples_collection() {
        let h = harness();
        *h.vision.faces.lock().unwrap() = (1..=7)
            .map(|n| IndexedFace {
                descriptor_id: format!("face-{n}"),
                external_id: Some(n.to_string()),
            })
            .collect();

        let listing = h.engine.face_debug().await.unwrap();

        assert_eq!(listing.collection, RegistryConfig::default().collection);
        assert_eq!(listing.count, 7);
        assert_eq!(listing.faces.len(), FACE_DEBUG_SAMPLE);
        assert_eq!(listing.faces[0].descriptor_id, "face-1");
    }

    #[tokio::test]
    async fn test_login_after_revoke_is_miss() {
        let h = harness();
        h.engine
            .enroll(3, b"jpeg".to_vec(), IdentityKind::Regular)
            .await
            .unwrap();
        *h.vision.matches.lock().unwrap() = vec![hit(3, 99.0)];

        assert!(h.engine.revoke(3, false).await.unwrap());
        let login = h
            .engine
            .face_login(b"probe".to_vec(), IdentityKind::Regular)
            .await
            .unwrap();

        assert!(login.identity.is_none());
        let status = h.engine.face_status(3).await.unwrap().unwrap();
        assert_eq!(status.status, IdentityStatus::Revoked);
    }

    #[tokio::test]
    async fn test_visitor_login_requires_visitor_identity() {
        let h = harness();
        h.engine
            .enroll(10, b"resident".to_vec(), IdentityKind::Regular)
            .await
            .unwrap();
        h.engine
            .enroll(11, b"visitor".to_vec(), IdentityKind::Visitor)
            .await
            .unwrap();

        *h.vision.matches.lock().unwrap() = vec![hit(10, 95.0)];
        let err = h.engine.visitor_login(b"probe".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        *h.vision.matches.lock().unwrap() = vec![];
        let err = h.engine.visitor_login(b"probe".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        *h.vision.matches.lock().unwrap() = vec![hit(11, 95.0)];
        let (identity, session) = h.engine.visitor_login(b"probe".to_vec()).await.unwrap();
        assert_eq!(identity.user_id, 11);
        assert!(session.is_open());
        assert!(session.storage_key.starts_with("faces/visitors/login/"));

        let closed = h.engine.visitor_logout(11).await.unwrap();
        assert_eq!(closed.id, session.id);
        assert!(matches!(
            h.engine.visitor_logout(10).await.unwrap_err(),
            EngineError::Forbidden(_)
        ));
        assert!(matches!(
            h.engine.visitor_logout(99).await.unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_plate_detect_and_assign() {
        let h = harness();
        *h.vision.text.lock().unwrap() = vec![TextDetection {
            text: "2345XYZ".into(),
            confidence: 97.0,
            kind: TextKind::Word,
        }];

        let reading = h.engine.detect_plate(b"jpeg".to_vec()).await.unwrap();
        assert_eq!(reading.plate.as_deref(), Some("2345XYZ"));

        h.engine.assign_plate(4, "2345xyz".into()).await.unwrap();
        assert!(h.engine.verify_plate("2345XYZ".into()).await.unwrap());
        assert!(matches!(
            h.engine.assign_plate(4, "2345XYZ".into()).await.unwrap_err(),
            EngineError::Store(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_video_job_persists_alerts() {
        let h = harness();
        *h.vision.labels.lock().unwrap() = Some(LabelPage {
            status: JobStatus::Succeeded,
            labels: vec![
                LabelObservation {
                    timestamp_ms: 0,
                    name: "Dog".into(),
                    confidence: 95.0,
                },
                LabelObservation {
                    timestamp_ms: 0,
                    name: "Car".into(),
                    confidence: 95.0,
                },
            ],
            next_token: None,
        });

        let outcome = h
            .engine
            .process_video(b"mp4".to_vec(), ".mp4".into(), Some("cam1".into()))
            .await
            .unwrap();

        assert!(outcome.video_key.starts_with("videos/"));
        assert!(outcome.video_key.ends_with(".mp4"));
        assert_eq!(outcome.alerts.len(), 2);
        assert_eq!(h.engine.alerts().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_video_job_stores_nothing() {
        let h = harness();
        let err = h
            .engine
            .process_video(b"mp4".to_vec(), ".mp4".into(), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Video(VideoError::JobFailed { .. })
        ));
        assert!(h.engine.alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_busy_queue_discards_upload() {
        let dir = tempfile::tempdir().unwrap();
        let services = test_services(dir.path(), Arc::new(ScriptedVision::default()));
        // No worker drains this queue, so the single slot stays taken.
        let (video_tx, _video_rx) = mpsc::channel(1);
        let (reply, _) = oneshot::channel();
        let filler = VideoJob {
            video_key: "videos/queued.mp4".into(),
            camera_id: None,
            reply,
        };
        assert!(video_tx.try_send(filler).is_ok());
        let engine = EngineHandle {
            services: Arc::new(services),
            video_tx,
        };

        let err = engine
            .process_video(b"webm".to_vec(), ".webm".into(), Some("gate".into()))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Busy));
        let left = std::fs::read_dir(dir.path().join("condo-media/videos"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn test_signed_media_roundtrip() {
        let h = harness();
        let reading = h.engine.detect_plate(b"plate-bytes".to_vec()).await.unwrap();
        let url = h.engine.media_url(&reading.storage_key).unwrap();

        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut signature = String::new();
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", v) => expires = v.parse().unwrap(),
                ("signature", v) => signature = v.to_string(),
                _ => {}
            }
        }

        let bytes = h
            .engine
            .read_signed(
                "condo-media".into(),
                reading.storage_key.clone(),
                SignedUrlParams {
                    expires,
                    signature: signature.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(bytes, b"plate-bytes");

        let err = h
            .engine
            .read_signed(
                "condo-media".into(),
                reading.storage_key,
                SignedUrlParams {
                    expires,
                    signature: "0".repeat(64),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_workers_exit_when_handles_dropped() {
        let h = harness();
        let Harness {
            engine, workers, ..
        } = h;
        drop(engine);
        tokio::task::spawn_blocking(move || workers.join())
            .await
            .unwrap();
    }
}
