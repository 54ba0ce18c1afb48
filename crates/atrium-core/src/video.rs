//! Video event detector: drives one provider label-detection job per video,
//! infers events from the collected labels and attaches a snapshot frame to
//! each surviving event.

use crate::events::{self, EventRule, LabelBuckets, DEDUP_WINDOW_MS};
use crate::storage::{fresh_key, ObjectStore, StorageError};
use crate::types::{AlertDraft, AlertType, ObjectRef};
use crate::vision::{JobStatus, LabelObservation, VisionError, VisionService};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_MIN_CONFIDENCE: f32 = 70.0;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_POLL_ATTEMPTS: u32 = 240;
/// Upper bound on a single uninterrupted sleep while waiting between polls.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum VideoError {
    #[error("vision provider: {0}")]
    Provider(#[from] VisionError),
    #[error("object store: {0}")]
    Storage(#[from] StorageError),
    #[error("label detection job {job_id} ended as {status:?}")]
    JobFailed { job_id: String, status: JobStatus },
    #[error("label detection job {job_id} cancelled")]
    Cancelled { job_id: String },
    #[error("label detection job {job_id} exceeded its deadline")]
    DeadlineExceeded { job_id: String },
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame extraction unavailable: {0}")]
    Unavailable(String),
    #[error("frame {frame_index} is outside the video")]
    OutOfRange { frame_index: u64 },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracts one still frame from a local video and returns it JPEG-encoded.
pub trait FrameExtractor: Send + Sync {
    fn extract_jpeg(&self, video: &Path, timestamp_ms: u64) -> Result<Vec<u8>, FrameError>;
}

/// Cooperative cancellation flag shared between a caller and a running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Sleep before each poll.
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_POLL_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    /// Label confidence floor, sent to the provider and applied again locally.
    pub min_confidence: f32,
    pub poll: PollPolicy,
    pub evidence_prefix: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            poll: PollPolicy::default(),
            evidence_prefix: "thumbs/".into(),
        }
    }
}

pub struct VideoEventDetector {
    vision: Arc<dyn VisionService>,
    videos: Arc<dyn ObjectStore>,
    evidence: Arc<dyn ObjectStore>,
    frames: Option<Arc<dyn FrameExtractor>>,
    rules: Vec<Box<dyn EventRule>>,
    config: VideoConfig,
}

impl VideoEventDetector {
    /// `frames = None` disables evidence; events are still produced.
    pub fn new(
        vision: Arc<dyn VisionService>,
        videos: Arc<dyn ObjectStore>,
        evidence: Arc<dyn ObjectStore>,
        frames: Option<Arc<dyn FrameExtractor>>,
        config: VideoConfig,
    ) -> Self {
        Self {
            vision,
            videos,
            evidence,
            frames,
            rules: events::default_rules(),
            config,
        }
    }

    /// Replace the default rule set.
    pub fn with_rules(mut self, rules: Vec<Box<dyn EventRule>>) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &VideoConfig {
        &self.config
    }

    /// Sleep one poll interval, waking early on cancellation or deadline.
    fn wait_interval(
        &self,
        job_id: &str,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<(), VideoError> {
        let until = Instant::now() + self.config.poll.interval;
        loop {
            if cancel.is_cancelled() {
                return Err(VideoError::Cancelled {
                    job_id: job_id.to_string(),
                });
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Err(VideoError::DeadlineExceeded {
                    job_id: job_id.to_string(),
                });
            }
            if now >= until {
                return Ok(());
            }
            let mut nap = (until - now).min(SLEEP_SLICE);
            if let Some(d) = deadline {
                nap = nap.min(d.saturating_duration_since(now));
            }
            std::thread::sleep(nap);
        }
    }

    /// Start a label-detection job and poll it until it is terminal with no
    /// pending page, the poll budget runs out, or the caller gives up.
    pub fn start_and_collect(
        &self,
        video: &ObjectRef,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<Vec<LabelObservation>, VideoError> {
        let job_id = self
            .vision
            .start_label_detection(video, self.config.min_confidence)?;
        tracing::info!(job_id = %job_id, key = %video.key, "label detection started");

        let mut labels = Vec::new();
        let mut token: Option<String> = None;
        let mut status = JobStatus::InProgress;

        for attempt in 1..=self.config.poll.max_attempts {
            self.wait_interval(&job_id, cancel, deadline)?;

            let page = self
                .vision
                .get_label_detection(&job_id, token.as_deref())?;
            tracing::debug!(
                job_id = %job_id,
                attempt,
                status = ?page.status,
                labels = page.labels.len(),
                more = page.next_token.is_some(),
                "label detection poll"
            );

            labels.extend(page.labels);
            token = page.next_token;
            status = page.status;

            if status.is_terminal() && token.is_none() {
                break;
            }
        }

        if status != JobStatus::Succeeded {
            tracing::warn!(job_id = %job_id, status = ?status, "label detection did not succeed");
            return Err(VideoError::JobFailed { job_id, status });
        }

        if let Some(pending) = &token {
            tracing::warn!(
                job_id = %job_id,
                next_token = %pending,
                labels = labels.len(),
                "poll budget ran out while paging results; labels are incomplete"
            );
        }

        tracing::info!(job_id = %job_id, labels = labels.len(), "label detection finished");
        Ok(labels)
    }

    /// Full pipeline for one stored video: labels → events → evidence → drafts.
    pub fn process(
        &self,
        video_key: &str,
        camera_id: Option<&str>,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> Result<Vec<AlertDraft>, VideoError> {
        let labels = self.start_and_collect(&self.videos.object_ref(video_key), cancel, deadline)?;

        let buckets = events::normalize_labels(&labels, self.config.min_confidence);
        let detected =
            events::dedup_events(events::infer_events(&buckets, &self.rules), DEDUP_WINDOW_MS);

        let allowed: Vec<(AlertType, events::DetectedEvent)> = detected
            .into_iter()
            .filter_map(|e| match e.kind.parse::<AlertType>() {
                Ok(t) => Some((t, e)),
                Err(_) => {
                    tracing::debug!(kind = e.kind, "dropping event outside the alert set");
                    None
                }
            })
            .collect();

        let timestamps: Vec<u64> = allowed.iter().map(|(_, e)| e.timestamp_ms).collect();
        let evidence = self.attach_evidence(video_key, &timestamps);

        let drafts: Vec<AlertDraft> = allowed
            .into_iter()
            .zip(evidence)
            .map(|((alert_type, event), image_key)| AlertDraft {
                alert_type,
                camera_id: camera_id.map(str::to_string),
                video_key: video_key.to_string(),
                image_key,
                timestamp_ms: event.timestamp_ms,
                confidence: event.confidence,
                extra: serde_json::json!({ "labels": bucket_labels(&buckets, event.timestamp_ms) }),
            })
            .collect();

        tracing::info!(
            key = video_key,
            camera = ?camera_id,
            alerts = drafts.len(),
            "video processed"
        );
        Ok(drafts)
    }

    /// One evidence key (or `None`) per timestamp. The video is copied
    /// locally once; the copy is removed when this returns.
    fn attach_evidence(&self, video_key: &str, timestamps: &[u64]) -> Vec<Option<String>> {
        let none = || vec![None; timestamps.len()];
        let Some(frames) = &self.frames else {
            return none();
        };
        if timestamps.is_empty() {
            return Vec::new();
        }

        let local = match self.videos.get_to_local(video_key) {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(key = video_key, error = %e, "video download failed; no evidence");
                return none();
            }
        };

        timestamps
            .iter()
            .map(|&ts| self.snapshot(frames.as_ref(), local.path(), ts))
            .collect()
    }

    fn snapshot(&self, frames: &dyn FrameExtractor, video: &Path, timestamp_ms: u64) -> Option<String> {
        let jpeg = match frames.extract_jpeg(video, timestamp_ms) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(timestamp_ms, error = %e, "evidence frame unavailable");
                return None;
            }
        };
        let key = fresh_key(&self.config.evidence_prefix, ".jpg");
        match self.evidence.put(&key, &jpeg, "image/jpeg") {
            Ok(()) => Some(key),
            Err(e) => {
                tracing::warn!(timestamp_ms, error = %e, "evidence upload failed");
                None
            }
        }
    }
}

fn bucket_labels(buckets: &LabelBuckets, timestamp_ms: u64) -> Vec<String> {
    buckets
        .get(&timestamp_ms)
        .map(|names| names.iter().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LabelBuckets;
    use crate::testing::{FakeFrames, FakeVision, MemoryObjectStore};
    use crate::vision::LabelPage;

    fn label(t: u64, name: &str) -> LabelObservation {
        LabelObservation {
            timestamp_ms: t,
            name: name.into(),
            confidence: 95.0,
        }
    }

    fn page(status: JobStatus, labels: Vec<LabelObservation>, next: Option<&str>) -> LabelPage {
        LabelPage {
            status,
            labels,
            next_token: next.map(str::to_string),
        }
    }

    fn fast_config(max_attempts: u32) -> VideoConfig {
        VideoConfig {
            poll: PollPolicy {
                interval: Duration::ZERO,
                max_attempts,
            },
            ..VideoConfig::default()
        }
    }

    struct Fixture {
        vision: Arc<FakeVision>,
        videos: Arc<MemoryObjectStore>,
        evidence: Arc<MemoryObjectStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let videos = Arc::new(MemoryObjectStore::new("condo-media"));
            videos.insert("videos/clip.mp4", b"mp4 bytes");
            Self {
                vision: Arc::new(FakeVision::default()),
                videos,
                evidence: Arc::new(MemoryObjectStore::new("condo-alerts")),
            }
        }

        fn detector(&self, frames: Option<Arc<dyn FrameExtractor>>, max_attempts: u32) -> VideoEventDetector {
            VideoEventDetector::new(
                self.vision.clone(),
                self.videos.clone(),
                self.evidence.clone(),
                frames,
                fast_config(max_attempts),
            )
        }
    }

    #[test]
    fn test_collects_all_pages() {
        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![
            page(JobStatus::InProgress, vec![], None),
            page(JobStatus::InProgress, vec![label(0, "Dog")], Some("t1")),
            page(JobStatus::Succeeded, vec![label(500, "Car")], Some("t2")),
            page(JobStatus::Succeeded, vec![label(900, "Truck")], None),
        ]);
        let det = fx.detector(None, 10);

        let labels = det
            .start_and_collect(&fx.videos.object_ref("videos/clip.mp4"), &CancelToken::new(), None)
            .unwrap();

        assert_eq!(labels.len(), 3);
        // Terminal status with a pending token must still be drained
        assert_eq!(fx.vision.poll_tokens(), vec![None, None, Some("t1".into()), Some("t2".into())]);
        assert_eq!(fx.vision.started_min_confidence(), Some(70.0));
    }

    #[test]
    fn test_budget_exhausted_while_paging_keeps_partial_labels() {
        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![
            page(JobStatus::Succeeded, vec![label(0, "Dog")], Some("t1")),
            page(JobStatus::Succeeded, vec![label(500, "Car")], Some("t2")),
            page(JobStatus::Succeeded, vec![label(900, "Truck")], None),
        ]);
        let det = fx.detector(None, 2);

        let labels = det
            .start_and_collect(&fx.videos.object_ref("videos/clip.mp4"), &CancelToken::new(), None)
            .unwrap();

        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Dog", "Car"]);
        assert_eq!(fx.vision.poll_tokens(), vec![None, Some("t1".into())]);
    }

    #[test]
    fn test_failed_job_is_error() {
        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![page(JobStatus::Failed, vec![label(0, "Dog")], None)]);
        let det = fx.detector(None, 10);

        let err = det
            .process("videos/clip.mp4", Some("cam1"), &CancelToken::new(), None)
            .unwrap_err();

        assert!(matches!(err, VideoError::JobFailed { status: JobStatus::Failed, .. }));
    }

    #[test]
    fn test_exhausted_budget_is_job_failure() {
        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![
            page(JobStatus::InProgress, vec![], None),
            page(JobStatus::InProgress, vec![], None),
        ]);
        let det = fx.detector(None, 2);

        let err = det
            .start_and_collect(&fx.videos.object_ref("videos/clip.mp4"), &CancelToken::new(), None)
            .unwrap_err();

        assert!(matches!(err, VideoError::JobFailed { status: JobStatus::InProgress, .. }));
        assert_eq!(fx.vision.poll_tokens().len(), 2);
    }

    #[test]
    fn test_cancelled_before_first_poll() {
        let fx = Fixture::new();
        let det = fx.detector(None, 10);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = det
            .start_and_collect(&fx.videos.object_ref("videos/clip.mp4"), &cancel, None)
            .unwrap_err();

        assert!(matches!(err, VideoError::Cancelled { .. }));
        assert!(fx.vision.poll_tokens().is_empty());
    }

    #[test]
    fn test_deadline_exceeded() {
        let fx = Fixture::new();
        let det = fx.detector(None, 10);
        let past = Instant::now() - Duration::from_millis(1);

        let err = det
            .start_and_collect(&fx.videos.object_ref("videos/clip.mp4"), &CancelToken::new(), Some(past))
            .unwrap_err();

        assert!(matches!(err, VideoError::DeadlineExceeded { .. }));
    }

    #[test]
    fn test_deadline_interrupts_long_interval() {
        let fx = Fixture::new();
        let det = VideoEventDetector::new(
            fx.vision.clone(),
            fx.videos.clone(),
            fx.evidence.clone(),
            None,
            VideoConfig {
                poll: PollPolicy {
                    interval: Duration::from_secs(60),
                    max_attempts: 1,
                },
                ..VideoConfig::default()
            },
        );
        let started = Instant::now();
        let deadline = started + Duration::from_millis(50);

        let err = det
            .start_and_collect(&fx.videos.object_ref("videos/clip.mp4"), &CancelToken::new(), Some(deadline))
            .unwrap_err();

        assert!(matches!(err, VideoError::DeadlineExceeded { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_process_dog_and_car_with_evidence() {
        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![page(
            JobStatus::Succeeded,
            vec![label(0, "Dog"), label(0, "Car")],
            None,
        )]);
        let frames = Arc::new(FakeFrames::default());
        let det = fx.detector(Some(frames.clone()), 10);

        let drafts = det
            .process("videos/clip.mp4", Some("cam1"), &CancelToken::new(), None)
            .unwrap();

        assert_eq!(drafts.len(), 2);
        // Sorted by type name: bad_parking before dog_loose
        assert_eq!(drafts[0].alert_type, AlertType::BadParking);
        assert_eq!(drafts[1].alert_type, AlertType::DogLoose);
        for d in &drafts {
            assert_eq!(d.timestamp_ms, 0);
            assert_eq!(d.camera_id.as_deref(), Some("cam1"));
            assert_eq!(d.video_key, "videos/clip.mp4");
            let key = d.image_key.as_deref().unwrap();
            assert!(key.starts_with("thumbs/"));
            assert!(fx.evidence.contains(key));
        }
        assert_eq!(drafts[0].extra["labels"], serde_json::json!(["Car", "Dog"]));
        assert_eq!(frames.calls(), vec![0, 0]);
        // Local video copy is scoped to the evidence pass
        assert!(fx.videos.local_copies_removed());
    }

    #[test]
    fn test_process_without_extractor_keeps_events() {
        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![page(JobStatus::Succeeded, vec![label(1200, "Truck")], None)]);
        let det = fx.detector(None, 10);

        let drafts = det.process("videos/clip.mp4", None, &CancelToken::new(), None).unwrap();

        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].image_key, None);
        assert_eq!(drafts[0].confidence, 80.0);
    }

    #[test]
    fn test_frame_failure_keeps_event() {
        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![page(
            JobStatus::Succeeded,
            vec![label(0, "Dog"), label(9000, "Dog")],
            None,
        )]);
        let frames = Arc::new(FakeFrames::default());
        frames.fail_at(9000);
        let det = fx.detector(Some(frames), 10);

        let drafts = det.process("videos/clip.mp4", None, &CancelToken::new(), None).unwrap();

        assert_eq!(drafts.len(), 2);
        assert!(drafts[0].image_key.is_some());
        assert!(drafts[1].image_key.is_none());
    }

    #[test]
    fn test_missing_video_omits_evidence() {
        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![page(JobStatus::Succeeded, vec![label(0, "Car")], None)]);
        let det = fx.detector(Some(Arc::new(FakeFrames::default())), 10);

        let drafts = det.process("videos/missing.mp4", None, &CancelToken::new(), None).unwrap();

        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].image_key.is_none());
    }

    #[test]
    fn test_unknown_event_kinds_are_dropped() {
        struct CatRule;
        impl EventRule for CatRule {
            fn kind(&self) -> &'static str {
                "cat_seen"
            }
            fn evaluate(&self, t: u64, b: &LabelBuckets) -> Option<f32> {
                b.get(&t).filter(|n| n.contains("Cat")).map(|_| 50.0)
            }
        }

        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![page(
            JobStatus::Succeeded,
            vec![label(0, "Cat"), label(0, "Car")],
            None,
        )]);
        let mut rules = events::default_rules();
        rules.push(Box::new(CatRule));
        let det = fx.detector(None, 10).with_rules(rules);

        let drafts = det.process("videos/clip.mp4", None, &CancelToken::new(), None).unwrap();

        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].alert_type, AlertType::BadParking);
    }

    #[test]
    fn test_dedup_applies_in_pipeline() {
        let fx = Fixture::new();
        fx.vision.push_label_pages(vec![page(
            JobStatus::Succeeded,
            vec![label(1000, "Car"), label(3500, "Car"), label(4500, "Car")],
            None,
        )]);
        let det = fx.detector(None, 10);

        let drafts = det.process("videos/clip.mp4", None, &CancelToken::new(), None).unwrap();
        let times: Vec<u64> = drafts.iter().map(|d| d.timestamp_ms).collect();

        assert_eq!(times, vec![1000, 4500]);
    }
}
