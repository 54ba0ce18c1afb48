//! Vehicle plate reading from a single image via provider text detection.
//!
//! This is a heuristic: the provider's word-level detections are filtered
//! by a character pattern and a stoplist of banner text commonly printed on
//! plates. It does not validate any national plate format.

use crate::storage::{fresh_key, ObjectStore, StorageError};
use crate::vision::{TextDetection, TextKind, VisionError, VisionService};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

static PLATE_PATTERN: OnceLock<Regex> = OnceLock::new();

fn plate_pattern() -> &'static Regex {
    PLATE_PATTERN.get_or_init(|| Regex::new(r"^[A-Z0-9]{4,10}$").expect("static plate pattern"))
}

#[derive(Error, Debug)]
pub enum PlateError {
    #[error("vision provider: {0}")]
    Provider(#[from] VisionError),
    #[error("object store: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct PlateConfig {
    pub key_prefix: String,
    /// Uppercase tokens never returned as plates.
    pub stoplist: Vec<String>,
}

impl Default for PlateConfig {
    fn default() -> Self {
        Self {
            key_prefix: "plates/".into(),
            stoplist: vec!["BOLIVIA".into(), "L".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateReading {
    pub plate: Option<String>,
    pub storage_key: String,
}

/// Choose the highest-confidence word that looks like a plate.
pub fn select_plate(detections: &[TextDetection], stoplist: &[String]) -> Option<String> {
    let mut ordered: Vec<&TextDetection> = detections.iter().collect();
    // Stable: equal confidences keep provider order.
    ordered.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    ordered
        .into_iter()
        .filter(|d| d.kind == TextKind::Word)
        .map(|d| d.text.trim().to_uppercase())
        .filter(|text| !stoplist.iter().any(|s| s == text))
        .find(|text| plate_pattern().is_match(text))
}

pub struct PlateReader {
    vision: Arc<dyn VisionService>,
    objects: Arc<dyn ObjectStore>,
    config: PlateConfig,
}

impl PlateReader {
    pub fn new(
        vision: Arc<dyn VisionService>,
        objects: Arc<dyn ObjectStore>,
        config: PlateConfig,
    ) -> Self {
        Self {
            vision,
            objects,
            config,
        }
    }

    /// Upload `image` and return the best plate candidate, if any.
    pub fn detect(&self, image: &[u8]) -> Result<PlateReading, PlateError> {
        let storage_key = fresh_key(&self.config.key_prefix, ".jpg");
        self.objects.put(&storage_key, image, "image/jpeg")?;

        let detections = self
            .vision
            .detect_text(&self.objects.object_ref(&storage_key))?;
        let plate = select_plate(&detections, &self.config.stoplist);

        tracing::info!(
            key = %storage_key,
            detections = detections.len(),
            plate = ?plate,
            "plate detection"
        );
        Ok(PlateReading { plate, storage_key })
    }
}
