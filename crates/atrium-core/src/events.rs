//! Rule-based event inference over time-bucketed video labels.
//!
//! Pure functions: labels are grouped into per-timestamp buckets, each rule
//! is evaluated independently per bucket, and same-type events that follow a
//! kept event too closely are suppressed.

use crate::vision::LabelObservation;
use std::collections::{BTreeMap, BTreeSet};

// --- Named constants ---
pub const PERSON_PROXIMITY_MS: u64 = 2000;
pub const DEDUP_WINDOW_MS: u64 = 3000;

const LABEL_DOG: &str = "Dog";
const LABEL_PERSON: &str = "Person";
const VEHICLE_LABELS: [&str; 2] = ["Car", "Truck"];
const WASTE_LABELS: [&str; 5] = ["Poop", "Feces", "Excrement", "Animal Droppings", "Dung"];

pub const DOG_LOOSE: &str = "dog_loose";
pub const DOG_WASTE: &str = "dog_waste";
pub const BAD_PARKING: &str = "bad_parking";

/// Distinct label names per millisecond timestamp, ascending.
pub type LabelBuckets = BTreeMap<u64, BTreeSet<String>>;

/// An inferred event before type filtering and evidence attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedEvent {
    pub kind: &'static str,
    pub timestamp_ms: u64,
    pub confidence: f32,
}

/// Group observations by timestamp, dropping those below `min_confidence`.
pub fn normalize_labels(labels: &[LabelObservation], min_confidence: f32) -> LabelBuckets {
    let mut buckets = LabelBuckets::new();
    for obs in labels {
        if obs.confidence < min_confidence {
            continue;
        }
        buckets
            .entry(obs.timestamp_ms)
            .or_default()
            .insert(obs.name.clone());
    }
    buckets
}

/// A single inference rule, evaluated against one bucket with access to
/// all buckets for temporal context.
pub trait EventRule: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Confidence of the event at `timestamp_ms`, or `None` if the rule does not fire.
    fn evaluate(&self, timestamp_ms: u64, buckets: &LabelBuckets) -> Option<f32>;
}

fn bucket_has(buckets: &LabelBuckets, timestamp_ms: u64, label: &str) -> bool {
    buckets
        .get(&timestamp_ms)
        .is_some_and(|names| names.contains(label))
}

/// A dog with no person seen within ±2000 ms (inclusive).
pub struct LooseDogRule;

impl EventRule for LooseDogRule {
    fn kind(&self) -> &'static str {
        DOG_LOOSE
    }

    fn evaluate(&self, timestamp_ms: u64, buckets: &LabelBuckets) -> Option<f32> {
        if !bucket_has(buckets, timestamp_ms, LABEL_DOG) {
            return None;
        }
        let lo = timestamp_ms.saturating_sub(PERSON_PROXIMITY_MS);
        let hi = timestamp_ms.saturating_add(PERSON_PROXIMITY_MS);
        let person_near = buckets
            .range(lo..=hi)
            .any(|(_, names)| names.contains(LABEL_PERSON));
        (!person_near).then_some(90.0)
    }
}

/// A dog together with any waste-related label in the same bucket.
pub struct DogWasteRule;

impl EventRule for DogWasteRule {
    fn kind(&self) -> &'static str {
        DOG_WASTE
    }

    fn evaluate(&self, timestamp_ms: u64, buckets: &LabelBuckets) -> Option<f32> {
        let names = buckets.get(&timestamp_ms)?;
        let fires = names.contains(LABEL_DOG) && WASTE_LABELS.iter().any(|w| names.contains(*w));
        fires.then_some(85.0)
    }
}

/// Any car or truck in view. Placeholder until a parking-legality classifier exists.
pub struct VehicleRule;

impl EventRule for VehicleRule {
    fn kind(&self) -> &'static str {
        BAD_PARKING
    }

    fn evaluate(&self, timestamp_ms: u64, buckets: &LabelBuckets) -> Option<f32> {
        let names = buckets.get(&timestamp_ms)?;
        VEHICLE_LABELS
            .iter()
            .any(|v| names.contains(*v))
            .then_some(80.0)
    }
}

pub fn default_rules() -> Vec<Box<dyn EventRule>> {
    vec![
        Box::new(LooseDogRule),
        Box::new(DogWasteRule),
        Box::new(VehicleRule),
    ]
}

/// Evaluate every rule against every bucket in ascending timestamp order.
pub fn infer_events(buckets: &LabelBuckets, rules: &[Box<dyn EventRule>]) -> Vec<DetectedEvent> {
    let mut events = Vec::new();
    for &ts in buckets.keys() {
        for rule in rules {
            if let Some(confidence) = rule.evaluate(ts, buckets) {
                events.push(DetectedEvent {
                    kind: rule.kind(),
                    timestamp_ms: ts,
                    confidence,
                });
            }
        }
    }
    events
}

/// Sort by (kind, timestamp) and keep an event only when it is more than
/// `window_ms` after the last kept event of the same kind.
pub fn dedup_events(mut events: Vec<DetectedEvent>, window_ms: u64) -> Vec<DetectedEvent> {
    events.sort_by(|a, b| (a.kind, a.timestamp_ms).cmp(&(b.kind, b.timestamp_ms)));

    let mut last_kept: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut kept = Vec::with_capacity(events.len());
    for event in events {
        let keep = match last_kept.get(event.kind) {
            None => true,
            Some(&last) => event.timestamp_ms.abs_diff(last) > window_ms,
        };
        if keep {
            last_kept.insert(event.kind, event.timestamp_ms);
            kept.push(event);
        }
    }
    kept
}

/// Normalize, infer and deduplicate in one step.
pub fn detect_events(
    labels: &[LabelObservation],
    min_confidence: f32,
    rules: &[Box<dyn EventRule>],
) -> Vec<DetectedEvent> {
    let buckets = normalize_labels(labels, min_confidence);
    dedup_events(infer_events(&buckets, rules), DEDUP_WINDOW_MS)
}
