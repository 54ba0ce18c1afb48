//! atrium-core: face identity, plate reading and video event detection.
//!
//! The vision provider and the object store are reached through the
//! [`VisionService`] and [`ObjectStore`] traits; concrete adapters live in
//! `atrium-io`, persistence lives in `atriumd`.

pub mod events;
pub mod plate;
pub mod registry;
pub mod storage;
pub mod types;
pub mod video;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;

pub use plate::{PlateError, PlateReader};
pub use registry::{FaceRegistry, IdentityStore, RegistryConfig, RegistryError, StoreError};
pub use storage::{LocalCopy, ObjectStore, StorageError};
pub use types::{
    Alert, AlertDraft, AlertType, FaceIdentity, IdentityKind, IdentityStatus, ObjectRef, Plate,
    ReconciliationEntry, VisitorSession,
};
pub use video::{CancelToken, FrameError, FrameExtractor, VideoEventDetector};
pub use vision::{VisionError, VisionService};
