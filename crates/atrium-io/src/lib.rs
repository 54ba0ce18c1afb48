//! atrium-io: concrete adapters for the atrium-core traits.
//!
//! Provides a filesystem-backed object store with signed read URLs, a
//! blocking HTTP client for the vision gateway, and ffmpeg-based frame
//! extraction for alert evidence.

pub mod ffmpeg;
pub mod frame;
pub mod object_store;
pub mod vision_client;

pub use ffmpeg::FfmpegFrameExtractor;
pub use object_store::{verify_signature, FsObjectStore, SignedUrlParams};
pub use vision_client::HttpVisionClient;
