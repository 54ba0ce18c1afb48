use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `ATRIUM_CONFIG`, then `ATRIUM_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the REST server binds to.
    pub listen_addr: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Root directory of the filesystem object store.
    pub storage_root: PathBuf,
    /// Bucket for uploaded faces, plates and videos.
    pub media_bucket: String,
    /// Bucket for alert evidence frames.
    pub alerts_bucket: String,
    /// Externally reachable base URL used in signed read URLs.
    pub public_url: String,
    /// Secret for signing read URLs. Empty means a per-process secret.
    pub url_secret: String,
    pub presign_ttl_secs: u64,
    /// Base URL of the vision gateway.
    pub vision_endpoint: String,
    pub vision_api_key: Option<String>,
    pub vision_timeout_secs: u64,
    /// Face collection shared by residents and visitors.
    pub face_collection: String,
    /// Minimum similarity (0–100) for a face match.
    pub face_threshold: f32,
    /// Label confidence floor for video analysis.
    pub min_confidence: f32,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
    /// Wall-clock budget for one video job.
    pub video_timeout_secs: u64,
    /// Dedicated video worker threads.
    pub video_workers: usize,
    /// Queued video jobs beyond which uploads are refused.
    pub video_queue: usize,
    pub max_upload_bytes: usize,
    pub alerts_limit: u32,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("atrium")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            listen_addr: "127.0.0.1:8088".into(),
            db_path: data_dir.join("atrium.db"),
            storage_root: data_dir.join("objects"),
            media_bucket: "condo-media".into(),
            alerts_bucket: "condominio-alerts".into(),
            public_url: "http://127.0.0.1:8088".into(),
            url_secret: String::new(),
            presign_ttl_secs: 3600,
            vision_endpoint: "http://127.0.0.1:9000".into(),
            vision_api_key: None,
            vision_timeout_secs: 30,
            face_collection: "usuarios_faces".into(),
            face_threshold: 85.0,
            min_confidence: 70.0,
            poll_interval_ms: 3000,
            poll_max_attempts: 240,
            video_timeout_secs: 900,
            video_workers: 2,
            video_queue: 8,
            max_upload_bytes: 200 * 1024 * 1024,
            alerts_limit: 50,
            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),
        }
    }
}

impl Config {
    /// Load from `ATRIUM_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("ATRIUM_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(base.with_env(|key| std::env::var(key).ok()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides. Earlier keys in each list win.
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String>) -> Self {
        env_string(&env, &mut self.listen_addr, &["ATRIUM_LISTEN_ADDR"]);
        env_parse(&env, &mut self.db_path, &["ATRIUM_DB_PATH"]);
        env_parse(&env, &mut self.storage_root, &["ATRIUM_STORAGE_ROOT"]);
        env_string(
            &env,
            &mut self.media_bucket,
            &["ATRIUM_MEDIA_BUCKET", "AWS_STORAGE_BUCKET_NAME"],
        );
        env_string(
            &env,
            &mut self.alerts_bucket,
            &["ATRIUM_ALERTS_BUCKET", "ALERTS_BUCKET"],
        );
        env_string(&env, &mut self.public_url, &["ATRIUM_PUBLIC_URL"]);
        env_string(&env, &mut self.url_secret, &["ATRIUM_URL_SECRET"]);
        env_parse(&env, &mut self.presign_ttl_secs, &["ATRIUM_PRESIGN_TTL_SECS"]);
        env_string(&env, &mut self.vision_endpoint, &["ATRIUM_VISION_ENDPOINT"]);
        if let Some(key) = env("ATRIUM_VISION_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.vision_api_key = Some(key.trim().to_string());
        }
        env_parse(&env, &mut self.vision_timeout_secs, &["ATRIUM_VISION_TIMEOUT_SECS"]);
        env_string(
            &env,
            &mut self.face_collection,
            &["ATRIUM_FACE_COLLECTION", "AWS_COLLECTION_ID"],
        );
        env_parse(
            &env,
            &mut self.face_threshold,
            &["ATRIUM_FACE_THRESHOLD", "FACE_THRESHOLD"],
        );
        env_parse(
            &env,
            &mut self.min_confidence,
            &["ATRIUM_MIN_CONFIDENCE", "MIN_CONFIDENCE"],
        );
        env_parse(&env, &mut self.poll_interval_ms, &["ATRIUM_POLL_INTERVAL_MS"]);
        env_parse(&env, &mut self.poll_max_attempts, &["ATRIUM_POLL_MAX_ATTEMPTS"]);
        env_parse(&env, &mut self.video_timeout_secs, &["ATRIUM_VIDEO_TIMEOUT_SECS"]);
        env_parse(&env, &mut self.video_workers, &["ATRIUM_VIDEO_WORKERS"]);
        env_parse(&env, &mut self.video_queue, &["ATRIUM_VIDEO_QUEUE"]);
        env_parse(&env, &mut self.max_upload_bytes, &["ATRIUM_MAX_UPLOAD_BYTES"]);
        env_parse(&env, &mut self.alerts_limit, &["ATRIUM_ALERTS_LIMIT"]);
        env_parse(&env, &mut self.ffmpeg_path, &["ATRIUM_FFMPEG"]);
        env_parse(&env, &mut self.ffprobe_path, &["ATRIUM_FFPROBE"]);
        self
    }
}

/// First set key wins; blank values are ignored.
fn env_string(env: &impl Fn(&str) -> Option<String>, slot: &mut String, keys: &[&str]) {
    if let Some(v) = keys
        .iter()
        .filter_map(|&k| env(k))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
    {
        *slot = v;
    }
}

/// First parseable key wins; unparseable values are logged and skipped.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, slot: &mut T, keys: &[&str]) {
    for &key in keys {
        let Some(raw) = env(key) else { continue };
        match raw.trim().parse() {
            Ok(v) => {
                *slot = v;
                return;
            }
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config value"),
        }
    }
}
