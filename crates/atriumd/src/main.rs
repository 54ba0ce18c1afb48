use anyhow::{Context, Result};
use atrium_core::plate::PlateConfig;
use atrium_core::video::{PollPolicy, VideoConfig};
use atrium_core::{
    CancelToken, FaceRegistry, FrameExtractor, PlateReader, RegistryConfig, VideoEventDetector,
};
use atrium_io::{FfmpegFrameExtractor, FsObjectStore, HttpVisionClient};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;
mod store;

fn build_services(cfg: &config::Config) -> Result<engine::Services> {
    let store = Arc::new(store::Store::open(&cfg.db_path).context("failed to open database")?);
    tracing::info!(path = %cfg.db_path.display(), "database ready");

    let secret = if cfg.url_secret.is_empty() {
        tracing::warn!("url_secret not set; signed URLs will not survive a restart");
        uuid::Uuid::new_v4().simple().to_string()
    } else {
        cfg.url_secret.clone()
    };
    let media = Arc::new(FsObjectStore::new(
        &cfg.storage_root,
        &cfg.media_bucket,
        &cfg.public_url,
        &secret,
    ));
    let evidence = Arc::new(FsObjectStore::new(
        &cfg.storage_root,
        &cfg.alerts_bucket,
        &cfg.public_url,
        &secret,
    ));

    let vision = Arc::new(
        HttpVisionClient::new(
            &cfg.vision_endpoint,
            cfg.vision_api_key.clone(),
            Duration::from_secs(cfg.vision_timeout_secs),
        )
        .context("failed to build vision client")?,
    );
    tracing::info!(endpoint = %cfg.vision_endpoint, "vision gateway configured");

    let ffmpeg = FfmpegFrameExtractor::new(&cfg.ffmpeg_path, &cfg.ffprobe_path);
    let frames: Option<Arc<dyn FrameExtractor>> = if ffmpeg.is_available() {
        Some(Arc::new(ffmpeg))
    } else {
        tracing::warn!(
            ffmpeg = %cfg.ffmpeg_path.display(),
            "ffmpeg not available; alerts will carry no evidence frames"
        );
        None
    };
    let frames_available = frames.is_some();

    let registry = FaceRegistry::new(
        vision.clone(),
        media.clone(),
        store.clone(),
        RegistryConfig {
            collection: cfg.face_collection.clone(),
            similarity_threshold: cfg.face_threshold,
            ..RegistryConfig::default()
        },
    );
    let plates = PlateReader::new(vision.clone(), media.clone(), PlateConfig::default());
    let video = VideoEventDetector::new(
        vision,
        media.clone(),
        evidence.clone(),
        frames,
        VideoConfig {
            min_confidence: cfg.min_confidence,
            poll: PollPolicy {
                interval: Duration::from_millis(cfg.poll_interval_ms),
                max_attempts: cfg.poll_max_attempts,
            },
            ..VideoConfig::default()
        },
    );

    Ok(engine::Services {
        registry,
        plates,
        video,
        store,
        media,
        evidence,
        presign_ttl_secs: cfg.presign_ttl_secs,
        alerts_limit: cfg.alerts_limit,
        frames_available,
    })
}

// Not #[tokio::main]: the blocking vision client must be built and dropped
// outside the async runtime.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("atriumd starting");

    let cfg = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        listen = %cfg.listen_addr,
        collection = %cfg.face_collection,
        threshold = cfg.face_threshold,
        workers = cfg.video_workers,
        "configuration loaded"
    );

    let services = build_services(&cfg)?;
    let cancel = CancelToken::new();
    let (engine, workers) = engine::spawn_engine(
        services,
        cfg.video_workers,
        cfg.video_queue,
        Duration::from_secs(cfg.video_timeout_secs),
        cancel.clone(),
    )
    .context("failed to start video workers")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;

    let app = http::router(engine.clone(), cfg.max_upload_bytes);
    let served: Result<()> = runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", cfg.listen_addr))?;
        tracing::info!(addr = %listener.local_addr()?, "atriumd ready");

        let shutdown_cancel = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                tracing::info!("atriumd shutting down");
                shutdown_cancel.cancel();
            })
            .await?;
        Ok(())
    });

    // Stop in-flight video jobs even when the server exited on an error.
    cancel.cancel();
    drop(runtime);
    drop(engine);
    workers.join();
    tracing::info!("atriumd stopped");

    served
}
