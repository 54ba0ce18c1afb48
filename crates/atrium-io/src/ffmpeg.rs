//! Evidence frames via the ffmpeg/ffprobe command-line tools.

use crate::frame::{encode_jpeg, frame_index, parse_frame_rate, EVIDENCE_JPEG_QUALITY, FALLBACK_FPS};
use atrium_core::{FrameError, FrameExtractor};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

pub struct FfmpegFrameExtractor {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    quality: u8,
}

impl Default for FfmpegFrameExtractor {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

fn select_filter(index: u64) -> String {
    format!("select=eq(n\\,{index})")
}

fn run(program: &Path, args: &[&str]) -> Result<Output, FrameError> {
    Command::new(program).args(args).output().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            FrameError::Unavailable(format!("{} not found", program.display()))
        } else {
            FrameError::Io(e)
        }
    })
}

impl FfmpegFrameExtractor {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            quality: EVIDENCE_JPEG_QUALITY,
        }
    }

    /// True when both binaries can be executed.
    pub fn is_available(&self) -> bool {
        [&self.ffmpeg, &self.ffprobe].iter().all(|bin| {
            Command::new(bin)
                .arg("-version")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        })
    }

    /// Frame rate of the first video stream, or the fallback rate.
    pub fn frame_rate(&self, video: &Path) -> f64 {
        let path = video.to_string_lossy();
        let probed = run(
            &self.ffprobe,
            &[
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=r_frame_rate",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
                &path,
            ],
        );
        match probed {
            Ok(out) if out.status.success() => {
                let raw = String::from_utf8_lossy(&out.stdout);
                parse_frame_rate(raw.lines().next().unwrap_or_default()).unwrap_or_else(|| {
                    tracing::debug!(rate = %raw.trim(), "unusable frame rate; using fallback");
                    FALLBACK_FPS
                })
            }
            Ok(out) => {
                tracing::debug!(
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "ffprobe failed; using fallback frame rate"
                );
                FALLBACK_FPS
            }
            Err(e) => {
                tracing::debug!(error = %e, "ffprobe unavailable; using fallback frame rate");
                FALLBACK_FPS
            }
        }
    }
}

impl FrameExtractor for FfmpegFrameExtractor {
    fn extract_jpeg(&self, video: &Path, timestamp_ms: u64) -> Result<Vec<u8>, FrameError> {
        if !video.exists() {
            return Err(FrameError::Unavailable(format!(
                "video does not exist: {}",
                video.display()
            )));
        }

        let fps = self.frame_rate(video);
        let index = frame_index(timestamp_ms, fps);
        let path = video.to_string_lossy();
        let filter = select_filter(index);

        let out = run(
            &self.ffmpeg,
            &[
                "-v",
                "error",
                "-i",
                &path,
                "-vf",
                &filter,
                "-vsync",
                "0",
                "-frames:v",
                "1",
                "-f",
                "image2pipe",
                "-vcodec",
                "png",
                "-",
            ],
        )?;

        if !out.status.success() {
            return Err(FrameError::Unavailable(format!(
                "ffmpeg failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        if out.stdout.is_empty() {
            return Err(FrameError::OutOfRange { frame_index: index });
        }

        tracing::debug!(timestamp_ms, fps, frame = index, "frame extracted");
        encode_jpeg(&out.stdout, self.quality)
    }
}
