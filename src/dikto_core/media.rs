use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Blocking media operations the worker pipeline needs. `ffmpeg`/`ffprobe`
/// back the production implementation; tests substitute stubs so the loop can
/// be exercised without external tools.
pub trait MediaTools: Send + Sync {
    fn duration_secs(&self, source: &Path) -> Result<f64>;
    fn has_audio_stream(&self, source: &Path) -> Result<bool>;
    /// Re-encode `source` into the normalized editor media (320 px wide
    /// video, 200–3000 Hz band-pass audio). Returns the path transcription
    /// should read: `dest` on success, `source` when every encode attempt
    /// failed and the raw input has to do.
    fn normalize(&self, source: &Path, dest: &Path) -> Result<PathBuf>;
    /// Mix several audio tracks into one file (`amix`, duration of the first
    /// input).
    fn mix_tracks(&self, sources: &[PathBuf], dest: &Path) -> Result<()>;
}

/// Production implementation shelling out to `ffmpeg`/`ffprobe` on PATH.
#[derive(Debug, Clone, Default)]
pub struct Ffmpeg;

impl MediaTools for Ffmpeg {
    fn duration_secs(&self, source: &Path) -> Result<f64> {
        let output = Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=nw=1:nk=1")
            .arg(source.as_os_str())
            .output()
            .with_context(|| format!("failed to run ffprobe on {}", source.display()))?;

        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "ffprobe failed for {}: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().next().unwrap_or_default().trim();
        first
            .parse()
            .with_context(|| format!("unparsable ffprobe duration '{first}' for {}", source.display()))
    }

    fn has_audio_stream(&self, source: &Path) -> Result<bool> {
        let output = Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("a")
            .arg("-show_entries")
            .arg("stream=codec_type")
            .arg("-of")
            .arg("default=nw=1:nk=1")
            .arg(source.as_os_str())
            .output()
            .with_context(|| format!("failed to run ffprobe on {}", source.display()))?;

        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "ffprobe failed for {}: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        Ok(!output.stdout.is_empty())
    }

    fn normalize(&self, source: &Path, dest: &Path) -> Result<PathBuf> {
        // Inputs without a video stream (or with exotic codecs) make the
        // scale filter fail; retry with the video stream copied verbatim
        // before giving up and handing the raw input to transcription.
        if run_ffmpeg_filter(source, dest, &["-filter:v", "scale=320:-2"])? {
            return Ok(dest.to_path_buf());
        }
        if run_ffmpeg_filter(source, dest, &["-c:v", "copy"])? {
            return Ok(dest.to_path_buf());
        }
        tracing::warn!(
            "media normalization failed for {}; transcribing the original file",
            source.display()
        );
        Ok(source.to_path_buf())
    }

    fn mix_tracks(&self, sources: &[PathBuf], dest: &Path) -> Result<()> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y");
        for source in sources {
            cmd.arg("-i").arg(source.as_os_str());
        }
        let status = cmd
            .arg("-filter_complex")
            .arg(format!("amix=inputs={}:duration=first", sources.len()))
            .arg(dest.as_os_str())
            .status()
            .context("failed to run ffmpeg for track mixing")?;
        if !status.success() {
            return Err(anyhow::anyhow!("ffmpeg amix exited with {status}"));
        }
        Ok(())
    }
}

fn run_ffmpeg_filter(source: &Path, dest: &Path, video_args: &[&str]) -> Result<bool> {
    let status = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(source.as_os_str())
        .args(video_args)
        .arg("-af")
        .arg("lowpass=3000,highpass=200")
        .arg(dest.as_os_str())
        .status()
        .with_context(|| format!("failed to run ffmpeg on {}", source.display()))?;
    Ok(status.success())
}

/// Non-blocking duration probe used by the frontend's queue view, where many
/// probes run concurrently per request.
#[async_trait]
pub trait DurationProber: Send + Sync {
    async fn duration_secs(&self, source: &Path) -> Result<f64>;
}

/// `ffprobe` prober for the frontend event loop.
#[derive(Debug, Clone, Default)]
pub struct Ffprobe;

#[async_trait]
impl DurationProber for Ffprobe {
    async fn duration_secs(&self, source: &Path) -> Result<f64> {
        let output = tokio::process::Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=nw=1:nk=1")
            .arg(source.as_os_str())
            .output()
            .await
            .with_context(|| format!("failed to run ffprobe on {}", source.display()))?;

        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "ffprobe failed for {}: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().next().unwrap_or_default().trim();
        first
            .parse()
            .with_context(|| format!("unparsable ffprobe duration '{first}' for {}", source.display()))
    }
}
