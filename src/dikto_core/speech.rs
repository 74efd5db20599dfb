use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::dikto_core::domain::TranscriptSegment;
use crate::dikto_core::settings::{Device, Settings};

/// One transcription call into the speech stack.
#[derive(Debug)]
pub struct TranscribeRequest<'a> {
    pub audio: &'a Path,
    /// ISO language code, e.g. `de`.
    pub language: &'a str,
    /// Per-user bias vocabulary.
    pub hotwords: &'a [String],
}

/// Boundary to the speech-recognition + diarization models. The models are a
/// black box to the job engine: audio in, time-aligned speaker-labeled
/// segments out. Tests drive the worker through stub implementations.
pub trait SpeechPipeline: Send + Sync {
    fn transcribe(&self, request: &TranscribeRequest<'_>) -> Result<Vec<TranscriptSegment>>;
}

/// Production pipeline: spawns the configured `ASR_COMMAND` executable, which
/// prints a JSON array of segments on stdout.
#[derive(Debug)]
pub struct CommandPipeline {
    command: PathBuf,
    device: Device,
    batch_size: u32,
    hf_auth_token: String,
}

impl CommandPipeline {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate_worker()?;
        Ok(Self {
            command: settings.asr_command.clone().expect("validated above"),
            device: settings.device,
            batch_size: settings.batch_size,
            hf_auth_token: settings.hf_auth_token.clone().expect("validated above"),
        })
    }
}

impl SpeechPipeline for CommandPipeline {
    fn transcribe(&self, request: &TranscribeRequest<'_>) -> Result<Vec<TranscriptSegment>> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--language")
            .arg(request.language)
            .arg("--device")
            .arg(self.device.as_str())
            .arg("--batch-size")
            .arg(self.batch_size.to_string())
            .env("HF_AUTH_TOKEN", &self.hf_auth_token);
        for word in request.hotwords {
            cmd.arg("--hotword").arg(word);
        }
        cmd.arg(request.audio.as_os_str());

        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn {}", self.command.display()))?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "speech pipeline exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        let segments: Vec<TranscriptSegment> = serde_json::from_slice(&output.stdout)
            .context("speech pipeline produced invalid segment JSON")?;
        Ok(segments)
    }
}
