use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::dikto_core::artifacts::{render_editor, render_srt};
use crate::dikto_core::domain::{merge_tracks, Heartbeat, TranscriptSegment};
use crate::dikto_core::estimate::{self, estimate_from_duration};
use crate::dikto_core::media::MediaTools;
use crate::dikto_core::speech::{SpeechPipeline, TranscribeRequest};
use crate::dikto_core::store::StoreRoot;
use crate::dikto_core::unix_now_secs;

use super::report::report_error;
use super::Worker;

/// How one pass through the pipeline ended. Only `Completed` counts as a
/// successfully transcribed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    /// The input disappeared mid-flight (user cancel); nothing was produced.
    Abandoned,
}

impl<M: MediaTools, S: SpeechPipeline> Worker<M, S> {
    /// Run the transcription pipeline for one acquired job. The caller has
    /// already written the `.processing` marker; heartbeats left behind are
    /// swept by the caller at the end of the loop iteration.
    pub(super) fn process_job(&self, user: &str, file: &str) -> JobOutcome {
        if estimate::is_zip(file) {
            self.process_zip_job(user, file)
        } else {
            self.process_single_job(user, file)
        }
    }

    fn process_single_job(&self, user: &str, file: &str) -> JobOutcome {
        let store = &self.store;
        let input = store.inbox_file(user, file);

        let duration = match self.media.duration_secs(&input) {
            Ok(duration) => duration,
            Err(err) => {
                tracing::warn!("duration probe failed for {}: {err:#}", input.display());
                report_error(store, user, file, "cannot read file");
                return JobOutcome::Failed;
            }
        };
        let estimate = estimate_from_duration(duration, self.settings.online, self.settings.device);

        if let Err(err) = self.write_heartbeat(user, file, estimate) {
            tracing::error!("failed to write heartbeat for {user}/{file}: {err:#}");
        }

        match self.media.has_audio_stream(&input) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                report_error(store, user, file, "no audio track");
                return JobOutcome::Failed;
            }
        }

        if !input.exists() {
            return self.abandon(user, file);
        }

        // Normalized media for the editor player; transcription reads
        // whichever file the normalizer hands back.
        if let Err(err) = fs::create_dir_all(store.out_dir(user)) {
            tracing::error!("failed to create outbox for {user}: {err}");
        }
        let media_out = store.media_mp4(user, file);
        let transcribe_source = match self.media.normalize(&input, &media_out) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!("normalization failed for {}: {err:#}", input.display());
                input.clone()
            }
        };

        if !input.exists() {
            let _ = fs::remove_file(&media_out);
            return self.abandon(user, file);
        }

        let hotwords = self.load_hotwords(user);
        let language = self.load_language(user);
        let request = TranscribeRequest {
            audio: &transcribe_source,
            language: &language,
            hotwords: &hotwords,
        };
        let segments = match self.speech.transcribe(&request) {
            Ok(segments) => segments,
            Err(err) => {
                tracing::error!("transcription failed for {}: {err:#}", input.display());
                let _ = fs::remove_file(&media_out);
                report_error(store, user, file, "transcription failed");
                return JobOutcome::Failed;
            }
        };

        if !input.exists() {
            let _ = fs::remove_file(&media_out);
            return self.abandon(user, file);
        }

        self.commit_artifacts(user, file, &segments, &language)
    }

    fn process_zip_job(&self, user: &str, file: &str) -> JobOutcome {
        let store = &self.store;
        let input = store.inbox_file(user, file);
        let scratch = store.zip_scratch_dir();

        let _ = fs::remove_dir_all(&scratch);
        let tracks = match extract_zip(&input, &scratch) {
            Ok(tracks) => tracks,
            Err(err) => {
                tracing::error!("zip extraction failed for {}: {err:#}", input.display());
                report_error(store, user, file, "transcription failed");
                return JobOutcome::Failed;
            }
        };

        // The bundle estimate is the sum of its members'.
        let mut total_estimate = 0.0;
        for track in &tracks {
            let duration = match self.media.duration_secs(track) {
                Ok(duration) => duration,
                Err(_) => estimate::PROBE_FAILURE_ESTIMATE_SECS,
            };
            total_estimate +=
                estimate_from_duration(duration, self.settings.online, self.settings.device);
        }
        if let Err(err) = self.write_heartbeat(user, file, total_estimate) {
            tracing::error!("failed to write heartbeat for {user}/{file}: {err:#}");
        }

        let language = self.load_language(user);
        let hotwords = self.load_hotwords(user);
        let mut per_track = Vec::new();
        let mut usable = Vec::new();
        for track in &tracks {
            if !input.exists() {
                let _ = fs::remove_dir_all(&scratch);
                return self.abandon(user, file);
            }
            if !matches!(self.media.has_audio_stream(track), Ok(true)) {
                tracing::warn!("skipping zip member without audio: {}", track.display());
                continue;
            }
            let request = TranscribeRequest {
                audio: track,
                language: &language,
                hotwords: &hotwords,
            };
            match self.speech.transcribe(&request) {
                Ok(mut segments) => {
                    // One fixed speaker label per track; diarization across
                    // tracks is the file split itself.
                    let label = format!("SPEAKER_{:02}", usable.len());
                    for segment in &mut segments {
                        segment.speaker = Some(label.clone());
                    }
                    per_track.push(segments);
                    usable.push(track.clone());
                }
                Err(err) => {
                    tracing::error!("transcription failed for {}: {err:#}", track.display());
                    let _ = fs::remove_dir_all(&scratch);
                    report_error(store, user, file, "transcription failed");
                    return JobOutcome::Failed;
                }
            }
        }

        if usable.is_empty() {
            let _ = fs::remove_dir_all(&scratch);
            report_error(store, user, file, "no audio track");
            return JobOutcome::Failed;
        }

        let merged = merge_tracks(per_track);

        if let Err(err) = fs::create_dir_all(store.out_dir(user)) {
            tracing::error!("failed to create outbox for {user}: {err}");
        }
        let mix = scratch.join("mix.mp4");
        match self.media.mix_tracks(&usable, &mix) {
            Ok(()) => {
                if let Err(err) = self.media.normalize(&mix, &store.media_mp4(user, file)) {
                    tracing::warn!("normalization of the mix failed: {err:#}");
                }
            }
            Err(err) => tracing::warn!("mixing zip tracks failed: {err:#}"),
        }
        let _ = fs::remove_dir_all(&scratch);

        if !input.exists() {
            let _ = fs::remove_file(store.media_mp4(user, file));
            return self.abandon(user, file);
        }

        self.commit_artifacts(user, file, &merged, &language)
    }

    /// Write the subtitle and editor artifacts, then retire the job from the
    /// inbox. The editor HTML is the commit point: once it exists the job is
    /// done, so it is written last.
    fn commit_artifacts(
        &self,
        user: &str,
        file: &str,
        segments: &[TranscriptSegment],
        language: &str,
    ) -> JobOutcome {
        let store = &self.store;
        let srt = render_srt(segments);
        let editor = render_editor(segments, file, language);

        let write = (|| -> Result<()> {
            fs::create_dir_all(store.out_dir(user))?;
            fs::write(store.subtitle_srt(user, file), srt)
                .with_context(|| format!("failed to write subtitles for {user}/{file}"))?;
            fs::write(store.editor_html(user, file), editor)
                .with_context(|| format!("failed to write editor for {user}/{file}"))?;
            Ok(())
        })();
        if let Err(err) = write {
            tracing::error!("{err:#}");
            let _ = fs::remove_file(store.subtitle_srt(user, file));
            let _ = fs::remove_file(store.editor_html(user, file));
            report_error(store, user, file, "failed to build the editor");
            return JobOutcome::Failed;
        }

        for path in [
            store.inbox_file(user, file),
            store.processing_marker(user, file),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => tracing::error!("failed to remove {}: {err}", path.display()),
            }
        }
        tracing::info!("finished {user}/{file} ({} segments)", segments.len());
        JobOutcome::Completed
    }

    /// The user deleted the input mid-flight: clear our markers, produce
    /// nothing.
    fn abandon(&self, user: &str, file: &str) -> JobOutcome {
        tracing::info!("input {user}/{file} disappeared; abandoning the job");
        let _ = fs::remove_file(self.store.processing_marker(user, file));
        for beat in self.store.heartbeats_for(user, file) {
            let _ = fs::remove_file(beat);
        }
        JobOutcome::Abandoned
    }

    /// Replace the user's heartbeat directory with a single fresh beacon;
    /// there is never more than one per user.
    fn write_heartbeat(&self, user: &str, file: &str, estimate_secs: f64) -> Result<()> {
        let dir = self.store.worker_dir(user);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let beat = Heartbeat::new(estimate_secs, unix_now_secs(), file);
        let path = dir.join(beat.encode());
        fs::write(&path, b"").with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn load_hotwords(&self, user: &str) -> Vec<String> {
        fs::read_to_string(self.store.hotwords_file(user))
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn load_language(&self, user: &str) -> String {
        fs::read_to_string(self.store.language_file(user))
            .map(|text| text.trim().to_string())
            .ok()
            .filter(|language| !language.is_empty())
            .unwrap_or_else(|| "de".to_string())
    }
}

/// Unpack a zip bundle into `dest`, returning the extracted regular files in
/// archive order. Entries with unsafe paths are skipped.
fn extract_zip(input: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let reader = fs::File::open(input)
        .with_context(|| format!("failed to open {}", input.display()))?;
    let mut archive = zip::ZipArchive::new(reader)
        .with_context(|| format!("failed to read zip archive {}", input.display()))?;

    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;

    let mut extracted = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read zip entry {index}"))?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!("skipping zip entry with unsafe path: {}", entry.name());
            continue;
        };
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = fs::File::create(&target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to extract {}", target.display()))?;
        extracted.push(target);
    }
    Ok(extracted)
}
