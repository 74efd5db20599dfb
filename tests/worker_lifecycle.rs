//! End-to-end worker scenarios against a temp root: FIFO pickup across
//! users, artifact production, error reporting, stuck-marker promotion,
//! mid-flight cancellation and zip bundles.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use filetime::{set_file_mtime, FileTime};

use dikto::dikto_core::domain::TranscriptSegment;
use dikto::{Device, JobOutcome, MediaTools, Settings, SpeechPipeline, StoreRoot, TranscribeRequest, Worker};

struct StubMedia {
    duration: f64,
    has_audio: bool,
}

impl Default for StubMedia {
    fn default() -> Self {
        Self {
            duration: 60.0,
            has_audio: true,
        }
    }
}

impl MediaTools for StubMedia {
    fn duration_secs(&self, _source: &Path) -> Result<f64> {
        Ok(self.duration)
    }

    fn has_audio_stream(&self, _source: &Path) -> Result<bool> {
        Ok(self.has_audio)
    }

    fn normalize(&self, source: &Path, dest: &Path) -> Result<PathBuf> {
        fs::copy(source, dest)?;
        Ok(dest.to_path_buf())
    }

    fn mix_tracks(&self, _sources: &[PathBuf], dest: &Path) -> Result<()> {
        fs::write(dest, b"mixed audio")?;
        Ok(())
    }
}

/// Speech pipeline driven by a closure so each test controls segments and
/// side effects.
struct ScriptedSpeech<F>(F);

impl<F> SpeechPipeline for ScriptedSpeech<F>
where
    F: Fn(&TranscribeRequest<'_>) -> Result<Vec<TranscriptSegment>> + Send + Sync,
{
    fn transcribe(&self, request: &TranscribeRequest<'_>) -> Result<Vec<TranscriptSegment>> {
        (self.0)(request)
    }
}

fn segment(start: f64, end: f64, text: &str) -> TranscriptSegment {
    TranscriptSegment {
        start,
        end,
        text: text.to_string(),
        speaker: Some("SPEAKER_00".to_string()),
        language: None,
    }
}

fn echo_speech() -> ScriptedSpeech<impl Fn(&TranscribeRequest<'_>) -> Result<Vec<TranscriptSegment>> + Send + Sync>
{
    ScriptedSpeech(|request: &TranscribeRequest<'_>| {
        let name = request
            .audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(vec![segment(0.0, 2.0, &format!("transcript of {name}"))])
    })
}

fn settings(root: &Path) -> Settings {
    Settings {
        root: root.to_path_buf(),
        online: true,
        device: Device::Cuda,
        batch_size: 4,
        storage_secret: None,
        ssl_certfile: None,
        ssl_keyfile: None,
        port: 8080,
        stuck_secs: 600,
        asr_command: None,
        hf_auth_token: None,
    }
}

fn seed_job(store: &StoreRoot, user: &str, file: &str, mtime_secs: i64) {
    fs::create_dir_all(store.in_dir(user)).unwrap();
    let path = store.inbox_file(user, file);
    fs::write(&path, b"fake media bytes").unwrap();
    set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
}

#[test]
fn completes_a_job_and_retires_the_inbox_entry() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Worker::new(settings(dir.path()), StubMedia::default(), echo_speech());
    let store = worker.store().clone();
    store.ensure_tree().unwrap();
    seed_job(&store, "local", "a.mp3", 1_000);

    let outcome = worker.run_once();

    assert_eq!(outcome, Some(JobOutcome::Completed));
    assert!(store.editor_html("local", "a.mp3").exists());
    assert!(store.subtitle_srt("local", "a.mp3").exists());
    assert!(store.media_mp4("local", "a.mp3").exists());
    assert!(!store.inbox_file("local", "a.mp3").exists());
    assert!(!store.processing_marker("local", "a.mp3").exists());
    assert!(store.heartbeats_for("local", "a.mp3").is_empty());

    let srt = fs::read_to_string(store.subtitle_srt("local", "a.mp3")).unwrap();
    assert!(srt.starts_with("1\n00:00:00,000 --> 00:00:02,000\n"));
    assert!(srt.contains("SPEAKER_00: transcript of a.mp3"));

    // Nothing left to do.
    assert_eq!(worker.run_once(), None);
}

#[test]
fn picks_the_globally_oldest_job_first() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Worker::new(settings(dir.path()), StubMedia::default(), echo_speech());
    let store = worker.store().clone();
    store.ensure_tree().unwrap();
    // Same file name for two users, uploaded 200 ms apart.
    seed_job(&store, "u2", "t.wav", 2_000);
    seed_job(&store, "u1", "t.wav", 1_000);

    assert_eq!(worker.run_once(), Some(JobOutcome::Completed));
    assert!(store.editor_html("u1", "t.wav").exists());
    assert!(!store.editor_html("u2", "t.wav").exists());

    assert_eq!(worker.run_once(), Some(JobOutcome::Completed));
    assert!(store.editor_html("u2", "t.wav").exists());
}

#[test]
fn marker_exists_and_heartbeat_is_unique_while_processing() {
    let dir = tempfile::tempdir().unwrap();
    let observations: Arc<Mutex<Vec<(bool, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let observed = observations.clone();
    let root = dir.path().to_path_buf();
    let speech = ScriptedSpeech(move |_request: &TranscribeRequest<'_>| {
        let store = StoreRoot::new(&root);
        let marker = store.processing_marker("local", "a.mp3").exists();
        let beats = fs::read_dir(store.worker_dir("local"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        observed.lock().unwrap().push((marker, beats));
        Ok(vec![segment(0.0, 1.0, "hi")])
    });
    let worker = Worker::new(settings(dir.path()), StubMedia::default(), speech);
    let store = worker.store().clone();
    store.ensure_tree().unwrap();
    seed_job(&store, "local", "a.mp3", 1_000);

    worker.run_once();

    let seen = observations.lock().unwrap();
    assert_eq!(seen.as_slice(), &[(true, 1)]);
}

#[test]
fn input_without_audio_is_reported_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let media = StubMedia {
        has_audio: false,
        ..StubMedia::default()
    };
    let worker = Worker::new(settings(dir.path()), media, echo_speech());
    let store = worker.store().clone();
    store.ensure_tree().unwrap();
    seed_job(&store, "local", "silent.mp4", 1_000);

    assert_eq!(worker.run_once(), Some(JobOutcome::Failed));
    assert!(!store.inbox_file("local", "silent.mp4").exists());
    assert_eq!(
        fs::read_to_string(store.error_text("local", "silent.mp4")).unwrap(),
        "no audio track"
    );
    assert!(store.error_file("local", "silent.mp4").exists());
    assert!(store.heartbeats_for("local", "silent.mp4").is_empty());
    // Errored jobs are not retried.
    assert_eq!(worker.run_once(), None);
}

#[test]
fn stuck_marker_promotes_the_job_to_errored() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Worker::new(settings(dir.path()), StubMedia::default(), echo_speech());
    let store = worker.store().clone();
    store.ensure_tree().unwrap();
    seed_job(&store, "local", "a.mp3", 1_000);
    // Marker acquired 11 minutes ago, worker crashed since.
    let acquired = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        - 660;
    let mut marker = fs::File::create(store.processing_marker("local", "a.mp3")).unwrap();
    write!(marker, "{acquired}").unwrap();

    assert_eq!(worker.run_once(), None);
    assert_eq!(
        fs::read_to_string(store.error_text("local", "a.mp3")).unwrap(),
        "processing stuck or failed"
    );
    assert!(store.error_file("local", "a.mp3").exists());
    assert!(!store.inbox_file("local", "a.mp3").exists());
    assert!(!store.processing_marker("local", "a.mp3").exists());
}

#[test]
fn fresh_marker_blocks_pickup() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Worker::new(settings(dir.path()), StubMedia::default(), echo_speech());
    let store = worker.store().clone();
    store.ensure_tree().unwrap();
    seed_job(&store, "local", "a.mp3", 1_000);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    fs::write(store.processing_marker("local", "a.mp3"), now.to_string()).unwrap();

    assert_eq!(worker.run_once(), None);
    assert!(store.inbox_file("local", "a.mp3").exists());
    assert!(store.processing_marker("local", "a.mp3").exists());
}

#[test]
fn unreadable_marker_is_dropped_and_job_retried_next_scan() {
    let dir = tempfile::tempdir().unwrap();
    let worker = Worker::new(settings(dir.path()), StubMedia::default(), echo_speech());
    let store = worker.store().clone();
    store.ensure_tree().unwrap();
    seed_job(&store, "local", "a.mp3", 1_000);
    fs::write(store.processing_marker("local", "a.mp3"), "not-a-number").unwrap();

    assert_eq!(worker.run_once(), None);
    assert!(!store.processing_marker("local", "a.mp3").exists());

    assert_eq!(worker.run_once(), Some(JobOutcome::Completed));
    assert!(store.editor_html("local", "a.mp3").exists());
}

#[test]
fn deleting_the_input_mid_flight_abandons_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    // The user cancels while transcription is running.
    let speech = ScriptedSpeech(move |_request: &TranscribeRequest<'_>| {
        let store = StoreRoot::new(&root);
        fs::remove_file(store.inbox_file("local", "a.mp3")).unwrap();
        Ok(vec![segment(0.0, 1.0, "discarded")])
    });
    let worker = Worker::new(settings(dir.path()), StubMedia::default(), speech);
    let store = worker.store().clone();
    store.ensure_tree().unwrap();
    seed_job(&store, "local", "a.mp3", 1_000);

    assert_eq!(worker.run_once(), Some(JobOutcome::Abandoned));
    assert!(!store.editor_html("local", "a.mp3").exists());
    assert!(!store.subtitle_srt("local", "a.mp3").exists());
    assert!(!store.media_mp4("local", "a.mp3").exists());
    assert!(!store.processing_marker("local", "a.mp3").exists());
    assert!(store.heartbeats_for("local", "a.mp3").is_empty());
    assert!(!store.error_dir("local").join("a.mp3").exists());
}

fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
    let file = fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, bytes) in members {
        writer.start_file(name.to_string(), options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}

#[test]
fn zip_bundle_merges_tracks_by_start_time() {
    let dir = tempfile::tempdir().unwrap();
    let speech = ScriptedSpeech(|request: &TranscribeRequest<'_>| {
        let name = request
            .audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let segments = if name == "first.wav" {
            vec![segment(0.0, 1.0, "f0"), segment(4.0, 5.0, "f1")]
        } else {
            vec![segment(1.0, 2.0, "s0"), segment(2.5, 3.0, "s1")]
        };
        Ok(segments)
    });
    let worker = Worker::new(settings(dir.path()), StubMedia::default(), speech);
    let store = worker.store().clone();
    store.ensure_tree().unwrap();

    fs::create_dir_all(store.in_dir("local")).unwrap();
    let bundle = store.inbox_file("local", "clip.zip");
    write_zip(&bundle, &[("first.wav", b"aaa"), ("second.wav", b"bbb")]);
    set_file_mtime(&bundle, FileTime::from_unix_time(1_000, 0)).unwrap();

    assert_eq!(worker.run_once(), Some(JobOutcome::Completed));

    assert!(store.editor_html("local", "clip.zip").exists());
    assert!(store.media_mp4("local", "clip.zip").exists());
    assert!(!store.inbox_file("local", "clip.zip").exists());

    let srt = fs::read_to_string(store.subtitle_srt("local", "clip.zip")).unwrap();
    // Globally sorted by start time, per-track speaker labels.
    let speakers: Vec<&str> = srt
        .lines()
        .filter(|line| line.starts_with("SPEAKER_"))
        .collect();
    assert_eq!(
        speakers,
        vec![
            "SPEAKER_00: f0",
            "SPEAKER_01: s0",
            "SPEAKER_01: s1",
            "SPEAKER_00: f1",
        ]
    );
}

#[test]
fn zip_without_usable_tracks_is_a_fatal_error() {
    let dir = tempfile::tempdir().unwrap();
    let media = StubMedia {
        has_audio: false,
        ..StubMedia::default()
    };
    let worker = Worker::new(settings(dir.path()), media, echo_speech());
    let store = worker.store().clone();
    store.ensure_tree().unwrap();

    fs::create_dir_all(store.in_dir("local")).unwrap();
    let bundle = store.inbox_file("local", "clip.zip");
    write_zip(&bundle, &[("first.wav", b"aaa")]);
    set_file_mtime(&bundle, FileTime::from_unix_time(1_000, 0)).unwrap();

    assert_eq!(worker.run_once(), Some(JobOutcome::Failed));
    assert_eq!(
        fs::read_to_string(store.error_text("local", "clip.zip")).unwrap(),
        "no audio track"
    );
    assert!(!store.editor_html("local", "clip.zip").exists());
    assert!(!store.subtitle_srt("local", "clip.zip").exists());
}

#[test]
fn second_worker_on_the_same_root_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let first = Worker::new(settings(dir.path()), StubMedia::default(), echo_speech());
    let second = Worker::new(settings(dir.path()), StubMedia::default(), echo_speech());
    first.store().ensure_tree().unwrap();

    let _held = first.acquire_instance_lock().unwrap();
    assert!(second.acquire_instance_lock().is_err());
}
