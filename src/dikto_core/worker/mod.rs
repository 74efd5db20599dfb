mod pipeline;
mod report;

use std::fs;
use std::io;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use fs2::FileExt;

pub use pipeline::JobOutcome;
pub use report::report_error;

use crate::dikto_core::media::MediaTools;
use crate::dikto_core::settings::{Device, Settings};
use crate::dikto_core::speech::SpeechPipeline;
use crate::dikto_core::store::StoreRoot;
use crate::dikto_core::unix_now_secs;

/// The transcription worker: a single-threaded loop that drains the global
/// inbox in modification-time order. There is intentionally no concurrency
/// here; the accelerator is the bottleneck.
pub struct Worker<M: MediaTools, S: SpeechPipeline> {
    pub(crate) store: StoreRoot,
    pub(crate) settings: Settings,
    pub(crate) media: M,
    pub(crate) speech: S,
}

/// One eligible inbox file. Ordered by `(mtime_ms, user, file)`, the same
/// key the frontend's queue view uses, so pickup order matches displayed
/// positions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Candidate {
    mtime_ms: u64,
    user: String,
    file: String,
}

impl<M: MediaTools, S: SpeechPipeline> Worker<M, S> {
    pub fn new(settings: Settings, media: M, speech: S) -> Self {
        let store = StoreRoot::new(&settings.root);
        Self {
            store,
            settings,
            media,
            speech,
        }
    }

    pub fn store(&self) -> &StoreRoot {
        &self.store
    }

    /// Guard against a second worker process sharing the same root: an
    /// exclusive advisory lock on `worker/.lock`, held for the process
    /// lifetime.
    pub fn acquire_instance_lock(&self) -> Result<fs::File> {
        let path = self.store.worker_lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "another worker already holds {}; refusing to start",
                path.display()
            )
        })?;
        Ok(file)
    }

    /// Run forever. Returns only on the MPS backend, which exits after each
    /// completed job to work around an accelerator memory leak (a supervisor
    /// restarts the process).
    pub fn run(&self) -> Result<()> {
        let _lock = self.acquire_instance_lock()?;
        self.store.ensure_tree()?;
        tracing::info!("worker ready (root {})", self.settings.root.display());

        loop {
            match self.run_once() {
                Some(JobOutcome::Completed) if self.settings.device == Device::Mps => {
                    tracing::info!("restarting after one job to reclaim accelerator memory");
                    return Ok(());
                }
                // Go straight for the next pickup; only an empty scan (or a
                // pick lost to a concurrent acquirer) waits out a beat.
                Some(_) => {}
                None => thread::sleep(Duration::from_secs(1)),
            }
        }
    }

    /// Process at most one job: scan, acquire the oldest eligible candidate,
    /// run the pipeline, sweep the heartbeat. Returns `None` when the queue
    /// is empty or the pick was lost to a concurrent acquirer.
    pub fn run_once(&self) -> Option<JobOutcome> {
        let candidates = self.scan_candidates();
        tracing::debug!("{} files in queue", candidates.len());
        let job = candidates.into_iter().next()?;

        if !self.mark_processing(&job.user, &job.file) {
            return None;
        }

        let outcome = self.process_job(&job.user, &job.file);

        // The heartbeat never outlives the loop iteration that created it.
        for beat in self.store.heartbeats_for(&job.user, &job.file) {
            let _ = fs::remove_file(beat);
        }
        Some(outcome)
    }

    /// All inbox files that may be picked up right now, in pickup order.
    /// Scanning has side effects mandated by the lifecycle rules: stuck
    /// markers promote their jobs to errors, unreadable markers are dropped,
    /// and committed-but-unretired inbox entries finish their retirement.
    fn scan_candidates(&self) -> Vec<Candidate> {
        let store = &self.store;
        let mut candidates = Vec::new();

        let Ok(users) = fs::read_dir(store.in_root()) else {
            return candidates;
        };
        for user_entry in users.flatten() {
            if !user_entry.path().is_dir() {
                continue;
            }
            let Ok(user) = user_entry.file_name().into_string() else {
                continue;
            };
            let Ok(entries) = fs::read_dir(store.in_dir(&user)) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Ok(file) = entry.file_name().into_string() else {
                    continue;
                };
                if !StoreRoot::is_job_entry(&file) {
                    continue;
                }

                if store.editor_html(&user, &file).exists() {
                    // Crash window between artifact commit and inbox
                    // retirement; finish the retirement now.
                    let _ = fs::remove_file(&path);
                    let _ = fs::remove_file(store.processing_marker(&user, &file));
                    continue;
                }

                match self.marker_state(&user, &file) {
                    MarkerState::Absent => {}
                    MarkerState::Fresh => continue,
                    MarkerState::Stuck => {
                        report_error(store, &user, &file, "processing stuck or failed");
                        continue;
                    }
                    MarkerState::Unreadable => {
                        // Drop the bad marker; the file becomes eligible on
                        // the next scan.
                        let _ = fs::remove_file(store.processing_marker(&user, &file));
                        continue;
                    }
                }

                candidates.push(Candidate {
                    mtime_ms: crate::dikto_core::queue::mtime_ms(&path),
                    user: user.clone(),
                    file,
                });
            }
        }

        candidates.sort();
        candidates
    }

    fn marker_state(&self, user: &str, file: &str) -> MarkerState {
        let marker = self.store.processing_marker(user, file);
        let raw = match fs::read_to_string(&marker) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return MarkerState::Absent,
            Err(_) => return MarkerState::Unreadable,
        };
        let Ok(acquired_at) = raw.trim().parse::<u64>() else {
            return MarkerState::Unreadable;
        };
        if unix_now_secs().saturating_sub(acquired_at) >= self.settings.stuck_secs {
            MarkerState::Stuck
        } else {
            MarkerState::Fresh
        }
    }

    /// Take the single-acquirer lock for a job by creating its `.processing`
    /// marker exclusively. A lost race means another pickup happened first.
    fn mark_processing(&self, user: &str, file: &str) -> bool {
        use std::io::Write;

        let marker = self.store.processing_marker(user, file);
        let created = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker);
        match created {
            Ok(mut handle) => {
                if let Err(err) = write!(handle, "{}", unix_now_secs()) {
                    tracing::error!("failed to write {}: {err}", marker.display());
                }
                true
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => false,
            Err(err) => {
                tracing::error!("failed to create {}: {err}", marker.display());
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerState {
    Absent,
    Fresh,
    Stuck,
    Unreadable,
}
