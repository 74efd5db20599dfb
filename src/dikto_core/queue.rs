use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::join_all;

use crate::dikto_core::domain::{Heartbeat, JobRecord, JobState};
use crate::dikto_core::estimate;
use crate::dikto_core::media::DurationProber;
use crate::dikto_core::settings::Settings;
use crate::dikto_core::store::StoreRoot;
use crate::dikto_core::unix_now_secs;

/// One pending job in the cross-user queue.
///
/// Ordering is `(mtime_ms, user, file_name)`: modification time first, with
/// the lexicographic pair as the tie-break on filesystems with coarse mtime
/// granularity. The worker scan applies the same key.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalEntry {
    pub user: String,
    pub file_name: String,
    pub mtime_ms: u64,
    /// Estimated processing time; for a job with a live heartbeat this is the
    /// remaining portion, not the full estimate.
    pub estimate_secs: f64,
}

impl GlobalEntry {
    fn sort_key(&self) -> (u64, &str, &str) {
        (self.mtime_ms, self.user.as_str(), self.file_name.as_str())
    }
}

pub(crate) fn mtime_ms(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Pending inbox files of one user, without estimates.
fn pending_files(store: &StoreRoot, user: &str) -> Vec<(String, u64)> {
    let mut files = Vec::new();
    let Ok(entries) = fs::read_dir(store.in_dir(user)) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !StoreRoot::is_job_entry(&name) {
            continue;
        }
        if store.editor_html(user, &name).exists() {
            // Completion is committed; the inbox entry is about to disappear.
            continue;
        }
        files.push((name, mtime_ms(&path)));
    }
    files
}

/// Live remaining seconds for a user's in-flight job, keyed by file name.
fn heartbeat_remaining(store: &StoreRoot, user: &str) -> Vec<(String, f64)> {
    let now = unix_now_secs();
    let mut remaining = Vec::new();
    if let Ok(entries) = fs::read_dir(store.worker_dir(user)) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if let Some(beat) = Heartbeat::parse(&name.to_string_lossy()) {
                remaining.push((beat.file_name.clone(), beat.remaining_at(now) as f64));
            }
        }
    }
    remaining
}

/// Scan the whole inbox tree into the global FIFO queue, estimating every
/// pending file. Probes run concurrently; the filesystem is the source of
/// truth on every call.
pub async fn scan_global_queue(
    store: &StoreRoot,
    prober: &dyn DurationProber,
    settings: &Settings,
) -> Vec<GlobalEntry> {
    let mut pending = Vec::new();
    for user in store.known_users() {
        let remaining = heartbeat_remaining(store, &user);
        for (file_name, mtime) in pending_files(store, &user) {
            let live = remaining
                .iter()
                .find(|(name, _)| *name == file_name)
                .map(|(_, secs)| *secs);
            pending.push((user.clone(), file_name, mtime, live));
        }
    }

    let estimates = join_all(pending.iter().map(|(user, file_name, _, live)| {
        let path = store.inbox_file(user, file_name);
        async move {
            match live {
                Some(secs) => *secs,
                None => {
                    estimate::estimate_for_file(prober, &path, settings.online, settings.device)
                        .await
                }
            }
        }
    }))
    .await;

    let mut queue: Vec<GlobalEntry> = pending
        .into_iter()
        .zip(estimates)
        .map(|((user, file_name, mtime_ms, _), estimate_secs)| GlobalEntry {
            user,
            file_name,
            mtime_ms,
            estimate_secs,
        })
        .collect();
    queue.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    queue
}

pub(crate) fn format_wait(total_secs: f64) -> String {
    let secs = total_secs.round().max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Full queue/result view for one user: pending jobs with positions and
/// ETAs, completed jobs, and failed jobs with their reasons.
pub async fn describe_queue(
    store: &StoreRoot,
    prober: &dyn DurationProber,
    settings: &Settings,
    user: &str,
) -> Vec<JobRecord> {
    let queue = scan_global_queue(store, prober, settings).await;
    let total = queue.len();
    let mut records = Vec::new();

    for (index, entry) in queue.iter().enumerate() {
        if entry.user != user {
            continue;
        }
        let wait: f64 = queue
            .iter()
            .filter(|other| other.sort_key() < entry.sort_key())
            .map(|other| other.estimate_secs)
            .sum::<f64>()
            + entry.estimate_secs;
        records.push(JobRecord {
            file_name: entry.file_name.clone(),
            state: JobState::Queued,
            message: format!(
                "Position {}/{}. Estimated wait: {}",
                index + 1,
                total,
                format_wait(wait)
            ),
            progress: 0.0,
            estimate_secs: entry.estimate_secs,
            mtime_ms: entry.mtime_ms,
        });
    }

    // Completed jobs: presence of the editor artifact is the commit point.
    if let Ok(entries) = fs::read_dir(store.out_dir(user)) {
        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".html") else {
                continue;
            };
            records.push(JobRecord {
                file_name: stem.to_string(),
                state: JobState::Done,
                message: "transcription finished".to_string(),
                progress: 100.0,
                estimate_secs: 0.0,
                mtime_ms: mtime_ms(&entry.path()),
            });
        }
    }

    // Failed jobs: the moved input plus its reason file.
    if let Ok(entries) = fs::read_dir(store.error_dir(user)) {
        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(".txt") || !entry.path().is_file() {
                continue;
            }
            let reason = fs::read_to_string(store.error_text(user, &name))
                .ok()
                .filter(|text| !text.trim().is_empty())
                .unwrap_or_else(|| "transcription failed".to_string());
            records.push(JobRecord {
                file_name: name,
                state: JobState::Errored,
                message: reason,
                progress: 0.0,
                estimate_secs: 0.0,
                mtime_ms: mtime_ms(&entry.path()),
            });
        }
    }

    records.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    records
}
