use std::fs;

use crate::dikto_core::domain::{Heartbeat, JobPatch, JobState};
use crate::dikto_core::queue::format_wait;
use crate::dikto_core::session::{SessionState, UiEvent};
use crate::dikto_core::store::StoreRoot;
use crate::dikto_core::unix_now_secs;

/// Heartbeat progress beyond which the job is in its artifact-writing tail
/// and the remaining-time estimate stops being meaningful.
const POST_PROCESSING_THRESHOLD: f64 = 0.95;

/// One tick of the per-session progress listener (1 s cadence while the
/// session is connected).
///
/// Reads the user's heartbeat directory, updates the session's live-progress
/// overlay, cleans up stale or malformed heartbeats, and publishes refresh
/// events. Never writes into the worker's channel beyond deleting heartbeats
/// whose inbox file is gone.
pub fn listen_tick(store: &StoreRoot, session: &mut SessionState) {
    let user = session.user.clone();

    if let Ok(entries) = fs::read_dir(store.worker_dir(&user)) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(beat) = Heartbeat::parse(&name) else {
                tracing::debug!("removing malformed heartbeat {}", path.display());
                let _ = fs::remove_file(&path);
                continue;
            };

            if !store.inbox_file(&user, &beat.file_name).exists() {
                // Job finished or was cancelled; the heartbeat is stale.
                let _ = fs::remove_file(&path);
                continue;
            }

            let now = unix_now_secs();
            let progress = beat.progress_at(now);
            let patch = if progress > POST_PROCESSING_THRESHOLD {
                JobPatch {
                    file_name: beat.file_name.clone(),
                    state: JobState::PostProcessing,
                    message: "file is being finalized (writing subtitles, building editor)"
                        .to_string(),
                    progress: progress * 100.0,
                    remaining_secs: beat.remaining_at(now),
                }
            } else {
                let remaining = beat.remaining_at(now);
                JobPatch {
                    file_name: beat.file_name.clone(),
                    state: JobState::Processing,
                    message: format!(
                        "Transcribing. Estimated time remaining: {}",
                        format_wait(remaining as f64)
                    ),
                    progress: progress * 100.0,
                    remaining_secs: remaining,
                }
            };

            let newly_in_progress =
                session.file_in_progress.as_deref() != Some(beat.file_name.as_str());
            session.live = Some(patch);
            session.file_in_progress = Some(beat.file_name.clone());
            session.publish(UiEvent::QueueChanged);
            if newly_in_progress {
                session.publish(UiEvent::ResultsChanged);
            }
            sync_known_errors(store, session);
            return;
        }
    }

    // No heartbeat left. If one was live on the previous tick, the job just
    // finished (or vanished) and the result list needs a refresh.
    let finished = session.file_in_progress.take();
    session.live = None;
    session.publish(UiEvent::QueueChanged);
    if finished.is_some() {
        session.publish(UiEvent::ResultsChanged);
    }
    sync_known_errors(store, session);
}

/// Track error entries; a newly appearing one invalidates the result list.
fn sync_known_errors(store: &StoreRoot, session: &mut SessionState) {
    let Ok(entries) = fs::read_dir(store.error_dir(&session.user)) else {
        return;
    };
    let mut new_errors = false;
    for entry in entries.flatten() {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.ends_with(".txt") || !entry.path().is_file() {
            continue;
        }
        if session.known_errors.insert(name) {
            new_errors = true;
        }
    }
    if new_errors {
        session.publish(UiEvent::ResultsChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dikto_core::unix_now_secs;
    use std::fs;

    fn setup(user: &str) -> (tempfile::TempDir, StoreRoot, SessionState) {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreRoot::new(dir.path());
        store.ensure_tree().unwrap();
        fs::create_dir_all(store.in_dir(user)).unwrap();
        fs::create_dir_all(store.worker_dir(user)).unwrap();
        fs::create_dir_all(store.error_dir(user)).unwrap();
        let session = SessionState::new(user);
        (dir, store, session)
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn live_heartbeat_produces_a_processing_patch() {
        let (_dir, store, mut session) = setup("u");
        fs::write(store.inbox_file("u", "a.mp3"), b"media").unwrap();
        let beat = Heartbeat::new(100.0, unix_now_secs() - 50, "a.mp3");
        fs::write(store.worker_dir("u").join(beat.encode()), b"").unwrap();
        let mut rx = session.subscribe();

        listen_tick(&store, &mut session);

        let patch = session.live.as_ref().expect("live patch");
        assert_eq!(patch.state, JobState::Processing);
        assert!(patch.progress > 40.0 && patch.progress < 60.0);
        assert_eq!(session.file_in_progress.as_deref(), Some("a.mp3"));
        let events = drain(&mut rx);
        assert!(events.contains(&UiEvent::QueueChanged));
        assert!(events.contains(&UiEvent::ResultsChanged));
    }

    #[test]
    fn near_complete_heartbeat_switches_to_post_processing() {
        let (_dir, store, mut session) = setup("u");
        fs::write(store.inbox_file("u", "a.mp3"), b"media").unwrap();
        let beat = Heartbeat::new(100.0, unix_now_secs() - 99, "a.mp3");
        fs::write(store.worker_dir("u").join(beat.encode()), b"").unwrap();

        listen_tick(&store, &mut session);

        let patch = session.live.as_ref().expect("live patch");
        assert_eq!(patch.state, JobState::PostProcessing);
        assert!(patch.message.contains("finalized"));
    }

    #[test]
    fn stale_heartbeat_is_removed_when_inbox_file_is_gone() {
        let (_dir, store, mut session) = setup("u");
        let beat = Heartbeat::new(100.0, unix_now_secs(), "gone.mp3");
        let path = store.worker_dir("u").join(beat.encode());
        fs::write(&path, b"").unwrap();

        listen_tick(&store, &mut session);

        assert!(!path.exists());
        assert!(session.live.is_none());
    }

    #[test]
    fn malformed_heartbeats_are_deleted() {
        let (_dir, store, mut session) = setup("u");
        let path = store.worker_dir("u").join("nonsense");
        fs::write(&path, b"").unwrap();

        listen_tick(&store, &mut session);

        assert!(!path.exists());
    }

    #[test]
    fn completion_clears_live_state_and_refreshes_results() {
        let (_dir, store, mut session) = setup("u");
        session.file_in_progress = Some("a.mp3".to_string());
        session.live = Some(JobPatch {
            file_name: "a.mp3".to_string(),
            state: JobState::Processing,
            message: String::new(),
            progress: 50.0,
            remaining_secs: 5,
        });
        let mut rx = session.subscribe();

        listen_tick(&store, &mut session);

        assert!(session.live.is_none());
        assert!(session.file_in_progress.is_none());
        let events = drain(&mut rx);
        assert!(events.contains(&UiEvent::ResultsChanged));
    }

    #[test]
    fn new_error_entry_triggers_result_refresh() {
        let (_dir, store, mut session) = setup("u");
        fs::write(store.error_file("u", "bad.mp3"), b"media").unwrap();
        let mut rx = session.subscribe();

        listen_tick(&store, &mut session);
        let events = drain(&mut rx);
        assert!(events.contains(&UiEvent::ResultsChanged));

        // Second tick: the same error is known, no result refresh.
        listen_tick(&store, &mut session);
        let events = drain(&mut rx);
        assert!(!events.contains(&UiEvent::ResultsChanged));
    }
}
