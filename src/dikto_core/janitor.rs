use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;

use crate::dikto_core::store::StoreRoot;

/// User trees idle longer than this are removed.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(7 * 24 * 3600);

/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Grace period after process start before the first sweep.
const STARTUP_DELAY: Duration = Duration::from_secs(60);

/// The fixed offline identity is never swept.
const RESERVED_USER: &str = "local";

/// Newest mtime of anything belonging to `user`, across all four roots.
/// Empty trees fall back to the directory's own mtime.
fn latest_activity_ms(store: &StoreRoot, user: &str) -> u64 {
    let mut latest = 0u64;
    for root in [
        store.in_dir(user),
        store.out_dir(user),
        store.error_dir(user),
        store.worker_dir(user),
    ] {
        if !root.exists() {
            continue;
        }
        let mut stack = vec![root.clone()];
        let mut saw_file = false;
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    saw_file = true;
                    latest = latest.max(crate::dikto_core::queue::mtime_ms(&path));
                }
            }
        }
        if !saw_file {
            latest = latest.max(crate::dikto_core::queue::mtime_ms(&root));
        }
    }
    latest
}

fn remove_user_tree(store: &StoreRoot, user: &str) {
    for root in [
        store.in_dir(user),
        store.out_dir(user),
        store.error_dir(user),
        store.worker_dir(user),
    ] {
        if !root.exists() {
            continue;
        }
        match fs::remove_dir_all(&root) {
            Ok(()) => tracing::info!("removed inactive user directory {}", root.display()),
            Err(err) => tracing::error!("failed to remove {}: {err}", root.display()),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Remove the trees of users whose newest file is older than the idle
/// threshold. Idleness is confirmed a second time under a per-user advisory
/// lock so a user who became active between the scan and the delete is
/// skipped. Returns how many users were removed.
pub fn sweep_idle_users(store: &StoreRoot) -> usize {
    let threshold = now_ms().saturating_sub(IDLE_THRESHOLD.as_millis() as u64);
    let mut removed = 0usize;

    for user in store.known_users() {
        if user == RESERVED_USER {
            continue;
        }
        let latest = latest_activity_ms(store, &user);
        if latest >= threshold {
            continue;
        }

        let lock_path = store.janitor_lock_path(&user);
        let lock = match fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(err) => {
                tracing::error!("failed to open {}: {err}", lock_path.display());
                continue;
            }
        };
        if lock.try_lock_exclusive().is_err() {
            continue;
        }

        // Re-check while holding the lock.
        if latest_activity_ms(store, &user) < threshold {
            let last_seen = chrono::DateTime::from_timestamp_millis(latest as i64)
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            tracing::info!("user {user} idle since {last_seen}; removing");
            remove_user_tree(store, &user);
            removed += 1;
        }

        let _ = lock.unlock();
        let _ = fs::remove_file(&lock_path);
    }

    if removed > 0 {
        tracing::info!("janitor removed {removed} inactive user directories");
    }
    removed
}

/// Start the background sweep thread.
pub fn spawn(root: &Path) -> thread::JoinHandle<()> {
    let store = StoreRoot::new(root);
    thread::Builder::new()
        .name("dikto-janitor".to_string())
        .spawn(move || {
            thread::sleep(STARTUP_DELAY);
            loop {
                sweep_idle_users(&store);
                thread::sleep(SWEEP_INTERVAL);
            }
        })
        .expect("failed to spawn janitor thread")
}
