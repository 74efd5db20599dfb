use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// File names in a user's inbox that carry per-user options rather than jobs.
pub const HOTWORDS_FILE: &str = "hotwords.txt";
pub const LANGUAGE_FILE: &str = "language.txt";

/// Suffix of the single-acquirer lock the worker places next to an inbox file.
pub const PROCESSING_SUFFIX: &str = ".processing";

/// Outbox suffixes that belong to one job stem. Deleting a job removes all of
/// them.
pub const ARTIFACT_SUFFIXES: [&str; 5] = [".html", ".mp4", ".srt", ".htmlupdate", ".htmlfinal"];

/// The directory tree under `<root>/data/` is the only channel between the
/// frontend and the worker; every path in it is built here so the filename
/// conventions have exactly one owner.
#[derive(Debug, Clone)]
pub struct StoreRoot {
    data: PathBuf,
}

impl StoreRoot {
    pub fn new(root: &Path) -> Self {
        Self {
            data: root.join("data"),
        }
    }

    /// Create the four shared roots. Both processes call this at startup.
    pub fn ensure_tree(&self) -> Result<()> {
        for dir in [self.in_root(), self.out_root(), self.error_root(), self.worker_root()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn in_root(&self) -> PathBuf {
        self.data.join("in")
    }

    pub fn out_root(&self) -> PathBuf {
        self.data.join("out")
    }

    pub fn error_root(&self) -> PathBuf {
        self.data.join("error")
    }

    pub fn worker_root(&self) -> PathBuf {
        self.data.join("worker")
    }

    pub fn in_dir(&self, user: &str) -> PathBuf {
        self.in_root().join(user)
    }

    pub fn out_dir(&self, user: &str) -> PathBuf {
        self.out_root().join(user)
    }

    pub fn error_dir(&self, user: &str) -> PathBuf {
        self.error_root().join(user)
    }

    pub fn worker_dir(&self, user: &str) -> PathBuf {
        self.worker_root().join(user)
    }

    /// Staging area for in-flight uploads inside the user's inbox. Files are
    /// renamed from here into the inbox proper once fully written, so the
    /// worker never observes a half-written job.
    pub fn upload_tmp_dir(&self, user: &str) -> PathBuf {
        self.in_dir(user).join("tmp")
    }

    /// Scratch directory for zip-bundle extraction. Owned by the worker.
    pub fn zip_scratch_dir(&self) -> PathBuf {
        self.worker_root().join("zip")
    }

    /// Advisory lock taken by the worker process to guard against a second
    /// worker sharing the same root.
    pub fn worker_lock_path(&self) -> PathBuf {
        self.worker_root().join(".lock")
    }

    /// Advisory lock the janitor holds while double-checking idleness before
    /// deleting a user's tree.
    pub fn janitor_lock_path(&self, user: &str) -> PathBuf {
        self.worker_root().join(format!(".janitor-{user}.lock"))
    }

    pub fn inbox_file(&self, user: &str, file: &str) -> PathBuf {
        self.in_dir(user).join(file)
    }

    pub fn processing_marker(&self, user: &str, file: &str) -> PathBuf {
        self.in_dir(user).join(format!("{file}{PROCESSING_SUFFIX}"))
    }

    pub fn hotwords_file(&self, user: &str) -> PathBuf {
        self.in_dir(user).join(HOTWORDS_FILE)
    }

    pub fn language_file(&self, user: &str) -> PathBuf {
        self.in_dir(user).join(LANGUAGE_FILE)
    }

    pub fn artifact(&self, user: &str, file: &str, suffix: &str) -> PathBuf {
        self.out_dir(user).join(format!("{file}{suffix}"))
    }

    pub fn editor_html(&self, user: &str, file: &str) -> PathBuf {
        self.artifact(user, file, ".html")
    }

    pub fn media_mp4(&self, user: &str, file: &str) -> PathBuf {
        self.artifact(user, file, ".mp4")
    }

    pub fn subtitle_srt(&self, user: &str, file: &str) -> PathBuf {
        self.artifact(user, file, ".srt")
    }

    pub fn error_file(&self, user: &str, file: &str) -> PathBuf {
        self.error_dir(user).join(file)
    }

    pub fn error_text(&self, user: &str, file: &str) -> PathBuf {
        self.error_dir(user).join(format!("{file}.txt"))
    }

    /// True for inbox entries that are configuration, not jobs.
    pub fn is_option_file(name: &str) -> bool {
        name == HOTWORDS_FILE || name == LANGUAGE_FILE
    }

    /// True for inbox entries that represent jobs: regular names that are
    /// neither option files nor processing markers.
    pub fn is_job_entry(name: &str) -> bool {
        !Self::is_option_file(name) && !name.ends_with(PROCESSING_SUFFIX)
    }

    /// User ids present under any of the four shared roots.
    pub fn known_users(&self) -> Vec<String> {
        let mut users = Vec::new();
        for root in [self.in_root(), self.out_root(), self.error_root(), self.worker_root()] {
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                if let Ok(name) = entry.file_name().into_string() {
                    if !users.contains(&name) {
                        users.push(name);
                    }
                }
            }
        }
        users.sort();
        users
    }

    /// Heartbeat files under `worker/<user>/` whose encoded filename matches
    /// the given inbox file.
    pub fn heartbeats_for(&self, user: &str, file: &str) -> Vec<PathBuf> {
        let suffix = format!("_{file}");
        let mut matches = Vec::new();
        if let Ok(entries) = fs::read_dir(self.worker_dir(user)) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().ends_with(&suffix) {
                    matches.push(entry.path());
                }
            }
        }
        matches
    }

    /// Remove every trace of a job: the inbox entry and its marker, the error
    /// pair, all outbox artifacts sharing the stem, and matching heartbeats.
    pub fn delete_job(&self, user: &str, file: &str) {
        let mut paths = vec![
            self.inbox_file(user, file),
            self.processing_marker(user, file),
            self.error_file(user, file),
            self.error_text(user, file),
        ];
        for suffix in ARTIFACT_SUFFIXES {
            paths.push(self.artifact(user, file, suffix));
        }
        paths.extend(self.heartbeats_for(user, file));

        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!("deleted {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!("failed to delete {}: {err}", path.display()),
            }
        }
    }
}
