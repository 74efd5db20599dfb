use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dikto_core::store::StoreRoot;

/// Upper bound on a single upload. Enforced while the stream drains.
pub const MAX_UPLOAD_BYTES: u64 = 12_000_000_000;

/// How many `name_<i>.ext` disambiguations are attempted before giving up.
pub const MAX_NAME_COLLISIONS: u32 = 10_000;

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid regex"));

/// Rejections surfaced to the uploader. Everything else is an internal error.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("only audio, video or zip files can be transcribed")]
    UnsupportedMediaType,
    #[error("upload exceeds the 12 GB limit")]
    TooLarge,
    #[error("too many files with the same name")]
    TooManyCollisions,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Options accompanying an upload.
#[derive(Debug, Default, Clone)]
pub struct UploadOptions {
    /// ISO language code; empty or absent falls back to `de`.
    pub language: Option<String>,
    /// Free-text bias vocabulary, one term per line. Empty clears the stored
    /// vocabulary.
    pub hotwords: Option<String>,
}

/// Browser-side accept filter, re-checked on the server.
pub fn is_accepted_media(content_type: Option<&str>, file_name: &str) -> bool {
    if let Some(mime) = content_type {
        if mime.starts_with("audio/") || mime.starts_with("video/") {
            return true;
        }
        if mime == "application/zip" || mime == "application/x-zip-compressed" {
            return true;
        }
    }
    crate::dikto_core::estimate::is_zip(file_name)
}

/// Reduce an untrusted upload name to a safe inbox filename: drop any path
/// components, replace anything outside `[A-Za-z0-9._-]`, and keep the name
/// from starting with a dot.
pub fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let mut name = UNSAFE_CHARS.replace_all(base, "_").into_owned();
    if name.starts_with('.') {
        name.insert(0, 'f');
    }
    if name.is_empty() {
        name.push_str("upload");
    }
    name
}

/// Find a name that is free in the user's inbox, appending `_<i>` to the stem
/// until one fits.
pub fn disambiguate(in_dir: &Path, name: &str) -> Result<String, UploadError> {
    if !in_dir.join(name).exists() {
        return Ok(name.to_string());
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    for i in 1..=MAX_NAME_COLLISIONS {
        let candidate = format!("{stem}_{i}{ext}");
        if !in_dir.join(&candidate).exists() {
            return Ok(candidate);
        }
    }
    Err(UploadError::TooManyCollisions)
}

/// Move a fully staged upload into the user's inbox and persist the
/// accompanying options. The staged file must already be flushed; after the
/// rename the worker may pick the job up immediately.
pub async fn commit_upload(
    store: &StoreRoot,
    user: &str,
    original_name: &str,
    staged: &Path,
    opts: &UploadOptions,
) -> Result<String, UploadError> {
    tokio::fs::create_dir_all(store.in_dir(user)).await?;
    tokio::fs::create_dir_all(store.out_dir(user)).await?;

    let sanitized = sanitize_file_name(original_name);

    // A re-upload of a previously failed name replaces the error entry.
    for stale in [store.error_file(user, &sanitized), store.error_text(user, &sanitized)] {
        match tokio::fs::remove_file(&stale).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    let unique = {
        let in_dir = store.in_dir(user);
        disambiguate(&in_dir, &sanitized)?
    };

    let language = opts
        .language
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or("de");
    tokio::fs::write(store.language_file(user), language).await?;

    let hotwords = opts.hotwords.as_deref().map(str::trim).unwrap_or_default();
    if hotwords.is_empty() {
        match tokio::fs::remove_file(store.hotwords_file(user)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    } else {
        tokio::fs::write(store.hotwords_file(user), hotwords).await?;
    }

    let target = store.inbox_file(user, &unique);
    tokio::fs::rename(staged, &target).await?;

    tracing::info!("accepted upload {} for user {user}", target.display());
    Ok(unique)
}

/// Drop leftover staging files from interrupted uploads. Called when a
/// session opens.
pub async fn clear_upload_staging(store: &StoreRoot, user: &str) {
    let staging = store.upload_tmp_dir(user);
    if let Err(err) = tokio::fs::remove_dir_all(&staging).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to clear {}: {err}", staging.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn sanitize_strips_paths_and_bad_characters() {
        assert_eq!(sanitize_file_name("/etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(r"C:\dir\mein tolles lied.mp3"), "mein_tolles_lied.mp3");
        assert_eq!(sanitize_file_name(".hidden.wav"), "f.hidden.wav");
        assert_eq!(sanitize_file_name("über-aufnahme.mp3"), "_ber-aufnahme.mp3");
        assert_eq!(sanitize_file_name(""), "upload");
    }

    #[test]
    fn disambiguate_appends_counter_to_the_stem() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(disambiguate(dir.path(), "x.mp3").unwrap(), "x.mp3");
        fs::write(dir.path().join("x.mp3"), b"a").unwrap();
        assert_eq!(disambiguate(dir.path(), "x.mp3").unwrap(), "x_1.mp3");
        fs::write(dir.path().join("x_1.mp3"), b"a").unwrap();
        assert_eq!(disambiguate(dir.path(), "x.mp3").unwrap(), "x_2.mp3");
    }

    #[test]
    fn disambiguate_handles_extensionless_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("recording"), b"a").unwrap();
        assert_eq!(disambiguate(dir.path(), "recording").unwrap(), "recording_1");
    }

    #[tokio::test]
    async fn commit_writes_options_and_moves_the_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreRoot::new(dir.path());
        store.ensure_tree().unwrap();
        fs::create_dir_all(store.upload_tmp_dir("u")).unwrap();
        let staged = store.upload_tmp_dir("u").join("part");
        fs::write(&staged, b"media bytes").unwrap();

        let opts = UploadOptions {
            language: Some("fr".into()),
            hotwords: Some("Zürich\nUster".into()),
        };
        let name = commit_upload(&store, "u", "talk.mp3", &staged, &opts)
            .await
            .unwrap();

        assert_eq!(name, "talk.mp3");
        assert!(!staged.exists());
        assert_eq!(fs::read(store.inbox_file("u", "talk.mp3")).unwrap(), b"media bytes");
        assert_eq!(fs::read_to_string(store.language_file("u")).unwrap(), "fr");
        assert_eq!(fs::read_to_string(store.hotwords_file("u")).unwrap(), "Zürich\nUster");
    }

    #[tokio::test]
    async fn commit_defaults_language_and_clears_hotwords() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreRoot::new(dir.path());
        store.ensure_tree().unwrap();
        fs::create_dir_all(store.in_dir("u")).unwrap();
        fs::write(store.hotwords_file("u"), b"old words").unwrap();
        fs::create_dir_all(store.upload_tmp_dir("u")).unwrap();
        let staged = store.upload_tmp_dir("u").join("part");
        fs::write(&staged, b"x").unwrap();

        commit_upload(&store, "u", "a.wav", &staged, &UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(store.language_file("u")).unwrap(), "de");
        assert!(!store.hotwords_file("u").exists());
    }

    #[tokio::test]
    async fn commit_replaces_previous_error_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreRoot::new(dir.path());
        store.ensure_tree().unwrap();
        fs::create_dir_all(store.error_dir("u")).unwrap();
        fs::write(store.error_file("u", "a.wav"), b"old media").unwrap();
        fs::write(store.error_text("u", "a.wav"), b"failed").unwrap();
        fs::create_dir_all(store.upload_tmp_dir("u")).unwrap();
        let staged = store.upload_tmp_dir("u").join("part");
        fs::write(&staged, b"x").unwrap();

        let name = commit_upload(&store, "u", "a.wav", &staged, &UploadOptions::default())
            .await
            .unwrap();

        assert_eq!(name, "a.wav");
        assert!(!store.error_file("u", "a.wav").exists());
        assert!(!store.error_text("u", "a.wav").exists());
    }
}
