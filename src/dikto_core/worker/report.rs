use std::fs;

use crate::dikto_core::store::StoreRoot;

/// Move a failed input into the user's error directory with a human-readable
/// reason file.
///
/// The reason file is written first so the UI never sees an error entry
/// without its text. The move falls back to copy-then-delete across
/// filesystems; if even the copy fails the input stays in place so the user
/// can retry or delete it. The processing marker is always cleared.
pub fn report_error(store: &StoreRoot, user: &str, file: &str, reason: &str) {
    tracing::error!("job {user}/{file} failed: {reason}");

    let error_dir = store.error_dir(user);
    if let Err(err) = fs::create_dir_all(&error_dir) {
        tracing::error!("failed to create {}: {err}", error_dir.display());
    }

    let text_path = store.error_text(user, file);
    if let Err(err) = fs::write(&text_path, reason) {
        tracing::error!("failed to write {}: {err}", text_path.display());
    }

    let source = store.inbox_file(user, file);
    let target = store.error_file(user, file);
    if let Err(rename_err) = fs::rename(&source, &target) {
        tracing::warn!(
            "move to error directory failed ({rename_err}); trying copy+delete for {}",
            source.display()
        );
        match fs::copy(&source, &target) {
            Ok(_) => {
                if let Err(err) = fs::remove_file(&source) {
                    tracing::error!("failed to remove {} after copy: {err}", source.display());
                }
            }
            Err(copy_err) => {
                tracing::error!(
                    "could not move {} to the error directory: {copy_err}",
                    source.display()
                );
            }
        }
    }

    let marker = store.processing_marker(user, file);
    match fs::remove_file(&marker) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::error!("failed to remove {}: {err}", marker.display()),
    }
}
