mod editor;
mod srt;

pub use editor::{
    bundle_ready_downloads, open_editor_view, prepare_download, render_editor, save_edit,
    BASE64_MARKER, FILE_NAME_MARKER, NAV_END_MARKER,
};
pub use srt::render_srt;
