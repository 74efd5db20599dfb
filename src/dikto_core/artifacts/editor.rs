use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use zip::write::SimpleFileOptions;

use crate::dikto_core::domain::TranscriptSegment;
use crate::dikto_core::queue::format_wait;
use crate::dikto_core::store::StoreRoot;
use crate::dikto_core::unix_now_secs;

/// Splice region boundaries inside the editor page. The editable body lives
/// between the end of the navigation bar and the first line of the script
/// block; saved edits are exactly that slice.
pub const NAV_END_MARKER: &str = "</nav>";
pub const FILE_NAME_MARKER: &str = "var fileName = ";

/// Presence of this marker means the media is already embedded; the embed
/// step is skipped so download-prep stays idempotent.
pub const BASE64_MARKER: &str = "var base64str = ";

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the self-contained interactive editor page for a finished
/// transcript. The page carries the transcript, speaker labels and a player;
/// the `<video>` src stays empty until either the server editor substitutes a
/// streaming URL or download-prep embeds the media inline.
pub fn render_editor(segments: &[TranscriptSegment], file_name: &str, language: &str) -> String {
    let mut body = String::new();
    for segment in segments {
        let speaker = segment.speaker.as_deref().unwrap_or("");
        let _ = write!(
            body,
            concat!(
                "<section class=\"segment\" data-start=\"{start}\" data-end=\"{end}\" ",
                "onclick=\"seekTo({start})\">",
                "<span class=\"speaker\">{speaker}</span>",
                "<span class=\"time\">{time}</span>",
                "<p contenteditable=\"true\">{text}</p>",
                "</section>\n"
            ),
            start = segment.start,
            end = segment.end,
            speaker = escape_html(speaker),
            time = format_wait(segment.start),
            text = escape_html(&segment.text),
        );
    }

    format!(
        r##"<!DOCTYPE html>
<html lang="{language}">
<head>
<meta charset="utf-8">
<title>{title} &mdash; transcript editor</title>
<style>
body {{ font-family: sans-serif; margin: 0 auto; max-width: 56rem; padding: 0 1rem; }}
nav {{ display: flex; justify-content: space-between; padding: 0.6rem 0; border-bottom: 1px solid #ccc; }}
.segment {{ margin: 0.4rem 0; padding: 0.3rem; border-left: 3px solid #ddd; }}
.segment.playing {{ border-left-color: #0070b4; background: #f2f8fc; }}
.speaker {{ font-weight: bold; margin-right: 0.6rem; }}
.time {{ color: #888; font-size: 0.85rem; }}
.segment p {{ margin: 0.2rem 0 0 0; }}
</style>
</head>
<body>
<nav><span class="brand">dikto</span><a href="#" id="download-link" onclick="downloadClick()">Download</a></nav>
<video id="player" width="100%" style="max-height: 320px" src="" type="video/MP4" controls="controls" position="sticky"></video>
<div id="transcript">
{body}</div>
<script>
var fileName = "{file_name}";
var player = document.getElementById("player");
function seekTo(start) {{ player.currentTime = start; player.play(); }}
player.addEventListener("timeupdate", function () {{
  var sections = document.querySelectorAll(".segment");
  for (var i = 0; i < sections.length; i++) {{
    var s = sections[i];
    var active = player.currentTime >= parseFloat(s.dataset.start) && player.currentTime < parseFloat(s.dataset.end);
    s.classList.toggle("playing", active);
  }}
}});
function downloadClick() {{
  var blob = new Blob(["<!DOCTYPE html>\n" + document.documentElement.outerHTML], {{ type: "text/html" }});
  var link = document.createElement("a");
  link.href = URL.createObjectURL(blob);
  link.download = fileName + ".html";
  link.click();
}}
</script>
</body>
</html>
"##,
        language = escape_html(language),
        title = escape_html(file_name),
        body = body,
        file_name = file_name,
    )
}

/// Replace the editable body of `content` with `update`. Returns `None` when
/// the marker pair is missing (foreign or corrupted page).
fn splice_update(content: &str, update: &str) -> Option<String> {
    let nav_end = content.find(NAV_END_MARKER)? + NAV_END_MARKER.len();
    let file_marker = content.find(FILE_NAME_MARKER)?;
    if file_marker < nav_end {
        return None;
    }
    let mut spliced = String::with_capacity(content.len() + update.len());
    spliced.push_str(&content[..nav_end]);
    spliced.push_str(update);
    spliced.push_str(&content[file_marker..]);
    Some(spliced)
}

/// Server-side editor view: the stored page with any pending edit applied
/// (non-destructively) and the player pointed at the streaming media URL. A
/// trailing hook reroutes the download button to the save endpoint.
pub fn open_editor_view(store: &StoreRoot, user: &str, file: &str) -> Result<String> {
    let html_path = store.editor_html(user, file);
    let mut content = fs::read_to_string(&html_path)
        .with_context(|| format!("failed to read {}", html_path.display()))?;

    let update_path = store.artifact(user, file, ".htmlupdate");
    if let Ok(update) = fs::read_to_string(&update_path) {
        match splice_update(&content, &update) {
            Some(spliced) => content = spliced,
            None => tracing::warn!("editor markers missing in {}", html_path.display()),
        }
    }

    let media_url = format!("/data/{user}/{file}.mp4");
    content = content.replacen("src=\"\"", &format!("src=\"{media_url}\""), 1);

    let save_hook = format!(
        concat!(
            "<script>\n",
            "downloadClick = function () {{\n",
            "  var html = document.documentElement.outerHTML;\n",
            "  var start = html.indexOf(\"{nav}\") + \"{nav}\".length;\n",
            "  var end = html.indexOf(\"{file_marker}\");\n",
            "  fetch(\"/api/editor/\" + encodeURIComponent(fileName) + \"/save\", {{\n",
            "    method: \"POST\", body: html.slice(start, end)\n",
            "  }}).then(function () {{ alert(\"changes saved\"); }});\n",
            "}};\n",
            "</script>\n"
        ),
        nav = NAV_END_MARKER,
        file_marker = FILE_NAME_MARKER,
    );
    if let Some(idx) = content.rfind("</body>") {
        content.insert_str(idx, &save_hook);
    } else {
        content.push_str(&save_hook);
    }
    Ok(content)
}

/// Persist an edited body posted by the browser. Consumed by the next
/// download-prep.
pub fn save_edit(store: &StoreRoot, user: &str, file: &str, body: &str) -> Result<()> {
    let update_path = store.artifact(user, file, ".htmlupdate");
    fs::write(&update_path, body.trim())
        .with_context(|| format!("failed to write {}", update_path.display()))?;
    Ok(())
}

/// Build the downloadable editor: fold a pending edit into the stored page,
/// then embed the media as a base64 blob at the end of the last script block
/// (only if absent, so a second run is byte-identical), and persist the
/// result as `<file>.htmlfinal`.
pub fn prepare_download(store: &StoreRoot, user: &str, file: &str) -> Result<PathBuf> {
    let html_path = store.editor_html(user, file);
    let mut content = fs::read_to_string(&html_path)
        .with_context(|| format!("failed to read {}", html_path.display()))?;

    let update_path = store.artifact(user, file, ".htmlupdate");
    if update_path.exists() {
        let update = fs::read_to_string(&update_path)
            .with_context(|| format!("failed to read {}", update_path.display()))?;
        match splice_update(&content, &update) {
            Some(spliced) => {
                content = spliced;
                fs::write(&html_path, &content)
                    .with_context(|| format!("failed to write {}", html_path.display()))?;
                fs::remove_file(&update_path)
                    .with_context(|| format!("failed to remove {}", update_path.display()))?;
            }
            None => tracing::warn!("editor markers missing in {}", html_path.display()),
        }
    }

    if !content.contains(BASE64_MARKER) {
        match fs::read(store.media_mp4(user, file)) {
            Ok(media) => {
                let block = media_embed_block(&STANDARD.encode(media));
                match content.rfind("</script>") {
                    Some(idx) => content.insert_str(idx, &block),
                    None => tracing::warn!("no script block in {}", html_path.display()),
                }
            }
            Err(err) => {
                tracing::warn!("cannot embed media for {user}/{file}: {err}");
            }
        }
    }

    let final_path = store.artifact(user, file, ".htmlfinal");
    fs::write(&final_path, &content)
        .with_context(|| format!("failed to write {}", final_path.display()))?;
    Ok(final_path)
}

fn media_embed_block(encoded: &str) -> String {
    format!(
        concat!(
            "\n{marker}\"{encoded}\";\n",
            "var mediaBinary = atob(base64str);\n",
            "var mediaBytes = new Uint8Array(mediaBinary.length);\n",
            "for (var i = 0; i < mediaBinary.length; i++) {{ mediaBytes[i] = mediaBinary.charCodeAt(i); }}\n",
            "var mediaBlob = new Blob([mediaBytes], {{ type: \"video/MP4\" }});\n",
            "var mediaUrl = URL.createObjectURL(mediaBlob);\n",
            "setTimeout(function () {{ player.pause(); player.setAttribute(\"src\", mediaUrl); }}, 100);\n"
        ),
        marker = BASE64_MARKER,
        encoded = encoded,
    )
}

/// Zip every finished transcript of a user into one archive of prepared
/// downloads. ZIP64 is enabled so archives beyond 4 GiB work.
pub fn bundle_ready_downloads(store: &StoreRoot, user: &str) -> Result<PathBuf> {
    let out_dir = store.out_dir(user);
    let mut stems = Vec::new();
    if let Ok(entries) = fs::read_dir(&out_dir) {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string() {
                if let Some(stem) = name.strip_suffix(".html") {
                    stems.push(stem.to_string());
                }
            }
        }
    }
    stems.sort();

    let zip_path = out_dir.join(format!("transcripts_{}.zip", unix_now_secs()));
    let file = fs::File::create(&zip_path)
        .with_context(|| format!("failed to create {}", zip_path.display()))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    let mut added = 0usize;
    for stem in &stems {
        match prepare_download(store, user, stem) {
            Ok(final_path) => {
                writer
                    .start_file(format!("{stem}.html"), options)
                    .with_context(|| format!("failed to add {stem} to archive"))?;
                let mut source = fs::File::open(&final_path)
                    .with_context(|| format!("failed to open {}", final_path.display()))?;
                io::copy(&mut source, &mut writer)
                    .with_context(|| format!("failed to compress {}", final_path.display()))?;
                added += 1;
            }
            Err(err) => tracing::warn!("skipping {stem} in bundle: {err:#}"),
        }
    }
    writer.finish().context("failed to finish zip archive")?;

    if added == 0 {
        let _ = fs::remove_file(&zip_path);
        return Err(anyhow::anyhow!("no finished transcripts to bundle"));
    }
    Ok(zip_path)
}
