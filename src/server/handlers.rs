use std::time::Duration;

use axum::{
    extract::{Multipart, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{Html, IntoResponse, Json, Response},
};
use futures::Stream;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower::util::ServiceExt;
use tower_http::services::ServeFile;
use uuid::Uuid;

use crate::dikto_core::artifacts::{
    bundle_ready_downloads, open_editor_view, prepare_download, save_edit,
};
use crate::dikto_core::progress::listen_tick;
use crate::dikto_core::queue::describe_queue;
use crate::dikto_core::session::UiEvent;
use crate::dikto_core::upload::{
    clear_upload_staging, commit_upload, is_accepted_media, UploadError, UploadOptions,
    MAX_UPLOAD_BYTES,
};

use super::auth::resolve_identity;
use super::error::{AppError, AppResult};
use super::AppState;

/// Reject path-like file parameters before they touch the store.
fn require_safe(name: &str) -> AppResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(AppError::bad_request("invalid file name"));
    }
    Ok(())
}

/// `GET /`: the application shell. Issues the session cookie in online mode
/// and clears stale upload staging for the user.
pub async fn main_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let identity = resolve_identity(&state.settings, &headers);
    state.sessions.get_or_create(&identity.user);
    clear_upload_staging(&state.store, &identity.user).await;

    let mut response = Html(INDEX_PAGE).into_response();
    if let Some(cookie) = identity.set_cookie {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

/// `GET /api/queue`: the queue/result view for the session user, with the
/// live-progress patch overlaid.
pub async fn queue_view(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let identity = resolve_identity(&state.settings, &headers);
    let mut records = describe_queue(
        &state.store,
        state.prober.as_ref(),
        &state.settings,
        &identity.user,
    )
    .await;

    let session = state.sessions.get_or_create(&identity.user);
    let patch = session.lock().expect("session lock poisoned").live.clone();
    if let Some(patch) = patch {
        patch.apply(&mut records);
    }
    Ok(Json(json!({ "jobs": records })))
}

/// `GET /api/events`: server-sent refresh hints. While the stream is open
/// the session's progress listener ticks once a second.
pub async fn event_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, anyhow::Error>>> {
    let identity = resolve_identity(&state.settings, &headers);
    let session = state.sessions.get_or_create(&identity.user);
    let store = state.store.clone();

    let stream = futures::stream::unfold((session, store), |(session, store)| async move {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let events: Vec<UiEvent> = {
                let mut guard = session.lock().expect("session lock poisoned");
                let mut rx = guard.subscribe();
                listen_tick(&store, &mut guard);
                let mut events = Vec::new();
                while let Ok(event) = rx.try_recv() {
                    if !events.contains(&event) {
                        events.push(event);
                    }
                }
                events
            };
            if events.is_empty() {
                continue;
            }
            let payload = serde_json::to_string(&events).unwrap_or_else(|_| "[]".to_string());
            return Some((Ok(Event::default().data(payload)), (session, store)));
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `POST /upload`: multipart upload of one or more media files plus the
/// language / vocabulary options. Option fields must precede file fields in
/// the form payload.
pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    let identity = resolve_identity(&state.settings, &headers);
    let user = identity.user;
    let mut opts = UploadOptions::default();
    let mut accepted: Vec<String> = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "language" => {
                opts.language = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| AppError::bad_request(err.to_string()))?,
                );
            }
            "hotwords" => {
                opts.hotwords = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| AppError::bad_request(err.to_string()))?,
                );
            }
            "file" => {
                let original = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                if !is_accepted_media(content_type.as_deref(), &original) {
                    return Err(UploadError::UnsupportedMediaType.into());
                }

                let staging_dir = state.store.upload_tmp_dir(&user);
                tokio::fs::create_dir_all(&staging_dir)
                    .await
                    .map_err(|err| AppError::internal(err.to_string()))?;
                let staged = staging_dir.join(format!("{}.part", Uuid::new_v4()));

                let mut out = tokio::fs::File::create(&staged)
                    .await
                    .map_err(|err| AppError::internal(err.to_string()))?;
                let mut written: u64 = 0;
                let stream_result = loop {
                    match field.chunk().await {
                        Ok(Some(chunk)) => {
                            written += chunk.len() as u64;
                            if written > MAX_UPLOAD_BYTES {
                                break Err(AppError::from(UploadError::TooLarge));
                            }
                            if let Err(err) = out.write_all(&chunk).await {
                                break Err(AppError::internal(err.to_string()));
                            }
                        }
                        Ok(None) => break Ok(()),
                        Err(err) => break Err(AppError::bad_request(err.to_string())),
                    }
                };
                if let Err(err) = stream_result {
                    let _ = tokio::fs::remove_file(&staged).await;
                    return Err(err);
                }
                // Flush to disk before the rename; the worker may pick the
                // job up the moment it lands in the inbox.
                out.sync_all()
                    .await
                    .map_err(|err| AppError::internal(err.to_string()))?;
                drop(out);

                match commit_upload(&state.store, &user, &original, &staged, &opts).await {
                    Ok(name) => accepted.push(name),
                    Err(err) => {
                        let _ = tokio::fs::remove_file(&staged).await;
                        return Err(err.into());
                    }
                }
            }
            _ => {}
        }
    }

    let session = state.sessions.get_or_create(&user);
    session
        .lock()
        .expect("session lock poisoned")
        .publish(UiEvent::QueueChanged);
    Ok(Json(json!({ "files": accepted })))
}

/// `POST /api/delete/{file}`: user cancel / result removal.
pub async fn delete_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file): Path<String>,
) -> AppResult<Json<Value>> {
    require_safe(&file)?;
    let identity = resolve_identity(&state.settings, &headers);
    let store = state.store.clone();
    let user = identity.user.clone();
    let name = file.clone();
    tokio::task::spawn_blocking(move || store.delete_job(&user, &name))
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;

    let session = state.sessions.get_or_create(&identity.user);
    {
        let mut guard = session.lock().expect("session lock poisoned");
        guard.known_errors.remove(&file);
        if guard.file_in_progress.as_deref() == Some(file.as_str()) {
            guard.file_in_progress = None;
            guard.live = None;
        }
        guard.publish(UiEvent::QueueChanged);
        guard.publish(UiEvent::ResultsChanged);
    }
    Ok(Json(json!({ "deleted": file })))
}

/// `POST /api/editor/{file}/open`: bind the server-side editor to a job so
/// the subsequent `GET /editor` can render it.
pub async fn open_editor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file): Path<String>,
) -> AppResult<Json<Value>> {
    require_safe(&file)?;
    let identity = resolve_identity(&state.settings, &headers);
    if !state.store.editor_html(&identity.user, &file).exists() {
        return Err(AppError::not_found("no editor for this file"));
    }
    let session = state.sessions.get_or_create(&identity.user);
    session
        .lock()
        .expect("session lock poisoned")
        .editor_file = Some(file.clone());
    Ok(Json(json!({ "editor": file })))
}

/// `GET /editor`: the server-side editor page for the job bound by
/// `open_editor`, or the session-expired notice.
pub async fn editor_page(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let identity = resolve_identity(&state.settings, &headers);
    let session = state.sessions.get_or_create(&identity.user);
    let file = session
        .lock()
        .expect("session lock poisoned")
        .editor_file
        .clone();

    let Some(file) = file else {
        return Ok(Html(SESSION_EXPIRED_PAGE).into_response());
    };

    let store = state.store.clone();
    let user = identity.user.clone();
    let html = tokio::task::spawn_blocking(move || open_editor_view(&store, &user, &file))
        .await
        .map_err(|err| AppError::internal(err.to_string()))??;
    Ok(Html(html).into_response())
}

/// `POST /api/editor/{file}/save`: store the edited body for the next
/// download-prep.
pub async fn save_editor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file): Path<String>,
    body: String,
) -> AppResult<Json<Value>> {
    require_safe(&file)?;
    let identity = resolve_identity(&state.settings, &headers);
    if !state.store.editor_html(&identity.user, &file).exists() {
        return Err(AppError::not_found("no editor for this file"));
    }
    let store = state.store.clone();
    let user = identity.user;
    let name = file.clone();
    tokio::task::spawn_blocking(move || save_edit(&store, &user, &name, &body))
        .await
        .map_err(|err| AppError::internal(err.to_string()))??;
    Ok(Json(json!({ "saved": file })))
}

fn attachment_response(
    body: axum::body::Body,
    content_type: &str,
    download_name: &str,
) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{download_name}\""),
            ),
        ],
        body,
    )
        .into_response()
}

fn download_stem(file: &str) -> &str {
    file.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(file)
}

/// `GET /download/editor/{file}`: prepare and serve the self-contained
/// editor. The base64 embed makes this large; preparation runs on the
/// blocking pool and the result is streamed.
pub async fn download_editor(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file): Path<String>,
) -> AppResult<Response> {
    require_safe(&file)?;
    let identity = resolve_identity(&state.settings, &headers);
    let store = state.store.clone();
    let user = identity.user.clone();
    let name = file.clone();
    let final_path = tokio::task::spawn_blocking(move || prepare_download(&store, &user, &name))
        .await
        .map_err(|err| AppError::internal(err.to_string()))??;

    let handle = tokio::fs::File::open(&final_path)
        .await
        .map_err(|_| AppError::not_found("prepared download is missing"))?;
    Ok(attachment_response(
        axum::body::Body::from_stream(ReaderStream::new(handle)),
        "text/html; charset=utf-8",
        &format!("{}.html", download_stem(&file)),
    ))
}

/// `GET /download/srt/{file}`: the subtitle artifact.
pub async fn download_srt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(file): Path<String>,
) -> AppResult<Response> {
    require_safe(&file)?;
    let identity = resolve_identity(&state.settings, &headers);
    let path = state.store.subtitle_srt(&identity.user, &file);
    let handle = tokio::fs::File::open(&path)
        .await
        .map_err(|_| AppError::not_found("no subtitles for this file"))?;
    Ok(attachment_response(
        axum::body::Body::from_stream(ReaderStream::new(handle)),
        "application/x-subrip",
        &format!("{}.srt", download_stem(&file)),
    ))
}

/// `GET /download/all`: zip bundle of every prepared editor.
pub async fn download_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let identity = resolve_identity(&state.settings, &headers);
    let store = state.store.clone();
    let user = identity.user;
    let zip_path = tokio::task::spawn_blocking(move || bundle_ready_downloads(&store, &user))
        .await
        .map_err(|err| AppError::internal(err.to_string()))?
        .map_err(|err| AppError::new(StatusCode::NOT_FOUND, err.to_string()))?;

    let handle = tokio::fs::File::open(&zip_path)
        .await
        .map_err(|_| AppError::not_found("bundle is missing"))?;
    Ok(attachment_response(
        axum::body::Body::from_stream(ReaderStream::new(handle)),
        "application/zip",
        "transcripts.zip",
    ))
}

/// `GET /data/{user}/{file}`: static media for the editor's player. Range
/// requests are honored so the player can scrub.
pub async fn serve_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((user, file)): Path<(String, String)>,
    request: Request,
) -> AppResult<Response> {
    require_safe(&user)?;
    require_safe(&file)?;
    let identity = resolve_identity(&state.settings, &headers);
    if identity.user != user {
        return Err(AppError::new(StatusCode::FORBIDDEN, "not your media"));
    }
    let path = state.store.out_dir(&user).join(&file);
    if !path.is_file() {
        return Err(AppError::not_found("no such media"));
    }
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => Ok(response.into_response()),
        Err(err) => Err(AppError::internal(err.to_string())),
    }
}

/// Minimal application shell: upload form, queue and result lists, wired to
/// the JSON/SSE endpoints. The full widget set ships separately.
const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>dikto</title>
<style>
body { font-family: sans-serif; max-width: 48rem; margin: 0 auto; padding: 1rem; }
header { background: #0070b4; color: white; padding: 0.8rem 1rem; margin-bottom: 1rem; }
.job { border-bottom: 1px solid #ddd; padding: 0.5rem 0; }
.job progress { width: 100%; }
.errored { color: #b00020; }
textarea { width: 100%; min-height: 4rem; }
</style>
</head>
<body>
<header><strong>dikto</strong> &mdash; transcription</header>
<form id="upload-form">
<label>Spoken language
<select name="language">
<option value="de" selected>deutsch</option>
<option value="en">english</option>
<option value="fr">français</option>
<option value="it">italiano</option>
</select></label>
<label>Vocabulary<textarea name="hotwords" placeholder="Zürich&#10;Uster&#10;Uitikon"></textarea></label>
<input type="file" name="file" accept="video/*,audio/*,.zip" multiple>
<button type="submit">Upload</button>
</form>
<h3>Queue</h3><div id="queue"></div>
<h3>Results</h3><div id="results"></div>
<script>
async function refresh() {
  const res = await fetch("/api/queue");
  const data = await res.json();
  const queue = document.getElementById("queue");
  const results = document.getElementById("results");
  queue.innerHTML = "";
  results.innerHTML = "";
  for (const job of data.jobs) {
    const div = document.createElement("div");
    div.className = "job " + job.state;
    if (job.state === "done") {
      div.innerHTML = "<b>" + job.fileName + "</b> " +
        "<a href=\"/download/editor/" + encodeURIComponent(job.fileName) + "\">editor</a> " +
        "<a href=\"/download/srt/" + encodeURIComponent(job.fileName) + "\">srt</a> " +
        "<button onclick=\"openEditor('" + job.fileName + "')\">open</button> " +
        "<button onclick=\"del('" + job.fileName + "')\">remove</button>";
      results.appendChild(div);
    } else if (job.state === "errored") {
      div.innerHTML = "<b class=errored>" + job.fileName + ":</b> " + job.message +
        " <button onclick=\"del('" + job.fileName + "')\">remove</button>";
      results.appendChild(div);
    } else {
      div.innerHTML = "<b>" + job.fileName + ":</b> " + job.message +
        " <button onclick=\"del('" + job.fileName + "')\">cancel</button>" +
        "<progress max=100 value=" + job.progress + "></progress>";
      queue.appendChild(div);
    }
  }
  if (results.children.length > 0) {
    const all = document.createElement("div");
    all.innerHTML = "<a href=\"/download/all\">Download all</a>";
    results.appendChild(all);
  }
}
async function del(name) {
  await fetch("/api/delete/" + encodeURIComponent(name), { method: "POST" });
  refresh();
}
async function openEditor(name) {
  await fetch("/api/editor/" + encodeURIComponent(name) + "/open", { method: "POST" });
  window.open("/editor", "_blank");
}
document.getElementById("upload-form").addEventListener("submit", async (e) => {
  e.preventDefault();
  const form = e.target;
  const payload = new FormData();
  payload.append("language", form.language.value);
  payload.append("hotwords", form.hotwords.value);
  for (const f of form.file.files) { payload.append("file", f); }
  const res = await fetch("/upload", { method: "POST", body: payload });
  if (!res.ok) {
    const err = await res.json().catch(() => null);
    alert(err && err.error ? err.error.message : "upload failed");
  }
  form.file.value = "";
  refresh();
});
new EventSource("/api/events").onmessage = () => refresh();
refresh();
</script>
</body>
</html>
"#;

const SESSION_EXPIRED_PAGE: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>dikto</title></head>
<body><p>Session expired. Please open the editor again.</p></body></html>
"#;
