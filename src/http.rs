use std::io::SeekFrom;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::{Field, Multipart};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::clock::{normalize_room_id, now_ms};
use crate::config::Config;
use crate::media::StoredFile;
use crate::probe;
use crate::protocol::{
    DiscoveryResponse, MediaDescriptor, SubtitleDescriptor, SubtitleFormat, PROTOCOL_VERSION,
};
use crate::registry::RoomRegistry;
use crate::room::{InstallError, RoomCommand};
use crate::storage::{self, Fingerprint, Storage};
use crate::ws::{self, Publisher};

const STREAM_CHUNK: usize = 128 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub publisher: Publisher,
    pub config: Arc<Config>,
    pub storage: Storage,
    pub instance_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("room not found")]
    RoomNotFound,
    #[error("file not found")]
    FileNotFound,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("file too large")]
    TooLarge,
    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: u64 },
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RoomNotFound | ApiError::FileNotFound => {
                (StatusCode::NOT_FOUND, self.to_string()).into_response()
            }
            ApiError::Forbidden(message) => (StatusCode::FORBIDDEN, message).into_response(),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::TooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "file too large").into_response()
            }
            ApiError::RangeNotSatisfiable { size } => Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::RANGE_NOT_SATISFIABLE.into_response()),
            ApiError::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    let media_cap = state.config.media_upload_cap as usize;
    let subtitle_cap = state.config.subtitle_upload_cap as usize;
    Router::new()
        .route("/api/health", get(health))
        .route("/api/discovery", get(discovery))
        .route(
            "/api/rooms/:room_id/media",
            post(upload_media).layer(DefaultBodyLimit::max(media_cap + 1024 * 1024)),
        )
        .route(
            "/api/rooms/:room_id/subtitle",
            post(upload_subtitle).layer(DefaultBodyLimit::max(subtitle_cap + 64 * 1024)),
        )
        .route("/api/rooms/:room_id/media/:media_id", get(serve_media))
        .route("/api/rooms/:room_id/subtitles/:subtitle_id", get(serve_subtitle))
        .route("/ws", get(ws::ws_endpoint))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "roomCount": state.registry.room_count(),
        "timestamp": now_ms(),
    }))
}

async fn discovery(State(state): State<AppState>) -> impl IntoResponse {
    let rooms = state.registry.summaries().await;
    let body = DiscoveryResponse {
        protocol_version: PROTOCOL_VERSION,
        instance_id: state.instance_id,
        rooms,
    };
    ([(header::CACHE_CONTROL, "no-store")], Json(body))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaUploadResponse {
    media: MediaDescriptor,
    optimized_for_network: bool,
    source_bitrate_mbps: Option<f64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubtitleUploadResponse {
    subtitle: SubtitleDescriptor,
}

async fn upload_media(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<MediaUploadResponse>, ApiError> {
    let handle = state.registry.get(&room_id).ok_or(ApiError::RoomNotFound)?;
    let conn = socket_id(&headers)?;
    let room_id = normalize_room_id(&room_id);

    let mut saved = None;
    while let Some(field) = next_field(&mut multipart).await? {
        if field.name() == Some("video") {
            saved = Some(save_field(&state.storage, &room_id, field, state.config.media_upload_cap).await?);
            break;
        }
    }
    let saved = saved.ok_or_else(|| ApiError::BadRequest("missing video file".into()))?;

    let facts = probe::media_facts(state.config.ffprobe_path.as_ref(), saved.file.path()).await;
    let bit_rate = facts.bit_rate.or_else(|| probe::estimate_bit_rate(saved.size, facts.duration));

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    handle.send(RoomCommand::InstallMedia {
        conn,
        name: saved.original_name,
        size: saved.size,
        mime_type: saved.mime,
        duration: facts.duration,
        sha256: saved.sha256,
        file: saved.file,
        reply: reply_tx,
    });
    let media = match reply_rx.await {
        Ok(Ok(media)) => media,
        Ok(Err(InstallError::NotHost)) => {
            return Err(ApiError::Forbidden("only the host may upload media".into()))
        }
        Err(_) => return Err(ApiError::RoomNotFound),
    };

    Ok(Json(MediaUploadResponse {
        media,
        optimized_for_network: bit_rate
            .map(|b| b <= state.config.direct_stream_max_bps)
            .unwrap_or(true),
        source_bitrate_mbps: bit_rate.map(|b| b as f64 / 1_000_000.0),
    }))
}

async fn upload_subtitle(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<SubtitleUploadResponse>, ApiError> {
    let handle = state.registry.get(&room_id).ok_or(ApiError::RoomNotFound)?;
    let conn = socket_id(&headers)?;
    let room_id = normalize_room_id(&room_id);

    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut language: Option<String> = None;
    while let Some(mut field) = next_field(&mut multipart).await? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("subtitle") => {
                let name = field.file_name().unwrap_or("subtitle").to_string();
                let mut bytes = Vec::new();
                while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
                    if (bytes.len() + chunk.len()) as u64 > state.config.subtitle_upload_cap {
                        return Err(ApiError::TooLarge);
                    }
                    bytes.extend_from_slice(&chunk);
                }
                upload = Some((name, bytes));
            }
            Some("language") => {
                let value = field.text().await.map_err(bad_multipart)?;
                let value = value.trim().to_string();
                if !value.is_empty() {
                    language = Some(value);
                }
            }
            _ => {}
        }
    }
    let (name, bytes) = upload.ok_or_else(|| ApiError::BadRequest("missing subtitle file".into()))?;
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("empty subtitle file".into()));
    }

    let ext = storage::file_ext(&name).unwrap_or_default();
    let (format, target_ext, body) = match ext.as_str() {
        ".srt" => (
            SubtitleFormat::Vtt,
            ".vtt",
            storage::srt_to_vtt(&String::from_utf8_lossy(&bytes)).into_bytes(),
        ),
        ".vtt" => (SubtitleFormat::Vtt, ".vtt", bytes),
        ".ass" | ".ssa" => (SubtitleFormat::Ass, ".ass", bytes),
        _ => return Err(ApiError::BadRequest("unsupported subtitle format".into())),
    };

    let path = state
        .storage
        .dest_path(&room_id, &name, target_ext, now_ms())
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    tokio::fs::write(&path, &body).await.map_err(|e| ApiError::Internal(e.into()))?;
    let file = StoredFile::new(path);

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    handle.send(RoomCommand::InstallSubtitle {
        conn,
        name,
        format,
        language,
        file,
        reply: reply_tx,
    });
    match reply_rx.await {
        Ok(Ok(subtitle)) => Ok(Json(SubtitleUploadResponse { subtitle })),
        Ok(Err(InstallError::NotHost)) => {
            Err(ApiError::Forbidden("only the host may upload subtitles".into()))
        }
        Err(_) => Err(ApiError::RoomNotFound),
    }
}

async fn serve_media(
    Path((room_id, media_id)): Path<(String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let handle = state.registry.get(&room_id).ok_or(ApiError::RoomNotFound)?;
    let media_id: Uuid = media_id.parse().map_err(|_| ApiError::FileNotFound)?;
    let (path, descriptor) = handle.media_file(media_id).await.ok_or(ApiError::FileNotFound)?;
    let size = tokio::fs::metadata(&path)
        .await
        .map_err(|_| ApiError::FileNotFound)?
        .len();

    let base = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::CONTENT_TYPE, descriptor.mime_type.as_str());

    match parse_range(headers.get(header::RANGE), size) {
        RangeOutcome::Full => {
            let file = tokio::fs::File::open(&path).await.map_err(|_| ApiError::FileNotFound)?;
            let stream = ReaderStream::with_capacity(file, STREAM_CHUNK);
            base.status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size.to_string())
                .body(Body::from_stream(stream))
                .map_err(|e| ApiError::Internal(e.into()))
        }
        RangeOutcome::Partial { start, end } => {
            let mut file = tokio::fs::File::open(&path).await.map_err(|_| ApiError::FileNotFound)?;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::Internal(e.into()))?;
            let length = end - start + 1;
            let stream = ReaderStream::with_capacity(file.take(length), STREAM_CHUNK);
            base.status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"))
                .header(header::CONTENT_LENGTH, length.to_string())
                .body(Body::from_stream(stream))
                .map_err(|e| ApiError::Internal(e.into()))
        }
        RangeOutcome::Unsatisfiable => Err(ApiError::RangeNotSatisfiable { size }),
    }
}

async fn serve_subtitle(
    Path((room_id, subtitle_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let handle = state.registry.get(&room_id).ok_or(ApiError::RoomNotFound)?;
    let subtitle_id: Uuid = subtitle_id.parse().map_err(|_| ApiError::FileNotFound)?;
    let (path, descriptor) = handle.subtitle_file(subtitle_id).await.ok_or(ApiError::FileNotFound)?;
    let bytes = tokio::fs::read(&path).await.map_err(|_| ApiError::FileNotFound)?;
    let content_type = match descriptor.format {
        SubtitleFormat::Vtt => "text/vtt; charset=utf-8",
        SubtitleFormat::Ass => "text/x-ssa; charset=utf-8",
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(bytes))
        .map_err(|e| ApiError::Internal(e.into()))
}

struct SavedUpload {
    file: StoredFile,
    size: u64,
    sha256: String,
    mime: String,
    original_name: String,
}

/// Stream one multipart field to the room's storage folder, hashing as it
/// goes and aborting past the cap. The `StoredFile` guard removes partial
/// files on every error path.
async fn save_field(
    storage: &Storage,
    room_id: &str,
    mut field: Field<'_>,
    cap: u64,
) -> Result<SavedUpload, ApiError> {
    let original_name = field.file_name().unwrap_or("upload").to_string();
    let declared_mime = field.content_type().map(|m| m.to_string());
    let ext = storage::file_ext(&original_name).unwrap_or_default();

    let path = storage
        .dest_path(room_id, &original_name, &ext, now_ms())
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    let mut out = tokio::fs::File::create(&path)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    let stored = StoredFile::new(path);

    let mut written: u64 = 0;
    let mut fingerprint = Fingerprint::new();
    while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
        written += chunk.len() as u64;
        if written > cap {
            return Err(ApiError::TooLarge);
        }
        fingerprint.update(&chunk);
        out.write_all(&chunk).await.map_err(|e| ApiError::Internal(e.into()))?;
    }
    out.flush().await.map_err(|e| ApiError::Internal(e.into()))?;
    if written == 0 {
        return Err(ApiError::BadRequest("empty upload".into()));
    }

    let mime = declared_mime
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| mime_for_ext(&ext).to_string());
    Ok(SavedUpload {
        file: stored,
        size: written,
        sha256: fingerprint.finish(),
        mime,
        original_name,
    })
}

async fn next_field<'a>(multipart: &'a mut Multipart) -> Result<Option<Field<'a>>, ApiError> {
    multipart.next_field().await.map_err(bad_multipart)
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::BadRequest(format!("malformed upload: {err}"))
}

fn socket_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-socket-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::Forbidden("missing or invalid x-socket-id".into()))
}

fn mime_for_ext(ext: &str) -> &'static str {
    match ext {
        ".mp4" | ".m4v" => "video/mp4",
        ".mkv" => "video/x-matroska",
        ".webm" => "video/webm",
        ".mov" => "video/quicktime",
        ".avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RangeOutcome {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// `Range: bytes=a-b` parsing with the historical quirk that an empty range
/// (`bytes=-`) means the whole file over a 200. Multi-range requests and
/// out-of-bounds starts are 416s.
fn parse_range(header: Option<&HeaderValue>, size: u64) -> RangeOutcome {
    let Some(value) = header else { return RangeOutcome::Full };
    let Ok(text) = value.to_str() else { return RangeOutcome::Unsatisfiable };
    let Some(ranges) = text.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Unsatisfiable;
    };
    if ranges.contains(',') {
        return RangeOutcome::Unsatisfiable;
    }
    let Some((start_s, end_s)) = ranges.split_once('-') else {
        return RangeOutcome::Unsatisfiable;
    };
    let (start_s, end_s) = (start_s.trim(), end_s.trim());

    match (start_s.is_empty(), end_s.is_empty()) {
        (true, true) => RangeOutcome::Full,
        (true, false) => {
            // Suffix range: the last N bytes.
            let Ok(suffix) = end_s.parse::<u64>() else { return RangeOutcome::Unsatisfiable };
            if suffix == 0 || size == 0 {
                return RangeOutcome::Unsatisfiable;
            }
            RangeOutcome::Partial { start: size.saturating_sub(suffix), end: size - 1 }
        }
        (false, true) => {
            let Ok(start) = start_s.parse::<u64>() else { return RangeOutcome::Unsatisfiable };
            if start >= size {
                return RangeOutcome::Unsatisfiable;
            }
            RangeOutcome::Partial { start, end: size - 1 }
        }
        (false, false) => {
            let (Ok(start), Ok(end)) = (start_s.parse::<u64>(), end_s.parse::<u64>()) else {
                return RangeOutcome::Unsatisfiable;
            };
            if start > end || start >= size {
                return RangeOutcome::Unsatisfiable;
            }
            RangeOutcome::Partial { start, end: end.min(size - 1) }
        }
    }
}
