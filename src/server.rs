use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::FutureExt;
use serde::Deserialize;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::cache::{Clock, Loader, TimedCache};
use crate::catalog::{Catalog, Feed};
use crate::downloader::{Downloader, MediaStream};
use crate::downloads::InflightStatus;
use crate::error::GatewayError;
use crate::library::LocalLibrary;
use crate::paginator;
use crate::paths::{self, PathConfig};
use crate::record::{normalize_all, Collection, Record};
use crate::utils::is_safe_path_segment;
use crate::{log_error, log_info};

const MEDIA_CONTENT_TYPE: &str = "video/mp4";

/// Everything a handler may touch
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn Catalog>,
    pub home: Arc<TimedCache<Record>>,
    pub subscriptions: Arc<TimedCache<Record>>,
    pub downloader: Arc<Downloader>,
    pub library: Arc<LocalLibrary>,
    pub paths: Arc<PathConfig>,
}

/// A cache over one catalog feed, normalized on refresh.
pub fn feed_cache(
    catalog: Arc<dyn Catalog>,
    feed: Feed,
    validity: Duration,
    clock: Arc<dyn Clock>,
) -> Arc<TimedCache<Record>> {
    let loader: Loader<Record> = Box::new(move || {
        let catalog = Arc::clone(&catalog);
        async move {
            let entries = catalog.list_feed(feed).await?;
            Ok::<_, GatewayError>(normalize_all(&entries))
        }
        .boxed()
    });
    Arc::new(TimedCache::new(feed.name(), validity, clock, loader))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/videos", get(videos))
        .route("/api/subscriptions", get(subscriptions))
        .route("/api/libraries", get(libraries))
        .route("/api/playlist/:id", get(playlist))
        .route("/api/local", get(local))
        .route("/api/download/:video_id", get(download))
        .route("/api/downloads", get(downloads))
        .route("/downloads/:file", get(artifact_file))
        .route("/img/:file", get(image_file))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .layer(middleware::from_fn(no_cache))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        if err.is_not_found() {
            return Self::not_found(err.to_string());
        }
        log_error!("Request failed: {}", err);
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn no_cache(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}

#[derive(Debug, Default, Deserialize)]
struct VideoQuery {
    search: Option<String>,
}

async fn videos(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
) -> ApiResult<Json<Vec<Record>>> {
    match query.search.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => {
            log_info!("Searching for: {}", q);
            let entries = state.catalog.search(q).await?;
            Ok(Json(normalize_all(&entries)))
        }
        None => Ok(Json(state.home.read().await?.to_vec())),
    }
}

async fn subscriptions(State(state): State<AppState>) -> ApiResult<Json<Vec<Record>>> {
    Ok(Json(state.subscriptions.read().await?.to_vec()))
}

async fn libraries(State(state): State<AppState>) -> ApiResult<Json<Vec<Collection>>> {
    let entries = state.catalog.list_collections().await?;
    let collections: Vec<Collection> = normalize_all(&entries).into_iter().map(Collection).collect();
    if collections.is_empty() {
        return Err(ApiError::not_found("No playlists found"));
    }
    Ok(Json(collections))
}

async fn playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Record>>> {
    let records = paginator::list_all(state.catalog.as_ref(), &id).await;
    if records.is_empty() {
        return Err(ApiError::not_found("No videos found in playlist"));
    }
    Ok(Json(records))
}

async fn local(State(state): State<AppState>) -> ApiResult<Json<Vec<Record>>> {
    Ok(Json(state.library.list_local().await?))
}

async fn download(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    log_info!("Download request for {}", video_id);
    match state.downloader.download(&video_id).await? {
        MediaStream::Stored(stored) => {
            file_response(stored.file, stored.len, MEDIA_CONTENT_TYPE, &headers).await
        }
        MediaStream::Live(live) => {
            // the session outlives this response
            let body = Body::from_stream(live.into_stream());
            Ok(([(header::CONTENT_TYPE, MEDIA_CONTENT_TYPE)], body).into_response())
        }
    }
}

async fn downloads(State(state): State<AppState>) -> Json<Vec<InflightStatus>> {
    Json(state.downloader.registry().snapshot())
}

async fn artifact_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    serve_from(&state.paths.artifact_dir, &file, &headers).await
}

async fn image_file(
    State(state): State<AppState>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    serve_from(&state.paths.image_dir, &file, &headers).await
}

async fn serve_from(dir: &std::path::Path, name: &str, headers: &HeaderMap) -> ApiResult<Response> {
    if !is_safe_path_segment(name) || name.starts_with('.') {
        return Err(ApiError::not_found("file not found"));
    }
    let path = dir.join(name);
    if !paths::is_within(dir, &path) {
        return Err(ApiError::not_found("file not found"));
    }

    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    file_response(file, metadata.len(), mime.as_ref(), headers).await
}

/// Whole file, or the single byte range the client asked for.
async fn file_response(
    mut file: File,
    size: u64,
    content_type: &str,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{}", size))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::internal(format!("seek failed: {}", e)))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = (StatusCode::PARTIAL_CONTENT, body).into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {}-{}/{}", start, end, size))?,
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let body = Body::from_stream(ReaderStream::new(file));
            let mut response = body.into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_TYPE, header_value(content_type.to_string())?);
    Ok(response)
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::try_from(value).map_err(|e| ApiError::internal(format!("bad header value: {}", e)))
}

fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    // multi-range requests are answered with the whole file
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // "-N" is the last N bytes
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    (end >= start).then_some((start, end))
}
