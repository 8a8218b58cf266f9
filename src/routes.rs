//! HTTP surface over the delivery pipeline.

use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::ApiError,
    filename::{build_content_disposition, sanitize_ascii_filename},
    orchestrator::{DeliveryBody, Orchestrator, ProbeInfo},
};

const DEFAULT_DEV_ORIGINS: [&str; 2] = ["http://127.0.0.1:5173", "http://localhost:5173"];

static X_DOWNLOAD_FILENAME: HeaderName = HeaderName::from_static("x-download-filename");
static X_FORMAT_ID: HeaderName = HeaderName::from_static("x-format-id");
static X_VIDEO_CODEC: HeaderName = HeaderName::from_static("x-video-codec");
static X_AUDIO_CODEC: HeaderName = HeaderName::from_static("x-audio-codec");
static X_DELIVERY: HeaderName = HeaderName::from_static("x-delivery");

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InfoRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub url: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
    pub title: Option<String>,
    pub ext: Option<String>,
}

pub fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(fetch_info))
        .route("/api/download", get(download))
        .route("/download_proxy", get(download_proxy))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "remux_available": state.orchestrator.remux_available(),
        "extractor": state.orchestrator.extractor_name(),
    }))
}

pub async fn fetch_info(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> Result<Json<ProbeInfo>, ApiError> {
    let Json(payload) = payload.map_err(|rejection| {
        ApiError::bad_request(format!("Invalid request body: {}", rejection.body_text()))
    })?;
    let info = state.orchestrator.probe_info(&payload.url).await?;
    Ok(Json(info))
}

pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let url = query.url.unwrap_or_default();
    let quality = query.quality.unwrap_or_else(|| "best".to_string());

    let delivery = state
        .orchestrator
        .resolve_and_deliver(&url, &quality)
        .await?;
    delivery_response(delivery.body)
}

pub async fn download_proxy(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
) -> Result<Response, ApiError> {
    let Some(url) = query.url.filter(|value| !value.trim().is_empty()) else {
        return Err(ApiError::bad_request("Missing url parameter."));
    };

    let stream = state
        .orchestrator
        .relay_direct(&url, query.title.as_deref(), query.ext.as_deref())
        .await?;
    delivery_response(DeliveryBody::Direct(stream))
}

/// Headers are committed here; the body keeps streaming after this returns.
pub fn delivery_response(body: DeliveryBody) -> Result<Response, ApiError> {
    let mut headers = HeaderMap::new();

    let body = match body {
        DeliveryBody::Direct(stream) => {
            let meta = stream.meta.clone();
            insert_download_headers(
                &mut headers,
                &meta.content_type,
                &meta.filename,
                meta.content_length,
            )?;
            insert_optional(&mut headers, &X_FORMAT_ID, Some(&meta.format_id));
            insert_optional(&mut headers, &X_VIDEO_CODEC, meta.video_codec.as_deref());
            insert_optional(&mut headers, &X_AUDIO_CODEC, meta.audio_codec.as_deref());
            headers.insert(X_DELIVERY.clone(), HeaderValue::from_static("direct"));
            Body::from_stream(stream.into_stream())
        }
        DeliveryBody::Local(media) => {
            insert_download_headers(
                &mut headers,
                media.container.content_type(),
                &media.filename,
                Some(media.size),
            )?;
            headers.insert(X_DELIVERY.clone(), HeaderValue::from_static("remux"));
            Body::from_stream(media.into_stream())
        }
    };

    Ok((headers, body).into_response())
}

fn insert_download_headers(
    headers: &mut HeaderMap,
    content_type: &str,
    filename: &str,
    content_length: Option<u64>,
) -> Result<(), ApiError> {
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .map_err(|_| ApiError::internal("Could not build the content type header."))?,
    );
    if let Some(length) = content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    let content_disposition = build_content_disposition(filename);
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition)
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let safe_header_filename = sanitize_ascii_filename(filename);
    headers.insert(
        X_DOWNLOAD_FILENAME.clone(),
        HeaderValue::from_str(&safe_header_filename)
            .map_err(|_| ApiError::internal("Could not build the file name header."))?,
    );
    Ok(())
}

fn insert_optional(headers: &mut HeaderMap, name: &HeaderName, value: Option<&str>) {
    if let Some(value) = value.and_then(|value| HeaderValue::from_str(value).ok()) {
        headers.insert(name.clone(), value);
    }
}

pub fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let origins: Vec<String> = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Falling back to the development origins.");
        DEFAULT_DEV_ORIGINS.iter().map(ToString::to_string).collect()
    } else {
        configured.to_vec()
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. \
                     Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins.iter().collect::<Vec<_>>()
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            X_DOWNLOAD_FILENAME.clone(),
            X_FORMAT_ID.clone(),
            X_VIDEO_CODEC.clone(),
            X_AUDIO_CODEC.clone(),
            X_DELIVERY.clone(),
        ]))
}

/// `scheme://host[:port]`, dropping default ports; `None` for anything with a path.
pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
