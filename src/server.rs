//! HTTP surface.
//!
//! One route, `/extract-frames?url=<absolute URL>`. Request problems are
//! answered with `400` before any pipeline starts. A valid request gets its
//! `200` and headers right away; frames follow in the body as they are
//! decoded.

use axum::Router;
use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use tokio::net::TcpListener;
use url::Url;

use crate::configuration::{ServerConfig, StreamOptions};
use crate::decoder::FfmpegDecoder;
use crate::encode::PngEncoder;
use crate::error::FrameServeError;
use crate::ingest;
use crate::stream::spawn_pipeline;

/// Path of the extraction endpoint.
pub const EXTRACT_PATH: &str = "/extract-frames";

const USAGE: &str = "Use /extract-frames endpoint with a video URL parameter";
const MISSING_URL: &str = "Missing video URL parameter";

#[derive(Clone)]
struct AppState {
    client: reqwest::Client,
    options: StreamOptions,
}

impl IntoResponse for FrameServeError {
    fn into_response(self) -> Response {
        let body = match &self {
            FrameServeError::RequestInvalid(message) => message.clone(),
            other => format!("Error: {other}"),
        };
        (self.status_code(), body).into_response()
    }
}

/// Build the application router.
pub fn router(options: StreamOptions) -> Router {
    let state = AppState {
        client: reqwest::Client::new(),
        options,
    };

    Router::new()
        .route(EXTRACT_PATH, any(extract_frames))
        .fallback(usage)
        .with_state(state)
}

/// Bind `config.bind` and serve until the process is stopped.
///
/// # Errors
///
/// Returns [`FrameServeError::InvalidInterval`] for unusable stream options
/// and [`FrameServeError::Io`] if the listener cannot be bound.
pub async fn serve(config: ServerConfig) -> Result<(), FrameServeError> {
    config.stream.validate()?;

    let listener = TcpListener::bind(config.bind).await?;
    log::info!(
        "Listening on http://{}{EXTRACT_PATH}",
        listener.local_addr()?
    );

    axum::serve(listener, router(config.stream)).await?;
    Ok(())
}

/// Extract and validate the `url` query parameter.
///
/// # Errors
///
/// Returns [`FrameServeError::RequestInvalid`] when the parameter is missing
/// or empty, or is not an absolute `http`/`https` URL.
pub fn source_url(query: Option<&str>) -> Result<Url, FrameServeError> {
    let value = query
        .and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "url")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|value| !value.is_empty())
        .ok_or_else(|| FrameServeError::RequestInvalid(MISSING_URL.to_string()))?;

    parse_source_url(&value)
}

/// Check that `value` is an absolute `http`/`https` URL.
///
/// # Errors
///
/// Returns [`FrameServeError::RequestInvalid`] otherwise.
pub fn parse_source_url(value: &str) -> Result<Url, FrameServeError> {
    let url = Url::parse(value).map_err(|error| {
        FrameServeError::RequestInvalid(format!("Invalid video URL {value:?}: {error}"))
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(FrameServeError::RequestInvalid(format!(
            "Unsupported video URL scheme {scheme:?}"
        ))),
    }
}

async fn extract_frames(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Response, FrameServeError> {
    let source = source_url(query.as_deref())?;
    log::info!("Extracting frames from {source}");

    let client = state.client.clone();
    let url = source.to_string();
    let stream = spawn_pipeline(
        async move { ingest::fetch(&client, &url).await },
        FfmpegDecoder::new,
        PngEncoder,
        &state.options,
    );

    let content_type = stream.content_type();
    Ok(([(header::CONTENT_TYPE, content_type)], Body::from_stream(stream)).into_response())
}

async fn usage() -> FrameServeError {
    FrameServeError::RequestInvalid(USAGE.to_string())
}
