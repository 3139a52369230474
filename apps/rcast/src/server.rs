// SPDX-FileCopyrightText: © 2025 RelayCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, Path, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use opentelemetry::{global, KeyValue};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::{debug, info, warn};

use anyhow::Context;
use relaycast_core::{BroadcastConfig, Registry, RegistryConfig, RelayError};

use crate::config::{Config, CorsConfig};
use crate::state::AppState;

static HTTP_METRICS: OnceLock<(
    opentelemetry::metrics::Counter<u64>,
    opentelemetry::metrics::Histogram<f64>,
)> = OnceLock::new();

static RELAY_METRICS: OnceLock<(
    opentelemetry::metrics::Counter<u64>,
    opentelemetry::metrics::Counter<u64>,
    opentelemetry::metrics::Gauge<u64>,
)> = OnceLock::new();

fn relay_metrics() -> &'static (
    opentelemetry::metrics::Counter<u64>,
    opentelemetry::metrics::Counter<u64>,
    opentelemetry::metrics::Gauge<u64>,
) {
    RELAY_METRICS.get_or_init(|| {
        let meter = global::meter("rcast_relay");
        (
            meter
                .u64_counter("relay.publishers")
                .with_description("Total number of publisher sessions accepted")
                .build(),
            meter
                .u64_counter("relay.subscribers")
                .with_description("Total number of subscriber sessions accepted")
                .build(),
            meter
                .u64_gauge("relay.streams.active")
                .with_description("Number of registered streams (live or in grace window)")
                .build(),
        )
    })
}

/// Errors surfaced over the HTTP interface.
#[derive(Debug)]
enum AppError {
    /// No stream registered under that name.
    Offline,
    /// A live publisher already holds the name.
    NameTaken,
    /// The publisher's bytes were rejected by the container parser.
    BadStream(String),
    /// The publisher's request body failed mid-transfer.
    Aborted,
    Internal(String),
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NameInUse => Self::NameTaken,
            RelayError::BadContainer(parse) => Self::BadStream(parse.to_string()),
            RelayError::SessionClosed | RelayError::SubscriberOverflow => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::Offline => (StatusCode::NOT_FOUND, "this stream is offline").into_response(),
            Self::NameTaken => (StatusCode::FORBIDDEN, "stream id already taken").into_response(),
            Self::BadStream(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::Aborted => {
                (StatusCode::BAD_REQUEST, "request body aborted").into_response()
            }
            Self::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}

async fn health_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "streams": app_state.registry.stream_count(),
    }))
}

/// POST `/stream/{name}`: claim the name and relay the request body.
///
/// The body is fed chunk-by-chunk into the broadcast as it arrives; 204 on a
/// clean EOF. Whichever way this handler exits, dropping the publication
/// starts the publisher grace window. Malformed container data instead
/// discards the session immediately, so junk POSTs leave nothing behind.
async fn publish_handler(
    State(app_state): State<Arc<AppState>>,
    Path(name): Path<String>,
    request: axum::extract::Request,
) -> Response {
    let publication = match app_state.registry.publish(&name) {
        Ok(publication) => publication,
        Err(err) => {
            debug!(stream = %name, error = %err, "publish refused");
            return AppError::from(err).into_response();
        }
    };
    let (publishers, _, streams_active) = relay_metrics();
    publishers.add(1, &[]);
    streams_active.record(app_state.registry.stream_count() as u64, &[]);

    let mut body = request.into_body().into_data_stream();
    while let Some(chunk) = body.next().await {
        let chunk: Bytes = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                debug!(stream = %name, error = %err, "publisher body aborted");
                return AppError::Aborted.into_response();
            }
        };
        if let Err(err) = publication.send(&chunk) {
            warn!(stream = %name, error = %err, "publisher rejected");
            let bad_container = matches!(err, RelayError::BadContainer(_));
            let response = AppError::from(err).into_response();
            if bad_container {
                publication.discard();
            }
            return response;
        }
    }

    debug!(stream = %name, "publisher finished cleanly");
    StatusCode::NO_CONTENT.into_response()
}

/// GET `/stream/{name}`: attach a subscriber and stream its queue out as the
/// response body.
///
/// The subscription disconnects its slot when the body is dropped, so client
/// disconnects and server shutdown release it alike.
async fn watch_handler(
    State(app_state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let Some(subscription) = app_state.registry.subscribe(&name, false) else {
        return AppError::Offline.into_response();
    };
    let (_, subscribers, _) = relay_metrics();
    subscribers.add(1, &[]);
    debug!(stream = %name, "subscriber attached");

    let body = Body::from_stream(subscription.map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("video/webm")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        body,
    )
        .into_response()
}

fn escape_html_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// GET `/{name}`: a minimal watch page embedding the live stream.
async fn watch_page_handler(
    State(app_state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    if !app_state.registry.contains(&name) {
        return AppError::Offline.into_response();
    }
    let src = escape_html_attr(&name);
    Html(format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\" />\n<title>{src}</title>\n\
         </head>\n<body>\n<video autoplay preload=\"none\">\n\
         <source src=\"/stream/{src}\" type=\"video/webm\" />\n</video>\n</body>\n</html>\n"
    ))
    .into_response()
}

/// Creates a CORS layer from the configuration.
fn create_cors_layer(cors: &CorsConfig) -> CorsLayer {
    if cors.allowed_origins.iter().any(|origin| origin == "*") {
        CorsLayer::new().allow_methods(Any).allow_headers(Any).allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors.allowed_origins.iter().filter_map(|origin| origin.parse().ok()).collect();
        CorsLayer::new().allow_methods(Any).allow_headers(Any).allow_origin(origins)
    }
}

async fn metrics_middleware(req: axum::http::Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    // Extract matched path for metrics, falling back to the full URI path if no match
    let path = req.extensions().get::<MatchedPath>().map_or_else(
        || req.uri().path().to_owned(),
        |matched_path| matched_path.as_str().to_owned(),
    );

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let (counter, histogram) = HTTP_METRICS
        .get_or_init(|| {
            let meter = global::meter("rcast_server");
            (
                meter.u64_counter("http.server.requests").build(),
                meter.f64_histogram("http.server.duration").build(),
            )
        })
        .clone();

    let labels = [
        KeyValue::new("http.method", method.to_string()),
        KeyValue::new("http.route", path),
        KeyValue::new("http.status_code", status),
    ];

    counter.add(1, &labels);
    histogram.record(latency, &labels);

    response
}

/// Creates the Axum application with all routes and middleware.
pub fn create_app(config: Config) -> (Router, Arc<AppState>) {
    let registry = Registry::new(RegistryConfig {
        grace: Duration::from_secs(config.relay.grace_secs),
        broadcast: BroadcastConfig { max_header_bytes: config.relay.max_header_bytes },
    });
    let app_state = Arc::new(AppState { registry, config: Arc::new(config) });

    let cors_layer = create_cors_layer(&app_state.config.server.cors);

    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route(
            "/stream/{name}",
            get(watch_handler)
                .post(publish_handler)
                // Publisher bodies are unbounded live streams.
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/{name}", get(watch_page_handler))
        .with_state(Arc::clone(&app_state))
        .layer(ServiceBuilder::new().layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let route = request
                        .extensions()
                        .get::<MatchedPath>()
                        .map_or_else(|| request.uri().path(), |matched| matched.as_str());
                    tracing::info_span!("http_request", http_method = %request.method(), http_route = %route)
                })
                // Keep per-request logs out of INFO hot paths; surface failures at WARN.
                .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(tracing::Level::WARN)),
        ))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(cors_layer);

    (router, app_state)
}

async fn shutdown_signal(app_state: Arc<AppState>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, stopping streams");
    // Every subscriber body observes end-of-stream, letting connections drain.
    app_state.registry.shutdown();
}

/// Binds the listener and serves the relay until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the configured address does not parse, the listener
/// cannot bind, or the server loop fails.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .server
        .address
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.address))?;

    let (router, app_state) = create_app(config.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(app_state))
        .await
        .context("server loop failed")?;
    Ok(())
}
