//! REST control surface over the stream manager, engine, and image cache.
//!
//! The server runs on a dedicated thread so the pipeline never touches the
//! async runtime; startup waits for a successful bind and shutdown goes
//! through a oneshot channel. All JSON responses use the
//! `{code, message, data}` envelope with the HTTP status mirrored in `code`.

use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::StatusCode,
    web,
};
use anyhow::{Context, Result, anyhow};
use infer_core::InferenceEngine;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{
    cache::ImageCache,
    stream::StreamManager,
    types::{ApiResponse, StreamConfig},
};

pub struct ApiState {
    pub manager: Arc<StreamManager>,
    pub engine: Arc<InferenceEngine>,
    pub cache: Option<Arc<ImageCache>>,
    pub started_at: Instant,
    pub prometheus: Option<PrometheusHandle>,
}

/// Handle for the API server thread.
pub struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ApiServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the REST server and wait until it is bound. A bind failure is
/// returned to the caller, which treats it as fatal.
pub fn spawn_api_server(state: ApiState, port: u16) -> Result<ApiServer> {
    let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let data = web::Data::new(state);

    let handle = thread::Builder::new()
        .name("rest-api".into())
        .spawn(move || {
            actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new().app_data(data.clone()).configure(configure)
                })
                .bind(("0.0.0.0", port));

                let server = match server {
                    Ok(server) => server.run(),
                    Err(err) => {
                        let _ = ready_tx
                            .send(Err(anyhow!(err).context(format!("binding REST API to port {port}"))));
                        return;
                    }
                };

                info!("REST API listening on 0.0.0.0:{port}");
                let srv_handle = server.handle();
                let _ = ready_tx.send(Ok(()));
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                if let Err(err) = server.await {
                    error!("REST API server error: {err}");
                }
            });
        })
        .context("spawning REST API thread")?;

    ready_rx
        .recv_timeout(Duration::from_secs(5))
        .context("REST API did not start within 5 seconds")??;

    Ok(ApiServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Route table. Literal segments register before `{cam_id}` so `start_all`
/// and `stop_all` never match as stream ids.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/streams", web::post().to(add_stream))
        .route("/api/streams", web::get().to(list_streams))
        .route("/api/streams/start_all", web::post().to(start_all))
        .route("/api/streams/stop_all", web::post().to(stop_all))
        .route("/api/streams/{cam_id}", web::get().to(get_stream))
        .route("/api/streams/{cam_id}", web::delete().to(remove_stream))
        .route("/api/streams/{cam_id}/start", web::post().to(start_stream))
        .route("/api/streams/{cam_id}/stop", web::post().to(stop_stream))
        .route("/api/status", web::get().to(server_status))
        .route("/api/cache/image", web::get().to(cache_image))
        .route("/metrics", web::get().to(render_metrics));
}

fn json_ok(message: impl Into<String>, data: serde_json::Value) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::ok(message, data))
}

fn json_error(status: StatusCode, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(ApiResponse::error(status.as_u16() as i32, message))
}

async fn add_stream(
    state: web::Data<ApiState>,
    config: web::Json<StreamConfig>,
) -> HttpResponse {
    let config = config.into_inner();
    if config.cam_id.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "cam_id is required");
    }
    if config.source_url.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "source_url is required");
    }
    if state.manager.has_stream(&config.cam_id) {
        return json_error(
            StatusCode::CONFLICT,
            format!("stream {} already exists", config.cam_id),
        );
    }

    let cam_id = config.cam_id.clone();
    match state.manager.add(config) {
        Ok(()) => json_ok(
            format!("stream {cam_id} added"),
            json!({ "cam_id": cam_id }),
        ),
        Err(err) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to add stream {cam_id}: {err:#}"),
        ),
    }
}

async fn remove_stream(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let cam_id = path.into_inner();
    if state.manager.remove(&cam_id) {
        json_ok(
            format!("stream {cam_id} removed"),
            json!({ "cam_id": cam_id }),
        )
    } else {
        json_error(StatusCode::NOT_FOUND, format!("stream {cam_id} not found"))
    }
}

async fn list_streams(state: web::Data<ApiState>) -> HttpResponse {
    let statuses = state.manager.get_all_status();
    json_ok("success", serde_json::to_value(statuses).unwrap_or_default())
}

async fn get_stream(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let cam_id = path.into_inner();
    match state.manager.get_status(&cam_id) {
        Some(status) => json_ok("success", serde_json::to_value(status).unwrap_or_default()),
        None => json_error(StatusCode::NOT_FOUND, format!("stream {cam_id} not found")),
    }
}

async fn start_stream(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let cam_id = path.into_inner();
    if state.manager.start(&cam_id) {
        json_ok(
            format!("stream {cam_id} started"),
            json!({ "cam_id": cam_id }),
        )
    } else {
        json_error(
            StatusCode::NOT_FOUND,
            format!("stream {cam_id} not found or already running"),
        )
    }
}

async fn stop_stream(state: web::Data<ApiState>, path: web::Path<String>) -> HttpResponse {
    let cam_id = path.into_inner();
    if state.manager.stop(&cam_id) {
        json_ok(
            format!("stream {cam_id} stopped"),
            json!({ "cam_id": cam_id }),
        )
    } else {
        json_error(StatusCode::NOT_FOUND, format!("stream {cam_id} not found"))
    }
}

async fn start_all(state: web::Data<ApiState>) -> HttpResponse {
    state.manager.start_all();
    json_ok("all streams started", json!({}))
}

async fn stop_all(state: web::Data<ApiState>) -> HttpResponse {
    state.manager.stop_all();
    json_ok("all streams stopped", json!({}))
}

async fn server_status(state: web::Data<ApiState>) -> HttpResponse {
    let statuses = state.manager.get_all_status();
    let running = statuses.iter().filter(|s| s.status == "running").count();

    let mut data = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "streams_total": statuses.len(),
        "streams_running": running,
        "infer_queue_size": state.engine.queue_len(),
        "infer_queue_capacity": state.engine.queue_capacity(),
        "infer_queue_dropped": state.engine.queue_dropped(),
        "infer_total_processed": state.engine.total_processed(),
        "published": state.engine.published_count(),
    });

    if let Some(cache) = &state.cache {
        let mem_mb = cache.total_memory_bytes() as f64 / (1024.0 * 1024.0);
        data["cache_memory_mb"] = json!((mem_mb * 100.0).round() / 100.0);
        data["cache_total_frames"] = json!(cache.total_frames());
    }

    json_ok("success", data)
}

#[derive(Debug, Deserialize)]
struct CacheImageQuery {
    stream_id: Option<String>,
    ts: Option<i64>,
    latest: Option<String>,
}

async fn cache_image(
    state: web::Data<ApiState>,
    query: web::Query<CacheImageQuery>,
) -> HttpResponse {
    let Some(cache) = &state.cache else {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "image cache is disabled");
    };

    let Some(stream_id) = query.stream_id.as_deref().filter(|id| !id.is_empty()) else {
        return json_error(StatusCode::BAD_REQUEST, "stream_id parameter is required");
    };

    let want_latest = query.latest.as_deref() == Some("true") || query.ts.is_none();
    let frame = if want_latest {
        cache.get_latest(stream_id)
    } else {
        cache.get_nearest(stream_id, query.ts.unwrap_or_default())
    };

    match frame {
        Some(frame) if !frame.jpeg.is_empty() => HttpResponse::Ok()
            .content_type("image/jpeg")
            .insert_header(("X-Frame-Id", frame.frame_id.to_string()))
            .insert_header(("X-Timestamp-Ms", frame.timestamp_ms.to_string()))
            .insert_header(("X-Width", frame.width.to_string()))
            .insert_header(("X-Height", frame.height.to_string()))
            .body(frame.jpeg.as_ref().clone()),
        _ => json_error(
            StatusCode::NOT_FOUND,
            format!("no cached image found for stream {stream_id}"),
        ),
    }
}

async fn render_metrics(state: web::Data<ApiState>) -> HttpResponse {
    match &state.prometheus {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => json_error(StatusCode::NOT_FOUND, "metrics recorder not installed"),
    }
}
