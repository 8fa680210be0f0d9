//! Actix Web control surface: live MJPEG feed, alert ledger, start/stop, and
//! downloads.
//!
//! The server runs on a dedicated thread with its own actix system so the
//! detection loop never shares a runtime with request handling.

use std::{net::SocketAddr, sync::Arc, thread::JoinHandle, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header::{self, ContentDisposition, DispositionParam, DispositionType},
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use chrono::Local;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{
    html::index::render_index,
    surveillance::{
        alerts::AlertLedger,
        controller::DetectionController,
        preview::{FramePacket, PreviewBuffer},
        recorder::SessionRecorder,
        telemetry,
    },
};

const STREAM_POLL: Duration = Duration::from_millis(33);

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) controller: Arc<DetectionController>,
    pub(crate) ledger: Arc<AlertLedger>,
    pub(crate) recorder: Arc<SessionRecorder>,
    pub(crate) preview: Arc<PreviewBuffer>,
}

/// Handle for the control server thread.
#[derive(Default)]
pub(crate) struct ControlServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Register every control route.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/video_feed", web::get().to(video_feed))
        .route("/alerts", web::get().to(alerts_handler))
        .route("/start_camera", web::get().to(start_camera))
        .route("/stop_camera", web::get().to(stop_camera))
        .route("/download_alerts", web::get().to(download_alerts))
        .route("/download_video", web::get().to(download_video))
        .route("/metrics", web::get().to(metrics_handler));
}

/// Bind `addr` on a new thread and serve until [`ControlServer::stop`].
///
/// Returns only after the listener is bound, so a port conflict surfaces here.
pub(crate) fn spawn_control_server(addr: SocketAddr, state: web::Data<ServerState>) -> Result<ControlServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);

    let handle = telemetry::spawn_thread("control-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let server = match HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
                .workers(2)
                .bind(addr)
            {
                Ok(server) => {
                    let _ = bound_tx.send(Ok(()));
                    server.run()
                }
                Err(err) => {
                    let _ = bound_tx.send(Err(err.to_string()));
                    return Ok(());
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn control server thread")?;

    match bound_rx.recv() {
        Ok(Ok(())) => {
            info!("Control surface listening on http://{addr}");
            Ok(ControlServer {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(reason)) => {
            let _ = handle.join();
            Err(anyhow!("Failed to bind {addr}: {reason}"))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("Control server thread exited before binding {addr}"))
        }
    }
}

fn attachment(filename: String) -> ContentDisposition {
    ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters: vec![DispositionParam::Filename(filename)],
    }
}

fn file_stamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// One part of the `multipart/x-mixed-replace` feed.
fn multipart_chunk(packet: &FramePacket) -> Bytes {
    let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
    payload.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n");
    payload.extend_from_slice(
        format!(
            "Content-Length: {}\r\nX-Frame-Number: {}\r\nX-Timestamp: {}\r\n\r\n",
            packet.jpeg.len(),
            packet.frame_number,
            packet.timestamp_ms
        )
        .as_bytes(),
    );
    payload.extend_from_slice(&packet.jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

async fn index_route(state: web::Data<ServerState>) -> HttpResponse {
    let sessions: Vec<String> = state
        .recorder
        .sessions()
        .iter()
        .map(|session| {
            format!(
                "{} (started {})",
                session.folder.display(),
                session.created_at.format("%Y-%m-%d %H:%M:%S")
            )
        })
        .collect();
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_index(&sessions))
}

/// Stream each newly published preview frame; idles while none is held.
async fn video_feed(state: web::Data<ServerState>) -> HttpResponse {
    let preview = state.preview.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(STREAM_POLL);
        let mut seen = 0;
        loop {
            interval.tick().await;
            if let Some((sequence, packet)) = preview.latest_since(seen) {
                seen = sequence;
                yield Ok::<Bytes, actix_web::Error>(multipart_chunk(&packet));
            }
        }
    };

    HttpResponse::Ok()
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .content_type("multipart/x-mixed-replace; boundary=frame")
        .streaming(stream)
}

async fn alerts_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.ledger.snapshot())
}

async fn start_camera(state: web::Data<ServerState>) -> HttpResponse {
    let outcome = state.controller.start();
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(outcome.status_text())
}

async fn stop_camera(state: web::Data<ServerState>) -> HttpResponse {
    let outcome = state.controller.stop();
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(outcome.status_text())
}

async fn download_alerts(state: web::Data<ServerState>) -> HttpResponse {
    match state.ledger.to_csv() {
        Ok(Some(csv)) => HttpResponse::Ok()
            .content_type("text/csv")
            .insert_header(attachment(format!("alerts_{}.csv", file_stamp())))
            .body(csv),
        Ok(None) => HttpResponse::NotFound().body("No alerts to download"),
        Err(err) => {
            error!("Failed to render alert CSV: {err}");
            HttpResponse::InternalServerError().body(err.to_string())
        }
    }
}

async fn download_video(state: web::Data<ServerState>) -> HttpResponse {
    let Some(session) = state.recorder.latest_session() else {
        return HttpResponse::NotFound().body("No video recorded yet");
    };
    let path = session.video_path;
    if !path.is_file() {
        return HttpResponse::NotFound().body("Video not found");
    }

    match web::block(move || std::fs::read(path)).await {
        Ok(Ok(bytes)) => HttpResponse::Ok()
            .content_type("video/mp4")
            .insert_header(attachment(format!("detection_{}.mp4", file_stamp())))
            .body(bytes),
        Ok(Err(err)) => {
            error!("Failed to read session video: {err}");
            HttpResponse::NotFound().body("Video not found")
        }
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
