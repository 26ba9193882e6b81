//! HTTP synthesis API.
//!
//!   POST /synthesize  {"text": "...", "speaker_id": 0}  → audio/wav
//!   GET  /health
//!
//! The engine is loaded once at startup from the `TTS_*` environment
//! variables; each request runs on a blocking thread.

use std::net::SocketAddr;

use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use kinyatts::engine::{self, TtsEngine};

#[derive(Debug, Parser)]
#[command(name = "kinyatts-server", about = "HTTP API for Kinyarwanda text-to-speech")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "TTS_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
struct SynthesizeRequest {
    text: String,
    /// Accepted as a number or a string.
    #[serde(default)]
    speaker_id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: msg.into() })).into_response()
}

fn speaker_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn synthesize(Json(req): Json<SynthesizeRequest>) -> Response {
    if req.text.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "text must not be empty");
    }
    let speaker = req.speaker_id.as_ref().and_then(speaker_string);

    let result =
        tokio::task::spawn_blocking(move || engine::synthesize(&req.text, speaker.as_deref())).await;
    let out = match result {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            error!("synthesis failed: {e:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"));
        }
        Err(e) => {
            error!("synthesis task panicked: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "synthesis task failed");
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"));
    if let Ok(v) = HeaderValue::from_str(&format!("{:.0}", out.latency_ms)) {
        headers.insert("x-latency-ms", v);
    }
    (StatusCode::OK, headers, out.wav_bytes).into_response()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for ctrl-c: {e}");
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kinyatts::logging::init();
    let cli = Cli::parse();

    // Load before accepting traffic so the first request is not slow.
    let engine: &'static TtsEngine = tokio::task::spawn_blocking(engine::global).await??;
    info!("Model sample rate {} Hz", engine.model_sample_rate());

    let app = Router::new()
        .route("/health", get(health))
        .route("/synthesize", post(synthesize))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!("Listening on {}", cli.addr);
    let listener = TcpListener::bind(cli.addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}
