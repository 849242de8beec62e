//! Gateway HTTP server: status and outbound send endpoints over the running service.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::HttpReplyPipeline;
use crate::channels::sidecar::OutboundSender;
use crate::config::{self, Config};
use crate::error::{BridgeError, ErrorKind};
use crate::gateway::protocol::{
    AccountStatus, ErrorBody, SendMediaParams, SendParams, SendResult, StatusResponse,
};
use crate::service::BridgeService;

#[derive(Clone)]
pub struct GatewayState {
    pub service: Arc<BridgeService>,
    pub port: u16,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/send", post(send_http))
        .route("/sendMedia", post(send_media_http))
        .with_state(state)
}

/// Load the service from config, start it, and serve until Ctrl+C / SIGTERM.
/// A sidecar that fails its health check aborts before the port is bound.
pub async fn run_gateway(config: Config, config_path: PathBuf, port: Option<u16>) -> Result<()> {
    log::debug!("gateway config from {}", config_path.display());
    let runtime_url = config::resolve_runtime_url(&config).ok_or_else(|| {
        BridgeError::Config(
            "agents.runtimeUrl (or BEAGLE_RUNTIME_URL) is required to dispatch replies".to_string(),
        )
    })?;
    let cfg = serde_json::to_value(&config.agents).context("serializing agents config")?;
    let runtime_timeout = config::resolve_runtime_timeout(&config, &config::resolve_settings(&config));
    let pipeline =
        Arc::new(HttpReplyPipeline::new(runtime_url, cfg).with_request_timeout(runtime_timeout));
    let service = Arc::new(BridgeService::from_config(&config, pipeline)?);
    service.start().await?;

    let port = port.unwrap_or(config.gateway.port);
    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    serve_gateway(listener, service, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` completes, then stop the service.
pub async fn serve_gateway(
    listener: tokio::net::TcpListener,
    service: Arc<BridgeService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    let app = router(GatewayState {
        service: service.clone(),
        port,
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited")?;
    service.stop().await;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping accounts");
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            ok: false,
            error: error.into(),
        }),
    )
        .into_response()
}

fn bridge_error_response(e: BridgeError) -> Response {
    let status = match e.kind() {
        ErrorKind::InvalidMediaReference => StatusCode::BAD_REQUEST,
        ErrorKind::TransportFailure => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

async fn sender_or_404(
    state: &GatewayState,
    account_id: Option<&str>,
) -> Result<Arc<dyn OutboundSender>, Response> {
    state.service.sender_for(account_id).await.ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            format!("unknown account {}", account_id.unwrap_or("(default)")),
        )
    })
}

/// GET / returns runtime status and per-account connection state.
async fn health_http(State(state): State<GatewayState>) -> Json<StatusResponse> {
    let accounts = state
        .service
        .account_states()
        .await
        .into_iter()
        .map(|(account_id, s)| AccountStatus {
            account_id,
            state: s.as_str().to_string(),
        })
        .collect();
    Json(StatusResponse {
        runtime: "running".to_string(),
        port: state.port,
        accounts,
    })
}

/// POST /send {accountId?, peer, text}.
async fn send_http(State(state): State<GatewayState>, Json(params): Json<SendParams>) -> Response {
    let sender = match sender_or_404(&state, params.account_id.as_deref()).await {
        Ok(s) => s,
        Err(r) => return r,
    };
    match sender.send_text(&params.peer, &params.text).await {
        Ok(sent) => Json(SendResult {
            ok: true,
            message_id: Some(sent.message_id),
            timestamp: Some(sent.timestamp_ms),
        })
        .into_response(),
        Err(e) => {
            log::warn!("gateway send failed peer={}: {}", params.peer, e);
            bridge_error_response(e)
        }
    }
}

/// POST /sendMedia {accountId?, peer, mediaPath|mediaUrl, mediaType, caption?, filename?}.
async fn send_media_http(
    State(state): State<GatewayState>,
    Json(params): Json<SendMediaParams>,
) -> Response {
    if let Err(e) = params.media.validate() {
        return bridge_error_response(e);
    }
    let sender = match sender_or_404(&state, params.account_id.as_deref()).await {
        Ok(s) => s,
        Err(r) => return r,
    };
    match sender.send_media(&params.peer, &params.media).await {
        Ok(()) => Json(SendResult {
            ok: true,
            message_id: None,
            timestamp: None,
        })
        .into_response(),
        Err(e) => {
            log::warn!("gateway sendMedia failed peer={}: {}", params.peer, e);
            bridge_error_response(e)
        }
    }
}
