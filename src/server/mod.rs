// src/server/mod.rs

//! Thin HTTP ingress for cluster-management tasks. It converts requests
//! into pipeline submissions and relays the terminal reply to the caller.

use crate::config::HttpConfig;
use crate::core::supervisor::Supervisor;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// The task schema every ingress source produces.
#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub operation: String,
    #[serde(rename = "redisNodeIp")]
    pub redis_node_ip: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum TaskResponse {
    Done {
        status: &'static str,
        role: String,
        host: String,
    },
    Accepted {
        status: &'static str,
    },
    Failed {
        status: &'static str,
        reason: String,
    },
}

/// Handles `POST /task`: submits the task and waits for its terminal
/// outcome. Operations that finish without a signal answer 202.
async fn submit_task(
    State(supervisor): State<Arc<Supervisor>>,
    Json(request): Json<TaskRequest>,
) -> impl IntoResponse {
    let reply = match supervisor
        .submit(&request.operation, &request.redis_node_ip)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(TaskResponse::Failed {
                    status: "error",
                    reason: e.to_string(),
                }),
            );
        }
    };

    match reply.await {
        Ok(Ok((role, host))) => (
            StatusCode::OK,
            Json(TaskResponse::Done {
                status: "success",
                role,
                host,
            }),
        ),
        Ok(Err(reason)) => (
            StatusCode::BAD_REQUEST,
            Json(TaskResponse::Failed {
                status: "error",
                reason,
            }),
        ),
        Err(_) => (
            StatusCode::ACCEPTED,
            Json(TaskResponse::Accepted { status: "accepted" }),
        ),
    }
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Runs the ingress HTTP server until the shutdown signal fires.
pub async fn run_http_server(
    config: &HttpConfig,
    supervisor: Arc<Supervisor>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let app = Router::new()
        .route("/task", post(submit_task))
        .route("/health", get(health))
        .with_state(supervisor);

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(
                "invalid HTTP listen address {}:{}: {}",
                config.host, config.port, e
            );
            return;
        }
    };
    info!("task ingress listening on http://{}/task", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind task ingress on {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("task ingress shutting down.");
        })
        .await
    {
        error!("task ingress server error: {}", e);
    }
}
