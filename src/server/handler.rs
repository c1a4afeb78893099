// Axum request handler: translates render requests into orchestrator runs.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::request::RenderRequest;
use crate::api::response::RenderAccepted;
use crate::engine::pipeline::Orchestrator;

pub const SERVICE_NAME: &str = "render-job-engine";

pub type AppState = Arc<Orchestrator>;

pub struct RenderServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RenderServer {
    /// Bind `bind_addr` and start serving in the background.
    pub async fn start(bind_addr: &str, orchestrator: AppState) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(orchestrator);

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("http server stopped: {}", e);
            }
        });
        info!("listening on {}", addr);

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build a URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

pub fn router(orchestrator: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/render", post(render_handler))
        .with_state(orchestrator)
}

fn detail(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

/// GET /health
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "service": SERVICE_NAME }))
}

/// POST /render: prepare the scene, upload it and submit the batch job.
async fn render_handler(
    State(orchestrator): State<AppState>,
    payload: Result<Json<RenderRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("rejected render request body: {}", rejection.body_text());
            return detail(rejection.status(), rejection.body_text());
        }
    };
    if let Err(e) = request.validate() {
        warn!("rejected render request job={}: {}", request.job_id, e);
        return detail(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
    }

    // Run on its own task so a dropped connection doesn't abandon the job
    // halfway through an engine pass.
    let job = tokio::spawn(async move { orchestrator.run(&request).await });
    match job.await {
        Ok(Ok(submitted)) => {
            Json(RenderAccepted::from_submitted(&submitted)).into_response()
        }
        Ok(Err(e)) => detail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Render job failed: {}", e),
        ),
        Err(e) => {
            error!("render task panicked: {}", e);
            detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Render job failed: internal error".to_string(),
            )
        }
    }
}
