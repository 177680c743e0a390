//! ==============================================================================
//! server.rs - http ingestion endpoint
//! ==============================================================================
//!
//! purpose:
//!     the one route devices push to:
//!
//! ```text
//!         POST /sensors/airgradient:{device_id}/measures
//!
//!     - device_id must be 12 lowercase hex chars, anything else is a 404
//!       (checked before the body is read)
//!     - body over MAX_BODY_BYTES or failing validation -> 400, logged with id
//!       and raw body, dispatcher untouched
//!     - accepted body -> dispatcher.ingest(), 200 with an empty body once
//!       every subscriber has finished
//! ```
//!
//! lifecycle:
//!     start(host, port) binds and spawns the server task; stop() signals
//!     graceful shutdown and waits for in-flight requests to drain, including
//!     ingestions whose client already hung up. stop() on a stopped server is
//!     a no-op; start() on a running one is an error.
//!
//! relationships:
//!     - uses: validate.rs (body -> DeviceReading)
//!     - uses: dispatcher.rs (ingest)
//!
//! ==============================================================================

use crate::dispatcher::Dispatcher;
use crate::domain::{DeviceId, SensorData};
use crate::error::{Result, ServerError};
use crate::validate;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    routing::post,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// route devices post readings to; the segment carries `airgradient:<id>`
pub const MEASURES_ROUTE: &str = "/sensors/:sensor/measures";

/// readings are a few hundred bytes; anything past this is rejected
pub const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    ingestions: TaskTracker,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

pub struct IngestServer {
    dispatcher: Arc<Dispatcher>,
    ingestions: TaskTracker,
    running: Mutex<Option<Running>>,
}

impl IngestServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            ingestions: TaskTracker::new(),
            running: Mutex::new(None),
        }
    }

    /// the ingestion router, usable without binding a socket
    pub fn router(&self) -> Router {
        routes(AppState {
            dispatcher: self.dispatcher.clone(),
            ingestions: self.ingestions.clone(),
        })
    }

    /// bind `host:port` and start accepting device pushes.
    ///
    /// returns the bound address (useful with port 0). a bind failure leaves
    /// nothing running.
    pub async fn start(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Err(ServerError::AlreadyRunning(current.local_addr));
        }

        let addr = format!("{}:{}", host, port);
        let bind_error = |source| ServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    // a dropped sender also means shut down
                    let _ = signal.await;
                })
                .await
        });

        info!("listening for devices on http://{}", local_addr);
        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// stop accepting connections and wait for in-flight requests
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return Ok(());
        };

        info!("stopping ingestion endpoint on {}", current.local_addr);
        let _ = current.shutdown.send(());
        let served = current.task.await;

        self.ingestions.close();
        self.ingestions.wait().await;
        self.ingestions.reopen();

        served??;
        info!("ingestion endpoint stopped");
        Ok(())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

// ==============================================================================
// route
// ==============================================================================

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    routes(AppState {
        dispatcher,
        ingestions: TaskTracker::new(),
    })
}

fn routes(state: AppState) -> Router {
    Router::new()
        .route(MEASURES_ROUTE, post(receive_measures))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                tracing::info_span!("http", method = %req.method(), uri = %req.uri())
            }),
        )
}

async fn receive_measures(
    State(state): State<AppState>,
    Path(sensor): Path<String>,
    remote: Option<ConnectInfo<SocketAddr>>,
    body: Body,
) -> StatusCode {
    let Some(id) = DeviceId::from_route_segment(&sensor) else {
        return StatusCode::NOT_FOUND;
    };

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            warn!(device = %id, "bad request from {}: unreadable body ({})", id, err);
            return StatusCode::BAD_REQUEST;
        }
    };

    let reading = match validate::parse_body(&body) {
        Ok(reading) => reading,
        Err(err) => {
            warn!(
                device = %id,
                "bad request from {}: {} ({})",
                id,
                String::from_utf8_lossy(&body),
                err
            );
            return StatusCode::BAD_REQUEST;
        }
    };

    info!(device = %id, "data received");
    let data = SensorData {
        id,
        source_address: remote.map(|ConnectInfo(addr)| addr.ip().to_string()),
        reading,
    };

    // detached: a device hanging up must not cancel a half-published reading
    let dispatcher = state.dispatcher;
    match state
        .ingestions
        .spawn(async move { dispatcher.ingest(data).await })
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            error!("ingest task failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
