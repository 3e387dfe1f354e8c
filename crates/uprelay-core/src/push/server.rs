//! Push server: axum router implementing registration, the pusher API and
//! long-poll delivery.
//!
//! Delivery responses are chunked bodies that stay open until the client
//! disconnects, the record is removed, or the server shuts down.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::Stream;
use futures::future::select_all;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use uprelay_config::ServerConfig;

use super::queue::{ClientQueue, QueueMap};
use super::types::*;
use crate::daemon::ShutdownSignal;
use crate::ids::ServerId;

/// Shared state accessible to all push server route handlers.
pub struct ServerState {
    pub queues: Arc<QueueMap>,
    pub config: ServerConfig,
    pub shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl ServerState {
    pub fn new(config: ServerConfig, shutdown_tx: broadcast::Sender<ShutdownSignal>) -> Self {
        Self {
            queues: Arc::new(QueueMap::new(config.id_length)),
            config,
            shutdown_tx,
        }
    }
}

/// Errors reported by push server handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("sorry, nobody has registered endpoint {0}")]
    NotFound(ServerId),

    #[error("unknown ids: {}", join_id_list(.0))]
    UnknownIds(Vec<ServerId>),

    #[error("no ids requested")]
    EmptyIdList,

    #[error("payload must be between 1 and {max} bytes, got {len}")]
    PayloadSize { len: usize, max: usize },

    #[error("no such endpoint")]
    NoRoute,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::NotFound(_) | ServerError::UnknownIds(_) | ServerError::NoRoute => {
                StatusCode::NOT_FOUND
            }
            ServerError::EmptyIdList => StatusCode::BAD_REQUEST,
            ServerError::PayloadSize { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        };
        let ids = match &self {
            ServerError::UnknownIds(ids) => ids.clone(),
            _ => Vec::new(),
        };
        let body = Json(ErrorResponse {
            error: self.to_string(),
            ids,
        });
        (status, body).into_response()
    }
}

/// Build the axum router with all push server routes.
pub fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/client/register", get(handle_register))
        .route(
            "/client/id/{id}",
            get(handle_listen_single).delete(handle_unregister),
        )
        .route("/client/multi_id/{ids}", get(handle_listen_multi))
        .route(
            "/push/id/{id}",
            get(handle_discovery).post(handle_push),
        )
        .fallback(handle_fallback)
        .with_state(state)
}

/// Bind the TCP listener described by `config`.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, std::io::Error> {
    TcpListener::bind((config.listen_addr.as_str(), config.listen_port)).await
}

/// Serve the push server on `listener` until the shutdown signal is received.
///
/// Open long-poll streams observe the same signal and end, so graceful
/// shutdown does not wait on them forever.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), std::io::Error> {
    info!(addr = %listener.local_addr()?, "Push server listening");

    let sweeper = state.config.record_ttl().map(|ttl| {
        tokio::spawn(run_sweeper(
            Arc::clone(&state.queues),
            ttl,
            state.shutdown_tx.subscribe(),
        ))
    });

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Push server shutting down");
        })
        .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    Ok(())
}

async fn run_sweeper(
    queues: Arc<QueueMap>,
    ttl: Duration,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) {
    let period = (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = queues.sweep_expired(ttl, SystemTime::now());
                if !expired.is_empty() {
                    info!(count = expired.len(), "Expired idle client records");
                }
            }
            _ = shutdown_rx.recv() => return,
        }
    }
}

// ── Route handlers ──────────────────────────────────────────────────────

async fn handle_register(State(state): State<Arc<ServerState>>) -> Json<RegisterResponse> {
    let id = state.queues.register();
    info!(id = %id, "Client registered");
    Json(RegisterResponse { id })
}

async fn handle_unregister(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<ServerId>,
) -> Result<StatusCode, ServerError> {
    if state.queues.remove(&id) {
        info!(id = %id, "Client unregistered");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServerError::NotFound(id))
    }
}

async fn handle_discovery(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<ServerId>,
) -> Result<Json<DiscoveryResponse>, ServerError> {
    if state.queues.contains(&id) {
        Ok(Json(DiscoveryResponse::current()))
    } else {
        Err(ServerError::NotFound(id))
    }
}

async fn handle_push(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<ServerId>,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let max = state.config.max_payload_bytes;
    if body.is_empty() || body.len() > max {
        return Err(ServerError::PayloadSize {
            len: body.len(),
            max,
        });
    }
    let queue = state
        .queues
        .get(&id)
        .ok_or_else(|| ServerError::NotFound(id.clone()))?;
    queue.push(body);
    debug!(id = %id, queued = queue.len(), "Push accepted");
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_listen_single(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<ServerId>,
) -> Result<Response, ServerError> {
    let queue = state.queues.get(&id).ok_or(ServerError::NotFound(id))?;
    queue.touch();
    debug!(id = %queue.id(), "Single-id listener connected");
    let stream = single_stream(
        queue,
        state.config.poll_interval(),
        state.shutdown_tx.subscribe(),
    );
    Ok(streaming_response("text/plain", stream))
}

async fn handle_listen_multi(
    State(state): State<Arc<ServerState>>,
    Path(segment): Path<String>,
) -> Result<Response, ServerError> {
    let ids = parse_id_list(&segment);
    if ids.is_empty() {
        return Err(ServerError::EmptyIdList);
    }
    let (queues, missing) = state.queues.get_many(&ids);
    if !missing.is_empty() {
        warn!(ids = %join_id_list(&missing), "Multi-id listen with unknown ids");
        return Err(ServerError::UnknownIds(missing));
    }
    queues.iter().for_each(|q| q.touch());
    debug!(count = queues.len(), "Multi-id listener connected");
    let stream = multi_stream(
        queues,
        state.config.poll_interval(),
        state.config.keepalive_interval(),
        state.shutdown_tx.subscribe(),
    );
    Ok(streaming_response("application/json", stream))
}

async fn handle_fallback() -> ServerError {
    ServerError::NoRoute
}

// ── Long-poll streams ───────────────────────────────────────────────────

fn streaming_response<S>(content_type: &'static str, stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

struct SingleListen {
    queue: Arc<ClientQueue>,
    poll_interval: Duration,
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
}

/// One frame per message, oldest first.
fn single_stream(
    queue: Arc<ClientQueue>,
    poll_interval: Duration,
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let listen = SingleListen {
        queue,
        poll_interval,
        shutdown_rx,
    };
    futures::stream::unfold(listen, |mut listen| async move {
        loop {
            let queue = Arc::clone(&listen.queue);
            if queue.is_closed() {
                return None;
            }
            let notified = queue.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = queue.pop() {
                let frame = Bytes::from(encode_single(&item.payload));
                return Some((Ok::<_, Infallible>(frame), listen));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(listen.poll_interval) => {}
                _ = listen.shutdown_rx.recv() => return None,
            }
        }
    })
}

struct MultiListen {
    queues: Vec<Arc<ClientQueue>>,
    poll_interval: Duration,
    keepalive: Option<Duration>,
    last_write: Instant,
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
}

/// One JSON line per wake-up that found at least one non-empty queue, at
/// most [`MAX_BATCH_MESSAGES`] messages each. A blank line goes out when
/// nothing was written for `keepalive`.
fn multi_stream(
    queues: Vec<Arc<ClientQueue>>,
    poll_interval: Duration,
    keepalive: Option<Duration>,
    shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let listen = MultiListen {
        queues,
        poll_interval,
        keepalive,
        last_write: Instant::now(),
        shutdown_rx,
    };
    futures::stream::unfold(listen, |mut listen| async move {
        loop {
            let queues = listen.queues.clone();
            if queues.iter().any(|q| q.is_closed()) {
                return None;
            }
            let mut wakeups: Vec<Pin<Box<Notified<'_>>>> =
                queues.iter().map(|q| Box::pin(q.notified())).collect();
            for wakeup in &mut wakeups {
                wakeup.as_mut().enable();
            }

            let mut batch = BTreeMap::new();
            let mut budget = MAX_BATCH_MESSAGES;
            for queue in &queues {
                let items = queue.drain(budget);
                if !items.is_empty() {
                    budget -= items.len();
                    let payloads: Vec<Bytes> = items.into_iter().map(|i| i.payload).collect();
                    batch.insert(queue.id().clone(), payloads);
                }
                if budget == 0 {
                    break;
                }
            }
            if !batch.is_empty() {
                listen.last_write = Instant::now();
                let line = Bytes::from(encode_batch(&batch));
                return Some((Ok::<_, Infallible>(line), listen));
            }

            let keepalive_at = listen.keepalive.map(|k| listen.last_write + k);
            let keepalive_due = async move {
                match keepalive_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = select_all(wakeups) => {}
                _ = tokio::time::sleep(listen.poll_interval) => {}
                _ = keepalive_due => {
                    listen.last_write = Instant::now();
                    let blank = Bytes::from_static(BATCH_DELIMITER);
                    return Some((Ok::<_, Infallible>(blank), listen));
                }
                _ = listen.shutdown_rx.recv() => return None,
            }
        }
    })
}
