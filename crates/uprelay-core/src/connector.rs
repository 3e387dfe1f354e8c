//! Consumer-facing callback capability.
//!
//! Each registered application exposes a [`Connector`] with three
//! fire-and-forget operations. The IPC layer that reaches applications is
//! not part of this crate; it plugs in by implementing [`Connector`] and
//! [`ConnectorResolver`].
//!
//! The distributor never calls connectors directly. It queues
//! [`Notification`]s on a [`DispatchHandle`], and a single [`Dispatcher`]
//! task delivers them in order, so per-registration ordering survives and
//! the registration path never waits on a consumer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::daemon::ShutdownSignal;
use crate::ids::{ServiceName, Token};

/// Errors from delivering a callback to a consumer.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("no connector available for service {0}")]
    Unavailable(ServiceName),

    #[error("consumer does not track token {0}")]
    TokenMismatch(Token),

    #[error("connector transport error: {0}")]
    Transport(String),
}

/// The three callbacks every consumer must accept.
pub trait Connector: Send + Sync {
    /// A push message arrived for `token`.
    fn message(
        &self,
        token: Token,
        payload: Vec<u8>,
        message_id: String,
    ) -> BoxFuture<'_, Result<(), ConnectorError>>;

    /// `token` was assigned the public endpoint URL `endpoint`.
    fn new_endpoint(&self, token: Token, endpoint: String)
    -> BoxFuture<'_, Result<(), ConnectorError>>;

    /// `token` is no longer registered.
    fn unregistered(&self, token: Token) -> BoxFuture<'_, Result<(), ConnectorError>>;
}

/// Maps a service name to the connector that reaches it.
pub trait ConnectorResolver: Send + Sync {
    fn resolve(&self, service: &ServiceName) -> Option<Arc<dyn Connector>>;
}

/// In-memory resolver with an optional catch-all connector.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<ServiceName, Arc<dyn Connector>>>,
    fallback: Option<Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every unknown service to `fallback`.
    pub fn with_fallback(fallback: Arc<dyn Connector>) -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
            fallback: Some(fallback),
        }
    }

    pub fn insert(&self, service: ServiceName, connector: Arc<dyn Connector>) {
        self.connectors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service, connector);
    }

    pub fn remove(&self, service: &ServiceName) -> bool {
        self.connectors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(service)
            .is_some()
    }
}

impl ConnectorResolver for ConnectorRegistry {
    fn resolve(&self, service: &ServiceName) -> Option<Arc<dyn Connector>> {
        self.connectors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

/// Connector that only logs what it receives.
#[derive(Debug, Default, Clone)]
pub struct LoggingConnector;

impl Connector for LoggingConnector {
    fn message(
        &self,
        token: Token,
        payload: Vec<u8>,
        message_id: String,
    ) -> BoxFuture<'_, Result<(), ConnectorError>> {
        Box::pin(async move {
            info!(
                token = %token,
                message_id = %message_id,
                len = payload.len(),
                body = %String::from_utf8_lossy(&payload),
                "Message"
            );
            Ok(())
        })
    }

    fn new_endpoint(
        &self,
        token: Token,
        endpoint: String,
    ) -> BoxFuture<'_, Result<(), ConnectorError>> {
        Box::pin(async move {
            info!(token = %token, endpoint = %endpoint, "NewEndpoint");
            Ok(())
        })
    }

    fn unregistered(&self, token: Token) -> BoxFuture<'_, Result<(), ConnectorError>> {
        Box::pin(async move {
            info!(token = %token, "Unregistered");
            Ok(())
        })
    }
}

/// A callback queued for a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Message {
        service: ServiceName,
        token: Token,
        payload: Vec<u8>,
        message_id: String,
    },
    NewEndpoint {
        service: ServiceName,
        token: Token,
        endpoint: String,
    },
    Unregistered {
        service: ServiceName,
        token: Token,
    },
}

impl Notification {
    pub fn service(&self) -> &ServiceName {
        match self {
            Notification::Message { service, .. }
            | Notification::NewEndpoint { service, .. }
            | Notification::Unregistered { service, .. } => service,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Notification::Message { .. } => "Message",
            Notification::NewEndpoint { .. } => "NewEndpoint",
            Notification::Unregistered { .. } => "Unregistered",
        }
    }
}

/// Non-blocking sender side of the dispatcher queue.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Notification>,
}

impl DispatchHandle {
    /// Queue a notification. Never waits.
    pub fn send(&self, notification: Notification) {
        if let Err(e) = self.tx.send(notification) {
            debug!(kind = e.0.kind(), "Dispatcher stopped, dropping notification");
        }
    }
}

impl From<mpsc::UnboundedSender<Notification>> for DispatchHandle {
    fn from(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { tx }
    }
}

/// Delivers queued notifications to consumers, one at a time.
pub struct Dispatcher {
    rx: mpsc::UnboundedReceiver<Notification>,
    resolver: Arc<dyn ConnectorResolver>,
}

impl Dispatcher {
    pub fn new(resolver: Arc<dyn ConnectorResolver>) -> (Self, DispatchHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx, resolver }, DispatchHandle { tx })
    }

    /// Run until every handle is dropped or shutdown is signalled.
    ///
    /// Notifications already queued at shutdown are still delivered.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<ShutdownSignal>) {
        loop {
            tokio::select! {
                next = self.rx.recv() => match next {
                    Some(notification) => self.dispatch(notification).await,
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    while let Ok(notification) = self.rx.try_recv() {
                        self.dispatch(notification).await;
                    }
                    break;
                }
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn dispatch(&self, notification: Notification) {
        let kind = notification.kind();
        let service = notification.service().clone();
        let Some(connector) = self.resolver.resolve(&service) else {
            warn!(service = %service, kind, "{}", ConnectorError::Unavailable(service.clone()));
            return;
        };

        let result = match notification {
            Notification::Message {
                token,
                payload,
                message_id,
                ..
            } => connector.message(token, payload, message_id).await,
            Notification::NewEndpoint {
                token, endpoint, ..
            } => connector.new_endpoint(token, endpoint).await,
            Notification::Unregistered { token, .. } => connector.unregistered(token).await,
        };

        if let Err(e) = result {
            warn!(service = %service, kind, error = %e, "Connector callback failed");
        }
    }
}
