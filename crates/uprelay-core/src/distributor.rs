//! Registration protocol on behalf of consumer applications.
//!
//! The distributor owns the [`RegistrationStore`], talks to the push server
//! through a [`PushClient`], keeps the [`DeliveryListener`] subscribed to
//! exactly the set of live server ids, and routes received messages back to
//! the owning consumer.
//!
//! Every store mutation is followed by a publication of the store's id set
//! taken under the store lock, so the listener's subscription set always
//! converges to the latest state.
//!
//! [`DeliveryListener`]: crate::listener::DeliveryListener

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::connector::{DispatchHandle, Notification};
use crate::ids::{ServerId, ServiceName, Token};
use crate::listener::{ListenerHandle, MessageSink};
use crate::push::{ClientError, PushClient, PushMessage};
use crate::store::{RegistrationRecord, RegistrationStore};

pub const REASON_ALREADY_REGISTERED: &str = "already registered";
pub const REASON_REGISTERED: &str = "successfully registered";

/// Result code returned to consumers by [`Distributor::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationResult {
    Succeeded,
    Failed,
}

impl RegistrationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationResult::Succeeded => "REGISTRATION_SUCCEEDED",
            RegistrationResult::Failed => "REGISTRATION_FAILED",
        }
    }
}

impl std::fmt::Display for RegistrationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(result, reason)` pair handed back over IPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
    pub result: RegistrationResult,
    pub reason: String,
}

impl RegistrationOutcome {
    pub fn succeeded(reason: impl Into<String>) -> Self {
        Self {
            result: RegistrationResult::Succeeded,
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            result: RegistrationResult::Failed,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == RegistrationResult::Succeeded
    }
}

/// Internal failures. Their display text becomes the FAILED reason.
#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    #[error("no registration for server id {0}")]
    NotFound(ServerId),

    #[error("token {token} is already registered by {owner}")]
    Duplicate { token: Token, owner: ServiceName },

    #[error("failed to save")]
    SaveFailed(Token),

    #[error("error during registration: {0}")]
    Server(#[from] ClientError),
}

pub struct Distributor {
    store: RegistrationStore,
    client: PushClient,
    listener: ListenerHandle,
    outbox: DispatchHandle,
    last_message_id: AtomicU64,
}

impl Distributor {
    pub fn new(client: PushClient, listener: ListenerHandle, outbox: DispatchHandle) -> Self {
        Self {
            store: RegistrationStore::new(),
            client,
            listener,
            outbox,
            last_message_id: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &RegistrationStore {
        &self.store
    }

    pub fn listener(&self) -> &ListenerHandle {
        &self.listener
    }

    /// Register `token` for `service`. Never fails outright: errors become a
    /// FAILED outcome with a reason.
    pub async fn register(
        &self,
        service: ServiceName,
        token: Token,
        description: &str,
    ) -> RegistrationOutcome {
        match self.try_register(&service, &token, description).await {
            Ok(reason) => RegistrationOutcome::succeeded(reason),
            Err(e) => {
                warn!(service = %service, token = %token, error = %e, "Registration failed");
                RegistrationOutcome::failed(e.to_string())
            }
        }
    }

    async fn try_register(
        &self,
        service: &ServiceName,
        token: &Token,
        description: &str,
    ) -> Result<&'static str, DistributorError> {
        if let Some(existing) = self.store.lookup_by_token(token) {
            if existing.service != *service {
                return Err(DistributorError::Duplicate {
                    token: token.clone(),
                    owner: existing.service,
                });
            }
            if self.client.is_registered(&existing.server_id).await? {
                debug!(token = %token, id = %existing.server_id, "Token already registered");
                self.notify_endpoint(&existing);
                return Ok(REASON_ALREADY_REGISTERED);
            }
            info!(
                token = %token,
                id = %existing.server_id,
                "Push server forgot id, registering again"
            );
            if self
                .store
                .remove_matching(token, &existing.server_id)
                .is_some()
            {
                self.sync_subscriptions();
            }
        }

        let server_id = self.client.register().await?;
        if !self.store.insert(
            token.clone(),
            server_id.clone(),
            service.clone(),
            description,
        ) {
            if let Err(e) = self.client.unregister(&server_id).await {
                debug!(id = %server_id, error = %e, "Could not release unused server id");
            }
            return Err(DistributorError::SaveFailed(token.clone()));
        }
        self.sync_subscriptions();

        info!(service = %service, token = %token, id = %server_id, "Registered");
        let record = RegistrationRecord {
            token: token.clone(),
            server_id,
            service: service.clone(),
            description: description.to_string(),
        };
        self.notify_endpoint(&record);
        Ok(REASON_REGISTERED)
    }

    /// Drop the registration for `token`. Unknown tokens are already
    /// unregistered. Returns whether a record was removed.
    pub async fn unregister(&self, token: &Token) -> bool {
        let Some(record) = self.store.remove(token) else {
            debug!(token = %token, "Unregister for unknown token");
            return false;
        };
        self.sync_subscriptions();

        if let Err(e) = self.client.unregister(&record.server_id).await {
            warn!(id = %record.server_id, error = %e, "Server-side unregister failed");
        }

        info!(service = %record.service, token = %token, id = %record.server_id, "Unregistered");
        self.outbox.send(Notification::Unregistered {
            service: record.service,
            token: record.token,
        });
        true
    }

    /// Route one received message to its consumer.
    pub fn on_message(&self, server_id: &ServerId, payload: Vec<u8>) -> Result<(), DistributorError> {
        let record = self
            .store
            .resolve(server_id)
            .ok_or_else(|| DistributorError::NotFound(server_id.clone()))?;
        let message_id = self.last_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(token = %record.token, message_id, len = payload.len(), "Delivering message");
        self.outbox.send(Notification::Message {
            service: record.service,
            token: record.token,
            payload,
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    /// Publish the store's id set to the listener. Returns whether it changed.
    pub fn sync_subscriptions(&self) -> bool {
        self.store
            .with_server_ids(|ids| self.listener.update_subscriptions(ids))
    }

    fn notify_endpoint(&self, record: &RegistrationRecord) {
        self.outbox.send(Notification::NewEndpoint {
            service: record.service.clone(),
            token: record.token.clone(),
            endpoint: self.client.endpoint_url(&record.server_id),
        });
    }
}

impl MessageSink for Distributor {
    fn deliver(&self, message: PushMessage) {
        if let Err(e) = self.on_message(&message.server_id, message.payload) {
            warn!(error = %e, "Dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;
    use tokio::sync::{broadcast, mpsc};
    use uprelay_config::{ListenerConfig, ServerConfig};

    use super::*;
    use crate::daemon::ShutdownSignal;
    use crate::listener::DeliveryListener;
    use crate::push::{ServerState, server};
    use crate::store::SubscriptionSet;

    struct Fixture {
        distributor: Distributor,
        notifications: mpsc::UnboundedReceiver<Notification>,
        server: Arc<ServerState>,
        _shutdown_tx: broadcast::Sender<ShutdownSignal>,
        _listener: DeliveryListener,
    }

    async fn fixture() -> Fixture {
        uprelay_test_utils::tracing_setup::init_test_tracing();
        let (shutdown_tx, _) = broadcast::channel(4);
        let state = Arc::new(ServerState::new(ServerConfig::default(), shutdown_tx.clone()));
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", tcp.local_addr().unwrap());
        tokio::spawn(server::serve(tcp, Arc::clone(&state), shutdown_tx.subscribe()));

        let client = PushClient::new(url, Duration::from_secs(2));
        let (listener, handle) = DeliveryListener::new(client.clone(), ListenerConfig::default());
        let (tx, notifications) = mpsc::unbounded_channel();
        Fixture {
            distributor: Distributor::new(client, handle, DispatchHandle::from(tx)),
            notifications,
            server: state,
            _shutdown_tx: shutdown_tx,
            _listener: listener,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_register_assigns_id_and_subscribes() {
        let mut f = fixture().await;
        let outcome = f
            .distributor
            .register(ServiceName::from("AppA"), Token::from("tok1"), "desc")
            .await;
        assert_eq!(outcome, RegistrationOutcome::succeeded(REASON_REGISTERED));

        let record = f.distributor.store().lookup_by_token(&Token::from("tok1")).unwrap();
        assert!(f.server.queues.contains(&record.server_id));
        assert_eq!(
            f.distributor.listener().subscriptions(),
            SubscriptionSet::from([record.server_id.clone()])
        );

        match drain(&mut f.notifications).as_slice() {
            [Notification::NewEndpoint { token, endpoint, .. }] => {
                assert_eq!(token, &Token::from("tok1"));
                assert!(endpoint.ends_with(&format!("/push/id/{}", record.server_id)));
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let mut f = fixture().await;
        let service = ServiceName::from("AppA");
        f.distributor.register(service.clone(), Token::from("t"), "").await;
        let first = f.distributor.store().lookup_by_token(&Token::from("t")).unwrap();

        let again = f.distributor.register(service, Token::from("t"), "").await;
        assert_eq!(again, RegistrationOutcome::succeeded(REASON_ALREADY_REGISTERED));
        assert_eq!(f.distributor.store().len(), 1);
        assert_eq!(f.server.queues.len(), 1);
        assert_eq!(
            f.distributor.store().lookup_by_token(&Token::from("t")).unwrap(),
            first
        );
        assert_eq!(drain(&mut f.notifications).len(), 2);
    }

    #[tokio::test]
    async fn test_register_replaces_id_the_server_forgot() {
        let f = fixture().await;
        let service = ServiceName::from("AppA");
        f.distributor.register(service.clone(), Token::from("t"), "").await;
        let stale = f.distributor.store().lookup_by_token(&Token::from("t")).unwrap();
        f.server.queues.remove(&stale.server_id);

        let outcome = f.distributor.register(service, Token::from("t"), "").await;
        assert_eq!(outcome, RegistrationOutcome::succeeded(REASON_REGISTERED));

        let fresh = f.distributor.store().lookup_by_token(&Token::from("t")).unwrap();
        assert_ne!(fresh.server_id, stale.server_id);
        assert_eq!(
            f.distributor.listener().subscriptions(),
            SubscriptionSet::from([fresh.server_id])
        );
    }

    #[tokio::test]
    async fn test_concurrent_register_keeps_one_record() {
        let mut f = fixture().await;
        let service = ServiceName::from("AppA");
        let (first, second) = tokio::join!(
            f.distributor.register(service.clone(), Token::from("t"), ""),
            f.distributor.register(service.clone(), Token::from("t"), ""),
        );

        let mut outcomes = vec![first, second];
        outcomes.sort_by_key(|o| o.is_success());
        assert_eq!(
            outcomes,
            vec![
                RegistrationOutcome::failed("failed to save"),
                RegistrationOutcome::succeeded(REASON_REGISTERED),
            ]
        );

        let record = f.distributor.store().lookup_by_token(&Token::from("t")).unwrap();
        assert_eq!(f.distributor.store().len(), 1);
        assert_eq!(f.server.queues.len(), 1);
        assert!(f.server.queues.contains(&record.server_id));
        assert_eq!(
            f.distributor.listener().subscriptions(),
            SubscriptionSet::from([record.server_id])
        );
        assert_eq!(drain(&mut f.notifications).len(), 1);
    }

    #[tokio::test]
    async fn test_new_endpoint_uses_public_url() {
        let f = fixture().await;
        let client = f.distributor.client.clone().with_public_url("https://push.example.org/");
        let (_listener, handle) = DeliveryListener::new(client.clone(), ListenerConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let distributor = Distributor::new(client, handle, DispatchHandle::from(tx));

        let outcome = distributor
            .register(ServiceName::from("AppA"), Token::from("t"), "")
            .await;
        assert!(outcome.is_success());

        let id = distributor.store().lookup_by_token(&Token::from("t")).unwrap().server_id;
        assert!(f.server.queues.contains(&id));
        match drain(&mut rx).as_slice() {
            [Notification::NewEndpoint { endpoint, .. }] => {
                assert_eq!(endpoint, &format!("https://push.example.org/push/id/{id}"));
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_token_owned_by_other_service_fails() {
        let f = fixture().await;
        f.distributor
            .register(ServiceName::from("AppA"), Token::from("t"), "")
            .await;
        let outcome = f
            .distributor
            .register(ServiceName::from("AppB"), Token::from("t"), "")
            .await;
        assert_eq!(outcome.result, RegistrationResult::Failed);
        assert!(outcome.reason.contains("already registered by AppA"));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_with_reason() {
        let client = PushClient::new("http://127.0.0.1:1", Duration::from_millis(300));
        let (_listener, handle) = DeliveryListener::new(client.clone(), ListenerConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let distributor = Distributor::new(client, handle, DispatchHandle::from(tx));

        let outcome = distributor
            .register(ServiceName::from("AppA"), Token::from("t"), "")
            .await;
        assert_eq!(outcome.result, RegistrationResult::Failed);
        assert!(outcome.reason.starts_with("error during registration"));
        assert!(distributor.store().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unregister_unknown_token_has_no_side_effects() {
        let mut f = fixture().await;
        assert!(!f.distributor.unregister(&Token::from("ghost")).await);
        assert!(drain(&mut f.notifications).is_empty());
    }

    #[tokio::test]
    async fn test_unregister_removes_everywhere() {
        let mut f = fixture().await;
        f.distributor
            .register(ServiceName::from("AppA"), Token::from("t"), "")
            .await;
        let id = f.distributor.store().lookup_by_token(&Token::from("t")).unwrap().server_id;
        drain(&mut f.notifications);

        assert!(f.distributor.unregister(&Token::from("t")).await);
        assert!(f.distributor.store().is_empty());
        assert!(!f.server.queues.contains(&id));
        assert!(f.distributor.listener().subscriptions().is_empty());
        assert_eq!(
            drain(&mut f.notifications),
            vec![Notification::Unregistered {
                service: ServiceName::from("AppA"),
                token: Token::from("t"),
            }]
        );
    }

    #[tokio::test]
    async fn test_on_message_routes_and_numbers() {
        let mut f = fixture().await;
        f.distributor
            .register(ServiceName::from("AppA"), Token::from("t"), "")
            .await;
        let id = f.distributor.store().lookup_by_token(&Token::from("t")).unwrap().server_id;
        drain(&mut f.notifications);

        f.distributor.deliver(PushMessage {
            server_id: id.clone(),
            payload: b"one".to_vec(),
        });
        f.distributor.deliver(PushMessage {
            server_id: ServerId::from("unknown"),
            payload: b"lost".to_vec(),
        });
        f.distributor.on_message(&id, b"two".to_vec()).unwrap();

        let ids: Vec<_> = drain(&mut f.notifications)
            .into_iter()
            .map(|n| match n {
                Notification::Message {
                    payload,
                    message_id,
                    ..
                } => (String::from_utf8(payload).unwrap(), message_id),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            ids,
            vec![
                ("one".to_string(), "1".to_string()),
                ("two".to_string(), "2".to_string())
            ]
        );
        assert!(matches!(
            f.distributor.on_message(&ServerId::from("x"), vec![1]),
            Err(DistributorError::NotFound(_))
        ));
    }
}
