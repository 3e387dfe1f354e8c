//! End-to-end tests: push server, delivery listener, distributor and
//! dispatcher running together over real HTTP.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use uprelay_core::push::ClientError;
use uprelay_core::{
    ConnectorRegistry, Daemon, ListenerStatus, Relay, RegistrationResult, ServerId, ServiceName,
    Token,
};
use uprelay_test_utils::{
    ConnectorEvent, ConnectorEvents, RecordingConnector, TestConfigBuilder, TestServer,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    server: TestServer,
    daemon: Daemon,
    relay: Relay,
    events: ConnectorEvents,
}

impl Harness {
    async fn start() -> Self {
        let server = TestServer::start(TestConfigBuilder::new().build().server).await;
        let config = TestConfigBuilder::new().server_url(&server.url).build();
        let (connector, events) = RecordingConnector::new();

        let daemon = Daemon::new(config);
        let relay = daemon.start_relay(Arc::new(ConnectorRegistry::with_fallback(connector)));
        Self {
            server,
            daemon,
            relay,
            events,
        }
    }

    async fn register(&mut self, service: &str, token: &str) -> ServerId {
        let outcome = self
            .relay
            .distributor
            .register(ServiceName::from(service), Token::from(token), "test")
            .await;
        assert_eq!(outcome.result, RegistrationResult::Succeeded, "{}", outcome.reason);
        match self.events.next(WAIT).await {
            ConnectorEvent::NewEndpoint { token: t, .. } => assert_eq!(t, Token::from(token)),
            other => panic!("expected NewEndpoint, got {other:?}"),
        }
        self.relay
            .distributor
            .store()
            .lookup_by_token(&Token::from(token))
            .expect("registered token has a record")
            .server_id
    }

    /// Wait until the listener holds a connection for exactly `ids`.
    async fn connected_to(&self, ids: &[&ServerId]) {
        let want: uprelay_core::SubscriptionSet = ids.iter().map(|id| (*id).clone()).collect();
        let status = tokio::time::timeout(
            WAIT,
            self.relay
                .distributor
                .listener()
                .wait_for_status(|s| *s == ListenerStatus::Connected(want.clone())),
        )
        .await
        .expect("listener never connected");
        assert!(status.is_some());
    }

    async fn stop(self) {
        self.daemon.shutdown();
        tokio::time::timeout(WAIT, self.relay.join())
            .await
            .expect("relay did not stop")
            .unwrap();
        self.server.shutdown().await;
    }
}

#[test_log::test(tokio::test)]
async fn test_register_push_unregister_scenario() {
    let mut h = Harness::start().await;

    let s1 = h.register("AppA", "tok1").await;
    assert!(h.relay.distributor.listener().subscriptions().contains(&s1));
    h.connected_to(&[&s1]).await;

    let payload = b"0123456789".to_vec();
    h.server.client().push(&s1, payload.clone()).await.unwrap();

    match h.events.next(WAIT).await {
        ConnectorEvent::Message { token, payload: got, message_id } => {
            assert_eq!(token, Token::from("tok1"));
            assert_eq!(got, payload);
            assert!(!message_id.is_empty());
        }
        other => panic!("expected Message, got {other:?}"),
    }

    assert!(h.relay.distributor.unregister(&Token::from("tok1")).await);
    assert!(h.relay.distributor.store().is_empty());
    assert!(h.relay.distributor.listener().subscriptions().is_empty());
    assert!(!h.server.state.queues.contains(&s1));
    assert_eq!(
        h.events.next(WAIT).await,
        ConnectorEvent::Unregistered {
            token: Token::from("tok1")
        }
    );

    h.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_messages_arrive_in_ingestion_order() {
    let mut h = Harness::start().await;
    let id = h.register("AppA", "tok").await;
    h.connected_to(&[&id]).await;

    let client = h.server.client();
    for body in ["M1", "M2", "M3"] {
        client.push(&id, body.as_bytes().to_vec()).await.unwrap();
    }

    let mut got = Vec::new();
    for _ in 0..3 {
        let (_, payload) = h.events.next_message(WAIT).await;
        got.push(String::from_utf8(payload).unwrap());
    }
    assert_eq!(got, vec!["M1", "M2", "M3"]);

    h.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_binary_payload_at_size_limit_round_trips() {
    let mut h = Harness::start().await;
    let id = h.register("AppA", "tok").await;

    let payload: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 256) as u8).collect();
    h.server.client().push(&id, payload.clone()).await.unwrap();
    h.server.client().push(&id, vec![0]).await.unwrap();

    assert_eq!(h.events.next_message(WAIT).await.1, payload);
    assert_eq!(h.events.next_message(WAIT).await.1, vec![0]);

    h.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_rejected_payloads_leave_queue_untouched() {
    let h = Harness::start().await;
    let id = h.server.client().register().await.unwrap();
    let client = h.server.client();

    for payload in [Vec::new(), vec![7u8; 4097]] {
        let err = client.push(&id, payload).await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 413, .. }));
    }
    assert!(h.server.state.queues.get(&id).unwrap().is_empty());

    h.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_new_registration_resubscribes_listener() {
    let mut h = Harness::start().await;
    let a = h.register("AppA", "tok-a").await;
    h.connected_to(&[&a]).await;

    let b = h.register("AppB", "tok-b").await;
    h.connected_to(&[&a, &b]).await;

    h.server.client().push(&b, b"for b".to_vec()).await.unwrap();
    let (token, payload) = h.events.next_message(WAIT).await;
    assert_eq!(token, Token::from("tok-b"));
    assert_eq!(payload, b"for b".to_vec());

    h.relay.distributor.unregister(&Token::from("tok-b")).await;
    h.connected_to(&[&a]).await;

    h.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_repeat_register_is_idempotent() {
    let mut h = Harness::start().await;
    let first = h.register("AppA", "tok").await;
    let second = h.register("AppA", "tok").await;

    assert_eq!(first, second);
    assert_eq!(h.relay.distributor.store().len(), 1);
    assert_eq!(h.server.state.queues.len(), 1);

    h.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_unregister_unknown_token_is_silent() {
    let mut h = Harness::start().await;
    assert!(!h.relay.distributor.unregister(&Token::from("never")).await);
    assert!(h.events.is_quiet_for(Duration::from_millis(300)).await);
    h.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_recovers_after_server_forgets_id() {
    let mut h = Harness::start().await;
    let stale = h.register("AppA", "tok").await;
    h.connected_to(&[&stale]).await;

    // Server drops the record: the stream ends, the reconnect gets 404 and
    // the listener has nothing left to listen for.
    h.server.state.queues.remove(&stale);
    tokio::time::timeout(
        WAIT,
        h.relay
            .distributor
            .listener()
            .wait_for_status(|s| *s == ListenerStatus::Idle),
    )
    .await
    .expect("listener never went idle");

    let fresh = h.register("AppA", "tok").await;
    assert_ne!(fresh, stale);
    h.connected_to(&[&fresh]).await;

    h.server.client().push(&fresh, b"again".to_vec()).await.unwrap();
    assert_eq!(h.events.next_message(WAIT).await.1, b"again".to_vec());

    h.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_forgotten_id_does_not_block_other_registrations() {
    let mut h = Harness::start().await;
    let a = h.register("AppA", "tok-a").await;
    let b = h.register("AppB", "tok-b").await;
    h.connected_to(&[&a, &b]).await;

    h.server.state.queues.remove(&a);
    h.connected_to(&[&b]).await;
    assert_eq!(h.relay.distributor.store().len(), 2);

    h.server.client().push(&b, b"live".to_vec()).await.unwrap();
    let (token, payload) = h.events.next_message(WAIT).await;
    assert_eq!(token, Token::from("tok-b"));
    assert_eq!(payload, b"live".to_vec());

    h.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_idle_records_expire() {
    let server = TestServer::start(TestConfigBuilder::new().record_ttl_secs(1).build().server).await;
    let client = server.client();
    let id = client.register().await.unwrap();
    assert!(client.is_registered(&id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(3_000)).await;
    assert!(!client.is_registered(&id).await.unwrap());
    assert!(server.state.queues.is_empty());

    server.shutdown().await;
}
