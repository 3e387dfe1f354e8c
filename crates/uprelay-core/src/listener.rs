//! Delivery listener: one multi-id long-poll that follows the subscription set.
//!
//! The listener task owns the connection. Everything else talks to it through
//! a [`ListenerHandle`]: publishing a new subscription set or requesting a
//! reconnect only touches a watch channel or a [`Notify`], so callers never
//! wait on the network.
//!
//! Lines already received from the server are forwarded to the
//! [`MessageSink`] before the connection is dropped for a reconnect.
//!
//! Ids the server reports as unknown are left out of later connections until
//! the subscription set changes, so one forgotten id does not block delivery
//! for the others.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Notify, broadcast, watch};
use tracing::{debug, info, warn};

use uprelay_config::ListenerConfig;

use crate::daemon::ShutdownSignal;
use crate::push::{
    ClientError, LineBuffer, PushClient, PushMessage, decode_batch_line, join_id_list,
};
use crate::store::SubscriptionSet;

/// Receiver of decoded push messages.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: PushMessage);
}

/// What the listener task is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStatus {
    /// Subscription set is empty; no connection held.
    Idle,
    Connecting(SubscriptionSet),
    Connected(SubscriptionSet),
    /// Waiting before the next connection attempt.
    Backoff { attempt: u32, delay: Duration },
    Stopped,
}

/// Cheap, cloneable control surface for a running [`DeliveryListener`].
#[derive(Clone)]
pub struct ListenerHandle {
    subscriptions: Arc<watch::Sender<SubscriptionSet>>,
    reconnect: Arc<Notify>,
    status: watch::Receiver<ListenerStatus>,
}

impl ListenerHandle {
    /// Replace the subscription set. Returns `true` if it changed, in which
    /// case the listener reconnects with the new set.
    pub fn update_subscriptions(&self, ids: SubscriptionSet) -> bool {
        self.subscriptions.send_if_modified(|current| {
            if *current == ids {
                false
            } else {
                *current = ids;
                true
            }
        })
    }

    /// Drop the open connection (if any) and re-evaluate the set.
    pub fn reconnect(&self) {
        self.reconnect.notify_one();
    }

    pub fn subscriptions(&self) -> SubscriptionSet {
        self.subscriptions.borrow().clone()
    }

    pub fn status(&self) -> ListenerStatus {
        self.status.borrow().clone()
    }

    /// Wait until the listener reports a status matching `predicate`.
    ///
    /// Returns `None` if the listener task is gone.
    pub async fn wait_for_status(
        &self,
        predicate: impl FnMut(&ListenerStatus) -> bool,
    ) -> Option<ListenerStatus> {
        let mut status = self.status.clone();
        let matched = status.wait_for(predicate).await.ok()?;
        Some(matched.clone())
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("subscriptions", &*self.subscriptions.borrow())
            .field("status", &*self.status.borrow())
            .finish()
    }
}

/// Exponential backoff with ±25% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; doubles the base up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempt += 1;
        let jitter = base.as_secs_f64() * 0.25 * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.01))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }
}

/// Why one connection attempt ended.
enum Exit {
    Shutdown,
    /// Handles dropped; nobody can change the set any more.
    Orphaned,
    Resubscribe,
    Failed(ClientError),
}

/// The listener task. Build with [`DeliveryListener::new`], then spawn
/// [`DeliveryListener::run`].
pub struct DeliveryListener {
    client: PushClient,
    config: ListenerConfig,
    subscriptions: watch::Receiver<SubscriptionSet>,
    reconnect: Arc<Notify>,
    status: watch::Sender<ListenerStatus>,
}

impl DeliveryListener {
    pub fn new(client: PushClient, config: ListenerConfig) -> (Self, ListenerHandle) {
        let (sub_tx, sub_rx) = watch::channel(SubscriptionSet::new());
        let (status_tx, status_rx) = watch::channel(ListenerStatus::Idle);
        let reconnect = Arc::new(Notify::new());

        let handle = ListenerHandle {
            subscriptions: Arc::new(sub_tx),
            reconnect: Arc::clone(&reconnect),
            status: status_rx,
        };
        let listener = Self {
            client,
            config,
            subscriptions: sub_rx,
            reconnect,
            status: status_tx,
        };
        (listener, handle)
    }

    /// Run until shutdown is signalled or every handle is dropped.
    pub async fn run(
        mut self,
        sink: Arc<dyn MessageSink>,
        mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    ) {
        let mut backoff = Backoff::new(self.config.backoff_initial(), self.config.backoff_max());
        let mut wanted = SubscriptionSet::new();
        let mut rejected = SubscriptionSet::new();

        loop {
            let latest = self.subscriptions.borrow_and_update().clone();
            if latest != wanted {
                rejected.clear();
                wanted = latest;
            }
            let ids: SubscriptionSet = wanted.difference(&rejected).cloned().collect();

            let exit = if ids.is_empty() {
                self.set_status(ListenerStatus::Idle);
                self.idle(&mut shutdown_rx).await
            } else {
                self.listen_once(&ids, sink.as_ref(), &mut shutdown_rx, &mut backoff)
                    .await
            };

            match exit {
                Exit::Shutdown | Exit::Orphaned => break,
                Exit::Resubscribe => continue,
                Exit::Failed(ClientError::UnknownIds(unknown))
                    if unknown.iter().any(|id| ids.contains(id)) =>
                {
                    warn!(
                        ids = %join_id_list(&unknown),
                        "Push server does not know ids, listening without them"
                    );
                    rejected.extend(unknown.into_iter().filter(|id| ids.contains(id)));
                }
                Exit::Failed(e) => {
                    let delay = backoff.next_delay();
                    let delay_ms = delay.as_millis() as u64;
                    if e.is_transient() {
                        warn!(error = %e, attempt = backoff.attempt(), delay_ms, "Delivery connection failed, backing off");
                    } else {
                        warn!(error = %e, attempt = backoff.attempt(), delay_ms, "Delivery connection rejected, backing off");
                    }
                    self.set_status(ListenerStatus::Backoff {
                        attempt: backoff.attempt(),
                        delay,
                    });
                    match self.wait(delay, &mut shutdown_rx).await {
                        Exit::Shutdown | Exit::Orphaned => break,
                        _ => {}
                    }
                }
            }
        }

        self.set_status(ListenerStatus::Stopped);
        info!("Delivery listener stopped");
    }

    async fn idle(&mut self, shutdown_rx: &mut broadcast::Receiver<ShutdownSignal>) -> Exit {
        let idle_poll = self.config.idle_poll();
        self.wait(idle_poll, shutdown_rx).await
    }

    /// Sleep for `delay`, cut short by shutdown, a set change or a reconnect request.
    async fn wait(
        &mut self,
        delay: Duration,
        shutdown_rx: &mut broadcast::Receiver<ShutdownSignal>,
    ) -> Exit {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => Exit::Shutdown,
            changed = self.subscriptions.changed() => match changed {
                Ok(()) => Exit::Resubscribe,
                Err(_) => Exit::Orphaned,
            },
            _ = self.reconnect.notified() => Exit::Resubscribe,
            _ = tokio::time::sleep(delay) => Exit::Resubscribe,
        }
    }

    async fn listen_once(
        &mut self,
        ids: &SubscriptionSet,
        sink: &dyn MessageSink,
        shutdown_rx: &mut broadcast::Receiver<ShutdownSignal>,
        backoff: &mut Backoff,
    ) -> Exit {
        self.set_status(ListenerStatus::Connecting(ids.clone()));

        let response = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Exit::Shutdown,
            changed = self.subscriptions.changed() => {
                return if changed.is_ok() { Exit::Resubscribe } else { Exit::Orphaned };
            }
            _ = self.reconnect.notified() => return Exit::Resubscribe,
            result = self.client.listen(ids) => match result {
                Ok(response) => response,
                Err(e) => return Exit::Failed(e),
            },
        };

        info!(count = ids.len(), "Delivery connection open");
        self.set_status(ListenerStatus::Connected(ids.clone()));
        backoff.reset();

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let read_timeout = self.config.read_timeout();
        let silence = tokio::time::sleep(read_timeout);
        tokio::pin!(silence);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Exit::Shutdown,
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        silence.as_mut().reset(tokio::time::Instant::now() + read_timeout);
                        if let Err(e) = lines.extend(&bytes) {
                            warn!(error = %e, "Dropping oversized delivery line");
                        }
                        while let Some(line) = lines.next_line() {
                            forward_line(&line, sink);
                        }
                    }
                    Some(Err(e)) => return Exit::Failed(ClientError::Network(e.to_string())),
                    None => {
                        return Exit::Failed(ClientError::Network(
                            "delivery stream closed by server".to_string(),
                        ));
                    }
                },
                changed = self.subscriptions.changed() => {
                    debug!("Subscription set changed, reconnecting");
                    return if changed.is_ok() { Exit::Resubscribe } else { Exit::Orphaned };
                }
                _ = self.reconnect.notified() => {
                    debug!("Reconnect requested");
                    return Exit::Resubscribe;
                }
                _ = &mut silence => {
                    return Exit::Failed(ClientError::Network(format!(
                        "nothing received for {}ms",
                        read_timeout.as_millis()
                    )));
                }
            }
        }
    }

    fn set_status(&self, status: ListenerStatus) {
        self.status.send_replace(status);
    }
}

fn forward_line(line: &[u8], sink: &dyn MessageSink) {
    match decode_batch_line(line) {
        Ok(messages) => {
            for message in messages {
                debug!(id = %message.server_id, len = message.payload.len(), "Received message");
                sink.deliver(message);
            }
        }
        Err(e) => warn!(error = %e, "Dropping undecodable batch line"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::net::TcpListener;
    use uprelay_config::ServerConfig;

    use super::*;
    use crate::ids::ServerId;
    use crate::push::{ServerState, server};

    #[derive(Default)]
    struct Collect(Mutex<Vec<PushMessage>>);

    impl MessageSink for Collect {
        fn deliver(&self, message: PushMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    fn listener() -> (DeliveryListener, ListenerHandle) {
        let client = PushClient::new("http://127.0.0.1:1", Duration::from_millis(200));
        let config = ListenerConfig {
            idle_poll_ms: 50,
            backoff_initial_ms: 20,
            backoff_max_ms: 100,
            read_timeout_ms: 1_000,
        };
        DeliveryListener::new(client, config)
    }

    #[test]
    fn test_update_subscriptions_reports_changes_only() {
        let (_listener, handle) = listener();
        let set: SubscriptionSet = [ServerId::from("A")].into();

        assert!(handle.update_subscriptions(set.clone()));
        assert!(!handle.update_subscriptions(set.clone()));
        assert_eq!(handle.subscriptions(), set);
        assert!(handle.update_subscriptions(SubscriptionSet::new()));
    }

    #[test]
    fn test_backoff_doubles_with_bounded_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let bounds = [(75, 125), (150, 250), (300, 500), (300, 500)];
        for (lo, hi) in bounds {
            let delay = backoff.next_delay().as_millis();
            assert!(delay >= lo && delay <= hi, "{delay} not in {lo}..={hi}");
        }
        assert_eq!(backoff.attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(125));
    }

    #[test]
    fn test_forward_line_skips_bad_lines() {
        let sink = Collect::default();
        forward_line(br#"{"A":["aGk="],"B":["eW8="]}"#, &sink);
        forward_line(b"garbage", &sink);

        let got = sink.0.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].payload, b"hi".to_vec());
        assert_eq!(got[1].server_id, ServerId::from("B"));
    }

    #[tokio::test]
    async fn test_idle_until_shutdown() {
        let (listener, handle) = listener();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(listener.run(Arc::new(Collect::default()), shutdown_rx));

        assert_eq!(
            handle.wait_for_status(|s| *s == ListenerStatus::Idle).await,
            Some(ListenerStatus::Idle)
        );
        shutdown_tx.send(ShutdownSignal).unwrap();
        task.await.unwrap();
        assert_eq!(handle.status(), ListenerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_server_backs_off_and_recovers_to_idle() {
        uprelay_test_utils::tracing_setup::init_test_tracing();
        let (listener, handle) = listener();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(listener.run(Arc::new(Collect::default()), shutdown_rx));

        handle.update_subscriptions([ServerId::from("A")].into());
        let status = handle
            .wait_for_status(|s| matches!(s, ListenerStatus::Backoff { .. }))
            .await;
        assert!(matches!(status, Some(ListenerStatus::Backoff { .. })));

        handle.update_subscriptions(SubscriptionSet::new());
        handle
            .wait_for_status(|s| *s == ListenerStatus::Idle)
            .await
            .unwrap();

        shutdown_tx.send(ShutdownSignal).unwrap();
        task.await.unwrap();
    }

    async fn serve(
        config: ServerConfig,
        shutdown_tx: &broadcast::Sender<ShutdownSignal>,
    ) -> (Arc<ServerState>, String) {
        let state = Arc::new(ServerState::new(config, shutdown_tx.clone()));
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", tcp.local_addr().unwrap());
        tokio::spawn(server::serve(tcp, Arc::clone(&state), shutdown_tx.subscribe()));
        (state, url)
    }

    #[tokio::test]
    async fn test_unknown_ids_are_left_out_until_set_changes() {
        uprelay_test_utils::tracing_setup::init_test_tracing();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let (state, url) = serve(ServerConfig::default(), &shutdown_tx).await;

        let live = state.queues.register();
        let gone = ServerId::from("forgotten-id");
        let client = PushClient::new(url, Duration::from_secs(2));
        let (listener, handle) = DeliveryListener::new(client, ListenerConfig::default());
        let sink = Arc::new(Collect::default());
        let task = tokio::spawn(listener.run(Arc::clone(&sink) as _, shutdown_rx));

        handle.update_subscriptions([live.clone(), gone.clone()].into());
        let only_live = ListenerStatus::Connected([live.clone()].into());
        handle.wait_for_status(|s| *s == only_live).await.unwrap();

        state.queues.get(&live).unwrap().push(b"hi".to_vec().into());
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.0.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("message for the live id never arrived");
        assert_eq!(sink.0.lock().unwrap()[0].server_id, live);

        let other = state.queues.register();
        handle.update_subscriptions([live.clone(), other.clone()].into());
        let both = ListenerStatus::Connected([live, other].into());
        handle.wait_for_status(|s| *s == both).await.unwrap();

        shutdown_tx.send(ShutdownSignal).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_connection_is_dropped() {
        uprelay_test_utils::tracing_setup::init_test_tracing();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let server_config = ServerConfig {
            keepalive_interval_ms: 0,
            ..ServerConfig::default()
        };
        let (state, url) = serve(server_config, &shutdown_tx).await;
        let id = state.queues.register();

        let client = PushClient::new(url, Duration::from_secs(2));
        let config = ListenerConfig {
            backoff_initial_ms: 500,
            backoff_max_ms: 1_000,
            read_timeout_ms: 300,
            ..ListenerConfig::default()
        };
        let (listener, handle) = DeliveryListener::new(client, config);
        let task = tokio::spawn(listener.run(Arc::new(Collect::default()), shutdown_rx));

        handle.update_subscriptions([id.clone()].into());
        handle
            .wait_for_status(|s| *s == ListenerStatus::Connected([id.clone()].into()))
            .await
            .unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for_status(|s| matches!(s, ListenerStatus::Backoff { .. })),
        )
        .await
        .expect("silent connection was never dropped");
        assert!(matches!(status, Some(ListenerStatus::Backoff { attempt: 1, .. })));

        shutdown_tx.send(ShutdownSignal).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_handles_dropped() {
        let (listener, handle) = listener();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        drop(handle);
        listener.run(Arc::new(Collect::default()), shutdown_rx).await;
    }
}
