//! A [`Connector`] that records every callback on a channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use uprelay_core::{BoxFuture, Connector, ConnectorError, Token};

/// One callback observed by [`RecordingConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    Message {
        token: Token,
        payload: Vec<u8>,
        message_id: String,
    },
    NewEndpoint {
        token: Token,
        endpoint: String,
    },
    Unregistered {
        token: Token,
    },
}

pub struct RecordingConnector {
    tx: mpsc::UnboundedSender<ConnectorEvent>,
}

impl RecordingConnector {
    pub fn new() -> (Arc<Self>, ConnectorEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), ConnectorEvents { rx })
    }

    fn record(&self, event: ConnectorEvent) -> Result<(), ConnectorError> {
        self.tx
            .send(event)
            .map_err(|_| ConnectorError::Transport("recorder dropped".to_string()))
    }
}

impl Connector for RecordingConnector {
    fn message(
        &self,
        token: Token,
        payload: Vec<u8>,
        message_id: String,
    ) -> BoxFuture<'_, Result<(), ConnectorError>> {
        Box::pin(async move {
            self.record(ConnectorEvent::Message {
                token,
                payload,
                message_id,
            })
        })
    }

    fn new_endpoint(
        &self,
        token: Token,
        endpoint: String,
    ) -> BoxFuture<'_, Result<(), ConnectorError>> {
        Box::pin(async move { self.record(ConnectorEvent::NewEndpoint { token, endpoint }) })
    }

    fn unregistered(&self, token: Token) -> BoxFuture<'_, Result<(), ConnectorError>> {
        Box::pin(async move { self.record(ConnectorEvent::Unregistered { token }) })
    }
}

/// Receiving side of a [`RecordingConnector`].
pub struct ConnectorEvents {
    rx: mpsc::UnboundedReceiver<ConnectorEvent>,
}

impl ConnectorEvents {
    /// Next event, panicking if none arrives within `timeout`.
    pub async fn next(&mut self, timeout: Duration) -> ConnectorEvent {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .expect("timed out waiting for a connector event")
            .expect("connector dropped")
    }

    /// Next `Message` payload, skipping other events.
    pub async fn next_message(&mut self, timeout: Duration) -> (Token, Vec<u8>) {
        loop {
            if let ConnectorEvent::Message { token, payload, .. } = self.next(timeout).await {
                return (token, payload);
            }
        }
    }

    /// Whether any event arrives within `window`.
    pub async fn is_quiet_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.rx.recv()).await.is_err()
    }
}
