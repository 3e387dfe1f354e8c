//! In-process push server bound to an ephemeral port.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use uprelay_config::ServerConfig;
use uprelay_core::ShutdownSignal;
use uprelay_core::push::{PushClient, ServerState, server};

/// A running push server on `127.0.0.1`.
pub struct TestServer {
    pub state: Arc<ServerState>,
    /// Base URL, e.g. `http://127.0.0.1:41234`.
    pub url: String,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    task: JoinHandle<Result<(), std::io::Error>>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test server");
        let url = format!(
            "http://{}",
            listener.local_addr().expect("bound listener has an address")
        );
        let (shutdown_tx, _) = broadcast::channel(4);
        let state = Arc::new(ServerState::new(config, shutdown_tx.clone()));
        let task = tokio::spawn(server::serve(
            listener,
            Arc::clone(&state),
            shutdown_tx.subscribe(),
        ));

        Self {
            state,
            url,
            shutdown_tx,
            task,
        }
    }

    /// A client for this server, as an application server or relay would use.
    pub fn client(&self) -> PushClient {
        PushClient::new(self.url.clone(), std::time::Duration::from_secs(2))
    }

    /// Stop the server and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
        let _ = self.task.await;
    }
}
