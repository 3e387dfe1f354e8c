//! Process runtime: runs the push server or the relay until shutdown.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use uprelay_config::AppConfig;

use crate::connector::{ConnectorResolver, Dispatcher};
use crate::distributor::Distributor;
use crate::listener::DeliveryListener;
use crate::push::{PushClient, ServerState, server};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// Owns the configuration and the shutdown channel shared by all tasks.
pub struct Daemon {
    config: AppConfig,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    _shutdown_rx: broadcast::Receiver<ShutdownSignal>,
}

impl Daemon {
    pub fn new(config: AppConfig) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(4);
        Self {
            config,
            shutdown_tx,
            _shutdown_rx,
        }
    }

    /// Bind the configured address and run the push server until shutdown.
    pub async fn run_server(&self) -> Result<(), DaemonError> {
        let server = &self.config.server;
        let listener = server::bind(server).await.map_err(|e| {
            DaemonError::Startup(format!(
                "cannot bind {}:{}: {e}",
                server.listen_addr, server.listen_port
            ))
        })?;
        self.serve(listener).await
    }

    /// Run the push server on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), DaemonError> {
        info!(addr = %listener.local_addr()?, "Push server starting");
        let state = Arc::new(ServerState::new(
            self.config.server.clone(),
            self.shutdown_tx.clone(),
        ));
        let mut task = tokio::spawn(server::serve(listener, state, self.shutdown_tx.subscribe()));

        tokio::select! {
            result = &mut task => return Ok(result??),
            _ = self.wait_for_shutdown() => {}
        }
        task.await??;
        info!("Push server stopped");
        Ok(())
    }

    /// Spawn the distributor's background tasks: the delivery listener and
    /// the connector dispatcher.
    pub fn start_relay(&self, resolver: Arc<dyn ConnectorResolver>) -> Relay {
        let client = PushClient::from_config(&self.config.distributor);
        info!(
            server = %client.base_url(),
            endpoints = %self.config.distributor.endpoint_base(),
            "Relay starting"
        );

        let (listener, handle) = DeliveryListener::new(client.clone(), self.config.listener.clone());
        let (dispatcher, outbox) = Dispatcher::new(resolver);
        let distributor = Arc::new(Distributor::new(client, handle, outbox));

        let dispatcher_task = tokio::spawn(dispatcher.run(self.shutdown_tx.subscribe()));
        let listener_task = tokio::spawn(
            listener.run(Arc::clone(&distributor) as _, self.shutdown_tx.subscribe()),
        );

        Relay {
            distributor,
            listener_task,
            dispatcher_task,
        }
    }

    /// Run the relay until shutdown, then wait for its tasks to finish.
    pub async fn run_relay(&self, resolver: Arc<dyn ConnectorResolver>) -> Result<(), DaemonError> {
        let relay = self.start_relay(resolver);
        self.wait_for_shutdown().await;
        relay.join().await?;
        info!("Relay stopped");
        Ok(())
    }

    /// Block until shutdown is requested or Ctrl-C arrives.
    async fn wait_for_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, initiating graceful shutdown");
                let _ = self.shutdown_tx.send(ShutdownSignal);
            }
        }
    }

    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// A running relay. Tasks stop on the daemon's shutdown signal.
pub struct Relay {
    pub distributor: Arc<Distributor>,
    listener_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
}

impl Relay {
    /// Wait for the listener and dispatcher to stop.
    pub async fn join(self) -> Result<(), DaemonError> {
        self.listener_task.await?;
        self.dispatcher_task.await?;
        Ok(())
    }
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon startup failed: {0}")]
    Startup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
