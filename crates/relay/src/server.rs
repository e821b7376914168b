//! Relay server: accept loop and idle sweeper

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::handler::handle_connection;
use crate::state::RelayState;

/// The signaling relay server
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Validate the configuration and create a server
    pub fn new(config: RelayConfig) -> Result<Self> {
        Ok(Self {
            state: Arc::new(RelayState::new(config)?),
        })
    }

    /// Shared state (for tests and embedding)
    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Bind the listener and start serving
    ///
    /// Returns once the socket is bound; accepting and sweeping continue in
    /// background tasks until the returned handle is shut down.
    pub async fn start(self) -> Result<RelayHandle> {
        let addr: SocketAddr = self
            .state
            .config
            .bind_addr
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("bind_addr: {}", e)))?;

        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay listening on ws://{}", local_addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        // Accept loop
        let accept_state = Arc::clone(&self.state);
        let mut accept_shutdown = shutdown_tx.subscribe();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                info!("Accepted connection from {}", peer_addr);
                                let state = Arc::clone(&accept_state);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, state).await {
                                        warn!("Connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = accept_shutdown.recv() => {
                        info!("Relay accept loop shutting down");
                        break;
                    }
                }
            }
        });

        // Idle sweeper: silent clients get the same cleanup as a transport
        // drop, plus a peer-disconnected broadcast to their room.
        let sweep_state = Arc::clone(&self.state);
        let mut sweep_shutdown = shutdown_tx.subscribe();
        let sweep_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_state.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = sweep_state
                            .registry
                            .sweep_idle(sweep_state.config.heartbeat_timeout)
                            .await;
                        if !evicted.is_empty() {
                            info!("Swept {} idle client(s)", evicted.len());
                        }
                    }
                    _ = sweep_shutdown.recv() => break,
                }
            }
        });

        Ok(RelayHandle {
            local_addr,
            shutdown_tx,
            tasks: vec![accept_task, sweep_task],
            state: self.state,
        })
    }
}

/// Handle for a running relay
pub struct RelayHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    state: Arc<RelayState>,
}

impl RelayHandle {
    /// Address the relay is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients should connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Shared state (for tests and embedding)
    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    /// Stop accepting and sweeping; established connections close as their
    /// peers disconnect
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Relay stopped");
    }
}
