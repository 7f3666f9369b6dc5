//! SSH listener and per-connection handshake supervision.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{self, Config};
use russh::{Disconnect, MethodSet};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::session::SshSession;
use crate::error::Result;
use crate::server::AppState;

/// Upper bound for protocol negotiation plus authentication.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SshServer {
    state: Arc<AppState>,
    config: Arc<Config>,
    handshake_timeout: Duration,
}

impl SshServer {
    pub fn new(state: Arc<AppState>, host_key: KeyPair) -> Self {
        let config = Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        };

        Self {
            state,
            config: Arc::new(config),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Accepts connections until the listener fails. Each connection runs on
    /// its own task.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        info!(address = ?listener.local_addr().ok(), "SSH server listening");

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept SSH connection");
                    continue;
                }
            };

            let state = Arc::clone(&self.state);
            let config = Arc::clone(&self.config);
            let handshake_timeout = self.handshake_timeout;
            tokio::spawn(async move {
                handle_connection(state, config, socket, peer, handshake_timeout).await;
            });
        }
    }
}

async fn handle_connection(
    state: Arc<AppState>,
    config: Arc<Config>,
    socket: TcpStream,
    peer: SocketAddr,
    handshake_timeout: Duration,
) {
    debug!(%peer, "new SSH connection");
    let deadline = Instant::now() + handshake_timeout;
    let (authenticated_tx, authenticated_rx) = oneshot::channel();
    let handler = SshSession::new(state, Some(peer), authenticated_tx);

    let running = match timeout_at(deadline, server::run_stream(config, socket, handler)).await {
        Ok(Ok(running)) => running,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "SSH handshake failed");
            return;
        }
        Err(_) => {
            warn!(%peer, "SSH handshake timed out");
            return;
        }
    };

    let handle = running.handle();
    tokio::pin!(running);

    tokio::select! {
        result = &mut running => {
            log_session_end(peer, result);
            return;
        }
        authenticated = timeout_at(deadline, authenticated_rx) => {
            if !matches!(authenticated, Ok(Ok(()))) {
                warn!(%peer, "SSH authentication timed out");
                let _ = handle
                    .disconnect(
                        Disconnect::ByApplication,
                        "authentication timeout".to_string(),
                        "en".to_string(),
                    )
                    .await;
            }
        }
    }

    log_session_end(peer, running.await);
}

fn log_session_end(peer: SocketAddr, result: std::result::Result<(), russh::Error>) {
    match result {
        Ok(()) => debug!(%peer, "SSH connection closed"),
        Err(e) => warn!(%peer, error = %e, "SSH connection ended with error"),
    }
}
