//! Per-connection SSH handler: public-key authentication and `exec` of the
//! Git transport commands.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, warn};

use super::keys::fingerprint_of;
use super::relay::{finish_channel, relay};
use crate::auth::authorize;
use crate::error::TransportError;
use crate::git::{GitCommand, GitService, RepoSlug, parse_command};
use crate::server::AppState;
use crate::types::Identity;

/// What an authorized `exec` will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPlan {
    pub service: GitService,
    pub slug: RepoSlug,
    pub path: PathBuf,
}

/// Resolves and authorizes an `exec` command without touching the channel.
pub fn plan_exec(
    state: &AppState,
    identity: &Identity,
    command: &GitCommand,
) -> Result<ExecPlan, TransportError> {
    let (service, slug) = match (command.service(), command.slug()) {
        (Some(service), Some(slug)) => (service, slug.clone()),
        _ => {
            let reason = match command {
                GitCommand::Unrecognized(reason) => reason.clone(),
                _ => "unsupported command".to_string(),
            };
            return Err(TransportError::Protocol(reason));
        }
    };

    let record = state
        .store
        .get_repository(&slug.owner, &slug.repo)
        .map_err(|e| {
            error!(repository = %slug, error = %e, "repository lookup failed");
            TransportError::Internal
        })?
        .ok_or(TransportError::NotFound)?;

    authorize(&record, service, Some(identity))?;

    let path = state
        .repositories
        .locate(&slug.owner, &slug.repo)
        .ok_or(TransportError::NotFound)?;

    Ok(ExecPlan {
        service,
        slug,
        path,
    })
}

#[derive(Default)]
struct ChannelState {
    git_protocol: Option<String>,
    /// Client bytes bound for git stdin; dropped on EOF.
    stdin: Option<mpsc::UnboundedSender<Bytes>>,
    /// Cancels the relay when the channel goes away. Set once per channel.
    relay: Option<DropGuard>,
}

pub struct SshSession {
    state: Arc<AppState>,
    peer_addr: Option<SocketAddr>,
    identity: Option<Identity>,
    authenticated: Option<oneshot::Sender<()>>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SshSession {
    /// `authenticated` fires once the client has authenticated, which ends
    /// the handshake deadline.
    pub fn new(
        state: Arc<AppState>,
        peer_addr: Option<SocketAddr>,
        authenticated: oneshot::Sender<()>,
    ) -> Self {
        Self {
            state,
            peer_addr,
            identity: None,
            authenticated: Some(authenticated),
            channels: HashMap::new(),
        }
    }

    fn reject_exec(
        &self,
        session: &mut Session,
        channel: ChannelId,
        command: &str,
        err: &TransportError,
    ) {
        warn!(
            peer = ?self.peer_addr,
            user = ?self.identity.as_ref().map(|i| &i.username),
            command = %command,
            error = %err,
            "SSH exec rejected"
        );
        let message = format!("{}\n", err.client_message());
        session.extended_data(channel, 1, CryptoVec::from_slice(message.as_bytes()));
        finish_channel(session, channel, 1);
    }

    fn spawn_git(
        &mut self,
        channel: ChannelId,
        plan: ExecPlan,
        session: &mut Session,
    ) -> Result<(), TransportError> {
        let state = self.channels.entry(channel).or_default();

        let mut command = Command::new("git");
        command
            .arg(plan.service.verb())
            .arg(&plan.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(protocol) = &state.git_protocol {
            command.env("GIT_PROTOCOL", protocol);
        }

        let child = command.spawn().map_err(TransportError::Subprocess)?;

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        state.stdin = Some(stdin_tx);
        state.relay = Some(cancel.clone().drop_guard());

        let username = self
            .identity
            .as_ref()
            .map(|i| i.username.clone())
            .unwrap_or_default();
        let span = info_span!(
            "git_ssh",
            operation = plan.service.command_name(),
            repository = %plan.slug,
            user = %username,
        );

        tokio::spawn(relay(child, session.handle(), channel, stdin_rx, cancel, span));
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fingerprint = fingerprint_of(key);

        match self.state.store.get_identity_by_fingerprint(&fingerprint) {
            Ok(Some(identity)) => {
                info!(
                    peer = ?self.peer_addr,
                    ssh_user = %user,
                    username = %identity.username,
                    fingerprint = %fingerprint,
                    "SSH key accepted"
                );
                self.identity = Some(identity);
                if let Some(tx) = self.authenticated.take() {
                    let _ = tx.send(());
                }
                Ok(Auth::Accept)
            }
            Ok(None) => {
                warn!(peer = ?self.peer_addr, fingerprint = %fingerprint, "unknown SSH key");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
            Err(e) => {
                error!(fingerprint = %fingerprint, error = %e, "SSH key lookup failed");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL");
            self.channels.entry(channel).or_default().git_protocol =
                Some(variable_value.to_string());
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            if let Some(stdin) = &state.stdin {
                if stdin.send(Bytes::copy_from_slice(data)).is_err() {
                    debug!("git stdin closed, dropping client data");
                    state.stdin = None;
                }
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // One command per channel.
        if self
            .channels
            .get(&channel)
            .is_some_and(|state| state.relay.is_some())
        {
            debug!(channel = ?channel, "second exec on a running channel");
            session.channel_failure(channel);
            return Ok(());
        }
        session.channel_success(channel);

        let raw = String::from_utf8_lossy(data).into_owned();
        let Some(identity) = self.identity.clone() else {
            self.reject_exec(session, channel, &raw, &TransportError::Authentication);
            return Ok(());
        };

        let command = parse_command(&raw);
        let plan = match plan_exec(&self.state, &identity, &command) {
            Ok(plan) => plan,
            Err(e) => {
                self.reject_exec(session, channel, &raw, &e);
                return Ok(());
            }
        };

        info!(
            peer = ?self.peer_addr,
            username = %identity.username,
            operation = plan.service.command_name(),
            repository = %plan.slug,
            "SSH exec"
        );

        if let Err(e) = self.spawn_git(channel, plan, session) {
            self.reject_exec(session, channel, &raw, &e);
        }
        Ok(())
    }
}
