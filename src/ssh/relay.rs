//! Byte relay between one SSH channel and one `git` subprocess.

use bytes::Bytes;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::TransportError;

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// SSH extended data type for stderr.
const STDERR_EXTENDED_DATA: u32 = 1;

/// Sends exit-status, EOF and close on a channel, in that order.
pub fn finish_channel(session: &mut russh::server::Session, channel: ChannelId, exit_status: u32) {
    session.exit_status_request(channel, exit_status);
    session.eof(channel);
    session.close(channel);
}

async fn pump_stdin(
    mut stdin: ChildStdin,
    mut incoming: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), TransportError> {
    while let Some(chunk) = incoming.recv().await {
        stdin
            .write_all(&chunk)
            .await
            .map_err(|e| TransportError::Relay(format!("writing to git stdin: {e}")))?;
    }
    // Sender dropped on channel EOF; closing stdin lets git finish.
    stdin
        .shutdown()
        .await
        .map_err(|e| TransportError::Relay(format!("closing git stdin: {e}")))
}

async fn pump_output<R>(
    mut reader: R,
    handle: Handle,
    channel: ChannelId,
    extended: Option<u32>,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TransportError::Relay(format!("reading git output: {e}")))?;
        if n == 0 {
            return Ok(());
        }

        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match extended {
            Some(code) => handle.extended_data(channel, code, data).await,
            None => handle.data(channel, data).await,
        };
        sent.map_err(|_| TransportError::Relay("channel closed while relaying".to_string()))?;
    }
}

/// Drives a spawned `git` process to completion.
///
/// Stdin is fed from `incoming` until the channel reaches EOF. Stdout and
/// stderr are copied to the channel as data and extended data. Once both
/// output directions finish the child is waited and the channel is closed
/// with its exit status. Cancelling `cancel` kills the child instead.
pub async fn relay(
    mut child: Child,
    handle: Handle,
    channel: ChannelId,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    span: tracing::Span,
) {
    async move {
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            warn!("git pipes were not created");
            let _ = child.start_kill();
            let _ = child.wait().await;
            close_channel(&handle, channel, 1).await;
            return;
        };

        let stdin_task = tokio::spawn(pump_stdin(stdin, incoming));

        let mut outputs = JoinSet::new();
        outputs.spawn(pump_output(stdout, handle.clone(), channel, None));
        outputs.spawn(pump_output(
            stderr,
            handle.clone(),
            channel,
            Some(STDERR_EXTENDED_DATA),
        ));

        let mut errors = Vec::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                joined = outputs.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => errors.push(e.to_string()),
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => errors.push(format!("relay task failed: {e}")),
                },
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    debug!("channel closed, stopping git");
                    if let Err(e) = child.start_kill() {
                        debug!(error = %e, "git already exited");
                    }
                    outputs.abort_all();
                }
            }
        }

        stdin_task.abort();
        match stdin_task.await {
            Ok(Err(e)) => errors.push(e.to_string()),
            Err(e) if !e.is_cancelled() => errors.push(format!("relay task failed: {e}")),
            _ => {}
        }

        let exit_status = match child.wait().await {
            Ok(status) => {
                if !status.success() && !cancelled {
                    warn!(%status, "git exited with failure");
                }
                status.code().map_or(1, |code| code as u32)
            }
            Err(e) => {
                warn!(error = %e, "failed to wait on git");
                1
            }
        };

        for error in &errors {
            warn!(error = %error, "relay error");
        }

        if cancelled {
            return;
        }

        close_channel(&handle, channel, exit_status).await;
        info!(exit_status, "git session finished");
    }
    .instrument(span)
    .await
}

async fn close_channel(handle: &Handle, channel: ChannelId, exit_status: u32) {
    // The client may already be gone; there is nobody left to report to.
    let _ = handle.exit_status_request(channel, exit_status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}
