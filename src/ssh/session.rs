// src/ssh/session.rs
//! Per-connection SSH handler.
//!
//! Every exec (or shell) request gets two in-memory pipes: client data from
//! the `data` callback is written into one, the gateway's output is read from
//! the other and forwarded to the channel. The gateway itself runs on its own
//! task and ends the channel with exit-status, EOF and close.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::middleware::{split_command, GitGateway};
use crate::protocol::GitStream;

const PIPE_CAPACITY: usize = 64 * 1024;

/// `SHA256:<base64>` as printed by `ssh-keygen -l`
pub fn fingerprint_of(key: &PublicKey) -> String {
    format!("SHA256:{}", key.fingerprint())
}

/// Channel side of an exec request, as seen by the gateway
struct ChannelStream {
    input: DuplexStream,
    output: DuplexStream,
    git_protocol: Option<String>,
}

impl AsyncRead for ChannelStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.input).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.output).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.output).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.output).poll_shutdown(cx)
    }
}

impl GitStream for ChannelStream {
    fn git_protocol(&self) -> Option<&str> {
        self.git_protocol.as_deref()
    }
}

#[derive(Default)]
struct ChannelState {
    /// Dropped on client EOF so the gateway sees end of input
    input: Option<DuplexStream>,
    tasks: Vec<AbortHandle>,
}

impl ChannelState {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct SshSession {
    gateway: Arc<GitGateway>,
    authorized: Arc<HashSet<String>>,
    peer_addr: Option<SocketAddr>,
    fingerprint: Option<String>,
    git_protocol: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SshSession {
    pub fn new(gateway: Arc<GitGateway>, authorized: Arc<HashSet<String>>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            gateway,
            authorized,
            peer_addr,
            fingerprint: None,
            git_protocol: None,
            channels: HashMap::new(),
        }
    }

    fn start(&mut self, channel: ChannelId, args: Vec<String>, session: &mut Session) {
        let (input_tx, input_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (output_tx, output_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let handle = session.handle();

        let forward_handle = handle.clone();
        let forward = tokio::spawn(async move {
            let mut output_rx = output_rx;
            let mut buf = vec![0u8; PIPE_CAPACITY];
            loop {
                match output_rx.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if forward_handle
                            .data(channel, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "channel output pipe failed");
                        break;
                    }
                }
            }
        });
        let forward_abort = forward.abort_handle();

        let gateway = self.gateway.clone();
        let identity = self.fingerprint.clone();
        let peer = self.peer_addr;
        let mut stream = ChannelStream {
            input: input_rx,
            output: output_tx,
            git_protocol: self.git_protocol.clone(),
        };
        let task = tokio::spawn(async move {
            let outcome = gateway.handle(&args, identity.as_deref(), &mut stream).await;
            let _ = stream.output.shutdown().await;
            drop(stream);
            let _ = forward.await;

            if let Some(msg) = &outcome.stderr {
                let _ = handle
                    .extended_data(channel, 1, CryptoVec::from_slice(msg.as_bytes()))
                    .await;
            }
            // exit-status, then EOF, then close
            let _ = handle.exit_status_request(channel, outcome.exit_status).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
            debug!(peer = ?peer, exit_status = outcome.exit_status, "channel finished");
        });

        self.channels.insert(
            channel,
            ChannelState {
                input: Some(input_tx),
                tasks: vec![forward_abort, task.abort_handle()],
            },
        );
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        for state in self.channels.values() {
            state.abort();
        }
    }
}

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = fingerprint_of(key);
        if self.authorized.contains(&fp) {
            info!(peer = ?self.peer_addr, user = %user, fingerprint = %fp, "SSH key accepted");
            self.fingerprint = Some(fp);
            Ok(Auth::Accept)
        } else {
            warn!(peer = ?self.peer_addr, user = %user, fingerprint = %fp, "SSH key not authorized");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.entry(channel.id()).or_default();
        Ok(true)
    }

    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "client GIT_PROTOCOL");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            if let Some(input) = state.input.as_mut() {
                // Blocking here is the flow control for client input. It
                // cannot wedge the channel: git clients finish each request
                // (want/have round, pushed pack) before the server answers
                // with bulk data, and the gateway drains input while it waits.
                if let Err(e) = input.write_all(data).await {
                    debug!(error = %e, "gateway stopped reading client input");
                    state.input = None;
                }
            }
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.input = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.remove(&channel) {
            state.abort();
        }
        Ok(())
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data);
        info!(peer = ?self.peer_addr, command = %raw, "SSH exec request");
        self.start(channel, split_command(&raw), session);
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        info!(peer = ?self.peer_addr, "SSH shell request");
        self.start(channel, Vec::new(), session);
        Ok(())
    }
}
