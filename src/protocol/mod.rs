// src/protocol/mod.rs
//! Git smart protocol operations against a single repository.
//!
//! Both gateways hand a byte stream to a [`Protocol`] and let it speak the
//! wire format. Two implementations exist: [`embedded::EmbeddedProtocol`]
//! serves everything in-process through libgit2, [`command::CommandProtocol`]
//! delegates to an installed `git`.

pub mod command;
pub mod embedded;
pub mod pack;
pub mod pktline;
pub mod receive;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Result;
use crate::storage::git::Repo;

pub const UPLOAD_PACK: &str = "git-upload-pack";
pub const UPLOAD_ARCHIVE: &str = "git-upload-archive";
pub const RECEIVE_PACK: &str = "git-receive-pack";

/// Advertised to clients in the `agent=` capability
pub fn agent() -> String {
    format!("agent=ugit/{}", env!("CARGO_PKG_VERSION"))
}

/// A bidirectional byte stream carrying one protocol exchange
pub trait GitStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// The client's `GIT_PROTOCOL` value (`Git-Protocol` header over HTTP)
    fn git_protocol(&self) -> Option<&str> {
        None
    }
}

/// How the client reached us. HTTP exchanges are stateless: the
/// advertisement was served by a separate request and each negotiation round
/// is a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Ssh,
}

#[async_trait]
pub trait Protocol: Send + Sync {
    /// Upload-pack ref advertisement for HTTP discovery, prefixed by the
    /// `# service=git-upload-pack` banner
    async fn advertise_refs(&self, stream: &mut dyn GitStream) -> Result<()>;

    /// Fetch/clone. Over SSH the advertisement is written first.
    async fn upload_pack(&self, stream: &mut dyn GitStream, transport: Transport) -> Result<()>;

    /// Push. Push options are applied to `repo`'s metadata.
    async fn receive_pack(&self, stream: &mut dyn GitStream, repo: &mut Repo) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process via libgit2
    Embedded,
    /// Spawn `git upload-pack` / `git receive-pack`
    Command,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "embedded" | "libgit2" => Ok(BackendKind::Embedded),
            "git" | "command" => Ok(BackendKind::Command),
            other => Err(format!("unknown backend {other:?}, expected `git` or `embedded`")),
        }
    }
}

/// Protocol backend selected at startup
#[derive(Debug, Clone)]
pub struct Backend {
    pub kind: BackendKind,
    /// `core.hooksPath` handed to delegated git processes
    pub hooks_dir: PathBuf,
    pub trace_packets: bool,
}

impl Backend {
    pub fn new(kind: BackendKind, hooks_dir: PathBuf, trace_packets: bool) -> Self {
        Self {
            kind,
            hooks_dir,
            trace_packets,
        }
    }

    pub fn protocol(&self, repo_path: &Path) -> Box<dyn Protocol> {
        match self.kind {
            BackendKind::Embedded => Box::new(embedded::EmbeddedProtocol::new(
                repo_path.to_path_buf(),
                self.trace_packets,
            )),
            BackendKind::Command => Box::new(command::CommandProtocol::new(
                repo_path.to_path_buf(),
                self.hooks_dir.clone(),
                self.trace_packets,
            )),
        }
    }

    /// Delegated pushes go through the pre-receive hook to see push options
    pub fn requires_hook(&self) -> bool {
        self.kind == BackendKind::Command
    }
}

/// A stream with a fully-buffered request body and an in-memory response,
/// used for stateless HTTP exchanges.
pub struct BufferedStream {
    input: Cursor<Bytes>,
    output: Vec<u8>,
    git_protocol: Option<String>,
}

impl BufferedStream {
    pub fn new(input: Bytes, git_protocol: Option<String>) -> Self {
        Self {
            input: Cursor::new(input),
            output: Vec::new(),
            git_protocol,
        }
    }

    pub fn into_output(self) -> Vec<u8> {
        self.output
    }
}

impl AsyncRead for BufferedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.input).poll_read(cx, buf)
    }
}

impl AsyncWrite for BufferedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.output).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl GitStream for BufferedStream {
    fn git_protocol(&self) -> Option<&str> {
        self.git_protocol.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn backend_names() {
        assert_eq!("git".parse::<BackendKind>().unwrap(), BackendKind::Command);
        assert_eq!("Embedded".parse::<BackendKind>().unwrap(), BackendKind::Embedded);
        assert!("svn".parse::<BackendKind>().is_err());
    }

    #[test]
    fn only_delegating_backend_needs_hook() {
        let hooks = PathBuf::from("/tmp/hooks");
        assert!(Backend::new(BackendKind::Command, hooks.clone(), false).requires_hook());
        assert!(!Backend::new(BackendKind::Embedded, hooks, false).requires_hook());
    }

    #[tokio::test]
    async fn buffered_stream_reads_body_and_collects_output() {
        let mut stream = BufferedStream::new(Bytes::from_static(b"0000"), Some("version=2".into()));
        assert_eq!(stream.git_protocol(), Some("version=2"));

        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"0000");

        stream.write_all(b"0008NAK\n").await.unwrap();
        assert_eq!(stream.into_output(), b"0008NAK\n");
    }
}
