// src/protocol/pktline.rs
//! Git pkt-line framing
//!
//! Every frame is a 4 hex digit length (including the prefix itself) followed
//! by the payload. `0000` is a flush, `0001` a delimiter and `0002` a
//! response end.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const FLUSH_PKT: &[u8] = b"0000";

/// Largest frame git will produce (65516 payload + 4 length bytes)
pub const MAX_PKT_LINE: usize = 65520;

/// Largest side-band payload: a frame minus the band byte
pub const MAX_SIDEBAND_DATA: usize = MAX_PKT_LINE - 5;

pub mod sideband {
    pub const DATA: u8 = 1;
}

/// Encode a payload as a pkt-line
pub fn pkt_line(data: &[u8]) -> Vec<u8> {
    let mut pkt = format!("{:04x}", data.len() + 4).into_bytes();
    pkt.extend_from_slice(data);
    pkt
}

/// Encode a text payload with its trailing newline
pub fn pkt_line_str(line: &str) -> Vec<u8> {
    pkt_line(format!("{line}\n").as_bytes())
}

/// Encode a payload for one side-band channel, splitting it into frames
pub fn sideband_pkts(channel: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / MAX_SIDEBAND_DATA * 5 + 5);
    for chunk in data.chunks(MAX_SIDEBAND_DATA) {
        let mut payload = Vec::with_capacity(chunk.len() + 1);
        payload.push(channel);
        payload.extend_from_slice(chunk);
        out.extend_from_slice(&pkt_line(&payload));
    }
    out
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Flush,
    Delimiter,
    ResponseEnd,
    Data(Vec<u8>),
}

impl PktLine {
    /// Payload as text with the trailing newline removed
    pub fn text(&self) -> Option<String> {
        match self {
            PktLine::Data(data) => {
                let data = data.strip_suffix(b"\n").unwrap_or(data);
                Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => None,
        }
    }
}

/// Buffered pkt-line reader that supports peeking at raw bytes
pub struct PktReader<R> {
    inner: R,
    buf: Vec<u8>,
    trace: bool,
}

impl<R: AsyncRead + Unpin> PktReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            trace: false,
        }
    }

    /// Log every frame at trace level
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Make sure at least `n` bytes are buffered. Returns false on EOF.
    async fn fill(&mut self, n: usize) -> Result<bool> {
        let mut chunk = [0u8; 8192];
        while self.buf.len() < n {
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Ok(false);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        Ok(true)
    }

    /// Look at the next `n` bytes without consuming them. Fewer bytes are
    /// returned only if the stream ended.
    pub async fn peek(&mut self, n: usize) -> Result<&[u8]> {
        self.fill(n).await?;
        let end = n.min(self.buf.len());
        Ok(&self.buf[..end])
    }

    /// Read the next frame; `None` on a clean EOF at a frame boundary.
    pub async fn read_pkt_opt(&mut self) -> Result<Option<PktLine>> {
        if !self.fill(4).await? {
            if self.buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::Transport("truncated pkt-line header".into()));
        }

        let len_hex = std::str::from_utf8(&self.buf[..4])
            .map_err(|_| Error::Transport("invalid pkt-line length".into()))?;
        let len = usize::from_str_radix(len_hex, 16)
            .map_err(|_| Error::Transport(format!("invalid pkt-line length {len_hex:?}")))?;

        let pkt = match len {
            0 => PktLine::Flush,
            1 => PktLine::Delimiter,
            2 => PktLine::ResponseEnd,
            3 => return Err(Error::Transport("pkt-line length too small".into())),
            len if len > MAX_PKT_LINE => {
                return Err(Error::Transport("pkt-line too large".into()));
            }
            len => {
                if !self.fill(len).await? {
                    return Err(Error::Transport("pkt-line truncated".into()));
                }
                PktLine::Data(self.buf[4..len].to_vec())
            }
        };

        let consumed = match pkt {
            PktLine::Data(ref data) => data.len() + 4,
            _ => 4,
        };
        self.buf.drain(..consumed);

        if self.trace {
            match &pkt {
                PktLine::Data(data) => {
                    tracing::trace!(target: "ugit::packet", "< {}", String::from_utf8_lossy(data).trim_end())
                }
                other => tracing::trace!(target: "ugit::packet", "< {:?}", other),
            }
        }
        Ok(Some(pkt))
    }

    /// Read the next frame, treating EOF as a transport error
    pub async fn read_pkt(&mut self) -> Result<PktLine> {
        self.read_pkt_opt()
            .await?
            .ok_or_else(|| Error::Transport("unexpected end of stream".into()))
    }

    /// Move buffered bytes, or else the next chunk from the stream, into
    /// `out`. Returns the number of bytes appended; 0 means EOF.
    pub async fn read_raw(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        if !self.buf.is_empty() {
            let n = self.buf.len();
            out.append(&mut self.buf);
            return Ok(n);
        }
        let mut chunk = vec![0u8; 64 * 1024];
        let read = self.inner.read(&mut chunk).await?;
        out.extend_from_slice(&chunk[..read]);
        Ok(read)
    }
}

/// Write frames to an async writer
pub struct PktWriter<W> {
    inner: W,
    trace: bool,
}

impl<W: AsyncWrite + Unpin> PktWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            trace: false,
        }
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        if self.trace {
            tracing::trace!(target: "ugit::packet", "> {}", line);
        }
        self.inner.write_all(&pkt_line_str(line)).await?;
        Ok(())
    }

    pub async fn flush_pkt(&mut self) -> Result<()> {
        if self.trace {
            tracing::trace!(target: "ugit::packet", "> 0000");
        }
        self.inner.write_all(FLUSH_PKT).await?;
        Ok(())
    }

    /// Write bytes that are not pkt-framed (a raw packfile)
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    pub async fn write_sideband(&mut self, channel: u8, data: &[u8]) -> Result<()> {
        self.inner.write_all(&sideband_pkts(channel, data)).await?;
        Ok(())
    }

    /// Flush the underlying writer
    pub async fn finish(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }
}
