// src/protocol/receive.rs
//! Decoding of receive-pack requests: ref update commands, push options and
//! whether a packfile follows.

use tokio::io::AsyncRead;

use super::pktline::{PktLine, PktReader};
use crate::error::{Error, Result};

pub const ZERO_OID: &str = "0000000000000000000000000000000000000000";

/// Every packfile starts with this signature
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";

/// An out-of-band `key=value` pair sent with `git push -o`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOption {
    pub key: String,
    pub value: String,
}

impl PushOption {
    /// Split on the first `=`; options without one are dropped.
    pub fn parse(raw: &str) -> Option<Self> {
        let (key, value) = raw.split_once('=')?;
        Some(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// One requested ref mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub old: String,
    pub new: String,
    pub name: String,
}

impl Command {
    fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::Transport(format!("malformed command {line:?}")));
        };
        if old.len() != 40 || new.len() != 40 || name.is_empty() {
            return Err(Error::Transport(format!("malformed command {line:?}")));
        }
        Ok(Self {
            old: old.to_string(),
            new: new.to_string(),
            name: name.to_string(),
        })
    }

    pub fn action(&self) -> Action {
        if self.new == ZERO_OID {
            Action::Delete
        } else if self.old == ZERO_OID {
            Action::Create
        } else {
            Action::Update
        }
    }
}

/// A decoded receive-pack request, up to (not including) the packfile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceUpdateRequest {
    pub capabilities: Vec<String>,
    pub commands: Vec<Command>,
    pub options: Vec<PushOption>,
    /// True when packfile bytes follow in the stream
    pub has_packfile: bool,
}

impl ReferenceUpdateRequest {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| cap == name || cap.split_once('=').is_some_and(|(key, _)| key == name))
    }

    /// A push made only of deletions carries no packfile
    pub fn is_delete_only(&self) -> bool {
        self.commands.iter().all(|c| c.action() == Action::Delete)
    }

    /// Decode the command list, optional push options, and determine whether
    /// a packfile follows. The reader is left positioned at the packfile.
    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut PktReader<R>) -> Result<Self> {
        let mut req = ReferenceUpdateRequest::default();

        // A bare flush (or a closed stream) means zero commands: there is no
        // capability list in that case and it is not an error.
        while let Some(pkt) = reader.read_pkt_opt().await? {
            match pkt {
                PktLine::Flush => break,
                PktLine::Data(data) => {
                    let data = data.strip_suffix(b"\n").unwrap_or(&data);
                    let (line, caps) = match data.iter().position(|b| *b == 0) {
                        Some(nul) => (&data[..nul], Some(&data[nul + 1..])),
                        None => (data, None),
                    };
                    if let Some(caps) = caps {
                        if req.commands.is_empty() {
                            req.capabilities = String::from_utf8_lossy(caps)
                                .split(' ')
                                .filter(|s| !s.is_empty())
                                .map(str::to_string)
                                .collect();
                        }
                    }
                    req.commands.push(Command::parse(&String::from_utf8_lossy(line))?);
                }
                other => {
                    return Err(Error::Transport(format!("unexpected {other:?} in command list")));
                }
            }
        }

        let delete_only = req.is_delete_only();
        let announced_options = req.has_capability("push-options");

        // Deletions with no announced options: nothing else is coming and
        // peeking would wait forever on a live connection.
        if !req.commands.is_empty() && delete_only && !announced_options {
            return Ok(req);
        }

        // Either a packfile or push options come next. Push options are
        // pkt-lines, so a leading `PACK` signature means there are none.
        let peek = reader.peek(PACK_SIGNATURE.len()).await?;
        if peek.len() < PACK_SIGNATURE.len() {
            return Ok(req);
        }
        if peek == PACK_SIGNATURE {
            req.has_packfile = true;
            return Ok(req);
        }

        loop {
            match reader.read_pkt_opt().await? {
                None | Some(PktLine::Flush) => break,
                Some(pkt @ PktLine::Data(_)) => {
                    let text = pkt.text().unwrap_or_default();
                    match PushOption::parse(&text) {
                        Some(opt) => req.options.push(opt),
                        None => tracing::debug!(option = %text, "dropping push option without value"),
                    }
                }
                Some(other) => {
                    return Err(Error::Transport(format!("unexpected {other:?} in push options")));
                }
            }
        }

        req.has_packfile = !req.commands.is_empty() && !delete_only;
        Ok(req)
    }
}
