// src/protocol/embedded.rs
//! In-process protocol backend on top of libgit2.
//!
//! All libgit2 calls run on the blocking pool; only framing and stream IO
//! happen on the async side.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{ErrorCode, ObjectType, Oid, Reference, Repository};

use super::pack::{read_pack, PackHeader};
use super::pktline::{sideband, PktLine, PktReader, PktWriter};
use super::receive::{Action, Command, ReferenceUpdateRequest, ZERO_OID};
use super::{agent, GitStream, Protocol, Transport};
use crate::error::{Error, Result};
use crate::storage::git::{ref_list, Repo};

const UPLOAD_CAPS: &[&str] = &["side-band-64k", "ofs-delta"];
const RECEIVE_CAPS: &[&str] = &["report-status", "delete-refs", "ofs-delta", "push-options", "no-thin"];

const REFLOG_MESSAGE: &str = "push";

pub struct EmbeddedProtocol {
    path: PathBuf,
    trace: bool,
}

impl EmbeddedProtocol {
    pub fn new(path: PathBuf, trace: bool) -> Self {
        Self { path, trace }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::System(format!("blocking task failed: {e}")))?
}

fn open(path: &Path) -> Result<Repository> {
    Repository::open_bare(path).map_err(|e| Error::Repository(e.message().to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    UploadPack,
    ReceivePack,
}

/// Ref advertisement lines, without pkt framing. The first line carries the
/// capability list after a NUL.
fn advertisement(path: &Path, service: Service) -> Result<Vec<String>> {
    let git = open(path)?;
    let mut caps: Vec<String> = match service {
        Service::UploadPack => UPLOAD_CAPS,
        Service::ReceivePack => RECEIVE_CAPS,
    }
    .iter()
    .map(|c| c.to_string())
    .collect();

    let mut refs: Vec<(Oid, String)> = Vec::new();
    if service == Service::UploadPack {
        if let Ok(head) = git.head() {
            if let Some(oid) = head.target() {
                refs.push((oid, "HEAD".to_string()));
                let symref = git
                    .find_reference("HEAD")
                    .ok()
                    .and_then(|r| r.symbolic_target().map(str::to_string));
                if let Some(target) = symref {
                    caps.push(format!("symref=HEAD:{target}"));
                }
            }
        }
    }
    for entry in ref_list(&git)? {
        refs.push((entry.oid, entry.name.clone()));
        if service == Service::UploadPack {
            if let Some(peeled) = entry.peeled {
                refs.push((peeled, format!("{}^{{}}", entry.name)));
            }
        }
    }
    caps.push(agent());
    let caps = caps.join(" ");

    if refs.is_empty() {
        return Ok(vec![format!("{ZERO_OID} capabilities^{{}}\0{caps}")]);
    }
    Ok(refs
        .into_iter()
        .enumerate()
        .map(|(i, (oid, name))| {
            if i == 0 {
                format!("{oid} {name}\0{caps}")
            } else {
                format!("{oid} {name}")
            }
        })
        .collect())
}

async fn write_advertisement<W>(writer: &mut PktWriter<W>, path: &Path, service: Service) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let path = path.to_path_buf();
    let lines = blocking(move || advertisement(&path, service)).await?;
    for line in &lines {
        writer.write_line(line).await?;
    }
    writer.flush_pkt().await?;
    writer.finish().await
}

fn parse_oid(hex: &str) -> Result<Oid> {
    if hex.len() != 40 {
        return Err(Error::Transport(format!("invalid object id {hex:?}")));
    }
    Oid::from_str(hex).map_err(|_| Error::Transport(format!("invalid object id {hex:?}")))
}

/// Everything reachable from `wants` that is not reachable from `common`
fn build_pack(path: &Path, wants: &[Oid], common: &[Oid]) -> Result<Vec<u8>> {
    let git = open(path)?;
    let mut builder = git.packbuilder()?;
    let mut walk = git.revwalk()?;

    for want in wants {
        let object = git.find_object(*want, None)?;
        match object.kind() {
            Some(ObjectType::Commit) => walk.push(*want)?,
            Some(ObjectType::Tag) => {
                builder.insert_object(*want, None)?;
                let peeled = object.peel(ObjectType::Any)?;
                if peeled.kind() == Some(ObjectType::Commit) {
                    walk.push(peeled.id())?;
                } else {
                    builder.insert_recursive(peeled.id(), None)?;
                }
            }
            _ => builder.insert_recursive(*want, None)?,
        }
    }
    for have in common {
        if git.find_commit(*have).is_ok() {
            walk.hide(*have)?;
        }
    }
    builder.insert_walk(&mut walk)?;

    let mut buf = git2::Buf::new();
    builder.write_buf(&mut buf)?;
    Ok(buf.to_vec())
}

/// Index a received packfile into the object database
fn ingest(path: &Path, pack: &[u8]) -> Result<()> {
    if PackHeader::parse(pack)?.objects == 0 {
        return Ok(());
    }
    let git = open(path)?;
    let odb = git.odb()?;
    let mut writer = odb.packwriter()?;
    writer.write_all(pack)?;
    writer.commit()?;
    Ok(())
}

fn update_ref(git: &Repository, cmd: &Command) -> std::result::Result<(), String> {
    if !cmd.name.starts_with("refs/") || !Reference::is_valid_name(&cmd.name) {
        return Err("funny refname".into());
    }
    let old = Oid::from_str(&cmd.old).map_err(|_| "invalid old object id")?;
    let new = Oid::from_str(&cmd.new).map_err(|_| "invalid new object id")?;

    match cmd.action() {
        Action::Delete => {
            let mut reference = git.find_reference(&cmd.name).map_err(|_| "no such ref")?;
            if !old.is_zero() && reference.target() != Some(old) {
                return Err("stale info".into());
            }
            reference.delete().map_err(|e| e.message().to_string())
        }
        Action::Create => {
            git.find_object(new, None).map_err(|_| "missing necessary objects")?;
            git.reference(&cmd.name, new, false, REFLOG_MESSAGE)
                .map(|_| ())
                .map_err(|e| match e.code() {
                    ErrorCode::Exists => "already exists".to_string(),
                    _ => e.message().to_string(),
                })
        }
        Action::Update => {
            git.find_object(new, None).map_err(|_| "missing necessary objects")?;
            git.reference_matching(&cmd.name, new, true, old, REFLOG_MESSAGE)
                .map(|_| ())
                .map_err(|e| match e.code() {
                    ErrorCode::Modified | ErrorCode::NotFound => "stale info".to_string(),
                    _ => e.message().to_string(),
                })
        }
    }
}

type RefResult = (String, std::result::Result<(), String>);

fn apply_commands(path: &Path, commands: &[Command]) -> Result<Vec<RefResult>> {
    let git = open(path)?;
    Ok(commands
        .iter()
        .map(|cmd| (cmd.name.clone(), update_ref(&git, cmd)))
        .collect())
}

#[async_trait]
impl Protocol for EmbeddedProtocol {
    async fn advertise_refs(&self, stream: &mut dyn GitStream) -> Result<()> {
        let mut writer = PktWriter::new(stream).with_trace(self.trace);
        writer.write_line("# service=git-upload-pack").await?;
        writer.flush_pkt().await?;
        write_advertisement(&mut writer, &self.path, Service::UploadPack).await
    }

    async fn upload_pack(&self, stream: &mut dyn GitStream, transport: Transport) -> Result<()> {
        let (rd, wr) = tokio::io::split(stream);
        let mut reader = PktReader::new(rd).with_trace(self.trace);
        let mut writer = PktWriter::new(wr).with_trace(self.trace);

        if transport == Transport::Ssh {
            write_advertisement(&mut writer, &self.path, Service::UploadPack).await?;
        }

        let mut wants = Vec::new();
        let mut client_caps: Vec<String> = Vec::new();
        loop {
            match reader.read_pkt_opt().await? {
                // ls-remote hangs up after the advertisement
                None => return Ok(()),
                Some(PktLine::Flush) => break,
                Some(pkt @ PktLine::Data(_)) => {
                    let line = pkt.text().unwrap_or_default();
                    if let Some(rest) = line.strip_prefix("want ") {
                        let mut parts = rest.split(' ');
                        let oid = parse_oid(parts.next().unwrap_or_default())?;
                        if wants.is_empty() {
                            client_caps = parts.filter(|s| !s.is_empty()).map(str::to_string).collect();
                        }
                        wants.push(oid);
                    } else if line.starts_with("shallow ") || line.starts_with("deepen") || line.starts_with("filter ") {
                        tracing::debug!(line = %line, "ignoring unsupported upload-pack request");
                    } else {
                        return Err(Error::Transport(format!("unexpected line in want list: {line:?}")));
                    }
                }
                Some(other) => {
                    return Err(Error::Transport(format!("unexpected {other:?} in want list")));
                }
            }
        }
        if wants.is_empty() {
            return Ok(());
        }

        // Without multi_ack only the first common object is acknowledged.
        let mut common: Vec<Oid> = Vec::new();
        loop {
            let mut haves = Vec::new();
            let done = loop {
                match reader.read_pkt_opt().await? {
                    None => return Ok(()),
                    Some(PktLine::Flush) => break false,
                    Some(pkt @ PktLine::Data(_)) => {
                        let line = pkt.text().unwrap_or_default();
                        if line == "done" {
                            break true;
                        }
                        match line.strip_prefix("have ") {
                            Some(hex) => haves.push(parse_oid(hex)?),
                            None => {
                                return Err(Error::Transport(format!("unexpected line in negotiation: {line:?}")));
                            }
                        }
                    }
                    Some(other) => {
                        return Err(Error::Transport(format!("unexpected {other:?} in negotiation")));
                    }
                }
            };

            if !haves.is_empty() {
                let path = self.path.clone();
                let found = blocking(move || {
                    let git = open(&path)?;
                    let odb = git.odb()?;
                    Ok(haves.into_iter().filter(|oid| odb.exists(*oid)).collect::<Vec<_>>())
                })
                .await?;
                for oid in found {
                    if common.contains(&oid) {
                        continue;
                    }
                    common.push(oid);
                    if common.len() == 1 {
                        writer.write_line(&format!("ACK {oid}")).await?;
                    }
                }
            }

            if common.is_empty() {
                writer.write_line("NAK").await?;
            }
            if done {
                break;
            }
            writer.finish().await?;
            if transport == Transport::Http {
                return Ok(());
            }
        }

        let path = self.path.clone();
        let pack_wants = wants.clone();
        let pack = blocking(move || build_pack(&path, &pack_wants, &common)).await?;

        if client_caps.iter().any(|c| c == "side-band-64k") {
            writer.write_sideband(sideband::DATA, &pack).await?;
            writer.flush_pkt().await?;
        } else {
            writer.write_raw(&pack).await?;
        }
        writer.finish().await?;

        tracing::debug!(wants = wants.len(), bytes = pack.len(), ?transport, "sent packfile");
        Ok(())
    }

    async fn receive_pack(&self, stream: &mut dyn GitStream, repo: &mut Repo) -> Result<()> {
        let (rd, wr) = tokio::io::split(stream);
        let mut reader = PktReader::new(rd).with_trace(self.trace);
        let mut writer = PktWriter::new(wr).with_trace(self.trace);

        write_advertisement(&mut writer, &self.path, Service::ReceivePack).await?;

        let req = ReferenceUpdateRequest::decode(&mut reader).await?;

        // options stick even if the ref updates turn out to be no-ops
        if !req.options.is_empty() {
            repo.apply_push_options(&req.options)?;
        }
        if req.commands.is_empty() {
            return Ok(());
        }

        let unpacked = if req.has_packfile {
            let pack = read_pack(&mut reader).await?;
            let path = self.path.clone();
            blocking(move || ingest(&path, &pack)).await
        } else {
            Ok(())
        };

        let results = match &unpacked {
            Ok(()) => {
                let path = self.path.clone();
                let commands = req.commands.clone();
                blocking(move || apply_commands(&path, &commands)).await?
            }
            Err(_) => req
                .commands
                .iter()
                .map(|c| (c.name.clone(), Err("unpacker error".to_string())))
                .collect(),
        };

        for (name, result) in &results {
            match result {
                Ok(()) => tracing::info!(repo = %repo.name(), reference = %name, "updated ref"),
                Err(reason) => tracing::warn!(repo = %repo.name(), reference = %name, reason = %reason, "rejected ref update"),
            }
        }

        if req.has_capability("report-status") {
            match &unpacked {
                Ok(()) => writer.write_line("unpack ok").await?,
                Err(e) => writer.write_line(&format!("unpack {e}")).await?,
            }
            for (name, result) in &results {
                match result {
                    Ok(()) => writer.write_line(&format!("ok {name}")).await?,
                    Err(reason) => writer.write_line(&format!("ng {name} {reason}")).await?,
                }
            }
            writer.flush_pkt().await?;
            writer.finish().await?;
        }

        unpacked
    }
}
