// src/ssh/middleware.rs
//! Git command dispatch for SSH exec requests, independent of the SSH
//! library so it can run against any byte stream.

use std::str::FromStr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::protocol::{Backend, GitStream, Transport, RECEIVE_PACK, UPLOAD_ARCHIVE, UPLOAD_PACK};
use crate::storage::git::GitStorage;
use crate::utils::validation::{normalize_repo_path, with_git_suffix};

/// Generic message for failures that are not the client's fault
pub const SYSTEM_MALFUNCTION: &str = "something went wrong";

/// Notifications after a successful git operation. `identity` is the
/// authenticated key's fingerprint.
pub trait Hooks: Send + Sync {
    fn push(&self, repo: &str, identity: Option<&str>);
    fn fetch(&self, repo: &str, identity: Option<&str>);
}

/// Default hooks: log and move on
pub struct LogHooks;

impl Hooks for LogHooks {
    fn push(&self, repo: &str, identity: Option<&str>) {
        tracing::info!(repo = %repo, identity = ?identity, "push");
    }

    fn fetch(&self, repo: &str, identity: Option<&str>) {
        tracing::info!(repo = %repo, identity = ?identity, "fetch");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitCommand {
    UploadPack,
    UploadArchive,
    ReceivePack,
}

impl FromStr for GitCommand {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            UPLOAD_PACK => Ok(GitCommand::UploadPack),
            UPLOAD_ARCHIVE => Ok(GitCommand::UploadArchive),
            RECEIVE_PACK => Ok(GitCommand::ReceivePack),
            _ => Err(()),
        }
    }
}

/// How the channel should end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub exit_status: u32,
    /// Sent on the extended (stderr) stream before exiting
    pub stderr: Option<String>,
}

impl Outcome {
    fn success() -> Self {
        Self {
            exit_status: 0,
            stderr: None,
        }
    }

    fn failure() -> Self {
        Self {
            exit_status: 1,
            stderr: None,
        }
    }

    fn unsupported(message: String) -> Self {
        Self {
            exit_status: 1,
            stderr: Some(message),
        }
    }
}

/// Split an exec command line into arguments, honoring single and double
/// quotes and backslash escapes outside quotes.
pub fn split_command(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = raw.chars();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_arg = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_arg = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

/// A pkt-line carrying `msg`, the way git reports a fatal remote error
pub fn fatal_pkt(msg: &str) -> Vec<u8> {
    format!("{:04x}{}\n", msg.len() + 5, msg).into_bytes()
}

pub struct GitGateway {
    storage: Arc<GitStorage>,
    backend: Backend,
    clone_url: String,
    hooks: Arc<dyn Hooks>,
}

impl GitGateway {
    pub fn new(storage: Arc<GitStorage>, backend: Backend, clone_url: String, hooks: Arc<dyn Hooks>) -> Self {
        Self {
            storage,
            backend,
            clone_url,
            hooks,
        }
    }

    /// Serve one exec request. Nothing is written to `stream` unless a git
    /// command runs, the repository list is requested, or a fatal error is
    /// reported.
    pub async fn handle(&self, args: &[String], identity: Option<&str>, stream: &mut dyn GitStream) -> Outcome {
        match args {
            [] => {
                if let Err(e) = self.list_repos(stream).await {
                    tracing::error!(error = %e, "could not list repositories");
                    return Outcome::failure();
                }
                Outcome::success()
            }
            [command, repo] => match command.parse::<GitCommand>() {
                Ok(command) => match self.run_git(command, repo, identity, stream).await {
                    Ok(()) => Outcome::success(),
                    Err(e) => {
                        let msg = if e.is_client_error() {
                            Error::InvalidRepo.to_string()
                        } else {
                            tracing::error!(command = ?command, repo = %repo, error = %e, "git command failed");
                            SYSTEM_MALFUNCTION.to_string()
                        };
                        let _ = stream.write_all(&fatal_pkt(&msg)).await;
                        let _ = stream.flush().await;
                        Outcome::failure()
                    }
                },
                Err(()) => Outcome::unsupported(format!("unsupported command: {command}\n")),
            },
            _ => Outcome::unsupported(format!("unsupported command: {}\n", args.join(" "))),
        }
    }

    async fn run_git(
        &self,
        command: GitCommand,
        raw_repo: &str,
        identity: Option<&str>,
        stream: &mut dyn GitStream,
    ) -> Result<()> {
        let name = normalize_repo_path(raw_repo).ok_or(Error::InvalidRepo)?;
        let name = with_git_suffix(&name);

        match command {
            GitCommand::ReceivePack => {
                self.storage.ensure_repo(&name)?;
                let mut repo = self.storage.open(&name)?;
                let protocol = self.backend.protocol(repo.path());
                protocol.receive_pack(stream, &mut repo).await?;

                tokio::task::spawn_blocking(move || -> Result<()> {
                    repo.default_branch()?;
                    repo.update_server_info()
                })
                .await
                .map_err(|e| Error::System(format!("post-push task failed: {e}")))??;

                self.hooks.push(&name, identity);
            }
            GitCommand::UploadPack | GitCommand::UploadArchive => {
                if !self.storage.exists(&name) {
                    return Err(Error::InvalidRepo);
                }
                let protocol = self.backend.protocol(&self.storage.repo_path(&name));
                protocol.upload_pack(stream, Transport::Ssh).await?;
                self.hooks.fetch(&name, identity);
            }
        }
        Ok(())
    }

    async fn list_repos(&self, stream: &mut dyn GitStream) -> Result<()> {
        let mut out = String::new();
        for name in self.storage.list()? {
            out.push_str(&format!("{name}.git\n\tgit clone {}/{name}.git\n", self.clone_url));
        }
        stream.write_all(out.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}
