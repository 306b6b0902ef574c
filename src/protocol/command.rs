// src/protocol/command.rs
//! Protocol backend that delegates to an installed `git`.
//!
//! Push options are not visible from here; git hands them to the
//! pre-receive hook, which calls back into `ugitd pre-receive-hook`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::pktline::PktWriter;
use super::{GitStream, Protocol, Transport};
use crate::error::{Error, Result};
use crate::hooks::HOOK_LOG;
use crate::storage::git::Repo;

/// Environment variable telling the hook which repository is being pushed
pub const REPO_DIR_ENV: &str = "UGIT_REPODIR";
/// Where the hook mode writes its log
pub const HOOK_LOG_ENV: &str = "UGIT_HOOK_LOG";

const DEFAULT_GIT_PROTOCOL: &str = "version=2";

pub struct CommandProtocol {
    repo_path: PathBuf,
    hooks_dir: PathBuf,
    trace: bool,
}

impl CommandProtocol {
    pub fn new(repo_path: PathBuf, hooks_dir: PathBuf, trace: bool) -> Self {
        Self {
            repo_path,
            hooks_dir,
            trace,
        }
    }

    fn command(&self, service: &str, args: &[&str], git_protocol: Option<&str>) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-c")
            .arg("protocol.version=2")
            .arg("-c")
            .arg("uploadpack.allowFilter=true")
            .arg("-c")
            .arg("receive.advertisePushOptions=true")
            .arg("-c")
            .arg(format!("core.hooksPath={}", self.hooks_dir.display()))
            .arg(service)
            .args(args)
            .arg(&self.repo_path)
            .env(REPO_DIR_ENV, &self.repo_path)
            .env(HOOK_LOG_ENV, self.hooks_dir.join(HOOK_LOG))
            .env("GIT_PROTOCOL", git_protocol.unwrap_or(DEFAULT_GIT_PROTOCOL))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.trace {
            cmd.env("GIT_TRACE_PACKET", "1");
        }
        cmd
    }

    /// Run `git <service>` with the stream wired to its stdin and stdout.
    /// Returns once the child's output has been fully forwarded.
    async fn run(&self, stream: &mut dyn GitStream, service: &str, args: &[&str]) -> Result<()> {
        let git_protocol = stream.git_protocol().map(str::to_string);
        let mut child = self
            .command(service, args, git_protocol.as_deref())
            .spawn()
            .map_err(|e| Error::System(format!("failed to spawn git {service}: {e}")))?;

        let (Some(mut stdin), Some(mut stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(Error::System(format!("git {service} pipes unavailable")));
        };

        let stderr_service = service.to_string();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(service = %stderr_service, "git: {}", line);
            }
        });

        let (mut rd, mut wr) = tokio::io::split(stream);
        let to_child = async move {
            tokio::io::copy(&mut rd, &mut stdin).await?;
            stdin.shutdown().await
        };
        let from_child = async move {
            tokio::io::copy(&mut stdout, &mut wr).await?;
            wr.flush().await
        };
        tokio::pin!(to_child);
        tokio::pin!(from_child);

        // Client input may stay open after git is done (SSH), so only the
        // output side decides when the exchange is over.
        let mut input_done = false;
        loop {
            tokio::select! {
                res = &mut to_child, if !input_done => {
                    input_done = true;
                    if let Err(e) = res {
                        tracing::debug!(service = %service, error = %e, "stopped forwarding client input");
                    }
                }
                res = &mut from_child => {
                    res?;
                    break;
                }
            }
        }

        let status = child.wait().await?;
        let _ = stderr_task.await;
        if !status.success() {
            return Err(Error::System(format!("git {service} exited with {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Protocol for CommandProtocol {
    async fn advertise_refs(&self, stream: &mut dyn GitStream) -> Result<()> {
        {
            let mut writer = PktWriter::new(&mut *stream).with_trace(self.trace);
            writer.write_line("# service=git-upload-pack").await?;
            writer.flush_pkt().await?;
            writer.finish().await?;
        }
        self.run(stream, "upload-pack", &["--stateless-rpc", "--advertise-refs"])
            .await
    }

    async fn upload_pack(&self, stream: &mut dyn GitStream, transport: Transport) -> Result<()> {
        match transport {
            Transport::Http => self.run(stream, "upload-pack", &["--stateless-rpc"]).await,
            Transport::Ssh => self.run(stream, "upload-pack", &[]).await,
        }
    }

    async fn receive_pack(&self, stream: &mut dyn GitStream, _repo: &mut Repo) -> Result<()> {
        self.run(stream, "receive-pack", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BufferedStream;
    use bytes::Bytes;
    use std::ffi::OsStr;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    impl GitStream for DuplexStream {}

    fn protocol() -> CommandProtocol {
        CommandProtocol::new(PathBuf::from("/srv/repos/project.git"), PathBuf::from("/srv/repos/hooks"), false)
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn env<'a>(cmd: &'a Command, key: &str) -> Option<&'a OsStr> {
        cmd.as_std()
            .get_envs()
            .find(|(k, _)| *k == OsStr::new(key))
            .and_then(|(_, v)| v)
    }

    #[test]
    fn http_upload_pack_command_line() {
        let cmd = protocol().command("upload-pack", &["--stateless-rpc"], None);
        assert_eq!(cmd.as_std().get_program(), "git");
        assert_eq!(
            args(&cmd),
            vec![
                "-c",
                "protocol.version=2",
                "-c",
                "uploadpack.allowFilter=true",
                "-c",
                "receive.advertisePushOptions=true",
                "-c",
                "core.hooksPath=/srv/repos/hooks",
                "upload-pack",
                "--stateless-rpc",
                "/srv/repos/project.git",
            ]
        );
    }

    #[test]
    fn environment_carries_repo_and_protocol() {
        let cmd = protocol().command("receive-pack", &[], None);
        assert_eq!(env(&cmd, REPO_DIR_ENV), Some(OsStr::new("/srv/repos/project.git")));
        assert_eq!(env(&cmd, HOOK_LOG_ENV), Some(OsStr::new("/srv/repos/hooks/pre-receive.log")));
        assert_eq!(env(&cmd, "GIT_PROTOCOL"), Some(OsStr::new("version=2")));
        assert_eq!(env(&cmd, "GIT_TRACE_PACKET"), None);

        let cmd = protocol().command("upload-pack", &[], Some("version=1"));
        assert_eq!(env(&cmd, "GIT_PROTOCOL"), Some(OsStr::new("version=1")));
    }

    #[test]
    fn packet_tracing_is_forwarded_to_git() {
        let protocol = CommandProtocol::new(PathBuf::from("/r.git"), PathBuf::from("/hooks"), true);
        let cmd = protocol.command("upload-pack", &[], None);
        assert_eq!(env(&cmd, "GIT_TRACE_PACKET"), Some(OsStr::new("1")));
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn advertisement_starts_with_service_banner() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo_path = dir.path().join("project.git");
        git2::Repository::init_bare(&repo_path).unwrap();

        let protocol = CommandProtocol::new(repo_path, dir.path().join("hooks"), false);
        let mut stream = BufferedStream::new(Bytes::new(), None);
        protocol.advertise_refs(&mut stream).await.unwrap();

        let out = stream.into_output();
        assert!(out.starts_with(b"001e# service=git-upload-pack\n0000"));
        assert!(out.len() > 34);
    }

    #[tokio::test]
    async fn missing_repository_is_a_system_error() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let protocol = CommandProtocol::new(dir.path().join("missing.git"), dir.path().join("hooks"), false);
        let mut stream = BufferedStream::new(Bytes::new(), None);
        assert!(matches!(
            protocol.upload_pack(&mut stream, Transport::Http).await,
            Err(Error::System(_))
        ));
    }

    /// Live (non-zombie) processes whose command line mentions `repo`
    fn git_processes_for(repo: &Path) -> usize {
        let needle = repo.to_string_lossy().into_owned();
        std::fs::read_dir("/proc")
            .unwrap()
            .flatten()
            .filter(|entry| {
                std::fs::read(entry.path().join("cmdline"))
                    .map(|raw| {
                        let cmdline = String::from_utf8_lossy(&raw);
                        cmdline.contains("upload-pack") && cmdline.contains(needle.as_str())
                    })
                    .unwrap_or(false)
            })
            .count()
    }

    #[tokio::test]
    async fn cancelled_exchange_kills_git() {
        if !git_available() || !Path::new("/proc/self/cmdline").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo_path = dir.path().join("stalled.git");
        git2::Repository::init_bare(&repo_path).unwrap();

        // the client end stays open and never sends anything
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let protocol = CommandProtocol::new(repo_path.clone(), dir.path().join("hooks"), false);
        let exchange = tokio::spawn(async move {
            let mut server = server;
            protocol.upload_pack(&mut server, Transport::Ssh).await
        });

        // git is up once its advertisement arrives
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(git_processes_for(&repo_path), 1);

        exchange.abort();
        assert!(exchange.await.unwrap_err().is_cancelled());

        let mut remaining = git_processes_for(&repo_path);
        for _ in 0..50 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            remaining = git_processes_for(&repo_path);
        }
        assert_eq!(remaining, 0);
        drop(client);
    }
}
