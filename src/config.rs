// src/config.rs
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::protocol::BackendKind;
use crate::storage::meta::parse_bool;

#[derive(Debug, Clone)]
pub struct Config {
    pub repo_dir: PathBuf,
    pub backend: BackendKind,
    pub ssh_enable: bool,
    pub ssh_port: u16,
    pub ssh_host_key: PathBuf,
    pub ssh_authorized_keys: PathBuf,
    pub ssh_clone_url: String,
    pub http_enable: bool,
    pub http_host: String,
    pub http_port: u16,
    pub http_clone_url: String,
    /// Serve private repositories over HTTP (trusted networks only)
    pub show_private: bool,
    pub log_json: bool,
    pub trace_packets: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let boolean = |key: &str, default: bool| -> Result<bool> {
            match lookup(key) {
                Some(v) => parse_bool(&v).ok_or_else(|| anyhow!("{key} must be a boolean, got {v:?}")),
                None => Ok(default),
            }
        };
        let port = |key: &str, default: u16| -> Result<u16> {
            match lookup(key) {
                Some(v) => v.parse().with_context(|| format!("{key} must be a port number, got {v:?}")),
                None => Ok(default),
            }
        };

        let repo_dir = PathBuf::from(string("UGIT_REPO_DIR", ".ugit"));
        let repo_dir = if repo_dir.is_absolute() {
            repo_dir
        } else {
            std::env::current_dir()
                .context("could not resolve the working directory")?
                .join(repo_dir)
        };

        let backend = string("UGIT_BACKEND", "git")
            .parse::<BackendKind>()
            .map_err(|e| anyhow!("UGIT_BACKEND: {e}"))?;

        Ok(Self {
            repo_dir,
            backend,
            ssh_enable: boolean("UGIT_SSH_ENABLE", true)?,
            ssh_port: port("UGIT_SSH_PORT", 8448)?,
            ssh_host_key: PathBuf::from(string("UGIT_SSH_HOST_KEY", ".ssh/ugit_ed25519")),
            ssh_authorized_keys: PathBuf::from(string("UGIT_SSH_AUTHORIZED_KEYS", ".ssh/authorized_keys")),
            ssh_clone_url: clone_url("UGIT_SSH_CLONE_URL", &string("UGIT_SSH_CLONE_URL", "ssh://localhost:8448"))?,
            http_enable: boolean("UGIT_HTTP_ENABLE", true)?,
            http_host: string("UGIT_HTTP_HOST", "127.0.0.1"),
            http_port: port("UGIT_HTTP_PORT", 8449)?,
            http_clone_url: clone_url(
                "UGIT_HTTP_CLONE_URL",
                &string("UGIT_HTTP_CLONE_URL", "http://localhost:8449"),
            )?,
            show_private: boolean("UGIT_SHOW_PRIVATE", false)?,
            log_json: boolean("UGIT_LOG_JSON", false)?,
            trace_packets: boolean("UGIT_TRACE_PACKETS", false)?,
        })
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.http_host, self.http_port)
            .parse()
            .with_context(|| format!("invalid HTTP listen address {}:{}", self.http_host, self.http_port))
    }
}

/// Clone URLs are prefixes for `<url>/<repo>.git`, so the trailing slash goes
fn clone_url(key: &str, raw: &str) -> Result<String> {
    Url::parse(raw).with_context(|| format!("{key} is not a valid URL: {raw:?}"))?;
    Ok(raw.trim_end_matches('/').to_string())
}
