// src/ssh/server.rs
//! SSH listener: host key, authorized keys and the russh server loop.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tracing::{info, warn};

use super::middleware::{GitGateway, LogHooks};
use super::session::{fingerprint_of, SshSession};
use crate::AppState;

pub struct SshServer {
    gateway: Arc<GitGateway>,
    authorized: Arc<HashSet<String>>,
}

impl SshServer {
    pub fn new(gateway: Arc<GitGateway>, authorized: HashSet<String>) -> Self {
        Self {
            gateway,
            authorized: Arc::new(authorized),
        }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH connection");
        SshSession::new(self.gateway.clone(), self.authorized.clone(), peer_addr)
    }
}

/// Load the host key at `path`, generating and persisting an Ed25519 key on
/// first start.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        return russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key {}", path.display()));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let key = KeyPair::generate_ed25519();
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create SSH host key {}", path.display()))?;
    russh_keys::encode_pkcs8_pem(&key, file).context("failed to write SSH host key")?;

    info!(path = %path.display(), "generated SSH host key");
    Ok(key)
}

/// Fingerprints of every key in an OpenSSH `authorized_keys` file. A missing
/// file authorizes nobody.
pub fn load_authorized_keys(path: &Path) -> Result<HashSet<String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "authorized_keys not found, all SSH logins will be rejected");
            return Ok(HashSet::new());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };

    let mut keys = HashSet::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // options and the key type come before the blob, a comment after it
        match line
            .split_whitespace()
            .find_map(|token| russh_keys::parse_public_key_base64(token).ok())
        {
            Some(key) => {
                keys.insert(fingerprint_of(&key));
            }
            None => warn!(path = %path.display(), line = lineno + 1, "skipping unparsable authorized key"),
        }
    }
    Ok(keys)
}

pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let config = &state.config;
    let host_key = load_or_generate_host_key(&config.ssh_host_key)?;
    let authorized = load_authorized_keys(&config.ssh_authorized_keys)?;
    info!(keys = authorized.len(), "loaded authorized SSH keys");

    let gateway = Arc::new(GitGateway::new(
        state.storage.clone(),
        state.backend.clone(),
        config.ssh_clone_url.clone(),
        Arc::new(LogHooks),
    ));

    let ssh_config = Arc::new(server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        inactivity_timeout: Some(Duration::from_secs(600)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    });

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.ssh_port));
    info!(address = %listen_addr, "SSH server listening");

    let mut ssh_server = SshServer::new(gateway, authorized);
    ssh_server
        .run_on_address(ssh_config, listen_addr)
        .await
        .context("SSH server exited with error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::PublicKeyBase64;

    #[test]
    fn host_key_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ssh").join("ugit_ed25519");

        let first = load_or_generate_host_key(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions();
        assert_eq!(std::os::unix::fs::PermissionsExt::mode(&mode) & 0o777, 0o600);

        let second = load_or_generate_host_key(&path).unwrap();
        assert_eq!(
            first.clone_public_key().unwrap().fingerprint(),
            second.clone_public_key().unwrap().fingerprint()
        );
    }

    #[test]
    fn authorized_keys_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        let alice = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let bob = KeyPair::generate_ed25519().clone_public_key().unwrap();
        let stranger = KeyPair::generate_ed25519().clone_public_key().unwrap();

        fs::write(
            &path,
            format!(
                "# admins\nssh-ed25519 {} alice@laptop\n\nno-pty ssh-ed25519 {}\ngarbage line\n",
                alice.public_key_base64(),
                bob.public_key_base64()
            ),
        )
        .unwrap();

        let keys = load_authorized_keys(&path).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&fingerprint_of(&alice)));
        assert!(keys.contains(&fingerprint_of(&bob)));
        assert!(!keys.contains(&fingerprint_of(&stranger)));
    }

    #[test]
    fn missing_authorized_keys_authorizes_nobody() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_authorized_keys(&dir.path().join("nope")).unwrap().is_empty());
    }
}
