// src/main.rs
mod config;
mod error;
mod handlers;
mod hooks;
mod protocol;
mod routes;
mod ssh;
mod storage;
mod utils;

use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::protocol::command::HOOK_LOG_ENV;
use crate::protocol::receive::PushOption;
use crate::protocol::Backend;
use crate::routes::create_router;
use crate::ssh::middleware::SYSTEM_MALFUNCTION;
use crate::storage::git::GitStorage;

pub struct AppState {
    pub config: Config,
    pub storage: Arc<GitStorage>,
    pub backend: Backend,
}

#[derive(Parser)]
#[command(name = "ugitd", version, about = "Minimal git server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the SSH and HTTP servers (default)
    Serve,
    /// Called by the installed pre-receive hook
    #[command(name = "pre-receive-hook", hide = true)]
    PreReceiveHook,
    /// List repositories
    List,
    /// Rename a repository
    Rename { old: String, new: String },
    /// Delete a repository
    Delete { name: String },
    /// Show or edit repository metadata
    Meta {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Boolean, same syntax as `-o private=...`
        #[arg(long)]
        private: Option<String>,
        /// Comma separated, `-tag` removes
        #[arg(long)]
        tags: Option<String>,
    },
}

fn init_tracing(config: &Config) {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ugitd=info,tower_http=info"));
    if config.trace_packets {
        if let Ok(directive) = "ugit::packet=trace".parse() {
            filter = filter.add_directive(directive);
        }
    }
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Hook mode. git relays our stderr to the pushing client, so details go to
/// the hook log and the client only sees a one-line rejection.
fn pre_receive_hook() -> Result<()> {
    let log = std::env::var_os(HOOK_LOG_ENV)
        .and_then(|path| fs::OpenOptions::new().create(true).append(true).open(path).ok());
    let _ = match log {
        Some(file) => tracing::subscriber::set_global_default(hooks::hook_subscriber(Mutex::new(file))),
        None => tracing::subscriber::set_global_default(hooks::hook_subscriber(std::io::sink)),
    };

    if let Err(e) = hooks::run_pre_receive(|key| std::env::var(key).ok()) {
        tracing::error!(error = %e, "pre-receive hook failed");
        eprintln!("push rejected: {SYSTEM_MALFUNCTION}");
        std::process::exit(1);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Some(Command::PreReceiveHook) = cli.command {
        return pre_receive_hook();
    }

    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::PreReceiveHook => Ok(()),
        Command::List => {
            for name in open_storage(&config)?.list()? {
                println!("{name}");
            }
            Ok(())
        }
        Command::Rename { old, new } => {
            open_storage(&config)?
                .rename(&old, &new)
                .with_context(|| format!("failed to rename {old} to {new}"))?;
            Ok(())
        }
        Command::Delete { name } => {
            open_storage(&config)?
                .delete(&name)
                .with_context(|| format!("failed to delete {name}"))?;
            Ok(())
        }
        Command::Meta {
            name,
            description,
            private,
            tags,
        } => {
            let mut repo = open_storage(&config)?.open(&name)?;
            let opts: Vec<PushOption> = [("description", description), ("private", private), ("tags", tags)]
                .into_iter()
                .filter_map(|(key, value)| {
                    value.map(|value| PushOption {
                        key: key.to_string(),
                        value,
                    })
                })
                .collect();
            repo.apply_push_options(&opts)?;
            println!("{}", serde_json::to_string_pretty(&repo.meta)?);
            Ok(())
        }
    }
}

fn open_storage(config: &Config) -> Result<GitStorage> {
    GitStorage::new(&config.repo_dir)
        .with_context(|| format!("failed to open repository root {}", config.repo_dir.display()))
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting ugit {}", env!("CARGO_PKG_VERSION"));

    let storage = Arc::new(open_storage(&config)?);
    let backend = Backend::new(
        config.backend,
        hooks::hooks_dir(storage.base_path()),
        config.trace_packets,
    );
    if backend.requires_hook() {
        let bin = std::env::current_exe().context("could not locate the server binary")?;
        hooks::install_pre_receive(storage.base_path(), &bin).context("failed to install pre-receive hook")?;
    }
    tracing::info!(repo_dir = %storage.base_path().display(), backend = ?config.backend, "Git storage ready");

    let state = Arc::new(AppState {
        config: config.clone(),
        storage,
        backend,
    });

    let mut servers = tokio::task::JoinSet::new();
    if config.ssh_enable {
        servers.spawn(ssh::start_ssh_server(state.clone()));
    }
    if config.http_enable {
        let addr = config.http_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
        let app = create_router(state.clone());
        tracing::info!(address = %addr, clone_url = %config.http_clone_url, "HTTP server listening");
        servers.spawn(async move { axum::serve(listener, app).await.context("HTTP server exited with error") });
    }
    if servers.is_empty() {
        tracing::warn!("both SSH and HTTP are disabled, nothing to serve");
        return Ok(());
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
        Some(res) = servers.join_next() => res.context("server task failed")?,
        else => Ok(()),
    }
}
