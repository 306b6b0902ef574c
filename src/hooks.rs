// src/hooks.rs
//! Pre-receive hook bridge for the delegating backend.
//!
//! `git receive-pack` only exposes push options to hooks, so a pre-receive
//! hook is installed that calls `ugitd pre-receive-hook`, which rebuilds the
//! options from the environment and applies them to the repository metadata.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::protocol::command::REPO_DIR_ENV;
use crate::protocol::receive::PushOption;
use crate::storage::git::Repo;

pub const HOOK_SUBCOMMAND: &str = "pre-receive-hook";
pub const PRE_RECEIVE: &str = "pre-receive";
/// Hook mode log, kept next to the hook script
pub const HOOK_LOG: &str = "pre-receive.log";

const PUSH_OPTION_COUNT_ENV: &str = "GIT_PUSH_OPTION_COUNT";

/// Directory handed to git as `core.hooksPath`
pub fn hooks_dir(repo_dir: &Path) -> PathBuf {
    repo_dir.join("hooks")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Script that runs the server's hook mode, then every executable in
/// `pre-receive.d`, each with the original stdin. Any failure rejects the push.
pub fn pre_receive_script(bin: &Path, hook_path: &Path) -> String {
    let bin = shell_quote(&bin.to_string_lossy());
    let hooks_d = shell_quote(&format!("{}.d", hook_path.to_string_lossy()));
    format!(
        r#"#!/usr/bin/env bash
set -e
input="$(cat)"
printf '%s\n' "$input" | {bin} {HOOK_SUBCOMMAND}
for hook in {hooks_d}/*; do
    if [ -f "$hook" ] && [ -x "$hook" ]; then
        printf '%s\n' "$input" | "$hook"
    fi
done
"#
    )
}

/// Write `<repo_dir>/hooks/pre-receive` (0755) and create `pre-receive.d`.
pub fn install_pre_receive(repo_dir: &Path, bin: &Path) -> Result<PathBuf> {
    let dir = hooks_dir(repo_dir);
    let hook = dir.join(PRE_RECEIVE);
    fs::create_dir_all(dir.join(format!("{PRE_RECEIVE}.d")))?;

    fs::write(&hook, pre_receive_script(bin, &hook))?;
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755))?;

    tracing::info!(hook = %hook.display(), "installed pre-receive hook");
    Ok(hook)
}

/// Subscriber for hook mode. git relays the hook's stderr to the pushing
/// client, so only warnings and errors are recorded, plain text, to `writer`.
pub fn hook_subscriber<W>(writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_ansi(false)
        .with_writer(writer)
        .finish()
}

/// Rebuild push options from `GIT_PUSH_OPTION_COUNT` / `GIT_PUSH_OPTION_<i>`
pub fn push_options_from_env<F>(lookup: F) -> Vec<PushOption>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(count) = lookup(PUSH_OPTION_COUNT_ENV).and_then(|c| c.parse::<usize>().ok()) else {
        return Vec::new();
    };
    (0..count)
        .filter_map(|i| lookup(&format!("GIT_PUSH_OPTION_{i}")))
        .filter_map(|raw| PushOption::parse(&raw))
        .collect()
}

/// Body of `ugitd pre-receive-hook`
pub fn run_pre_receive<F>(lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let repo_dir = lookup(REPO_DIR_ENV)
        .ok_or_else(|| Error::System(format!("{REPO_DIR_ENV} is not set")))?;
    let opts = push_options_from_env(&lookup);

    let mut repo = Repo::open_path(&repo_dir)?;
    if repo.apply_push_options(&opts)? {
        tracing::debug!(repo = %repo.name(), options = opts.len(), "applied push options from hook");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::git::GitStorage;
    use crate::storage::meta::META_FILE;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn script_content() {
        let script = pre_receive_script(Path::new("/usr/local/bin/ugitd"), Path::new("/srv/repos/hooks/pre-receive"));
        assert!(script.starts_with("#!/usr/bin/env bash\nset -e\n"));
        assert!(script.contains("input=\"$(cat)\""));
        assert!(script.contains("'/usr/local/bin/ugitd' pre-receive-hook"));
        assert!(script.contains("for hook in '/srv/repos/hooks/pre-receive.d'/*; do"));
        assert!(script.contains("[ -x \"$hook\" ]"));
    }

    #[test]
    fn script_quotes_awkward_paths() {
        let script = pre_receive_script(Path::new("/opt/it's here/ugitd"), Path::new("/h/pre-receive"));
        assert!(script.contains(r"'/opt/it'\''s here/ugitd' pre-receive-hook"));
    }

    #[test]
    fn install_sets_mode_and_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let hook = install_pre_receive(dir.path(), Path::new("/bin/ugitd")).unwrap();

        assert_eq!(hook, dir.path().join("hooks").join("pre-receive"));
        let mode = fs::metadata(&hook).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(dir.path().join("hooks/pre-receive.d").is_dir());

        // reinstalling rewrites in place
        install_pre_receive(dir.path(), Path::new("/other/ugitd")).unwrap();
        let script = fs::read_to_string(&hook).unwrap();
        assert!(script.contains("'/other/ugitd'"));
    }

    #[test]
    fn options_from_env() {
        let opts = push_options_from_env(lookup(&[
            ("GIT_PUSH_OPTION_COUNT", "3"),
            ("GIT_PUSH_OPTION_0", "description=a=b"),
            ("GIT_PUSH_OPTION_1", "novalue"),
            ("GIT_PUSH_OPTION_2", "private=false"),
        ]));
        assert_eq!(
            opts,
            vec![
                PushOption { key: "description".into(), value: "a=b".into() },
                PushOption { key: "private".into(), value: "false".into() },
            ]
        );
    }

    #[test]
    fn missing_or_bad_count_means_no_options() {
        assert!(push_options_from_env(lookup(&[])).is_empty());
        assert!(push_options_from_env(lookup(&[("GIT_PUSH_OPTION_COUNT", "x")])).is_empty());
    }

    #[test]
    fn hook_mode_applies_options() {
        let dir = tempfile::tempdir().unwrap();
        let storage = GitStorage::new(dir.path()).unwrap();
        storage.ensure_repo("project").unwrap();
        let repo_dir = storage.repo_path("project");

        run_pre_receive(lookup(&[
            (REPO_DIR_ENV, repo_dir.to_str().unwrap()),
            ("GIT_PUSH_OPTION_COUNT", "2"),
            ("GIT_PUSH_OPTION_0", "description=Hello"),
            ("GIT_PUSH_OPTION_1", "tags=a,b"),
        ]))
        .unwrap();

        assert_eq!(
            fs::read_to_string(repo_dir.join(META_FILE)).unwrap(),
            "{\"description\":\"Hello\",\"private\":true,\"tags\":[\"a\",\"b\"]}\n"
        );
    }

    #[test]
    fn hook_mode_writes_nothing_at_info() {
        let dir = tempfile::tempdir().unwrap();
        let storage = GitStorage::new(dir.path()).unwrap();
        storage.ensure_repo("quiet").unwrap();
        let repo_dir = storage.repo_path("quiet");

        let captured = Captured::default();
        let writer = captured.clone();
        tracing::subscriber::with_default(hook_subscriber(move || writer.clone()), || {
            run_pre_receive(lookup(&[
                (REPO_DIR_ENV, repo_dir.to_str().unwrap()),
                ("GIT_PUSH_OPTION_COUNT", "1"),
                ("GIT_PUSH_OPTION_0", "description=Hello"),
            ]))
            .unwrap();
        });
        assert_eq!(captured.text(), "");
        assert!(fs::read_to_string(repo_dir.join(META_FILE)).unwrap().contains("Hello"));

        let writer = captured.clone();
        tracing::subscriber::with_default(hook_subscriber(move || writer.clone()), || {
            tracing::info!("not recorded");
            tracing::warn!(repo = "quiet", "metadata left unchanged");
        });
        let text = captured.text();
        assert!(text.contains("WARN"));
        assert!(text.contains("metadata left unchanged"));
        assert!(!text.contains("not recorded"));
        assert!(!text.contains('\x1b'));
    }

    #[test]
    fn hook_mode_requires_repo_dir() {
        assert!(matches!(run_pre_receive(lookup(&[])), Err(Error::System(_))));
    }
}
