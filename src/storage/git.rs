// src/storage/git.rs
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use git2::{BranchType, ErrorCode, ObjectType, Oid, Repository};

use crate::error::{Error, Result};
use crate::protocol::receive::PushOption;
use crate::storage::meta::{RepoMeta, DESCRIPTION_FILE, META_FILE};
use crate::utils::validation::{normalize_repo_path, with_git_suffix};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Directory of bare repositories, each named `<name>.git`
pub struct GitStorage {
    base_path: PathBuf,
}

impl GitStorage {
    /// Create the root directory if needed. The stored path is absolute.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        create_private_dir(&base_path)?;
        let base_path = base_path.canonicalize()?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn repo_path(&self, name: &str) -> PathBuf {
        self.base_path.join(with_git_suffix(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.repo_path(name).is_dir()
    }

    /// Create the bare repository and its metadata if they do not exist yet.
    pub fn ensure_repo(&self, name: &str) -> Result<()> {
        create_private_dir(&self.base_path)?;

        let path = self.repo_path(name);
        if !path.exists() {
            if let Some(parent) = path.parent() {
                create_private_dir(parent)?;
            }
            Repository::init_bare(&path)?;
            tracing::info!(repo = %name, "initialized repository");
        }

        // opening writes the default metadata record when it is missing
        Repo::open_path(path)?;
        Ok(())
    }

    pub fn open(&self, name: &str) -> Result<Repo> {
        Repo::open_path(self.repo_path(name))
    }

    /// Repository names (without `.git`), sorted. A missing root is empty.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(name) = file_name.strip_suffix(".git") {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        if !self.base_path.is_absolute() {
            return Err(Error::System("repository directory must be an absolute path".into()));
        }
        if Path::new(old).is_absolute() || Path::new(new).is_absolute() {
            return Err(Error::InvalidRepo);
        }
        let old = normalize_repo_path(old).ok_or(Error::InvalidRepo)?;
        let new = normalize_repo_path(new).ok_or(Error::InvalidRepo)?;

        let old_path = self.repo_path(&old);
        let new_path = self.repo_path(&new);
        if !old_path.is_dir() {
            return Err(Error::NotFound(with_git_suffix(&old)));
        }
        if new_path.exists() {
            return Err(Error::Repository(format!("{} already exists", with_git_suffix(&new))));
        }
        if let Some(parent) = new_path.parent() {
            create_private_dir(parent)?;
        }

        fs::rename(&old_path, &new_path)?;
        tracing::info!(from = %old, to = %new, "renamed repository");
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let name = normalize_repo_path(name).ok_or(Error::InvalidRepo)?;
        let path = self.repo_path(&name);
        if !path.is_dir() {
            return Err(Error::NotFound(with_git_suffix(&name)));
        }
        fs::remove_dir_all(&path)?;
        tracing::info!(repo = %name, "deleted repository");
        Ok(())
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)?;
    Ok(())
}

/// A bare repository that exists on disk, with its metadata loaded
#[derive(Debug, Clone)]
pub struct Repo {
    path: PathBuf,
    pub meta: RepoMeta,
}

impl Repo {
    /// Open the repository at `path`, writing a default metadata record if
    /// there is none.
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Err(Error::NotFound(name));
        }

        let meta = match fs::read(path.join(META_FILE)) {
            Ok(data) if data.iter().all(u8::is_ascii_whitespace) => None,
            Ok(data) => Some(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        match meta {
            Some(meta) => Ok(Self { path, meta }),
            None => {
                let repo = Self {
                    path,
                    meta: RepoMeta::default(),
                };
                repo.save_meta()?;
                Ok(repo)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory name without the `.git` suffix
    pub fn name(&self) -> String {
        let base = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        base.strip_suffix(".git").map(str::to_string).unwrap_or(base)
    }

    /// Persist the metadata record. The `description` file is best effort;
    /// `ugit.json` is replaced atomically.
    pub fn save_meta(&self) -> Result<()> {
        if let Err(e) = fs::write(self.path.join(DESCRIPTION_FILE), &self.meta.description) {
            tracing::warn!(repo = %self.name(), error = %e, "could not write description file");
        }

        let mut data = serde_json::to_vec(&self.meta)?;
        data.push(b'\n');

        let tmp = self.path.join(format!(
            ".{META_FILE}.{}.{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, &data)?;
        if let Err(e) = fs::rename(&tmp, self.path.join(META_FILE)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Apply push options and save if anything changed
    pub fn apply_push_options(&mut self, opts: &[PushOption]) -> Result<bool> {
        if !self.meta.apply_push_options(opts) {
            return Ok(false);
        }
        self.save_meta()?;
        tracing::info!(
            repo = %self.name(),
            private = self.meta.private,
            tags = self.meta.tags.len(),
            "updated repository metadata from push options"
        );
        Ok(true)
    }

    pub fn git(&self) -> Result<Repository> {
        Repository::open_bare(&self.path).map_err(|e| Error::Repository(e.message().to_string()))
    }

    /// The branch HEAD points at. An unborn HEAD is repointed at the first
    /// local branch; `None` if there are no branches.
    pub fn default_branch(&self) -> Result<Option<String>> {
        let git = self.git()?;
        // bound first so the `Reference` is gone before `git` drops
        let head = git.head();
        let branch = match head {
            Ok(head) => Ok(head.shorthand().map(str::to_string)),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                let mut branches = Vec::new();
                for branch in git.branches(Some(BranchType::Local))? {
                    let (branch, _) = branch?;
                    if let Some(name) = branch.name()? {
                        branches.push(name.to_string());
                    }
                }
                branches.sort();
                let Some(first) = branches.into_iter().next() else {
                    return Ok(None);
                };
                git.set_head(&format!("refs/heads/{first}"))?;
                tracing::info!(repo = %self.name(), branch = %first, "pointed HEAD at first branch");
                Ok(Some(first))
            }
            Err(e) => Err(e.into()),
        };
        branch
    }

    /// Regenerate `info/refs` and `objects/info/packs` for dumb HTTP clients
    pub fn update_server_info(&self) -> Result<()> {
        let git = self.git()?;

        let mut info_refs = String::new();
        for entry in ref_list(&git)? {
            info_refs.push_str(&format!("{}\t{}\n", entry.oid, entry.name));
            if let Some(peeled) = entry.peeled {
                info_refs.push_str(&format!("{}\t{}^{{}}\n", peeled, entry.name));
            }
        }
        let info_dir = self.path.join("info");
        fs::create_dir_all(&info_dir)?;
        fs::write(info_dir.join("refs"), info_refs)?;

        let mut packs = Vec::new();
        match fs::read_dir(self.path.join("objects").join("pack")) {
            Ok(entries) => {
                for entry in entries {
                    let name = entry?.file_name().to_string_lossy().into_owned();
                    if name.ends_with(".pack") {
                        packs.push(name);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        packs.sort();

        let mut info_packs = String::new();
        for pack in packs {
            info_packs.push_str(&format!("P {pack}\n"));
        }
        info_packs.push('\n');
        let objects_info = self.path.join("objects").join("info");
        fs::create_dir_all(&objects_info)?;
        fs::write(objects_info.join("packs"), info_packs)?;
        Ok(())
    }
}

/// A direct reference under `refs/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub name: String,
    pub oid: Oid,
    /// Target of an annotated tag
    pub peeled: Option<Oid>,
}

/// All direct references under `refs/`, sorted by name
pub fn ref_list(git: &Repository) -> Result<Vec<RefEntry>> {
    let mut refs = Vec::new();
    for reference in git.references()? {
        let reference = reference?;
        let (Some(name), Some(oid)) = (reference.name(), reference.target()) else {
            continue;
        };
        if !name.starts_with("refs/") {
            continue;
        }
        let peeled = match git.find_tag(oid) {
            Ok(_) => Some(reference.peel(ObjectType::Any)?.id()),
            Err(_) => None,
        };
        refs.push(RefEntry {
            name: name.to_string(),
            oid,
            peeled,
        });
    }
    refs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(refs)
}
