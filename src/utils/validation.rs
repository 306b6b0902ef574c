// src/utils/validation.rs
use regex::Regex;

const MAX_PATH_LENGTH: usize = 1024;

lazy_static::lazy_static! {
    static ref REPO_SEGMENT_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9._-]+$").unwrap();
}

/// Lexically clean a slash-separated path: collapse repeated separators,
/// drop `.` segments and resolve `..` against preceding segments.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Normalize a repository path as sent by a git client (`/repo.git`,
/// `user/repo.git/`, ...) into `name` or `namespace/name`.
///
/// Rejects traversal, more than one level of nesting, and characters outside
/// of `[A-Za-z0-9._-]`.
pub fn normalize_repo_path(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.len() > MAX_PATH_LENGTH {
        return None;
    }
    if raw.contains('\0') || raw.chars().any(|c| c.is_control()) {
        return None;
    }

    let repo = clean_path(raw.trim_start_matches('/').trim_end_matches('/'));
    if repo == "." || repo.matches('/').count() > 1 {
        return None;
    }

    let valid = repo
        .split('/')
        .all(|segment| segment != ".." && REPO_SEGMENT_REGEX.is_match(segment));
    valid.then_some(repo)
}

/// A repository name used on the filesystem always carries the `.git` suffix
pub fn with_git_suffix(name: &str) -> String {
    if name.ends_with(".git") {
        name.to_string()
    } else {
        format!("{name}.git")
    }
}
