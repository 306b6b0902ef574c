// src/storage/meta.rs
//! Forge-level metadata stored next to each bare repository.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

use crate::protocol::receive::PushOption;

/// Name of the JSON sidecar inside the repository directory
pub const META_FILE: &str = "ugit.json";

/// Plain-text description file read by gitweb-style tooling
pub const DESCRIPTION_FILE: &str = "description";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoMeta {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_private")]
    pub private: bool,
    #[serde(default)]
    pub tags: TagSet,
}

fn default_private() -> bool {
    true
}

impl Default for RepoMeta {
    fn default() -> Self {
        Self {
            description: String::new(),
            private: true,
            tags: TagSet::default(),
        }
    }
}

/// Lower-cased, deduplicated tags. Serializes as a sorted array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the tag was not present before
    pub fn add(&mut self, tag: &str) -> bool {
        self.0.insert(tag.to_lowercase())
    }

    /// Returns true if the tag was present
    pub fn remove(&mut self, tag: &str) -> bool {
        self.0.remove(&tag.to_lowercase())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(&tag.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Sorted copy of the tags
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<'de> Deserialize<'de> for TagSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tags = Vec::<String>::deserialize(deserializer)?;
        let mut set = TagSet::new();
        for tag in &tags {
            set.add(tag);
        }
        Ok(set)
    }
}

impl<S: AsRef<str>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = TagSet::new();
        for tag in iter {
            set.add(tag.as_ref());
        }
        set
    }
}

impl RepoMeta {
    /// Merge another record into this one: description and visibility are
    /// replaced, tags are unioned.
    pub fn update(&mut self, other: RepoMeta) {
        self.description = other.description;
        self.private = other.private;
        self.tags.0.extend(other.tags.0);
    }

    /// Apply push options in order and report whether anything changed.
    ///
    /// Unknown keys and unparsable `private` values are skipped.
    pub fn apply_push_options(&mut self, opts: &[PushOption]) -> bool {
        let mut changed = false;
        for opt in opts {
            match opt.key.to_lowercase().as_str() {
                "desc" | "description" => {
                    if self.description != opt.value {
                        self.description = opt.value.clone();
                        changed = true;
                    }
                }
                "private" => {
                    let Some(private) = parse_bool(&opt.value) else {
                        tracing::debug!(value = %opt.value, "ignoring unparsable private push option");
                        continue;
                    };
                    if self.private != private {
                        self.private = private;
                        changed = true;
                    }
                }
                "tags" => {
                    for token in opt.value.split(',') {
                        let token = token.to_lowercase();
                        if let Some(tag) = token.strip_prefix('-') {
                            if !tag.is_empty() {
                                changed |= self.tags.remove(tag);
                            }
                        } else if !token.is_empty() {
                            changed |= self.tags.add(&token);
                        }
                    }
                }
                other => {
                    tracing::debug!(key = %other, "ignoring unknown push option");
                }
            }
        }
        changed
    }
}

/// `1 t T TRUE true True` and `0 f F FALSE false False`
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(key: &str, value: &str) -> PushOption {
        PushOption {
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn tag_set_operations() {
        let mut set = TagSet::new();
        assert!(set.is_empty());

        set.add("foo");
        set.add("bar");
        set.add("bar");
        assert_eq!(set.len(), 2);
        assert!(set.contains("foo"));

        set.remove("foo");
        assert!(!set.contains("foo"));
        assert!(set.contains("bar"));

        set.add("foo");
        set.add("baz");
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["bar","baz","foo"]"#);
    }

    #[test]
    fn tags_fold_case_and_dedupe_on_decode() {
        let meta: RepoMeta =
            serde_json::from_str(r#"{"description":"d","private":false,"tags":["Rust","rust","CLI","abc"]}"#)
                .unwrap();
        assert_eq!(meta.tags.to_vec(), vec!["abc", "cli", "rust"]);

        let encoded = serde_json::to_string(&meta).unwrap();
        assert_eq!(
            encoded,
            r#"{"description":"d","private":false,"tags":["abc","cli","rust"]}"#
        );

        let again: RepoMeta = serde_json::from_str(&encoded).unwrap();
        assert_eq!(serde_json::to_string(&again).unwrap(), encoded);
    }

    #[test]
    fn legacy_record_gets_defaults() {
        let meta: RepoMeta = serde_json::from_str(r#"{"private":true}"#).unwrap();
        assert_eq!(meta, RepoMeta::default());

        let meta: RepoMeta = serde_json::from_str("{}").unwrap();
        assert!(meta.private, "missing private must fail closed");
    }

    #[test]
    fn default_record_encoding() {
        let json = serde_json::to_string(&RepoMeta::default()).unwrap();
        assert_eq!(json, r#"{"description":"","private":true,"tags":[]}"#);
    }

    #[test]
    fn private_last_value_wins() {
        let mut meta = RepoMeta::default();
        let changed = meta.apply_push_options(&[opt("private", "true"), opt("private", "false")]);
        assert!(changed);
        assert!(!meta.private);
    }

    #[test]
    fn unparsable_private_is_ignored() {
        let mut meta = RepoMeta {
            private: false,
            ..RepoMeta::default()
        };
        let changed = meta.apply_push_options(&[opt("private", "notabool")]);
        assert!(!changed);
        assert!(!meta.private);
    }

    #[test]
    fn description_aliases() {
        let mut meta = RepoMeta::default();
        assert!(meta.apply_push_options(&[opt("desc", "short")]));
        assert_eq!(meta.description, "short");

        assert!(meta.apply_push_options(&[opt("Description", "")]));
        assert_eq!(meta.description, "");
    }

    #[test]
    fn description_change_is_not_masked_by_later_option() {
        let mut meta = RepoMeta::default();
        let changed = meta.apply_push_options(&[opt("description", "new"), opt("private", "true")]);
        assert!(changed);
    }

    #[test]
    fn tags_add_and_remove() {
        let mut meta = RepoMeta::default();
        meta.apply_push_options(&[opt("tags", "foo,bar")]);
        meta.apply_push_options(&[opt("tags", "-foo,baz")]);
        assert_eq!(meta.tags.to_vec(), vec!["bar", "baz"]);
    }

    #[test]
    fn tags_are_lowercased_but_not_trimmed() {
        let mut meta = RepoMeta::default();
        meta.apply_push_options(&[opt("tags", "Go, Rust")]);
        assert_eq!(meta.tags.to_vec(), vec![" rust", "go"]);
    }

    #[test]
    fn no_options_means_no_change() {
        let mut meta = RepoMeta::default();
        assert!(!meta.apply_push_options(&[]));
        assert!(!meta.apply_push_options(&[opt("ci.skip", "1"), opt("private", "true")]));
    }

    #[test]
    fn update_merges_tags() {
        let mut original = RepoMeta {
            description: "Original description".into(),
            private: true,
            tags: ["tag1", "tag2"].into_iter().collect(),
        };
        original.update(RepoMeta {
            description: "Updated description".into(),
            private: false,
            tags: ["tag3"].into_iter().collect(),
        });

        assert_eq!(original.description, "Updated description");
        assert!(!original.private);
        assert_eq!(original.tags.to_vec(), vec!["tag1", "tag2", "tag3"]);
    }

    #[test]
    fn parse_bool_spellings() {
        for s in ["1", "t", "T", "true", "TRUE", "True"] {
            assert_eq!(parse_bool(s), Some(true), "{s}");
        }
        for s in ["0", "f", "F", "false", "FALSE", "False"] {
            assert_eq!(parse_bool(s), Some(false), "{s}");
        }
        assert_eq!(parse_bool("yes"), None);
        assert_eq!(parse_bool(""), None);
    }
}
