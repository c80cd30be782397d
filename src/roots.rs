// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::path;

/// Files and sub-trees directly under one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntries {
    pub files: BTreeSet<String>,
    pub trees: BTreeSet<String>,
}

/// Read access to the content tree of one repository.
///
/// Paths are repository-relative, `/`-separated, and already normalized by
/// the caller; `"."` denotes the root directory itself.
pub trait FileRoot: Send + Sync {
    fn is_file(&self, path: &str) -> bool;
    fn is_tree(&self, path: &str) -> bool;
    fn read_file(&self, path: &str) -> Option<Vec<u8>>;
    fn list(&self, path: &str) -> Option<DirectoryEntries>;
}

/// A file root backed by a directory on disk.
#[derive(Debug)]
pub struct FsRoot {
    base: PathBuf,
}

impl FsRoot {
    pub fn new(base: impl Into<PathBuf>) -> FsRoot {
        FsRoot { base: base.into() }
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        if rel == "." {
            self.base.clone()
        } else {
            self.base.join(rel)
        }
    }
}

impl FileRoot for FsRoot {
    fn is_file(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn is_tree(&self, path: &str) -> bool {
        self.resolve(path).is_dir()
    }

    fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.resolve(path)).ok()
    }

    fn list(&self, path: &str) -> Option<DirectoryEntries> {
        let mut entries = DirectoryEntries::default();
        for entry in std::fs::read_dir(self.resolve(path)).ok()? {
            let entry = entry.ok()?;
            let name = entry.file_name().to_string_lossy().to_string();
            let kind = entry.file_type().ok()?;
            if kind.is_dir() {
                entries.trees.insert(name);
            } else if kind.is_file() {
                entries.files.insert(name);
            }
        }
        Some(entries)
    }
}

/// An in-memory file root, primarily for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRoot {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryRoot {
    pub fn new() -> MemoryRoot {
        MemoryRoot::default()
    }

    pub fn add_file(mut self, path: &str, content: impl Into<Vec<u8>>) -> MemoryRoot {
        self.files.insert(path::normalize(path), content.into());
        self
    }

    fn dir_prefix(path: &str) -> String {
        if path == "." {
            String::new()
        } else {
            format!("{path}/")
        }
    }
}

impl FileRoot for MemoryRoot {
    fn is_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn is_tree(&self, path: &str) -> bool {
        let prefix = Self::dir_prefix(path);
        path == "."
            || self
                .files
                .range(prefix.clone()..)
                .next()
                .is_some_and(|(p, _)| p.starts_with(&prefix))
    }

    fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).cloned()
    }

    fn list(&self, path: &str) -> Option<DirectoryEntries> {
        if !self.is_tree(path) {
            return None;
        }
        let prefix = Self::dir_prefix(path);
        let mut entries = DirectoryEntries::default();
        for (p, _) in self.files.range(prefix.clone()..) {
            let Some(rest) = p.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    entries.trees.insert(dir.to_string());
                }
                None => {
                    entries.files.insert(rest.to_string());
                }
            }
        }
        Some(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_root_lists_direct_entries() {
        let root = MemoryRoot::new()
            .add_file("m/a.c", "a")
            .add_file("m/sub/b.c", "b")
            .add_file("top.txt", "t");
        let entries = root.list("m").unwrap();
        assert!(entries.files.contains("a.c"));
        assert!(entries.trees.contains("sub"));
        assert!(!entries.files.contains("b.c"));
        let top = root.list(".").unwrap();
        assert!(top.files.contains("top.txt"));
        assert!(top.trees.contains("m"));
    }

    #[test]
    fn memory_root_distinguishes_files_and_trees() {
        let root = MemoryRoot::new().add_file("m/a.c", "a");
        assert!(root.is_file("m/a.c"));
        assert!(!root.is_tree("m/a.c"));
        assert!(root.is_tree("m"));
        assert!(!root.is_file("m"));
    }
}
