// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lexical path manipulation shared between the file maps and the staging
//! primitives. All paths are repository-relative, `/`-separated strings.

use std::collections::BTreeMap;

/// Lexically normalize a path: resolve `.` and `..` segments and drop
/// duplicate separators. `..` segments that would escape the root are kept
/// at the front so callers can detect them.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(&s) if s != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

/// True if the normalized path points outside the repository root.
pub fn escapes_root(normalized: &str) -> bool {
    normalized == ".." || normalized.starts_with("../")
}

/// Join a module directory and a relative path, normalizing the result.
pub fn join(base: &str, rel: &str) -> String {
    if base == "." || base.is_empty() {
        normalize(rel)
    } else {
        normalize(&format!("{base}/{rel}"))
    }
}

/// Find a tree conflict in a staging map: two paths where one is a strict
/// `/`-boundary prefix of the other, which would collide on disk. Returns
/// the offending prefix path.
pub fn tree_conflict<V>(stage: &BTreeMap<String, V>) -> Option<String> {
    for path in stage.keys() {
        let mut idx = 0;
        while let Some(pos) = path[idx..].find('/') {
            let prefix = &path[..idx + pos];
            if !prefix.is_empty() && stage.contains_key(prefix) {
                return Some(prefix.to_string());
            }
            idx += pos + 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_resolves_dots() {
        assert_eq!(normalize("a/./b/../c"), "a/c");
        assert_eq!(normalize("./a//b/"), "a/b");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("a/.."), ".");
    }

    #[test]
    fn escape_detection() {
        assert!(escapes_root(&normalize("../x")));
        assert!(escapes_root(&normalize("a/../../x")));
        assert!(!escapes_root(&normalize("a/../x")));
    }

    #[test]
    fn conflicts_are_boundary_aware() {
        let mut stage = BTreeMap::new();
        stage.insert("foo".to_string(), ());
        stage.insert("foobar".to_string(), ());
        assert_eq!(tree_conflict(&stage), None);
        stage.insert("foo/bar".to_string(), ());
        assert_eq!(tree_conflict(&stage), Some("foo".to_string()));
    }
}
