//! Path eligibility and content classification.
//!
//! Every decision about whether a path participates in history capture is
//! made here: which watch group owns it, whether its name passes the
//! group's extension and exclusion filters, and whether its bytes look
//! textual.

use std::collections::HashSet;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use globset::{GlobBuilder, GlobMatcher};
use retrace_config::WatchGroup;

use crate::error::{HistoryError, Result};

/// Number of leading bytes inspected for NUL when classifying content.
const BINARY_CHECK_SIZE: usize = 8192;

/// A watch group with its patterns compiled for matching.
pub struct CompiledGroup {
    group: WatchGroup,
    extensions: Option<HashSet<String>>,
    excludes: Vec<GlobMatcher>,
}

impl CompiledGroup {
    fn new(group: WatchGroup) -> Result<Self> {
        let extensions = group
            .extensions
            .as_ref()
            .map(|exts| exts.iter().cloned().collect::<HashSet<_>>());

        let mut excludes = Vec::new();
        for pattern in group.exclude_patterns() {
            let glob = GlobBuilder::new(&pattern)
                .literal_separator(true)
                .build()
                .map_err(|source| HistoryError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            excludes.push(glob.compile_matcher());
        }

        Ok(Self {
            group,
            extensions,
            excludes,
        })
    }

    pub fn policy(&self) -> &WatchGroup {
        &self.group
    }

    /// True if the path matches any exclusion pattern of this group.
    ///
    /// Besides the absolute path, every suffix of the path split on the OS
    /// separator is tried, so a directory-relative pattern like
    /// `**/dist/**` still matches an absolute path on platforms where the
    /// direct match fails.
    fn is_excluded(&self, path: &Path) -> bool {
        if self.excludes.is_empty() {
            return false;
        }

        let text = path.to_string_lossy();
        let suffixes = path_suffixes(&text);
        for matcher in &self.excludes {
            if matcher.is_match(path) {
                return true;
            }
            if suffixes.iter().any(|sub| matcher.is_match(sub)) {
                return true;
            }
        }
        false
    }

    fn extension_allowed(&self, path: &Path) -> bool {
        let Some(allowed) = &self.extensions else {
            return true;
        };
        if allowed.is_empty() {
            return true;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        allowed.contains(&format!(".{ext}"))
    }
}

/// Every suffix of the path obtained by dropping leading components.
fn path_suffixes(text: &str) -> Vec<PathBuf> {
    let parts: Vec<&str> = text.split(MAIN_SEPARATOR).collect();
    (0..parts.len())
        .map(|i| PathBuf::from(parts[i..].join(std::path::MAIN_SEPARATOR_STR)))
        .collect()
}

/// Pure eligibility decisions over the full set of watch groups.
pub struct PathFilter {
    groups: Vec<CompiledGroup>,
}

impl PathFilter {
    pub fn new(groups: Vec<WatchGroup>) -> Result<Self> {
        let groups = groups
            .into_iter()
            .map(CompiledGroup::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { groups })
    }

    /// The group whose root is the longest prefix of `path`, if any. A
    /// group root matches itself and everything beneath it; when roots
    /// nest across groups, the deepest root wins.
    pub fn group_of(&self, path: &Path) -> Option<&CompiledGroup> {
        let mut best: Option<(&CompiledGroup, usize)> = None;
        for group in &self.groups {
            for dir in &group.group.dirs {
                if !path.starts_with(dir) {
                    continue;
                }
                let len = dir.as_os_str().len();
                if best.map_or(true, |(_, best_len)| len > best_len) {
                    best = Some((group, len));
                }
            }
        }
        best.map(|(group, _)| group)
    }

    /// True iff the path belongs to a group, passes that group's extension
    /// allow-list, and matches none of its exclusion patterns.
    pub fn should_track(&self, path: &Path) -> bool {
        let Some(group) = self.group_of(path) else {
            return false;
        };
        group.extension_allowed(path) && !group.is_excluded(path)
    }

    /// Every root directory across all groups.
    pub fn roots(&self) -> Vec<PathBuf> {
        self.groups
            .iter()
            .flat_map(|g| g.group.dirs.iter().cloned())
            .collect()
    }

    /// Directory-level exclusion for watch registration and bulk scans. A
    /// directory outside every group is excluded.
    pub fn is_excluded_dir(&self, path: &Path) -> bool {
        match self.group_of(path) {
            Some(group) => group.is_excluded(path),
            None => true,
        }
    }
}

/// True if the first 8 KiB contain a NUL byte (the git heuristic). Empty
/// input is not binary.
pub fn looks_binary(data: &[u8]) -> bool {
    let check = &data[..data.len().min(BINARY_CHECK_SIZE)];
    check.contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, dirs: &[&str]) -> WatchGroup {
        WatchGroup {
            name: name.to_string(),
            dirs: dirs.iter().map(PathBuf::from).collect(),
            extensions: None,
            exclude_patterns: None,
            debounce_sec: 2,
            max_file_size: 1_048_576,
            max_snapshots: 0,
        }
    }

    #[test]
    fn binary_detection_boundary() {
        assert!(!looks_binary(b""));
        assert!(!looks_binary(b"hello world"));
        assert!(looks_binary(b"\x89PNG\r\n\x1a\n\x00\x00"));

        // NUL at offset 8191 is within the window, at 8192 just outside.
        let mut data = vec![b'a'; 8193];
        data[8191] = 0;
        assert!(looks_binary(&data));

        let mut data = vec![b'a'; 8193];
        data[8192] = 0;
        assert!(!looks_binary(&data));
    }

    #[test]
    fn longest_prefix_wins() {
        let filter =
            PathFilter::new(vec![group("parent", &["/r"]), group("child", &["/r/sub"])]).unwrap();

        let owner = filter.group_of(Path::new("/r/p.txt")).unwrap();
        assert_eq!(owner.policy().name, "parent");

        let owner = filter.group_of(Path::new("/r/sub/c.txt")).unwrap();
        assert_eq!(owner.policy().name, "child");

        assert!(filter.group_of(Path::new("/elsewhere/x.txt")).is_none());
    }

    #[test]
    fn root_prefix_is_component_wise() {
        let filter = PathFilter::new(vec![group("p", &["/p"])]).unwrap();
        assert!(filter.group_of(Path::new("/p/file.txt")).is_some());
        assert!(filter.group_of(Path::new("/projects/file.txt")).is_none());
    }

    #[test]
    fn extension_allow_list() {
        let mut g = group("main", &["/w"]);
        g.extensions = Some(vec![".rs".to_string(), ".md".to_string()]);
        let filter = PathFilter::new(vec![g]).unwrap();

        assert!(filter.should_track(Path::new("/w/lib.rs")));
        assert!(filter.should_track(Path::new("/w/doc.md")));
        assert!(!filter.should_track(Path::new("/w/image.png")));
        assert!(!filter.should_track(Path::new("/w/Makefile")));
    }

    #[test]
    fn default_excludes_match_anywhere() {
        let filter = PathFilter::new(vec![group("main", &["/w"])]).unwrap();

        assert!(!filter.should_track(Path::new("/w/proj/node_modules/pkg/index.js")));
        assert!(!filter.should_track(Path::new("/w/proj/.git/HEAD")));
        assert!(!filter.should_track(Path::new("/w/app.min.js")));
        assert!(!filter.should_track(Path::new("/w/Cargo.lock")));
        assert!(filter.should_track(Path::new("/w/proj/src/main.rs")));
    }

    #[test]
    fn suffix_fallback_matches_relative_patterns() {
        let mut g = group("main", &["/w"]);
        g.exclude_patterns = Some(vec!["dist/**".to_string()]);
        let filter = PathFilter::new(vec![g]).unwrap();

        // The absolute path does not match `dist/**` directly, but the
        // suffix `dist/bundle.js` does.
        assert!(!filter.should_track(Path::new("/w/dist/bundle.js")));
        assert!(filter.should_track(Path::new("/w/src/bundle.js")));
    }

    #[test]
    fn directories_outside_groups_are_excluded() {
        let filter = PathFilter::new(vec![group("main", &["/w"])]).unwrap();

        assert!(!filter.is_excluded_dir(Path::new("/w/src")));
        assert!(filter.is_excluded_dir(Path::new("/w/proj/node_modules")));
        assert!(filter.is_excluded_dir(Path::new("/other")));
    }
}
