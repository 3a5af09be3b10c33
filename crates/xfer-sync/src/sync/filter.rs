//! Include / exclude filtering on relative, `/`-separated paths.
//!
//! A pattern matches when it matches either the whole relative path or the
//! base name. An excluded directory drops its whole subtree. Include
//! patterns only constrain files, so directories are always traversed.

use glob::{MatchOptions, Pattern};
use xfer_core::{XfrError, XfrResult};

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

const OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

fn compile(patterns: &[String]) -> XfrResult<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| XfrError::protocol(format!("invalid pattern '{}': {}", p, e)))
        })
        .collect()
}

impl PathFilter {
    pub fn new(include: &[String], exclude: &[String]) -> XfrResult<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    fn hits(patterns: &[Pattern], rel_path: &str) -> bool {
        let base = rel_path.rsplit('/').next().unwrap_or(rel_path);
        patterns
            .iter()
            .any(|p| p.matches_with(rel_path, OPTIONS) || p.matches_with(base, OPTIONS))
    }

    /// Whether `rel_path` or one of its ancestors is excluded.
    pub fn excluded(&self, rel_path: &str) -> bool {
        if self.exclude.is_empty() {
            return false;
        }
        let ancestor_hit = rel_path
            .match_indices('/')
            .any(|(i, _)| Self::hits(&self.exclude, &rel_path[..i]));
        ancestor_hit || Self::hits(&self.exclude, rel_path)
    }

    /// Whether an entry takes part in the sync.
    pub fn allows(&self, rel_path: &str, is_dir: bool) -> bool {
        if self.excluded(rel_path) {
            return false;
        }
        is_dir || self.include.is_empty() || Self::hits(&self.include, rel_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str]) -> PathFilter {
        let inc: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exc: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        PathFilter::new(&inc, &exc).unwrap()
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let f = PathFilter::default();
        assert!(f.allows("a/b/c.txt", false));
        assert!(f.allows("a", true));
    }

    #[test]
    fn test_exclude_matches_base_name_and_subtree() {
        let f = filter(&[], &["*.tmp", "node_modules"]);
        assert!(!f.allows("x/y/file.tmp", false));
        assert!(!f.allows("node_modules", true));
        assert!(!f.allows("node_modules/pkg/index.js", false));
        assert!(f.allows("src/main.rs", false));
    }

    #[test]
    fn test_include_constrains_files_only() {
        let f = filter(&["*.txt"], &[]);
        assert!(f.allows("docs", true));
        assert!(f.allows("docs/readme.txt", false));
        assert!(!f.allows("docs/logo.png", false));
    }

    #[test]
    fn test_relative_path_patterns() {
        let f = filter(&["docs/*"], &["docs/private*"]);
        assert!(f.allows("docs/a.md", false));
        assert!(!f.allows("docs/private.md", false));
        assert!(!f.allows("other/a.md", false));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = PathFilter::new(&["[".to_string()], &[]).unwrap_err();
        assert!(err.message.contains("invalid pattern"));
    }
}
