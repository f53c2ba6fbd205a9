//! Name filter globs for fsnotify
//! Extracted to a separate crate for compilation optimization

use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

pub use globset::Error as FilterError;

/// Pattern that matches every entry, including names without an extension
pub const MATCH_ALL: &str = "*.*";

/// Compiled name filter applied to the final component of a path
#[derive(Debug, Clone)]
pub struct NameFilter {
    pattern: String,
    matcher: Option<GlobMatcher>,
}

impl NameFilter {
    /// Compile a filter pattern
    ///
    /// `""`, `"*"` and `"*.*"` all mean "every name"; anything else is a glob
    /// matched against the file name only (`*` never crosses a separator).
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        let pattern = pattern.trim();
        if is_match_all(pattern) {
            return Ok(Self { pattern: normalize(pattern), matcher: None });
        }

        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .case_insensitive(cfg!(windows))
            .build()?;

        Ok(Self { pattern: pattern.to_string(), matcher: Some(glob.compile_matcher()) })
    }

    /// Filter accepting every name
    pub fn all() -> Self {
        Self { pattern: MATCH_ALL.to_string(), matcher: None }
    }

    /// The pattern as given (normalized to `*.*` for match-all spellings)
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether this filter accepts everything
    pub fn matches_all(&self) -> bool {
        self.matcher.is_none()
    }

    /// Check a bare entry name
    pub fn is_match(&self, name: &str) -> bool {
        match &self.matcher {
            None => true,
            Some(matcher) => matcher.is_match(name),
        }
    }

    /// Check the final component of a path; paths without one never match
    /// unless the filter matches everything
    pub fn matches_path(&self, path: &Path) -> bool {
        if self.matcher.is_none() {
            return true;
        }
        path.file_name().map(|name| self.is_match(&name.to_string_lossy())).unwrap_or(false)
    }
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl PartialEq for NameFilter {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for NameFilter {}

fn is_match_all(pattern: &str) -> bool {
    matches!(pattern, "" | "*" | MATCH_ALL)
}

fn normalize(pattern: &str) -> String {
    if is_match_all(pattern) { MATCH_ALL.to_string() } else { pattern.to_string() }
}
