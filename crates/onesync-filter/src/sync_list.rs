//! Ordered `+`/`-` selection rules
//!
//! A sync list is an ordered set of rules like:
//!
//! ```text
//! +/Documents/Work/
//! +*.ods
//! -/Archive/
//! -*
//! ```
//!
//! Evaluation is first-match-wins against the path relative to the sync
//! root. Anchored patterns (leading `/`) match from the root; unanchored
//! patterns match the basename or any single path component. A trailing `/`
//! restricts a rule to directories. When no rule matches, the default is
//! include unless the list contains at least one `+` rule (a positive list
//! is a whitelist).
//!
//! Directories additionally match an anchored `+` rule when they are an
//! ancestor of its literal prefix, so the parents of an included subtree
//! are materialized.

use globset::GlobMatcher;
use thiserror::Error;

/// A malformed sync-list rule
#[derive(Debug, Error)]
pub enum SyncListError {
    /// Rules must start with `+` or `-`
    #[error("sync_list rule must start with '+' or '-': {0}")]
    MissingSign(String),

    /// The pattern is empty after the sign
    #[error("sync_list rule has an empty pattern: {0}")]
    EmptyPattern(String),

    /// The glob failed to compile
    #[error("sync_list rule has an invalid glob: {0}")]
    BadGlob(String),
}

/// Verdict of a sync-list evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncListVerdict {
    /// A `+` rule matched, or the unmatched default is include
    Include,
    /// A `-` rule matched, or the unmatched default is exclude
    Exclude,
}

#[derive(Debug)]
struct Rule {
    include: bool,
    anchored: bool,
    dir_only: bool,
    /// The rule text after sign and trailing-slash stripping
    pattern: String,
    /// Literal prefix up to the first wildcard (ancestor admission)
    literal_prefix: String,
    matcher: GlobMatcher,
}

/// A compiled, ordered sync list
#[derive(Debug)]
pub struct SyncList {
    rules: Vec<Rule>,
    has_includes: bool,
}

impl SyncList {
    /// Compile an ordered rule list
    pub fn compile(rules: &[String]) -> Result<Self, SyncListError> {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut has_includes = false;

        for raw in rules {
            let (include, rest) = match raw.strip_prefix('+') {
                Some(rest) => (true, rest),
                None => match raw.strip_prefix('-') {
                    Some(rest) => (false, rest),
                    None => return Err(SyncListError::MissingSign(raw.clone())),
                },
            };

            let dir_only = rest.ends_with('/') && rest.len() > 1;
            let trimmed = rest.trim_end_matches('/');
            let anchored = trimmed.starts_with('/');
            let pattern = trimmed.to_string();

            if pattern.is_empty() || pattern == "/" {
                return Err(SyncListError::EmptyPattern(raw.clone()));
            }

            let literal_prefix = pattern
                .split(['*', '?', '['])
                .next()
                .unwrap_or("")
                .to_string();

            // literal_separator keeps `*` from crossing directory
            // boundaries in anchored patterns
            let matcher = globset::GlobBuilder::new(&pattern)
                .literal_separator(true)
                .build()
                .map_err(|_| SyncListError::BadGlob(raw.clone()))?
                .compile_matcher();

            if include {
                has_includes = true;
            }
            compiled.push(Rule {
                include,
                anchored,
                dir_only,
                pattern,
                literal_prefix,
                matcher,
            });
        }

        Ok(Self {
            rules: compiled,
            has_includes,
        })
    }

    /// Returns true when the list has no rules at all
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate a root-relative path (leading `/`, forward slashes)
    ///
    /// `is_directory` enables dir-only rules and ancestor admission.
    pub fn evaluate(&self, rel_path: &str, is_directory: bool) -> SyncListVerdict {
        if self.rules.is_empty() {
            return SyncListVerdict::Include;
        }

        for rule in &self.rules {
            if rule.matches(rel_path, is_directory) {
                return if rule.include {
                    SyncListVerdict::Include
                } else {
                    SyncListVerdict::Exclude
                };
            }
        }

        // A list with any + rule is a whitelist; pure minus-lists default in
        if self.has_includes {
            SyncListVerdict::Exclude
        } else {
            SyncListVerdict::Include
        }
    }
}

impl Rule {
    fn matches(&self, rel_path: &str, is_directory: bool) -> bool {
        if self.anchored {
            // Containment in the named subtree covers the path itself and
            // everything below it; the named path itself must honor dir_only.
            if self.subtree_matches(rel_path) {
                if self.dir_only && rel_path == self.pattern && !is_directory {
                    return false;
                }
                return true;
            }
            if self.matcher.is_match(rel_path) && (!self.dir_only || is_directory) {
                return true;
            }
            // A directory on the way down to an included subtree is admitted
            if self.include && is_directory && self.is_ancestor_of_prefix(rel_path) {
                return true;
            }
            false
        } else {
            // Unanchored: match the basename or any single path component.
            // A dir-only rule matches non-final components (the path is then
            // inside the directory) or a final component that is a directory.
            let trimmed = rel_path.trim_start_matches('/');
            let count = trimmed.split('/').count();
            trimmed.split('/').enumerate().any(|(i, component)| {
                self.matcher.is_match(component)
                    && (!self.dir_only || i + 1 < count || is_directory)
            })
        }
    }

    /// True when `rel_path` lies inside the subtree this (anchored) rule names
    fn subtree_matches(&self, rel_path: &str) -> bool {
        if !self.anchored {
            return false;
        }
        if let Some(rest) = rel_path.strip_prefix(&self.pattern) {
            return rest.is_empty() || rest.starts_with('/');
        }
        false
    }

    /// True when `rel_path` is a strict ancestor of the rule's literal prefix
    fn is_ancestor_of_prefix(&self, rel_path: &str) -> bool {
        if self.literal_prefix.is_empty() {
            return false;
        }
        if let Some(rest) = self.literal_prefix.strip_prefix(rel_path) {
            return !rest.is_empty() && (rest.starts_with('/') || rel_path.ends_with('/'));
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(rules: &[&str]) -> SyncList {
        SyncList::compile(&rules.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_empty_list_includes_everything() {
        let l = list(&[]);
        assert_eq!(l.evaluate("/anything", false), SyncListVerdict::Include);
        assert!(l.is_empty());
    }

    #[test]
    fn test_rules_require_sign() {
        let result = SyncList::compile(&["Documents".to_string()]);
        assert!(matches!(result, Err(SyncListError::MissingSign(_))));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(SyncList::compile(&["+".to_string()]).is_err());
        assert!(SyncList::compile(&["-/".to_string()]).is_err());
    }

    #[test]
    fn test_whitelist_semantics() {
        // The spec scenario: +/A/ then -* keeps only /A
        let l = list(&["+/A/", "-*"]);

        assert_eq!(l.evaluate("/A", true), SyncListVerdict::Include);
        assert_eq!(l.evaluate("/A/x", false), SyncListVerdict::Include);
        assert_eq!(l.evaluate("/A/sub/deep.txt", false), SyncListVerdict::Include);
        assert_eq!(l.evaluate("/B", true), SyncListVerdict::Exclude);
        assert_eq!(l.evaluate("/B/y", false), SyncListVerdict::Exclude);
    }

    #[test]
    fn test_positive_list_defaults_to_exclude() {
        let l = list(&["+/Work/"]);
        assert_eq!(l.evaluate("/Other/file", false), SyncListVerdict::Exclude);
        assert_eq!(l.evaluate("/Work/file", false), SyncListVerdict::Include);
    }

    #[test]
    fn test_minus_only_list_defaults_to_include() {
        let l = list(&["-/Archive/"]);
        assert_eq!(l.evaluate("/Archive/old", false), SyncListVerdict::Exclude);
        assert_eq!(l.evaluate("/Docs/new", false), SyncListVerdict::Include);
    }

    #[test]
    fn test_first_match_wins() {
        let l = list(&["-/Work/secret.txt", "+/Work/", "-*"]);
        assert_eq!(
            l.evaluate("/Work/secret.txt", false),
            SyncListVerdict::Exclude
        );
        assert_eq!(l.evaluate("/Work/ok.txt", false), SyncListVerdict::Include);
    }

    #[test]
    fn test_unanchored_matches_any_component() {
        let l = list(&["-node_modules/", "-*.tmp"]);
        assert_eq!(
            l.evaluate("/proj/node_modules", true),
            SyncListVerdict::Exclude
        );
        assert_eq!(l.evaluate("/deep/a/b.tmp", false), SyncListVerdict::Exclude);
        assert_eq!(l.evaluate("/deep/a/b.txt", false), SyncListVerdict::Include);
    }

    #[test]
    fn test_trailing_slash_restricts_to_directories() {
        let l = list(&["-build/"]);
        assert_eq!(l.evaluate("/x/build", true), SyncListVerdict::Exclude);
        // A plain file named "build" is not a directory
        assert_eq!(l.evaluate("/x/build", false), SyncListVerdict::Include);
    }

    #[test]
    fn test_ancestor_directories_of_included_subtree_admitted() {
        let l = list(&["+/Docs/Projects/Active/", "-*"]);
        // Every directory on the way down is admitted
        assert_eq!(l.evaluate("/Docs", true), SyncListVerdict::Include);
        assert_eq!(l.evaluate("/Docs/Projects", true), SyncListVerdict::Include);
        assert_eq!(
            l.evaluate("/Docs/Projects/Active", true),
            SyncListVerdict::Include
        );
        assert_eq!(
            l.evaluate("/Docs/Projects/Active/report.md", false),
            SyncListVerdict::Include
        );
        // Siblings are not
        assert_eq!(l.evaluate("/Docs/Other", true), SyncListVerdict::Exclude);
        // Files at ancestor level are not admitted by ancestry
        assert_eq!(l.evaluate("/Docs/stray.txt", false), SyncListVerdict::Exclude);
    }

    #[test]
    fn test_anchored_glob() {
        let l = list(&["+/Music/*.flac", "-*"]);
        assert_eq!(l.evaluate("/Music/song.flac", false), SyncListVerdict::Include);
        assert_eq!(l.evaluate("/Music/song.mp3", false), SyncListVerdict::Exclude);
    }

    #[test]
    fn test_unanchored_extension_include() {
        let l = list(&["+*.ods", "-*"]);
        assert_eq!(l.evaluate("/a/b/sheet.ods", false), SyncListVerdict::Include);
        assert_eq!(l.evaluate("/a/b/sheet.odt", false), SyncListVerdict::Exclude);
    }

    #[test]
    fn test_dir_rule_covers_contents() {
        let l = list(&["-node_modules/"]);
        // Files inside a matching directory are excluded with it
        assert_eq!(
            l.evaluate("/proj/node_modules/lib/index.js", false),
            SyncListVerdict::Exclude
        );
    }

    #[test]
    fn test_no_false_prefix_match() {
        // "/A" must not admit "/AB"
        let l = list(&["+/A/", "-*"]);
        assert_eq!(l.evaluate("/AB", true), SyncListVerdict::Exclude);
        assert_eq!(l.evaluate("/AB/x", false), SyncListVerdict::Exclude);
    }
}
