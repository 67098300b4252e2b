//! Client-side path filtering
//!
//! [`PathFilter::classify`] is the single predicate both the delta
//! processor (before deciding to download) and the local scanner (before
//! deciding to upload) consult. Evaluation order, first match wins:
//!
//! 1. no local file and no remote metadata → excluded ("missing")
//! 2. `.nosync` marker in an ancestor directory (when enabled)
//! 3. dotfile rule
//! 4. symlink rules
//! 5. `skip_file` / `skip_dir` glob sets (basename and root-relative path)
//! 6. the ordered `sync_list`
//! 7. size cap

pub mod sync_list;

use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::debug;

use onesync_core::config::EngineConfig;
use onesync_core::domain::errors::EngineError;

pub use sync_list::{SyncList, SyncListError, SyncListVerdict};

// ============================================================================
// Inputs and outputs
// ============================================================================

/// What the caller knows about the path being classified
///
/// Either side of the sync can ask: the delta processor fills this from the
/// remote item, the scanner from `lstat`.
#[derive(Debug, Clone, Default)]
pub struct PathMeta {
    /// The path names a directory
    pub is_directory: bool,
    /// The local path is a symlink
    pub is_symlink: bool,
    /// The symlink is relative and its target exists (only meaningful with
    /// `is_symlink`)
    pub symlink_valid: bool,
    /// File size, when known
    pub size: Option<u64>,
    /// The path exists on the local filesystem
    pub exists_locally: bool,
    /// Remote metadata exists for the path
    pub has_remote: bool,
}

/// Verdict of the filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// Synchronize the path
    Include,
    /// Excluded by configuration (dotfiles, symlinks, skip globs, missing)
    ExcludeByConfig(String),
    /// Excluded by the ordered sync_list
    ExcludeBySyncList,
    /// Excluded by the size cap
    ExcludeBySize,
    /// Excluded by a `.nosync` marker in an ancestor directory
    ExcludeByMarker,
}

impl FilterDecision {
    /// Returns true when the path should be synchronized
    pub fn is_include(&self) -> bool {
        matches!(self, FilterDecision::Include)
    }
}

// ============================================================================
// PathFilter
// ============================================================================

/// Compiled filter over one sync root
pub struct PathFilter {
    sync_root: PathBuf,
    skip_file: GlobSet,
    skip_dir: GlobSet,
    sync_list: SyncList,
    skip_dotfiles: bool,
    skip_symlinks: bool,
    check_nosync: bool,
    skip_size: Option<u64>,
}

impl PathFilter {
    /// Compile the filter from the engine configuration
    ///
    /// # Errors
    /// `ConfigInvalid` when a glob or sync_list rule fails to compile.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let skip_file = compile_globs(&config.skip_file, config.case_insensitive_globs)
            .map_err(|e| EngineError::ConfigInvalid(format!("skip_file: {e}")))?;
        let skip_dir = compile_globs(&config.skip_dir, config.case_insensitive_globs)
            .map_err(|e| EngineError::ConfigInvalid(format!("skip_dir: {e}")))?;
        let sync_list = SyncList::compile(&config.sync_list)
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;

        Ok(Self {
            sync_root: config.sync_dir.clone(),
            skip_file,
            skip_dir,
            sync_list,
            skip_dotfiles: config.skip_dotfiles,
            skip_symlinks: config.skip_symlinks,
            check_nosync: config.check_nosync,
            skip_size: config.skip_size,
        })
    }

    /// Classify a root-relative path
    ///
    /// `rel_path` uses forward slashes and a leading `/` (e.g. `/A/b.txt`).
    pub fn classify(&self, rel_path: &str, meta: &PathMeta) -> FilterDecision {
        // 1. Nothing on either side: nothing to synchronize
        if !meta.exists_locally && !meta.has_remote {
            return FilterDecision::ExcludeByConfig("missing".to_string());
        }

        // 2. .nosync marker in any ancestor
        if self.check_nosync && self.ancestor_has_nosync(rel_path) {
            return FilterDecision::ExcludeByMarker;
        }

        let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);

        // 3. Dotfiles
        if self.skip_dotfiles && basename.starts_with('.') {
            return FilterDecision::ExcludeByConfig("dotfile".to_string());
        }

        // 4. Symlinks
        if meta.is_symlink {
            if self.skip_symlinks {
                return FilterDecision::ExcludeByConfig("symlink".to_string());
            }
            if !meta.symlink_valid {
                return FilterDecision::ExcludeByConfig("broken symlink".to_string());
            }
        }

        // 5. Configured skip globs, against basename and relative path
        let trimmed = rel_path.trim_start_matches('/');
        if meta.is_directory {
            if self.skip_dir.is_match(basename) || self.skip_dir.is_match(trimmed) {
                return FilterDecision::ExcludeByConfig("skip_dir".to_string());
            }
        } else if self.skip_file.is_match(basename) || self.skip_file.is_match(trimmed) {
            return FilterDecision::ExcludeByConfig("skip_file".to_string());
        }

        // 6. sync_list
        if self.sync_list.evaluate(rel_path, meta.is_directory) == SyncListVerdict::Exclude {
            return FilterDecision::ExcludeBySyncList;
        }

        // 7. Size cap (files only)
        if !meta.is_directory {
            if let (Some(cap), Some(size)) = (self.skip_size, meta.size) {
                if size > cap {
                    return FilterDecision::ExcludeBySize;
                }
            }
        }

        FilterDecision::Include
    }

    /// Walk the ancestor chain looking for `.nosync` markers
    fn ancestor_has_nosync(&self, rel_path: &str) -> bool {
        let mut dir = self.sync_root.clone();
        if dir.join(".nosync").exists() {
            return true;
        }

        let rel = Path::new(rel_path.trim_start_matches('/'));
        let mut components: Vec<_> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(n) => Some(n),
                _ => None,
            })
            .collect();
        // The final component is the item itself, not an ancestor
        components.pop();

        for component in components {
            dir.push(component);
            if dir.join(".nosync").exists() {
                debug!(dir = %dir.display(), "Found .nosync marker");
                return true;
            }
        }
        false
    }
}

/// Compile a glob list into one matcher set
fn compile_globs(patterns: &[String], case_insensitive: bool) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .literal_separator(false)
            .build()?;
        builder.add(glob);
    }
    builder.build()
}
