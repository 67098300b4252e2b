//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers and paths the engine passes
//! around. Each newtype validates at construction time so the rest of the
//! code can assume well-formed values.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// Graph identifiers
// ============================================================================

/// Identifier of a OneDrive drive (personal drive, business drive, or
/// SharePoint document library)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DriveId(String);

impl DriveId {
    /// Create a new DriveId
    ///
    /// # Errors
    /// Returns an error if the identifier is empty or contains characters
    /// outside the Graph identifier alphabet.
    pub fn new(id: String) -> Result<Self, DomainError> {
        validate_graph_id(&id, "drive id")?;
        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a DriveItem within a drive
///
/// Format: alphanumeric string assigned by the service, typically like
/// `01BYE5RZ6QN3ZWBTUFOFD3GSPGOHDJD36K`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Create a new ItemId
    ///
    /// # Errors
    /// Returns an error if the identifier is empty or malformed.
    pub fn new(id: String) -> Result<Self, DomainError> {
        validate_graph_id(&id, "item id")?;
        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Graph identifiers are alphanumeric with a small set of punctuation
fn validate_graph_id(id: &str, what: &str) -> Result<(), DomainError> {
    if id.is_empty() {
        return Err(DomainError::InvalidId(format!("{what} cannot be empty")));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '!' | '-' | '_' | '.' | '%'))
    {
        return Err(DomainError::InvalidId(format!(
            "{what} contains invalid characters: {id}"
        )));
    }
    Ok(())
}

// ============================================================================
// Delta link
// ============================================================================

/// Opaque resumption token for the change feed
///
/// The full `@odata.deltaLink` URL returned on the final page of a delta
/// query. Presenting it returns changes made after that point. Its presence
/// in persistent state means "the database reflects the remote state up to
/// this link".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeltaLink(String);

impl DeltaLink {
    /// Create a new DeltaLink
    ///
    /// # Errors
    /// Returns an error if the link is empty. The content is otherwise
    /// opaque and not interpreted.
    pub fn new(link: String) -> Result<Self, DomainError> {
        if link.trim().is_empty() {
            return Err(DomainError::InvalidDeltaLink(
                "delta link cannot be empty".to_string(),
            ));
        }
        Ok(Self(link))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Paths
// ============================================================================

/// A validated absolute path within (or at) the local sync root
///
/// Guarantees the path is absolute and normalized (no `.` / `..`
/// components). Traversal via `join` is rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct SyncPath(PathBuf);

impl SyncPath {
    /// Create a new SyncPath, validating it is absolute and normalized
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is relative or
    /// escapes the root through `..`.
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "path must be absolute: {}",
                path.display()
            )));
        }
        Ok(Self(Self::normalize(&path)?))
    }

    /// Create a SyncPath validated to lie within `root`
    ///
    /// # Errors
    /// Returns an error if the path is not within the root.
    pub fn new_within_root(path: PathBuf, root: &SyncPath) -> Result<Self, DomainError> {
        let p = Self::new(path)?;
        if !p.0.starts_with(&root.0) {
            return Err(DomainError::PathNotInSyncRoot(format!(
                "{} is not within {}",
                p.0.display(),
                root.0.display()
            )));
        }
        Ok(p)
    }

    /// Get the inner path reference
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Convert into an owned PathBuf
    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// The final component, if any
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }

    /// Join a single path component, rejecting traversal
    ///
    /// # Errors
    /// Returns an error if the component contains `/`, `..`, or is empty.
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.is_empty() || component.contains('/') || component == ".." {
            return Err(DomainError::InvalidPath(format!(
                "invalid path component: {component}"
            )));
        }
        Self::new(self.0.join(component))
    }

    /// The path relative to `root`
    ///
    /// # Errors
    /// Returns an error if this path is not within `root`.
    pub fn relative_to(&self, root: &SyncPath) -> Result<PathBuf, DomainError> {
        self.0
            .strip_prefix(&root.0)
            .map(Path::to_path_buf)
            .map_err(|_| {
                DomainError::PathNotInSyncRoot(format!(
                    "{} is not within {}",
                    self.0.display(),
                    root.0.display()
                ))
            })
    }

    /// Resolve `.` and `..` without touching the filesystem
    fn normalize(path: &Path) -> Result<PathBuf, DomainError> {
        use std::path::Component;

        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Prefix(p) => normalized.push(p.as_os_str()),
                Component::RootDir => normalized.push("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(DomainError::InvalidPath(
                            "path escapes root via ..".to_string(),
                        ));
                    }
                }
                Component::Normal(c) => normalized.push(c),
            }
        }
        Ok(normalized)
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for SyncPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<SyncPath> for PathBuf {
    fn from(p: SyncPath) -> Self {
        p.0
    }
}

impl AsRef<Path> for SyncPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// A remote path within a drive, rooted at `/`
///
/// Represents drive-relative paths such as `/Documents/report.pdf`. The
/// empty-name root is spelled `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    /// Create a new RemotePath
    ///
    /// # Errors
    /// Returns an error if the path does not start with `/`, contains
    /// doubled slashes, or traverses with `..`.
    pub fn new(path: String) -> Result<Self, DomainError> {
        if !path.starts_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "remote path must start with '/': {path}"
            )));
        }
        if path.len() > 1 && path.contains("//") {
            return Err(DomainError::InvalidRemotePath(format!(
                "remote path contains doubled slashes: {path}"
            )));
        }
        if path.split('/').any(|seg| seg == "..") {
            return Err(DomainError::InvalidRemotePath(format!(
                "remote path contains traversal: {path}"
            )));
        }
        Ok(Self(path))
    }

    /// The drive root `/`
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join a single component
    ///
    /// # Errors
    /// Returns an error if the component is empty or contains `/` or `..`.
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.is_empty() || component.contains('/') || component == ".." {
            return Err(DomainError::InvalidRemotePath(format!(
                "invalid path component: {component}"
            )));
        }
        let joined = if self.0 == "/" {
            format!("/{component}")
        } else {
            format!("{}/{component}", self.0)
        };
        Self::new(joined)
    }

    /// The parent path, or `None` for the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0 == "/" {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// The final component, or `None` for the root
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.0 == "/" {
            return None;
        }
        self.0.rsplit('/').next()
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemotePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

// Shared string-bridge boilerplate for the string-backed newtypes
macro_rules! string_bridge {
    ($ty:ident) => {
        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $ty {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s.to_string())
            }
        }

        impl TryFrom<String> for $ty {
            type Error = DomainError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::new(s)
            }
        }

        impl From<$ty> for String {
            fn from(v: $ty) -> Self {
                v.0
            }
        }
    };
}

string_bridge!(DriveId);
string_bridge!(ItemId);
string_bridge!(DeltaLink);

impl TryFrom<String> for RemotePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemotePath> for String {
    fn from(p: RemotePath) -> Self {
        p.0
    }
}
