//! Working directory resolution for new sessions.

use std::path::{Path, PathBuf};

use crate::session::SessionError;

/// Turns the `cwd` a client asked for into the directory a shell starts in.
pub trait DirectoryResolver: Send + Sync {
    /// Resolve the requested directory, or the default when `None`.
    fn resolve(&self, requested: Option<&str>) -> Result<PathBuf, SessionError>;
}

/// Expands `~`, anchors relative paths at a default directory and requires
/// the result to be an existing directory.
#[derive(Debug, Clone)]
pub struct DefaultDirectoryResolver {
    default_dir: PathBuf,
}

impl DefaultDirectoryResolver {
    /// Resolver whose default is `default_dir`.
    pub fn new(default_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: default_dir.into(),
        }
    }

    /// Resolver built from the configured default; an empty value means the
    /// process's current directory.
    pub fn from_configured(configured: &str) -> Self {
        if configured.trim().is_empty() {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            Self::new(cwd)
        } else {
            Self::new(expand_tilde(configured))
        }
    }

    /// Directory used when the client does not send one.
    pub fn default_dir(&self) -> &Path {
        &self.default_dir
    }
}

impl DirectoryResolver for DefaultDirectoryResolver {
    fn resolve(&self, requested: Option<&str>) -> Result<PathBuf, SessionError> {
        let path = match requested.map(str::trim) {
            None | Some("") => self.default_dir.clone(),
            Some(raw) => {
                let expanded = expand_tilde(raw);
                if expanded.is_absolute() {
                    expanded
                } else {
                    self.default_dir.join(expanded)
                }
            }
        };

        if !path.is_dir() {
            return Err(SessionError::InvalidDirectory(path.display().to_string()));
        }
        Ok(path)
    }
}

/// Expand a leading `~` to the user's home directory.
///
/// `~user` forms and paths without a leading tilde are returned unchanged.
pub fn expand_tilde(path: &str) -> PathBuf {
    let suffix = match path.strip_prefix('~') {
        Some(suffix) if suffix.is_empty() || suffix.starts_with('/') => suffix,
        _ => return PathBuf::from(path),
    };
    match dirs::home_dir() {
        Some(home) => home.join(suffix.trim_start_matches('/')),
        None => PathBuf::from(path),
    }
}
