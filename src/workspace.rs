use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CoreResult, Error};

pub const JUPYTER_SUBDIR: &str = "jupyter";
pub const MODELS_SUBDIR: &str = "models";
pub const DATA_SUBDIR: &str = "data";

const REQUIRED_SUBDIRS: [&str; 3] = [JUPYTER_SUBDIR, MODELS_SUBDIR, DATA_SUBDIR];

/// Derives and maintains per-user workspace directories under a fixed root:
/// `<root>/user_<id>/{jupyter,models,data}`. The path is a pure function of
/// the user id; usernames are never load-bearing for lookup.
pub struct WorkspaceAllocator {
    root: PathBuf,
}

impl WorkspaceAllocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn user_root(&self, user_id: i64) -> PathBuf {
        self.root.join(format!("user_{}", user_id))
    }

    pub fn subpath(&self, user_id: i64, subdir: &str) -> PathBuf {
        self.user_root(user_id).join(subdir)
    }

    /// Idempotently create the workspace for a user and return its root.
    /// Existing directories and their contents are left untouched.
    pub fn ensure_workspace(&self, user_id: i64) -> CoreResult<PathBuf> {
        let user_root = self.user_root(user_id);

        for subdir in REQUIRED_SUBDIRS {
            let path = user_root.join(subdir);
            fs::create_dir_all(&path).map_err(|source| Error::Storage {
                path: path.display().to_string(),
                source,
            })?;
        }

        restrict_to_owner(&user_root)?;

        tracing::debug!(user_id, "Workspace ready at {}", user_root.display());
        Ok(user_root)
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> CoreResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)
        .map_err(|source| Error::Storage {
            path: path.display().to_string(),
            source,
        })?
        .permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms).map_err(|source| Error::Storage {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> CoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_creates_required_subdirs() {
        let root = tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(root.path());

        let user_root = allocator.ensure_workspace(42).unwrap();

        assert_eq!(user_root, root.path().join("user_42"));
        for subdir in REQUIRED_SUBDIRS {
            assert!(user_root.join(subdir).is_dir());
        }
    }

    #[test]
    fn test_ensure_is_idempotent_and_preserves_content() {
        let root = tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(root.path());

        let user_root = allocator.ensure_workspace(7).unwrap();
        let notebook = user_root.join(JUPYTER_SUBDIR).join("scratch.ipynb");
        fs::write(&notebook, "{}").unwrap();

        let again = allocator.ensure_workspace(7).unwrap();
        assert_eq!(user_root, again);
        assert_eq!(fs::read_to_string(&notebook).unwrap(), "{}");

        let entries: Vec<_> = fs::read_dir(&user_root).unwrap().collect();
        assert_eq!(entries.len(), REQUIRED_SUBDIRS.len());
    }

    #[test]
    fn test_unwritable_root_is_a_storage_error() {
        let allocator = WorkspaceAllocator::new("/proc/no-such-root");
        let result = allocator.ensure_workspace(1);
        assert!(matches!(result, Err(Error::Storage { .. })));
    }
}
