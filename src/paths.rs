//! Directory/file resolution for on-disk CA, leaf-cert, and state material.
//!
//! The real path-resolution logic (XDG dirs, per-platform data directories) is
//! an external collaborator per the system scope: this crate only needs the
//! narrow contract below, injected into constructors rather than reached for
//! through a process-global, so every component stays constructible against a
//! throwaway `tempfile::tempdir()` in tests.

use std::path::{Path, PathBuf};

#[cfg_attr(test, mockall::automock)]
pub trait Paths: Send + Sync {
    /// Directory holding `root-ca.pem` / `root-ca-key.pem`.
    fn ca_dir(&self) -> &Path;
    /// Directory holding per-wildcard-key leaf cert/key pairs.
    fn leaf_dir(&self) -> &Path;
    /// Path to the `routes.json` state snapshot.
    fn state_file(&self) -> &Path;
}

/// Default layout: everything rooted under a single base directory.
#[derive(Debug, Clone)]
pub struct FilesystemPaths {
    ca_dir: PathBuf,
    leaf_dir: PathBuf,
    state_file: PathBuf,
}

impl FilesystemPaths {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            ca_dir: base_dir.join("ca"),
            leaf_dir: base_dir.join("leaves"),
            state_file: base_dir.join("routes.json"),
        }
    }
}

impl Paths for FilesystemPaths {
    fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    fn leaf_dir(&self) -> &Path {
        &self.leaf_dir
    }

    fn state_file(&self) -> &Path {
        &self.state_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_paths_rooted_under_base_dir() {
        let paths = FilesystemPaths::new("/tmp/devproxy-test");
        assert_eq!(paths.ca_dir(), Path::new("/tmp/devproxy-test/ca"));
        assert_eq!(paths.leaf_dir(), Path::new("/tmp/devproxy-test/leaves"));
        assert_eq!(paths.state_file(), Path::new("/tmp/devproxy-test/routes.json"));
    }

    #[test]
    fn mock_paths_satisfies_the_trait_contract() {
        let mut mock = MockPaths::new();
        mock.expect_ca_dir().return_const(PathBuf::from("/fake/ca"));
        mock.expect_leaf_dir().return_const(PathBuf::from("/fake/leaves"));
        mock.expect_state_file().return_const(PathBuf::from("/fake/routes.json"));

        let paths: &dyn Paths = &mock;
        assert_eq!(paths.ca_dir(), Path::new("/fake/ca"));
        assert_eq!(paths.leaf_dir(), Path::new("/fake/leaves"));
        assert_eq!(paths.state_file(), Path::new("/fake/routes.json"));
    }
}
