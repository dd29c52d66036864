//! TestContext - Owns the temporary directory of a test

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary directory removed when the context is dropped
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a context with a fresh temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        Self { temp_dir }
    }

    /// Root of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// State directory for the node `name`, created on demand
    pub fn state_dir(&self, name: &str) -> PathBuf {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create state directory");
        dir
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creates_directories() {
        let ctx = TestContext::new();
        let dir = ctx.state_dir("node-a");
        assert!(dir.is_dir());
        assert!(dir.starts_with(ctx.path()));
    }

    #[test]
    fn test_context_cleanup() {
        let path = {
            let ctx = TestContext::new();
            ctx.state_dir("node-a");
            ctx.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
