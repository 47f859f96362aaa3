//! Per-session staging directories.
//!
//! Layout: `<root>/<user_id>/<session_uuid>/`. Inputs are written as
//! `NNN_<sanitized name>` so directory order matches arrival order, and the
//! merged output lands next to them. Nothing outside a session directory is
//! ever touched by a session.

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::core::utils::sanitize_filename;

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, user_id: i64, session_id: Uuid) -> PathBuf {
        self.root.join(user_id.to_string()).join(session_id.to_string())
    }

    /// Path for the `index`-th input (zero-based) of a session.
    pub fn input_path(dir: &Path, index: usize, name: &str) -> PathBuf {
        dir.join(format!("{:03}_{}", index + 1, sanitize_filename(name)))
    }

    pub async fn prepare(&self, dir: &Path) -> io::Result<()> {
        fs_err::tokio::create_dir_all(dir).await
    }

    /// Removes a session directory and, if it became empty, the per-user
    /// parent. Missing directories are fine.
    pub async fn release(&self, dir: &Path) {
        match fs_err::tokio::remove_dir_all(dir).await {
            Ok(()) => log::debug!("🧹 Released staging dir {}", dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to release staging dir {}: {}", dir.display(), e),
        }
        if let Some(parent) = dir.parent() {
            if parent != self.root.as_path() {
                // only succeeds when empty
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }
    }

    /// Deletes every file in `dir` except `keep`.
    pub async fn release_all_except(&self, dir: &Path, keep: &Path) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = fs_err::tokio::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path == keep {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                fs_err::tokio::remove_dir_all(&path).await?;
            } else {
                fs_err::tokio::remove_file(&path).await?;
            }
            removed += 1;
        }
        Ok(removed)
    }

    /// Startup cleanup: nothing staged survives a restart, since sessions
    /// are in-memory only.
    pub async fn purge_all(&self) -> io::Result<usize> {
        fs_err::tokio::create_dir_all(&self.root).await?;
        let mut purged = 0;
        let mut entries = fs_err::tokio::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs_err::tokio::remove_dir_all(&path).await
            } else {
                fs_err::tokio::remove_file(&path).await
            };
            match result {
                Ok(()) => purged += 1,
                Err(e) => log::warn!("Failed to purge {}: {}", path.display(), e),
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_paths_sort_in_arrival_order() {
        let dir = Path::new("/tmp/x");
        let a = StagingArea::input_path(dir, 0, "zeta.mp4");
        let b = StagingArea::input_path(dir, 1, "alpha.mp4");
        assert!(a < b);
        assert_eq!(a.file_name().unwrap(), "001_zeta.mp4");
    }

    #[tokio::test]
    async fn test_release_removes_session_and_empty_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(tmp.path());
        let dir = staging.session_dir(42, Uuid::new_v4());

        staging.prepare(&dir).await.unwrap();
        tokio::fs::write(dir.join("001_a.mp4"), b"data").await.unwrap();

        staging.release(&dir).await;
        assert!(!dir.exists());
        assert!(!tmp.path().join("42").exists());
        assert!(tmp.path().exists());

        // second release is a no-op
        staging.release(&dir).await;
    }

    #[tokio::test]
    async fn test_release_all_except_keeps_output() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(tmp.path());
        let dir = staging.session_dir(1, Uuid::new_v4());
        staging.prepare(&dir).await.unwrap();

        let keep = dir.join("merged.mp4");
        tokio::fs::write(dir.join("001_a.mp4"), b"a").await.unwrap();
        tokio::fs::write(dir.join("002_b.mp4"), b"b").await.unwrap();
        tokio::fs::write(&keep, b"ab").await.unwrap();

        let removed = staging.release_all_except(&dir, &keep).await.unwrap();
        assert_eq!(removed, 2);
        assert!(keep.exists());
    }

    #[tokio::test]
    async fn test_purge_all() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(tmp.path().join("staging"));
        let dir = staging.session_dir(1, Uuid::new_v4());
        staging.prepare(&dir).await.unwrap();

        assert_eq!(staging.purge_all().await.unwrap(), 1);
        assert!(staging.root().exists());
        assert!(!dir.exists());
    }
}
