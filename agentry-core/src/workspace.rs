//! Path-safe workspace file store with per-path cooperative write locks.
//!
//! Every caller-supplied path is resolved against the workspace root and the
//! resolved form must stay under the root prefix; null bytes and symlinks are
//! refused outright. Hidden entries are filtered from listings. Writes take a
//! cooperative per-path lock with a 30-second TTL; expired locks are swept
//! lazily on every lock operation. Reads never lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{EngineError, Result};

/// Cooperative lock lifetime.
pub const LOCK_TTL: Duration = Duration::from_secs(30);

/// A listed workspace entry.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    /// Path relative to the workspace root.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified_at: Option<DateTime<Utc>>,
}

struct FileLock {
    owner: Uuid,
    acquired_at: Instant,
}

impl FileLock {
    fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= LOCK_TTL
    }

    fn remaining_secs(&self) -> u64 {
        LOCK_TTL
            .saturating_sub(self.acquired_at.elapsed())
            .as_secs()
            .max(1)
    }
}

/// The workspace file store.
pub struct Workspace {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, FileLock>>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace").field("root", &self.root).finish()
    }
}

impl Workspace {
    /// Open a workspace rooted at `root`, creating the directory if needed.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let root = root
            .canonicalize()
            .map_err(|e| EngineError::internal(format!("workspace root unusable: {e}")))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied relative path to an absolute path under the
    /// root. Rejects null bytes, absolute paths, escapes, and symlinks.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        if relative.contains('\0') {
            return Err(EngineError::forbidden("path contains a null byte"));
        }
        let supplied = Path::new(relative);
        if supplied.is_absolute() {
            return Err(EngineError::forbidden("path must be relative"));
        }

        // Normalize away `.` and `..` without touching the filesystem, so
        // non-existent targets (new files) get the same treatment.
        let mut normalized = PathBuf::new();
        for component in supplied.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(EngineError::forbidden("path escapes the workspace"));
                    }
                }
                Component::CurDir => {}
                Component::Normal(part) => normalized.push(part),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(EngineError::forbidden("path must be relative"));
                }
            }
        }

        let resolved = self.root.join(&normalized);
        if !resolved.starts_with(&self.root) {
            return Err(EngineError::forbidden("path escapes the workspace"));
        }

        // Refuse symlinks anywhere along the resolved suffix.
        let mut cursor = self.root.clone();
        for component in normalized.components() {
            cursor.push(component);
            if let Ok(meta) = std::fs::symlink_metadata(&cursor) {
                if meta.file_type().is_symlink() {
                    return Err(EngineError::forbidden("symlinks are not allowed"));
                }
            }
        }

        Ok(resolved)
    }

    /// List entries under `prefix` (or the whole workspace), hidden entries
    /// filtered out, sorted by path.
    pub fn list(&self, prefix: Option<&str>) -> Result<Vec<FileInfo>> {
        let base = match prefix {
            Some(p) => self.resolve(p)?,
            None => self.root.clone(),
        };
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&base)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !is_hidden(e.file_name()))
        {
            let entry = entry.map_err(|e| EngineError::internal(e.to_string()))?;
            let meta = entry
                .metadata()
                .map_err(|e| EngineError::internal(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            entries.push(FileInfo {
                path: relative,
                size: meta.len(),
                is_dir: meta.is_dir(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Read a file. Takes no lock.
    pub fn read(&self, relative: &str) -> Result<String> {
        let path = self.resolve(relative)?;
        if !path.is_file() {
            return Err(EngineError::not_found("file"));
        }
        Ok(std::fs::read_to_string(&path)?)
    }

    /// Write a file, acquiring (or refreshing) the cooperative lock for
    /// `agent_id`. A write against someone else's live lock conflicts.
    pub fn write(&self, agent_id: &Uuid, relative: &str, content: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        self.acquire_lock(agent_id, &path)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        debug!(agent_id = %agent_id, path = %relative, "Workspace file written");
        Ok(())
    }

    /// Explicitly take the write lock on a path.
    pub fn lock(&self, agent_id: &Uuid, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        self.acquire_lock(agent_id, &path)
    }

    /// Release a lock held by `agent_id`. Releasing an unheld lock is a
    /// no-op.
    pub fn unlock(&self, agent_id: &Uuid, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        let mut locks = self.locks.lock().expect("lock table poisoned");
        if let Some(existing) = locks.get(&path) {
            if existing.owner == *agent_id {
                locks.remove(&path);
            }
        }
        Ok(())
    }

    fn acquire_lock(&self, agent_id: &Uuid, path: &Path) -> Result<()> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        // Lazy sweep on every lock operation.
        locks.retain(|_, lock| !lock.is_expired());

        if let Some(existing) = locks.get(path) {
            if existing.owner != *agent_id {
                return Err(EngineError::Conflict {
                    message: format!(
                        "locked by agent {}, try again in {} seconds",
                        existing.owner,
                        existing.remaining_secs()
                    ),
                });
            }
        }
        locks.insert(
            path.to_path_buf(),
            FileLock {
                owner: *agent_id,
                acquired_at: Instant::now(),
            },
        );
        Ok(())
    }

    #[cfg(test)]
    fn force_expire_lock(&self, relative: &str) {
        let path = self.resolve(relative).unwrap();
        let mut locks = self.locks.lock().unwrap();
        if let Some(lock) = locks.get_mut(&path) {
            lock.acquired_at = Instant::now() - LOCK_TTL - Duration::from_secs(1);
        }
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        (dir, workspace)
    }

    #[test]
    fn test_write_and_read() {
        let (_dir, ws) = setup();
        let agent = Uuid::new_v4();
        ws.write(&agent, "notes/plan.md", "# Plan").unwrap();
        assert_eq!(ws.read("notes/plan.md").unwrap(), "# Plan");
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let (_dir, ws) = setup();
        let err = ws.read("missing.txt").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_traversal_rejected() {
        let (_dir, ws) = setup();
        let agent = Uuid::new_v4();
        for path in ["../escape.txt", "a/../../escape.txt", "/etc/passwd"] {
            let err = ws.write(&agent, path, "x").unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Forbidden, "{path}");
            let err = ws.read(path).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Forbidden, "{path}");
        }
        // Interior `..` that stays inside the root is fine.
        ws.write(&agent, "a/b/../c.txt", "ok").unwrap();
        assert_eq!(ws.read("a/c.txt").unwrap(), "ok");
    }

    #[test]
    fn test_null_byte_rejected() {
        let (_dir, ws) = setup();
        let err = ws.read("bad\0name").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Forbidden);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_rejected() {
        let (dir, ws) = setup();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        let err = ws.read("link.txt").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Forbidden);
    }

    #[test]
    fn test_listing_filters_hidden() {
        let (_dir, ws) = setup();
        let agent = Uuid::new_v4();
        ws.write(&agent, "visible.txt", "v").unwrap();
        ws.write(&agent, ".hidden", "h").unwrap();
        ws.write(&agent, "sub/file.txt", "s").unwrap();

        let listed = ws.list(None).unwrap();
        let paths: Vec<&str> = listed.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"visible.txt"));
        assert!(paths.contains(&"sub"));
        assert!(paths.contains(&format!("sub{}file.txt", std::path::MAIN_SEPARATOR).as_str()));
        assert!(!paths.iter().any(|p| p.contains("hidden")));
    }

    #[test]
    fn test_lock_conflict_message() {
        let (_dir, ws) = setup();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        ws.write(&alice, "shared.txt", "alice's draft").unwrap();
        let err = ws.write(&bob, "shared.txt", "bob's edit").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        let message = err.to_string();
        assert!(message.contains(&format!("locked by agent {alice}")));
        assert!(message.contains("try again in"));

        // The file is untouched by the refused write.
        assert_eq!(ws.read("shared.txt").unwrap(), "alice's draft");
    }

    #[test]
    fn test_lock_owner_can_rewrite() {
        let (_dir, ws) = setup();
        let agent = Uuid::new_v4();
        ws.write(&agent, "mine.txt", "v1").unwrap();
        ws.write(&agent, "mine.txt", "v2").unwrap();
        assert_eq!(ws.read("mine.txt").unwrap(), "v2");
    }

    #[test]
    fn test_expired_lock_swept() {
        let (_dir, ws) = setup();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        ws.write(&alice, "shared.txt", "v1").unwrap();
        ws.force_expire_lock("shared.txt");
        ws.write(&bob, "shared.txt", "v2").unwrap();
        assert_eq!(ws.read("shared.txt").unwrap(), "v2");
    }

    #[test]
    fn test_unlock_releases() {
        let (_dir, ws) = setup();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        ws.lock(&alice, "doc.txt").unwrap();
        assert!(ws.write(&bob, "doc.txt", "x").is_err());
        ws.unlock(&alice, "doc.txt").unwrap();
        assert!(ws.write(&bob, "doc.txt", "x").is_ok());

        // Unlocking someone else's lock is a silent no-op.
        ws.unlock(&alice, "doc.txt").unwrap();
        assert!(ws.write(&bob, "doc.txt", "y").is_ok());
    }

    #[test]
    fn test_reads_ignore_locks() {
        let (_dir, ws) = setup();
        let alice = Uuid::new_v4();
        ws.write(&alice, "shared.txt", "data").unwrap();
        // A different reader sees the file while the lock is live.
        assert_eq!(ws.read("shared.txt").unwrap(), "data");
    }
}
