use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::DeleteError;

/// The filesystem operations deletion needs, injectable for tests.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn is_writable(&self, path: &Path) -> std::io::Result<bool>;
    fn make_writable(&self, path: &Path) -> std::io::Result<()>;
    fn remove_file(&self, path: &Path) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_writable(&self, path: &Path) -> std::io::Result<bool> {
        Ok(!std::fs::metadata(path)?.permissions().readonly())
    }

    fn make_writable(&self, path: &Path) -> std::io::Result<()> {
        let mut permissions = std::fs::metadata(path)?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            permissions.set_mode(permissions.mode() | 0o200);
        }
        #[cfg(not(unix))]
        {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
        }
        std::fs::set_permissions(path, permissions)
    }

    fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_file(path)
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Delete `path`, retrying transient failures with a fixed backoff.
///
/// A file that is not writable gets one permission fix per attempt; a second
/// consecutive permission failure gives up with [`DeleteError::NotWritable`].
pub fn delete_with_retry(
    fs: &dyn FileSystem,
    sleeper: &dyn Sleeper,
    path: &Path,
    policy: RetryPolicy,
) -> Result<(), DeleteError> {
    if !fs.exists(path) {
        return Err(DeleteError::FileNotFound(path.to_path_buf()));
    }

    let max_attempts = policy.max_attempts.max(1);
    let mut permission_failures = 0u32;
    let mut last_error = std::io::Error::other("no attempt made");

    for attempt in 1..=max_attempts {
        match fs.is_writable(path) {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = fs.make_writable(path) {
                    debug!("Permission fix failed for {:?}: {}", path, e);
                }
                if !fs.is_writable(path).unwrap_or(false) {
                    permission_failures += 1;
                    if permission_failures >= 2 {
                        return Err(DeleteError::NotWritable(path.to_path_buf()));
                    }
                    last_error = std::io::Error::from(ErrorKind::PermissionDenied);
                    if attempt < max_attempts {
                        sleeper.sleep(policy.backoff);
                    }
                    continue;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => debug!("Could not read permissions of {:?}: {}", path, e),
        }

        match fs.remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                permission_failures += 1;
                if permission_failures >= 2 {
                    return Err(DeleteError::NotWritable(path.to_path_buf()));
                }
                last_error = e;
            }
            Err(e) => {
                permission_failures = 0;
                debug!("Delete attempt {} for {:?} failed: {}", attempt, path, e);
                last_error = e;
            }
        }

        if attempt < max_attempts {
            sleeper.sleep(policy.backoff);
        }
    }

    Err(DeleteError::Exhausted {
        path: path.to_path_buf(),
        attempts: max_attempts,
        source: last_error,
    })
}

/// Per-run memo of file existence checks. Owned by one invocation and cleared
/// at its start.
#[derive(Debug, Default)]
pub struct ExistenceCache {
    entries: HashMap<PathBuf, bool>,
}

impl ExistenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&mut self, fs: &dyn FileSystem, path: &Path) -> bool {
        if let Some(known) = self.entries.get(path) {
            return *known;
        }
        let exists = fs.exists(path);
        self.entries.insert(path.to_path_buf(), exists);
        exists
    }

    /// Record a change made by this run.
    pub fn set(&mut self, path: &Path, exists: bool) {
        self.entries.insert(path.to_path_buf(), exists);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.shrink_to_fit();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{RecordingSleeper, ScriptedFs};
    use super::*;
    use tempfile::TempDir;

    fn busy() -> std::io::Error {
        std::io::Error::other("resource busy")
    }

    #[test]
    fn test_deletes_real_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("old.png");
        std::fs::write(&path, b"png").unwrap();

        delete_with_retry(&OsFileSystem, &ThreadSleeper, &path, RetryPolicy::default()).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ghost.png");
        let result = delete_with_retry(&OsFileSystem, &ThreadSleeper, &path, RetryPolicy::default());
        assert!(matches!(result, Err(DeleteError::FileNotFound(_))));
    }

    #[test]
    fn test_readonly_file_is_fixed_then_deleted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("locked.jpg");
        std::fs::write(&path, b"jpg").unwrap();
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&path, permissions).unwrap();

        delete_with_retry(&OsFileSystem, &ThreadSleeper, &path, RetryPolicy::default()).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_transient_failures_are_retried_with_backoff() {
        let fs = ScriptedFs::new(vec![], vec![Err(busy()), Err(busy()), Ok(())]);
        let sleeper = RecordingSleeper::default();
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_millis(250),
        };

        delete_with_retry(&fs, &sleeper, Path::new("/x.png"), policy).unwrap();
        assert_eq!(*fs.remove_calls.lock().unwrap(), 3);
        assert_eq!(
            *sleeper.sleeps.lock().unwrap(),
            vec![Duration::from_millis(250); 2]
        );
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let fs = ScriptedFs::new(vec![], (0..5).map(|_| Err(busy())).collect());
        let sleeper = RecordingSleeper::default();

        let result = delete_with_retry(&fs, &sleeper, Path::new("/x.png"), RetryPolicy::default());
        assert!(matches!(
            result,
            Err(DeleteError::Exhausted { attempts: 5, .. })
        ));
        assert_eq!(sleeper.sleeps.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_second_consecutive_permission_failure_aborts() {
        // Never becomes writable, even after the permission fix
        let fs = ScriptedFs::new(vec![false; 10], vec![]);
        let sleeper = RecordingSleeper::default();

        let result = delete_with_retry(&fs, &sleeper, Path::new("/x.png"), RetryPolicy::default());
        assert!(matches!(result, Err(DeleteError::NotWritable(_))));
        assert_eq!(*fs.chmod_calls.lock().unwrap(), 2);
        assert_eq!(*fs.remove_calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_permission_denied_on_remove_counts_as_permission_failure() {
        let denied = || std::io::Error::from(ErrorKind::PermissionDenied);
        let fs = ScriptedFs::new(vec![], vec![Err(denied()), Err(denied()), Ok(())]);
        let sleeper = RecordingSleeper::default();

        let result = delete_with_retry(&fs, &sleeper, Path::new("/x.png"), RetryPolicy::default());
        assert!(matches!(result, Err(DeleteError::NotWritable(_))));
        assert_eq!(*fs.remove_calls.lock().unwrap(), 2);
    }

    #[test]
    fn test_existence_cache_memoizes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.webp");
        let mut cache = ExistenceCache::new();

        assert!(!cache.exists(&OsFileSystem, &path));
        std::fs::write(&path, b"x").unwrap();
        // Still the memoized answer until the run records the change
        assert!(!cache.exists(&OsFileSystem, &path));
        cache.set(&path, true);
        assert!(cache.exists(&OsFileSystem, &path));

        cache.clear();
        assert!(cache.is_empty());
    }
}
