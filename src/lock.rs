use std::fs::OpenOptions;
use std::path::Path;

use fs2::FileExt;

use crate::error::{Error, Result};

/// Acquire an exclusive advisory lock on a branch directory, execute `f`,
/// then release.
///
/// Creates `<dir>/branch.lock` and holds an `fs2` exclusive lock on it for
/// the duration of `f`. Serializes row writes for one branch across
/// processes that share the same root. Blocking; call from the blocking pool.
///
/// # Arguments
/// * `dir` - The branch's row directory.
/// * `f` - Closure to execute while the lock is held.
///
/// # Errors
/// Returns an error if the lock file cannot be created or locked.
pub fn with_branch_lock<F, T>(dir: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    let lock_path = dir.join("branch.lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| Error::io(&lock_path, e))?;

    file.lock_exclusive().map_err(|e| Error::io(&lock_path, e))?;
    let result = f();
    // Dropping `file` releases the lock as well.
    let _ = FileExt::unlock(&file);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_runs_closure_and_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let branch_dir = dir.path().join("main");
        let v = with_branch_lock(&branch_dir, || Ok(42)).unwrap();
        assert_eq!(v, 42);
        assert!(branch_dir.join("branch.lock").exists());
    }

    #[test]
    fn lock_can_be_reacquired() {
        let dir = tempfile::tempdir().unwrap();
        with_branch_lock(dir.path(), || Ok(())).unwrap();
        with_branch_lock(dir.path(), || Ok(())).unwrap();
    }

    #[test]
    fn lock_propagates_closure_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = with_branch_lock(dir.path(), || -> Result<()> {
            Err(Error::not_found("x"))
        })
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
