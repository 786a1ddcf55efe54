// Purpose: Shared filesystem helpers for cache directories, copies and locks.
// Inputs/Outputs: Touches the cache tree and arbitrary file paths on behalf of visitors.
// Invariants: The top-level cache lock is try-lock fail-fast; package locks block.
// Gotchas: Package cache dirs are keyed by the import path with any "_test" suffix trimmed.

use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p).with_context(|| format!("mkdir {}", p.display()))?;
    Ok(())
}

/// Copy with default permissions.
pub fn file_copy(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
    Ok(())
}

pub fn trim_test_suffix(import_path: &str) -> &str {
    import_path.strip_suffix("_test").unwrap_or(import_path)
}

/// Cache directory for a package. Base and external-test variants share a
/// directory; their files are disambiguated by cache name.
pub fn package_cache_dir(cache_dir: &Path, import_path: &str) -> PathBuf {
    cache_dir.join(trim_test_suffix(import_path))
}

pub struct DirLock {
    _file: File,
}

impl DirLock {
    /// Exclusive lock on `<dir>/.lock`, blocking until acquired.
    pub fn acquire(dir: &Path) -> Result<Self> {
        ensure_dir(dir)?;
        let f = open_lock_file(dir)?;
        f.lock_exclusive()
            .with_context(|| format!("locking {}", dir.display()))?;
        Ok(Self { _file: f })
    }

    /// Fail-fast variant used for the top-level cache directory, so two
    /// drivers never interleave writes.
    pub fn try_acquire(dir: &Path) -> Result<Self> {
        ensure_dir(dir)?;
        let f = open_lock_file(dir)?;
        if f.try_lock_exclusive().is_err() {
            bail!("directory {} is locked by another process", dir.display());
        }
        Ok(Self { _file: f })
    }
}

fn open_lock_file(dir: &Path) -> Result<File> {
    let lock_path = dir.join(".lock");
    let f = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("open {}", lock_path.display()))?;
    Ok(f)
}

#[cfg(test)]
mod tests {
    use super::{DirLock, file_copy, package_cache_dir, trim_test_suffix};
    use std::fs;
    use std::path::Path;

    #[test]
    fn trims_external_test_suffix() {
        assert_eq!(trim_test_suffix("example.com/pkg_test"), "example.com/pkg");
        assert_eq!(trim_test_suffix("example.com/pkg"), "example.com/pkg");
    }

    #[test]
    fn base_and_xtest_share_cache_dir() {
        let root = Path::new("/cache/linux_amd64");
        assert_eq!(
            package_cache_dir(root, "example.com/pkg"),
            package_cache_dir(root, "example.com/pkg_test"),
        );
    }

    #[test]
    fn copy_roundtrips_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("b.txt");
        fs::write(&src, b"contents").expect("write");
        file_copy(&src, &dst).expect("copy");
        assert_eq!(fs::read(&dst).expect("read"), b"contents");
    }

    #[test]
    fn try_lock_fails_while_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let held = DirLock::try_acquire(dir.path()).expect("first lock");
        assert!(DirLock::try_acquire(dir.path()).is_err());
        drop(held);
        DirLock::try_acquire(dir.path()).expect("relock after release");
    }
}
