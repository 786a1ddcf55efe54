// Purpose: Locate the persistent artifact cache and manage per-package manifests.
// Inputs/Outputs: Resolves the cache root; reads and writes manifest files.
// Invariants: Manifests are flat newline-separated filename lists, no paths.
// Gotchas: The root embeds the target, so cross-compilation never mixes artifacts.

pub mod puller;
pub mod storer;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

use crate::buildctx::BuildCtx;
use crate::util::ensure_dir;

/// Cache root for the current target, honoring `GOPHERTEST_CACHE_DIR`.
pub fn cache_root(ctx: &BuildCtx) -> Result<PathBuf> {
    let base = if let Ok(p) = std::env::var("GOPHERTEST_CACHE_DIR") {
        PathBuf::from(p)
    } else {
        let pd = ProjectDirs::from("dev", "gophertest", "gophertest")
            .context("cannot determine OS cache directory")?;
        pd.cache_dir().to_path_buf()
    };
    let dir = base.join(ctx.target());
    ensure_dir(&dir)?;
    Ok(dir)
}

pub fn manifest_path(package_cache_dir: &Path, cache_name: &str) -> PathBuf {
    package_cache_dir.join(format!("{cache_name}.manifest"))
}

pub fn object_path(package_cache_dir: &Path, cache_name: &str) -> PathBuf {
    package_cache_dir.join(format!("{cache_name}.obj"))
}

pub fn read_manifest(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn write_manifest(path: &Path, entries: &[String]) -> Result<()> {
    let mut text = String::new();
    for entry in entries {
        text.push_str(entry);
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{manifest_path, read_manifest, write_manifest};

    #[test]
    fn manifest_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = manifest_path(dir.path(), "p");
        let entries = vec![
            "p.obj".to_string(),
            "gophertest_generated_p_test.go".to_string(),
        ];
        write_manifest(&path, &entries).expect("write");
        assert_eq!(read_manifest(&path).expect("read"), entries);
    }

    #[test]
    fn read_manifest_skips_blank_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("p.manifest");
        std::fs::write(&path, "a.obj\n\nb.go\n").expect("write");
        assert_eq!(read_manifest(&path).expect("read"), vec!["a.obj", "b.go"]);
    }
}
