// Purpose: Persist freshly built artifacts and their generated sources.
// Inputs/Outputs: Copies objects and rewriter-generated files into the cache, with a manifest.
// Invariants: Stale manifest entries are deleted before new ones land, under the package lock.
// Gotchas: Only sources living outside the original source dir are cached; originals stay put.

use anyhow::Result;
use log::debug;
use std::fs;
use std::path::PathBuf;

use crate::cache::{manifest_path, object_path, read_manifest, write_manifest};
use crate::dag::{Node, VisitCx, Visitor};
use crate::errors::Error;
use crate::util::{DirLock, ensure_dir, file_copy, package_cache_dir};

pub struct Storer {
    pub cache_dir: PathBuf,
}

impl Visitor for Storer {
    fn visit(&self, _cx: &VisitCx<'_>, node: &mut Node) -> Result<()> {
        if node.import_path == "main" || node.is_intrinsic() {
            return Ok(());
        }
        if !node.build_meta.as_ref().is_some_and(|m| m.rebuilt) {
            return Ok(());
        }

        let bits = node.bits()?;
        let artifact = bits.artifact.clone().ok_or_else(|| Error::MissingArtifact {
            import_path: node.import_path.clone(),
        })?;

        let pkg_cache = package_cache_dir(&self.cache_dir, &node.import_path);
        ensure_dir(&pkg_cache)?;
        let _lock = DirLock::acquire(&pkg_cache)?;

        let manifest_file = manifest_path(&pkg_cache, &bits.cache_name);
        if manifest_file.exists() {
            for stale in read_manifest(&manifest_file)? {
                let _ = fs::remove_file(pkg_cache.join(stale));
            }
        }

        let obj_name = format!("{}.obj", bits.cache_name);
        let mut entries = vec![obj_name];
        file_copy(&artifact, &object_path(&pkg_cache, &bits.cache_name))?;

        for go_file in &bits.go_files {
            if go_file.dir == bits.source_dir || go_file.generator.is_some() {
                continue;
            }
            file_copy(&go_file.path(), &pkg_cache.join(&go_file.filename))?;
            entries.push(go_file.filename.clone());
        }
        for s_file in &bits.s_files {
            if s_file.dir == bits.source_dir {
                continue;
            }
            file_copy(&s_file.path(), &pkg_cache.join(&s_file.filename))?;
            entries.push(s_file.filename.clone());
        }

        write_manifest(&manifest_file, &entries)?;
        debug!("stored {:?} in cache", node.import_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Storer;
    use crate::buildctx::BuildCtx;
    use crate::builder::tools::Tools;
    use crate::dag::visit::Visitor;
    use crate::cache::puller::Puller;
    use crate::cache::{manifest_path, read_manifest};
    use crate::dag::testutil::pkg;
    use crate::dag::{BuildMeta, CancelToken, Dag, GoFile, HashMeta, VisitCx};
    use crate::util::package_cache_dir;
    use std::fs;
    use std::path::Path;

    fn test_ctx() -> BuildCtx {
        BuildCtx {
            goos: "linux".to_string(),
            goarch: "amd64".to_string(),
            goroot: "/goroot".into(),
            gopath: "/gopath".to_string(),
            compiler: "gc".to_string(),
            install_suffix: String::new(),
            release_tags: Vec::new(),
            build_tags: Vec::new(),
            cgo_enabled: false,
            toolchain_version: "go version test".to_string(),
            own_version: "test".to_string(),
        }
    }

    fn seed_node(dag: &Dag, dir: &Path) -> crate::dag::NodeId {
        let mut p = pkg("example.com/p", &[]);
        let pkg_dir = dir.join("src");
        fs::create_dir_all(&pkg_dir).expect("mkdir");
        fs::write(pkg_dir.join("p.go"), "package p\n").expect("write");
        p.dir = pkg_dir;
        dag.add(&p, false, false).expect("add")
    }

    #[test]
    fn store_writes_object_generated_source_and_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = dir.path().join("cache");
        fs::create_dir_all(&cache).expect("mkdir cache");

        let dag = Dag::new();
        let id = seed_node(&dag, dir.path());

        // Pretend the builder ran: artifact exists, one rewritten source
        // lives outside the source dir.
        let work = dir.path().join("work");
        fs::create_dir_all(&work).expect("mkdir work");
        let obj = work.join("p.obj");
        fs::write(&obj, b"archive-bytes").expect("write obj");
        let rewrite_dir = work.join("rewrite");
        fs::create_dir_all(&rewrite_dir).expect("mkdir rewrite");
        fs::write(rewrite_dir.join("p_test.go"), "package p\n").expect("write rewrite");

        {
            let slot = dag.handle(id);
            let mut node = slot.write();
            node.build_meta = Some(BuildMeta { rebuilt: true });
            let bits = node.bits.as_mut().expect("bits");
            bits.artifact = Some(obj.clone());
            bits.go_files.push(GoFile::plain(
                rewrite_dir.clone(),
                "p_test.go".to_string(),
                true,
            ));
        }

        let storer = Storer {
            cache_dir: cache.clone(),
        };
        let cancel = CancelToken::new();
        {
            let slot = dag.handle(id);
            let mut node = slot.write();
            let cx = VisitCx {
                dag: &dag,
                cancel: &cancel,
            };
            storer.visit(&cx, &mut node).expect("store");
        }

        let pkg_cache = package_cache_dir(&cache, "example.com/p");
        assert!(pkg_cache.join("p.obj").exists());
        assert!(pkg_cache.join("p_test.go").exists());
        let manifest = read_manifest(&manifest_path(&pkg_cache, "p")).expect("manifest");
        assert_eq!(manifest, vec!["p.obj", "p_test.go"]);
    }

    #[test]
    fn store_skips_nodes_that_were_not_rebuilt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = dir.path().join("cache");
        fs::create_dir_all(&cache).expect("mkdir cache");

        let dag = Dag::new();
        let id = seed_node(&dag, dir.path());
        {
            let slot = dag.handle(id);
            let mut node = slot.write();
            node.build_meta = Some(BuildMeta { rebuilt: false });
            node.hash_meta = Some(HashMeta {
                build_id: "id".to_string(),
            });
        }

        let storer = Storer {
            cache_dir: cache.clone(),
        };
        let cancel = CancelToken::new();
        let slot = dag.handle(id);
        let mut node = slot.write();
        let cx = VisitCx {
            dag: &dag,
            cancel: &cancel,
        };
        storer.visit(&cx, &mut node).expect("store is a no-op");
        assert!(
            !package_cache_dir(&cache, "example.com/p")
                .join("p.obj")
                .exists()
        );
    }

    #[test]
    fn pull_misses_when_build_id_cannot_match() {
        // The stored object is not a real archive, so `go tool buildid`
        // cannot report the expected ID and the puller must leave the node
        // untouched.
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = dir.path().join("cache");
        fs::create_dir_all(&cache).expect("mkdir cache");

        let dag = Dag::new();
        let id = seed_node(&dag, dir.path());
        {
            let slot = dag.handle(id);
            let mut node = slot.write();
            node.hash_meta = Some(HashMeta {
                build_id: "deadbeef".to_string(),
            });
        }

        let pkg_cache = package_cache_dir(&cache, "example.com/p");
        fs::create_dir_all(&pkg_cache).expect("mkdir");
        fs::write(pkg_cache.join("p.obj"), b"not an archive").expect("obj");
        super::write_manifest(&manifest_path(&pkg_cache, "p"), &["p.obj".to_string()])
            .expect("manifest");

        let tools = Tools::new(test_ctx(), false);
        let puller = Puller {
            tools: &tools,
            cache_dir: cache,
        };
        let cancel = CancelToken::new();
        let slot = dag.handle(id);
        let mut node = slot.write();
        let cx = VisitCx {
            dag: &dag,
            cancel: &cancel,
        };
        puller.visit(&cx, &mut node).expect("pull tolerates miss");
        assert!(node.artifact().is_none());
    }
}
