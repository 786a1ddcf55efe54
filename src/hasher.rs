// Purpose: Compute content-addressed build identifiers for every node.
// Inputs/Outputs: Reads source bytes and import build IDs; writes each node's hash meta.
// Invariants: IDs are pure functions of toolchain, identity, sources and non-test import IDs.
// Gotchas: Requires bottom-up traversal; a missing upstream ID means the walk was out of order.

use std::fs;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::buildctx::BuildCtx;
use crate::dag::{Dag, HashMeta, Node, VisitCx, Visitor};

pub struct Hasher<'a> {
    pub ctx: &'a BuildCtx,
}

impl Visitor for Hasher<'_> {
    fn visit(&self, cx: &VisitCx<'_>, node: &mut Node) -> Result<()> {
        let build_id = self.compute(cx.dag, node)?;
        node.hash_meta = Some(HashMeta { build_id });
        Ok(())
    }
}

impl Hasher<'_> {
    /// Recompute hashes for nodes the rewriter changed. Only test variants
    /// get rewritten and test-only edges never feed another node's ID, so
    /// no propagation beyond the changed nodes is needed.
    pub fn refresh_changed(&self, dag: &Dag) -> Result<()> {
        for id in dag.node_ids() {
            let slot = dag.handle(id);
            let changed = {
                let node = slot.read();
                node.rewrite_meta.as_ref().is_some_and(|m| m.changed)
            };
            if !changed {
                continue;
            }
            let mut node = slot.write();
            let build_id = self.compute(dag, &node)?;
            node.hash_meta = Some(HashMeta { build_id });
        }
        Ok(())
    }

    pub fn compute(&self, dag: &Dag, node: &Node) -> Result<String> {
        let ctx = self.ctx;
        let bits = node.bits()?;
        let mut provenance: Vec<String> = Vec::new();

        let mut s = Sha256::new();
        s.update(
            format!(
                "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
                ctx.own_version,
                ctx.toolchain_version,
                ctx.compiler,
                ctx.goarch,
                ctx.goos,
                ctx.gopath,
                ctx.goroot.display(),
                ctx.install_suffix,
                ctx.release_tags.join(":"),
                ctx.build_tags.join(":"),
                ctx.cgo_enabled,
            )
            .as_bytes(),
        );
        s.update(
            format!(
                "{}:{}:{}:{}:{}:{}:{}",
                node.import_path,
                bits.name,
                bits.source_dir.display(),
                bits.root_dir.display(),
                bits.goroot,
                bits.standard,
                bits.tests,
            )
            .as_bytes(),
        );
        provenance.push(hex::encode(s.finalize()));

        for edge in &bits.imports {
            if edge.test_only {
                continue;
            }
            let slot = dag.handle(edge.node);
            let imported = slot.read();
            provenance.push(imported.build_id()?.to_string());
        }

        for go_file in &bits.go_files {
            let mut s = Sha256::new();
            s.update(
                format!(
                    "{}:{}:{}\n",
                    go_file.dir.display(),
                    go_file.filename,
                    go_file.test
                )
                .as_bytes(),
            );
            // Generator-backed sources do not exist yet; their content is a
            // function of the import build IDs already folded in above.
            if go_file.generator.is_none() {
                let path = go_file.path();
                let contents =
                    fs::read(&path).with_context(|| format!("read {}", path.display()))?;
                s.update(&contents);
            }
            provenance.push(hex::encode(s.finalize()));
        }

        for s_file in &bits.s_files {
            let mut s = Sha256::new();
            s.update(format!("{}:{}\n", s_file.dir.display(), s_file.filename).as_bytes());
            let path = s_file.path();
            let contents = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            s.update(&contents);
            provenance.push(hex::encode(s.finalize()));
        }

        provenance.sort();

        let mut s = Sha256::new();
        for p in &provenance {
            s.update(p.as_bytes());
            s.update(b"\n");
        }
        Ok(hex::encode(s.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::Hasher;
    use crate::buildctx::BuildCtx;
    use crate::dag::testutil::pkg;
    use crate::dag::{CancelToken, Dag};
    use crate::pkg::Package;
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
            release_tags: vec!["go1.1".to_string()],
            build_tags: Vec::new(),
            cgo_enabled: false,
            toolchain_version: "go version go1.21.0 linux/amd64".to_string(),
            own_version: "test".to_string(),
        }
    }

    fn pkg_in(dir: &Path, import_path: &str, imports: &[&str], source: &str) -> Package {
        let mut p = pkg(import_path, imports);
        let pkg_dir = dir.join(import_path);
        fs::create_dir_all(&pkg_dir).expect("mkdir");
        fs::write(pkg_dir.join(&p.go_files[0]), source).expect("write source");
        p.dir = pkg_dir;
        p
    }

    fn hash_all(d: &Dag, ctx: &BuildCtx) {
        let hasher = Hasher { ctx };
        d.visit_all_from_right(&CancelToken::new(), &hasher)
            .expect("hash");
    }

    fn build_id(d: &Dag, path: &str) -> String {
        let id = d.find(path).expect("node");
        let slot = d.handle(id);
        let node = slot.read();
        node.build_id().expect("id").to_string()
    }

    #[test]
    fn hashing_is_deterministic() {
        let ctx = test_ctx();
        let dir = tempfile::tempdir().expect("tempdir");

        let make = || {
            let d = Dag::new();
            d.add(&pkg_in(dir.path(), "a", &["b"], "package a\n"), false, false)
                .expect("a");
            d.add(&pkg_in(dir.path(), "b", &[], "package b\n"), false, false)
                .expect("b");
            hash_all(&d, &ctx);
            (build_id(&d, "a"), build_id(&d, "b"))
        };

        assert_eq!(make(), make());
    }

    #[test]
    fn import_id_feeds_dependent_id() {
        let ctx = test_ctx();
        let dir_one = tempfile::tempdir().expect("tempdir");
        let dir_two = tempfile::tempdir().expect("tempdir");

        // Same leaf path and name, different contents; the dependent's dir
        // would otherwise differ, so pin it to one location.
        let run = |dir: &Path, leaf_src: &str| {
            let d = Dag::new();
            let mut a = pkg_in(dir_one.path(), "a", &["b"], "package a\n");
            a.dir = dir_one.path().join("a");
            d.add(&a, false, false).expect("a");
            d.add(&pkg_in(dir, "b", &[], leaf_src), false, false)
                .expect("b");
            hash_all(&d, &ctx);
            build_id(&d, "a")
        };

        let id_one = run(dir_two.path(), "package b\n");
        // Rewrite b with new contents in the same location.
        let id_two = run(dir_two.path(), "package b // changed\n");
        assert_ne!(id_one, id_two);
    }

    #[test]
    fn missing_upstream_id_is_fatal() {
        let ctx = test_ctx();
        let dir = tempfile::tempdir().expect("tempdir");
        let d = Dag::new();
        d.add(&pkg_in(dir.path(), "a", &["b"], "package a\n"), false, false)
            .expect("a");
        d.add(&pkg_in(dir.path(), "b", &[], "package b\n"), false, false)
            .expect("b");

        let hasher = Hasher { ctx: &ctx };
        let a = d.find("a").expect("a");
        let slot = d.handle(a);
        let node = slot.read();
        assert!(hasher.compute(&d, &node).is_err());
    }
}
