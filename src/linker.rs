// Purpose: Collect per-node artifacts and link the driver into the final executable.
// Inputs/Outputs: Accumulates an import-path-to-artifact map; invokes the external linker at main.
// Invariants: The main node must have zero dependents; each import path links exactly once.
// Gotchas: Never-link nodes are compile-only shadows of an isolated clone and stay out of the map.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use log::warn;
use parking_lot::Mutex;

use crate::builder::tools::{LinkArgs, Tools};
use crate::dag::{LinkMode, Node, VisitCx, Visitor};
use crate::errors::Error;
use crate::util::ensure_dir;

pub struct Linker<'a> {
    pub tools: &'a Tools,
    pub work_dir: PathBuf,
    pub out_file: PathBuf,
    package_map: Mutex<HashMap<String, PathBuf>>,
}

impl<'a> Linker<'a> {
    pub fn new(tools: &'a Tools, work_dir: PathBuf, out_file: PathBuf) -> Self {
        Self {
            tools,
            work_dir,
            out_file,
            package_map: Mutex::new(HashMap::new()),
        }
    }

    fn import_config_link(&self) -> String {
        let map = self.package_map.lock();
        let mut entries: Vec<(&String, &PathBuf)> = map.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut cfg = String::from("# import config\n");
        for (import_path, artifact) in entries {
            if import_path == "main" {
                continue;
            }
            cfg.push_str(&format!(
                "packagefile {}={}\n",
                import_path,
                artifact.display()
            ));
        }
        cfg
    }
}

impl Visitor for Linker<'_> {
    fn visit(&self, cx: &VisitCx<'_>, node: &mut Node) -> Result<()> {
        if node.import_path != "main" {
            if node.is_intrinsic() {
                return Ok(());
            }
            let bits = node.bits()?;
            match bits.link_mode {
                LinkMode::NeverLink => return Ok(()),
                LinkMode::LinkIfNeeded if node.deps.is_empty() => {
                    warn!("node without dependents {:?}", node.import_path);
                    return Ok(());
                }
                _ => {}
            }
            let artifact = bits.artifact.clone().ok_or_else(|| Error::MissingArtifact {
                import_path: node.import_path.clone(),
            })?;
            if !artifact.exists() {
                return Err(Error::MissingArtifact {
                    import_path: node.import_path.clone(),
                }
                .into());
            }
            let mut map = self.package_map.lock();
            if map.contains_key(&node.import_path) {
                return Err(anyhow!(
                    "package map already contains import {:?}",
                    node.import_path
                ));
            }
            map.insert(node.import_path.clone(), artifact);
            return Ok(());
        }

        if !node.deps.is_empty() {
            return Err(Error::MainHasDependents.into());
        }
        cx.cancel.bail_if_cancelled()?;

        let exe_dir = self.work_dir.join("exe");
        ensure_dir(&exe_dir)?;

        let import_config_file = exe_dir.join("importcfg.link");
        fs::write(&import_config_file, self.import_config_link())
            .with_context(|| format!("write {}", import_config_file.display()))?;

        let artifact = node.artifact().cloned().ok_or_else(|| Error::MissingArtifact {
            import_path: node.import_path.clone(),
        })?;

        let args = LinkArgs {
            working_directory: exe_dir,
            build_mode: "exe".to_string(),
            external_linker: "gcc".to_string(),
            import_config_file,
            output_file: self.out_file.clone(),
            files: vec![artifact],
        };
        self.tools.link(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::Linker;
    use crate::buildctx::BuildCtx;
    use crate::builder::tools::Tools;
    use crate::dag::testutil::pkg;
    use crate::dag::{CancelToken, Dag, LinkMode, VisitCx, Visitor};
    use std::path::PathBuf;

    fn test_tools() -> Tools {
        Tools::new(
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
            },
            false,
        )
    }

    #[test]
    fn accumulates_linkable_artifacts_and_formats_config() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let obj = tmp.path().join("b.obj");
        std::fs::write(&obj, b"archive").expect("obj");

        let d = Dag::new();
        d.add(&pkg("a", &["b"]), false, false).expect("a");
        d.add(&pkg("b", &[]), false, false).expect("b");
        let b = d.find("b").expect("b");
        {
            let slot = d.handle(b);
            let mut node = slot.write();
            node.bits.as_mut().expect("bits").artifact = Some(obj.clone());
        }

        let tools = test_tools();
        let linker = Linker::new(&tools, tmp.path().to_path_buf(), PathBuf::from("out.test"));
        let cancel = CancelToken::new();
        {
            let slot = d.handle(b);
            let mut node = slot.write();
            let cx = VisitCx {
                dag: &d,
                cancel: &cancel,
            };
            linker.visit(&cx, &mut node).expect("visit b");
        }
        let cfg = linker.import_config_link();
        assert_eq!(cfg, format!("# import config\npackagefile b={}\n", obj.display()));
    }

    #[test]
    fn never_link_and_orphan_nodes_stay_out() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let d = Dag::new();
        d.add(&pkg("a", &[]), false, false).expect("a");
        let a = d.find("a").expect("a");
        {
            let slot = d.handle(a);
            let mut node = slot.write();
            node.bits.as_mut().expect("bits").link_mode = LinkMode::NeverLink;
        }

        let tools = test_tools();
        let linker = Linker::new(&tools, tmp.path().to_path_buf(), PathBuf::from("out.test"));
        let cancel = CancelToken::new();
        {
            let slot = d.handle(a);
            let mut node = slot.write();
            let cx = VisitCx {
                dag: &d,
                cancel: &cancel,
            };
            // Never-link: skipped without requiring an artifact.
            linker.visit(&cx, &mut node).expect("skip");
            // Orphan link-if-needed: warned and skipped.
            node.bits.as_mut().expect("bits").link_mode = LinkMode::LinkIfNeeded;
            linker.visit(&cx, &mut node).expect("skip orphan");
        }
        assert_eq!(linker.import_config_link(), "# import config\n");
    }

    #[test]
    fn main_with_dependents_is_fatal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let d = Dag::new();
        d.add(&pkg("main", &[]), false, false).expect("main");
        d.add(&pkg("a", &["main"]), false, false).expect("a");

        let tools = test_tools();
        let linker = Linker::new(&tools, tmp.path().to_path_buf(), PathBuf::from("out.test"));
        let cancel = CancelToken::new();
        let main = d.find("main").expect("main");
        let slot = d.handle(main);
        let mut node = slot.write();
        let cx = VisitCx {
            dag: &d,
            cancel: &cancel,
        };
        assert!(linker.visit(&cx, &mut node).is_err());
    }
}
