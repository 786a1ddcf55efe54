// Purpose: Rehydrate nodes from previously stored cache artifacts.
// Inputs/Outputs: Reads manifests and objects; on a hit, rewrites node file dirs and artifact.
// Invariants: A node is only touched when the cached object carries its expected build ID.
// Gotchas: Any mismatch or missing file leaves the node untouched so the builder rebuilds it.

use anyhow::Result;
use log::{debug, info};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::builder::tools::Tools;
use crate::cache::{manifest_path, object_path, read_manifest};
use crate::dag::{GoFile, Node, SFile, VisitCx, Visitor};
use crate::util::package_cache_dir;

pub struct Puller<'a> {
    pub tools: &'a Tools,
    pub cache_dir: PathBuf,
}

impl Visitor for Puller<'_> {
    fn visit(&self, _cx: &VisitCx<'_>, node: &mut Node) -> Result<()> {
        if node.import_path == "main" || node.is_intrinsic() {
            return Ok(());
        }

        let build_id = node.build_id()?.to_string();
        let pkg_cache = package_cache_dir(&self.cache_dir, &node.import_path);

        let bits = node.bits()?;
        let manifest_file = manifest_path(&pkg_cache, &bits.cache_name);
        if !manifest_file.exists() {
            return Ok(());
        }
        let manifest = read_manifest(&manifest_file)?;

        let cache_obj = object_path(&pkg_cache, &bits.cache_name);
        if !cache_obj.exists() {
            return Ok(());
        }

        let embedded = match self.tools.read_build_id(&cache_obj) {
            Ok(id) => id,
            Err(err) => {
                info!(
                    "failed to read build id for {:?}: {err}",
                    bits.cache_name
                );
                return Ok(());
            }
        };
        if !embedded.contains(&build_id) {
            debug!("cache miss for {:?}: build id changed", node.import_path);
            return Ok(());
        }

        let mut overwrite_go: HashSet<String> = HashSet::new();
        for filename in manifest.iter().filter(|f| f.ends_with(".go")) {
            if !pkg_cache.join(filename).exists() {
                return Ok(());
            }
            overwrite_go.insert(filename.clone());
        }
        let mut overwrite_s: HashSet<String> = HashSet::new();
        for filename in manifest.iter().filter(|f| f.ends_with(".s")) {
            if !pkg_cache.join(filename).exists() {
                return Ok(());
            }
            overwrite_s.insert(filename.clone());
        }

        info!("cache hit for {:?}", node.import_path);

        let bits = node.bits_mut()?;
        for go_file in &mut bits.go_files {
            if overwrite_go.remove(&go_file.filename) {
                go_file.dir = pkg_cache.clone();
            }
        }
        for filename in overwrite_go {
            let test = filename.ends_with("_test.go");
            bits.go_files
                .push(GoFile::plain(pkg_cache.clone(), filename, test));
        }

        for s_file in &mut bits.s_files {
            if overwrite_s.remove(&s_file.filename) {
                s_file.dir = pkg_cache.clone();
            }
        }
        for filename in overwrite_s {
            bits.s_files.push(SFile {
                dir: pkg_cache.clone(),
                filename,
            });
        }

        bits.artifact = Some(cache_obj);
        Ok(())
    }
}
