// Purpose: Compile, assemble and archive each node into its artifact.
// Inputs/Outputs: Drives the Go toolchain per node; fills artifact paths and build meta.
// Invariants: A node is only dispatched after every non-test import has an artifact.
// Gotchas: Rewritten packages are materialized with symlinks so the compiler sees one directory.

pub mod tools;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::info;

use crate::dag::{Dag, Node, VisitCx, Visitor};
use crate::errors::Error;
use crate::util::ensure_dir;
use tools::{AssembleArgs, CompileArgs, PackArgs, Tools};

/// Standard-library packages that look complete but carry native
/// primitives, lifted from the compiler's own build rules.
const INCOMPLETE_STD: &[&str] = &[
    "bytes",
    "internal/poll",
    "net",
    "os",
    "runtime/pprof",
    "runtime/trace",
    "sync",
    "syscall",
    "time",
];

pub struct Builder<'a> {
    pub tools: &'a Tools,
    pub work_dir: PathBuf,
}

#[derive(Debug, Default)]
struct BuildInfo {
    compiling_standard_library: bool,
    compiling_runtime_library: bool,
    complete: bool,
    has_asm: bool,
    build_id: String,
    build_dir: PathBuf,
    node_dir: PathBuf,
    compile_source_dir: PathBuf,
    obj_file: PathBuf,
    asm_header_file: PathBuf,
    sym_abis_file: PathBuf,
    import_config_file: PathBuf,
    include_dir: PathBuf,
}

impl Visitor for Builder<'_> {
    fn visit(&self, cx: &VisitCx<'_>, node: &mut Node) -> Result<()> {
        if node.artifact().is_some() || node.is_intrinsic() {
            node.build_meta = Some(crate::dag::BuildMeta { rebuilt: false });
            return Ok(());
        }
        cx.cancel.bail_if_cancelled()?;

        info!("building {:?}", node.import_path);

        let build_id = node.build_id()?.to_string();
        let bits = node.bits()?;

        let mut bi = BuildInfo {
            build_id,
            build_dir: self.work_dir.join("build"),
            ..BuildInfo::default()
        };
        // Per-node directory keyed by the node key, so a repaired package's
        // compile and isolated variants never collide.
        bi.node_dir = bi.build_dir.join(node.key.0.replace('/', std::path::MAIN_SEPARATOR_STR));
        ensure_dir(&bi.node_dir)?;

        bi.compile_source_dir = bits.source_dir.clone();
        let has_rewrite = bits
            .go_files
            .iter()
            .map(|f| &f.dir)
            .chain(bits.s_files.iter().map(|f| &f.dir))
            .any(|dir| dir != &bi.compile_source_dir);
        if has_rewrite {
            for go_file in &bits.go_files {
                link_into(&go_file.path(), &bi.node_dir.join(&go_file.filename))?;
            }
            for s_file in &bits.s_files {
                link_into(&s_file.path(), &bi.node_dir.join(&s_file.filename))?;
            }
            bi.compile_source_dir = bi.node_dir.clone();
        }

        bi.has_asm = !bits.s_files.is_empty();
        bi.include_dir = bi.node_dir.join(format!("include_{}", bits.name));
        ensure_dir(&bi.include_dir)?;
        bi.obj_file = bi.node_dir.join(format!("{}.obj", bits.cache_name));
        bi.asm_header_file = bi.include_dir.join("go_asm.h");
        bi.sym_abis_file = bi.node_dir.join(format!("{}_symabis", bits.cache_name));
        bi.import_config_file = bi.node_dir.join(format!("{}_importcfg", bits.cache_name));

        let (std_lib, runtime_lib, complete) = flags_for(
            &node.import_path,
            bits.goroot,
            bi.has_asm,
        );
        bi.compiling_standard_library = std_lib;
        bi.compiling_runtime_library = runtime_lib;
        bi.complete = complete;

        if bi.has_asm {
            self.gen_sym_abis(node, &bi)?;
        }

        self.compile(cx.dag, node, &bi)?;

        if bi.has_asm {
            self.assemble_and_pack(node, &bi)?;
        }

        self.tools.write_build_id(&bi.obj_file)?;

        let bits = node.bits_mut()?;
        bits.artifact = Some(bi.obj_file);
        node.build_meta = Some(crate::dag::BuildMeta { rebuilt: true });
        Ok(())
    }
}

impl Builder<'_> {
    fn gen_sym_abis(&self, node: &Node, bi: &BuildInfo) -> Result<()> {
        let bits = node.bits()?;
        fs::write(&bi.asm_header_file, b"")
            .with_context(|| format!("write {}", bi.asm_header_file.display()))?;
        let args = AssembleArgs {
            working_directory: bi.compile_source_dir.clone(),
            files: bits.s_files.iter().map(|f| f.filename.clone()).collect(),
            trim_path: format!("{}=>", bi.build_dir.display()),
            package_import_path: node.import_path.clone(),
            include_dirs: vec![
                bi.include_dir.clone(),
                bi.node_dir.clone(),
                self.tools.ctx.goroot_pkg_include(),
            ],
            defines: vec![
                format!("GOOS_{}", self.tools.ctx.goos),
                format!("GOARCH_{}", self.tools.ctx.goarch),
            ],
            gen_sym_abis: true,
            output_file: bi.sym_abis_file.clone(),
        };
        self.tools.assemble(&args)
    }

    fn compile(&self, dag: &Dag, node: &Node, bi: &BuildInfo) -> Result<()> {
        let cfg = import_config(dag, node)?;
        fs::write(&bi.import_config_file, cfg)
            .with_context(|| format!("write {}", bi.import_config_file.display()))?;

        let bits = node.bits()?;
        let mut files = Vec::new();
        for go_file in &bits.go_files {
            if go_file.test && !bits.tests {
                return Err(anyhow!(
                    "package {:?} contains unused tests",
                    node.import_path
                ));
            }
            if let Some(generator) = &go_file.generator {
                let path = go_file.path();
                let mut out = fs::File::create(&path)
                    .with_context(|| format!("create {}", path.display()))?;
                generator.generate(dag, node, &mut out)?;
            }
            files.push(go_file.filename.clone());
        }

        let mut args = CompileArgs {
            working_directory: bi.compile_source_dir.clone(),
            files,
            trim_path: format!("{}=>", bi.build_dir.display()),
            concurrency: 4,
            package_import_path: node.import_path.clone(),
            import_config_file: bi.import_config_file.clone(),
            compiling_standard_library: bi.compiling_standard_library,
            compiling_runtime_library: bi.compiling_runtime_library,
            complete: bi.complete,
            pack: true,
            output_file: bi.obj_file.clone(),
            build_id: format!("{}/{}", bi.build_id, bi.build_id),
            sym_abis_file: None,
            asm_header_file: None,
        };
        if bi.has_asm {
            args.sym_abis_file = Some(bi.sym_abis_file.clone());
            args.asm_header_file = Some(bi.asm_header_file.clone());
        }
        self.tools.compile(&args)
    }

    fn assemble_and_pack(&self, node: &Node, bi: &BuildInfo) -> Result<()> {
        let bits = node.bits()?;
        let mut asm_objs = Vec::new();
        for s_file in &bits.s_files {
            let asm_obj = bi
                .node_dir
                .join(format!("{}.o", s_file.filename.trim_end_matches(".s")));
            let args = AssembleArgs {
                working_directory: bi.compile_source_dir.clone(),
                files: vec![s_file.filename.clone()],
                trim_path: format!("{}=>", bi.build_dir.display()),
                package_import_path: node.import_path.clone(),
                include_dirs: vec![
                    bi.include_dir.clone(),
                    bi.node_dir.clone(),
                    self.tools.ctx.goroot_pkg_include(),
                ],
                defines: vec![
                    format!("GOOS_{}", self.tools.ctx.goos),
                    format!("GOARCH_{}", self.tools.ctx.goarch),
                ],
                gen_sym_abis: false,
                output_file: asm_obj.clone(),
            };
            self.tools.assemble(&args)?;
            asm_objs.push(asm_obj);
        }

        let args = PackArgs {
            working_directory: bi.compile_source_dir.clone(),
            object_file: bi.obj_file.clone(),
            names: asm_objs,
        };
        self.tools.pack(&args)
    }
}

/// The compiler's import configuration: vendoring rewrites first, then one
/// packagefile line per non-intrinsic import.
pub fn import_config(dag: &Dag, node: &Node) -> Result<String> {
    let bits = node.bits()?;
    let mut cfg = String::from("# import config\n");
    for (original, rewrite) in &bits.import_map {
        cfg.push_str(&format!("importmap {original}={rewrite}\n"));
    }
    for edge in &bits.imports {
        let slot = dag.handle(edge.node);
        let imported = slot.read();
        if imported.is_intrinsic() {
            continue;
        }
        let artifact = imported
            .artifact()
            .ok_or_else(|| Error::MissingArtifact {
                import_path: imported.import_path.clone(),
            })?;
        cfg.push_str(&format!(
            "packagefile {}={}\n",
            imported.import_path,
            artifact.display()
        ));
    }
    Ok(cfg)
}

/// Flag table for the compiler: standard library, runtime library, and
/// whether the package is complete (no native parts).
pub fn flags_for(import_path: &str, goroot: bool, has_asm: bool) -> (bool, bool, bool) {
    // GOROOT non-domain packages are considered std lib packages by gc.
    let first_segment = import_path.split('/').next().unwrap_or(import_path);
    let std_lib = goroot && !first_segment.contains('.');

    let mut runtime_lib = false;
    if std_lib {
        runtime_lib = matches!(import_path, "runtime" | "internal/cpu" | "internal/bytealg")
            || import_path.starts_with("runtime/internal");
    }

    let mut complete = !has_asm;
    if std_lib && INCOMPLETE_STD.contains(&import_path) {
        complete = false;
    }
    (std_lib, runtime_lib, complete)
}

#[cfg(unix)]
fn link_into(target: &Path, link: &Path) -> Result<()> {
    if link.exists() {
        let _ = fs::remove_file(link);
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("symlink {} -> {}", link.display(), target.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn link_into(target: &Path, link: &Path) -> Result<()> {
    crate::util::file_copy(target, link)
}

#[cfg(test)]
mod tests {
    use super::{flags_for, import_config};
    use crate::dag::testutil::pkg;
    use crate::dag::{Dag, HashMeta};

    #[test]
    fn std_and_runtime_flags_follow_the_table() {
        assert_eq!(flags_for("runtime", true, true), (true, true, false));
        assert_eq!(flags_for("internal/cpu", true, false), (true, true, true));
        assert_eq!(
            flags_for("runtime/internal/atomic", true, true),
            (true, true, false)
        );
        assert_eq!(flags_for("fmt", true, false), (true, false, true));
        // Complete-looking std packages with native primitives.
        assert_eq!(flags_for("sync", true, false), (true, false, false));
        assert_eq!(flags_for("net", true, false), (true, false, false));
        // Domain-qualified packages in GOROOT are not std.
        assert_eq!(
            flags_for("example.com/tool", true, false),
            (false, false, true)
        );
        assert_eq!(flags_for("fmt", false, false), (false, false, true));
    }

    #[test]
    fn import_config_lists_maps_then_packagefiles() {
        let d = Dag::new();
        let mut a = pkg("a", &["b"]);
        a.import_map
            .insert("dep".to_string(), "example.com/vendor/dep".to_string());
        d.add(&a, false, false).expect("a");
        d.add(&pkg("b", &[]), false, false).expect("b");

        let b = d.find("b").expect("b");
        {
            let slot = d.handle(b);
            let mut node = slot.write();
            node.hash_meta = Some(HashMeta {
                build_id: "x".to_string(),
            });
            node.bits.as_mut().expect("bits").artifact = Some("/work/b.obj".into());
        }

        let a = d.find("a").expect("a");
        let slot = d.handle(a);
        let node = slot.read();
        let cfg = import_config(&d, &node).expect("config");
        assert_eq!(
            cfg,
            "# import config\nimportmap dep=example.com/vendor/dep\npackagefile b=/work/b.obj\n"
        );
    }

    #[test]
    fn missing_import_artifact_is_an_error() {
        let d = Dag::new();
        d.add(&pkg("a", &["b"]), false, false).expect("a");
        d.add(&pkg("b", &[]), false, false).expect("b");
        let a = d.find("a").expect("a");
        let slot = d.handle(a);
        let node = slot.read();
        assert!(import_config(&d, &node).is_err());
    }
}
