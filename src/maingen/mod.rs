// Purpose: Discover test functions and emit the synthetic driver package.
// Inputs/Outputs: Parses test files per node; adds a generator-backed `main` node to the graph.
// Invariants: At most one TestMain per import path; unused variants stay linked under `_`.
// Gotchas: The main node is hashed late, after its imports have build IDs.

pub mod runner;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::info;
use parking_lot::Mutex;

use crate::dag::{Dag, GoFile, HashMeta, Node, NodeId, SourceGenerator, VisitCx};
use crate::errors::Error;
use crate::gosrc::ast::{Decl, FuncDecl, TypeExpr};
use crate::gosrc::parse_file;
use crate::hasher::Hasher;
use crate::pkg::Package;
use crate::util::trim_test_suffix;

#[derive(Debug, Default)]
struct TestPackage {
    import_path: String,
    dir: PathBuf,
    name: String,
    test: Option<(NodeId, String)>,
    xtest: Option<(NodeId, String)>,
    test_main: Option<(String, String)>,
    has_init: bool,
    has_xinit: bool,
    tests: Vec<(String, String)>,
    benchmarks: Vec<(String, String)>,
}

pub struct Generator {
    pub work_dir: PathBuf,
    state: Mutex<HashMap<String, TestPackage>>,
}

impl Generator {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Visitor pass: parse every test file of a tests node and record the
    /// test, benchmark and hook functions it declares.
    pub fn find_tests(&self, _cx: &VisitCx<'_>, node: &mut Node) -> Result<()> {
        if !node.has_tests() {
            return Ok(());
        }
        let bits = node.bits()?;

        let mut state = self.state.lock();
        let test_path = trim_test_suffix(&node.import_path).to_string();
        let pkg = state.entry(test_path.clone()).or_insert_with(|| TestPackage {
            import_path: test_path.clone(),
            dir: bits.source_dir.clone(),
            name: trim_test_suffix(&bits.name).to_string(),
            ..TestPackage::default()
        });

        let is_xtest = test_path != node.import_path;
        if is_xtest {
            pkg.xtest = Some((node.id, node.import_path.clone()));
        } else {
            pkg.test = Some((node.id, node.import_path.clone()));
        }

        for go_file in bits.go_files.iter().filter(|f| f.test) {
            let path = go_file.path();
            let src =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let file = parse_file(&src, &go_file.filename)?;
            for decl in &file.decls {
                let Decl::Func(fd) = decl else { continue };
                if is_test(fd) {
                    pkg.tests
                        .push((node.import_path.clone(), fd.name.clone()));
                } else if is_benchmark(fd) {
                    pkg.benchmarks
                        .push((node.import_path.clone(), fd.name.clone()));
                } else if is_test_main(fd) {
                    if let Some((_, first_file)) = &pkg.test_main {
                        return Err(Error::DuplicateTestMain {
                            import_path: node.import_path.clone(),
                            first: first_file.clone(),
                            second: go_file.filename.clone(),
                        }
                        .into());
                    }
                    pkg.test_main =
                        Some((node.import_path.clone(), go_file.filename.clone()));
                } else if is_gopher_test_init(fd) {
                    if is_xtest {
                        pkg.has_xinit = true;
                    } else {
                        pkg.has_init = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Emit the driver node: build runner targets, add the `main` node with
    /// an import edge per test variant plus the runner deps, and hash it.
    pub fn generate_main(&self, dag: &Dag, hasher: &Hasher<'_>) -> Result<()> {
        let state = self.state.lock();

        let mut id = 0usize;
        let mut next_id = || {
            let name = format!("pkg{id}");
            id += 1;
            name
        };

        // Stable iteration keeps alias numbering reproducible across runs.
        let mut paths: Vec<String> = state.keys().cloned().collect();
        paths.sort();

        let mut ctx = runner::Context::default();
        for path in &paths {
            let pkg = &state[path];
            if pkg.tests.is_empty() && pkg.benchmarks.is_empty() {
                continue;
            }
            let mut t = runner::Target {
                import_path: pkg.import_path.clone(),
                name: pkg.name.clone(),
                test_name: next_id(),
                x_test_name: next_id(),
                directory: pkg.dir.display().to_string(),
                main: "defaultMain".to_string(),
                init_func: "func(){}".to_string(),
                x_init_func: "func(){}".to_string(),
                ..runner::Target::default()
            };

            let test_main_path = pkg.test_main.as_ref().map(|(path, _)| path.as_str());
            if let Some((_, path)) = &pkg.test
                && test_main_path == Some(path.as_str())
            {
                t.import_test = true;
                t.main = format!("{}.TestMain", t.test_name);
            } else if let Some((_, path)) = &pkg.xtest
                && test_main_path == Some(path.as_str())
            {
                t.import_x_test = true;
                t.main = format!("{}.TestMain", t.x_test_name);
            }

            if pkg.test.is_some() && pkg.has_init {
                t.import_test = true;
                t.init_func = format!("{}.GopherTestInit", t.test_name);
            }
            if pkg.xtest.is_some() && pkg.has_xinit {
                t.import_x_test = true;
                t.x_init_func = format!("{}.GopherTestInit", t.x_test_name);
            }

            for (from_path, name) in &pkg.tests {
                if let Some((_, path)) = &pkg.test
                    && path == from_path
                {
                    t.import_test = true;
                    t.tests.push(runner::TestFunc {
                        package: t.test_name.clone(),
                        name: name.clone(),
                    });
                } else if let Some((_, path)) = &pkg.xtest
                    && path == from_path
                {
                    t.import_x_test = true;
                    t.tests.push(runner::TestFunc {
                        package: t.x_test_name.clone(),
                        name: name.clone(),
                    });
                }
            }
            for (from_path, name) in &pkg.benchmarks {
                if let Some((_, path)) = &pkg.test
                    && path == from_path
                {
                    t.import_test = true;
                    t.benchmarks.push(runner::TestFunc {
                        package: t.test_name.clone(),
                        name: name.clone(),
                    });
                } else if let Some((_, path)) = &pkg.xtest
                    && path == from_path
                {
                    t.import_x_test = true;
                    t.benchmarks.push(runner::TestFunc {
                        package: t.x_test_name.clone(),
                        name: name.clone(),
                    });
                }
            }

            if !t.import_test && pkg.test.is_some() {
                t.import_test = true;
                t.test_name = "_".to_string();
            }
            if !t.import_x_test && pkg.xtest.is_some() {
                t.import_x_test = true;
                t.x_test_name = "_".to_string();
            }
            ctx.targets.push(t);
        }
        ctx.targets.sort_by(|a, b| a.import_path.cmp(&b.import_path));

        let src_dir = self.work_dir.join("main");
        fs::create_dir_all(&src_dir)
            .with_context(|| format!("mkdir {}", src_dir.display()))?;

        let mut raw_imports: Vec<String> = Vec::new();
        for pkg in state.values() {
            if let Some((_, path)) = &pkg.test {
                raw_imports.push(path.clone());
            }
            if let Some((_, path)) = &pkg.xtest {
                raw_imports.push(path.clone());
            }
        }
        raw_imports.extend(runner::DEPS.iter().map(|d| d.to_string()));
        raw_imports.sort();
        raw_imports.dedup();
        drop(state);

        info!("generating driver with {} targets", ctx.targets.len());

        let pkg = Package {
            import_path: "main".to_string(),
            name: "main".to_string(),
            dir: src_dir.clone(),
            imports: raw_imports,
            ..Package::default()
        };
        let node_id = dag.add(&pkg, false, true)?;

        let slot = dag.handle(node_id);
        let mut node = slot.write();
        node.bits_mut()?.go_files.push(GoFile {
            dir: src_dir,
            filename: "main.go".to_string(),
            test: false,
            generator: Some(Arc::new(MainGoGenerator { ctx })),
        });

        let build_id = hasher
            .compute(dag, &node)
            .context("hashing main")?;
        node.hash_meta = Some(HashMeta { build_id });

        Ok(())
    }
}

struct MainGoGenerator {
    ctx: runner::Context,
}

impl SourceGenerator for MainGoGenerator {
    fn generate(&self, dag: &Dag, node: &Node, out: &mut dyn Write) -> Result<()> {
        // Weigh each target by its artifact size so the driver can run
        // cheaper packages first.
        let mut complexity: HashMap<String, i64> = HashMap::new();
        let bits = node.bits()?;
        for edge in &bits.imports {
            let slot = dag.handle(edge.node);
            let imported = slot.read();
            if imported.is_intrinsic() {
                continue;
            }
            let Some(artifact) = imported.artifact() else {
                continue;
            };
            let size = fs::metadata(artifact)
                .with_context(|| format!("stat {}", artifact.display()))?
                .len() as i64;
            complexity.insert(imported.import_path.clone(), size);
        }

        let mut ctx = self.ctx.clone();
        for target in &mut ctx.targets {
            if target.import_test
                && let Some(size) = complexity.get(&target.import_path)
            {
                target.test_complexity += size;
            }
            if target.import_x_test
                && let Some(size) = complexity.get(&format!("{}_test", target.import_path))
            {
                target.test_complexity += size;
            }
        }

        out.write_all(runner::render(&ctx).as_bytes())?;
        Ok(())
    }
}

fn param_is_star_of(fd: &FuncDecl, type_name: &str) -> bool {
    if fd.params.len() != 1 {
        return false;
    }
    let param = &fd.params[0];
    if param.names.len() > 1 {
        return false;
    }
    match &param.ty {
        TypeExpr::Pointer(inner) => matches!(
            inner.as_ref(),
            TypeExpr::Named { name, .. } if name == type_name
        ),
        _ => false,
    }
}

fn is_test(fd: &FuncDecl) -> bool {
    fd.name.starts_with("Test")
        && !fd.has_recv
        && fd.results.is_empty()
        && param_is_star_of(fd, "T")
}

fn is_benchmark(fd: &FuncDecl) -> bool {
    fd.name.starts_with("Benchmark")
        && !fd.has_recv
        && fd.results.is_empty()
        && param_is_star_of(fd, "B")
}

fn is_test_main(fd: &FuncDecl) -> bool {
    fd.name == "TestMain" && !fd.has_recv && fd.results.is_empty() && param_is_star_of(fd, "M")
}

fn is_gopher_test_init(fd: &FuncDecl) -> bool {
    fd.name == "GopherTestInit" && !fd.has_recv && fd.params.is_empty() && fd.results.is_empty()
}

#[cfg(test)]
mod tests {
    use super::Generator;
    use crate::buildctx::BuildCtx;
    use crate::dag::testutil::pkg;
    use crate::dag::{CancelToken, Dag, Node, VisitCx};
    use crate::hasher::Hasher;
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
            release_tags: Vec::new(),
            build_tags: Vec::new(),
            cgo_enabled: false,
            toolchain_version: "go version test".to_string(),
            own_version: "test".to_string(),
        }
    }

    fn seed(dir: &Path, import_path: &str, test_src: &str) -> Package {
        let name = import_path.rsplit('/').next().unwrap_or(import_path);
        let pkg_dir = dir.join(name);
        fs::create_dir_all(&pkg_dir).expect("mkdir");
        fs::write(pkg_dir.join(format!("{name}.go")), format!("package {name}\n"))
            .expect("write src");
        fs::write(pkg_dir.join(format!("{name}_test.go")), test_src).expect("write test");
        let mut p = pkg(import_path, &[]);
        p.dir = pkg_dir;
        p.test_go_files = vec![format!("{name}_test.go")];
        p
    }

    fn run_find(dag: &Dag, generator: &Generator) -> anyhow::Result<()> {
        dag.visit_all_from_right(&CancelToken::new(), &|cx: &VisitCx, n: &mut Node| {
            generator.find_tests(cx, n)
        })
    }

    /// The driver node imports the runner deps, so hashing it needs them in
    /// the graph with build IDs.
    fn seed_runner_deps(dir: &Path, dag: &Dag) {
        for dep in super::runner::DEPS {
            let name = dep.rsplit('/').next().unwrap_or(dep);
            let pkg_dir = dir.join("deps").join(dep);
            fs::create_dir_all(&pkg_dir).expect("mkdir dep");
            fs::write(pkg_dir.join(format!("{name}.go")), format!("package {name}\n"))
                .expect("write dep");
            let mut p = pkg(dep, &[]);
            p.dir = pkg_dir;
            p.go_files = vec![format!("{name}.go")];
            dag.add(&p, false, false).expect("add dep");
        }
    }

    #[test]
    fn finds_tests_and_adds_main_node() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).expect("mkdir");

        let p = seed(
            tmp.path(),
            "p",
            "package p\n\nimport \"testing\"\n\nfunc TestX(t *testing.T) {}\n\nfunc BenchmarkY(b *testing.B) {}\n",
        );
        let dag = Dag::new();
        dag.add(&p, true, false).expect("add");
        seed_runner_deps(tmp.path(), &dag);
        let ctx = test_ctx();
        let hasher = Hasher { ctx: &ctx };
        dag.visit_all_from_right(&CancelToken::new(), &hasher)
            .expect("hash");

        let generator = Generator::new(work);
        run_find(&dag, &generator).expect("find tests");
        generator.generate_main(&dag, &hasher).expect("generate");

        let main = dag.find("main").expect("main node");
        let slot = dag.handle(main);
        let node = slot.read();
        assert!(node.hash_meta.is_some());
        let bits = node.bits.as_ref().expect("bits");
        assert!(bits.go_files.iter().any(|f| f.filename == "main.go"));
        // Driver imports the test node and the runner deps.
        assert!(bits.imports.len() >= 2);
    }

    #[test]
    fn duplicate_test_main_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).expect("mkdir");

        let name_dir = tmp.path().join("p");
        fs::create_dir_all(&name_dir).expect("mkdir");
        fs::write(name_dir.join("p.go"), "package p\n").expect("src");
        fs::write(
            name_dir.join("a_test.go"),
            "package p\n\nimport \"testing\"\n\nfunc TestMain(m *testing.M) {}\n",
        )
        .expect("a");
        fs::write(
            name_dir.join("b_test.go"),
            "package p\n\nimport \"testing\"\n\nfunc TestMain(m *testing.M) {}\n",
        )
        .expect("b");

        let mut p = pkg("p", &[]);
        p.dir = name_dir;
        p.test_go_files = vec!["a_test.go".to_string(), "b_test.go".to_string()];

        let dag = Dag::new();
        dag.add(&p, true, false).expect("add");
        let generator = Generator::new(work);
        let err = run_find(&dag, &generator).expect_err("duplicate TestMain");
        assert!(err.to_string().contains("TestMain"));
    }

    #[test]
    fn zero_target_driver_still_generates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).expect("mkdir");

        let dag = Dag::new();
        seed_runner_deps(tmp.path(), &dag);
        let ctx = test_ctx();
        let hasher = Hasher { ctx: &ctx };
        dag.visit_all_from_right(&CancelToken::new(), &hasher)
            .expect("hash deps");
        let generator = Generator::new(work);
        generator.generate_main(&dag, &hasher).expect("generate");
        assert!(dag.find("main").is_some());
    }
}
