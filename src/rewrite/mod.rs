// Purpose: Rewrite test packages so package initialization runs on demand.
// Inputs/Outputs: Collects test nodes, loads their syntax, emits rewritten files into the work dir.
// Invariants: A rewritten package left uninitialized keeps zero values; GopherTestInit replays
//             the original variable initializers and init funcs in the checker's order.
// Gotchas: Discovered test imports are wired after the pass, never mid-wave.

pub mod edit;
pub mod infer;
pub mod loader;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::info;
use parking_lot::Mutex;

use crate::dag::{Dag, GoFile, Node, NodeId, RewriteMeta, VisitCx};
use crate::errors::Error;
use crate::gosrc::ast::{Decl, Span};
use crate::rewrite::edit::{Edit, apply};
use crate::rewrite::infer::{InferCx, qualify_for_file};
use crate::rewrite::loader::{LoadedFile, Loader, PackageScope, init_order};
use crate::util::ensure_dir;

const INIT_ORDER_LAST: usize = usize::MAX;

pub struct DeferredIniter {
    pub work_dir: PathBuf,
    state: Mutex<CollectState>,
    loaded: Option<Loaded>,
}

#[derive(Default)]
struct CollectState {
    /// Every visited node, keyed by import path; isolated clones shadow
    /// their base so discovered imports bind to the linked variant.
    nodes: HashMap<String, NodeId>,
    /// Test nodes without a cached artifact: (import path, name, dir).
    collected: HashMap<String, (NodeId, String, PathBuf)>,
    dirs: HashMap<String, PathBuf>,
    pending_edges: Vec<(NodeId, NodeId)>,
}

struct Loaded {
    loader: Mutex<Loader>,
    scopes: HashMap<String, Arc<PackageScope>>,
    orders: HashMap<String, HashMap<String, usize>>,
}

impl DeferredIniter {
    pub fn new(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            state: Mutex::new(CollectState::default()),
            loaded: None,
        }
    }

    /// First pass: record every node, and remember test packages that still
    /// need building.
    pub fn collect(&self, _cx: &VisitCx<'_>, node: &mut Node) -> Result<()> {
        let mut state = self.state.lock();
        let bits = node.bits()?;
        let is_isolated = node.key.0.ends_with("+isolated");
        match state.nodes.entry(node.import_path.clone()) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if is_isolated {
                    slot.insert(node.id);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(node.id);
            }
        }
        state
            .dirs
            .entry(node.import_path.clone())
            .or_insert_with(|| bits.source_dir.clone());
        if bits.artifact.is_some() || !bits.tests {
            return Ok(());
        }
        if state
            .collected
            .insert(
                node.import_path.clone(),
                (node.id, bits.name.clone(), bits.source_dir.clone()),
            )
            .is_some()
        {
            return Err(anyhow!("package {:?} already collected", node.import_path));
        }
        Ok(())
    }

    /// Second pass: parse every collected package with its full directory
    /// context and compute initialization order.
    pub fn load_packages(&mut self) -> Result<()> {
        let state = self.state.lock();
        let loader = Loader::new(state.dirs.clone());
        let mut scopes = HashMap::new();
        let mut orders = HashMap::new();
        for (import_path, (_, name, dir)) in &state.collected {
            let scope = loader
                .load_scope(import_path, dir, name, true)
                .with_context(|| format!("loading {import_path:?}"))?;
            let order = init_order(&scope);
            orders.insert(import_path.clone(), order);
            scopes.insert(import_path.clone(), Arc::new(scope));
        }
        drop(state);
        self.loaded = Some(Loaded {
            loader: Mutex::new(loader),
            scopes,
            orders,
        });
        Ok(())
    }

    /// Third pass: transform each collected node's test files.
    pub fn rewrite(&self, _cx: &VisitCx<'_>, node: &mut Node) -> Result<()> {
        if !node.has_tests() || node.artifact().is_some() {
            return Ok(());
        }
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| anyhow!("rewrite before load"))?;
        let scope = loaded
            .scopes
            .get(&node.import_path)
            .cloned()
            .ok_or_else(|| anyhow!("package {:?} missing", node.import_path))?;
        let order = &loaded.orders[&node.import_path];

        info!("rewrite {:?}", node.import_path);

        let bits = node.bits()?;
        let test_files: Vec<String> = bits
            .go_files
            .iter()
            .filter(|f| f.test)
            .map(|f| f.filename.clone())
            .collect();

        // Every test file the node carries must have parsed into the scope.
        let mut targets: Vec<&LoadedFile> = Vec::new();
        for filename in &test_files {
            let file = scope
                .files
                .iter()
                .find(|f| &f.filename == filename)
                .ok_or_else(|| Error::UnresolvableType {
                    name: "package".to_string(),
                    file: filename.clone(),
                })
                .with_context(|| format!("package {:?} missing test files", node.import_path))?;
            targets.push(file);
        }
        if targets.is_empty() {
            return Err(anyhow!(
                "package {:?} missing test files",
                node.import_path
            ));
        }

        let out_dir = self.work_dir.join("rewrite").join(&node.import_path);
        ensure_dir(&out_dir)?;

        // Pre-assign init name ranges per file so parallel workers produce
        // deterministic names.
        let mut init_bases = Vec::with_capacity(targets.len());
        let mut next_base = 0usize;
        for file in &targets {
            init_bases.push(next_base);
            next_base += count_inits(file);
        }

        let scope_ref: &PackageScope = &scope;
        let transforms: Vec<Result<FileTransform>> = {
            let results: Mutex<Vec<(usize, Result<FileTransform>)>> = Mutex::new(Vec::new());
            // A small fixed pool: two files in flight at a time.
            std::thread::scope(|s| {
                for chunk in targets.iter().enumerate().collect::<Vec<_>>().chunks(2) {
                    let mut handles = Vec::new();
                    for (idx, file) in chunk {
                        let idx = *idx;
                        let file: &LoadedFile = file;
                        let results = &results;
                        let init_base = init_bases[idx];
                        handles.push(s.spawn(move || {
                            let outcome = transform_file(
                                file,
                                scope_ref,
                                &loaded.loader,
                                order,
                                idx,
                                init_base,
                            );
                            results.lock().push((idx, outcome));
                        }));
                    }
                    for handle in handles {
                        let _ = handle.join();
                    }
                }
            });
            let mut results = results.into_inner();
            results.sort_by_key(|(idx, _)| *idx);
            results.into_iter().map(|(_, r)| r).collect()
        };

        let mut invocations: Vec<Invocation> = Vec::new();
        let mut new_files: Vec<String> = Vec::new();
        let mut test_imports: HashSet<String> = HashSet::new();
        for transform in transforms {
            let transform =
                transform.with_context(|| format!("rewriting {:?}", node.import_path))?;
            test_imports.extend(transform.imports.iter().cloned());
            if let Some(text) = transform.new_text {
                let path = out_dir.join(&transform.filename);
                fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
                new_files.push(transform.filename.clone());
            }
            invocations.extend(transform.invocations);
        }

        if !invocations.is_empty() {
            invocations.sort_by_key(|inv| (inv.order, inv.file_idx, inv.decl_idx));
            let generated = generated_file_name(&scope.name);
            let mut body = String::new();
            body.push_str(&format!("package {}\n\nfunc GopherTestInit() {{\n", scope.name));
            for inv in &invocations {
                body.push_str(&format!("\t{}()\n", inv.name));
            }
            body.push_str("}\n");
            let path = out_dir.join(&generated);
            fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
            new_files.push(generated);
        }

        if new_files.is_empty() {
            return Ok(());
        }

        // Patch file locations for changed files; add the generated one.
        let bits = node.bits_mut()?;
        let mut to_add: HashSet<String> = new_files.iter().cloned().collect();
        for go_file in &mut bits.go_files {
            if to_add.remove(&go_file.filename) {
                go_file.dir = out_dir.clone();
            }
        }
        for filename in to_add {
            let test = filename.ends_with("_test.go");
            bits.go_files
                .push(GoFile::plain(out_dir.clone(), filename, test));
        }
        node.rewrite_meta = Some(RewriteMeta {
            changed: true,
            out_dir,
            generated_files: new_files,
        });

        // Queue newly discovered test-only imports; edges land after the
        // pass so sibling visitors never chase each other's locks.
        let bits = node.bits()?;
        let existing: HashSet<NodeId> = bits.imports.iter().map(|e| e.node).collect();
        let mut state = self.state.lock();
        let mut pending = Vec::new();
        for import_path in &test_imports {
            if import_path == &node.import_path || import_path == "C" || import_path == "unsafe" {
                continue;
            }
            let target = state
                .nodes
                .get(import_path)
                .copied()
                .ok_or_else(|| anyhow!("could not find import {import_path:?}"))?;
            if existing.contains(&target) || target == node.id {
                continue;
            }
            pending.push((node.id, target));
        }
        state.pending_edges.extend(pending);
        Ok(())
    }

    /// Apply edges queued during the rewrite pass.
    pub fn apply_discovered_imports(&self, dag: &Dag) -> Result<()> {
        let pending = std::mem::take(&mut self.state.lock().pending_edges);
        for (from, to) in pending {
            dag.add_import_edge(from, to, true)?;
        }
        Ok(())
    }

    /// Paths of the packages collected for rewriting, for diagnostics.
    pub fn collected_paths(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut paths: Vec<String> = state.collected.keys().cloned().collect();
        paths.sort();
        paths
    }
}

pub fn generated_file_name(package_name: &str) -> String {
    format!("gophertest_generated_{package_name}_test.go")
}

struct Invocation {
    order: usize,
    file_idx: usize,
    decl_idx: usize,
    name: String,
}

struct FileTransform {
    filename: String,
    /// None when the file needed no changes.
    new_text: Option<String>,
    invocations: Vec<Invocation>,
    /// Import paths of the file after rewriting, including minted aliases.
    imports: Vec<String>,
}

fn count_inits(file: &LoadedFile) -> usize {
    let mut count = 0;
    for decl in &file.ast.decls {
        match decl {
            Decl::Func(f) if is_plain_init(f) => count += 1,
            Decl::Var(decl) => {
                count += decl.specs.iter().filter(|s| !s.values.is_empty()).count();
            }
            _ => {}
        }
    }
    count
}

fn is_plain_init(f: &crate::gosrc::ast::FuncDecl) -> bool {
    f.name == "init"
        && !f.has_recv
        && f.params.is_empty()
        && f.results.is_empty()
        && f.body.is_some()
}

fn transform_file(
    file: &LoadedFile,
    scope: &PackageScope,
    loader: &Mutex<Loader>,
    order: &HashMap<String, usize>,
    file_idx: usize,
    init_base: usize,
) -> Result<FileTransform> {
    let imports_table = file.import_table();
    let cx = InferCx::new(loader, scope, &imports_table);

    let mut edits: Vec<Edit> = Vec::new();
    let mut appended = String::new();
    let mut invocations: Vec<Invocation> = Vec::new();
    let mut next_init = init_base;
    let mut decl_idx = 0usize;

    // File-scoped alias allocation keeps parallel rewrites deterministic.
    let mut alias_by_path: HashMap<String, String> = HashMap::new();
    for (alias, path) in &imports_table {
        alias_by_path.insert(path.clone(), alias.clone());
    }
    let mut added_imports: Vec<(String, String)> = Vec::new();
    let mut next_alias = 0usize;

    for decl in &file.ast.decls {
        match decl {
            Decl::Func(f) if is_plain_init(f) => {
                let name = format!("GeneratedInit{next_init}");
                next_init += 1;
                edits.push(Edit::replace(
                    f.name_span.start,
                    f.name_span.end,
                    name.clone(),
                ));
                invocations.push(Invocation {
                    order: INIT_ORDER_LAST,
                    file_idx,
                    decl_idx,
                    name,
                });
                decl_idx += 1;
            }
            Decl::Var(var_decl) => {
                for spec in &var_decl.specs {
                    if spec.values.is_empty() {
                        continue;
                    }
                    let spec_order = spec
                        .names
                        .iter()
                        .filter_map(|(n, _)| order.get(n))
                        .min()
                        .copied()
                        .unwrap_or(INIT_ORDER_LAST);

                    let names: Vec<&str> = spec.names.iter().map(|(n, _)| n.as_str()).collect();
                    let value_span = Span {
                        start: spec.values[0].span.start,
                        end: spec.values.last().expect("nonempty").span.end,
                        line: 0,
                        column: 0,
                    };
                    let assignment = format!(
                        "{} = {}",
                        names.join(", "),
                        &file.src[value_span.start..value_span.end]
                    );

                    let decl_text = match &spec.ty {
                        Some((_, ty_span)) => {
                            // The declared type is already valid in this file.
                            format!(
                                "{} {}",
                                names.join(", "),
                                &file.src[ty_span.start..ty_span.end]
                            )
                        }
                        None => {
                            let mut rendered: Vec<String> = Vec::new();
                            let values: Vec<&crate::gosrc::ast::Expr> =
                                if spec.values.len() == spec.names.len() {
                                    spec.values.iter().collect()
                                } else {
                                    vec![&spec.values[0]]
                                };
                            for value in values {
                                let inferred = cx.infer(value).map_err(|e| {
                                    anyhow!(
                                        "{}: could not resolve a type for {:?}: {e}",
                                        file.filename,
                                        names.join(", "),
                                    )
                                })?;
                                let qualified =
                                    qualify_for_file(&inferred, &scope.import_path, |path| {
                                        if let Some(alias) = alias_by_path.get(path) {
                                            return alias.clone();
                                        }
                                        let alias = format!("GeneratedImport{next_alias}");
                                        next_alias += 1;
                                        alias_by_path.insert(path.to_string(), alias.clone());
                                        added_imports.push((alias.clone(), path.to_string()));
                                        alias
                                    });
                                rendered.push(qualified.render());
                            }
                            if rendered.len() == 1 || rendered.iter().all(|r| r == &rendered[0]) {
                                format!("{} {}", names.join(", "), rendered[0])
                            } else if var_decl.grouped {
                                names
                                    .iter()
                                    .zip(rendered.iter())
                                    .map(|(n, t)| format!("{n} {t}"))
                                    .collect::<Vec<_>>()
                                    .join("\n\t")
                            } else {
                                names
                                    .iter()
                                    .zip(rendered.iter())
                                    .map(|(n, t)| format!("var {n} {t}"))
                                    .collect::<Vec<_>>()
                                    .join("\n")
                            }
                        }
                    };

                    // An ungrouped heterogeneous spec replaces its whole
                    // declaration, keyword included.
                    let replace_decl = decl_text.starts_with("var ");
                    let (start, end) = if replace_decl {
                        (var_decl.span.start, var_decl.span.end)
                    } else {
                        (spec.span.start, spec.span.end)
                    };
                    edits.push(Edit::replace(start, end, decl_text));

                    let init_name = format!("GeneratedInit{next_init}");
                    next_init += 1;
                    appended.push_str(&format!(
                        "\nfunc {init_name}() {{\n\t{assignment}\n}}\n"
                    ));
                    invocations.push(Invocation {
                        order: spec_order,
                        file_idx,
                        decl_idx,
                        name: init_name,
                    });
                    decl_idx += 1;
                }
            }
            _ => {}
        }
    }

    let mut imports: Vec<String> = file.ast.imports.iter().map(|i| i.path.clone()).collect();
    imports.extend(added_imports.iter().map(|(_, p)| p.clone()));

    if edits.is_empty() && appended.is_empty() {
        return Ok(FileTransform {
            filename: file.filename.clone(),
            new_text: None,
            invocations,
            imports,
        });
    }

    if !added_imports.is_empty() {
        let mut splice = String::new();
        for (alias, path) in &added_imports {
            splice.push_str(&format!("\nimport {alias} \"{path}\""));
        }
        edits.push(Edit::insert(file.ast.import_insert_offset, splice));
    }

    let mut new_text = apply(&file.src, edits)?;
    new_text.push_str(&appended);

    Ok(FileTransform {
        filename: file.filename.clone(),
        new_text: Some(new_text),
        invocations,
        imports,
    })
}

#[cfg(test)]
mod tests {
    use super::{DeferredIniter, generated_file_name};
    use crate::dag::testutil::pkg;
    use crate::dag::{CancelToken, Dag, Node, VisitCx};
    use crate::pkg::Package;
    use std::fs;
    use std::path::Path;

    fn seed_package(dir: &Path, import_path: &str, files: &[(&str, &str)]) -> Package {
        let name = import_path.rsplit('/').next().unwrap_or(import_path);
        let pkg_dir = dir.join(name);
        fs::create_dir_all(&pkg_dir).expect("mkdir");
        let mut p = pkg(import_path, &[]);
        p.dir = pkg_dir.clone();
        p.go_files.clear();
        for (filename, src) in files {
            fs::write(pkg_dir.join(filename), src).expect("write");
            if filename.ends_with("_test.go") {
                p.test_go_files.push(filename.to_string());
            } else {
                p.go_files.push(filename.to_string());
            }
        }
        p
    }

    fn run_rewrite(dag: &Dag, di: &mut DeferredIniter) {
        let cancel = CancelToken::new();
        dag.visit_all_from_right(&cancel, &|cx: &VisitCx, n: &mut Node| di.collect(cx, n))
            .expect("collect");
        di.load_packages().expect("load");
        dag.visit_all_from_right(&cancel, &|cx: &VisitCx, n: &mut Node| di.rewrite(cx, n))
            .expect("rewrite");
        di.apply_discovered_imports(dag).expect("wire imports");
    }

    #[test]
    fn single_leaf_package_rewrites_var_and_registers_init() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).expect("mkdir work");

        let p = seed_package(
            tmp.path(),
            "p",
            &[
                ("p.go", "package p\n\nvar X = 1\n"),
                ("p_test.go", "package p\n\nvar Y = 2\n\nfunc TestX(t *T) {}\n"),
            ],
        );
        let dag = Dag::new();
        dag.add(&p, true, false).expect("add");

        let mut di = DeferredIniter::new(work.clone());
        run_rewrite(&dag, &mut di);

        let out_dir = work.join("rewrite").join("p");
        let rewritten = fs::read_to_string(out_dir.join("p_test.go")).expect("rewritten");
        assert!(rewritten.contains("var Y int"), "got: {rewritten}");
        assert!(rewritten.contains("func GeneratedInit0() {"));
        assert!(rewritten.contains("Y = 2"));

        let generated =
            fs::read_to_string(out_dir.join(generated_file_name("p"))).expect("generated");
        assert!(generated.contains("package p"));
        assert!(generated.contains("func GopherTestInit()"));
        assert!(generated.contains("GeneratedInit0()"));

        // Node now carries the generated file and the redirected test file.
        let id = dag.find("p").expect("p");
        let slot = dag.handle(id);
        let node = slot.read();
        let bits = node.bits.as_ref().expect("bits");
        let test_file = bits
            .go_files
            .iter()
            .find(|f| f.filename == "p_test.go")
            .expect("test file");
        assert_eq!(test_file.dir, out_dir);
        assert!(
            bits.go_files
                .iter()
                .any(|f| f.filename == generated_file_name("p"))
        );
        assert!(node.rewrite_meta.as_ref().is_some_and(|m| m.changed));
    }

    #[test]
    fn init_funcs_are_renamed_and_run_last() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).expect("mkdir");

        let p = seed_package(
            tmp.path(),
            "p",
            &[(
                "p_test.go",
                "package p\n\nvar A = val()\n\nfunc init() { A = 9 }\n\nfunc val() int { return 3 }\n\nfunc TestA(t *T) {}\n",
            )],
        );
        let dag = Dag::new();
        dag.add(&p, true, false).expect("add");

        let mut di = DeferredIniter::new(work.clone());
        run_rewrite(&dag, &mut di);

        let out_dir = work.join("rewrite").join("p");
        let rewritten = fs::read_to_string(out_dir.join("p_test.go")).expect("rewritten");
        assert!(rewritten.contains("func GeneratedInit"), "got: {rewritten}");
        assert!(!rewritten.contains("func init()"));
        assert!(rewritten.contains("var A int"));

        let generated =
            fs::read_to_string(out_dir.join(generated_file_name("p"))).expect("generated");
        // The var assignment (GeneratedInit0, declared first) must run
        // before the renamed init (GeneratedInit1, order last).
        let var_pos = generated.find("GeneratedInit0()").expect("var init");
        let init_pos = generated.find("GeneratedInit1()").expect("renamed init");
        assert!(var_pos < init_pos, "got: {generated}");
    }

    #[test]
    fn existing_import_alias_is_reused_for_foreign_types() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).expect("mkdir");

        let other = seed_package(
            tmp.path(),
            "example.com/other",
            &[(
                "other.go",
                "package other\n\ntype T struct{}\n\nfunc Chans() map[string]chan<- *T { return nil }\n",
            )],
        );
        let mut p = seed_package(
            tmp.path(),
            "example.com/p",
            &[(
                "p_test.go",
                "package p\n\nimport \"example.com/other\"\n\nvar F = other.Chans()\n\nfunc TestF(t *T) {}\n",
            )],
        );
        p.name = "p".to_string();
        p.test_imports = vec!["example.com/other".to_string()];

        let dag = Dag::new();
        dag.add(&p, true, false).expect("add p");
        dag.add(&other, false, false).expect("add other");

        let mut di = DeferredIniter::new(work.clone());
        run_rewrite(&dag, &mut di);

        let out_dir = work.join("rewrite").join("example.com/p");
        let rewritten = fs::read_to_string(out_dir.join("p_test.go")).expect("rewritten");
        // `other` is already imported in this file, so its alias is reused.
        assert!(
            rewritten.contains("var F map[string]chan<- *other.T"),
            "got: {rewritten}"
        );
    }

    #[test]
    fn rewrite_of_rewritten_output_is_stable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let work_one = tmp.path().join("work1");
        let work_two = tmp.path().join("work2");
        fs::create_dir_all(&work_one).expect("mkdir");
        fs::create_dir_all(&work_two).expect("mkdir");

        let p = seed_package(
            tmp.path(),
            "p",
            &[(
                "p_test.go",
                "package p\n\nvar X = 1\n\nfunc TestX(t *T) {}\n",
            )],
        );
        let dag = Dag::new();
        dag.add(&p, true, false).expect("add");
        let mut di = DeferredIniter::new(work_one.clone());
        run_rewrite(&dag, &mut di);

        // Feed the rewritten output through a second pass.
        let first_dir = work_one.join("rewrite").join("p");
        let mut second = seed_package(tmp.path(), "q", &[]);
        second.import_path = "p".to_string();
        second.name = "p".to_string();
        second.dir = first_dir.clone();
        second.test_go_files = vec![
            "p_test.go".to_string(),
            generated_file_name("p"),
        ];
        second.go_files.clear();

        let dag_two = Dag::new();
        dag_two.add(&second, true, false).expect("add second");
        let mut di_two = DeferredIniter::new(work_two.clone());
        run_rewrite(&dag_two, &mut di_two);

        // No valued vars and no plain init funcs remain, so nothing needed
        // rewriting and the node is untouched.
        let id = dag_two.find("p").expect("p");
        let slot = dag_two.handle(id);
        let node = slot.read();
        assert!(node.rewrite_meta.is_none());
    }
}
