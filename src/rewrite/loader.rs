// Purpose: Load package syntax and build the indexes the rewriter infers against.
// Inputs/Outputs: Parses .go files per directory; yields scopes, export indexes and init order.
// Invariants: Export-index type names are normalized to full import paths, never aliases.
// Gotchas: Files of a directory split into scopes by package clause; xtest lives apart from its base.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use log::debug;

use crate::gosrc::ast::{Decl, File, Signature, Span, TypeExpr};
use crate::gosrc::lexer::{Lexer, Symbol, TokenKind};
use crate::gosrc::parse_file;

const BUILTIN_TYPES: &[&str] = &[
    "bool",
    "string",
    "int",
    "int8",
    "int16",
    "int32",
    "int64",
    "uint",
    "uint8",
    "uint16",
    "uint32",
    "uint64",
    "uintptr",
    "byte",
    "rune",
    "float32",
    "float64",
    "complex64",
    "complex128",
    "error",
    "any",
];

pub fn is_builtin_type(name: &str) -> bool {
    BUILTIN_TYPES.contains(&name)
}

#[derive(Debug)]
pub struct LoadedFile {
    pub filename: String,
    pub src: String,
    pub ast: File,
}

impl LoadedFile {
    pub fn import_table(&self) -> HashMap<String, String> {
        let mut table = HashMap::new();
        for spec in &self.ast.imports {
            let alias = match &spec.alias {
                Some(a) if a == "_" || a == "." => continue,
                Some(a) => a.clone(),
                None => default_import_name(&spec.path),
            };
            table.insert(alias, spec.path.clone());
        }
        table
    }
}

/// One package's worth of parsed files plus lookup indexes. Type names in
/// the indexes are normalized: foreign packages appear as full import paths,
/// package-local names as this scope's import path, builtins bare.
#[derive(Debug)]
pub struct PackageScope {
    pub import_path: String,
    pub name: String,
    pub dir: PathBuf,
    pub files: Vec<LoadedFile>,
    pub types: HashMap<String, TypeExpr>,
    pub funcs: HashMap<String, Signature>,
    pub vars: HashMap<String, Option<TypeExpr>>,
    pub consts: HashMap<String, Option<TypeExpr>>,
}

impl PackageScope {
    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }
}

pub struct Loader {
    /// Import path to source directory, from the collection pass.
    dirs: HashMap<String, PathBuf>,
    /// Export indexes keyed by import path (non-test files only).
    exports: HashMap<String, PackageScope>,
}

impl Loader {
    pub fn new(dirs: HashMap<String, PathBuf>) -> Self {
        Self {
            dirs,
            exports: HashMap::new(),
        }
    }

    pub fn dir_of(&self, import_path: &str) -> Option<&PathBuf> {
        self.dirs.get(import_path)
    }

    /// Load the scope for one package variant: every parseable file in the
    /// directory whose package clause matches `name`. With `include_tests`
    /// false, `_test.go` files are skipped.
    pub fn load_scope(
        &self,
        import_path: &str,
        dir: &Path,
        name: &str,
        include_tests: bool,
    ) -> Result<PackageScope> {
        let mut files = Vec::new();
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("read_dir {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("go"))
            .collect();
        entries.sort();

        for path in entries {
            let filename = path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if !include_tests && filename.ends_with("_test.go") {
                continue;
            }
            let src =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let ast = match parse_file(&src, &filename) {
                Ok(ast) => ast,
                Err(err) => {
                    debug!("skipping unparseable file {}: {err}", path.display());
                    continue;
                }
            };
            if ast.package != name {
                continue;
            }
            files.push(LoadedFile { filename, src, ast });
        }

        let mut scope = PackageScope {
            import_path: import_path.to_string(),
            name: name.to_string(),
            dir: dir.to_path_buf(),
            files,
            types: HashMap::new(),
            funcs: HashMap::new(),
            vars: HashMap::new(),
            consts: HashMap::new(),
        };
        index_scope(&mut scope);
        Ok(scope)
    }

    /// Export index for an imported package, lazily built from its non-test
    /// files.
    pub fn export_index(&mut self, import_path: &str) -> Result<&PackageScope> {
        if !self.exports.contains_key(import_path) {
            let dir = self
                .dirs
                .get(import_path)
                .cloned()
                .ok_or_else(|| anyhow!("no source directory known for {import_path:?}"))?;
            let name = package_name_of_dir(&dir)
                .unwrap_or_else(|| default_import_name(import_path));
            let scope = self.load_scope(import_path, &dir, &name, false)?;
            self.exports.insert(import_path.to_string(), scope);
        }
        Ok(&self.exports[import_path])
    }
}

/// Build the name indexes, normalizing every type reference: aliases become
/// import paths, local named types the scope's own path.
fn index_scope(scope: &mut PackageScope) {
    let mut types = HashMap::new();
    let mut funcs = HashMap::new();
    let mut vars = HashMap::new();
    let mut consts = HashMap::new();

    // Two passes: declared type names must be known before normalization.
    let mut declared_types = HashSet::new();
    for file in &scope.files {
        for decl in &file.ast.decls {
            if let Decl::Type(t) = decl {
                declared_types.insert(t.name.clone());
            }
        }
    }

    for file in &scope.files {
        let imports = file.import_table();
        let normalize = |ty: &TypeExpr| -> TypeExpr {
            let mut ty = ty.clone();
            normalize_type(&mut ty, &imports, &declared_types, &scope.import_path);
            ty
        };
        for decl in &file.ast.decls {
            match decl {
                Decl::Type(t) => {
                    types.insert(t.name.clone(), normalize(&t.ty));
                }
                Decl::Func(f) => {
                    if f.has_recv {
                        continue;
                    }
                    let sig = Signature {
                        params: f
                            .params
                            .iter()
                            .map(|p| crate::gosrc::ast::ParamField {
                                names: p.names.clone(),
                                ty: normalize(&p.ty),
                            })
                            .collect(),
                        results: f
                            .results
                            .iter()
                            .map(|p| crate::gosrc::ast::ParamField {
                                names: p.names.clone(),
                                ty: normalize(&p.ty),
                            })
                            .collect(),
                    };
                    funcs.insert(f.name.clone(), sig);
                }
                Decl::Var(decl) => {
                    for spec in &decl.specs {
                        let ty = spec.ty.as_ref().map(|(ty, _)| normalize(ty));
                        for (name, _) in &spec.names {
                            vars.insert(name.clone(), ty.clone());
                        }
                    }
                }
                Decl::Const(decl) => {
                    let mut group_ty: Option<TypeExpr> = None;
                    for spec in &decl.specs {
                        if let Some((ty, _)) = &spec.ty {
                            group_ty = Some(normalize(ty));
                        }
                        for (name, _) in &spec.names {
                            consts.insert(name.clone(), group_ty.clone());
                        }
                    }
                }
            }
        }
    }

    scope.types = types;
    scope.funcs = funcs;
    scope.vars = vars;
    scope.consts = consts;
}

pub fn normalize_type(
    ty: &mut TypeExpr,
    imports: &HashMap<String, String>,
    local_types: &HashSet<String>,
    self_path: &str,
) {
    ty.map_qualifiers(&mut |pkg, name| match pkg {
        Some(alias) => {
            if let Some(path) = imports.get(alias.as_str()) {
                *pkg = Some(path.clone());
            }
        }
        None => {
            if !is_builtin_type(name) && local_types.contains(name) {
                *pkg = Some(self_path.to_string());
            }
        }
    });
}

/// Last path segment, the conventional package name for an import path.
pub fn default_import_name(import_path: &str) -> String {
    import_path
        .rsplit('/')
        .next()
        .unwrap_or(import_path)
        .to_string()
}

fn package_name_of_dir(dir: &Path) -> Option<String> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().and_then(|s| s.to_str()) == Some("go")
                && !p
                    .file_name()
                    .and_then(|s| s.to_str())
                    .is_some_and(|n| n.ends_with("_test.go"))
        })
        .collect();
    entries.sort();
    for path in entries {
        let src = fs::read_to_string(&path).ok()?;
        let filename = path.file_name()?.to_str()?.to_string();
        if let Ok(ast) = parse_file(&src, &filename) {
            return Some(ast.package);
        }
    }
    None
}

/// Initialization order for valued package-level variables: dependency
/// order first, declaration order for ties, the same shape the type
/// checker's InitOrder reports.
pub fn init_order(scope: &PackageScope) -> HashMap<String, usize> {
    struct SpecInfo {
        names: Vec<String>,
        refs: HashSet<String>,
    }

    let var_names: HashSet<String> = scope.vars.keys().cloned().collect();

    // References of each function body, closed transitively so a var that
    // calls f() depends on the vars f reads.
    let mut body_idents: HashMap<String, HashSet<String>> = HashMap::new();
    for file in &scope.files {
        for decl in &file.ast.decls {
            let Decl::Func(func) = decl else { continue };
            if func.has_recv {
                continue;
            }
            let Some(body) = &func.body else { continue };
            body_idents
                .entry(func.name.clone())
                .or_default()
                .extend(idents_in_span(&file.src, body));
        }
    }
    let func_names: HashSet<String> = body_idents.keys().cloned().collect();
    let mut func_refs: HashMap<String, (HashSet<String>, HashSet<String>)> = body_idents
        .into_iter()
        .map(|(name, idents)| {
            let vars = idents.intersection(&var_names).cloned().collect();
            let calls = idents.intersection(&func_names).cloned().collect();
            (name, (vars, calls))
        })
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        let snapshot: HashMap<String, HashSet<String>> = func_refs
            .iter()
            .map(|(k, (vars, _))| (k.clone(), vars.clone()))
            .collect();
        for (vars, calls) in func_refs.values_mut() {
            for call in calls.iter() {
                if let Some(callee_vars) = snapshot.get(call) {
                    for v in callee_vars {
                        if vars.insert(v.clone()) {
                            changed = true;
                        }
                    }
                }
            }
        }
    }

    let mut specs: Vec<SpecInfo> = Vec::new();
    let mut ordered_files: Vec<&LoadedFile> = scope.files.iter().collect();
    ordered_files.sort_by(|a, b| a.filename.cmp(&b.filename));
    for file in ordered_files {
        for decl in &file.ast.decls {
            let Decl::Var(decl) = decl else { continue };
            for spec in &decl.specs {
                if spec.values.is_empty() {
                    continue;
                }
                let mut refs = HashSet::new();
                for value in &spec.values {
                    let idents = idents_in_span(&file.src, &value.span);
                    for ident in idents {
                        if var_names.contains(&ident) {
                            refs.insert(ident.clone());
                        }
                        if let Some((vars, _)) = func_refs.get(&ident) {
                            refs.extend(vars.iter().cloned());
                        }
                    }
                }
                specs.push(SpecInfo {
                    names: spec.names.iter().map(|(n, _)| n.clone()).collect(),
                    refs,
                });
            }
        }
    }

    // Kahn's algorithm with declaration order as the tiebreaker. Variables
    // without initializers are zero-valued and never constrain anything.
    let initialized: HashSet<String> = specs.iter().flat_map(|s| s.names.clone()).collect();
    let mut order: HashMap<String, usize> = HashMap::new();
    let mut done: HashSet<usize> = HashSet::new();
    let mut settled: HashSet<String> = HashSet::new();
    let mut next_index = 0usize;
    while done.len() < specs.len() {
        let mut picked = None;
        for (i, spec) in specs.iter().enumerate() {
            if done.contains(&i) {
                continue;
            }
            let ready = spec
                .refs
                .iter()
                .all(|r| settled.contains(r) || !initialized.contains(r) || spec.names.contains(r));
            if ready {
                picked = Some(i);
                break;
            }
        }
        // A reference cycle between initializers; fall back to declaration
        // order so rewriting can still proceed.
        let picked = picked.unwrap_or_else(|| {
            (0..specs.len())
                .find(|i| !done.contains(i))
                .expect("unfinished spec exists")
        });
        done.insert(picked);
        for name in &specs[picked].names {
            order.insert(name.clone(), next_index);
            settled.insert(name.clone());
        }
        next_index += 1;
    }
    order
}

/// Identifier tokens inside a span, excluding selector members and struct
/// literal field keys.
fn idents_in_span(src: &str, span: &Span) -> HashSet<String> {
    let text = &src[span.start.min(src.len())..span.end.min(src.len())];
    let tokens = Lexer::new(text).lex_all();
    let mut out = HashSet::new();
    for (i, tok) in tokens.iter().enumerate() {
        let TokenKind::Ident(name) = &tok.kind else {
            continue;
        };
        if i > 0 && matches!(tokens[i - 1].kind, TokenKind::Symbol(Symbol::Dot)) {
            continue;
        }
        if matches!(
            tokens.get(i + 1).map(|t| &t.kind),
            Some(TokenKind::Symbol(Symbol::Colon))
        ) {
            continue;
        }
        out.insert(name.clone());
    }
    out
}
