// Purpose: Reconstruct a type expression for a valued variable declaration.
// Inputs/Outputs: Walks the initializer expression against package and export indexes.
// Invariants: Results are normalized: foreign names carry import paths, builtins stay bare.
// Gotchas: This mirrors what the type checker would say for the supported forms; anything else errors.

use std::collections::HashSet;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;

use crate::gosrc::ast::{BinOpClass, Expr, ExprKind, LitKind, Signature, TypeExpr, UnaryOp};
use crate::rewrite::loader::{Loader, PackageScope, is_builtin_type, normalize_type};

pub struct InferCx<'a> {
    pub loader: &'a Mutex<Loader>,
    pub scope: &'a PackageScope,
    /// Alias to import path table of the file being rewritten.
    pub imports: &'a std::collections::HashMap<String, String>,
    /// Guards against initializer reference cycles.
    in_progress: Mutex<HashSet<String>>,
}

impl<'a> InferCx<'a> {
    pub fn new(
        loader: &'a Mutex<Loader>,
        scope: &'a PackageScope,
        imports: &'a std::collections::HashMap<String, String>,
    ) -> Self {
        Self {
            loader,
            scope,
            imports,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    /// Normalize a type written in the current file.
    pub fn normalize(&self, ty: &TypeExpr) -> TypeExpr {
        let mut ty = ty.clone();
        let local: HashSet<String> = self.scope.types.keys().cloned().collect();
        normalize_type(&mut ty, self.imports, &local, &self.scope.import_path);
        ty
    }

    pub fn infer(&self, expr: &Expr) -> Result<TypeExpr> {
        match &expr.kind {
            ExprKind::BasicLit(kind) => Ok(TypeExpr::named(match kind {
                LitKind::Int => "int",
                LitKind::Float => "float64",
                LitKind::Imag => "complex128",
                LitKind::Rune => "rune",
                LitKind::String => "string",
            })),
            ExprKind::Ident(name) => self.infer_ident(name),
            ExprKind::Selector { base, name } => self.infer_selector(base, name),
            ExprKind::CompositeLit { ty: Some(ty) } => Ok(self.normalize(ty)),
            ExprKind::CompositeLit { ty: None } => Err(anyhow!("untyped composite literal")),
            ExprKind::Call { fun, args } => self.infer_call(fun, args),
            ExprKind::Unary { op, expr } => self.infer_unary(*op, expr),
            ExprKind::Binary { op, left, right } => match op {
                BinOpClass::Boolean => Ok(TypeExpr::named("bool")),
                BinOpClass::Arith => self.infer(left).or_else(|_| self.infer(right)),
            },
            ExprKind::FuncLit { sig } => Ok(TypeExpr::Func(Box::new(self.normalize_sig(sig)))),
            ExprKind::Paren(inner) => self.infer(inner),
            ExprKind::Index { base } => {
                let base_ty = self.infer(base)?;
                match self.underlying(base_ty)? {
                    TypeExpr::Slice(elem) => Ok(*elem),
                    TypeExpr::Array { elem, .. } => Ok(*elem),
                    TypeExpr::Map { value, .. } => Ok(*value),
                    TypeExpr::Named { name, .. } if name == "string" => Ok(TypeExpr::named("byte")),
                    other => Err(anyhow!("cannot index {}", other.render())),
                }
            }
            ExprKind::TypeAssert { ty } => Ok(self.normalize(ty)),
            ExprKind::TypeLit(_) => Err(anyhow!("type used as value")),
            ExprKind::Opaque => Err(anyhow!("unsupported expression form")),
        }
    }

    fn infer_ident(&self, name: &str) -> Result<TypeExpr> {
        match name {
            "true" | "false" => return Ok(TypeExpr::named("bool")),
            "nil" => return Err(anyhow!("cannot infer a type for nil")),
            _ => {}
        }
        if let Some(ty) = self.scope.vars.get(name) {
            if let Some(ty) = ty {
                return Ok(ty.clone());
            }
            return self.infer_scope_var(name);
        }
        if let Some(sig) = self.scope.funcs.get(name) {
            return Ok(TypeExpr::Func(Box::new(sig.clone())));
        }
        if let Some(ty) = self.scope.consts.get(name) {
            // Untyped constants default to int; good enough for the moved
            // declarations this feeds.
            return Ok(ty.clone().unwrap_or_else(|| TypeExpr::named("int")));
        }
        Err(anyhow!("unknown identifier {name:?}"))
    }

    /// A scope variable without a declared type: infer from its own
    /// initializer, guarding against cycles.
    fn infer_scope_var(&self, name: &str) -> Result<TypeExpr> {
        {
            let mut guard = self.in_progress.lock();
            if !guard.insert(name.to_string()) {
                return Err(anyhow!("initializer cycle through {name:?}"));
            }
        }
        let result = (|| {
            for file in &self.scope.files {
                let imports = file.import_table();
                for decl in &file.ast.decls {
                    let crate::gosrc::ast::Decl::Var(decl) = decl else {
                        continue;
                    };
                    for spec in &decl.specs {
                        let Some(pos) = spec.names.iter().position(|(n, _)| n == name) else {
                            continue;
                        };
                        if spec.values.is_empty() {
                            return Err(anyhow!("variable {name:?} has no initializer"));
                        }
                        let value = if spec.values.len() == spec.names.len() {
                            &spec.values[pos]
                        } else {
                            &spec.values[0]
                        };
                        let file_cx = InferCx {
                            loader: self.loader,
                            scope: self.scope,
                            imports: &imports,
                            in_progress: Mutex::new(self.in_progress.lock().clone()),
                        };
                        // The declaring file's imports govern this value.
                        let ty = file_cx.infer(value)?;
                        return Ok(ty);
                    }
                }
            }
            Err(anyhow!("unknown identifier {name:?}"))
        })();
        self.in_progress.lock().remove(name);
        result
    }

    fn infer_selector(&self, base: &Expr, name: &str) -> Result<TypeExpr> {
        if let ExprKind::Ident(pkg) = &base.kind
            && let Some(path) = self.imports.get(pkg.as_str())
        {
            let mut loader = self.loader.lock();
            let index = loader.export_index(path)?;
            if let Some(Some(ty)) = index.vars.get(name) {
                return Ok(ty.clone());
            }
            if let Some(sig) = index.funcs.get(name) {
                return Ok(TypeExpr::Func(Box::new(sig.clone())));
            }
            if let Some(ty) = index.consts.get(name) {
                return Ok(ty.clone().unwrap_or_else(|| TypeExpr::named("int")));
            }
            return Err(anyhow!("{path}.{name} is not exported or not supported"));
        }
        // Field selection: resolve the base type to a struct and find the
        // field.
        let base_ty = self.infer(base)?;
        let base_ty = match base_ty {
            TypeExpr::Pointer(inner) => *inner,
            other => other,
        };
        match self.underlying(base_ty)? {
            TypeExpr::Struct(fields) => {
                for field in &fields {
                    if field.names.iter().any(|n| n == name) {
                        return Ok(field.ty.clone());
                    }
                }
                Err(anyhow!("no field {name:?}"))
            }
            other => Err(anyhow!("cannot select {name:?} from {}", other.render())),
        }
    }

    fn infer_call(&self, fun: &Expr, args: &[Expr]) -> Result<TypeExpr> {
        let fun = unwrap_parens(fun);
        match &fun.kind {
            ExprKind::Ident(name) if name == "make" => match args.first() {
                Some(arg) => self.type_of_arg(arg),
                None => Err(anyhow!("make with no arguments")),
            },
            ExprKind::Ident(name) if name == "new" => match args.first() {
                Some(arg) => Ok(TypeExpr::Pointer(Box::new(self.type_of_arg(arg)?))),
                None => Err(anyhow!("new with no arguments")),
            },
            ExprKind::Ident(name) if name == "len" || name == "cap" || name == "copy" => {
                Ok(TypeExpr::named("int"))
            }
            ExprKind::Ident(name) if name == "append" || name == "min" || name == "max" => args
                .first()
                .ok_or_else(|| anyhow!("builtin {name} with no arguments"))
                .and_then(|a| self.infer(a)),
            ExprKind::Ident(name) => {
                if let Some(sig) = self.scope.funcs.get(name.as_str()) {
                    return self.single_result(name, sig);
                }
                if self.scope.has_type(name) {
                    // Conversion to a local named type.
                    return Ok(TypeExpr::Named {
                        pkg: Some(self.scope.import_path.clone()),
                        name: name.clone(),
                    });
                }
                if is_builtin_type(name) {
                    return Ok(TypeExpr::named(name));
                }
                // Calling a function-typed variable.
                match self.infer_ident(name)? {
                    TypeExpr::Func(sig) => self.single_result(name, &sig),
                    other => Err(anyhow!("cannot call {}", other.render())),
                }
            }
            ExprKind::Selector { base, name } => {
                if let ExprKind::Ident(pkg) = &unwrap_parens(base).kind
                    && let Some(path) = self.imports.get(pkg.as_str())
                {
                    let path = path.clone();
                    {
                        let mut loader = self.loader.lock();
                        let index = loader.export_index(&path)?;
                        if let Some(sig) = index.funcs.get(name.as_str()) {
                            return self.single_result(name, &sig.clone());
                        }
                        if index.has_type(name) {
                            return Ok(TypeExpr::Named {
                                pkg: Some(path),
                                name: name.clone(),
                            });
                        }
                    }
                    // A function-typed package variable.
                    match self.infer_selector(base, name)? {
                        TypeExpr::Func(sig) => return self.single_result(name, &sig),
                        other => return Err(anyhow!("cannot call {}", other.render())),
                    }
                }
                // Method call; method sets are not indexed.
                Err(anyhow!("cannot infer the result of a method call"))
            }
            ExprKind::TypeLit(ty) => Ok(self.normalize(ty)),
            _ => Err(anyhow!("unsupported call form")),
        }
    }

    fn infer_unary(&self, op: UnaryOp, expr: &Expr) -> Result<TypeExpr> {
        match op {
            UnaryOp::Amp => Ok(TypeExpr::Pointer(Box::new(self.infer(expr)?))),
            UnaryOp::Star => match self.infer(expr)? {
                TypeExpr::Pointer(inner) => Ok(*inner),
                other => Err(anyhow!("cannot dereference {}", other.render())),
            },
            UnaryOp::Not => Ok(TypeExpr::named("bool")),
            UnaryOp::Neg | UnaryOp::Pos | UnaryOp::Xor => self.infer(expr),
            UnaryOp::Recv => match self.underlying(self.infer(expr)?)? {
                TypeExpr::Chan { elem, .. } => Ok(*elem),
                other => Err(anyhow!("cannot receive from {}", other.render())),
            },
        }
    }

    fn type_of_arg(&self, arg: &Expr) -> Result<TypeExpr> {
        match &arg.kind {
            ExprKind::TypeLit(ty) => Ok(self.normalize(ty)),
            ExprKind::Ident(name) if self.scope.has_type(name) => Ok(TypeExpr::Named {
                pkg: Some(self.scope.import_path.clone()),
                name: name.clone(),
            }),
            ExprKind::Ident(name) if is_builtin_type(name) => Ok(TypeExpr::named(name)),
            ExprKind::Selector { base, name } => {
                if let ExprKind::Ident(pkg) = &base.kind
                    && let Some(path) = self.imports.get(pkg.as_str())
                {
                    return Ok(TypeExpr::Named {
                        pkg: Some(path.clone()),
                        name: name.clone(),
                    });
                }
                Err(anyhow!("expected a type argument"))
            }
            _ => Err(anyhow!("expected a type argument")),
        }
    }

    fn single_result(&self, name: &str, sig: &Signature) -> Result<TypeExpr> {
        match sig.results.len() {
            1 => Ok(sig.results[0].ty.clone()),
            0 => Err(anyhow!("{name} has no results")),
            _ => Err(anyhow!("{name} has multiple results")),
        }
    }

    fn normalize_sig(&self, sig: &Signature) -> Signature {
        let mut sig = sig.clone();
        let local: HashSet<String> = self.scope.types.keys().cloned().collect();
        for param in &mut sig.params {
            normalize_type(
                &mut param.ty,
                self.imports,
                &local,
                &self.scope.import_path,
            );
        }
        for result in &mut sig.results {
            normalize_type(
                &mut result.ty,
                self.imports,
                &local,
                &self.scope.import_path,
            );
        }
        sig
    }

    /// Resolve named types to their underlying form for elem/field lookup.
    fn underlying(&self, ty: TypeExpr) -> Result<TypeExpr> {
        match &ty {
            TypeExpr::Named { pkg: None, .. } => Ok(ty),
            TypeExpr::Named {
                pkg: Some(path),
                name,
            } => {
                if path == &self.scope.import_path {
                    if let Some(under) = self.scope.types.get(name) {
                        return Ok(under.clone());
                    }
                    return Ok(ty);
                }
                let mut loader = self.loader.lock();
                let index = loader.export_index(path)?;
                match index.types.get(name) {
                    Some(under) => Ok(under.clone()),
                    None => Ok(ty),
                }
            }
            _ => Ok(ty),
        }
    }
}

fn unwrap_parens(expr: &Expr) -> &Expr {
    match &expr.kind {
        ExprKind::Paren(inner) => unwrap_parens(inner),
        _ => expr,
    }
}

/// Map a normalized type into a destination file: the scope's own package
/// renders bare, foreign packages through the alias allocator, which may
/// mint a fresh `GeneratedImport<N>` alias.
pub fn qualify_for_file(
    ty: &TypeExpr,
    self_path: &str,
    mut alias_for: impl FnMut(&str) -> String,
) -> TypeExpr {
    let mut ty = ty.clone();
    ty.map_qualifiers(&mut |pkg, _| {
        if let Some(path) = pkg.clone() {
            if path == self_path {
                *pkg = None;
            } else {
                *pkg = Some(alias_for(&path));
            }
        }
    });
    ty
}

#[cfg(test)]
mod tests {
    use super::{InferCx, qualify_for_file};
    use crate::gosrc::ast::TypeExpr;
    use crate::gosrc::parser::Parser;
    use crate::rewrite::loader::Loader;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    fn write(dir: &Path, name: &str, src: &str) {
        fs::write(dir.join(name), src).expect("write");
    }

    fn infer_in(scope_src: &str, other_src: Option<&str>, expr: &str) -> anyhow::Result<TypeExpr> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pkg_dir = tmp.path().join("p");
        fs::create_dir_all(&pkg_dir).expect("mkdir");
        write(&pkg_dir, "p.go", scope_src);

        let mut dirs = HashMap::new();
        dirs.insert("example.com/p".to_string(), pkg_dir.clone());
        if let Some(other) = other_src {
            let other_dir = tmp.path().join("other");
            fs::create_dir_all(&other_dir).expect("mkdir");
            write(&other_dir, "other.go", other);
            dirs.insert("example.com/other".to_string(), other_dir);
        }

        let loader = Mutex::new(Loader::new(dirs));
        let scope = loader
            .lock()
            .load_scope("example.com/p", &pkg_dir, "p", true)
            .expect("scope");

        let file = scope
            .files
            .first()
            .expect("file parsed");
        let imports = file.import_table();
        let cx = InferCx::new(&loader, &scope, &imports);

        let mut parser = Parser::new(expr);
        let parsed = parser.expr().expect("parse expr");
        cx.infer(&parsed)
    }

    #[test]
    fn infers_basic_literals() {
        let src = "package p\n";
        assert_eq!(infer_in(src, None, "1").expect("int").render(), "int");
        assert_eq!(
            infer_in(src, None, "1.5").expect("float").render(),
            "float64"
        );
        assert_eq!(
            infer_in(src, None, "\"s\"").expect("string").render(),
            "string"
        );
    }

    #[test]
    fn infers_make_and_new() {
        let src = "package p\n";
        assert_eq!(
            infer_in(src, None, "make(map[string]int)")
                .expect("map")
                .render(),
            "map[string]int"
        );
        assert_eq!(
            infer_in(src, None, "make(chan int, 4)").expect("chan").render(),
            "chan int"
        );
        assert_eq!(
            infer_in(src, None, "new(int)").expect("ptr").render(),
            "*int"
        );
    }

    #[test]
    fn infers_composite_and_address() {
        let src = "package p\n\ntype T struct{ N int }\n";
        let ty = infer_in(src, None, "&T{N: 1}").expect("composite");
        assert_eq!(ty.render(), "*example.com/p.T");
    }

    #[test]
    fn infers_local_function_result() {
        let src = "package p\n\ntype T struct{}\n\nfunc newT() *T { return nil }\n";
        let ty = infer_in(src, None, "newT()").expect("call");
        assert_eq!(ty.render(), "*example.com/p.T");
    }

    #[test]
    fn infers_foreign_call_through_export_index() {
        // Scenario: someFunc returns map[string]chan<- *other.T.
        let src = "package p\n\nimport \"example.com/other\"\n\nvar keep = other.Zero\n";
        let other =
            "package other\n\ntype T struct{}\n\nvar Zero = 0\n\nfunc Chans() map[string]chan<- *T { return nil }\n";
        let ty = infer_in(src, Some(other), "other.Chans()").expect("foreign call");
        assert_eq!(ty.render(), "map[string]chan<- *example.com/other.T");
    }

    #[test]
    fn qualifies_foreign_names_with_fresh_aliases() {
        let ty = TypeExpr::Map {
            key: Box::new(TypeExpr::named("string")),
            value: Box::new(TypeExpr::Pointer(Box::new(TypeExpr::Named {
                pkg: Some("example.com/other".to_string()),
                name: "T".to_string(),
            }))),
        };
        let qualified = qualify_for_file(&ty, "example.com/p", |path| {
            assert_eq!(path, "example.com/other");
            "GeneratedImport0".to_string()
        });
        assert_eq!(qualified.render(), "map[string]*GeneratedImport0.T");
    }

    #[test]
    fn unresolvable_expression_is_an_error() {
        let src = "package p\n";
        assert!(infer_in(src, None, "mystery()").is_err());
    }
}
