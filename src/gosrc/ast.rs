// Purpose: Model the slice of Go syntax the rewriter and generator care about.
// Inputs/Outputs: Produced by the parser; rendered back to Go source text.
// Invariants: Every node keeps the byte span of the source it came from.
// Gotchas: Function bodies are spans, not trees; the rewriter splices text, it does not pretty-print.

use std::fmt::Write as _;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug)]
pub struct File {
    pub package: String,
    pub package_span: Span,
    pub imports: Vec<ImportSpec>,
    pub decls: Vec<Decl>,
    /// Byte offset where a new import declaration can be spliced in: after
    /// the last import, or after the package clause.
    pub import_insert_offset: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSpec {
    /// Explicit alias, including `_` and `.` forms.
    pub alias: Option<String>,
    pub path: String,
    pub span: Span,
}

#[derive(Debug)]
pub enum Decl {
    Func(FuncDecl),
    Var(GenDecl),
    Const(GenDecl),
    Type(TypeDecl),
}

#[derive(Debug)]
pub struct FuncDecl {
    pub name: String,
    pub name_span: Span,
    pub has_recv: bool,
    pub params: Vec<ParamField>,
    pub results: Vec<ParamField>,
    pub body: Option<Span>,
    pub span: Span,
}

/// A `var` or `const` declaration, possibly parenthesized.
#[derive(Debug)]
pub struct GenDecl {
    pub specs: Vec<ValueSpec>,
    pub grouped: bool,
    pub span: Span,
}

#[derive(Debug)]
pub struct ValueSpec {
    pub names: Vec<(String, Span)>,
    pub ty: Option<(TypeExpr, Span)>,
    pub values: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug)]
pub struct TypeDecl {
    pub name: String,
    pub ty: TypeExpr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamField {
    pub names: Vec<String>,
    pub ty: TypeExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanDir {
    Both,
    Send,
    Recv,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    pub params: Vec<ParamField>,
    pub results: Vec<ParamField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    /// Empty for embedded fields.
    pub names: Vec<String>,
    pub ty: TypeExpr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceElem {
    Method { name: String, sig: Signature },
    Embedded(TypeExpr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeExpr {
    /// `pkg` is an alias as written, or a full import path once an export
    /// index normalizes it.
    Named { pkg: Option<String>, name: String },
    Pointer(Box<TypeExpr>),
    Slice(Box<TypeExpr>),
    Array { len: String, elem: Box<TypeExpr> },
    Map { key: Box<TypeExpr>, value: Box<TypeExpr> },
    Chan { dir: ChanDir, elem: Box<TypeExpr> },
    Func(Box<Signature>),
    Struct(Vec<StructField>),
    Interface(Vec<InterfaceElem>),
    /// Variadic parameter element type.
    Ellipsis(Box<TypeExpr>),
    /// Generic instantiation, e.g. `List[int]`.
    Generic { base: Box<TypeExpr>, args: Vec<TypeExpr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LitKind {
    Int,
    Float,
    Imag,
    Rune,
    String,
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug)]
pub enum ExprKind {
    Ident(String),
    Selector { base: Box<Expr>, name: String },
    BasicLit(LitKind),
    CompositeLit { ty: Option<TypeExpr> },
    Call { fun: Box<Expr>, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinOpClass, left: Box<Expr>, right: Box<Expr> },
    FuncLit { sig: Signature },
    Index { base: Box<Expr> },
    Paren(Box<Expr>),
    /// A type written in expression position, e.g. the first argument of
    /// `make`.
    TypeLit(TypeExpr),
    /// `x.(T)`.
    TypeAssert { ty: TypeExpr },
    /// Anything the expression grammar subset does not model.
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Amp,
    Star,
    Not,
    Neg,
    Pos,
    Xor,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpClass {
    /// `== != < <= > >= && ||`: always bool.
    Boolean,
    /// Arithmetic, bitwise and shift operators: type of the left operand.
    Arith,
}

impl TypeExpr {
    pub fn named(name: &str) -> Self {
        TypeExpr::Named {
            pkg: None,
            name: name.to_string(),
        }
    }

    /// Render back to Go syntax. `Named` package qualifiers are emitted
    /// verbatim; normalize them to aliases first.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            TypeExpr::Named { pkg, name } => {
                if let Some(pkg) = pkg {
                    out.push_str(pkg);
                    out.push('.');
                }
                out.push_str(name);
            }
            TypeExpr::Pointer(inner) => {
                out.push('*');
                inner.render_into(out);
            }
            TypeExpr::Slice(inner) => {
                out.push_str("[]");
                inner.render_into(out);
            }
            TypeExpr::Array { len, elem } => {
                let _ = write!(out, "[{len}]");
                elem.render_into(out);
            }
            TypeExpr::Map { key, value } => {
                out.push_str("map[");
                key.render_into(out);
                out.push(']');
                value.render_into(out);
            }
            TypeExpr::Chan { dir, elem } => {
                match dir {
                    ChanDir::Both => out.push_str("chan "),
                    ChanDir::Send => out.push_str("chan<- "),
                    ChanDir::Recv => out.push_str("<-chan "),
                }
                elem.render_into(out);
            }
            TypeExpr::Func(sig) => {
                out.push_str("func");
                render_signature(sig, out);
            }
            TypeExpr::Struct(fields) => {
                out.push_str("struct {");
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push(';');
                    }
                    out.push(' ');
                    if !field.names.is_empty() {
                        out.push_str(&field.names.join(", "));
                        out.push(' ');
                    }
                    field.ty.render_into(out);
                }
                if fields.is_empty() {
                    out.push('}');
                } else {
                    out.push_str(" }");
                }
            }
            TypeExpr::Interface(elems) => {
                out.push_str("interface {");
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        out.push(';');
                    }
                    out.push(' ');
                    match elem {
                        InterfaceElem::Method { name, sig } => {
                            out.push_str(name);
                            render_signature(sig, out);
                        }
                        InterfaceElem::Embedded(ty) => ty.render_into(out),
                    }
                }
                if elems.is_empty() {
                    out.push('}');
                } else {
                    out.push_str(" }");
                }
            }
            TypeExpr::Ellipsis(inner) => {
                out.push_str("...");
                inner.render_into(out);
            }
            TypeExpr::Generic { base, args } => {
                base.render_into(out);
                out.push('[');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    arg.render_into(out);
                }
                out.push(']');
            }
        }
    }

    /// Walk every `Named` node, letting `f` replace the package qualifier.
    pub fn map_qualifiers(&mut self, f: &mut impl FnMut(&mut Option<String>, &str)) {
        match self {
            TypeExpr::Named { pkg, name } => f(pkg, name),
            TypeExpr::Pointer(inner)
            | TypeExpr::Slice(inner)
            | TypeExpr::Ellipsis(inner)
            | TypeExpr::Array { elem: inner, .. }
            | TypeExpr::Chan { elem: inner, .. } => inner.map_qualifiers(f),
            TypeExpr::Map { key, value } => {
                key.map_qualifiers(f);
                value.map_qualifiers(f);
            }
            TypeExpr::Func(sig) => map_signature(sig, f),
            TypeExpr::Struct(fields) => {
                for field in fields {
                    field.ty.map_qualifiers(f);
                }
            }
            TypeExpr::Interface(elems) => {
                for elem in elems {
                    match elem {
                        InterfaceElem::Method { sig, .. } => map_signature(sig, f),
                        InterfaceElem::Embedded(ty) => ty.map_qualifiers(f),
                    }
                }
            }
            TypeExpr::Generic { base, args } => {
                base.map_qualifiers(f);
                for arg in args {
                    arg.map_qualifiers(f);
                }
            }
        }
    }
}

fn render_signature(sig: &Signature, out: &mut String) {
    out.push('(');
    for (i, param) in sig.params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if !param.names.is_empty() {
            out.push_str(&param.names.join(", "));
            out.push(' ');
        }
        param.ty.render_into(out);
    }
    out.push(')');
    if sig.results.is_empty() {
        return;
    }
    if sig.results.len() == 1 && sig.results[0].names.is_empty() {
        out.push(' ');
        sig.results[0].ty.render_into(out);
        return;
    }
    out.push_str(" (");
    for (i, result) in sig.results.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if !result.names.is_empty() {
            out.push_str(&result.names.join(", "));
            out.push(' ');
        }
        result.ty.render_into(out);
    }
    out.push(')');
}

fn map_signature(sig: &mut Signature, f: &mut impl FnMut(&mut Option<String>, &str)) {
    for param in &mut sig.params {
        param.ty.map_qualifiers(f);
    }
    for result in &mut sig.results {
        result.ty.map_qualifiers(f);
    }
}

/// Strip the quotes from an import path literal. Interpreted escapes do not
/// occur in real import paths, so this only unwraps the delimiters.
pub fn unquote(lit: &str) -> String {
    lit.trim_matches(|c| c == '"' || c == '`').to_string()
}

#[cfg(test)]
mod tests {
    use super::{ChanDir, TypeExpr};

    #[test]
    fn renders_nested_types() {
        // map[string]chan<- *other.T
        let ty = TypeExpr::Map {
            key: Box::new(TypeExpr::named("string")),
            value: Box::new(TypeExpr::Chan {
                dir: ChanDir::Send,
                elem: Box::new(TypeExpr::Pointer(Box::new(TypeExpr::Named {
                    pkg: Some("other".to_string()),
                    name: "T".to_string(),
                }))),
            }),
        };
        assert_eq!(ty.render(), "map[string]chan<- *other.T");
    }

    #[test]
    fn renders_array_and_slice() {
        let ty = TypeExpr::Array {
            len: "4".to_string(),
            elem: Box::new(TypeExpr::Slice(Box::new(TypeExpr::named("byte")))),
        };
        assert_eq!(ty.render(), "[4][]byte");
    }

    #[test]
    fn map_qualifiers_rewrites_foreign_names() {
        let mut ty = TypeExpr::Pointer(Box::new(TypeExpr::Named {
            pkg: Some("example.com/other".to_string()),
            name: "T".to_string(),
        }));
        ty.map_qualifiers(&mut |pkg, _| {
            if pkg.as_deref() == Some("example.com/other") {
                *pkg = Some("GeneratedImport0".to_string());
            }
        });
        assert_eq!(ty.render(), "*GeneratedImport0.T");
    }
}
