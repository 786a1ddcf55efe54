// Purpose: Shared Go source model: lexer, declaration parser and type syntax.
// Inputs/Outputs: Text in, spanned declarations out; consumed by the rewriter and main generator.
// Invariants: Only declaration-level structure is modeled; statement bodies stay opaque.
// Gotchas: This is not a type checker; inference lives in rewrite::infer on top of it.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{
    ChanDir, Decl, Expr, ExprKind, File, FuncDecl, GenDecl, ImportSpec, LitKind, ParamField,
    Signature, Span, TypeDecl, TypeExpr, ValueSpec,
};
pub use parser::parse_file;
