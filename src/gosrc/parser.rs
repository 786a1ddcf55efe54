// Purpose: Parse Go files down to the declaration level.
// Inputs/Outputs: Consumes lexer tokens; yields a File with spanned declarations.
// Invariants: Function and composite bodies are consumed by balance, never interpreted.
// Gotchas: A name followed by a bracket in a field list is a named array/slice, not a generic.

use anyhow::{Result, anyhow, bail};

use super::ast::{
    ChanDir, Decl, Expr, ExprKind, File, FuncDecl, GenDecl, ImportSpec, InterfaceElem, LitKind,
    ParamField, Signature, Span, StructField, TypeDecl, TypeExpr, UnaryOp, ValueSpec, unquote,
};
use super::lexer::{Keyword, Lexer, Symbol, Token, TokenKind};

pub struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

pub fn parse_file(src: &str, filename: &str) -> Result<File> {
    Parser::new(src)
        .file()
        .map_err(|e| anyhow!("{filename}: {e}"))
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            tokens: Lexer::new(src).lex_all(),
            pos: 0,
        }
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn prev_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1)].span
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn err_here(&self, msg: &str) -> anyhow::Error {
        let span = self.span();
        anyhow!("{}:{}: {msg}", span.line, span.column)
    }

    fn at_symbol(&self, sym: Symbol) -> bool {
        matches!(self.peek(), TokenKind::Symbol(s) if *s == sym)
    }

    fn at_keyword(&self, kw: Keyword) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if *k == kw)
    }

    fn eat_symbol(&mut self, sym: Symbol) -> bool {
        if self.at_symbol(sym) {
            self.advance();
            return true;
        }
        false
    }

    fn expect_symbol(&mut self, sym: Symbol) -> Result<Span> {
        if !self.at_symbol(sym) {
            return Err(self.err_here(&format!("expected {sym:?}")));
        }
        Ok(self.advance().span)
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<Span> {
        if !self.at_keyword(kw) {
            return Err(self.err_here(&format!("expected {kw:?}")));
        }
        Ok(self.advance().span)
    }

    fn expect_ident(&mut self) -> Result<(String, Span)> {
        match self.peek() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(self.err_here("expected identifier")),
        }
    }

    fn skip_semis(&mut self) {
        while self.eat_symbol(Symbol::Semi) {}
    }

    /// Consume a balanced region starting at the current open token.
    fn skip_balanced(&mut self, open: Symbol, close: Symbol) -> Result<Span> {
        let start = self.expect_symbol(open)?;
        let mut depth = 1usize;
        loop {
            match self.peek() {
                TokenKind::Eof => return Err(self.err_here("unexpected end of file")),
                TokenKind::Symbol(s) if *s == open => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::Symbol(s) if *s == close => {
                    depth -= 1;
                    let end = self.advance().span;
                    if depth == 0 {
                        return Ok(Span {
                            start: start.start,
                            end: end.end,
                            line: start.line,
                            column: start.column,
                        });
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    pub fn file(&mut self) -> Result<File> {
        self.skip_semis();
        let package_start = self.expect_keyword(Keyword::Package)?;
        let (package, name_span) = self.expect_ident()?;
        let package_span = Span {
            start: package_start.start,
            end: name_span.end,
            line: package_start.line,
            column: package_start.column,
        };
        let mut import_insert_offset = name_span.end;
        self.skip_semis();

        let mut imports = Vec::new();
        while self.at_keyword(Keyword::Import) {
            self.advance();
            if self.at_symbol(Symbol::LParen) {
                self.advance();
                self.skip_semis();
                while !self.at_symbol(Symbol::RParen) {
                    imports.push(self.import_spec()?);
                    self.skip_semis();
                }
                let end = self.expect_symbol(Symbol::RParen)?;
                import_insert_offset = end.end;
            } else {
                let spec = self.import_spec()?;
                import_insert_offset = spec.span.end;
                imports.push(spec);
            }
            self.skip_semis();
        }

        let mut decls = Vec::new();
        loop {
            self.skip_semis();
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::Keyword(Keyword::Func) => decls.push(Decl::Func(self.func_decl()?)),
                TokenKind::Keyword(Keyword::Var) => decls.push(Decl::Var(self.gen_decl()?)),
                TokenKind::Keyword(Keyword::Const) => decls.push(Decl::Const(self.gen_decl()?)),
                TokenKind::Keyword(Keyword::Type) => {
                    for decl in self.type_decls()? {
                        decls.push(Decl::Type(decl));
                    }
                }
                _ => return Err(self.err_here("unexpected token at top level")),
            }
        }

        Ok(File {
            package,
            package_span,
            imports,
            decls,
            import_insert_offset,
        })
    }

    fn import_spec(&mut self) -> Result<ImportSpec> {
        let start = self.span();
        let alias = match self.peek() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Some(name)
            }
            TokenKind::Symbol(Symbol::Dot) => {
                self.advance();
                Some(".".to_string())
            }
            _ => None,
        };
        let path = match self.peek() {
            TokenKind::StringLit(lit) => {
                let path = unquote(lit);
                self.advance();
                path
            }
            _ => return Err(self.err_here("expected import path")),
        };
        Ok(ImportSpec {
            alias,
            path,
            span: Span {
                start: start.start,
                end: self.prev_span().end,
                line: start.line,
                column: start.column,
            },
        })
    }

    fn func_decl(&mut self) -> Result<FuncDecl> {
        let start = self.expect_keyword(Keyword::Func)?;
        let has_recv = if self.at_symbol(Symbol::LParen) {
            self.skip_balanced(Symbol::LParen, Symbol::RParen)?;
            true
        } else {
            false
        };
        let (name, name_span) = self.expect_ident()?;
        if self.at_symbol(Symbol::LBracket) {
            // Type parameter list.
            self.skip_balanced(Symbol::LBracket, Symbol::RBracket)?;
        }
        let sig = self.signature()?;
        let body = if self.at_symbol(Symbol::LBrace) {
            Some(self.skip_balanced(Symbol::LBrace, Symbol::RBrace)?)
        } else {
            None
        };
        let end = self.prev_span().end;
        Ok(FuncDecl {
            name,
            name_span,
            has_recv,
            params: sig.params,
            results: sig.results,
            body,
            span: Span {
                start: start.start,
                end,
                line: start.line,
                column: start.column,
            },
        })
    }

    fn signature(&mut self) -> Result<Signature> {
        let params = self.field_list()?;
        let results = if self.at_symbol(Symbol::LParen) {
            self.field_list()?
        } else if self.starts_type() {
            vec![ParamField {
                names: Vec::new(),
                ty: self.parse_type(true)?,
            }]
        } else {
            Vec::new()
        };
        Ok(Signature { params, results })
    }

    /// Parse a parenthesized field list, resolving the named-versus-anonymous
    /// ambiguity after the fact: if any element carries a name, the bare
    /// identifiers before it were names sharing its type.
    fn field_list(&mut self) -> Result<Vec<ParamField>> {
        self.expect_symbol(Symbol::LParen)?;
        let mut elements: Vec<(Option<String>, Option<TypeExpr>)> = Vec::new();
        loop {
            if self.eat_symbol(Symbol::RParen) {
                break;
            }
            if self.eat_symbol(Symbol::Comma) {
                continue;
            }
            let variadic = self.eat_symbol(Symbol::Ellipsis);
            let ty = self.parse_type(false)?;
            let ty = if variadic {
                TypeExpr::Ellipsis(Box::new(ty))
            } else {
                ty
            };
            if !variadic && self.starts_type() {
                // `ty` was really a parameter name.
                let name = match ty {
                    TypeExpr::Named { pkg: None, name } => name,
                    _ => return Err(self.err_here("expected parameter name")),
                };
                let variadic = self.eat_symbol(Symbol::Ellipsis);
                let real = self.parse_type(true)?;
                let real = if variadic {
                    TypeExpr::Ellipsis(Box::new(real))
                } else {
                    real
                };
                elements.push((Some(name), Some(real)));
            } else {
                elements.push((None, Some(ty)));
            }
        }

        let named = elements.iter().any(|(name, _)| name.is_some());
        let mut fields = Vec::new();
        if !named {
            for (_, ty) in elements {
                fields.push(ParamField {
                    names: Vec::new(),
                    ty: ty.expect("anonymous field has a type"),
                });
            }
            return Ok(fields);
        }

        let mut pending: Vec<String> = Vec::new();
        for (name, ty) in elements {
            match name {
                Some(name) => {
                    let mut names = std::mem::take(&mut pending);
                    names.push(name);
                    fields.push(ParamField {
                        names,
                        ty: ty.expect("named field has a type"),
                    });
                }
                None => match ty {
                    Some(TypeExpr::Named { pkg: None, name }) => pending.push(name),
                    _ => return Err(self.err_here("mixed named and anonymous parameters")),
                },
            }
        }
        if !pending.is_empty() {
            bail!("parameter names without a type");
        }
        Ok(fields)
    }

    fn starts_type(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::Ident(_)
                | TokenKind::Keyword(Keyword::Map)
                | TokenKind::Keyword(Keyword::Chan)
                | TokenKind::Keyword(Keyword::Func)
                | TokenKind::Keyword(Keyword::Struct)
                | TokenKind::Keyword(Keyword::Interface)
                | TokenKind::Symbol(Symbol::Star)
                | TokenKind::Symbol(Symbol::LBracket)
                | TokenKind::Symbol(Symbol::LParen)
                | TokenKind::Symbol(Symbol::Arrow)
                | TokenKind::Symbol(Symbol::Ellipsis)
        )
    }

    /// Parse a type. `bracket_suffix` permits a generic argument list after a
    /// named type; field-list element starts must pass false, where a
    /// bracket begins the named element's real type instead.
    fn parse_type(&mut self, bracket_suffix: bool) -> Result<TypeExpr> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                let mut ty = if self.at_symbol(Symbol::Dot)
                    && matches!(self.peek_at(1), TokenKind::Ident(_))
                {
                    self.advance();
                    let (sel, _) = self.expect_ident()?;
                    TypeExpr::Named {
                        pkg: Some(name),
                        name: sel,
                    }
                } else {
                    TypeExpr::Named { pkg: None, name }
                };
                if bracket_suffix && self.at_symbol(Symbol::LBracket) {
                    ty = self.generic_args(ty)?;
                }
                Ok(ty)
            }
            TokenKind::Symbol(Symbol::Star) => {
                self.advance();
                Ok(TypeExpr::Pointer(Box::new(self.parse_type(true)?)))
            }
            TokenKind::Symbol(Symbol::LBracket) => {
                self.advance();
                if self.eat_symbol(Symbol::RBracket) {
                    return Ok(TypeExpr::Slice(Box::new(self.parse_type(true)?)));
                }
                // Array length: capture the raw tokens up to the closing
                // bracket.
                let len_start = self.span().start;
                let mut depth = 1usize;
                let mut len_end = len_start;
                loop {
                    match self.peek() {
                        TokenKind::Eof => return Err(self.err_here("unterminated array length")),
                        TokenKind::Symbol(Symbol::LBracket) => {
                            depth += 1;
                            len_end = self.advance().span.end;
                        }
                        TokenKind::Symbol(Symbol::RBracket) => {
                            depth -= 1;
                            if depth == 0 {
                                self.advance();
                                break;
                            }
                            len_end = self.advance().span.end;
                        }
                        _ => len_end = self.advance().span.end,
                    }
                }
                let len = self.src[len_start..len_end].to_string();
                Ok(TypeExpr::Array {
                    len,
                    elem: Box::new(self.parse_type(true)?),
                })
            }
            TokenKind::Keyword(Keyword::Map) => {
                self.advance();
                self.expect_symbol(Symbol::LBracket)?;
                let key = self.parse_type(true)?;
                self.expect_symbol(Symbol::RBracket)?;
                let value = self.parse_type(true)?;
                Ok(TypeExpr::Map {
                    key: Box::new(key),
                    value: Box::new(value),
                })
            }
            TokenKind::Keyword(Keyword::Chan) => {
                self.advance();
                let dir = if self.eat_symbol(Symbol::Arrow) {
                    ChanDir::Send
                } else {
                    ChanDir::Both
                };
                Ok(TypeExpr::Chan {
                    dir,
                    elem: Box::new(self.parse_type(true)?),
                })
            }
            TokenKind::Symbol(Symbol::Arrow) => {
                self.advance();
                self.expect_keyword(Keyword::Chan)?;
                Ok(TypeExpr::Chan {
                    dir: ChanDir::Recv,
                    elem: Box::new(self.parse_type(true)?),
                })
            }
            TokenKind::Keyword(Keyword::Func) => {
                self.advance();
                Ok(TypeExpr::Func(Box::new(self.signature()?)))
            }
            TokenKind::Keyword(Keyword::Struct) => {
                self.advance();
                self.struct_type()
            }
            TokenKind::Keyword(Keyword::Interface) => {
                self.advance();
                self.interface_type()
            }
            TokenKind::Symbol(Symbol::LParen) => {
                self.advance();
                let ty = self.parse_type(true)?;
                self.expect_symbol(Symbol::RParen)?;
                Ok(ty)
            }
            TokenKind::Symbol(Symbol::Ellipsis) => {
                self.advance();
                Ok(TypeExpr::Ellipsis(Box::new(self.parse_type(true)?)))
            }
            _ => Err(self.err_here("expected type")),
        }
    }

    fn generic_args(&mut self, base: TypeExpr) -> Result<TypeExpr> {
        self.expect_symbol(Symbol::LBracket)?;
        let mut args = Vec::new();
        loop {
            if self.eat_symbol(Symbol::RBracket) {
                break;
            }
            if self.eat_symbol(Symbol::Comma) {
                continue;
            }
            args.push(self.parse_type(true)?);
        }
        Ok(TypeExpr::Generic {
            base: Box::new(base),
            args,
        })
    }

    fn struct_type(&mut self) -> Result<TypeExpr> {
        self.expect_symbol(Symbol::LBrace)?;
        let mut fields = Vec::new();
        loop {
            self.skip_semis();
            if self.eat_symbol(Symbol::RBrace) {
                break;
            }
            let embedded_ptr = self.eat_symbol(Symbol::Star);
            let first = self.parse_type(false)?;
            if !embedded_ptr && (self.starts_type() || self.at_symbol(Symbol::Comma)) {
                let name = match first {
                    TypeExpr::Named { pkg: None, name } => name,
                    _ => return Err(self.err_here("expected field name")),
                };
                let mut names = vec![name];
                while self.eat_symbol(Symbol::Comma) {
                    let (extra, _) = self.expect_ident()?;
                    names.push(extra);
                }
                let ty = self.parse_type(true)?;
                if let TokenKind::StringLit(_) = self.peek() {
                    self.advance();
                }
                fields.push(StructField { names, ty });
            } else {
                // Embedded field.
                let ty = if embedded_ptr {
                    TypeExpr::Pointer(Box::new(first))
                } else {
                    first
                };
                if let TokenKind::StringLit(_) = self.peek() {
                    self.advance();
                }
                fields.push(StructField {
                    names: Vec::new(),
                    ty,
                });
            }
        }
        Ok(TypeExpr::Struct(fields))
    }

    fn interface_type(&mut self) -> Result<TypeExpr> {
        self.expect_symbol(Symbol::LBrace)?;
        let mut elems = Vec::new();
        loop {
            self.skip_semis();
            if self.eat_symbol(Symbol::RBrace) {
                break;
            }
            if let TokenKind::Ident(name) = self.peek().clone()
                && matches!(self.peek_at(1), TokenKind::Symbol(Symbol::LParen))
            {
                self.advance();
                let sig = self.signature()?;
                elems.push(InterfaceElem::Method { name, sig });
                continue;
            }
            // Embedded interface or a type-set element; unions collapse to
            // their first term.
            let ty = self.parse_type(true)?;
            while self.eat_symbol(Symbol::Pipe) {
                self.eat_symbol(Symbol::Tilde);
                let _ = self.parse_type(true)?;
            }
            elems.push(InterfaceElem::Embedded(ty));
        }
        Ok(TypeExpr::Interface(elems))
    }

    fn gen_decl(&mut self) -> Result<GenDecl> {
        let start = self.advance().span;
        let mut specs = Vec::new();
        let grouped = self.at_symbol(Symbol::LParen);
        if grouped {
            self.advance();
            loop {
                self.skip_semis();
                if self.eat_symbol(Symbol::RParen) {
                    break;
                }
                specs.push(self.value_spec()?);
            }
        } else {
            specs.push(self.value_spec()?);
        }
        Ok(GenDecl {
            specs,
            grouped,
            span: Span {
                start: start.start,
                end: self.prev_span().end,
                line: start.line,
                column: start.column,
            },
        })
    }

    fn value_spec(&mut self) -> Result<ValueSpec> {
        let start = self.span();
        let mut names = Vec::new();
        loop {
            let (name, span) = self.expect_ident()?;
            names.push((name, span));
            if !self.eat_symbol(Symbol::Comma) {
                break;
            }
        }
        let ty = if !self.at_symbol(Symbol::Assign)
            && !self.at_symbol(Symbol::Semi)
            && !self.at_symbol(Symbol::RParen)
            && !matches!(self.peek(), TokenKind::Eof)
        {
            let ty_start = self.span();
            let ty = self.parse_type(true)?;
            let span = Span {
                start: ty_start.start,
                end: self.prev_span().end,
                line: ty_start.line,
                column: ty_start.column,
            };
            Some((ty, span))
        } else {
            None
        };
        let mut values = Vec::new();
        if self.eat_symbol(Symbol::Assign) {
            loop {
                values.push(self.expr()?);
                if !self.eat_symbol(Symbol::Comma) {
                    break;
                }
            }
        }
        Ok(ValueSpec {
            names,
            ty,
            values,
            span: Span {
                start: start.start,
                end: self.prev_span().end,
                line: start.line,
                column: start.column,
            },
        })
    }

    fn type_decls(&mut self) -> Result<Vec<TypeDecl>> {
        self.expect_keyword(Keyword::Type)?;
        let mut decls = Vec::new();
        if self.at_symbol(Symbol::LParen) {
            self.advance();
            loop {
                self.skip_semis();
                if self.eat_symbol(Symbol::RParen) {
                    break;
                }
                decls.push(self.type_spec()?);
            }
        } else {
            decls.push(self.type_spec()?);
        }
        Ok(decls)
    }

    fn type_spec(&mut self) -> Result<TypeDecl> {
        let start = self.span();
        let (name, _) = self.expect_ident()?;
        if self.at_symbol(Symbol::LBracket) {
            // Type parameter list.
            self.skip_balanced(Symbol::LBracket, Symbol::RBracket)?;
        }
        self.eat_symbol(Symbol::Assign);
        let ty = self.parse_type(true)?;
        Ok(TypeDecl {
            name,
            ty,
            span: Span {
                start: start.start,
                end: self.prev_span().end,
                line: start.line,
                column: start.column,
            },
        })
    }

    pub fn expr(&mut self) -> Result<Expr> {
        self.binary_expr(1)
    }

    fn binary_expr(&mut self, min_prec: u8) -> Result<Expr> {
        let mut left = self.unary_expr()?;
        loop {
            let Some((prec, class)) = binary_op(self.peek()) else {
                return Ok(left);
            };
            if prec < min_prec {
                return Ok(left);
            }
            self.advance();
            let right = self.binary_expr(prec + 1)?;
            let span = Span {
                start: left.span.start,
                end: right.span.end,
                line: left.span.line,
                column: left.span.column,
            };
            left = Expr {
                kind: ExprKind::Binary {
                    op: class,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
    }

    fn unary_expr(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            TokenKind::Symbol(Symbol::Amp) => Some(UnaryOp::Amp),
            TokenKind::Symbol(Symbol::Star) => Some(UnaryOp::Star),
            TokenKind::Symbol(Symbol::Bang) => Some(UnaryOp::Not),
            TokenKind::Symbol(Symbol::Minus) => Some(UnaryOp::Neg),
            TokenKind::Symbol(Symbol::Plus) => Some(UnaryOp::Pos),
            TokenKind::Symbol(Symbol::Caret) => Some(UnaryOp::Xor),
            TokenKind::Symbol(Symbol::Arrow) => Some(UnaryOp::Recv),
            _ => None,
        };
        if let Some(op) = op {
            // `<-chan T` in expression position is a type, not a receive.
            if op == UnaryOp::Recv && matches!(self.peek_at(1), TokenKind::Keyword(Keyword::Chan)) {
                return self.primary_expr();
            }
            let start = self.advance().span;
            let expr = self.unary_expr()?;
            let span = Span {
                start: start.start,
                end: expr.span.end,
                line: start.line,
                column: start.column,
            };
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    expr: Box::new(expr),
                },
                span,
            });
        }
        self.primary_expr()
    }

    fn primary_expr(&mut self) -> Result<Expr> {
        let start = self.span();
        let mut expr = self.operand()?;
        loop {
            match self.peek() {
                TokenKind::Symbol(Symbol::Dot) => {
                    if let TokenKind::Symbol(Symbol::LParen) = self.peek_at(1) {
                        // Type assertion.
                        self.advance();
                        self.advance();
                        let ty = self.parse_type(true)?;
                        let end = self.expect_symbol(Symbol::RParen)?;
                        expr = Expr {
                            kind: ExprKind::TypeAssert { ty },
                            span: join(start, end),
                        };
                        continue;
                    }
                    if let TokenKind::Ident(_) = self.peek_at(1) {
                        self.advance();
                        let (name, end) = self.expect_ident()?;
                        expr = Expr {
                            kind: ExprKind::Selector {
                                base: Box::new(expr),
                                name,
                            },
                            span: join(start, end),
                        };
                        continue;
                    }
                    return Err(self.err_here("unexpected token after dot"));
                }
                TokenKind::Symbol(Symbol::LParen) => {
                    self.advance();
                    let mut args = Vec::new();
                    loop {
                        self.skip_semis();
                        if self.at_symbol(Symbol::RParen) {
                            break;
                        }
                        args.push(self.call_arg()?);
                        self.eat_symbol(Symbol::Ellipsis);
                        if !self.eat_symbol(Symbol::Comma) {
                            break;
                        }
                    }
                    let end = self.expect_symbol(Symbol::RParen)?;
                    expr = Expr {
                        kind: ExprKind::Call {
                            fun: Box::new(expr),
                            args,
                        },
                        span: join(start, end),
                    };
                }
                TokenKind::Symbol(Symbol::LBracket) => {
                    let end = self.skip_balanced(Symbol::LBracket, Symbol::RBracket)?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            base: Box::new(expr),
                        },
                        span: join(start, end),
                    };
                }
                TokenKind::Symbol(Symbol::LBrace) => {
                    // Composite literal over a named type; only legal here
                    // because these expressions sit in value positions.
                    let Some(ty) = expr_as_type(&expr) else {
                        return Ok(expr);
                    };
                    let end = self.skip_balanced(Symbol::LBrace, Symbol::RBrace)?;
                    expr = Expr {
                        kind: ExprKind::CompositeLit { ty: Some(ty) },
                        span: join(start, end),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn operand(&mut self) -> Result<Expr> {
        let start = self.span();
        match self.peek().clone() {
            TokenKind::IntLit(_) => {
                self.advance();
                Ok(lit(start, LitKind::Int))
            }
            TokenKind::FloatLit(_) => {
                self.advance();
                Ok(lit(start, LitKind::Float))
            }
            TokenKind::ImagLit(_) => {
                self.advance();
                Ok(lit(start, LitKind::Imag))
            }
            TokenKind::RuneLit(_) => {
                self.advance();
                Ok(lit(start, LitKind::Rune))
            }
            TokenKind::StringLit(_) => {
                self.advance();
                Ok(lit(start, LitKind::String))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Ident(name),
                    span: start,
                })
            }
            TokenKind::Symbol(Symbol::LParen) => {
                self.advance();
                let inner = self.expr()?;
                let end = self.expect_symbol(Symbol::RParen)?;
                Ok(Expr {
                    kind: ExprKind::Paren(Box::new(inner)),
                    span: join(start, end),
                })
            }
            TokenKind::Keyword(Keyword::Func) => {
                self.advance();
                let sig = self.signature()?;
                if self.at_symbol(Symbol::LBrace) {
                    let end = self.skip_balanced(Symbol::LBrace, Symbol::RBrace)?;
                    return Ok(Expr {
                        kind: ExprKind::FuncLit { sig },
                        span: join(start, end),
                    });
                }
                Ok(Expr {
                    kind: ExprKind::TypeLit(TypeExpr::Func(Box::new(sig))),
                    span: join(start, self.prev_span()),
                })
            }
            TokenKind::Symbol(Symbol::LBracket)
            | TokenKind::Keyword(Keyword::Map)
            | TokenKind::Keyword(Keyword::Chan)
            | TokenKind::Keyword(Keyword::Struct)
            | TokenKind::Keyword(Keyword::Interface)
            | TokenKind::Symbol(Symbol::Arrow) => {
                let ty = self.parse_type(true)?;
                if self.at_symbol(Symbol::LBrace) {
                    let end = self.skip_balanced(Symbol::LBrace, Symbol::RBrace)?;
                    return Ok(Expr {
                        kind: ExprKind::CompositeLit { ty: Some(ty) },
                        span: join(start, end),
                    });
                }
                Ok(Expr {
                    kind: ExprKind::TypeLit(ty),
                    span: join(start, self.prev_span()),
                })
            }
            _ => Err(self.err_here("expected expression")),
        }
    }

    /// A call argument can be a type (for make/new) or a value.
    fn call_arg(&mut self) -> Result<Expr> {
        let start = self.span();
        match self.peek() {
            TokenKind::Symbol(Symbol::LBracket)
            | TokenKind::Keyword(Keyword::Map)
            | TokenKind::Keyword(Keyword::Struct)
            | TokenKind::Keyword(Keyword::Interface) => {
                let ty = self.parse_type(true)?;
                if self.at_symbol(Symbol::LBrace) {
                    let end = self.skip_balanced(Symbol::LBrace, Symbol::RBrace)?;
                    return Ok(Expr {
                        kind: ExprKind::CompositeLit { ty: Some(ty) },
                        span: join(start, end),
                    });
                }
                Ok(Expr {
                    kind: ExprKind::TypeLit(ty),
                    span: join(start, self.prev_span()),
                })
            }
            TokenKind::Keyword(Keyword::Chan) => {
                let ty = self.parse_type(true)?;
                Ok(Expr {
                    kind: ExprKind::TypeLit(ty),
                    span: join(start, self.prev_span()),
                })
            }
            _ => self.expr(),
        }
    }
}

fn lit(span: Span, kind: LitKind) -> Expr {
    Expr {
        kind: ExprKind::BasicLit(kind),
        span,
    }
}

fn join(start: Span, end: Span) -> Span {
    Span {
        start: start.start,
        end: end.end,
        line: start.line,
        column: start.column,
    }
}

fn binary_op(kind: &TokenKind) -> Option<(u8, super::ast::BinOpClass)> {
    use super::ast::BinOpClass::*;
    let op = match kind {
        TokenKind::Symbol(Symbol::OrOr) => (1, Boolean),
        TokenKind::Symbol(Symbol::AndAnd) => (2, Boolean),
        TokenKind::Symbol(Symbol::EqEq)
        | TokenKind::Symbol(Symbol::NotEq)
        | TokenKind::Symbol(Symbol::Lt)
        | TokenKind::Symbol(Symbol::Lte)
        | TokenKind::Symbol(Symbol::Gt)
        | TokenKind::Symbol(Symbol::Gte) => (3, Boolean),
        TokenKind::Symbol(Symbol::Plus)
        | TokenKind::Symbol(Symbol::Minus)
        | TokenKind::Symbol(Symbol::Pipe)
        | TokenKind::Symbol(Symbol::Caret) => (4, Arith),
        TokenKind::Symbol(Symbol::Star)
        | TokenKind::Symbol(Symbol::Slash)
        | TokenKind::Symbol(Symbol::Percent)
        | TokenKind::Symbol(Symbol::Shl)
        | TokenKind::Symbol(Symbol::Shr)
        | TokenKind::Symbol(Symbol::Amp)
        | TokenKind::Symbol(Symbol::AmpCaret) => (5, Arith),
        _ => return None,
    };
    Some(op)
}

fn expr_as_type(expr: &Expr) -> Option<TypeExpr> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(TypeExpr::Named {
            pkg: None,
            name: name.clone(),
        }),
        ExprKind::Selector { base, name } => match &base.kind {
            ExprKind::Ident(pkg) => Some(TypeExpr::Named {
                pkg: Some(pkg.clone()),
                name: name.clone(),
            }),
            _ => None,
        },
        ExprKind::Index { base } => expr_as_type(base).map(|b| TypeExpr::Generic {
            base: Box::new(b),
            args: Vec::new(),
        }),
        ExprKind::TypeLit(ty) => Some(ty.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_file;
    use crate::gosrc::ast::{ChanDir, Decl, ExprKind, LitKind, TypeExpr};

    #[test]
    fn parses_package_and_imports() {
        let src = "package p\n\nimport (\n\t\"fmt\"\n\tother \"example.com/other\"\n\t_ \"embed\"\n)\n";
        let file = parse_file(src, "p.go").expect("parse");
        assert_eq!(file.package, "p");
        assert_eq!(file.imports.len(), 3);
        assert_eq!(file.imports[0].path, "fmt");
        assert_eq!(file.imports[1].alias.as_deref(), Some("other"));
        assert_eq!(file.imports[2].alias.as_deref(), Some("_"));
    }

    #[test]
    fn parses_test_function_shape() {
        let src = "package p\n\nimport \"testing\"\n\nfunc TestX(t *testing.T) {\n\tt.Log(\"hi\")\n}\n";
        let file = parse_file(src, "p_test.go").expect("parse");
        let Decl::Func(f) = &file.decls[0] else {
            panic!("expected func");
        };
        assert_eq!(f.name, "TestX");
        assert!(!f.has_recv);
        assert!(f.results.is_empty());
        assert_eq!(f.params.len(), 1);
        assert_eq!(
            f.params[0].ty,
            TypeExpr::Pointer(Box::new(TypeExpr::Named {
                pkg: Some("testing".to_string()),
                name: "T".to_string(),
            }))
        );
        assert!(f.body.is_some());
    }

    #[test]
    fn parses_var_specs_with_values() {
        let src = "package p\n\nvar (\n\tX = 1\n\tY, Z = f(), \"s\"\n\tW int\n)\n";
        let file = parse_file(src, "p.go").expect("parse");
        let Decl::Var(decl) = &file.decls[0] else {
            panic!("expected var");
        };
        assert!(decl.grouped);
        assert_eq!(decl.specs.len(), 3);
        assert_eq!(decl.specs[0].values.len(), 1);
        assert_eq!(decl.specs[1].names.len(), 2);
        assert_eq!(decl.specs[1].values.len(), 2);
        assert!(decl.specs[2].values.is_empty());
        assert!(decl.specs[2].ty.is_some());
    }

    #[test]
    fn parses_types() {
        let src = "package p\n\nvar x map[string]chan<- *q.T\nvar y [4]byte\nvar z func(a int, b ...string) (bool, error)\n";
        let file = parse_file(src, "p.go").expect("parse");
        let Decl::Var(first) = &file.decls[0] else {
            panic!("var");
        };
        let (ty, _) = first.specs[0].ty.as_ref().expect("type");
        assert_eq!(ty.render(), "map[string]chan<- *q.T");
        let Decl::Var(second) = &file.decls[1] else {
            panic!("var");
        };
        let (ty, _) = second.specs[0].ty.as_ref().expect("type");
        assert!(matches!(ty, TypeExpr::Array { len, .. } if len == "4"));
        let Decl::Var(third) = &file.decls[2] else {
            panic!("var");
        };
        let (ty, _) = third.specs[0].ty.as_ref().expect("type");
        let TypeExpr::Func(sig) = ty else {
            panic!("func type");
        };
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.results.len(), 2);
    }

    #[test]
    fn parses_init_and_method_decls() {
        let src = "package p\n\nfunc init() { x = 1 }\n\nfunc (r *R) init() {}\n";
        let file = parse_file(src, "p.go").expect("parse");
        let Decl::Func(plain) = &file.decls[0] else {
            panic!("func");
        };
        assert!(!plain.has_recv);
        let Decl::Func(method) = &file.decls[1] else {
            panic!("func");
        };
        assert!(method.has_recv);
    }

    #[test]
    fn parses_composite_and_call_exprs() {
        let src = "package p\n\nvar a = T{1, 2}\nvar b = other.New(x, y)\nvar c = []int{1}\nvar d = make(chan int, 4)\n";
        let file = parse_file(src, "p.go").expect("parse");
        let spec_value = |i: usize| {
            let Decl::Var(decl) = &file.decls[i] else {
                panic!("var");
            };
            &decl.specs[0].values[0]
        };
        assert!(matches!(
            &spec_value(0).kind,
            ExprKind::CompositeLit { ty: Some(TypeExpr::Named { pkg: None, name }) } if name == "T"
        ));
        assert!(matches!(&spec_value(1).kind, ExprKind::Call { .. }));
        assert!(
            matches!(&spec_value(2).kind, ExprKind::CompositeLit { ty: Some(TypeExpr::Slice(_)) })
        );
        let ExprKind::Call { args, .. } = &spec_value(3).kind else {
            panic!("call");
        };
        assert!(matches!(
            &args[0].kind,
            ExprKind::TypeLit(TypeExpr::Chan { dir: ChanDir::Both, .. })
        ));
    }

    #[test]
    fn string_literal_kind_is_tracked() {
        let src = "package p\n\nvar s = \"hello\"\n";
        let file = parse_file(src, "p.go").expect("parse");
        let Decl::Var(decl) = &file.decls[0] else {
            panic!("var");
        };
        assert!(matches!(
            decl.specs[0].values[0].kind,
            ExprKind::BasicLit(LitKind::String)
        ));
    }
}
