//! Recursive-descent parser
//!
//! Produces the AST and, as a side effect, the lexical scope tree the
//! compiler resolves identifiers against. Newline tokens separate statements
//! and are otherwise skipped at well-known points (after operators, inside
//! bracketed constructs).

use crate::ast::*;
use crate::error::SableError;
use crate::globals::Globals;
use crate::scope::ScopeTree;
use crate::span::Span;
use crate::token::{Token, TokenKind};
use std::sync::Arc;

/// Parser state
pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    scopes: &'a mut ScopeTree,
    globals: &'a mut Globals,
}

impl<'a> Parser<'a> {
    /// Create a parser over a token stream
    pub fn new(tokens: Vec<Token>, scopes: &'a mut ScopeTree, globals: &'a mut Globals) -> Self {
        Self {
            tokens,
            pos: 0,
            scopes,
            globals,
        }
    }

    /// Parse a whole script
    pub fn parse_script(mut self) -> Result<Script, SableError> {
        let mut decls = Vec::new();
        self.skip_newlines();
        while !self.check(&TokenKind::Eof) {
            decls.push(self.parse_declaration(false)?);
            self.skip_newlines();
        }
        Ok(Script { decls })
    }

    // ── token plumbing ───────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].kind
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn accept(&mut self, kind: &TokenKind) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            None
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token, SableError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(SableError::parse(
                format!("expected {}", what),
                self.peek().span,
            ))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(String, Token), SableError> {
        match self.peek_kind() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                Ok((name, self.advance()))
            }
            _ => Err(SableError::parse(
                format!("expected {}", what),
                self.peek().span,
            )),
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    /// Consume a statement terminator: `;`, a newline, or an upcoming
    /// closer (`}` / `else` / end of file)
    fn stmt_end(&mut self) -> Result<(), SableError> {
        if self.accept(&TokenKind::Semicolon).is_some() || self.accept(&TokenKind::Newline).is_some()
        {
            return Ok(());
        }
        match self.peek_kind() {
            TokenKind::RightBrace | TokenKind::Eof | TokenKind::Else => Ok(()),
            _ => Err(SableError::parse(
                "expected ';' or end of line after statement",
                self.peek().span,
            )),
        }
    }

    // ── declarations ─────────────────────────────────────────────────────────

    fn parse_declaration(&mut self, in_object_body: bool) -> Result<Decl, SableError> {
        self.skip_newlines();

        let api_token = self.accept(&TokenKind::Api);
        if api_token.is_some() {
            self.skip_newlines();
        }
        let api = api_token.is_some();

        let decl = match self.peek_kind() {
            TokenKind::Mod => {
                if let Some(token) = api_token {
                    return Err(SableError::parse(
                        "keyword 'api' has no meaning here",
                        token.span,
                    ));
                }
                self.parse_module_decl()?
            }
            TokenKind::Fun => self.parse_fun_decl(api || in_object_body)?,
            TokenKind::Obj => self.parse_object_decl(api)?,
            TokenKind::Ffi => self.parse_ffi_decl()?,
            TokenKind::Var => self.parse_var_decl()?,
            _ => {
                if let Some(token) = api_token {
                    return Err(SableError::parse(
                        "keyword 'api' has no meaning here",
                        token.span,
                    ));
                }
                Decl::Stmt(self.parse_stmt()?)
            }
        };

        Ok(decl)
    }

    fn parse_module_decl(&mut self) -> Result<Decl, SableError> {
        self.expect(&TokenKind::Mod, "'mod'")?;
        let (name, name_token) = self.expect_ident("module name")?;
        self.scopes
            .open_named(&name, name_token.span, false, self.globals)?;
        self.skip_newlines();
        self.expect(&TokenKind::LeftBrace, "'{' after module name")?;
        self.skip_newlines();

        let mut body = Vec::new();
        while self.accept(&TokenKind::RightBrace).is_none() {
            if self.check(&TokenKind::Eof) {
                self.scopes.close();
                return Err(SableError::parse("unterminated module body", name_token.span));
            }
            body.push(self.parse_declaration(false)?);
            self.skip_newlines();
        }

        self.scopes.close();
        Ok(Decl::Module {
            name: name_token,
            body,
        })
    }

    fn parse_fun_decl(&mut self, api: bool) -> Result<Decl, SableError> {
        self.expect(&TokenKind::Fun, "'fun'")?;
        let (name, name_token) = self.expect_ident("function name")?;
        let scope = self
            .scopes
            .open_named(&name, name_token.span, true, self.globals)?;
        self.skip_newlines();

        // Anonymous implementation scope holds the parameters and body.
        self.scopes.open_anon();
        let params = self.parse_param_list()?;
        let body = self.parse_fun_body()?;
        self.scopes.close();
        self.scopes.close();

        self.skip_newlines();

        Ok(Decl::Fun(Arc::new(FunDecl {
            name: name_token,
            scope,
            is_api: api,
            params,
            body,
        })))
    }

    fn parse_object_decl(&mut self, api: bool) -> Result<Decl, SableError> {
        self.expect(&TokenKind::Obj, "'obj'")?;
        self.skip_newlines();
        let (name, name_token) = self.expect_ident("object name")?;
        let scope = self
            .scopes
            .open_named(&name, name_token.span, true, self.globals)?;
        self.skip_newlines();

        self.scopes.open_anon();
        let params = self.parse_param_list()?;
        self.skip_newlines();

        let super_init = if self.check(&TokenKind::Colon) {
            let token = self.advance();
            self.skip_newlines();
            let call = self.parse_expr()?;
            self.skip_newlines();
            Some(SuperInit { token, call })
        } else {
            None
        };

        let body = self.parse_object_body()?;
        self.scopes.close();
        self.scopes.close();

        self.skip_newlines();

        Ok(Decl::Object(Arc::new(ObjectDecl {
            name: name_token,
            scope,
            is_api: api,
            params,
            super_init,
            body,
        })))
    }

    fn parse_object_body(&mut self) -> Result<Vec<Decl>, SableError> {
        let open = self.expect(&TokenKind::LeftBrace, "'{' to open object body")?;
        self.skip_newlines();

        let mut body = Vec::new();
        while self.accept(&TokenKind::RightBrace).is_none() {
            if self.check(&TokenKind::Eof) {
                return Err(SableError::parse("unterminated object body", open.span));
            }
            body.push(self.parse_declaration(true)?);
            self.skip_newlines();
        }
        Ok(body)
    }

    fn parse_ffi_decl(&mut self) -> Result<Decl, SableError> {
        self.expect(&TokenKind::Ffi, "'ffi'")?;
        let (name, name_token) = self.expect_ident("ffi function name")?;
        let scope = self.scopes.add_ident(&name, name_token.span, self.globals)?;
        self.skip_newlines();

        self.expect(&TokenKind::LeftParen, "'(' after ffi function name")?;
        self.skip_newlines();
        let mut arity = 0;
        if self.accept(&TokenKind::RightParen).is_none() {
            loop {
                self.skip_newlines();
                self.accept(&TokenKind::Var);
                self.expect_ident("parameter name")?;
                arity += 1;
                self.skip_newlines();
                if self.accept(&TokenKind::Comma).is_none() {
                    break;
                }
            }
            self.expect(&TokenKind::RightParen, "')' after parameters")?;
        }
        self.stmt_end()?;

        Ok(Decl::Ffi {
            name: name_token,
            scope,
            arity,
        })
    }

    fn parse_var_decl(&mut self) -> Result<Decl, SableError> {
        self.expect(&TokenKind::Var, "'var'")?;
        let (name, name_token) = self.expect_ident("variable name")?;
        let scope = self.scopes.add_ident(&name, name_token.span, self.globals)?;

        let init = if self.accept(&TokenKind::Equal).is_some()
            || self.accept(&TokenKind::Walrus).is_some()
        {
            self.skip_newlines();
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.stmt_end()?;

        Ok(Decl::Var(VarDecl {
            name: name_token,
            scope,
            init,
        }))
    }

    /// `( a, b, c )` with an optional `var` prefix per parameter
    fn parse_param_list(&mut self) -> Result<Vec<Param>, SableError> {
        self.expect(&TokenKind::LeftParen, "'('")?;
        self.skip_newlines();

        let mut params = Vec::new();
        if self.accept(&TokenKind::RightParen).is_some() {
            return Ok(params);
        }
        loop {
            self.skip_newlines();
            self.accept(&TokenKind::Var);
            let (name, name_token) = self.expect_ident("parameter name")?;
            let scope = self.scopes.add_ident(&name, name_token.span, self.globals)?;
            params.push(Param {
                name: name_token,
                scope,
            });
            self.skip_newlines();
            if self.accept(&TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(&TokenKind::RightParen, "')' after parameters")?;
        Ok(params)
    }

    /// `{ decls… }` — or a single statement body
    fn parse_fun_body(&mut self) -> Result<Vec<Decl>, SableError> {
        self.skip_newlines();
        if self.accept(&TokenKind::LeftBrace).is_none() {
            return Ok(vec![self.parse_declaration(false)?]);
        }
        self.skip_newlines();

        let mut body = Vec::new();
        while self.accept(&TokenKind::RightBrace).is_none() {
            if self.check(&TokenKind::Eof) {
                return Err(SableError::parse(
                    "unterminated function body",
                    self.peek().span,
                ));
            }
            body.push(self.parse_declaration(false)?);
            self.skip_newlines();
        }
        Ok(body)
    }

    // ── statements ───────────────────────────────────────────────────────────

    fn parse_stmt(&mut self) -> Result<Stmt, SableError> {
        match self.peek_kind() {
            TokenKind::Return => self.parse_return_stmt(),
            TokenKind::Yield => {
                let token = self.advance();
                Err(SableError::parse("yield is not implemented", token.span))
            }
            TokenKind::Print | TokenKind::Println => self.parse_print_stmt(),
            TokenKind::If => self.parse_if_stmt(),
            TokenKind::Loop | TokenKind::While | TokenKind::Until | TokenKind::For => {
                self.parse_loop_stmt()
            }
            TokenKind::Use => self.parse_use_stmt(),
            TokenKind::Continue => self.parse_continue_stmt(),
            TokenKind::Break => self.parse_break_stmt(),
            TokenKind::LeftBrace => self.parse_block(),
            _ => {
                let expr = self.parse_expr()?;
                self.stmt_end()?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_use_stmt(&mut self) -> Result<Stmt, SableError> {
        self.expect(&TokenKind::Use, "'use'")?;
        let path = match self.peek_kind() {
            TokenKind::Str(_) => self.advance(),
            _ => {
                return Err(SableError::parse(
                    "expected a string after 'use'",
                    self.peek().span,
                ))
            }
        };
        self.stmt_end()?;
        Ok(Stmt::Use { path })
    }

    fn parse_block(&mut self) -> Result<Stmt, SableError> {
        let open = self.expect(&TokenKind::LeftBrace, "'{'")?;
        self.scopes.open_anon();
        self.skip_newlines();

        let mut decls = Vec::new();
        while self.accept(&TokenKind::RightBrace).is_none() {
            if self.check(&TokenKind::Eof) {
                self.scopes.close();
                return Err(SableError::parse("unterminated block", open.span));
            }
            decls.push(self.parse_declaration(false)?);
            self.skip_newlines();
        }

        self.scopes.close();
        Ok(Stmt::Block(decls))
    }

    fn parse_print_stmt(&mut self) -> Result<Stmt, SableError> {
        let token = self.advance(); // print / println
        self.skip_newlines();
        let expr = self.parse_expr()?;
        self.stmt_end()?;
        Ok(Stmt::Print { token, expr })
    }

    fn parse_return_stmt(&mut self) -> Result<Stmt, SableError> {
        let token = self.expect(&TokenKind::Return, "'return'")?;
        let expr = match self.peek_kind() {
            TokenKind::Semicolon | TokenKind::Newline | TokenKind::RightBrace | TokenKind::Eof => {
                None
            }
            _ => Some(self.parse_expr()?),
        };
        self.stmt_end()?;
        self.skip_newlines();
        Ok(Stmt::Return { token, expr })
    }

    fn parse_if_stmt(&mut self) -> Result<Stmt, SableError> {
        self.expect(&TokenKind::If, "'if'")?;
        self.scopes.open_anon();
        let cond = self.parse_expr()?;
        self.skip_newlines();
        let then = Box::new(self.parse_stmt()?);

        let els = if self.accept(&TokenKind::Else).is_some() {
            self.skip_newlines();
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        self.scopes.close();

        Ok(Stmt::If { cond, then, els })
    }

    fn parse_break_stmt(&mut self) -> Result<Stmt, SableError> {
        let token = self.expect(&TokenKind::Break, "'break'")?;
        let tag = match self.peek_kind() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Some(name)
            }
            _ => None,
        };
        self.stmt_end()?;
        Ok(Stmt::Break { token, tag })
    }

    fn parse_continue_stmt(&mut self) -> Result<Stmt, SableError> {
        let token = self.expect(&TokenKind::Continue, "'continue'")?;
        let tag = match self.peek_kind() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Some(name)
            }
            _ => None,
        };
        self.stmt_end()?;
        Ok(Stmt::Continue { token, tag })
    }

    fn parse_loop_stmt(&mut self) -> Result<Stmt, SableError> {
        // `loop` may carry a tag; bare while/until/for never do.
        let mut tag = None;
        if self.accept(&TokenKind::Loop).is_some() {
            self.skip_newlines();
            if let TokenKind::Ident(name) = self.peek_kind() {
                tag = Some(name.clone());
                self.advance();
                self.skip_newlines();
            }

            self.scopes.open_anon();
            let stmt = if self.accept(&TokenKind::While).is_some() {
                self.parse_pre_test_loop(LoopKind::While, tag)?
            } else if self.accept(&TokenKind::Until).is_some() {
                self.parse_pre_test_loop(LoopKind::Until, tag)?
            } else {
                self.parse_post_test_loop(tag)?
            };
            self.scopes.close();
            return Ok(stmt);
        }

        self.scopes.open_anon();
        let stmt = if self.accept(&TokenKind::While).is_some() {
            self.parse_pre_test_loop(LoopKind::While, None)?
        } else if self.accept(&TokenKind::Until).is_some() {
            self.parse_pre_test_loop(LoopKind::Until, None)?
        } else if self.check(&TokenKind::For) {
            self.parse_for_loop()?
        } else {
            self.parse_post_test_loop(None)?
        };
        self.scopes.close();
        Ok(stmt)
    }

    fn parse_pre_test_loop(
        &mut self,
        kind: LoopKind,
        tag: Option<String>,
    ) -> Result<Stmt, SableError> {
        self.skip_newlines();
        let cond = self.parse_expr()?;
        self.skip_newlines();
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::Loop(LoopStmt {
            kind,
            tag,
            before: None,
            cond: Some(cond),
            after: None,
            body,
        }))
    }

    fn parse_post_test_loop(&mut self, tag: Option<String>) -> Result<Stmt, SableError> {
        let body = Box::new(self.parse_stmt()?);
        self.skip_newlines();

        let (kind, cond) = if self.accept(&TokenKind::While).is_some() {
            self.skip_newlines();
            (LoopKind::LoopWhile, Some(self.parse_expr()?))
        } else if self.accept(&TokenKind::Until).is_some() {
            self.skip_newlines();
            (LoopKind::LoopUntil, Some(self.parse_expr()?))
        } else {
            (LoopKind::Basic, None)
        };
        if cond.is_some() {
            self.skip_newlines();
        }

        Ok(Stmt::Loop(LoopStmt {
            kind,
            tag,
            before: None,
            cond,
            after: None,
            body,
        }))
    }

    fn parse_for_loop(&mut self) -> Result<Stmt, SableError> {
        let for_token = self.expect(&TokenKind::For, "'for'")?;
        self.skip_newlines();

        // `for x in …` is parsed but deliberately unsupported.
        let is_for_in = match (self.peek_kind(), self.peek_at(1)) {
            (TokenKind::Ident(_), TokenKind::In) => true,
            (TokenKind::Var, TokenKind::Ident(_)) => *self.peek_at(2) == TokenKind::In,
            _ => false,
        };
        if is_for_in {
            return Err(SableError::parse(
                "for..in loops are not implemented",
                for_token.span,
            ));
        }

        let before = if self.accept(&TokenKind::Semicolon).is_some() {
            None
        } else {
            let decl = if self.check(&TokenKind::Var) {
                self.parse_var_decl()?
            } else {
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::Semicolon, "';' after loop initializer")?;
                Decl::Stmt(Stmt::Expr(expr))
            };
            Some(Box::new(decl))
        };
        self.skip_newlines();

        let cond = if self.accept(&TokenKind::Semicolon).is_some() {
            None
        } else {
            let cond = self.parse_expr()?;
            self.expect(&TokenKind::Semicolon, "';' after loop condition")?;
            Some(cond)
        };
        self.skip_newlines();

        let after = if self.check(&TokenKind::LeftBrace) || self.check(&TokenKind::Newline) {
            None
        } else {
            Some(Box::new(Stmt::Expr(self.parse_expr()?)))
        };
        self.skip_newlines();

        let body = Box::new(self.parse_stmt()?);

        Ok(Stmt::Loop(LoopStmt {
            kind: LoopKind::For,
            tag: None,
            before,
            cond,
            after,
            body,
        }))
    }

    // ── expressions ──────────────────────────────────────────────────────────

    fn parse_expr(&mut self) -> Result<Expr, SableError> {
        self.parse_assign_expr()
    }

    fn parse_assign_expr(&mut self) -> Result<Expr, SableError> {
        let lhs = self.parse_or_expr()?;

        let op = if self.check(&TokenKind::Walrus) || self.check(&TokenKind::Equal) {
            self.advance()
        } else {
            return Ok(lhs);
        };

        match lhs {
            Expr::Name(_) | Expr::Member { .. } | Expr::Subscript { .. } => {}
            _ => {
                return Err(SableError::parse("invalid assignment target", op.span));
            }
        }

        self.skip_newlines();
        let value = self.parse_assign_expr()?;
        Ok(Expr::Assign {
            target: Box::new(lhs),
            op,
            value: Box::new(value),
        })
    }

    fn parse_or_expr(&mut self) -> Result<Expr, SableError> {
        let mut expr = self.parse_xor_expr()?;
        while self.check(&TokenKind::Or) {
            let op = self.advance();
            self.skip_newlines();
            let rhs = self.parse_xor_expr()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_xor_expr(&mut self) -> Result<Expr, SableError> {
        let mut expr = self.parse_and_expr()?;
        while self.check(&TokenKind::Xor) {
            let op = self.advance();
            self.skip_newlines();
            let rhs = self.parse_and_expr()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_and_expr(&mut self) -> Result<Expr, SableError> {
        let mut expr = self.parse_equality_expr()?;
        while self.check(&TokenKind::And) {
            let op = self.advance();
            self.skip_newlines();
            let rhs = self.parse_equality_expr()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_equality_expr(&mut self) -> Result<Expr, SableError> {
        let mut expr = self.parse_is_expr()?;
        while self.check(&TokenKind::EqualEqual) || self.check(&TokenKind::BangEqual) {
            let op = self.advance();
            self.skip_newlines();
            let rhs = self.parse_is_expr()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_is_expr(&mut self) -> Result<Expr, SableError> {
        let mut expr = self.parse_compare_expr()?;
        while self.check(&TokenKind::Is) {
            let op = self.advance();
            self.skip_newlines();
            let rhs = self.parse_compare_expr()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_compare_expr(&mut self) -> Result<Expr, SableError> {
        let mut expr = self.parse_add_expr()?;
        while matches!(
            self.peek_kind(),
            TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual
        ) {
            let op = self.advance();
            self.skip_newlines();
            let rhs = self.parse_add_expr()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_add_expr(&mut self) -> Result<Expr, SableError> {
        let mut expr = self.parse_mult_expr()?;
        while matches!(self.peek_kind(), TokenKind::Plus | TokenKind::Minus) {
            let op = self.advance();
            self.skip_newlines();
            let rhs = self.parse_mult_expr()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_mult_expr(&mut self) -> Result<Expr, SableError> {
        let mut expr = self.parse_unary_expr()?;
        while matches!(self.peek_kind(), TokenKind::Star | TokenKind::Slash) {
            let op = self.advance();
            self.skip_newlines();
            let rhs = self.parse_unary_expr()?;
            expr = Expr::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }
        Ok(expr)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, SableError> {
        if matches!(self.peek_kind(), TokenKind::Minus | TokenKind::Plus) {
            let op = self.advance();
            self.skip_newlines();
            let operand = self.parse_unary_expr()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_call_expr()
    }

    fn parse_call_expr(&mut self) -> Result<Expr, SableError> {
        let mut expr = self.parse_primary_expr()?;

        loop {
            if let Some(lparen) = self.accept(&TokenKind::LeftParen) {
                self.skip_newlines();
                let mut args = Vec::new();
                if self.accept(&TokenKind::RightParen).is_none() {
                    loop {
                        self.skip_newlines();
                        args.push(self.parse_expr()?);
                        self.skip_newlines();
                        if self.accept(&TokenKind::Comma).is_none() {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RightParen, "')' after arguments")?;
                }
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    token: lparen,
                };
            } else if let Some(lbracket) = self.accept(&TokenKind::LeftBracket) {
                self.skip_newlines();
                let index = self.parse_expr()?;
                self.skip_newlines();
                self.expect(&TokenKind::RightBracket, "']' after subscript")?;
                expr = Expr::Subscript {
                    object: Box::new(expr),
                    index: Box::new(index),
                    token: lbracket,
                };
            } else if self.accept(&TokenKind::Dot).is_some() {
                self.skip_newlines();
                let (_, name_token) = self.expect_ident("member name after '.'")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    name: name_token,
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, SableError> {
        match self.peek_kind().clone() {
            TokenKind::Nil => {
                let token = self.advance();
                Ok(Expr::Nil { token })
            }
            TokenKind::True => {
                let token = self.advance();
                Ok(Expr::Bool { value: true, token })
            }
            TokenKind::False => {
                let token = self.advance();
                Ok(Expr::Bool {
                    value: false,
                    token,
                })
            }
            TokenKind::Number(value) => {
                let token = self.advance();
                Ok(Expr::Number { value, token })
            }
            TokenKind::Str(value) => {
                let token = self.advance();
                Ok(Expr::Str { value, token })
            }
            TokenKind::SelfKw => {
                let token = self.advance();
                Ok(Expr::SelfRef { token })
            }
            TokenKind::LeftParen => {
                self.advance();
                self.skip_newlines();
                let expr = self.parse_expr()?;
                self.skip_newlines();
                self.expect(&TokenKind::RightParen, "')'")?;
                Ok(expr)
            }
            TokenKind::Lambda => self.parse_lambda_expr(),
            TokenKind::LeftBrace => self.parse_map_literal(),
            TokenKind::Ident(_) | TokenKind::ColonColon => self.parse_scoped_name(),
            _ => Err(SableError::parse("expected an expression", self.peek().span)),
        }
    }

    /// `\(params) { body }` — a closure value
    fn parse_lambda_expr(&mut self) -> Result<Expr, SableError> {
        let token = self.expect(&TokenKind::Lambda, "lambda")?;
        self.skip_newlines();

        let scope = self.scopes.open_anon();
        self.scopes.open_anon();
        let params = self.parse_param_list()?;
        let body = self.parse_fun_body()?;
        self.scopes.close();
        self.scopes.close();

        Ok(Expr::Lambda(Arc::new(LambdaExpr {
            scope,
            token,
            params,
            body,
        })))
    }

    /// `{ k: v, v2, … }` — entries without a key get integer keys
    fn parse_map_literal(&mut self) -> Result<Expr, SableError> {
        let token = self.expect(&TokenKind::LeftBrace, "'{'")?;
        let scope = self.scopes.open_anon();
        self.skip_newlines();

        let mut entries = Vec::new();
        if self.accept(&TokenKind::RightBrace).is_none() {
            loop {
                self.skip_newlines();
                let key_or_value = self.parse_expr()?;
                self.skip_newlines();

                if self.accept(&TokenKind::Colon).is_some() {
                    self.skip_newlines();
                    let value = self.parse_expr()?;
                    entries.push((key_or_value, value));
                } else {
                    let key = Expr::Number {
                        value: entries.len() as f64,
                        token: Token::dummy(TokenKind::Number(entries.len() as f64)),
                    };
                    entries.push((key, key_or_value));
                }

                self.skip_newlines();
                if self.accept(&TokenKind::Comma).is_none() {
                    break;
                }
            }
            self.skip_newlines();
            self.expect(&TokenKind::RightBrace, "'}' to close map")?;
        }

        self.scopes.close();
        Ok(Expr::Map(Arc::new(MapLiteral {
            scope,
            token,
            entries,
        })))
    }

    /// `a`, `a::b::c`, `::a::b`
    fn parse_scoped_name(&mut self) -> Result<Expr, SableError> {
        let mut span: Option<Span> = None;
        let mut ident = String::new();

        if let Some(token) = self.accept(&TokenKind::ColonColon) {
            ident.push_str("::");
            span = Some(token.span);
        }

        loop {
            let (name, token) = self.expect_ident("identifier")?;
            ident.push_str(&name);
            span = Some(match span {
                Some(s) => s.merge(token.span),
                None => token.span,
            });
            if self.accept(&TokenKind::ColonColon).is_some() {
                ident.push_str("::");
                self.skip_newlines();
            } else {
                break;
            }
        }

        let span = span.unwrap_or_else(Span::dummy);
        Ok(Expr::Name(NameRef {
            from: self.scopes.current(),
            token: Token::new(TokenKind::Ident(ident.clone()), span),
            ident,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(src: &str) -> Result<(Script, ScopeTree, Globals), SableError> {
        let tokens = Lexer::new(src).tokenize()?;
        let mut scopes = ScopeTree::new();
        let mut globals = Globals::new();
        let script = Parser::new(tokens, &mut scopes, &mut globals).parse_script()?;
        Ok((script, scopes, globals))
    }

    #[test]
    fn test_parse_print_arith() {
        let (script, _, _) = parse("print 1 + 2 * 3").unwrap();
        assert_eq!(script.decls.len(), 1);
    }

    #[test]
    fn test_parse_fun_decl_registers_global() {
        let (_, _, globals) = parse("fun f(n) { return n }").unwrap();
        assert!(globals.index_of("::f").is_some());
    }

    #[test]
    fn test_parse_var_accepts_both_initializers() {
        assert!(parse("var a = 1").is_ok());
        assert!(parse("var b := 2").is_ok());
    }

    #[test]
    fn test_expression_assign_requires_walrus() {
        // `=` in expression context parses into an Assign node; the compiler
        // rejects it. Invalid targets are rejected here.
        assert!(parse("1 := 2").is_err());
    }

    #[test]
    fn test_parse_object_with_super() {
        let (script, _, _) =
            parse("obj A(x) { }\nobj B(x) : A(x) { fun m() { return 1 } }").unwrap();
        assert_eq!(script.decls.len(), 2);
        match &script.decls[1] {
            Decl::Object(obj) => {
                assert!(obj.super_init.is_some());
                match &obj.body[0] {
                    Decl::Fun(f) => assert!(f.is_api, "object-body methods are api"),
                    _ => panic!("expected method"),
                }
            }
            _ => panic!("expected object declaration"),
        }
    }

    #[test]
    fn test_parse_for_in_unsupported() {
        let err = parse("for x in m { }").unwrap_err();
        assert!(err.to_string().contains("for..in"));
    }

    #[test]
    fn test_parse_c_style_for() {
        let (script, _, _) = parse("for var i = 0; i < 3; i := i + 1 { print i }").unwrap();
        match &script.decls[0] {
            Decl::Stmt(Stmt::Loop(l)) => {
                assert_eq!(l.kind, LoopKind::For);
                assert!(l.before.is_some());
                assert!(l.cond.is_some());
                assert!(l.after.is_some());
            }
            _ => panic!("expected for loop"),
        }
    }

    #[test]
    fn test_parse_tagged_loop() {
        let (script, _, _) = parse("loop outer { break outer }").unwrap();
        match &script.decls[0] {
            Decl::Stmt(Stmt::Loop(l)) => {
                assert_eq!(l.kind, LoopKind::Basic);
                assert_eq!(l.tag.as_deref(), Some("outer"));
            }
            _ => panic!("expected loop"),
        }
    }

    #[test]
    fn test_parse_lambda_literal() {
        let (script, _, _) = parse("var g = \\() { return 1 }").unwrap();
        match &script.decls[0] {
            Decl::Var(v) => assert!(matches!(v.init, Some(Expr::Lambda(_)))),
            _ => panic!("expected var declaration"),
        }
    }

    #[test]
    fn test_parse_map_literal_with_implicit_keys() {
        let (script, _, _) = parse("var m = { \"a\": 1, 42 }").unwrap();
        match &script.decls[0] {
            Decl::Var(v) => match &v.init {
                Some(Expr::Map(m)) => assert_eq!(m.entries.len(), 2),
                _ => panic!("expected map literal"),
            },
            _ => panic!("expected var declaration"),
        }
    }

    #[test]
    fn test_redefinition_diagnostic_has_related_note() {
        let err = parse("var x = 1\nvar x = 2").unwrap_err();
        match err {
            SableError::Compile { related, .. } => assert_eq!(related.len(), 1),
            other => panic!("expected compile error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ffi_decl() {
        let (script, scopes, globals) = parse("ffi host(a, b)").unwrap();
        match &script.decls[0] {
            Decl::Ffi { arity, scope, .. } => {
                assert_eq!(*arity, 2);
                assert_eq!(scopes.qualified_name(*scope), "::host");
            }
            _ => panic!("expected an ffi declaration"),
        }
        assert!(globals.index_of("::host").is_some());
    }

    #[test]
    fn test_module_scoped_resolution() {
        let (_, scopes, globals) = parse("mod m { fun f() { return 1 } }").unwrap();
        assert!(globals.index_of("::m::f").is_some());
        assert!(scopes.resolve("m::f", scopes.root()).is_some());
    }
}
