//! AST to bytecode compiler
//!
//! A walker over the AST that emits bytecode into the current function's
//! code buffer while tracking the compile-time operand-stack depth. Each
//! function compiles in its own `Compiler`; nested declarations sub-compile
//! either inline or, when the threaded option is on and workers are
//! available, on a worker thread. Locals and upvalue descriptors live in a
//! mutex-guarded scaffold per function so an inner compiler can register
//! captures against its enclosing functions while they are still compiling.

use crate::ast::*;
use crate::bytecode::{CodeBuf, Op};
use crate::context::{Context, Options};
use crate::error::SableError;
use crate::heap::{FnKind, Function, LocalVar, ObjData, ObjRef, UpvarDesc};
use crate::optimizer;
use crate::scope::ScopeId;
use crate::span::Span;
use crate::token::{Token, TokenKind};
use crate::value::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// Compile a parsed script into a runnable function object
pub fn compile(
    ctx: &Arc<Mutex<Context>>,
    script: Arc<Script>,
    options: Options,
) -> Result<ObjRef, SableError> {
    let fun = {
        let mut ctx = lock(ctx);
        let fun = make_function(&mut ctx, FnKind::Script, 0, "::");
        let idx = ctx
            .globals
            .index_of("::")
            .unwrap_or_else(|| ctx.globals.add("::"));
        ctx.globals.set(idx, Value::obj(fun));
        fun
    };

    let compiler = Compiler::new(ctx.clone(), options, fun, FnKind::Script, Vec::new());
    compiler.run(CompileUnit::Script(script))
}

/// Lock a mutex, recovering the guard if a worker panicked while holding it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Allocate a function object with empty code
fn make_function(ctx: &mut Context, kind: FnKind, arity: usize, qualified: &str) -> ObjRef {
    let short = qualified.rsplit("::").next().unwrap_or(qualified);
    let short = if short.is_empty() { qualified } else { short };
    let name = ctx.intern(qualified);
    let short_name = ctx.intern(short);
    ctx.heap.alloc(ObjData::Function(Function {
        kind,
        arity,
        name,
        short_name,
        code: None,
        locals: Vec::new(),
        upvars: Vec::new(),
        patch_point: None,
        is_api: false,
    }))
}

/// Shared compile-time view of one function: its locals and upvalue
/// descriptors, mutated both by its own compiler and by inner compilers
/// registering captures
#[derive(Debug, Default)]
pub struct FnScaffold {
    locals: Vec<LocalVar>,
    upvars: Vec<UpvarDesc>,
}

impl FnScaffold {
    fn add_upvar(&mut self, index: usize, from_local: bool) -> usize {
        if let Some(existing) = self
            .upvars
            .iter()
            .position(|u| u.index == index && u.from_local == from_local)
        {
            return existing;
        }
        self.upvars.push(UpvarDesc { index, from_local });
        self.upvars.len() - 1
    }
}

type ScaffoldRef = Arc<Mutex<FnScaffold>>;

/// The unit of work a sub-compiler runs over
#[derive(Clone)]
enum CompileUnit {
    Script(Arc<Script>),
    Fun(Arc<FunDecl>),
    Object(Arc<ObjectDecl>),
    Lambda(Arc<LambdaExpr>),
    Map(Arc<MapLiteral>),
}

/// Break/continue bookkeeping for one active loop
struct LoopPatches {
    tag: Option<String>,
    base_pos: usize,
    points: Vec<usize>,
}

fn worker_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Per-function compiler state
pub struct Compiler {
    ctx: Arc<Mutex<Context>>,
    options: Options,
    /// The function object being built
    fun: ObjRef,
    kind: FnKind,
    scaffold: ScaffoldRef,
    /// Scaffolds of the enclosing functions, outermost first
    enclosing: Vec<ScaffoldRef>,
    code: CodeBuf,
    /// Compile-time operand-stack depth; slot 0 holds the callee
    stack_pos: usize,
    prev_op: Op,
    break_stack: Vec<LoopPatches>,
    continue_stack: Vec<LoopPatches>,
    pending: Vec<JoinHandle<Result<ObjRef, SableError>>>,
    workers: Arc<AtomicUsize>,
}

impl Compiler {
    fn new(
        ctx: Arc<Mutex<Context>>,
        options: Options,
        fun: ObjRef,
        kind: FnKind,
        enclosing: Vec<ScaffoldRef>,
    ) -> Self {
        Self {
            ctx,
            options,
            fun,
            kind,
            scaffold: Arc::new(Mutex::new(FnScaffold::default())),
            enclosing,
            code: CodeBuf::new(),
            stack_pos: 1,
            prev_op: Op::Call,
            break_stack: Vec::new(),
            continue_stack: Vec::new(),
            pending: Vec::new(),
            workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Compile this function's unit to completion and finalize it
    fn run(mut self, unit: CompileUnit) -> Result<ObjRef, SableError> {
        match &unit {
            CompileUnit::Script(script) => {
                for decl in &script.decls {
                    self.decl(decl)?;
                }
            }
            CompileUnit::Fun(fun) => {
                self.params(&fun.params)?;
                for decl in &fun.body {
                    self.decl(decl)?;
                }
            }
            CompileUnit::Lambda(lambda) => {
                self.params(&lambda.params)?;
                for decl in &lambda.body {
                    self.decl(decl)?;
                }
            }
            CompileUnit::Object(obj) => {
                self.params(&obj.params)?;
                if let Some(super_init) = &obj.super_init {
                    self.expr(&super_init.call)?;
                    self.emit_op_at(Op::Super, super_init.token.span);
                }
                for decl in &obj.body {
                    self.decl(decl)?;
                }
            }
            CompileUnit::Map(map) => {
                for (key, value) in &map.entries {
                    self.expr(key)?;
                    self.expr(value)?;
                    self.emit_op(Op::Pair);
                }
            }
        }

        // Implicit return: class and map-init frames return their receiver.
        if self.kind == FnKind::Script {
            self.emit_skips();
            self.emit_op(Op::Nil);
        } else {
            self.emit_op(Op::Map);
        }
        self.emit_op(Op::Ret);

        self.await_pending()?;

        if self.options.optimize {
            optimizer::optimize(&mut self.code, &self.ctx, self.fun)?;
        }

        self.finalize()
    }

    fn finalize(self) -> Result<ObjRef, SableError> {
        let scaffold = std::mem::take(&mut *lock(&self.scaffold));
        let chunk = self.code.finish();

        let mut ctx = lock(&self.ctx);
        if self.options.dump_bytecode {
            let name = ctx
                .heap
                .as_function(self.fun)
                .and_then(|f| ctx.heap.as_str(f.name))
                .unwrap_or("?")
                .to_string();
            eprintln!("-- {} --\n{}", name, crate::bytecode::disassemble(&chunk, &ctx));
        }
        let code = ctx.heap.alloc(ObjData::Code(chunk));
        match ctx.heap.as_function_mut(self.fun) {
            Some(f) => {
                f.code = Some(code);
                f.locals = scaffold.locals;
                f.upvars = scaffold.upvars;
            }
            None => unreachable!("compiling a non-function object"),
        }
        Ok(self.fun)
    }

    // ── emission ─────────────────────────────────────────────────────────────

    fn emit_op(&mut self, op: Op) {
        self.stack_pos = (self.stack_pos as i64 + op.stack_effect() as i64).max(0) as usize;
        self.prev_op = op;
        self.code.emit(op as u8);
    }

    fn emit_op_at(&mut self, op: Op, span: Span) {
        self.stack_pos = (self.stack_pos as i64 + op.stack_effect() as i64).max(0) as usize;
        self.prev_op = op;
        self.code.emit_at(op as u8, span);
    }

    /// Two `SKIP` placeholders give the constant folder writable workspace
    fn emit_skips(&mut self) {
        if self.options.optimize {
            self.emit_op(Op::Skip);
            self.emit_op(Op::Skip);
        }
    }

    fn operand_index(&mut self, idx: usize, what: &str, span: Span) -> Result<u16, SableError> {
        u16::try_from(idx)
            .map_err(|_| SableError::compile(format!("too many {}", what), span))
    }

    fn emit_const_value(&mut self, v: Value, span: Span) -> Result<(), SableError> {
        let idx = lock(&self.ctx).constants.add(v);
        let idx = self.operand_index(idx, "constants", span)?;
        self.emit_op_at(Op::Const, span);
        self.code.emit_u16(idx);
        Ok(())
    }

    fn emit_number(&mut self, n: f64, span: Span) -> Result<(), SableError> {
        if n == 0.0 {
            self.emit_skips();
            self.emit_op_at(Op::Zero, span);
        } else if n == 1.0 {
            self.emit_skips();
            self.emit_op_at(Op::One, span);
        } else if n == 2.0 {
            self.emit_skips();
            self.emit_op_at(Op::Two, span);
        } else {
            self.emit_const_value(Value::num(n), span)?;
        }
        Ok(())
    }

    /// Emit a jump with a placeholder operand; returns the opcode offset
    fn mark_jump(&mut self, op: Op, span: Span) -> usize {
        self.emit_op_at(op, span);
        let at = self.code.pos() - 1;
        self.code.emit_u16(0);
        at
    }

    /// Patch the jump at `jump` to target an absolute offset
    fn patch_jump_to(&mut self, jump: usize, target: usize) -> Result<(), SableError> {
        let distance = target.abs_diff(jump);
        let distance = u16::try_from(distance).map_err(|_| {
            let span = self.code.spans.get(&(jump as u32)).copied();
            SableError::Compile {
                message: "branch distance exceeds the 16-bit operand range".to_string(),
                span,
                related: Vec::new(),
            }
        })?;
        crate::bytecode::write_u16(&mut self.code.bytes, jump + 1, distance);
        Ok(())
    }

    /// Patch the jump at `jump` to target the current position
    fn patch_jump(&mut self, jump: usize) -> Result<(), SableError> {
        self.patch_jump_to(jump, self.code.pos())
    }

    // ── locals and upvalues ──────────────────────────────────────────────────

    fn declare_local(&mut self, name: String) {
        lock(&self.scaffold).locals.push(LocalVar {
            name,
            slot: self.stack_pos,
            captured: false,
        });
    }

    fn find_local(&self, name: &str) -> Option<usize> {
        lock(&self.scaffold)
            .locals
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| l.slot)
    }

    fn local_at_slot_is_captured(&self, slot: usize) -> bool {
        lock(&self.scaffold)
            .locals
            .iter()
            .rev()
            .find(|l| l.slot == slot)
            .map(|l| l.captured)
            .unwrap_or(false)
    }

    /// Register an upvalue chain for `name`, returning its index in this
    /// function's descriptor table
    fn find_upvar(&self, name: &str) -> Option<usize> {
        let mut chain: Vec<&ScaffoldRef> = self.enclosing.iter().collect();
        chain.push(&self.scaffold);
        capture(&chain, name)
    }

    fn params(&mut self, params: &[Param]) -> Result<(), SableError> {
        for param in params {
            let qualified = lock(&self.ctx).scopes.qualified_name(param.scope);
            self.declare_local(qualified);
            self.stack_pos += 1;
        }
        Ok(())
    }

    // ── declarations ─────────────────────────────────────────────────────────

    fn decl(&mut self, decl: &Decl) -> Result<(), SableError> {
        match decl {
            Decl::Module { body, .. } => {
                for d in body {
                    self.decl(d)?;
                }
                Ok(())
            }
            Decl::Fun(fun) => self.fun_decl(fun),
            Decl::Object(obj) => self.object_decl(obj),
            Decl::Var(var) => self.var_decl(var),
            Decl::Ffi { .. } => Ok(()),
            Decl::Stmt(stmt) => self.stmt(stmt),
        }
    }

    fn fun_decl(&mut self, decl: &Arc<FunDecl>) -> Result<(), SableError> {
        let (qualified, is_global, global_index) = self.scope_info(decl.scope);

        let fun = {
            let mut ctx = lock(&self.ctx);
            let fun = make_function(&mut ctx, FnKind::Script, decl.params.len(), &qualified);
            if let Some(f) = ctx.heap.as_function_mut(fun) {
                f.is_api = decl.is_api;
            }
            fun
        };

        if is_global {
            let idx = self.global_index_or_err(global_index, &qualified, decl.name.span)?;
            lock(&self.ctx).globals.set(idx, Value::obj(fun));
        } else {
            self.set_patch_point(fun);
            self.declare_local(qualified);
            self.emit_const_value(Value::obj(fun), decl.name.span)?;
        }

        self.subcompile(fun, FnKind::Script, CompileUnit::Fun(decl.clone()))
    }

    fn object_decl(&mut self, decl: &Arc<ObjectDecl>) -> Result<(), SableError> {
        let (qualified, is_global, global_index) = self.scope_info(decl.scope);

        let class = {
            let mut ctx = lock(&self.ctx);
            let class = make_function(&mut ctx, FnKind::Class, decl.params.len(), &qualified);
            if let Some(f) = ctx.heap.as_function_mut(class) {
                f.is_api = decl.is_api;
            }
            class
        };

        if is_global {
            let idx = self.global_index_or_err(global_index, &qualified, decl.name.span)?;
            lock(&self.ctx).globals.set(idx, Value::obj(class));
        } else {
            self.set_patch_point(class);
            self.declare_local(qualified);
            self.emit_const_value(Value::obj(class), decl.name.span)?;
        }

        self.subcompile(class, FnKind::Class, CompileUnit::Object(decl.clone()))
    }

    fn var_decl(&mut self, decl: &VarDecl) -> Result<(), SableError> {
        let (qualified, is_global, global_index) = self.scope_info(decl.scope);

        if !is_global {
            self.declare_local(qualified.clone());
        }

        match &decl.init {
            Some(init) => self.expr(init)?,
            None => self.emit_op(Op::Nil),
        }

        if is_global {
            let idx = self.global_index_or_err(global_index, &qualified, decl.name.span)?;
            let idx = self.operand_index(idx, "globals", decl.name.span)?;
            self.emit_op_at(Op::Store, decl.name.span);
            self.code.emit_u16(idx);
            self.emit_op(Op::Pop);
        }
        Ok(())
    }

    fn scope_info(&self, scope: ScopeId) -> (String, bool, Option<usize>) {
        let ctx = lock(&self.ctx);
        (
            ctx.scopes.qualified_name(scope),
            ctx.scopes.is_global(scope),
            ctx.scopes.get(scope).global_index,
        )
    }

    fn global_index_or_err(
        &self,
        idx: Option<usize>,
        qualified: &str,
        span: Span,
    ) -> Result<usize, SableError> {
        match idx {
            Some(idx) => Ok(idx),
            None => lock(&self.ctx)
                .globals
                .index_of(qualified)
                .ok_or_else(|| {
                    SableError::compile(format!("unknown identifier '{}'", qualified), span)
                }),
        }
    }

    fn set_patch_point(&mut self, fun: ObjRef) {
        let at = self.code.pos();
        if let Some(f) = lock(&self.ctx).heap.as_function_mut(fun) {
            f.patch_point = Some(at);
        }
    }

    // ── sub-compilation ──────────────────────────────────────────────────────

    fn subcompile(&mut self, fun: ObjRef, kind: FnKind, unit: CompileUnit) -> Result<(), SableError> {
        let mut enclosing = self.enclosing.clone();
        enclosing.push(self.scaffold.clone());

        let mut child = Compiler::new(self.ctx.clone(), self.options, fun, kind, enclosing);
        child.workers = self.workers.clone();

        if self.options.threaded_compile && self.workers.load(Ordering::Relaxed) < worker_limit() {
            self.workers.fetch_add(1, Ordering::Relaxed);
            let workers = self.workers.clone();
            let handle = std::thread::spawn(move || {
                let result = child.run(unit);
                workers.fetch_sub(1, Ordering::Relaxed);
                result
            });
            self.pending.push(handle);
            Ok(())
        } else {
            let child_fun = child.run(unit)?;
            self.finalize_child(child_fun);
            Ok(())
        }
    }

    /// Rewrite the child's `CONST` load to `CLOSURE` when it captures
    /// upvalues, or unconditionally inside a class body (method installation
    /// happens when the closure is built)
    fn finalize_child(&mut self, child: ObjRef) {
        let (has_upvars, patch_point) = {
            let ctx = lock(&self.ctx);
            match ctx.heap.as_function(child) {
                Some(f) => (!f.upvars.is_empty(), f.patch_point),
                None => (false, None),
            }
        };
        if self.kind == FnKind::Class || has_upvars {
            if let Some(at) = patch_point {
                if self.code.op_at(at) == Op::Const as u8 {
                    self.code.patch_byte(at, Op::Closure as u8);
                }
            }
        }
    }

    /// Join every deferred sub-compilation, in defer order, then apply the
    /// closure patches. Joining in order keeps diagnostics deterministic.
    fn await_pending(&mut self) -> Result<(), SableError> {
        let pending = std::mem::take(&mut self.pending);
        let mut first_error = None;
        for handle in pending {
            match handle.join() {
                Ok(Ok(child)) => self.finalize_child(child),
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error =
                            Some(SableError::runtime("sub-compilation worker panicked"));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ── statements ───────────────────────────────────────────────────────────

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), SableError> {
        match stmt {
            Stmt::Print { token, expr } => {
                self.expr(expr)?;
                self.emit_op_at(Op::Print, token.span);
                Ok(())
            }
            Stmt::If { cond, then, els } => self.if_stmt(cond, then, els.as_deref()),
            Stmt::Loop(loop_stmt) => self.loop_stmt(loop_stmt),
            Stmt::Return { token, expr } => self.return_stmt(token, expr.as_ref()),
            Stmt::Break { token, tag } => self.break_stmt(token, tag.as_deref()),
            Stmt::Continue { token, tag } => self.continue_stmt(token, tag.as_deref()),
            Stmt::Block(decls) => self.block(decls),
            Stmt::Use { .. } => Ok(()),
            Stmt::Expr(expr) => self.expr(expr),
        }
    }

    fn block(&mut self, decls: &[Decl]) -> Result<(), SableError> {
        let base = self.begin_scope();
        for decl in decls {
            self.decl(decl)?;
        }
        self.end_scope(base);
        Ok(())
    }

    fn begin_scope(&self) -> usize {
        self.stack_pos
    }

    /// Pop (or close) everything the scope pushed. With the threaded
    /// compiler a deferred inner function may not have registered its
    /// captures yet, so every local is conservatively closed; `CLOSE` on an
    /// uncaptured slot degenerates to a pop.
    fn end_scope(&mut self, base: usize) {
        while self.stack_pos > base {
            let slot = self.stack_pos - 1;
            if self.options.threaded_compile || self.local_at_slot_is_captured(slot) {
                self.emit_op(Op::Close);
            } else {
                self.emit_op(Op::Pop);
            }
        }
    }

    fn if_stmt(&mut self, cond: &Expr, then: &Stmt, els: Option<&Stmt>) -> Result<(), SableError> {
        self.expr(cond)?;
        let over_then = self.mark_jump(Op::Brz, cond.token().span);
        self.stmt(then)?;

        if let Some(els) = els {
            let over_else = self.mark_jump(Op::Bra, cond.token().span);
            self.patch_jump(over_then)?;
            self.stmt(els)?;
            self.patch_jump(over_else)?;
        } else {
            self.patch_jump(over_then)?;
        }
        Ok(())
    }

    fn return_stmt(&mut self, token: &Token, expr: Option<&Expr>) -> Result<(), SableError> {
        if self.kind != FnKind::Script {
            return Err(SableError::compile(
                "explicit return not allowed in object definition",
                token.span,
            ));
        }
        match expr {
            Some(expr) => self.expr(expr)?,
            None => self.emit_op(Op::Nil),
        }
        self.emit_op_at(Op::Ret, token.span);
        Ok(())
    }

    fn find_loop<'s>(
        stack: &'s mut [LoopPatches],
        tag: Option<&str>,
    ) -> Option<&'s mut LoopPatches> {
        match tag {
            Some(tag) => stack
                .iter_mut()
                .rev()
                .find(|l| l.tag.as_deref() == Some(tag)),
            None => stack.last_mut(),
        }
    }

    fn break_stmt(&mut self, token: &Token, tag: Option<&str>) -> Result<(), SableError> {
        let base_pos = match Self::find_loop(&mut self.break_stack, tag) {
            Some(info) => info.base_pos,
            None => {
                let message = match tag {
                    Some(tag) => format!("no enclosing loop tagged '{}'", tag),
                    None => "break outside of a loop".to_string(),
                };
                return Err(SableError::compile(message, token.span));
            }
        };

        // Pop the loop's live locals on the jump path without disturbing the
        // fall-through depth ledger.
        let saved = self.stack_pos;
        while self.stack_pos > base_pos {
            self.emit_op(Op::Pop);
        }
        let jump = self.mark_jump(Op::Bra, token.span);
        self.stack_pos = saved;

        if let Some(info) = Self::find_loop(&mut self.break_stack, tag) {
            info.points.push(jump);
        }
        Ok(())
    }

    fn continue_stmt(&mut self, token: &Token, tag: Option<&str>) -> Result<(), SableError> {
        let base_pos = match Self::find_loop(&mut self.continue_stack, tag) {
            Some(info) => info.base_pos,
            None => {
                let message = match tag {
                    Some(tag) => format!("no enclosing loop tagged '{}'", tag),
                    None => "continue outside of a loop".to_string(),
                };
                return Err(SableError::compile(message, token.span));
            }
        };

        let saved = self.stack_pos;
        while self.stack_pos > base_pos {
            self.emit_op(Op::Pop);
        }
        // Continues are emitted as backward LOOP jumps; a flavor whose
        // continue target lies ahead rewrites them to BRA while patching.
        let jump = self.mark_jump(Op::Loop, token.span);
        self.stack_pos = saved;

        if let Some(info) = Self::find_loop(&mut self.continue_stack, tag) {
            info.points.push(jump);
        }
        Ok(())
    }

    fn loop_stmt(&mut self, stmt: &LoopStmt) -> Result<(), SableError> {
        // The C-style initializer runs before the loop's entry depth is
        // recorded, so breaks leave its variable in place for the enclosing
        // scope to pop.
        if let Some(before) = &stmt.before {
            self.decl(before)?;
        }

        self.break_stack.push(LoopPatches {
            tag: stmt.tag.clone(),
            base_pos: self.stack_pos,
            points: Vec::new(),
        });
        self.continue_stack.push(LoopPatches {
            tag: stmt.tag.clone(),
            base_pos: self.stack_pos,
            points: Vec::new(),
        });

        match stmt.kind {
            LoopKind::While => self.pre_test_loop(stmt, Op::Brz)?,
            LoopKind::Until => self.pre_test_loop(stmt, Op::Bnz)?,
            LoopKind::LoopWhile => self.post_test_loop(stmt, Op::Brz)?,
            LoopKind::LoopUntil => self.post_test_loop(stmt, Op::Bnz)?,
            LoopKind::Basic => self.basic_loop(stmt)?,
            LoopKind::For => self.for_loop(stmt)?,
        }

        self.continue_stack.pop();
        let breaks = match self.break_stack.pop() {
            Some(info) => info.points,
            None => Vec::new(),
        };
        for point in breaks {
            self.patch_jump(point)?;
        }
        Ok(())
    }

    fn loop_body(&mut self, body: &Stmt) -> Result<(), SableError> {
        // Bodies always run scoped so per-iteration values cannot accumulate.
        let base = self.begin_scope();
        self.stmt(body)?;
        self.end_scope(base);
        Ok(())
    }

    fn mark_backward_jump(&mut self, target: usize, span: Span) -> Result<(), SableError> {
        let jump = self.mark_jump(Op::Loop, span);
        self.patch_jump_to(jump, target)
    }

    /// `while`/`until cond body`
    fn pre_test_loop(&mut self, stmt: &LoopStmt, exit_op: Op) -> Result<(), SableError> {
        let span = stmt.body.first_span();
        let start = self.code.pos();
        if let Some(cond) = &stmt.cond {
            self.expr(cond)?;
        }
        let exit = self.mark_jump(exit_op, span);
        self.loop_body(&stmt.body)?;
        self.mark_backward_jump(start, span)?;
        self.patch_jump(exit)?;

        let points = self.continue_stack_top_points();
        for point in points {
            self.patch_jump_to(point, start)?;
        }
        Ok(())
    }

    /// `loop body while/until cond` — conditional exit forward, then an
    /// unconditional backward branch to the body
    fn post_test_loop(&mut self, stmt: &LoopStmt, exit_op: Op) -> Result<(), SableError> {
        let span = stmt.body.first_span();
        let body_start = self.code.pos();
        self.loop_body(&stmt.body)?;
        let after_body = self.code.pos();

        if let Some(cond) = &stmt.cond {
            self.expr(cond)?;
        }
        let exit = self.mark_jump(exit_op, span);
        self.mark_backward_jump(body_start, span)?;
        self.patch_jump(exit)?;

        // A post-test continue jumps forward to the condition.
        let points = self.continue_stack_top_points();
        for point in points {
            self.code.patch_byte(point, Op::Bra as u8);
            self.patch_jump_to(point, after_body)?;
        }
        Ok(())
    }

    /// `loop body`
    fn basic_loop(&mut self, stmt: &LoopStmt) -> Result<(), SableError> {
        let span = stmt.body.first_span();
        let start = self.code.pos();
        self.loop_body(&stmt.body)?;
        self.mark_backward_jump(start, span)?;

        let points = self.continue_stack_top_points();
        for point in points {
            self.patch_jump_to(point, start)?;
        }
        Ok(())
    }

    /// `for init; cond; step body`
    fn for_loop(&mut self, stmt: &LoopStmt) -> Result<(), SableError> {
        let span = stmt.body.first_span();
        let start = self.code.pos();

        let exit = match &stmt.cond {
            Some(cond) => {
                self.expr(cond)?;
                Some(self.mark_jump(Op::Brz, span))
            }
            None => None,
        };

        self.loop_body(&stmt.body)?;

        let step_target = self.code.pos();
        if let Some(after) = &stmt.after {
            if let Stmt::Expr(step) = after.as_ref() {
                self.expr(step)?;
                self.emit_op(Op::Pop);
            }
        }
        self.mark_backward_jump(start, span)?;
        if let Some(exit) = exit {
            self.patch_jump(exit)?;
        }

        // Continues target the step expression, which lies ahead of them.
        let points = self.continue_stack_top_points();
        for point in points {
            self.code.patch_byte(point, Op::Bra as u8);
            self.patch_jump_to(point, step_target)?;
        }
        Ok(())
    }

    fn continue_stack_top_points(&mut self) -> Vec<usize> {
        self.continue_stack
            .last_mut()
            .map(|info| std::mem::take(&mut info.points))
            .unwrap_or_default()
    }

    // ── expressions ──────────────────────────────────────────────────────────

    fn expr(&mut self, expr: &Expr) -> Result<(), SableError> {
        match expr {
            Expr::Number { value, token } => self.emit_number(*value, token.span),
            Expr::Str { value, token } => {
                let v = lock(&self.ctx).intern_value(value);
                self.emit_const_value(v, token.span)
            }
            Expr::Bool { value, token } => {
                self.emit_skips();
                self.emit_op_at(if *value { Op::True } else { Op::False }, token.span);
                Ok(())
            }
            Expr::Nil { .. } => {
                self.emit_op(Op::Nil);
                Ok(())
            }
            Expr::SelfRef { token } => {
                self.emit_op_at(Op::Map, token.span);
                Ok(())
            }
            Expr::Name(name) => self.name_get(name),
            Expr::Assign { target, op, value } => self.assign(target, op, value),
            Expr::Unary { op, operand } => {
                self.expr(operand)?;
                if op.kind == TokenKind::Minus {
                    self.emit_op_at(Op::Neg, op.span);
                }
                Ok(())
            }
            Expr::Binary { op, lhs, rhs } => self.binary(op, lhs, rhs),
            Expr::Call {
                callee,
                args,
                token,
            } => self.call(callee, args, token),
            Expr::Member { object, name } => {
                self.expr(object)?;
                self.member_op(Op::MbrGet, name)
            }
            Expr::Subscript {
                object,
                index,
                token,
            } => {
                self.expr(object)?;
                self.expr(index)?;
                self.emit_op_at(Op::KeyGet, token.span);
                Ok(())
            }
            Expr::Lambda(lambda) => self.lambda(lambda),
            Expr::Map(map) => self.map_literal(map),
        }
    }

    fn member_op(&mut self, op: Op, name: &Token) -> Result<(), SableError> {
        let text = match &name.kind {
            TokenKind::Ident(text) => text.clone(),
            _ => unreachable!("member name is always an identifier"),
        };
        let idx = {
            let mut ctx = lock(&self.ctx);
            let v = ctx.intern_value(&text);
            ctx.constants.add(v)
        };
        let idx = self.operand_index(idx, "constants", name.span)?;
        self.emit_op_at(op, name.span);
        self.code.emit_u16(idx);
        Ok(())
    }

    fn assign(&mut self, target: &Expr, op: &Token, value: &Expr) -> Result<(), SableError> {
        if op.kind == TokenKind::Equal {
            return Err(SableError::compile(
                "use ':=' for assignment within expressions",
                op.span,
            ));
        }

        match target {
            Expr::Name(name) => {
                self.expr(value)?;
                self.name_set(name)
            }
            Expr::Member { object, name } => {
                self.expr(object)?;
                self.expr(value)?;
                self.member_op(Op::MbrSet, name)
            }
            Expr::Subscript {
                object,
                index,
                token,
            } => {
                self.expr(object)?;
                self.expr(index)?;
                self.expr(value)?;
                self.emit_op_at(Op::KeySet, token.span);
                Ok(())
            }
            _ => Err(SableError::compile("invalid assignment target", op.span)),
        }
    }

    fn binary(&mut self, op: &Token, lhs: &Expr, rhs: &Expr) -> Result<(), SableError> {
        self.expr(lhs)?;
        self.expr(rhs)?;

        let span = op.span;
        match op.kind {
            TokenKind::Plus => {
                if self.prev_op == Op::One {
                    self.fold_one_into(Op::Inc, span);
                } else {
                    self.emit_op_at(Op::Add, span);
                }
            }
            TokenKind::Minus => {
                if self.prev_op == Op::One {
                    self.fold_one_into(Op::Dec, span);
                } else {
                    self.emit_op_at(Op::Sub, span);
                }
            }
            TokenKind::Star => self.emit_op_at(Op::Mul, span),
            TokenKind::Slash => self.emit_op_at(Op::Div, span),
            TokenKind::Less => self.emit_op_at(Op::Lt, span),
            TokenKind::LessEqual => self.emit_op_at(Op::LtEq, span),
            TokenKind::Greater => self.emit_op_at(Op::Gt, span),
            TokenKind::GreaterEqual => self.emit_op_at(Op::GtEq, span),
            TokenKind::EqualEqual => self.emit_op_at(Op::Eq, span),
            TokenKind::BangEqual => self.emit_op_at(Op::NotEq, span),
            TokenKind::Is => self.emit_op_at(Op::Is, span),
            TokenKind::And => self.emit_op_at(Op::And, span),
            TokenKind::Or => self.emit_op_at(Op::Or, span),
            TokenKind::Xor => self.emit_op_at(Op::Xor, span),
            _ => unreachable!("parser only builds known binary operators"),
        }
        Ok(())
    }

    /// `x + 1` / `x - 1`: rewrite the freshly emitted `ONE` into `INC`/`DEC`
    fn fold_one_into(&mut self, op: Op, span: Span) {
        let at = self.code.pos() - 1;
        self.code.patch_byte(at, op as u8);
        self.code.map_span(at, span);
        self.prev_op = op;
        self.stack_pos -= 1;
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], token: &Token) -> Result<(), SableError> {
        self.expr(callee)?;
        let depth_after_callee = self.stack_pos;

        for arg in args {
            self.expr(arg)?;
        }
        let nargs = u8::try_from(args.len())
            .map_err(|_| SableError::compile("too many call arguments", token.span))?;

        self.emit_op_at(Op::Call, token.span);
        self.code.emit_at(nargs, token.span);

        // The callee slot now holds the single return value.
        self.stack_pos = depth_after_callee;
        Ok(())
    }

    fn name_get(&mut self, name: &NameRef) -> Result<(), SableError> {
        match self.resolve(name)? {
            Resolved::Global(idx) => {
                let idx = self.operand_index(idx, "globals", name.token.span)?;
                self.emit_op_at(Op::Global, name.token.span);
                self.code.emit_u16(idx);
            }
            Resolved::Local(slot) => {
                let slot = self.operand_index(slot, "locals", name.token.span)?;
                self.emit_op_at(Op::Get, name.token.span);
                self.code.emit_u16(slot);
            }
            Resolved::Upvalue(idx) => {
                let idx = self.operand_index(idx, "upvalues", name.token.span)?;
                self.emit_op_at(Op::UpvGet, name.token.span);
                self.code.emit_u16(idx);
            }
        }
        Ok(())
    }

    fn name_set(&mut self, name: &NameRef) -> Result<(), SableError> {
        match self.resolve(name)? {
            Resolved::Global(idx) => {
                let idx = self.operand_index(idx, "globals", name.token.span)?;
                self.emit_op_at(Op::Store, name.token.span);
                self.code.emit_u16(idx);
            }
            Resolved::Local(slot) => {
                let slot = self.operand_index(slot, "locals", name.token.span)?;
                self.emit_op_at(Op::Set, name.token.span);
                self.code.emit_u16(slot);
            }
            Resolved::Upvalue(idx) => {
                let idx = self.operand_index(idx, "upvalues", name.token.span)?;
                self.emit_op_at(Op::UpvSet, name.token.span);
                self.code.emit_u16(idx);
            }
        }
        Ok(())
    }

    fn resolve(&mut self, name: &NameRef) -> Result<Resolved, SableError> {
        let (resolved, qualified, is_global, global_index) = {
            let ctx = lock(&self.ctx);
            match ctx.scopes.resolve(&name.ident, name.from) {
                Some(sid) => (
                    true,
                    ctx.scopes.qualified_name(sid),
                    ctx.scopes.is_global(sid),
                    ctx.scopes.get(sid).global_index,
                ),
                None => (false, String::new(), false, None),
            }
        };
        if !resolved {
            return Err(SableError::compile(
                format!("unknown identifier '{}'", name.ident),
                name.token.span,
            ));
        }

        if is_global {
            let idx = self.global_index_or_err(global_index, &qualified, name.token.span)?;
            return Ok(Resolved::Global(idx));
        }
        if let Some(slot) = self.find_local(&qualified) {
            return Ok(Resolved::Local(slot));
        }
        if let Some(idx) = self.find_upvar(&qualified) {
            return Ok(Resolved::Upvalue(idx));
        }
        Err(SableError::compile(
            format!("unknown identifier '{}'", name.ident),
            name.token.span,
        ))
    }

    fn lambda(&mut self, lambda: &Arc<LambdaExpr>) -> Result<(), SableError> {
        let qualified = lock(&self.ctx).scopes.qualified_name(lambda.scope);
        let fun = {
            let mut ctx = lock(&self.ctx);
            make_function(&mut ctx, FnKind::Script, lambda.params.len(), &qualified)
        };
        self.set_patch_point(fun);
        self.emit_const_value(Value::obj(fun), lambda.token.span)?;
        self.subcompile(fun, FnKind::Script, CompileUnit::Lambda(lambda.clone()))
    }

    fn map_literal(&mut self, map: &Arc<MapLiteral>) -> Result<(), SableError> {
        let qualified = lock(&self.ctx).scopes.qualified_name(map.scope);
        let mapfn = {
            let mut ctx = lock(&self.ctx);
            make_function(&mut ctx, FnKind::MapInit, 0, &qualified)
        };
        self.set_patch_point(mapfn);
        let depth_before = self.stack_pos;
        self.emit_const_value(Value::obj(mapfn), map.token.span)?;
        self.subcompile(mapfn, FnKind::MapInit, CompileUnit::Map(map.clone()))?;

        self.emit_op_at(Op::Call, map.token.span);
        self.code.emit(0);
        self.stack_pos = depth_before + 1;
        Ok(())
    }
}

enum Resolved {
    Global(usize),
    Local(usize),
    Upvalue(usize),
}

/// Walk the scaffold chain registering the capture of `name`; returns the
/// upvalue index in the innermost (last) function
fn capture(chain: &[&ScaffoldRef], name: &str) -> Option<usize> {
    let n = chain.len();
    if n < 2 {
        return None;
    }

    let slot = {
        let mut parent = lock(chain[n - 2]);
        match parent.locals.iter_mut().rev().find(|l| l.name == name) {
            Some(local) => {
                local.captured = true;
                Some(local.slot)
            }
            None => None,
        }
    };
    if let Some(slot) = slot {
        return Some(lock(chain[n - 1]).add_upvar(slot, true));
    }

    let parent_idx = capture(&chain[..n - 1], name)?;
    Some(lock(chain[n - 1]).add_upvar(parent_idx, false))
}

impl Stmt {
    /// A span to hang loop-control jumps on
    fn first_span(&self) -> Span {
        match self {
            Stmt::Print { token, .. }
            | Stmt::Return { token, .. }
            | Stmt::Break { token, .. }
            | Stmt::Continue { token, .. }
            | Stmt::Use { path: token } => token.span,
            Stmt::If { cond, .. } => cond.token().span,
            Stmt::Loop(l) => l.body.first_span(),
            Stmt::Block(_) => Span::dummy(),
            Stmt::Expr(expr) => expr.token().span,
        }
    }
}
