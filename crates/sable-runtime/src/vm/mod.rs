//! The bytecode virtual machine
//!
//! A single dispatch loop over a value stack and a call-frame stack. Calls
//! and backward branches are GC safepoints; host syscalls run inline with
//! the VM's roots parked in the context so a nested interpretation cannot
//! sweep them.

mod frame;

pub use frame::CallFrame;

use crate::bytecode::{CodeChunk, Op};
use crate::context::Context;
use crate::error::SableError;
use crate::gc;
use crate::heap::{FnKind, ObjData, ObjRef, Upvalue};
use crate::ops;
use crate::table::ValueMap;
use crate::value::Value;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Where `print` output goes
#[derive(Debug, Clone)]
pub enum OutputSink {
    /// Process stdout
    Stdout,
    /// A shared buffer, for tests and embedders
    Shared(Arc<Mutex<Vec<u8>>>),
}

impl OutputSink {
    /// Create a shared capture buffer
    pub fn shared() -> (OutputSink, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (OutputSink::Shared(buffer.clone()), buffer)
    }

    fn write_line(&self, text: &str) {
        match self {
            OutputSink::Stdout => println!("{}", text),
            OutputSink::Shared(buffer) => {
                let mut buffer = buffer.lock().unwrap_or_else(|p| p.into_inner());
                let _ = writeln!(buffer, "{}", text);
            }
        }
    }
}

/// The virtual machine
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues, sorted by descending stack position
    open_upvalues: Vec<(usize, ObjRef)>,
    output: OutputSink,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Create a VM printing to stdout
    pub fn new() -> Self {
        Self::with_output(OutputSink::Stdout)
    }

    /// Create a VM with an explicit output sink
    pub fn with_output(output: OutputSink) -> Self {
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            output,
        }
    }

    /// Invoke a callable with arguments and run to completion
    pub fn interpret(
        &mut self,
        ctx: &mut Context,
        callable: Value,
        args: &[Value],
    ) -> Result<Value, SableError> {
        let entry_depth = self.frames.len();
        self.stack.push(callable);
        self.stack.extend_from_slice(args);

        self.call_value(ctx, args.len())?;
        if self.frames.len() == entry_depth {
            // The callee was a syscall and already ran inline.
            return Ok(self.stack.pop().unwrap_or(Value::NIL));
        }

        self.run(ctx, entry_depth)
    }

    /// GC root scan: every live value this VM can still reach
    pub(crate) fn for_each_root(&self, mark: &mut dyn FnMut(Value)) {
        for &v in &self.stack {
            mark(v);
        }
        for frame in &self.frames {
            mark(Value::obj(frame.function));
            if let Some(closure) = frame.closure {
                mark(Value::obj(closure));
            }
            if let Some(receiver) = frame.receiver {
                mark(Value::obj(receiver));
            }
        }
        for &(_, upvalue) in &self.open_upvalues {
            mark(Value::obj(upvalue));
        }
    }

    // ── frame plumbing ───────────────────────────────────────────────────────

    fn frame(&self) -> &CallFrame {
        match self.frames.last() {
            Some(frame) => frame,
            None => unreachable!("dispatch loop running without a frame"),
        }
    }

    fn error_at(&self, err: SableError, op_offset: usize) -> SableError {
        err.or_span(self.frame().code.span_at(op_offset))
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::NIL)
    }

    fn peek(&self, depth: usize) -> Value {
        self.stack
            .get(self.stack.len() - 1 - depth)
            .copied()
            .unwrap_or(Value::NIL)
    }

    // ── the dispatch loop ────────────────────────────────────────────────────

    fn run(&mut self, ctx: &mut Context, entry_depth: usize) -> Result<Value, SableError> {
        let mut code: Arc<CodeChunk> = self.frame().code.clone();
        let mut ip = self.frame().ip;
        let mut base = self.frame().base;

        macro_rules! reload {
            () => {{
                code = self.frame().code.clone();
                ip = self.frame().ip;
                base = self.frame().base;
            }};
        }

        loop {
            let op_offset = ip;
            let byte = match code.bytes.get(ip) {
                Some(&byte) => byte,
                None => {
                    return Err(SableError::runtime("instruction pointer ran off the code"));
                }
            };
            ip += 1;
            let op = match Op::from_byte(byte) {
                Some(op) => op,
                None => {
                    return Err(self.error_at(
                        SableError::runtime(format!("bad opcode {:#04x}", byte)),
                        op_offset,
                    ))
                }
            };

            match op {
                Op::Skip => {}

                // ── constants ───────────────────────────────────────────────
                Op::Nil => self.stack.push(Value::NIL),
                Op::True => self.stack.push(Value::TRUE),
                Op::False => self.stack.push(Value::FALSE),
                Op::Zero => self.stack.push(Value::num(0.0)),
                Op::One => self.stack.push(Value::num(1.0)),
                Op::Two => self.stack.push(Value::num(2.0)),
                Op::Const => {
                    let idx = read_u16(&code, &mut ip);
                    let v = self
                        .constant(ctx, idx)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    self.stack.push(v);
                }

                // ── locals ──────────────────────────────────────────────────
                Op::Get => {
                    let slot = read_u16(&code, &mut ip) as usize;
                    let v = self.stack.get(base + slot).copied().ok_or_else(|| {
                        self.error_at(
                            SableError::runtime("variable read before initialization"),
                            op_offset,
                        )
                    })?;
                    self.stack.push(v);
                }
                Op::Set => {
                    let slot = read_u16(&code, &mut ip) as usize;
                    let v = self.peek(0);
                    match self.stack.get_mut(base + slot) {
                        Some(target) => *target = v,
                        None => {
                            return Err(self.error_at(
                                SableError::runtime("variable written before initialization"),
                                op_offset,
                            ))
                        }
                    }
                }
                Op::Pop => {
                    self.pop();
                }
                Op::PopN => {
                    let n = code.bytes[ip] as usize;
                    ip += 1;
                    self.stack.truncate(self.stack.len().saturating_sub(n));
                }
                Op::Close => {
                    let pos = self.stack.len().saturating_sub(1);
                    self.close_upvalues(ctx, pos);
                    self.pop();
                }

                // ── upvalues ────────────────────────────────────────────────
                Op::UpvGet => {
                    let idx = read_u16(&code, &mut ip) as usize;
                    let v = self
                        .upvalue_get(ctx, idx)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    self.stack.push(v);
                }
                Op::UpvSet => {
                    let idx = read_u16(&code, &mut ip) as usize;
                    let v = self.peek(0);
                    self.upvalue_set(ctx, idx, v)
                        .map_err(|e| self.error_at(e, op_offset))?;
                }

                // ── globals ─────────────────────────────────────────────────
                Op::Global => {
                    let idx = read_u16(&code, &mut ip) as usize;
                    self.stack.push(ctx.globals.get(idx));
                }
                Op::Store => {
                    let idx = read_u16(&code, &mut ip) as usize;
                    let v = self.peek(0);
                    ctx.globals.set(idx, v);
                }

                // ── control flow ────────────────────────────────────────────
                Op::Bra => {
                    let distance = read_u16(&code, &mut ip) as usize;
                    ip = op_offset + distance;
                }
                Op::Brz => {
                    let distance = read_u16(&code, &mut ip) as usize;
                    if self.pop().is_falsy() {
                        ip = op_offset + distance;
                    }
                }
                Op::Bnz => {
                    let distance = read_u16(&code, &mut ip) as usize;
                    if self.pop().is_truthy() {
                        ip = op_offset + distance;
                    }
                }
                Op::Loop => {
                    if ctx.heap.collect_pending {
                        self.frames_sync(ip, entry_depth);
                        gc::collect(ctx, self);
                    }
                    let distance = read_u16(&code, &mut ip) as usize;
                    ip = op_offset - distance;
                }

                // ── calls ───────────────────────────────────────────────────
                Op::Call => {
                    let nargs = code.bytes[ip] as usize;
                    ip += 1;
                    if ctx.heap.collect_pending {
                        self.frames_sync(ip, entry_depth);
                        gc::collect(ctx, self);
                    }
                    if let Some(frame) = self.frames.last_mut() {
                        frame.ip = ip;
                    }
                    self.call_value(ctx, nargs)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    reload!();
                }
                Op::TailCall => {
                    let nargs = code.bytes[ip] as usize;
                    ip += 1;
                    if ctx.heap.collect_pending {
                        self.frames_sync(ip, entry_depth);
                        gc::collect(ctx, self);
                    }
                    let callee = self.peek(nargs);
                    if callee == Value::obj(self.frame().function) {
                        // Reuse the current frame: close captures over the
                        // old locals, slide the arguments onto the local
                        // window, and restart the code.
                        self.close_upvalues(ctx, base + 1);
                        let arg_start = self.stack.len() - nargs;
                        for i in 0..nargs {
                            self.stack[base + 1 + i] = self.stack[arg_start + i];
                        }
                        self.stack.truncate(base + 1 + nargs);
                        ip = 0;
                    } else {
                        if let Some(frame) = self.frames.last_mut() {
                            frame.ip = ip;
                        }
                        self.call_value(ctx, nargs)
                            .map_err(|e| self.error_at(e, op_offset))?;
                        reload!();
                    }
                }
                Op::Ret => {
                    let result = self.pop();
                    self.close_upvalues(ctx, base);
                    self.stack.truncate(base);
                    self.stack.push(result);
                    self.frames.pop();

                    if self.frames.len() == entry_depth {
                        return Ok(self.pop());
                    }
                    reload!();
                }

                // ── closures and objects ────────────────────────────────────
                Op::Closure => {
                    let idx = read_u16(&code, &mut ip);
                    let closure = self
                        .build_closure(ctx, idx, base)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    self.stack.push(Value::obj(closure));
                }
                Op::Map => {
                    let receiver = self
                        .frame()
                        .receiver
                        .ok_or_else(|| {
                            self.error_at(
                                SableError::runtime("no receiver in this context"),
                                op_offset,
                            )
                        })?;
                    self.stack.push(Value::obj(receiver));
                }
                Op::Pair => {
                    let value = self.pop();
                    let key = self.pop();
                    let receiver = self.frame().receiver.ok_or_else(|| {
                        self.error_at(
                            SableError::runtime("no receiver in this context"),
                            op_offset,
                        )
                    })?;
                    map_insert(ctx, receiver, key, value)
                        .map_err(|e| self.error_at(e, op_offset))?;
                }
                Op::Super => {
                    let v = self.pop();
                    self.wire_super(ctx, v)
                        .map_err(|e| self.error_at(e, op_offset))?;
                }

                // ── members and subscripts ──────────────────────────────────
                Op::MbrGet => {
                    let idx = read_u16(&code, &mut ip);
                    let name = self
                        .constant(ctx, idx)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    let object = self.pop();
                    let v = member_get(ctx, object, name)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    self.stack.push(v);
                }
                Op::MbrSet => {
                    let idx = read_u16(&code, &mut ip);
                    let name = self
                        .constant(ctx, idx)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    let value = self.pop();
                    let object = self.pop();
                    member_set(ctx, object, name, value)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    self.stack.push(value);
                }
                Op::KeyGet => {
                    let key = self.pop();
                    let object = self.pop();
                    let v = key_get(ctx, object, key)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    self.stack.push(v);
                }
                Op::KeySet => {
                    let value = self.pop();
                    let key = self.pop();
                    let object = self.pop();
                    let target = object.as_obj().ok_or_else(|| {
                        self.error_at(
                            SableError::runtime(format!(
                                "cannot subscript a {}",
                                ctx.type_name(object)
                            )),
                            op_offset,
                        )
                    })?;
                    map_insert(ctx, target, key, value)
                        .map_err(|e| self.error_at(e, op_offset))?;
                    self.stack.push(value);
                }

                // ── arithmetic and logic ────────────────────────────────────
                Op::Add => self.binary(ctx, op_offset, |ctx, a, b| ops::add(ctx, a, b))?,
                Op::Sub => self.binary(ctx, op_offset, |_, a, b| ops::sub(a, b))?,
                Op::Mul => self.binary(ctx, op_offset, |_, a, b| ops::mul(a, b))?,
                Op::Div => self.binary(ctx, op_offset, |_, a, b| ops::div(a, b))?,
                Op::Neg => self.unary(op_offset, ops::neg)?,
                Op::Inc => self.unary(op_offset, ops::inc)?,
                Op::Dec => self.unary(op_offset, ops::dec)?,
                Op::Lt => self.binary(ctx, op_offset, |ctx, a, b| ops::lt(ctx, a, b))?,
                Op::LtEq => self.binary(ctx, op_offset, |ctx, a, b| ops::lteq(ctx, a, b))?,
                Op::Gt => self.binary(ctx, op_offset, |ctx, a, b| ops::gt(ctx, a, b))?,
                Op::GtEq => self.binary(ctx, op_offset, |ctx, a, b| ops::gteq(ctx, a, b))?,
                Op::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(ops::eq(a, b));
                }
                Op::NotEq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(ops::neq(a, b));
                }
                Op::Is => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(ops::is_op(ctx, a, b));
                }
                Op::And => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::bool(a.is_truthy() && b.is_truthy()));
                }
                Op::Or => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::bool(a.is_truthy() || b.is_truthy()));
                }
                Op::Xor => {
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(Value::bool(a.is_truthy() != b.is_truthy()));
                }
                Op::Print => {
                    let v = self.pop();
                    self.output.write_line(&ctx.display(v));
                }
            }
        }
    }

    /// Record the in-flight ip so a collection sees accurate frames
    fn frames_sync(&mut self, ip: usize, _entry_depth: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
    }

    fn constant(&self, ctx: &Context, idx: u16) -> Result<Value, SableError> {
        if (idx as usize) < ctx.constants.len() {
            Ok(ctx.constants.get(idx as usize))
        } else {
            Err(SableError::runtime("constant index out of range"))
        }
    }

    fn binary(
        &mut self,
        ctx: &mut Context,
        op_offset: usize,
        f: impl FnOnce(&mut Context, Value, Value) -> Result<Value, SableError>,
    ) -> Result<(), SableError> {
        let b = self.pop();
        let a = self.pop();
        let v = f(ctx, a, b).map_err(|e| self.error_at(e, op_offset))?;
        self.stack.push(v);
        Ok(())
    }

    fn unary(
        &mut self,
        op_offset: usize,
        f: impl FnOnce(Value) -> Result<Value, SableError>,
    ) -> Result<(), SableError> {
        let a = self.pop();
        let v = f(a).map_err(|e| self.error_at(e, op_offset))?;
        self.stack.push(v);
        Ok(())
    }

    // ── the call protocol ────────────────────────────────────────────────────

    /// Dispatch a call: the callee sits `nargs` slots below the top
    fn call_value(&mut self, ctx: &mut Context, nargs: usize) -> Result<(), SableError> {
        let callee_pos = self.stack.len() - 1 - nargs;
        let callee = self.stack[callee_pos];
        let Some(r) = callee.as_obj() else {
            return Err(SableError::runtime(format!(
                "a {} is not callable",
                ctx.type_name(callee)
            )));
        };

        match ctx.heap.get(r) {
            ObjData::Function(_) => self.push_frame(ctx, r, None, callee_pos),
            ObjData::Closure { function, .. } => {
                let function = *function;
                self.push_frame(ctx, function, Some(r), callee_pos)
            }
            ObjData::Syscall { f, .. } => {
                let f = f.clone();
                self.call_syscall(ctx, f, callee_pos)
            }
            ObjData::Instance { .. } => {
                Err(SableError::runtime("an instance is not callable"))
            }
            _ => Err(SableError::runtime(format!(
                "a {} is not callable",
                ctx.heap.kind_name(r)
            ))),
        }
    }

    fn push_frame(
        &mut self,
        ctx: &mut Context,
        function: ObjRef,
        closure: Option<ObjRef>,
        base: usize,
    ) -> Result<(), SableError> {
        let (kind, code_obj) = match ctx.heap.as_function(function) {
            Some(f) => (f.kind, f.code),
            None => return Err(SableError::runtime("value is not callable")),
        };
        let code_obj =
            code_obj.ok_or_else(|| SableError::runtime("function has no compiled code"))?;
        let code = match ctx.heap.get(code_obj) {
            ObjData::Code(chunk) => chunk.clone(),
            _ => return Err(SableError::runtime("function has no compiled code")),
        };

        let receiver = match kind {
            FnKind::Script => None,
            FnKind::Class => Some(ctx.heap.alloc(ObjData::Instance {
                map: ValueMap::new(),
                class: function,
                super_obj: None,
            })),
            FnKind::MapInit => Some(ctx.heap.alloc(ObjData::Map(ValueMap::new()))),
        };

        self.frames.push(CallFrame {
            function,
            closure,
            receiver,
            code,
            ip: 0,
            base,
        });
        Ok(())
    }

    /// Host calls run inline. The VM parks its roots in the context first so
    /// a nested interpretation started by the host cannot collect them.
    fn call_syscall(
        &mut self,
        ctx: &mut Context,
        f: crate::heap::Syscall,
        callee_pos: usize,
    ) -> Result<(), SableError> {
        let parked = ctx.protected.len();
        ctx.protected.extend_from_slice(&self.stack);
        for frame in &self.frames {
            ctx.protected.push(Value::obj(frame.function));
            if let Some(closure) = frame.closure {
                ctx.protected.push(Value::obj(closure));
            }
            if let Some(receiver) = frame.receiver {
                ctx.protected.push(Value::obj(receiver));
            }
        }
        for &(_, upvalue) in &self.open_upvalues {
            ctx.protected.push(Value::obj(upvalue));
        }

        let args: Vec<Value> = self.stack[callee_pos + 1..].to_vec();
        let result = f(ctx, &args);
        ctx.protected.truncate(parked);

        let result = result?;
        self.stack.truncate(callee_pos);
        self.stack.push(result);
        Ok(())
    }

    // ── upvalues ─────────────────────────────────────────────────────────────

    /// Find or create the open upvalue for an absolute stack position; the
    /// list stays sorted by descending position
    fn capture_upvalue(&mut self, ctx: &mut Context, pos: usize) -> ObjRef {
        match self
            .open_upvalues
            .binary_search_by(|&(p, _)| pos.cmp(&p))
        {
            Ok(found) => self.open_upvalues[found].1,
            Err(insert_at) => {
                let upvalue = ctx.heap.alloc(ObjData::Upvalue(Upvalue::Open { pos }));
                self.open_upvalues.insert(insert_at, (pos, upvalue));
                upvalue
            }
        }
    }

    /// Close every open upvalue at or above `from`: copy the stack value in
    /// and drop the entry. The affected entries are exactly the list prefix.
    fn close_upvalues(&mut self, ctx: &mut Context, from: usize) {
        let mut cut = 0;
        while cut < self.open_upvalues.len() && self.open_upvalues[cut].0 >= from {
            let (pos, upvalue) = self.open_upvalues[cut];
            let value = self.stack.get(pos).copied().unwrap_or(Value::NIL);
            if let ObjData::Upvalue(u) = ctx.heap.get_mut(upvalue) {
                *u = Upvalue::Closed { value };
            }
            cut += 1;
        }
        self.open_upvalues.drain(..cut);
    }

    fn current_closure_upvalue(&self, ctx: &Context, idx: usize) -> Result<ObjRef, SableError> {
        let closure = self
            .frame()
            .closure
            .ok_or_else(|| SableError::runtime("no closure in this frame"))?;
        match ctx.heap.get(closure) {
            ObjData::Closure { upvalues, .. } => upvalues
                .get(idx)
                .copied()
                .ok_or_else(|| SableError::runtime("upvalue index out of range")),
            _ => Err(SableError::runtime("no closure in this frame")),
        }
    }

    fn upvalue_get(&self, ctx: &Context, idx: usize) -> Result<Value, SableError> {
        let upvalue = self.current_closure_upvalue(ctx, idx)?;
        match ctx.heap.as_upvalue(upvalue) {
            Some(Upvalue::Open { pos }) => self
                .stack
                .get(*pos)
                .copied()
                .ok_or_else(|| SableError::runtime("upvalue is not accessible here")),
            Some(Upvalue::Closed { value }) => Ok(*value),
            None => Err(SableError::runtime("upvalue index out of range")),
        }
    }

    fn upvalue_set(&mut self, ctx: &mut Context, idx: usize, v: Value) -> Result<(), SableError> {
        let upvalue = self.current_closure_upvalue(ctx, idx)?;
        match ctx.heap.as_upvalue(upvalue) {
            Some(Upvalue::Open { pos }) => {
                let pos = *pos;
                match self.stack.get_mut(pos) {
                    Some(slot) => {
                        *slot = v;
                        Ok(())
                    }
                    None => Err(SableError::runtime("upvalue is not accessible here")),
                }
            }
            Some(Upvalue::Closed { .. }) => {
                if let ObjData::Upvalue(u) = ctx.heap.get_mut(upvalue) {
                    *u = Upvalue::Closed { value: v };
                }
                Ok(())
            }
            None => Err(SableError::runtime("upvalue index out of range")),
        }
    }

    /// `CLOSURE idx`: wrap the function constant in a closure, resolving
    /// each upvalue descriptor against the current frame; inside a class
    /// frame, `api` functions install themselves on the receiver under
    /// their short name
    fn build_closure(
        &mut self,
        ctx: &mut Context,
        idx: u16,
        base: usize,
    ) -> Result<ObjRef, SableError> {
        let fun_value = self.constant(ctx, idx)?;
        let fun = fun_value
            .as_obj()
            .filter(|&r| matches!(ctx.heap.get(r), ObjData::Function(_)))
            .ok_or_else(|| SableError::runtime("CLOSURE expects a function constant"))?;

        let descriptors = match ctx.heap.as_function(fun) {
            Some(f) => f.upvars.clone(),
            None => Vec::new(),
        };

        let mut upvalues = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            if descriptor.from_local {
                upvalues.push(self.capture_upvalue(ctx, base + descriptor.index));
            } else {
                let parent = self
                    .frame()
                    .closure
                    .ok_or_else(|| SableError::runtime("upvalue chain is broken"))?;
                match ctx.heap.get(parent) {
                    ObjData::Closure {
                        upvalues: parent_ups,
                        ..
                    } => match parent_ups.get(descriptor.index) {
                        Some(&up) => upvalues.push(up),
                        None => return Err(SableError::runtime("upvalue chain is broken")),
                    },
                    _ => return Err(SableError::runtime("upvalue chain is broken")),
                }
            }
        }

        let closure = ctx.heap.alloc(ObjData::Closure {
            function: fun,
            upvalues,
        });

        // Method installation: api functions built inside a class frame land
        // in the receiver map keyed by their short name.
        let in_class_frame = ctx
            .heap
            .as_function(self.frame().function)
            .map(|f| f.kind == FnKind::Class)
            .unwrap_or(false);
        if in_class_frame {
            let (is_api, short_name) = match ctx.heap.as_function(fun) {
                Some(f) => (f.is_api, f.short_name),
                None => (false, fun),
            };
            if is_api {
                if let Some(receiver) = self.frame().receiver {
                    map_insert(ctx, receiver, Value::obj(short_name), Value::obj(closure))?;
                }
            }
        }

        Ok(closure)
    }

    fn wire_super(&mut self, ctx: &mut Context, v: Value) -> Result<(), SableError> {
        let instance = v
            .as_obj()
            .filter(|&r| matches!(ctx.heap.get(r), ObjData::Instance { .. }))
            .ok_or_else(|| SableError::runtime("after ':' expected an object instance"))?;
        let receiver = self
            .frame()
            .receiver
            .ok_or_else(|| SableError::runtime("no receiver in this context"))?;
        match ctx.heap.get_mut(receiver) {
            ObjData::Instance { super_obj, .. } => {
                *super_obj = Some(instance);
                Ok(())
            }
            _ => Err(SableError::runtime("no receiver in this context")),
        }
    }
}

fn read_u16(code: &CodeChunk, ip: &mut usize) -> u16 {
    let v = crate::bytecode::read_u16(&code.bytes, *ip);
    *ip += 2;
    v
}

/// Insert into a map-like object's table (maps, instances, receivers)
fn map_insert(
    ctx: &mut Context,
    target: ObjRef,
    key: Value,
    value: Value,
) -> Result<(), SableError> {
    let mut map = match ctx.heap.get_mut(target) {
        ObjData::Map(m) => std::mem::take(m),
        ObjData::Instance { map, .. } => std::mem::take(map),
        _ => {
            return Err(SableError::runtime(format!(
                "cannot subscript a {}",
                ctx.heap.kind_name(target)
            )))
        }
    };
    map.add(&ctx.heap, key, value);
    match ctx.heap.get_mut(target) {
        ObjData::Map(m) => *m = map,
        ObjData::Instance { map: m, .. } => *m = map,
        _ => {}
    }
    Ok(())
}

/// `MBRGET`: own map first, then the super chain; absent members are nil
fn member_get(ctx: &Context, object: Value, name: Value) -> Result<Value, SableError> {
    let Some(r) = object.as_obj() else {
        return Err(SableError::runtime(format!(
            "member access on a {}",
            ctx.type_name(object)
        )));
    };
    match ctx.heap.get(r) {
        ObjData::Map(map) => Ok(map.get(&ctx.heap, name).unwrap_or(Value::NIL)),
        ObjData::Instance { .. } => {
            let mut cursor = Some(r);
            while let Some(at) = cursor {
                match ctx.heap.get(at) {
                    ObjData::Instance { map, super_obj, .. } => {
                        if let Some(v) = map.get(&ctx.heap, name) {
                            return Ok(v);
                        }
                        cursor = *super_obj;
                    }
                    _ => break,
                }
            }
            Ok(Value::NIL)
        }
        _ => Err(SableError::runtime(format!(
            "member access on a {}",
            ctx.heap.kind_name(r)
        ))),
    }
}

/// `MBRSET`: write through to whichever object on the chain owns the key,
/// falling back to the object's own map
fn member_set(
    ctx: &mut Context,
    object: Value,
    name: Value,
    value: Value,
) -> Result<(), SableError> {
    let Some(r) = object.as_obj() else {
        return Err(SableError::runtime(format!(
            "member access on a {}",
            ctx.type_name(object)
        )));
    };
    match ctx.heap.get(r) {
        ObjData::Map(_) => map_insert(ctx, r, name, value),
        ObjData::Instance { .. } => {
            let mut owner = None;
            let mut cursor = Some(r);
            while let Some(at) = cursor {
                match ctx.heap.get(at) {
                    ObjData::Instance { map, super_obj, .. } => {
                        if map.contains(&ctx.heap, name) {
                            owner = Some(at);
                            break;
                        }
                        cursor = *super_obj;
                    }
                    _ => break,
                }
            }
            map_insert(ctx, owner.unwrap_or(r), name, value)
        }
        _ => Err(SableError::runtime(format!(
            "member access on a {}",
            ctx.heap.kind_name(r)
        ))),
    }
}

/// `KEYGET`: maps and instances index their own table; missing keys are nil
fn key_get(ctx: &Context, object: Value, key: Value) -> Result<Value, SableError> {
    let Some(r) = object.as_obj() else {
        return Err(SableError::runtime(format!(
            "cannot subscript a {}",
            ctx.type_name(object)
        )));
    };
    match ctx.heap.get(r) {
        ObjData::Map(map) => Ok(map.get(&ctx.heap, key).unwrap_or(Value::NIL)),
        ObjData::Instance { map, .. } => Ok(map.get(&ctx.heap, key).unwrap_or(Value::NIL)),
        _ => Err(SableError::runtime(format!(
            "cannot subscript a {}",
            ctx.heap.kind_name(r)
        ))),
    }
}
