//! The embedder façade
//!
//! One value owning the interpreter context and pipeline options. The
//! one-shot pipeline is `interpret`: read file → lex → parse → compile →
//! run on a fresh VM.

use crate::compiler;
use crate::context::{Context, Options};
use crate::diagnostic::SourceFile;
use crate::error::SableError;
use crate::ffi;
use crate::heap::ObjRef;
use crate::inbuilt;
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::value::Value;
use crate::vm::{OutputSink, Vm};
use std::any::Any;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The interpreter
pub struct Sable {
    ctx: Context,
    /// Pipeline configuration
    pub options: Options,
    output: OutputSink,
}

impl Default for Sable {
    fn default() -> Self {
        Self::new()
    }
}

impl Sable {
    /// Create an interpreter with the inbuilts registered
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    /// Create an interpreter with explicit options
    pub fn with_options(options: Options) -> Self {
        let mut ctx = Context::new();
        inbuilt::register(&mut ctx);
        Self {
            ctx,
            options,
            output: OutputSink::Stdout,
        }
    }

    /// Redirect script output into a shared buffer and return it
    pub fn capture_output(&mut self) -> Arc<Mutex<Vec<u8>>> {
        let (sink, buffer) = OutputSink::shared();
        self.output = sink;
        buffer
    }

    /// Compile and run a source file
    pub fn interpret(&mut self, path: impl AsRef<Path>) -> Result<Value, SableError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SableError::Io(format!("{}: {}", path.display(), e)))?;
        self.eval(&path.display().to_string(), &text)
    }

    /// Compile and run source text
    pub fn eval(&mut self, name: &str, text: &str) -> Result<Value, SableError> {
        let source = SourceFile::new(name, text);
        let script = self.compile(&source)?;
        self.run(script)
    }

    /// The frontend and compiler half of the pipeline
    pub fn compile(&mut self, source: &SourceFile) -> Result<ObjRef, SableError> {
        let tokens = Lexer::new(&source.text).tokenize()?;
        let script = {
            let Context {
                scopes, globals, ..
            } = &mut self.ctx;
            Parser::new(tokens, scopes, globals).parse_script()?
        };

        // Sub-compilation may fan out to workers; the context moves behind a
        // mutex for the duration and comes back out once they are joined.
        let shared = Arc::new(Mutex::new(std::mem::take(&mut self.ctx)));
        let compiled = compiler::compile(&shared, Arc::new(script), self.options);
        self.ctx = match Arc::try_unwrap(shared) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(|p| p.into_inner()),
            Err(_) => {
                return Err(SableError::runtime(
                    "compiler workers still hold the context",
                ))
            }
        };
        compiled
    }

    /// Run a compiled script function on a fresh VM
    pub fn run(&mut self, script: ObjRef) -> Result<Value, SableError> {
        let mut vm = Vm::with_output(self.output.clone());
        vm.interpret(&mut self.ctx, Value::obj(script), &[])
    }

    /// Borrow the underlying context (tests, tooling)
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Mutably borrow the underlying context
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    // ── host-facing FFI ──────────────────────────────────────────────────────

    /// Register a host callable under a `::a::b::c` name
    pub fn bind(
        &mut self,
        name: &str,
        f: impl Fn(&mut Context, &[Value]) -> Result<Value, SableError> + Send + Sync + 'static,
    ) -> Value {
        ffi::bind(&mut self.ctx, name, f)
    }

    /// Look up a global by fully qualified name
    pub fn find(&self, name: &str) -> Value {
        ffi::find(&self.ctx, name)
    }

    /// Invoke a script-visible callable on a fresh VM
    pub fn call(&mut self, callable: Value, args: &[Value]) -> Result<Value, SableError> {
        ffi::call(&mut self.ctx, callable, args)
    }

    /// Invoke a global by fully qualified name
    pub fn call_named(&mut self, name: &str, args: &[Value]) -> Result<Value, SableError> {
        ffi::call_named(&mut self.ctx, name, args)
    }

    /// Wrap an opaque host pointer
    pub fn boxed(&mut self, contents: Arc<dyn Any + Send + Sync>) -> Value {
        ffi::boxed(&mut self.ctx, contents)
    }

    /// Recover an opaque host pointer
    pub fn unbox(&self, v: Value) -> Result<Arc<dyn Any + Send + Sync>, SableError> {
        ffi::unbox(&self.ctx, v)
    }

    /// Render a value the way `print` does
    pub fn display(&self, v: Value) -> String {
        self.ctx.display(v)
    }
}
