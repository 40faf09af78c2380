//! The interpreter context
//!
//! One value that owns every table the pipeline shares: the object heap, the
//! string interner, the globals and constants tables, and the scope tree.
//! The compiler threads it behind a mutex while sub-compilers may run on
//! workers; the VM owns it directly.

use crate::globals::{Constants, Globals};
use crate::heap::{FnKind, Heap, ObjData, ObjRef};
use crate::interner::Interner;
use crate::scope::ScopeTree;
use crate::value::{Decoded, Value};

/// Pipeline configuration
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Run the peephole optimizer after lowering
    pub optimize: bool,
    /// Dispatch sub-function compilation to worker threads
    pub threaded_compile: bool,
    /// Print each compiled function's disassembly to stderr
    pub dump_bytecode: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            optimize: true,
            threaded_compile: false,
            dump_bytecode: false,
        }
    }
}

/// Shared interpreter state
#[derive(Debug, Default)]
pub struct Context {
    /// The object heap
    pub heap: Heap,
    /// The string interner
    pub strings: Interner,
    /// The globals table
    pub globals: Globals,
    /// The constants table
    pub constants: Constants,
    /// The lexical scope tree
    pub scopes: ScopeTree,
    /// Extra GC roots: values the host or a suspended VM needs kept alive
    pub protected: Vec<Value>,
}

impl Context {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning its object reference
    pub fn intern(&mut self, text: &str) -> ObjRef {
        self.strings.intern(&mut self.heap, text)
    }

    /// Intern a string, returning it as a value
    pub fn intern_value(&mut self, text: &str) -> Value {
        Value::obj(self.intern(text))
    }

    /// A short noun for diagnostics
    pub fn type_name(&self, v: Value) -> &'static str {
        match v.decode() {
            Decoded::Num(_) => "number",
            Decoded::Bool(_) => "boolean",
            Decoded::Nil => "nil",
            Decoded::Obj(r) => self.heap.kind_name(r),
        }
    }

    /// Render a value the way `print` and `str` do
    pub fn display(&self, v: Value) -> String {
        match v.decode() {
            Decoded::Num(n) => format_number(n),
            Decoded::Bool(true) => "true".to_string(),
            Decoded::Bool(false) => "false".to_string(),
            Decoded::Nil => "nil".to_string(),
            Decoded::Obj(r) => self.display_obj(r),
        }
    }

    fn display_obj(&self, r: ObjRef) -> String {
        match self.heap.get(r) {
            ObjData::Str { text, .. } => text.clone(),
            ObjData::Code(_) => "<code>".to_string(),
            ObjData::Function(f) => {
                let name = self.heap.as_str(f.name).unwrap_or("?");
                match f.kind {
                    FnKind::Script => format!("<fun {}>", name),
                    FnKind::Class | FnKind::MapInit => format!("<obj {}>", name),
                }
            }
            ObjData::Closure { function, .. } => self.display_obj(*function),
            ObjData::Map(_) => "<map>".to_string(),
            ObjData::Instance { class, .. } => self.display_obj(*class),
            ObjData::Upvalue(_) => "<upvalue>".to_string(),
            ObjData::Syscall { name, .. } => {
                format!("<syscall {}>", self.heap.as_str(*name).unwrap_or("?"))
            }
            ObjData::Boxed(_) => "<box>".to_string(),
        }
    }
}

/// Whole numbers print without a fractional part
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::INFINITY), "inf");
    }

    #[test]
    fn test_display_primitives() {
        let ctx = Context::new();
        assert_eq!(ctx.display(Value::num(7.0)), "7");
        assert_eq!(ctx.display(Value::TRUE), "true");
        assert_eq!(ctx.display(Value::NIL), "nil");
    }

    #[test]
    fn test_display_string_is_raw_text() {
        let mut ctx = Context::new();
        let s = ctx.intern_value("done");
        assert_eq!(ctx.display(s), "done");
    }
}
