//! Foreign-function interface
//!
//! Host-implemented callables enter the globals table (and the scope tree,
//! so scripts can name them) before compilation; scripts call them through
//! the ordinary call protocol. The opaque box lets the host thread its own
//! state through script values.

use crate::context::Context;
use crate::error::SableError;
use crate::heap::{ObjData, Syscall};
use crate::value::Value;
use crate::vm::Vm;
use std::any::Any;
use std::sync::Arc;

/// Register a host callable under a fully qualified `::a::b::c` name.
/// Returns the syscall value that now occupies the global slot.
pub fn bind(
    ctx: &mut Context,
    name: &str,
    f: impl Fn(&mut Context, &[Value]) -> Result<Value, SableError> + Send + Sync + 'static,
) -> Value {
    let scope = {
        // Split off a mutable borrow of the tables the scope tree feeds.
        let Context {
            scopes, globals, ..
        } = ctx;
        scopes.declare_path(name, globals)
    };
    let qualified = ctx.scopes.qualified_name(scope);

    let name_obj = ctx.intern(&qualified);
    let syscall = ctx.heap.alloc(ObjData::Syscall {
        name: name_obj,
        f: Arc::new(f) as Syscall,
    });

    let idx = ctx
        .globals
        .index_of(&qualified)
        .unwrap_or_else(|| ctx.globals.add(&qualified));
    ctx.globals.set(idx, Value::obj(syscall));
    Value::obj(syscall)
}

/// Look up a global by fully qualified name; absent names are nil
pub fn find(ctx: &Context, name: &str) -> Value {
    match ctx.globals.index_of(name) {
        Some(idx) => ctx.globals.get(idx),
        None => Value::NIL,
    }
}

/// Invoke a script-visible callable from the host on a fresh VM
pub fn call(ctx: &mut Context, callable: Value, args: &[Value]) -> Result<Value, SableError> {
    let Some(r) = callable.as_obj() else {
        return Err(SableError::runtime("value is not callable"));
    };
    match ctx.heap.get(r) {
        ObjData::Function(_)
        | ObjData::Closure { .. }
        | ObjData::Syscall { .. }
        | ObjData::Instance { .. } => {}
        _ => return Err(SableError::runtime("value is not callable")),
    }

    Vm::new().interpret(ctx, callable, args)
}

/// Invoke a global by fully qualified name
pub fn call_named(ctx: &mut Context, name: &str, args: &[Value]) -> Result<Value, SableError> {
    let callable = find(ctx, name);
    call(ctx, callable, args)
}

/// Wrap an opaque host pointer in a box value
pub fn boxed(ctx: &mut Context, contents: Arc<dyn Any + Send + Sync>) -> Value {
    Value::obj(ctx.heap.alloc(ObjData::Boxed(contents)))
}

/// Recover the host pointer from a box value
pub fn unbox(ctx: &Context, v: Value) -> Result<Arc<dyn Any + Send + Sync>, SableError> {
    let contents = v.as_obj().and_then(|r| match ctx.heap.get(r) {
        ObjData::Boxed(contents) => Some(contents.clone()),
        _ => None,
    });
    contents.ok_or_else(|| SableError::runtime("cannot unbox a value that is not a box"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_find_roundtrip() {
        let mut ctx = Context::new();
        let bound = bind(&mut ctx, "::host::answer", |_, _| Ok(Value::num(42.0)));
        assert_eq!(find(&ctx, "::host::answer"), bound);
        assert!(find(&ctx, "::host::missing").is_nil());
    }

    #[test]
    fn test_call_syscall_from_host() {
        let mut ctx = Context::new();
        let bound = bind(&mut ctx, "::host::sum", |_, args| {
            let mut total = 0.0;
            for a in args {
                total += a.as_num().unwrap_or(0.0);
            }
            Ok(Value::num(total))
        });
        let result = call(
            &mut ctx,
            bound,
            &[Value::num(1.0), Value::num(2.0), Value::num(3.0)],
        )
        .unwrap();
        assert_eq!(result, Value::num(6.0));
    }

    #[test]
    fn test_host_errors_propagate() {
        let mut ctx = Context::new();
        let bound = bind(&mut ctx, "::host::fail", |_, _| {
            Err(SableError::runtime("host exploded"))
        });
        let err = call(&mut ctx, bound, &[]).unwrap_err();
        assert!(err.to_string().contains("host exploded"));
    }

    #[test]
    fn test_box_roundtrip() {
        let mut ctx = Context::new();
        let contents: Arc<dyn Any + Send + Sync> = Arc::new(7usize);
        let boxed_value = boxed(&mut ctx, contents);
        let back = unbox(&ctx, boxed_value).unwrap();
        assert_eq!(back.downcast_ref::<usize>(), Some(&7));
    }

    #[test]
    fn test_unbox_non_box_errors() {
        let ctx = Context::new();
        assert!(unbox(&ctx, Value::num(1.0)).is_err());
        assert!(unbox(&ctx, Value::NIL).is_err());
    }

    #[test]
    fn test_scope_registration_makes_name_resolvable() {
        let mut ctx = Context::new();
        bind(&mut ctx, "::host::clock", |_, _| Ok(Value::num(0.0)));
        let root = ctx.scopes.root();
        assert!(ctx.scopes.resolve("host::clock", root).is_some());
        assert!(ctx.scopes.resolve("::host::clock", root).is_some());
    }
}
