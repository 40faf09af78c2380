//! Inbuilt functions
//!
//! Registered in the global scope before any script parses, so every
//! compilation resolves them like ordinary globals: `ver`, `dup`, `str`,
//! `len`, `gc`, `sleep`.

use crate::context::Context;
use crate::error::SableError;
use crate::ffi;
use crate::heap::{ObjData, ObjRef};
use crate::value::Value;

/// Crate version reported by `ver()`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Register every inbuilt
pub fn register(ctx: &mut Context) {
    ffi::bind(ctx, "::ver", ver);
    ffi::bind(ctx, "::dup", dup);
    ffi::bind(ctx, "::str", str_fn);
    ffi::bind(ctx, "::len", len);
    ffi::bind(ctx, "::gc", gc);
    ffi::bind(ctx, "::sleep", sleep);
}

fn arity(args: &[Value], expected: usize) -> Result<(), SableError> {
    if args.len() == expected {
        return Ok(());
    }
    Err(SableError::runtime(match expected {
        0 => "expected no arguments".to_string(),
        1 => "expected a single argument".to_string(),
        n => format!("expected {} arguments", n),
    }))
}

fn ver(ctx: &mut Context, args: &[Value]) -> Result<Value, SableError> {
    arity(args, 0)?;
    Ok(ctx.intern_value(VERSION))
}

/// Clone a value. Maps and instances copy their tables (values cloned
/// recursively, interned keys shared); immutable objects return themselves.
fn dup(ctx: &mut Context, args: &[Value]) -> Result<Value, SableError> {
    arity(args, 1)?;
    Ok(dup_value(ctx, args[0]))
}

fn dup_value(ctx: &mut Context, v: Value) -> Value {
    let Some(r) = v.as_obj() else {
        return v;
    };
    match ctx.heap.get(r) {
        ObjData::Map(map) => {
            let entries = collect_entries(map);
            let copy = ctx.heap.alloc(ObjData::Map(crate::table::ValueMap::new()));
            copy_entries(ctx, copy, entries);
            Value::obj(copy)
        }
        ObjData::Instance {
            map,
            class,
            super_obj,
        } => {
            let class = *class;
            let super_obj = *super_obj;
            let entries = collect_entries(map);
            let super_copy = super_obj.map(|s| {
                match dup_value(ctx, Value::obj(s)).as_obj() {
                    Some(copy) => copy,
                    None => s,
                }
            });
            let copy = ctx.heap.alloc(ObjData::Instance {
                map: crate::table::ValueMap::new(),
                class,
                super_obj: super_copy,
            });
            copy_entries(ctx, copy, entries);
            Value::obj(copy)
        }
        ObjData::Boxed(contents) => {
            let contents = contents.clone();
            Value::obj(ctx.heap.alloc(ObjData::Boxed(contents)))
        }
        // Strings are interned and functions are immutable; share them.
        _ => v,
    }
}

fn collect_entries(map: &crate::table::ValueMap) -> Vec<(Value, Value)> {
    let mut entries = Vec::with_capacity(map.len());
    map.for_each(|k, v| entries.push((k, v)));
    entries
}

fn copy_entries(ctx: &mut Context, target: ObjRef, entries: Vec<(Value, Value)>) {
    for (k, v) in entries {
        let v = dup_value(ctx, v);
        let mut map = match ctx.heap.get_mut(target) {
            ObjData::Map(m) => std::mem::take(m),
            ObjData::Instance { map, .. } => std::mem::take(map),
            _ => return,
        };
        map.add(&ctx.heap, k, v);
        match ctx.heap.get_mut(target) {
            ObjData::Map(m) => *m = map,
            ObjData::Instance { map: m, .. } => *m = map,
            _ => {}
        }
    }
}

fn str_fn(ctx: &mut Context, args: &[Value]) -> Result<Value, SableError> {
    arity(args, 1)?;
    let text = ctx.display(args[0]);
    Ok(ctx.intern_value(&text))
}

fn len(ctx: &mut Context, args: &[Value]) -> Result<Value, SableError> {
    arity(args, 1)?;
    let Some(r) = args[0].as_obj() else {
        return Err(SableError::runtime("value has no concept of length"));
    };
    match ctx.heap.get(r) {
        ObjData::Str { text, .. } => Ok(Value::num(text.chars().count() as f64)),
        ObjData::Map(map) => Ok(Value::num(map.len() as f64)),
        ObjData::Instance { map, .. } => Ok(Value::num(map.len() as f64)),
        _ => Err(SableError::runtime("value has no concept of length")),
    }
}

/// Request a collection; it runs at the VM's next safepoint
fn gc(ctx: &mut Context, args: &[Value]) -> Result<Value, SableError> {
    arity(args, 0)?;
    ctx.heap.collect_pending = true;
    Ok(Value::NIL)
}

fn sleep(_ctx: &mut Context, args: &[Value]) -> Result<Value, SableError> {
    arity(args, 1)?;
    let Some(secs) = args[0].as_num() else {
        return Err(SableError::runtime(
            "sleep function expects a value in seconds",
        ));
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(SableError::runtime(
            "sleep function expects a value in seconds",
        ));
    }
    std::thread::sleep(std::time::Duration::from_secs_f64(secs));
    Ok(Value::TRUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi;

    fn ctx() -> Context {
        let mut ctx = Context::new();
        register(&mut ctx);
        ctx
    }

    #[test]
    fn test_ver_returns_version_string() {
        let mut ctx = ctx();
        let ver_fn = ffi::find(&ctx, "::ver");
        let v = ffi::call(&mut ctx, ver_fn, &[]).unwrap();
        let r = v.as_obj().unwrap();
        assert_eq!(ctx.heap.as_str(r), Some(VERSION));
    }

    #[test]
    fn test_len_of_string_counts_chars() {
        let mut ctx = ctx();
        let s = ctx.intern_value("héllo");
        let len_fn = ffi::find(&ctx, "::len");
        let v = ffi::call(&mut ctx, len_fn, &[s]).unwrap();
        assert_eq!(v, Value::num(5.0));
    }

    #[test]
    fn test_len_of_number_errors() {
        let mut ctx = ctx();
        let len_fn = ffi::find(&ctx, "::len");
        assert!(ffi::call(&mut ctx, len_fn, &[Value::num(1.0)]).is_err());
    }

    #[test]
    fn test_dup_copies_maps_independently() {
        let mut ctx = ctx();
        let original = ctx.heap.alloc(ObjData::Map(crate::table::ValueMap::new()));
        let key = ctx.intern_value("k");
        {
            let mut map = match ctx.heap.get_mut(original) {
                ObjData::Map(m) => std::mem::take(m),
                _ => unreachable!(),
            };
            map.add(&ctx.heap, key, Value::num(1.0));
            if let ObjData::Map(m) = ctx.heap.get_mut(original) {
                *m = map;
            }
        }

        let dup_fn = ffi::find(&ctx, "::dup");
        let copy = ffi::call(&mut ctx, dup_fn, &[Value::obj(original)]).unwrap();
        let copy_ref = copy.as_obj().unwrap();
        assert_ne!(copy_ref, original);
        match ctx.heap.get(copy_ref) {
            ObjData::Map(m) => assert_eq!(m.get(&ctx.heap, key), Some(Value::num(1.0))),
            _ => panic!("expected a map copy"),
        }
    }

    #[test]
    fn test_gc_requests_collection() {
        let mut ctx = ctx();
        ctx.heap.collect_pending = false;
        let gc_fn = ffi::find(&ctx, "::gc");
        ffi::call(&mut ctx, gc_fn, &[]).unwrap();
        assert!(ctx.heap.collect_pending);
    }

    #[test]
    fn test_arity_checks() {
        let mut ctx = ctx();
        let str_fn = ffi::find(&ctx, "::str");
        assert!(ffi::call(&mut ctx, str_fn, &[]).is_err());
        let ver_fn = ffi::find(&ctx, "::ver");
        assert!(ffi::call(&mut ctx, ver_fn, &[Value::NIL]).is_err());
    }
}
