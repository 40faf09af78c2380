//! Operator semantics over values
//!
//! Numeric fast paths with object fallbacks (string concatenation, string
//! ordering, class-membership `is`). The VM and the constant-folding pass
//! both evaluate operators through these helpers, which keeps compile-time
//! folding observationally identical to runtime evaluation.

use crate::context::Context;
use crate::error::SableError;
use crate::heap::ObjData;
use crate::value::Value;

fn invalid_operands() -> SableError {
    SableError::runtime("invalid operands")
}

fn invalid_operand() -> SableError {
    SableError::runtime("invalid operand")
}

fn is_string(ctx: &Context, v: Value) -> bool {
    v.as_obj()
        .is_some_and(|r| matches!(ctx.heap.get(r), ObjData::Str { .. }))
}

/// `+` — numeric addition, or concatenation when either side is a string
pub fn add(ctx: &mut Context, a: Value, b: Value) -> Result<Value, SableError> {
    if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
        return Ok(Value::num(x + y));
    }
    if is_string(ctx, a) || is_string(ctx, b) {
        let text = format!("{}{}", ctx.display(a), ctx.display(b));
        return Ok(ctx.intern_value(&text));
    }
    Err(invalid_operands())
}

/// `-`
pub fn sub(a: Value, b: Value) -> Result<Value, SableError> {
    match (a.as_num(), b.as_num()) {
        (Some(x), Some(y)) => Ok(Value::num(x - y)),
        _ => Err(invalid_operands()),
    }
}

/// `*`
pub fn mul(a: Value, b: Value) -> Result<Value, SableError> {
    match (a.as_num(), b.as_num()) {
        (Some(x), Some(y)) => Ok(Value::num(x * y)),
        _ => Err(invalid_operands()),
    }
}

/// `/` — IEEE semantics; dividing by zero yields an infinity or NaN
pub fn div(a: Value, b: Value) -> Result<Value, SableError> {
    match (a.as_num(), b.as_num()) {
        (Some(x), Some(y)) => Ok(Value::num(x / y)),
        _ => Err(invalid_operands()),
    }
}

/// Unary `-`
pub fn neg(a: Value) -> Result<Value, SableError> {
    match a.as_num() {
        Some(x) => Ok(Value::num(-x)),
        None => Err(invalid_operand()),
    }
}

/// `INC`
pub fn inc(a: Value) -> Result<Value, SableError> {
    match a.as_num() {
        Some(x) => Ok(Value::num(x + 1.0)),
        None => Err(invalid_operand()),
    }
}

/// `DEC`
pub fn dec(a: Value) -> Result<Value, SableError> {
    match a.as_num() {
        Some(x) => Ok(Value::num(x - 1.0)),
        None => Err(invalid_operand()),
    }
}

fn string_pair<'a>(ctx: &'a Context, a: Value, b: Value) -> Option<(&'a str, &'a str)> {
    let a = ctx.heap.as_str(a.as_obj()?)?;
    let b = ctx.heap.as_str(b.as_obj()?)?;
    Some((a, b))
}

macro_rules! ordering_op {
    ( $(#[$doc:meta])* $name:ident, $op:tt ) => {
        $(#[$doc])*
        pub fn $name(ctx: &Context, a: Value, b: Value) -> Result<Value, SableError> {
            if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
                return Ok(Value::bool(x $op y));
            }
            if let Some((x, y)) = string_pair(ctx, a, b) {
                return Ok(Value::bool(x $op y));
            }
            Err(invalid_operands())
        }
    };
}

ordering_op!(
    /// `<`
    lt, <
);
ordering_op!(
    /// `<=`
    lteq, <=
);
ordering_op!(
    /// `>`
    gt, >
);
ordering_op!(
    /// `>=`
    gteq, >=
);

/// `==` — numeric comparison for numbers (IEEE under the `strict-ieee`
/// feature, bitwise otherwise); everything else compares identity. Interned
/// strings make text equality and identity coincide.
pub fn eq(a: Value, b: Value) -> Value {
    #[cfg(feature = "strict-ieee")]
    if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
        return Value::bool(x == y);
    }
    Value::bool(a == b)
}

/// `!=`
pub fn neq(a: Value, b: Value) -> Value {
    Value::bool(eq(a, b) == Value::FALSE)
}

/// `is` — bit identity for primitives and objects, except that an instance
/// `is` a class when the class appears on its class/super chain
pub fn is_op(ctx: &Context, a: Value, b: Value) -> Value {
    if let (Some(inst), Some(class)) = (a.as_obj(), b.as_obj()) {
        if matches!(ctx.heap.get(class), ObjData::Function(f) if f.kind == crate::heap::FnKind::Class)
        {
            let mut cursor = Some(inst);
            while let Some(r) = cursor {
                match ctx.heap.get(r) {
                    ObjData::Instance {
                        class: c,
                        super_obj,
                        ..
                    } => {
                        if *c == class {
                            return Value::TRUE;
                        }
                        cursor = *super_obj;
                    }
                    _ => break,
                }
            }
        }
    }
    Value::bool(a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{FnKind, Function};
    use crate::table::ValueMap;

    #[test]
    fn test_numeric_ops() {
        let mut ctx = Context::new();
        assert_eq!(
            add(&mut ctx, Value::num(1.0), Value::num(2.0)).unwrap(),
            Value::num(3.0)
        );
        assert_eq!(sub(Value::num(5.0), Value::num(2.0)).unwrap(), Value::num(3.0));
        assert_eq!(mul(Value::num(4.0), Value::num(2.5)).unwrap(), Value::num(10.0));
        assert_eq!(neg(Value::num(2.0)).unwrap(), Value::num(-2.0));
        assert_eq!(inc(Value::num(2.0)).unwrap(), Value::num(3.0));
        assert_eq!(dec(Value::num(2.0)).unwrap(), Value::num(1.0));
    }

    #[test]
    fn test_division_follows_ieee() {
        let v = div(Value::num(1.0), Value::num(0.0)).unwrap();
        assert_eq!(v.as_num(), Some(f64::INFINITY));
    }

    #[test]
    fn test_string_concat_interns() {
        let mut ctx = Context::new();
        let a = ctx.intern_value("foo");
        let joined = add(&mut ctx, a, Value::num(7.0)).unwrap();
        let again = ctx.intern_value("foo7");
        assert_eq!(joined, again);
    }

    #[test]
    fn test_invalid_operands_error() {
        let mut ctx = Context::new();
        assert!(add(&mut ctx, Value::NIL, Value::num(1.0)).is_err());
        assert!(sub(Value::TRUE, Value::num(1.0)).is_err());
        assert!(neg(Value::NIL).is_err());
    }

    #[test]
    fn test_string_ordering() {
        let mut ctx = Context::new();
        let a = ctx.intern_value("apple");
        let b = ctx.intern_value("banana");
        assert_eq!(lt(&ctx, a, b).unwrap(), Value::TRUE);
        assert_eq!(gteq(&ctx, b, a).unwrap(), Value::TRUE);
    }

    #[test]
    fn test_interned_equality_is_identity() {
        let mut ctx = Context::new();
        let a = ctx.intern_value("same");
        let b = ctx.intern_value("same");
        assert_eq!(eq(a, b), Value::TRUE);
    }

    #[cfg(feature = "strict-ieee")]
    #[test]
    fn test_nan_not_equal_to_itself() {
        let nan = Value::num(f64::NAN);
        assert_eq!(eq(nan, nan), Value::FALSE);
        assert_eq!(neq(nan, nan), Value::TRUE);
    }

    #[test]
    fn test_is_walks_super_chain() {
        let mut ctx = Context::new();
        let name = ctx.intern("::A");
        let class_a = ctx.heap.alloc(ObjData::Function(Function {
            kind: FnKind::Class,
            arity: 0,
            name,
            short_name: name,
            code: None,
            locals: Vec::new(),
            upvars: Vec::new(),
            patch_point: None,
            is_api: false,
        }));
        let name_b = ctx.intern("::B");
        let class_b = ctx.heap.alloc(ObjData::Function(Function {
            kind: FnKind::Class,
            arity: 0,
            name: name_b,
            short_name: name_b,
            code: None,
            locals: Vec::new(),
            upvars: Vec::new(),
            patch_point: None,
            is_api: false,
        }));
        let parent = ctx.heap.alloc(ObjData::Instance {
            map: ValueMap::new(),
            class: class_a,
            super_obj: None,
        });
        let child = ctx.heap.alloc(ObjData::Instance {
            map: ValueMap::new(),
            class: class_b,
            super_obj: Some(parent),
        });
        assert_eq!(is_op(&ctx, Value::obj(child), Value::obj(class_b)), Value::TRUE);
        assert_eq!(is_op(&ctx, Value::obj(child), Value::obj(class_a)), Value::TRUE);
        assert_eq!(is_op(&ctx, Value::obj(parent), Value::obj(class_b)), Value::FALSE);
    }
}
