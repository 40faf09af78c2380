//! Self tail-call detection
//!
//! At `CALL n; RET`, walk backward over the argument producers to the
//! instruction that pushed the callee. If it is a `GLOBAL` load whose slot
//! holds the function being compiled, the call is direct self-recursion and
//! becomes `TAILCALL`, which reuses the current frame.

use super::{find_pattern, instruction_offsets};
use crate::bytecode::{read_u16, CodeBuf, Op};
use crate::context::Context;
use crate::heap::ObjRef;
use crate::value::Value;
use std::sync::{Arc, Mutex};

/// Run the pass
pub fn run(code: &mut CodeBuf, ctx: &Arc<Mutex<Context>>, fun: ObjRef) {
    let mut from = 0;
    while let Some((matched, next)) = find_pattern(&code.bytes, &[Op::Call, Op::Ret], from) {
        let call = matched[0];
        if let Some(global_idx) = self_callee_slot(&code.bytes, call) {
            let is_self = {
                let ctx = ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                global_idx < ctx.globals.len()
                    && ctx.globals.get(global_idx) == Value::obj(fun)
            };
            if is_self {
                code.bytes[call] = Op::TailCall as u8;
            }
        }
        from = next;
    }
}

/// Net stack effect of one instruction for the backward walk; `None` means
/// the walk cannot see past it
fn net_effect(bytes: &[u8], off: usize) -> Option<i32> {
    match Op::from_byte(bytes[off])? {
        Op::Bra | Op::Brz | Op::Bnz | Op::Loop | Op::Ret => None,
        Op::Call | Op::TailCall => Some(-(bytes[off + 1] as i32)),
        Op::PopN => Some(-(bytes[off + 1] as i32)),
        op => Some(op.stack_effect()),
    }
}

/// If the callee of the `CALL` at `call_off` was produced by a `GLOBAL`
/// load, return that global's index
fn self_callee_slot(bytes: &[u8], call_off: usize) -> Option<usize> {
    let nargs = bytes[call_off + 1] as i32;
    let offsets = instruction_offsets(bytes);
    let call_idx = offsets.iter().position(|&o| o == call_off)?;

    // Walk backward until the producers of all `nargs` arguments are
    // accounted for; the next producing instruction pushed the callee.
    let mut needed = nargs;
    for &off in offsets[..call_idx].iter().rev() {
        if bytes[off] == Op::Skip as u8 {
            continue;
        }
        let effect = net_effect(bytes, off)?;
        if needed == 0 {
            return if bytes[off] == Op::Global as u8 && effect == 1 {
                Some(read_u16(bytes, off + 1) as usize)
            } else {
                None
            };
        }
        needed -= effect;
        if needed < 0 {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{FnKind, Function, ObjData};

    fn fixture() -> (Arc<Mutex<Context>>, ObjRef, usize) {
        let mut ctx = Context::new();
        let name = ctx.intern("::f");
        let fun = ctx.heap.alloc(ObjData::Function(Function {
            kind: FnKind::Script,
            arity: 1,
            name,
            short_name: name,
            code: None,
            locals: Vec::new(),
            upvars: Vec::new(),
            patch_point: None,
            is_api: false,
        }));
        let idx = ctx.globals.add("::f");
        ctx.globals.set(idx, Value::obj(fun));
        (Arc::new(Mutex::new(ctx)), fun, idx)
    }

    #[test]
    fn test_rewrites_direct_self_recursion() {
        let (ctx, fun, idx) = fixture();
        // GLOBAL f; GET 1; DEC; CALL 1; RET
        let mut code = CodeBuf::new();
        for b in [
            Op::Global as u8,
            idx as u8,
            0,
            Op::Get as u8,
            1,
            0,
            Op::Dec as u8,
            Op::Call as u8,
            1,
            Op::Ret as u8,
        ] {
            code.emit(b);
        }
        run(&mut code, &ctx, fun);
        assert_eq!(code.bytes[7], Op::TailCall as u8);
    }

    #[test]
    fn test_leaves_calls_to_other_functions() {
        let (ctx, fun, idx) = fixture();
        let other_idx = {
            let mut ctx = ctx.lock().unwrap();
            ctx.globals.add("::g")
        };
        let mut code = CodeBuf::new();
        for b in [
            Op::Global as u8,
            other_idx as u8,
            0,
            Op::Get as u8,
            1,
            0,
            Op::Call as u8,
            1,
            Op::Ret as u8,
        ] {
            code.emit(b);
        }
        let _ = idx;
        run(&mut code, &ctx, fun);
        assert_eq!(code.bytes[6], Op::Call as u8);
    }

    #[test]
    fn test_leaves_non_tail_positions() {
        let (ctx, fun, idx) = fixture();
        // GLOBAL f; GET 1; CALL 1; INC; RET — the call result is modified
        // before returning, so no rewrite happens (no CALL;RET adjacency).
        let mut code = CodeBuf::new();
        for b in [
            Op::Global as u8,
            idx as u8,
            0,
            Op::Get as u8,
            1,
            0,
            Op::Call as u8,
            1,
            Op::Inc as u8,
            Op::Ret as u8,
        ] {
            code.emit(b);
        }
        run(&mut code, &ctx, fun);
        assert_eq!(code.bytes[6], Op::Call as u8);
    }
}
