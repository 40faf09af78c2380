//! Iterative constant folding
//!
//! Windows of `{constant push} … {constant push} {binop}` (and the unary
//! `INC`/`DEC` forms) evaluate at compile time through the same operator
//! helpers the VM uses. Results that fit a dedicated opcode are written in
//! place; anything else lands in the constants table, using the two `SKIP`
//! bytes the compiler leaves in front of every inline constant as writable
//! workspace. The pass repeats until a full scan applies no fold, so chains
//! like `1 + 2 * 3` collapse completely.

use super::{instr_len, jumps_into_range};
use crate::bytecode::{read_u16, CodeBuf, Op};
use crate::context::Context;
use crate::ops;
use crate::value::Value;
use std::sync::{Arc, Mutex};

/// Run the pass to a fixed point
pub fn run(code: &mut CodeBuf, ctx: &Arc<Mutex<Context>>) {
    loop {
        if !scan_once(code, ctx) {
            break;
        }
    }
}

fn is_const_push(byte: u8) -> bool {
    matches!(
        Op::from_byte(byte),
        Some(Op::Const | Op::Zero | Op::One | Op::Two | Op::Nil | Op::True | Op::False)
    )
}

fn const_value(ctx: &Context, bytes: &[u8], off: usize) -> Value {
    match Op::from_byte(bytes[off]) {
        Some(Op::Const) => ctx.constants.get(read_u16(bytes, off + 1) as usize),
        Some(Op::Zero) => Value::num(0.0),
        Some(Op::One) => Value::num(1.0),
        Some(Op::Two) => Value::num(2.0),
        Some(Op::Nil) => Value::NIL,
        Some(Op::True) => Value::TRUE,
        Some(Op::False) => Value::FALSE,
        _ => unreachable!("not a constant push"),
    }
}

/// The next non-`SKIP` instruction offset after the instruction at `off`
fn next_real(bytes: &[u8], off: usize) -> Option<usize> {
    let mut pos = off + instr_len(bytes, off);
    while pos < bytes.len() {
        if bytes[pos] != Op::Skip as u8 {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

fn scan_once(code: &mut CodeBuf, ctx: &Arc<Mutex<Context>>) -> bool {
    let mut changed = false;
    let mut off = 0;
    while off < code.bytes.len() {
        if is_const_push(code.bytes[off]) && try_fold(code, ctx, off) {
            changed = true;
        }
        off += instr_len(&code.bytes, off);
    }
    changed
}

fn try_fold(code: &mut CodeBuf, ctx: &Arc<Mutex<Context>>, first: usize) -> bool {
    let mut guard = ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let ctx = &mut *guard;

    let x = const_value(ctx, &code.bytes, first);

    let Some(second) = next_real(&code.bytes, first) else {
        return false;
    };

    // Unary fold: {const} INC/DEC
    let folded = match Op::from_byte(code.bytes[second]) {
        Some(Op::Inc) => Some((second, ops::inc(x))),
        Some(Op::Dec) => Some((second, ops::dec(x))),
        _ => None,
    };
    if let Some((end, result)) = folded {
        return match result {
            Ok(v) => apply(code, ctx, first, end, v),
            Err(_) => false,
        };
    }

    // Binary fold: {const} {const} ADD/SUB/MUL/DIV
    if !is_const_push(code.bytes[second]) {
        return false;
    }
    let y = const_value(ctx, &code.bytes, second);
    let Some(third) = next_real(&code.bytes, second) else {
        return false;
    };
    let result = match Op::from_byte(code.bytes[third]) {
        Some(Op::Add) => ops::add(ctx, x, y),
        Some(Op::Sub) => ops::sub(x, y),
        Some(Op::Mul) => ops::mul(x, y),
        Some(Op::Div) => ops::div(x, y),
        _ => return false,
    };
    match result {
        Ok(v) => apply(code, ctx, first, third, v),
        Err(_) => false,
    }
}

/// Write the folded value so it ends at `end`, blanking the rest of the
/// window. Results without a dedicated opcode need three bytes for a
/// `CONST`, which may reach into the `SKIP` workspace in front of `first`.
fn apply(code: &mut CodeBuf, ctx: &mut Context, first: usize, end: usize, v: Value) -> bool {
    let single = if v == Value::num(0.0) {
        Some(Op::Zero)
    } else if v == Value::num(1.0) {
        Some(Op::One)
    } else if v == Value::num(2.0) {
        Some(Op::Two)
    } else if v == Value::NIL {
        Some(Op::Nil)
    } else if v == Value::TRUE {
        Some(Op::True)
    } else if v == Value::FALSE {
        Some(Op::False)
    } else {
        None
    };

    let write_start = match single {
        Some(_) => end,
        None => {
            let start = match end.checked_sub(2) {
                Some(start) => start,
                None => return false,
            };
            // The bytes ahead of the window must be spare workspace.
            if start < first
                && !code.bytes[start..first]
                    .iter()
                    .all(|&b| b == Op::Skip as u8)
            {
                return false;
            }
            start
        }
    };

    if jumps_into_range(&code.bytes, write_start.min(first), end) {
        return false;
    }

    match single {
        Some(op) => {
            code.bytes[end] = op as u8;
        }
        None => {
            let idx = ctx.constants.add(v);
            let Ok(idx) = u16::try_from(idx) else {
                return false;
            };
            code.bytes[write_start] = Op::Const as u8;
            code.bytes[write_start + 1] = (idx & 0xff) as u8;
            code.bytes[write_start + 2] = (idx >> 8) as u8;
        }
    }

    for pos in first..write_start {
        code.bytes[pos] = Op::Skip as u8;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<Mutex<Context>> {
        Arc::new(Mutex::new(Context::new()))
    }

    fn emit_all(bytes: &[u8]) -> CodeBuf {
        let mut code = CodeBuf::new();
        for &b in bytes {
            code.emit(b);
        }
        code
    }

    #[test]
    fn test_folds_one_plus_one_to_two() {
        let ctx = ctx();
        // SKIP SKIP ONE SKIP SKIP ONE ADD
        let mut code = emit_all(&[
            Op::Skip as u8,
            Op::Skip as u8,
            Op::One as u8,
            Op::Skip as u8,
            Op::Skip as u8,
            Op::One as u8,
            Op::Add as u8,
        ]);
        run(&mut code, &ctx);
        let live: Vec<u8> = code
            .bytes
            .iter()
            .copied()
            .filter(|&b| b != Op::Skip as u8)
            .collect();
        assert_eq!(live, vec![Op::Two as u8]);
    }

    #[test]
    fn test_folds_chain_iteratively() {
        let ctx = ctx();
        // 2 * 3 folds to CONST 6, then 1 + 6 folds to CONST 7.
        let six_upstream = {
            let mut guard = ctx.lock().unwrap();
            let three = guard.constants.add(Value::num(3.0));
            three
        };
        let mut code = emit_all(&[
            Op::Skip as u8,
            Op::Skip as u8,
            Op::One as u8,
            Op::Skip as u8,
            Op::Skip as u8,
            Op::Two as u8,
            Op::Const as u8,
            six_upstream as u8,
            0,
            Op::Mul as u8,
            Op::Add as u8,
        ]);
        run(&mut code, &ctx);

        let guard = ctx.lock().unwrap();
        // The surviving instruction is a CONST holding 7.
        let live: Vec<usize> = code
            .bytes
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b != Op::Skip as u8)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(live.len(), 3); // CONST + 2 operand bytes
        let idx = read_u16(&code.bytes, live[0] + 1) as usize;
        assert_eq!(guard.constants.get(idx), Value::num(7.0));
    }

    #[test]
    fn test_inc_folds() {
        let ctx = ctx();
        let mut code = emit_all(&[
            Op::Skip as u8,
            Op::Skip as u8,
            Op::One as u8,
            Op::Inc as u8,
        ]);
        run(&mut code, &ctx);
        let live: Vec<u8> = code
            .bytes
            .iter()
            .copied()
            .filter(|&b| b != Op::Skip as u8)
            .collect();
        assert_eq!(live, vec![Op::Two as u8]);
    }

    #[test]
    fn test_errors_do_not_fold() {
        let ctx = ctx();
        let original = [Op::Nil as u8, Op::Inc as u8];
        let mut code = emit_all(&original);
        run(&mut code, &ctx);
        assert_eq!(code.bytes, original);
    }

    #[test]
    fn test_division_by_zero_folds_to_infinity() {
        let ctx = ctx();
        let mut code = emit_all(&[
            Op::Skip as u8,
            Op::Skip as u8,
            Op::One as u8,
            Op::Skip as u8,
            Op::Skip as u8,
            Op::Zero as u8,
            Op::Div as u8,
        ]);
        run(&mut code, &ctx);
        let guard = ctx.lock().unwrap();
        let live: Vec<usize> = code
            .bytes
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b != Op::Skip as u8)
            .map(|(i, _)| i)
            .collect();
        let idx = read_u16(&code.bytes, live[0] + 1) as usize;
        assert_eq!(guard.constants.get(idx).as_num(), Some(f64::INFINITY));
    }
}
