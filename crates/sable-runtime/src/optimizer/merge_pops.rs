//! `POP` coalescing
//!
//! A run of adjacent `POP`s collapses into a single `POPN n`. Runs are never
//! merged across a branch target, and `n` saturates at 255.

use super::jumps_into_range;
use crate::bytecode::{CodeBuf, Op};

/// Run the pass
pub fn run(code: &mut CodeBuf) {
    let mut off = 0;
    while off < code.bytes.len() {
        if code.bytes[off] == Op::Pop as u8 {
            off = merge_run(code, off);
        } else {
            off += super::instr_len(&code.bytes, off);
        }
    }
}

fn merge_run(code: &mut CodeBuf, start: usize) -> usize {
    let mut count = 1usize;
    while start + count < code.bytes.len()
        && code.bytes[start + count] == Op::Pop as u8
        && count < 255
    {
        // A branch landing inside the run must keep its pop count intact.
        if jumps_into_range(&code.bytes, start, start + count) {
            break;
        }
        count += 1;
    }

    if count > 1 {
        code.bytes[start] = Op::PopN as u8;
        code.bytes[start + 1] = count as u8;
        for byte in &mut code.bytes[start + 2..start + count] {
            *byte = Op::Skip as u8;
        }
    }
    start + count
}
