//! Peephole bytecode optimizer
//!
//! Six scanning passes edit the byte vector in place, writing `SKIP`
//! placeholders where instructions disappear. A pass never touches a window
//! some branch jumps into. After the passes run, jump operands are re-patched
//! to subtract the `SKIP`s they straddle and the `SKIP`s are physically
//! removed, rebinding each surviving byte's source span to its new offset.

mod dead_code;
mod folding;
mod merge_pops;
mod store_load;
mod tail_calls;
mod zero_branch;

use crate::bytecode::{read_u16, write_u16, CodeBuf, Op};
use crate::context::Context;
use crate::error::SableError;
use crate::heap::ObjRef;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Run every pass in order, then re-patch jumps and compact the `SKIP`s
pub fn optimize(
    code: &mut CodeBuf,
    ctx: &Arc<Mutex<Context>>,
    fun: ObjRef,
) -> Result<(), SableError> {
    dead_code::run(code);
    merge_pops::run(code);
    tail_calls::run(code, ctx, fun);
    zero_branch::run(code);
    store_load::run(code);
    folding::run(code, ctx);

    patch_jumps(code);
    remove_skips(code);
    Ok(())
}

/// Byte length of the instruction at `off`
pub(crate) fn instr_len(bytes: &[u8], off: usize) -> usize {
    match Op::from_byte(bytes[off]) {
        Some(op) => 1 + op.operand_bytes(),
        None => 1,
    }
}

/// Offsets of every instruction, in order
pub(crate) fn instruction_offsets(bytes: &[u8]) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut off = 0;
    while off < bytes.len() {
        offsets.push(off);
        off += instr_len(bytes, off);
    }
    offsets
}

/// Whether any branch targets a position strictly inside `(start, end]`
pub(crate) fn jumps_into_range(bytes: &[u8], start: usize, end: usize) -> bool {
    let mut off = 0;
    while off < bytes.len() {
        let target = match Op::from_byte(bytes[off]) {
            Some(Op::Bra) | Some(Op::Brz) | Some(Op::Bnz) => {
                Some(off + read_u16(bytes, off + 1) as usize)
            }
            Some(Op::Loop) => Some(off.saturating_sub(read_u16(bytes, off + 1) as usize)),
            _ => None,
        };
        if let Some(target) = target {
            if target > start && target <= end {
                return true;
            }
        }
        off += instr_len(bytes, off);
    }
    false
}

/// Skip-tolerant search for a sequence of opcodes starting at or after
/// `from`. Returns the matched opcode offsets and the scan position to
/// resume from.
pub(crate) fn find_pattern(
    bytes: &[u8],
    pattern: &[Op],
    from: usize,
) -> Option<(Vec<usize>, usize)> {
    let mut off = from;
    let mut matched = Vec::new();

    while off < bytes.len() {
        let byte = bytes[off];
        if matched.len() < pattern.len() && byte == pattern[matched.len()] as u8 {
            matched.push(off);
            off += instr_len(bytes, off);
            if matched.len() == pattern.len() {
                return Some((matched, off));
            }
        } else if byte == Op::Skip as u8 {
            off += 1;
        } else {
            off += instr_len(bytes, off);
            matched.clear();
        }
    }
    None
}

/// Subtract enclosed `SKIP`s from every jump operand
fn patch_jumps(code: &mut CodeBuf) {
    let offsets = instruction_offsets(&code.bytes);
    for &off in &offsets {
        let (range_start, range_end) = match Op::from_byte(code.bytes[off]) {
            Some(Op::Bra) | Some(Op::Brz) | Some(Op::Bnz) => {
                // Walk from the next instruction boundary, not the operand bytes.
                let distance = read_u16(&code.bytes, off + 1) as usize;
                (off + 3, off + distance)
            }
            Some(Op::Loop) => {
                let distance = read_u16(&code.bytes, off + 1) as usize;
                (off.saturating_sub(distance), off)
            }
            _ => continue,
        };

        let mut skips = 0u16;
        let mut pos = range_start.min(code.bytes.len());
        while pos < range_end.min(code.bytes.len()) {
            if code.bytes[pos] == Op::Skip as u8 {
                skips += 1;
            }
            pos += instr_len(&code.bytes, pos);
        }

        if skips > 0 {
            let distance = read_u16(&code.bytes, off + 1) - skips;
            write_u16(&mut code.bytes, off + 1, distance);
        }
    }
}

/// Physically remove `SKIP` bytes, rebinding source spans to new offsets
fn remove_skips(code: &mut CodeBuf) {
    let mut bytes = Vec::with_capacity(code.bytes.len());
    let mut spans = HashMap::new();

    let mut off = 0;
    while off < code.bytes.len() {
        let len = instr_len(&code.bytes, off);
        if code.bytes[off] != Op::Skip as u8 {
            let new_off = bytes.len();
            for i in 0..len {
                if let Some(span) = code.spans.get(&((off + i) as u32)) {
                    spans.insert((new_off + i) as u32, *span);
                }
                bytes.push(code.bytes[off + i]);
            }
        }
        off += len;
    }

    code.bytes = bytes;
    code.spans = spans;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;

    fn buf(ops: &[u8]) -> CodeBuf {
        let mut code = CodeBuf::new();
        for &b in ops {
            code.emit(b);
        }
        code
    }

    #[test]
    fn test_find_pattern_skips_skips() {
        let code = buf(&[
            Op::One as u8,
            Op::Skip as u8,
            Op::Skip as u8,
            Op::Pop as u8,
        ]);
        let (matched, _) = find_pattern(&code.bytes, &[Op::One, Op::Pop], 0).unwrap();
        assert_eq!(matched, vec![0, 3]);
    }

    #[test]
    fn test_jumps_into_range_detects_interior_targets() {
        // BRA +4 jumping over [Pop, Pop] into the Pop at offset 4
        let mut code = buf(&[Op::Bra as u8, 0, 0, Op::Pop as u8, Op::Pop as u8]);
        write_u16(&mut code.bytes, 1, 4);
        assert!(jumps_into_range(&code.bytes, 3, 4));
        assert!(!jumps_into_range(&code.bytes, 4, 5));
    }

    #[test]
    fn test_remove_skips_rebinds_spans() {
        let mut code = CodeBuf::new();
        code.emit(Op::Skip as u8);
        code.emit(Op::Skip as u8);
        code.emit_at(Op::One as u8, Span::new(5, 6));
        code.emit(Op::Print as u8);
        remove_skips(&mut code);
        assert_eq!(code.bytes, vec![Op::One as u8, Op::Print as u8]);
        assert_eq!(code.spans.get(&0), Some(&Span::new(5, 6)));
    }

    #[test]
    fn test_patch_jumps_shrinks_over_skips() {
        // BRZ +6 over [Skip, Skip, One] to Print; removing the skips makes it +4.
        let mut code = buf(&[
            Op::Brz as u8,
            0,
            0,
            Op::Skip as u8,
            Op::Skip as u8,
            Op::One as u8,
            Op::Print as u8,
        ]);
        write_u16(&mut code.bytes, 1, 6);
        patch_jumps(&mut code);
        assert_eq!(read_u16(&code.bytes, 1), 4);
        remove_skips(&mut code);
        assert_eq!(
            code.bytes,
            vec![Op::Brz as u8, 4, 0, Op::One as u8, Op::Print as u8]
        );
    }
}
