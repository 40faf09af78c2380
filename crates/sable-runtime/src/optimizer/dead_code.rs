//! Dead code after `RET`
//!
//! Bytes following a return can only execute if some branch lands on them,
//! so everything between a `RET` and the nearest branch target beyond it
//! (or the end of the function) is overwritten with `SKIP`.

use super::{instr_len, instruction_offsets};
use crate::bytecode::{read_u16, CodeBuf, Op};

/// Run the pass
pub fn run(code: &mut CodeBuf) {
    let offsets = instruction_offsets(&code.bytes);
    for &off in &offsets {
        if code.bytes[off] == Op::Ret as u8 {
            blank_after(code, off);
        }
    }
}

/// The nearest branch target strictly beyond `pos`, if any
fn first_target_after(bytes: &[u8], pos: usize) -> Option<usize> {
    let mut nearest: Option<usize> = None;
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
            if target > pos && nearest.is_none_or(|n| target < n) {
                nearest = Some(target);
            }
        }
        off += instr_len(bytes, off);
    }
    nearest
}

fn blank_after(code: &mut CodeBuf, ret_off: usize) {
    let end = first_target_after(&code.bytes, ret_off).unwrap_or(code.bytes.len());
    for byte in &mut code.bytes[ret_off + 1..end] {
        *byte = Op::Skip as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::write_u16;

    #[test]
    fn test_blanks_to_end_of_function() {
        let mut code = CodeBuf::new();
        for b in [Op::Nil as u8, Op::Ret as u8, Op::One as u8, Op::Pop as u8] {
            code.emit(b);
        }
        run(&mut code);
        assert_eq!(
            code.bytes,
            vec![Op::Nil as u8, Op::Ret as u8, Op::Skip as u8, Op::Skip as u8]
        );
    }

    #[test]
    fn test_stops_at_branch_target() {
        // BRZ +6 targets the Pop after the RET; only the One in between dies.
        let mut code = CodeBuf::new();
        for b in [
            Op::Brz as u8,
            0,
            0,
            Op::Nil as u8,
            Op::Ret as u8,
            Op::One as u8,
            Op::Pop as u8,
        ] {
            code.emit(b);
        }
        write_u16(&mut code.bytes, 1, 6);
        run(&mut code);
        assert_eq!(code.bytes[5], Op::Skip as u8);
        assert_eq!(code.bytes[6], Op::Pop as u8);
    }
}
