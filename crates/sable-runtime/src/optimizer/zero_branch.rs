//! Zero-compare branch collapsing
//!
//! `ZERO; EQ; BRZ` branches when the tested value is nonzero, which is what
//! `BNZ` does directly; the mirrored form collapses to `BRZ`. The compare
//! bytes become `SKIP`s.

use super::{find_pattern, jumps_into_range};
use crate::bytecode::{CodeBuf, Op};

/// Run the pass
pub fn run(code: &mut CodeBuf) {
    collapse(code, &[Op::Zero, Op::Eq, Op::Brz], Op::Bnz);
    collapse(code, &[Op::Zero, Op::Eq, Op::Bnz], Op::Brz);
}

fn collapse(code: &mut CodeBuf, pattern: &[Op], flipped: Op) {
    let mut from = 0;
    while let Some((matched, next)) = find_pattern(&code.bytes, pattern, from) {
        let (zero, eq, branch) = (matched[0], matched[1], matched[2]);
        if !jumps_into_range(&code.bytes, zero, branch + 2) {
            code.bytes[zero] = Op::Skip as u8;
            code.bytes[eq] = Op::Skip as u8;
            code.bytes[branch] = flipped as u8;
        }
        from = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::write_u16;

    #[test]
    fn test_collapses_eq_zero_brz() {
        let mut code = CodeBuf::new();
        for b in [
            Op::Get as u8,
            0,
            0,
            Op::Zero as u8,
            Op::Eq as u8,
            Op::Brz as u8,
            0,
            0,
        ] {
            code.emit(b);
        }
        write_u16(&mut code.bytes, 6, 2);
        run(&mut code);
        assert_eq!(code.bytes[3], Op::Skip as u8);
        assert_eq!(code.bytes[4], Op::Skip as u8);
        assert_eq!(code.bytes[5], Op::Bnz as u8);
    }

    #[test]
    fn test_collapses_eq_zero_bnz_to_brz() {
        let mut code = CodeBuf::new();
        for b in [Op::Zero as u8, Op::Eq as u8, Op::Bnz as u8, 2, 0] {
            code.emit(b);
        }
        run(&mut code);
        assert_eq!(code.bytes[2], Op::Brz as u8);
    }

    #[test]
    fn test_matches_through_skips() {
        let mut code = CodeBuf::new();
        for b in [
            Op::Skip as u8,
            Op::Skip as u8,
            Op::Zero as u8,
            Op::Eq as u8,
            Op::Brz as u8,
            2,
            0,
        ] {
            code.emit(b);
        }
        run(&mut code);
        assert_eq!(code.bytes[4], Op::Bnz as u8);
    }
}
