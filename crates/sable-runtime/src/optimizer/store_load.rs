//! Redundant store/reload elision
//!
//! `STORE i; POP; GLOBAL i` (and the `SET`/`GET` local form) reloads the
//! value that already sits under the `POP`; the pop and the reload vanish.

use super::{find_pattern, jumps_into_range};
use crate::bytecode::{read_u16, CodeBuf, Op};

/// Run the pass
pub fn run(code: &mut CodeBuf) {
    elide(code, &[Op::Store, Op::Pop, Op::Global]);
    elide(code, &[Op::Set, Op::Pop, Op::Get]);
}

fn elide(code: &mut CodeBuf, pattern: &[Op]) {
    let mut from = 0;
    while let Some((matched, next)) = find_pattern(&code.bytes, pattern, from) {
        let (store, pop, load) = (matched[0], matched[1], matched[2]);
        let same_slot =
            read_u16(&code.bytes, store + 1) == read_u16(&code.bytes, load + 1);

        if same_slot && !jumps_into_range(&code.bytes, store, load + 2) {
            code.bytes[pop] = Op::Skip as u8;
            code.bytes[load] = Op::Skip as u8;
            code.bytes[load + 1] = Op::Skip as u8;
            code.bytes[load + 2] = Op::Skip as u8;
        }
        from = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elides_store_pop_reload() {
        let mut code = CodeBuf::new();
        for b in [
            Op::Store as u8,
            3,
            0,
            Op::Pop as u8,
            Op::Global as u8,
            3,
            0,
        ] {
            code.emit(b);
        }
        run(&mut code);
        assert_eq!(
            code.bytes,
            vec![
                Op::Store as u8,
                3,
                0,
                Op::Skip as u8,
                Op::Skip as u8,
                Op::Skip as u8,
                Op::Skip as u8,
            ]
        );
    }

    #[test]
    fn test_different_slots_untouched() {
        let original = vec![
            Op::Set as u8,
            1,
            0,
            Op::Pop as u8,
            Op::Get as u8,
            2,
            0,
        ];
        let mut code = CodeBuf::new();
        for &b in &original {
            code.emit(b);
        }
        run(&mut code);
        assert_eq!(code.bytes, original);
    }
}
