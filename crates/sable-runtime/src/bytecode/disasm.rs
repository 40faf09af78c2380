//! Bytecode disassembler
//!
//! Renders a code chunk one instruction per line:
//!
//! ```text
//! 0000 Global      #2        ; ::fib
//! 0003 Get         slot 1
//! 0006 Call        args 1
//! ```

use super::{read_u16, Op};
use crate::bytecode::CodeChunk;
use crate::context::Context;
use std::fmt::Write as _;

/// Render a whole chunk
pub fn disassemble(chunk: &CodeChunk, ctx: &Context) -> String {
    let mut out = String::new();
    let mut offset = 0;
    while offset < chunk.bytes.len() {
        offset = disassemble_at(chunk, ctx, offset, &mut out);
    }
    out
}

fn disassemble_at(chunk: &CodeChunk, ctx: &Context, offset: usize, out: &mut String) -> usize {
    let byte = chunk.bytes[offset];
    let op = match Op::from_byte(byte) {
        Some(op) => op,
        None => {
            let _ = writeln!(out, "{:04} ??{:#04x}", offset, byte);
            return offset + 1;
        }
    };

    let _ = write!(out, "{:04} {:<10}", offset, op.name());

    match op {
        Op::Const | Op::Closure | Op::MbrGet | Op::MbrSet => {
            let idx = read_u16(&chunk.bytes, offset + 1) as usize;
            let _ = write!(out, " #{}", idx);
            if idx < ctx.constants.len() {
                let _ = write!(out, "        ; {}", ctx.display(ctx.constants.get(idx)));
            }
        }
        Op::Global | Op::Store => {
            let idx = read_u16(&chunk.bytes, offset + 1) as usize;
            let _ = write!(out, " #{}", idx);
            if idx < ctx.globals.len() {
                let _ = write!(out, "        ; {}", ctx.globals.name_at(idx));
            }
        }
        Op::Get | Op::Set => {
            let _ = write!(out, " slot {}", read_u16(&chunk.bytes, offset + 1));
        }
        Op::UpvGet | Op::UpvSet => {
            let _ = write!(out, " upv {}", read_u16(&chunk.bytes, offset + 1));
        }
        Op::Bra | Op::Brz | Op::Bnz => {
            let dist = read_u16(&chunk.bytes, offset + 1) as usize;
            let _ = write!(out, " +{}        ; -> {:04}", dist, offset + dist);
        }
        Op::Loop => {
            let dist = read_u16(&chunk.bytes, offset + 1) as usize;
            let _ = write!(out, " -{}        ; -> {:04}", dist, offset.saturating_sub(dist));
        }
        Op::Call | Op::TailCall => {
            let _ = write!(out, " args {}", chunk.bytes[offset + 1]);
        }
        Op::PopN => {
            let _ = write!(out, " n {}", chunk.bytes[offset + 1]);
        }
        _ => {}
    }

    let _ = writeln!(out);
    offset + 1 + op.operand_bytes()
}
