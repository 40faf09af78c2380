//! Call frames

use crate::bytecode::CodeChunk;
use crate::heap::ObjRef;
use std::sync::Arc;

/// One active call
#[derive(Debug)]
pub struct CallFrame {
    /// The function being executed
    pub function: ObjRef,
    /// The closure being executed, when the callee was one
    pub closure: Option<ObjRef>,
    /// The receiver under construction (class and map-init frames)
    pub receiver: Option<ObjRef>,
    /// The function's code, shared with its code object
    pub code: Arc<CodeChunk>,
    /// Instruction pointer into `code`
    pub ip: usize,
    /// Absolute stack slot of the callee; arguments sit just above it
    pub base: usize,
}
