//! Stack Traces & Trace Accounting
//!
//! On panic, the dispatch loop exits and the unwinder walks the in-band
//! RetInfo chain from the current frame pointer. Each saved pc is looked
//! up in the debug table (linear scan; the table is small) and the node's
//! source byte offset is mapped to (line, col) by a second linear scan
//! over the source text. The outermost frame is synthesized as `main`.

use tern_core::Value;

use crate::bytecode::{ByteCodeBuffer, DebugSym, NULL_NODE};
use crate::error::{RunError, RunResult};
use crate::vm::Vm;

/// One unwound frame, top-most first in a trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub name: String,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
}

impl std::fmt::Display for StackTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for frame in &self.frames {
            writeln!(f, "{}@{}:{}", frame.name, frame.line, frame.col)?;
        }
        Ok(())
    }
}

/// Retain/release counters surfaced to the host in trace mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceInfo {
    pub num_retains: u64,
    pub num_releases: u64,
}

/// Closest debug symbol at or before `pc`
fn find_sym(buf: &ByteCodeBuffer, pc: u32) -> Option<&DebugSym> {
    buf.debug_table
        .iter()
        .filter(|sym| sym.pc <= pc)
        .max_by_key(|sym| sym.pc)
}

/// Map a byte offset in the source to 1-based (line, col)
pub(crate) fn pos_to_line_col(src: &str, pos: u32) -> (u32, u32) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in src.char_indices() {
        if i as u32 >= pos {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Walk the in-band frame chain and materialize the trace, top-most
/// frame first
pub(crate) fn build_stack_trace(vm: &Vm) -> RunResult<StackTrace> {
    let mut frames = Vec::new();
    let mut pc = vm.pc as u32;
    let mut fp = vm.fp;

    loop {
        let sym = find_sym(&vm.buf, pc).ok_or(RunError::NoDebugSym(pc))?;
        let node = vm
            .buf
            .debug_nodes
            .get(sym.node_id as usize)
            .ok_or(RunError::NoDebugSym(pc))?;
        let (line, col) = pos_to_line_col(&vm.buf.src, node.pos);
        let name = if sym.frame_node_id == NULL_NODE {
            "main".to_string()
        } else {
            let frame_node = vm
                .buf
                .debug_nodes
                .get(sym.frame_node_id as usize)
                .ok_or(RunError::NoDebugSym(pc))?;
            if frame_node.name.is_empty() {
                "<anonymous>".to_string()
            } else {
                frame_node.name.clone()
            }
        };
        frames.push(StackFrame { name, line, col });

        if fp == 0 {
            break;
        }
        let ri: Value = vm.stack[fp];
        let ri = ri.as_ret_info();
        // The saved pc points after the call; step back inside it so the
        // call site's own symbol is found
        pc = ri.pc.saturating_sub(1);
        fp = ri.fp as usize;
    }

    Ok(StackTrace { frames })
}

// =============================================================================
// Tests
// =============================================================================
