//! Runtime Error Taxonomy
//!
//! The dispatch loop surfaces one of a small set of outcomes. `Panic` and
//! `OutOfBounds` carry their user-visible message on the VM instance
//! (`panic_msg`), not in the error value, because the stack trace is
//! materialised from VM state at the loop boundary. `OutOfBounds` is
//! distinguished from `Panic` only for testing; hosts should treat it as a
//! panic. `StackOverflow` never escapes the grow-stack driver.

use std::fmt;

/// Outcome of bytecode execution, excluding normal completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError {
    /// User-visible runtime error; message and trace live on the VM
    Panic,
    /// Index opcode out of bounds (a panic, kept distinct for tests)
    OutOfBounds,
    /// A call could not reserve the callee's frame; recovered internally
    /// by the grow-stack driver
    StackOverflow,
    /// The heap could not grow
    OutOfMemory,
    /// The debug table has no entry covering a pc reached while unwinding
    NoDebugSym(u32),
    /// Internal: a loop body executed `break`; unwinds exactly one
    /// for-loop level and never escapes the interpreter
    ForLoopBreak,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Panic => write!(f, "runtime panic"),
            RunError::OutOfBounds => write!(f, "index out of bounds"),
            RunError::StackOverflow => write!(f, "value stack overflow"),
            RunError::OutOfMemory => write!(f, "heap exhausted"),
            RunError::NoDebugSym(pc) => {
                write!(f, "no debug symbol covers pc {pc} during unwinding")
            }
            RunError::ForLoopBreak => write!(f, "loop break escaped its loop"),
        }
    }
}

impl std::error::Error for RunError {}

/// Result alias used throughout the interpreter
pub type RunResult<T = ()> = Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(RunError::Panic.to_string(), "runtime panic");
        assert!(RunError::NoDebugSym(42).to_string().contains("42"));
    }
}
