//! Tern VM: the bytecode execution core of the Tern language
//!
//! The VM consumes a compiled [`ByteCodeBuffer`] and executes it to
//! completion, producing a single result value, a runtime panic with a
//! source-mapped stack trace, or a resource-exhaustion error. The
//! lexer/parser, the AST-to-bytecode compiler, and the CLI front-end are
//! external collaborators.
//!
//! # Modules
//!
//! - `bytecode`: opcode set, the buffer the compiler hands over, and a
//!   small assembler used by hosts and tests
//! - `vm`: VM state, lifecycle, and object construction
//! - `eval`: the dispatch loop
//! - `calls`: call/return ABI and symbol dispatch
//! - `symbols`: function/field/method registries with inline caching
//! - `builtins`: the core native bindings registered at init
//! - `error`, `trace`: error taxonomy and stack-trace construction
//! - `config`, `report`: env-driven configuration and at-exit stats
//! - `serialize`: bytecode persistence

pub mod builtins;
pub mod bytecode;
pub mod calls;
pub mod config;
pub mod error;
pub mod eval;
pub mod report;
pub mod serialize;
pub mod strings;
pub mod symbols;
pub mod trace;
pub mod vm;

// Re-export key types
pub use bytecode::{Assembler, ByteCodeBuffer, DebugNode, DebugSym, OpCode, NULL_NODE};
pub use error::{RunError, RunResult};
pub use report::VmStats;
pub use serialize::{load_bytecode, save_bytecode, SerializeError};
pub use symbols::{
    FieldShape, FieldSymbol, FuncSymbol, MethodEntry, MethodShape, MethodSymbol, SymbolTables,
    TypeDesc,
};
pub use trace::{StackFrame, StackTrace, TraceInfo};
pub use vm::Vm;

pub use tern_core::{Heap, Value};
