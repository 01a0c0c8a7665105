//! Bytecode Model
//!
//! The compiler hands the VM a [`ByteCodeBuffer`]: a flat byte array of
//! opcodes with inline immediate operands, a pre-tagged constant table, an
//! immutable string pool, and the debug tables used for stack traces.
//!
//! Operand widths are opcode-specific; multi-byte operands are
//! little-endian. The [`Assembler`] builds buffers programmatically - the
//! form the collaborating compiler emits and the form the test suite
//! hand-assembles.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use tern_core::Value;

/// Marks "no node": used for the main frame's `frame_node_id`
pub const NULL_NODE: u32 = u32::MAX;

/// Slot operand meaning "use the stack top" (fused arithmetic) or "no
/// binding" (for-loops)
pub const SLOT_NONE: u8 = 0xFF;

// =============================================================================
// Opcodes
// =============================================================================

/// One-byte opcodes. Operand layout is documented per category in the
/// interpreter; `u16` operands are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    /// Halt; the value above `main_local_size` (if any) is the result
    End = 0,

    // Literals / load / store
    PushNone,
    PushTrue,
    PushFalse,
    /// idx:u16 - push consts[idx]
    PushConst,
    /// slot:u8 - push frame[slot]
    Load,
    /// slot:u8 - push frame[slot] and retain it
    LoadRetain,
    /// slot:u8 - pop into frame[slot]
    Set,
    /// slot:u8 - release the old frame[slot], then pop into it
    ReleaseSet,
    /// n:u8, slots:u8*n - initialize slots to none
    SetInitN,

    // Refcounts
    /// retain the stack top
    Retain,
    /// slot:u8 - release frame[slot]
    Release,
    /// n:u8, slots:u8*n - release each slot
    ReleaseN,

    // Arithmetic
    Add,
    Sub,
    /// a:u8, b:u8 - fused subtract; SLOT_NONE pops the stack
    Sub1,
    /// a:u8, b:u8 - fused subtract over two frame slots
    Sub2,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Not,
    BitAnd,

    // Comparison
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,

    // Branching
    /// off:u16 - pc += off (relative to the opcode)
    Jump,
    /// off:u16 - pc -= off
    JumpBack,
    /// off:u16 - pop; jump if truthy
    JumpCond,
    /// off:u16 - pop; jump if falsy
    JumpNotCond,
    /// off:u16 - keep top and jump if truthy, else pop
    JumpCondKeep,
    /// off:u16 - keep top and jump if falsy, else pop
    JumpNotCondKeep,

    // Aggregates
    /// n:u8 - pop n values, push a List
    PushList,
    PushMapEmpty,
    /// n:u8, keyIdx:u16*n - pop n values keyed by interned constants
    PushMap,
    /// sid:u8, n:u8, offsets:u8*n - pop n values into a SmallObject
    PushStructInitSmall,
    /// ( list start end -- sublist )
    PushSlice,

    // Indexing
    PushIndex,
    PushReverseIndex,
    SetIndex,

    // Fields
    /// fid:u8
    PushField,
    PushFieldRetain,
    PushFieldParentRelease,
    PushFieldRetainParentRelease,
    SetField,
    ReleaseSetField,

    // Strings
    /// n:u8 - pop n parts, concatenate their string forms
    StringTemplate,

    // Calls
    /// n:u8 - value callee; n includes the callee slot
    Call0,
    Call1,
    /// fid:u8, n:u8
    CallSym0,
    CallSym1,
    /// mid:u8, n:u8 - n includes the receiver
    CallObjSym0,
    CallObjSym1,

    // Closures & lambdas
    /// relPc:u16, nParams:u8, nLocals:u8
    PushLambda,
    /// relPc:u16, nParams:u8, nCaps:u8, nLocals:u8 - captures popped
    PushClosure,

    // Iteration
    /// slot:u8, endOff:u16 - slot SLOT_NONE means no binding
    ForIter,
    /// slot:u8, endOff:u16 - ( start end step -- )
    ForRange,
    /// Terminates a for-loop body region (nested dispatch returns)
    BodyEnd,
    /// Break out of the innermost for-loop
    Break,

    // Returns
    Ret0,
    Ret1,
}

// =============================================================================
// Debug tables
// =============================================================================

/// Maps a pc range to the AST node it was lowered from. Entries are sorted
/// by `pc`; an entry covers from its pc up to the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSym {
    pub pc: u32,
    /// Node of the originating expression/statement
    pub node_id: u32,
    /// Node of the enclosing function; NULL_NODE marks the main frame
    pub frame_node_id: u32,
}

/// A compiler AST node reference: the enclosing function's name (empty for
/// anonymous functions) and the byte offset of the originating token in
/// the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugNode {
    pub name: String,
    pub pos: u32,
}

// =============================================================================
// ByteCodeBuffer
// =============================================================================

/// Everything the VM consumes from the compiler.
///
/// `consts` holds pre-tagged Value bit patterns - floats, singletons, and
/// const-string references into `str_buf`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ByteCodeBuffer {
    pub ops: Vec<u8>,
    pub consts: Vec<u64>,
    pub str_buf: Vec<u8>,
    pub debug_table: Vec<DebugSym>,
    pub debug_nodes: Vec<DebugNode>,
    /// Source text, used only to map token offsets to (line, col)
    pub src: String,
    /// Stack slots the main frame reserves
    pub main_local_size: u32,
}

impl ByteCodeBuffer {
    /// Constant at `idx` as a Value
    #[inline(always)]
    pub fn const_val(&self, idx: usize) -> Value {
        unsafe { Value::from_bits(self.consts[idx]) }
    }

    /// Resolve a const-string value against the pool
    #[inline(always)]
    pub fn const_str(&self, v: Value) -> &str {
        let (start, len) = v.const_str_parts();
        let bytes = &self.str_buf[start as usize..(start + len) as usize];
        // The pool is written from &str only
        unsafe { std::str::from_utf8_unchecked(bytes) }
    }
}

// =============================================================================
// Assembler
// =============================================================================

/// Builds a ByteCodeBuffer the way the collaborating compiler does:
/// opcodes and operands appended in order, constants interned, jump
/// offsets patched after the fact.
pub struct Assembler {
    buf: ByteCodeBuffer,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            buf: ByteCodeBuffer::default(),
        }
    }

    /// Current write position (the next opcode's pc)
    pub fn here(&self) -> usize {
        self.buf.ops.len()
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.buf.ops.push(op.into());
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.ops.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.ops.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Reserve a u16 operand to be patched later; returns its position
    pub fn u16_hole(&mut self) -> usize {
        let at = self.here();
        self.u16(0);
        at
    }

    /// Patch a u16 operand in place
    pub fn patch_u16(&mut self, at: usize, v: u16) {
        self.buf.ops[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// Intern a float constant; returns its index
    pub fn const_float(&mut self, f: f64) -> u16 {
        self.push_const(Value::from_float(f))
    }

    /// Intern a string constant into the pool; returns its index
    pub fn const_str(&mut self, s: &str) -> u16 {
        let start = self.buf.str_buf.len() as u32;
        self.buf.str_buf.extend_from_slice(s.as_bytes());
        self.push_const(Value::const_str(start, s.len() as u32))
    }

    fn push_const(&mut self, v: Value) -> u16 {
        let idx = self.buf.consts.len();
        self.buf.consts.push(v.to_bits());
        idx as u16
    }

    /// Register a debug node; returns its id
    pub fn debug_node(&mut self, name: &str, pos: u32) -> u32 {
        let id = self.buf.debug_nodes.len() as u32;
        self.buf.debug_nodes.push(DebugNode {
            name: name.to_string(),
            pos,
        });
        id
    }

    /// Record a debug symbol covering from `pc` onward
    pub fn debug_sym(&mut self, pc: usize, node_id: u32, frame_node_id: u32) -> &mut Self {
        self.buf.debug_table.push(DebugSym {
            pc: pc as u32,
            node_id,
            frame_node_id,
        });
        self
    }

    pub fn src(&mut self, src: &str) -> &mut Self {
        self.buf.src = src.to_string();
        self
    }

    pub fn finish(mut self, main_local_size: u32) -> ByteCodeBuffer {
        self.buf.main_local_size = main_local_size;
        self.buf
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
