//! Tern Core: the memory foundation of the Tern VM
//!
//! This crate provides the language-agnostic primitives the interpreter is
//! built on:
//!
//! - `value`: 8-byte NaN-boxed Value (float, none, bools, const string,
//!   heap pointer) plus the raw RetInfo frame record
//! - `object`: 40-byte uniform heap slot and the object kinds that live in
//!   it (List, Map, String, Lambda, Closure, SmallObject, FreeSpan)
//! - `heap`: slab page allocator with an intrusive free-span list,
//!   reference counting, and a cycle-detecting sweep
//! - `memory_stats`: allocation/refcount counters snapshotted for the
//!   report output
//!
//! The interpreter crate (`tern-vm`) layers bytecode dispatch, symbol
//! tables, and the host facade on top of these primitives.

pub mod heap;
pub mod memory_stats;
pub mod object;
pub mod value;

// Re-export key types
pub use heap::{Heap, PAGE_SIZE};
pub use memory_stats::MemoryCounters;
pub use object::{
    ClosureObj, FreeSpan, HeapObject, LambdaObj, ListObj, MapKey, MapObj, ObjHead, SmallObj,
    StrObj, ValueMap, NULL_ID, SENTINEL_ID, TYPE_CLOSURE, TYPE_FIRST_USER, TYPE_LAMBDA, TYPE_LIST,
    TYPE_MAP, TYPE_STRING,
};
pub use value::{RetInfo, Tag, Value, CANONICAL_NAN};
