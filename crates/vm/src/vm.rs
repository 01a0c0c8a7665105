//! VM State & Lifecycle
//!
//! A `Vm` owns the value stack, the slab heap, the symbol tables, and the
//! error/trace state. It is strictly single-threaded: one thread of
//! control for the entire `eval` invocation, no suspension points other
//! than native calls, which must be synchronous and must not re-enter the
//! same instance.
//!
//! ## Stack
//!
//! A single contiguous `Value` buffer with a top cursor (`sp`) and a frame
//! pointer (`fp`) indexing the current frame's slot 0. A call frame is
//! `[RetInfo, params.., captures.., locals..]`; the main frame has no
//! RetInfo and its locals start at slot 0. Frames are not separately
//! allocated - the value stack doubles as the call stack.
//!
//! The stack is addressed by index, never by raw pointer, so buffer
//! growth can never invalidate a live reference into it.
//!
//! ## Lifecycle
//!
//! `init` pre-sizes the stack, allocates the first heap page, and
//! registers the core bindings. Between runs, `eval` clears the panic
//! state, resets the stack, and rebinds to the new bytecode buffer
//! without freeing heap pages. `deinit` frees all pages unconditionally
//! and emits the stats report when configured.

use tracing::debug;

use tern_core::object::{
    alloc_capture_spill, list_buffer_from_vec, str_buffer_from, ClosureObj, LambdaObj, ListObj,
    MapKey, MapObj, SmallObj, StrObj, ValueMap, TYPE_STRING,
};
use tern_core::{Heap, HeapObject, Value};

use crate::bytecode::ByteCodeBuffer;
use crate::config::VmConfig;
use crate::error::{RunError, RunResult};
use crate::report::{self, VmStats};
use crate::symbols::{SymbolTables, TypeId};
use crate::trace::{StackTrace, TraceInfo};

/// Minimum stack size reserved at init
pub const INIT_STACK_SIZE: usize = 512;

/// Where `print` output goes
enum PrintSink {
    Stdout,
    Capture(String),
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    /// Top cursor: index of the next free slot
    pub(crate) sp: usize,
    /// Current frame's slot 0
    pub(crate) fp: usize,
    pub(crate) pc: usize,

    /// The buffer bound by the current/most recent `eval`
    pub(crate) buf: ByteCodeBuffer,
    pub(crate) syms: SymbolTables,

    pub(crate) panic_msg: String,
    pub(crate) stack_trace: Option<StackTrace>,

    pub(crate) config: VmConfig,
    trace_enabled: bool,
    peak_stack: usize,
    print_sink: PrintSink,
    deinitialized: bool,
}

impl Vm {
    /// Construct a VM: pre-sized stack, first heap page, core bindings.
    /// Configuration is read from the environment once (see `config`).
    pub fn new() -> Self {
        Self::with_config(VmConfig::from_env())
    }

    /// Construct with explicit configuration (tests, embedders)
    pub fn with_config(config: VmConfig) -> Self {
        let trace_enabled = config.trace;
        let mut vm = Vm {
            heap: Heap::new(),
            stack: vec![Value::none(); INIT_STACK_SIZE],
            sp: 0,
            fp: 0,
            pc: 0,
            buf: ByteCodeBuffer::default(),
            syms: SymbolTables::new(),
            panic_msg: String::new(),
            stack_trace: None,
            config,
            trace_enabled,
            peak_stack: 0,
            print_sink: PrintSink::Stdout,
            deinitialized: false,
        };
        crate::builtins::register(&mut vm);
        vm
    }

    /// Free all heap pages unconditionally and emit the configured stats
    /// report. Still-live reference counts are ignored; leak detection is
    /// `check_memory`'s job.
    pub fn deinit(&mut self) {
        if self.deinitialized {
            return;
        }
        self.deinitialized = true;
        if let Some(report_cfg) = self.config.report.clone() {
            report::emit(&self.stats(), &report_cfg);
        }
        self.heap.deinit();
    }

    // =========================================================================
    // Host API
    // =========================================================================

    /// Drop one reference held by the host
    pub fn release(&mut self, v: Value) {
        self.heap.release(v);
    }

    /// Retain a value on behalf of the host
    pub fn retain(&mut self, v: Value) {
        self.heap.retain(v);
    }

    /// Allocate a heap string; the returned value carries a reference the
    /// host must release
    pub fn alloc_string(&mut self, s: &str) -> RunResult<Value> {
        self.new_string(s)
    }

    /// Message of the most recent panic (empty when none)
    pub fn get_panic_msg(&self) -> &str {
        &self.panic_msg
    }

    /// Stack trace of the most recent panic
    pub fn get_stack_trace(&self) -> Option<&StackTrace> {
        self.stack_trace.as_ref()
    }

    /// Run the cycle-detecting sweep; true iff no cycle was found
    pub fn check_memory(&mut self) -> bool {
        self.heap.check_memory()
    }

    /// Enable or disable retain/release accounting visibility
    pub fn set_trace(&mut self, on: bool) {
        self.trace_enabled = on;
    }

    /// Retain/release counters (meaningful in trace mode; always counted)
    pub fn trace_info(&self) -> TraceInfo {
        TraceInfo {
            num_retains: self.heap.counters.num_retains,
            num_releases: self.heap.counters.num_releases,
        }
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    /// Snapshot of allocation/refcount counters for the report output
    pub fn stats(&self) -> VmStats {
        let c = self.heap.counters;
        VmStats {
            pages_allocated: c.pages_allocated,
            objects_allocated: c.objects_allocated,
            objects_freed: c.objects_freed,
            live_objects: c.live_objects(),
            num_retains: c.num_retains,
            num_releases: c.num_releases,
            cycle_roots_freed: c.cycle_roots_freed,
            peak_stack: self.peak_stack as u64,
        }
    }

    /// Symbol registries (the compiler collaborator populates these)
    pub fn symbols(&mut self) -> &mut SymbolTables {
        &mut self.syms
    }

    /// Capture `print` output instead of writing to stdout
    pub fn set_print_capture(&mut self, on: bool) {
        self.print_sink = if on {
            PrintSink::Capture(String::new())
        } else {
            PrintSink::Stdout
        };
    }

    /// Take everything printed since the last call
    pub fn take_print_output(&mut self) -> String {
        match &mut self.print_sink {
            PrintSink::Capture(buf) => std::mem::take(buf),
            PrintSink::Stdout => String::new(),
        }
    }

    pub(crate) fn print_line(&mut self, s: &str) {
        match &mut self.print_sink {
            PrintSink::Capture(buf) => {
                buf.push_str(s);
                buf.push('\n');
            }
            PrintSink::Stdout => println!("{s}"),
        }
    }

    // =========================================================================
    // Reset (between runs)
    // =========================================================================

    /// Rebind to a new bytecode buffer: clear the panic state, reset the
    /// stack, reserve the main frame's locals. Heap pages survive.
    pub(crate) fn reset(&mut self, buf: &ByteCodeBuffer) {
        debug!(
            ops = buf.ops.len(),
            main_local_size = buf.main_local_size,
            "eval: binding bytecode buffer"
        );
        self.buf = buf.clone();
        self.panic_msg.clear();
        self.stack_trace = None;
        self.pc = 0;
        self.fp = 0;
        self.sp = buf.main_local_size as usize;
        let need = self.sp.max(INIT_STACK_SIZE);
        if self.stack.len() < need {
            self.stack.resize(need, Value::none());
        }
        for slot in &mut self.stack[..self.sp] {
            *slot = Value::none();
        }
    }

    // =========================================================================
    // Stack primitives
    // =========================================================================

    #[inline(always)]
    pub(crate) fn ensure_stack(&mut self, need: usize) {
        if need > self.stack.len() {
            self.stack.resize(need, Value::none());
        }
    }

    #[inline(always)]
    pub(crate) fn push_val(&mut self, v: Value) {
        self.ensure_stack(self.sp + 1);
        self.stack[self.sp] = v;
        self.sp += 1;
        if self.sp > self.peak_stack {
            self.peak_stack = self.sp;
        }
    }

    /// Record a direct `sp` move (frame entry) in the peak-depth stat
    #[inline(always)]
    pub(crate) fn bump_peak(&mut self) {
        if self.sp > self.peak_stack {
            self.peak_stack = self.sp;
        }
    }

    #[inline(always)]
    pub(crate) fn pop_val(&mut self) -> Value {
        debug_assert!(self.sp > 0, "pop on empty stack");
        self.sp -= 1;
        self.stack[self.sp]
    }

    #[inline(always)]
    pub(crate) fn top_val(&self) -> Value {
        self.stack[self.sp - 1]
    }

    #[inline(always)]
    pub(crate) fn frame_slot(&self, slot: u8) -> Value {
        self.stack[self.fp + slot as usize]
    }

    #[inline(always)]
    pub(crate) fn set_frame_slot(&mut self, slot: u8, v: Value) {
        self.stack[self.fp + slot as usize] = v;
    }

    // =========================================================================
    // Panic plumbing
    // =========================================================================

    /// Record a panic message and produce the error to propagate
    pub(crate) fn panic(&mut self, msg: impl Into<String>) -> RunError {
        self.panic_msg = msg.into();
        RunError::Panic
    }

    /// Out-of-bounds variant of `panic` (distinguished for tests)
    pub(crate) fn out_of_bounds(&mut self, msg: impl Into<String>) -> RunError {
        self.panic_msg = msg.into();
        RunError::OutOfBounds
    }

    // =========================================================================
    // Object construction
    // =========================================================================

    fn alloc_slot(&mut self) -> RunResult<*mut HeapObject> {
        self.heap.alloc_object().ok_or(RunError::OutOfMemory)
    }

    /// Build a List from owned element references
    pub fn new_list(&mut self, elems: Vec<Value>) -> RunResult<Value> {
        let (ptr, len, cap) = list_buffer_from_vec(elems);
        let slot = self.alloc_slot()?;
        unsafe {
            (*slot).list = ListObj::new(ptr, len, cap);
        }
        self.heap.note_initial_ref();
        Ok(Value::from_ptr(slot))
    }

    pub fn new_map(&mut self) -> RunResult<Value> {
        let table = Box::into_raw(Box::new(ValueMap::new()));
        let slot = self.alloc_slot()?;
        unsafe {
            (*slot).map = MapObj::new(table);
        }
        self.heap.note_initial_ref();
        Ok(Value::from_ptr(slot))
    }

    pub fn new_string(&mut self, s: &str) -> RunResult<Value> {
        let (ptr, len) = str_buffer_from(s);
        let slot = self.alloc_slot()?;
        unsafe {
            (*slot).string = StrObj::new(ptr, len);
        }
        self.heap.note_initial_ref();
        Ok(Value::from_ptr(slot))
    }

    pub fn new_lambda(&mut self, func_pc: u32, num_params: u8, num_locals: u8) -> RunResult<Value> {
        let slot = self.alloc_slot()?;
        unsafe {
            (*slot).lambda = LambdaObj::new(func_pc, num_params, num_locals);
        }
        self.heap.note_initial_ref();
        Ok(Value::from_ptr(slot))
    }

    /// Build a closure over owned capture references. More than three
    /// captures spill to an owned buffer.
    pub fn new_closure(
        &mut self,
        func_pc: u32,
        num_params: u8,
        caps: &[Value],
        num_locals: u8,
    ) -> RunResult<Value> {
        let mut obj = ClosureObj::new(func_pc, num_params, caps.len() as u8, num_locals);
        if obj.is_spilled() {
            obj.set_spill(alloc_capture_spill(caps));
        } else {
            obj.caps[..caps.len()].copy_from_slice(caps);
        }
        let slot = self.alloc_slot()?;
        unsafe {
            (*slot).closure = obj;
        }
        self.heap.note_initial_ref();
        Ok(Value::from_ptr(slot))
    }

    pub fn new_small_object(&mut self, type_id: TypeId, fields: [Value; 4]) -> RunResult<Value> {
        let mut obj = SmallObj::new(type_id);
        obj.fields = fields;
        let slot = self.alloc_slot()?;
        unsafe {
            (*slot).small = obj;
        }
        self.heap.note_initial_ref();
        Ok(Value::from_ptr(slot))
    }

    // =========================================================================
    // Value inspection
    // =========================================================================

    /// Heap type id of a pointer value
    #[inline(always)]
    pub(crate) fn value_type_id(&self, v: Value) -> Option<TypeId> {
        if v.is_pointer() {
            Some(unsafe { (*v.as_ptr()).type_id() })
        } else {
            None
        }
    }

    /// String content of a const-string or heap-string value
    pub(crate) fn str_value(&self, v: Value) -> Option<&str> {
        if v.is_const_str() {
            return Some(self.buf.const_str(v));
        }
        if v.is_pointer() {
            unsafe {
                let obj = v.as_ptr();
                if (*obj).type_id() == TYPE_STRING {
                    return Some((*obj).string.as_str());
                }
            }
        }
        None
    }

    /// True for both const strings and heap strings
    #[inline(always)]
    pub(crate) fn is_string(&self, v: Value) -> bool {
        v.is_const_str() || self.value_type_id(v) == Some(TYPE_STRING)
    }

    /// Convert a value to a hashable map key; None for unhashable kinds
    pub(crate) fn map_key(&self, v: Value) -> Option<MapKey> {
        if v.is_number() {
            let f = v.as_float();
            if f.is_nan() {
                return None;
            }
            return Some(MapKey::from_number(f));
        }
        if v.is_none() {
            return Some(MapKey::None);
        }
        if v.is_bool() {
            return Some(MapKey::Bool(v.as_bool()));
        }
        self.str_value(v).map(|s| MapKey::Str(s.into()))
    }

    /// Type name for `typeof` and panic messages
    pub(crate) fn type_name_of(&self, v: Value) -> &str {
        if v.is_number() {
            "Number"
        } else if v.is_none() {
            "None"
        } else if v.is_bool() {
            "Bool"
        } else if v.is_const_str() {
            "String"
        } else if let Some(tid) = self.value_type_id(v) {
            self.syms.type_name(tid)
        } else {
            "<unknown>"
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.deinit();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_reserves_stack_and_page() {
        let vm = Vm::with_config(VmConfig::default());
        assert!(vm.stack.len() >= INIT_STACK_SIZE);
        assert_eq!(vm.heap.num_pages(), 1);
    }

    #[test]
    fn test_new_list_and_release() {
        let mut vm = Vm::with_config(VmConfig::default());
        let live_before = vm.heap.live_object_count();
        let s = vm.new_string("elem").expect("alloc");
        let list = vm.new_list(vec![s]).expect("alloc");
        assert_eq!(vm.heap.live_object_count(), live_before + 2);
        vm.release(list);
        assert_eq!(vm.heap.live_object_count(), live_before);
    }

    #[test]
    fn test_str_value_resolves_both_kinds() {
        let mut vm = Vm::with_config(VmConfig::default());
        let heap_str = vm.new_string("on the heap").expect("alloc");
        assert_eq!(vm.str_value(heap_str), Some("on the heap"));
        assert!(vm.is_string(heap_str));
        vm.release(heap_str);

        assert_eq!(vm.str_value(Value::from_float(1.0)), None);
    }

    #[test]
    fn test_map_key_rejects_nan_and_containers() {
        let mut vm = Vm::with_config(VmConfig::default());
        assert!(vm.map_key(Value::from_float(f64::NAN)).is_none());
        assert!(vm.map_key(Value::from_float(1.5)).is_some());
        assert!(vm.map_key(Value::none()).is_some());

        let list = vm.new_list(Vec::new()).expect("alloc");
        assert!(vm.map_key(list).is_none());
        vm.release(list);
    }

    #[test]
    fn test_type_names() {
        let mut vm = Vm::with_config(VmConfig::default());
        assert_eq!(vm.type_name_of(Value::from_float(1.0)), "Number");
        assert_eq!(vm.type_name_of(Value::none()), "None");
        let list = vm.new_list(Vec::new()).expect("alloc");
        assert_eq!(vm.type_name_of(list), "List");
        vm.release(list);
    }

    #[test]
    fn test_deinit_is_idempotent() {
        let mut vm = Vm::with_config(VmConfig::default());
        let _leak = vm.new_string("still live at deinit").expect("alloc");
        vm.deinit();
        vm.deinit();
        assert_eq!(vm.heap.num_pages(), 0);
    }
}
