//! Dispatch & Calls
//!
//! Call ABI: arguments are pushed in order, followed by the callee for
//! value calls (`call0`/`call1`, where `num_args` includes the callee
//! slot). The new frame pointer is `sp - num_args`; the args shift up one
//! slot to make room for the RetInfo written at the frame's slot 0, and
//! closure captures are copied (retained) into the slots after the
//! parameters, so the callee value itself can be released at entry.
//!
//! Return ABI: `pop_stack_frame` reconciles what the callee produced with
//! what the call site required, then restores `pc` and `fp` from the
//! RetInfo. The continue flag distinguishes calls made from bytecode
//! (dispatch continues in the caller) from calls made by the interpreter
//! itself (the nested dispatch loop exits).
//!
//! Method dispatch walks the inline-cache shapes: `empty` falls back to
//! map-by-name when the receiver is a Map, `oneType` hits or panics,
//! `manyTypes` consults the MRU entry first and the side table on an MRU
//! miss, flipping the MRU to the receiver's type.

use tern_core::object::{MapKey, TYPE_CLOSURE, TYPE_LAMBDA, TYPE_MAP, TYPE_STRING};
use tern_core::{RetInfo, Value};

use crate::error::{RunError, RunResult};
use crate::symbols::{FuncId, FuncSymbol, MethodEntry, MethodId, MethodShape, TypeId};
use crate::vm::Vm;

/// Spare slots every frame is guaranteed beyond its locals, so return
/// reconciliation can write required slots without a capacity check
pub const FRAME_SPARE_SLOTS: usize = 2;

impl Vm {
    // =========================================================================
    // Return ABI
    // =========================================================================

    /// Pop the current frame, reconciling produced vs. required return
    /// values. Returns the RetInfo continue flag: false means the frame
    /// was entered by the interpreter itself and dispatch must exit.
    pub(crate) fn pop_stack_frame(&mut self, num_produced: u8) -> bool {
        let ri = self.stack[self.fp].as_ret_info();
        let required = ri.num_ret;

        if num_produced == required {
            if num_produced == 1 {
                self.stack[self.fp] = self.stack[self.sp - 1];
            }
            self.sp = self.fp + usize::from(num_produced);
        } else if num_produced == 0 {
            // Caller wants values the callee never produced: fill with
            // none. The frame's spare slots guarantee capacity up to
            // FRAME_SPARE_SLOTS; beyond that, grow.
            let needed = self.fp + usize::from(required);
            if usize::from(required) > FRAME_SPARE_SLOTS {
                self.ensure_stack(needed);
            }
            for i in 0..usize::from(required) {
                self.stack[self.fp + i] = Value::none();
            }
            self.sp = needed;
        } else {
            // Produced a value nobody wants
            let v = self.stack[self.sp - 1];
            self.heap.release(v);
            self.sp = self.fp;
        }

        self.pc = ri.pc as usize;
        self.fp = ri.fp as usize;
        ri.cont
    }

    // =========================================================================
    // Frame entry
    // =========================================================================

    /// Set up a user-function frame over the top `num_args` stack values
    /// (plus the callee slot when `has_callee`). On success, `pc`/`fp`/
    /// `sp` address the callee; on StackOverflow, `pc` is rewound to
    /// `op_pc` so the grow-stack driver can retry the call opcode.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn enter_user_frame(
        &mut self,
        func_pc: u32,
        num_params: u8,
        caps: &[Value],
        num_locals: u8,
        num_args: u8,
        has_callee: bool,
        num_ret: u8,
        op_pc: usize,
        cont: bool,
    ) -> RunResult {
        let k = usize::from(num_args) - usize::from(has_callee);
        if k != usize::from(num_params) {
            return Err(self.panic(format!(
                "Expected {num_params} arguments, got {k}"
            )));
        }

        let fp_new = self.sp - usize::from(num_args);
        let frame_size = 1 + k + caps.len() + usize::from(num_locals);
        if fp_new + frame_size + FRAME_SPARE_SLOTS > self.stack.len() {
            self.pc = op_pc;
            return Err(RunError::StackOverflow);
        }

        let callee = if has_callee {
            Some(self.stack[self.sp - 1])
        } else {
            None
        };

        // Shift args up one slot; RetInfo takes the frame's slot 0. For
        // value calls the callee slot is absorbed by the last argument.
        for i in (fp_new + 1..=fp_new + k).rev() {
            self.stack[i] = self.stack[i - 1];
        }
        self.stack[fp_new] = Value::from_ret_info(RetInfo {
            pc: self.pc as u32,
            fp: self.fp as u32,
            num_ret,
            cont,
        });

        // Captures are copied into the frame so the closure itself need
        // not outlive the call
        for (i, &cap) in caps.iter().enumerate() {
            self.stack[fp_new + 1 + k + i] = cap;
            self.heap.retain(cap);
        }
        for i in fp_new + 1 + k + caps.len()..fp_new + frame_size {
            self.stack[i] = Value::none();
        }

        if let Some(callee) = callee {
            self.heap.release(callee);
        }

        self.fp = fp_new;
        self.sp = fp_new + frame_size;
        self.bump_peak();
        self.pc = func_pc as usize;
        Ok(())
    }

    // =========================================================================
    // Value calls (call0 / call1)
    // =========================================================================

    /// Call the value on top of the stack; `num_args` includes the callee
    /// slot.
    pub(crate) fn call_value(&mut self, num_args: u8, num_ret: u8, op_pc: usize) -> RunResult {
        let callee = self.stack[self.sp - 1];
        match self.value_type_id(callee) {
            Some(TYPE_LAMBDA) => {
                let l = unsafe { (*callee.as_ptr()).lambda };
                self.enter_user_frame(
                    l.func_pc,
                    l.num_params,
                    &[],
                    l.num_locals,
                    num_args,
                    true,
                    num_ret,
                    op_pc,
                    true,
                )
            }
            Some(TYPE_CLOSURE) => {
                let c = unsafe { (*callee.as_ptr()).closure };
                let caps: Vec<Value> = unsafe { c.captures().to_vec() };
                self.enter_user_frame(
                    c.func_pc,
                    c.num_params,
                    &caps,
                    c.num_locals,
                    num_args,
                    true,
                    num_ret,
                    op_pc,
                    true,
                )
            }
            _ => {
                let name = self.type_name_of(callee).to_string();
                Err(self.panic(format!("Value is not callable: {name}")))
            }
        }
    }

    // =========================================================================
    // Function-symbol calls (callSym0 / callSym1)
    // =========================================================================

    pub(crate) fn call_sym(
        &mut self,
        fid: FuncId,
        num_args: u8,
        num_ret: u8,
        op_pc: usize,
    ) -> RunResult {
        let sym = self.syms.func_syms[fid as usize];
        match sym {
            FuncSymbol::None => {
                let name = self.syms.func_name(fid).to_string();
                Err(self.panic(format!("Missing function symbol: {name}")))
            }
            FuncSymbol::User {
                pc,
                num_params,
                num_locals,
            } => self.enter_user_frame(
                pc, num_params, &[], num_locals, num_args, false, num_ret, op_pc, true,
            ),
            FuncSymbol::Native(f) => {
                let n = usize::from(num_args);
                let args: Vec<Value> = self.stack[self.sp - n..self.sp].to_vec();
                self.sp -= n;
                let res = f(self, &args);
                if num_ret == 1 {
                    self.push_val(res);
                } else {
                    self.heap.release(res);
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // Method-symbol calls (callObjSym0 / callObjSym1)
    // =========================================================================

    /// Type id a receiver dispatches on; const strings dispatch as String
    #[inline(always)]
    pub(crate) fn dispatch_type_id(&self, v: Value) -> Option<TypeId> {
        if v.is_const_str() {
            Some(TYPE_STRING)
        } else {
            self.value_type_id(v)
        }
    }

    /// Resolve a method entry through the cache shapes, flipping the MRU
    /// on a manyTypes table hit. Errors are the §dispatch panics.
    pub(crate) fn resolve_method(&mut self, tid: TypeId, mid: MethodId) -> RunResult<MethodEntry> {
        enum Resolved {
            Hit(MethodEntry),
            TableLookup,
            Miss,
        }
        let resolved = match self.syms.method_syms[mid as usize].shape {
            MethodShape::Empty => Resolved::Miss,
            MethodShape::OneType { type_id, entry } => {
                if type_id == tid {
                    Resolved::Hit(entry)
                } else {
                    Resolved::Miss
                }
            }
            MethodShape::ManyTypes {
                mru_type_id,
                mru_entry,
            } => {
                if mru_type_id == tid {
                    Resolved::Hit(mru_entry)
                } else {
                    Resolved::TableLookup
                }
            }
        };
        match resolved {
            Resolved::Hit(entry) => Ok(entry),
            Resolved::TableLookup => {
                if let Some(&entry) = self.syms.method_table.get(&(tid, mid)) {
                    self.syms.method_syms[mid as usize].shape = MethodShape::ManyTypes {
                        mru_type_id: tid,
                        mru_entry: entry,
                    };
                    Ok(entry)
                } else {
                    Err(self.missing_method(mid))
                }
            }
            Resolved::Miss => Err(self.missing_method(mid)),
        }
    }

    fn missing_method(&mut self, mid: MethodId) -> RunError {
        let name = self.syms.method_name(mid).to_string();
        self.panic(format!("Missing function symbol: {name}"))
    }

    pub(crate) fn call_obj_sym(
        &mut self,
        mid: MethodId,
        num_args: u8,
        num_ret: u8,
        op_pc: usize,
    ) -> RunResult {
        let n = usize::from(num_args);
        let recv = self.stack[self.sp - n];

        let tid = self.dispatch_type_id(recv);

        // Empty shape falls back to map-by-name before panicking
        if matches!(
            self.syms.method_syms[mid as usize].shape,
            MethodShape::Empty
        ) {
            if tid == Some(TYPE_MAP) {
                return self.call_map_entry(mid, recv, num_args, num_ret, op_pc);
            }
            return Err(self.missing_method(mid));
        }

        let Some(tid) = tid else {
            return Err(self.missing_method(mid));
        };
        let entry = self.resolve_method(tid, mid)?;
        self.dispatch_entry(entry, recv, num_args, num_ret, op_pc)
    }

    fn dispatch_entry(
        &mut self,
        entry: MethodEntry,
        recv: Value,
        num_args: u8,
        num_ret: u8,
        op_pc: usize,
    ) -> RunResult {
        let n = usize::from(num_args);
        match entry {
            MethodEntry::User {
                pc,
                num_params,
                num_locals,
            } => {
                // The receiver is parameter 0; its stack reference is
                // live for the whole frame, which keeps rc >= 1
                self.enter_user_frame(
                    pc, num_params, &[], num_locals, num_args, false, num_ret, op_pc, true,
                )
            }
            MethodEntry::Native1(f) => {
                self.heap.retain(recv);
                let args: Vec<Value> = self.stack[self.sp - n + 1..self.sp].to_vec();
                self.sp -= n;
                let res = f(self, recv, &args);
                self.heap.release(recv);
                if num_ret == 1 {
                    self.push_val(res);
                } else {
                    self.heap.release(res);
                }
                Ok(())
            }
            MethodEntry::Native2(f) => {
                self.heap.retain(recv);
                let args: Vec<Value> = self.stack[self.sp - n + 1..self.sp].to_vec();
                self.sp -= n;
                let (r0, r1) = f(self, recv, &args);
                self.heap.release(recv);
                self.push_val(r0);
                self.push_val(r1);
                Ok(())
            }
        }
    }

    /// Map receivers resolve missing methods by name: the entry value
    /// must be a lambda or closure, called with the receiver as
    /// parameter 0.
    fn call_map_entry(
        &mut self,
        mid: MethodId,
        recv: Value,
        num_args: u8,
        num_ret: u8,
        op_pc: usize,
    ) -> RunResult {
        let name = self.syms.method_name(mid).to_string();
        let key = MapKey::Str(name.as_str().into());
        let entry = unsafe { (*recv.as_ptr()).map.table().get(&key) };
        let Some(callee) = entry else {
            return Err(self.missing_method(mid));
        };
        match self.value_type_id(callee) {
            Some(TYPE_LAMBDA) => {
                let l = unsafe { (*callee.as_ptr()).lambda };
                self.enter_user_frame(
                    l.func_pc,
                    l.num_params,
                    &[],
                    l.num_locals,
                    num_args,
                    false,
                    num_ret,
                    op_pc,
                    true,
                )
            }
            Some(TYPE_CLOSURE) => {
                let c = unsafe { (*callee.as_ptr()).closure };
                let caps: Vec<Value> = unsafe { c.captures().to_vec() };
                self.enter_user_frame(
                    c.func_pc,
                    c.num_params,
                    &caps,
                    c.num_locals,
                    num_args,
                    false,
                    num_ret,
                    op_pc,
                    true,
                )
            }
            _ => Err(self.panic(format!("Map entry is not callable: {name}"))),
        }
    }

    // =========================================================================
    // Interpreter-initiated calls (for-loop protocols)
    // =========================================================================

    /// Call a zero-argument method on `recv` and return its single result.
    /// The caller transfers one receiver reference into the call. User
    /// functions run as a nested dispatch loop that exits when the frame
    /// pops (continue flag false).
    pub(crate) fn call_method_for_value(&mut self, mid: MethodId, recv: Value) -> RunResult<Value> {
        let Some(tid) = self.dispatch_type_id(recv) else {
            return Err(self.missing_method(mid));
        };
        let entry = self.resolve_method(tid, mid)?;
        match entry {
            MethodEntry::Native1(f) => {
                self.heap.retain(recv);
                let res = f(self, recv, &[]);
                self.heap.release(recv);
                Ok(res)
            }
            MethodEntry::Native2(f) => {
                self.heap.retain(recv);
                let (r0, r1) = f(self, recv, &[]);
                self.heap.release(recv);
                self.heap.release(r1);
                Ok(r0)
            }
            MethodEntry::User {
                pc,
                num_params,
                num_locals,
            } => {
                if num_params != 1 {
                    return Err(self.panic(format!(
                        "Expected 1 argument, got {num_params}"
                    )));
                }
                let fp_new = self.sp;
                let frame_size = 1 + 1 + usize::from(num_locals);
                self.ensure_stack(fp_new + frame_size + FRAME_SPARE_SLOTS);
                self.stack[fp_new] = Value::from_ret_info(RetInfo {
                    pc: self.pc as u32,
                    fp: self.fp as u32,
                    num_ret: 1,
                    cont: false,
                });
                self.stack[fp_new + 1] = recv;
                for i in fp_new + 2..fp_new + frame_size {
                    self.stack[i] = Value::none();
                }
                self.fp = fp_new;
                self.sp = fp_new + frame_size;
                self.bump_peak();
                self.pc = pc as usize;

                self.eval_loop_grow_stack()?;

                // pop_stack_frame already restored pc/fp and parked the
                // result at the old frame base
                let result = self.stack[fp_new];
                self.sp = fp_new;
                Ok(result)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
