//! Interpreter Loop
//!
//! A switch-dispatched evaluator over `ops[pc]`. Each opcode decodes its
//! immediate operands, mutates `pc`, `fp`, `sp`, or heap state, and falls
//! through to the next iteration.
//!
//! ## Operand ownership
//!
//! Popped pointer operands are consumed: the opcode releases their stack
//! references after use (the compiler emits `loadRetain` when a local must
//! survive the operation). Slot-addressed operands are borrowed and never
//! released. The field opcodes are the exception: their retain/release
//! behavior is encoded in the opcode variant, and the compiler pairs them.
//!
//! ## Fast paths
//!
//! Arithmetic and comparison specialize on number-number and never error;
//! the fallback paths coerce (`none`/`false` -> 0, `true` -> 1, strings
//! parse-or-0) or panic. No logging happens anywhere in the loop.
//!
//! ## Stack growth
//!
//! Call opcodes pre-check capacity at entry and surface `StackOverflow`
//! with `pc` rewound to the call; `eval_loop_grow_stack` enlarges the
//! stack by one slot and resumes. The stack is addressed by index, so
//! growth never invalidates interpreter state.

use tern_core::object::{TYPE_LIST, TYPE_MAP};
use tern_core::Value;

use crate::builtins::{METHOD_ITERATOR, METHOD_NEXT};
use crate::bytecode::{ByteCodeBuffer, OpCode, SLOT_NONE};
use crate::error::{RunError, RunResult};
use crate::symbols::FieldShape;
use crate::vm::Vm;

impl Vm {
    /// Execute a bytecode buffer to completion. Returns the program's
    /// single result value (or none); the caller owns the returned
    /// reference. On panic, the message and source-mapped stack trace are
    /// available from `get_panic_msg` / `get_stack_trace`.
    pub fn eval(&mut self, buf: &ByteCodeBuffer) -> RunResult<Value> {
        self.reset(buf);
        match self.eval_loop_grow_stack() {
            Ok(()) => {
                let main = self.buf.main_local_size as usize;
                if self.sp == main {
                    Ok(Value::none())
                } else if self.sp == main + 1 {
                    self.sp -= 1;
                    Ok(self.stack[self.sp])
                } else {
                    Err(self.panic(format!(
                        "Stack imbalance at end of program: top {} (expected {} or {})",
                        self.sp,
                        main,
                        main + 1
                    )))
                }
            }
            Err(e @ (RunError::Panic | RunError::OutOfBounds)) => {
                match crate::trace::build_stack_trace(self) {
                    Ok(trace) => {
                        self.stack_trace = Some(trace);
                        Err(e)
                    }
                    Err(trace_err) => Err(trace_err),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Grow-stack driver: a StackOverflow from a call opcode enlarges the
    /// stack by one slot and resumes at the rewound pc. Every other
    /// outcome passes through.
    pub(crate) fn eval_loop_grow_stack(&mut self) -> RunResult {
        loop {
            match self.eval_loop() {
                Err(RunError::StackOverflow) => {
                    let n = self.stack.len() + 1;
                    self.stack.resize(n, Value::none());
                }
                other => return other,
            }
        }
    }

    // =========================================================================
    // Operand decoding
    // =========================================================================

    #[inline(always)]
    fn rd_u8(&mut self) -> u8 {
        let b = self.buf.ops[self.pc];
        self.pc += 1;
        b
    }

    #[inline(always)]
    fn rd_u16(&mut self) -> u16 {
        let v = u16::from_le_bytes([self.buf.ops[self.pc], self.buf.ops[self.pc + 1]]);
        self.pc += 2;
        v
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    fn eval_loop(&mut self) -> RunResult {
        loop {
            let op_pc = self.pc;
            let byte = self.buf.ops[op_pc];
            self.pc += 1;
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => return Err(self.panic(format!("Invalid opcode 0x{byte:02x}"))),
            };

            match op {
                OpCode::End | OpCode::BodyEnd => return Ok(()),
                OpCode::Break => return Err(RunError::ForLoopBreak),

                // =============================================================
                // Literals / load / store
                // =============================================================
                OpCode::PushNone => self.push_val(Value::none()),
                OpCode::PushTrue => self.push_val(Value::from_bool(true)),
                OpCode::PushFalse => self.push_val(Value::from_bool(false)),
                OpCode::PushConst => {
                    let idx = self.rd_u16();
                    let v = self.buf.const_val(idx as usize);
                    self.push_val(v);
                }
                OpCode::Load => {
                    let slot = self.rd_u8();
                    let v = self.frame_slot(slot);
                    self.push_val(v);
                }
                OpCode::LoadRetain => {
                    let slot = self.rd_u8();
                    let v = self.frame_slot(slot);
                    self.heap.retain(v);
                    self.push_val(v);
                }
                OpCode::Set => {
                    let slot = self.rd_u8();
                    let v = self.pop_val();
                    self.set_frame_slot(slot, v);
                }
                OpCode::ReleaseSet => {
                    let slot = self.rd_u8();
                    let old = self.frame_slot(slot);
                    let v = self.pop_val();
                    self.set_frame_slot(slot, v);
                    self.heap.release(old);
                }
                OpCode::SetInitN => {
                    let n = self.rd_u8();
                    for _ in 0..n {
                        let slot = self.rd_u8();
                        self.set_frame_slot(slot, Value::none());
                    }
                }

                // =============================================================
                // Refcounts
                // =============================================================
                OpCode::Retain => {
                    let v = self.top_val();
                    self.heap.retain(v);
                }
                OpCode::Release => {
                    let slot = self.rd_u8();
                    let v = self.frame_slot(slot);
                    self.heap.release(v);
                }
                OpCode::ReleaseN => {
                    let n = self.rd_u8();
                    for _ in 0..n {
                        let slot = self.rd_u8();
                        let v = self.frame_slot(slot);
                        self.heap.release(v);
                    }
                }

                // =============================================================
                // Arithmetic
                // =============================================================
                OpCode::Add => {
                    let b = self.pop_val();
                    let a = self.pop_val();
                    if a.is_number() && b.is_number() {
                        self.push_val(Value::from_float(a.as_float() + b.as_float()));
                    } else if self.is_string(a) || self.is_string(b) {
                        // String concatenation builds a heap string
                        let s = format!("{}{}", self.format_value(a), self.format_value(b));
                        self.heap.release(a);
                        self.heap.release(b);
                        let v = self.new_string(&s)?;
                        self.push_val(v);
                    } else {
                        self.arith_fallback(a, b, |x, y| x + y)?;
                    }
                }
                OpCode::Sub => self.bin_arith(|x, y| x - y)?,
                OpCode::Mul => self.bin_arith(|x, y| x * y)?,
                OpCode::Div => self.bin_arith(|x, y| x / y)?,
                OpCode::Mod => self.bin_arith(|x, y| x % y)?,
                OpCode::Pow => self.bin_arith(f64::powf)?,
                OpCode::Sub1 | OpCode::Sub2 => {
                    let a_op = self.rd_u8();
                    let b_op = self.rd_u8();
                    let (b, b_popped) = self.fused_operand(b_op);
                    let (a, a_popped) = self.fused_operand(a_op);
                    let result = if a.is_number() && b.is_number() {
                        a.as_float() - b.as_float()
                    } else {
                        let x = self.to_float_coerce(a)?;
                        let y = self.to_float_coerce(b)?;
                        x - y
                    };
                    if a_popped {
                        self.heap.release(a);
                    }
                    if b_popped {
                        self.heap.release(b);
                    }
                    self.push_val(Value::from_float(result));
                }
                OpCode::Neg => {
                    let a = self.pop_val();
                    if a.is_number() {
                        self.push_val(Value::from_float(-a.as_float()));
                    } else {
                        let x = self.to_float_coerce(a)?;
                        self.heap.release(a);
                        self.push_val(Value::from_float(-x));
                    }
                }
                OpCode::Not => {
                    let a = self.pop_val();
                    let r = !a.to_bool();
                    self.heap.release(a);
                    self.push_val(Value::from_bool(r));
                }
                OpCode::BitAnd => {
                    let b = self.pop_val();
                    let a = self.pop_val();
                    let x = self.to_float_coerce(a)?;
                    let y = self.to_float_coerce(b)?;
                    self.heap.release(a);
                    self.heap.release(b);
                    self.push_val(Value::from_float(((x as i64) & (y as i64)) as f64));
                }

                // =============================================================
                // Comparison
                // =============================================================
                OpCode::Eq | OpCode::Neq => {
                    let b = self.pop_val();
                    let a = self.pop_val();
                    let eq = self.values_equal(a, b);
                    self.heap.release(a);
                    self.heap.release(b);
                    self.push_val(Value::from_bool(if op == OpCode::Eq { eq } else { !eq }));
                }
                OpCode::Lt | OpCode::Gt | OpCode::Le | OpCode::Ge => {
                    let b = self.pop_val();
                    let a = self.pop_val();
                    let (x, y) = if a.is_number() && b.is_number() {
                        (a.as_float(), b.as_float())
                    } else {
                        (self.to_float_coerce(a)?, self.to_float_coerce(b)?)
                    };
                    self.heap.release(a);
                    self.heap.release(b);
                    let r = match op {
                        OpCode::Lt => x < y,
                        OpCode::Gt => x > y,
                        OpCode::Le => x <= y,
                        _ => x >= y,
                    };
                    self.push_val(Value::from_bool(r));
                }

                // =============================================================
                // Branching (offsets are relative to the opcode's own pc)
                // =============================================================
                OpCode::Jump => {
                    let off = self.rd_u16();
                    self.pc = op_pc + off as usize;
                }
                OpCode::JumpBack => {
                    let off = self.rd_u16();
                    self.pc = op_pc - off as usize;
                }
                OpCode::JumpCond => {
                    let off = self.rd_u16();
                    let v = self.pop_val();
                    let taken = v.to_bool();
                    self.heap.release(v);
                    if taken {
                        self.pc = op_pc + off as usize;
                    }
                }
                OpCode::JumpNotCond => {
                    let off = self.rd_u16();
                    let v = self.pop_val();
                    let taken = !v.to_bool();
                    self.heap.release(v);
                    if taken {
                        self.pc = op_pc + off as usize;
                    }
                }
                OpCode::JumpCondKeep => {
                    let off = self.rd_u16();
                    let v = self.top_val();
                    if v.to_bool() {
                        self.pc = op_pc + off as usize;
                    } else {
                        self.pop_val();
                        self.heap.release(v);
                    }
                }
                OpCode::JumpNotCondKeep => {
                    let off = self.rd_u16();
                    let v = self.top_val();
                    if !v.to_bool() {
                        self.pc = op_pc + off as usize;
                    } else {
                        self.pop_val();
                        self.heap.release(v);
                    }
                }

                // =============================================================
                // Aggregates
                // =============================================================
                OpCode::PushList => {
                    let n = usize::from(self.rd_u8());
                    let elems: Vec<Value> = self.stack[self.sp - n..self.sp].to_vec();
                    self.sp -= n;
                    let v = self.new_list(elems)?;
                    self.push_val(v);
                }
                OpCode::PushMapEmpty => {
                    let v = self.new_map()?;
                    self.push_val(v);
                }
                OpCode::PushMap => {
                    let n = usize::from(self.rd_u8());
                    let mut keys = Vec::with_capacity(n);
                    for _ in 0..n {
                        keys.push(self.rd_u16());
                    }
                    let vals: Vec<Value> = self.stack[self.sp - n..self.sp].to_vec();
                    self.sp -= n;
                    let map_v = self.new_map()?;
                    for (i, &kidx) in keys.iter().enumerate() {
                        let kval = self.buf.const_val(kidx as usize);
                        let Some(key) = self.map_key(kval) else {
                            return Err(self.panic("Invalid map key constant"));
                        };
                        let old = unsafe { (*map_v.as_ptr()).map.table_mut().insert(key, vals[i]) };
                        if let Some(old) = old {
                            self.heap.release(old);
                        }
                    }
                    self.push_val(map_v);
                }
                OpCode::PushStructInitSmall => {
                    let sid = self.rd_u8();
                    let n = usize::from(self.rd_u8());
                    let mut offsets = [0u8; 4];
                    for off in offsets.iter_mut().take(n) {
                        *off = self.rd_u8();
                    }
                    let vals: Vec<Value> = self.stack[self.sp - n..self.sp].to_vec();
                    self.sp -= n;
                    let mut fields = [Value::none(); 4];
                    for i in 0..n {
                        let off = usize::from(offsets[i]);
                        if off >= 4 {
                            return Err(self.panic("Struct field offset out of range"));
                        }
                        fields[off] = vals[i];
                    }
                    let v = self.new_small_object(u32::from(sid), fields)?;
                    self.push_val(v);
                }
                OpCode::PushSlice => self.op_slice()?,

                // =============================================================
                // Indexing
                // =============================================================
                OpCode::PushIndex => self.op_index(false)?,
                OpCode::PushReverseIndex => self.op_index(true)?,
                OpCode::SetIndex => self.op_set_index()?,

                // =============================================================
                // Fields
                // =============================================================
                OpCode::PushField => {
                    let fid = self.rd_u8();
                    self.op_push_field(fid, false, false)?;
                }
                OpCode::PushFieldRetain => {
                    let fid = self.rd_u8();
                    self.op_push_field(fid, true, false)?;
                }
                OpCode::PushFieldParentRelease => {
                    let fid = self.rd_u8();
                    self.op_push_field(fid, false, true)?;
                }
                OpCode::PushFieldRetainParentRelease => {
                    let fid = self.rd_u8();
                    self.op_push_field(fid, true, true)?;
                }
                OpCode::SetField => {
                    let fid = self.rd_u8();
                    self.op_set_field(fid, false)?;
                }
                OpCode::ReleaseSetField => {
                    let fid = self.rd_u8();
                    self.op_set_field(fid, true)?;
                }

                // =============================================================
                // Strings
                // =============================================================
                OpCode::StringTemplate => {
                    let n = usize::from(self.rd_u8());
                    let parts: Vec<Value> = self.stack[self.sp - n..self.sp].to_vec();
                    self.sp -= n;
                    let mut s = String::new();
                    for p in &parts {
                        s.push_str(&self.format_value(*p));
                    }
                    for p in parts {
                        self.heap.release(p);
                    }
                    let v = self.new_string(&s)?;
                    self.push_val(v);
                }

                // =============================================================
                // Calls
                // =============================================================
                OpCode::Call0 | OpCode::Call1 => {
                    let n = self.rd_u8();
                    let num_ret = u8::from(op == OpCode::Call1);
                    self.call_value(n, num_ret, op_pc)?;
                }
                OpCode::CallSym0 | OpCode::CallSym1 => {
                    let fid = self.rd_u8();
                    let n = self.rd_u8();
                    let num_ret = u8::from(op == OpCode::CallSym1);
                    self.call_sym(u32::from(fid), n, num_ret, op_pc)?;
                }
                OpCode::CallObjSym0 | OpCode::CallObjSym1 => {
                    let mid = self.rd_u8();
                    let n = self.rd_u8();
                    let num_ret = u8::from(op == OpCode::CallObjSym1);
                    self.call_obj_sym(u32::from(mid), n, num_ret, op_pc)?;
                }

                // =============================================================
                // Closures & lambdas
                // =============================================================
                OpCode::PushLambda => {
                    let rel = self.rd_u16();
                    let num_params = self.rd_u8();
                    let num_locals = self.rd_u8();
                    let func_pc = (op_pc + rel as usize) as u32;
                    let v = self.new_lambda(func_pc, num_params, num_locals)?;
                    self.push_val(v);
                }
                OpCode::PushClosure => {
                    let rel = self.rd_u16();
                    let num_params = self.rd_u8();
                    let num_caps = usize::from(self.rd_u8());
                    let num_locals = self.rd_u8();
                    let func_pc = (op_pc + rel as usize) as u32;
                    // Capture references transfer from the stack into the
                    // closure
                    let caps: Vec<Value> = self.stack[self.sp - num_caps..self.sp].to_vec();
                    self.sp -= num_caps;
                    let v = self.new_closure(func_pc, num_params, &caps, num_locals)?;
                    self.push_val(v);
                }

                // =============================================================
                // Iteration
                // =============================================================
                OpCode::ForIter => {
                    let slot = self.rd_u8();
                    let end_off = self.rd_u16();
                    let body_pc = self.pc;
                    let end_pc = op_pc + end_off as usize;

                    let iterable = self.pop_val();
                    let iter = self.call_method_for_value(METHOD_ITERATOR, iterable)?;
                    let result = self.for_iter_loop(iter, slot, body_pc);
                    self.heap.release(iter);
                    result?;
                    self.pc = end_pc;
                }
                OpCode::ForRange => {
                    let slot = self.rd_u8();
                    let end_off = self.rd_u16();
                    let body_pc = self.pc;
                    let end_pc = op_pc + end_off as usize;

                    let step_v = self.pop_val();
                    let end_v = self.pop_val();
                    let start_v = self.pop_val();
                    if !(start_v.is_number() && end_v.is_number() && step_v.is_number()) {
                        return Err(self.panic("forRange expects number bounds"));
                    }
                    self.for_range_loop(
                        start_v.as_float(),
                        end_v.as_float(),
                        step_v.as_float(),
                        slot,
                        body_pc,
                    )?;
                    self.pc = end_pc;
                }

                // =============================================================
                // Returns
                // =============================================================
                OpCode::Ret0 => {
                    if !self.pop_stack_frame(0) {
                        return Ok(());
                    }
                }
                OpCode::Ret1 => {
                    if !self.pop_stack_frame(1) {
                        return Ok(());
                    }
                }
            }
        }
    }

    // =========================================================================
    // Arithmetic helpers
    // =========================================================================

    fn bin_arith(&mut self, f: fn(f64, f64) -> f64) -> RunResult {
        let b = self.pop_val();
        let a = self.pop_val();
        if a.is_number() && b.is_number() {
            self.push_val(Value::from_float(f(a.as_float(), b.as_float())));
            Ok(())
        } else {
            self.arith_fallback(a, b, f)
        }
    }

    fn arith_fallback(&mut self, a: Value, b: Value, f: fn(f64, f64) -> f64) -> RunResult {
        let x = self.to_float_coerce(a)?;
        let y = self.to_float_coerce(b)?;
        self.heap.release(a);
        self.heap.release(b);
        self.push_val(Value::from_float(f(x, y)));
        Ok(())
    }

    /// Fused-arithmetic operand: SLOT_NONE pops the stack (consumed),
    /// anything else reads a frame slot (borrowed)
    #[inline(always)]
    fn fused_operand(&mut self, operand: u8) -> (Value, bool) {
        if operand == SLOT_NONE {
            (self.pop_val(), true)
        } else {
            (self.frame_slot(operand), false)
        }
    }

    // =========================================================================
    // Equality
    // =========================================================================

    /// Non-panicking float view used by heterogeneous equality
    fn loose_float(&self, v: Value) -> Option<f64> {
        if let Some(f) = v.to_float() {
            return Some(f);
        }
        self.str_value(v)
            .map(|s| s.trim().parse::<f64>().unwrap_or(0.0))
    }

    pub(crate) fn values_equal(&self, a: Value, b: Value) -> bool {
        if a.is_number() && b.is_number() {
            return a.as_float() == b.as_float();
        }
        if self.is_string(a) && self.is_string(b) {
            return self.str_value(a) == self.str_value(b);
        }
        if a.is_pointer() && b.is_pointer() {
            // Non-string heap objects compare by identity
            return a.to_bits() == b.to_bits();
        }
        if a.is_pointer() || b.is_pointer() {
            return false;
        }
        match (self.loose_float(a), self.loose_float(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    // =========================================================================
    // Indexing helpers
    // =========================================================================

    fn op_index(&mut self, reverse: bool) -> RunResult {
        let idx = self.pop_val();
        let recv = self.pop_val();
        let result = match self.value_type_id(recv) {
            Some(TYPE_LIST) => {
                if !idx.is_number() {
                    return Err(self.panic("List index must be a number"));
                }
                let len = i64::from(unsafe { (*recv.as_ptr()).list.len });
                let raw = idx.as_float() as i64;
                let i = if reverse { len - raw } else { raw };
                if i < 0 || i >= len {
                    return Err(self.out_of_bounds(format!(
                        "Index {i} out of bounds for list of length {len}"
                    )));
                }
                let v = unsafe { (*recv.as_ptr()).list.elems()[i as usize] };
                self.heap.retain(v);
                v
            }
            Some(TYPE_MAP) => {
                // Reverse indexing a map negates a numeric key
                let key_val = if reverse && idx.is_number() {
                    Value::from_float(-idx.as_float())
                } else {
                    idx
                };
                let Some(key) = self.map_key(key_val) else {
                    return Err(self.panic("Invalid map key"));
                };
                let v = unsafe { (*recv.as_ptr()).map.table().get(&key) }.unwrap_or(Value::none());
                self.heap.retain(v);
                v
            }
            _ => {
                let name = self.type_name_of(recv).to_string();
                return Err(self.panic(format!("Cannot index {name}")));
            }
        };
        self.heap.release(recv);
        self.heap.release(idx);
        self.push_val(result);
        Ok(())
    }

    fn op_set_index(&mut self) -> RunResult {
        let val = self.pop_val();
        let idx = self.pop_val();
        let recv = self.pop_val();
        match self.value_type_id(recv) {
            Some(TYPE_LIST) => {
                if !idx.is_number() {
                    return Err(self.panic("List index must be a number"));
                }
                let len = i64::from(unsafe { (*recv.as_ptr()).list.len });
                let i = idx.as_float() as i64;
                if i < 0 || i >= len {
                    return Err(self.out_of_bounds(format!(
                        "Index {i} out of bounds for list of length {len}"
                    )));
                }
                let old = unsafe {
                    let elems = (*recv.as_ptr()).list.elems_mut();
                    std::mem::replace(&mut elems[i as usize], val)
                };
                self.heap.release(old);
            }
            Some(TYPE_MAP) => {
                let Some(key) = self.map_key(idx) else {
                    return Err(self.panic("Invalid map key"));
                };
                let old = unsafe { (*recv.as_ptr()).map.table_mut().insert(key, val) };
                if let Some(old) = old {
                    self.heap.release(old);
                }
            }
            _ => {
                let name = self.type_name_of(recv).to_string();
                return Err(self.panic(format!("Cannot index {name}")));
            }
        }
        self.heap.release(recv);
        self.heap.release(idx);
        Ok(())
    }

    fn op_slice(&mut self) -> RunResult {
        let end_v = self.pop_val();
        let start_v = self.pop_val();
        let recv = self.pop_val();
        if self.value_type_id(recv) != Some(TYPE_LIST) {
            let name = self.type_name_of(recv).to_string();
            return Err(self.panic(format!("Cannot slice {name}")));
        }
        let len = i64::from(unsafe { (*recv.as_ptr()).list.len });

        // Python-like negative-index adjustment; none means open end
        let resolve = |v: Value, default: i64| -> Option<i64> {
            if v.is_none() {
                Some(default)
            } else if v.is_number() {
                let raw = v.as_float() as i64;
                Some(if raw < 0 { len + raw } else { raw })
            } else {
                None
            }
        };
        let (Some(s), Some(e)) = (resolve(start_v, 0), resolve(end_v, len)) else {
            return Err(self.panic("Slice bounds must be numbers"));
        };
        if s < 0 || e > len || s > e {
            return Err(self.out_of_bounds(format!(
                "Slice {s}..{e} out of bounds for list of length {len}"
            )));
        }

        let elems: Vec<Value> =
            unsafe { (*recv.as_ptr()).list.elems()[s as usize..e as usize].to_vec() };
        for &v in &elems {
            self.heap.retain(v);
        }
        let out = self.new_list(elems)?;
        self.heap.release(recv);
        self.push_val(out);
        Ok(())
    }

    // =========================================================================
    // Field helpers
    // =========================================================================

    fn field_value(&mut self, recv: Value, fid: u8) -> RunResult<Value> {
        let shape = self.syms.field_syms[usize::from(fid)].shape;
        if let FieldShape::OneType {
            type_id,
            field_idx,
            is_small_object,
        } = shape
        {
            if is_small_object && self.value_type_id(recv) == Some(type_id) {
                return Ok(unsafe { (*recv.as_ptr()).small.fields[usize::from(field_idx)] });
            }
        }
        if self.value_type_id(recv) == Some(TYPE_MAP) {
            let name = self.syms.field_syms[usize::from(fid)].name.clone();
            let got = unsafe {
                (*recv.as_ptr())
                    .map
                    .table()
                    .get(&tern_core::MapKey::Str(name.into()))
            };
            return Ok(got.unwrap_or(Value::none()));
        }
        let name = self.syms.field_syms[usize::from(fid)].name.clone();
        Err(self.panic(format!("Missing field: {name}")))
    }

    fn op_push_field(&mut self, fid: u8, retain: bool, parent_release: bool) -> RunResult {
        let recv = self.pop_val();
        let v = self.field_value(recv, fid)?;
        if retain {
            self.heap.retain(v);
        }
        if parent_release {
            self.heap.release(recv);
        }
        self.push_val(v);
        Ok(())
    }

    fn op_set_field(&mut self, fid: u8, release_old: bool) -> RunResult {
        let val = self.pop_val();
        let recv = self.pop_val();
        let shape = self.syms.field_syms[usize::from(fid)].shape;
        if let FieldShape::OneType {
            type_id,
            field_idx,
            is_small_object,
        } = shape
        {
            if is_small_object && self.value_type_id(recv) == Some(type_id) {
                let old = unsafe {
                    std::mem::replace(
                        &mut (*recv.as_ptr()).small.fields[usize::from(field_idx)],
                        val,
                    )
                };
                if release_old {
                    self.heap.release(old);
                }
                return Ok(());
            }
        }
        if self.value_type_id(recv) == Some(TYPE_MAP) {
            let name = self.syms.field_syms[usize::from(fid)].name.clone();
            let old = unsafe {
                (*recv.as_ptr())
                    .map
                    .table_mut()
                    .insert(tern_core::MapKey::Str(name.into()), val)
            };
            if let (Some(old), true) = (old, release_old) {
                self.heap.release(old);
            }
            return Ok(());
        }
        let name = self.syms.field_syms[usize::from(fid)].name.clone();
        Err(self.panic(format!("Missing field: {name}")))
    }

    // =========================================================================
    // For-loop protocols
    // =========================================================================

    /// Run one loop-body region as a nested dispatch; Ok(false) means the
    /// body executed `break`
    fn run_loop_body(&mut self, body_pc: usize) -> RunResult<bool> {
        self.pc = body_pc;
        match self.eval_loop_grow_stack() {
            Ok(()) => Ok(true),
            Err(RunError::ForLoopBreak) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn for_iter_loop(&mut self, iter: Value, slot: u8, body_pc: usize) -> RunResult {
        loop {
            // next() consumes a receiver reference per call
            self.heap.retain(iter);
            let next = self.call_method_for_value(METHOD_NEXT, iter)?;
            if next.is_none() {
                return Ok(());
            }
            if slot != SLOT_NONE {
                let old = self.frame_slot(slot);
                self.set_frame_slot(slot, next);
                self.heap.release(old);
            } else {
                self.heap.release(next);
            }
            if !self.run_loop_body(body_pc)? {
                return Ok(());
            }
        }
    }

    fn for_range_loop(
        &mut self,
        start: f64,
        end: f64,
        step: f64,
        slot: u8,
        body_pc: usize,
    ) -> RunResult {
        let ascending = start <= end;
        let step = if step == 0.0 { 1.0 } else { step.abs() };
        let mut i = start;
        while if ascending { i < end } else { i > end } {
            if slot != SLOT_NONE {
                let old = self.frame_slot(slot);
                self.set_frame_slot(slot, Value::from_float(i));
                self.heap.release(old);
            }
            if !self.run_loop_body(body_pc)? {
                break;
            }
            i += if ascending { step } else { -step };
        }
        Ok(())
    }
}
