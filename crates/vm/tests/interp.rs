//! End-to-end interpreter tests over hand-assembled bytecode
//!
//! These drive the dispatch loop the way the collaborating compiler
//! would: programs are built with the Assembler, symbols registered
//! through the VM's registries, and results observed through the host
//! facade (print capture, panic message, stack trace, heap counters).

use tern_vm::bytecode::SLOT_NONE;
use tern_vm::config::VmConfig;
use tern_vm::symbols::{FuncSymbol, MethodEntry, MethodShape};
use tern_vm::{Assembler, OpCode, RunError, Vm, NULL_NODE};

fn test_vm() -> Vm {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut vm = Vm::with_config(VmConfig::default());
    vm.set_print_capture(true);
    vm
}

fn print_fid(vm: &mut Vm) -> u8 {
    vm.symbols().ensure_func_sym("print") as u8
}

// =============================================================================
// Arithmetic
// =============================================================================

#[test]
fn test_arithmetic_precedence_fast_path() {
    // print 1 + 2 * 3  ->  7 (as lowered: mul binds tighter)
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let c1 = asm.const_float(1.0);
    let c2 = asm.const_float(2.0);
    let c3 = asm.const_float(3.0);
    asm.op(OpCode::PushConst).u16(c1);
    asm.op(OpCode::PushConst).u16(c2);
    asm.op(OpCode::PushConst).u16(c3);
    asm.op(OpCode::Mul);
    asm.op(OpCode::Add);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(0);

    let result = vm.eval(&buf).expect("program runs");
    assert!(result.is_none());
    assert_eq!(vm.take_print_output(), "7\n");
}

#[test]
fn test_arithmetic_bool_fallback_coercion() {
    // true - none  ->  1 (fallback table: true -> 1, none -> 0)
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    asm.op(OpCode::PushTrue);
    asm.op(OpCode::PushNone);
    asm.op(OpCode::Sub);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(0);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "1\n");
}

#[test]
fn test_string_concat_via_add() {
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let hello = asm.const_str("answer=");
    let n = asm.const_float(42.0);
    asm.op(OpCode::PushConst).u16(hello);
    asm.op(OpCode::PushConst).u16(n);
    asm.op(OpCode::Add);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(0);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "answer=42\n");
    // The concatenated heap string was released by print
    assert!(vm.check_memory());
}

#[test]
fn test_fused_sub_slot_and_stack_operands() {
    // frame[0] = 10; push 4; sub1 slot0, top  ->  6
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let ten = asm.const_float(10.0);
    let four = asm.const_float(4.0);
    asm.op(OpCode::PushConst).u16(ten);
    asm.op(OpCode::Set).u8(0);
    asm.op(OpCode::PushConst).u16(four);
    asm.op(OpCode::Sub1).u8(0).u8(SLOT_NONE);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(1);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "6\n");
}

// =============================================================================
// Comparison & branching
// =============================================================================

#[test]
fn test_branch_on_comparison() {
    // if 2 < 3 { print 1 } else { print 0 }
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let c2 = asm.const_float(2.0);
    let c3 = asm.const_float(3.0);
    let one = asm.const_float(1.0);
    let zero = asm.const_float(0.0);

    asm.op(OpCode::PushConst).u16(c2);
    asm.op(OpCode::PushConst).u16(c3);
    asm.op(OpCode::Lt);
    let branch_pc = asm.here();
    asm.op(OpCode::JumpNotCond);
    let else_hole = asm.u16_hole();
    asm.op(OpCode::PushConst).u16(one);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    let skip_pc = asm.here();
    asm.op(OpCode::Jump);
    let end_hole = asm.u16_hole();
    let else_pc = asm.here();
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    let end_pc = asm.here();
    asm.op(OpCode::End);

    asm.patch_u16(else_hole, (else_pc - branch_pc) as u16);
    asm.patch_u16(end_hole, (end_pc - skip_pc) as u16);
    let buf = asm.finish(0);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "1\n");
}

#[test]
fn test_short_circuit_keep_jumps() {
    // false or 9: jumpNotCondKeep pops the false, leaves 9
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let nine = asm.const_float(9.0);
    asm.op(OpCode::PushFalse);
    let jpc = asm.here();
    asm.op(OpCode::JumpCondKeep);
    let hole = asm.u16_hole();
    asm.op(OpCode::PushConst).u16(nine);
    let after = asm.here();
    asm.patch_u16(hole, (after - jpc) as u16);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(0);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "9\n");
}

// =============================================================================
// Lists: build, index, slice (scenario: a = [10,20,30,40])
// =============================================================================

#[test]
fn test_list_reverse_index_and_slice() {
    // a = [10,20,30,40]; print a[-1]; print a[1..3]
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let c10 = asm.const_float(10.0);
    let c20 = asm.const_float(20.0);
    let c30 = asm.const_float(30.0);
    let c40 = asm.const_float(40.0);
    let one = asm.const_float(1.0);
    let three = asm.const_float(3.0);

    asm.op(OpCode::PushConst).u16(c10);
    asm.op(OpCode::PushConst).u16(c20);
    asm.op(OpCode::PushConst).u16(c30);
    asm.op(OpCode::PushConst).u16(c40);
    asm.op(OpCode::PushList).u8(4);
    asm.op(OpCode::Set).u8(0);

    // a[-1] lowers to reverse index 1
    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::PushConst).u16(one);
    asm.op(OpCode::PushReverseIndex);
    asm.op(OpCode::CallSym0).u8(print).u8(1);

    // a[1..3]
    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::PushConst).u16(one);
    asm.op(OpCode::PushConst).u16(three);
    asm.op(OpCode::PushSlice);
    asm.op(OpCode::CallSym0).u8(print).u8(1);

    asm.op(OpCode::Release).u8(0);
    asm.op(OpCode::End);
    let buf = asm.finish(1);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "40\n[20,30]\n");
    assert!(vm.check_memory());
    assert_eq!(vm.stats().live_objects, 0);
}

#[test]
fn test_list_index_out_of_bounds_panics() {
    let mut vm = test_vm();

    let mut asm = Assembler::new();
    let c10 = asm.const_float(10.0);
    let c9 = asm.const_float(9.0);
    let node = asm.debug_node("", 0);
    asm.op(OpCode::PushConst).u16(c10);
    asm.op(OpCode::PushList).u8(1);
    asm.op(OpCode::PushConst).u16(c9);
    asm.debug_sym(0, node, NULL_NODE);
    asm.op(OpCode::PushIndex);
    asm.op(OpCode::End);
    let buf = asm.finish(0);

    let err = vm.eval(&buf).unwrap_err();
    assert_eq!(err, RunError::OutOfBounds);
    assert!(vm.get_panic_msg().contains("out of bounds"));
}

#[test]
fn test_set_index_replaces_and_releases() {
    // a = ["old"]; a[0] = "new"; print a[0]
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let old_s = asm.const_str("old");
    let new_s = asm.const_str("new");
    let zero = asm.const_float(0.0);

    asm.op(OpCode::PushConst).u16(old_s);
    asm.op(OpCode::PushList).u8(1);
    asm.op(OpCode::Set).u8(0);

    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::PushConst).u16(new_s);
    asm.op(OpCode::SetIndex);

    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::PushIndex);
    asm.op(OpCode::CallSym0).u8(print).u8(1);

    asm.op(OpCode::Release).u8(0);
    asm.op(OpCode::End);
    let buf = asm.finish(1);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "new\n");
    assert_eq!(vm.stats().live_objects, 0);
}

// =============================================================================
// Maps
// =============================================================================

#[test]
fn test_map_literal_and_lookup() {
    // m = {x: 1, y: 2}; print m["y"]; print m.size()
    let mut vm = test_vm();
    let print = print_fid(&mut vm);
    let size_mid = vm.symbols().ensure_method_sym("size") as u8;

    let mut asm = Assembler::new();
    let kx = asm.const_str("x");
    let ky = asm.const_str("y");
    let one = asm.const_float(1.0);
    let two = asm.const_float(2.0);

    asm.op(OpCode::PushConst).u16(one);
    asm.op(OpCode::PushConst).u16(two);
    asm.op(OpCode::PushMap).u8(2);
    asm.u16(kx);
    asm.u16(ky);
    asm.op(OpCode::Set).u8(0);

    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::PushConst).u16(ky);
    asm.op(OpCode::PushIndex);
    asm.op(OpCode::CallSym0).u8(print).u8(1);

    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::CallObjSym1).u8(size_mid).u8(1);
    asm.op(OpCode::CallSym0).u8(print).u8(1);

    asm.op(OpCode::Release).u8(0);
    asm.op(OpCode::End);
    let buf = asm.finish(1);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "2\n2\n");
    assert_eq!(vm.stats().live_objects, 0);
}

#[test]
fn test_map_method_fallback_by_name() {
    // m = {}; m["greet"] = lambda(self): 42; m.greet()
    let mut vm = test_vm();
    let print = print_fid(&mut vm);
    let greet = vm.symbols().ensure_method_sym("greet") as u8;

    let mut asm = Assembler::new();
    let key = asm.const_str("greet");
    let c42 = asm.const_float(42.0);

    asm.op(OpCode::PushMapEmpty);
    asm.op(OpCode::Set).u8(0);

    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::PushConst).u16(key);
    let lambda_pc = asm.here();
    asm.op(OpCode::PushLambda);
    let body_hole = asm.u16_hole();
    asm.u8(1).u8(0);
    asm.op(OpCode::SetIndex);

    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::CallObjSym1).u8(greet).u8(1);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::Release).u8(0);
    asm.op(OpCode::End);

    // greet body: frame [ret, self(map)]
    let body_pc = asm.here();
    asm.op(OpCode::Release).u8(1);
    asm.op(OpCode::PushConst).u16(c42);
    asm.op(OpCode::Ret1);
    asm.patch_u16(body_hole, (body_pc - lambda_pc) as u16);
    let buf = asm.finish(1);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "42\n");
    assert_eq!(vm.stats().live_objects, 0);
}

#[test]
fn test_set_init_and_release_n() {
    // Bulk-init two locals, store a heap string in one, bulk-release both
    let mut vm = test_vm();

    let mut asm = Assembler::new();
    let hello = asm.const_str("hello ");
    let world = asm.const_str("world");
    asm.op(OpCode::SetInitN).u8(2).u8(0).u8(1);
    asm.op(OpCode::PushConst).u16(hello);
    asm.op(OpCode::PushConst).u16(world);
    asm.op(OpCode::Add); // heap string
    asm.op(OpCode::Set).u8(0);
    asm.op(OpCode::ReleaseN).u8(2).u8(0).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(2);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.stats().live_objects, 0);
}

#[test]
fn test_map_missing_key_yields_none() {
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let missing = asm.const_str("missing");
    asm.op(OpCode::PushMapEmpty);
    asm.op(OpCode::PushConst).u16(missing);
    asm.op(OpCode::PushIndex);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(0);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "none\n");
}

// =============================================================================
// Closures (scenario: f = (n => (x => x + n))(10); print f(5))
// =============================================================================

#[test]
fn test_closure_capture_and_call() {
    let mut vm = test_vm();
    vm.set_trace(true);
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let ten = asm.const_float(10.0);
    let five = asm.const_float(5.0);

    // main
    asm.op(OpCode::PushConst).u16(ten);
    let lambda_pc = asm.here();
    asm.op(OpCode::PushLambda);
    let outer_hole = asm.u16_hole();
    asm.u8(1).u8(0);
    asm.op(OpCode::Call1).u8(2);
    asm.op(OpCode::Set).u8(0);

    asm.op(OpCode::PushConst).u16(five);
    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::Call1).u8(2);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::Release).u8(0);
    asm.op(OpCode::End);

    // outer: n => closure capturing n
    let outer_pc = asm.here();
    asm.op(OpCode::LoadRetain).u8(1);
    let closure_pc = asm.here();
    asm.op(OpCode::PushClosure);
    let inner_hole = asm.u16_hole();
    asm.u8(1).u8(1).u8(0);
    asm.op(OpCode::Ret1);

    // inner: x => x + n   (frame: [ret, x, captured n])
    let inner_pc = asm.here();
    asm.op(OpCode::Load).u8(1);
    asm.op(OpCode::Load).u8(2);
    asm.op(OpCode::Add);
    asm.op(OpCode::Ret1);

    asm.patch_u16(outer_hole, (outer_pc - lambda_pc) as u16);
    asm.patch_u16(inner_hole, (inner_pc - closure_pc) as u16);
    let buf = asm.finish(1);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "15\n");

    // Retain/release balance: nothing is live, so every reference taken
    // was returned
    assert_eq!(vm.stats().live_objects, 0);
    let info = vm.trace_info();
    assert_eq!(info.num_retains, info.num_releases);
    assert!(vm.check_memory());
}

#[test]
fn test_closure_spills_more_than_three_captures() {
    // c = (a,b,c,d,e captured) => a+b+c+d+e; print c()
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let consts: Vec<u16> = (1..=5).map(|i| asm.const_float(f64::from(i))).collect();

    for &c in &consts {
        asm.op(OpCode::PushConst).u16(c);
    }
    let closure_pc = asm.here();
    asm.op(OpCode::PushClosure);
    let body_hole = asm.u16_hole();
    asm.u8(0).u8(5).u8(0);
    asm.op(OpCode::Call1).u8(1);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);

    // body: frame [ret, cap1..cap5]
    let body_pc = asm.here();
    asm.op(OpCode::Load).u8(1);
    for slot in 2..=5 {
        asm.op(OpCode::Load).u8(slot);
        asm.op(OpCode::Add);
    }
    asm.op(OpCode::Ret1);
    asm.patch_u16(body_hole, (body_pc - closure_pc) as u16);
    let buf = asm.finish(0);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "15\n");
    assert_eq!(vm.stats().live_objects, 0);
}

// =============================================================================
// User functions & stack growth
// =============================================================================

#[test]
fn test_recursion_grows_stack_transparently() {
    // func down(n): if n <= 0: return 0 else: return down(n - 1)
    // print down(300)   -- deep enough to outgrow the initial stack
    let mut vm = test_vm();
    let print = print_fid(&mut vm);
    let down = vm.symbols().ensure_func_sym("down");

    let mut asm = Assembler::new();
    let n300 = asm.const_float(300.0);
    let zero = asm.const_float(0.0);
    let one = asm.const_float(1.0);

    asm.op(OpCode::PushConst).u16(n300);
    asm.op(OpCode::CallSym1).u8(down as u8).u8(1);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);

    let down_pc = asm.here();
    asm.op(OpCode::Load).u8(1);
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::Le);
    let branch_pc = asm.here();
    asm.op(OpCode::JumpNotCond);
    let else_hole = asm.u16_hole();
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::Ret1);
    let else_pc = asm.here();
    asm.op(OpCode::Load).u8(1);
    asm.op(OpCode::PushConst).u16(one);
    asm.op(OpCode::Sub);
    asm.op(OpCode::CallSym1).u8(down as u8).u8(1);
    asm.op(OpCode::Ret1);
    asm.patch_u16(else_hole, (else_pc - branch_pc) as u16);
    let buf = asm.finish(0);

    vm.symbols().bind_func(
        down,
        FuncSymbol::User {
            pc: down_pc as u32,
            num_params: 1,
            num_locals: 0,
        },
    );

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "0\n");
    // The stack had to grow past its initial reservation
    assert!(vm.stats().peak_stack > 512);
}

#[test]
fn test_missing_function_symbol_panics() {
    let mut vm = test_vm();
    let ghost = vm.symbols().ensure_func_sym("ghost");

    let mut asm = Assembler::new();
    let node = asm.debug_node("", 0);
    asm.debug_sym(0, node, NULL_NODE);
    asm.op(OpCode::CallSym0).u8(ghost as u8).u8(0);
    asm.op(OpCode::End);
    let buf = asm.finish(0);

    let err = vm.eval(&buf).unwrap_err();
    assert_eq!(err, RunError::Panic);
    assert!(vm
        .get_panic_msg()
        .starts_with("Missing function symbol: ghost"));
}

// =============================================================================
// Dynamic dispatch promotion (scenario 4)
// =============================================================================

#[test]
fn test_method_cache_promotes_and_tracks_mru() {
    let mut vm = test_vm();
    let print = print_fid(&mut vm);
    let a_tid = vm.symbols().add_type("A", 1);
    let b_tid = vm.symbols().add_type("B", 1);
    let m = vm.symbols().ensure_method_sym("m");

    let mut asm = Assembler::new();
    let zero = asm.const_float(0.0);
    let one = asm.const_float(1.0);
    let two = asm.const_float(2.0);

    // a = A{0}; b = B{0}
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::PushStructInitSmall).u8(a_tid as u8).u8(1).u8(0);
    asm.op(OpCode::Set).u8(0);
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::PushStructInitSmall).u8(b_tid as u8).u8(1).u8(0);
    asm.op(OpCode::Set).u8(1);

    // call m alternately on a and b, 5 rounds each
    for _ in 0..5 {
        asm.op(OpCode::LoadRetain).u8(0);
        asm.op(OpCode::CallObjSym0).u8(m as u8).u8(1);
        asm.op(OpCode::LoadRetain).u8(1);
        asm.op(OpCode::CallObjSym0).u8(m as u8).u8(1);
    }
    // once more on a so both MRU states are exercised, printing the result
    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::CallObjSym1).u8(m as u8).u8(1);
    asm.op(OpCode::CallSym0).u8(print).u8(1);

    asm.op(OpCode::Release).u8(0);
    asm.op(OpCode::Release).u8(1);
    asm.op(OpCode::End);

    // A.m: release self, return 1; B.m: release self, return 2
    let a_m_pc = asm.here();
    asm.op(OpCode::Release).u8(1);
    asm.op(OpCode::PushConst).u16(one);
    asm.op(OpCode::Ret1);
    let b_m_pc = asm.here();
    asm.op(OpCode::Release).u8(1);
    asm.op(OpCode::PushConst).u16(two);
    asm.op(OpCode::Ret1);
    let buf = asm.finish(2);

    vm.symbols().add_method_sym(
        a_tid,
        m,
        MethodEntry::User {
            pc: a_m_pc as u32,
            num_params: 1,
            num_locals: 0,
        },
    );
    // Second distinct type promotes oneType -> manyTypes
    vm.symbols().add_method_sym(
        b_tid,
        m,
        MethodEntry::User {
            pc: b_m_pc as u32,
            num_params: 1,
            num_locals: 0,
        },
    );
    assert!(matches!(
        vm.symbols().method_syms[m as usize].shape,
        MethodShape::ManyTypes { .. }
    ));
    assert!(vm.symbols().method_table.contains_key(&(a_tid, m)));
    assert!(vm.symbols().method_table.contains_key(&(b_tid, m)));

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "1\n");

    // The final call was on an A receiver, so the MRU points at A
    assert!(matches!(
        vm.symbols().method_syms[m as usize].shape,
        MethodShape::ManyTypes { mru_type_id, .. } if mru_type_id == a_tid
    ));
    assert_eq!(vm.stats().live_objects, 0);
}

// =============================================================================
// Panic trace (scenario 5)
// =============================================================================

#[test]
fn test_panic_trace_maps_frames_to_source() {
    // func bar():
    //   x.foo()
    // bar()
    let src = "func bar():\n  x.foo()\nbar()";
    let mut vm = test_vm();
    let bar = vm.symbols().ensure_func_sym("bar");
    let a_tid = vm.symbols().add_type("X", 1);
    let foo = vm.symbols().ensure_method_sym("foo");

    let mut asm = Assembler::new();
    asm.src(src);
    let zero = asm.const_float(0.0);
    let bar_node = asm.debug_node("bar", 14); // "x.foo()" - line 2, col 3
    let main_node = asm.debug_node("", 22); // "bar()" - line 3, col 1

    let call_pc = asm.here();
    asm.debug_sym(call_pc, main_node, NULL_NODE);
    asm.op(OpCode::CallSym0).u8(bar as u8).u8(0);
    asm.op(OpCode::End);

    let bar_pc = asm.here();
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::PushStructInitSmall).u8(a_tid as u8).u8(1).u8(0);
    let method_call_pc = asm.here();
    asm.debug_sym(method_call_pc, bar_node, bar_node);
    asm.op(OpCode::CallObjSym0).u8(foo as u8).u8(1);
    asm.op(OpCode::Ret0);
    // main reserves one local so called frames sit above fp 0 (the
    // unwinder identifies the outermost frame by fp == 0)
    let buf = asm.finish(1);

    vm.symbols().bind_func(
        bar,
        FuncSymbol::User {
            pc: bar_pc as u32,
            num_params: 0,
            num_locals: 1,
        },
    );

    let err = vm.eval(&buf).unwrap_err();
    assert_eq!(err, RunError::Panic);
    assert!(vm
        .get_panic_msg()
        .starts_with("Missing function symbol: foo"));

    let trace = vm.get_stack_trace().expect("trace built");
    assert_eq!(trace.frames.len(), 2);
    assert_eq!(trace.frames[0].name, "bar");
    assert_eq!((trace.frames[0].line, trace.frames[0].col), (2, 3));
    assert_eq!(trace.frames[1].name, "main");
    assert_eq!((trace.frames[1].line, trace.frames[1].col), (3, 1));
}

// =============================================================================
// Cycle detection (scenario 6)
// =============================================================================

#[test]
fn test_cycle_detected_and_reclaimed() {
    // a = []; a.append(a); release a
    let mut vm = test_vm();
    let append = vm.symbols().ensure_method_sym("append") as u8;

    let mut asm = Assembler::new();
    asm.op(OpCode::PushList).u8(0);
    asm.op(OpCode::Set).u8(0);
    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::LoadRetain).u8(0);
    asm.op(OpCode::CallObjSym0).u8(append).u8(2);
    asm.op(OpCode::Release).u8(0);
    asm.op(OpCode::End);
    let buf = asm.finish(1);

    vm.eval(&buf).expect("program runs");

    // One object left alive only by its self-reference
    assert_eq!(vm.stats().live_objects, 1);
    assert!(!vm.check_memory());
    assert_eq!(vm.stats().live_objects, 0);
    assert_eq!(vm.stats().cycle_roots_freed, 1);
}

// =============================================================================
// Iteration
// =============================================================================

#[test]
fn test_for_range_accumulates() {
    // acc = 0; for i in 0..5: acc = acc + i; print acc  -> 10
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let zero = asm.const_float(0.0);
    let five = asm.const_float(5.0);
    let one = asm.const_float(1.0);

    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::Set).u8(0);
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::PushConst).u16(five);
    asm.op(OpCode::PushConst).u16(one);
    let for_pc = asm.here();
    asm.op(OpCode::ForRange).u8(1);
    let end_hole = asm.u16_hole();
    // body
    asm.op(OpCode::Load).u8(0);
    asm.op(OpCode::Load).u8(1);
    asm.op(OpCode::Add);
    asm.op(OpCode::Set).u8(0);
    asm.op(OpCode::BodyEnd);
    let loop_end = asm.here();
    asm.patch_u16(end_hole, (loop_end - for_pc) as u16);

    asm.op(OpCode::Load).u8(0);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(2);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "10\n");
}

#[test]
fn test_for_range_descending() {
    // for i in 3..0: print i  -> 3 2 1
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let three = asm.const_float(3.0);
    let zero = asm.const_float(0.0);
    let one = asm.const_float(1.0);

    asm.op(OpCode::PushConst).u16(three);
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::PushConst).u16(one);
    let for_pc = asm.here();
    asm.op(OpCode::ForRange).u8(0);
    let end_hole = asm.u16_hole();
    asm.op(OpCode::Load).u8(0);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::BodyEnd);
    let loop_end = asm.here();
    asm.patch_u16(end_hole, (loop_end - for_pc) as u16);
    asm.op(OpCode::End);
    let buf = asm.finish(1);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "3\n2\n1\n");
}

#[test]
fn test_for_iter_over_list() {
    // acc = 0; for v in [1,2,3]: acc = acc + v; print acc  -> 6
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let zero = asm.const_float(0.0);
    let consts: Vec<u16> = (1..=3).map(|i| asm.const_float(f64::from(i))).collect();

    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::Set).u8(0);
    for &c in &consts {
        asm.op(OpCode::PushConst).u16(c);
    }
    asm.op(OpCode::PushList).u8(3);
    let for_pc = asm.here();
    asm.op(OpCode::ForIter).u8(1);
    let end_hole = asm.u16_hole();
    asm.op(OpCode::Load).u8(0);
    asm.op(OpCode::Load).u8(1);
    asm.op(OpCode::Add);
    asm.op(OpCode::Set).u8(0);
    asm.op(OpCode::BodyEnd);
    let loop_end = asm.here();
    asm.patch_u16(end_hole, (loop_end - for_pc) as u16);

    asm.op(OpCode::Load).u8(0);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(2);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "6\n");
    // The iterator reference was dropped when the loop finished
    assert_eq!(vm.stats().live_objects, 0);
}

#[test]
fn test_break_unwinds_one_loop_level() {
    // count = 0; for i in 0..10: if i >= 3: break; count = count + 1
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let zero = asm.const_float(0.0);
    let ten = asm.const_float(10.0);
    let one = asm.const_float(1.0);
    let three = asm.const_float(3.0);

    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::Set).u8(0);
    asm.op(OpCode::PushConst).u16(zero);
    asm.op(OpCode::PushConst).u16(ten);
    asm.op(OpCode::PushConst).u16(one);
    let for_pc = asm.here();
    asm.op(OpCode::ForRange).u8(1);
    let end_hole = asm.u16_hole();

    // body: if i >= 3: break
    asm.op(OpCode::Load).u8(1);
    asm.op(OpCode::PushConst).u16(three);
    asm.op(OpCode::Ge);
    let jpc = asm.here();
    asm.op(OpCode::JumpNotCond);
    let skip_hole = asm.u16_hole();
    asm.op(OpCode::Break);
    let after_break = asm.here();
    asm.patch_u16(skip_hole, (after_break - jpc) as u16);
    asm.op(OpCode::Load).u8(0);
    asm.op(OpCode::PushConst).u16(one);
    asm.op(OpCode::Add);
    asm.op(OpCode::Set).u8(0);
    asm.op(OpCode::BodyEnd);
    let loop_end = asm.here();
    asm.patch_u16(end_hole, (loop_end - for_pc) as u16);

    asm.op(OpCode::Load).u8(0);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(2);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "3\n");
}

// =============================================================================
// String templates
// =============================================================================

#[test]
fn test_string_template_builds_heap_string() {
    // print "sum=\(1+2)!"
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let prefix = asm.const_str("sum=");
    let one = asm.const_float(1.0);
    let two = asm.const_float(2.0);
    let bang = asm.const_str("!");

    asm.op(OpCode::PushConst).u16(prefix);
    asm.op(OpCode::PushConst).u16(one);
    asm.op(OpCode::PushConst).u16(two);
    asm.op(OpCode::Add);
    asm.op(OpCode::PushConst).u16(bang);
    asm.op(OpCode::StringTemplate).u8(3);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf = asm.finish(0);

    vm.eval(&buf).expect("program runs");
    assert_eq!(vm.take_print_output(), "sum=3!\n");
    assert_eq!(vm.stats().live_objects, 0);
}

// =============================================================================
// Program result & reuse
// =============================================================================

#[test]
fn test_program_result_value() {
    // A buffer whose top holds a single extra value yields it as the
    // program result
    let mut vm = test_vm();

    let mut asm = Assembler::new();
    let c = asm.const_float(123.0);
    asm.op(OpCode::PushConst).u16(c);
    asm.op(OpCode::End);
    let buf = asm.finish(0);

    let result = vm.eval(&buf).expect("program runs");
    assert_eq!(result.as_float(), 123.0);
}

#[test]
fn test_eval_reuses_vm_across_runs() {
    let mut vm = test_vm();
    let print = print_fid(&mut vm);

    let mut asm = Assembler::new();
    let c = asm.const_float(1.0);
    asm.op(OpCode::PushConst).u16(c);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf1 = asm.finish(0);

    let mut asm = Assembler::new();
    let s = asm.const_str("two");
    asm.op(OpCode::PushConst).u16(s);
    asm.op(OpCode::CallSym0).u8(print).u8(1);
    asm.op(OpCode::End);
    let buf2 = asm.finish(0);

    vm.eval(&buf1).expect("first run");
    let pages_after_first = vm.stats().pages_allocated;
    vm.eval(&buf2).expect("second run");

    assert_eq!(vm.take_print_output(), "1\ntwo\n");
    // Heap pages survive between runs
    assert_eq!(vm.stats().pages_allocated, pages_after_first);
}

#[test]
fn test_panic_state_clears_between_runs() {
    let mut vm = test_vm();
    let ghost = vm.symbols().ensure_func_sym("ghost");

    let mut asm = Assembler::new();
    let node = asm.debug_node("", 0);
    asm.debug_sym(0, node, NULL_NODE);
    asm.op(OpCode::CallSym0).u8(ghost as u8).u8(0);
    asm.op(OpCode::End);
    let bad = asm.finish(0);

    let mut asm = Assembler::new();
    asm.op(OpCode::End);
    let good = asm.finish(0);

    assert!(vm.eval(&bad).is_err());
    assert!(!vm.get_panic_msg().is_empty());

    let result = vm.eval(&good).expect("second run is clean");
    assert!(result.is_none());
    assert!(vm.get_panic_msg().is_empty());
    assert!(vm.get_stack_trace().is_none());
}
