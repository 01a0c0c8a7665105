//! Core Bindings
//!
//! The native method/function set the interpreter itself depends on,
//! registered at init. The reserved iterator pair lands on method ids 0
//! and 1 so the for-iter protocol can resolve them without a name lookup.
//!
//! ABI reminder: the caller transfers its argument references (receiver
//! included); a native must release what it consumes and return either a
//! new reference or none. Natives cannot raise panics through this
//! signature, so argument errors degrade to none (the compiler's type
//! checker rules them out for well-formed programs).

use tern_core::object::{TYPE_LIST, TYPE_MAP, TYPE_STRING};
use tern_core::{MapKey, Value};

use crate::symbols::{FuncSymbol, MethodEntry, MethodId};
use crate::vm::Vm;

/// Reserved method id for `iterator()`
pub const METHOD_ITERATOR: MethodId = 0;
/// Reserved method id for `next()`
pub const METHOD_NEXT: MethodId = 1;

/// Register the core bindings; called once from `Vm::init`
pub fn register(vm: &mut Vm) {
    // The iterator pair must claim ids 0 and 1
    let it = vm.syms.ensure_method_sym("iterator");
    let next = vm.syms.ensure_method_sym("next");
    debug_assert_eq!(it, METHOD_ITERATOR);
    debug_assert_eq!(next, METHOD_NEXT);

    vm.syms
        .add_method_sym(TYPE_LIST, it, MethodEntry::Native1(list_iterator));
    vm.syms
        .add_method_sym(TYPE_MAP, it, MethodEntry::Native1(map_iterator));
    vm.syms
        .add_method_sym(TYPE_LIST, next, MethodEntry::Native1(list_next));
    vm.syms
        .add_method_sym(TYPE_MAP, next, MethodEntry::Native1(map_next));

    let append = vm.syms.ensure_method_sym("append");
    vm.syms
        .add_method_sym(TYPE_LIST, append, MethodEntry::Native1(list_append));

    let len = vm.syms.ensure_method_sym("len");
    vm.syms
        .add_method_sym(TYPE_LIST, len, MethodEntry::Native1(list_len));
    vm.syms
        .add_method_sym(TYPE_STRING, len, MethodEntry::Native1(string_len));

    let pop = vm.syms.ensure_method_sym("pop");
    vm.syms
        .add_method_sym(TYPE_LIST, pop, MethodEntry::Native1(list_pop));

    let insert = vm.syms.ensure_method_sym("insert");
    vm.syms
        .add_method_sym(TYPE_LIST, insert, MethodEntry::Native1(list_insert));

    let remove = vm.syms.ensure_method_sym("remove");
    vm.syms
        .add_method_sym(TYPE_LIST, remove, MethodEntry::Native1(list_remove));
    vm.syms
        .add_method_sym(TYPE_MAP, remove, MethodEntry::Native1(map_remove));

    let size = vm.syms.ensure_method_sym("size");
    vm.syms
        .add_method_sym(TYPE_MAP, size, MethodEntry::Native1(map_size));

    let has = vm.syms.ensure_method_sym("has");
    vm.syms
        .add_method_sym(TYPE_MAP, has, MethodEntry::Native1(map_has));

    let upper = vm.syms.ensure_method_sym("upper");
    vm.syms
        .add_method_sym(TYPE_STRING, upper, MethodEntry::Native1(string_upper));
    let lower = vm.syms.ensure_method_sym("lower");
    vm.syms
        .add_method_sym(TYPE_STRING, lower, MethodEntry::Native1(string_lower));
    let index = vm.syms.ensure_method_sym("index");
    vm.syms
        .add_method_sym(TYPE_STRING, index, MethodEntry::Native1(string_index));

    let print = vm.syms.ensure_func_sym("print");
    vm.syms.bind_func(print, FuncSymbol::Native(builtin_print));
    let type_of = vm.syms.ensure_func_sym("typeof");
    vm.syms.bind_func(type_of, FuncSymbol::Native(builtin_typeof));
    let str_fn = vm.syms.ensure_func_sym("str");
    vm.syms.bind_func(str_fn, FuncSymbol::Native(builtin_str));
}

// =============================================================================
// List methods
// =============================================================================

/// append(v) - the argument reference moves into the list
fn list_append(vm: &mut Vm, recv: Value, args: &[Value]) -> Value {
    let v = args.first().copied().unwrap_or(Value::none());
    unsafe {
        (*recv.as_ptr()).list.push(v);
    }
    vm.heap.release(recv);
    Value::none()
}

fn list_len(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let n = unsafe { (*recv.as_ptr()).list.len };
    vm.heap.release(recv);
    Value::from_float(f64::from(n))
}

/// pop() - removes and returns the last element; none when empty
fn list_pop(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let out = unsafe {
        let list = &mut (*recv.as_ptr()).list;
        if list.len == 0 {
            Value::none()
        } else {
            let idx = list.len - 1;
            list.remove(idx as usize)
        }
    };
    vm.heap.release(recv);
    out
}

/// insert(i, v) - the index clamps to the list bounds
fn list_insert(vm: &mut Vm, recv: Value, args: &[Value]) -> Value {
    let idx_v = args.first().copied().unwrap_or(Value::none());
    let v = args.get(1).copied().unwrap_or(Value::none());
    unsafe {
        let list = &mut (*recv.as_ptr()).list;
        let idx = if idx_v.is_number() {
            (idx_v.as_float() as i64).clamp(0, i64::from(list.len)) as usize
        } else {
            0
        };
        list.insert(idx, v);
    }
    vm.heap.release(idx_v);
    vm.heap.release(recv);
    Value::none()
}

/// remove(i) - removes and returns the element; none when out of bounds
fn list_remove(vm: &mut Vm, recv: Value, args: &[Value]) -> Value {
    let idx_v = args.first().copied().unwrap_or(Value::none());
    let out = unsafe {
        let list = &mut (*recv.as_ptr()).list;
        if idx_v.is_number() {
            let i = idx_v.as_float() as i64;
            if i >= 0 && i < i64::from(list.len) {
                list.remove(i as usize)
            } else {
                Value::none()
            }
        } else {
            Value::none()
        }
    };
    vm.heap.release(idx_v);
    vm.heap.release(recv);
    out
}

/// iterator() - a list is its own iterator; the receiver reference
/// transfers to the result
fn list_iterator(_vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    unsafe {
        (*recv.as_ptr()).list.iter_cursor = 0;
    }
    recv
}

fn list_next(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let out = unsafe {
        let list = &mut (*recv.as_ptr()).list;
        if list.iter_cursor < list.len {
            let v = list.elems()[list.iter_cursor as usize];
            list.iter_cursor += 1;
            vm.heap.retain(v);
            v
        } else {
            Value::none()
        }
    };
    vm.heap.release(recv);
    out
}

// =============================================================================
// Map methods
// =============================================================================

fn map_size(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let n = unsafe { (*recv.as_ptr()).map.table().len() };
    vm.heap.release(recv);
    Value::from_float(f64::from(n))
}

fn map_has(vm: &mut Vm, recv: Value, args: &[Value]) -> Value {
    let key_v = args.first().copied().unwrap_or(Value::none());
    let found = match vm.map_key(key_v) {
        Some(key) => unsafe { (*recv.as_ptr()).map.table().contains(&key) },
        None => false,
    };
    vm.heap.release(key_v);
    vm.heap.release(recv);
    Value::from_bool(found)
}

/// remove(k) - returns the removed value (reference transfers out of the
/// map); none when the key was absent
fn map_remove(vm: &mut Vm, recv: Value, args: &[Value]) -> Value {
    let key_v = args.first().copied().unwrap_or(Value::none());
    let out = match vm.map_key(key_v) {
        Some(key) => unsafe { (*recv.as_ptr()).map.table_mut().remove(&key) }
            .unwrap_or(Value::none()),
        None => Value::none(),
    };
    vm.heap.release(key_v);
    vm.heap.release(recv);
    out
}

fn map_iterator(_vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    unsafe {
        (*recv.as_ptr()).map.iter_cursor = 0;
    }
    recv
}

/// next() - yields each entry as a 2-element list [key, value]
fn map_next(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let found = unsafe {
        let map = &mut (*recv.as_ptr()).map;
        let table = &*map.entries;
        let mut slot = map.iter_cursor as usize;
        let mut hit = None;
        while slot < table.slot_count() {
            if let Some((key, val)) = table.entry_at(slot) {
                hit = Some((key.clone(), val));
                break;
            }
            slot += 1;
        }
        map.iter_cursor = (slot + 1) as u32;
        hit
    };
    let out = match found {
        Some((key, val)) => {
            let key_val = match key {
                MapKey::Number(bits) => Value::from_float(f64::from_bits(bits)),
                MapKey::Str(s) => vm.new_string(&s).unwrap_or(Value::none()),
                MapKey::Bool(b) => Value::from_bool(b),
                MapKey::None => Value::none(),
            };
            vm.heap.retain(val);
            vm.new_list(vec![key_val, val]).unwrap_or(Value::none())
        }
        None => Value::none(),
    };
    vm.heap.release(recv);
    out
}

// =============================================================================
// String methods
// =============================================================================

fn string_len(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let n = vm.str_value(recv).map_or(0, str::len);
    vm.heap.release(recv);
    Value::from_float(n as f64)
}

fn string_upper(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let s = vm.str_value(recv).unwrap_or("").to_uppercase();
    vm.heap.release(recv);
    vm.new_string(&s).unwrap_or(Value::none())
}

fn string_lower(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let s = vm.str_value(recv).unwrap_or("").to_lowercase();
    vm.heap.release(recv);
    vm.new_string(&s).unwrap_or(Value::none())
}

/// index(needle) - byte offset of the first occurrence, or none
fn string_index(vm: &mut Vm, recv: Value, args: &[Value]) -> Value {
    let needle_v = args.first().copied().unwrap_or(Value::none());
    let out = match (vm.str_value(recv), vm.str_value(needle_v)) {
        (Some(hay), Some(needle)) => hay
            .find(needle)
            .map_or(Value::none(), |i| Value::from_float(i as f64)),
        _ => Value::none(),
    };
    vm.heap.release(needle_v);
    vm.heap.release(recv);
    out
}

// =============================================================================
// Free functions
// =============================================================================

/// print(v) - stringify and write a line to the VM's print sink
fn builtin_print(vm: &mut Vm, args: &[Value]) -> Value {
    let s = args
        .first()
        .map(|v| vm.format_value(*v))
        .unwrap_or_default();
    vm.print_line(&s);
    for &a in args {
        vm.heap.release(a);
    }
    Value::none()
}

fn builtin_typeof(vm: &mut Vm, args: &[Value]) -> Value {
    let v = args.first().copied().unwrap_or(Value::none());
    let name = vm.type_name_of(v).to_string();
    vm.heap.release(v);
    vm.new_string(&name).unwrap_or(Value::none())
}

fn builtin_str(vm: &mut Vm, args: &[Value]) -> Value {
    let v = args.first().copied().unwrap_or(Value::none());
    let s = vm.format_value(v);
    vm.heap.release(v);
    vm.new_string(&s).unwrap_or(Value::none())
}

// =============================================================================
// Tests
// =============================================================================
