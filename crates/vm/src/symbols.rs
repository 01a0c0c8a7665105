//! Symbol Dispatch Tables
//!
//! Three parallel registries keyed by name:
//!
//! - function symbols (`globals[name] -> id`, `func_syms[id]`)
//! - field symbols with a one-type cache
//! - method symbols with the classic inline-cache progression
//!   empty -> oneType -> manyTypes+MRU, backed by a side table keyed by
//!   `(type_id, method_id)` that holds the full polymorphic mapping
//!
//! MRU hit rates for polymorphic call sites are typically high but not
//! monomorphic, so `manyTypes` keeps both the MRU entry and the table.

use std::collections::HashMap;

use tern_core::Value;

use crate::vm::Vm;

pub type TypeId = u32;
pub type FuncId = u32;
pub type FieldId = u32;
pub type MethodId = u32;

/// Pre-sized bucket count for the method side table
pub const METHOD_TABLE_BUCKETS: usize = 512;

// =============================================================================
// Native function signatures
// =============================================================================

/// Free function: `fn(vm, args) -> value`. The caller transfers its
/// argument references; the callee must release them and return either a
/// new reference or none.
pub type NativeFuncFn = fn(&mut Vm, &[Value]) -> Value;

/// One-return method: `fn(vm, receiver, args) -> value`
pub type NativeMethodFn = fn(&mut Vm, Value, &[Value]) -> Value;

/// Two-return method: `fn(vm, receiver, args) -> (value, value)`
pub type NativeMethod2Fn = fn(&mut Vm, Value, &[Value]) -> (Value, Value);

// =============================================================================
// Symbols
// =============================================================================

/// A registered type: name plus field count (SmallObject types have <= 4)
#[derive(Debug, Clone)]
pub struct TypeDesc {
    pub name: String,
    pub num_fields: u8,
}

#[derive(Clone, Copy)]
pub enum FuncSymbol {
    /// Declared but never bound; calling it panics
    None,
    User {
        pc: u32,
        num_params: u8,
        num_locals: u8,
    },
    Native(NativeFuncFn),
}

#[derive(Debug, Clone, Copy)]
pub enum MethodEntry {
    User {
        pc: u32,
        num_params: u8,
        num_locals: u8,
    },
    Native1(NativeMethodFn),
    Native2(NativeMethod2Fn),
}

#[derive(Clone, Copy)]
pub enum MethodShape {
    Empty,
    OneType {
        type_id: TypeId,
        entry: MethodEntry,
    },
    ManyTypes {
        mru_type_id: TypeId,
        mru_entry: MethodEntry,
    },
}

pub struct MethodSymbol {
    pub name: String,
    pub shape: MethodShape,
}

#[derive(Clone, Copy)]
pub enum FieldShape {
    Empty,
    OneType {
        type_id: TypeId,
        field_idx: u8,
        is_small_object: bool,
    },
}

pub struct FieldSymbol {
    pub name: String,
    pub shape: FieldShape,
}

// =============================================================================
// SymbolTables
// =============================================================================

pub struct SymbolTables {
    pub func_syms: Vec<FuncSymbol>,
    pub globals: HashMap<String, FuncId>,

    pub field_syms: Vec<FieldSymbol>,
    field_ids: HashMap<String, FieldId>,

    pub method_syms: Vec<MethodSymbol>,
    method_ids: HashMap<String, MethodId>,
    /// Full polymorphic mapping behind the MRU cache
    pub method_table: HashMap<(TypeId, MethodId), MethodEntry>,

    pub types: Vec<TypeDesc>,
}

impl SymbolTables {
    pub fn new() -> Self {
        use tern_core::{TYPE_CLOSURE, TYPE_LAMBDA, TYPE_LIST, TYPE_MAP, TYPE_STRING};

        // The first five ids are reserved for built-ins, in slot order
        let mut types = vec![TypeDesc { name: String::new(), num_fields: 0 }; 5];
        types[TYPE_LIST as usize].name = "List".to_string();
        types[TYPE_MAP as usize].name = "Map".to_string();
        types[TYPE_CLOSURE as usize].name = "Closure".to_string();
        types[TYPE_LAMBDA as usize].name = "Lambda".to_string();
        types[TYPE_STRING as usize].name = "String".to_string();

        SymbolTables {
            func_syms: Vec::new(),
            globals: HashMap::new(),
            field_syms: Vec::new(),
            field_ids: HashMap::new(),
            method_syms: Vec::new(),
            method_ids: HashMap::new(),
            method_table: HashMap::with_capacity(METHOD_TABLE_BUCKETS),
            types,
        }
    }

    // =========================================================================
    // Types
    // =========================================================================

    /// Register a user type; SmallObject types carry at most 4 fields
    pub fn add_type(&mut self, name: &str, num_fields: u8) -> TypeId {
        debug_assert!(num_fields <= 4, "SmallObject types carry at most 4 fields");
        let id = self.types.len() as TypeId;
        self.types.push(TypeDesc {
            name: name.to_string(),
            num_fields,
        });
        id
    }

    pub fn type_name(&self, id: TypeId) -> &str {
        self.types
            .get(id as usize)
            .map(|t| t.name.as_str())
            .unwrap_or("<unknown>")
    }

    // =========================================================================
    // Function symbols
    // =========================================================================

    /// Look up or declare a function symbol id for a global name
    pub fn ensure_func_sym(&mut self, name: &str) -> FuncId {
        if let Some(&id) = self.globals.get(name) {
            return id;
        }
        let id = self.func_syms.len() as FuncId;
        self.func_syms.push(FuncSymbol::None);
        self.globals.insert(name.to_string(), id);
        id
    }

    pub fn bind_func(&mut self, id: FuncId, sym: FuncSymbol) {
        self.func_syms[id as usize] = sym;
    }

    pub fn func_name(&self, id: FuncId) -> &str {
        self.globals
            .iter()
            .find(|&(_, &v)| v == id)
            .map(|(k, _)| k.as_str())
            .unwrap_or("<anonymous>")
    }

    // =========================================================================
    // Field symbols
    // =========================================================================

    pub fn ensure_field_sym(&mut self, name: &str) -> FieldId {
        if let Some(&id) = self.field_ids.get(name) {
            return id;
        }
        let id = self.field_syms.len() as FieldId;
        self.field_syms.push(FieldSymbol {
            name: name.to_string(),
            shape: FieldShape::Empty,
        });
        self.field_ids.insert(name.to_string(), id);
        id
    }

    /// Cache a field's location for its first (and only cached) type.
    /// A second type keeps the original cache; receivers of other types
    /// fall back to map-by-name lookup at access time.
    pub fn add_field_sym(&mut self, type_id: TypeId, fid: FieldId, field_idx: u8) {
        let sym = &mut self.field_syms[fid as usize];
        if let FieldShape::Empty = sym.shape {
            sym.shape = FieldShape::OneType {
                type_id,
                field_idx,
                is_small_object: true,
            };
        }
    }

    // =========================================================================
    // Method symbols
    // =========================================================================

    pub fn ensure_method_sym(&mut self, name: &str) -> MethodId {
        if let Some(&id) = self.method_ids.get(name) {
            return id;
        }
        let id = self.method_syms.len() as MethodId;
        self.method_syms.push(MethodSymbol {
            name: name.to_string(),
            shape: MethodShape::Empty,
        });
        self.method_ids.insert(name.to_string(), id);
        id
    }

    /// Register a method implementation for a type, promoting the symbol's
    /// shape: empty -> oneType on first registration, oneType -> manyTypes
    /// on the second distinct type (the original entry moves into the side
    /// table), manyTypes stays.
    pub fn add_method_sym(&mut self, type_id: TypeId, mid: MethodId, entry: MethodEntry) {
        let sym = &mut self.method_syms[mid as usize];
        match sym.shape {
            MethodShape::Empty => {
                sym.shape = MethodShape::OneType { type_id, entry };
            }
            MethodShape::OneType {
                type_id: cached_type,
                entry: cached_entry,
            } => {
                if cached_type == type_id {
                    sym.shape = MethodShape::OneType { type_id, entry };
                } else {
                    self.method_table.insert((cached_type, mid), cached_entry);
                    self.method_table.insert((type_id, mid), entry);
                    sym.shape = MethodShape::ManyTypes {
                        mru_type_id: type_id,
                        mru_entry: entry,
                    };
                }
            }
            MethodShape::ManyTypes { .. } => {
                self.method_table.insert((type_id, mid), entry);
            }
        }
    }

    pub fn method_name(&self, mid: MethodId) -> &str {
        self.method_syms
            .get(mid as usize)
            .map(|m| m.name.as_str())
            .unwrap_or("<unknown>")
    }
}

impl Default for SymbolTables {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
