//! String Conversion
//!
//! Stringification for `print`/`str`/string templates, and the narrow
//! numeric coercion table the arithmetic fallback paths use. Number
//! formatting drops the trailing `.0` for integral values so `7.0` prints
//! as `7`.

use tern_core::object::{TYPE_CLOSURE, TYPE_LAMBDA, TYPE_LIST, TYPE_MAP, TYPE_STRING};
use tern_core::Value;

use crate::error::RunResult;
use crate::vm::Vm;

/// Format a number the way the language prints it
pub fn format_number(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

impl Vm {
    /// Host API: stringify any value
    pub fn value_as_string(&self, v: Value) -> String {
        self.format_value(v)
    }

    pub(crate) fn format_value(&self, v: Value) -> String {
        if v.is_number() {
            return format_number(v.as_float());
        }
        if v.is_none() {
            return "none".to_string();
        }
        if v.is_bool() {
            return if v.as_bool() { "true" } else { "false" }.to_string();
        }
        if let Some(s) = self.str_value(v) {
            return s.to_string();
        }
        if v.is_error() {
            return format!("error(0x{:x})", v.payload());
        }
        // Heap objects
        let obj = unsafe { v.as_ptr() };
        match unsafe { (*obj).type_id() } {
            TYPE_LIST => {
                let parts: Vec<String> = unsafe { (*obj).list.elems() }
                    .iter()
                    .map(|e| self.format_value(*e))
                    .collect();
                format!("[{}]", parts.join(","))
            }
            TYPE_MAP => {
                let table = unsafe { (*obj).map.table() };
                let mut parts = Vec::new();
                for slot in 0..table.slot_count() {
                    if let Some((key, val)) = table.entry_at(slot) {
                        parts.push(format!("{}: {}", format_map_key(key), self.format_value(val)));
                    }
                }
                format!("{{{}}}", parts.join(", "))
            }
            TYPE_LAMBDA => "lambda".to_string(),
            TYPE_CLOSURE => "closure".to_string(),
            TYPE_STRING => unreachable!("handled by str_value"),
            tid => self.syms.type_name(tid).to_string(),
        }
    }

    /// Coerce a value to a float per the fallback table: numbers pass,
    /// none/false -> 0, true -> 1, strings parse-or-0. Other pointer
    /// kinds panic.
    pub(crate) fn to_float_coerce(&mut self, v: Value) -> RunResult<f64> {
        if let Some(f) = v.to_float() {
            return Ok(f);
        }
        if let Some(s) = self.str_value(v) {
            return Ok(s.trim().parse::<f64>().unwrap_or(0.0));
        }
        let name = self.type_name_of(v).to_string();
        Err(self.panic(format!("Cannot convert {name} to Number")))
    }
}

fn format_map_key(key: &tern_core::MapKey) -> String {
    use tern_core::MapKey;
    match key {
        MapKey::Number(bits) => format_number(f64::from_bits(*bits)),
        MapKey::Str(s) => s.to_string(),
        MapKey::Bool(b) => b.to_string(),
        MapKey::None => "none".to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================
