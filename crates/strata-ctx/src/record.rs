//! Small accessors over compound records.
//!
//! The heavy tag-tree manipulation lives in the per-dialect converter
//! collaborators; these are just the lookups the core pipeline itself
//! needs (ids, positions, relationship grafting).

use std::collections::HashMap;

use fastnbt::Value;
use strata_core::BlockPos;

pub fn compound(entries: Vec<(&str, Value)>) -> Value {
    let mut map = HashMap::new();
    for (k, v) in entries {
        map.insert(k.to_string(), v);
    }
    Value::Compound(map)
}

pub fn get<'a>(rec: &'a Value, key: &str) -> Option<&'a Value> {
    match rec {
        Value::Compound(map) => map.get(key),
        _ => None,
    }
}

pub fn get_mut<'a>(rec: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    match rec {
        Value::Compound(map) => map.get_mut(key),
        _ => None,
    }
}

/// Insert into a compound; non-compounds are left untouched.
pub fn set(rec: &mut Value, key: &str, value: Value) {
    if let Value::Compound(map) = rec {
        map.insert(key.to_string(), value);
    }
}

pub fn remove(rec: &mut Value, key: &str) -> Option<Value> {
    match rec {
        Value::Compound(map) => map.remove(key),
        _ => None,
    }
}

pub fn as_i32(v: &Value) -> Option<i32> {
    match v {
        Value::Byte(b) => Some(i32::from(*b)),
        Value::Short(s) => Some(i32::from(*s)),
        Value::Int(i) => Some(*i),
        _ => None,
    }
}

pub fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Long(l) => Some(*l),
        other => as_i32(other).map(i64::from),
    }
}

pub fn as_str(v: &Value) -> Option<&str> {
    match v {
        Value::String(s) => Some(s),
        _ => None,
    }
}

pub fn get_i32(rec: &Value, key: &str) -> Option<i32> {
    get(rec, key).and_then(as_i32)
}

pub fn get_i64(rec: &Value, key: &str) -> Option<i64> {
    get(rec, key).and_then(as_i64)
}

pub fn get_str<'a>(rec: &'a Value, key: &str) -> Option<&'a str> {
    get(rec, key).and_then(as_str)
}

/// Block position from sibling `x`/`y`/`z` integer fields.
pub fn block_pos(rec: &Value) -> Option<BlockPos> {
    Some(BlockPos::new(
        get_i32(rec, "x")?,
        get_i32(rec, "y")?,
        get_i32(rec, "z")?,
    ))
}

/// Canonical id from the four-int array encoding, most significant
/// first. Explicit byte assembly, no pointer games.
pub fn uuid_from_int_array(parts: &[i32]) -> Option<u128> {
    if parts.len() != 4 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for (i, part) in parts.iter().enumerate() {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&part.to_be_bytes());
    }
    Some(u128::from_be_bytes(bytes))
}

pub fn uuid_to_int_array(id: u128) -> [i32; 4] {
    let bytes = id.to_be_bytes();
    let mut out = [0i32; 4];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = i32::from_be_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    }
    out
}

/// Canonical id from a bare four-int-array value.
pub fn uuid_value(v: &Value) -> Option<u128> {
    match v {
        Value::IntArray(arr) => {
            let parts: Vec<i32> = arr.iter().copied().collect();
            uuid_from_int_array(&parts)
        }
        _ => None,
    }
}

/// Canonical id of an entity record (`UUID` four-int array).
pub fn entity_uuid(rec: &Value) -> Option<u128> {
    match get(rec, "UUID") {
        Some(Value::IntArray(arr)) => {
            let parts: Vec<i32> = arr.iter().copied().collect();
            uuid_from_int_array(&parts)
        }
        _ => None,
    }
}

pub fn set_entity_uuid(rec: &mut Value, id: u128) {
    set(
        rec,
        "UUID",
        Value::IntArray(fastnbt::IntArray::new(uuid_to_int_array(id).to_vec())),
    );
}
