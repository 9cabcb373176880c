//! Value handle constructors and accessors.
//!
//! These functions are the binary contract through which the oracle
//! reads hook arguments and writes results back: integer bytes,
//! floats, pointers, type tags, aggregate elements and the argument
//! arrays of the call hooks.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

use std::sync::Arc;

use crate::apint::IntValue;
use crate::interp::{Value, ValueKind};
use crate::ir::Type;
use crate::oracle::MiriPointer;

use super::types::{
    GalenaType, GalenaTypeKind, GalenaValue, GalenaValueArray, array_ref, type_ref, value_mut,
    value_ref,
};

// =============================================================================
// Constructors
// =============================================================================

/// Create an empty value (a zeroed one-bit integer).
#[unsafe(no_mangle)]
pub extern "C" fn galena_value_new() -> *mut GalenaValue {
    Box::into_raw(Box::new(Value::default())) as *mut GalenaValue
}

/// Create an integer value of the given width from the low bits of
/// `value`, sign-extending when `is_signed`.
#[unsafe(no_mangle)]
pub extern "C" fn galena_value_of_int(width: u32, value: u64, is_signed: bool) -> *mut GalenaValue {
    if width == 0 {
        return std::ptr::null_mut();
    }
    let v = if is_signed {
        IntValue::from_i64(width, value as i64)
    } else {
        IntValue::new(width, value)
    };
    Box::into_raw(Box::new(Value::int(v).with_type(Type::int(width)))) as *mut GalenaValue
}

#[unsafe(no_mangle)]
pub extern "C" fn galena_value_of_f32(value: f32) -> *mut GalenaValue {
    Box::into_raw(Box::new(Value::f32(value).with_type(Type::float()))) as *mut GalenaValue
}

#[unsafe(no_mangle)]
pub extern "C" fn galena_value_of_f64(value: f64) -> *mut GalenaValue {
    Box::into_raw(Box::new(Value::f64(value).with_type(Type::double()))) as *mut GalenaValue
}

#[unsafe(no_mangle)]
pub extern "C" fn galena_value_of_miri_pointer(pointer: MiriPointer) -> *mut GalenaValue {
    Box::into_raw(Box::new(Value::ptr(pointer).with_type(Type::ptr()))) as *mut GalenaValue
}

/// Free a value handle previously returned by this API.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_free(value: *mut GalenaValue) {
    if !value.is_null() {
        let _ = Box::from_raw(value as *mut Value);
    }
}

// =============================================================================
// Integer payload
// =============================================================================

/// Bit width of an integer payload, or 0 for other payloads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_int_width(value: *const GalenaValue) -> u32 {
    value_ref(value)
        .and_then(Value::as_int)
        .map_or(0, IntValue::width)
}

/// Low 64 bits of an integer payload, zero-extended.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_int_u64(value: *const GalenaValue) -> u64 {
    value_ref(value)
        .and_then(Value::as_int)
        .map_or(0, IntValue::to_u64)
}

/// Copy the little-endian bytes of an integer payload into `out`.
/// Returns the number of bytes the payload occupies; nothing is
/// written when `cap` is too small or the payload is not an integer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_int_bytes(
    value: *const GalenaValue,
    out: *mut u8,
    cap: usize,
) -> usize {
    let Some(int) = value_ref(value).and_then(Value::as_int) else {
        return 0;
    };
    let bytes = int.to_le_bytes();
    if !out.is_null() && cap >= bytes.len() {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
    }
    bytes.len()
}

/// Replace the payload with an integer built from `len` little-endian
/// bytes; the width becomes `8 * len`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_set_int_bytes(
    value: *mut GalenaValue,
    data: *const u8,
    len: usize,
) {
    let Some(value) = value_mut(value) else {
        return;
    };
    if data.is_null() || len == 0 {
        value.kind = ValueKind::Int(IntValue::new(1, 0));
        return;
    }
    let bytes = std::slice::from_raw_parts(data, len);
    value.kind = ValueKind::Int(IntValue::from_le_bytes(bytes));
}

// =============================================================================
// Float payloads
// =============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_f32(value: *const GalenaValue) -> f32 {
    value_ref(value).and_then(Value::as_f32).unwrap_or(0.0)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_set_f32(value: *mut GalenaValue, payload: f32) {
    if let Some(value) = value_mut(value) {
        value.kind = ValueKind::F32(payload);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_f64(value: *const GalenaValue) -> f64 {
    value_ref(value).and_then(Value::as_f64).unwrap_or(0.0)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_set_f64(value: *mut GalenaValue, payload: f64) {
    if let Some(value) = value_mut(value) {
        value.kind = ValueKind::F64(payload);
    }
}

// =============================================================================
// Pointer payload
// =============================================================================

/// The pointer payload, or the null pointer for other payloads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_miri_pointer(value: *const GalenaValue) -> MiriPointer {
    value_ref(value)
        .and_then(Value::as_ptr)
        .unwrap_or_else(MiriPointer::null)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_set_miri_pointer(
    value: *mut GalenaValue,
    pointer: MiriPointer,
) {
    if let Some(value) = value_mut(value) {
        value.kind = ValueKind::Ptr(pointer);
    }
}

// =============================================================================
// Type tag
// =============================================================================

/// Borrow the value's type tag, or NULL when untyped.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_type_tag(value: *const GalenaValue) -> *const GalenaType {
    value_ref(value)
        .and_then(|v| v.ty.as_ref())
        .map_or(std::ptr::null(), |ty| {
            Arc::as_ptr(ty) as *const GalenaType
        })
}

/// Stamp a type tag obtained from this engine onto the value.
///
/// # Safety
///
/// `ty` must be a tag previously handed out by the API (it shares the
/// engine's reference-counted storage).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_set_type_tag(value: *mut GalenaValue, ty: *const GalenaType) {
    let Some(value) = value_mut(value) else {
        return;
    };
    if ty.is_null() {
        value.ty = None;
        return;
    }
    let raw = ty as *const Type;
    Arc::increment_strong_count(raw);
    value.ty = Some(Arc::from_raw(raw));
}

// =============================================================================
// Aggregates
// =============================================================================

/// Number of aggregate elements, or 0 for scalar payloads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_aggregate_len(value: *const GalenaValue) -> u64 {
    value_ref(value)
        .and_then(Value::elems)
        .map_or(0, |e| e.len() as u64)
}

/// Borrow the i-th aggregate element. The pointer is invalidated by
/// resize or append.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_aggregate_at(
    value: *mut GalenaValue,
    index: u64,
) -> *mut GalenaValue {
    let Some(value) = value_mut(value) else {
        return std::ptr::null_mut();
    };
    match value.elems_mut().and_then(|e| e.get_mut(index as usize)) {
        Some(elem) => elem as *mut Value as *mut GalenaValue,
        None => std::ptr::null_mut(),
    }
}

/// Make the value an aggregate of `len` elements, filling new slots
/// with empty values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_aggregate_resize(value: *mut GalenaValue, len: u64) {
    let Some(value) = value_mut(value) else {
        return;
    };
    match &mut value.kind {
        ValueKind::Aggregate(elems) => elems.resize_with(len as usize, Value::default),
        _ => {
            let mut elems = Vec::with_capacity(len as usize);
            elems.resize_with(len as usize, Value::default);
            value.kind = ValueKind::Aggregate(elems);
        }
    }
}

/// Append a copy of `elem` to the aggregate, converting a scalar
/// payload into an empty aggregate first.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_aggregate_append(
    value: *mut GalenaValue,
    elem: *const GalenaValue,
) {
    let Some(value) = value_mut(value) else {
        return;
    };
    let Some(elem) = value_ref(elem) else {
        return;
    };
    if !matches!(value.kind, ValueKind::Aggregate(_)) {
        value.kind = ValueKind::Aggregate(Vec::new());
    }
    if let ValueKind::Aggregate(elems) = &mut value.kind {
        elems.push(elem.clone());
    }
}

// =============================================================================
// Argument arrays
// =============================================================================

/// Length of a call-hook argument array.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_array_len(array: *const GalenaValueArray) -> u64 {
    array_ref(array).map_or(0, |a| a.len() as u64)
}

/// Borrow the i-th argument, or NULL past the end.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_value_array_at(
    array: *const GalenaValueArray,
    index: u64,
) -> *const GalenaValue {
    array_ref(array)
        .and_then(|a| a.get(index as usize))
        .map_or(std::ptr::null(), |v| {
            v as *const Value as *const GalenaValue
        })
}

// =============================================================================
// Type inspection
// =============================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_type_kind(ty: *const GalenaType) -> GalenaTypeKind {
    match type_ref(ty) {
        Some(Type::Void) | None => GalenaTypeKind::Void,
        Some(Type::Int(_)) => GalenaTypeKind::Int,
        Some(Type::Float) => GalenaTypeKind::Float,
        Some(Type::Double) => GalenaTypeKind::Double,
        Some(Type::Ptr) => GalenaTypeKind::Ptr,
        Some(Type::Array { .. }) => GalenaTypeKind::Array,
        Some(Type::Vector { .. }) => GalenaTypeKind::Vector,
        Some(Type::Struct { .. }) => GalenaTypeKind::Struct,
        Some(Type::Func { .. }) => GalenaTypeKind::Func,
        Some(Type::TargetExt { .. }) => GalenaTypeKind::TargetExt,
    }
}

/// Bit width of an integer type, or 0.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_type_int_width(ty: *const GalenaType) -> u32 {
    type_ref(ty).and_then(Type::int_width).unwrap_or(0)
}

/// Element count of arrays and vectors, field count of structs,
/// 0 otherwise.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_type_length(ty: *const GalenaType) -> u64 {
    type_ref(ty).and_then(Type::aggregate_arity).unwrap_or(0)
}

/// Borrow a nested type: the element type of arrays and vectors, the
/// i-th field of structs, the layout type of target extension types.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_type_element_at(
    ty: *const GalenaType,
    index: u64,
) -> *const GalenaType {
    let nested = match type_ref(ty) {
        Some(Type::Array { elem, .. }) | Some(Type::Vector { elem, .. }) => Some(elem),
        Some(Type::Struct { fields, .. }) => fields.get(index as usize),
        Some(Type::TargetExt { layout, .. }) => Some(layout),
        _ => None,
    };
    nested.map_or(std::ptr::null(), |t| Arc::as_ptr(t) as *const GalenaType)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        unsafe {
            let v = galena_value_of_int(32, 42, false);
            assert_eq!(galena_value_int_width(v), 32);
            assert_eq!(galena_value_int_u64(v), 42);
            let mut buf = [0u8; 4];
            assert_eq!(galena_value_int_bytes(v, buf.as_mut_ptr(), buf.len()), 4);
            assert_eq!(buf, [42, 0, 0, 0]);
            galena_value_free(v);
        }
    }

    #[test]
    fn signed_construction_sign_extends() {
        unsafe {
            let v = galena_value_of_int(16, -2i64 as u64, true);
            assert_eq!(galena_value_int_u64(v), 0xfffe);
            galena_value_free(v);
        }
    }

    #[test]
    fn pointer_round_trip() {
        unsafe {
            let p = MiriPointer {
                addr: 0x1000,
                prov: crate::oracle::MiriProvenance { alloc_id: 3, tag: 4 },
            };
            let v = galena_value_of_miri_pointer(p);
            assert_eq!(galena_value_miri_pointer(v), p);
            galena_value_free(v);
        }
    }

    #[test]
    fn aggregates_resize_and_index() {
        unsafe {
            let v = galena_value_new();
            galena_value_aggregate_resize(v, 3);
            assert_eq!(galena_value_aggregate_len(v), 3);
            let elem = galena_value_aggregate_at(v, 1);
            galena_value_set_f64(elem, 2.5);
            assert_eq!(galena_value_f64(galena_value_aggregate_at(v, 1)), 2.5);
            assert!(galena_value_aggregate_at(v, 9).is_null());
            galena_value_free(v);
        }
    }

    #[test]
    fn type_tags_survive_the_round_trip() {
        unsafe {
            let ty = Type::int(64);
            let v = galena_value_new();
            galena_value_set_type_tag(v, Arc::as_ptr(&ty) as *const GalenaType);
            let tag = galena_value_type_tag(v);
            assert_eq!(galena_type_kind(tag), GalenaTypeKind::Int);
            assert_eq!(galena_type_int_width(tag), 64);
            galena_value_free(v);
        }
    }
}
