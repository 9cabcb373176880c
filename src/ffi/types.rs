//! FFI handle types for the C API.

#![allow(dead_code)]

use crate::interp::{Engine, Value};
use crate::ir::{Module, Type};
use crate::oracle::ValueArray;

/// Opaque engine handle. Created by `galena_engine_new()`, freed by
/// `galena_engine_free()`.
#[repr(C)]
pub struct GalenaEngine {
    _private: [u8; 0],
}

/// Opaque value handle. The oracle reads and writes values through
/// the `galena_value_*` accessors.
#[repr(C)]
pub struct GalenaValue {
    _private: [u8; 0],
}

/// Opaque argument-array handle passed to the call hooks.
#[repr(C)]
pub struct GalenaValueArray {
    _private: [u8; 0],
}

/// Opaque module handle produced by a loader.
#[repr(C)]
pub struct GalenaModule {
    _private: [u8; 0],
}

/// Opaque type tag handle; valid as long as the engine that handed it
/// out is alive.
#[repr(C)]
pub struct GalenaType {
    _private: [u8; 0],
}

/// Discriminant returned by `galena_type_kind`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalenaTypeKind {
    Void = 0,
    Int = 1,
    Float = 2,
    Double = 3,
    Ptr = 4,
    Array = 5,
    Vector = 6,
    Struct = 7,
    Func = 8,
    TargetExt = 9,
}

/// Hand a materialized module to the C API. The returned pointer is
/// consumed by `galena_engine_new`.
pub fn module_into_raw(module: Module) -> *mut GalenaModule {
    Box::into_raw(Box::new(module)) as *mut GalenaModule
}

pub(crate) unsafe fn engine_ref<'a>(engine: *const GalenaEngine) -> Option<&'a Engine> {
    unsafe { (engine as *const Engine).as_ref() }
}

pub(crate) unsafe fn engine_mut<'a>(engine: *mut GalenaEngine) -> Option<&'a mut Engine> {
    unsafe { (engine as *mut Engine).as_mut() }
}

pub(crate) unsafe fn value_ref<'a>(value: *const GalenaValue) -> Option<&'a Value> {
    unsafe { (value as *const Value).as_ref() }
}

pub(crate) unsafe fn value_mut<'a>(value: *mut GalenaValue) -> Option<&'a mut Value> {
    unsafe { (value as *mut Value).as_mut() }
}

pub(crate) unsafe fn array_ref<'a>(array: *const GalenaValueArray) -> Option<&'a ValueArray> {
    unsafe { (array as *const ValueArray).as_ref() }
}

pub(crate) unsafe fn type_ref<'a>(ty: *const GalenaType) -> Option<&'a Type> {
    unsafe { (ty as *const Type).as_ref() }
}
