//! The uniform runtime value.

use std::fmt;

use crate::apint::IntValue;
use crate::ir::{Type, TypeRef};
use crate::oracle::MiriPointer;

/// Scalar or aggregate payload of a [`Value`].
#[derive(Debug, Clone)]
pub enum ValueKind {
    Int(IntValue),
    F32(f32),
    F64(f64),
    /// Pointer bits plus provenance.
    Ptr(MiriPointer),
    /// Two-word index pair; the va_list encoding `(frame, arg)`.
    UintPair(u32, u32),
    /// Vector, array or struct elements in order.
    Aggregate(Vec<Value>),
}

/// A runtime value. `ty` is stamped whenever the value is bound to an
/// IR name; payloads and type stay in agreement through the binding
/// path.
#[derive(Debug, Clone)]
pub struct Value {
    pub ty: Option<TypeRef>,
    pub kind: ValueKind,
}

impl Default for Value {
    fn default() -> Self {
        Self {
            ty: None,
            kind: ValueKind::Int(IntValue::new(1, 0)),
        }
    }
}

impl Value {
    pub fn int(value: IntValue) -> Self {
        Self {
            ty: None,
            kind: ValueKind::Int(value),
        }
    }

    pub fn of_u64(width: u32, value: u64) -> Self {
        Self::int(IntValue::new(width, value))
    }

    pub fn of_bool(value: bool) -> Self {
        Self::int(IntValue::from_bool(value))
    }

    pub fn f32(value: f32) -> Self {
        Self {
            ty: None,
            kind: ValueKind::F32(value),
        }
    }

    pub fn f64(value: f64) -> Self {
        Self {
            ty: None,
            kind: ValueKind::F64(value),
        }
    }

    pub fn ptr(ptr: MiriPointer) -> Self {
        Self {
            ty: None,
            kind: ValueKind::Ptr(ptr),
        }
    }

    pub fn pair(first: u32, second: u32) -> Self {
        Self {
            ty: None,
            kind: ValueKind::UintPair(first, second),
        }
    }

    pub fn aggregate(elems: Vec<Value>) -> Self {
        Self {
            ty: None,
            kind: ValueKind::Aggregate(elems),
        }
    }

    /// The zero value of a type, recursing into aggregates.
    pub fn zero_of(ty: &TypeRef) -> Self {
        let kind = match ty.as_ref() {
            Type::Int(w) => ValueKind::Int(IntValue::zero(*w)),
            Type::Float => ValueKind::F32(0.0),
            Type::Double => ValueKind::F64(0.0),
            Type::Ptr | Type::Func { .. } => ValueKind::Ptr(MiriPointer::null()),
            Type::Array { elem, len } | Type::Vector { elem, len } => ValueKind::Aggregate(
                (0..*len).map(|_| Value::zero_of(elem)).collect(),
            ),
            Type::Struct { fields, .. } => {
                ValueKind::Aggregate(fields.iter().map(Value::zero_of).collect())
            }
            Type::TargetExt { layout, .. } => return Value::zero_of(layout),
            Type::Void => ValueKind::Int(IntValue::new(1, 0)),
        };
        Self {
            ty: Some(ty.clone()),
            kind,
        }
    }

    pub fn with_type(mut self, ty: TypeRef) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn is_int(&self) -> bool {
        matches!(self.kind, ValueKind::Int(_))
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self.kind, ValueKind::Ptr(_))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, ValueKind::Aggregate(_))
    }

    pub fn as_int(&self) -> Option<&IntValue> {
        match &self.kind {
            ValueKind::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self.kind {
            ValueKind::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            ValueKind::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<MiriPointer> {
        match self.kind {
            ValueKind::Ptr(p) => Some(p),
            _ => None,
        }
    }

    pub fn elems(&self) -> Option<&[Value]> {
        match &self.kind {
            ValueKind::Aggregate(v) => Some(v),
            _ => None,
        }
    }

    pub fn elems_mut(&mut self) -> Option<&mut Vec<Value>> {
        match &mut self.kind {
            ValueKind::Aggregate(v) => Some(v),
            _ => None,
        }
    }

    /// The two-word index pair, however it round-tripped through
    /// memory: either the dedicated payload or the low/high halves of
    /// an 8-byte integer.
    pub fn as_uint_pair(&self) -> Option<(u32, u32)> {
        match &self.kind {
            ValueKind::UintPair(a, b) => Some((*a, *b)),
            ValueKind::Int(v) => {
                let raw = v.to_u64();
                Some((raw as u32, (raw >> 32) as u32))
            }
            _ => None,
        }
    }

    /// Truthiness of an i1.
    pub fn is_true(&self) -> bool {
        match &self.kind {
            ValueKind::Int(v) => !v.is_zero(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValueKind::Int(v) => write!(f, "{}", v),
            ValueKind::F32(v) => write!(f, "{}", v),
            ValueKind::F64(v) => write!(f, "{}", v),
            ValueKind::Ptr(p) => {
                write!(f, "ptr {:#x} ({}, {})", p.addr, p.prov.alloc_id, p.prov.tag)
            }
            ValueKind::UintPair(a, b) => write!(f, "({}, {})", a, b),
            ValueKind::Aggregate(elems) => {
                write!(f, "[")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
        }
    }
}
