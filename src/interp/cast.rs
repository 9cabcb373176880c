//! Value conversions.
//!
//! Everything here is pure; `ptrtoint`/`inttoptr` cross the oracle
//! boundary and are handled by the engine instead.

use num_bigint::BigUint;
use num_traits::Zero;

use crate::apint::IntValue;
use crate::ir::{CastOp, DataLayout, Type, TypeRef};

use super::error::EngineError;
use super::value::{Value, ValueKind};

fn invalid(op: CastOp) -> EngineError {
    EngineError::fatal(format!("invalid {:?} instruction", op))
}

fn dest_int_width(op: CastOp, dst_ty: &TypeRef) -> Result<u32, EngineError> {
    dst_ty
        .scalar_type()
        .int_width()
        .ok_or_else(|| invalid(op))
}

fn map_elems(
    src: &Value,
    mut f: impl FnMut(&Value) -> Result<Value, EngineError>,
) -> Result<Value, EngineError> {
    match &src.kind {
        ValueKind::Aggregate(elems) => Ok(Value::aggregate(
            elems.iter().map(&mut f).collect::<Result<Vec<_>, _>>()?,
        )),
        _ => f(src),
    }
}

/// Execute a pure conversion. The destination type is the instruction
/// type; source element shapes come from the value itself.
pub fn cast(
    op: CastOp,
    src: &Value,
    dst_ty: &TypeRef,
    layout: &DataLayout,
) -> Result<Value, EngineError> {
    match op {
        CastOp::Trunc => {
            let width = dest_int_width(op, dst_ty)?;
            map_elems(src, |v| {
                let i = v.as_int().ok_or_else(|| invalid(op))?;
                Ok(Value::int(i.trunc(width)))
            })
        }
        CastOp::ZExt => {
            let width = dest_int_width(op, dst_ty)?;
            map_elems(src, |v| {
                let i = v.as_int().ok_or_else(|| invalid(op))?;
                Ok(Value::int(i.zext(width)))
            })
        }
        CastOp::SExt => {
            let width = dest_int_width(op, dst_ty)?;
            map_elems(src, |v| {
                let i = v.as_int().ok_or_else(|| invalid(op))?;
                Ok(Value::int(i.sext(width)))
            })
        }
        CastOp::FpTrunc => map_elems(src, |v| {
            let d = v.as_f64().ok_or_else(|| invalid(op))?;
            Ok(Value::f32(d as f32))
        }),
        CastOp::FpExt => map_elems(src, |v| {
            let f = v.as_f32().ok_or_else(|| invalid(op))?;
            Ok(Value::f64(f as f64))
        }),
        CastOp::FpToUi | CastOp::FpToSi => {
            // Round toward zero; NaN maps to zero and out-of-range
            // magnitudes wrap into the destination width.
            let width = dest_int_width(op, dst_ty)?;
            map_elems(src, |v| {
                let r = match v.kind {
                    ValueKind::F32(f) => IntValue::from_f32_round_to_zero(width, f),
                    ValueKind::F64(d) => IntValue::from_f64_round_to_zero(width, d),
                    _ => return Err(invalid(op)),
                };
                Ok(Value::int(r))
            })
        }
        CastOp::UiToFp => {
            let to_double = matches!(dst_ty.scalar_type(), Type::Double);
            map_elems(src, |v| {
                let i = v.as_int().ok_or_else(|| invalid(op))?;
                Ok(if to_double {
                    Value::f64(i.to_f64_unsigned())
                } else {
                    Value::f32(i.to_f32_unsigned())
                })
            })
        }
        CastOp::SiToFp => {
            let to_double = matches!(dst_ty.scalar_type(), Type::Double);
            map_elems(src, |v| {
                let i = v.as_int().ok_or_else(|| invalid(op))?;
                Ok(if to_double {
                    Value::f64(i.to_f64_signed())
                } else {
                    Value::f32(i.to_f32_signed())
                })
            })
        }
        CastOp::BitCast => bitcast(src, dst_ty, layout),
        CastOp::PtrToInt | CastOp::IntToPtr => Err(EngineError::fatal(
            "pointer conversions must route through the oracle",
        )),
    }
}

/// Bit pattern of one scalar element. Pointers are rejected: they may
/// not appear as vector elements in a bitcast.
fn element_bits(v: &Value) -> Result<IntValue, EngineError> {
    match &v.kind {
        ValueKind::Int(i) => Ok(i.clone()),
        ValueKind::F32(f) => Ok(IntValue::from_f32_bits(*f)),
        ValueKind::F64(d) => Ok(IntValue::from_f64_bits(*d)),
        _ => Err(invalid(CastOp::BitCast)),
    }
}

fn element_from_bits(bits: IntValue, elem_ty: &Type) -> Result<Value, EngineError> {
    match elem_ty {
        Type::Int(_) => Ok(Value::int(bits)),
        Type::Float => Ok(Value::f32(bits.bits_to_f32())),
        Type::Double => Ok(Value::f64(bits.bits_to_f64())),
        _ => Err(invalid(CastOp::BitCast)),
    }
}

fn scalar_bit_size(ty: &Type) -> Result<u32, EngineError> {
    match ty {
        Type::Int(w) => Ok(*w),
        Type::Float => Ok(32),
        Type::Double => Ok(64),
        _ => Err(invalid(CastOp::BitCast)),
    }
}

fn bitcast(src: &Value, dst_ty: &TypeRef, layout: &DataLayout) -> Result<Value, EngineError> {
    let src_is_vector = src.is_aggregate();
    let dst_is_vector = dst_ty.is_vector();

    if !src_is_vector && !dst_is_vector {
        // Scalar to scalar: pointers carry over unchanged, everything
        // else reinterprets bits at equal width.
        if let ValueKind::Ptr(p) = src.kind {
            if !dst_ty.is_ptr() {
                return Err(invalid(CastOp::BitCast));
            }
            return Ok(Value::ptr(p));
        }
        if dst_ty.is_ptr() {
            return Err(invalid(CastOp::BitCast));
        }
        let bits = element_bits(src)?;
        if bits.width() != scalar_bit_size(dst_ty)? {
            return Err(invalid(CastOp::BitCast));
        }
        return element_from_bits(bits, dst_ty);
    }

    // Vector to vector, vector to scalar, or scalar to vector: convert
    // the source elements to bit patterns, concatenate in the module's
    // byte order, and redistribute into the destination element count.
    let src_elems: Vec<IntValue> = match &src.kind {
        ValueKind::Aggregate(elems) => elems
            .iter()
            .map(element_bits)
            .collect::<Result<Vec<_>, _>>()?,
        _ => vec![element_bits(src)?],
    };
    let src_bits = src_elems
        .first()
        .map(IntValue::width)
        .ok_or_else(|| invalid(CastOp::BitCast))?;
    if src_elems.iter().any(|e| e.width() != src_bits) {
        return Err(invalid(CastOp::BitCast));
    }

    let (dst_elem_ty, dst_count) = match dst_ty.as_ref() {
        Type::Vector { elem, len } => (elem.as_ref(), *len as usize),
        other => (other, 1),
    };
    let dst_bits = scalar_bit_size(dst_elem_ty)?;
    let total = src_bits as u64 * src_elems.len() as u64;
    if total != dst_bits as u64 * dst_count as u64 {
        return Err(invalid(CastOp::BitCast));
    }

    let mut concat = BigUint::zero();
    for (i, elem) in src_elems.iter().enumerate() {
        let pos = if layout.little_endian {
            i
        } else {
            src_elems.len() - 1 - i
        };
        concat |= elem.bits().clone() << (pos * src_bits as usize);
    }

    let mut out = Vec::with_capacity(dst_count);
    for j in 0..dst_count {
        let pos = if layout.little_endian {
            j
        } else {
            dst_count - 1 - j
        };
        let piece = IntValue::from_biguint(dst_bits, concat.clone() >> (pos * dst_bits as usize));
        out.push(element_from_bits(piece, dst_elem_ty)?);
    }

    if dst_is_vector {
        Ok(Value::aggregate(out))
    } else {
        Ok(out.pop().expect("scalar destination has one element"))
    }
}
