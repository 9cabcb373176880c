//! Scalar and vector arithmetic, comparisons and select.
//!
//! Operations dispatch on runtime payload kinds; vectors evaluate
//! elementwise. Division by zero and operand-kind mismatches are
//! semantic faults, not panics.

use crate::apint::IntValue;
use crate::ir::{BinOp, FloatPredicate, IntPredicate};

use super::error::EngineError;
use super::value::{Value, ValueKind};

/// Shift amounts at or past the width are masked with
/// `width.next_power_of_two() - 1`; smaller amounts pass through.
pub fn shift_amount(amount: u64, width: u32) -> u32 {
    if amount < width as u64 {
        amount as u32
    } else {
        (amount & (width.next_power_of_two() as u64 - 1)) as u32
    }
}

fn int_binary(op: BinOp, lhs: &IntValue, rhs: &IntValue) -> Result<IntValue, EngineError> {
    let result = match op {
        BinOp::Add => lhs.add(rhs),
        BinOp::Sub => lhs.sub(rhs),
        BinOp::Mul => lhs.mul(rhs),
        BinOp::UDiv | BinOp::SDiv | BinOp::URem | BinOp::SRem => {
            if rhs.is_zero() {
                return Err(EngineError::fatal("integer division by zero"));
            }
            match op {
                BinOp::UDiv => lhs.udiv(rhs),
                BinOp::SDiv => lhs.sdiv(rhs),
                BinOp::URem => lhs.urem(rhs),
                _ => lhs.srem(rhs),
            }
        }
        BinOp::And => lhs.and(rhs),
        BinOp::Or => lhs.or(rhs),
        BinOp::Xor => lhs.xor(rhs),
        BinOp::Shl => lhs.shl(shift_amount(rhs.to_u64(), lhs.width())),
        BinOp::LShr => lhs.lshr(shift_amount(rhs.to_u64(), lhs.width())),
        BinOp::AShr => lhs.ashr(shift_amount(rhs.to_u64(), lhs.width())),
        _ => {
            return Err(EngineError::fatal(format!(
                "unhandled integer operands for {:?} instruction",
                op
            )));
        }
    };
    Ok(result)
}

fn scalar_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, EngineError> {
    match (&lhs.kind, &rhs.kind) {
        (ValueKind::Int(a), ValueKind::Int(b)) => Ok(Value::int(int_binary(op, a, b)?)),
        (ValueKind::F32(a), ValueKind::F32(b)) => {
            let r = match op {
                BinOp::FAdd => a + b,
                BinOp::FSub => a - b,
                BinOp::FMul => a * b,
                BinOp::FDiv => a / b,
                BinOp::FRem => a % b,
                _ => {
                    return Err(EngineError::fatal(format!(
                        "unhandled float operands for {:?} instruction",
                        op
                    )));
                }
            };
            Ok(Value::f32(r))
        }
        (ValueKind::F64(a), ValueKind::F64(b)) => {
            let r = match op {
                BinOp::FAdd => a + b,
                BinOp::FSub => a - b,
                BinOp::FMul => a * b,
                BinOp::FDiv => a / b,
                BinOp::FRem => a % b,
                _ => {
                    return Err(EngineError::fatal(format!(
                        "unhandled double operands for {:?} instruction",
                        op
                    )));
                }
            };
            Ok(Value::f64(r))
        }
        _ => Err(EngineError::fatal(format!(
            "unhandled operand kinds for {:?} instruction",
            op
        ))),
    }
}

/// A binary opcode over scalars or vectors.
pub fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, EngineError> {
    match (&lhs.kind, &rhs.kind) {
        (ValueKind::Aggregate(a), ValueKind::Aggregate(b)) => {
            if a.len() != b.len() {
                return Err(EngineError::fatal(format!(
                    "vector length mismatch in {:?} instruction",
                    op
                )));
            }
            let elems = a
                .iter()
                .zip(b)
                .map(|(x, y)| scalar_binary(op, x, y))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::aggregate(elems))
        }
        _ => scalar_binary(op, lhs, rhs),
    }
}

fn scalar_fneg(src: &Value) -> Result<Value, EngineError> {
    match src.kind {
        ValueKind::F32(v) => Ok(Value::f32(-v)),
        ValueKind::F64(v) => Ok(Value::f64(-v)),
        _ => Err(EngineError::fatal(
            "unhandled operand kind for fneg instruction",
        )),
    }
}

pub fn fneg(src: &Value) -> Result<Value, EngineError> {
    match &src.kind {
        ValueKind::Aggregate(elems) => {
            let negated = elems
                .iter()
                .map(scalar_fneg)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::aggregate(negated))
        }
        _ => scalar_fneg(src),
    }
}

fn scalar_icmp(pred: IntPredicate, lhs: &Value, rhs: &Value) -> Result<bool, EngineError> {
    match (&lhs.kind, &rhs.kind) {
        (ValueKind::Int(a), ValueKind::Int(b)) => Ok(match pred {
            IntPredicate::Eq => a == b,
            IntPredicate::Ne => a != b,
            IntPredicate::Ult => a.ult(b),
            IntPredicate::Slt => a.slt(b),
            IntPredicate::Ugt => a.ugt(b),
            IntPredicate::Sgt => a.sgt(b),
            IntPredicate::Ule => a.ule(b),
            IntPredicate::Sle => a.sle(b),
            IntPredicate::Uge => a.uge(b),
            IntPredicate::Sge => a.sge(b),
        }),
        // Pointers compare by address alone; provenance does not
        // participate.
        (ValueKind::Ptr(a), ValueKind::Ptr(b)) => Ok(match pred {
            IntPredicate::Eq => a.addr == b.addr,
            IntPredicate::Ne => a.addr != b.addr,
            IntPredicate::Ult | IntPredicate::Slt => a.addr < b.addr,
            IntPredicate::Ugt | IntPredicate::Sgt => a.addr > b.addr,
            IntPredicate::Ule | IntPredicate::Sle => a.addr <= b.addr,
            IntPredicate::Uge | IntPredicate::Sge => a.addr >= b.addr,
        }),
        _ => Err(EngineError::fatal(format!(
            "unhandled operand kinds for icmp {:?}",
            pred
        ))),
    }
}

/// Integer or pointer comparison producing an i1 or an i1 vector.
pub fn icmp(pred: IntPredicate, lhs: &Value, rhs: &Value) -> Result<Value, EngineError> {
    match (&lhs.kind, &rhs.kind) {
        (ValueKind::Aggregate(a), ValueKind::Aggregate(b)) => {
            if a.len() != b.len() {
                return Err(EngineError::fatal("vector length mismatch in icmp"));
            }
            let elems = a
                .iter()
                .zip(b)
                .map(|(x, y)| scalar_icmp(pred, x, y).map(Value::of_bool))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::aggregate(elems))
        }
        _ => Ok(Value::of_bool(scalar_icmp(pred, lhs, rhs)?)),
    }
}

fn scalar_floats(lhs: &Value, rhs: &Value) -> Result<(f64, f64), EngineError> {
    match (&lhs.kind, &rhs.kind) {
        (ValueKind::F32(a), ValueKind::F32(b)) => Ok((*a as f64, *b as f64)),
        (ValueKind::F64(a), ValueKind::F64(b)) => Ok((*a, *b)),
        _ => Err(EngineError::fatal("unhandled operand kinds for fcmp")),
    }
}

fn scalar_fcmp(pred: FloatPredicate, lhs: &Value, rhs: &Value) -> Result<bool, EngineError> {
    let (a, b) = scalar_floats(lhs, rhs)?;
    let unordered = a.is_nan() || b.is_nan();
    Ok(match pred {
        FloatPredicate::False => false,
        FloatPredicate::True => true,
        FloatPredicate::Ord => !unordered,
        FloatPredicate::Uno => unordered,
        FloatPredicate::Oeq => !unordered && a == b,
        FloatPredicate::Ogt => !unordered && a > b,
        FloatPredicate::Oge => !unordered && a >= b,
        FloatPredicate::Olt => !unordered && a < b,
        FloatPredicate::Ole => !unordered && a <= b,
        FloatPredicate::One => !unordered && a != b,
        FloatPredicate::Ueq => unordered || a == b,
        FloatPredicate::Ugt => unordered || a > b,
        FloatPredicate::Uge => unordered || a >= b,
        FloatPredicate::Ult => unordered || a < b,
        FloatPredicate::Ule => unordered || a <= b,
        FloatPredicate::Une => unordered || a != b,
    })
}

/// Floating comparison producing an i1 or an i1 vector. Ordered
/// predicates are false and unordered ones true whenever either
/// operand is NaN.
pub fn fcmp(pred: FloatPredicate, lhs: &Value, rhs: &Value) -> Result<Value, EngineError> {
    match (&lhs.kind, &rhs.kind) {
        (ValueKind::Aggregate(a), ValueKind::Aggregate(b)) => {
            if a.len() != b.len() {
                return Err(EngineError::fatal("vector length mismatch in fcmp"));
            }
            let elems = a
                .iter()
                .zip(b)
                .map(|(x, y)| scalar_fcmp(pred, x, y).map(Value::of_bool))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::aggregate(elems))
        }
        _ => Ok(Value::of_bool(scalar_fcmp(pred, lhs, rhs)?)),
    }
}

/// Scalar i1 select, or per-element select under a vector mask.
pub fn select(cond: &Value, on_true: &Value, on_false: &Value) -> Result<Value, EngineError> {
    match &cond.kind {
        ValueKind::Int(flag) => Ok(if flag.is_zero() {
            on_false.clone()
        } else {
            on_true.clone()
        }),
        ValueKind::Aggregate(mask) => {
            let (t, f) = match (&on_true.kind, &on_false.kind) {
                (ValueKind::Aggregate(t), ValueKind::Aggregate(f)) => (t, f),
                _ => {
                    return Err(EngineError::fatal(
                        "select with a vector mask requires vector operands",
                    ));
                }
            };
            if mask.len() != t.len() || t.len() != f.len() {
                return Err(EngineError::fatal("vector length mismatch in select"));
            }
            let elems = mask
                .iter()
                .zip(t.iter().zip(f))
                .map(|(m, (x, y))| {
                    if m.is_true() {
                        x.clone()
                    } else {
                        y.clone()
                    }
                })
                .collect();
            Ok(Value::aggregate(elems))
        }
        _ => Err(EngineError::fatal(
            "unhandled condition kind for select instruction",
        )),
    }
}
