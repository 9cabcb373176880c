//! Intrinsic calls.
//!
//! A handful are interpreted directly. Memory intrinsics are lowered
//! in place into calls to their libc-named counterparts, which then
//! route through the oracle like any other foreign call; the
//! instruction cursor is restored to the first rewritten instruction.
//! Debug-shaped intrinsics are elided. Anything else is fatal.

use num_traits::ToPrimitive;

use crate::apint::IntValue;
use crate::ir::{
    CallKind, CastOp, Instr, InstrKind, Operand, Type, TypeRef, ValueId,
};

use super::engine::Engine;
use super::error::EngineError;
use super::value::{Value, ValueKind};

pub(crate) fn dispatch_intrinsic(
    engine: &mut Engine,
    instr: &Instr,
    name: &str,
    args: Vec<Value>,
    arg_ops: &[Operand],
    kind: CallKind,
) -> Result<(), EngineError> {
    if name.starts_with("llvm.objectsize") {
        // The oracle owns allocation bounds, so object sizes are
        // unknown here: 0 under min, all-ones under max.
        let width = instr
            .ty
            .int_width()
            .ok_or_else(|| EngineError::fatal("objectsize must produce an integer"))?;
        let min = args.get(1).is_some_and(Value::is_true);
        let result = if min {
            IntValue::zero(width)
        } else {
            IntValue::all_ones(width)
        };
        return finish(engine, instr, kind, Some(Value::int(result)));
    }
    if name.starts_with("llvm.is.constant") {
        let is_const = matches!(arg_ops.first(), Some(Operand::Const(_)));
        return finish(engine, instr, kind, Some(Value::of_bool(is_const)));
    }
    if name.starts_with("llvm.expect") {
        let value = args
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::fatal("expect intrinsic requires an argument"))?;
        return finish(engine, instr, kind, Some(value));
    }
    if name.starts_with("llvm.fabs") {
        let value = arg(&args, 0)?;
        let result = match &value.kind {
            ValueKind::F32(v) => Value::f32(v.abs()),
            ValueKind::F64(v) => Value::f64(v.abs()),
            ValueKind::Int(v) => Value::int(v.abs()),
            _ => {
                return Err(EngineError::fatal(
                    "fabs intrinsic only supports float, double, or int",
                ));
            }
        };
        return finish(engine, instr, kind, Some(result));
    }
    if name.starts_with("llvm.fmuladd") {
        let (a, b, c) = (arg(&args, 0)?, arg(&args, 1)?, arg(&args, 2)?);
        let result = match (&a.kind, &b.kind, &c.kind) {
            (ValueKind::F32(x), ValueKind::F32(y), ValueKind::F32(z)) => {
                Value::f32(x.mul_add(*y, *z))
            }
            (ValueKind::F64(x), ValueKind::F64(y), ValueKind::F64(z)) => {
                Value::f64(x.mul_add(*y, *z))
            }
            _ => {
                return Err(EngineError::fatal(
                    "fmuladd intrinsic only supports float and double",
                ));
            }
        };
        return finish(engine, instr, kind, Some(result));
    }
    if name.starts_with("llvm.fshl") || name.starts_with("llvm.fshr") {
        let left = name.starts_with("llvm.fshl");
        let result = funnel_shift(&args, left)?;
        return finish(engine, instr, kind, Some(result));
    }
    if name.starts_with("llvm.bswap") {
        let v = int_arg(&args, 0)?;
        return finish(engine, instr, kind, Some(Value::int(v.byte_swap())));
    }
    if name.starts_with("llvm.ctpop") {
        let v = int_arg(&args, 0)?;
        let r = IntValue::new(v.width(), v.count_ones() as u64);
        return finish(engine, instr, kind, Some(Value::int(r)));
    }
    if name.starts_with("llvm.ctlz") {
        let v = int_arg(&args, 0)?;
        let r = IntValue::new(v.width(), v.leading_zeros() as u64);
        return finish(engine, instr, kind, Some(Value::int(r)));
    }
    if name.starts_with("llvm.cttz") {
        let v = int_arg(&args, 0)?;
        let r = IntValue::new(v.width(), v.trailing_zeros() as u64);
        return finish(engine, instr, kind, Some(Value::int(r)));
    }
    if name.starts_with("llvm.va_start") {
        let list = ptr_arg(&args, 0, "va_start")?;
        let frame_index = engine.stack_size() as u32 - 1;
        let cursor = Value::pair(frame_index, 0);
        engine.oracle_store(&cursor, list, &Type::ptr())?;
        return finish(engine, instr, kind, None);
    }
    if name.starts_with("llvm.va_end") {
        // No bookkeeping to undo.
        return finish(engine, instr, kind, None);
    }
    if name.starts_with("llvm.va_copy") {
        let dest = ptr_arg(&args, 0, "va_copy")?;
        let src = ptr_arg(&args, 1, "va_copy")?;
        let ptr_ty = Type::ptr();
        let cursor = engine.oracle_load(src, &ptr_ty)?;
        engine.oracle_store(&cursor, dest, &ptr_ty)?;
        return finish(engine, instr, kind, None);
    }
    if name.starts_with("llvm.memcpy") || name.starts_with("llvm.memmove") {
        let base = if name.starts_with("llvm.memcpy") {
            "memcpy"
        } else {
            "memmove"
        };
        return lower_to_libc_call(engine, instr, base, arg_ops, false);
    }
    if name.starts_with("llvm.memset") {
        return lower_to_libc_call(engine, instr, "memset", arg_ops, true);
    }
    if name.starts_with("llvm.dbg.")
        || name.starts_with("llvm.lifetime.")
        || name.starts_with("llvm.assume")
        || name.starts_with("llvm.donothing")
        || name.starts_with("llvm.prefetch")
    {
        return finish(engine, instr, kind, None);
    }
    Err(EngineError::fatal(format!(
        "unsupported intrinsic: {}",
        name
    )))
}

fn arg(args: &[Value], index: usize) -> Result<&Value, EngineError> {
    args.get(index)
        .ok_or_else(|| EngineError::fatal("intrinsic called with too few arguments"))
}

fn int_arg(args: &[Value], index: usize) -> Result<&IntValue, EngineError> {
    arg(args, index)?
        .as_int()
        .ok_or_else(|| EngineError::fatal("intrinsic requires an integer argument"))
}

fn ptr_arg(
    args: &[Value],
    index: usize,
    what: &str,
) -> Result<crate::oracle::MiriPointer, EngineError> {
    arg(args, index)?
        .as_ptr()
        .ok_or_else(|| EngineError::fatal(format!("{} requires a pointer argument", what)))
}

/// Funnel shift over the double-width concatenation of the operands;
/// the shift amount is taken modulo the width.
fn funnel_shift(args: &[Value], left: bool) -> Result<Value, EngineError> {
    if args.iter().any(Value::is_aggregate) {
        return Err(EngineError::fatal(
            "funnel shift intrinsics do not support vectors yet",
        ));
    }
    let a = int_arg(args, 0)?;
    let b = int_arg(args, 1)?;
    let c = int_arg(args, 2)?;
    let width = a.width();
    if b.width() != width || c.width() != width {
        return Err(EngineError::fatal(
            "funnel shift operands must share a width",
        ));
    }
    let amount = (c.bits() % width).to_u32().unwrap_or(0);
    let result = if amount == 0 {
        if left { a.clone() } else { b.clone() }
    } else if left {
        a.shl(amount).or(&b.lshr(width - amount))
    } else {
        a.shl(width - amount).or(&b.lshr(amount))
    };
    Ok(Value::int(result))
}

/// Complete an intrinsic the engine answered itself: bind the result,
/// drop the recorded call site, and take the invoke normal edge.
fn finish(
    engine: &mut Engine,
    instr: &Instr,
    kind: CallKind,
    result: Option<Value>,
) -> Result<(), EngineError> {
    engine.frame_mut()?.call_site = None;
    if !instr.ty.is_void() {
        let value = result
            .ok_or_else(|| EngineError::fatal("intrinsic produced no value for its result"))?;
        engine.bind(instr, value)?;
    }
    if let CallKind::Invoke { normal, .. } = kind {
        engine.switch_block(normal)?;
    }
    Ok(())
}

/// Rewrite a memory intrinsic in place into a call to its libc-named
/// counterpart (dropping the volatile flag), so it routes through the
/// oracle like any other foreign call. The cursor is restored to the
/// first inserted instruction; this step consumed only the lowering.
fn lower_to_libc_call(
    engine: &mut Engine,
    instr: &Instr,
    base: &str,
    arg_ops: &[Operand],
    widen_fill_byte: bool,
) -> Result<(), EngineError> {
    if arg_ops.len() < 3 {
        return Err(EngineError::fatal(
            "memory intrinsic called with too few arguments",
        ));
    }
    let (site, func) = {
        let frame = engine.frame_mut()?;
        frame.call_site = None;
        let site = frame
            .prev_instr
            .ok_or_else(|| EngineError::fatal("intrinsic with no instruction cursor"))?;
        (site, frame.func)
    };

    let params: Vec<TypeRef> = if widen_fill_byte {
        vec![Type::ptr(), Type::int(32), Type::int(64)]
    } else {
        vec![Type::ptr(), Type::ptr(), Type::int(64)]
    };
    let callee = engine.ensure_libc_declaration(base, params.clone());
    let fn_ty = Type::func(params, Type::ptr(), false);

    let mut rewritten: Vec<Instr> = Vec::with_capacity(2);
    let mut call_args = vec![arg_ops[0].clone()];
    if widen_fill_byte {
        // libc memset takes the fill byte as an int.
        let widened = ValueId(engine.module.function(func).next_value);
        engine.module.function_mut(func).next_value += 1;
        rewritten.push(Instr {
            result: widened,
            name: None,
            ty: Type::int(32),
            kind: InstrKind::Cast {
                op: CastOp::ZExt,
                src: arg_ops[1].clone(),
            },
            loc: instr.loc.clone(),
        });
        call_args.push(Operand::Value(widened));
    } else {
        call_args.push(arg_ops[1].clone());
    }
    call_args.push(arg_ops[2].clone());
    rewritten.push(Instr {
        result: instr.result,
        name: instr.name.clone(),
        ty: instr.ty.clone(),
        kind: InstrKind::Call {
            callee: Operand::Func(callee),
            args: call_args,
            fn_ty,
            kind: CallKind::Call,
        },
        loc: instr.loc.clone(),
    });

    let block = &mut engine.module.function_mut(func).blocks[site.block.0 as usize];
    block.instrs.splice(site.index..site.index + 1, rewritten);
    engine.frame_mut()?.next_instr = site.index;
    Ok(())
}
