//! Per-instruction execution: one flat dispatch over the instruction
//! kind plus a small handler per opcode family.

use crate::apint::IntValue;
use crate::ir::{
    BlockId, CallKind, CastOp, Constant, Instr, InstrKind, IntPredicate, Operand, Type, TypeRef,
};
use crate::oracle::MIRI_POINTER_BIT_WIDTH;

use super::cast;
use super::engine::Engine;
use super::error::EngineError;
use super::intrinsics;
use super::ops;
use super::value::{Value, ValueKind};

impl Engine {
    pub(crate) fn execute_instr(&mut self, instr: &Instr) -> Result<(), EngineError> {
        match &instr.kind {
            InstrKind::Binary { op, lhs, rhs } => {
                let a = self.operand_value(lhs)?;
                let b = self.operand_value(rhs)?;
                let r = ops::binary(*op, &a, &b)?;
                self.bind(instr, r)
            }
            InstrKind::FNeg(src) => {
                let v = self.operand_value(src)?;
                let r = ops::fneg(&v)?;
                self.bind(instr, r)
            }
            InstrKind::ICmp { pred, lhs, rhs } => {
                let a = self.operand_value(lhs)?;
                let b = self.operand_value(rhs)?;
                let r = ops::icmp(*pred, &a, &b)?;
                self.bind(instr, r)
            }
            InstrKind::FCmp { pred, lhs, rhs } => {
                let a = self.operand_value(lhs)?;
                let b = self.operand_value(rhs)?;
                let r = ops::fcmp(*pred, &a, &b)?;
                self.bind(instr, r)
            }
            InstrKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                let c = self.operand_value(cond)?;
                let t = self.operand_value(on_true)?;
                let f = self.operand_value(on_false)?;
                let r = ops::select(&c, &t, &f)?;
                self.bind(instr, r)
            }
            InstrKind::Cast { op, src } => self.exec_cast(instr, *op, src),
            InstrKind::Alloca {
                allocated,
                count,
                align,
            } => self.exec_alloca(instr, allocated, count, *align),
            InstrKind::Load { ptr, volatile } => self.exec_load(instr, ptr, *volatile),
            InstrKind::Store {
                value,
                ptr,
                volatile,
            } => self.exec_store(value, ptr, *volatile),
            InstrKind::Gep {
                source_ty,
                base,
                indices,
            } => self.exec_gep(instr, source_ty, base, indices),
            InstrKind::ExtractElement { vec, index } => self.exec_extract_element(instr, vec, index),
            InstrKind::InsertElement { vec, elem, index } => {
                self.exec_insert_element(instr, vec, elem, index)
            }
            InstrKind::ShuffleVector { lhs, rhs, mask } => {
                self.exec_shuffle_vector(instr, lhs, rhs, mask)
            }
            InstrKind::ExtractValue { agg, indices } => self.exec_extract_value(instr, agg, indices),
            InstrKind::InsertValue { agg, elem, indices } => {
                self.exec_insert_value(instr, agg, elem, indices)
            }
            InstrKind::Phi { .. } => Err(EngineError::fatal(
                "PHI nodes should have been resolved at block entry",
            )),
            InstrKind::Call {
                callee,
                args,
                fn_ty,
                kind,
            } => self.exec_call(instr, callee, args, fn_ty, *kind),
            InstrKind::InlineAsm => Err(EngineError::fatal(
                "inline assembly instruction not supported",
            )),
            InstrKind::VaArg { list } => self.exec_va_arg(instr, list),
            InstrKind::Ret(value) => {
                let result = match value {
                    Some(op) => Some(self.operand_value(op)?),
                    None => None,
                };
                self.pop_and_return(result)
            }
            InstrKind::Br { dest } => self.switch_block(*dest),
            InstrKind::CondBr {
                cond,
                on_true,
                on_false,
            } => {
                let c = self.operand_value(cond)?;
                let dest = if c.is_true() { *on_true } else { *on_false };
                self.switch_block(dest)
            }
            InstrKind::Switch {
                cond,
                default,
                cases,
            } => {
                let c = self.operand_value(cond)?;
                let mut dest = *default;
                for (case, block) in cases {
                    let case_value = self.const_value(case)?;
                    if ops::icmp(IntPredicate::Eq, &c, &case_value)?.is_true() {
                        dest = *block;
                        break;
                    }
                }
                self.switch_block(dest)
            }
            InstrKind::IndirectBr { addr, dests } => {
                let target = self
                    .operand_value(addr)?
                    .as_ptr()
                    .ok_or_else(|| EngineError::fatal("indirectbr requires a pointer operand"))?;
                let Some((func, block)) = self.decode_block_addr(target.addr) else {
                    return Err(EngineError::fatal(
                        "indirectbr to an address that is not a block address",
                    ));
                };
                if func != self.frame()?.func || !dests.contains(&block) {
                    return Err(EngineError::fatal(
                        "indirectbr to a block that is not among its destinations",
                    ));
                }
                self.switch_block(block)
            }
            InstrKind::Unreachable => Err(EngineError::fatal(
                "program executed an 'unreachable' instruction",
            )),
        }
    }

    /// Jump to `dest`, resolving its PHI nodes atomically: all
    /// incoming values are read against the predecessor block before
    /// any of them is bound.
    pub(crate) fn switch_block(&mut self, dest: BlockId) -> Result<(), EngineError> {
        let (func, prev) = {
            let frame = self.frame()?;
            (frame.func, frame.block)
        };
        let mut bindings: Vec<(crate::ir::ValueId, TypeRef, Value)> = Vec::new();
        {
            let block = self.module.function(func).block(dest);
            for instr in &block.instrs {
                let InstrKind::Phi { incoming } = &instr.kind else {
                    break;
                };
                let Some((_, op)) = incoming.iter().find(|(from, _)| *from == prev) else {
                    return Err(EngineError::fatal(format!(
                        "PHI node has no entry for predecessor block b{}",
                        prev.0
                    )));
                };
                bindings.push((instr.result, instr.ty.clone(), self.operand_value(op)?));
            }
        }
        let phi_count = bindings.len();
        let frame = self.frame_mut()?;
        frame.block = dest;
        frame.next_instr = phi_count;
        for (id, ty, value) in bindings {
            frame.set(id, value.with_type(ty));
        }
        Ok(())
    }

    fn exec_cast(&mut self, instr: &Instr, op: CastOp, src: &Operand) -> Result<(), EngineError> {
        match op {
            CastOp::PtrToInt => {
                let ptr = self
                    .operand_value(src)?
                    .as_ptr()
                    .ok_or_else(|| EngineError::fatal("invalid PtrToInt instruction"))?;
                let image = self.oracle_ptr_to_int(ptr)?;
                self.bind(
                    instr,
                    Value::int(IntValue::new(MIRI_POINTER_BIT_WIDTH, image)),
                )
            }
            CastOp::IntToPtr => {
                let v = self.operand_value(src)?;
                let bits = v
                    .as_int()
                    .ok_or_else(|| EngineError::fatal("invalid IntToPtr instruction"))?
                    .zext_or_trunc(MIRI_POINTER_BIT_WIDTH);
                let ptr = self.oracle_int_to_ptr(bits.to_u64())?;
                self.bind(instr, Value::ptr(ptr))
            }
            _ => {
                let v = self.operand_value(src)?;
                let r = cast::cast(op, &v, &instr.ty, &self.module.layout)?;
                self.bind(instr, r)
            }
        }
    }

    fn exec_alloca(
        &mut self,
        instr: &Instr,
        allocated: &TypeRef,
        count: &Operand,
        align: u64,
    ) -> Result<(), EngineError> {
        let elements = self
            .operand_value(count)?
            .as_int()
            .ok_or_else(|| EngineError::fatal("alloca element count must be an integer"))?
            .to_u64();
        let elem_size = self.module.layout.alloc_size_of(allocated);
        // Never allocate zero bytes.
        let bytes = elements.saturating_mul(elem_size).max(1);
        let align = if align == 0 {
            self.module.layout.abi_align_of(allocated)
        } else {
            align
        };
        let ptr = self.oracle_malloc(bytes, align, true)?;
        self.bind(instr, Value::ptr(ptr))?;
        self.frame_mut()?.allocas.push(ptr);
        Ok(())
    }

    fn exec_load(&mut self, instr: &Instr, ptr: &Operand, volatile: bool) -> Result<(), EngineError> {
        let src = self
            .operand_value(ptr)?
            .as_ptr()
            .ok_or_else(|| EngineError::fatal("load requires a pointer operand"))?;
        let value = self.oracle_load(src, &instr.ty)?;
        if volatile {
            tracing::debug!(target: "galena", "volatile load {}", instr);
        }
        self.bind(instr, value)
    }

    fn exec_store(&mut self, value: &Operand, ptr: &Operand, volatile: bool) -> Result<(), EngineError> {
        let v = self.operand_value(value)?;
        let dst = self
            .operand_value(ptr)?
            .as_ptr()
            .ok_or_else(|| EngineError::fatal("store requires a pointer operand"))?;
        if volatile {
            tracing::debug!(target: "galena", "volatile store to {:#x}", dst.addr);
        }
        let ty = Self::type_of_value(&v)?;
        self.oracle_store(&v, dst, &ty)
    }

    fn gep_index(&self, op: &Operand) -> Result<i64, EngineError> {
        let value = self.operand_value(op)?;
        let index = value
            .as_int()
            .ok_or_else(|| EngineError::fatal("getelementptr index must be an integer"))?;
        match index.width() {
            32 => Ok(index.to_u64() as u32 as i32 as i64),
            64 => Ok(index.to_u64() as i64),
            _ => Err(EngineError::fatal("invalid index type for getelementptr")),
        }
    }

    /// Accumulate the byte offset of a typed pointer walk, then let
    /// the oracle perform the actual pointer arithmetic so provenance
    /// can participate.
    fn exec_gep(
        &mut self,
        instr: &Instr,
        source_ty: &TypeRef,
        base: &Operand,
        indices: &[Operand],
    ) -> Result<(), EngineError> {
        let base_ptr = self
            .operand_value(base)?
            .as_ptr()
            .ok_or_else(|| EngineError::fatal("cannot getelementptr of a non-pointer value"))?;
        let mut offset: i64 = 0;
        let mut remaining = indices.iter();
        if let Some(first) = remaining.next() {
            let idx = self.gep_index(first)?;
            offset =
                offset.wrapping_add(idx.wrapping_mul(self.module.layout.alloc_size_of(source_ty) as i64));
        }
        let mut cur = source_ty.clone();
        for op in remaining {
            let (delta, next) = match cur.as_ref() {
                Type::Struct { fields, .. } => {
                    let Operand::Const(Constant::Int(field)) = op else {
                        return Err(EngineError::fatal(
                            "struct indices in getelementptr must be constant integers",
                        ));
                    };
                    let field = field.to_u64() as usize;
                    if field >= fields.len() {
                        return Err(EngineError::fatal(
                            "struct index out of range in getelementptr",
                        ));
                    }
                    let layout = self.module.layout.struct_layout(cur.as_ref());
                    (layout.offsets[field] as i64, fields[field].clone())
                }
                Type::Array { elem, .. } | Type::Vector { elem, .. } => {
                    let idx = self.gep_index(op)?;
                    let delta = idx.wrapping_mul(self.module.layout.alloc_size_of(elem) as i64);
                    (delta, elem.clone())
                }
                other => {
                    return Err(EngineError::fatal(format!(
                        "cannot index into type {} in getelementptr",
                        other
                    )));
                }
            };
            offset = offset.wrapping_add(delta);
            cur = next;
        }
        let result = self.oracle_gep(base_ptr, offset as u64)?;
        self.bind(instr, Value::ptr(result))
    }

    fn exec_extract_element(
        &mut self,
        instr: &Instr,
        vec: &Operand,
        index: &Operand,
    ) -> Result<(), EngineError> {
        let v = self.operand_value(vec)?;
        let idx = self
            .operand_value(index)?
            .as_int()
            .ok_or_else(|| EngineError::fatal("extractelement index must be an integer"))?
            .to_u64() as usize;
        let elems = v
            .elems()
            .ok_or_else(|| EngineError::fatal("extractelement of a non-vector value"))?;
        let elem = elems
            .get(idx)
            .cloned()
            .ok_or_else(|| EngineError::fatal("invalid index in extractelement instruction"))?;
        self.bind(instr, elem)
    }

    fn exec_insert_element(
        &mut self,
        instr: &Instr,
        vec: &Operand,
        elem: &Operand,
        index: &Operand,
    ) -> Result<(), EngineError> {
        let mut v = self.operand_value(vec)?;
        let new_elem = self.operand_value(elem)?;
        let idx = self
            .operand_value(index)?
            .as_int()
            .ok_or_else(|| EngineError::fatal("insertelement index must be an integer"))?
            .to_u64() as usize;
        let elems = v
            .elems_mut()
            .ok_or_else(|| EngineError::fatal("insertelement of a non-vector value"))?;
        let slot = elems
            .get_mut(idx)
            .ok_or_else(|| EngineError::fatal("invalid index in insertelement instruction"))?;
        *slot = new_elem;
        self.bind(instr, v)
    }

    fn exec_shuffle_vector(
        &mut self,
        instr: &Instr,
        lhs: &Operand,
        rhs: &Operand,
        mask: &[i32],
    ) -> Result<(), EngineError> {
        let a = self.operand_value(lhs)?;
        let b = self.operand_value(rhs)?;
        let (a, b) = match (a.elems(), b.elems()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(EngineError::fatal(
                    "shufflevector requires vector operands",
                ));
            }
        };
        let mut out = Vec::with_capacity(mask.len());
        for &m in mask {
            // Undef lanes (-1) read lane zero, deterministically.
            let j = m.max(0) as usize;
            let elem = if j < a.len() {
                a[j].clone()
            } else if j < a.len() + b.len() {
                b[j - a.len()].clone()
            } else {
                return Err(EngineError::fatal(
                    "invalid mask in shufflevector instruction",
                ));
            };
            out.push(elem);
        }
        self.bind(instr, Value::aggregate(out))
    }

    fn exec_extract_value(
        &mut self,
        instr: &Instr,
        agg: &Operand,
        indices: &[u32],
    ) -> Result<(), EngineError> {
        let value = self.operand_value(agg)?;
        let mut cur = &value;
        for &index in indices {
            cur = cur
                .elems()
                .and_then(|elems| elems.get(index as usize))
                .ok_or_else(|| {
                    EngineError::fatal("invalid index in extractvalue instruction")
                })?;
        }
        let result = cur.clone();
        self.bind(instr, result)
    }

    fn exec_insert_value(
        &mut self,
        instr: &Instr,
        agg: &Operand,
        elem: &Operand,
        indices: &[u32],
    ) -> Result<(), EngineError> {
        let mut value = self.operand_value(agg)?;
        let new_elem = self.operand_value(elem)?;
        let mut slot = &mut value;
        for &index in indices {
            slot = slot
                .elems_mut()
                .and_then(|elems| elems.get_mut(index as usize))
                .ok_or_else(|| EngineError::fatal("invalid index in insertvalue instruction"))?;
        }
        *slot = new_elem;
        self.bind(instr, value)
    }

    fn exec_call(
        &mut self,
        instr: &Instr,
        callee: &Operand,
        arg_ops: &[Operand],
        fn_ty: &TypeRef,
        kind: CallKind,
    ) -> Result<(), EngineError> {
        let site = self
            .frame()?
            .prev_instr
            .ok_or_else(|| EngineError::fatal("call with no instruction cursor"))?;
        self.frame_mut()?.call_site = Some(site);
        let mut args = Vec::with_capacity(arg_ops.len());
        for op in arg_ops {
            args.push(self.operand_value(op)?);
        }
        let ret_ty = match fn_ty.as_ref() {
            Type::Func { ret, .. } => ret.clone(),
            _ => instr.ty.clone(),
        };
        let target = self
            .operand_value(callee)?
            .as_ptr()
            .ok_or_else(|| EngineError::fatal("called operand is not a pointer value"))?;
        // Non-null provenance marks a pointer the oracle handed out:
        // the callee lives outside the module.
        if target.prov.alloc_id != 0 {
            self.oracle_call_by_pointer(target, args, &ret_ty)?;
            self.frame_mut()?.must_resolve_pending_return = true;
            return Ok(());
        }
        let func = self.function_by_address(target.addr).ok_or_else(|| {
            EngineError::fatal(format!(
                "call to an unknown function address {:#x}",
                target.addr
            ))
        })?;
        let function = self.module.function(func);
        if let Some(name) = function.intrinsic_name() {
            let name = name.to_string();
            return intrinsics::dispatch_intrinsic(self, instr, &name, args, arg_ops, kind);
        }
        if function.is_declaration() {
            let name = function.name.clone();
            return self.call_external(&name, args, &ret_ty);
        }
        self.call_function(func, args)
    }

    fn exec_va_arg(&mut self, instr: &Instr, list: &Operand) -> Result<(), EngineError> {
        let list_ptr = self
            .operand_value(list)?
            .as_ptr()
            .ok_or_else(|| EngineError::fatal("va_arg requires a pointer to a va_list"))?;
        let ptr_ty = Type::ptr();
        let index_image = self.oracle_load(list_ptr, &ptr_ty)?;
        let (frame_index, arg_index) = index_image
            .as_uint_pair()
            .ok_or_else(|| EngineError::fatal("va_list does not hold an argument cursor"))?;
        let stack_size = self.stack_size();
        if frame_index as usize >= stack_size {
            return Err(EngineError::fatal(format!(
                "invalid va_list stack index {} for stack size {}",
                frame_index, stack_size
            )));
        }
        let var_args = &self.cur_thread()?.stack[frame_index as usize].var_args;
        if arg_index as usize >= var_args.len() {
            return Err(EngineError::fatal(format!(
                "invalid va_list argument index {} for argument list of size {}",
                arg_index,
                var_args.len()
            )));
        }
        let value = var_args[arg_index as usize].clone();
        let matches_ty = matches!(
            (instr.ty.as_ref(), &value.kind),
            (Type::Int(_), ValueKind::Int(_))
                | (Type::Ptr, ValueKind::Ptr(_))
                | (Type::Float, ValueKind::F32(_))
                | (Type::Double, ValueKind::F64(_))
        );
        if !matches_ty {
            return Err(EngineError::fatal(format!(
                "unhandled type for va_arg instruction: {}",
                instr.ty
            )));
        }
        self.bind(instr, value)?;
        let advanced = Value::pair(frame_index, arg_index + 1);
        self.oracle_store(&advanced, list_ptr, &ptr_ty)
    }
}
