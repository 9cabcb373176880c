//! Builders for materializing modules.
//!
//! The textual/bitcode loader lives outside this crate; whatever front
//! end is in use materializes its output through these builders. Tests
//! use them directly.

use super::instr::{
    BinOp, BlockId, CallKind, CastOp, Constant, FloatPredicate, FuncId, GlobalId, Instr,
    InstrKind, IntPredicate, Operand, SourceLoc, ValueId,
};
use super::module::{Block, Function, GlobalVar, Module};
use super::types::{Type, TypeRef};

/// Accumulates a module.
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module: Module::new(name),
        }
    }

    pub fn global(&mut self, name: impl Into<String>, ty: TypeRef, init: Option<Constant>) -> GlobalId {
        let align = self.module.layout.abi_align_of(&ty);
        self.module.globals.push(GlobalVar {
            name: name.into(),
            ty,
            init,
            align,
        });
        GlobalId(self.module.globals.len() as u32 - 1)
    }

    /// Declare a function with no body; calls to it route through the
    /// oracle by name.
    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        ret: TypeRef,
    ) -> FuncId {
        self.declare(name, params, ret, false)
    }

    pub fn declare_varargs_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        ret: TypeRef,
    ) -> FuncId {
        self.declare(name, params, ret, true)
    }

    fn declare(
        &mut self,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        ret: TypeRef,
        var_args: bool,
    ) -> FuncId {
        let next_value = params.len() as u32;
        self.module.functions.push(Function {
            name: name.into(),
            params,
            ret,
            var_args,
            blocks: Vec::new(),
            next_value,
        });
        FuncId(self.module.functions.len() as u32 - 1)
    }

    /// Reserve a function slot and open a body builder for it.
    pub fn define_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        ret: TypeRef,
    ) -> (FuncId, FunctionBuilder) {
        let id = self.declare(name, params, ret, false);
        let arity = self.module.function(id).params.len() as u32;
        (id, FunctionBuilder::new(id, arity))
    }

    pub fn define_varargs_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        ret: TypeRef,
    ) -> (FuncId, FunctionBuilder) {
        let id = self.declare(name, params, ret, true);
        let arity = self.module.function(id).params.len() as u32;
        (id, FunctionBuilder::new(id, arity))
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn finish(self) -> Module {
        self.module
    }
}

/// Accumulates one function body. `finish` writes it back into the
/// module slot reserved by [`ModuleBuilder::define_function`].
pub struct FunctionBuilder {
    id: FuncId,
    blocks: Vec<Block>,
    current: usize,
    next_value: u32,
    cur_loc: Option<SourceLoc>,
}

impl FunctionBuilder {
    fn new(id: FuncId, arity: u32) -> Self {
        Self {
            id,
            blocks: Vec::new(),
            current: 0,
            next_value: arity,
            cur_loc: None,
        }
    }

    /// Append a new block and make it current.
    pub fn block(&mut self, name: impl Into<String>) -> BlockId {
        self.blocks.push(Block {
            name: name.into(),
            instrs: Vec::new(),
        });
        self.current = self.blocks.len() - 1;
        BlockId(self.current as u32)
    }

    pub fn select_block(&mut self, block: BlockId) {
        assert!((block.0 as usize) < self.blocks.len());
        self.current = block.0 as usize;
    }

    /// The i-th formal argument.
    pub fn arg(&self, index: u32) -> Operand {
        Operand::Value(ValueId(index))
    }

    /// Attach a source location to subsequently emitted instructions.
    pub fn set_loc(&mut self, directory: &str, file: &str, line: u32, column: u32) {
        self.cur_loc = Some(SourceLoc {
            directory: directory.to_string(),
            file: file.to_string(),
            line,
            column,
        });
    }

    pub fn clear_loc(&mut self) {
        self.cur_loc = None;
    }

    fn emit(&mut self, ty: TypeRef, kind: InstrKind) -> Operand {
        assert!(!self.blocks.is_empty(), "no block selected");
        let result = ValueId(self.next_value);
        self.next_value += 1;
        self.blocks[self.current].instrs.push(Instr {
            result,
            name: None,
            ty,
            kind,
            loc: self.cur_loc.clone(),
        });
        Operand::Value(result)
    }

    pub fn binary(&mut self, op: BinOp, ty: TypeRef, lhs: Operand, rhs: Operand) -> Operand {
        self.emit(ty, InstrKind::Binary { op, lhs, rhs })
    }

    pub fn fneg(&mut self, ty: TypeRef, src: Operand) -> Operand {
        self.emit(ty, InstrKind::FNeg(src))
    }

    pub fn icmp(&mut self, pred: IntPredicate, lhs: Operand, rhs: Operand) -> Operand {
        self.emit(Type::int(1), InstrKind::ICmp { pred, lhs, rhs })
    }

    /// Elementwise comparison over vectors, producing a mask.
    pub fn icmp_vector(
        &mut self,
        pred: IntPredicate,
        len: u64,
        lhs: Operand,
        rhs: Operand,
    ) -> Operand {
        self.emit(
            Type::vector(Type::int(1), len),
            InstrKind::ICmp { pred, lhs, rhs },
        )
    }

    pub fn fcmp(&mut self, pred: FloatPredicate, lhs: Operand, rhs: Operand) -> Operand {
        self.emit(Type::int(1), InstrKind::FCmp { pred, lhs, rhs })
    }

    pub fn fcmp_vector(
        &mut self,
        pred: FloatPredicate,
        len: u64,
        lhs: Operand,
        rhs: Operand,
    ) -> Operand {
        self.emit(
            Type::vector(Type::int(1), len),
            InstrKind::FCmp { pred, lhs, rhs },
        )
    }

    pub fn select(
        &mut self,
        ty: TypeRef,
        cond: Operand,
        on_true: Operand,
        on_false: Operand,
    ) -> Operand {
        self.emit(
            ty,
            InstrKind::Select {
                cond,
                on_true,
                on_false,
            },
        )
    }

    pub fn cast(&mut self, op: CastOp, ty: TypeRef, src: Operand) -> Operand {
        self.emit(ty, InstrKind::Cast { op, src })
    }

    pub fn alloca(&mut self, allocated: TypeRef, count: Operand, align: u64) -> Operand {
        self.emit(
            Type::ptr(),
            InstrKind::Alloca {
                allocated,
                count,
                align,
            },
        )
    }

    pub fn load(&mut self, ty: TypeRef, ptr: Operand) -> Operand {
        self.emit(
            ty,
            InstrKind::Load {
                ptr,
                volatile: false,
            },
        )
    }

    pub fn store(&mut self, value: Operand, ptr: Operand) {
        self.emit(
            Type::void(),
            InstrKind::Store {
                value,
                ptr,
                volatile: false,
            },
        );
    }

    pub fn gep(&mut self, source_ty: TypeRef, base: Operand, indices: Vec<Operand>) -> Operand {
        self.emit(
            Type::ptr(),
            InstrKind::Gep {
                source_ty,
                base,
                indices,
            },
        )
    }

    pub fn extract_element(&mut self, ty: TypeRef, vec: Operand, index: Operand) -> Operand {
        self.emit(ty, InstrKind::ExtractElement { vec, index })
    }

    pub fn insert_element(
        &mut self,
        ty: TypeRef,
        vec: Operand,
        elem: Operand,
        index: Operand,
    ) -> Operand {
        self.emit(ty, InstrKind::InsertElement { vec, elem, index })
    }

    pub fn shuffle_vector(
        &mut self,
        ty: TypeRef,
        lhs: Operand,
        rhs: Operand,
        mask: Vec<i32>,
    ) -> Operand {
        self.emit(ty, InstrKind::ShuffleVector { lhs, rhs, mask })
    }

    pub fn extract_value(&mut self, ty: TypeRef, agg: Operand, indices: Vec<u32>) -> Operand {
        self.emit(ty, InstrKind::ExtractValue { agg, indices })
    }

    pub fn insert_value(
        &mut self,
        ty: TypeRef,
        agg: Operand,
        elem: Operand,
        indices: Vec<u32>,
    ) -> Operand {
        self.emit(ty, InstrKind::InsertValue { agg, elem, indices })
    }

    pub fn phi(&mut self, ty: TypeRef, incoming: Vec<(BlockId, Operand)>) -> Operand {
        self.emit(ty, InstrKind::Phi { incoming })
    }

    pub fn call(&mut self, fn_ty: TypeRef, callee: Operand, args: Vec<Operand>) -> Operand {
        let ret = match fn_ty.as_ref() {
            Type::Func { ret, .. } => ret.clone(),
            _ => panic!("call requires a function type"),
        };
        self.emit(
            ret,
            InstrKind::Call {
                callee,
                args,
                fn_ty,
                kind: CallKind::Call,
            },
        )
    }

    pub fn invoke(
        &mut self,
        fn_ty: TypeRef,
        callee: Operand,
        args: Vec<Operand>,
        normal: BlockId,
        unwind: BlockId,
    ) -> Operand {
        let ret = match fn_ty.as_ref() {
            Type::Func { ret, .. } => ret.clone(),
            _ => panic!("invoke requires a function type"),
        };
        self.emit(
            ret,
            InstrKind::Call {
                callee,
                args,
                fn_ty,
                kind: CallKind::Invoke { normal, unwind },
            },
        )
    }

    pub fn va_arg(&mut self, ty: TypeRef, list: Operand) -> Operand {
        self.emit(ty, InstrKind::VaArg { list })
    }

    pub fn ret(&mut self, value: Operand) {
        self.emit(Type::void(), InstrKind::Ret(Some(value)));
    }

    pub fn ret_void(&mut self) {
        self.emit(Type::void(), InstrKind::Ret(None));
    }

    pub fn br(&mut self, dest: BlockId) {
        self.emit(Type::void(), InstrKind::Br { dest });
    }

    pub fn cond_br(&mut self, cond: Operand, on_true: BlockId, on_false: BlockId) {
        self.emit(
            Type::void(),
            InstrKind::CondBr {
                cond,
                on_true,
                on_false,
            },
        );
    }

    pub fn switch(&mut self, cond: Operand, default: BlockId, cases: Vec<(Constant, BlockId)>) {
        self.emit(
            Type::void(),
            InstrKind::Switch {
                cond,
                default,
                cases,
            },
        );
    }

    pub fn indirect_br(&mut self, addr: Operand, dests: Vec<BlockId>) {
        self.emit(Type::void(), InstrKind::IndirectBr { addr, dests });
    }

    pub fn unreachable(&mut self) {
        self.emit(Type::void(), InstrKind::Unreachable);
    }

    /// Write the body back into the module.
    pub fn finish(self, mb: &mut ModuleBuilder) -> FuncId {
        let func = mb.module.function_mut(self.id);
        assert!(func.blocks.is_empty(), "function body already defined");
        assert!(!self.blocks.is_empty(), "function body has no blocks");
        func.blocks = self.blocks;
        func.next_value = self.next_value;
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_module() {
        let mut mb = ModuleBuilder::new("unit");
        let (id, mut fb) = mb.define_function("seven", vec![], Type::int(32));
        fb.block("entry");
        fb.ret(Operand::Const(Constant::int(32, 7)));
        fb.finish(&mut mb);

        let module = mb.finish();
        assert_eq!(module.find_function("seven"), Some(id));
        let f = module.function(id);
        assert!(!f.is_declaration());
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.blocks[0].instrs.len(), 1);
    }

    #[test]
    fn declarations_have_no_body() {
        let mut mb = ModuleBuilder::new("unit");
        let id = mb.declare_function("puts", vec![Type::ptr()], Type::int(32));
        let module = mb.finish();
        assert!(module.function(id).is_declaration());
        assert!(module.function(id).intrinsic_name().is_none());
    }
}
