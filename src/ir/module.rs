//! Modules, functions, blocks and globals.

use super::instr::{BlockId, Constant, FuncId, GlobalId, Instr};
use super::layout::DataLayout;
use super::types::{Type, TypeRef};

/// A basic block: a straight run of instructions ending in a terminator.
#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub instrs: Vec<Instr>,
}

/// A function. Declarations have no blocks; calls to them route through
/// the oracle by name.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<TypeRef>,
    pub ret: TypeRef,
    pub var_args: bool,
    pub blocks: Vec<Block>,
    /// Next free SSA id; arguments occupy `0..params.len()`.
    pub next_value: u32,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The intrinsic name, for `llvm.`-prefixed declarations.
    pub fn intrinsic_name(&self) -> Option<&str> {
        if self.is_declaration() && self.name.starts_with("llvm.") {
            Some(&self.name)
        } else {
            None
        }
    }

    pub fn fn_type(&self) -> TypeRef {
        Type::func(self.params.clone(), self.ret.clone(), self.var_args)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub const ENTRY: BlockId = BlockId(0);
}

/// A module-level variable. The oracle owns its storage; the engine
/// announces it through the `register_global` hook at first bind.
#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    pub ty: TypeRef,
    pub init: Option<Constant>,
    pub align: u64,
}

/// A materialized module: what the (external) loader produces and the
/// engine consumes.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub layout: DataLayout,
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVar>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layout: DataLayout::default(),
            functions: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVar {
        &self.globals[id.0 as usize]
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn find_global(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == name)
            .map(|i| GlobalId(i as u32))
    }
}
