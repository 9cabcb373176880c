//! The execution engine: module ownership, oracle hook table, logical
//! threads, and the external drive points (`run_function`,
//! `create_thread` / `step_thread`, `terminate_thread`).

use std::collections::HashMap;
use std::ffi::{CString, c_void};

use tracing::{debug, trace};

use crate::ir::{
    BlockId, CallKind, Constant, FuncId, GlobalId, Instr, InstrKind, Module, Operand, Type,
    TypeRef, ValueId, layout_type,
};
use crate::oracle::{
    MiriCallByName, MiriCallByPointer, MiriErrorTrace, MiriFree, MiriGetElementPointer,
    MiriIntToPtr, MiriLoadStore, MiriMalloc, MiriMemcpy, MiriMemset, MiriPointer, MiriPtrToInt,
    MiriRegisterGlobal, MiriStackTraceRecorder, OracleHooks, ValueArray,
};

use super::error::{EngineError, TraceFrame};
use super::frame::{Frame, InstrRef};
use super::thread::ExecThread;
use super::value::{Value, ValueKind};

/// Thread id used by `run_function` when the host has not created any
/// threads of its own.
pub const MAIN_THREAD_ID: u64 = 0;

// Synthetic address ranges for module entities. Functions and block
// addresses never collide with oracle allocations; globals use their
// range only until the oracle hands back authoritative pointers.
const FUNCTION_ADDR_BASE: u64 = 0x5A00_0000_0000_0000;
const GLOBAL_ADDR_BASE: u64 = 0x6A00_0000_0000_0000;
const BLOCK_ADDR_BASE: u64 = 0x7A00_0000_0000_0000;

pub(crate) fn function_address(func: FuncId) -> u64 {
    FUNCTION_ADDR_BASE + (func.0 as u64 + 1) * 16
}

pub(crate) fn block_address(func: FuncId, block: BlockId) -> u64 {
    BLOCK_ADDR_BASE | ((func.0 as u64 + 1) << 20) | block.0 as u64
}

fn decode_block_address(addr: u64) -> Option<(FuncId, BlockId)> {
    if addr & BLOCK_ADDR_BASE != BLOCK_ADDR_BASE {
        return None;
    }
    let func = ((addr >> 20) & 0xfff_ffff) as u32;
    if func == 0 {
        return None;
    }
    Some((FuncId(func - 1), BlockId((addr & 0xf_ffff) as u32)))
}

/// The interpreter engine. One engine owns one materialized module and
/// any number of logical threads driven by an external scheduler.
pub struct Engine {
    pub(crate) module: Module,
    pub(crate) hooks: OracleHooks,
    globals_emitted: bool,
    /// Authoritative pointer per global once the oracle registered it.
    global_ptrs: Vec<MiriPointer>,
    funcs_by_addr: HashMap<u64, FuncId>,
    pub(crate) threads: HashMap<u64, ExecThread>,
    current_thread: u64,
    ctors: Vec<FuncId>,
    dtors: Vec<FuncId>,
    at_exit: Vec<FuncId>,
    error_flag: bool,
    error_msg: Option<String>,
    trace: Vec<TraceFrame>,
}

impl Engine {
    /// Take ownership of a materialized module.
    pub fn new(module: Module) -> Self {
        let funcs_by_addr = (0..module.functions.len() as u32)
            .map(|i| (function_address(FuncId(i)), FuncId(i)))
            .collect();
        let global_ptrs = (0..module.globals.len() as u64)
            .map(|i| MiriPointer::with_addr(GLOBAL_ADDR_BASE + (i + 1) * 16))
            .collect();
        let mut threads = HashMap::new();
        threads.insert(MAIN_THREAD_ID, ExecThread::new(MAIN_THREAD_ID));
        Self {
            module,
            hooks: OracleHooks::default(),
            globals_emitted: false,
            global_ptrs,
            funcs_by_addr,
            threads,
            current_thread: MAIN_THREAD_ID,
            ctors: Vec::new(),
            dtors: Vec::new(),
            at_exit: Vec::new(),
            error_flag: false,
            error_msg: None,
            trace: Vec::new(),
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    // ------------------------------------------------------------------
    // Hook installation
    // ------------------------------------------------------------------

    pub fn set_malloc_hook(&mut self, hook: MiriMalloc) {
        self.hooks.malloc = Some(hook);
    }

    pub fn set_free_hook(&mut self, hook: MiriFree) {
        self.hooks.free = Some(hook);
    }

    pub fn set_load_hook(&mut self, hook: MiriLoadStore) {
        self.hooks.load = Some(hook);
    }

    pub fn set_store_hook(&mut self, hook: MiriLoadStore) {
        self.hooks.store = Some(hook);
    }

    pub fn set_memset_hook(&mut self, hook: MiriMemset) {
        self.hooks.memset = Some(hook);
    }

    pub fn set_memcpy_hook(&mut self, hook: MiriMemcpy) {
        self.hooks.memcpy = Some(hook);
    }

    pub fn set_int_to_ptr_hook(&mut self, hook: MiriIntToPtr) {
        self.hooks.int_to_ptr = Some(hook);
    }

    pub fn set_ptr_to_int_hook(&mut self, hook: MiriPtrToInt) {
        self.hooks.ptr_to_int = Some(hook);
    }

    pub fn set_gep_hook(&mut self, hook: MiriGetElementPointer) {
        self.hooks.gep = Some(hook);
    }

    pub fn set_register_global_hook(&mut self, hook: MiriRegisterGlobal) {
        self.hooks.register_global = Some(hook);
    }

    pub fn set_call_by_name_hook(&mut self, hook: MiriCallByName) {
        self.hooks.call_by_name = Some(hook);
    }

    pub fn set_call_by_pointer_hook(&mut self, hook: MiriCallByPointer) {
        self.hooks.call_by_pointer = Some(hook);
    }

    pub fn set_stack_trace_recorder_hook(&mut self, hook: MiriStackTraceRecorder) {
        self.hooks.stack_trace_recorder = Some(hook);
    }

    /// Install the oracle's self pointer. The first installation emits
    /// every global through the `register_global` hook.
    pub fn set_oracle_wrapper(&mut self, wrapper: *mut c_void) {
        let first = self.hooks.wrapper.is_null();
        self.hooks.wrapper = wrapper;
        if first && !wrapper.is_null() {
            self.emit_globals();
        }
    }

    fn emit_globals(&mut self) {
        if self.globals_emitted {
            return;
        }
        let Some(hook) = self.hooks.register_global else {
            let err =
                EngineError::misuse("register_global hook must be installed before the wrapper");
            self.record_failure(&err);
            return;
        };
        for index in 0..self.module.globals.len() {
            let global = &self.module.globals[index];
            let name = global.name.clone();
            let provisional = self.global_ptrs[index];
            let mut out = provisional;
            debug!(target: "galena", "registering global '{}'", name);
            let failed = unsafe {
                hook(
                    self.hooks.wrapper,
                    name.as_ptr() as *const _,
                    name.len(),
                    provisional.addr,
                    &mut out,
                )
            };
            if failed {
                let err =
                    EngineError::Oracle(format!("failed to register global '{}'", name));
                self.record_failure(&err);
                return;
            }
            self.global_ptrs[index] = out;
        }
        self.globals_emitted = true;
    }

    // ------------------------------------------------------------------
    // Constructors, destructors, at-exit handlers
    // ------------------------------------------------------------------

    /// Extract the module's constructor and destructor lists from the
    /// `llvm.global_ctors` / `llvm.global_dtors` appending globals.
    pub fn initialize_ctor_dtor_lists(&mut self) {
        self.ctors = self.extract_structors("llvm.global_ctors");
        self.dtors = self.extract_structors("llvm.global_dtors");
    }

    fn extract_structors(&self, list_name: &str) -> Vec<FuncId> {
        let Some(global) = self.module.find_global(list_name) else {
            return Vec::new();
        };
        let Some(Constant::Aggregate(entries)) = &self.module.global(global).init else {
            return Vec::new();
        };
        let mut found: Vec<(u64, FuncId)> = Vec::new();
        for entry in entries {
            let Constant::Aggregate(fields) = entry else {
                continue;
            };
            if let (Some(Constant::Int(priority)), Some(Constant::Func(func))) =
                (fields.first(), fields.get(1))
            {
                found.push((priority.to_u64(), *func));
            }
        }
        found.sort_by_key(|(priority, _)| *priority);
        found.into_iter().map(|(_, func)| func).collect()
    }

    pub fn ctor_count(&self) -> usize {
        self.ctors.len()
    }

    pub fn dtor_count(&self) -> usize {
        self.dtors.len()
    }

    pub fn ctor_at(&self, index: usize) -> Option<FuncId> {
        self.ctors.get(index).copied()
    }

    pub fn dtor_at(&self, index: usize) -> Option<FuncId> {
        self.dtors.get(index).copied()
    }

    pub(crate) fn push_at_exit(&mut self, func: FuncId) {
        self.at_exit.push(func);
    }

    fn run_at_exit_handlers(&mut self) -> Result<(), EngineError> {
        while let Some(func) = self.at_exit.pop() {
            self.call_function(func, Vec::new())?;
            self.run()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup helpers
    // ------------------------------------------------------------------

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.module.find_function(name)
    }

    fn check_function(&mut self, func: FuncId) -> Result<(), EngineError> {
        if (func.0 as usize) < self.module.functions.len() {
            return Ok(());
        }
        let err = EngineError::misuse(format!("unknown function id {}", func.0));
        self.record_failure(&err);
        Err(err)
    }

    pub fn find_global(&self, name: &str) -> Option<GlobalId> {
        self.module.find_global(name)
    }

    /// The pointer value naming a module function. Internal functions
    /// carry null provenance, which is what routes calls to them back
    /// into the engine.
    pub fn function_value(&self, func: FuncId) -> Value {
        Value::ptr(MiriPointer::with_addr(function_address(func)))
            .with_type(self.module.function(func).fn_type())
    }

    pub fn global_value(&self, global: GlobalId) -> Value {
        Value::ptr(self.global_ptrs[global.0 as usize]).with_type(Type::ptr())
    }

    pub fn global_pointer(&self, global: GlobalId) -> MiriPointer {
        self.global_ptrs[global.0 as usize]
    }

    pub(crate) fn function_by_address(&self, addr: u64) -> Option<FuncId> {
        self.funcs_by_addr.get(&addr).copied()
    }

    pub(crate) fn decode_block_addr(&self, addr: u64) -> Option<(FuncId, BlockId)> {
        decode_block_address(addr)
    }

    // ------------------------------------------------------------------
    // Thread and frame access
    // ------------------------------------------------------------------

    pub(crate) fn cur_thread(&self) -> Result<&ExecThread, EngineError> {
        self.threads
            .get(&self.current_thread)
            .ok_or_else(|| EngineError::misuse("current thread not found"))
    }

    pub(crate) fn cur_thread_mut(&mut self) -> Result<&mut ExecThread, EngineError> {
        self.threads
            .get_mut(&self.current_thread)
            .ok_or_else(|| EngineError::misuse("current thread not found"))
    }

    pub(crate) fn frame(&self) -> Result<&Frame, EngineError> {
        self.cur_thread()?
            .top()
            .ok_or_else(|| EngineError::fatal("execution stack is empty"))
    }

    pub(crate) fn frame_mut(&mut self) -> Result<&mut Frame, EngineError> {
        self.cur_thread_mut()?
            .top_mut()
            .ok_or_else(|| EngineError::fatal("execution stack is empty"))
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.cur_thread().map(|t| t.stack.len()).unwrap_or(0)
    }

    pub fn has_thread(&self, thread_id: u64) -> bool {
        self.threads.contains_key(&thread_id)
    }

    pub fn thread_exit_value(&self, thread_id: u64) -> Option<&Value> {
        self.threads.get(&thread_id).map(|t| &t.exit_value)
    }

    // ------------------------------------------------------------------
    // Operand evaluation and binding
    // ------------------------------------------------------------------

    pub(crate) fn operand_value(&self, op: &Operand) -> Result<Value, EngineError> {
        match op {
            Operand::Value(id) => self
                .frame()?
                .get(*id)
                .cloned()
                .ok_or_else(|| EngineError::fatal(format!("use of undefined value %{}", id.0))),
            Operand::Const(c) => self.const_value(c),
            Operand::Global(g) => Ok(self.global_value(*g)),
            Operand::Func(f) => Ok(self.function_value(*f)),
        }
    }

    pub(crate) fn const_value(&self, c: &Constant) -> Result<Value, EngineError> {
        Ok(match c {
            Constant::Int(v) => {
                let width = v.width();
                Value::int(v.clone()).with_type(Type::int(width))
            }
            Constant::F32(v) => Value::f32(*v).with_type(Type::float()),
            Constant::F64(v) => Value::f64(*v).with_type(Type::double()),
            Constant::NullPtr => Value::ptr(MiriPointer::null()).with_type(Type::ptr()),
            Constant::Aggregate(elems) => Value::aggregate(
                elems
                    .iter()
                    .map(|e| self.const_value(e))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Constant::Zero(ty) | Constant::Undef(ty) => Value::zero_of(ty),
            Constant::Func(f) => self.function_value(*f),
            Constant::BlockAddress(f, b) => {
                Value::ptr(MiriPointer::with_addr(block_address(*f, *b))).with_type(Type::ptr())
            }
        })
    }

    /// Bind an instruction result, stamping the declared type.
    pub(crate) fn bind(&mut self, instr: &Instr, value: Value) -> Result<(), EngineError> {
        let stamped = value.with_type(instr.ty.clone());
        self.frame_mut()?.set(instr.result, stamped);
        Ok(())
    }

    /// The static type a stored value crosses the boundary with:
    /// the stamped tag when present, otherwise inferred from the
    /// payload.
    pub(crate) fn type_of_value(value: &Value) -> Result<TypeRef, EngineError> {
        if let Some(ty) = &value.ty {
            return Ok(ty.clone());
        }
        Ok(match &value.kind {
            ValueKind::Int(v) => Type::int(v.width()),
            ValueKind::F32(_) => Type::float(),
            ValueKind::F64(_) => Type::double(),
            ValueKind::Ptr(_) | ValueKind::UintPair(..) => Type::ptr(),
            ValueKind::Aggregate(_) => {
                return Err(EngineError::fatal(
                    "cannot infer the type of an untyped aggregate",
                ));
            }
        })
    }

    // ------------------------------------------------------------------
    // Oracle crossings
    // ------------------------------------------------------------------

    fn ensure_ready(&mut self) -> Result<(), EngineError> {
        if let Some(name) = self.hooks.missing() {
            let err = EngineError::misuse(format!(
                "oracle hook '{}' must be installed before execution",
                name
            ));
            self.record_failure(&err);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn oracle_malloc(
        &self,
        size: u64,
        align: u64,
        is_stack: bool,
    ) -> Result<MiriPointer, EngineError> {
        let hook = self
            .hooks
            .malloc
            .ok_or_else(|| EngineError::misuse("malloc hook is not installed"))?;
        let ptr = unsafe { hook(self.hooks.wrapper, size, align, is_stack) };
        if ptr.addr == 0 {
            return Err(EngineError::Oracle(
                "malloc hook returned a null pointer".into(),
            ));
        }
        trace!(target: "galena", "allocated {} bytes (align {}) at {:#x}", size, align, ptr.addr);
        Ok(ptr)
    }

    pub(crate) fn oracle_free(&self, ptr: MiriPointer) -> Result<(), EngineError> {
        let hook = self
            .hooks
            .free
            .ok_or_else(|| EngineError::misuse("free hook is not installed"))?;
        if unsafe { hook(self.hooks.wrapper, ptr) } {
            return Err(EngineError::Oracle("free hook reported an error".into()));
        }
        Ok(())
    }

    pub(crate) fn oracle_load(
        &self,
        ptr: MiriPointer,
        ty: &TypeRef,
    ) -> Result<Value, EngineError> {
        let hook = self
            .hooks
            .load
            .ok_or_else(|| EngineError::misuse("load hook is not installed"))?;
        let ty = layout_type(ty);
        let bytes = self.module.layout.store_size_of(ty);
        let align = self.module.layout.abi_align_of(ty);
        let mut out = Value::default();
        trace!(target: "galena", "loading {} bytes from {:#x}", bytes, ptr.addr);
        if unsafe {
            hook(
                self.hooks.wrapper,
                &mut out,
                ptr,
                std::sync::Arc::as_ptr(ty),
                bytes,
                align,
            )
        } {
            return Err(EngineError::Oracle("load hook reported an error".into()));
        }
        Ok(out)
    }

    pub(crate) fn oracle_store(
        &self,
        value: &Value,
        ptr: MiriPointer,
        ty: &TypeRef,
    ) -> Result<(), EngineError> {
        let hook = self
            .hooks
            .store
            .ok_or_else(|| EngineError::misuse("store hook is not installed"))?;
        let ty = layout_type(ty);
        let bytes = self.module.layout.store_size_of(ty);
        let align = self.module.layout.abi_align_of(ty);
        let mut carried = value.clone();
        trace!(target: "galena", "storing {} bytes to {:#x}", bytes, ptr.addr);
        if unsafe {
            hook(
                self.hooks.wrapper,
                &mut carried,
                ptr,
                std::sync::Arc::as_ptr(ty),
                bytes,
                align,
            )
        } {
            return Err(EngineError::Oracle("store hook reported an error".into()));
        }
        Ok(())
    }

    pub(crate) fn oracle_memcpy(&self, dst: MiriPointer, bytes: &[u8]) -> Result<(), EngineError> {
        let hook = self
            .hooks
            .memcpy
            .ok_or_else(|| EngineError::misuse("memcpy hook is not installed"))?;
        if unsafe {
            hook(
                self.hooks.wrapper,
                dst,
                bytes.as_ptr() as *const _,
                bytes.len() as u64,
            )
        } {
            return Err(EngineError::Oracle("memcpy hook reported an error".into()));
        }
        Ok(())
    }

    pub(crate) fn oracle_int_to_ptr(&self, addr: u64) -> Result<MiriPointer, EngineError> {
        let hook = self
            .hooks
            .int_to_ptr
            .ok_or_else(|| EngineError::misuse("int_to_ptr hook is not installed"))?;
        Ok(unsafe { hook(self.hooks.wrapper, addr) })
    }

    pub(crate) fn oracle_ptr_to_int(&self, ptr: MiriPointer) -> Result<u64, EngineError> {
        let hook = self
            .hooks
            .ptr_to_int
            .ok_or_else(|| EngineError::misuse("ptr_to_int hook is not installed"))?;
        Ok(unsafe { hook(self.hooks.wrapper, ptr) })
    }

    pub(crate) fn oracle_gep(
        &self,
        base: MiriPointer,
        offset: u64,
    ) -> Result<MiriPointer, EngineError> {
        let hook = self
            .hooks
            .gep
            .ok_or_else(|| EngineError::misuse("gep hook is not installed"))?;
        Ok(unsafe { hook(self.hooks.wrapper, base, offset) })
    }

    pub(crate) fn oracle_call_by_name(
        &self,
        name: &str,
        args: Vec<Value>,
        ret_ty: &TypeRef,
    ) -> Result<(), EngineError> {
        let hook = self
            .hooks
            .call_by_name
            .ok_or_else(|| EngineError::misuse("call_by_name hook is not installed"))?;
        let array = ValueArray::new(args);
        debug!(target: "galena", "foreign call by name: {}", name);
        if unsafe {
            hook(
                self.hooks.wrapper,
                &array,
                name.as_ptr() as *const _,
                name.len() as u64,
                std::sync::Arc::as_ptr(ret_ty),
            )
        } {
            return Err(EngineError::Oracle(format!(
                "call_by_name hook reported an error for '{}'",
                name
            )));
        }
        Ok(())
    }

    pub(crate) fn oracle_call_by_pointer(
        &self,
        target: MiriPointer,
        args: Vec<Value>,
        ret_ty: &TypeRef,
    ) -> Result<(), EngineError> {
        let hook = self
            .hooks
            .call_by_pointer
            .ok_or_else(|| EngineError::misuse("call_by_pointer hook is not installed"))?;
        let array = ValueArray::new(args);
        debug!(target: "galena", "foreign call by pointer: {:#x}", target.addr);
        if unsafe {
            hook(
                self.hooks.wrapper,
                target,
                &array,
                std::sync::Arc::as_ptr(ret_ty),
            )
        } {
            return Err(EngineError::Oracle(
                "call_by_pointer hook reported an error".into(),
            ));
        }
        Ok(())
    }

    fn deliver_trace(&self, instr_text: &str) {
        let Some(hook) = self.hooks.stack_trace_recorder else {
            return;
        };
        let entries: Vec<MiriErrorTrace> = self
            .trace
            .iter()
            .map(|t| MiriErrorTrace {
                directory: t.directory.as_ptr() as *const _,
                directory_len: t.directory.len(),
                file: t.file.as_ptr() as *const _,
                file_len: t.file.len(),
                line: t.line,
                column: t.column,
            })
            .collect();
        unsafe {
            hook(
                self.hooks.wrapper,
                entries.as_ptr(),
                entries.len() as u64,
                instr_text.as_ptr() as *const _,
                instr_text.len() as u64,
            );
        }
    }

    // ------------------------------------------------------------------
    // Error bookkeeping
    // ------------------------------------------------------------------

    fn record_failure(&mut self, err: &EngineError) {
        self.error_flag = true;
        self.error_msg = Some(err.to_string());
    }

    /// Record a halting error: sticky flag and message always; for
    /// oracle and semantic faults also the source trace, delivered to
    /// the oracle together with the faulting instruction's text.
    pub(crate) fn record_error(&mut self, instr: Option<&Instr>, err: &EngineError) {
        self.record_failure(err);
        if matches!(err, EngineError::Misuse(_)) {
            return;
        }
        if let Some(instr) = instr {
            if let Some(loc) = &instr.loc {
                self.trace.push(TraceFrame {
                    directory: loc.directory.clone(),
                    file: loc.file.clone(),
                    line: loc.line,
                    column: loc.column,
                });
            }
        }
        // Ancestor call sites, caller-most last.
        let mut sites: Vec<TraceFrame> = Vec::new();
        if let Ok(thread) = self.cur_thread() {
            for frame in thread.stack.iter().rev().skip(1) {
                let Some(site) = frame.call_site else {
                    continue;
                };
                let instr =
                    &self.module.function(frame.func).block(site.block).instrs[site.index];
                if let Some(loc) = &instr.loc {
                    sites.push(TraceFrame {
                        directory: loc.directory.clone(),
                        file: loc.file.clone(),
                        line: loc.line,
                        column: loc.column,
                    });
                }
            }
        }
        self.trace.extend(sites);
        let text = instr.map(|i| i.to_string()).unwrap_or_default();
        self.deliver_trace(&text);
    }

    pub fn has_error(&self) -> bool {
        self.error_flag
    }

    /// The sticky error message; taking it clears the flag.
    pub fn err_msg(&mut self) -> Option<String> {
        self.error_flag = false;
        self.error_msg.take()
    }

    pub fn stack_trace(&self) -> &[TraceFrame] {
        &self.trace
    }

    // ------------------------------------------------------------------
    // Frame lifecycle
    // ------------------------------------------------------------------

    /// Release every alloca the frame owns through the free hook.
    pub(crate) fn release_frame(&mut self, frame: &Frame) -> Result<(), EngineError> {
        let mut first_err = None;
        for ptr in &frame.allocas {
            if let Err(err) = self.oracle_free(*ptr) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Push a frame for `func`, binding formals and collecting the
    /// surplus into the varargs list. Declarations route through the
    /// oracle by name instead, leaving the caller pending.
    pub(crate) fn call_function(
        &mut self,
        func: FuncId,
        args: Vec<Value>,
    ) -> Result<(), EngineError> {
        let function = self.module.function(func);
        if function.is_declaration() {
            let name = function.name.clone();
            let ret = function.ret.clone();
            return self.call_external(&name, args, &ret);
        }
        let arity = function.params.len();
        if args.len() < arity || (args.len() > arity && !function.var_args) {
            return Err(EngineError::fatal(format!(
                "invalid number of values passed to function invocation: {} for '{}'",
                args.len(),
                function.name
            )));
        }
        let params: Vec<TypeRef> = function.params.clone();
        let mut frame = Frame::new(func);
        let mut args = args.into_iter();
        for (i, ty) in params.iter().enumerate() {
            if let Some(arg) = args.next() {
                frame.set(ValueId(i as u32), arg.with_type(ty.clone()));
            }
        }
        frame.var_args = args.collect();
        self.cur_thread_mut()?.stack.push(frame);
        Ok(())
    }

    /// Route a call to a body-less function. `atexit` and `exit` are
    /// handled in the engine; everything else is a foreign call by
    /// name with a deferred result.
    pub(crate) fn call_external(
        &mut self,
        name: &str,
        args: Vec<Value>,
        ret_ty: &TypeRef,
    ) -> Result<(), EngineError> {
        match name {
            "atexit" => {
                let handler = args
                    .first()
                    .and_then(Value::as_ptr)
                    .and_then(|p| self.function_by_address(p.addr))
                    .ok_or_else(|| {
                        EngineError::fatal("atexit requires a module function pointer")
                    })?;
                self.push_at_exit(handler);
                self.finish_interposed_call(Value::of_u64(32, 0))
            }
            "exit" => {
                let code = args.into_iter().next().unwrap_or_default();
                self.exit_called(code)
            }
            _ => {
                self.oracle_call_by_name(name, args, ret_ty)?;
                if let Ok(frame) = self.frame_mut() {
                    frame.must_resolve_pending_return = true;
                }
                Ok(())
            }
        }
    }

    /// Bind the result of a call the engine answered itself, as if the
    /// pending-return protocol had completed immediately.
    fn finish_interposed_call(&mut self, result: Value) -> Result<(), EngineError> {
        let frame = self.frame_mut()?;
        let Some(site) = frame.call_site.take() else {
            return Ok(());
        };
        let func = frame.func;
        let instr = self.module.function(func).block(site.block).instrs[site.index].clone();
        if !instr.ty.is_void() {
            self.bind(&instr, result)?;
        }
        if let InstrKind::Call {
            kind: CallKind::Invoke { normal, .. },
            ..
        } = instr.kind
        {
            self.switch_block(normal)?;
        }
        Ok(())
    }

    /// `exit` semantics without leaving the process: unwind the
    /// current thread (releasing allocas), run at-exit handlers, and
    /// store the code as the thread's exit value.
    fn exit_called(&mut self, code: Value) -> Result<(), EngineError> {
        while let Some(frame) = self.cur_thread_mut()?.stack.pop() {
            self.release_frame(&frame)?;
        }
        self.run_at_exit_handlers()?;
        self.cur_thread_mut()?.exit_value = code.with_type(Type::int(32));
        Ok(())
    }

    /// Pop the top frame and hand `result` to whoever is waiting:
    /// the caller's SSA slot, or the thread's exit value at the root.
    /// Invoke call sites branch to their normal destination.
    pub(crate) fn pop_and_return(&mut self, result: Option<Value>) -> Result<(), EngineError> {
        let frame = self
            .cur_thread_mut()?
            .stack
            .pop()
            .ok_or_else(|| EngineError::fatal("return with an empty execution stack"))?;
        self.release_frame(&frame)?;
        if self.cur_thread()?.stack.is_empty() {
            self.cur_thread_mut()?.exit_value = result.unwrap_or_default();
            return Ok(());
        }
        let caller = self.frame_mut()?;
        let Some(site) = caller.call_site.take() else {
            return Ok(());
        };
        let func = caller.func;
        let instr = self.module.function(func).block(site.block).instrs[site.index].clone();
        if !instr.ty.is_void() {
            let value = result
                .ok_or_else(|| EngineError::fatal("non-void call received a void return"))?;
            self.bind(&instr, value)?;
        }
        if let InstrKind::Call {
            kind: CallKind::Invoke { normal, .. },
            ..
        } = instr.kind
        {
            self.switch_block(normal)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    /// Execute the next instruction of the current thread, advancing
    /// the cursor first so control flow can overwrite it.
    pub(crate) fn step_once(&mut self) -> Result<(), EngineError> {
        let (func, block, index) = {
            let frame = self.frame()?;
            (frame.func, frame.block, frame.next_instr)
        };
        let Some(instr) = self
            .module
            .function(func)
            .block(block)
            .instrs
            .get(index)
            .cloned()
        else {
            let err = EngineError::fatal("basic block ended without a terminator");
            self.record_error(None, &err);
            return Err(err);
        };
        {
            let frame = self.frame_mut()?;
            frame.prev_instr = Some(InstrRef { block, index });
            frame.next_instr = index + 1;
        }
        trace!(target: "galena", "interpreting {}", instr);
        if let Err(err) = self.execute_instr(&instr) {
            self.record_error(Some(&instr), &err);
            return Err(err);
        }
        Ok(())
    }

    /// Drive the current thread until its stack empties. Foreign calls
    /// cannot complete here; they need the stepping driver.
    fn run(&mut self) -> Result<(), EngineError> {
        loop {
            let thread = self.cur_thread()?;
            let Some(top) = thread.top() else {
                return Ok(());
            };
            if top.must_resolve_pending_return {
                let err = EngineError::misuse(
                    "a foreign call is awaiting its result; drive this thread with step_thread",
                );
                self.record_failure(&err);
                return Err(err);
            }
            self.step_once()?;
        }
    }

    /// Resolve an outstanding foreign return: bind the host-provided
    /// value to the call site and take the invoke normal edge. A
    /// missing value is rejected before any state changes, so the
    /// host can retry the step.
    fn resolve_pending_return(&mut self, pending: Option<Value>) -> Result<(), EngineError> {
        let (site, func) = {
            let frame = self.frame()?;
            let site = frame.call_site.ok_or_else(|| {
                EngineError::fatal("pending return with no recorded call site")
            })?;
            (site, frame.func)
        };
        let instr = self.module.function(func).block(site.block).instrs[site.index].clone();
        if !instr.ty.is_void() && pending.is_none() {
            return Err(EngineError::misuse(
                "step_thread requires the pending return value of the outstanding call",
            ));
        }
        {
            let frame = self.frame_mut()?;
            frame.must_resolve_pending_return = false;
            frame.call_site = None;
        }
        if !instr.ty.is_void() {
            if let Some(value) = pending {
                self.bind(&instr, value)?;
            }
        }
        if let InstrKind::Call {
            kind: CallKind::Invoke { normal, .. },
            ..
        } = instr.kind
        {
            self.switch_block(normal)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // External drive points
    // ------------------------------------------------------------------

    /// Create a logical thread whose root frame calls `func`. An
    /// existing thread with the same id is replaced.
    pub fn create_thread(
        &mut self,
        thread_id: u64,
        func: FuncId,
        args: Vec<Value>,
    ) -> Result<(), EngineError> {
        self.ensure_ready()?;
        self.check_function(func)?;
        let mut thread = ExecThread::new(thread_id);
        thread.init_args = args.clone();
        self.threads.insert(thread_id, thread);
        self.current_thread = thread_id;
        let r = self.call_function(func, args);
        if let Err(err) = &r {
            self.record_failure(err);
        }
        r
    }

    /// Advance one thread by a single instruction. When a foreign call
    /// is outstanding the provided `pending` value is consumed first,
    /// then one instruction executes. Returns whether the thread's
    /// stack is empty afterwards.
    pub fn step_thread(
        &mut self,
        thread_id: u64,
        pending: Option<Value>,
    ) -> Result<bool, EngineError> {
        self.ensure_ready()?;
        if !self.threads.contains_key(&thread_id) {
            let err = EngineError::misuse(format!("unknown thread id {}", thread_id));
            self.record_failure(&err);
            return Err(err);
        }
        self.current_thread = thread_id;
        if self.cur_thread()?.stack.is_empty() {
            return Ok(true);
        }
        if self.frame()?.must_resolve_pending_return {
            if let Err(err) = self.resolve_pending_return(pending) {
                self.record_failure(&err);
                return Err(err);
            }
        }
        self.step_once()?;
        Ok(self.cur_thread()?.stack.is_empty())
    }

    /// Remove a thread, performing the equivalent of popping every
    /// frame: each frame's allocas go back through the free hook.
    pub fn terminate_thread(&mut self, thread_id: u64) {
        let Some(thread) = self.threads.remove(&thread_id) else {
            return;
        };
        debug!(target: "galena", "terminating thread {}", thread_id);
        for frame in thread.stack.iter().rev() {
            if let Err(err) = self.release_frame(frame) {
                self.record_failure(&err);
            }
        }
    }

    /// Call `func` and drive it to completion on the default thread.
    pub fn run_function(&mut self, func: FuncId, args: &[Value]) -> Result<Value, EngineError> {
        self.ensure_ready()?;
        self.check_function(func)?;
        self.current_thread = MAIN_THREAD_ID;
        self.threads
            .entry(MAIN_THREAD_ID)
            .or_insert_with(|| ExecThread::new(MAIN_THREAD_ID));
        // Trim surplus arguments for non-varargs callees; main() is
        // routinely declared with fewer parameters than it receives.
        let function = self.module.function(func);
        let take = if function.var_args {
            args.len()
        } else {
            args.len().min(function.params.len())
        };
        let result = self
            .call_function(func, args[..take].to_vec())
            .and_then(|()| self.run());
        match result {
            Ok(()) => Ok(self.cur_thread()?.exit_value.clone()),
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Run `func` as a C `main`: argc/argv/envp are materialized in
    /// oracle memory and passed according to the declared arity.
    pub fn run_function_as_main(
        &mut self,
        func: FuncId,
        argv: &[String],
        envp: &[String],
    ) -> Result<i32, EngineError> {
        self.ensure_ready()?;
        self.check_function(func)?;
        let arity = self.module.function(func).params.len();
        if arity > 3 {
            let err = EngineError::fatal(format!(
                "invalid number of arguments of main() supplied: {}",
                arity
            ));
            self.record_failure(&err);
            return Err(err);
        }
        let mut args = Vec::new();
        if arity >= 1 {
            args.push(Value::of_u64(32, argv.len() as u64).with_type(Type::int(32)));
        }
        if arity >= 2 {
            let ptr = self.build_cstr_array(argv)?;
            args.push(Value::ptr(ptr).with_type(Type::ptr()));
        }
        if arity >= 3 {
            let ptr = self.build_cstr_array(envp)?;
            args.push(Value::ptr(ptr).with_type(Type::ptr()));
        }
        let exit = self.run_function(func, &args)?;
        Ok(match &exit.kind {
            ValueKind::Int(v) => v.zext_or_trunc(32).to_u64() as u32 as i32,
            _ => 0,
        })
    }

    /// Materialize a NULL-terminated array of C strings in oracle
    /// memory, one allocation per string plus one for the array.
    fn build_cstr_array(&mut self, items: &[String]) -> Result<MiriPointer, EngineError> {
        let ptr_ty = Type::ptr();
        let mut pointers = Vec::with_capacity(items.len() + 1);
        for item in items {
            let c = CString::new(item.as_str()).map_err(|_| {
                EngineError::misuse("argv/envp strings may not contain NUL bytes")
            })?;
            let bytes = c.as_bytes_with_nul();
            let dst = self.oracle_malloc(bytes.len() as u64, 1, false)?;
            self.oracle_memcpy(dst, bytes)?;
            pointers.push(dst);
        }
        pointers.push(MiriPointer::null());
        let array = self.oracle_malloc(pointers.len() as u64 * 8, 8, false)?;
        for (index, ptr) in pointers.iter().enumerate() {
            let slot = self.oracle_gep(array, index as u64 * 8)?;
            let value = Value::ptr(*ptr).with_type(ptr_ty.clone());
            self.oracle_store(&value, slot, &ptr_ty)?;
        }
        Ok(array)
    }

    /// Append a declaration for a libc routine, used when lowering
    /// memory intrinsics into foreign calls.
    pub(crate) fn ensure_libc_declaration(
        &mut self,
        name: &str,
        params: Vec<TypeRef>,
    ) -> FuncId {
        if let Some(existing) = self.module.find_function(name) {
            return existing;
        }
        let next_value = params.len() as u32;
        self.module.functions.push(crate::ir::Function {
            name: name.to_string(),
            params,
            ret: Type::ptr(),
            var_args: false,
            blocks: Vec::new(),
            next_value,
        });
        let id = FuncId(self.module.functions.len() as u32 - 1);
        self.funcs_by_addr.insert(function_address(id), id);
        id
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Scoped release holds on the last exit path too: free every
        // alloca still owned by live frames, if the oracle is around
        // to take them.
        if !self.hooks.ready() {
            return;
        }
        let threads: Vec<u64> = self.threads.keys().copied().collect();
        for thread_id in threads {
            self.terminate_thread(thread_id);
        }
    }
}
