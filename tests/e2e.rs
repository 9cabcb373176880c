//! In-process end-to-end tests.
//!
//! These drive the engine through its public API against a scriptable
//! mock oracle: a typed cell store plus an event log, so tests can
//! assert both results and the exact hook traffic.

use std::collections::HashMap;
use std::ffi::c_void;

use galena::apint::IntValue;
use galena::interp::{Engine, EngineError, Value};
use galena::ir::{BinOp, Constant, FuncId, IntPredicate, ModuleBuilder, Operand, Type};
use galena::oracle::{MiriErrorTrace, MiriPointer, MiriProvenance, ValueArray};

// =============================================================================
// Mock oracle
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Malloc { size: u64, is_stack: bool },
    Free { addr: u64 },
    Load { addr: u64 },
    Store { addr: u64 },
    Gep { base: u64, offset: u64 },
    CallByName { name: String },
    CallByPointer { addr: u64 },
    Memcpy { addr: u64, len: u64 },
    Memset { addr: u64, len: u64 },
}

#[derive(Default)]
struct MockOracle {
    cells: HashMap<u64, Value>,
    bytes: HashMap<u64, Vec<u8>>,
    next_addr: u64,
    next_alloc_id: u64,
    events: Vec<Event>,
    registered_globals: Vec<(String, MiriPointer)>,
    named_call_args: Vec<Vec<Value>>,
    fail_next_load: bool,
    trace_deliveries: usize,
    last_trace_len: u64,
    last_instr_text: String,
}

impl MockOracle {
    fn new() -> Box<Self> {
        Box::new(Self {
            next_addr: 0x1000,
            next_alloc_id: 1,
            ..Self::default()
        })
    }

    fn wrapper(&mut self) -> *mut c_void {
        self as *mut Self as *mut c_void
    }

    fn stack_mallocs(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Malloc { is_stack: true, .. }))
            .count()
    }

    fn frees(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Free { .. }))
            .count()
    }

    fn named_calls(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::CallByName { name } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

unsafe fn oracle<'a>(wrapper: *mut c_void) -> &'a mut MockOracle {
    unsafe { &mut *(wrapper as *mut MockOracle) }
}

unsafe extern "C" fn mock_malloc(
    wrapper: *mut c_void,
    size: u64,
    align: u64,
    is_stack: bool,
) -> MiriPointer {
    let oracle = unsafe { oracle(wrapper) };
    let align = align.max(1);
    let addr = (oracle.next_addr + align - 1) & !(align - 1);
    oracle.next_addr = addr + size.max(1) + 16;
    let alloc_id = oracle.next_alloc_id;
    oracle.next_alloc_id += 1;
    oracle.events.push(Event::Malloc { size, is_stack });
    MiriPointer {
        addr,
        prov: MiriProvenance { alloc_id, tag: 0 },
    }
}

unsafe extern "C" fn mock_free(wrapper: *mut c_void, ptr: MiriPointer) -> bool {
    let oracle = unsafe { oracle(wrapper) };
    oracle.events.push(Event::Free { addr: ptr.addr });
    false
}

unsafe extern "C" fn mock_load(
    wrapper: *mut c_void,
    out: *mut Value,
    ptr: MiriPointer,
    _ty: *const Type,
    _bytes: u64,
    _align: u64,
) -> bool {
    let oracle = unsafe { oracle(wrapper) };
    if oracle.fail_next_load {
        oracle.fail_next_load = false;
        return true;
    }
    oracle.events.push(Event::Load { addr: ptr.addr });
    let value = oracle.cells.get(&ptr.addr).cloned().unwrap_or_default();
    unsafe { *out = value };
    false
}

unsafe extern "C" fn mock_store(
    wrapper: *mut c_void,
    value: *mut Value,
    ptr: MiriPointer,
    _ty: *const Type,
    _bytes: u64,
    _align: u64,
) -> bool {
    let oracle = unsafe { oracle(wrapper) };
    oracle.events.push(Event::Store { addr: ptr.addr });
    let value = unsafe { (*value).clone() };
    oracle.cells.insert(ptr.addr, value);
    false
}

unsafe extern "C" fn mock_memset(
    wrapper: *mut c_void,
    ptr: MiriPointer,
    _fill: i32,
    len: u64,
) -> bool {
    let oracle = unsafe { oracle(wrapper) };
    oracle.events.push(Event::Memset {
        addr: ptr.addr,
        len,
    });
    false
}

unsafe extern "C" fn mock_memcpy(
    wrapper: *mut c_void,
    ptr: MiriPointer,
    src: *const std::ffi::c_char,
    len: u64,
) -> bool {
    let oracle = unsafe { oracle(wrapper) };
    let bytes = unsafe { std::slice::from_raw_parts(src as *const u8, len as usize) }.to_vec();
    oracle.events.push(Event::Memcpy {
        addr: ptr.addr,
        len,
    });
    oracle.bytes.insert(ptr.addr, bytes);
    false
}

unsafe extern "C" fn mock_int_to_ptr(_wrapper: *mut c_void, addr: u64) -> MiriPointer {
    MiriPointer::with_addr(addr)
}

unsafe extern "C" fn mock_ptr_to_int(_wrapper: *mut c_void, ptr: MiriPointer) -> u64 {
    ptr.addr
}

unsafe extern "C" fn mock_gep(
    wrapper: *mut c_void,
    base: MiriPointer,
    offset: u64,
) -> MiriPointer {
    let oracle = unsafe { oracle(wrapper) };
    oracle.events.push(Event::Gep {
        base: base.addr,
        offset,
    });
    MiriPointer {
        addr: base.addr.wrapping_add(offset),
        prov: base.prov,
    }
}

unsafe extern "C" fn mock_register_global(
    wrapper: *mut c_void,
    name: *const std::ffi::c_char,
    name_len: usize,
    addr: u64,
    out: *mut MiriPointer,
) -> bool {
    let oracle = unsafe { oracle(wrapper) };
    let name = unsafe { std::slice::from_raw_parts(name as *const u8, name_len) };
    let name = String::from_utf8_lossy(name).into_owned();
    let alloc_id = oracle.next_alloc_id;
    oracle.next_alloc_id += 1;
    let ptr = MiriPointer {
        addr,
        prov: MiriProvenance { alloc_id, tag: 0 },
    };
    unsafe { *out = ptr };
    oracle.registered_globals.push((name, ptr));
    false
}

unsafe extern "C" fn mock_call_by_name(
    wrapper: *mut c_void,
    args: *const ValueArray,
    name: *const std::ffi::c_char,
    name_len: u64,
    _ret_ty: *const Type,
) -> bool {
    let oracle = unsafe { oracle(wrapper) };
    let name = unsafe { std::slice::from_raw_parts(name as *const u8, name_len as usize) };
    let name = String::from_utf8_lossy(name).into_owned();
    oracle.events.push(Event::CallByName { name });
    let args = unsafe { &*args };
    let mut copied = Vec::new();
    for i in 0..args.len() {
        copied.push(args.get(i).cloned().unwrap_or_default());
    }
    oracle.named_call_args.push(copied);
    false
}

unsafe extern "C" fn mock_call_by_pointer(
    wrapper: *mut c_void,
    target: MiriPointer,
    _args: *const ValueArray,
    _ret_ty: *const Type,
) -> bool {
    let oracle = unsafe { oracle(wrapper) };
    oracle.events.push(Event::CallByPointer { addr: target.addr });
    false
}

unsafe extern "C" fn mock_stack_trace_recorder(
    wrapper: *mut c_void,
    _trace: *const MiriErrorTrace,
    trace_len: u64,
    instr: *const std::ffi::c_char,
    instr_len: u64,
) {
    let oracle = unsafe { oracle(wrapper) };
    oracle.trace_deliveries += 1;
    oracle.last_trace_len = trace_len;
    let text = unsafe { std::slice::from_raw_parts(instr as *const u8, instr_len as usize) };
    oracle.last_instr_text = String::from_utf8_lossy(text).into_owned();
}

fn install(engine: &mut Engine, oracle: &mut MockOracle) {
    engine.set_malloc_hook(mock_malloc);
    engine.set_free_hook(mock_free);
    engine.set_load_hook(mock_load);
    engine.set_store_hook(mock_store);
    engine.set_memset_hook(mock_memset);
    engine.set_memcpy_hook(mock_memcpy);
    engine.set_int_to_ptr_hook(mock_int_to_ptr);
    engine.set_ptr_to_int_hook(mock_ptr_to_int);
    engine.set_gep_hook(mock_gep);
    engine.set_register_global_hook(mock_register_global);
    engine.set_call_by_name_hook(mock_call_by_name);
    engine.set_call_by_pointer_hook(mock_call_by_pointer);
    engine.set_stack_trace_recorder_hook(mock_stack_trace_recorder);
    engine.set_oracle_wrapper(oracle.wrapper());
}

fn i32_const(value: u64) -> Operand {
    Operand::Const(Constant::int(32, value))
}

fn i64_const(value: u64) -> Operand {
    Operand::Const(Constant::int(64, value))
}

fn exit_int(engine: &Engine, tid: u64) -> IntValue {
    engine
        .thread_exit_value(tid)
        .and_then(Value::as_int)
        .cloned()
        .expect("integer exit value")
}

// =============================================================================
// Seed scenarios
// =============================================================================

#[test]
fn ret_constant_empties_the_stack_in_one_step() {
    let mut mb = ModuleBuilder::new("ret7");
    let (seven, mut fb) = mb.define_function("seven", vec![], Type::int(32));
    fb.block("entry");
    fb.ret(i32_const(7));
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    engine.create_thread(1, seven, vec![]).unwrap();
    assert!(engine.step_thread(1, None).unwrap());

    let exit = engine.thread_exit_value(1).unwrap();
    let int = exit.as_int().unwrap();
    assert_eq!(int.width(), 32);
    assert_eq!(int.to_u64(), 7);
    assert_eq!(exit.ty, Some(Type::int(32)));
}

#[test]
fn alloca_store_load_round_trip() {
    let mut mb = ModuleBuilder::new("mem");
    let (f, mut fb) = mb.define_function("rw", vec![], Type::int(64));
    fb.block("entry");
    let p = fb.alloca(Type::int(64), i32_const(1), 8);
    fb.store(i64_const(42), p.clone());
    let x = fb.load(Type::int(64), p);
    fb.ret(x);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    let exit = engine.run_function(f, &[]).unwrap();
    assert_eq!(exit.as_int().unwrap().to_u64(), 42);

    // The oracle saw exactly malloc, store, load, free, in order.
    let shape: Vec<&str> = oracle
        .events
        .iter()
        .map(|e| match e {
            Event::Malloc { .. } => "malloc",
            Event::Store { .. } => "store",
            Event::Load { .. } => "load",
            Event::Free { .. } => "free",
            _ => "other",
        })
        .collect();
    assert_eq!(shape, vec!["malloc", "store", "load", "free"]);
    let Event::Malloc { is_stack, .. } = &oracle.events[0] else {
        unreachable!();
    };
    assert!(*is_stack);
}

#[test]
fn allocas_pair_with_frees_one_to_one() {
    let mut mb = ModuleBuilder::new("pairs");
    let (f, mut fb) = mb.define_function("several", vec![], Type::void());
    fb.block("entry");
    fb.alloca(Type::int(8), i32_const(1), 1);
    fb.alloca(Type::int(64), i32_const(4), 8);
    fb.ret_void();
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    engine.run_function(f, &[]).unwrap();

    assert_eq!(oracle.stack_mallocs(), 2);
    assert_eq!(oracle.frees(), 2);
}

#[test]
fn gep_routes_the_byte_offset_through_the_oracle() {
    let mut mb = ModuleBuilder::new("gep");
    let (f, mut fb) = mb.define_function("bump", vec![Type::ptr()], Type::ptr());
    fb.block("entry");
    let base = fb.arg(0);
    let q = fb.gep(Type::int(8), base, vec![i64_const(3)]);
    fb.ret(q);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    let p = MiriPointer {
        addr: 0x400,
        prov: MiriProvenance {
            alloc_id: 11,
            tag: 3,
        },
    };
    let exit = engine.run_function(f, &[Value::ptr(p)]).unwrap();
    assert!(oracle.events.contains(&Event::Gep {
        base: 0x400,
        offset: 3
    }));
    let out = exit.as_ptr().unwrap();
    assert_eq!(out.addr, 0x403);
    assert_eq!(out.prov, p.prov);
}

#[test]
fn struct_geps_use_field_offsets() {
    // { i8, i32, i8 } has field 1 at offset 4.
    let struct_ty = Type::anon_struct(vec![Type::int(8), Type::int(32), Type::int(8)]);
    let mut mb = ModuleBuilder::new("gep2");
    let (f, mut fb) = mb.define_function("field", vec![Type::ptr()], Type::ptr());
    fb.block("entry");
    let base = fb.arg(0);
    let q = fb.gep(struct_ty, base, vec![i64_const(0), i32_const(1)]);
    fb.ret(q);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    engine
        .run_function(f, &[Value::ptr(MiriPointer::with_addr(0x100))])
        .unwrap();
    assert!(oracle.events.contains(&Event::Gep {
        base: 0x100,
        offset: 4
    }));
}

#[test]
fn foreign_call_suspends_and_resumes_with_a_pending_return() {
    let mut mb = ModuleBuilder::new("foreign");
    let callee = mb.declare_function("f", vec![Type::int(32)], Type::int(32));
    let fn_ty = Type::func(vec![Type::int(32)], Type::int(32), false);
    let (main, mut fb) = mb.define_function("main", vec![], Type::int(32));
    fb.block("entry");
    let r = fb.call(fn_ty, Operand::Func(callee), vec![i32_const(5)]);
    fb.ret(r);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    engine.create_thread(1, main, vec![]).unwrap();

    // Step 1 executes the call: the oracle sees it, control returns,
    // and the thread now requires a pending return value.
    assert!(!engine.step_thread(1, None).unwrap());
    assert_eq!(oracle.named_calls(), vec!["f"]);
    assert_eq!(oracle.named_call_args[0].len(), 1);
    assert_eq!(oracle.named_call_args[0][0].as_int().unwrap().to_u64(), 5);

    // Step 2 resolves %r = 9, then executes the ret.
    let pending = Value::of_u64(32, 9);
    assert!(engine.step_thread(1, Some(pending)).unwrap());
    assert_eq!(exit_int(&engine, 1).to_u64(), 9);
}

#[test]
fn stepping_without_the_required_pending_return_is_a_misuse() {
    let mut mb = ModuleBuilder::new("foreign2");
    let callee = mb.declare_function("f", vec![], Type::int(32));
    let fn_ty = Type::func(vec![], Type::int(32), false);
    let (main, mut fb) = mb.define_function("main", vec![], Type::int(32));
    fb.block("entry");
    let r = fb.call(fn_ty, Operand::Func(callee), vec![]);
    fb.ret(r);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    engine.create_thread(1, main, vec![]).unwrap();
    assert!(!engine.step_thread(1, None).unwrap());
    let err = engine.step_thread(1, None).unwrap_err();
    assert!(matches!(err, EngineError::Misuse(_)));
    assert!(engine.has_error());
    assert!(engine.err_msg().unwrap().contains("pending return"));
}

#[test]
fn call_through_an_oracle_pointer_is_foreign() {
    let mut mb = ModuleBuilder::new("indirect");
    let fn_ty = Type::func(vec![], Type::int(32), false);
    let (main, mut fb) = mb.define_function("main", vec![Type::ptr()], Type::int(32));
    fb.block("entry");
    let r = fb.call(fn_ty, fb.arg(0), vec![]);
    fb.ret(r);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    let target = MiriPointer {
        addr: 0xbeef,
        prov: MiriProvenance {
            alloc_id: 99,
            tag: 1,
        },
    };
    engine.create_thread(1, main, vec![Value::ptr(target)]).unwrap();
    assert!(!engine.step_thread(1, None).unwrap());
    assert!(oracle.events.contains(&Event::CallByPointer { addr: 0xbeef }));
    assert!(engine.step_thread(1, Some(Value::of_u64(32, 1))).unwrap());
}

#[test]
fn two_threads_interleave_independently() {
    let mut mb = ModuleBuilder::new("threads");
    let (f, mut fb) = mb.define_function("sum3", vec![Type::int(32)], Type::int(32));
    fb.block("entry");
    let a = fb.binary(BinOp::Add, Type::int(32), fb.arg(0), i32_const(1));
    let b = fb.binary(BinOp::Add, Type::int(32), a, i32_const(2));
    fb.ret(b);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    engine
        .create_thread(1, f, vec![Value::of_u64(32, 10)])
        .unwrap();
    engine
        .create_thread(2, f, vec![Value::of_u64(32, 20)])
        .unwrap();

    let mut done1 = false;
    let mut done2 = false;
    for _ in 0..16 {
        if !done1 {
            done1 = engine.step_thread(1, None).unwrap();
        }
        if !done2 {
            done2 = engine.step_thread(2, None).unwrap();
        }
        if done1 && done2 {
            break;
        }
    }
    assert!(done1 && done2);
    assert_eq!(exit_int(&engine, 1).to_u64(), 13);
    assert_eq!(exit_int(&engine, 2).to_u64(), 23);
}

#[test]
fn phi_nodes_resolve_atomically_in_a_cycle() {
    // loop carries (%a, %b) <- (%b, %a); one traversal of the back
    // edge must swap using the old values, not chain the new ones.
    let i32t = Type::int(32);
    let mut mb = ModuleBuilder::new("phis");
    let (f, mut fb) = mb.define_function("swap_once", vec![], i32t.clone());
    let entry = fb.block("entry");
    let looph = fb.block("loop");
    let exit = fb.block("exit");

    fb.select_block(entry);
    fb.br(looph);

    fb.select_block(looph);
    let a = fb.phi(i32t.clone(), vec![(entry, i32_const(1))]);
    let b = fb.phi(i32t.clone(), vec![(entry, i32_const(2))]);
    let i = fb.phi(i32t.clone(), vec![(entry, i32_const(0))]);
    let i1 = fb.binary(BinOp::Add, i32t.clone(), i.clone(), i32_const(1));
    let done = fb.icmp(IntPredicate::Eq, i1.clone(), i32_const(2));
    fb.cond_br(done, exit, looph);

    // Wire the back edges: a <- b, b <- a, i <- i1.
    fb.select_block(exit);
    let tens = fb.binary(BinOp::Mul, i32t.clone(), a.clone(), Operand::Const(Constant::int(32, 10)));
    let packed = fb.binary(BinOp::Add, i32t.clone(), tens, b.clone());
    fb.ret(packed);

    let mut module = {
        fb.finish(&mut mb);
        mb.finish()
    };
    // Patch the back-edge incomings in place: the builder emits
    // forward references through explicit wiring here.
    {
        use galena::ir::InstrKind;
        let function = &mut module.functions[f.0 as usize];
        let block = &mut function.blocks[looph.0 as usize];
        let (a_id, b_id, i1_id) = match (&a, &b, &i1) {
            (Operand::Value(x), Operand::Value(y), Operand::Value(z)) => (*x, *y, *z),
            _ => unreachable!(),
        };
        for instr in block.instrs.iter_mut() {
            if let InstrKind::Phi { incoming } = &mut instr.kind {
                if instr.result == a_id {
                    incoming.push((looph, Operand::Value(b_id)));
                } else if instr.result == b_id {
                    incoming.push((looph, Operand::Value(a_id)));
                } else {
                    incoming.push((looph, Operand::Value(i1_id)));
                }
            }
        }
    }

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(module);
    install(&mut engine, &mut oracle);

    let exit_value = engine.run_function(f, &[]).unwrap();
    // First entry binds (1, 2); the back edge swaps to (2, 1).
    assert_eq!(exit_value.as_int().unwrap().to_u64(), 21);
}

// =============================================================================
// Conversions through the oracle
// =============================================================================

#[test]
fn ptr_to_int_and_back_consults_the_oracle() {
    use galena::ir::CastOp;
    let mut mb = ModuleBuilder::new("casts");
    let (f, mut fb) = mb.define_function("image", vec![Type::ptr()], Type::int(64));
    fb.block("entry");
    let image = fb.cast(CastOp::PtrToInt, Type::int(64), fb.arg(0));
    fb.ret(image);
    fb.finish(&mut mb);

    let (g, mut gb) = mb.define_function("revive", vec![], Type::ptr());
    gb.block("entry");
    let p = gb.cast(CastOp::IntToPtr, Type::ptr(), i64_const(0));
    gb.ret(p);
    gb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    let p = MiriPointer {
        addr: 0x7777,
        prov: MiriProvenance {
            alloc_id: 5,
            tag: 5,
        },
    };
    let image = engine.run_function(f, &[Value::ptr(p)]).unwrap();
    let int = image.as_int().unwrap();
    assert_eq!(int.width(), 64);
    assert_eq!(int.to_u64(), 0x7777);

    // inttoptr of 0 yields whatever the oracle returns; no engine-side
    // null assumption.
    let revived = engine.run_function(g, &[]).unwrap();
    assert_eq!(revived.as_ptr().unwrap(), MiriPointer::with_addr(0));
}

// =============================================================================
// Globals, ctors, atexit
// =============================================================================

#[test]
fn globals_are_announced_once_at_first_wrapper_install() {
    let mut mb = ModuleBuilder::new("globals");
    mb.global("alpha", Type::int(32), Some(Constant::int(32, 1)));
    mb.global("beta", Type::ptr(), None);
    let g = mb.global("gamma", Type::int(64), None);
    let module = mb.finish();

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(module);
    install(&mut engine, &mut oracle);
    // Re-installing the wrapper must not re-announce.
    let w = oracle.wrapper();
    engine.set_oracle_wrapper(w);

    let names: Vec<&str> = oracle
        .registered_globals
        .iter()
        .map(|(n, _)| n.as_str())
        .collect();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    // The oracle's pointer (with its provenance) is what the engine
    // serves afterwards.
    let served = engine.global_value(g).as_ptr().unwrap();
    assert_eq!(served, oracle.registered_globals[2].1);
    assert_ne!(served.prov.alloc_id, 0);
}

#[test]
fn ctor_dtor_lists_come_from_the_appending_globals() {
    let mut mb = ModuleBuilder::new("ctors");
    let (init, mut fb) = mb.define_function("init", vec![], Type::void());
    fb.block("entry");
    fb.ret_void();
    fb.finish(&mut mb);
    let (fini, mut fb) = mb.define_function("fini", vec![], Type::void());
    fb.block("entry");
    fb.ret_void();
    fb.finish(&mut mb);

    let entry = |prio: u64, f: FuncId| {
        Constant::Aggregate(vec![
            Constant::int(32, prio),
            Constant::Func(f),
            Constant::NullPtr,
        ])
    };
    mb.global(
        "llvm.global_ctors",
        Type::array(Type::ptr(), 1),
        Some(Constant::Aggregate(vec![entry(65535, init)])),
    );
    mb.global(
        "llvm.global_dtors",
        Type::array(Type::ptr(), 1),
        Some(Constant::Aggregate(vec![entry(65535, fini)])),
    );

    let mut engine = Engine::new(mb.finish());
    engine.initialize_ctor_dtor_lists();
    assert_eq!(engine.ctor_count(), 1);
    assert_eq!(engine.dtor_count(), 1);
    assert_eq!(engine.ctor_at(0), Some(init));
    assert_eq!(engine.dtor_at(0), Some(fini));
    assert_eq!(engine.ctor_at(1), None);
}

#[test]
fn exit_runs_at_exit_handlers_and_sets_the_code() {
    let i32t = Type::int(32);
    let mut mb = ModuleBuilder::new("exitpath");
    let atexit = mb.declare_function("atexit", vec![Type::ptr()], i32t.clone());
    let exit_fn = mb.declare_function("exit", vec![i32t.clone()], Type::void());

    let (handler, mut hb) = mb.define_function("handler", vec![], Type::void());
    hb.block("entry");
    hb.alloca(Type::int(8), i32_const(1), 1);
    hb.ret_void();
    hb.finish(&mut mb);

    let (main, mut fb) = mb.define_function("main", vec![], i32t.clone());
    fb.block("entry");
    let atexit_ty = Type::func(vec![Type::ptr()], i32t.clone(), false);
    fb.call(atexit_ty, Operand::Func(atexit), vec![Operand::Func(handler)]);
    let exit_ty = Type::func(vec![i32t.clone()], Type::void(), false);
    fb.call(exit_ty, Operand::Func(exit_fn), vec![i32_const(3)]);
    fb.unreachable();
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    let code = engine.run_function_as_main(main, &[], &[]).unwrap();
    assert_eq!(code, 3);
    // Neither atexit nor exit reached the oracle; the handler ran (its
    // alloca shows up, paired with its free).
    assert!(oracle.named_calls().is_empty());
    assert_eq!(oracle.stack_mallocs(), 1);
    assert_eq!(oracle.frees(), 1);
}

#[test]
fn run_function_as_main_materializes_argv() {
    let i32t = Type::int(32);
    let mut mb = ModuleBuilder::new("argv");
    let (main, mut fb) =
        mb.define_function("main", vec![i32t.clone(), Type::ptr()], i32t.clone());
    fb.block("entry");
    fb.ret(fb.arg(0));
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    let code = engine
        .run_function_as_main(main, &["prog".into(), "arg1".into()], &[])
        .unwrap();
    assert_eq!(code, 2);
    // Two strings were copied into oracle memory, NUL included.
    let copies: Vec<(u64, u64)> = oracle
        .events
        .iter()
        .filter_map(|e| match e {
            Event::Memcpy { addr, len } => Some((*addr, *len)),
            _ => None,
        })
        .collect();
    assert_eq!(copies.len(), 2);
    assert!(copies.iter().all(|(_, len)| *len == 5));
    assert_eq!(oracle.bytes[&copies[0].0], b"prog\0");
    assert_eq!(oracle.bytes[&copies[1].0], b"arg1\0");
}

// =============================================================================
// Threads and termination
// =============================================================================

#[test]
fn terminate_thread_releases_every_alloca() {
    let mut mb = ModuleBuilder::new("term");
    let (f, mut fb) = mb.define_function("spin", vec![], Type::void());
    let entry = fb.block("entry");
    let looph = fb.block("loop");
    fb.select_block(entry);
    fb.alloca(Type::int(64), i32_const(1), 8);
    fb.br(looph);
    fb.select_block(looph);
    fb.alloca(Type::int(8), i32_const(1), 1);
    fb.br(looph);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    engine.create_thread(7, f, vec![]).unwrap();
    for _ in 0..6 {
        assert!(!engine.step_thread(7, None).unwrap());
    }
    assert!(engine.has_thread(7));
    engine.terminate_thread(7);
    assert!(!engine.has_thread(7));
    assert_eq!(oracle.frees(), oracle.stack_mallocs());
    assert!(oracle.stack_mallocs() >= 2);
}

#[test]
fn unknown_thread_ids_are_rejected() {
    let mb = ModuleBuilder::new("empty");
    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    let err = engine.step_thread(42, None).unwrap_err();
    assert!(matches!(err, EngineError::Misuse(_)));
    assert!(!engine.has_thread(42));
}

#[test]
fn stepping_requires_a_complete_hook_table() {
    let mut mb = ModuleBuilder::new("nohooks");
    let (f, mut fb) = mb.define_function("f", vec![], Type::void());
    fb.block("entry");
    fb.ret_void();
    fb.finish(&mut mb);

    let mut engine = Engine::new(mb.finish());
    let err = engine.create_thread(1, f, vec![]).unwrap_err();
    assert!(matches!(err, EngineError::Misuse(_)));
    assert!(engine.err_msg().unwrap().contains("wrapper"));
}

// =============================================================================
// Errors and traces
// =============================================================================

#[test]
fn oracle_faults_set_the_flag_and_deliver_a_trace() {
    let mut mb = ModuleBuilder::new("fault");
    let (f, mut fb) = mb.define_function("bad_load", vec![Type::ptr()], Type::int(64));
    fb.block("entry");
    fb.set_loc("/src", "fault.c", 12, 3);
    let x = fb.load(Type::int(64), fb.arg(0));
    fb.ret(x);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    oracle.fail_next_load = true;

    let err = engine
        .run_function(f, &[Value::ptr(MiriPointer::with_addr(0x100))])
        .unwrap_err();
    assert!(matches!(err, EngineError::Oracle(_)));
    assert!(engine.has_error());
    assert_eq!(oracle.trace_deliveries, 1);
    assert_eq!(oracle.last_trace_len, 1);
    assert!(oracle.last_instr_text.contains("load"));
    // The message is sticky until taken.
    assert!(engine.err_msg().unwrap().contains("load"));
    assert!(!engine.has_error());
}

#[test]
fn unreachable_is_fatal() {
    let mut mb = ModuleBuilder::new("unreachable");
    let (f, mut fb) = mb.define_function("boom", vec![], Type::void());
    fb.block("entry");
    fb.unreachable();
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    let err = engine.run_function(f, &[]).unwrap_err();
    assert!(matches!(err, EngineError::Fatal(_)));
    assert!(engine.err_msg().unwrap().contains("unreachable"));
}

// =============================================================================
// Varargs
// =============================================================================

fn build_varargs_module() -> (galena::ir::Module, FuncId) {
    let i32t = Type::int(32);
    let mut mb = ModuleBuilder::new("va");
    let va_start = mb.declare_function("llvm.va_start.p0", vec![Type::ptr()], Type::void());
    let va_end = mb.declare_function("llvm.va_end.p0", vec![Type::ptr()], Type::void());

    // sum2(i32 %n, ...) reads two varargs and adds them.
    let (sum2, mut sb) = mb.define_varargs_function("sum2", vec![i32t.clone()], i32t.clone());
    sb.block("entry");
    let ap = sb.alloca(Type::int(64), i32_const(1), 8);
    let va_ty = Type::func(vec![Type::ptr()], Type::void(), false);
    sb.call(va_ty.clone(), Operand::Func(va_start), vec![ap.clone()]);
    let x = sb.va_arg(i32t.clone(), ap.clone());
    let y = sb.va_arg(i32t.clone(), ap.clone());
    sb.call(va_ty, Operand::Func(va_end), vec![ap]);
    let sum = sb.binary(BinOp::Add, i32t.clone(), x, y);
    sb.ret(sum);
    sb.finish(&mut mb);

    let (main, mut fb) = mb.define_function("main", vec![], i32t.clone());
    fb.block("entry");
    let sum2_ty = Type::func(vec![i32t.clone()], i32t.clone(), true);
    let r = fb.call(
        sum2_ty,
        Operand::Func(sum2),
        vec![i32_const(2), i32_const(10), i32_const(20)],
    );
    fb.ret(r);
    fb.finish(&mut mb);

    (mb.finish(), main)
}

#[test]
fn va_args_flow_through_the_index_pair() {
    let (module, main) = build_varargs_module();
    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(module);
    install(&mut engine, &mut oracle);
    let exit = engine.run_function(main, &[]).unwrap();
    assert_eq!(exit.as_int().unwrap().to_u64(), 30);
}

#[test]
fn va_arg_past_the_end_is_fatal_with_both_sizes() {
    let i32t = Type::int(32);
    let mut mb = ModuleBuilder::new("va_over");
    let va_start = mb.declare_function("llvm.va_start.p0", vec![Type::ptr()], Type::void());
    let (overrun, mut sb) =
        mb.define_varargs_function("overrun", vec![i32t.clone()], i32t.clone());
    sb.block("entry");
    let ap = sb.alloca(Type::int(64), i32_const(1), 8);
    let va_ty = Type::func(vec![Type::ptr()], Type::void(), false);
    sb.call(va_ty, Operand::Func(va_start), vec![ap.clone()]);
    let x = sb.va_arg(i32t.clone(), ap.clone());
    let y = sb.va_arg(i32t.clone(), ap);
    let sum = sb.binary(BinOp::Add, i32t.clone(), x, y);
    sb.ret(sum);
    sb.finish(&mut mb);

    let (main, mut fb) = mb.define_function("main", vec![], i32t.clone());
    fb.block("entry");
    let ty = Type::func(vec![i32t.clone()], i32t.clone(), true);
    // Only one variadic argument; the second va_arg overruns.
    let r = fb.call(ty, Operand::Func(overrun), vec![i32_const(1), i32_const(10)]);
    fb.ret(r);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    let err = engine.run_function(main, &[]).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("argument index 1"));
    assert!(msg.contains("size 1"));
}

// =============================================================================
// Intrinsics
// =============================================================================

#[test]
fn memset_lowers_to_a_libc_foreign_call() {
    let mut mb = ModuleBuilder::new("memset");
    let memset = mb.declare_function(
        "llvm.memset.p0.i64",
        vec![Type::ptr(), Type::int(8), Type::int(64), Type::int(1)],
        Type::void(),
    );
    let (main, mut fb) = mb.define_function("main", vec![Type::ptr()], Type::void());
    fb.block("entry");
    let memset_ty = Type::func(
        vec![Type::ptr(), Type::int(8), Type::int(64), Type::int(1)],
        Type::void(),
        false,
    );
    fb.call(
        memset_ty,
        Operand::Func(memset),
        vec![
            fb.arg(0),
            Operand::Const(Constant::int(8, 0xab)),
            i64_const(16),
            Operand::Const(Constant::int(1, 0)),
        ],
    );
    fb.ret_void();
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    engine
        .create_thread(1, main, vec![Value::ptr(MiriPointer::with_addr(0x900))])
        .unwrap();
    // Step 1 lowers in place; step 2 executes the inserted zext; step
    // 3 issues the foreign call by name.
    assert!(!engine.step_thread(1, None).unwrap());
    assert!(!engine.step_thread(1, None).unwrap());
    assert!(!engine.step_thread(1, None).unwrap());
    assert_eq!(oracle.named_calls(), vec!["memset"]);
    let args = &oracle.named_call_args[0];
    assert_eq!(args.len(), 3);
    assert_eq!(args[1].as_int().unwrap().width(), 32);
    assert_eq!(args[1].as_int().unwrap().to_u64(), 0xab);
    // Resolve the foreign result (void needs no value) and finish.
    assert!(engine.step_thread(1, None).unwrap());
}

#[test]
fn direct_intrinsics_evaluate_in_place() {
    let mut mb = ModuleBuilder::new("direct");
    let fabs = mb.declare_function("llvm.fabs.f64", vec![Type::double()], Type::double());
    let fsh = mb.declare_function(
        "llvm.fshl.i8",
        vec![Type::int(8), Type::int(8), Type::int(8)],
        Type::int(8),
    );
    let (f, mut fb) = mb.define_function("go", vec![], Type::int(8));
    fb.block("entry");
    let fabs_ty = Type::func(vec![Type::double()], Type::double(), false);
    fb.call(
        fabs_ty,
        Operand::Func(fabs),
        vec![Operand::Const(Constant::F64(-2.0))],
    );
    let fsh_ty = Type::func(
        vec![Type::int(8), Type::int(8), Type::int(8)],
        Type::int(8),
        false,
    );
    let rotated = fb.call(
        fsh_ty,
        Operand::Func(fsh),
        vec![
            Operand::Const(Constant::int(8, 0b1000_0001)),
            Operand::Const(Constant::int(8, 0b1000_0001)),
            Operand::Const(Constant::int(8, 1)),
        ],
    );
    fb.ret(rotated);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    let exit = engine.run_function(f, &[]).unwrap();
    // fshl(a, a, 1) of 0b1000_0001 rotates to 0b0000_0011.
    assert_eq!(exit.as_int().unwrap().to_u64(), 0b0000_0011);
    // Nothing reached the oracle's call hooks.
    assert!(oracle.named_calls().is_empty());
}

// =============================================================================
// Control flow details
// =============================================================================

#[test]
fn switch_scans_cases_and_falls_through_to_default() {
    let i32t = Type::int(32);
    let mut mb = ModuleBuilder::new("switch");
    let (f, mut fb) = mb.define_function("classify", vec![i32t.clone()], i32t.clone());
    let entry = fb.block("entry");
    let one = fb.block("one");
    let two = fb.block("two");
    let other = fb.block("other");
    fb.select_block(entry);
    fb.switch(
        fb.arg(0),
        other,
        vec![
            (Constant::int(32, 1), one),
            (Constant::int(32, 2), two),
        ],
    );
    fb.select_block(one);
    fb.ret(i32_const(100));
    fb.select_block(two);
    fb.ret(i32_const(200));
    fb.select_block(other);
    fb.ret(i32_const(999));
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    for (input, expected) in [(1u64, 100u64), (2, 200), (7, 999)] {
        let exit = engine
            .run_function(f, &[Value::of_u64(32, input)])
            .unwrap();
        assert_eq!(exit.as_int().unwrap().to_u64(), expected);
    }
}

#[test]
fn invoke_takes_the_normal_edge_when_the_result_arrives() {
    let i32t = Type::int(32);
    let mut mb = ModuleBuilder::new("invoke");
    let callee = mb.declare_function("may_unwind", vec![], i32t.clone());
    let (f, mut fb) = mb.define_function("caller", vec![], i32t.clone());
    let entry = fb.block("entry");
    let normal = fb.block("normal");
    let unwind = fb.block("unwind");
    fb.select_block(entry);
    let fn_ty = Type::func(vec![], i32t.clone(), false);
    let r = fb.invoke(fn_ty, Operand::Func(callee), vec![], normal, unwind);
    fb.select_block(normal);
    let bumped = fb.binary(BinOp::Add, i32t.clone(), r, i32_const(1));
    fb.ret(bumped);
    fb.select_block(unwind);
    fb.unreachable();
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);

    engine.create_thread(1, f, vec![]).unwrap();
    assert!(!engine.step_thread(1, None).unwrap());
    // The pending resolution binds %r and branches to `normal`; the
    // same step then executes the add.
    assert!(!engine.step_thread(1, Some(Value::of_u64(32, 41))).unwrap());
    assert!(engine.step_thread(1, None).unwrap());
    assert_eq!(exit_int(&engine, 1).to_u64(), 42);
}

#[test]
fn vector_and_aggregate_instructions() {
    let i32t = Type::int(32);
    let vec_ty = Type::vector(i32t.clone(), 2);
    let pair_ty = Type::anon_struct(vec![i32t.clone(), i32t.clone()]);
    let mut mb = ModuleBuilder::new("agg");
    let (f, mut fb) = mb.define_function("shuffle_and_pack", vec![], i32t.clone());
    fb.block("entry");
    let zero_vec = Operand::Const(Constant::Zero(vec_ty.clone()));
    let v0 = fb.insert_element(vec_ty.clone(), zero_vec, i32_const(11), i32_const(0));
    let v1 = fb.insert_element(vec_ty.clone(), v0, i32_const(22), i32_const(1));
    // Swap the lanes, then read lane 0.
    let swapped = fb.shuffle_vector(vec_ty.clone(), v1.clone(), v1, vec![1, 0]);
    let lane = fb.extract_element(i32t.clone(), swapped, i32_const(0));
    let zero_pair = Operand::Const(Constant::Zero(pair_ty.clone()));
    let packed = fb.insert_value(pair_ty.clone(), zero_pair, lane, vec![1]);
    let unpacked = fb.extract_value(i32t.clone(), packed, vec![1]);
    fb.ret(unpacked);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    let exit = engine.run_function(f, &[]).unwrap();
    assert_eq!(exit.as_int().unwrap().to_u64(), 22);
}

#[test]
fn indirectbr_decodes_a_block_address() {
    let i32t = Type::int(32);
    let mut mb = ModuleBuilder::new("indirectbr");
    let (f, mut fb) = mb.define_function("jump", vec![], i32t.clone());
    let entry = fb.block("entry");
    let red = fb.block("red");
    let blue = fb.block("blue");
    fb.select_block(entry);
    fb.indirect_br(
        Operand::Const(Constant::BlockAddress(f, blue)),
        vec![red, blue],
    );
    fb.select_block(red);
    fb.ret(i32_const(1));
    fb.select_block(blue);
    fb.ret(i32_const(2));
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    let exit = engine.run_function(f, &[]).unwrap();
    assert_eq!(exit.as_int().unwrap().to_u64(), 2);
}

#[test]
fn internal_calls_do_not_suspend() {
    let i32t = Type::int(32);
    let mut mb = ModuleBuilder::new("internal");
    let (helper, mut hb) = mb.define_function("double_it", vec![i32t.clone()], i32t.clone());
    hb.block("entry");
    let doubled = hb.binary(BinOp::Add, i32t.clone(), hb.arg(0), hb.arg(0));
    hb.ret(doubled);
    hb.finish(&mut mb);

    let (main, mut fb) = mb.define_function("main", vec![], i32t.clone());
    fb.block("entry");
    let ty = Type::func(vec![i32t.clone()], i32t.clone(), false);
    let r = fb.call(ty, Operand::Func(helper), vec![i32_const(21)]);
    fb.ret(r);
    fb.finish(&mut mb);

    let mut oracle = MockOracle::new();
    let mut engine = Engine::new(mb.finish());
    install(&mut engine, &mut oracle);
    let exit = engine.run_function(main, &[]).unwrap();
    assert_eq!(exit.as_int().unwrap().to_u64(), 42);
    assert!(oracle.named_calls().is_empty());
    assert!(!oracle.events.iter().any(|e| matches!(e, Event::CallByPointer { .. })));
}
