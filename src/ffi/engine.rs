//! Engine lifecycle, hook installation and thread driving.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{CStr, CString, c_char, c_void};

use crate::interp::{Engine, Value};
use crate::ir::{FuncId, Module};
use crate::oracle::{
    MiriCallByName, MiriCallByPointer, MiriFree, MiriGetElementPointer, MiriIntToPtr,
    MiriLoadStore, MiriMalloc, MiriMemcpy, MiriMemset, MiriPtrToInt, MiriRegisterGlobal,
    MiriStackTraceRecorder,
};

use super::types::{GalenaEngine, GalenaModule, GalenaValue, engine_mut, engine_ref, value_ref};

/// Id returned by lookups that found nothing.
pub const GALENA_NO_FUNCTION: u32 = u32::MAX;

/// Create an engine for a materialized module. Ownership of the
/// module transfers into the engine.
///
/// Returns NULL if `module` is NULL.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_new(module: *mut GalenaModule) -> *mut GalenaEngine {
    if module.is_null() {
        return std::ptr::null_mut();
    }
    let module = *Box::from_raw(module as *mut Module);
    Box::into_raw(Box::new(Engine::new(module))) as *mut GalenaEngine
}

/// Free an engine. Frames still alive release their allocas through
/// the free hook, when the hook table is complete.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_free(engine: *mut GalenaEngine) {
    if engine.is_null() {
        return;
    }
    let _ = Box::from_raw(engine as *mut Engine);
}

macro_rules! hook_setter {
    ($(#[$doc:meta])* $name:ident, $setter:ident, $ty:ty) => {
        $(#[$doc])*
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name(engine: *mut GalenaEngine, hook: $ty) {
            if let Some(engine) = engine_mut(engine) {
                engine.$setter(hook);
            }
        }
    };
}

hook_setter!(galena_engine_set_malloc_hook, set_malloc_hook, MiriMalloc);
hook_setter!(galena_engine_set_free_hook, set_free_hook, MiriFree);
hook_setter!(galena_engine_set_load_hook, set_load_hook, MiriLoadStore);
hook_setter!(galena_engine_set_store_hook, set_store_hook, MiriLoadStore);
hook_setter!(galena_engine_set_memset_hook, set_memset_hook, MiriMemset);
hook_setter!(galena_engine_set_memcpy_hook, set_memcpy_hook, MiriMemcpy);
hook_setter!(
    galena_engine_set_int_to_ptr_hook,
    set_int_to_ptr_hook,
    MiriIntToPtr
);
hook_setter!(
    galena_engine_set_ptr_to_int_hook,
    set_ptr_to_int_hook,
    MiriPtrToInt
);
hook_setter!(
    galena_engine_set_gep_hook,
    set_gep_hook,
    MiriGetElementPointer
);
hook_setter!(
    galena_engine_set_register_global_hook,
    set_register_global_hook,
    MiriRegisterGlobal
);
hook_setter!(
    galena_engine_set_call_by_name_hook,
    set_call_by_name_hook,
    MiriCallByName
);
hook_setter!(
    galena_engine_set_call_by_pointer_hook,
    set_call_by_pointer_hook,
    MiriCallByPointer
);
hook_setter!(
    galena_engine_set_stack_trace_recorder_hook,
    set_stack_trace_recorder_hook,
    MiriStackTraceRecorder
);

/// Install the oracle's self pointer. The first installation emits
/// every module global through the `register_global` hook.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_set_oracle_wrapper(
    engine: *mut GalenaEngine,
    wrapper: *mut c_void,
) {
    if let Some(engine) = engine_mut(engine) {
        engine.set_oracle_wrapper(wrapper);
    }
}

/// Extract the constructor/destructor lists from the module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_initialize_ctor_dtor_lists(engine: *mut GalenaEngine) {
    if let Some(engine) = engine_mut(engine) {
        engine.initialize_ctor_dtor_lists();
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_ctor_count(engine: *const GalenaEngine) -> u64 {
    engine_ref(engine).map_or(0, |e| e.ctor_count() as u64)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_dtor_count(engine: *const GalenaEngine) -> u64 {
    engine_ref(engine).map_or(0, |e| e.dtor_count() as u64)
}

/// Function id of the i-th constructor, or `GALENA_NO_FUNCTION`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_get_ctor_at(
    engine: *const GalenaEngine,
    index: u64,
) -> u32 {
    engine_ref(engine)
        .and_then(|e| e.ctor_at(index as usize))
        .map_or(GALENA_NO_FUNCTION, |f| f.0)
}

/// Function id of the i-th destructor, or `GALENA_NO_FUNCTION`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_get_dtor_at(
    engine: *const GalenaEngine,
    index: u64,
) -> u32 {
    engine_ref(engine)
        .and_then(|e| e.dtor_at(index as usize))
        .map_or(GALENA_NO_FUNCTION, |f| f.0)
}

/// Look a function up by name. Returns `GALENA_NO_FUNCTION` if there
/// is no such function.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_find_function(
    engine: *const GalenaEngine,
    name: *const c_char,
) -> u32 {
    let Some(engine) = engine_ref(engine) else {
        return GALENA_NO_FUNCTION;
    };
    if name.is_null() {
        return GALENA_NO_FUNCTION;
    }
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return GALENA_NO_FUNCTION;
    };
    engine
        .find_function(name)
        .map_or(GALENA_NO_FUNCTION, |f| f.0)
}

unsafe fn collect_args(args: *const *mut GalenaValue, nargs: u32) -> Vec<Value> {
    let mut out = Vec::with_capacity(nargs as usize);
    if args.is_null() {
        return out;
    }
    for i in 0..nargs as usize {
        let ptr = *args.add(i);
        if let Some(value) = value_ref(ptr) {
            out.push(value.clone());
        }
    }
    out
}

/// Call a function and drive it to completion. Returns a freshly
/// allocated value handle (free with `galena_value_free`), or NULL on
/// error; consult `galena_engine_err_msg`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_run_function(
    engine: *mut GalenaEngine,
    func: u32,
    args: *const *mut GalenaValue,
    nargs: u32,
) -> *mut GalenaValue {
    let Some(engine) = engine_mut(engine) else {
        return std::ptr::null_mut();
    };
    let args = collect_args(args, nargs);
    match engine.run_function(FuncId(func), &args) {
        Ok(value) => Box::into_raw(Box::new(value)) as *mut GalenaValue,
        Err(_) => std::ptr::null_mut(),
    }
}

/// Run a function as a C `main`. `argv` has `argc` entries; `envp` is
/// NULL-terminated (or NULL). Returns the program's exit code, or -1
/// when execution failed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_run_function_as_main(
    engine: *mut GalenaEngine,
    func: u32,
    argc: u32,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> i32 {
    let Some(engine) = engine_mut(engine) else {
        return -1;
    };
    let mut argv_vec = Vec::with_capacity(argc as usize);
    for i in 0..argc as usize {
        if argv.is_null() {
            break;
        }
        let item = *argv.add(i);
        if item.is_null() {
            break;
        }
        argv_vec.push(CStr::from_ptr(item).to_string_lossy().into_owned());
    }
    let mut envp_vec = Vec::new();
    if !envp.is_null() {
        let mut i = 0;
        loop {
            let item = *envp.add(i);
            if item.is_null() {
                break;
            }
            envp_vec.push(CStr::from_ptr(item).to_string_lossy().into_owned());
            i += 1;
        }
    }
    engine
        .run_function_as_main(FuncId(func), &argv_vec, &envp_vec)
        .unwrap_or(-1)
}

/// Create a logical thread whose root frame calls `func`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_create_thread(
    engine: *mut GalenaEngine,
    thread_id: u64,
    func: u32,
    args: *const *mut GalenaValue,
    nargs: u32,
) {
    if let Some(engine) = engine_mut(engine) {
        let args = collect_args(args, nargs);
        let _ = engine.create_thread(thread_id, FuncId(func), args);
    }
}

/// Advance one thread by one instruction, consuming `pending` first
/// when a foreign call is outstanding. Returns true when the thread's
/// stack is empty; errors are sticky on the engine.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_step_thread(
    engine: *mut GalenaEngine,
    thread_id: u64,
    pending: *mut GalenaValue,
) -> bool {
    let Some(engine) = engine_mut(engine) else {
        return false;
    };
    let pending = value_ref(pending).cloned();
    engine.step_thread(thread_id, pending).unwrap_or(false)
}

/// Borrow the exit value of a thread. The pointer is valid until the
/// thread is terminated or the engine freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_thread_exit_value(
    engine: *const GalenaEngine,
    thread_id: u64,
) -> *const GalenaValue {
    engine_ref(engine)
        .and_then(|e| e.thread_exit_value(thread_id))
        .map_or(std::ptr::null(), |v| {
            v as *const Value as *const GalenaValue
        })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_has_thread(
    engine: *const GalenaEngine,
    thread_id: u64,
) -> bool {
    engine_ref(engine).is_some_and(|e| e.has_thread(thread_id))
}

/// Remove a thread, releasing every frame's allocas through the free
/// hook.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_terminate_thread(
    engine: *mut GalenaEngine,
    thread_id: u64,
) {
    if let Some(engine) = engine_mut(engine) {
        engine.terminate_thread(thread_id);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_has_error(engine: *const GalenaEngine) -> bool {
    engine_ref(engine).is_some_and(Engine::has_error)
}

/// Take the sticky error message. Returns NULL when there is none;
/// otherwise an owned C string to release with `galena_string_free`.
/// Taking the message clears the error flag.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_engine_err_msg(engine: *mut GalenaEngine) -> *mut c_char {
    let Some(engine) = engine_mut(engine) else {
        return std::ptr::null_mut();
    };
    match engine.err_msg() {
        Some(msg) => CString::new(msg)
            .map(CString::into_raw)
            .unwrap_or(std::ptr::null_mut()),
        None => std::ptr::null_mut(),
    }
}

/// Free a string returned by this API.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn galena_string_free(string: *mut c_char) {
    if !string.is_null() {
        let _ = CString::from_raw(string);
    }
}
