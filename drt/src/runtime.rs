//! The runtime: configuration, the shared tables, and the entry points generated code calls.

use crate::{
    abi::{self, Abi, BasicType},
    adapter::{self, AdapterLibrary},
    callconv::CallConvCache,
    codecache::{BlobKind, CodeBlob, CodeCache, NewBlob},
    deopt::{self, ExecMode},
    heap::{ClassId, Heap},
    log::{
        stats::{Stats, TimingState},
        Log, Verbosity,
    },
    masm::sim::Machine,
    mem::Memory,
    method::{Method, MethodId, MethodTable, NewMethod},
    native::{NativeCall, NativeId, NativeRegistry},
    native_wrapper,
    safepoint::Safepoints,
    stubs::StubRoutines,
    sync::ObjectSynchronizer,
    thread::{AnchorGuard, ThreadContext, ThreadState},
    CodeGenError, RuntimeBuildError,
};
use std::{
    env,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use strum::Display;

const DEFAULT_STACK_SIZE: u64 = 512 * 1024;
const DEFAULT_GUARD_PAGES: u64 = 1;
const DEFAULT_SHADOW_PAGES: u64 = 4;
const DEFAULT_HEAP_SIZE: u64 = 4 * 1024 * 1024;
const DEFAULT_C_HEAP_SIZE: u64 = 1024 * 1024;
const DEFAULT_STACK_ARENA_SIZE: u64 = 16 * 1024 * 1024;
const DEFAULT_CODE_CACHE_SIZE: u64 = 4 * 1024 * 1024;

/// The resolved configuration of a [Runtime].
#[derive(Clone, Debug)]
pub struct Options {
    /// The usable size of each thread's stack in bytes.
    pub stack_size: u64,
    /// Pages in each of the red, yellow and reserved zones.
    pub guard_pages: u64,
    /// Pages below the stack pointer that must be touchable before a frame is built.
    pub stack_shadow_pages: u64,
    pub heap_size: u64,
    pub c_heap_size: u64,
    pub stack_arena_size: u64,
    pub code_cache_size: u64,
    /// Make the adapters check where they were called from.
    pub verify_adapter_calls: bool,
    /// Make the deopt blob bang every page of the frames it is about to push.
    pub verify_stack_bang: bool,
    /// Save the upper halves of the vector registers in register save areas.
    pub save_wide_vectors: bool,
    /// Check that runtime calls from native wrappers leave no exception pending.
    pub check_no_pending_exception: bool,
}

/// Configure a [Runtime]. The debug switches default to on in debug builds; a `DRT_*` environment
/// variable overrides the default, and an explicit setter overrides both.
pub struct RuntimeBuilder {
    abi: &'static Abi,
    stack_size: Option<u64>,
    heap_size: u64,
    code_cache_size: u64,
    verify_adapter_calls: Option<bool>,
    verify_stack_bang: Option<bool>,
    save_wide_vectors: Option<bool>,
    check_no_pending_exception: Option<bool>,
    log: Option<Verbosity>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            abi: abi::x64::host(),
            stack_size: None,
            heap_size: DEFAULT_HEAP_SIZE,
            code_cache_size: DEFAULT_CODE_CACHE_SIZE,
            verify_adapter_calls: None,
            verify_stack_bang: None,
            save_wide_vectors: None,
            check_no_pending_exception: None,
            log: None,
        }
    }

    /// Generate code for `abi` rather than for the host.
    pub fn abi(mut self, abi: &'static Abi) -> Self {
        self.abi = abi;
        self
    }

    pub fn stack_size(mut self, bytes: u64) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn heap_size(mut self, bytes: u64) -> Self {
        self.heap_size = bytes;
        self
    }

    pub fn code_cache_size(mut self, bytes: u64) -> Self {
        self.code_cache_size = bytes;
        self
    }

    pub fn verify_adapter_calls(mut self, on: bool) -> Self {
        self.verify_adapter_calls = Some(on);
        self
    }

    pub fn verify_stack_bang(mut self, on: bool) -> Self {
        self.verify_stack_bang = Some(on);
        self
    }

    pub fn save_wide_vectors(mut self, on: bool) -> Self {
        self.save_wide_vectors = Some(on);
        self
    }

    pub fn check_no_pending_exception(mut self, on: bool) -> Self {
        self.check_no_pending_exception = Some(on);
        self
    }

    /// Log to stderr at `level`, ignoring `DRT_LOG`.
    pub fn log_level(mut self, level: Verbosity) -> Self {
        self.log = Some(level);
        self
    }

    pub fn build(self) -> Result<Arc<Runtime>, RuntimeBuildError> {
        let options = Options {
            stack_size: match self.stack_size {
                Some(x) => x,
                None => env_u64("DRT_STACK_SIZE")?.unwrap_or(DEFAULT_STACK_SIZE),
            },
            guard_pages: DEFAULT_GUARD_PAGES,
            stack_shadow_pages: DEFAULT_SHADOW_PAGES,
            heap_size: self.heap_size,
            c_heap_size: DEFAULT_C_HEAP_SIZE,
            stack_arena_size: DEFAULT_STACK_ARENA_SIZE,
            code_cache_size: self.code_cache_size,
            verify_adapter_calls: switch(
                self.verify_adapter_calls,
                "DRT_VERIFY_ADAPTER_CALLS",
                cfg!(debug_assertions),
            )?,
            verify_stack_bang: switch(
                self.verify_stack_bang,
                "DRT_VERIFY_STACK_BANG",
                cfg!(debug_assertions),
            )?,
            save_wide_vectors: switch(self.save_wide_vectors, "DRT_SAVE_WIDE_VECTORS", false)?,
            check_no_pending_exception: switch(
                self.check_no_pending_exception,
                "DRT_CHECK_NO_PENDING_EXCEPTION",
                cfg!(debug_assertions),
            )?,
        };
        let page = page_size::get() as u64;
        if options.stack_size < 2 * options.stack_shadow_pages * page {
            return Err(RuntimeBuildError::Config(format!(
                "stack size {} is smaller than twice the shadow zone",
                options.stack_size
            )));
        }
        let log = match self.log {
            Some(l) => Log::with_level(l),
            None => Log::from_env().map_err(|e| RuntimeBuildError::Config(e.to_string()))?,
        };
        let mem = Memory::new(
            options.heap_size,
            options.c_heap_size,
            options.stack_arena_size,
        )?;
        let code_cache = CodeCache::new(options.code_cache_size);
        let stats = Stats::from_env();
        stats.timing_state(TimingState::GeneratingStubs);
        let stubs = StubRoutines::generate(self.abi, &options, &code_cache, &log)?;
        stats.timing_state(TimingState::None);
        Ok(Arc::new(Runtime {
            abi: self.abi,
            options,
            mem,
            code_cache,
            methods: MethodTable::new(),
            heap: Heap::new(),
            natives: NativeRegistry::new(),
            sync: ObjectSynchronizer::new(),
            safepoints: Safepoints::new(),
            callconv: CallConvCache::new(self.abi),
            adapters: AdapterLibrary::new(),
            stubs,
            log,
            stats,
            next_thread_id: AtomicU64::new(1),
        }))
    }
}

/// Resolve a debug switch: an explicit setting wins, then `var` (`0` or `1`), then the build's
/// default.
/// An on/off option: `explicit` if given, else `var` if set, else `default`.
fn switch(explicit: Option<bool>, var: &str, default: bool) -> Result<bool, RuntimeBuildError> {
    if let Some(x) = explicit {
        return Ok(x);
    }
    match env::var(var) {
        Ok(s) => match s.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(RuntimeBuildError::Config(format!(
                "{var} must be 0 or 1, not '{s}'"
            ))),
        },
        Err(_) => Ok(default),
    }
}

fn env_u64(var: &str) -> Result<Option<u64>, RuntimeBuildError> {
    match env::var(var) {
        Ok(s) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|e| RuntimeBuildError::Config(format!("Invalid value for {var}: {e}"))),
        Err(_) => Ok(None),
    }
}

pub struct Runtime {
    abi: &'static Abi,
    options: Options,
    pub mem: Memory,
    pub code_cache: CodeCache,
    pub methods: MethodTable,
    pub heap: Heap,
    pub natives: NativeRegistry,
    pub sync: ObjectSynchronizer,
    pub safepoints: Safepoints,
    pub callconv: CallConvCache,
    pub adapters: AdapterLibrary,
    stubs: StubRoutines,
    pub(crate) log: Log,
    pub(crate) stats: Stats,
    next_thread_id: AtomicU64,
}

impl Runtime {
    pub fn abi(&self) -> &'static Abi {
        self.abi
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn stubs(&self) -> &StubRoutines {
        &self.stubs
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach a new managed thread.
    pub fn new_thread(self: &Arc<Self>) -> ThreadContext {
        ThreadContext::new(self)
    }

    pub fn define_class(&self, name: &str, field_count: u32) -> ClassId {
        self.heap.define_class(&self.mem, name, field_count)
    }

    /// Define a method and link it to the interpreter through its adapters.
    pub fn add_method(&self, nm: NewMethod) -> Result<Arc<Method>, CodeGenError> {
        let mirror = self.heap.class(nm.holder).mirror;
        let m = self.methods.add(nm, mirror);
        let entry = self.adapters.get_adapter(self, &m.sig_bt())?;
        m.link(self.stubs.interpreter_entry(), entry.i2c, entry.c2i);
        Ok(m)
    }

    pub fn method(&self, id: MethodId) -> Arc<Method> {
        self.methods.get(id)
    }

    /// Register a native function with an explicit native signature (in slot form).
    pub fn register_native<F>(
        &self,
        name: &str,
        sig: &[BasicType],
        ret: BasicType,
        f: F,
    ) -> NativeId
    where
        F: Fn(&mut NativeCall<'_, '_>) -> u64 + Send + Sync + 'static,
    {
        self.natives.register(name, sig.to_vec(), ret, Arc::new(f))
    }

    /// Implement the native method `method` by `f`: register `f` under the native signature the
    /// method implies, generate a wrapper for it and make the wrapper the method's code.
    pub fn bind_native<F>(&self, method: &Method, f: F) -> Result<Arc<CodeBlob>, CodeGenError>
    where
        F: Fn(&mut NativeCall<'_, '_>) -> u64 + Send + Sync + 'static,
    {
        assert!(method.is_native, "{} is not native", method.name);
        let sig = native_wrapper::native_signature(method);
        let id = self.register_native(&method.name, &sig, method.ret, f);
        method.bind_native(id);
        self.generate_native_wrapper(method)
    }

    /// Generate and install the wrapper of the native method `method`.
    pub fn generate_native_wrapper(&self, method: &Method) -> Result<Arc<CodeBlob>, CodeGenError> {
        self.stats.timing_state(TimingState::GeneratingStubs);
        let r = native_wrapper::generate(self, method).and_then(|nb| self.install(nb));
        self.stats.timing_state(TimingState::None);
        if r.is_ok() {
            self.stats.native_wrapper_created();
        }
        r
    }

    /// Install `nb` in the code cache. Compiled code and native wrappers become their method's
    /// code.
    pub fn install(&self, nb: NewBlob) -> Result<Arc<CodeBlob>, CodeGenError> {
        let b = self.code_cache.install(nb)?;
        self.log_blob(&b);
        if let BlobKind::Nmethod(nm) | BlobKind::NativeWrapper(nm) = b.kind() {
            let m = self.methods.get(nm.method);
            m.set_code(b.code_begin(), b.addr(nm.verified_entry));
        }
        Ok(b)
    }

    /// Stop new calls from entering `blob`'s code. Its verified entry is patched to jump to the
    /// wrong-method stub, which sends calls already bound to it wherever the method's entry now
    /// leads. Frames already running the code are unaffected.
    pub fn make_not_entrant(&self, blob: &CodeBlob) {
        let Some(nm) = blob.nmethod() else { return };
        if !nm.make_not_entrant(self.stubs().handle_wrong_method_entry()) {
            return;
        }
        let m = self.methods.get(nm.method);
        if m.code() == Some(blob.code_begin()) {
            m.clear_code();
        }
        if self.log.enabled(Verbosity::Stub) {
            self.log.log(Verbosity::Stub, &format!("made {} not entrant", blob.name()));
        }
    }

    pub(crate) fn log_blob(&self, b: &CodeBlob) {
        self.log.log_blob(self.abi, b);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stats.output();
    }
}

/// The runtime functions generated code can call. Arguments are passed in the native integer
/// argument registers; the calling thread is implicit.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum RuntimeEntry {
    /// `(method, caller_pc)`: patch the call site that led into a c2i adapter.
    FixupCallersCallsite,
    /// `(obj, lock)`: the slow path of locking a synchronized native method's receiver or class.
    CompleteMonitorLocking,
    /// `(obj, lock)`.
    CompleteMonitorUnlocking,
    /// Block for a safepoint or suspension seen on return from native code.
    CheckSpecialConditionForNativeTrans,
    ReguardYellowPages,
    /// `(exec_mode)`: returns the address of the unroll block.
    FetchUnrollInfo,
    /// `(exec_mode)`: returns the result type of the youngest frame, as its signature character.
    UnpackFrames,
    /// `(trap_request, exec_mode)`: returns the address of the unroll block.
    UncommonTrap,
    /// Block at a safepoint poll in compiled code.
    HandlePollingPage,
    /// `(method, caller_pc)`: a call reached code that is not entrant. Returns the entry to take
    /// now.
    HandleWrongMethod,
}

/// Run runtime entry `e` for the thread of `m`. Returns the value for the result register, if
/// any.
pub(crate) fn call_runtime(m: &mut Machine<'_>, e: RuntimeEntry) -> Option<u64> {
    let mut g = AnchorGuard::new(m);
    let m: &mut Machine<'_> = &mut g;
    let rt = Arc::clone(m.rt());
    match e {
        RuntimeEntry::FixupCallersCallsite => {
            let w = arg(m, 0);
            let method = MethodId::from_word(w)
                .unwrap_or_else(|| panic!("fixup of call site with non-method {w:#x}"));
            adapter::fixup_callers_callsite(&rt, method, arg(m, 1));
            None
        }
        RuntimeEntry::CompleteMonitorLocking => {
            let (obj, lock) = (arg(m, 0), arg(m, 1));
            let shared = Arc::clone(&m.thread.shared);
            let prev = shared.state();
            shared.set_state(ThreadState::Blocked);
            rt.sync.enter(&rt.mem, obj, lock, shared.id);
            shared.set_state(prev);
            if rt.safepoints.poll(&shared) {
                rt.safepoints.block(&shared, prev);
            }
            None
        }
        RuntimeEntry::CompleteMonitorUnlocking => {
            assert!(
                m.thread.pending_exception == 0,
                "monitor unlocked with an exception pending"
            );
            rt.sync.exit(&rt.mem, arg(m, 0), arg(m, 1), m.thread.id());
            None
        }
        RuntimeEntry::CheckSpecialConditionForNativeTrans => {
            rt.stats.safepoint_slow_path();
            let shared = Arc::clone(&m.thread.shared);
            rt.safepoints.block(&shared, ThreadState::InNativeTrans);
            None
        }
        RuntimeEntry::ReguardYellowPages => {
            rt.stats.reguarded();
            m.thread.reguard_stack();
            Some(1)
        }
        RuntimeEntry::FetchUnrollInfo => {
            let mode = exec_mode(arg(m, 0));
            Some(deopt::fetch_unroll_info(m, mode))
        }
        RuntimeEntry::UnpackFrames => {
            let mode = exec_mode(arg(m, 0));
            Some(u64::from(deopt::unpack_frames(m, mode).to_char()))
        }
        RuntimeEntry::UncommonTrap => {
            let request = arg(m, 0) as i32;
            let mode = exec_mode(arg(m, 1));
            Some(deopt::uncommon_trap(m, request, mode))
        }
        RuntimeEntry::HandlePollingPage => {
            rt.stats.safepoint_slow_path();
            let shared = Arc::clone(&m.thread.shared);
            rt.safepoints.block(&shared, ThreadState::InJava);
            None
        }
        RuntimeEntry::HandleWrongMethod => {
            let (method, caller_pc) = (arg(m, 0), arg(m, 1));
            Some(adapter::handle_wrong_method(&rt, m.thread, method, caller_pc))
        }
    }
}

/// The `i`th integer argument of a runtime call.
fn arg(m: &Machine<'_>, i: usize) -> u64 {
    m.reg(m.abi().c_int_args[i])
}

fn exec_mode(w: u64) -> ExecMode {
    u8::try_from(w)
        .ok()
        .and_then(ExecMode::from_repr)
        .unwrap_or_else(|| panic!("{w:#x} is not an exec mode"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{abi::x64::X64_WIN64, testing::TestRuntime};
    use BasicType::*;

    #[test]
    fn explicit_settings_win() {
        let rt = RuntimeBuilder::new()
            .abi(&X64_WIN64)
            .verify_adapter_calls(false)
            .save_wide_vectors(true)
            .build()
            .unwrap();
        assert_eq!(rt.abi().name, "x86_64-win64");
        assert!(!rt.options().verify_adapter_calls);
        assert!(rt.options().save_wide_vectors);
    }

    #[test]
    fn wide_vectors_are_opt_in() {
        if env::var("DRT_SAVE_WIDE_VECTORS").is_ok() {
            return;
        }
        let rt = RuntimeBuilder::new().build().unwrap();
        assert!(!rt.options().save_wide_vectors);
        assert!(!switch(None, "DRT_SAVE_WIDE_VECTORS", false).unwrap());
        assert!(switch(Some(true), "DRT_SAVE_WIDE_VECTORS", false).unwrap());
    }

    #[test]
    fn tiny_stack_rejected() {
        match RuntimeBuilder::new().stack_size(4096).build() {
            Err(RuntimeBuildError::Config(s)) => assert!(s.contains("shadow zone")),
            _ => panic!(),
        }
    }

    #[test]
    fn methods_are_linked() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 1);
        let m = t
            .rt
            .add_method(NewMethod::new("f", k, &[Int, Long], Int))
            .unwrap();
        let g = t
            .rt
            .add_method(NewMethod::new("g", k, &[Short, Long], Boolean))
            .unwrap();
        // Same shape, same adapters.
        assert_eq!(m.i2c_entry(), g.i2c_entry());
        assert_eq!(m.c2i_entry(), g.c2i_entry());
        assert_eq!(
            m.field(crate::method::MethodField::FromInterpretedEntry),
            t.rt.stubs().interpreter_entry()
        );
        assert_eq!(m.mirror, t.rt.heap.class(k).mirror);
    }

    #[test]
    fn not_entrant_unlinks() {
        let t = TestRuntime::new();
        let (m, b) = t.trivial_nmethod("h", 7);
        assert_eq!(m.code(), Some(b.code_begin()));
        t.rt.make_not_entrant(&b);
        assert_eq!(m.code(), None);
        assert!(b.nmethod().unwrap().is_not_entrant());
        assert_eq!(
            m.field(crate::method::MethodField::FromCompiledEntry),
            m.c2i_entry()
        );
    }
}
