//! Per-thread state.
//!
//! A [ThreadContext] is everything generated code and the runtime know about one managed thread:
//! its stack, its last-managed-frame anchor, its pending exception, its local handle block and the
//! state of any deoptimization in progress. It is owned by the thread itself. The parts other
//! threads need to see (the thread state and suspend flag) live in the shared [ThreadShared].

use crate::{
    abi::WORD,
    deferred::DeferredUpdates,
    deopt::vframe_array::VframeArray,
    frame::Frame,
    masm::sim::Machine,
    mem::{GuardKind, StackRegion},
    native::HANDLE_BLOCK_BYTES,
    runtime::Runtime,
};
use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
};
use strum::{Display, FromRepr};

/// The thread fields generated code can read and write.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ThreadField {
    LastJavaSp,
    LastJavaFp,
    LastJavaPc,
    PendingException,
    ExceptionOop,
    ExceptionPc,
    /// The method a call in progress resolved to.
    CalleeTarget,
    ActiveHandles,
    JniEnv,
    StackGuardState,
}

/// What a thread is doing, as far as safepoints are concerned.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
pub enum ThreadState {
    New,
    InJava,
    InVm,
    InNative,
    /// Returning from native code, not yet back in managed code.
    InNativeTrans,
    Blocked,
}

impl ThreadState {
    /// Can a safepoint proceed while a thread is in this state?
    pub fn is_safe(self) -> bool {
        matches!(
            self,
            ThreadState::New | ThreadState::InNative | ThreadState::Blocked
        )
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
pub enum StackGuardState {
    Enabled,
    /// A stack overflow was handled by disabling the yellow and reserved zones. They must be
    /// re-enabled before the thread next leaves the runtime.
    YellowReservedDisabled,
    ReservedDisabled,
}

/// The part of a thread other threads may look at.
#[derive(Debug)]
pub struct ThreadShared {
    pub id: u64,
    state: AtomicU8,
    suspend: AtomicBool,
    pub stack: StackRegion,
}

impl ThreadShared {
    pub fn state(&self) -> ThreadState {
        // Only `set_state` stores, always a valid discriminant.
        ThreadState::from_repr(self.state.load(Ordering::SeqCst)).unwrap()
    }

    /// Publish a new state. The store is sequentially consistent: a later load of the safepoint
    /// flag can't be reordered before it.
    pub fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    pub fn is_suspend_requested(&self) -> bool {
        self.suspend.load(Ordering::SeqCst)
    }

    pub(crate) fn set_suspend_requested(&self, on: bool) {
        self.suspend.store(on, Ordering::SeqCst);
    }
}

/// Where the youngest managed frame was when the thread last left managed code. An anchor with a
/// zero sp is empty.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FrameAnchor {
    pub last_sp: u64,
    pub last_fp: u64,
    pub last_pc: u64,
}

impl FrameAnchor {
    pub fn has_last_java_frame(&self) -> bool {
        self.last_sp != 0
    }
}

pub struct ThreadContext {
    pub rt: Arc<Runtime>,
    pub shared: Arc<ThreadShared>,
    pub anchor: FrameAnchor,
    pub pending_exception: u64,
    /// An exception being dispatched, and the pc that threw it.
    pub exception_oop: u64,
    pub exception_pc: u64,
    pub callee_target: u64,
    /// The local handle block of the innermost call into managed code: a count followed by the
    /// handles.
    pub active_handles: u64,
    pub jni_env: u64,
    pub stack_guard_state: StackGuardState,
    /// The frames being unpacked by a deoptimization in progress.
    pub(crate) vframe_array_head: Option<VframeArray>,
    pub deferred: DeferredUpdates,
}

impl ThreadContext {
    pub fn new(rt: &Arc<Runtime>) -> Self {
        let opts = rt.options();
        let stack = rt.mem.alloc_stack(opts.stack_size, opts.guard_pages);
        let shared = Arc::new(ThreadShared {
            id: rt.next_thread_id(),
            state: AtomicU8::new(ThreadState::New as u8),
            suspend: AtomicBool::new(false),
            stack,
        });
        rt.sync
            .register_stack(shared.stack.end..shared.stack.base, shared.id);
        rt.safepoints.register(Arc::clone(&shared));
        let active_handles = rt.mem.malloc(HANDLE_BLOCK_BYTES);
        let jni_env = rt.mem.malloc(8);
        rt.mem.write_u64(jni_env, shared.id);
        Self {
            rt: Arc::clone(rt),
            shared,
            anchor: FrameAnchor::default(),
            pending_exception: 0,
            exception_oop: 0,
            exception_pc: 0,
            callee_target: 0,
            active_handles,
            jni_env,
            stack_guard_state: StackGuardState::Enabled,
            vframe_array_head: None,
            deferred: DeferredUpdates::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn field(&self, f: ThreadField) -> u64 {
        match f {
            ThreadField::LastJavaSp => self.anchor.last_sp,
            ThreadField::LastJavaFp => self.anchor.last_fp,
            ThreadField::LastJavaPc => self.anchor.last_pc,
            ThreadField::PendingException => self.pending_exception,
            ThreadField::ExceptionOop => self.exception_oop,
            ThreadField::ExceptionPc => self.exception_pc,
            ThreadField::CalleeTarget => self.callee_target,
            ThreadField::ActiveHandles => self.active_handles,
            ThreadField::JniEnv => self.jni_env,
            ThreadField::StackGuardState => self.stack_guard_state as u64,
        }
    }

    pub fn set_field(&mut self, f: ThreadField, v: u64) {
        match f {
            ThreadField::LastJavaSp => self.anchor.last_sp = v,
            ThreadField::LastJavaFp => self.anchor.last_fp = v,
            ThreadField::LastJavaPc => self.anchor.last_pc = v,
            ThreadField::PendingException => self.pending_exception = v,
            ThreadField::ExceptionOop => self.exception_oop = v,
            ThreadField::ExceptionPc => self.exception_pc = v,
            ThreadField::CalleeTarget => self.callee_target = v,
            ThreadField::ActiveHandles => self.active_handles = v,
            ThreadField::JniEnv => self.jni_env = v,
            ThreadField::StackGuardState => {
                self.stack_guard_state = u8::try_from(v)
                    .ok()
                    .and_then(StackGuardState::from_repr)
                    .unwrap_or_else(|| panic!("{v:#x} is not a stack guard state"))
            }
        }
    }

    /// The initial stack pointer for code run on this thread.
    pub fn stack_top(&self) -> u64 {
        self.shared.stack.base
    }

    /// Record the pc of the anchor if generated code left it for the walker to find.
    pub fn make_walkable(&mut self) {
        if self.anchor.has_last_java_frame() && self.anchor.last_pc == 0 {
            self.anchor.last_pc = self.rt.mem.read_u64(self.anchor.last_sp - 8);
        }
    }

    /// The youngest managed frame.
    ///
    /// # Panics
    ///
    /// If the thread is running managed code, i.e. has no anchor.
    pub fn last_frame(&mut self) -> Frame {
        assert!(
            self.anchor.has_last_java_frame(),
            "thread {} has no last managed frame",
            self.shared.id
        );
        self.make_walkable();
        Frame::new(
            &self.rt,
            self.anchor.last_sp,
            self.anchor.last_fp,
            self.anchor.last_pc,
        )
    }

    /// Disable the yellow and reserved guard zones, as a stack overflow handler does.
    pub fn disable_stack_yellow_reserved_zone(&mut self) {
        for k in [GuardKind::Yellow, GuardKind::Reserved] {
            if let Some(g) = self.shared.stack.guard(k) {
                g.set_enabled(false);
            }
        }
        self.stack_guard_state = StackGuardState::YellowReservedDisabled;
    }

    pub fn reguard_stack(&mut self) {
        for k in [GuardKind::Yellow, GuardKind::Reserved] {
            if let Some(g) = self.shared.stack.guard(k) {
                g.set_enabled(true);
            }
        }
        self.stack_guard_state = StackGuardState::Enabled;
    }
}

/// Names the caller of a host-side runtime call as the thread's last managed frame for as long as
/// the call lasts, so that the stack can be walked from inside it. Dropping the guard puts the
/// anchor back the way it was.
pub struct AnchorGuard<'a, 't> {
    m: &'a mut Machine<'t>,
    prev: FrameAnchor,
}

impl<'a, 't> AnchorGuard<'a, 't> {
    /// `m` must have just pushed the return address of the call. If generated code already set
    /// up an anchor, that one is kept.
    pub fn new(m: &'a mut Machine<'t>) -> Self {
        let prev = m.thread.anchor;
        if !prev.has_last_java_frame() {
            m.thread.anchor = FrameAnchor {
                last_sp: m.sp() + WORD,
                last_fp: m.reg(m.abi().fp),
                last_pc: 0,
            };
        }
        m.thread.make_walkable();
        Self { m, prev }
    }
}

impl<'t> Deref for AnchorGuard<'_, 't> {
    type Target = Machine<'t>;

    fn deref(&self) -> &Self::Target {
        self.m
    }
}

impl DerefMut for AnchorGuard<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.m
    }
}

impl Drop for AnchorGuard<'_, '_> {
    fn drop(&mut self) {
        self.m.thread.anchor = self.prev;
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.rt.safepoints.unregister(self.shared.id);
        self.rt.sync.unregister_stack(self.shared.id);
        self.rt.mem.free(self.active_handles);
        self.rt.mem.free(self.jni_env);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        abi::BasicType,
        deopt::scope::{PcDesc, ScopeDesc},
        masm::Halt,
        method::NewMethod,
        stubs::ManagedCall,
        testing::{NmethodBuilder, TestRuntime},
    };

    #[test]
    fn fields() {
        let t = TestRuntime::new();
        let mut th = t.thread();
        th.set_field(ThreadField::PendingException, 0x88);
        assert_eq!(th.pending_exception, 0x88);
        th.set_field(ThreadField::StackGuardState, 1);
        assert_eq!(
            th.stack_guard_state,
            StackGuardState::YellowReservedDisabled
        );
        assert_eq!(th.field(ThreadField::StackGuardState), 1);
        assert_eq!(th.shared.state(), ThreadState::New);
        th.shared.set_state(ThreadState::InNativeTrans);
        assert!(!th.shared.state().is_safe());
    }

    #[test]
    fn walkable_anchor() {
        let t = TestRuntime::new();
        let mut th = t.thread();
        let sp = th.stack_top() - 64;
        t.rt.mem.write_u64(sp - 8, 0x4000_1234);
        th.anchor.last_sp = sp;
        th.make_walkable();
        assert_eq!(th.anchor.last_pc, 0x4000_1234);
        // Idempotent.
        t.rt.mem.write_u64(sp - 8, 0);
        th.make_walkable();
        assert_eq!(th.anchor.last_pc, 0x4000_1234);
    }

    #[test]
    fn anchor_guard_names_the_caller() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let f = t
            .rt
            .add_method(NewMethod::new("f", k, &[], BasicType::Int).static_method())
            .unwrap();
        let mut nb = NmethodBuilder::new(&t, &f, 4);
        let pd = PcDesc::new(0, vec![ScopeDesc::new(f.id, 1)]);
        nb.call(t.marker_stub(0).code_begin(), pd, &[]);
        nb.ret();
        let blob = nb.finish();

        let mut th = t.thread();
        let mut m = Machine::new(&mut th);
        let _call = ManagedCall::begin(&mut m, f.id, &[]);
        assert_eq!(m.run(), Halt::Marker(0));
        let before = m.thread.anchor;
        assert!(!before.has_last_java_frame());
        {
            let mut g = AnchorGuard::new(&mut m);
            let sp = g.sp();
            let fr = g.thread.last_frame();
            assert_eq!(fr.compiled_method(), Some(f.id));
            assert!(blob.contains(fr.pc()));
            assert_eq!(fr.sp(), sp + WORD);
            // Nested: the outer guard's anchor stands.
            let g2 = AnchorGuard::new(&mut g);
            assert_eq!(g2.thread.anchor.last_sp, sp + WORD);
        }
        assert_eq!(m.thread.anchor, before);
    }

    #[test]
    fn reguard() {
        let t = TestRuntime::new();
        let mut th = t.thread();
        th.disable_stack_yellow_reserved_zone();
        let yellow = th.shared.stack.guard(GuardKind::Yellow).unwrap().range.start;
        t.rt.mem.write_u64(yellow, 1);
        th.reguard_stack();
        assert_eq!(t.rt.mem.try_read_u64(yellow), None);
        assert_eq!(th.stack_guard_state, StackGuardState::Enabled);
    }
}
