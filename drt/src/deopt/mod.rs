//! Deoptimization: replacing a compiled frame by the interpreter frames it stands for.
//!
//! A compiled frame can be deoptimized in two ways:
//!
//!   * lazily, by [deoptimize]: the frame's return address is redirected to its deopt handler, so
//!     that when its callee returns control enters the deopt blob instead;
//!   * eagerly, by the compiled code itself calling the uncommon trap blob when it reaches a path
//!     it wasn't compiled for.
//!
//! Either way, unrolling happens in two runtime calls made from the blob:
//!
//!   1. [fetch_unroll_info] reads the frame's debug information, reallocates scalar-replaced
//!      objects, relocks eliminated monitors, saves everything in a [vframe_array::VframeArray]
//!      and describes the interpreter frames to build in an [unroll::UnrollBlock].
//!   2. The blob pops the compiled frame and pushes skeletal interpreter frames of the right sizes,
//!      then [unpack_frames] fills them in.

pub mod blob;
pub mod scope;
pub mod unroll;
pub mod vframe_array;

use crate::{
    abi::{BasicType, WORD},
    deferred::Slot,
    frame::{interp, Frame, RegisterMap},
    log::{stats::TimingState, Verbosity},
    masm::sim::Machine,
    sync::BASIC_OBJECT_LOCK_OBJ_OFFSET,
    thread::ThreadContext,
};
use scope::{read_value, MonitorInfo, StackValue};
use std::sync::Arc;
use strum::{Display, EnumCount, EnumIter, FromRepr};
use unroll::UnrollBlock;
use vframe_array::VframeArray;

/// Why compiled code gave up.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum DeoptReason {
    None,
    NullCheck,
    NullAssert,
    RangeCheck,
    ClassCheck,
    ArrayCheck,
    Intrinsic,
    Bimorphic,
    /// A constant pool entry the code needs is unresolved.
    Unloaded,
    Uninitialized,
    Unreached,
    Unhandled,
    /// An assumption the code was compiled under no longer holds.
    Constraint,
    Div0Check,
    Age,
    PredicateFailed,
    LoopLimitCheck,
    SpeculateClassCheck,
    UnstableIf,
    UnstableFusedIf,
    Tenured,
}

/// What to do with the compiled code after an uncommon trap.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum DeoptAction {
    /// Keep the code.
    None,
    MaybeRecompile,
    /// Discard the code and go back to the interpreter.
    Reinterpret,
    MakeNotEntrant,
    MakeNotCompilable,
}

const ACTION_BITS: u32 = 3;
const REASON_BITS: u32 = 5;
const ACTION_SHIFT: u32 = 0;
const REASON_SHIFT: u32 = ACTION_SHIFT + ACTION_BITS;

/// Pack `reason` and `action` into the (negative) trap request compiled code passes to the
/// uncommon trap blob.
pub fn make_trap_request(reason: DeoptReason, action: DeoptAction) -> i32 {
    !(((reason as i32) << REASON_SHIFT) | ((action as i32) << ACTION_SHIFT))
}

/// The trap request for reaching an unresolved constant pool entry: the entry's index itself.
pub fn make_unloaded_trap_request(index: u32) -> i32 {
    i32::try_from(index).unwrap_or_else(|_| panic!("constant pool index {index} out of range"))
}

pub fn trap_request_reason(request: i32) -> DeoptReason {
    if request < 0 {
        let bits = ((!request as u32) >> REASON_SHIFT) & ((1 << REASON_BITS) - 1);
        DeoptReason::from_repr(bits as u8)
            .unwrap_or_else(|| panic!("trap request {request:#x} has no valid reason"))
    } else {
        DeoptReason::Unloaded
    }
}

pub fn trap_request_action(request: i32) -> DeoptAction {
    if request < 0 {
        let bits = ((!request as u32) >> ACTION_SHIFT) & ((1 << ACTION_BITS) - 1);
        DeoptAction::from_repr(bits as u8)
            .unwrap_or_else(|| panic!("trap request {request:#x} has no valid action"))
    } else {
        DeoptAction::Reinterpret
    }
}

/// The constant pool index of an unloaded-entry trap.
pub fn trap_request_index(request: i32) -> Option<u32> {
    u32::try_from(request).ok()
}

/// How the frames being unpacked are to be resumed.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum ExecMode {
    /// Continue after the call the youngest frame was making.
    Deopt = 0,
    /// Rethrow the pending exception in the youngest frame.
    Exception = 1,
    UncommonTrap = 2,
    /// Re-execute the bytecode at the youngest frame's bci.
    Reexecute = 3,
}

/// Mark the compiled frame `fr` of `thread` for deoptimization: when its callee returns, control
/// will enter its deopt handler and the frame will be unpacked. Marking a frame twice is
/// harmless.
///
/// # Panics
///
/// If `fr` isn't a compiled frame with a deopt handler.
pub fn deoptimize(thread: &ThreadContext, fr: &Frame) {
    let rt = &thread.rt;
    if fr.is_deoptimized() {
        return;
    }
    let b = fr
        .blob()
        .unwrap_or_else(|| panic!("can't deoptimize {fr}: not in the code cache"));
    let (Some(nm), Some(handler)) = (b.nmethod(), b.deopt_handler_begin()) else {
        panic!("can't deoptimize {fr}: no deopt handler")
    };
    let orig_pc_offset = nm
        .orig_pc_offset
        .unwrap_or_else(|| panic!("can't deoptimize {fr}: no slot for the original pc"));
    rt.mem
        .write_u64(fr.unextended_sp() + u64::from(orig_pc_offset), fr.pc());
    let mut fr = fr.clone();
    fr.patch_pc(rt, handler);
    rt.stats.frame_deoptimized(DeoptReason::Constraint);
    if rt.log.enabled(Verbosity::Deopt) {
        rt.log.log(
            Verbosity::Deopt,
            &format!("thread {}: marked {fr} for deoptimization", thread.id()),
        );
    }
}

/// Set value `index` (numbered as in [crate::deferred]) of activation `vframe_id` of `fr`, as a
/// debugger does. An interpreted frame is written in place. A compiled frame may not hold the
/// value anywhere it can be written, so the write is deferred and the frame marked for
/// deoptimization: it never runs compiled code again, and its entry is reclaimed when it is
/// unpacked.
pub fn update_local(
    thread: &mut ThreadContext,
    fr: &Frame,
    vframe_id: usize,
    index: u32,
    ty: BasicType,
    value: u64,
) {
    let rt = Arc::clone(&thread.rt);
    let mem = &rt.mem;
    if fr.is_interpreted() {
        assert_eq!(vframe_id, 0, "{fr} has only one activation");
        let method = rt.method(fr.interpreter_frame_method(mem));
        let addr = match Slot::of(index, method.max_locals, method.max_stack) {
            Slot::Local(i) => fr.interpreter_frame_locals(mem) - i as u64 * WORD,
            Slot::Expression(j) => fr.interpreter_frame_expression(mem, j as u32),
            Slot::MonitorOwner(k) => {
                fr.interpreter_frame_monitor(k as u32) + BASIC_OBJECT_LOCK_OBJ_OFFSET as u64
            }
        };
        mem.write_u64(addr, value);
        return;
    }
    thread
        .deferred
        .set(fr.unextended_sp(), vframe_id, index, ty, value);
    deoptimize(thread, fr);
}

/// Called from the deopt blob (with the anchor naming the blob's frame) once the registers are
/// saved. Returns the address of the unroll block.
pub(crate) fn fetch_unroll_info(m: &mut Machine<'_>, mode: ExecMode) -> u64 {
    let rt = Arc::clone(m.rt());
    rt.stats.timing_state(TimingState::FetchingUnrollInfo);
    let thread = &mut *m.thread;
    let stub = thread.last_frame();
    let mut map = RegisterMap::new(true);
    let deoptee = stub
        .sender(&rt, &mut map)
        .unwrap_or_else(|| panic!("{stub} has no sender to deoptimize"));
    assert!(
        deoptee.is_compiled(),
        "{deoptee} can't be deoptimized: it isn't compiled"
    );
    // The sender walk mustn't disturb the locations the deoptee's values are read through.
    let sender = deoptee
        .sender(&rt, &mut map.clone())
        .unwrap_or_else(|| panic!("{deoptee} has no sender"));

    let mut array = VframeArray::allocate(&rt, thread, &deoptee, &map, &sender, mode);
    let ub = array.unroll_block(&rt, &deoptee, &sender, mode);
    array.unroll_block = ub.write(&rt.mem);
    if rt.log.enabled(Verbosity::Deopt) {
        rt.log.log(
            Verbosity::Deopt,
            &format!(
                "thread {}: unrolling {deoptee} ({mode}) into {} interpreter frames ({} bytes)",
                thread.id(),
                ub.number_of_frames(),
                ub.total_frame_sizes()
            ),
        );
    }
    let addr = array.unroll_block;
    assert!(
        thread.vframe_array_head.is_none(),
        "thread {} is already deoptimizing a frame",
        thread.id()
    );
    thread.vframe_array_head = Some(array);
    rt.stats.timing_state(TimingState::None);
    addr
}

/// Called from the deopt or uncommon trap blob once the skeletal frames are pushed, with the
/// anchor's frame pointer naming the blob's last frame. Fills in the frames and returns the result
/// type of the youngest frame, which decides which result register the interpreter resumes with.
pub(crate) fn unpack_frames(m: &mut Machine<'_>, mode: ExecMode) -> BasicType {
    let rt = Arc::clone(m.rt());
    rt.stats.timing_state(TimingState::UnpackingFrames);
    let thread = &mut *m.thread;
    let array = thread
        .vframe_array_head
        .take()
        .unwrap_or_else(|| panic!("thread {} unpacks frames it never fetched", thread.id()));
    let ub = UnrollBlock::read(&rt.mem, array.unroll_block);
    debug_assert_eq!(ub.unpack_kind, mode);
    let youngest_sp = thread.anchor.last_fp + 2 * WORD;
    array.unpack_to_stack(&rt, youngest_sp, &ub);
    rt.mem.free(array.unroll_block);
    rt.stats.frames_unpacked(array.elements.len());
    if rt.log.enabled(Verbosity::Deopt) {
        rt.log.log(
            Verbosity::Deopt,
            &format!(
                "thread {}: unpacked {} frames at sp={youngest_sp:#x}",
                thread.id(),
                array.elements.len()
            ),
        );
    }
    rt.stats.timing_state(TimingState::None);
    array.result_type
}

/// Called from the uncommon trap blob: act on `request` and fetch the unroll information for the
/// trapping frame.
pub(crate) fn uncommon_trap(m: &mut Machine<'_>, request: i32, mode: ExecMode) -> u64 {
    let rt = Arc::clone(m.rt());
    let reason = trap_request_reason(request);
    let action = trap_request_action(request);
    let trapping = {
        let stub = m.thread.last_frame();
        stub.sender(&rt, &mut RegisterMap::new(false))
            .unwrap_or_else(|| panic!("{stub} has no sender"))
    };
    rt.stats.frame_deoptimized(reason);
    if rt.log.enabled(Verbosity::Deopt) {
        let index = trap_request_index(request)
            .map(|i| format!(" index={i}"))
            .unwrap_or_default();
        rt.log.log(
            Verbosity::Deopt,
            &format!(
                "thread {}: uncommon trap in {trapping}: reason={reason} action={action}{index}",
                m.thread.id()
            ),
        );
    }
    if matches!(
        action,
        DeoptAction::Reinterpret | DeoptAction::MakeNotEntrant | DeoptAction::MakeNotCompilable
    ) {
        if let Some(b) = trapping.blob() {
            rt.make_not_entrant(b);
        }
    }
    fetch_unroll_info(m, mode)
}

/// The state of one method activation, as a debugger sees it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VframeState {
    pub method: crate::method::MethodId,
    pub bci: i32,
    pub locals: Vec<StackValue>,
    pub expressions: Vec<StackValue>,
    pub monitors: Vec<MonitorInfo>,
}

/// The activations of `fr`, innermost first, with `thread`'s pending deferred writes applied.
/// `map` must hold the locations of the registers `fr` saved, as left by walking to `fr`.
///
/// Objects whose allocation was eliminated read as null: they only exist once the frame is
/// deoptimized.
pub fn frame_state(thread: &ThreadContext, fr: &Frame, map: &RegisterMap) -> Vec<VframeState> {
    let rt = &thread.rt;
    let mem = &rt.mem;
    if fr.is_interpreted() {
        let method = rt.method(fr.interpreter_frame_method(mem));
        let locals = (0..method.max_locals)
            .map(|i| StackValue::Int(fr.interpreter_frame_local(mem, i)))
            .collect();
        let top = match fr.interpreter_frame_last_sp(mem) {
            0 => fr.unextended_sp(),
            x => x,
        };
        let exprs_bottom = fr.interpreter_frame_expression(mem, 0) + WORD;
        let n = (exprs_bottom.saturating_sub(top) / WORD) as u32;
        let expressions = (0..n)
            .map(|j| StackValue::Int(mem.read_u64(fr.interpreter_frame_expression(mem, j))))
            .collect();
        let monitors = (0..fr.interpreter_frame_monitor_count(mem))
            .map(|k| {
                let lock = fr.interpreter_frame_monitor(k);
                MonitorInfo {
                    owner: mem.read_u64(lock + BASIC_OBJECT_LOCK_OBJ_OFFSET as u64),
                    lock,
                    eliminated: false,
                    owner_is_scalar_replaced: false,
                }
            })
            .collect();
        return vec![VframeState {
            method: method.id,
            bci: fr.interpreter_frame_bci(mem) as i32,
            locals,
            expressions,
            monitors,
        }];
    }

    let b = fr
        .blob()
        .unwrap_or_else(|| panic!("{fr} is neither interpreted nor compiled"));
    let nm = b
        .nmethod()
        .unwrap_or_else(|| panic!("{fr} is neither interpreted nor compiled"));
    let pd = nm
        .pc_desc_at(b.offset_of(fr.pc()))
        .unwrap_or_else(|| panic!("no debug information at {fr}"));
    let objects = vec![0; pd.objects.len()];
    pd.scopes
        .iter()
        .enumerate()
        .map(|(vi, sd)| {
            let method = rt.method(sd.method);
            let mut locals = (0..method.max_locals as usize)
                .map(|i| match sd.locals.get(i) {
                    Some(v) => read_value(mem, fr, map, v, &objects),
                    None => StackValue::Conflict,
                })
                .collect::<Vec<_>>();
            let mut expressions = sd
                .expressions
                .iter()
                .map(|v| read_value(mem, fr, map, v, &objects))
                .collect::<Vec<_>>();
            let mut monitors = sd
                .monitors
                .iter()
                .map(|mv| MonitorInfo {
                    owner: read_value(mem, fr, map, &mv.owner, &objects).bits(),
                    lock: scope::location_addr(fr, map, mv.basic_lock),
                    eliminated: mv.eliminated,
                    owner_is_scalar_replaced: matches!(mv.owner, scope::ScopeValue::Object(_)),
                })
                .collect::<Vec<_>>();
            let mut owners = monitors.iter().map(|x| x.owner).collect::<Vec<_>>();
            thread.deferred.reconcile(
                fr.unextended_sp(),
                vi,
                method.max_locals,
                method.max_stack,
                &mut locals,
                &mut expressions,
                &mut owners,
            );
            for (mi, o) in monitors.iter_mut().zip(owners) {
                mi.owner = o;
            }
            VframeState {
                method: sd.method,
                bci: sd.bci,
                locals,
                expressions,
                monitors,
            }
        })
        .collect()
}

/// The number of words [interp::on_stack_size] gives the youngest of the interpreter frames a
/// compiled frame with the activations in `states` unpacks into, and the total for all of them.
pub fn unpacked_frame_words(rt: &crate::Runtime, states: &[VframeState]) -> (u32, u32) {
    let mut total = 0;
    let mut youngest = 0;
    for (i, s) in states.iter().enumerate() {
        let m = rt.method(s.method);
        let (cp, cl) = match i.checked_sub(1).map(|j| rt.method(states[j].method)) {
            Some(callee) => (callee.size_of_parameters(), callee.max_locals),
            None => (0, 0),
        };
        let w = interp::on_stack_size(
            m.max_stack,
            s.expressions.len() as u32,
            s.monitors.len() as u32,
            cp,
            cl,
            i == 0,
        );
        if i == 0 {
            youngest = w;
        }
        total += w;
    }
    (youngest, total)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        abi::x64::{RBP, RAX},
        frame::{FrameKind, StackFrameStream},
        heap,
        masm::Halt,
        method::{Method, MethodField, NewMethod},
        stubs::{CallOutcome, ManagedCall},
        testing::{
            interpreter_frame_return, interpreter_unwind, resume_after_halt, NmethodBuilder,
            TestRuntime,
        },
    };
    use scope::{MonitorValue, ObjectValue, PcDesc, ScopeDesc, ScopeValue};
    use BasicType::*;

    #[test]
    fn trap_requests() {
        let r = make_trap_request(DeoptReason::NullCheck, DeoptAction::MakeNotEntrant);
        assert!(r < 0);
        assert_eq!(trap_request_reason(r), DeoptReason::NullCheck);
        assert_eq!(trap_request_action(r), DeoptAction::MakeNotEntrant);
        assert_eq!(trap_request_index(r), None);
        let r = make_trap_request(DeoptReason::Tenured, DeoptAction::None);
        assert_eq!(trap_request_reason(r), DeoptReason::Tenured);
        assert_eq!(trap_request_action(r), DeoptAction::None);

        let u = make_unloaded_trap_request(17);
        assert_eq!(trap_request_reason(u), DeoptReason::Unloaded);
        assert_eq!(trap_request_action(u), DeoptAction::Reinterpret);
        assert_eq!(trap_request_index(u), Some(17));
    }

    #[test]
    fn reasons_fit_in_a_request() {
        assert!(DeoptReason::COUNT <= 1 << REASON_BITS);
        assert_eq!(DeoptReason::UnstableIf.to_string(), "unstable_if");
        assert_eq!(ExecMode::from_repr(2), Some(ExecMode::UncommonTrap));
        assert_eq!(ExecMode::from_repr(4), None);
    }

    /// `outer(x)` calls `middle(x)`, which calls `inner()`, all inlined into one compiled frame
    /// that calls out to `callee` at the only pc with debug information. Each activation holds an
    /// eliminated lock on its own object, `obj` is also `outer`'s second local, and `inner` has a
    /// scalar-replaced object in its only local.
    struct Inlined {
        t: TestRuntime,
        outer: Arc<Method>,
        middle: Arc<Method>,
        inner: Arc<Method>,
        point: crate::heap::ClassId,
        obj: u64,
        /// The objects locked by `outer`, `middle` and `inner`.
        locked: [u64; 3],
    }

    impl Inlined {
        fn new(callee: impl FnOnce(&TestRuntime) -> u64) -> Self {
            let t = TestRuntime::new();
            let abi = t.rt.abi();
            let k = t.rt.define_class("K", 0);
            let point = t.rt.define_class("Point", 2);
            let outer = t
                .rt
                .add_method(
                    NewMethod::new("outer", k, &[Int], Int)
                        .static_method()
                        .locals(2, 2),
                )
                .unwrap();
            let middle = t
                .rt
                .add_method(
                    NewMethod::new("middle", k, &[Int], Int)
                        .static_method()
                        .locals(4, 1),
                )
                .unwrap();
            let inner = t
                .rt
                .add_method(NewMethod::new("inner", k, &[], Int).static_method().locals(1, 1))
                .unwrap();
            let obj = t.rt.heap.alloc_object(&t.rt.mem, k);
            let locked = [
                t.rt.heap.alloc_object(&t.rt.mem, k),
                obj,
                t.rt.heap.alloc_object(&t.rt.mem, k),
            ];
            let target = callee(&t);

            // Spill slots: 0 x, 1 obj, 3-5 middle's other locals, then an owner and a lock box
            // for each of outer (6, 7), middle (1, 2) and inner (8, 9).
            let mut nb = NmethodBuilder::new(&t, &outer, 14);
            let x = nb.slot(0).stack_offset() as i64;
            nb.m.store(crate::masm::at(abi.sp, x), abi.java_int_args[0]);
            nb.spill_imm(1, obj);
            nb.spill_imm(3, 9);
            nb.spill_imm(4, 10);
            nb.spill_imm(5, 11);
            nb.spill_imm(6, locked[0]);
            nb.spill_imm(8, locked[2]);
            let int = |i| ScopeValue::location(nb.slot(i), Int);
            let monitor = |owner, lock| MonitorValue {
                owner: ScopeValue::location(nb.slot(owner), Object),
                basic_lock: nb.slot(lock),
                eliminated: true,
            };
            let mut si = ScopeDesc::new(inner.id, 4);
            si.locals = vec![ScopeValue::Object(0)];
            si.monitors = vec![monitor(8, 9)];
            let mut sm = ScopeDesc::new(middle.id, 7);
            sm.locals = vec![int(0), int(3), int(4), int(5)];
            sm.monitors = vec![monitor(1, 2)];
            let mut so = ScopeDesc::new(outer.id, 3);
            so.locals = vec![int(0), ScopeValue::location(nb.slot(1), Object)];
            so.expressions = vec![int(0)];
            so.monitors = vec![monitor(6, 7)];
            let mut pd = PcDesc::new(0, vec![si, sm, so]);
            pd.objects = vec![ObjectValue {
                class: point,
                fields: vec![ScopeValue::int(3), int(0)],
            }];
            pd.return_type = Some(Int);
            let oops = [nb.slot(1), nb.slot(6), nb.slot(8)];
            nb.call(target, pd, &oops);
            nb.ret();
            nb.finish();
            Self {
                t,
                outer,
                middle,
                inner,
                point,
                obj,
                locked,
            }
        }

        /// The compiled frame, seen from the frameless callee `m` is stopped in.
        fn compiled_frame(&self, m: &Machine<'_>) -> Frame {
            let ra = self.t.rt.mem.read_u64(m.sp());
            Frame::new(&self.t.rt, m.sp() + 8, m.reg(RBP), ra)
        }

        /// The frame `m` is stopped in, and its senders.
        fn interpreter_frames(&self, m: &Machine<'_>) -> Vec<Frame> {
            let youngest = Frame::new(&self.t.rt, m.sp(), m.reg(RBP), m.cpu.pc);
            StackFrameStream::new(&self.t.rt, youngest, false).collect()
        }

        /// Play the interpreter for the three frames the compiled frame unpacked into: each
        /// unlocks its monitor and returns `i + 1` into the next one out.
        fn finish_in_interpreter(&self, m: &mut Machine<'_>) -> Halt {
            let mem = &self.t.rt.mem;
            let tid = m.thread.id();
            let states = self.interpreter_frames(m)[..3]
                .iter()
                .map(|fr| state(m.thread, fr))
                .collect::<Vec<_>>();
            for (i, s) in states.iter().enumerate() {
                self.t
                    .rt
                    .sync
                    .exit(mem, s.monitors[0].owner, s.monitors[0].lock, tid);
                interpreter_frame_return(m, i as u64 + 1);
                if i < 2 {
                    assert_eq!(m.run(), Halt::ContinueAfter);
                }
            }
            m.run()
        }
    }

    fn state(thread: &ThreadContext, fr: &Frame) -> VframeState {
        let mut s = frame_state(thread, fr, &RegisterMap::new(false));
        assert_eq!(s.len(), 1);
        s.remove(0)
    }

    #[test]
    fn compiled_frame_state() {
        let f = Inlined::new(|t| t.marker_stub(0).code_begin());
        let mut thread = f.t.thread();
        let mut m = Machine::new(&mut thread);
        let _c = ManagedCall::begin(&mut m, f.outer.id, &[5]);
        assert_eq!(m.run(), Halt::Marker(0));
        let fr = f.compiled_frame(&m);
        assert!(fr.is_compiled());
        let states = frame_state(m.thread, &fr, &RegisterMap::new(false));
        let methods = states.iter().map(|s| s.method).collect::<Vec<_>>();
        assert_eq!(methods, vec![f.inner.id, f.middle.id, f.outer.id]);
        // The scalar-replaced object doesn't exist yet.
        assert_eq!(states[0].locals, vec![StackValue::Obj(0)]);
        assert_eq!(
            states[1].locals,
            [5, 9, 10, 11].map(StackValue::Int).to_vec()
        );
        assert_eq!(
            states[2].locals,
            vec![StackValue::Int(5), StackValue::Obj(f.obj)]
        );
        assert_eq!(states[2].expressions, vec![StackValue::Int(5)]);
        for (s, &o) in states.iter().zip(f.locked.iter().rev()) {
            assert_eq!(s.monitors.len(), 1);
            assert_eq!(s.monitors[0].owner, o);
            assert!(s.monitors[0].eliminated);
        }
        // Eliminated locks aren't held until the frame is deoptimized.
        assert_eq!(f.t.rt.sync.owner(&f.t.rt.mem, f.obj), None);

        // A debugger's write shows through at once, without touching the frame's values.
        update_local(m.thread, &fr, 1, 1, Int, 42);
        assert!(f.compiled_frame(&m).is_deoptimized());
        let states = frame_state(m.thread, &fr, &RegisterMap::new(false));
        assert_eq!(
            states[1].locals,
            [5, 42, 10, 11].map(StackValue::Int).to_vec()
        );
        assert_eq!(
            f.t.rt.mem.read_u32(fr.unextended_sp() + 3 * 8),
            9,
            "the compiled frame itself is unchanged"
        );
        let (youngest, total) = unpacked_frame_words(&f.t.rt, &states);
        assert_eq!(
            youngest,
            interp::FIXED_FRAME_WORDS + interp::MONITOR_WORDS + 1
        );
        assert!(total > 3 * (interp::FIXED_FRAME_WORDS + interp::MONITOR_WORDS));
    }

    #[test]
    fn deoptimize_at_a_call() {
        let f = Inlined::new(|t| t.marker_stub(0).code_begin());
        let mut thread = f.t.thread();
        let live = f.t.rt.mem.c_heap_live();
        let tid = thread.id();
        let mut m = Machine::new(&mut thread);
        let c = ManagedCall::begin(&mut m, f.outer.id, &[5]);
        assert_eq!(m.run(), Halt::Marker(0));

        let fr = f.compiled_frame(&m);
        let orig_pc = fr.pc();
        update_local(m.thread, &fr, 1, 1, Int, 99);
        let marked = f.compiled_frame(&m);
        assert!(marked.is_deoptimized());
        assert_eq!(marked.pc(), orig_pc);
        assert_ne!(marked.raw_pc(), orig_pc);
        deoptimize(m.thread, &marked);

        // The callee returns 77 into what is now the interpreter.
        m.set_reg(RAX, 77);
        assert_eq!(resume_after_halt(&mut m), Halt::ContinueAfter);
        assert_eq!(m.reg(RAX), 77);
        assert!(m.thread.deferred.is_empty());

        let frames = f.interpreter_frames(&m);
        let kinds = frames.iter().map(|fr| fr.kind()).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                FrameKind::Interpreted,
                FrameKind::Interpreted,
                FrameKind::Interpreted,
                FrameKind::Entry
            ]
        );
        assert!(frames.iter().all(|fr| fr.safe_for_sender(m.thread)));

        let mem = &f.t.rt.mem;
        let states = frames[..3]
            .iter()
            .map(|fr| state(m.thread, fr))
            .collect::<Vec<_>>();
        let inner = &states[0];
        assert_eq!((inner.method, inner.bci), (f.inner.id, 4));
        let StackValue::Int(p) = inner.locals[0] else {
            panic!("{:?}", inner.locals)
        };
        assert_eq!(f.t.rt.heap.class_of(mem, p), Some(f.point));
        assert_eq!(mem.read_u64(heap::field_addr(p, 0)), 3);
        assert_eq!(mem.read_u64(heap::field_addr(p, 1)), 5);

        let middle = &states[1];
        assert_eq!((middle.method, middle.bci), (f.middle.id, 7));
        assert_eq!(middle.locals, [5, 99, 10, 11].map(StackValue::Int).to_vec());

        let outer = &states[2];
        assert_eq!((outer.method, outer.bci), (f.outer.id, 3));
        assert_eq!(
            outer.locals,
            vec![StackValue::Int(5), StackValue::Int(f.obj)]
        );
        assert_eq!(outer.expressions, vec![StackValue::Int(5)]);

        // Every eliminated lock is real now, and held in its own interpreter frame.
        for (s, &o) in states.iter().zip(f.locked.iter().rev()) {
            assert_eq!(s.monitors.len(), 1);
            assert_eq!(s.monitors[0].owner, o);
            assert_eq!(f.t.rt.sync.owner(mem, o), Some(tid));
        }

        // Interpreted frames are written in place.
        update_local(m.thread, &frames[1], 0, 2, Int, 1234);
        assert_eq!(
            state(m.thread, &frames[1]).locals,
            [5, 99, 1234, 11].map(StackValue::Int).to_vec()
        );

        let h = f.finish_in_interpreter(&mut m);
        assert_eq!(c.finish(&mut m, h), CallOutcome::Returned(3));
        for o in f.locked {
            assert_eq!(f.t.rt.sync.owner(mem, o), None);
        }
        assert_eq!(mem.c_heap_live(), live);
    }

    /// Play the interpreter entering `driver`, stopped at its entry in `m`, and have it call
    /// `callee` with `args` from bci 2. Returns the top of its expression stack at the call.
    fn interpreted_call(
        t: &TestRuntime,
        m: &mut Machine<'_>,
        driver: &Method,
        callee: &Method,
        args: &[u64],
    ) -> u64 {
        let abi = m.abi();
        let mem = &t.rt.mem;
        let ra = m.pop();
        let sender_sp = m.reg(abi.sender_sp_reg);
        let locals = sender_sp + u64::from(driver.size_of_parameters() - 1) * WORD;
        let extra = interp::last_frame_adjust(driver.size_of_parameters(), driver.max_locals);
        m.set_reg(abi.sp, m.sp() - u64::from(extra) * WORD);
        m.push(ra);
        let link = m.reg(abi.fp);
        m.push(link);
        let fp = m.sp();
        m.set_reg(abi.fp, fp);
        let mut fixed = interp::FixedSlots::new(driver, locals, 2, 0);
        fixed.sender_sp = sender_sp;
        // First argument highest.
        let mut top = interp::monitor_block_bottom(fp);
        for &a in args {
            top -= WORD;
            mem.write_u64(top, a);
        }
        fixed.last_sp = top;
        fixed.write(mem, fp);
        m.set_reg(abi.sp, top);
        m.set_reg(abi.sender_sp_reg, top);
        m.set_reg(abi.method_reg, callee.id.to_word());
        m.push(t.rt.stubs().interpreter_return());
        m.cpu.pc = callee.field(MethodField::FromInterpretedEntry);
        top
    }

    #[test]
    fn deoptimize_below_an_interpreted_caller() {
        let f = Inlined::new(|t| t.marker_stub(0).code_begin());
        let d = f.t.rt.define_class("D", 0);
        let driver = f
            .t
            .rt
            .add_method(
                NewMethod::new("driver", d, &[Int], Int)
                    .static_method()
                    .locals(3, 2),
            )
            .unwrap();
        let mut thread = f.t.thread();
        let mut m = Machine::new(&mut thread);
        let c = ManagedCall::begin(&mut m, driver.id, &[6]);
        assert_eq!(m.run(), Halt::InterpreterEntry);
        let last_sp = interpreted_call(&f.t, &mut m, &driver, &f.outer, &[5]);
        assert_eq!(m.run(), Halt::Marker(0));

        let fr = f.compiled_frame(&m);
        let sender = fr.sender(&f.t.rt, &mut RegisterMap::new(false)).unwrap();
        assert_eq!(sender.kind(), FrameKind::Interpreted);
        assert_eq!(sender.interpreter_frame_last_sp(&f.t.rt.mem), last_sp);
        let states = frame_state(m.thread, &fr, &RegisterMap::new(false));
        let (youngest, total) = unpacked_frame_words(&f.t.rt, &states);
        // `outer`'s parameter is already on the caller's expression stack; only its second
        // local needs room.
        let adjust = interp::last_frame_adjust(f.outer.size_of_parameters(), f.outer.max_locals);
        assert_eq!(adjust, 1);

        deoptimize(m.thread, &fr);
        m.set_reg(RAX, 77);
        assert_eq!(resume_after_halt(&mut m), Halt::ContinueAfter);

        let frames = f.interpreter_frames(&m);
        let kinds = frames.iter().map(|fr| fr.kind()).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                FrameKind::Interpreted,
                FrameKind::Interpreted,
                FrameKind::Interpreted,
                FrameKind::Interpreted,
                FrameKind::Entry
            ]
        );
        assert!(frames.iter().all(|fr| fr.safe_for_sender(m.thread)));

        // The new frames take up exactly the caller adjustment plus their own sizes, below the
        // caller's sp, with the oldest right under the adjustment.
        let w = |n: u32| u64::from(n) * WORD;
        assert_eq!(frames[2].fp() + 2 * WORD, sender.sp() - w(adjust));
        let youngest_bottom = frames[0].fp() + 2 * WORD - w(youngest);
        assert_eq!(sender.sp() - youngest_bottom, w(adjust + total));

        // The oldest new frame's parameter is the caller's outgoing argument, and the caller
        // itself is untouched.
        let mem = &f.t.rt.mem;
        assert_eq!(frames[2].interpreter_frame_locals(mem), last_sp);
        assert_eq!(frames[2].interpreter_frame_sender_sp(mem), sender.sp());
        let outer = state(m.thread, &frames[2]);
        assert_eq!(outer.locals, vec![StackValue::Int(5), StackValue::Int(f.obj)]);
        let caller = state(m.thread, &frames[3]);
        assert_eq!((caller.method, caller.bci), (driver.id, 2));
        assert_eq!(caller.locals[0], StackValue::Int(6));
        assert_eq!(caller.expressions, vec![StackValue::Int(5)]);
        assert_eq!(frames[3].interpreter_frame_last_sp(mem), last_sp);

        // `outer` returns 3 into the interpreted caller, which returns it plus one to the host.
        assert_eq!(f.finish_in_interpreter(&mut m), Halt::InterpreterReturn);
        assert_eq!(m.reg(RAX), 3);
        interpreter_frame_return(&mut m, 4);
        let h = m.run();
        assert_eq!(c.finish(&mut m, h), CallOutcome::Returned(4));
    }

    #[test]
    fn deferred_write_dies_with_its_frame() {
        let f = Inlined::new(|t| t.marker_stub(0).code_begin());
        let mut thread = f.t.thread();
        let mut m = Machine::new(&mut thread);
        let c = ManagedCall::begin(&mut m, f.outer.id, &[5]);
        assert_eq!(m.run(), Halt::Marker(0));
        let fr = f.compiled_frame(&m);
        update_local(m.thread, &fr, 1, 1, Int, 42);

        // The callee returns: the frame can't resume compiled code with the write pending, so it
        // is unpacked, which applies the write and drops it.
        assert_eq!(resume_after_halt(&mut m), Halt::ContinueAfter);
        assert!(m.thread.deferred.is_empty());
        assert_eq!(
            state(m.thread, &f.interpreter_frames(&m)[1]).locals,
            [5, 42, 10, 11].map(StackValue::Int).to_vec()
        );
        let h = f.finish_in_interpreter(&mut m);
        assert_eq!(c.finish(&mut m, h), CallOutcome::Returned(3));

        // A new activation in the same place sees only its own values.
        let c = ManagedCall::begin(&mut m, f.outer.id, &[5]);
        assert_eq!(m.run(), Halt::Marker(0));
        let again = f.compiled_frame(&m);
        assert_eq!(again.unextended_sp(), fr.unextended_sp());
        assert!(!again.is_deoptimized());
        let states = frame_state(m.thread, &again, &RegisterMap::new(false));
        assert_eq!(
            states[1].locals,
            [5, 9, 10, 11].map(StackValue::Int).to_vec()
        );
        // And returns normally, leaving nothing behind.
        m.set_reg(RAX, 17);
        let h = resume_after_halt(&mut m);
        assert_eq!(c.finish(&mut m, h), CallOutcome::Returned(17));
        assert!(m.thread.deferred.is_empty());
    }

    #[test]
    fn deopt_with_exception() {
        let f = Inlined::new(|t| t.marker_stub(1).code_begin());
        let exc = f.t.rt.heap.alloc_object(&f.t.rt.mem, f.point);
        let mut thread = f.t.thread();
        let tid = thread.id();
        let mut m = Machine::new(&mut thread);
        let c = ManagedCall::begin(&mut m, f.outer.id, &[5]);
        assert_eq!(m.run(), Halt::Marker(1));

        // The callee throws: the exception's pc is the call's return address.
        let ra = m.pop();
        m.thread.exception_oop = exc;
        m.thread.exception_pc = ra;
        let e = f.t.deopt_entries();
        let entry = f.t.rt.stubs().deopt_blob().addr(e.with_exception_in_tls);
        assert_eq!(m.run_from(entry), Halt::RethrowException);
        assert_eq!(m.reg(RAX), exc);
        assert_eq!(m.thread.exception_oop, 0);

        let frames = f.interpreter_frames(&m);
        let inner = state(m.thread, &frames[0]);
        assert_eq!((inner.method, inner.bci), (f.inner.id, 4));
        for fr in &frames[..3] {
            let s = state(m.thread, fr);
            f.t.rt
                .sync
                .exit(&f.t.rt.mem, s.monitors[0].owner, s.monitors[0].lock, tid);
        }

        // No handler anywhere: the exception unwinds to the host.
        m.thread.pending_exception = exc;
        interpreter_unwind(&mut m);
        let h = m.run();
        assert_eq!(c.finish(&mut m, h), CallOutcome::Threw(exc));
    }

    fn trapping_method(t: &TestRuntime, request: i32) -> Arc<Method> {
        let abi = t.rt.abi();
        let k = t.rt.define_class("T", 0);
        let method = t
            .rt
            .add_method(
                NewMethod::new("trapping", k, &[Int], Int)
                    .static_method()
                    .locals(2, 1),
            )
            .unwrap();
        let mut nb = NmethodBuilder::new(t, &method, 4);
        let x = nb.slot(0).stack_offset() as i64;
        nb.m.store(crate::masm::at(abi.sp, x), abi.java_int_args[0]);
        nb.m.mov_imm(abi.java_int_args[0], i64::from(request) as u64);
        let mut sd = ScopeDesc::new(method.id, 2);
        sd.reexecute = true;
        sd.locals = vec![
            ScopeValue::location(nb.slot(0), Int),
            ScopeValue::int(0x2a),
        ];
        let target = t.rt.stubs().uncommon_trap_blob().code_begin();
        nb.call(target, PcDesc::new(0, vec![sd]), &[]);
        nb.ret();
        nb.finish();
        method
    }

    #[test]
    fn uncommon_trap_reexecutes() {
        let t = TestRuntime::new();
        let request = make_trap_request(DeoptReason::UnstableIf, DeoptAction::Reinterpret);
        let method = trapping_method(&t, request);
        assert!(method.code().is_some());
        let mut thread = t.thread();
        let mut m = Machine::new(&mut thread);
        let c = ManagedCall::begin(&mut m, method.id, &[6]);
        assert_eq!(m.run(), Halt::Reexecute);
        // Reinterpret: the compiled code is no longer used.
        assert!(method.code().is_none());

        let youngest = Frame::new(&t.rt, m.sp(), m.reg(RBP), m.cpu.pc);
        let s = state(m.thread, &youngest);
        assert_eq!((s.method, s.bci), (method.id, 2));
        assert_eq!(s.locals, vec![StackValue::Int(6), StackValue::Int(0x2a)]);

        interpreter_frame_return(&mut m, 12);
        let h = m.run();
        assert_eq!(c.finish(&mut m, h), CallOutcome::Returned(12));
    }

    #[test]
    fn uncommon_trap_without_action_keeps_the_code() {
        let t = TestRuntime::new();
        let request = make_trap_request(DeoptReason::Unreached, DeoptAction::None);
        let method = trapping_method(&t, request);
        let mut thread = t.thread();
        let mut m = Machine::new(&mut thread);
        let c = ManagedCall::begin(&mut m, method.id, &[6]);
        assert_eq!(m.run(), Halt::Reexecute);
        assert!(method.code().is_some());
        interpreter_frame_return(&mut m, 0);
        let h = m.run();
        assert_eq!(c.finish(&mut m, h), CallOutcome::Returned(0));
    }
}
