//! Native wrappers.
//!
//! A native method's code is a wrapper generated from its signature. The wrapper is entered like
//! any compiled method and:
//!
//!   1. builds a frame, moving the managed arguments to where the native function expects them.
//!      References are passed as handles: the address of a frame slot holding the reference, or
//!      null for a null reference. Normal natives also get the thread's environment and, if
//!      static, a handle to the class mirror.
//!   2. records the frame as the thread's last managed frame and, for synchronized methods, locks
//!      the receiver (or mirror).
//!   3. calls the native function in state `InNative`, then comes back through `InNativeTrans`,
//!      blocking if a safepoint or suspension is pending.
//!   4. re-enables the stack's yellow zone if it was disabled, unlocks, unboxes a reference
//!      result and forwards any exception the native function left pending.
//!
//! Critical natives skip the environment and handles: each array argument is passed as its
//! length and the address of its first element, and they may not throw.
//!
//! The frame, from the stack pointer up:
//!
//! ```text
//!   outgoing native stack arguments
//!   handles                one word per reference argument, then the mirror
//!   lock box               synchronized methods only
//!   argument save area     the native argument registers, around slow paths before the call
//!   result save area       the integer result, then the float result
//!   exception save slot
//!   saved frame pointer
//!   return address
//! ```

use crate::{
    abi::{align_up, Abi, BasicType, FReg, Reg, WORD},
    callconv::{ArgumentLayout, Convention},
    codecache::{BlobKind, NewBlob, NmethodInfo},
    heap::{ARRAY_BASE_OFFSET, ARRAY_LENGTH_OFFSET},
    masm::{at, Addr, Cond, Inst, Label, MacroAssembler, Width},
    method::Method,
    moveorder::{self, Move, Scratch},
    runtime::{Runtime, RuntimeEntry},
    sync::{BASIC_OBJECT_LOCK_OBJ_OFFSET, BASIC_OBJECT_LOCK_SIZE, UNLOCKED_VALUE},
    thread::{StackGuardState, ThreadField, ThreadState},
    CodeGenError,
};
use drtmap::{Location, OopMap, OopMapSet};

/// The signature, in slot form, of the native function implementing `method`.
///
/// # Panics
///
/// If `method` is a critical native taking a reference that isn't an array.
pub fn native_signature(method: &Method) -> Vec<BasicType> {
    let sig = method.sig_bt();
    if method.is_critical_native {
        let mut out = Vec::with_capacity(sig.len() * 2);
        for t in sig {
            match t {
                BasicType::Array => out.extend([BasicType::Int, BasicType::Address]),
                BasicType::Object => {
                    panic!("critical native {} takes an object", method.name)
                }
                t => out.push(t),
            }
        }
        out
    } else {
        let mut out = Vec::with_capacity(sig.len() + 2);
        out.push(BasicType::Address);
        if method.is_static {
            out.push(BasicType::Object);
        }
        out.extend(sig);
        out
    }
}

/// The byte offsets from the stack pointer of the wrapper frame's areas.
#[derive(Debug)]
struct FrameLayout {
    handles: u32,
    lock_box: Option<u32>,
    arg_save: u32,
    result: u32,
    exception: u32,
    /// Bytes between the stack pointer and the saved frame pointer.
    body: u32,
}

impl FrameLayout {
    fn new(rt: &Runtime, out_slots: u32, nhandles: u32, sync: bool, nreg_args: u32) -> Self {
        let w = WORD as u32;
        let handles = out_slots * 4;
        let mut off = handles + nhandles * w;
        let lock_box = sync.then(|| {
            let x = off;
            off += BASIC_OBJECT_LOCK_SIZE as u32;
            x
        });
        let arg_save = off;
        off += nreg_args * w;
        let result = off;
        off += 2 * w;
        let exception = off;
        off += w;
        let body = align_up(u64::from(off), rt.abi().stack_alignment) as u32;
        Self {
            handles,
            lock_box,
            arg_save,
            result,
            exception,
            body,
        }
    }

    fn frame_words(&self) -> u32 {
        self.body / WORD as u32 + 2
    }

    fn handle(&self, k: usize) -> i64 {
        i64::from(self.handles) + k as i64 * WORD as i64
    }
}

/// The non-placeholder arguments of `l` with their first locations.
fn locations(l: &ArgumentLayout) -> Vec<(BasicType, Location)> {
    l.args()
        .map(|(t, r)| {
            let loc = r
                .first()
                .unwrap_or_else(|| unreachable!("{t} argument without a location"));
            (t, loc)
        })
        .collect()
}

/// How a native argument is produced from the managed arguments.
#[derive(Clone, Copy, Debug)]
enum Source {
    /// Managed argument at this location, passed as it is.
    Value(Location),
    /// A handle to the reference spilled in handle slot `k`.
    Handle(usize),
    /// The length of the array spilled in slot `k`.
    ArrayLength(usize),
    /// The address of the first element of the array spilled in slot `k`.
    ArrayBody(usize),
    JniEnv,
}

struct Wrapper<'a> {
    rt: &'a Runtime,
    method: &'a Method,
    m: MacroAssembler,
    frame: FrameLayout,
    /// The native argument registers, saved around the slow paths before the call.
    arg_regs: Vec<Location>,
}

/// Generate the wrapper of the native method `method`.
pub fn generate(rt: &Runtime, method: &Method) -> Result<NewBlob, CodeGenError> {
    let Some(native) = method.native_function() else {
        return Err(CodeGenError::UnboundNative(method.name.clone()));
    };
    assert!(
        !(method.is_critical_native && method.is_synchronized),
        "critical native {} is synchronized",
        method.name
    );
    let abi = rt.abi();
    let critical = method.is_critical_native;
    let jl = rt
        .callconv
        .get(&method.sig_bt(), method.is_static, Convention::Java);
    let cl = rt
        .callconv
        .get(&native_signature(method), true, Convention::C);
    let jargs = locations(&jl);
    let cargs = locations(&cl);

    // Pair every native argument with where it comes from, spilling references to the handle
    // area as we go.
    let mut spills = Vec::new();
    let mut sources = Vec::with_capacity(cargs.len());
    if !critical {
        sources.push(Source::JniEnv);
    }
    for &(t, loc) in &jargs {
        if t.is_reference() {
            let k = spills.len();
            spills.push(loc);
            if critical {
                sources.extend([Source::ArrayLength(k), Source::ArrayBody(k)]);
            } else {
                sources.push(Source::Handle(k));
            }
        } else {
            sources.push(Source::Value(loc));
        }
    }
    let mirror_slot = (!critical && method.is_static).then(|| {
        sources.insert(1, Source::Handle(spills.len()));
        spills.len()
    });
    debug_assert_eq!(sources.len(), cargs.len());
    let nhandles = spills.len() + usize::from(mirror_slot.is_some());

    let arg_regs = cargs
        .iter()
        .map(|&(_, l)| l)
        .filter(|l| l.is_reg())
        .collect::<Vec<_>>();
    let frame = FrameLayout::new(
        rt,
        cl.stack_slots(),
        nhandles as u32,
        method.is_synchronized,
        arg_regs.len() as u32,
    );
    let mut w = Wrapper {
        rt,
        method,
        m: MacroAssembler::new(abi),
        frame,
        arg_regs,
    };

    let shadow = rt.options().stack_shadow_pages * page_size::get() as u64;
    w.m.emit(Inst::BangStack { offset: shadow });
    w.m.enter();
    w.m.sub_imm(abi.sp, i64::from(w.frame.body));
    let frame_complete = w.m.offset();

    w.shuffle(&spills, mirror_slot, &sources, &cargs);

    let the_pc = w.m.here();
    let mut map = OopMap::new(w.frame.frame_words() * 2, 0);
    for k in 0..nhandles {
        map.set_oop(Location::stack(w.frame.handle(k) as u32 / 4));
    }
    if let Some(lb) = w.frame.lock_box {
        map.set_oop(Location::stack(
            (lb + BASIC_OBJECT_LOCK_OBJ_OFFSET as u32) / 4,
        ));
    }
    let mut oop_maps = OopMapSet::new();
    oop_maps.add_gc_map(w.m.offset(), map);
    w.m.set_last_java_frame(None, None, Some(the_pc));

    let mut slow_paths: Vec<Box<dyn FnOnce(&mut Wrapper<'_>)>> = Vec::new();

    if critical {
        // Critical natives touch array bodies directly, so no safepoint may start while they
        // run: honour a pending one now.
        let slow = w.m.new_label();
        let back = w.m.new_label();
        w.m.emit(Inst::SafepointPoll { slow });
        w.m.bind(back);
        slow_paths.push(Box::new(move |w| {
            w.m.bind(slow);
            w.save_args();
            w.m.call_runtime(RuntimeEntry::HandlePollingPage);
            w.restore_args();
            w.m.jmp(back);
        }));
    }

    let (obj_reg, lock_reg) = (abi.saved[0], abi.saved[1]);
    if let Some(lb) = w.frame.lock_box {
        let slow = w.m.new_label();
        let done = w.m.new_label();
        w.lock_fast_path(lb, obj_reg, lock_reg, mirror_slot, slow, done);
        slow_paths.push(Box::new(move |w| {
            let abi = w.rt.abi();
            w.m.bind(slow);
            w.save_args();
            w.m.mov(abi.c_int_args[0], obj_reg);
            w.m.mov(abi.c_int_args[1], lock_reg);
            w.m.call_runtime(RuntimeEntry::CompleteMonitorLocking);
            w.check_no_pending_exception("pending exception after locking");
            w.restore_args();
            w.m.jmp(done);
        }));
        w.m.bind(done);
    }

    w.m.emit(Inst::SetThreadState(ThreadState::InNative));
    w.m.emit(Inst::CallNative(native));
    match method.ret {
        t @ (BasicType::Boolean
        | BasicType::Char
        | BasicType::Byte
        | BasicType::Short
        | BasicType::Int) => w.m.emit(Inst::Normalize { dst: abi.ret, ty: t }),
        _ => (),
    }

    // Back to managed code, first through a state in which a safepoint can't begin without
    // this thread noticing.
    w.m.emit(Inst::SetThreadState(ThreadState::InNativeTrans));
    w.m.emit(Inst::Fence);
    {
        let slow = w.m.new_label();
        let back = w.m.new_label();
        w.m.emit(Inst::SafepointPoll { slow });
        w.m.bind(back);
        slow_paths.push(Box::new(move |w| {
            w.m.bind(slow);
            w.save_result();
            w.m.call_runtime(RuntimeEntry::CheckSpecialConditionForNativeTrans);
            w.restore_result();
            w.m.jmp(back);
        }));
    }
    w.m.emit(Inst::SetThreadState(ThreadState::InJava));

    {
        let slow = w.m.new_label();
        let back = w.m.new_label();
        w.m.emit(Inst::LoadThread {
            dst: abi.scratch,
            field: ThreadField::StackGuardState,
        });
        w.m.cmp_imm(abi.scratch, StackGuardState::YellowReservedDisabled as i64);
        w.m.jcc(Cond::Eq, slow);
        w.m.bind(back);
        slow_paths.push(Box::new(move |w| {
            w.m.bind(slow);
            w.save_result();
            w.m.call_runtime(RuntimeEntry::ReguardYellowPages);
            w.restore_result();
            w.m.jmp(back);
        }));
    }

    if let Some(lb) = w.frame.lock_box {
        let slow = w.m.new_label();
        let back = w.m.new_label();
        w.unlock_fast_path(lb, obj_reg, lock_reg, slow, back);
        slow_paths.push(Box::new(move |w| {
            let abi = w.rt.abi();
            let exc = at(abi.sp, i64::from(w.frame.exception));
            // The fast path saved the result before the swap overwrote it.
            w.m.bind(slow);
            // The native function may have left an exception pending. Unlocking must not see it
            // and must not lose it.
            w.m.emit(Inst::LoadThread {
                dst: abi.scratch,
                field: ThreadField::PendingException,
            });
            w.m.store(exc, abi.scratch);
            w.m.emit(Inst::StoreThreadImm {
                field: ThreadField::PendingException,
                imm: 0,
            });
            w.m.mov(abi.c_int_args[0], obj_reg);
            w.m.lea(abi.c_int_args[1], at(abi.sp, i64::from(lb)));
            w.m.call_runtime(RuntimeEntry::CompleteMonitorUnlocking);
            w.check_no_pending_exception(
                "no pending exception allowed on exit from complete_monitor_unlocking",
            );
            w.m.load(abi.scratch, exc);
            w.m.emit(Inst::StoreThread {
                field: ThreadField::PendingException,
                src: abi.scratch,
            });
            w.restore_result();
            w.m.jmp(back);
        }));
    }

    w.m.reset_last_java_frame(false);

    if method.ret.is_reference() {
        let null = w.m.new_label();
        w.m.cmp_imm(abi.ret, 0);
        w.m.jcc(Cond::Eq, null);
        w.m.load(abi.ret, at(abi.ret, 0));
        w.m.bind(null);
    }

    if !critical {
        w.m.emit(Inst::LoadThread {
            dst: abi.scratch,
            field: ThreadField::ActiveHandles,
        });
        w.m.store_imm(at(abi.scratch, 0), 0);

        let exception = w.m.new_label();
        w.m.emit(Inst::LoadThread {
            dst: abi.scratch,
            field: ThreadField::PendingException,
        });
        w.m.cmp_imm(abi.scratch, 0);
        w.m.jcc(Cond::Ne, exception);
        w.m.leave();
        w.m.ret();
        w.m.bind(exception);
        w.m.leave();
        w.m.emit(Inst::JmpAbs(rt.stubs().forward_exception_entry()));
    } else {
        w.m.leave();
        w.m.ret();
    }

    for p in slow_paths {
        p(&mut w);
    }

    let mut nm = NmethodInfo::new(method.id, 0);
    nm.lock_box_offset = w.frame.lock_box;
    let frame_words = w.frame.frame_words();
    let mut nb = NewBlob::new(
        &format!("native_wrapper {}", method.name),
        BlobKind::NativeWrapper(nm),
        w.m.finish(),
    );
    nb.frame_size = frame_words;
    nb.frame_complete = Some(frame_complete);
    nb.oop_maps = oop_maps;
    Ok(nb)
}

/// Where the managed argument at stack location `loc` is.
fn incoming(abi: &Abi, loc: Location) -> Addr {
    at(abi.fp, 2 * WORD as i64 + loc.stack_offset() as i64)
}

/// Where the native argument at stack location `loc` goes.
fn outgoing(abi: &Abi, loc: Location) -> Addr {
    at(abi.sp, loc.stack_offset() as i64)
}

impl Wrapper<'_> {
    /// Move every argument into place. Nothing but the scratch registers is written until every
    /// register argument has been read.
    fn shuffle(
        &mut self,
        spills: &[Location],
        mirror_slot: Option<usize>,
        sources: &[Source],
        cargs: &[(BasicType, Location)],
    ) {
        let abi = self.rt.abi();
        self.m.comment("shuffle");
        for (k, &loc) in spills.iter().enumerate() {
            let slot = at(abi.sp, self.frame.handle(k));
            match loc {
                Location::Gp { .. } => self.m.store(slot, Reg::from_loc(loc)),
                Location::Stack(_) => {
                    self.m.load(abi.scratch, incoming(abi, loc));
                    self.m.store(slot, abi.scratch);
                }
                Location::Fp { .. } => unreachable!("reference in {loc}"),
            }
        }
        if let Some(k) = mirror_slot {
            self.m.mov_imm(abi.scratch, self.method.mirror);
            self.m.store(at(abi.sp, self.frame.handle(k)), abi.scratch);
        }

        // Plain values bound for the stack go first: they only read registers.
        let mut reg_moves = Vec::new();
        for (&src, &(_, dst)) in sources.iter().zip(cargs) {
            let Source::Value(src) = src else { continue };
            if dst.is_reg() {
                reg_moves.push((src, dst));
                continue;
            }
            let to = outgoing(abi, dst);
            match src {
                Location::Gp { .. } => self.m.store(to, Reg::from_loc(src)),
                Location::Fp { .. } => self.m.fstore(to, FReg::from_loc(src), Width::W64),
                Location::Stack(_) => {
                    self.m.load(abi.scratch, incoming(abi, src));
                    self.m.store(to, abi.scratch);
                }
            }
        }

        let scratch = Scratch {
            gp: abi.scratch.loc(),
            fp: abi.fscratch.loc(),
        };
        for Move { src, dst } in moveorder::schedule(&reg_moves, scratch) {
            match (src, dst) {
                (Location::Gp { .. }, Location::Gp { .. }) => {
                    self.m.mov(Reg::from_loc(dst), Reg::from_loc(src))
                }
                (Location::Fp { .. }, Location::Fp { .. }) => {
                    self.m.fmov(FReg::from_loc(dst), FReg::from_loc(src))
                }
                (Location::Stack(_), Location::Gp { .. }) => {
                    self.m.load(Reg::from_loc(dst), incoming(abi, src))
                }
                (Location::Stack(_), Location::Fp { .. }) => {
                    self.m
                        .fload(FReg::from_loc(dst), incoming(abi, src), Width::W64)
                }
                _ => unreachable!("move {dst} <- {src}"),
            }
        }

        // Everything else comes from memory or the thread, so the argument registers are free.
        for (&src, &(_, dst)) in sources.iter().zip(cargs) {
            if let Source::Value(_) = src {
                continue;
            }
            // Handles, lengths, bodies and the environment are all integer arguments.
            let tmp = if dst.is_reg() {
                Reg::from_loc(dst)
            } else {
                abi.scratch2
            };
            match src {
                Source::Value(_) => unreachable!(),
                Source::JniEnv => self.m.emit(Inst::LoadThread {
                    dst: tmp,
                    field: ThreadField::JniEnv,
                }),
                Source::Handle(k) => {
                    let slot = at(abi.sp, self.frame.handle(k));
                    let done = self.m.new_label();
                    self.m.emit(Inst::CmpMem {
                        addr: slot,
                        imm: 0,
                        width: Width::W64,
                    });
                    self.m.lea(tmp, slot);
                    self.m.jcc(Cond::Ne, done);
                    self.m.mov_imm(tmp, 0);
                    self.m.bind(done);
                }
                Source::ArrayLength(k) | Source::ArrayBody(k) => {
                    let done = self.m.new_label();
                    self.m.mov_imm(tmp, 0);
                    self.m.load(abi.scratch, at(abi.sp, self.frame.handle(k)));
                    self.m.cmp_imm(abi.scratch, 0);
                    self.m.jcc(Cond::Eq, done);
                    if let Source::ArrayLength(_) = src {
                        self.m.load32(tmp, at(abi.scratch, ARRAY_LENGTH_OFFSET));
                    } else {
                        self.m.lea(tmp, at(abi.scratch, ARRAY_BASE_OFFSET));
                    }
                    self.m.bind(done);
                }
            }
            if !dst.is_reg() {
                let to = outgoing(abi, dst);
                self.m.store(to, tmp);
            }
        }
    }

    /// Lock the receiver (or mirror) with the frame's lock box, jumping to `slow` if that needs
    /// the runtime. Leaves the object in `obj_reg` and the box's address in `lock_reg`.
    fn lock_fast_path(
        &mut self,
        lock_box: u32,
        obj_reg: Reg,
        lock_reg: Reg,
        mirror_slot: Option<usize>,
        slow: Label,
        done: Label,
    ) {
        let abi = self.rt.abi();
        let m = &mut self.m;
        m.comment("lock");
        let obj_slot = mirror_slot.unwrap_or(0);
        m.load(obj_reg, at(abi.sp, self.frame.handle(obj_slot)));
        m.lea(lock_reg, at(abi.sp, i64::from(lock_box)));
        m.store(at(lock_reg, BASIC_OBJECT_LOCK_OBJ_OFFSET), obj_reg);
        // Assume the object is unlocked and try to swing its mark to the box.
        m.load(abi.ret, at(obj_reg, 0));
        m.emit(Inst::OrImm {
            dst: abi.ret,
            imm: UNLOCKED_VALUE,
        });
        m.store(at(lock_reg, 0), abi.ret);
        m.emit(Inst::CmpXchg {
            addr: at(obj_reg, 0),
            new: lock_reg,
        });
        m.jcc(Cond::Eq, done);
        // A mark that points into this thread's stack, near enough to the stack pointer, is a
        // lock this thread already holds: record the recursion with a zero box.
        m.emit(Inst::Sub {
            dst: abi.ret,
            src: abi.sp,
        });
        m.and_imm(abi.ret, 3 - page_size::get() as i64);
        m.store(at(lock_reg, 0), abi.ret);
        m.jcc(Cond::Ne, slow);
    }

    /// Unlock what [Self::lock_fast_path] locked, jumping to `slow` if that needs the runtime.
    fn unlock_fast_path(
        &mut self,
        lock_box: u32,
        obj_reg: Reg,
        lock_reg: Reg,
        slow: Label,
        back: Label,
    ) {
        let abi = self.rt.abi();
        let recursive = self.m.new_label();
        self.m.comment("unlock");
        self.m.lea(lock_reg, at(abi.sp, i64::from(lock_box)));
        self.m
            .load(obj_reg, at(lock_reg, BASIC_OBJECT_LOCK_OBJ_OFFSET));
        self.m.emit(Inst::CmpMem {
            addr: at(lock_reg, 0),
            imm: 0,
            width: Width::W64,
        });
        self.m.jcc(Cond::Eq, recursive);
        // The swap needs the result register.
        self.save_result();
        self.m.mov(abi.ret, lock_reg);
        self.m.load(abi.scratch, at(lock_reg, 0));
        self.m.emit(Inst::CmpXchg {
            addr: at(obj_reg, 0),
            new: abi.scratch,
        });
        self.m.jcc(Cond::Ne, slow);
        self.m.bind(back);
        self.restore_result();
        self.m.bind(recursive);
    }

    fn save_args(&mut self) {
        let abi = self.rt.abi();
        for (k, &r) in self.arg_regs.iter().enumerate() {
            let slot = at(abi.sp, i64::from(self.frame.arg_save) + k as i64 * WORD as i64);
            match r {
                Location::Gp { .. } => self.m.store(slot, Reg::from_loc(r)),
                _ => self.m.fstore(slot, FReg::from_loc(r), Width::W64),
            }
        }
    }

    fn restore_args(&mut self) {
        let abi = self.rt.abi();
        for (k, &r) in self.arg_regs.iter().enumerate() {
            let slot = at(abi.sp, i64::from(self.frame.arg_save) + k as i64 * WORD as i64);
            match r {
                Location::Gp { .. } => self.m.load(Reg::from_loc(r), slot),
                _ => self.m.fload(FReg::from_loc(r), slot, Width::W64),
            }
        }
    }

    fn save_result(&mut self) {
        let abi = self.rt.abi();
        let off = i64::from(self.frame.result);
        match self.method.ret {
            BasicType::Void => (),
            t if t.is_float() => self
                .m
                .fstore(at(abi.sp, off + WORD as i64), abi.fret, Width::W64),
            _ => self.m.store(at(abi.sp, off), abi.ret),
        }
    }

    fn restore_result(&mut self) {
        let abi = self.rt.abi();
        let off = i64::from(self.frame.result);
        match self.method.ret {
            BasicType::Void => (),
            t if t.is_float() => self
                .m
                .fload(abi.fret, at(abi.sp, off + WORD as i64), Width::W64),
            _ => self.m.load(abi.ret, at(abi.sp, off)),
        }
    }

    fn check_no_pending_exception(&mut self, msg: &str) {
        let abi = self.rt.abi();
        if !self.rt.options().check_no_pending_exception {
            return;
        }
        let ok = self.m.new_label();
        self.m.emit(Inst::LoadThread {
            dst: abi.scratch,
            field: ThreadField::PendingException,
        });
        self.m.cmp_imm(abi.scratch, 0);
        self.m.jcc(Cond::Eq, ok);
        self.m.stop(msg);
        self.m.bind(ok);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        abi::x64::{X64_SYSV, X64_WIN64},
        frame::FrameKind,
        masm::sim::Machine,
        method::NewMethod,
        stubs::{call_managed, CallOutcome},
        testing::TestRuntime,
    };
    use std::sync::Arc;
    use BasicType::*;

    #[test]
    fn native_signatures() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("f", k, &[Int, Object, Long], Void).static_method().native())
            .unwrap();
        assert_eq!(
            native_signature(&m),
            vec![Address, Object, Int, Object, Long, Void]
        );
        let m = t
            .rt
            .add_method(NewMethod::new("g", k, &[Double], Void).native())
            .unwrap();
        assert_eq!(native_signature(&m), vec![Address, Object, Double, Void]);
        let m = t
            .rt
            .add_method(
                NewMethod::new("h", k, &[Array, Int], Int)
                    .static_method()
                    .critical_native(),
            )
            .unwrap();
        assert_eq!(native_signature(&m), vec![Int, Address, Int]);
    }

    #[test]
    fn unbound_native() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("f", k, &[], Void).static_method().native())
            .unwrap();
        assert!(matches!(
            t.rt.generate_native_wrapper(&m),
            Err(CodeGenError::UnboundNative(_))
        ));
    }

    #[test]
    fn static_native_gets_env_and_mirror() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(
                NewMethod::new("sum", k, &[Int, Long, Double], Long)
                    .static_method()
                    .native(),
            )
            .unwrap();
        let mirror = m.mirror;
        t.rt.bind_native(&m, move |nc| {
            assert_eq!(nc.arg_count(), 5);
            assert_eq!(nc.arg(0), nc.thread().jni_env);
            assert_eq!(nc.resolve(nc.arg(1)), mirror);
            assert_eq!(nc.thread().shared.state(), ThreadState::InNative);
            (nc.arg(2) as u32 as u64) + nc.arg(3) + f64::from_bits(nc.arg(4)) as u64
        })
        .unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(
            call_managed(&mut mc, m.id, &[2, 40, 8.0f64.to_bits()]),
            CallOutcome::Returned(50)
        );
    }

    #[test]
    fn float_arguments_in_registers() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("trunc", k, &[Double, Float], Long).static_method().native())
            .unwrap();
        t.rt.bind_native(&m, |nc| {
            let d = f64::from_bits(nc.arg(2));
            let f = f32::from_bits(nc.arg(3) as u32);
            (d + f64::from(f)) as u64
        })
        .unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(
            call_managed(
                &mut mc,
                m.id,
                &[40.75f64.to_bits(), u64::from(1.5f32.to_bits())]
            ),
            CallOutcome::Returned(42)
        );
    }

    #[test]
    fn references_are_passed_as_handles() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 1);
        let m = t
            .rt
            .add_method(NewMethod::new("pick", k, &[Object, Object], Object).native())
            .unwrap();
        let recv = t.rt.heap.alloc_object(&t.rt.mem, k);
        let obj = t.rt.heap.alloc_object(&t.rt.mem, k);
        t.rt.bind_native(&m, move |nc| {
            assert_eq!(nc.resolve(nc.arg(1)), recv);
            // A null reference is a null handle, not a handle to null.
            assert_eq!(nc.arg(2), 0);
            let h = nc.arg(3);
            assert_ne!(h, obj);
            let o = nc.resolve(h);
            nc.new_local(o)
        })
        .unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(
            call_managed(&mut mc, m.id, &[recv, 0, obj]),
            CallOutcome::Returned(obj)
        );
        // The local handle created by the native function is gone.
        assert_eq!(t.rt.mem.read_u64(thread.active_handles), 0);
    }

    #[test]
    fn null_reference_result() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("none", k, &[], Object).static_method().native())
            .unwrap();
        t.rt.bind_native(&m, |_| 0).unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[]), CallOutcome::Returned(0));
    }

    fn many_arguments(abi: &'static Abi) {
        let t = TestRuntime::with_abi(abi);
        let k = t.rt.define_class("K", 0);
        let mut params = Vec::new();
        let mut args = Vec::new();
        for i in 0..10u64 {
            params.push(Int);
            args.push(i + 1);
            params.push(Double);
            args.push((i as f64 + 0.5).to_bits());
        }
        for i in 0..3 {
            params.push(Long);
            args.push(1000 + i);
        }
        let expected = args
            .iter()
            .zip(&params)
            .map(|(&a, t)| match t {
                Double => (f64::from_bits(a) * 2.0) as u64,
                _ => a,
            })
            .sum::<u64>();
        let m = t
            .rt
            .add_method(NewMethod::new("many", k, &params, Long).static_method().native())
            .unwrap();
        let tys = params.clone();
        t.rt.bind_native(&m, move |nc| {
            assert_eq!(nc.arg_count(), tys.len() + 2);
            tys.iter()
                .enumerate()
                .map(|(j, t)| {
                    let a = nc.arg(j + 2);
                    match t {
                        Double => (f64::from_bits(a) * 2.0) as u64,
                        Int => u64::from(a as u32),
                        _ => a,
                    }
                })
                .sum()
        })
        .unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(
            call_managed(&mut mc, m.id, &args),
            CallOutcome::Returned(expected)
        );
    }

    #[test]
    fn many_arguments_sysv() {
        many_arguments(&X64_SYSV);
    }

    #[test]
    fn many_arguments_win64() {
        many_arguments(&X64_WIN64);
    }

    #[test]
    fn exception_is_forwarded() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("boom", k, &[Object], Int).static_method().native())
            .unwrap();
        t.rt.bind_native(&m, |nc| {
            let h = nc.arg(2);
            let exc = nc.resolve(h);
            nc.throw(exc);
            0
        })
        .unwrap();
        let exc = t.rt.heap.alloc_object(&t.rt.mem, k);
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[exc]), CallOutcome::Threw(exc));
        assert_eq!(t.rt.mem.read_u64(thread.active_handles), 0);
    }

    #[test]
    fn synchronized_native_holds_the_lock() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("locked", k, &[], Int).native().synchronized())
            .unwrap();
        let recv = t.rt.heap.alloc_object(&t.rt.mem, k);
        t.rt.bind_native(&m, move |nc| {
            let id = nc.thread().id();
            assert_eq!(nc.rt().sync.owner(nc.mem(), recv), Some(id));
            7
        })
        .unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[recv]), CallOutcome::Returned(7));
        assert_eq!(t.rt.sync.owner(&t.rt.mem, recv), None);
        assert!(crate::sync::is_neutral(t.rt.mem.read_u64(recv)));
    }

    #[test]
    fn synchronized_native_on_an_inflated_monitor() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(
                NewMethod::new("locked", k, &[], Int)
                    .static_method()
                    .native()
                    .synchronized(),
            )
            .unwrap();
        let mirror = m.mirror;
        let mon = t.rt.sync.inflate(&t.rt.mem, mirror);
        let mon2 = Arc::clone(&mon);
        t.rt.bind_native(&m, move |nc| {
            let id = nc.thread().id();
            assert_eq!(mon2.owner(), Some(id));
            8
        })
        .unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[]), CallOutcome::Returned(8));
        assert_eq!(mon.owner(), None);
        assert_eq!(mon.recursions(), 0);
    }

    #[test]
    fn inflated_unlock_keeps_a_reference_result() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("me", k, &[], Object).native().synchronized())
            .unwrap();
        let recv = t.rt.heap.alloc_object(&t.rt.mem, k);
        let mon = t.rt.sync.inflate(&t.rt.mem, recv);
        t.rt.bind_native(&m, |nc| nc.arg(1)).unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[recv]), CallOutcome::Returned(recv));
        assert_eq!(mon.owner(), None);
    }

    #[test]
    fn nested_natives_keep_their_own_handles() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let inner = t
            .rt
            .add_method(NewMethod::new("inner", k, &[Object], Object).static_method().native())
            .unwrap();
        let outer = t
            .rt
            .add_method(
                NewMethod::new("outer", k, &[Object, Object], Object)
                    .static_method()
                    .native(),
            )
            .unwrap();
        t.rt.bind_native(&inner, |nc| {
            let b = nc.resolve(nc.arg(2));
            nc.new_local(b)
        })
        .unwrap();
        let inner_id = inner.id;
        t.rt.bind_native(&outer, move |nc| {
            let a = nc.resolve(nc.arg(2));
            let b = nc.resolve(nc.arg(3));
            let h = nc.new_local(a);
            assert_eq!(nc.call(inner_id, &[b]), CallOutcome::Returned(b));
            // The inner wrapper released its handles, not ours.
            assert_eq!(nc.resolve(h), a);
            assert_eq!(nc.new_local(b), h + 8);
            h
        })
        .unwrap();
        let a = t.rt.heap.alloc_object(&t.rt.mem, k);
        let b = t.rt.heap.alloc_object(&t.rt.mem, k);
        let mut thread = t.thread();
        let live = t.rt.mem.c_heap_live();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(
            call_managed(&mut mc, outer.id, &[a, b]),
            CallOutcome::Returned(a)
        );
        assert_eq!(t.rt.mem.c_heap_live(), live);
    }

    #[test]
    fn recursive_synchronized_native() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(
                NewMethod::new("countdown", k, &[Int], Int)
                    .static_method()
                    .native()
                    .synchronized(),
            )
            .unwrap();
        let (id, mirror) = (m.id, m.mirror);
        t.rt.bind_native(&m, move |nc| {
            let tid = nc.thread().id();
            assert_eq!(nc.rt().sync.owner(nc.mem(), mirror), Some(tid));
            match nc.arg(2) as u32 {
                0 => 0,
                n => match nc.call(id, &[u64::from(n - 1)]) {
                    CallOutcome::Returned(v) => v + 1,
                    o => panic!("{o:?}"),
                },
            }
        })
        .unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[3]), CallOutcome::Returned(3));
        assert_eq!(t.rt.sync.owner(&t.rt.mem, mirror), None);
        assert!(crate::sync::is_neutral(t.rt.mem.read_u64(mirror)));
    }

    #[test]
    fn synchronized_native_that_throws_unlocks() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(
                NewMethod::new("boom", k, &[], Void)
                    .static_method()
                    .native()
                    .synchronized(),
            )
            .unwrap();
        let mirror = m.mirror;
        // Inflated, so that unlocking goes through the runtime with the exception set aside.
        t.rt.sync.inflate(&t.rt.mem, mirror);
        t.rt.bind_native(&m, |nc| {
            nc.throw(0xe0);
            0
        })
        .unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[]), CallOutcome::Threw(0xe0));
        assert_eq!(t.rt.sync.owner(&t.rt.mem, mirror), None);
    }

    #[test]
    fn critical_native_gets_array_bodies() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(
                NewMethod::new("sum", k, &[Array, Int], Int)
                    .static_method()
                    .critical_native(),
            )
            .unwrap();
        t.rt.bind_native(&m, |nc| {
            assert_eq!(nc.arg_count(), 3);
            let (len, body, x) = (nc.arg(0) as u32, nc.arg(1), nc.arg(2) as u32);
            if len == 0 {
                assert_eq!(body, 0);
            }
            let s = (0..u64::from(len))
                .map(|i| nc.mem().read_u32(body + 4 * i))
                .sum::<u32>();
            u64::from(s + x)
        })
        .unwrap();
        let a = t.rt.heap.alloc_array(&t.rt.mem, Int, 3);
        for (i, v) in [5, 6, 7].into_iter().enumerate() {
            t.rt
                .mem
                .write_u32(a + ARRAY_BASE_OFFSET as u64 + 4 * i as u64, v);
        }
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[a, 100]), CallOutcome::Returned(118));
        assert_eq!(call_managed(&mut mc, m.id, &[0, 100]), CallOutcome::Returned(100));
    }

    #[test]
    fn yellow_zone_is_reguarded() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("overflow", k, &[], Long).static_method().native())
            .unwrap();
        t.rt.bind_native(&m, |nc| {
            nc.thread().disable_stack_yellow_reserved_zone();
            0x1234_5678_9abc
        })
        .unwrap();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(
            call_managed(&mut mc, m.id, &[]),
            CallOutcome::Returned(0x1234_5678_9abc)
        );
        assert_eq!(thread.stack_guard_state, StackGuardState::Enabled);
    }

    #[test]
    fn suspended_on_the_way_back() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("slow", k, &[], Double).static_method().native())
            .unwrap();
        t.rt.bind_native(&m, |nc| {
            let rt = Arc::clone(nc.rt());
            rt.safepoints.suspend(&nc.thread().shared);
            2.5f64.to_bits()
        })
        .unwrap();
        let mut thread = t.thread();
        let shared = Arc::clone(&thread.shared);
        let rt = Arc::clone(&t.rt);
        let resumer = std::thread::spawn(move || {
            while shared.state() != ThreadState::Blocked {
                std::thread::yield_now();
            }
            rt.safepoints.resume(&shared);
        });
        let mut mc = Machine::new(&mut thread);
        // The result survives the trip through the runtime.
        assert_eq!(
            call_managed(&mut mc, m.id, &[]),
            CallOutcome::Returned(2.5f64.to_bits())
        );
        resumer.join().unwrap();
    }

    #[test]
    fn wrapper_frame_is_walkable() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("walk", k, &[Object], Void).native().synchronized())
            .unwrap();
        t.rt.bind_native(&m, |nc| {
            let fr = nc.last_frame();
            assert_eq!(fr.kind(), FrameKind::Native);
            assert!(fr.safe_for_sender(nc.thread()));
            // The receiver, the argument and the locked object.
            let oops = fr
                .blob()
                .and_then(|b| b.oop_map_at(fr.pc()))
                .map(|map| map.oops().count());
            assert_eq!(oops, Some(3));
            let rt = Arc::clone(nc.rt());
            let mut map = crate::frame::RegisterMap::new(false);
            let sender = fr.sender(&rt, &mut map).unwrap();
            assert!(sender.is_entry());
            0
        })
        .unwrap();
        let recv = t.rt.heap.alloc_object(&t.rt.mem, k);
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[recv, 0]), CallOutcome::Returned(0));
    }

    #[test]
    fn wrapper_listing() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(
                NewMethod::new("f", k, &[], Void)
                    .static_method()
                    .native()
                    .synchronized(),
            )
            .unwrap();
        let b = t.rt.bind_native(&m, |_| 0).unwrap();
        let ptn = "...
  ...: enter
...
  ...: mov thread.state, InNative
...
  ...: mov thread.state, InNativeTrans
  ...: mfence
...
  ...: mov thread.state, InJava
...
  ...: leave
  ...: ret
...
  ...: call runtime.complete_monitor_locking
...
  ...: call runtime.check_special_condition_for_native_trans
...
  ...: call runtime.reguard_yellow_pages
...
  ...: call runtime.complete_monitor_unlocking
...
";
        fm::FMBuilder::new(ptn)
            .unwrap()
            .build()
            .unwrap()
            .matches(&crate::masm::disassemble(t.rt.abi(), b.code()))
            .unwrap();
    }
}
