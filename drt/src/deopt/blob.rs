//! The deopt and uncommon trap blobs.
//!
//! Both pop a compiled frame and push the interpreter frames replacing it, in three steps:
//!
//!   1. Call the runtime to gather the frame's state and compute the unroll block.
//!   2. Pop the compiled frame and push one skeletal frame per activation, each with just its
//!      return address, link, sender sp and a cleared last sp. A final copy of the blob's own
//!      frame keeps the result registers across the next call.
//!   3. Call the runtime to fill the skeletal frames in, then return into the youngest of them.
//!
//! While step 3 runs the stack is walkable: the blob's final frame is the last managed frame and
//! its sender is the youngest skeletal frame.

use super::{unroll::*, ExecMode};
use crate::{
    abi::{Abi, Reg, WORD},
    codecache::{BlobKind, DeoptEntries, NewBlob},
    frame::interp::{LAST_SP_OFFSET, SENDER_SP_OFFSET},
    masm::{at, Cond, Inst, MacroAssembler, Width},
    regsave::RegSaveLayout,
    runtime::{Options, RuntimeEntry},
    thread::ThreadField,
};
use drtmap::{OopMap, OopMapSet};

/// The registers that survive from the unroll block fetch to the unpack call. All are callee
/// saved under the native convention, so runtime calls leave them alone.
struct UnrollRegs {
    ub: Reg,
    mode: Reg,
    sizes: Reg,
    pcs: Reg,
    counter: Reg,
    sender_sp: Reg,
}

impl UnrollRegs {
    fn new(abi: &Abi) -> Self {
        Self {
            ub: abi.saved[0],
            mode: abi.saved[1],
            sizes: abi.saved[2],
            pcs: abi.method_reg,
            counter: abi.scratch2,
            sender_sp: abi.sender_sp_reg,
        }
    }
}

/// Emit code popping the deoptimized frame, whose return address the stack pointer points at,
/// and pushing the skeletal frames the unroll block in `r.ub` describes. Leaves `r.pcs` pointing
/// at the youngest frame's pc.
fn push_skeletal_frames(m: &mut MacroAssembler, options: &Options, r: &UnrollRegs) {
    let abi = m.abi();
    m.comment("pop the deoptimized frame");
    m.load(r.sizes, at(r.ub, SIZE_OF_DEOPTIMIZED_FRAME));
    m.emit(Inst::Add {
        dst: abi.sp,
        src: r.sizes,
    });
    m.load(abi.fp, at(r.ub, INITIAL_INFO));
    if options.verify_stack_bang {
        m.load(r.sizes, at(r.ub, TOTAL_FRAME_SIZES));
        m.emit(Inst::BangStackSize { size: r.sizes });
    }
    m.load(r.pcs, at(r.ub, FRAME_PCS));
    // The deoptimized frame's return address is pcs[0].
    m.add_imm(abi.sp, WORD as i64);
    m.load(r.sizes, at(r.ub, FRAME_SIZES));
    m.load(r.counter, at(r.ub, NUMBER_OF_FRAMES));
    m.mov(r.sender_sp, abi.sp);
    m.load(abi.scratch, at(r.ub, CALLER_ADJUSTMENT));
    m.emit(Inst::Sub {
        dst: abi.sp,
        src: abi.scratch,
    });

    m.comment("push skeletal interpreter frames");
    let lp = m.here();
    m.load(abi.scratch, at(r.sizes, 0));
    m.sub_imm(abi.scratch, 2 * WORD as i64);
    m.emit(Inst::PushMem(at(r.pcs, 0)));
    m.enter();
    m.emit(Inst::Sub {
        dst: abi.sp,
        src: abi.scratch,
    });
    m.store(at(abi.fp, SENDER_SP_OFFSET * WORD as i64), r.sender_sp);
    m.store_imm(at(abi.fp, LAST_SP_OFFSET * WORD as i64), 0);
    m.mov(r.sender_sp, abi.sp);
    m.add_imm(r.sizes, WORD as i64);
    m.add_imm(r.pcs, WORD as i64);
    m.add_imm(r.counter, -1);
    m.jcc(Cond::Ne, lp);
}

/// Emit the call filling in the skeletal frames, made from the blob's re-pushed self frame. Returns
/// the offset of the call's return address.
fn unpack_frames_call(m: &mut MacroAssembler, mode: Result<Reg, ExecMode>) -> u32 {
    let abi = m.abi();
    let the_pc = m.new_label();
    m.set_last_java_frame(None, Some(abi.fp), Some(the_pc));
    m.align_stack();
    match mode {
        Ok(r) => m.mov(abi.c_int_args[0], r),
        Err(mode) => m.mov_imm(abi.c_int_args[0], mode as u64),
    }
    m.call_runtime(RuntimeEntry::UnpackFrames);
    m.bind(the_pc);
    let off = m.offset();
    m.emit(Inst::LoadThread {
        dst: abi.sp,
        field: ThreadField::LastJavaSp,
    });
    m.reset_last_java_frame(true);
    off
}

/// Generate the deopt blob. Its entries:
///
///   * `unpack`: reached through a deoptimized frame's deopt handler, which pushed the frame's
///     return address, when the frame's callee returned.
///   * `reexecute`: the same, but the bytecode the frame was at is executed again.
///   * `with_exception`: jumped to with the exception in the result register and the throwing pc
///     in the second result register.
///   * `with_exception_in_tls`: the same, but with the exception already stored in the thread.
pub(crate) fn generate_deopt_blob(abi: &'static Abi, options: &Options) -> NewBlob {
    let layout = RegSaveLayout::new(abi, options.save_wide_vectors);
    let r = UnrollRegs::new(abi);
    let mut m = MacroAssembler::new(abi);
    let cont = m.new_label();

    let unpack = m.offset();
    let map = layout.save(&mut m);
    m.mov_imm(r.mode, ExecMode::Deopt as u64);
    m.jmp(cont);

    let reexecute = m.offset();
    layout.save(&mut m);
    m.mov_imm(r.mode, ExecMode::Reexecute as u64);
    m.jmp(cont);

    let with_exception = m.offset();
    m.emit(Inst::StoreThread {
        field: ThreadField::ExceptionOop,
        src: abi.ret,
    });
    m.emit(Inst::StoreThread {
        field: ThreadField::ExceptionPc,
        src: abi.ret2,
    });
    let with_exception_in_tls = m.offset();
    // A return address slot for the throwing pc.
    m.emit(Inst::PushImm(0));
    layout.save(&mut m);
    m.emit(Inst::LoadThread {
        dst: abi.scratch,
        field: ThreadField::ExceptionPc,
    });
    m.store(at(abi.fp, WORD as i64), abi.scratch);
    m.mov_imm(r.mode, ExecMode::Exception as u64);
    if options.check_no_pending_exception {
        let ok = m.new_label();
        m.emit(Inst::LoadThread {
            dst: abi.scratch,
            field: ThreadField::PendingException,
        });
        m.cmp_imm(abi.scratch, 0);
        m.jcc(Cond::Eq, ok);
        m.stop("exception pending on entry to the deopt blob");
        m.bind(ok);
    }

    m.bind(cont);
    let frame_complete = m.offset();
    let mut oop_maps = OopMapSet::new();
    m.set_last_java_frame(None, None, None);
    m.mov(abi.c_int_args[0], r.mode);
    m.call_runtime(RuntimeEntry::FetchUnrollInfo);
    oop_maps.add_gc_map(m.offset(), map);
    m.reset_last_java_frame(false);
    m.mov(r.ub, abi.ret);

    let no_exception = m.new_label();
    m.emit(Inst::CmpMem {
        addr: at(r.ub, UNPACK_KIND),
        imm: ExecMode::Exception as i64,
        width: Width::W64,
    });
    m.jcc(Cond::Ne, no_exception);
    m.comment("the interpreter rethrows from the result registers");
    m.emit(Inst::LoadThread {
        dst: abi.ret,
        field: ThreadField::ExceptionOop,
    });
    m.store(at(abi.sp, layout.result_offset() as i64), abi.ret);
    m.emit(Inst::LoadThread {
        dst: abi.ret2,
        field: ThreadField::ExceptionPc,
    });
    m.store(at(abi.sp, layout.result2_offset() as i64), abi.ret2);
    m.emit(Inst::StoreThreadImm {
        field: ThreadField::ExceptionOop,
        imm: 0,
    });
    m.emit(Inst::StoreThreadImm {
        field: ThreadField::ExceptionPc,
        imm: 0,
    });
    m.bind(no_exception);

    layout.restore_result_registers(&mut m);
    push_skeletal_frames(&mut m, options, &r);

    m.comment("re-push the self frame, keeping the results in it");
    m.emit(Inst::PushMem(at(r.pcs, 0)));
    m.enter();
    m.sub_imm(abi.sp, (layout.frame_bytes() - 2 * WORD) as i64);
    m.fstore(
        at(abi.sp, layout.fresult_offset() as i64),
        abi.fret,
        Width::W64,
    );
    m.store(at(abi.sp, layout.result_offset() as i64), abi.ret);
    m.store(at(abi.sp, layout.result2_offset() as i64), abi.ret2);

    let ret_off = unpack_frames_call(&mut m, Ok(r.mode));
    oop_maps.add_gc_map(ret_off, OopMap::new(layout.frame_words() * 2, 0));
    m.fload(
        abi.fret,
        at(abi.sp, layout.fresult_offset() as i64),
        Width::W64,
    );
    m.load(abi.ret, at(abi.sp, layout.result_offset() as i64));
    m.load(abi.ret2, at(abi.sp, layout.result2_offset() as i64));
    m.leave();
    m.ret();

    let entries = DeoptEntries {
        unpack,
        reexecute,
        with_exception,
        with_exception_in_tls,
    };
    let mut nb = NewBlob::new("deopt_blob", BlobKind::Deopt(entries), m.finish());
    nb.frame_size = layout.frame_words();
    nb.frame_complete = Some(frame_complete);
    nb.oop_maps = oop_maps;
    nb
}

/// Generate the uncommon trap blob, called from compiled code with the trap request (see
/// [super::make_trap_request]) in the first managed integer argument register.
pub(crate) fn generate_uncommon_trap_blob(abi: &'static Abi, options: &Options) -> NewBlob {
    let r = UnrollRegs::new(abi);
    let mut m = MacroAssembler::new(abi);
    let arg_area = u64::from(abi.arg_reg_save_area_bytes);
    // Saved fp and return address, above the callee home space.
    let frame_words = (2 * WORD + arg_area) / WORD;

    m.sub_imm(abi.sp, (WORD + arg_area) as i64);
    m.store(at(abi.sp, arg_area as i64), abi.fp);
    let frame_complete = m.offset();

    let mut oop_maps = OopMapSet::new();
    m.set_last_java_frame(None, None, None);
    // On both platforms the request arrives in the native second argument register.
    m.mov(abi.c_int_args[0], abi.java_int_args[0]);
    m.mov_imm(abi.c_int_args[1], ExecMode::UncommonTrap as u64);
    m.call_runtime(RuntimeEntry::UncommonTrap);
    oop_maps.add_gc_map(m.offset(), OopMap::new(frame_words as u32 * 2, 0));
    m.reset_last_java_frame(false);
    m.mov(r.ub, abi.ret);

    if options.verify_stack_bang {
        let ok = m.new_label();
        m.emit(Inst::CmpMem {
            addr: at(r.ub, UNPACK_KIND),
            imm: ExecMode::UncommonTrap as i64,
            width: Width::W64,
        });
        m.jcc(Cond::Eq, ok);
        m.stop("uncommon trap unrolled with the wrong unpack kind");
        m.bind(ok);
    }

    // Leave the stack pointer at the return address.
    m.add_imm(abi.sp, (WORD + arg_area) as i64);
    push_skeletal_frames(&mut m, options, &r);

    m.comment("re-push the self frame");
    m.emit(Inst::PushMem(at(r.pcs, 0)));
    m.enter();
    m.sub_imm(abi.sp, arg_area as i64);
    let ret_off = unpack_frames_call(&mut m, Err(ExecMode::UncommonTrap));
    oop_maps.add_gc_map(ret_off, OopMap::new(frame_words as u32 * 2, 0));
    m.leave();
    m.ret();

    let mut nb = NewBlob::new("uncommon_trap_blob", BlobKind::UncommonTrap, m.finish());
    nb.frame_size = frame_words as u32;
    nb.frame_complete = Some(frame_complete);
    nb.oop_maps = oop_maps;
    nb
}
