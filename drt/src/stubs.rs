//! The runtime's fixed stubs, generated once when the runtime is built.
//!
//! * The interpreter blob: the entry points the interpreter offers to the rest of the system. The
//!   interpreter itself lives outside this crate, so each entry halts the machine with the reason
//!   control arrived there.
//! * The call stub: how the host (and native code calling back) enters managed code.
//! * The exception forwarder, which native wrappers jump to when a native function leaves an
//!   exception pending.
//! * The safepoint handler compiled code calls from a poll that found a request pending.
//! * The deopt and uncommon-trap blobs (see [crate::deopt::blob]).

use crate::{
    abi::{Abi, BasicType, Reg, WORD},
    codecache::{BlobKind, CodeBlob, CodeCache, InterpreterEntries, NewBlob},
    deopt::blob as deopt_blob,
    log::Log,
    masm::{at, sim::Machine, CallTarget, Cond, Halt, Inst, MacroAssembler, Width},
    mem::Memory,
    method::{MethodField, MethodId},
    native::HANDLE_BLOCK_BYTES,
    regsave::RegSaveLayout,
    runtime::{Options, RuntimeEntry},
    thread::{FrameAnchor, ThreadField, ThreadState},
    CodeGenError,
};
use std::{mem, sync::Arc};

/// The call stub's argument block, in words.
const CALL_RESULT: i64 = 0;
const CALL_FRESULT: i64 = 8;
const CALL_METHOD: i64 = 16;
const CALL_PARAMS: i64 = 24;
const CALL_PARAM_COUNT: i64 = 32;
/// The caller's anchor, saved for the stack walker: the entry frame's sender is the frame it
/// names.
const CALL_ANCHOR_SP: i64 = 40;
const CALL_ANCHOR_FP: i64 = 48;
const CALL_ANCHOR_PC: i64 = 56;
const CALL_BLOCK_BYTES: u64 = 64;

pub struct StubRoutines {
    interpreter: Arc<CodeBlob>,
    call_stub: Arc<CodeBlob>,
    forward_exception: Arc<CodeBlob>,
    safepoint_handler: Arc<CodeBlob>,
    handle_wrong_method: Arc<CodeBlob>,
    deopt_blob: Arc<CodeBlob>,
    uncommon_trap_blob: Arc<CodeBlob>,
}

impl StubRoutines {
    pub(crate) fn generate(
        abi: &'static Abi,
        options: &Options,
        code_cache: &CodeCache,
        log: &Log,
    ) -> Result<Self, CodeGenError> {
        let install = |nb: NewBlob| -> Result<Arc<CodeBlob>, CodeGenError> {
            let b = code_cache.install(nb)?;
            log.log_blob(abi, &b);
            Ok(b)
        };
        let interpreter = install(generate_interpreter(abi))?;
        let call_stub = install(generate_call_stub(abi))?;
        let call_stub_return = call_stub
            .call_stub_return()
            .unwrap_or_else(|| unreachable!());
        let forward_exception = install(generate_forward_exception(abi, call_stub_return))?;
        let safepoint_handler = install(generate_safepoint_handler(
            abi,
            options,
            forward_exception.code_begin(),
        ))?;
        let handle_wrong_method = install(generate_handle_wrong_method(abi, options))?;
        let deopt_blob = install(deopt_blob::generate_deopt_blob(abi, options))?;
        let uncommon_trap_blob = install(deopt_blob::generate_uncommon_trap_blob(abi, options))?;
        Ok(Self {
            interpreter,
            call_stub,
            forward_exception,
            safepoint_handler,
            handle_wrong_method,
            deopt_blob,
            uncommon_trap_blob,
        })
    }

    fn interpreter_entries(&self) -> &InterpreterEntries {
        match self.interpreter.kind() {
            BlobKind::Interpreter(e) => e,
            _ => unreachable!(),
        }
    }

    /// Where calls to methods without compiled code go.
    pub fn interpreter_entry(&self) -> u64 {
        self.interpreter
            .addr(self.interpreter_entries().method_entry)
    }

    /// Resume an interpreted frame after the invoke at its bci.
    pub fn interpreter_continue_after(&self) -> u64 {
        self.interpreter
            .addr(self.interpreter_entries().continue_after)
    }

    /// Resume an interpreted frame by re-executing the bytecode at its bci.
    pub fn interpreter_reexecute(&self) -> u64 {
        self.interpreter.addr(self.interpreter_entries().reexecute)
    }

    pub fn interpreter_rethrow(&self) -> u64 {
        self.interpreter.addr(self.interpreter_entries().rethrow)
    }

    /// The return address interpreted frames hold while calling out.
    pub fn interpreter_return(&self) -> u64 {
        self.interpreter
            .addr(self.interpreter_entries().return_entry)
    }

    pub fn interpreter(&self) -> &Arc<CodeBlob> {
        &self.interpreter
    }

    pub fn call_stub(&self) -> &Arc<CodeBlob> {
        &self.call_stub
    }

    pub fn call_stub_entry(&self) -> u64 {
        self.call_stub.code_begin()
    }

    pub fn forward_exception_entry(&self) -> u64 {
        self.forward_exception.code_begin()
    }

    pub fn safepoint_handler(&self) -> &Arc<CodeBlob> {
        &self.safepoint_handler
    }

    /// Where the verified entry of code that is not entrant jumps to.
    pub fn handle_wrong_method_entry(&self) -> u64 {
        self.handle_wrong_method.code_begin()
    }

    pub fn deopt_blob(&self) -> &Arc<CodeBlob> {
        &self.deopt_blob
    }

    pub fn uncommon_trap_blob(&self) -> &Arc<CodeBlob> {
        &self.uncommon_trap_blob
    }
}

fn generate_interpreter(abi: &'static Abi) -> NewBlob {
    let mut m = MacroAssembler::new(abi);
    let mut entry = |m: &mut MacroAssembler, h: Halt| {
        let off = m.offset();
        m.emit(Inst::Halt(h));
        off
    };
    let entries = InterpreterEntries {
        method_entry: entry(&mut m, Halt::InterpreterEntry),
        continue_after: entry(&mut m, Halt::ContinueAfter),
        reexecute: entry(&mut m, Halt::Reexecute),
        rethrow: entry(&mut m, Halt::RethrowException),
        return_entry: entry(&mut m, Halt::InterpreterReturn),
    };
    NewBlob::new("interpreter", BlobKind::Interpreter(entries), m.finish())
}

/// The call stub is entered, as if called from native code, with the address of an argument block
/// in the first native argument register. It pushes the parameters the way the interpreter
/// expects them and calls the method's interpreted entry, which reaches compiled code through the
/// i2c adapter if there is any.
fn generate_call_stub(abi: &'static Abi) -> NewBlob {
    let mut m = MacroAssembler::new(abi);
    let saved = call_stub_saved_regs(abi);
    let blk = abi.saved[0];
    let count = abi.scratch;
    let params = abi.scratch2;

    m.enter();
    for &r in &saved {
        m.push(r);
    }
    m.push(abi.c_int_args[0]);
    // Everything pushed so far, below the saved frame pointer.
    let pushed = call_stub_block_slot(abi);
    let pad = pushed % abi.stack_alignment;
    m.sub_imm(abi.sp, pad as i64);
    let frame_complete = m.offset();
    m.mov(blk, abi.c_int_args[0]);

    m.comment("push parameters");
    let done = m.new_label();
    let lp = m.new_label();
    m.load(count, at(blk, CALL_PARAM_COUNT));
    m.load(params, at(blk, CALL_PARAMS));
    m.cmp_imm(count, 0);
    m.jcc(Cond::Eq, done);
    m.bind(lp);
    m.emit(Inst::PushMem(at(params, 0)));
    m.add_imm(params, WORD as i64);
    m.add_imm(count, -1);
    m.jcc(Cond::Ne, lp);
    m.bind(done);

    m.load(abi.method_reg, at(blk, CALL_METHOD));
    m.mov(abi.sender_sp_reg, abi.sp);
    m.emit(Inst::LoadMethod {
        dst: abi.scratch,
        method: abi.method_reg,
        field: MethodField::FromInterpretedEntry,
    });
    m.call(CallTarget::Reg(abi.scratch));
    let return_offset = m.offset();

    m.comment("store the result and return to the host");
    m.lea(abi.sp, at(abi.fp, -((pushed + pad) as i64)));
    m.load(abi.scratch, at(abi.fp, -(pushed as i64)));
    m.store(at(abi.scratch, CALL_RESULT), abi.ret);
    m.fstore(at(abi.scratch, CALL_FRESULT), abi.fret, Width::W64);
    m.add_imm(abi.sp, (pad + WORD) as i64);
    for &r in saved.iter().rev() {
        m.pop(r);
    }
    m.leave();
    m.emit(Inst::Halt(Halt::ReturnToHost));

    let mut nb = NewBlob::new(
        "call_stub",
        BlobKind::CallStub { return_offset },
        m.finish(),
    );
    nb.frame_complete = Some(frame_complete);
    nb
}

fn call_stub_saved_regs(abi: &Abi) -> Vec<Reg> {
    abi.c_callee_saved
        .iter()
        .copied()
        .filter(|r| *r != abi.fp)
        .collect()
}

/// How far below the call stub's frame pointer the argument block's address is saved.
fn call_stub_block_slot(abi: &Abi) -> u64 {
    (call_stub_saved_regs(abi).len() as u64 + 1) * WORD
}

/// The anchor that was current when the entry frame whose frame pointer is `fp` was entered, or
/// `None` if the block can't be read.
pub(crate) fn entry_frame_anchor(mem: &Memory, abi: &Abi, fp: u64) -> Option<FrameAnchor> {
    let block = mem.try_read_u64(fp.checked_sub(call_stub_block_slot(abi))?)?;
    if !mem.is_mapped(block) || !mem.is_mapped(block + CALL_BLOCK_BYTES - WORD) {
        return None;
    }
    Some(FrameAnchor {
        last_sp: mem.try_read_u64(block + CALL_ANCHOR_SP as u64)?,
        last_fp: mem.try_read_u64(block + CALL_ANCHOR_FP as u64)?,
        last_pc: mem.try_read_u64(block + CALL_ANCHOR_PC as u64)?,
    })
}

/// Entered by a jump with the stack pointer at the return address of the frame that left an
/// exception pending. If that frame was called from the call stub the exception is left pending
/// for the host; otherwise it is moved to the result registers (exception and throwing pc) and the
/// interpreter's exception dispatch takes over.
fn generate_forward_exception(abi: &'static Abi, call_stub_return: u64) -> NewBlob {
    let mut m = MacroAssembler::new(abi);
    let not_host = m.new_label();
    m.load(abi.scratch, at(abi.sp, 0));
    m.mov_imm(abi.scratch2, call_stub_return);
    m.emit(Inst::Cmp {
        a: abi.scratch,
        b: abi.scratch2,
    });
    m.jcc(Cond::Ne, not_host);
    m.add_imm(abi.sp, WORD as i64);
    m.emit(Inst::JmpAbs(call_stub_return));
    m.bind(not_host);
    m.emit(Inst::LoadThread {
        dst: abi.ret,
        field: ThreadField::PendingException,
    });
    m.emit(Inst::StoreThreadImm {
        field: ThreadField::PendingException,
        imm: 0,
    });
    m.pop(abi.ret2);
    m.emit(Inst::Halt(Halt::ForwardException));
    NewBlob::new("forward_exception", BlobKind::RuntimeStub, m.finish())
}

/// Called from a safepoint poll in compiled code. Every register is saved so that the frame of
/// the polling code can be walked (and its register-held values found) while the thread blocks.
fn generate_safepoint_handler(
    abi: &'static Abi,
    options: &Options,
    forward_exception: u64,
) -> NewBlob {
    let layout = RegSaveLayout::new(abi, options.save_wide_vectors);
    let mut m = MacroAssembler::new(abi);
    let map = layout.save(&mut m);
    let frame_complete = m.offset();
    m.set_last_java_frame(None, None, None);
    m.call_runtime(RuntimeEntry::HandlePollingPage);
    let mut nb_maps = drtmap::OopMapSet::new();
    nb_maps.add_gc_map(m.offset(), map);
    m.reset_last_java_frame(false);

    let pending = m.new_label();
    m.emit(Inst::LoadThread {
        dst: abi.scratch,
        field: ThreadField::PendingException,
    });
    m.cmp_imm(abi.scratch, 0);
    m.jcc(Cond::Ne, pending);
    layout.restore(&mut m);
    m.ret();

    m.bind(pending);
    layout.restore(&mut m);
    m.emit(Inst::JmpAbs(forward_exception));

    let mut nb = NewBlob::new("safepoint_handler", BlobKind::RuntimeStub, m.finish());
    nb.frame_size = layout.frame_words();
    nb.frame_complete = Some(frame_complete);
    nb.oop_maps = nb_maps;
    nb
}

/// Entered by the jump patched over the verified entry of code that is not entrant, with the
/// call's arguments in place and the caller's return address on top of the stack. The runtime
/// picks the entry the call should take now; every register is put back before jumping there.
fn generate_handle_wrong_method(abi: &'static Abi, options: &Options) -> NewBlob {
    let layout = RegSaveLayout::new(abi, options.save_wide_vectors);
    let mut m = MacroAssembler::new(abi);
    let map = layout.save(&mut m);
    let frame_complete = m.offset();
    m.set_last_java_frame(None, None, None);
    m.mov(abi.c_int_args[0], abi.method_reg);
    m.load(abi.c_int_args[1], at(abi.sp, layout.return_offset() as i64));
    m.call_runtime(RuntimeEntry::HandleWrongMethod);
    let mut maps = drtmap::OopMapSet::new();
    maps.add_gc_map(m.offset(), map);
    m.reset_last_java_frame(false);
    // Restoring the scratch register picks up the new entry.
    m.store(at(abi.sp, layout.gp_offset(abi.scratch) as i64), abi.ret);
    layout.restore(&mut m);
    m.emit(Inst::JmpReg(abi.scratch));

    let mut nb = NewBlob::new("handle_wrong_method", BlobKind::RuntimeStub, m.finish());
    nb.frame_size = layout.frame_words();
    nb.frame_complete = Some(frame_complete);
    nb.oop_maps = maps;
    nb
}

/// How a call into managed code ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallOutcome {
    /// The method returned. Float results are returned as their bits; `Void` methods return 0.
    Returned(u64),
    /// The method threw. The exception is still pending on the thread.
    Threw(u64),
    /// Control left the subsystem some other way, e.g. by reaching the interpreter. The machine
    /// is left at the halt.
    Halted(Halt),
}

/// A call into managed code through the call stub, which may be run to completion in several
/// steps (e.g. when the test harness plays the interpreter's part).
pub struct ManagedCall {
    block: u64,
    ret: BasicType,
    saved_cpu: crate::masm::sim::Cpu,
    saved_anchor: FrameAnchor,
    saved_state: ThreadState,
    /// The caller's handle block. The callee gets a fresh one, so that natives it calls can't
    /// reuse (and their wrappers can't release) the caller's local handles.
    saved_handles: u64,
}

impl ManagedCall {
    /// Set `m` up to call `method` with `args` (one per parameter, receiver first, 64-bit values
    /// in a single word) and point it at the call stub. Nothing is run.
    pub fn begin(m: &mut Machine<'_>, method: MethodId, args: &[u64]) -> Self {
        let rt = Arc::clone(m.rt());
        let abi = rt.abi();
        let method = rt.method(method);
        let sig = method.sig_bt();
        let declared = sig.iter().filter(|t| **t != BasicType::Void).count();
        assert_eq!(
            args.len(),
            declared,
            "{} takes {declared} arguments, not {}",
            method.name,
            args.len()
        );
        // In interpreter order: a 64-bit value lives in the second (lower addressed) of its two
        // slots.
        let mut slots = Vec::with_capacity(sig.len());
        for (t, v) in sig.iter().filter(|t| **t != BasicType::Void).zip(args) {
            if t.is_double_word() {
                slots.push(0);
            }
            slots.push(*v);
        }

        let block = rt.mem.malloc(CALL_BLOCK_BYTES + slots.len() as u64 * WORD);
        rt.mem
            .write_u64(block + CALL_METHOD as u64, method.id.to_word());
        rt.mem
            .write_u64(block + CALL_PARAMS as u64, block + CALL_BLOCK_BYTES);
        rt.mem
            .write_u64(block + CALL_PARAM_COUNT as u64, slots.len() as u64);
        rt.mem.write_words(block + CALL_BLOCK_BYTES, &slots);

        let saved_cpu = m.cpu.clone();
        m.thread.make_walkable();
        let saved_anchor = mem::take(&mut m.thread.anchor);
        rt.mem.write_words(
            block + CALL_ANCHOR_SP as u64,
            &[
                saved_anchor.last_sp,
                saved_anchor.last_fp,
                saved_anchor.last_pc,
            ],
        );
        let saved_state = m.thread.shared.state();
        m.thread.shared.set_state(ThreadState::InJava);
        let saved_handles = mem::replace(
            &mut m.thread.active_handles,
            rt.mem.malloc(HANDLE_BLOCK_BYTES),
        );

        let sp = match m.sp() {
            0 => m.thread.stack_top(),
            sp => sp,
        };
        m.set_reg(abi.sp, sp & !(abi.stack_alignment - 1));
        // Stands in for the host's return address.
        m.push(0);
        m.set_reg(abi.c_int_args[0], block);
        m.cpu.pc = rt.stubs().call_stub_entry();
        Self {
            block,
            ret: method.ret,
            saved_cpu,
            saved_anchor,
            saved_state,
            saved_handles,
        }
    }

    /// Finish a call whose last run of `m` ended with `h`. Unless `h` is the call stub's return
    /// to the host, the machine is left as it is.
    pub fn finish(self, m: &mut Machine<'_>, h: Halt) -> CallOutcome {
        if h != Halt::ReturnToHost {
            return CallOutcome::Halted(h);
        }
        let rt = Arc::clone(m.rt());
        let v = match self.ret {
            BasicType::Void => 0,
            t if t.is_float() => rt.mem.read_u64(self.block + CALL_FRESULT as u64),
            _ => rt.mem.read_u64(self.block + CALL_RESULT as u64),
        };
        rt.mem.free(self.block);
        rt.mem.free(mem::replace(&mut m.thread.active_handles, self.saved_handles));
        m.cpu = self.saved_cpu;
        m.thread.anchor = self.saved_anchor;
        m.thread.shared.set_state(self.saved_state);
        match m.thread.pending_exception {
            0 => CallOutcome::Returned(v),
            exc => CallOutcome::Threw(exc),
        }
    }
}

/// Call `method` from the host (or from native code) and run it to completion.
pub fn call_managed(m: &mut Machine<'_>, method: MethodId, args: &[u64]) -> CallOutcome {
    let c = ManagedCall::begin(m, method, args);
    let h = m.run();
    c.finish(m, h)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{abi::x64::*, method::NewMethod, testing::TestRuntime};
    use BasicType::*;

    #[test]
    fn interpreter_entries_halt() {
        let t = TestRuntime::new();
        let s = t.rt.stubs();
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(mc.run_from(s.interpreter_entry()), Halt::InterpreterEntry);
        assert_eq!(
            mc.run_from(s.interpreter_continue_after()),
            Halt::ContinueAfter
        );
        assert_eq!(mc.run_from(s.interpreter_reexecute()), Halt::Reexecute);
        assert_eq!(mc.run_from(s.interpreter_rethrow()), Halt::RethrowException);
        assert_eq!(mc.run_from(s.interpreter_return()), Halt::InterpreterReturn);
        assert!(s.interpreter().is_interpreter());
    }

    #[test]
    fn call_into_the_interpreter() {
        let t = TestRuntime::new();
        let k = t.rt.define_class("K", 0);
        let m = t
            .rt
            .add_method(NewMethod::new("f", k, &[Int, Long, Double], Long).static_method())
            .unwrap();
        let mut thread = t.thread();
        let live = t.rt.mem.c_heap_live();
        let mut mc = Machine::new(&mut thread);
        mc.set_reg(RBX, 0x5151);
        let c = ManagedCall::begin(&mut mc, m.id, &[7, 8, 9]);
        assert_eq!(mc.run(), Halt::InterpreterEntry);
        assert_eq!(mc.thread.shared.state(), ThreadState::InJava);
        assert_eq!(mc.reg(RBX), m.id.to_word());
        // The interpreter sees its parameters above the return address, first parameter highest,
        // each 64-bit value in the lower of its two slots.
        let sp = mc.sp();
        assert_eq!(mc.reg(R13), sp + 8);
        assert_eq!(t.rt.mem.read_words(sp + 8, 5), vec![9, 0, 8, 0, 7]);
        crate::testing::interpreter_return(&mut mc, 42);
        let h = mc.run();
        assert_eq!(c.finish(&mut mc, h), CallOutcome::Returned(42));
        // The caller's state is back.
        assert_eq!(mc.reg(RBX), 0x5151);
        assert_eq!(mc.thread.shared.state(), ThreadState::New);
        assert_eq!(t.rt.mem.c_heap_live(), live);
    }

    #[test]
    fn compiled_callee_through_i2c() {
        let t = TestRuntime::new();
        let (m, _) = t.trivial_nmethod("seven", 7);
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(
            call_managed(&mut mc, m.id, &[0]),
            CallOutcome::Returned(7)
        );
    }

    #[test]
    fn pending_exception_reaches_the_host() {
        let t = TestRuntime::new();
        let (m, _) = t.throwing_nmethod("thrower", 0xe0);
        let mut thread = t.thread();
        let mut mc = Machine::new(&mut thread);
        assert_eq!(call_managed(&mut mc, m.id, &[0]), CallOutcome::Threw(0xe0));
        assert_eq!(thread.pending_exception, 0xe0);
    }

    #[test]
    fn call_stub_listing() {
        let t = TestRuntime::new();
        let b = t.rt.stubs().call_stub();
        let ptn = "...
  ...: push rdi
...
L1:
  ...: push [r11]
  ...: add r11, 8
  ...: add r10, -1
  ...: jne L1
...
  ...: call r10
  ...: ; store the result and return to the host
  ...: lea rsp, [rbp-0x30]
...
  ...: halt ReturnToHost
";
        fm::FMBuilder::new(ptn)
            .unwrap()
            .build()
            .unwrap()
            .matches(&crate::masm::disassemble(t.rt.abi(), b.code()))
            .unwrap();
    }
}
