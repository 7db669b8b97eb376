//! Fixtures for tests: a runtime with every check turned on, and a way to hand-assemble compiled
//! methods with the debug information the deoptimizer and the stack walker need.

use crate::{
    abi::{x64::X64_SYSV, Abi, BasicType, WORD},
    codecache::{BlobKind, CodeBlob, DeoptEntries, NewBlob, NmethodInfo},
    deopt::scope::PcDesc,
    frame::interp::{LINK_OFFSET, RETURN_PC_OFFSET, SENDER_SP_OFFSET},
    masm::{sim::Machine, Halt, Inst, MacroAssembler},
    method::{Method, NewMethod},
    runtime::{Runtime, RuntimeBuilder},
    thread::{ThreadContext, ThreadField},
    Verbosity,
};
use drtmap::{Location, OopMap, OopMapSet};
use std::sync::Arc;

pub struct TestRuntime {
    pub rt: Arc<Runtime>,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::with_abi(&X64_SYSV)
    }

    pub fn with_abi(abi: &'static Abi) -> Self {
        let rt = RuntimeBuilder::new()
            .abi(abi)
            .verify_adapter_calls(true)
            .verify_stack_bang(true)
            .save_wide_vectors(false)
            .check_no_pending_exception(true)
            .log_level(Verbosity::Disabled)
            .build()
            .unwrap();
        Self { rt }
    }

    pub fn thread(&self) -> ThreadContext {
        self.rt.new_thread()
    }

    /// Install the code assembled in `m` with a frame of `frame_size` words. Everything but an
    /// adapter is treated as having a complete frame from its first instruction.
    pub fn install(
        &self,
        kind: BlobKind,
        name: &str,
        m: MacroAssembler,
        frame_size: u32,
    ) -> Arc<CodeBlob> {
        let adapter = matches!(kind, BlobKind::Adapter);
        let mut nb = NewBlob::new(name, kind, m.finish());
        nb.frame_size = frame_size;
        if !adapter {
            nb.frame_complete = Some(0);
        }
        self.rt.install(nb).unwrap()
    }

    /// A frameless stub that halts with `Marker(n)` and then returns. Resume it with
    /// [resume_after_halt].
    pub fn marker_stub(&self, n: u32) -> Arc<CodeBlob> {
        let mut m = MacroAssembler::new(self.rt.abi());
        m.emit(Inst::Halt(Halt::Marker(n)));
        m.ret();
        self.install(BlobKind::RuntimeStub, &format!("marker{n}"), m, 0)
    }

    pub fn deopt_entries(&self) -> DeoptEntries {
        match self.rt.stubs().deopt_blob().kind() {
            BlobKind::Deopt(e) => *e,
            k => unreachable!("deopt blob of kind {k:?}"),
        }
    }

    /// A compiled, non-static, parameterless method `name` that returns `v`.
    pub fn trivial_nmethod(&self, name: &str, v: u64) -> (Arc<Method>, Arc<CodeBlob>) {
        let abi = self.rt.abi();
        let k = self.rt.define_class(name, 0);
        let method = self
            .rt
            .add_method(NewMethod::new(name, k, &[], BasicType::Int))
            .unwrap();
        let mut b = NmethodBuilder::new(self, &method, 4);
        b.m.mov_imm(abi.ret, v);
        b.ret();
        let blob = b.finish();
        (method, blob)
    }

    /// A compiled, non-static, parameterless method `name` that throws `exc`.
    pub fn throwing_nmethod(&self, name: &str, exc: u64) -> (Arc<Method>, Arc<CodeBlob>) {
        let abi = self.rt.abi();
        let k = self.rt.define_class(name, 0);
        let method = self
            .rt
            .add_method(NewMethod::new(name, k, &[], BasicType::Int))
            .unwrap();
        let mut b = NmethodBuilder::new(self, &method, 4);
        b.m.mov_imm(abi.scratch, exc);
        b.m.emit(Inst::StoreThread {
            field: ThreadField::PendingException,
            src: abi.scratch,
        });
        b.m.leave();
        b.m.emit(Inst::JmpAbs(self.rt.stubs().forward_exception_entry()));
        let blob = b.finish();
        (method, blob)
    }
}

/// Carry on from the instruction after the halt `m` stopped at.
pub fn resume_after_halt(m: &mut Machine<'_>) -> Halt {
    m.cpu.pc += crate::masm::INST_SIZE;
    m.run()
}

/// Return `v` from the interpreted activation `m` has just entered, as the interpreter would.
pub fn interpreter_return(m: &mut Machine<'_>, v: u64) {
    let abi = m.abi();
    let ra = m.pop();
    let sender_sp = m.reg(abi.sender_sp_reg);
    m.set_reg(abi.sp, sender_sp);
    m.set_reg(abi.ret, v);
    m.cpu.pc = ra;
}

/// Return `v` from the interpreter frame `m` is stopped in, as the interpreter would.
pub fn interpreter_frame_return(m: &mut Machine<'_>, v: u64) {
    let abi = m.abi();
    let fp = m.reg(abi.fp);
    let (sender_sp, link, ra) = {
        let mem = &m.rt().mem;
        (
            mem.read_u64(slot(fp, SENDER_SP_OFFSET)),
            mem.read_u64(slot(fp, LINK_OFFSET)),
            mem.read_u64(slot(fp, RETURN_PC_OFFSET)),
        )
    };
    m.set_reg(abi.sp, sender_sp);
    m.set_reg(abi.fp, link);
    m.set_reg(abi.ret, v);
    m.cpu.pc = ra;
}

/// Pop every interpreter frame from the one `m` is stopped in up to the first frame that isn't
/// interpreted, and return into that frame, as the interpreter does when it unwinds an exception
/// with no handler.
pub fn interpreter_unwind(m: &mut Machine<'_>) {
    let rt = Arc::clone(m.rt());
    let interpreter = rt.stubs().interpreter();
    loop {
        interpreter_frame_return(m, 0);
        if !interpreter.contains(m.cpu.pc) {
            break;
        }
    }
}

fn slot(fp: u64, off: i64) -> u64 {
    fp.wrapping_add((off * WORD as i64) as u64)
}

/// Assembles the code of a compiled method.
///
/// The frame is `frame_words` words: the return address and saved frame pointer at the top, the
/// slot the deoptimizer saves the original pc in below them, and spill slots from the stack
/// pointer up. Outgoing stack arguments share the lowest spill slots.
pub struct NmethodBuilder<'a> {
    t: &'a TestRuntime,
    method: Arc<Method>,
    pub m: MacroAssembler,
    frame_words: u32,
    frame_complete: u32,
    pc_descs: Vec<PcDesc>,
    oop_maps: OopMapSet,
}

impl<'a> NmethodBuilder<'a> {
    pub fn new(t: &'a TestRuntime, method: &Arc<Method>, frame_words: u32) -> Self {
        assert!(
            frame_words >= 4 && frame_words % 2 == 0,
            "frame of {frame_words} words"
        );
        let abi = t.rt.abi();
        let mut m = MacroAssembler::new(abi);
        m.enter();
        m.sub_imm(abi.sp, i64::from(frame_words - 2) * WORD as i64);
        let frame_complete = m.offset();
        Self {
            t,
            method: Arc::clone(method),
            m,
            frame_words,
            frame_complete,
            pc_descs: Vec::new(),
            oop_maps: OopMapSet::new(),
        }
    }

    /// The location of spill word `i`.
    pub fn slot(&self, i: u32) -> Location {
        assert!(i < self.frame_words - 3, "spill slot {i} overlaps the frame's fixed slots");
        Location::stack(2 * i)
    }

    pub fn spill_imm(&mut self, i: u32, v: u64) {
        let off = self.slot(i).stack_offset() as i64;
        let sp = self.m.abi().sp;
        self.m.store_imm(crate::masm::at(sp, off), v);
    }

    /// Emit a call through a patchable call site to `target`. `pd` describes the frame at the
    /// return address and `oops` are the spill slots holding references across the call.
    /// Returns the return address's offset.
    pub fn call(&mut self, target: u64, mut pd: PcDesc, oops: &[Location]) -> u32 {
        self.m.call_site(target);
        let off = self.m.offset();
        let mut map = OopMap::new(self.frame_words * 2, 0);
        for &l in oops {
            map.set_oop(l);
        }
        self.oop_maps.add_gc_map(off, map);
        pd.pc_offset = off;
        self.pc_descs.push(pd);
        off
    }

    /// Pop the frame and return.
    pub fn ret(&mut self) {
        self.m.leave();
        self.m.ret();
    }

    /// Append the deopt handler and install the method's code.
    pub fn finish(self) -> Arc<CodeBlob> {
        let abi = self.m.abi();
        let unpack = {
            let d = self.t.rt.stubs().deopt_blob();
            d.addr(self.t.deopt_entries().unpack)
        };
        let mut m = self.m;
        let handler = m.offset();
        let l = m.here();
        m.emit(Inst::LeaLabel {
            dst: abi.scratch,
            label: l,
        });
        m.push(abi.scratch);
        m.emit(Inst::JmpAbs(unpack));

        let mut nm = NmethodInfo::new(self.method.id, 0);
        nm.deopt_handler = Some(handler);
        nm.orig_pc_offset = Some((self.frame_words - 3) * WORD as u32);
        nm.pc_descs = self.pc_descs;
        let mut nb = NewBlob::new(&self.method.name, BlobKind::Nmethod(nm), m.finish());
        nb.frame_size = self.frame_words;
        nb.frame_complete = Some(self.frame_complete);
        nb.oop_maps = self.oop_maps;
        self.t.rt.install(nb).unwrap()
    }
}
