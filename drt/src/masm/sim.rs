//! Running generated code.
//!
//! A [Machine] executes the instructions of installed code blobs on behalf of one thread, over the
//! runtime's shared [crate::mem::Memory]. Calls into the runtime and into native functions are
//! made the way a real call instruction would: the stack must be aligned at the call, a return
//! address is pushed for the duration of the call, and on return every register the native
//! convention lets a callee clobber holds junk (apart from the result registers).

use super::{Addr, CallTarget, Cond, Halt, Inst, Width, INST_SIZE};
use crate::{
    abi::{Abi, BasicType, FReg, Reg, WORD},
    codecache::CodeBlob,
    method::MethodId,
    native, runtime,
    runtime::Runtime,
    thread::ThreadContext,
};
use std::sync::Arc;

/// The value clobbered registers hold after a native or runtime call.
pub const POISON: u64 = 0xbaad_f00d_baad_0000;

/// Runs longer than this are assumed to be stuck in a loop.
const MAX_STEPS: u64 = 50_000_000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Flags {
    pub eq: bool,
    /// Signed less than.
    pub lt: bool,
    /// Unsigned less than.
    pub below: bool,
}

impl Flags {
    fn compare(a: u64, b: u64) -> Self {
        Self {
            eq: a == b,
            lt: (a as i64) < (b as i64),
            below: a < b,
        }
    }

    fn result(v: u64) -> Self {
        Self {
            eq: v == 0,
            lt: (v as i64) < 0,
            below: false,
        }
    }

    fn holds(&self, c: Cond) -> bool {
        match c {
            Cond::Eq => self.eq,
            Cond::Ne => !self.eq,
            Cond::Lt => self.lt,
            Cond::Ge => !self.lt,
            Cond::Le => self.lt || self.eq,
            Cond::Gt => !self.lt && !self.eq,
            Cond::Below => self.below,
            Cond::AboveEq => !self.below,
            Cond::Above => !self.below && !self.eq,
            Cond::BelowEq => self.below || self.eq,
        }
    }

    fn to_word(self) -> u64 {
        u64::from(self.eq) | u64::from(self.lt) << 1 | u64::from(self.below) << 2
    }

    fn from_word(w: u64) -> Self {
        Self {
            eq: w & 1 != 0,
            lt: w & 2 != 0,
            below: w & 4 != 0,
        }
    }
}

/// The register file.
#[derive(Clone, Debug)]
pub struct Cpu {
    pub gp: [u64; 16],
    /// The low 64 bits of each float register.
    pub fp: [u64; 16],
    /// The upper lanes of each vector register, folded into one word.
    pub vhi: [u64; 16],
    pub flags: Flags,
    pub pc: u64,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            gp: [0; 16],
            fp: [0; 16],
            vhi: [0; 16],
            flags: Flags::default(),
            pc: 0,
        }
    }

    pub fn reg(&self, r: Reg) -> u64 {
        self.gp[usize::from(r.0)]
    }

    pub fn set_reg(&mut self, r: Reg, v: u64) {
        self.gp[usize::from(r.0)] = v;
    }

    pub fn freg(&self, r: FReg) -> u64 {
        self.fp[usize::from(r.0)]
    }

    pub fn set_freg(&mut self, r: FReg, v: u64) {
        self.fp[usize::from(r.0)] = v;
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Machine<'t> {
    pub cpu: Cpu,
    pub thread: &'t mut ThreadContext,
    rt: Arc<Runtime>,
    abi: &'static Abi,
    /// The blob containing the current pc, cached across steps.
    blob: Option<Arc<CodeBlob>>,
}

impl<'t> Machine<'t> {
    pub fn new(thread: &'t mut ThreadContext) -> Self {
        let rt = Arc::clone(&thread.rt);
        let abi = rt.abi();
        Self {
            cpu: Cpu::new(),
            thread,
            rt,
            abi,
            blob: None,
        }
    }

    pub fn rt(&self) -> &Arc<Runtime> {
        &self.rt
    }

    pub fn abi(&self) -> &'static Abi {
        self.abi
    }

    pub fn reg(&self, r: Reg) -> u64 {
        self.cpu.reg(r)
    }

    pub fn set_reg(&mut self, r: Reg, v: u64) {
        self.cpu.set_reg(r, v)
    }

    pub fn sp(&self) -> u64 {
        self.cpu.reg(self.abi.sp)
    }

    pub fn push(&mut self, v: u64) {
        let sp = self.sp() - WORD;
        self.rt.mem.write_u64(sp, v);
        self.cpu.set_reg(self.abi.sp, sp);
    }

    pub fn pop(&mut self) -> u64 {
        let sp = self.sp();
        let v = self.rt.mem.read_u64(sp);
        self.cpu.set_reg(self.abi.sp, sp + WORD);
        v
    }

    fn ea(&self, a: &Addr) -> u64 {
        self.cpu.reg(a.base).wrapping_add(a.disp as u64)
    }

    fn load(&self, a: &Addr, w: Width) -> u64 {
        let addr = self.ea(a);
        match w {
            Width::W32 => u64::from(self.rt.mem.read_u32(addr)),
            Width::W64 => self.rt.mem.read_u64(addr),
        }
    }

    fn store(&self, a: &Addr, w: Width, v: u64) {
        let addr = self.ea(a);
        match w {
            Width::W32 => self.rt.mem.write_u32(addr, v as u32),
            Width::W64 => self.rt.mem.write_u64(addr, v),
        }
    }

    fn blob_at(&mut self, pc: u64) -> Arc<CodeBlob> {
        if let Some(b) = &self.blob {
            if b.contains(pc) {
                return Arc::clone(b);
            }
        }
        match self.rt.code_cache.find_blob(pc) {
            Some(b) => {
                self.blob = Some(Arc::clone(&b));
                b
            }
            None => panic!("control transferred to {pc:#x}, which is not in the code cache"),
        }
    }

    /// Run from `pc` until a [Halt] instruction is reached.
    pub fn run_from(&mut self, pc: u64) -> Halt {
        self.cpu.pc = pc;
        self.run()
    }

    /// Run from the current pc until a [Halt] instruction is reached. The pc is left pointing at
    /// the halt.
    pub fn run(&mut self) -> Halt {
        for _ in 0..MAX_STEPS {
            let pc = self.cpu.pc;
            if pc % INST_SIZE != 0 {
                panic!("misaligned pc {pc:#x}");
            }
            let blob = self.blob_at(pc);
            if let Some(to) = blob.entry_jump_at(pc) {
                self.cpu.pc = to;
                continue;
            }
            let idx = ((pc - blob.code_begin()) / INST_SIZE) as usize;
            if let Some(h) = self.step(&blob, &blob.code().insts[idx]) {
                return h;
            }
        }
        panic!("generated code ran for more than {MAX_STEPS} steps");
    }

    fn check_call_alignment(&self, what: &str) {
        let sp = self.sp();
        if sp % self.abi.stack_alignment != 0 {
            panic!("misaligned stack pointer {sp:#x} at call to {what}");
        }
    }

    /// Clobber every register a native callee need not preserve.
    fn poison_caller_saved(&mut self) {
        let abi = self.abi;
        for r in abi.c_caller_saved() {
            self.cpu.set_reg(r, POISON | u64::from(r.0));
        }
        for r in abi.c_caller_saved_fp() {
            self.cpu.set_freg(r, POISON | 0x100 | u64::from(r.0));
            self.cpu.vhi[usize::from(r.0)] = POISON | 0x200 | u64::from(r.0);
        }
    }

    fn step(&mut self, blob: &CodeBlob, inst: &Inst) -> Option<Halt> {
        let pc = self.cpu.pc;
        let mut next = pc + INST_SIZE;
        let abi = self.abi;
        match inst {
            Inst::Comment(_) => (),
            Inst::Mov { dst, src } => self.cpu.set_reg(*dst, self.cpu.reg(*src)),
            Inst::MovImm { dst, imm } => self.cpu.set_reg(*dst, *imm),
            Inst::Load { dst, addr, width } => {
                let v = self.load(addr, *width);
                self.cpu.set_reg(*dst, v);
            }
            Inst::Store { src, addr, width } => self.store(addr, *width, self.cpu.reg(*src)),
            Inst::StoreImm { imm, addr, width } => self.store(addr, *width, *imm),
            Inst::FLoad { dst, addr, width } => {
                let v = self.load(addr, *width);
                self.cpu.set_freg(*dst, v);
            }
            Inst::FStore { src, addr, width } => self.store(addr, *width, self.cpu.freg(*src)),
            Inst::FMov { dst, src } => self.cpu.set_freg(*dst, self.cpu.freg(*src)),
            Inst::VStoreHi { src, addr } => {
                self.store(addr, Width::W64, self.cpu.vhi[usize::from(src.0)])
            }
            Inst::VLoadHi { dst, addr } => {
                let v = self.load(addr, Width::W64);
                self.cpu.vhi[usize::from(dst.0)] = v;
            }
            Inst::Lea { dst, addr } => self.cpu.set_reg(*dst, self.ea(addr)),
            Inst::LeaLabel { dst, label } => {
                self.cpu
                    .set_reg(*dst, blob.code_begin() + u64::from(blob.code().label_offset(*label)))
            }
            Inst::Push(r) => self.push(self.cpu.reg(*r)),
            Inst::PushImm(v) => self.push(*v),
            Inst::PushMem(a) => {
                let v = self.load(a, Width::W64);
                self.push(v);
            }
            Inst::Pop(r) => {
                let v = self.pop();
                self.cpu.set_reg(*r, v);
            }
            Inst::PushFlags => self.push(self.cpu.flags.to_word()),
            Inst::PopFlags => {
                let w = self.pop();
                self.cpu.flags = Flags::from_word(w);
            }
            Inst::AddImm { dst, imm } => {
                let v = self.cpu.reg(*dst).wrapping_add(*imm as u64);
                self.cpu.set_reg(*dst, v);
                self.cpu.flags = Flags::result(v);
            }
            Inst::Add { dst, src } => {
                let v = self.cpu.reg(*dst).wrapping_add(self.cpu.reg(*src));
                self.cpu.set_reg(*dst, v);
                self.cpu.flags = Flags::result(v);
            }
            Inst::Sub { dst, src } => {
                let v = self.cpu.reg(*dst).wrapping_sub(self.cpu.reg(*src));
                self.cpu.set_reg(*dst, v);
                self.cpu.flags = Flags::result(v);
            }
            Inst::AndImm { dst, imm } => {
                let v = self.cpu.reg(*dst) & (*imm as u64);
                self.cpu.set_reg(*dst, v);
                self.cpu.flags = Flags::result(v);
            }
            Inst::OrImm { dst, imm } => {
                let v = self.cpu.reg(*dst) | *imm;
                self.cpu.set_reg(*dst, v);
                self.cpu.flags = Flags::result(v);
            }
            Inst::Normalize { dst, ty } => {
                let v = self.cpu.reg(*dst);
                let v = match ty {
                    BasicType::Boolean => u64::from(v & 0xff != 0),
                    BasicType::Char => v & 0xffff,
                    BasicType::Byte => v as i8 as i64 as u64,
                    BasicType::Short => v as i16 as i64 as u64,
                    BasicType::Int => v as i32 as i64 as u64,
                    _ => v,
                };
                self.cpu.set_reg(*dst, v);
            }
            Inst::Cmp { a, b } => {
                self.cpu.flags = Flags::compare(self.cpu.reg(*a), self.cpu.reg(*b));
            }
            Inst::CmpImm { a, imm } => {
                self.cpu.flags = Flags::compare(self.cpu.reg(*a), *imm as u64);
            }
            Inst::CmpMem { addr, imm, width } => {
                let v = self.load(addr, *width);
                let imm = match width {
                    Width::W32 => u64::from(*imm as u32),
                    Width::W64 => *imm as u64,
                };
                self.cpu.flags = Flags::compare(v, imm);
            }
            Inst::Jmp(l) => next = blob.label_addr(*l),
            Inst::Jcc(c, l) => {
                if self.cpu.flags.holds(*c) {
                    next = blob.label_addr(*l);
                }
            }
            Inst::JmpReg(r) => next = self.cpu.reg(*r),
            Inst::JmpAbs(a) => next = *a,
            Inst::Call(t) => {
                let target = match t {
                    CallTarget::Abs(a) => *a,
                    CallTarget::Reg(r) => self.cpu.reg(*r),
                    CallTarget::Site(i) => blob.call_site_target(*i),
                };
                self.push(next);
                next = target;
            }
            Inst::Ret => next = self.pop(),
            Inst::Enter => {
                self.push(self.cpu.reg(abi.fp));
                self.cpu.set_reg(abi.fp, self.sp());
            }
            Inst::Leave => {
                self.cpu.set_reg(abi.sp, self.cpu.reg(abi.fp));
                let fp = self.pop();
                self.cpu.set_reg(abi.fp, fp);
            }
            Inst::CmpXchg { addr, new } => {
                let a = self.ea(addr);
                let expected = self.cpu.reg(abi.ret);
                match self.rt.mem.cmpxchg_u64(a, expected, self.cpu.reg(*new)) {
                    Ok(_) => self.cpu.flags = Flags::compare(0, 0),
                    Err(cur) => {
                        self.cpu.set_reg(abi.ret, cur);
                        self.cpu.flags = Flags::compare(cur, expected);
                    }
                }
            }
            Inst::Fence => std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst),
            Inst::LoadThread { dst, field } => {
                let v = self.thread.field(*field);
                self.cpu.set_reg(*dst, v);
            }
            Inst::StoreThread { field, src } => self.thread.set_field(*field, self.cpu.reg(*src)),
            Inst::StoreThreadImm { field, imm } => self.thread.set_field(*field, *imm),
            Inst::SetThreadState(s) => self.thread.shared.set_state(*s),
            Inst::SafepointPoll { slow } => {
                if self.rt.safepoints.poll(&self.thread.shared) {
                    next = blob.label_addr(*slow);
                }
            }
            Inst::LoadMethod { dst, method, field } => {
                let w = self.cpu.reg(*method);
                let id = MethodId::from_word(w)
                    .unwrap_or_else(|| panic!("{w:#x} is not a method ({})", blob.name()));
                let v = self.rt.methods.get(id).field(*field);
                self.cpu.set_reg(*dst, v);
            }
            Inst::CallRuntime(e) => {
                self.check_call_alignment(&e.to_string());
                self.push(next);
                let r = runtime::call_runtime(self, *e);
                self.poison_caller_saved();
                if let Some(v) = r {
                    self.cpu.set_reg(abi.ret, v);
                }
                next = self.pop();
            }
            Inst::CallNative(id) => {
                self.check_call_alignment("native code");
                let args_base = self.sp();
                self.push(next);
                let (ret_ty, v) = native::invoke(self, *id, args_base);
                self.pop();
                self.poison_caller_saved();
                if ret_ty.is_float() {
                    self.cpu.set_freg(abi.fret, v);
                } else if ret_ty != BasicType::Void {
                    self.cpu.set_reg(abi.ret, v);
                }
            }
            Inst::BangStack { offset } => self.rt.mem.bang(self.sp() - offset),
            Inst::BangStackSize { size } => {
                let page = page_size::get() as u64;
                let mut tmp = self.sp();
                let mut left = self.cpu.reg(*size) as i64;
                loop {
                    self.rt.mem.bang(tmp - page);
                    tmp -= page;
                    left -= page as i64;
                    if left <= 0 {
                        break;
                    }
                }
                for i in 1..self.rt.options().stack_shadow_pages {
                    self.rt.mem.bang(tmp - i * page);
                }
                self.cpu.set_reg(*size, left as u64);
            }
            Inst::Stop(msg) => panic!(
                "{msg} (in {} at +{:#x})",
                blob.name(),
                pc - blob.code_begin()
            ),
            Inst::Halt(h) => return Some(*h),
        }
        self.cpu.pc = next;
        None
    }
}
