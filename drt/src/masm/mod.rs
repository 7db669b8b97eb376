//! The macro assembler.
//!
//! Stubs are generated as sequences of [Inst]s for a small abstract register machine with the
//! register file, stack discipline and calling sequences of the platform described by an
//! [Abi]. Every instruction is [INST_SIZE] bytes, so a pc is simply
//! `code_begin + index * INST_SIZE`. Instructions are run by [sim::Machine].
//!
//! Jumps name [Label]s, which must all be bound before [MacroAssembler::finish] turns the
//! instructions into a [Code] that can be installed in the code cache.

use crate::{
    abi::{Abi, BasicType, FReg, Reg},
    method::MethodField,
    native::NativeId,
    runtime::RuntimeEntry,
    thread::{ThreadField, ThreadState},
};
use std::fmt::{self, Write};
use typed_index_collections::TiVec;

pub mod sim;

/// The size in bytes of every instruction.
pub const INST_SIZE: u64 = 4;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Label(usize);

impl From<usize> for Label {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<Label> for usize {
    fn from(v: Label) -> Self {
        v.0
    }
}

/// A memory operand: `[base + disp]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Addr {
    pub base: Reg,
    pub disp: i64,
}

/// Shorthand for `[base + disp]`.
pub fn at(base: Reg, disp: i64) -> Addr {
    Addr { base, disp }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Width {
    W32,
    W64,
}

impl Width {
    pub fn bytes(self) -> u64 {
        match self {
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Cond {
    Eq,
    Ne,
    /// Signed less than.
    Lt,
    Ge,
    Le,
    Gt,
    /// Unsigned less than.
    Below,
    AboveEq,
    Above,
    BelowEq,
}

impl Cond {
    fn suffix(self) -> &'static str {
        match self {
            Cond::Eq => "e",
            Cond::Ne => "ne",
            Cond::Lt => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::Gt => "g",
            Cond::Below => "b",
            Cond::AboveEq => "ae",
            Cond::Above => "a",
            Cond::BelowEq => "be",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallTarget {
    /// A fixed code address.
    Abs(u64),
    Reg(Reg),
    /// A patchable call site of the blob being assembled.
    Site(usize),
}

/// Why a [sim::Machine] stopped running.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Halt {
    /// Entry to a method in the interpreter.
    InterpreterEntry,
    /// The interpreter resumes after the call at the frame's bci.
    ContinueAfter,
    /// The interpreter re-executes the bytecode at the frame's bci.
    Reexecute,
    /// The interpreter rethrows the exception in the result register.
    RethrowException,
    /// A callee returned into an interpreted caller.
    InterpreterReturn,
    /// A pending exception is being forwarded to the caller.
    ForwardException,
    /// The outermost call stub returned.
    ReturnToHost,
    /// Entry to a compiled method body.
    CompiledEntry,
    /// A marker placed by hand-built code.
    Marker(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    Comment(String),
    Mov { dst: Reg, src: Reg },
    MovImm { dst: Reg, imm: u64 },
    /// Load, zero-extending narrower widths.
    Load { dst: Reg, addr: Addr, width: Width },
    Store { src: Reg, addr: Addr, width: Width },
    StoreImm { imm: u64, addr: Addr, width: Width },
    FLoad { dst: FReg, addr: Addr, width: Width },
    FStore { src: FReg, addr: Addr, width: Width },
    FMov { dst: FReg, src: FReg },
    /// Store the upper lanes of a vector register (everything above the scalar low 64 bits).
    VStoreHi { src: FReg, addr: Addr },
    VLoadHi { dst: FReg, addr: Addr },
    Lea { dst: Reg, addr: Addr },
    /// Load the address of a label of the current blob.
    LeaLabel { dst: Reg, label: Label },
    Push(Reg),
    PushImm(u64),
    PushMem(Addr),
    Pop(Reg),
    PushFlags,
    PopFlags,
    AddImm { dst: Reg, imm: i64 },
    Add { dst: Reg, src: Reg },
    Sub { dst: Reg, src: Reg },
    AndImm { dst: Reg, imm: i64 },
    OrImm { dst: Reg, imm: u64 },
    /// Bring a native result into its managed form (e.g. any non-zero boolean becomes 1).
    Normalize { dst: Reg, ty: BasicType },
    Cmp { a: Reg, b: Reg },
    CmpImm { a: Reg, imm: i64 },
    CmpMem { addr: Addr, imm: i64, width: Width },
    Jmp(Label),
    Jcc(Cond, Label),
    JmpReg(Reg),
    JmpAbs(u64),
    Call(CallTarget),
    Ret,
    /// `push fp; mov fp, sp`.
    Enter,
    /// `mov sp, fp; pop fp`.
    Leave,
    /// If `[addr]` equals the result register, store `new` and set Eq; otherwise load `[addr]`
    /// into the result register and set Ne.
    CmpXchg { addr: Addr, new: Reg },
    Fence,
    LoadThread { dst: Reg, field: ThreadField },
    StoreThread { field: ThreadField, src: Reg },
    StoreThreadImm { field: ThreadField, imm: u64 },
    SetThreadState(ThreadState),
    /// Jump to `slow` if a safepoint or suspend request is pending for this thread.
    SafepointPoll { slow: Label },
    LoadMethod { dst: Reg, method: Reg, field: MethodField },
    CallRuntime(RuntimeEntry),
    CallNative(NativeId),
    /// Touch the stack `offset` bytes below the stack pointer.
    BangStack { offset: u64 },
    /// Touch every page from the stack pointer down to `size` bytes (in the register) plus the
    /// shadow zone.
    BangStackSize { size: Reg },
    /// A fatal internal error.
    Stop(String),
    Halt(Halt),
}

impl Inst {
    /// Render this instruction using `abi`'s register names.
    pub fn display(&self, abi: &Abi) -> String {
        let r = |r: &Reg| abi.gp_name(*r);
        let f = |r: &FReg| abi.fp_name(*r);
        let a = |a: &Addr| {
            if a.disp == 0 {
                format!("[{}]", abi.gp_name(a.base))
            } else if a.disp < 0 {
                format!("[{}-{:#x}]", abi.gp_name(a.base), -a.disp)
            } else {
                format!("[{}+{:#x}]", abi.gp_name(a.base), a.disp)
            }
        };
        let w = |w: &Width| match w {
            Width::W32 => "l",
            Width::W64 => "q",
        };
        match self {
            Inst::Comment(s) => format!("; {s}"),
            Inst::Mov { dst, src } => format!("mov {}, {}", r(dst), r(src)),
            Inst::MovImm { dst, imm } => format!("mov {}, {imm:#x}", r(dst)),
            Inst::Load { dst, addr, width } => format!("mov{} {}, {}", w(width), r(dst), a(addr)),
            Inst::Store { src, addr, width } => format!("mov{} {}, {}", w(width), a(addr), r(src)),
            Inst::StoreImm { imm, addr, width } => format!("mov{} {}, {imm:#x}", w(width), a(addr)),
            Inst::FLoad { dst, addr, width } => format!("movs{} {}, {}", w(width), f(dst), a(addr)),
            Inst::FStore { src, addr, width } => {
                format!("movs{} {}, {}", w(width), a(addr), f(src))
            }
            Inst::FMov { dst, src } => format!("movsd {}, {}", f(dst), f(src)),
            Inst::VStoreHi { src, addr } => format!("vextract_high {}, {}", a(addr), f(src)),
            Inst::VLoadHi { dst, addr } => format!("vinsert_high {}, {}", f(dst), a(addr)),
            Inst::Lea { dst, addr } => format!("lea {}, {}", r(dst), a(addr)),
            Inst::LeaLabel { dst, label } => format!("lea {}, L{}", r(dst), label.0),
            Inst::Push(x) => format!("push {}", r(x)),
            Inst::PushImm(x) => format!("push {x:#x}"),
            Inst::PushMem(x) => format!("push {}", a(x)),
            Inst::Pop(x) => format!("pop {}", r(x)),
            Inst::PushFlags => "pushf".to_owned(),
            Inst::PopFlags => "popf".to_owned(),
            Inst::AddImm { dst, imm } => format!("add {}, {imm}", r(dst)),
            Inst::Add { dst, src } => format!("add {}, {}", r(dst), r(src)),
            Inst::Sub { dst, src } => format!("sub {}, {}", r(dst), r(src)),
            Inst::AndImm { dst, imm } => format!("and {}, {imm}", r(dst)),
            Inst::OrImm { dst, imm } => format!("or {}, {imm:#x}", r(dst)),
            Inst::Normalize { dst, ty } => format!("normalize {}, {ty}", r(dst)),
            Inst::Cmp { a: x, b } => format!("cmp {}, {}", r(x), r(b)),
            Inst::CmpImm { a: x, imm } => format!("cmp {}, {imm:#x}", r(x)),
            Inst::CmpMem { addr, imm, width } => format!("cmp{} {}, {imm:#x}", w(width), a(addr)),
            Inst::Jmp(l) => format!("jmp L{}", l.0),
            Inst::Jcc(c, l) => format!("j{} L{}", c.suffix(), l.0),
            Inst::JmpReg(x) => format!("jmp {}", r(x)),
            Inst::JmpAbs(x) => format!("jmp {x:#x}"),
            Inst::Call(CallTarget::Abs(x)) => format!("call {x:#x}"),
            Inst::Call(CallTarget::Reg(x)) => format!("call {}", r(x)),
            Inst::Call(CallTarget::Site(x)) => format!("call site{x}"),
            Inst::Ret => "ret".to_owned(),
            Inst::Enter => "enter".to_owned(),
            Inst::Leave => "leave".to_owned(),
            Inst::CmpXchg { addr, new } => format!("lock cmpxchg {}, {}", a(addr), r(new)),
            Inst::Fence => "mfence".to_owned(),
            Inst::LoadThread { dst, field } => format!("mov {}, thread.{field}", r(dst)),
            Inst::StoreThread { field, src } => format!("mov thread.{field}, {}", r(src)),
            Inst::StoreThreadImm { field, imm } => format!("mov thread.{field}, {imm:#x}"),
            Inst::SetThreadState(s) => format!("mov thread.state, {s}"),
            Inst::SafepointPoll { slow } => format!("safepoint_poll L{}", slow.0),
            Inst::LoadMethod { dst, method, field } => {
                format!("mov {}, {}.{field}", r(dst), r(method))
            }
            Inst::CallRuntime(e) => format!("call runtime.{e}"),
            Inst::CallNative(id) => format!("call native{}", usize::from(*id)),
            Inst::BangStack { offset } => format!("bang [{}-{offset:#x}]", r(&abi.sp)),
            Inst::BangStackSize { size } => format!("bang_stack_size {}", r(size)),
            Inst::Stop(s) => format!("stop {s:?}"),
            Inst::Halt(h) => format!("halt {h:?}"),
        }
    }
}

/// Assembled instructions with every label resolved to an instruction index.
#[derive(Clone, Debug)]
pub struct Code {
    pub insts: Vec<Inst>,
    pub labels: TiVec<Label, u32>,
    /// The initial targets of the blob's patchable call sites.
    pub call_sites: Vec<u64>,
}

impl Code {
    /// The size of the code in bytes.
    pub fn size(&self) -> u64 {
        self.insts.len() as u64 * INST_SIZE
    }

    pub fn label_offset(&self, l: Label) -> u32 {
        self.labels[l] * INST_SIZE as u32
    }
}

pub struct MacroAssembler {
    abi: &'static Abi,
    insts: Vec<Inst>,
    /// New labels are `None` until bound.
    labels: TiVec<Label, Option<u32>>,
    call_sites: Vec<u64>,
}

impl MacroAssembler {
    pub fn new(abi: &'static Abi) -> Self {
        Self {
            abi,
            insts: Vec::new(),
            labels: TiVec::new(),
            call_sites: Vec::new(),
        }
    }

    pub fn abi(&self) -> &'static Abi {
        self.abi
    }

    /// The byte offset of the next instruction.
    pub fn offset(&self) -> u32 {
        (self.insts.len() as u64 * INST_SIZE) as u32
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push_and_get_key(None)
    }

    pub fn bind(&mut self, l: Label) {
        assert!(self.labels[l].is_none(), "label L{} bound twice", l.0);
        self.labels[l] = Some(self.insts.len() as u32);
    }

    /// Create a label bound to the next instruction.
    pub fn here(&mut self) -> Label {
        let l = self.new_label();
        self.bind(l);
        l
    }

    pub fn emit(&mut self, i: Inst) {
        self.insts.push(i);
    }

    pub fn comment(&mut self, s: &str) {
        self.emit(Inst::Comment(s.to_owned()));
    }

    pub fn mov(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.emit(Inst::Mov { dst, src });
        }
    }

    pub fn mov_imm(&mut self, dst: Reg, imm: u64) {
        self.emit(Inst::MovImm { dst, imm });
    }

    pub fn load(&mut self, dst: Reg, addr: Addr) {
        self.emit(Inst::Load {
            dst,
            addr,
            width: Width::W64,
        });
    }

    pub fn load32(&mut self, dst: Reg, addr: Addr) {
        self.emit(Inst::Load {
            dst,
            addr,
            width: Width::W32,
        });
    }

    pub fn store(&mut self, addr: Addr, src: Reg) {
        self.emit(Inst::Store {
            src,
            addr,
            width: Width::W64,
        });
    }

    pub fn store32(&mut self, addr: Addr, src: Reg) {
        self.emit(Inst::Store {
            src,
            addr,
            width: Width::W32,
        });
    }

    pub fn store_imm(&mut self, addr: Addr, imm: u64) {
        self.emit(Inst::StoreImm {
            imm,
            addr,
            width: Width::W64,
        });
    }

    pub fn fload(&mut self, dst: FReg, addr: Addr, width: Width) {
        self.emit(Inst::FLoad { dst, addr, width });
    }

    pub fn fstore(&mut self, addr: Addr, src: FReg, width: Width) {
        self.emit(Inst::FStore { src, addr, width });
    }

    pub fn fmov(&mut self, dst: FReg, src: FReg) {
        if dst != src {
            self.emit(Inst::FMov { dst, src });
        }
    }

    pub fn lea(&mut self, dst: Reg, addr: Addr) {
        self.emit(Inst::Lea { dst, addr });
    }

    pub fn push(&mut self, r: Reg) {
        self.emit(Inst::Push(r));
    }

    pub fn pop(&mut self, r: Reg) {
        self.emit(Inst::Pop(r));
    }

    pub fn add_imm(&mut self, dst: Reg, imm: i64) {
        if imm != 0 {
            self.emit(Inst::AddImm { dst, imm });
        }
    }

    pub fn sub_imm(&mut self, dst: Reg, imm: i64) {
        self.add_imm(dst, -imm);
    }

    pub fn and_imm(&mut self, dst: Reg, imm: i64) {
        self.emit(Inst::AndImm { dst, imm });
    }

    pub fn cmp_imm(&mut self, a: Reg, imm: i64) {
        self.emit(Inst::CmpImm { a, imm });
    }

    pub fn jmp(&mut self, l: Label) {
        self.emit(Inst::Jmp(l));
    }

    pub fn jcc(&mut self, c: Cond, l: Label) {
        self.emit(Inst::Jcc(c, l));
    }

    pub fn call(&mut self, t: CallTarget) {
        self.emit(Inst::Call(t));
    }

    pub fn call_runtime(&mut self, e: RuntimeEntry) {
        self.emit(Inst::CallRuntime(e));
    }

    pub fn enter(&mut self) {
        self.emit(Inst::Enter);
    }

    pub fn leave(&mut self) {
        self.emit(Inst::Leave);
    }

    pub fn ret(&mut self) {
        self.emit(Inst::Ret);
    }

    pub fn stop(&mut self, msg: &str) {
        self.emit(Inst::Stop(msg.to_owned()));
    }

    /// Align the stack pointer down to the platform's stack alignment.
    pub fn align_stack(&mut self) {
        let a = self.abi.stack_alignment as i64;
        self.and_imm(self.abi.sp, -a);
    }

    /// Reserve a patchable call site initially calling `target` and emit a call through it.
    pub fn call_site(&mut self, target: u64) -> usize {
        let i = self.call_sites.len();
        self.call_sites.push(target);
        self.call(CallTarget::Site(i));
        i
    }

    /// Record the last managed frame so that the stack can be walked during a runtime or native
    /// call. `sp` defaults to the stack pointer; a `None` pc means the walker finds it just
    /// below `sp`. The stack pointer is stored last: a walker treats a non-zero last sp as a
    /// complete anchor.
    pub fn set_last_java_frame(&mut self, sp: Option<Reg>, fp: Option<Reg>, pc: Option<Label>) {
        if let Some(fp) = fp {
            self.emit(Inst::StoreThread {
                field: ThreadField::LastJavaFp,
                src: fp,
            });
        }
        if let Some(l) = pc {
            let t = self.abi.scratch;
            self.emit(Inst::LeaLabel { dst: t, label: l });
            self.emit(Inst::StoreThread {
                field: ThreadField::LastJavaPc,
                src: t,
            });
        }
        self.emit(Inst::StoreThread {
            field: ThreadField::LastJavaSp,
            src: sp.unwrap_or(self.abi.sp),
        });
    }

    /// Clear the anchor set by [Self::set_last_java_frame], sp first.
    pub fn reset_last_java_frame(&mut self, clear_fp: bool) {
        self.emit(Inst::StoreThreadImm {
            field: ThreadField::LastJavaSp,
            imm: 0,
        });
        if clear_fp {
            self.emit(Inst::StoreThreadImm {
                field: ThreadField::LastJavaFp,
                imm: 0,
            });
        }
        self.emit(Inst::StoreThreadImm {
            field: ThreadField::LastJavaPc,
            imm: 0,
        });
    }

    /// Emit a check that the value in `r` lies in `lo..hi`, stopping with `msg` otherwise.
    /// Clobbers the scratch register.
    pub fn verify_in_range(&mut self, r: Reg, lo: u64, hi: u64, msg: &str) {
        let bad = self.new_label();
        let ok = self.new_label();
        let t = self.abi.scratch;
        self.mov_imm(t, lo);
        self.emit(Inst::Cmp { a: r, b: t });
        self.jcc(Cond::Below, bad);
        self.mov_imm(t, hi);
        self.emit(Inst::Cmp { a: r, b: t });
        self.jcc(Cond::Below, ok);
        self.bind(bad);
        self.stop(msg);
        self.bind(ok);
    }

    /// Resolve every label.
    ///
    /// # Panics
    ///
    /// If a label was used but never bound.
    pub fn finish(self) -> Code {
        let labels = self
            .labels
            .iter_enumerated()
            .map(|(l, x)| x.unwrap_or_else(|| panic!("label L{} never bound", l.0)))
            .collect::<TiVec<Label, u32>>();
        Code {
            insts: self.insts,
            labels,
            call_sites: self.call_sites,
        }
    }
}

/// Render `code` one instruction per line with offsets, the way the stub log shows it.
pub fn disassemble(abi: &Abi, code: &Code) -> String {
    let mut out = String::new();
    for (i, inst) in code.insts.iter().enumerate() {
        for (l, _) in code.labels.iter_enumerated().filter(|(_, x)| **x as usize == i) {
            writeln!(out, "L{}:", l.0).ok();
        }
        writeln!(out, "  {:04x}: {}", i as u64 * INST_SIZE, inst.display(abi)).ok();
    }
    out
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}
