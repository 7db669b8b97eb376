//! The i2c/c2i adapter pairs.
//!
//! The interpreter passes arguments on its expression stack; compiled code passes them in
//! registers and outgoing stack slots laid out by [crate::callconv]. A method with compiled code
//! is entered from the interpreter through its i2c adapter, and a method without is entered from
//! compiled code through its c2i adapter. Adapters depend only on the shape of a signature, so
//! one pair is generated per [AdapterFingerprint] and shared by every method with that shape.
//!
//! The interpreter's view of the arguments at a call: the sender's stack pointer (in
//! `sender_sp_reg`) points at the last argument pushed, with the first argument highest. A 64-bit
//! argument takes two slots and its value is in the lower one.

use crate::{
    abi::{align_up, BasicType, FReg, Reg, WORD},
    callconv::{self, ArgumentLayout, Convention},
    codecache::{BlobKind, CodeBlob, NewBlob},
    log::Verbosity,
    masm::{at, Cond, Inst, MacroAssembler, Width},
    method::{MethodField, MethodId},
    runtime::{Runtime, RuntimeEntry},
    thread::{ThreadContext, ThreadField},
    CodeGenError,
};
use drtmap::Location;
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, mem, sync::Arc};

/// The shape of a signature as far as argument passing is concerned: sub-word integers are
/// passed like ints and arrays like any other reference.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AdapterFingerprint(Vec<BasicType>);

impl AdapterFingerprint {
    pub fn new(sig: &[BasicType]) -> Self {
        Self(
            sig.iter()
                .map(|t| match t {
                    BasicType::Boolean | BasicType::Char | BasicType::Byte | BasicType::Short => {
                        BasicType::Int
                    }
                    BasicType::Array => BasicType::Object,
                    t => *t,
                })
                .collect(),
        )
    }

    pub fn sig(&self) -> &[BasicType] {
        &self.0
    }
}

impl fmt::Display for AdapterFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for t in &self.0 {
            write!(f, "{}", t.to_char())?;
        }
        write!(f, ")")
    }
}

/// The entry points of one adapter pair. Both adapters live in one blob.
#[derive(Debug)]
pub struct AdapterHandlerEntry {
    pub fingerprint: AdapterFingerprint,
    pub i2c: u64,
    pub c2i: u64,
    /// Where callers that haven't checked the receiver's class enter. The receiver is never
    /// checked here, so this is the c2i entry.
    pub c2i_unverified: u64,
    pub blob: Arc<CodeBlob>,
}

/// Every adapter pair generated so far.
pub struct AdapterLibrary {
    map: Mutex<HashMap<AdapterFingerprint, Arc<AdapterHandlerEntry>>>,
}

impl AdapterLibrary {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// The adapters for methods with signature `sig`, generating them if this is the first such
    /// method. Generation happens under the library's lock so concurrent callers get the same
    /// entry.
    pub fn get_adapter(
        &self,
        rt: &Runtime,
        sig: &[BasicType],
    ) -> Result<Arc<AdapterHandlerEntry>, CodeGenError> {
        let fp = AdapterFingerprint::new(sig);
        let mut map = self.map.lock();
        if let Some(e) = map.get(&fp) {
            return Ok(Arc::clone(e));
        }
        let e = Arc::new(create(rt, fp.clone())?);
        rt.stats.adapter_created();
        if rt.log.enabled(Verbosity::Stub) {
            rt.log.log(
                Verbosity::Stub,
                &format!(
                    "adapters {fp}: i2c {:#x} c2i {:#x}",
                    e.i2c, e.c2i
                ),
            );
        }
        map.insert(fp, Arc::clone(&e));
        Ok(e)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
}

fn create(rt: &Runtime, fp: AdapterFingerprint) -> Result<AdapterHandlerEntry, CodeGenError> {
    let abi = rt.abi();
    let layout = callconv::resolve(abi, fp.sig(), Convention::Java);
    let mut m = MacroAssembler::new(abi);
    let i2c = m.new_label();
    let c2i = m.new_label();
    m.bind(i2c);
    gen_i2c(rt, &mut m, &layout);
    m.bind(c2i);
    gen_c2i(rt, &mut m, &layout);
    let nb = NewBlob::new(&format!("adapters{fp}"), BlobKind::Adapter, m.finish());
    let blob = rt.install(nb)?;
    let (i2c, c2i) = (blob.label_addr(i2c), blob.label_addr(c2i));
    Ok(AdapterHandlerEntry {
        fingerprint: fp,
        i2c,
        c2i,
        c2i_unverified: c2i,
        blob,
    })
}

/// The offset from the interpreter's last argument of the slot holding argument `i`.
fn interpreter_arg_offset(sig: &[BasicType], i: usize) -> i64 {
    let slots = sig.len() as i64;
    let i = i as i64;
    if sig[i as usize].is_double_word() {
        (slots - 2 - i) * WORD as i64
    } else {
        (slots - 1 - i) * WORD as i64
    }
}

/// Loads and stores of a stack argument use its own width for sub-word types so the unused half
/// of its slot pair never leaks into the value.
fn width_of(t: BasicType) -> Width {
    if t.is_double_word() || t.is_reference() || t == BasicType::Address {
        Width::W64
    } else {
        Width::W32
    }
}

/// Entered from the interpreter (or the call stub) with the return address on top of the stack,
/// the method in `method_reg` and the arguments above the return address. Leaves them where
/// compiled code expects them and jumps to the method's compiled entry.
fn gen_i2c(rt: &Runtime, m: &mut MacroAssembler, layout: &ArgumentLayout) {
    let abi = rt.abi();
    let s = rt.stubs();
    m.comment("i2c");
    if rt.options().verify_adapter_calls {
        let ok = m.new_label();
        let not_interp = m.new_label();
        let bad = m.new_label();
        let ra = abi.ret;
        m.load(ra, at(abi.sp, 0));
        for (blob, miss) in [(s.interpreter(), not_interp), (s.call_stub(), bad)] {
            m.mov_imm(abi.scratch, blob.code_begin());
            m.emit(Inst::Cmp {
                a: ra,
                b: abi.scratch,
            });
            m.jcc(Cond::Below, miss);
            m.mov_imm(abi.scratch, blob.code_end());
            m.emit(Inst::Cmp {
                a: ra,
                b: abi.scratch,
            });
            m.jcc(Cond::Below, ok);
            m.bind(miss);
        }
        m.stop("i2c adapter entered from neither the interpreter nor the call stub");
        m.bind(ok);
    }

    // Arguments are read relative to the caller's stack pointer, which stays in
    // `sender_sp_reg`.
    let base = abi.sender_sp_reg;
    m.pop(abi.ret);
    let stack_bytes = align_up(u64::from(layout.stack_slots()) * 4, abi.stack_alignment);
    m.sub_imm(abi.sp, stack_bytes as i64);
    m.align_stack();
    m.push(abi.ret);

    for (i, (&t, r)) in layout.sig().iter().zip(layout.regs()).enumerate() {
        let Some(dst) = r.first() else { continue };
        let src = at(base, interpreter_arg_offset(layout.sig(), i));
        match dst {
            Location::Gp { .. } => m.load(Reg::from_loc(dst), src),
            Location::Fp { .. } => m.fload(FReg::from_loc(dst), src, width_of(t)),
            Location::Stack(_) => {
                m.load(abi.scratch, src);
                m.store(at(abi.sp, WORD as i64 + dst.stack_offset() as i64), abi.scratch);
            }
        }
    }

    m.emit(Inst::StoreThread {
        field: ThreadField::CalleeTarget,
        src: abi.method_reg,
    });
    m.emit(Inst::LoadMethod {
        dst: abi.scratch,
        method: abi.method_reg,
        field: MethodField::FromCompiledEntry,
    });
    m.emit(Inst::JmpReg(abi.scratch));
}

/// Entered from compiled code with the arguments in the compiled layout and the method in
/// `method_reg`. Pushes the arguments in the interpreter's layout and jumps to the interpreter.
/// If the method has gained compiled code since the caller's call site was bound, the call
/// site is first repointed at that code.
fn gen_c2i(rt: &Runtime, m: &mut MacroAssembler, layout: &ArgumentLayout) {
    let abi = rt.abi();
    m.comment("c2i");
    if rt.options().verify_adapter_calls {
        let ok = m.new_label();
        let r = rt.code_cache.adapter_range();
        m.load(abi.ret, at(abi.sp, 0));
        m.mov_imm(abi.scratch, r.start);
        m.emit(Inst::Cmp {
            a: abi.ret,
            b: abi.scratch,
        });
        m.jcc(Cond::Below, ok);
        m.mov_imm(abi.scratch, r.end);
        m.emit(Inst::Cmp {
            a: abi.ret,
            b: abi.scratch,
        });
        m.jcc(Cond::AboveEq, ok);
        m.stop("c2i adapter entered from an adapter");
        m.bind(ok);
    }

    gen_fixup_call(rt, m, layout);

    let sig = layout.sig();
    m.pop(abi.ret);
    m.mov(abi.sender_sp_reg, abi.sp);
    let extra = align_up(sig.len() as u64 * WORD, abi.stack_alignment) as i64;
    m.sub_imm(abi.sp, extra);
    for (i, (&t, r)) in sig.iter().zip(layout.regs()).enumerate() {
        let Some(src) = r.first() else { continue };
        let off = interpreter_arg_offset(sig, i);
        let dst = at(abi.sp, off);
        if t.is_double_word() {
            m.store_imm(at(abi.sp, off + WORD as i64), 0);
        }
        match src {
            Location::Gp { .. } => m.store(dst, Reg::from_loc(src)),
            Location::Fp { .. } => {
                if t == BasicType::Float {
                    m.store_imm(dst, 0);
                }
                m.fstore(dst, FReg::from_loc(src), width_of(t));
            }
            Location::Stack(_) => {
                let from = at(abi.sender_sp_reg, src.stack_offset() as i64);
                match width_of(t) {
                    Width::W32 => m.load32(abi.scratch, from),
                    Width::W64 => m.load(abi.scratch, from),
                }
                m.store(dst, abi.scratch);
            }
        }
    }
    m.push(abi.ret);
    m.emit(Inst::LoadMethod {
        dst: abi.scratch,
        method: abi.method_reg,
        field: MethodField::InterpreterEntry,
    });
    m.emit(Inst::JmpReg(abi.scratch));
}

/// If the method now has code, call the runtime to repoint the caller's call site at it. The
/// argument registers are live and are saved around the call.
fn gen_fixup_call(rt: &Runtime, m: &mut MacroAssembler, layout: &ArgumentLayout) {
    let abi = rt.abi();
    let skip = m.new_label();
    m.emit(Inst::LoadMethod {
        dst: abi.scratch,
        method: abi.method_reg,
        field: MethodField::Code,
    });
    m.cmp_imm(abi.scratch, 0);
    m.jcc(Cond::Eq, skip);

    let mut gps = vec![abi.method_reg];
    let mut fps = Vec::new();
    for r in layout.regs().iter().filter_map(|r| r.first()) {
        match r {
            Location::Gp { .. } => gps.push(Reg::from_loc(r)),
            Location::Fp { .. } => fps.push(FReg::from_loc(r)),
            Location::Stack(_) => (),
        }
    }
    let save_bytes = align_up((gps.len() + fps.len()) as u64 * WORD, abi.stack_alignment)
        + u64::from(abi.arg_reg_save_area_bytes);
    let slot = |k: usize| at(abi.fp, -((k as i64 + 1) * WORD as i64));
    m.enter();
    m.sub_imm(abi.sp, save_bytes as i64);
    for (k, &r) in gps.iter().enumerate() {
        m.store(slot(k), r);
    }
    for (k, &r) in fps.iter().enumerate() {
        m.fstore(slot(gps.len() + k), r, Width::W64);
    }
    m.load(abi.c_int_args[1], at(abi.fp, WORD as i64));
    m.mov(abi.c_int_args[0], abi.method_reg);
    m.call_runtime(RuntimeEntry::FixupCallersCallsite);
    for (k, &r) in gps.iter().enumerate() {
        m.load(r, slot(k));
    }
    for (k, &r) in fps.iter().enumerate() {
        m.fload(r, slot(gps.len() + k), Width::W64);
    }
    m.leave();
    m.bind(skip);
}

/// Repoint the call site in compiled code that returns to `caller_pc`, and led to `method`'s c2i
/// adapter, at `method`'s compiled code. Call sites that no longer lead to the c2i adapter are
/// left alone, as are call sites in code that is not entrant.
pub fn fixup_callers_callsite(rt: &Runtime, method: MethodId, caller_pc: u64) {
    let Some(b) = rt.code_cache.find_blob(caller_pc) else {
        return;
    };
    if !b.is_compiled() || b.nmethod().is_some_and(|nm| nm.is_not_entrant()) {
        return;
    }
    let Some(i) = b.call_site_returning_to(caller_pc) else {
        return;
    };
    let m = rt.method(method);
    if m.code().is_none() {
        return;
    }
    let new = m.field(MethodField::FromCompiledEntry);
    if b.patch_call_site(i, m.c2i_entry(), new) && rt.log.enabled(Verbosity::Stub) {
        rt.log.log(
            Verbosity::Stub,
            &format!(
                "fixed call site {i} of {} to call {} at {new:#x}",
                b.name(),
                m.name
            ),
        );
    }
}

/// Work out where a call that reached code which is no longer entrant should go now. A caller
/// that came through the i2c adapter is interpreted and named its callee in the thread's callee
/// target; a compiled caller has it in `method_reg`, and its call site is repointed so that later
/// calls stop reaching the wrong-method stub. Returns the callee's current compiled entry.
pub fn handle_wrong_method(
    rt: &Runtime,
    thread: &mut ThreadContext,
    method_reg: u64,
    caller_pc: u64,
) -> u64 {
    let caller = rt
        .code_cache
        .find_blob(caller_pc)
        .filter(|b| b.is_compiled());
    let w = match caller {
        Some(_) => method_reg,
        None => mem::take(&mut thread.callee_target),
    };
    let method = MethodId::from_word(w)
        .unwrap_or_else(|| panic!("call from {caller_pc:#x} to not-entrant code names no method"));
    let m = rt.method(method);
    let entry = m.field(MethodField::FromCompiledEntry);
    let Some(b) = caller else { return entry };
    let Some(i) = b.call_site_returning_to(caller_pc) else {
        return entry;
    };
    let old = b.call_site_target(i);
    let stale = rt
        .code_cache
        .find_blob(old)
        .is_some_and(|ob| ob.nmethod().is_some_and(|nm| nm.is_not_entrant()));
    if stale && b.patch_call_site(i, old, entry) && rt.log.enabled(Verbosity::Stub) {
        rt.log.log(
            Verbosity::Stub,
            &format!(
                "re-resolved call site {i} of {} to call {} at {entry:#x}",
                b.name(),
                m.name
            ),
        );
    }
    entry
}
