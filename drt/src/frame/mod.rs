//! Stack frames and walking the stack.
//!
//! A [Frame] is identified by its stack pointer, frame pointer and pc. Its kind follows from the
//! blob containing the pc, and the kind says how to find the sender:
//!
//!   * interpreted frames link to their sender through the saved frame pointer and sender sp
//!     slots (see [interp]);
//!   * compiled, native wrapper and stub frames have a fixed size recorded in their blob, with the
//!     return address and the caller's frame pointer at the top;
//!   * entry frames (the call stub) name their sender through the anchor the host had when it
//!     called in.
//!
//! A compiled frame marked for deoptimization has had its return address redirected to its deopt
//! handler; such a frame reports its original pc, saved in the frame, as its [Frame::pc].

pub mod interp;
mod regmap;

pub use regmap::RegisterMap;

use crate::{
    abi::{Abi, WORD},
    codecache::CodeBlob,
    heap::ClassId,
    masm::INST_SIZE,
    method::MethodId,
    runtime::Runtime,
    stubs,
    thread::ThreadContext,
};
use std::{fmt, sync::Arc};
use strum::Display;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum FrameKind {
    Entry,
    Interpreted,
    Compiled,
    Native,
    Stub,
    Adapter,
    Unknown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeoptState {
    NotDeoptimized,
    /// The frame returns to its deopt handler.
    IsDeoptimized,
}

#[derive(Clone)]
pub struct Frame {
    sp: u64,
    /// The sp the frame was built with, before any adjustment made while it is being deoptimized.
    unextended_sp: u64,
    fp: u64,
    /// The original pc of a deoptimized frame, otherwise the same as `raw_pc`.
    pc: u64,
    raw_pc: u64,
    blob: Option<Arc<CodeBlob>>,
    deopt_state: DeoptState,
}

impl Frame {
    pub fn new(rt: &Runtime, sp: u64, fp: u64, pc: u64) -> Self {
        let blob = rt.code_cache.find_blob(pc);
        let mut f = Self {
            sp,
            unextended_sp: sp,
            fp,
            pc,
            raw_pc: pc,
            blob,
            deopt_state: DeoptState::NotDeoptimized,
        };
        f.adjust_unextended_sp(rt.abi());
        f.init_deopt_state(rt);
        f
    }

    /// A frame whose unextended sp differs from its sp, e.g. an interpreted frame's caller.
    pub fn with_unextended_sp(rt: &Runtime, sp: u64, unextended_sp: u64, fp: u64, pc: u64) -> Self {
        let mut f = Self::new(rt, sp, fp, pc);
        if f.deopt_state == DeoptState::NotDeoptimized {
            f.unextended_sp = unextended_sp;
        }
        f
    }

    /// A frame returning into its deopt handler may have been entered with a stack pointer that
    /// differs from the one it was built with.
    fn adjust_unextended_sp(&mut self, abi: &Abi) {
        if let Some(b) = &self.blob {
            if b.is_deopt_entry(self.raw_pc) {
                self.unextended_sp = self.sp + abi.deopt_unextended_sp_adjust;
            }
        }
    }

    fn init_deopt_state(&mut self, rt: &Runtime) {
        let Some(b) = &self.blob else { return };
        if !b.is_deopt_entry(self.raw_pc) {
            return;
        }
        let Some(off) = b.nmethod().and_then(|nm| nm.orig_pc_offset) else {
            return;
        };
        if let Some(orig) = rt
            .mem
            .try_read_u64(self.unextended_sp + u64::from(off))
        {
            debug_assert!(
                b.contains(orig),
                "original pc {orig:#x} of a deoptimized frame is outside {}",
                b.name()
            );
            self.pc = orig;
            self.deopt_state = DeoptState::IsDeoptimized;
        }
    }

    pub fn sp(&self) -> u64 {
        self.sp
    }

    pub fn unextended_sp(&self) -> u64 {
        self.unextended_sp
    }

    pub fn fp(&self) -> u64 {
        self.fp
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn raw_pc(&self) -> u64 {
        self.raw_pc
    }

    pub fn blob(&self) -> Option<&Arc<CodeBlob>> {
        self.blob.as_ref()
    }

    pub fn is_deoptimized(&self) -> bool {
        self.deopt_state == DeoptState::IsDeoptimized
    }

    pub fn kind(&self) -> FrameKind {
        match &self.blob {
            None => FrameKind::Unknown,
            Some(b) if b.is_interpreter() => FrameKind::Interpreted,
            Some(b) if b.is_call_stub() => FrameKind::Entry,
            Some(b) if b.is_adapter() => FrameKind::Adapter,
            Some(b) if b.is_native_wrapper() => FrameKind::Native,
            Some(b) if b.is_compiled() => FrameKind::Compiled,
            Some(_) => FrameKind::Stub,
        }
    }

    pub fn is_interpreted(&self) -> bool {
        self.kind() == FrameKind::Interpreted
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.kind(), FrameKind::Compiled | FrameKind::Native)
    }

    pub fn is_entry(&self) -> bool {
        self.kind() == FrameKind::Entry
    }

    /// For compiled and native frames, the method whose code this is.
    pub fn compiled_method(&self) -> Option<MethodId> {
        self.blob
            .as_ref()
            .and_then(|b| b.nmethod())
            .map(|nm| nm.method)
    }

    /// The sender of this frame, or `None` at the outermost entry frame. With an updating `map`,
    /// the locations of registers this frame saved are recorded in it.
    pub fn sender(&self, rt: &Runtime, map: &mut RegisterMap) -> Option<Frame> {
        match self.kind() {
            FrameKind::Entry => self.sender_for_entry_frame(rt, map),
            FrameKind::Interpreted => Some(self.sender_for_interpreter_frame(rt, map)),
            FrameKind::Compiled | FrameKind::Native | FrameKind::Stub => {
                Some(self.sender_for_compiled_frame(rt, map))
            }
            FrameKind::Adapter | FrameKind::Unknown => None,
        }
    }

    fn sender_for_entry_frame(&self, rt: &Runtime, map: &mut RegisterMap) -> Option<Frame> {
        let anchor = stubs::entry_frame_anchor(&rt.mem, rt.abi(), self.fp)?;
        if !anchor.has_last_java_frame() {
            return None;
        }
        map.clear();
        let pc = match anchor.last_pc {
            0 => rt.mem.read_u64(anchor.last_sp - WORD),
            pc => pc,
        };
        Some(Frame::new(rt, anchor.last_sp, anchor.last_fp, pc))
    }

    fn sender_for_interpreter_frame(&self, rt: &Runtime, map: &mut RegisterMap) -> Frame {
        let mem = &rt.mem;
        let sender_sp = self.fp + 2 * WORD;
        let unextended_sp = self.interpreter_frame_sender_sp(mem);
        if map.update_map() {
            map.set_location(rt.abi().fp.loc(), self.fp);
        }
        let link = mem.read_u64(self.fp);
        let pc = mem.read_u64(self.fp + WORD);
        Frame::with_unextended_sp(rt, sender_sp, unextended_sp, link, pc)
    }

    fn sender_for_compiled_frame(&self, rt: &Runtime, map: &mut RegisterMap) -> Frame {
        let mem = &rt.mem;
        let b = self
            .blob
            .as_ref()
            .unwrap_or_else(|| unreachable!("compiled frame without a blob"));
        let sender_sp = self.unextended_sp + u64::from(b.frame_size()) * WORD;
        let link_addr = sender_sp - 2 * WORD;
        if map.update_map() {
            if let Some(om) = b.oop_map_at(self.pc) {
                for (slot, reg) in om.callee_saved() {
                    map.set_location(reg, self.unextended_sp + slot.stack_offset());
                }
            }
            map.set_location(rt.abi().fp.loc(), link_addr);
        }
        let pc = mem.read_u64(sender_sp - WORD);
        let link = mem.read_u64(link_addr);
        Frame::new(rt, sender_sp, link, pc)
    }

    /// Make this frame return to `pc`, which must be its deopt handler or another pc in its own
    /// blob. Its return address is the word just below its sp.
    ///
    /// # Panics
    ///
    /// If `pc` is anywhere else, or if the return address no longer holds the pc this frame was
    /// built with (i.e. someone else patched it first).
    pub fn patch_pc(&mut self, rt: &Runtime, pc: u64) {
        let b = self
            .blob
            .clone()
            .unwrap_or_else(|| panic!("can't patch {self}: not in the code cache"));
        assert!(
            b.contains(pc) || b.is_deopt_entry(pc),
            "can't patch {self} to return to {pc:#x}, outside {}",
            b.name()
        );
        if let Err(now) = rt.mem.cmpxchg_u64(self.sp - WORD, self.raw_pc, pc) {
            panic!(
                "can't patch {self}: its return address is now {now:#x}, not {:#x}",
                self.raw_pc
            );
        }
        self.raw_pc = pc;
        if b.is_deopt_entry(pc) {
            self.deopt_state = DeoptState::IsDeoptimized;
        } else {
            self.pc = pc;
            self.deopt_state = DeoptState::NotDeoptimized;
        }
    }

    /// Could the sender of this frame be computed without touching anything that isn't there?
    /// Unlike [Self::sender] this never trusts what it reads: it is for walking the stack of a
    /// thread stopped at an arbitrary point, e.g. by a profiler.
    pub fn safe_for_sender(&self, thread: &ThreadContext) -> bool {
        let rt = &thread.rt;
        let mem = &rt.mem;
        let stack = &thread.shared.stack;

        if !stack.is_usable(self.sp) {
            return false;
        }
        if self.unextended_sp < self.sp || !stack.contains(self.unextended_sp) {
            return false;
        }
        // Only meaningful for frames that keep a frame pointer.
        let fp_safe = self.fp > self.sp && self.fp < stack.base;

        let Some(b) = &self.blob else { return false };
        let kind = self.kind();
        let (sender_sp, sender_pc, link) = match kind {
            FrameKind::Unknown | FrameKind::Adapter => return false,
            FrameKind::Entry => {
                if !fp_safe {
                    return false;
                }
                let Some(anchor) = stubs::entry_frame_anchor(mem, rt.abi(), self.fp) else {
                    return false;
                };
                // The outermost entry frame has no sender to be unsafe about.
                return !anchor.has_last_java_frame()
                    || (anchor.last_sp > self.fp && stack.is_usable(anchor.last_sp));
            }
            FrameKind::Interpreted => {
                if !fp_safe || !self.is_valid_interpreter_frame(thread) {
                    return false;
                }
                let sender_sp = self.fp + 2 * WORD;
                let (Some(pc), Some(link)) = (
                    mem.try_read_u64(self.fp + WORD),
                    mem.try_read_u64(self.fp),
                ) else {
                    return false;
                };
                (sender_sp, pc, link)
            }
            FrameKind::Compiled | FrameKind::Native | FrameKind::Stub => {
                if !b.is_frame_complete_at(self.raw_pc) || b.frame_size() < 2 {
                    return false;
                }
                let sender_sp = self.unextended_sp + u64::from(b.frame_size()) * WORD;
                if sender_sp > stack.base {
                    return false;
                }
                let (Some(pc), Some(link)) = (
                    mem.try_read_u64(sender_sp - WORD),
                    mem.try_read_u64(sender_sp - 2 * WORD),
                ) else {
                    return false;
                };
                (sender_sp, pc, link)
            }
        };

        if sender_pc % INST_SIZE != 0 {
            return false;
        }
        let Some(sb) = rt.code_cache.find_blob(sender_pc) else {
            return false;
        };
        let stubs = rt.stubs();
        if sb.is_adapter() {
            false
        } else if sb.is_interpreter() {
            let returns = [
                stubs.interpreter_return(),
                stubs.interpreter_continue_after(),
                stubs.interpreter_reexecute(),
                stubs.interpreter_rethrow(),
            ];
            if !returns.contains(&sender_pc) || link <= sender_sp || link >= stack.base {
                return false;
            }
            let sender = Frame::new(rt, sender_sp, link, sender_pc);
            sender.is_valid_interpreter_frame(thread)
        } else if sb.is_call_stub() {
            sb.call_stub_return() == Some(sender_pc) && link > sender_sp && link < stack.base
        } else if sb.is_compiled() {
            // A compiled sender is stopped at a call, which always has an oop map; one marked for
            // deoptimization returns to its deopt handler instead.
            sb.is_frame_complete_at(sender_pc)
                && (sb.oop_map_at(sender_pc).is_some() || sb.is_deopt_entry(sender_pc))
                && sender_sp + u64::from(sb.frame_size()) * WORD <= stack.base
        } else {
            // Stubs are never the callers of other frames.
            false
        }
    }

    /// Do the fixed slots of this interpreted frame hold plausible values?
    fn is_valid_interpreter_frame(&self, thread: &ThreadContext) -> bool {
        let rt = &thread.rt;
        let mem = &rt.mem;
        let stack = &thread.shared.stack;
        let read = |off: i64| mem.try_read_u64(self.fp.wrapping_add((off * WORD as i64) as u64));
        let Some(method) = read(interp::METHOD_OFFSET).and_then(MethodId::from_word) else {
            return false;
        };
        if usize::from(method) >= rt.methods.len() {
            return false;
        }
        let method = rt.method(method);
        let bci_ok = read(interp::BCP_OFFSET)
            .and_then(|b| u32::try_from(b).ok())
            .is_some_and(|b| method.is_valid_bci(b));
        let cache_ok = read(interp::CACHE_OFFSET) == Some(ClassId::to_word(method.holder));
        let locals_ok = read(interp::LOCALS_OFFSET)
            .is_some_and(|l| l >= self.fp + 2 * WORD && l < stack.base);
        bci_ok && cache_ok && locals_ok
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frame sp={:#x} fp={:#x} pc={:#x}",
            self.kind(),
            self.sp,
            self.fp,
            self.pc
        )?;
        if let Some(b) = &self.blob {
            write!(f, " ({}+{:#x})", b.name(), b.offset_of(self.pc))?;
        }
        if self.is_deoptimized() {
            write!(f, " deoptimized")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Iterate over the frames of a stack, youngest first, ending with the outermost entry frame.
pub struct StackFrameStream<'a> {
    rt: &'a Runtime,
    map: RegisterMap,
    /// The frame most recently returned, whose sender is computed lazily so that the map stays
    /// valid for it until the next call.
    cur: Option<Frame>,
    next: Option<Frame>,
}

impl<'a> StackFrameStream<'a> {
    pub fn new(rt: &'a Runtime, youngest: Frame, update_map: bool) -> Self {
        Self {
            rt,
            map: RegisterMap::new(update_map),
            cur: None,
            next: Some(youngest),
        }
    }

    /// The register map for the frame most recently returned.
    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }
}

impl Iterator for StackFrameStream<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if let Some(prev) = self.cur.take() {
            self.next = prev.sender(self.rt, &mut self.map);
        }
        let f = self.next.take()?;
        self.cur = Some(f.clone());
        Some(f)
    }
}
