//! The layout of interpreter frames.
//!
//! Offsets are in words from the frame pointer:
//!
//! ```text
//!    +1  return address
//!     0  saved fp (link)
//!    -1  sender sp          the caller's sp at the call, before any extension for locals
//!    -2  last sp            the expression stack top while calling out; 0 in the youngest frame
//!    -3  method
//!    -4  mirror             of the method's holder
//!    -5  mdp
//!    -6  cache              the holder's class word
//!    -7  locals             address of local 0; local i is at locals - 8i
//!    -8  bcp                the bci
//!    -9  monitor block top  address of the lowest monitor
//!        monitors           two words each, growing down
//!        expression stack   growing down from the monitor block top
//! ```
//!
//! The locals live above the return address: the parameters in the caller's outgoing expression
//! stack, the remaining locals in an extension of the caller's frame.

use super::Frame;
use crate::{
    abi::WORD,
    heap::ClassId,
    mem::Memory,
    method::{Method, MethodId},
    sync::BASIC_OBJECT_LOCK_SIZE,
};
use static_assertions::const_assert_eq;

pub const RETURN_PC_OFFSET: i64 = 1;
pub const LINK_OFFSET: i64 = 0;
pub const SENDER_SP_OFFSET: i64 = -1;
pub const LAST_SP_OFFSET: i64 = -2;
pub const METHOD_OFFSET: i64 = -3;
pub const MIRROR_OFFSET: i64 = -4;
pub const MDP_OFFSET: i64 = -5;
pub const CACHE_OFFSET: i64 = -6;
pub const LOCALS_OFFSET: i64 = -7;
pub const BCP_OFFSET: i64 = -8;
pub const MONITOR_BLOCK_TOP_OFFSET: i64 = -9;

/// The words of an interpreter frame that don't depend on the method, return address and link
/// included.
pub const FIXED_FRAME_WORDS: u32 = 11;
pub const MONITOR_WORDS: u32 = 2;

const_assert_eq!(
    FIXED_FRAME_WORDS as i64,
    RETURN_PC_OFFSET - MONITOR_BLOCK_TOP_OFFSET + 1
);
const_assert_eq!(MONITOR_WORDS as u64 * WORD, BASIC_OBJECT_LOCK_SIZE);

fn slot(fp: u64, off: i64) -> u64 {
    fp.wrapping_add((off * WORD as i64) as u64)
}

/// The size in words of an interpreter frame for an activation with `exprs` expression stack
/// entries and `monitors` monitors, whose callee (if any) has `callee_locals` locals of which
/// `callee_params` are parameters. The youngest frame reserves the method's whole expression
/// stack.
pub fn on_stack_size(
    max_stack: u32,
    exprs: u32,
    monitors: u32,
    callee_params: u32,
    callee_locals: u32,
    is_top_frame: bool,
) -> u32 {
    let stack = if is_top_frame {
        max_stack.max(exprs)
    } else {
        exprs
    };
    FIXED_FRAME_WORDS
        + last_frame_adjust(callee_params, callee_locals)
        + MONITOR_WORDS * monitors
        + stack
}

/// How many words a frame must grow by to hold the locals of an interpreted callee with
/// `callee_locals` locals, `callee_params` of which its caller has already pushed.
pub fn last_frame_adjust(callee_params: u32, callee_locals: u32) -> u32 {
    callee_locals - callee_params
}

/// The address of the bottom of the monitor block (just below the fixed slots) of the frame
/// whose frame pointer is `fp`.
pub fn monitor_block_bottom(fp: u64) -> u64 {
    slot(fp, MONITOR_BLOCK_TOP_OFFSET)
}

/// The address of monitor `k`, counting from the oldest.
pub fn monitor_addr(fp: u64, k: u32) -> u64 {
    monitor_block_bottom(fp) - u64::from(k + 1) * BASIC_OBJECT_LOCK_SIZE
}

/// The contents of the fixed slots of a frame being laid out.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FixedSlots {
    pub sender_sp: u64,
    pub last_sp: u64,
    pub method: MethodId,
    pub mirror: u64,
    pub holder: ClassId,
    pub locals: u64,
    pub bci: u32,
    pub monitors: u32,
}

impl FixedSlots {
    pub(crate) fn new(method: &Method, locals: u64, bci: u32, monitors: u32) -> Self {
        Self {
            sender_sp: 0,
            last_sp: 0,
            method: method.id,
            mirror: method.mirror,
            holder: method.holder,
            locals,
            bci,
            monitors,
        }
    }

    /// Fill the fixed slots of the frame whose frame pointer is `fp`. The link and return address
    /// are the caller's business.
    pub(crate) fn write(&self, mem: &Memory, fp: u64) {
        mem.write_u64(slot(fp, SENDER_SP_OFFSET), self.sender_sp);
        mem.write_u64(slot(fp, LAST_SP_OFFSET), self.last_sp);
        mem.write_u64(slot(fp, METHOD_OFFSET), self.method.to_word());
        mem.write_u64(slot(fp, MIRROR_OFFSET), self.mirror);
        mem.write_u64(slot(fp, MDP_OFFSET), 0);
        mem.write_u64(slot(fp, CACHE_OFFSET), self.holder.to_word());
        mem.write_u64(slot(fp, LOCALS_OFFSET), self.locals);
        mem.write_u64(slot(fp, BCP_OFFSET), u64::from(self.bci));
        mem.write_u64(
            slot(fp, MONITOR_BLOCK_TOP_OFFSET),
            monitor_block_bottom(fp) - u64::from(self.monitors) * BASIC_OBJECT_LOCK_SIZE,
        );
    }
}

impl Frame {
    fn interp_slot(&self, mem: &Memory, off: i64) -> u64 {
        mem.read_u64(slot(self.fp, off))
    }

    pub fn interpreter_frame_method(&self, mem: &Memory) -> MethodId {
        let w = self.interp_slot(mem, METHOD_OFFSET);
        MethodId::from_word(w)
            .unwrap_or_else(|| panic!("{self} holds {w:#x} rather than a method"))
    }

    pub fn interpreter_frame_bci(&self, mem: &Memory) -> u32 {
        self.interp_slot(mem, BCP_OFFSET) as u32
    }

    pub fn interpreter_frame_sender_sp(&self, mem: &Memory) -> u64 {
        self.interp_slot(mem, SENDER_SP_OFFSET)
    }

    pub fn interpreter_frame_last_sp(&self, mem: &Memory) -> u64 {
        self.interp_slot(mem, LAST_SP_OFFSET)
    }

    pub fn interpreter_frame_locals(&self, mem: &Memory) -> u64 {
        self.interp_slot(mem, LOCALS_OFFSET)
    }

    pub fn interpreter_frame_local(&self, mem: &Memory, i: u32) -> u64 {
        mem.read_u64(self.interpreter_frame_locals(mem) - u64::from(i) * WORD)
    }

    pub fn interpreter_frame_monitor_count(&self, mem: &Memory) -> u32 {
        let top = self.interp_slot(mem, MONITOR_BLOCK_TOP_OFFSET);
        ((monitor_block_bottom(self.fp) - top) / BASIC_OBJECT_LOCK_SIZE) as u32
    }

    /// The address of monitor `k`, counting from the oldest.
    pub fn interpreter_frame_monitor(&self, k: u32) -> u64 {
        monitor_addr(self.fp, k)
    }

    /// The address of expression stack entry `j`, counting from the bottom of the stack.
    pub fn interpreter_frame_expression(&self, mem: &Memory, j: u32) -> u64 {
        self.interp_slot(mem, MONITOR_BLOCK_TOP_OFFSET) - u64::from(j + 1) * WORD
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizes() {
        // A youngest frame reserves its whole expression stack.
        assert_eq!(on_stack_size(4, 1, 0, 0, 0, true), 15);
        assert_eq!(on_stack_size(4, 1, 0, 0, 0, false), 12);
        // Callee locals beyond its parameters extend the caller.
        assert_eq!(on_stack_size(0, 2, 1, 2, 5, false), 11 + 3 + 2 + 2);
        assert_eq!(last_frame_adjust(2, 5), 3);
        assert_eq!(last_frame_adjust(0, 5), 5);
    }

    #[test]
    fn monitors_grow_down() {
        let fp = 0x3000_1000;
        assert_eq!(monitor_block_bottom(fp), fp - 72);
        assert_eq!(monitor_addr(fp, 0), fp - 88);
        assert_eq!(monitor_addr(fp, 1), fp - 104);
    }
}
