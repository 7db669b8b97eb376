//! Saving every register in a stub frame.
//!
//! Stubs that call into the runtime at a point where any register may hold a live value (the
//! deopt blob, the safepoint handler) save the whole register file in a frame laid out like this,
//! from the stack pointer upwards:
//!
//! ```text
//!   [arg register save area]      native callee home space, if the platform has one
//!   fp regs, 16 bytes each        low word holds the scalar value
//!   [upper vector lanes]          16 bytes each, if wide vectors are saved
//!   gp regs, r15 first ... rax    the sp and fp slots are not restored from
//!   alignment word
//!   flags
//!   saved fp
//!   return address
//! ```
//!
//! The oop map produced by [RegSaveLayout::save] tells the stack walker where the caller's
//! registers went, so values living in registers at the interrupted pc can be found (and updated)
//! through a [crate::frame::RegisterMap].

use crate::{
    abi::{Abi, FReg, Reg, WORD},
    masm::{at, Inst, MacroAssembler, Width},
};
use drtmap::{Location, OopMap, STACK_SLOT_SIZE};

/// Bytes reserved per float register.
const FP_SLOT_BYTES: u64 = 16;

/// The byte offsets, from the stack pointer once the save is complete, of everything in a
/// register save frame.
#[derive(Clone, Copy, Debug)]
pub struct RegSaveLayout {
    abi: &'static Abi,
    wide: bool,
    arg_area: u64,
    fp_base: u64,
    wide_base: u64,
    gp_base: u64,
}

impl RegSaveLayout {
    pub fn new(abi: &'static Abi, save_wide_vectors: bool) -> Self {
        let arg_area = u64::from(abi.arg_reg_save_area_bytes);
        let fp_base = arg_area;
        let fp_area = u64::from(abi.fp_save_count) * FP_SLOT_BYTES;
        let wide_base = fp_base + fp_area;
        let wide_area = if save_wide_vectors { fp_area } else { 0 };
        Self {
            abi,
            wide: save_wide_vectors,
            arg_area,
            fp_base,
            wide_base,
            gp_base: wide_base + wide_area,
        }
    }

    pub fn saves_wide_vectors(&self) -> bool {
        self.wide
    }

    /// The offset of the saved value of `r`.
    pub fn gp_offset(&self, r: Reg) -> u64 {
        self.gp_base + u64::from(self.abi.gp_count() - 1 - r.0) * WORD
    }

    pub fn fp_offset(&self, r: FReg) -> u64 {
        assert!(r.0 < self.abi.fp_save_count, "{} is not saved", self.abi.fp_name(r));
        self.fp_base + u64::from(r.0) * FP_SLOT_BYTES
    }

    fn wide_offset(&self, r: FReg) -> u64 {
        self.wide_base + u64::from(r.0) * FP_SLOT_BYTES
    }

    fn align_offset(&self) -> u64 {
        self.gp_base + u64::from(self.abi.gp_count()) * WORD
    }

    pub fn flags_offset(&self) -> u64 {
        self.align_offset() + WORD
    }

    /// Where the frame pointer of the interrupted code is saved.
    pub fn fp_reg_offset(&self) -> u64 {
        self.flags_offset() + WORD
    }

    pub fn return_offset(&self) -> u64 {
        self.fp_reg_offset() + WORD
    }

    pub fn result_offset(&self) -> u64 {
        self.gp_offset(self.abi.ret)
    }

    pub fn result2_offset(&self) -> u64 {
        self.gp_offset(self.abi.ret2)
    }

    pub fn fresult_offset(&self) -> u64 {
        self.fp_offset(self.abi.fret)
    }

    /// The size of the whole frame, return address included.
    pub fn frame_bytes(&self) -> u64 {
        self.return_offset() + WORD
    }

    pub fn frame_words(&self) -> u32 {
        (self.frame_bytes() / WORD) as u32
    }

    fn slot(&self, off: u64) -> Location {
        Location::stack((off / u64::from(STACK_SLOT_SIZE)) as u32)
    }

    /// Emit code saving every register, to be run immediately after the return address was
    /// pushed. Returns the oop map describing the save area, valid at any call made while the
    /// frame is live.
    pub fn save(&self, m: &mut MacroAssembler) -> OopMap {
        let abi = self.abi;
        m.comment("save live registers");
        m.enter();
        m.emit(Inst::PushFlags);
        m.sub_imm(abi.sp, WORD as i64);
        for enc in 0..abi.gp_count() {
            m.push(Reg(enc));
        }
        let below_gp = self.gp_base - self.arg_area;
        m.sub_imm(abi.sp, below_gp as i64);
        for n in 0..abi.fp_save_count {
            let r = FReg(n);
            m.fstore(
                at(abi.sp, (self.fp_offset(r) - self.arg_area) as i64),
                r,
                Width::W64,
            );
            if self.wide {
                m.emit(Inst::VStoreHi {
                    src: r,
                    addr: at(abi.sp, (self.wide_offset(r) - self.arg_area) as i64),
                });
            }
        }
        m.sub_imm(abi.sp, self.arg_area as i64);

        let slots = (self.frame_bytes() / u64::from(STACK_SLOT_SIZE)) as u32;
        let mut map = OopMap::new(slots, 0);
        for enc in 0..abi.gp_count() {
            let r = Reg(enc);
            if r == abi.sp || r == abi.fp {
                continue;
            }
            let s = self.slot(self.gp_offset(r));
            map.set_callee_saved(s, r.loc());
            map.set_callee_saved(s.next(), r.loc().next());
        }
        for n in 0..abi.fp_save_count {
            let r = FReg(n);
            let s = self.slot(self.fp_offset(r));
            map.set_callee_saved(s, r.loc());
            map.set_callee_saved(s.next(), r.loc().next());
        }
        // The upper vector lanes have no location the map can name; they are restored but never
        // inspected by the walker.
        map
    }

    /// Emit code undoing [Self::save], leaving the stack pointer at the return address.
    pub fn restore(&self, m: &mut MacroAssembler) {
        let abi = self.abi;
        m.comment("restore live registers");
        m.add_imm(abi.sp, self.arg_area as i64);
        for n in 0..abi.fp_save_count {
            let r = FReg(n);
            if self.wide {
                m.emit(Inst::VLoadHi {
                    dst: r,
                    addr: at(abi.sp, (self.wide_offset(r) - self.arg_area) as i64),
                });
            }
            m.fload(
                r,
                at(abi.sp, (self.fp_offset(r) - self.arg_area) as i64),
                Width::W64,
            );
        }
        m.add_imm(abi.sp, (self.gp_base - self.arg_area) as i64);
        for enc in (0..abi.gp_count()).rev() {
            let r = Reg(enc);
            if r == abi.sp || r == abi.fp {
                m.add_imm(abi.sp, WORD as i64);
            } else {
                m.pop(r);
            }
        }
        m.add_imm(abi.sp, WORD as i64);
        m.emit(Inst::PopFlags);
        m.pop(abi.fp);
    }

    /// Emit code reloading only the result registers and popping the save area, leaving the stack
    /// pointer at the return address. The frame pointer is not restored.
    pub fn restore_result_registers(&self, m: &mut MacroAssembler) {
        let abi = self.abi;
        m.fload(
            abi.fret,
            at(abi.sp, self.fresult_offset() as i64),
            Width::W64,
        );
        m.load(abi.ret, at(abi.sp, self.result_offset() as i64));
        m.load(abi.ret2, at(abi.sp, self.result2_offset() as i64));
        m.add_imm(abi.sp, self.return_offset() as i64);
    }
}
