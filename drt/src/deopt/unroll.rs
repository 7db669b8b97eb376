//! The unroll block: everything the deopt blob needs to replace a compiled frame by interpreter
//! frames, in one C-heap allocation the generated code reads with plain loads.
//!
//! ```text
//!   +0   size of the deoptimized frame   bytes from its sp to its sender's sp
//!   +8   caller adjustment               bytes to extend the sender for the oldest frame's locals
//!   +16  number of frames
//!   +24  total frame sizes               bytes, for the stack bang
//!   +32  frame sizes                     address of the sizes, oldest frame first
//!   +40  frame pcs                       address of the return addresses, one more than frames
//!   +48  initial info                    the frame pointer to start unrolling with
//!   +56  unpack kind                     the exec mode
//!   +64  caller actual parameters
//!   +72  the sizes, then the pcs
//! ```

use super::ExecMode;
use crate::{abi::WORD, mem::Memory};
use deku::prelude::*;

pub const SIZE_OF_DEOPTIMIZED_FRAME: i64 = 0;
pub const CALLER_ADJUSTMENT: i64 = 8;
pub const NUMBER_OF_FRAMES: i64 = 16;
pub const TOTAL_FRAME_SIZES: i64 = 24;
pub const FRAME_SIZES: i64 = 32;
pub const FRAME_PCS: i64 = 40;
pub const INITIAL_INFO: i64 = 48;
pub const UNPACK_KIND: i64 = 56;
pub const CALLER_ACTUAL_PARAMETERS: i64 = 64;
const HEADER_BYTES: u64 = 72;

#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct Header {
    size_of_deoptimized_frame: u64,
    caller_adjustment: u64,
    number_of_frames: u64,
    total_frame_sizes: u64,
    frame_sizes: u64,
    frame_pcs: u64,
    initial_info: u64,
    unpack_kind: u64,
    caller_actual_parameters: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnrollBlock {
    pub size_of_deoptimized_frame: u64,
    pub caller_adjustment: u64,
    pub initial_info: u64,
    pub unpack_kind: ExecMode,
    pub caller_actual_parameters: u32,
    /// Frame sizes in bytes, oldest frame first.
    pub frame_sizes: Vec<u64>,
    /// `frame_pcs[0]` is the return address of the oldest frame (the deoptimized frame's return
    /// address); `frame_pcs[i + 1]` is the pc of frame `i`.
    pub frame_pcs: Vec<u64>,
}

impl UnrollBlock {
    pub fn number_of_frames(&self) -> usize {
        self.frame_sizes.len()
    }

    pub fn total_frame_sizes(&self) -> u64 {
        self.frame_sizes.iter().sum()
    }

    /// Copy this block to the C heap, returning its address.
    pub fn write(&self, mem: &Memory) -> u64 {
        debug_assert_eq!(self.frame_pcs.len(), self.frame_sizes.len() + 1);
        let n = self.frame_sizes.len() as u64;
        let addr = mem.malloc(HEADER_BYTES + (2 * n + 1) * WORD);
        let sizes = addr + HEADER_BYTES;
        let pcs = sizes + n * WORD;
        let h = Header {
            size_of_deoptimized_frame: self.size_of_deoptimized_frame,
            caller_adjustment: self.caller_adjustment,
            number_of_frames: n,
            total_frame_sizes: self.total_frame_sizes(),
            frame_sizes: sizes,
            frame_pcs: pcs,
            initial_info: self.initial_info,
            unpack_kind: self.unpack_kind as u64,
            caller_actual_parameters: u64::from(self.caller_actual_parameters),
        };
        let bytes = h
            .to_bytes()
            .unwrap_or_else(|e| panic!("can't encode unroll block: {e}"));
        mem.write_bytes(addr, &bytes);
        mem.write_words(sizes, &self.frame_sizes);
        mem.write_words(pcs, &self.frame_pcs);
        addr
    }

    /// Read back the block at `addr`.
    ///
    /// # Panics
    ///
    /// If `addr` doesn't hold a well-formed unroll block.
    pub fn read(mem: &Memory, addr: u64) -> Self {
        let bytes = mem.read_bytes(addr, HEADER_BYTES as usize);
        let (_, h) = Header::from_bytes((&bytes, 0))
            .unwrap_or_else(|e| panic!("malformed unroll block at {addr:#x}: {e}"));
        let unpack_kind = u8::try_from(h.unpack_kind)
            .ok()
            .and_then(ExecMode::from_repr)
            .unwrap_or_else(|| {
                panic!("unroll block at {addr:#x} has unpack kind {}", h.unpack_kind)
            });
        let n = h.number_of_frames as usize;
        Self {
            size_of_deoptimized_frame: h.size_of_deoptimized_frame,
            caller_adjustment: h.caller_adjustment,
            initial_info: h.initial_info,
            unpack_kind,
            caller_actual_parameters: h.caller_actual_parameters as u32,
            frame_sizes: mem.read_words(h.frame_sizes, n),
            frame_pcs: mem.read_words(h.frame_pcs, n + 1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::TestRuntime;

    #[test]
    fn layout_seen_by_generated_code() {
        let t = TestRuntime::new();
        let mem = &t.rt.mem;
        let ub = UnrollBlock {
            size_of_deoptimized_frame: 0x40,
            caller_adjustment: 0x10,
            initial_info: 0x3000_1000,
            unpack_kind: ExecMode::UncommonTrap,
            caller_actual_parameters: 2,
            frame_sizes: vec![0x60, 0x78],
            frame_pcs: vec![0x4000_0010, 0x4000_0004, 0x4000_0008],
        };
        let a = ub.write(mem);
        let w = |off: i64| mem.read_u64(a + off as u64);
        assert_eq!(w(SIZE_OF_DEOPTIMIZED_FRAME), 0x40);
        assert_eq!(w(NUMBER_OF_FRAMES), 2);
        assert_eq!(w(TOTAL_FRAME_SIZES), 0xd8);
        assert_eq!(w(UNPACK_KIND), ExecMode::UncommonTrap as u64);
        assert_eq!(w(CALLER_ACTUAL_PARAMETERS), 2);
        assert_eq!(mem.read_u64(w(FRAME_SIZES) + 8), 0x78);
        assert_eq!(mem.read_u64(w(FRAME_PCS)), 0x4000_0010);
        assert_eq!(UnrollBlock::read(mem, a), ub);
        mem.free(a);
    }
}
