//! The x86_64 descriptors: System V (Linux, BSD, macOS) and Windows x64.

use super::{Abi, FReg, Reg};

pub const RAX: Reg = Reg(0);
pub const RCX: Reg = Reg(1);
pub const RDX: Reg = Reg(2);
pub const RBX: Reg = Reg(3);
pub const RSP: Reg = Reg(4);
pub const RBP: Reg = Reg(5);
pub const RSI: Reg = Reg(6);
pub const RDI: Reg = Reg(7);
pub const R8: Reg = Reg(8);
pub const R9: Reg = Reg(9);
pub const R10: Reg = Reg(10);
pub const R11: Reg = Reg(11);
pub const R12: Reg = Reg(12);
pub const R13: Reg = Reg(13);
pub const R14: Reg = Reg(14);
pub const R15: Reg = Reg(15);

pub const XMM0: FReg = FReg(0);
pub const XMM1: FReg = FReg(1);
pub const XMM2: FReg = FReg(2);
pub const XMM3: FReg = FReg(3);
pub const XMM4: FReg = FReg(4);
pub const XMM5: FReg = FReg(5);
pub const XMM6: FReg = FReg(6);
pub const XMM7: FReg = FReg(7);
pub const XMM15: FReg = FReg(15);

const GP_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

const FP_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

const FP_ARGS: [FReg; 8] = [XMM0, XMM1, XMM2, XMM3, XMM4, XMM5, XMM6, XMM7];

pub static X64_SYSV: Abi = Abi {
    name: "x86_64-sysv",
    gp_names: &GP_NAMES,
    fp_names: &FP_NAMES,
    sp: RSP,
    fp: RBP,
    // The managed convention is the native one rotated by one, so that a native wrapper can
    // insert the environment argument without moving every register.
    java_int_args: &[RSI, RDX, RCX, R8, R9, RDI],
    java_fp_args: &FP_ARGS,
    c_int_args: &[RDI, RSI, RDX, RCX, R8, R9],
    c_fp_args: &FP_ARGS,
    c_shadow_args: false,
    c_min_stack_slots: 0,
    arg_reg_save_area_bytes: 0,
    stack_alignment: 16,
    ret: RAX,
    ret2: RDX,
    fret: XMM0,
    scratch: R10,
    scratch2: R11,
    fscratch: XMM15,
    method_reg: RBX,
    sender_sp_reg: R13,
    saved: [R12, R14, R15],
    c_callee_saved: &[RBX, R12, R13, R14, R15],
    c_callee_saved_fp: &[],
    deopt_unextended_sp_adjust: 0,
    fp_save_count: 16,
};

pub static X64_WIN64: Abi = Abi {
    name: "x86_64-win64",
    gp_names: &GP_NAMES,
    fp_names: &FP_NAMES,
    sp: RSP,
    fp: RBP,
    java_int_args: &[RDX, R8, R9, RDI, RSI, RCX],
    java_fp_args: &FP_ARGS,
    c_int_args: &[RCX, RDX, R8, R9],
    c_fp_args: &[XMM0, XMM1, XMM2, XMM3],
    c_shadow_args: true,
    // The callee may spill its four register arguments into a home area the caller reserves.
    c_min_stack_slots: 8,
    arg_reg_save_area_bytes: 32,
    stack_alignment: 16,
    ret: RAX,
    ret2: RDX,
    fret: XMM0,
    scratch: R10,
    scratch2: R11,
    fscratch: XMM15,
    method_reg: RBX,
    sender_sp_reg: R13,
    saved: [R12, R14, R15],
    c_callee_saved: &[RBX, RSI, RDI, R12, R13, R14, R15],
    c_callee_saved_fp: &[
        XMM6,
        XMM7,
        FReg(8),
        FReg(9),
        FReg(10),
        FReg(11),
        FReg(12),
        FReg(13),
        FReg(14),
        XMM15,
    ],
    deopt_unextended_sp_adjust: 0,
    fp_save_count: 16,
};

/// The descriptor for the platform this crate was built for.
pub fn host() -> &'static Abi {
    if cfg!(windows) {
        &X64_WIN64
    } else {
        &X64_SYSV
    }
}
