//! Platform ABI descriptors.
//!
//! Everything the generators need to know about a target platform lives in one static [Abi]
//! value: which registers carry managed and native arguments, which registers a native callee may
//! clobber, the scratch registers stub generators may use, and the stack alignment rules. Code
//! generators are parameterised by an `&'static Abi` and never hard-code a register.

use drtmap::Location;
use std::fmt;
use strum::{Display, EnumIter};

pub mod x64;

/// The size of a machine word in bytes.
pub const WORD: u64 = 8;

/// A general purpose register, named by its hardware encoding.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Reg(pub u8);

impl Reg {
    pub fn loc(self) -> Location {
        Location::gp(self.0)
    }

    pub fn from_loc(loc: Location) -> Self {
        match loc.storage() {
            Location::Gp { enc, .. } => Reg(enc),
            _ => panic!("{loc} is not a general purpose register"),
        }
    }
}

/// A float register, named by its hardware encoding.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FReg(pub u8);

impl FReg {
    pub fn loc(self) -> Location {
        Location::fp(self.0)
    }

    pub fn from_loc(loc: Location) -> Self {
        match loc.storage() {
            Location::Fp { enc, .. } => FReg(enc),
            _ => panic!("{loc} is not a float register"),
        }
    }
}

/// The types that can appear in a method signature.
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum BasicType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
    Object,
    Array,
    /// The placeholder following the first half of a [BasicType::Long] or [BasicType::Double].
    Void,
    /// A raw machine address. Only valid in native signatures.
    Address,
}

impl BasicType {
    pub fn is_reference(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }

    pub fn is_double_word(self) -> bool {
        matches!(self, BasicType::Long | BasicType::Double)
    }

    pub fn is_float(self) -> bool {
        matches!(self, BasicType::Float | BasicType::Double)
    }

    /// How many interpreter stack elements a value of this type occupies.
    pub fn size(self) -> u32 {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void => 0,
            _ => 1,
        }
    }

    /// The signature character for this type.
    pub fn to_char(self) -> char {
        match self {
            BasicType::Boolean => 'Z',
            BasicType::Char => 'C',
            BasicType::Float => 'F',
            BasicType::Double => 'D',
            BasicType::Byte => 'B',
            BasicType::Short => 'S',
            BasicType::Int => 'I',
            BasicType::Long => 'J',
            BasicType::Object => 'L',
            BasicType::Array => '[',
            BasicType::Void => 'V',
            BasicType::Address => 'A',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'Z' => BasicType::Boolean,
            'C' => BasicType::Char,
            'F' => BasicType::Float,
            'D' => BasicType::Double,
            'B' => BasicType::Byte,
            'S' => BasicType::Short,
            'I' => BasicType::Int,
            'J' => BasicType::Long,
            'L' => BasicType::Object,
            '[' => BasicType::Array,
            'V' => BasicType::Void,
            'A' => BasicType::Address,
            _ => return None,
        })
    }
}

/// Expand declared parameter types into the one-entry-per-slot form used by the calling
/// conventions: every [BasicType::Long] and [BasicType::Double] is followed by a
/// [BasicType::Void].
pub fn expand_signature(params: &[BasicType]) -> Vec<BasicType> {
    let mut out = Vec::with_capacity(params.len() * 2);
    for &t in params {
        out.push(t);
        if t.is_double_word() {
            out.push(BasicType::Void);
        }
    }
    out
}

/// Parse a compact signature string such as `"LIJD"` into expanded form.
///
/// # Panics
///
/// If the string contains a character which is not a type.
pub fn parse_signature(s: &str) -> Vec<BasicType> {
    let params = s
        .chars()
        .map(|c| BasicType::from_char(c).unwrap_or_else(|| panic!("bad signature char {c:?}")))
        .collect::<Vec<_>>();
    expand_signature(&params)
}

/// Everything generated code needs to know about one platform's calling conventions.
pub struct Abi {
    pub name: &'static str,
    pub gp_names: &'static [&'static str],
    pub fp_names: &'static [&'static str],
    pub sp: Reg,
    pub fp: Reg,
    /// Integer argument registers of the managed calling convention, in order.
    pub java_int_args: &'static [Reg],
    pub java_fp_args: &'static [FReg],
    /// Integer argument registers of the native calling convention, in order.
    pub c_int_args: &'static [Reg],
    pub c_fp_args: &'static [FReg],
    /// Does a native argument in one register class consume the same-numbered register of the
    /// other class (and a home slot on the stack)?
    pub c_shadow_args: bool,
    /// The minimum number of outgoing native stack slots, whatever the signature.
    pub c_min_stack_slots: u32,
    /// Bytes a native caller must reserve below its outgoing arguments for the callee.
    pub arg_reg_save_area_bytes: u32,
    pub stack_alignment: u64,
    /// Integer result register.
    pub ret: Reg,
    /// Secondary result register (exception pc, high half on 32-bit platforms).
    pub ret2: Reg,
    pub fret: FReg,
    /// Scratch register for move cycles and general use in stubs.
    pub scratch: Reg,
    pub scratch2: Reg,
    pub fscratch: FReg,
    /// Holds the callee method on entry to adapters and interpreter entries.
    pub method_reg: Reg,
    /// Holds the caller's stack pointer on entry to the interpreter.
    pub sender_sp_reg: Reg,
    /// Callee-saved registers generators can rely on surviving a runtime call.
    pub saved: [Reg; 3],
    /// Registers a native callee must preserve.
    pub c_callee_saved: &'static [Reg],
    pub c_callee_saved_fp: &'static [FReg],
    /// How far the unextended stack pointer of a frame returning into a deopt handler is from its
    /// stack pointer.
    pub deopt_unextended_sp_adjust: u64,
    /// The number of float registers the register saver preserves.
    pub fp_save_count: u8,
}

impl Abi {
    pub fn gp_count(&self) -> u8 {
        self.gp_names.len() as u8
    }

    pub fn fp_count(&self) -> u8 {
        self.fp_names.len() as u8
    }

    pub fn is_c_callee_saved(&self, r: Reg) -> bool {
        r == self.sp || r == self.fp || self.c_callee_saved.contains(&r)
    }

    pub fn is_c_callee_saved_fp(&self, r: FReg) -> bool {
        self.c_callee_saved_fp.contains(&r)
    }

    /// Registers a native call may clobber.
    pub fn c_caller_saved(&self) -> impl Iterator<Item = Reg> + '_ {
        (0..self.gp_count())
            .map(Reg)
            .filter(|r| !self.is_c_callee_saved(*r))
    }

    pub fn c_caller_saved_fp(&self) -> impl Iterator<Item = FReg> + '_ {
        (0..self.fp_count())
            .map(FReg)
            .filter(|r| !self.is_c_callee_saved_fp(*r))
    }

    /// The stack alignment expressed in 32-bit stack slots.
    pub fn stack_alignment_in_slots(&self) -> u32 {
        (self.stack_alignment / 4) as u32
    }

    pub fn gp_name(&self, r: Reg) -> &'static str {
        self.gp_names[usize::from(r.0)]
    }

    pub fn fp_name(&self, r: FReg) -> &'static str {
        self.fp_names[usize::from(r.0)]
    }

    /// Render a location using this platform's register names.
    pub fn loc_name(&self, loc: Location) -> String {
        match loc {
            Location::Gp { enc, hi } => {
                format!("{}{}", self.gp_name(Reg(enc)), if hi { ".H" } else { "" })
            }
            Location::Fp { enc, hi } => {
                format!("{}{}", self.fp_name(FReg(enc)), if hi { ".H" } else { "" })
            }
            Location::Stack(_) => loc.to_string(),
        }
    }
}

impl fmt::Debug for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Abi({})", self.name)
    }
}

/// Round `x` up to a multiple of `align`, which must be a power of two.
pub fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn signatures() {
        assert_eq!(
            parse_signature("LJI"),
            vec![
                BasicType::Object,
                BasicType::Long,
                BasicType::Void,
                BasicType::Int
            ]
        );
        assert_eq!(BasicType::Double.size(), 2);
        assert_eq!(BasicType::from_char('['), Some(BasicType::Array));
        assert_eq!(BasicType::from_char('Q'), None);
    }

    #[test]
    fn caller_saved_sets() {
        let sysv = &x64::X64_SYSV;
        let clobbered = sysv.c_caller_saved().collect::<Vec<_>>();
        assert!(clobbered.contains(&x64::RAX));
        assert!(clobbered.contains(&x64::RDI));
        assert!(!clobbered.contains(&x64::RBX));
        assert!(!clobbered.contains(&x64::RSP));
        let win = &x64::X64_WIN64;
        assert!(!win.c_caller_saved().any(|r| r == x64::RSI));
        assert_eq!(win.c_caller_saved_fp().count(), 6);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(sysv.loc_name(x64::RBX.loc().next()), "rbx.H");
    }
}
