//! Calling-convention resolution.
//!
//! Given an expanded signature (see [crate::abi::expand_signature]) a convention assigns every
//! argument a [VMRegPair]. Integer-like and reference arguments draw from the integer argument
//! registers, floats and doubles from the float argument registers, each with its own cursor.
//! Arguments that don't fit spill to the stack where every argument, whatever its width, takes
//! two 32-bit slots. Stack slots are numbered from the stack pointer at the call (managed) or
//! from the start of the outgoing argument area (native).

use crate::abi::{Abi, BasicType};
use drtmap::{Location, VMRegPair};
use parking_lot::RwLock;
use std::{collections::HashMap, fmt, sync::Arc};

/// Signatures may not need more interpreter slots than this.
pub const MAX_ARG_SLOTS: u32 = 255;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Convention {
    /// Compiled managed code.
    Java,
    /// The platform's native convention.
    C,
}

/// The location of every argument of one signature under one convention.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArgumentLayout {
    sig: Vec<BasicType>,
    regs: Vec<VMRegPair>,
    /// The number of 32-bit stack slots the outgoing arguments need, always even.
    stack_slots: u32,
}

impl ArgumentLayout {
    pub fn sig(&self) -> &[BasicType] {
        &self.sig
    }

    pub fn regs(&self) -> &[VMRegPair] {
        &self.regs
    }

    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    /// Iterate over the `(type, location)` of every argument, skipping the placeholder halves of
    /// 64-bit arguments.
    pub fn args(&self) -> impl Iterator<Item = (BasicType, VMRegPair)> + '_ {
        self.sig
            .iter()
            .zip(self.regs.iter())
            .filter(|(t, _)| **t != BasicType::Void)
            .map(|(t, r)| (*t, *r))
    }

    /// The highest stack slot used by any argument, plus one.
    pub fn max_stack_slot(&self) -> u32 {
        self.regs
            .iter()
            .filter_map(|r| r.first())
            .filter(|l| l.is_stack())
            .map(|l| l.stack_slot() + 2)
            .max()
            .unwrap_or(0)
    }
}

impl fmt::Display for ArgumentLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (t, r)) in self.sig.iter().zip(self.regs.iter()).enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}:{r}", t.to_char())?;
        }
        write!(f, " slots={}", self.stack_slots)
    }
}

/// Check the structural rules every expanded signature must obey.
///
/// # Panics
///
/// On a malformed signature: a 64-bit type not followed by its placeholder, a stray placeholder,
/// an address in a managed signature, or more arguments than can be expressed.
fn check_signature(sig: &[BasicType], conv: Convention) {
    for (i, &t) in sig.iter().enumerate() {
        match t {
            BasicType::Long | BasicType::Double => {
                assert!(
                    sig.get(i + 1) == Some(&BasicType::Void),
                    "malformed signature: {t} at {i} is not followed by its second half"
                );
            }
            BasicType::Void => {
                assert!(
                    i > 0 && sig[i - 1].is_double_word(),
                    "malformed signature: stray second half at {i}"
                );
            }
            BasicType::Address => {
                assert!(
                    conv == Convention::C,
                    "malformed signature: raw address at {i} in a managed signature"
                );
            }
            _ => (),
        }
    }
    assert!(
        sig.len() as u32 <= MAX_ARG_SLOTS,
        "argument shape cannot be expressed: {} slots exceeds {MAX_ARG_SLOTS}",
        sig.len()
    );
}

/// Resolve `sig` under the managed calling convention.
pub fn java_calling_convention(abi: &Abi, sig: &[BasicType]) -> ArgumentLayout {
    check_signature(sig, Convention::Java);
    let mut int_args = 0;
    let mut fp_args = 0;
    let mut stk_args = 0;
    let mut regs = Vec::with_capacity(sig.len());
    for &t in sig {
        let r = match t {
            BasicType::Void => VMRegPair::bad(),
            BasicType::Boolean
            | BasicType::Char
            | BasicType::Byte
            | BasicType::Short
            | BasicType::Int => {
                if let Some(r) = abi.java_int_args.get(int_args) {
                    int_args += 1;
                    VMRegPair::set1(r.loc())
                } else {
                    let p = VMRegPair::set1(Location::stack(stk_args));
                    stk_args += 2;
                    p
                }
            }
            BasicType::Long | BasicType::Object | BasicType::Array | BasicType::Address => {
                if let Some(r) = abi.java_int_args.get(int_args) {
                    int_args += 1;
                    VMRegPair::set2(r.loc())
                } else {
                    let p = VMRegPair::set2(Location::stack(stk_args));
                    stk_args += 2;
                    p
                }
            }
            BasicType::Float => {
                if let Some(r) = abi.java_fp_args.get(fp_args) {
                    fp_args += 1;
                    VMRegPair::set1(r.loc())
                } else {
                    let p = VMRegPair::set1(Location::stack(stk_args));
                    stk_args += 2;
                    p
                }
            }
            BasicType::Double => {
                if let Some(r) = abi.java_fp_args.get(fp_args) {
                    fp_args += 1;
                    VMRegPair::set2(r.loc())
                } else {
                    let p = VMRegPair::set2(Location::stack(stk_args));
                    stk_args += 2;
                    p
                }
            }
        };
        regs.push(r);
    }
    ArgumentLayout {
        sig: sig.to_vec(),
        regs,
        stack_slots: (stk_args + 1) & !1,
    }
}

/// Resolve `sig` under the platform's native calling convention.
pub fn c_calling_convention(abi: &Abi, sig: &[BasicType]) -> ArgumentLayout {
    check_signature(sig, Convention::C);
    let mut int_args = 0;
    let mut fp_args = 0;
    let mut stk_args = 0;
    let mut regs = Vec::with_capacity(sig.len());
    for &t in sig {
        let (is_float, double_word) = match t {
            BasicType::Void => {
                regs.push(VMRegPair::bad());
                continue;
            }
            BasicType::Float => (true, false),
            BasicType::Double => (true, true),
            BasicType::Boolean
            | BasicType::Char
            | BasicType::Byte
            | BasicType::Short
            | BasicType::Int => (false, false),
            BasicType::Long | BasicType::Object | BasicType::Array | BasicType::Address => {
                (false, true)
            }
        };
        let reg = if is_float {
            abi.c_fp_args.get(fp_args).map(|r| r.loc())
        } else {
            abi.c_int_args.get(int_args).map(|r| r.loc())
        };
        let loc = match reg {
            Some(r) => {
                if abi.c_shadow_args {
                    // One positional cursor for both classes, plus a home slot pair.
                    int_args += 1;
                    fp_args += 1;
                    stk_args += 2;
                } else if is_float {
                    fp_args += 1;
                } else {
                    int_args += 1;
                }
                r
            }
            None => {
                let l = Location::stack(stk_args);
                stk_args += 2;
                l
            }
        };
        regs.push(if double_word {
            VMRegPair::set2(loc)
        } else {
            VMRegPair::set1(loc)
        });
    }
    let stk_args = stk_args.max(abi.c_min_stack_slots);
    ArgumentLayout {
        sig: sig.to_vec(),
        regs,
        stack_slots: (stk_args + 1) & !1,
    }
}

/// Resolve `sig` under `conv`.
pub fn resolve(abi: &Abi, sig: &[BasicType], conv: Convention) -> ArgumentLayout {
    match conv {
        Convention::Java => java_calling_convention(abi, sig),
        Convention::C => c_calling_convention(abi, sig),
    }
}

/// A content-addressed cache of resolved layouts. Resolution is pure, so racing resolvers of the
/// same key produce identical layouts and whichever is inserted first is shared.
pub struct CallConvCache {
    abi: &'static Abi,
    map: RwLock<HashMap<(Vec<BasicType>, bool, Convention), Arc<ArgumentLayout>>>,
}

impl CallConvCache {
    pub fn new(abi: &'static Abi) -> Self {
        Self {
            abi,
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, sig: &[BasicType], is_static: bool, conv: Convention) -> Arc<ArgumentLayout> {
        let key = (sig.to_vec(), is_static, conv);
        if let Some(x) = self.map.read().get(&key) {
            return Arc::clone(x);
        }
        let layout = Arc::new(resolve(self.abi, sig, conv));
        Arc::clone(self.map.write().entry(key).or_insert(layout))
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::abi::{parse_signature, x64::*};
    use proptest::prelude::*;

    fn show(abi: &Abi, l: &ArgumentLayout) -> String {
        l.args()
            .map(|(_, r)| abi.loc_name(r.first().unwrap()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn java_sysv() {
        let abi = &X64_SYSV;
        let l = java_calling_convention(abi, &parse_signature("LIJFDIIIIF"));
        assert_eq!(
            show(abi, &l),
            "rsi rdx rcx xmm0 xmm1 r8 r9 rdi [sp+0] xmm2"
        );
        assert_eq!(l.stack_slots(), 2);
        // The long's second half shares its register.
        assert_eq!(l.regs()[2].second(), Some(RCX.loc().next()));
        assert!(!l.regs()[3].is_valid());
    }

    #[test]
    fn java_spills_are_two_slots() {
        let abi = &X64_SYSV;
        let l = java_calling_convention(abi, &parse_signature("IIIIIIIJI"));
        assert_eq!(
            l.regs()[6].first(),
            Some(Location::stack(0))
        );
        assert_eq!(l.regs()[7].first(), Some(Location::stack(2)));
        assert_eq!(l.regs()[7].second(), Some(Location::stack(3)));
        assert_eq!(l.regs()[9].first(), Some(Location::stack(4)));
        assert_eq!(l.stack_slots(), 6);
    }

    #[test]
    fn c_sysv_independent_cursors() {
        let abi = &X64_SYSV;
        let l = c_calling_convention(abi, &parse_signature("AIDFJ"));
        assert_eq!(show(abi, &l), "rdi rsi xmm0 xmm1 rdx");
        assert_eq!(l.stack_slots(), 0);
    }

    #[test]
    fn c_win64_shadows() {
        let abi = &X64_WIN64;
        let l = c_calling_convention(abi, &parse_signature("AIDFJ"));
        // Positional: the fifth argument goes to the stack after the four home slot pairs.
        assert_eq!(show(abi, &l), "rcx rdx xmm2 xmm3 [sp+32]");
        assert_eq!(l.stack_slots(), 10);
        let l = c_calling_convention(abi, &parse_signature("A"));
        assert_eq!(l.stack_slots(), 8);
    }

    #[test]
    #[should_panic(expected = "not followed by its second half")]
    fn malformed_long() {
        java_calling_convention(&X64_SYSV, &[BasicType::Long, BasicType::Int]);
    }

    #[test]
    #[should_panic(expected = "stray second half")]
    fn malformed_void() {
        java_calling_convention(&X64_SYSV, &[BasicType::Void]);
    }

    #[test]
    #[should_panic(expected = "raw address")]
    fn address_in_managed() {
        java_calling_convention(&X64_SYSV, &[BasicType::Address]);
    }

    #[test]
    fn cache_shares_layouts() {
        let c = CallConvCache::new(&X64_SYSV);
        let a = c.get(&parse_signature("LI"), false, Convention::Java);
        let b = c.get(&parse_signature("LI"), false, Convention::Java);
        assert!(Arc::ptr_eq(&a, &b));
        c.get(&parse_signature("LI"), true, Convention::Java);
        c.get(&parse_signature("LI"), false, Convention::C);
        assert_eq!(c.len(), 3);
    }

    fn any_type() -> impl Strategy<Value = BasicType> {
        prop_oneof![
            Just(BasicType::Int),
            Just(BasicType::Boolean),
            Just(BasicType::Long),
            Just(BasicType::Object),
            Just(BasicType::Float),
            Just(BasicType::Double),
        ]
    }

    proptest! {
        #[test]
        fn layouts_are_disjoint(
            params in prop::collection::vec(any_type(), 0..20),
            win in any::<bool>(),
        ) {
            let abi = if win { &X64_WIN64 } else { &X64_SYSV };
            let sig = crate::abi::expand_signature(&params);
            for conv in [Convention::Java, Convention::C] {
                let l = resolve(abi, &sig, conv);
                let mut seen = std::collections::HashSet::new();
                for (t, r) in l.args() {
                    let first = r.first().unwrap();
                    prop_assert!(seen.insert(first.storage()));
                    prop_assert_eq!(r.second().is_some(), t.is_double_word() || t.is_reference());
                    if first.is_stack() {
                        prop_assert_eq!(first.stack_slot() % 2, 0);
                        prop_assert!(first.stack_slot() + 2 <= l.stack_slots());
                    } else {
                        prop_assert_eq!(first.is_fp(), t.is_float());
                    }
                }
                prop_assert_eq!(l.stack_slots() % 2, 0);
            }
        }
    }
}
