#![allow(clippy::new_without_default)]

//! Frame maps for generated code.
//!
//! Every call site in a generated code blob that can be stopped at (a safepoint, a runtime call,
//! a call out to another method) has an [OopMap] describing which registers and stack slots hold
//! values the collector and the deoptimizer care about. Maps are built while code is generated
//! and are immutable afterwards: a blob's [OopMapSet] can be read concurrently by any number of
//! threads.
//!
//! Locations are described with [Location], which names either (one half of) a general purpose
//! register, (one half of) a float register, or a 32-bit stack slot relative to a frame's
//! unextended stack pointer. A 64-bit value occupies a [VMRegPair].
//!
//! Maps can be packed into a compact byte stream ([OopMap::encode]) where each entry is a 32-bit
//! word: 3 bits of kind, 13 bits of location and 16 bits of "content" location (the caller
//! register for callee-saved entries, the base for derived pointers). A location that cannot be
//! represented in its field is an internal error and is fatal.

use deku::prelude::*;
use std::{error::Error, fmt};
use strum::FromRepr;

/// The number of general purpose register encodings a [Location] can name.
pub const MAX_GP_REGS: u8 = 32;
/// The number of float register encodings a [Location] can name.
pub const MAX_FP_REGS: u8 = 32;
/// The numeric encoding of the first stack slot: registers (two halves each) come first.
pub const STACK0: u32 = 2 * (MAX_GP_REGS as u32 + MAX_FP_REGS as u32);
/// The size in bytes of one stack slot.
pub const STACK_SLOT_SIZE: u32 = 4;
/// How many stack slots make up a machine word.
pub const SLOTS_PER_WORD: u32 = 2;

const KIND_BITS: usize = 3;
const REG_BITS: usize = 13;
const CONTENT_BITS: usize = 16;

/// A place a value can live in at a given point in generated code.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Location {
    /// A general purpose register. `hi` names the upper 32-bit half.
    Gp { enc: u8, hi: bool },
    /// A float register. `hi` names the upper 32-bit half.
    Fp { enc: u8, hi: bool },
    /// A 32-bit stack slot, counted upwards from the frame's unextended stack pointer.
    Stack(u32),
}

impl Location {
    pub fn gp(enc: u8) -> Self {
        assert!(enc < MAX_GP_REGS);
        Location::Gp { enc, hi: false }
    }

    pub fn fp(enc: u8) -> Self {
        assert!(enc < MAX_FP_REGS);
        Location::Fp { enc, hi: false }
    }

    pub fn stack(slot: u32) -> Self {
        Location::Stack(slot)
    }

    /// The location holding the upper half of a 64-bit value whose lower half is in `self`.
    pub fn next(self) -> Self {
        match self {
            Location::Gp { enc, hi: false } => Location::Gp { enc, hi: true },
            Location::Fp { enc, hi: false } => Location::Fp { enc, hi: true },
            Location::Stack(s) => Location::Stack(s + 1),
            Location::Gp { hi: true, .. } | Location::Fp { hi: true, .. } => {
                panic!("{self} has no next half")
            }
        }
    }

    pub fn is_reg(self) -> bool {
        !self.is_stack()
    }

    pub fn is_gp(self) -> bool {
        matches!(self, Location::Gp { .. })
    }

    pub fn is_fp(self) -> bool {
        matches!(self, Location::Fp { .. })
    }

    pub fn is_stack(self) -> bool {
        matches!(self, Location::Stack(_))
    }

    /// Does this location name an upper register half?
    pub fn is_hi(self) -> bool {
        matches!(
            self,
            Location::Gp { hi: true, .. } | Location::Fp { hi: true, .. }
        )
    }

    /// The same physical storage as `self`, ignoring which register half is named. Two locations
    /// alias if and only if their storage is equal.
    pub fn storage(self) -> Self {
        match self {
            Location::Gp { enc, .. } => Location::Gp { enc, hi: false },
            Location::Fp { enc, .. } => Location::Fp { enc, hi: false },
            Location::Stack(_) => self,
        }
    }

    /// The stack slot index of a stack location.
    ///
    /// # Panics
    ///
    /// If `self` is a register.
    pub fn stack_slot(self) -> u32 {
        match self {
            Location::Stack(s) => s,
            _ => panic!("{self} is not a stack slot"),
        }
    }

    /// The byte offset of a stack location from the base it is relative to.
    pub fn stack_offset(self) -> u64 {
        u64::from(self.stack_slot()) * u64::from(STACK_SLOT_SIZE)
    }

    /// The flat numeric encoding used in the packed stream.
    pub fn encode(self) -> u32 {
        match self {
            Location::Gp { enc, hi } => u32::from(enc) * 2 + u32::from(hi),
            Location::Fp { enc, hi } => {
                2 * u32::from(MAX_GP_REGS) + u32::from(enc) * 2 + u32::from(hi)
            }
            Location::Stack(s) => STACK0 + s,
        }
    }

    pub fn decode(x: u32) -> Self {
        if x < 2 * u32::from(MAX_GP_REGS) {
            Location::Gp {
                enc: (x / 2) as u8,
                hi: x % 2 == 1,
            }
        } else if x < STACK0 {
            let x = x - 2 * u32::from(MAX_GP_REGS);
            Location::Fp {
                enc: (x / 2) as u8,
                hi: x % 2 == 1,
            }
        } else {
            Location::Stack(x - STACK0)
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Gp { enc, hi: false } => write!(f, "r{enc}"),
            Location::Gp { enc, hi: true } => write!(f, "r{enc}.H"),
            Location::Fp { enc, hi: false } => write!(f, "f{enc}"),
            Location::Fp { enc, hi: true } => write!(f, "f{enc}.H"),
            Location::Stack(s) => write!(f, "[sp+{}]", s * STACK_SLOT_SIZE),
        }
    }
}

/// The location(s) of one argument or value. A 32-bit value uses only `first`; a 64-bit value
/// additionally records its upper half in `second`, even if both halves share one register.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct VMRegPair {
    first: Option<Location>,
    second: Option<Location>,
}

impl VMRegPair {
    /// A pair that names nothing, used for the placeholder half of a 64-bit argument.
    pub fn bad() -> Self {
        Self::default()
    }

    pub fn set1(loc: Location) -> Self {
        Self {
            first: Some(loc),
            second: None,
        }
    }

    pub fn set2(loc: Location) -> Self {
        Self {
            first: Some(loc),
            second: Some(loc.next()),
        }
    }

    pub fn first(&self) -> Option<Location> {
        self.first
    }

    pub fn second(&self) -> Option<Location> {
        self.second
    }

    pub fn is_valid(&self) -> bool {
        self.first.is_some()
    }

    pub fn is_single(&self) -> bool {
        self.first.is_some() && self.second.is_none()
    }
}

impl fmt::Display for VMRegPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.first, self.second) {
            (None, _) => write!(f, "-"),
            (Some(x), None) => write!(f, "{x}"),
            (Some(x), Some(y)) => write!(f, "{x}:{y}"),
        }
    }
}

/// What the collector or deoptimizer should make of the value in a location.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OopMapKind {
    /// A full width reference.
    Oop,
    /// A compressed reference.
    NarrowOop,
    /// The location holds the saved value of the caller's register.
    CalleeSaved(Location),
    /// A pointer derived from the reference held in the base location.
    Derived(Location),
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, FromRepr, PartialEq)]
enum KindTag {
    Oop = 0,
    NarrowOop = 1,
    CalleeSaved = 2,
    Derived = 3,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct OopMapValue {
    pub reg: Location,
    pub kind: OopMapKind,
}

impl OopMapValue {
    pub fn content_reg(&self) -> Option<Location> {
        match self.kind {
            OopMapKind::CalleeSaved(x) | OopMapKind::Derived(x) => Some(x),
            OopMapKind::Oop | OopMapKind::NarrowOop => None,
        }
    }

    fn pack(&self) -> PackedValue {
        let (tag, content) = match self.kind {
            OopMapKind::Oop => (KindTag::Oop, 0),
            OopMapKind::NarrowOop => (KindTag::NarrowOop, 0),
            OopMapKind::CalleeSaved(x) => (KindTag::CalleeSaved, check_fits(x, CONTENT_BITS)),
            OopMapKind::Derived(x) => (KindTag::Derived, check_fits(x, CONTENT_BITS)),
        };
        PackedValue {
            kind: tag as u8,
            reg: check_fits(self.reg, REG_BITS),
            content,
        }
    }

    fn unpack(p: &PackedValue) -> Result<Self, DecodeError> {
        let reg = Location::decode(u32::from(p.reg));
        let kind = match KindTag::from_repr(p.kind).ok_or(DecodeError::BadKind(p.kind))? {
            KindTag::Oop => OopMapKind::Oop,
            KindTag::NarrowOop => OopMapKind::NarrowOop,
            KindTag::CalleeSaved => OopMapKind::CalleeSaved(Location::decode(u32::from(p.content))),
            KindTag::Derived => OopMapKind::Derived(Location::decode(u32::from(p.content))),
        };
        Ok(Self { reg, kind })
    }
}

impl fmt::Display for OopMapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OopMapKind::Oop => write!(f, "{}=Oop", self.reg),
            OopMapKind::NarrowOop => write!(f, "{}=NarrowOop", self.reg),
            OopMapKind::CalleeSaved(x) => write!(f, "{}=Callers_{x}", self.reg),
            OopMapKind::Derived(x) => write!(f, "{}=Derived_oop_{x}", self.reg),
        }
    }
}

/// Check that `loc` can be represented in a field of `bits` bits.
///
/// # Panics
///
/// If it can't: a map that silently dropped bits would point the collector at the wrong slot.
fn check_fits(loc: Location, bits: usize) -> u16 {
    let x = loc.encode();
    if x >= 1 << bits {
        panic!("oop map location {loc} (encoding {x}) overflows its {bits}-bit field");
    }
    x as u16
}

/// The on-stream form of one [OopMapValue].
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct PackedValue {
    #[deku(bits = "3")]
    kind: u8,
    #[deku(bits = "13")]
    reg: u16,
    content: u16,
}

const PACKED_VALUE_BYTES: usize = (KIND_BITS + REG_BITS + CONTENT_BITS) / 8;
const HEADER_BYTES: usize = 12;

#[derive(Debug)]
pub enum DecodeError {
    Truncated,
    BadKind(u8),
    Deku(DekuError),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "oop map stream is truncated"),
            DecodeError::BadKind(k) => write!(f, "unknown oop map value kind {k}"),
            DecodeError::Deku(e) => write!(f, "malformed oop map value: {e}"),
        }
    }
}

impl Error for DecodeError {}

/// The map for one call site.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OopMap {
    pc_offset: u32,
    /// The size of the frame in stack slots.
    frame_size: u32,
    /// The number of incoming argument slots the map may claim in the caller's frame.
    arg_count: u32,
    values: Vec<OopMapValue>,
}

impl OopMap {
    pub fn new(frame_size: u32, arg_count: u32) -> Self {
        Self {
            pc_offset: 0,
            frame_size,
            arg_count,
            values: Vec::new(),
        }
    }

    pub fn pc_offset(&self) -> u32 {
        self.pc_offset
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn arg_count(&self) -> u32 {
        self.arg_count
    }

    fn set_value(&mut self, reg: Location, kind: OopMapKind) {
        if let Location::Stack(s) = reg {
            assert!(
                s < self.frame_size + self.arg_count,
                "stack slot {s} lies outside a frame of {} slots",
                self.frame_size + self.arg_count
            );
        }
        let v = OopMapValue { reg, kind };
        // Validate eagerly so that the failure points at the generator rather than the encoder.
        v.pack();
        self.values.push(v);
    }

    pub fn set_oop(&mut self, reg: Location) {
        self.set_value(reg, OopMapKind::Oop);
    }

    pub fn set_narrow_oop(&mut self, reg: Location) {
        self.set_value(reg, OopMapKind::NarrowOop);
    }

    /// Record that `reg` holds the saved value of the caller's register `caller_reg`.
    pub fn set_callee_saved(&mut self, reg: Location, caller_reg: Location) {
        assert!(caller_reg.is_reg(), "callee saved content must be a register");
        self.set_value(reg, OopMapKind::CalleeSaved(caller_reg));
    }

    pub fn set_derived_oop(&mut self, reg: Location, base: Location) {
        if reg == base {
            // A derived pointer with itself as base is just a reference.
            self.set_oop(reg);
        } else {
            self.set_value(reg, OopMapKind::Derived(base));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &OopMapValue> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over the locations holding (possibly compressed or derived) references.
    pub fn oops(&self) -> impl Iterator<Item = &OopMapValue> {
        self.values
            .iter()
            .filter(|v| !matches!(v.kind, OopMapKind::CalleeSaved(_)))
    }

    /// Iterate over `(slot, caller register)` pairs for callee-saved entries.
    pub fn callee_saved(&self) -> impl Iterator<Item = (Location, Location)> + '_ {
        self.values.iter().filter_map(|v| match v.kind {
            OopMapKind::CalleeSaved(x) => Some((v.reg, x)),
            _ => None,
        })
    }

    pub fn find(&self, reg: Location) -> Option<&OopMapValue> {
        self.values.iter().find(|v| v.reg == reg)
    }

    pub fn has_oop_at(&self, reg: Location) -> bool {
        self.oops().any(|v| v.reg == reg)
    }

    /// Pack this map into its stream form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_BYTES + self.values.len() * PACKED_VALUE_BYTES);
        out.extend_from_slice(&self.pc_offset.to_le_bytes());
        out.extend_from_slice(&(self.frame_size | (self.arg_count << 24)).to_le_bytes());
        out.extend_from_slice(&u32::try_from(self.values.len()).unwrap().to_le_bytes());
        for v in &self.values {
            // Every value was range checked when it was added, so packing can't fail.
            out.extend(v.pack().to_bytes().unwrap());
        }
        out
    }

    /// Unpack a map previously produced by [Self::encode]. Returns the map and the number of
    /// bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        if data.len() < HEADER_BYTES {
            return Err(DecodeError::Truncated);
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let pc_offset = word(0);
        let sizes = word(4);
        let count = word(8) as usize;
        let end = HEADER_BYTES + count * PACKED_VALUE_BYTES;
        if data.len() < end {
            return Err(DecodeError::Truncated);
        }
        let mut values = Vec::with_capacity(count);
        for chunk in data[HEADER_BYTES..end].chunks(PACKED_VALUE_BYTES) {
            let (_, p) = PackedValue::from_bytes((chunk, 0)).map_err(DecodeError::Deku)?;
            values.push(OopMapValue::unpack(&p)?);
        }
        Ok((
            Self {
                pc_offset,
                frame_size: sizes & 0xff_ffff,
                arg_count: sizes >> 24,
                values,
            },
            end,
        ))
    }
}

impl fmt::Display for OopMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OopMap{{")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, " off={}}}", self.pc_offset)
    }
}

/// All the maps of one code blob, ordered by return-address offset.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OopMapSet {
    maps: Vec<OopMap>,
}

impl OopMapSet {
    pub fn new() -> Self {
        Self { maps: Vec::new() }
    }

    /// Associate `map` with the return-address offset `pc_offset`. Offsets must be added in
    /// increasing order, except that re-adding the most recent offset replaces its map.
    pub fn add_gc_map(&mut self, pc_offset: u32, mut map: OopMap) {
        map.pc_offset = pc_offset;
        match self.maps.last() {
            Some(last) if last.pc_offset == pc_offset => {
                *self.maps.last_mut().unwrap() = map;
            }
            Some(last) => {
                assert!(
                    last.pc_offset < pc_offset,
                    "oop maps added out of order: {pc_offset} after {}",
                    last.pc_offset
                );
                self.maps.push(map);
            }
            None => self.maps.push(map),
        }
    }

    pub fn find_map_at_offset(&self, pc_offset: u32) -> Option<&OopMap> {
        self.maps
            .binary_search_by_key(&pc_offset, |m| m.pc_offset)
            .ok()
            .map(|i| &self.maps[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &OopMap> {
        self.maps.iter()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = u32::try_from(self.maps.len()).unwrap().to_le_bytes().to_vec();
        for m in &self.maps {
            out.extend(m.encode());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::Truncated);
        }
        let n = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let mut off = 4;
        let mut maps = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let (m, len) = OopMap::decode(&data[off..])?;
            maps.push(m);
            off += len;
        }
        Ok(Self { maps })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn location_halves() {
        let r = Location::gp(3);
        assert_eq!(r.next(), Location::Gp { enc: 3, hi: true });
        assert_eq!(r.next().storage(), r);
        assert_eq!(Location::stack(4).next(), Location::stack(5));
        assert_eq!(Location::stack(4).stack_offset(), 16);
        let p = VMRegPair::set2(Location::fp(1));
        assert_eq!(p.second(), Some(Location::Fp { enc: 1, hi: true }));
        assert!(VMRegPair::set1(Location::gp(0)).is_single());
        assert!(!VMRegPair::bad().is_valid());
    }

    #[test]
    #[should_panic(expected = "has no next half")]
    fn upper_half_has_no_next() {
        Location::gp(1).next().next();
    }

    #[test]
    fn encode_decode_map() {
        let mut m = OopMap::new(40, 4);
        m.set_oop(Location::stack(2));
        m.set_narrow_oop(Location::gp(6));
        m.set_callee_saved(Location::stack(10), Location::gp(3));
        m.set_callee_saved(Location::stack(11), Location::gp(3).next());
        m.set_derived_oop(Location::stack(12), Location::stack(2));
        m.set_derived_oop(Location::stack(14), Location::stack(14));
        let mut s = OopMapSet::new();
        s.add_gc_map(8, m.clone());
        s.add_gc_map(24, OopMap::new(40, 0));
        let d = OopMapSet::decode(&s.encode()).unwrap();
        assert_eq!(d, s);
        let m = d.find_map_at_offset(8).unwrap();
        assert!(m.has_oop_at(Location::stack(2)));
        assert!(m.has_oop_at(Location::stack(14)));
        assert_eq!(m.find(Location::stack(14)).unwrap().kind, OopMapKind::Oop);
        assert_eq!(
            m.callee_saved().collect::<Vec<_>>(),
            vec![
                (Location::stack(10), Location::gp(3)),
                (Location::stack(11), Location::gp(3).next())
            ]
        );
        assert!(d.find_map_at_offset(12).is_none());
        assert_eq!(
            m.to_string(),
            "OopMap{[sp+8]=Oop r6=NarrowOop [sp+40]=Callers_r3 [sp+44]=Callers_r3.H [sp+48]=Derived_oop_[sp+8] [sp+56]=Oop off=8}"
        );
    }

    #[test]
    fn replace_last_map() {
        let mut s = OopMapSet::new();
        s.add_gc_map(4, OopMap::new(8, 0));
        let mut m = OopMap::new(8, 0);
        m.set_oop(Location::stack(0));
        s.add_gc_map(4, m);
        assert_eq!(s.len(), 1);
        assert_eq!(s.find_map_at_offset(4).unwrap().len(), 1);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn maps_out_of_order() {
        let mut s = OopMapSet::new();
        s.add_gc_map(8, OopMap::new(8, 0));
        s.add_gc_map(4, OopMap::new(8, 0));
    }

    #[test]
    #[should_panic(expected = "overflows its 13-bit field")]
    fn register_field_overflow() {
        let mut m = OopMap::new(1 << 14, 0);
        m.set_oop(Location::stack((1 << 13) - STACK0));
    }

    #[test]
    fn truncated_stream() {
        let mut m = OopMap::new(8, 0);
        m.set_oop(Location::stack(0));
        let e = m.encode();
        assert!(matches!(
            OopMap::decode(&e[..e.len() - 1]),
            Err(DecodeError::Truncated)
        ));
    }

    fn any_location() -> impl Strategy<Value = Location> {
        prop_oneof![
            (0..MAX_GP_REGS, any::<bool>()).prop_map(|(enc, hi)| Location::Gp { enc, hi }),
            (0..MAX_FP_REGS, any::<bool>()).prop_map(|(enc, hi)| Location::Fp { enc, hi }),
            (0u32..1000).prop_map(Location::Stack),
        ]
    }

    proptest! {
        #[test]
        fn location_encoding_is_injective(a in any_location(), b in any_location()) {
            prop_assert_eq!(Location::decode(a.encode()), a);
            prop_assert_eq!(a.encode() == b.encode(), a == b);
        }
    }
}
