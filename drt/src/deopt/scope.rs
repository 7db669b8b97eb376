//! Debug information recorded with compiled code.
//!
//! At every pc where a compiled frame may be deoptimized, a [PcDesc] describes each method
//! inlined at that pc (a [ScopeDesc], innermost first): its bci and where each local, expression
//! stack entry and monitor lives in the compiled frame. Objects whose allocation was eliminated by
//! escape analysis are described field by field ([ObjectValue]) so they can be reallocated.

use crate::{
    abi::BasicType,
    frame::{Frame, RegisterMap},
    heap::ClassId,
    mem::Memory,
    method::MethodId,
};
use drtmap::Location;

/// The bci of the implicit monitor enter of a synchronized method. A frame deoptimized there
/// resumes by executing the method from its first bytecode.
pub const SYNCHRONIZATION_ENTRY_BCI: i32 = -1;

/// Where, or what, one value of a scope is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScopeValue {
    /// A value held in the compiled frame (stack slots are relative to the unextended sp) or in a
    /// register.
    Location { loc: Location, ty: BasicType },
    Constant { ty: BasicType, bits: u64 },
    /// A scalar-replaced object: an index into [PcDesc::objects].
    Object(usize),
    /// A dead value, or the unused half of a 64-bit local.
    Illegal,
}

impl ScopeValue {
    pub fn location(loc: Location, ty: BasicType) -> Self {
        ScopeValue::Location { loc, ty }
    }

    pub fn int(bits: u64) -> Self {
        ScopeValue::Constant {
            ty: BasicType::Int,
            bits,
        }
    }

    pub fn ty(&self) -> BasicType {
        match self {
            ScopeValue::Location { ty, .. } | ScopeValue::Constant { ty, .. } => *ty,
            ScopeValue::Object(_) => BasicType::Object,
            ScopeValue::Illegal => BasicType::Void,
        }
    }
}

/// An object whose allocation was eliminated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectValue {
    pub class: ClassId,
    pub fields: Vec<ScopeValue>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MonitorValue {
    pub owner: ScopeValue,
    /// The lock box in the compiled frame (a stack location).
    pub basic_lock: Location,
    /// Was the locking elided because the owner never escapes this frame?
    pub eliminated: bool,
}

/// One (possibly inlined) method activation at a pc.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScopeDesc {
    pub method: MethodId,
    pub bci: i32,
    /// Must the bytecode at `bci` be re-executed rather than continued after?
    pub reexecute: bool,
    /// One entry per local slot. A 64-bit local occupies two slots: its value is described by the
    /// second and the first is [ScopeValue::Illegal].
    pub locals: Vec<ScopeValue>,
    pub expressions: Vec<ScopeValue>,
    pub monitors: Vec<MonitorValue>,
}

impl ScopeDesc {
    pub fn new(method: MethodId, bci: i32) -> Self {
        Self {
            method,
            bci,
            reexecute: false,
            locals: Vec::new(),
            expressions: Vec::new(),
            monitors: Vec::new(),
        }
    }
}

/// The debug information at one pc.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PcDesc {
    pub pc_offset: u32,
    /// Innermost first.
    pub scopes: Vec<ScopeDesc>,
    pub objects: Vec<ObjectValue>,
    /// Does the call at this pc return a reference?
    pub return_oop: bool,
    /// The result type of the call at this pc, if it is a call.
    pub return_type: Option<BasicType>,
}

impl PcDesc {
    pub fn new(pc_offset: u32, scopes: Vec<ScopeDesc>) -> Self {
        Self {
            pc_offset,
            scopes,
            objects: Vec::new(),
            return_oop: false,
            return_type: None,
        }
    }
}

/// A value read out of a frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackValue {
    Int(u64),
    Obj(u64),
    /// Dead, or the unused half of a 64-bit value.
    Conflict,
}

impl StackValue {
    /// The word an interpreter slot holds for this value.
    pub fn bits(&self) -> u64 {
        match self {
            StackValue::Int(x) | StackValue::Obj(x) => *x,
            StackValue::Conflict => 0,
        }
    }
}

/// A monitor of a compiled scope, as found in the frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MonitorInfo {
    pub owner: u64,
    /// The address of the lock box in the compiled frame.
    pub lock: u64,
    pub eliminated: bool,
    pub owner_is_scalar_replaced: bool,
}

/// Are values of `ty` kept in 32 bits?
fn is_narrow(ty: BasicType) -> bool {
    matches!(
        ty,
        BasicType::Boolean
            | BasicType::Char
            | BasicType::Byte
            | BasicType::Short
            | BasicType::Int
            | BasicType::Float
    )
}

/// The address `loc` names in `fr`.
///
/// # Panics
///
/// If `loc` is a register `map` has no saved location for.
pub(crate) fn location_addr(fr: &Frame, map: &RegisterMap, loc: Location) -> u64 {
    match loc {
        Location::Stack(_) => fr.unextended_sp() + loc.stack_offset(),
        _ => map
            .location(loc)
            .unwrap_or_else(|| panic!("no saved location for {loc} in {fr}")),
    }
}

/// Read the value `v` describes. `objects` holds the reallocated scalar-replaced objects.
pub(crate) fn read_value(
    mem: &Memory,
    fr: &Frame,
    map: &RegisterMap,
    v: &ScopeValue,
    objects: &[u64],
) -> StackValue {
    match v {
        ScopeValue::Location { loc, ty } => {
            let addr = location_addr(fr, map, *loc);
            let bits = if is_narrow(*ty) {
                u64::from(mem.read_u32(addr))
            } else {
                mem.read_u64(addr)
            };
            if ty.is_reference() {
                StackValue::Obj(bits)
            } else {
                StackValue::Int(bits)
            }
        }
        ScopeValue::Constant { ty, bits } => {
            if ty.is_reference() {
                StackValue::Obj(*bits)
            } else {
                StackValue::Int(*bits)
            }
        }
        ScopeValue::Object(i) => StackValue::Obj(objects[*i]),
        ScopeValue::Illegal => StackValue::Conflict,
    }
}
