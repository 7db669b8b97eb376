//! Methods and their entry points.
//!
//! Each method has two entry points that callers jump through:
//!
//!   * from compiled code: the compiled code itself if there is any, otherwise the c2i adapter;
//!   * from the interpreter: the i2c adapter if there is compiled code, otherwise the
//!     interpreter.
//!
//! Both are plain atomic words, rewritten by [Method::set_code] and [Method::clear_code] in the
//! order that keeps any thread reading them mid-update on a valid path.

use crate::{abi::BasicType, heap::ClassId, native::NativeId};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use strum::Display;
use typed_index_collections::TiVec;

const METHOD_TAG: u64 = 0x4d45_0000_0000_0000;
const TAG_MASK: u64 = 0xffff_0000_0000_0000;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MethodId(usize);

impl From<usize> for MethodId {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<MethodId> for usize {
    fn from(v: MethodId) -> Self {
        v.0
    }
}

impl MethodId {
    /// The word generated code holds in the method register to name this method.
    pub fn to_word(self) -> u64 {
        METHOD_TAG | self.0 as u64
    }

    pub fn from_word(w: u64) -> Option<Self> {
        if w & TAG_MASK == METHOD_TAG {
            Some(Self((w & !TAG_MASK) as usize))
        } else {
            None
        }
    }
}

/// The fields of a method generated code can load.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum MethodField {
    FromCompiledEntry,
    FromInterpretedEntry,
    /// The interpreter's entry for this method, whether or not it is compiled.
    InterpreterEntry,
    /// The start of the method's compiled code, or 0.
    Code,
    /// The mirror of the method's holder.
    Mirror,
}

/// Everything needed to define a method.
#[derive(Clone, Debug)]
pub struct NewMethod {
    pub name: String,
    pub holder: ClassId,
    /// The declared parameter types, not including the receiver.
    pub params: Vec<BasicType>,
    pub ret: BasicType,
    pub is_static: bool,
    pub is_native: bool,
    pub is_synchronized: bool,
    /// Critical natives take arrays as (length, elements) pairs and no environment.
    pub is_critical_native: bool,
    pub max_locals: u32,
    pub max_stack: u32,
    /// The length of the bytecode.
    pub code_size: u32,
}

impl NewMethod {
    /// A non-static method with no locals beyond its parameters.
    pub fn new(name: &str, holder: ClassId, params: &[BasicType], ret: BasicType) -> Self {
        let mut nm = Self {
            name: name.to_owned(),
            holder,
            params: params.to_vec(),
            ret,
            is_static: false,
            is_native: false,
            is_synchronized: false,
            is_critical_native: false,
            max_locals: 0,
            max_stack: 4,
            code_size: 16,
        };
        nm.max_locals = nm.size_of_parameters();
        nm
    }

    pub fn static_method(mut self) -> Self {
        if !self.is_static {
            self.is_static = true;
            self.max_locals -= 1;
        }
        self
    }

    pub fn native(mut self) -> Self {
        self.is_native = true;
        self
    }

    pub fn critical_native(mut self) -> Self {
        self.is_native = true;
        self.is_critical_native = true;
        self
    }

    pub fn synchronized(mut self) -> Self {
        self.is_synchronized = true;
        self
    }

    /// Set the number of locals and the maximum expression stack depth.
    pub fn locals(mut self, max_locals: u32, max_stack: u32) -> Self {
        self.max_locals = max_locals;
        self.max_stack = max_stack;
        self
    }

    pub fn code_size(mut self, code_size: u32) -> Self {
        self.code_size = code_size;
        self
    }

    fn size_of_parameters(&self) -> u32 {
        let recv = u32::from(!self.is_static);
        recv + self.params.iter().map(|t| t.size()).sum::<u32>()
    }
}

#[derive(Debug)]
pub struct Method {
    pub id: MethodId,
    pub name: String,
    pub holder: ClassId,
    pub params: Vec<BasicType>,
    pub ret: BasicType,
    pub is_static: bool,
    pub is_native: bool,
    pub is_synchronized: bool,
    pub is_critical_native: bool,
    pub max_locals: u32,
    pub max_stack: u32,
    pub code_size: u32,
    pub mirror: u64,
    native: RwLock<Option<NativeId>>,
    code: AtomicU64,
    from_compiled: AtomicU64,
    from_interpreted: AtomicU64,
    interpreter_entry: AtomicU64,
    i2c_entry: AtomicU64,
    c2i_entry: AtomicU64,
}

impl Method {
    /// The signature in slot form, receiver first.
    pub fn sig_bt(&self) -> Vec<BasicType> {
        let mut sig = Vec::with_capacity(self.params.len() + 1);
        if !self.is_static {
            sig.push(BasicType::Object);
        }
        for &t in &self.params {
            sig.push(t);
            if t.is_double_word() {
                sig.push(BasicType::Void);
            }
        }
        sig
    }

    /// How many interpreter slots the parameters take.
    pub fn size_of_parameters(&self) -> u32 {
        u32::from(!self.is_static) + self.params.iter().map(|t| t.size()).sum::<u32>()
    }

    pub fn is_valid_bci(&self, bci: u32) -> bool {
        bci < self.code_size
    }

    pub fn field(&self, f: MethodField) -> u64 {
        match f {
            MethodField::FromCompiledEntry => self.from_compiled.load(Ordering::Acquire),
            MethodField::FromInterpretedEntry => self.from_interpreted.load(Ordering::Acquire),
            MethodField::InterpreterEntry => self.interpreter_entry.load(Ordering::Acquire),
            MethodField::Code => self.code.load(Ordering::Acquire),
            MethodField::Mirror => self.mirror,
        }
    }

    pub fn code(&self) -> Option<u64> {
        match self.code.load(Ordering::Acquire) {
            0 => None,
            x => Some(x),
        }
    }

    pub fn native_function(&self) -> Option<NativeId> {
        *self.native.read()
    }

    pub fn bind_native(&self, f: NativeId) {
        *self.native.write() = Some(f);
    }

    pub fn i2c_entry(&self) -> u64 {
        self.i2c_entry.load(Ordering::Acquire)
    }

    pub fn c2i_entry(&self) -> u64 {
        self.c2i_entry.load(Ordering::Acquire)
    }

    /// Wire up the entry points of a method with no compiled code.
    pub(crate) fn link(&self, interpreter_entry: u64, i2c: u64, c2i: u64) {
        self.interpreter_entry.store(interpreter_entry, Ordering::Release);
        self.i2c_entry.store(i2c, Ordering::Release);
        self.c2i_entry.store(c2i, Ordering::Release);
        self.from_interpreted
            .store(interpreter_entry, Ordering::Release);
        self.from_compiled.store(c2i, Ordering::Release);
    }

    /// Make `code_begin`, with its verified entry at `verified_entry`, the method's code.
    ///
    /// Compiled callers see the new code before interpreted callers are sent through the i2c
    /// adapter to it.
    pub fn set_code(&self, code_begin: u64, verified_entry: u64) {
        self.code.store(code_begin, Ordering::Release);
        self.from_compiled.store(verified_entry, Ordering::Release);
        self.from_interpreted
            .store(self.i2c_entry(), Ordering::Release);
    }

    /// Forget the method's compiled code. Entry points are reset before the code is cleared, so a
    /// thread that still sees the code also still has a valid way into it.
    pub fn clear_code(&self) {
        self.from_compiled.store(self.c2i_entry(), Ordering::Release);
        self.from_interpreted
            .store(self.interpreter_entry.load(Ordering::Acquire), Ordering::Release);
        self.code.store(0, Ordering::Release);
    }
}

pub struct MethodTable {
    methods: RwLock<TiVec<MethodId, Arc<Method>>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(TiVec::new()),
        }
    }

    /// Add a method whose entry points are not yet linked.
    pub(crate) fn add(&self, nm: NewMethod, mirror: u64) -> Arc<Method> {
        assert!(
            nm.max_locals >= nm.size_of_parameters(),
            "{} has fewer locals than parameter slots",
            nm.name
        );
        let mut ms = self.methods.write();
        let id = MethodId(ms.len());
        let m = Arc::new(Method {
            id,
            name: nm.name,
            holder: nm.holder,
            params: nm.params,
            ret: nm.ret,
            is_static: nm.is_static,
            is_native: nm.is_native,
            is_synchronized: nm.is_synchronized,
            is_critical_native: nm.is_critical_native,
            max_locals: nm.max_locals,
            max_stack: nm.max_stack,
            code_size: nm.code_size,
            mirror,
            native: RwLock::new(None),
            code: AtomicU64::new(0),
            from_compiled: AtomicU64::new(0),
            from_interpreted: AtomicU64::new(0),
            interpreter_entry: AtomicU64::new(0),
            i2c_entry: AtomicU64::new(0),
            c2i_entry: AtomicU64::new(0),
        });
        ms.push(Arc::clone(&m));
        m
    }

    pub fn get(&self, id: MethodId) -> Arc<Method> {
        Arc::clone(&self.methods.read()[id])
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use BasicType::*;

    #[test]
    fn signatures() {
        let nm = NewMethod::new("f", ClassId::from(0), &[Int, Long, Object], Double);
        assert_eq!(nm.max_locals, 5);
        let t = MethodTable::new();
        let m = t.add(nm.clone(), 0);
        assert_eq!(m.sig_bt(), vec![Object, Int, Long, Void, Object]);
        assert_eq!(m.size_of_parameters(), 5);
        let s = t.add(nm.static_method().locals(6, 2), 0);
        assert_eq!(s.sig_bt(), vec![Int, Long, Void, Object]);
        assert_eq!(s.size_of_parameters(), 4);
        assert_eq!(MethodId::from_word(s.id.to_word()), Some(s.id));
        assert_eq!(MethodId::from_word(0x1234), None);
    }

    #[test]
    #[should_panic(expected = "fewer locals")]
    fn too_few_locals() {
        let nm = NewMethod::new("f", ClassId::from(0), &[Int, Int], Void).locals(1, 0);
        MethodTable::new().add(nm, 0);
    }

    #[test]
    fn entry_points() {
        let t = MethodTable::new();
        let m = t.add(NewMethod::new("g", ClassId::from(0), &[], Void), 0);
        m.link(0x100, 0x200, 0x300);
        assert_eq!(m.field(MethodField::FromInterpretedEntry), 0x100);
        assert_eq!(m.field(MethodField::FromCompiledEntry), 0x300);
        assert_eq!(m.code(), None);
        m.set_code(0x4000, 0x4010);
        assert_eq!(m.field(MethodField::FromInterpretedEntry), 0x200);
        assert_eq!(m.field(MethodField::FromCompiledEntry), 0x4010);
        assert_eq!(m.field(MethodField::Code), 0x4000);
        m.clear_code();
        assert_eq!(m.field(MethodField::FromInterpretedEntry), 0x100);
        assert_eq!(m.field(MethodField::FromCompiledEntry), 0x300);
        assert_eq!(m.code(), None);
    }
}
