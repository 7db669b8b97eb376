//! Objects and classes.
//!
//! Every object starts with a mark word (see [crate::sync] for its lock encodings) and a class
//! word. Instance fields follow as whole words; arrays hold a length word and then their
//! elements. The heap is never collected.

use crate::{abi::BasicType, mem::Memory, sync::UNLOCKED_VALUE};
use parking_lot::RwLock;
use std::sync::Arc;
use typed_index_collections::TiVec;

pub const MARK_OFFSET: i64 = 0;
pub const KLASS_OFFSET: i64 = 8;
pub const FIELDS_OFFSET: i64 = 16;
pub const ARRAY_LENGTH_OFFSET: i64 = 16;
pub const ARRAY_BASE_OFFSET: i64 = 24;

const CLASS_TAG: u64 = 0x4b4c_0000_0000_0000;
const ARRAY_TAG: u64 = 0x4152_0000_0000_0000;
const TAG_MASK: u64 = 0xffff_0000_0000_0000;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClassId(usize);

impl From<usize> for ClassId {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<ClassId> for usize {
    fn from(v: ClassId) -> Self {
        v.0
    }
}

impl ClassId {
    /// The class word stored in instances of this class.
    pub fn to_word(self) -> u64 {
        CLASS_TAG | self.0 as u64
    }
}

#[derive(Debug)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub field_count: u32,
    /// The object representing this class to managed code.
    pub mirror: u64,
}

/// The element size of arrays of `t`.
pub fn array_element_size(t: BasicType) -> u64 {
    match t {
        BasicType::Int | BasicType::Float => 4,
        BasicType::Long | BasicType::Double | BasicType::Object | BasicType::Array => 8,
        _ => panic!("arrays of {t} are not supported"),
    }
}

pub struct Heap {
    classes: RwLock<TiVec<ClassId, Arc<Class>>>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(TiVec::new()),
        }
    }

    pub fn define_class(&self, mem: &Memory, name: &str, field_count: u32) -> ClassId {
        let mut classes = self.classes.write();
        let id = ClassId(classes.len());
        let mirror = mem.alloc_heap(FIELDS_OFFSET as u64 + 8);
        mem.write_u64(mirror, UNLOCKED_VALUE);
        mem.write_u64(mirror + FIELDS_OFFSET as u64, id.to_word());
        classes.push(Arc::new(Class {
            id,
            name: name.to_owned(),
            field_count,
            mirror,
        }));
        id
    }

    pub fn class(&self, id: ClassId) -> Arc<Class> {
        Arc::clone(&self.classes.read()[id])
    }

    pub fn alloc_object(&self, mem: &Memory, class: ClassId) -> u64 {
        let n = self.class(class).field_count;
        let obj = mem.alloc_heap(FIELDS_OFFSET as u64 + u64::from(n) * 8);
        mem.write_u64(obj, UNLOCKED_VALUE);
        mem.write_u64(obj + KLASS_OFFSET as u64, class.to_word());
        obj
    }

    pub fn alloc_array(&self, mem: &Memory, elem: BasicType, len: u64) -> u64 {
        let size = ARRAY_BASE_OFFSET as u64 + len * array_element_size(elem);
        let obj = mem.alloc_heap(size);
        mem.write_u64(obj, UNLOCKED_VALUE);
        mem.write_u64(obj + KLASS_OFFSET as u64, ARRAY_TAG | elem as u64);
        mem.write_u64(obj + ARRAY_LENGTH_OFFSET as u64, len);
        obj
    }

    /// The class of `obj`, if it is a plain instance.
    pub fn class_of(&self, mem: &Memory, obj: u64) -> Option<ClassId> {
        let w = mem.read_u64(obj + KLASS_OFFSET as u64);
        if w & TAG_MASK == CLASS_TAG {
            Some(ClassId((w & !TAG_MASK) as usize))
        } else {
            None
        }
    }

    pub fn is_array(&self, mem: &Memory, obj: u64) -> bool {
        mem.read_u64(obj + KLASS_OFFSET as u64) & TAG_MASK == ARRAY_TAG
    }
}

/// The address of field `i` of `obj`.
pub fn field_addr(obj: u64, i: u32) -> u64 {
    obj + FIELDS_OFFSET as u64 + u64::from(i) * 8
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn objects_and_arrays() {
        let mem = Memory::new(1 << 16, 1 << 12, 1 << 12).unwrap();
        let h = Heap::new();
        let c = h.define_class(&mem, "Point", 2);
        let p = h.alloc_object(&mem, c);
        mem.write_u64(field_addr(p, 1), 42);
        assert_eq!(h.class_of(&mem, p), Some(c));
        assert_eq!(mem.read_u64(p), UNLOCKED_VALUE);
        assert_eq!(h.class(c).name, "Point");
        let a = h.alloc_array(&mem, BasicType::Int, 3);
        assert!(h.is_array(&mem, a));
        assert_eq!(h.class_of(&mem, a), None);
        assert_eq!(mem.read_u64(a + ARRAY_LENGTH_OFFSET as u64), 3);
        assert_ne!(h.class(c).mirror, 0);
    }
}
