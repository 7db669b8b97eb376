//! The code cache: every installed piece of generated code, indexed by address.
//!
//! Each [CodeBlob] occupies a range of the simulated code address space. Blobs are immutable once
//! installed, apart from their patchable call sites, and can be looked up by any pc inside them
//! from any thread.

use crate::{
    deopt::scope::PcDesc,
    masm::{Code, Label, INST_SIZE},
    method::MethodId,
    CodeGenError,
};
use drtmap::{OopMap, OopMapSet};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::BTreeMap,
    fmt,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub const CODE_BASE: u64 = 0x4000_0000;
const BLOB_ALIGN: u64 = 64;

/// Extra information about a blob holding a method's compiled code.
#[derive(Debug)]
pub struct NmethodInfo {
    pub method: MethodId,
    /// The offset of the verified entry point.
    pub verified_entry: u32,
    /// The offset of the deoptimization handler, which enters the deopt blob's unpack entry.
    pub deopt_handler: Option<u32>,
    /// The byte offset from the unextended stack pointer of the slot where the original pc is
    /// saved when the frame is marked for deoptimization.
    pub orig_pc_offset: Option<u32>,
    /// Debug information, by pc offset.
    pub pc_descs: Vec<PcDesc>,
    /// For native wrappers, the byte offset from the stack pointer of the lock box.
    pub lock_box_offset: Option<u32>,
    /// Once the code is not entrant, the target of the jump patched over its verified entry.
    entry_jump: AtomicU64,
}

impl NmethodInfo {
    pub fn new(method: MethodId, verified_entry: u32) -> Self {
        Self {
            method,
            verified_entry,
            deopt_handler: None,
            orig_pc_offset: None,
            pc_descs: Vec::new(),
            lock_box_offset: None,
            entry_jump: AtomicU64::new(0),
        }
    }

    pub fn pc_desc_at(&self, pc_offset: u32) -> Option<&PcDesc> {
        self.pc_descs.iter().find(|d| d.pc_offset == pc_offset)
    }

    pub fn is_not_entrant(&self) -> bool {
        self.entry_jump.load(Ordering::Acquire) != 0
    }

    /// Patch a jump to `to` over the verified entry, so that calls already bound to it go there
    /// instead. Returns `false` if the code was already not entrant.
    pub fn make_not_entrant(&self, to: u64) -> bool {
        assert_ne!(to, 0);
        self.entry_jump
            .compare_exchange(0, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The offsets of the deopt blob's entry points.
#[derive(Clone, Copy, Debug)]
pub struct DeoptEntries {
    pub unpack: u32,
    pub reexecute: u32,
    pub with_exception: u32,
    pub with_exception_in_tls: u32,
}

/// The offsets of the interpreter's entry points.
#[derive(Clone, Copy, Debug)]
pub struct InterpreterEntries {
    pub method_entry: u32,
    pub continue_after: u32,
    pub reexecute: u32,
    pub rethrow: u32,
    /// Where callees return to in an interpreted caller.
    pub return_entry: u32,
}

#[derive(Debug)]
pub enum BlobKind {
    Interpreter(InterpreterEntries),
    /// The stub through which the host enters managed code. `return_offset` is where managed code
    /// returns to.
    CallStub { return_offset: u32 },
    Adapter,
    NativeWrapper(NmethodInfo),
    Nmethod(NmethodInfo),
    RuntimeStub,
    Deopt(DeoptEntries),
    UncommonTrap,
}

/// Everything needed to install a blob.
pub struct NewBlob {
    pub name: String,
    pub kind: BlobKind,
    pub code: Code,
    /// The frame size in words, including the return address and saved frame pointer.
    pub frame_size: u32,
    /// The offset from which the frame is fully built. `None` for blobs whose frames are never
    /// complete (e.g. adapters).
    pub frame_complete: Option<u32>,
    pub oop_maps: OopMapSet,
}

impl NewBlob {
    pub fn new(name: &str, kind: BlobKind, code: Code) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            code,
            frame_size: 0,
            frame_complete: None,
            oop_maps: OopMapSet::new(),
        }
    }
}

pub struct CodeBlob {
    name: String,
    kind: BlobKind,
    begin: u64,
    code: Code,
    call_sites: Vec<AtomicU64>,
    frame_size: u32,
    frame_complete: Option<u32>,
    oop_maps: OopMapSet,
}

impl CodeBlob {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &BlobKind {
        &self.kind
    }

    pub fn code(&self) -> &Code {
        &self.code
    }

    pub fn code_begin(&self) -> u64 {
        self.begin
    }

    pub fn code_end(&self) -> u64 {
        self.begin + self.code.size()
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.begin && pc < self.code_end()
    }

    /// The address of `offset` bytes into the blob.
    pub fn addr(&self, offset: u32) -> u64 {
        self.begin + u64::from(offset)
    }

    pub fn offset_of(&self, pc: u64) -> u32 {
        debug_assert!(self.contains(pc) || pc == self.code_end());
        (pc - self.begin) as u32
    }

    pub fn label_addr(&self, l: Label) -> u64 {
        self.addr(self.code.label_offset(l))
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn is_frame_complete_at(&self, pc: u64) -> bool {
        match self.frame_complete {
            Some(off) => self.contains(pc) && self.offset_of(pc) >= off,
            None => false,
        }
    }

    pub fn oop_maps(&self) -> &OopMapSet {
        &self.oop_maps
    }

    /// The oop map for the call whose return address is `pc`.
    pub fn oop_map_at(&self, pc: u64) -> Option<&OopMap> {
        self.oop_maps.find_map_at_offset(self.offset_of(pc))
    }

    pub fn call_site_target(&self, i: usize) -> u64 {
        self.call_sites[i].load(Ordering::Acquire)
    }

    /// Atomically redirect call site `i` from `old` to `new`. Returns `false` if the site no
    /// longer calls `old`, in which case nothing is changed.
    pub fn patch_call_site(&self, i: usize, old: u64, new: u64) -> bool {
        self.call_sites[i]
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The index of the call site whose call instruction ends at `return_pc`.
    pub fn call_site_returning_to(&self, return_pc: u64) -> Option<usize> {
        if return_pc < self.begin + INST_SIZE || !self.contains(return_pc - INST_SIZE) {
            return None;
        }
        let idx = ((return_pc - INST_SIZE - self.begin) / INST_SIZE) as usize;
        match self.code.insts[idx] {
            crate::masm::Inst::Call(crate::masm::CallTarget::Site(i)) => Some(i),
            _ => None,
        }
    }

    pub fn is_interpreter(&self) -> bool {
        matches!(self.kind, BlobKind::Interpreter(_))
    }

    pub fn is_adapter(&self) -> bool {
        matches!(self.kind, BlobKind::Adapter)
    }

    pub fn is_call_stub(&self) -> bool {
        matches!(self.kind, BlobKind::CallStub { .. })
    }

    pub fn is_runtime_stub(&self) -> bool {
        matches!(
            self.kind,
            BlobKind::RuntimeStub | BlobKind::Deopt(_) | BlobKind::UncommonTrap
        )
    }

    /// Does this blob hold a method's code (compiled or a native wrapper)?
    pub fn is_compiled(&self) -> bool {
        self.nmethod().is_some()
    }

    pub fn is_native_wrapper(&self) -> bool {
        matches!(self.kind, BlobKind::NativeWrapper(_))
    }

    pub fn nmethod(&self) -> Option<&NmethodInfo> {
        match &self.kind {
            BlobKind::Nmethod(x) | BlobKind::NativeWrapper(x) => Some(x),
            _ => None,
        }
    }

    pub fn verified_entry(&self) -> Option<u64> {
        self.nmethod().map(|nm| self.addr(nm.verified_entry))
    }

    /// If `pc` is a verified entry with a jump patched over it, where the jump goes.
    pub fn entry_jump_at(&self, pc: u64) -> Option<u64> {
        let nm = self.nmethod()?;
        match nm.entry_jump.load(Ordering::Acquire) {
            0 => None,
            to => (self.addr(nm.verified_entry) == pc).then_some(to),
        }
    }

    /// The address of this blob's deopt handler. Marking a frame for deoptimization patches its
    /// return address to this, and the handler passes it on to the deopt blob as the frame's pc.
    pub fn deopt_handler_begin(&self) -> Option<u64> {
        self.nmethod()
            .and_then(|nm| nm.deopt_handler)
            .map(|off| self.addr(off))
    }

    pub fn is_deopt_entry(&self, pc: u64) -> bool {
        self.deopt_handler_begin() == Some(pc)
    }

    /// For the call stub: the address managed code returns to.
    pub fn call_stub_return(&self) -> Option<u64> {
        match self.kind {
            BlobKind::CallStub { return_offset } => Some(self.addr(return_offset)),
            _ => None,
        }
    }
}

impl fmt::Debug for CodeBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CodeBlob({} {:#x}..{:#x})",
            self.name,
            self.begin,
            self.code_end()
        )
    }
}

/// One bump-allocated range of code addresses.
struct Segment {
    top: Mutex<u64>,
    limit: u64,
}

impl Segment {
    fn new(begin: u64, end: u64) -> Self {
        Self {
            top: Mutex::new(begin),
            limit: end,
        }
    }
}

/// Adapters get their own segment, the last eighth of the cache, so that generated code can tell
/// whether a return address is in an adapter with two compares.
pub struct CodeCache {
    blobs: RwLock<BTreeMap<u64, Arc<CodeBlob>>>,
    main: Segment,
    adapters: Segment,
    adapter_begin: u64,
}

impl CodeCache {
    pub fn new(size: u64) -> Self {
        let adapter_bytes = size / 8 / BLOB_ALIGN * BLOB_ALIGN;
        let adapter_begin = CODE_BASE + size - adapter_bytes;
        Self {
            blobs: RwLock::new(BTreeMap::new()),
            main: Segment::new(CODE_BASE, adapter_begin),
            adapters: Segment::new(adapter_begin, CODE_BASE + size),
            adapter_begin,
        }
    }

    /// The addresses adapters are installed at.
    pub fn adapter_range(&self) -> Range<u64> {
        self.adapter_begin..self.adapters.limit
    }

    /// Give `nb` an address and make it visible to [Self::find_blob].
    pub fn install(&self, nb: NewBlob) -> Result<Arc<CodeBlob>, CodeGenError> {
        let size = nb.code.size().max(INST_SIZE);
        let seg = match nb.kind {
            BlobKind::Adapter => &self.adapters,
            _ => &self.main,
        };
        let begin = {
            let mut top = seg.top.lock();
            let begin = *top;
            if begin + size > seg.limit {
                return Err(CodeGenError::CodeCacheFull {
                    name: nb.name,
                    size,
                });
            }
            // Leave a gap so that no pc just past a blob's end lands in the next blob.
            *top = (begin + size + BLOB_ALIGN).next_multiple_of(BLOB_ALIGN);
            begin
        };
        let call_sites = nb
            .code
            .call_sites
            .iter()
            .map(|x| AtomicU64::new(*x))
            .collect();
        let blob = Arc::new(CodeBlob {
            name: nb.name,
            kind: nb.kind,
            begin,
            code: nb.code,
            call_sites,
            frame_size: nb.frame_size,
            frame_complete: nb.frame_complete,
            oop_maps: nb.oop_maps,
        });
        self.blobs.write().insert(begin, Arc::clone(&blob));
        Ok(blob)
    }

    pub fn find_blob(&self, pc: u64) -> Option<Arc<CodeBlob>> {
        let blobs = self.blobs.read();
        let (_, b) = blobs.range(..=pc).next_back()?;
        if b.contains(pc) {
            Some(Arc::clone(b))
        } else {
            None
        }
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.find_blob(pc).is_some()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        abi::x64::X64_SYSV,
        masm::{Halt, Inst, MacroAssembler},
    };

    fn code(n: usize) -> Code {
        let mut m = MacroAssembler::new(&X64_SYSV);
        for _ in 0..n {
            m.emit(Inst::Halt(Halt::Marker(0)));
        }
        m.finish()
    }

    #[test]
    fn lookup() {
        let cc = CodeCache::new(1 << 16);
        let a = cc
            .install(NewBlob::new("a", BlobKind::RuntimeStub, code(3)))
            .unwrap();
        let b = cc
            .install(NewBlob::new("b", BlobKind::Adapter, code(1)))
            .unwrap();
        assert_eq!(a.code_begin(), CODE_BASE);
        assert!(b.code_begin() > a.code_end());
        assert!(cc.adapter_range().contains(&b.code_begin()));
        assert!(!cc.adapter_range().contains(&a.code_begin()));
        assert_eq!(cc.adapter_range().end, CODE_BASE + (1 << 16));
        assert_eq!(cc.find_blob(a.code_begin() + 8).unwrap().name(), "a");
        assert!(cc.find_blob(a.code_end()).is_none());
        assert_eq!(cc.find_blob(b.code_begin()).unwrap().name(), "b");
        assert!(cc.find_blob(CODE_BASE - 4).is_none());
        assert!(!b.is_frame_complete_at(b.code_begin()));
    }

    #[test]
    fn full() {
        let cc = CodeCache::new(64);
        cc.install(NewBlob::new("a", BlobKind::RuntimeStub, code(8)))
            .unwrap();
        assert!(matches!(
            cc.install(NewBlob::new("b", BlobKind::RuntimeStub, code(8))),
            Err(CodeGenError::CodeCacheFull { .. })
        ));
    }

    #[test]
    fn call_site_patching() {
        let mut m = MacroAssembler::new(&X64_SYSV);
        let i = m.call_site(0x100);
        m.emit(Inst::Halt(Halt::Marker(0)));
        let cc = CodeCache::new(1 << 16);
        let b = cc
            .install(NewBlob::new("c", BlobKind::RuntimeStub, m.finish()))
            .unwrap();
        assert_eq!(b.call_site_returning_to(b.code_begin() + INST_SIZE), Some(i));
        assert!(b.patch_call_site(i, 0x100, 0x200));
        assert!(!b.patch_call_site(i, 0x100, 0x300));
        assert_eq!(b.call_site_target(i), 0x200);
    }
}
