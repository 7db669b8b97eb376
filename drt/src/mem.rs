//! The simulated address space.
//!
//! Generated code, the runtime and tests all share one [Memory]: a handful of anonymous mappings
//! placed at fixed simulated addresses. The object heap and the C heap (unroll block images,
//! handle blocks, call argument blocks) are bump allocated; thread stacks are carved out of a
//! stack arena, each with guard zones at its low end. Every access is atomic, so several threads
//! may run generated code over the same memory at once.
//!
//! An access to an unmapped or misaligned address, or to an enabled guard zone, is fatal: a frame
//! walker that needs to read memory it doesn't trust uses [Memory::try_read_u64] instead.

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fmt, io,
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};
use strum::Display;

pub const HEAP_BASE: u64 = 0x1000_0000;
pub const C_HEAP_BASE: u64 = 0x2000_0000;
pub const STACK_BASE: u64 = 0x3000_0000;

/// A pointer we promise is only dereferenced through atomics.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SyncSafePtr<T>(pub T);
unsafe impl<T> Send for SyncSafePtr<T> {}
unsafe impl<T> Sync for SyncSafePtr<T> {}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum RegionKind {
    Heap,
    CHeap,
    Stacks,
}

struct Region {
    kind: RegionKind,
    base: u64,
    len: u64,
    ptr: SyncSafePtr<*mut u8>,
    // Keeps the mapping alive for as long as `ptr` is used.
    _map: MmapMut,
}

impl Region {
    fn new(kind: RegionKind, base: u64, len: u64) -> Result<Self, io::Error> {
        let len = len.next_multiple_of(page_size::get() as u64);
        let mut map = MmapMut::map_anon(len as usize)?;
        let ptr = SyncSafePtr(map.as_mut_ptr());
        Ok(Self {
            kind,
            base,
            len,
            ptr,
            _map: map,
        })
    }

    fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.base && addr.saturating_add(size) <= self.base + self.len
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum GuardKind {
    /// Touching it is unrecoverable.
    Red,
    /// Touching it raises a stack overflow; may be disabled while the overflow is handled.
    Yellow,
    /// Reserved for critical sections.
    Reserved,
}

/// A range of stack addresses that must not be touched while enabled.
pub struct GuardZone {
    pub range: Range<u64>,
    pub kind: GuardKind,
    enabled: AtomicBool,
}

impl GuardZone {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Release);
    }
}

impl fmt::Debug for GuardZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} zone {:#x}..{:#x}",
            self.kind, self.range.start, self.range.end
        )
    }
}

/// The bounds of one thread's stack. Stacks grow down from `base` towards `end`; the guard zones
/// occupy the lowest pages.
#[derive(Clone, Debug)]
pub struct StackRegion {
    /// One past the highest usable address.
    pub base: u64,
    /// The lowest address, including guard zones.
    pub end: u64,
    pub guards: Vec<Arc<GuardZone>>,
}

impl StackRegion {
    /// The lowest address above every guard zone.
    pub fn usable_end(&self) -> u64 {
        self.guards
            .iter()
            .map(|g| g.range.end)
            .max()
            .unwrap_or(self.end)
    }

    /// Is `addr` anywhere in this stack, guard zones included?
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.end && addr < self.base
    }

    /// Is `addr` in the part of this stack generated code may use?
    pub fn is_usable(&self, addr: u64) -> bool {
        addr >= self.usable_end() && addr < self.base
    }

    pub fn guard(&self, kind: GuardKind) -> Option<&Arc<GuardZone>> {
        self.guards.iter().find(|g| g.kind == kind)
    }
}

struct CHeap {
    top: u64,
    free: Vec<(u64, u64)>,
    live: HashMap<u64, u64>,
}

pub struct Memory {
    regions: Vec<Region>,
    heap_top: AtomicU64,
    cheap: Mutex<CHeap>,
    stack_top: Mutex<u64>,
    guards: RwLock<Vec<Arc<GuardZone>>>,
}

impl Memory {
    pub fn new(heap_bytes: u64, c_heap_bytes: u64, stack_bytes: u64) -> Result<Self, io::Error> {
        let regions = vec![
            Region::new(RegionKind::Heap, HEAP_BASE, heap_bytes)?,
            Region::new(RegionKind::CHeap, C_HEAP_BASE, c_heap_bytes)?,
            Region::new(RegionKind::Stacks, STACK_BASE, stack_bytes)?,
        ];
        Ok(Self {
            regions,
            // Address 0 is never handed out by either heap: keep their first word unused.
            heap_top: AtomicU64::new(HEAP_BASE + 16),
            cheap: Mutex::new(CHeap {
                top: C_HEAP_BASE + 16,
                free: Vec::new(),
                live: HashMap::new(),
            }),
            stack_top: Mutex::new(STACK_BASE),
            guards: RwLock::new(Vec::new()),
        })
    }

    fn region(&self, kind: RegionKind) -> &Region {
        // `new` creates one region of each kind.
        self.regions.iter().find(|r| r.kind == kind).unwrap()
    }

    fn host_ptr(&self, addr: u64, size: u64) -> Option<*mut u8> {
        let r = self.regions.iter().find(|r| r.contains(addr, size))?;
        // The region contains the whole access.
        Some(unsafe { r.ptr.0.add((addr - r.base) as usize) })
    }

    fn guard_at(&self, addr: u64) -> Option<Arc<GuardZone>> {
        self.guards
            .read()
            .iter()
            .find(|g| g.is_enabled() && g.range.contains(&addr))
            .cloned()
    }

    /// Translate `addr`, panicking if the access is not allowed.
    fn checked(&self, addr: u64, size: u64) -> *mut u8 {
        if addr % size != 0 {
            panic!("misaligned {size}-byte access at {addr:#x}");
        }
        if let Some(g) = self.guard_at(addr) {
            panic!("stack overflow: access to {:?} at {addr:#x}", g);
        }
        match self.host_ptr(addr, size) {
            Some(p) => p,
            None => panic!("access to unmapped address {addr:#x}"),
        }
    }

    fn atomic64(&self, addr: u64) -> &AtomicU64 {
        let p = self.checked(addr, 8);
        // `checked` guarantees an aligned pointer into a live mapping owned by `self`.
        unsafe { AtomicU64::from_ptr(p as *mut u64) }
    }

    fn atomic32(&self, addr: u64) -> &AtomicU32 {
        let p = self.checked(addr, 4);
        unsafe { AtomicU32::from_ptr(p as *mut u32) }
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        self.atomic64(addr).load(Ordering::SeqCst)
    }

    pub fn write_u64(&self, addr: u64, v: u64) {
        self.atomic64(addr).store(v, Ordering::SeqCst)
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        self.atomic32(addr).load(Ordering::SeqCst)
    }

    pub fn write_u32(&self, addr: u64, v: u32) {
        self.atomic32(addr).store(v, Ordering::SeqCst)
    }

    /// Atomically replace the word at `addr` with `new` if it holds `old`. Returns the previous
    /// value: `Ok` if the exchange happened.
    pub fn cmpxchg_u64(&self, addr: u64, old: u64, new: u64) -> Result<u64, u64> {
        self.atomic64(addr)
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
    }

    /// Read a word without trusting `addr`.
    pub fn try_read_u64(&self, addr: u64) -> Option<u64> {
        if addr % 8 != 0 || self.guard_at(addr).is_some() {
            return None;
        }
        let p = self.host_ptr(addr, 8)?;
        Some(unsafe { AtomicU64::from_ptr(p as *mut u64) }.load(Ordering::SeqCst))
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.host_ptr(addr, 1).is_some()
    }

    /// Touch `addr` the way a stack bang does.
    ///
    /// # Panics
    ///
    /// If `addr` is in an enabled guard zone or is unmapped.
    pub fn bang(&self, addr: u64) {
        if let Some(g) = self.guard_at(addr) {
            panic!("stack overflow: stack bang hit {:?} at {addr:#x}", g);
        }
        if !self.is_mapped(addr) {
            panic!("stack bang of unmapped address {addr:#x}");
        }
    }

    /// Copy `words` to consecutive words starting at `addr`.
    pub fn write_words(&self, addr: u64, words: &[u64]) {
        for (i, w) in words.iter().enumerate() {
            self.write_u64(addr + i as u64 * 8, *w);
        }
    }

    pub fn read_words(&self, addr: u64, n: usize) -> Vec<u64> {
        (0..n).map(|i| self.read_u64(addr + i as u64 * 8)).collect()
    }

    /// Write `bytes`, zero padded to a whole number of words.
    pub fn write_bytes(&self, addr: u64, bytes: &[u8]) {
        for (i, c) in bytes.chunks(8).enumerate() {
            let mut w = [0u8; 8];
            w[..c.len()].copy_from_slice(c);
            self.write_u64(addr + i as u64 * 8, u64::from_le_bytes(w));
        }
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len.next_multiple_of(8));
        for i in 0..len.div_ceil(8) {
            out.extend(self.read_u64(addr + i as u64 * 8).to_le_bytes());
        }
        out.truncate(len);
        out
    }

    /// Allocate `bytes` of zeroed object heap. The heap is never collected.
    pub fn alloc_heap(&self, bytes: u64) -> u64 {
        let bytes = bytes.next_multiple_of(8);
        let addr = self.heap_top.fetch_add(bytes, Ordering::Relaxed);
        let r = self.region(RegionKind::Heap);
        if !r.contains(addr, bytes) {
            panic!("object heap exhausted allocating {bytes} bytes");
        }
        addr
    }

    /// Allocate `bytes` of zeroed C heap.
    pub fn malloc(&self, bytes: u64) -> u64 {
        let bytes = bytes.next_multiple_of(16);
        let mut ch = self.cheap.lock();
        let addr = match ch.free.iter().position(|(_, len)| *len == bytes) {
            Some(i) => ch.free.swap_remove(i).0,
            None => {
                let addr = ch.top;
                if !self.region(RegionKind::CHeap).contains(addr, bytes) {
                    panic!("C heap exhausted allocating {bytes} bytes");
                }
                ch.top += bytes;
                addr
            }
        };
        ch.live.insert(addr, bytes);
        drop(ch);
        for i in 0..bytes / 8 {
            self.write_u64(addr + i * 8, 0);
        }
        addr
    }

    /// Release a block returned by [Self::malloc].
    ///
    /// # Panics
    ///
    /// If `addr` is not a live allocation.
    pub fn free(&self, addr: u64) {
        let mut ch = self.cheap.lock();
        match ch.live.remove(&addr) {
            Some(len) => ch.free.push((addr, len)),
            None => panic!("free of {addr:#x} which is not a live allocation"),
        }
    }

    pub fn c_heap_live(&self) -> usize {
        self.cheap.lock().live.len()
    }

    /// Carve a stack of `bytes` (rounded up to whole pages) out of the stack arena, with
    /// `guard_pages` pages each of red, yellow and reserved zone at its low end.
    pub fn alloc_stack(&self, bytes: u64, guard_pages: u64) -> StackRegion {
        let page = page_size::get() as u64;
        let bytes = bytes.next_multiple_of(page) + 3 * guard_pages * page;
        let mut top = self.stack_top.lock();
        let end = *top;
        if !self.region(RegionKind::Stacks).contains(end, bytes) {
            panic!("stack arena exhausted");
        }
        *top += bytes;
        let mut guards = Vec::new();
        let mut lo = end;
        for kind in [GuardKind::Red, GuardKind::Yellow, GuardKind::Reserved] {
            let hi = lo + guard_pages * page;
            if guard_pages > 0 {
                guards.push(Arc::new(GuardZone {
                    range: lo..hi,
                    kind,
                    enabled: AtomicBool::new(true),
                }));
            }
            lo = hi;
        }
        self.guards.write().extend(guards.iter().cloned());
        StackRegion {
            base: end + bytes,
            end,
            guards,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mem() -> Memory {
        Memory::new(1 << 16, 1 << 16, 1 << 20).unwrap()
    }

    #[test]
    fn read_write() {
        let m = mem();
        let a = m.alloc_heap(24);
        assert_eq!(m.read_u64(a), 0);
        m.write_u64(a + 8, 0xdead_beef);
        assert_eq!(m.read_u64(a + 8), 0xdead_beef);
        m.write_u32(a + 16, 7);
        assert_eq!(m.read_u32(a + 16), 7);
        assert_eq!(m.cmpxchg_u64(a + 8, 1, 2), Err(0xdead_beef));
        assert_eq!(m.cmpxchg_u64(a + 8, 0xdead_beef, 2), Ok(0xdead_beef));
        assert_eq!(m.read_u64(a + 8), 2);
        m.write_bytes(a, &[1, 2, 3]);
        assert_eq!(m.read_bytes(a, 3), vec![1, 2, 3]);
    }

    #[test]
    fn c_heap_reuses_blocks() {
        let m = mem();
        let a = m.malloc(40);
        m.write_u64(a, 5);
        m.free(a);
        assert_eq!(m.c_heap_live(), 0);
        let b = m.malloc(48);
        assert_eq!(a, b);
        assert_eq!(m.read_u64(b), 0);
    }

    #[test]
    #[should_panic(expected = "not a live allocation")]
    fn double_free() {
        let m = mem();
        let a = m.malloc(8);
        m.free(a);
        m.free(a);
    }

    #[test]
    #[should_panic(expected = "unmapped")]
    fn unmapped() {
        mem().read_u64(8);
    }

    #[test]
    fn guard_zones() {
        let m = mem();
        let s = m.alloc_stack(1 << 14, 1);
        let page = page_size::get() as u64;
        assert_eq!(s.usable_end(), s.end + 3 * page);
        assert!(s.is_usable(s.base - 8));
        assert!(!s.is_usable(s.end));
        assert!(s.contains(s.end));
        assert_eq!(m.try_read_u64(s.end), None);
        assert_eq!(m.try_read_u64(s.base - 8), Some(0));
        let yellow = s.guard(GuardKind::Yellow).unwrap();
        yellow.set_enabled(false);
        m.write_u64(yellow.range.start, 1);
        yellow.set_enabled(true);
        assert_eq!(m.try_read_u64(yellow.range.start), None);
    }

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn touching_red_zone_is_fatal() {
        let m = mem();
        let s = m.alloc_stack(1 << 14, 1);
        m.write_u64(s.end + 8, 1);
    }
}
