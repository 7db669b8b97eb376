//! Object monitors.
//!
//! The low two bits of an object's mark word say how it is locked:
//!
//!   * `01`: unlocked. The mark is the object's neutral header.
//!   * `00`: stack-locked. The mark is the address of a lock box on the owning thread's stack,
//!     and the box holds the displaced neutral header. A box holding 0 is a recursive stack lock.
//!   * `10`: inflated. The rest of the mark names an [ObjectMonitor].
//!
//! Generated code takes and releases stack locks inline with a compare-and-swap on the mark; the
//! slow paths land here. Monitors are never deflated.

use crate::mem::Memory;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{ops::Range, sync::Arc};
use typed_index_collections::TiVec;

pub const LOCK_MASK: u64 = 0b11;
pub const LOCKED_VALUE: u64 = 0b00;
pub const UNLOCKED_VALUE: u64 = 0b01;
pub const MONITOR_VALUE: u64 = 0b10;
/// Never a valid mark. Stored in a lock box that will never hold a displaced header, so that the
/// box looks neither recursive nor neutral.
pub const UNUSED_MARK: u64 = 0b11;

/// The size of an interpreter monitor: a lock box followed by the locked object.
pub const BASIC_OBJECT_LOCK_SIZE: u64 = 16;
pub const BASIC_OBJECT_LOCK_OBJ_OFFSET: i64 = 8;

pub fn is_neutral(mark: u64) -> bool {
    mark & LOCK_MASK == UNLOCKED_VALUE
}

pub fn is_stack_locked(mark: u64) -> bool {
    mark & LOCK_MASK == LOCKED_VALUE
}

pub fn has_monitor(mark: u64) -> bool {
    mark & LOCK_MASK == MONITOR_VALUE
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct MonitorIdx(usize);

impl From<usize> for MonitorIdx {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<MonitorIdx> for usize {
    fn from(v: MonitorIdx) -> Self {
        v.0
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    owner: Option<u64>,
    recursions: u32,
}

/// An inflated lock.
#[derive(Debug)]
pub struct ObjectMonitor {
    pub obj: u64,
    /// The neutral header displaced by inflation.
    pub header: u64,
    state: Mutex<MonitorState>,
    cv: Condvar,
}

impl ObjectMonitor {
    pub fn owner(&self) -> Option<u64> {
        self.state.lock().owner
    }

    pub fn recursions(&self) -> u32 {
        self.state.lock().recursions
    }

    fn enter(&self, thread: u64) {
        let mut st = self.state.lock();
        loop {
            match st.owner {
                None => {
                    st.owner = Some(thread);
                    st.recursions = 0;
                    return;
                }
                Some(o) if o == thread => {
                    st.recursions += 1;
                    return;
                }
                Some(_) => self.cv.wait(&mut st),
            }
        }
    }

    fn exit(&self, thread: u64) {
        let mut st = self.state.lock();
        assert_eq!(
            st.owner,
            Some(thread),
            "monitor of {:#x} released by a thread that doesn't own it",
            self.obj
        );
        if st.recursions > 0 {
            st.recursions -= 1;
        } else {
            st.owner = None;
            self.cv.notify_one();
        }
    }
}

pub struct ObjectSynchronizer {
    monitors: RwLock<TiVec<MonitorIdx, Arc<ObjectMonitor>>>,
    /// Serializes inflation so that an object gets at most one monitor.
    inflate_lock: Mutex<()>,
    /// Which thread owns which stack, to find the owner of a stack lock.
    stacks: RwLock<Vec<(Range<u64>, u64)>>,
}

impl ObjectSynchronizer {
    pub fn new() -> Self {
        Self {
            monitors: RwLock::new(TiVec::new()),
            inflate_lock: Mutex::new(()),
            stacks: RwLock::new(Vec::new()),
        }
    }

    pub fn register_stack(&self, range: Range<u64>, thread: u64) {
        self.stacks.write().push((range, thread));
    }

    pub fn unregister_stack(&self, thread: u64) {
        self.stacks.write().retain(|(_, t)| *t != thread);
    }

    /// The thread whose stack holds `addr`.
    fn stack_owner(&self, addr: u64) -> Option<u64> {
        self.stacks
            .read()
            .iter()
            .find(|(r, _)| r.contains(&addr))
            .map(|(_, t)| *t)
    }

    fn monitor_of(&self, mark: u64) -> Arc<ObjectMonitor> {
        debug_assert!(has_monitor(mark));
        Arc::clone(&self.monitors.read()[MonitorIdx((mark >> 2) as usize)])
    }

    /// Lock `obj` for `thread`, using the lock box at `lock`.
    pub fn enter(&self, mem: &Memory, obj: u64, lock: u64, thread: u64) {
        let mark = mem.read_u64(obj);
        if is_neutral(mark) {
            mem.write_u64(lock, mark);
            if mem.cmpxchg_u64(obj, mark, lock).is_ok() {
                return;
            }
        } else if is_stack_locked(mark) && self.stack_owner(mark) == Some(thread) {
            mem.write_u64(lock, 0);
            return;
        }
        mem.write_u64(lock, UNUSED_MARK);
        self.inflate(mem, obj).enter(thread);
    }

    /// Unlock `obj`, which `thread` locked with the box at `lock`.
    pub fn exit(&self, mem: &Memory, obj: u64, lock: u64, thread: u64) {
        let dhw = mem.read_u64(lock);
        if dhw == 0 {
            // Recursive stack lock.
            return;
        }
        if mem.read_u64(obj) == lock && mem.cmpxchg_u64(obj, lock, dhw).is_ok() {
            return;
        }
        self.inflate(mem, obj).exit(thread);
    }

    /// Give `obj` a monitor, if it doesn't already have one.
    pub fn inflate(&self, mem: &Memory, obj: u64) -> Arc<ObjectMonitor> {
        loop {
            let mark = mem.read_u64(obj);
            if has_monitor(mark) {
                return self.monitor_of(mark);
            }
            let _g = self.inflate_lock.lock();
            if mem.read_u64(obj) != mark {
                continue;
            }
            let (header, owner) = if is_stack_locked(mark) {
                let owner = self.stack_owner(mark).unwrap_or_else(|| {
                    panic!("{obj:#x} is stack-locked by {mark:#x}, which is on no stack")
                });
                (mem.read_u64(mark), Some(owner))
            } else {
                (mark, None)
            };
            let mut monitors = self.monitors.write();
            let idx = MonitorIdx(monitors.len());
            let m = Arc::new(ObjectMonitor {
                obj,
                header,
                state: Mutex::new(MonitorState {
                    owner,
                    recursions: 0,
                }),
                cv: Condvar::new(),
            });
            let word = (idx.0 as u64) << 2 | MONITOR_VALUE;
            // Only the owner of a stack lock changes the mark without the inflation lock, by
            // releasing it. Losing that race means trying again.
            if mem.cmpxchg_u64(obj, mark, word).is_ok() {
                monitors.push(Arc::clone(&m));
                return m;
            }
        }
    }

    /// Which thread, if any, holds the lock of `obj`?
    pub fn owner(&self, mem: &Memory, obj: u64) -> Option<u64> {
        let mark = mem.read_u64(obj);
        if is_neutral(mark) {
            None
        } else if is_stack_locked(mark) {
            self.stack_owner(mark)
        } else {
            self.monitor_of(mark).owner()
        }
    }

    /// Move the lock held through the box at `from` to the box at `to`. Stack locks point at their
    /// box, so an object stack-locked through `from` is inflated first.
    pub fn move_lock(&self, mem: &Memory, obj: u64, from: u64, to: u64) {
        let dhw = mem.read_u64(from);
        if is_neutral(dhw) {
            self.inflate(mem, obj);
        }
        mem.write_u64(to, dhw);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Barrier, thread};

    struct Fixture {
        mem: Arc<Memory>,
        sync: Arc<ObjectSynchronizer>,
        obj: u64,
        stack: u64,
    }

    fn fixture() -> Fixture {
        let mem = Arc::new(Memory::new(1 << 16, 1 << 12, 1 << 16).unwrap());
        let s = mem.alloc_stack(1 << 14, 0);
        let sync = Arc::new(ObjectSynchronizer::new());
        sync.register_stack(s.end..s.base, 1);
        let obj = mem.alloc_heap(16);
        mem.write_u64(obj, UNLOCKED_VALUE | 0x100);
        Fixture {
            mem,
            sync,
            obj,
            stack: s.base - 64,
        }
    }

    #[test]
    fn stack_lock_and_recursion() {
        let f = fixture();
        let (b1, b2) = (f.stack, f.stack - 16);
        f.sync.enter(&f.mem, f.obj, b1, 1);
        assert_eq!(f.mem.read_u64(f.obj), b1);
        assert_eq!(f.mem.read_u64(b1), UNLOCKED_VALUE | 0x100);
        f.sync.enter(&f.mem, f.obj, b2, 1);
        assert_eq!(f.mem.read_u64(b2), 0);
        assert_eq!(f.sync.owner(&f.mem, f.obj), Some(1));
        f.sync.exit(&f.mem, f.obj, b2, 1);
        f.sync.exit(&f.mem, f.obj, b1, 1);
        assert_eq!(f.mem.read_u64(f.obj), UNLOCKED_VALUE | 0x100);
        assert_eq!(f.sync.owner(&f.mem, f.obj), None);
    }

    #[test]
    fn inflate_stack_locked() {
        let f = fixture();
        f.sync.enter(&f.mem, f.obj, f.stack, 1);
        let m = f.sync.inflate(&f.mem, f.obj);
        assert!(has_monitor(f.mem.read_u64(f.obj)));
        assert_eq!(m.header, UNLOCKED_VALUE | 0x100);
        assert_eq!(m.owner(), Some(1));
        // The owner's fast path unlock fails and falls back to the monitor.
        f.sync.exit(&f.mem, f.obj, f.stack, 1);
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn move_lock_inflates() {
        let f = fixture();
        let (from, to) = (f.stack, f.stack - 32);
        f.sync.enter(&f.mem, f.obj, from, 1);
        f.sync.move_lock(&f.mem, f.obj, from, to);
        assert!(has_monitor(f.mem.read_u64(f.obj)));
        assert_eq!(f.sync.owner(&f.mem, f.obj), Some(1));
        f.sync.exit(&f.mem, f.obj, to, 1);
        assert_eq!(f.sync.owner(&f.mem, f.obj), None);
    }

    #[test]
    fn contended() {
        let f = fixture();
        let counter = f.mem.alloc_heap(8);
        let barrier = Arc::new(Barrier::new(4));
        let hs = (0..4u64)
            .map(|t| {
                let (mem, sync, barrier) = (
                    Arc::clone(&f.mem),
                    Arc::clone(&f.sync),
                    Arc::clone(&barrier),
                );
                let obj = f.obj;
                let s = mem.alloc_stack(4096, 0);
                sync.register_stack(s.end..s.base, 10 + t);
                let lock = s.base - 16;
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        sync.enter(&mem, obj, lock, 10 + t);
                        let v = mem.read_u64(counter);
                        mem.write_u64(counter, v + 1);
                        sync.exit(&mem, obj, lock, 10 + t);
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in hs {
            h.join().unwrap();
        }
        assert_eq!(f.mem.read_u64(counter), 400);
    }
}
