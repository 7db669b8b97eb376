//! Native functions.
//!
//! A native function is a Rust closure registered under a native signature. Generated code calls
//! it with [crate::masm::Inst::CallNative] after laying its arguments out under the platform's
//! native calling convention; [invoke] picks them up from exactly where that convention put them.

use crate::{
    abi::{BasicType, FReg, Reg},
    callconv::Convention,
    frame::Frame,
    masm::sim::Machine,
    mem::Memory,
    method::MethodId,
    runtime::Runtime,
    stubs::{self, CallOutcome},
    thread::{ThreadContext, ThreadState},
};
use drtmap::Location;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use typed_index_collections::TiVec;

/// The number of local handles in a thread's handle block.
pub const HANDLE_BLOCK_SLOTS: u64 = 32;
/// A handle block is a count followed by the handles.
pub const HANDLE_BLOCK_BYTES: u64 = 8 + HANDLE_BLOCK_SLOTS * 8;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NativeId(usize);

impl From<usize> for NativeId {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<NativeId> for usize {
    fn from(v: NativeId) -> Self {
        v.0
    }
}

pub type NativeFn = Arc<dyn Fn(&mut NativeCall<'_, '_>) -> u64 + Send + Sync>;

pub struct NativeFunction {
    pub name: String,
    /// The native signature, in slot form.
    pub sig: Vec<BasicType>,
    pub ret: BasicType,
    f: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

pub struct NativeRegistry {
    fns: RwLock<TiVec<NativeId, Arc<NativeFunction>>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self {
            fns: RwLock::new(TiVec::new()),
        }
    }

    pub fn register(
        &self,
        name: &str,
        sig: Vec<BasicType>,
        ret: BasicType,
        f: NativeFn,
    ) -> NativeId {
        self.fns.write().push_and_get_key(Arc::new(NativeFunction {
            name: name.to_owned(),
            sig,
            ret,
            f,
        }))
    }

    pub fn get(&self, id: NativeId) -> Arc<NativeFunction> {
        Arc::clone(&self.fns.read()[id])
    }
}

/// What a native function sees of the thread calling it.
pub struct NativeCall<'a, 't> {
    m: &'a mut Machine<'t>,
    args: Vec<u64>,
}

impl<'a, 't> NativeCall<'a, 't> {
    /// The `i`th argument, not counting the placeholder halves of 64-bit arguments. Float
    /// arguments are returned as their bits.
    pub fn arg(&self, i: usize) -> u64 {
        self.args[i]
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn rt(&self) -> &Arc<Runtime> {
        self.m.rt()
    }

    pub fn mem(&self) -> &Memory {
        &self.m.rt().mem
    }

    pub fn thread(&mut self) -> &mut ThreadContext {
        &mut *self.m.thread
    }

    pub fn machine(&mut self) -> &mut Machine<'t> {
        &mut *self.m
    }

    /// The object a handle refers to. A null handle refers to null.
    pub fn resolve(&self, handle: u64) -> u64 {
        match handle {
            0 => 0,
            h => self.mem().read_u64(h),
        }
    }

    /// Create a local handle for `obj`, valid until the native wrapper returns. Handles made by
    /// natives this one calls back into managed code to reach live in blocks of their own.
    ///
    /// # Panics
    ///
    /// If the thread's handle block is full.
    pub fn new_local(&mut self, obj: u64) -> u64 {
        if obj == 0 {
            return 0;
        }
        let block = self.m.thread.active_handles;
        let mem = &self.m.rt().mem;
        let top = mem.read_u64(block);
        assert!(top < HANDLE_BLOCK_SLOTS, "local handle block overflow");
        let h = block + 8 + top * 8;
        mem.write_u64(h, obj);
        mem.write_u64(block, top + 1);
        h
    }

    /// Leave `exc` pending: the native wrapper forwards it once this function returns.
    pub fn throw(&mut self, exc: u64) {
        self.m.thread.pending_exception = exc;
    }

    /// The youngest managed frame: the native wrapper's.
    pub fn last_frame(&mut self) -> Frame {
        self.m.thread.last_frame()
    }

    /// Call back into managed code.
    pub fn call(&mut self, method: MethodId, args: &[u64]) -> CallOutcome {
        stubs::call_managed(self.m, method, args)
    }
}

/// Call native function `id` for `m`. The native stack arguments start at `args_base`. Returns
/// the function's declared return type and its result.
pub(crate) fn invoke(m: &mut Machine<'_>, id: NativeId, args_base: u64) -> (BasicType, u64) {
    let state = m.thread.shared.state();
    assert!(
        state == ThreadState::InNative,
        "native code called in thread state {state}"
    );
    let f = m.rt().natives.get(id);
    let layout = m.rt().callconv.get(&f.sig, true, Convention::C);
    let args = layout
        .args()
        .map(|(_, r)| match r.first() {
            Some(l @ Location::Gp { .. }) => m.cpu.reg(Reg::from_loc(l)),
            Some(l @ Location::Fp { .. }) => m.cpu.freg(FReg::from_loc(l)),
            Some(l) => m.rt().mem.read_u64(args_base + l.stack_offset()),
            None => unreachable!("argument without a location"),
        })
        .collect();
    let mut nc = NativeCall { m, args };
    let v = (f.f)(&mut nc);
    (f.ret, v)
}
