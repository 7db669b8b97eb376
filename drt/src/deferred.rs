//! Writes to the locals of compiled frames that can't be made in place.
//!
//! A debugger may change a local, expression stack entry or monitor owner of any method activation,
//! including one inlined into a compiled frame. Compiled code may keep the value in a register or
//! have folded it away entirely, so the write is recorded against the frame here, where reads
//! through [crate::deopt::frame_state] see it, and is applied when the frame is deoptimized and
//! its interpreter frames are built.
//!
//! Values are addressed by a flat index into the activation's state: the first `max_locals`
//! indices are locals, the next `max_stack` are expression stack entries (bottom first), and the
//! rest are monitor owners (oldest first).

use crate::{abi::BasicType, deopt::scope::StackValue};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeferredUpdate {
    pub index: u32,
    pub ty: BasicType,
    pub value: u64,
}

/// The pending writes to one activation of one compiled frame.
#[derive(Clone, Debug)]
struct FrameUpdates {
    /// The unextended sp of the compiled frame.
    frame_id: u64,
    /// The activation within the frame: 0 is the innermost.
    vframe_id: usize,
    updates: Vec<DeferredUpdate>,
}

/// Where an update lands in an activation's state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    Local(usize),
    Expression(usize),
    MonitorOwner(usize),
}

impl Slot {
    pub fn of(index: u32, max_locals: u32, max_stack: u32) -> Self {
        let i = index as usize;
        let (l, s) = (max_locals as usize, max_stack as usize);
        if i < l {
            Slot::Local(i)
        } else if i < l + s {
            Slot::Expression(i - l)
        } else {
            Slot::MonitorOwner(i - l - s)
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DeferredUpdates {
    frames: Vec<FrameUpdates>,
}

impl DeferredUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that value `index` of activation `vframe_id` of the compiled frame `frame_id` is now
    /// `value`. A later write to the same value replaces an earlier one.
    pub fn set(&mut self, frame_id: u64, vframe_id: usize, index: u32, ty: BasicType, value: u64) {
        let u = DeferredUpdate { index, ty, value };
        let fu = match self
            .frames
            .iter_mut()
            .position(|f| f.frame_id == frame_id && f.vframe_id == vframe_id)
        {
            Some(i) => &mut self.frames[i],
            None => {
                self.frames.push(FrameUpdates {
                    frame_id,
                    vframe_id,
                    updates: Vec::new(),
                });
                self.frames.last_mut().unwrap_or_else(|| unreachable!())
            }
        };
        match fu.updates.iter_mut().find(|x| x.index == index) {
            Some(x) => *x = u,
            None => fu.updates.push(u),
        }
    }

    pub fn get(&self, frame_id: u64, vframe_id: usize) -> &[DeferredUpdate] {
        self.frames
            .iter()
            .find(|f| f.frame_id == frame_id && f.vframe_id == vframe_id)
            .map(|f| &f.updates[..])
            .unwrap_or(&[])
    }

    /// Overwrite the values read from activation `vframe_id` of frame `frame_id` with any pending
    /// writes to them. Updates to entries the activation doesn't have are ignored.
    pub fn reconcile(
        &self,
        frame_id: u64,
        vframe_id: usize,
        max_locals: u32,
        max_stack: u32,
        locals: &mut [StackValue],
        expressions: &mut [StackValue],
        monitor_owners: &mut [u64],
    ) {
        for u in self.get(frame_id, vframe_id) {
            let v = if u.ty.is_reference() {
                StackValue::Obj(u.value)
            } else {
                StackValue::Int(u.value)
            };
            match Slot::of(u.index, max_locals, max_stack) {
                Slot::Local(i) => {
                    if let Some(x) = locals.get_mut(i) {
                        *x = v;
                    }
                }
                Slot::Expression(i) => {
                    if let Some(x) = expressions.get_mut(i) {
                        *x = v;
                    }
                }
                Slot::MonitorOwner(i) => {
                    if let Some(x) = monitor_owners.get_mut(i) {
                        *x = u.value;
                    }
                }
            }
        }
    }

    /// Forget every write to the frame `frame_id`, once it has been unpacked (or has returned).
    pub fn remove(&mut self, frame_id: u64) {
        self.frames.retain(|f| f.frame_id != frame_id);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.iter().map(|f| f.updates.len()).sum()
    }
}
