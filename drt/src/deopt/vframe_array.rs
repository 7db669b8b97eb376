//! The state of a compiled frame being deoptimized, held between [super::fetch_unroll_info] and
//! [super::unpack_frames].

use super::{
    scope::{location_addr, read_value, StackValue, SYNCHRONIZATION_ENTRY_BCI},
    unroll::UnrollBlock,
    ExecMode,
};
use crate::{
    abi::{BasicType, WORD},
    frame::{
        interp::{self, FixedSlots},
        Frame, RegisterMap,
    },
    heap,
    method::Method,
    runtime::Runtime,
    sync::{BASIC_OBJECT_LOCK_OBJ_OFFSET, BASIC_OBJECT_LOCK_SIZE},
    thread::ThreadContext,
};
use std::sync::Arc;

/// One activation of the deoptimized frame.
#[derive(Debug)]
pub struct VframeArrayElement {
    pub method: Arc<Method>,
    pub bci: i32,
    pub reexecute: bool,
    /// Padded to the method's `max_locals`.
    pub locals: Vec<StackValue>,
    pub expressions: Vec<StackValue>,
    /// The owner of each monitor, oldest first, and the box in the monitor chunk now holding its
    /// lock.
    pub monitors: Vec<(u64, u64)>,
}

impl VframeArrayElement {
    /// The interpreter's resume address for this activation.
    fn resume_pc(&self, rt: &Runtime, is_top: bool, mode: ExecMode) -> u64 {
        let s = rt.stubs();
        if !is_top {
            return s.interpreter_continue_after();
        }
        if self.bci == SYNCHRONIZATION_ENTRY_BCI {
            return s.interpreter_reexecute();
        }
        match mode {
            ExecMode::Exception => s.interpreter_rethrow(),
            ExecMode::UncommonTrap | ExecMode::Reexecute => s.interpreter_reexecute(),
            ExecMode::Deopt if self.reexecute => s.interpreter_reexecute(),
            ExecMode::Deopt => s.interpreter_continue_after(),
        }
    }

    /// The locals this activation adds beyond its parameters, which extend its caller's frame.
    fn extra_locals(&self) -> u32 {
        interp::last_frame_adjust(self.method.size_of_parameters(), self.method.max_locals)
    }
}

#[derive(Debug)]
pub struct VframeArray {
    /// Innermost first.
    pub elements: Vec<VframeArrayElement>,
    pub original_sp: u64,
    pub original_pc: u64,
    sender_sp: u64,
    /// If the sender is interpreted, where its outgoing parameters end: the oldest activation's
    /// locals start there rather than in the caller adjustment.
    sender_outgoing_top: Option<u64>,
    monitor_chunk: Option<u64>,
    /// The address of the unroll block, once written.
    pub unroll_block: u64,
    pub result_type: BasicType,
}

impl VframeArray {
    /// Capture the state of `deoptee`, reallocating its scalar-replaced objects and relocking its
    /// eliminated monitors. Afterwards nothing refers to the compiled frame's contents.
    pub(crate) fn allocate(
        rt: &Runtime,
        thread: &mut ThreadContext,
        deoptee: &Frame,
        map: &RegisterMap,
        sender: &Frame,
        mode: ExecMode,
    ) -> Self {
        let mem = &rt.mem;
        let b = deoptee
            .blob()
            .unwrap_or_else(|| unreachable!("compiled frame without a blob"));
        let nm = b
            .nmethod()
            .unwrap_or_else(|| panic!("{deoptee} isn't compiled managed code"));
        let pd = nm
            .pc_desc_at(b.offset_of(deoptee.pc()))
            .unwrap_or_else(|| panic!("no debug information at {deoptee}"));

        // Allocate every object before filling any in: fields may refer to each other.
        let objects = pd
            .objects
            .iter()
            .map(|ov| rt.heap.alloc_object(mem, ov.class))
            .collect::<Vec<_>>();
        for (ov, &obj) in pd.objects.iter().zip(&objects) {
            for (i, f) in ov.fields.iter().enumerate() {
                let v = read_value(mem, deoptee, map, f, &objects);
                mem.write_u64(heap::field_addr(obj, i as u32), v.bits());
            }
        }

        let frame_id = deoptee.unextended_sp();
        let nmonitors = pd.scopes.iter().map(|sd| sd.monitors.len()).sum::<usize>() as u64;
        let monitor_chunk = (nmonitors > 0).then(|| mem.malloc(nmonitors * BASIC_OBJECT_LOCK_SIZE));
        let mut next_box = monitor_chunk.unwrap_or(0);
        let thread_id = thread.id();
        let elements = pd
            .scopes
            .iter()
            .enumerate()
            .map(|(vi, sd)| {
                let method = rt.method(sd.method);
                let mut locals = (0..method.max_locals as usize)
                    .map(|i| match sd.locals.get(i) {
                        Some(v) => read_value(mem, deoptee, map, v, &objects),
                        None => StackValue::Conflict,
                    })
                    .collect::<Vec<_>>();
                let mut expressions = sd
                    .expressions
                    .iter()
                    .map(|v| read_value(mem, deoptee, map, v, &objects))
                    .collect::<Vec<_>>();
                let mut owners = sd
                    .monitors
                    .iter()
                    .map(|mv| read_value(mem, deoptee, map, &mv.owner, &objects).bits())
                    .collect::<Vec<_>>();
                thread.deferred.reconcile(
                    frame_id,
                    vi,
                    method.max_locals,
                    method.max_stack,
                    &mut locals,
                    &mut expressions,
                    &mut owners,
                );
                let monitors = sd
                    .monitors
                    .iter()
                    .zip(owners)
                    .map(|(mv, owner)| {
                        let lock = location_addr(deoptee, map, mv.basic_lock);
                        if mv.eliminated {
                            rt.sync.enter(mem, owner, lock, thread_id);
                        }
                        let to = next_box;
                        next_box += BASIC_OBJECT_LOCK_SIZE;
                        mem.write_u64(to + BASIC_OBJECT_LOCK_OBJ_OFFSET as u64, owner);
                        rt.sync.move_lock(mem, owner, lock, to);
                        (owner, to)
                    })
                    .collect();
                VframeArrayElement {
                    method,
                    bci: sd.bci,
                    reexecute: sd.reexecute,
                    locals,
                    expressions,
                    monitors,
                }
            })
            .collect::<Vec<_>>();
        thread.deferred.remove(frame_id);

        let sender_outgoing_top = sender.is_interpreted().then(|| {
            match sender.interpreter_frame_last_sp(mem) {
                0 => sender.sp(),
                x => x,
            }
        });
        let result_type = match mode {
            ExecMode::Exception => BasicType::Object,
            _ => pd.return_type.unwrap_or(BasicType::Void),
        };
        Self {
            elements,
            original_sp: deoptee.sp(),
            original_pc: deoptee.pc(),
            sender_sp: sender.sp(),
            sender_outgoing_top,
            monitor_chunk,
            unroll_block: 0,
            result_type,
        }
    }

    /// Describe the interpreter frames replacing `deoptee`.
    pub(crate) fn unroll_block(
        &self,
        rt: &Runtime,
        deoptee: &Frame,
        sender: &Frame,
        mode: ExecMode,
    ) -> UnrollBlock {
        let n = self.elements.len();
        let mut frame_sizes = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, el)| {
                let (cp, cl) = match i.checked_sub(1) {
                    Some(j) => {
                        let callee = &self.elements[j].method;
                        (callee.size_of_parameters(), callee.max_locals)
                    }
                    None => (0, 0),
                };
                let words = interp::on_stack_size(
                    el.method.max_stack,
                    el.expressions.len() as u32,
                    el.monitors.len() as u32,
                    cp,
                    cl,
                    i == 0,
                );
                u64::from(words) * WORD
            })
            .collect::<Vec<_>>();
        frame_sizes.reverse();

        let mut frame_pcs = Vec::with_capacity(n + 1);
        frame_pcs.push(sender.raw_pc());
        for i in (0..n).rev() {
            frame_pcs.push(self.elements[i].resume_pc(rt, i == 0, mode));
        }

        let oldest = &self.elements[n - 1];
        // Only an interpreted sender has pushed the oldest activation's parameters.
        let params = if self.sender_outgoing_top.is_some() {
            oldest.method.size_of_parameters()
        } else {
            0
        };
        let caller_adjustment =
            u64::from(interp::last_frame_adjust(params, oldest.method.max_locals)) * WORD;
        UnrollBlock {
            size_of_deoptimized_frame: sender.sp() - deoptee.sp(),
            caller_adjustment,
            initial_info: sender.fp(),
            unpack_kind: mode,
            caller_actual_parameters: oldest.method.size_of_parameters(),
            frame_sizes,
            frame_pcs,
        }
    }

    /// Fill in the skeletal frames the blob pushed, the youngest of which starts at
    /// `youngest_sp`. The older frames are found through the frame pointer chain.
    pub(crate) fn unpack_to_stack(&self, rt: &Runtime, youngest_sp: u64, ub: &UnrollBlock) {
        let mem = &rt.mem;
        let n = self.elements.len();
        let mut pos = Vec::with_capacity(n);
        let mut younger_fp = youngest_sp - 2 * WORD;
        for size in ub.frame_sizes.iter().rev() {
            let sp = younger_fp + 2 * WORD;
            let fp = mem.read_u64(younger_fp);
            debug_assert_eq!(fp + 2 * WORD - sp, *size, "skeletal frame at {sp:#x}");
            pos.push((sp, fp));
            younger_fp = fp;
        }

        // Oldest first: a callee's parameters overlap its caller's expression stack, and the
        // callee's view of them (which includes any deferred writes) wins.
        for i in (0..n).rev() {
            let el = &self.elements[i];
            let (sp, fp) = pos[i];
            let is_top = i == 0;
            let is_bottom = i == n - 1;
            let m = &el.method;
            let top_of_locals = |base: u64, count: u32| base + u64::from(count) * WORD - WORD;
            let (sender_sp, locals) = if is_bottom {
                let locals = match self.sender_outgoing_top {
                    Some(top) => top_of_locals(top, ub.caller_actual_parameters),
                    None => top_of_locals(fp + 2 * WORD, m.max_locals),
                };
                (self.sender_sp, locals)
            } else {
                (
                    fp + 2 * WORD + u64::from(el.extra_locals()) * WORD,
                    top_of_locals(fp + 2 * WORD, m.max_locals),
                )
            };
            let nmon = el.monitors.len() as u32;
            let monitor_top =
                interp::monitor_block_bottom(fp) - u64::from(nmon) * BASIC_OBJECT_LOCK_SIZE;
            let expression_top = monitor_top - el.expressions.len() as u64 * WORD;
            let mut fixed = FixedSlots::new(m, locals, el.bci.max(0) as u32, nmon);
            fixed.sender_sp = sender_sp;
            fixed.last_sp = if is_top { 0 } else { expression_top };
            fixed.write(mem, fp);

            for (k, v) in el.locals.iter().enumerate() {
                mem.write_u64(locals - k as u64 * WORD, v.bits());
            }
            for (j, v) in el.expressions.iter().enumerate() {
                mem.write_u64(monitor_top - (j as u64 + 1) * WORD, v.bits());
            }
            for (k, &(owner, chunk_box)) in el.monitors.iter().enumerate() {
                let lock = interp::monitor_addr(fp, k as u32);
                mem.write_u64(lock + BASIC_OBJECT_LOCK_OBJ_OFFSET as u64, owner);
                rt.sync.move_lock(mem, owner, chunk_box, lock);
            }
            mem.write_u64(sp - WORD, el.resume_pc(rt, is_top, ub.unpack_kind));
        }
        if let Some(chunk) = self.monitor_chunk {
            mem.free(chunk);
        }
    }
}

