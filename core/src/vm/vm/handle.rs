//! Durable frame handles and lazy promotion.
//!
//! A handle starts as a pass-through view of the arena-owned record
//! (`Unboxed`). The ownership decision happens exactly once, at frame
//! teardown: a uniquely-held handle dies with the frame, an externally-held
//! one receives a heap copy of the header and live slots (`Promoted`). A
//! copy that cannot be charged to the heap budget leaves the handle in a
//! detectable `Failed` state.

use std::cell::RefCell;
use std::sync::Arc;

use anyhow::Result;
use tracing::{trace, warn};

use super::Vm;
use super::frame::{ActivationRecord, CallerLink, FrameState, FrameStorage};
use crate::vm::arena::Slot;

pub type FrameHandle = Arc<FrameObject>;

#[derive(Debug)]
pub struct FrameObject {
    state: RefCell<HandleState>,
}

#[derive(Debug)]
enum HandleState {
    /// View of the live record at `depth` on the owning VM's call stack.
    Unboxed { depth: usize },
    /// The frame it viewed is suspended off the stack (generator); the
    /// handle resolves again on the next resume.
    Parked,
    /// Exclusive owner of the record after teardown.
    Promoted { record: Box<ActivationRecord> },
    /// Promotion copy could not be allocated.
    Failed,
    Cleared,
}

impl FrameObject {
    fn unboxed(depth: usize) -> FrameHandle {
        Arc::new(FrameObject {
            state: RefCell::new(HandleState::Unboxed { depth }),
        })
    }

    fn set(&self, state: HandleState) {
        *self.state.borrow_mut() = state;
    }

    pub fn is_promoted(&self) -> bool {
        matches!(*self.state.borrow(), HandleState::Promoted { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.state.borrow(), HandleState::Failed)
    }

    pub fn is_cleared(&self) -> bool {
        matches!(*self.state.borrow(), HandleState::Cleared)
    }

    /// Read the promoted record. `None` unless promotion has happened; a
    /// live on-stack record is read through [`Vm::with_handle_record`].
    pub fn with_promoted<R>(&self, f: impl FnOnce(&ActivationRecord) -> R) -> Option<R> {
        match &*self.state.borrow() {
            HandleState::Promoted { record } => Some(f(record)),
            _ => None,
        }
    }

    /// The caller's handle, present once promotion rewired the back-link.
    pub fn back(&self) -> Option<FrameHandle> {
        match &*self.state.borrow() {
            HandleState::Promoted { record } => match &record.previous {
                CallerLink::Handle(handle) => Some(handle.clone()),
                _ => None,
            },
            _ => None,
        }
    }
}

impl Vm {
    /// The durable handle for the frame at `depth`, created on first
    /// request and cached on the record so repeated calls return the same
    /// handle.
    pub fn get_or_create_handle(&mut self, depth: usize) -> FrameHandle {
        if let Some(handle) = &self.call_stack[depth].handle {
            return handle.clone();
        }
        let handle = FrameObject::unboxed(depth);
        self.call_stack[depth].handle = Some(handle.clone());
        trace!(target: "quill::vm::frames", depth, "frame handle created");
        handle
    }

    /// The caller's handle for the frame at `depth`, created lazily.
    pub fn get_back_handle(&mut self, depth: usize) -> Option<FrameHandle> {
        match self.call_stack[depth].previous.clone() {
            CallerLink::None => None,
            CallerLink::Stack(caller) => Some(self.get_or_create_handle(caller)),
            CallerLink::Handle(handle) => Some(handle),
        }
    }

    /// Read a record through its handle, resolving unboxed handles against
    /// this VM's live call stack.
    pub fn with_handle_record<R>(
        &self,
        handle: &FrameObject,
        f: impl FnOnce(&ActivationRecord) -> R,
    ) -> Option<R> {
        match &*handle.state.borrow() {
            HandleState::Unboxed { depth } => self.call_stack.get(*depth).map(f),
            HandleState::Promoted { record } => Some(f(record)),
            HandleState::Parked | HandleState::Failed | HandleState::Cleared => None,
        }
    }

    /// Teardown: decide the record's fate exactly once. No handle, or a
    /// handle nothing else holds, means plain release; an externally-held
    /// handle takes ownership of a heap copy.
    pub(crate) fn clear_frame(&mut self, mut record: ActivationRecord) -> Result<()> {
        if let Some(handle) = record.handle.take() {
            if Arc::strong_count(&handle) > 1 {
                // The record must not keep its own handle: the handle owns
                // the record after promotion and a back-reference would
                // cycle the refcounts.
                return self.promote(record, handle);
            }
            // The record held the only reference; the handle dies with it.
            handle.set(HandleState::Cleared);
        }
        self.release_record(record);
        Ok(())
    }

    fn release_record(&mut self, mut record: ActivationRecord) {
        record.set_state(FrameState::Cleared);
        let storage = std::mem::replace(&mut record.storage, FrameStorage::Owned(Box::from([])));
        match storage {
            FrameStorage::Arena(range) => self.arena.pop(range),
            FrameStorage::Owned(slots) => drop(slots),
        }
    }

    fn promote(&mut self, mut record: ActivationRecord, handle: FrameHandle) -> Result<()> {
        // Rewire the caller link before the depth index goes stale.
        if let CallerLink::Stack(caller) = record.previous {
            if caller < self.call_stack.len() {
                let back = self.get_or_create_handle(caller);
                record.previous = CallerLink::Handle(back);
            } else {
                record.previous = CallerLink::None;
            }
        }
        let storage = std::mem::replace(&mut record.storage, FrameStorage::Owned(Box::from([])));
        match storage {
            FrameStorage::Owned(slots) => {
                // Already heap-owned (generator frame): take it as is.
                record.storage = FrameStorage::Owned(slots);
                trace!(target: "quill::vm::frames", code = %record.code.name, "owned frame transferred to handle");
                handle.set(HandleState::Promoted {
                    record: Box::new(record),
                });
                Ok(())
            }
            FrameStorage::Arena(range) => {
                let live = record.stacktop as usize;
                let bytes = (live * std::mem::size_of::<Slot>()) as u64;
                if let Err(err) = self.budget.charge(bytes) {
                    warn!(
                        target: "quill::vm::frames",
                        code = %record.code.name,
                        "frame promotion failed: {err}"
                    );
                    handle.set(HandleState::Failed);
                    record.storage = FrameStorage::Arena(range);
                    self.release_record(record);
                    return Err(err.into());
                }
                let copied: Box<[Slot]> = self.arena.slots(range)[..live].to_vec().into_boxed_slice();
                self.arena.pop(range);
                record.storage = FrameStorage::Owned(copied);
                trace!(
                    target: "quill::vm::frames",
                    code = %record.code.name,
                    slots = live,
                    "frame promoted to heap"
                );
                handle.set(HandleState::Promoted {
                    record: Box::new(record),
                });
                Ok(())
            }
        }
    }
}

/// Park a suspending generator frame's handle so it stops resolving
/// against the stack slot it is about to vacate.
pub(crate) fn park_handle(record: &ActivationRecord) {
    if let Some(handle) = &record.handle {
        handle.set(HandleState::Parked);
    }
}

/// Re-attach a resumed generator frame's handle to its new depth.
pub(crate) fn reattach_handle(record: &ActivationRecord, depth: usize) {
    if let Some(handle) = &record.handle {
        handle.set(HandleState::Unboxed { depth });
    }
}
