use std::fmt;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tracing::trace;

use super::handle::FrameHandle;
use crate::val::{CellObject, FunctionObject, Value};
use crate::vm::arena::{FrameArena, Slot, SlotRange};
use crate::vm::code::{CO_FAST_CELL, CO_FAST_FREE, CodeObject};
use crate::vm::context::Namespace;

/// Frame lifecycle. `Suspended` is reachable only from `Executing` and only
/// returns to it; `Cleared` is terminal and idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Created,
    Executing,
    Suspended,
    Returned,
    Unwinding,
    Raised,
    Cleared,
}

impl FrameState {
    pub fn is_runnable(self) -> bool {
        matches!(self, FrameState::Created | FrameState::Suspended)
    }

    pub fn has_completed(self) -> bool {
        matches!(
            self,
            FrameState::Returned | FrameState::Unwinding | FrameState::Raised | FrameState::Cleared
        )
    }

    pub(crate) fn may_become(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Created, Executing)
                | (Created, Cleared)
                | (Executing, Suspended)
                | (Executing, Returned)
                | (Executing, Unwinding)
                | (Suspended, Executing)
                | (Suspended, Cleared)
                | (Unwinding, Raised)
                | (Returned, Cleared)
                | (Raised, Cleared)
                | (Cleared, Cleared)
        )
    }
}

/// Back-link to the caller. Records on the call stack refer to their caller
/// by depth; promotion rewrites the link to the caller's durable handle.
#[derive(Debug, Clone)]
pub enum CallerLink {
    None,
    Stack(usize),
    Handle(FrameHandle),
}

/// Where a record's slot array lives.
pub enum FrameStorage {
    Arena(SlotRange),
    Owned(Box<[Slot]>),
}

impl fmt::Debug for FrameStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameStorage::Arena(range) => f.debug_tuple("Arena").field(range).finish(),
            FrameStorage::Owned(slots) => write!(f, "Owned({} slots)", slots.len()),
        }
    }
}

/// Per-call execution state. The slot array holds locals, cells and free
/// variables first, then the operand stack; `stacktop` is the TOS offset
/// from the slot base and every slot access is bounded by it.
pub struct ActivationRecord {
    pub(crate) func: Arc<FunctionObject>,
    pub(crate) code: Arc<CodeObject>,
    pub(crate) globals: Arc<Namespace>,
    pub(crate) builtins: Arc<Namespace>,
    pub(crate) locals: Option<Value>,
    pub(crate) handle: Option<FrameHandle>,
    pub(crate) previous: CallerLink,
    pub(crate) lasti: i32,
    pub(crate) stacktop: u32,
    state: FrameState,
    pub(crate) storage: FrameStorage,
}

impl fmt::Debug for ActivationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationRecord")
            .field("code", &self.code.name)
            .field("state", &self.state)
            .field("lasti", &self.lasti)
            .field("stacktop", &self.stacktop)
            .field("storage", &self.storage)
            .finish()
    }
}

impl ActivationRecord {
    pub(crate) fn new(
        func: Arc<FunctionObject>,
        locals: Option<Value>,
        storage: FrameStorage,
        previous: CallerLink,
    ) -> ActivationRecord {
        let code = func.code.clone();
        let stacktop = code.nlocalsplus() as u32;
        ActivationRecord {
            globals: func.globals.clone(),
            builtins: func.builtins.clone(),
            func,
            locals,
            handle: None,
            previous,
            lasti: -1,
            stacktop,
            state: FrameState::Created,
            code,
            storage,
        }
    }

    pub fn code(&self) -> &Arc<CodeObject> {
        &self.code
    }

    pub fn function(&self) -> &Arc<FunctionObject> {
        &self.func
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// The optional locals mapping object, for debugger-style inspection.
    pub fn locals(&self) -> Option<&Value> {
        self.locals.as_ref()
    }

    pub fn lasti(&self) -> i32 {
        self.lasti
    }

    pub fn stacktop(&self) -> u32 {
        self.stacktop
    }

    /// Operand-stack depth above the locals-plus region.
    pub fn operand_depth(&self) -> u32 {
        self.stacktop - self.code.nlocalsplus() as u32
    }

    pub(crate) fn set_state(&mut self, next: FrameState) {
        debug_assert!(
            self.state.may_become(next),
            "illegal frame transition {:?} -> {:?} in {}",
            self.state,
            next,
            self.code.name,
        );
        trace!(
            target: "quill::vm::frames",
            code = %self.code.name,
            from = ?self.state,
            to = ?next,
            "frame transition"
        );
        self.state = next;
    }

    pub(crate) fn set_stacktop(&mut self, top: u32) {
        debug_assert!(top as usize >= self.code.nlocalsplus());
        debug_assert!(top as usize <= self.code.frame_size());
        self.stacktop = top;
    }

    pub(crate) fn slots<'a>(&'a self, arena: &'a FrameArena) -> &'a [Slot] {
        match &self.storage {
            FrameStorage::Arena(range) => arena.slots(*range),
            FrameStorage::Owned(slots) => slots,
        }
    }

    pub(crate) fn slots_mut<'a>(&'a mut self, arena: &'a mut FrameArena) -> &'a mut [Slot] {
        match &mut self.storage {
            FrameStorage::Arena(range) => arena.slots_mut(*range),
            FrameStorage::Owned(slots) => slots,
        }
    }

    pub(crate) fn push_value(&mut self, arena: &mut FrameArena, value: Value) -> Result<()> {
        let top = self.stacktop as usize;
        let slots = self.slots_mut(arena);
        if top >= slots.len() {
            bail!("operand stack overflow in {}", self.code.name);
        }
        slots[top] = Some(value);
        self.stacktop = top as u32 + 1;
        Ok(())
    }

    pub(crate) fn pop_value(&mut self, arena: &mut FrameArena) -> Result<Value> {
        let top = self.stacktop as usize;
        if top <= self.code.nlocalsplus() {
            bail!("operand stack underflow in {}", self.code.name);
        }
        let slot = self.slots_mut(arena)[top - 1].take();
        self.stacktop = top as u32 - 1;
        slot.ok_or_else(|| anyhow!("empty operand slot in {}", self.code.name))
    }

    pub(crate) fn peek_value(&self, arena: &FrameArena, from_top: usize) -> Result<Value> {
        let top = self.stacktop as usize;
        let index = top
            .checked_sub(1 + from_top)
            .filter(|&i| i >= self.code.nlocalsplus())
            .ok_or_else(|| anyhow!("operand stack underflow in {}", self.code.name))?;
        self.slots(arena)[index]
            .clone()
            .ok_or_else(|| anyhow!("empty operand slot in {}", self.code.name))
    }

    /// Bind arguments and materialize cells into the locals-plus region.
    pub(crate) fn initialize_slots(&mut self, arena: &mut FrameArena, args: &[Value]) -> Result<()> {
        let code = self.code.clone();
        if args.len() != code.argcount as usize {
            bail!(
                "{} expects {} arguments, got {}",
                code.name,
                code.argcount,
                args.len()
            );
        }
        let closure = self.func.closure.clone();
        let slots = self.slots_mut(arena);
        debug_assert!(slots.len() >= code.nlocalsplus());
        for (slot, arg) in slots.iter_mut().zip(args) {
            *slot = Some(arg.clone());
        }
        let mut free_index = 0;
        for (k, &kind) in code.localsplus_kinds.iter().enumerate() {
            if kind & CO_FAST_CELL != 0 {
                // An argument landing in a cell slot gets boxed in place.
                let seeded = slots[k].take();
                slots[k] = Some(Value::Cell(CellObject::new(seeded)));
            } else if kind & CO_FAST_FREE != 0 {
                let cell = closure.get(free_index).cloned().ok_or_else(|| {
                    anyhow!("{} is missing closure cell {free_index}", code.name)
                })?;
                slots[k] = Some(Value::Cell(cell));
                free_index += 1;
            }
        }
        Ok(())
    }
}
