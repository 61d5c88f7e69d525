//! The virtual machine: a call stack of activation records backed by the
//! slot arena, plus the heap budget that promotion and quickening draw on.

mod frame;
mod handle;
mod run;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::{trace, warn};

pub use frame::{ActivationRecord, CallerLink, FrameState, FrameStorage};
pub use handle::{FrameHandle, FrameObject};
pub use run::GenExit;

use crate::val::{FunctionObject, GeneratorObject, Value};
use crate::vm::arena::{FrameArena, MemoryBudget};
use crate::vm::code::CodeObject;
use crate::vm::error::JumpRejection;
use crate::vm::quicken::quicken_with_budget;
use crate::vm::specialize::SpecializationStats;
use crate::vm::stackshape::{RetargetPlan, validate_retarget};

pub struct Vm {
    pub(crate) arena: FrameArena,
    pub(crate) call_stack: Vec<ActivationRecord>,
    pub(crate) budget: MemoryBudget,
    pub(crate) stats: SpecializationStats,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm {
            arena: FrameArena::new(),
            call_stack: Vec::new(),
            budget: MemoryBudget::unlimited(),
            stats: SpecializationStats::default(),
        }
    }

    /// A VM with a bounded slot arena and heap budget.
    pub fn with_limits(arena_slots: usize, heap_bytes: u64) -> Vm {
        Vm {
            arena: FrameArena::with_limit(arena_slots),
            call_stack: Vec::new(),
            budget: MemoryBudget::with_limit(heap_bytes),
            stats: SpecializationStats::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn stats(&self) -> &SpecializationStats {
        &self.stats
    }

    pub fn arena_in_use(&self) -> usize {
        self.arena.in_use()
    }

    pub fn heap_used(&self) -> u64 {
        self.budget.used()
    }

    pub fn current_frame(&self) -> Option<&ActivationRecord> {
        self.call_stack.last()
    }

    /// Push a new frame for `func`, acquiring its slot range from the arena
    /// and binding `args`.
    pub fn push_frame(
        &mut self,
        func: &Arc<FunctionObject>,
        locals: Option<Value>,
        args: &[Value],
    ) -> Result<usize> {
        let size = func.code.frame_size();
        let range = self.arena.push(size)?;
        let previous = match self.call_stack.len() {
            0 => CallerLink::None,
            n => CallerLink::Stack(n - 1),
        };
        let mut record =
            ActivationRecord::new(func.clone(), locals, FrameStorage::Arena(range), previous);
        if let Err(err) = record.initialize_slots(&mut self.arena, args) {
            self.arena.pop(range);
            return Err(err);
        }
        let depth = self.call_stack.len();
        self.call_stack.push(record);
        trace!(
            target: "quill::vm::frames",
            code = %func.code.name,
            depth,
            slots = size,
            "frame pushed"
        );
        Ok(depth)
    }

    /// Pop the top frame and run the teardown ownership decision.
    pub fn pop_frame(&mut self) -> Result<()> {
        let record = self
            .call_stack
            .pop()
            .ok_or_else(|| anyhow!("pop on an empty call stack"))?;
        self.clear_frame(record)
    }

    pub fn push_operand(&mut self, depth: usize, value: Value) -> Result<()> {
        self.call_stack[depth].push_value(&mut self.arena, value)
    }

    pub fn pop_operand(&mut self, depth: usize) -> Result<Value> {
        self.call_stack[depth].pop_value(&mut self.arena)
    }

    pub fn peek_operand(&self, depth: usize, from_top: usize) -> Result<Value> {
        self.call_stack[depth].peek_value(&self.arena, from_top)
    }

    /// Move the frame at `depth` so its next instruction is `target`,
    /// popping whatever the shape analysis says the jump discards.
    pub fn retarget_frame(
        &mut self,
        depth: usize,
        target: usize,
    ) -> Result<RetargetPlan, JumpRejection> {
        let record = &self.call_stack[depth];
        if record.state() != FrameState::Executing {
            return Err(JumpRejection::BadFrameState(record.state()));
        }
        let plan = validate_retarget(&record.code, record.lasti(), target, false)?;
        for _ in 0..plan.pops {
            let popped = self.call_stack[depth].pop_value(&mut self.arena);
            debug_assert!(popped.is_ok(), "shape analysis admitted an impossible pop");
        }
        self.call_stack[depth].lasti = target as i32 - 1;
        Ok(plan)
    }

    /// Retarget a suspended generator. The extra pop for the value its
    /// yield consumed is accounted for by the validation.
    pub fn retarget_suspended(
        &mut self,
        generator: &Arc<GeneratorObject>,
        target: usize,
    ) -> Result<RetargetPlan, JumpRejection> {
        let mut slot = generator.record.borrow_mut();
        let record = slot
            .as_mut()
            .ok_or(JumpRejection::BadFrameState(FrameState::Executing))?;
        if record.state() != FrameState::Suspended {
            return Err(JumpRejection::BadFrameState(record.state()));
        }
        let plan = validate_retarget(&record.code, record.lasti(), target, true)?;
        for _ in 0..plan.pops {
            let popped = record.pop_value(&mut self.arena);
            debug_assert!(popped.is_ok(), "shape analysis admitted an impossible pop");
        }
        record.lasti = target as i32 - 1;
        Ok(plan)
    }

    /// Count a call toward warmup and quicken once the threshold is
    /// crossed, charging the cache block to the heap budget. Quickening is
    /// best-effort: a failed charge leaves the code exempt and the call
    /// proceeds on the original stream.
    pub fn quicken_if_due(&mut self, code: &Arc<CodeObject>) {
        if code.quickened().is_some() {
            return;
        }
        code.increment_warmup();
        if code.is_warmed_up()
            && let Err(err) = quicken_with_budget(code, Some(&self.budget))
        {
            warn!(target: "quill::vm::quicken", code = %code.name, "quickening skipped: {err}");
        }
    }
}
