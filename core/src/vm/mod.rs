//! Execution engine: frame arena, activation records, quickened code
//! caches, adaptive specialization and jump-retarget validation.

mod arena;
mod cache;
mod code;
mod context;
mod error;
mod opcode;
mod quicken;
mod specialize;
mod stackshape;
#[allow(clippy::module_inception)]
mod vm;

#[cfg(test)]
mod vm_test;

pub use arena::{FrameArena, MemoryBudget, Slot, SlotRange};
pub use cache::{
    CacheEntry, INSTRUCTIONS_PER_ENTRY, QuickenedCode, offset_from_oparg_and_nexti,
    oparg_from_offset_and_nexti,
};
pub use code::{
    CO_FAST_CELL, CO_FAST_FREE, CO_FAST_LOCAL, CO_GENERATOR, CodeObject, CodeUnit,
    MAX_SIZE_TO_QUICKEN, QUICKENING_INITIAL_WARMUP_VALUE, QUICKENING_WARMUP_COLDEST,
    QUICKENING_WARMUP_DELAY,
};
pub use context::{Namespace, VmContext};
pub use error::{AllocError, AllocErrorKind, JumpRejection};
pub use opcode::Opcode;
pub use quicken::{quicken, quicken_with_budget};
pub use specialize::{ADAPTIVE_CACHE_BACKOFF, SpecializationStats};
pub use stackshape::{EntryKind, RetargetPlan, StackModel, mark_stacks, validate_retarget};
pub use vm::{
    ActivationRecord, CallerLink, FrameHandle, FrameObject, FrameState, FrameStorage, GenExit, Vm,
};
