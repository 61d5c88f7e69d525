//! Symbolic operand-stack shapes for jump retargeting.
//!
//! A fixed-point pass over the jump-implied control-flow graph computes, for
//! every instruction index, the operand stack's depth and per-entry kind.
//! Shapes pack into an `i64`, two bits per entry, low bits holding the top;
//! the model runs on the original instruction stream, never the quickened
//! one.

use super::code::CodeObject;
use super::error::JumpRejection;
use super::opcode::Opcode;

const BITS_PER_ENTRY: i64 = 2;
const MAX_STACK_ENTRIES: i64 = 63 / BITS_PER_ENTRY;
const WILL_OVERFLOW: i64 = 1 << ((MAX_STACK_ENTRIES - 1) * BITS_PER_ENTRY);

const UNINITIALIZED: i64 = -2;
const OVERFLOWED: i64 = -1;
const EMPTY: i64 = 0;

/// Kind of one modeled stack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Iterator,
    Except,
    Object,
}

impl EntryKind {
    fn bits(self) -> i64 {
        match self {
            EntryKind::Iterator => 1,
            EntryKind::Except => 2,
            EntryKind::Object => 3,
        }
    }

    fn from_bits(bits: i64) -> Option<EntryKind> {
        match bits {
            1 => Some(EntryKind::Iterator),
            2 => Some(EntryKind::Except),
            3 => Some(EntryKind::Object),
            _ => None,
        }
    }
}

fn push_entry(stack: i64, kind: EntryKind) -> i64 {
    if !(0..WILL_OVERFLOW).contains(&stack) {
        OVERFLOWED
    } else {
        (stack << BITS_PER_ENTRY) | kind.bits()
    }
}

fn pop_entry(stack: i64) -> i64 {
    // Arithmetic shift keeps OVERFLOWED sticky.
    stack >> BITS_PER_ENTRY
}

fn top_bits(stack: i64) -> i64 {
    stack & ((1 << BITS_PER_ENTRY) - 1)
}

/// The modeled stack at one instruction index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackModel(i64);

impl StackModel {
    /// Depth when the model reached this point without overflowing.
    pub fn depth(self) -> Option<u32> {
        if self.0 < 0 {
            return None;
        }
        let mut s = self.0;
        let mut depth = 0;
        while s != EMPTY {
            s = pop_entry(s);
            depth += 1;
        }
        Some(depth)
    }

    pub fn top_kind(self) -> Option<EntryKind> {
        if self.0 <= 0 {
            return None;
        }
        EntryKind::from_bits(top_bits(self.0))
    }

    pub fn is_reachable(self) -> bool {
        self.0 != UNINITIALIZED
    }

    pub fn is_overflowed(self) -> bool {
        self.0 == OVERFLOWED
    }
}

/// Operand values with `ExtendedArg` prefixes folded in.
fn resolved_args(code: &[super::code::CodeUnit]) -> Vec<u32> {
    let mut args = vec![0u32; code.len()];
    let mut ext: u32 = 0;
    for (i, unit) in code.iter().enumerate() {
        if unit.opcode() == Opcode::ExtendedArg {
            ext = (ext << 8) | unit.oparg() as u32;
        } else {
            args[i] = (ext << 8) | unit.oparg() as u32;
            ext = 0;
        }
    }
    args
}

fn generic_effect(opcode: Opcode, arg: u32) -> (u32, u32) {
    match opcode {
        Opcode::Nop | Opcode::ExtendedArg => (0, 0),
        Opcode::PopTop => (1, 0),
        Opcode::LoadConst | Opcode::LoadFast | Opcode::LoadDeref | Opcode::LoadGlobal => (0, 1),
        Opcode::StoreFast | Opcode::StoreDeref | Opcode::StoreGlobal => (1, 0),
        Opcode::LoadAttr => (1, 1),
        Opcode::StoreAttr => (2, 0),
        Opcode::BinarySubscr | Opcode::BinaryAdd | Opcode::CompareLt => (2, 1),
        Opcode::Call => (arg + 1, 1),
        other => unreachable!("{other:?} has bespoke stack modeling"),
    }
}

fn stacks_for(code: &CodeObject) -> Vec<i64> {
    let units = &code.code;
    let len = units.len();
    let args = resolved_args(units);
    let mut stacks = vec![UNINITIALIZED; len + 1];
    if len == 0 {
        return stacks;
    }
    stacks[0] = EMPTY;
    let mut todo = true;
    while todo {
        todo = false;
        for i in 0..len {
            let cur = stacks[i];
            if cur == UNINITIALIZED {
                continue;
            }
            let opcode = units[i].opcode().generic_form();
            let arg = args[i];
            match opcode {
                Opcode::Jump => {
                    let j = arg as usize;
                    if j <= len {
                        if stacks[j] == UNINITIALIZED && j < i {
                            todo = true;
                        }
                        debug_assert!(stacks[j] == UNINITIALIZED || stacks[j] == cur);
                        stacks[j] = cur;
                    }
                }
                Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                    let next = pop_entry(cur);
                    let j = arg as usize;
                    if j <= len {
                        if stacks[j] == UNINITIALIZED && j < i {
                            todo = true;
                        }
                        debug_assert!(stacks[j] == UNINITIALIZED || stacks[j] == next);
                        stacks[j] = next;
                    }
                    stacks[i + 1] = next;
                }
                Opcode::GetIter => {
                    stacks[i + 1] = push_entry(pop_entry(cur), EntryKind::Iterator);
                }
                Opcode::ForIter => {
                    // Loop body keeps the iterator and gains the element;
                    // the exhaust edge pops the iterator.
                    let j = i + 1 + arg as usize;
                    if j <= len {
                        debug_assert!(stacks[j] == UNINITIALIZED || stacks[j] == pop_entry(cur));
                        stacks[j] = pop_entry(cur);
                    }
                    stacks[i + 1] = push_entry(cur, EntryKind::Object);
                }
                Opcode::PushExcInfo => {
                    let mut next = cur;
                    for _ in 0..3 {
                        next = push_entry(next, EntryKind::Except);
                    }
                    stacks[i + 1] = next;
                }
                Opcode::PopExcept => {
                    let mut next = cur;
                    for _ in 0..3 {
                        next = pop_entry(next);
                    }
                    stacks[i + 1] = next;
                }
                Opcode::ReturnValue => {
                    // End of block; no fallthrough.
                }
                Opcode::YieldValue => {
                    // The yielded value leaves, the sent value arrives.
                    stacks[i + 1] = push_entry(pop_entry(cur), EntryKind::Object);
                }
                other => {
                    let (pops, pushes) = generic_effect(other, arg);
                    let mut next = cur;
                    for _ in 0..pops {
                        next = pop_entry(next);
                    }
                    for _ in 0..pushes {
                        next = push_entry(next, EntryKind::Object);
                    }
                    stacks[i + 1] = next;
                }
            }
        }
    }
    stacks
}

/// Per-instruction stack shapes (one extra entry for the end of the stream).
pub fn mark_stacks(code: &CodeObject) -> Vec<StackModel> {
    stacks_for(code).into_iter().map(StackModel).collect()
}

fn compatible_kind(from: i64, to: i64) -> bool {
    if to == 0 {
        return false;
    }
    if to == EntryKind::Object.bits() {
        return true;
    }
    from == to
}

fn compatible_stack(mut from: i64, mut to: i64) -> bool {
    if from < 0 || to < 0 {
        return false;
    }
    while from > to {
        from = pop_entry(from);
    }
    while from != EMPTY {
        if !compatible_kind(top_bits(from), top_bits(to)) {
            return false;
        }
        from = pop_entry(from);
        to = pop_entry(to);
    }
    to == EMPTY
}

fn rejection_for(start: i64, target: i64) -> JumpRejection {
    if start == OVERFLOWED {
        return JumpRejection::SourceTooDeep;
    }
    if start == UNINITIALIZED {
        return JumpRejection::SourceUnreachable;
    }
    match target {
        OVERFLOWED => JumpRejection::StackTooDeep,
        UNINITIALIZED => JumpRejection::IntoHandlerOrUnreachable,
        t => match EntryKind::from_bits(top_bits(t)) {
            Some(EntryKind::Except) => JumpRejection::IntoExceptBlock,
            Some(EntryKind::Iterator) => JumpRejection::IntoLoopBody,
            _ => JumpRejection::DepthMismatch,
        },
    }
}

/// How to retarget a frame: where to resume and how many operand-stack
/// entries to pop (and release) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetargetPlan {
    pub target: usize,
    pub pops: u32,
}

/// Decide whether a frame whose last executed instruction is `from_lasti`
/// may resume at `target`. `suspended` accounts for the value a suspended
/// frame's yield already popped.
pub fn validate_retarget(
    code: &CodeObject,
    from_lasti: i32,
    target: usize,
    suspended: bool,
) -> Result<RetargetPlan, JumpRejection> {
    if target >= code.instruction_count() {
        return Err(JumpRejection::TargetOutOfRange);
    }
    debug_assert!(from_lasti >= 0, "retarget of a frame that never ran");
    let from = from_lasti.max(0) as usize;
    let stacks = stacks_for(code);
    let start = stacks[from];
    let dest = stacks[target];
    if !compatible_stack(start, dest) {
        return Err(rejection_for(start, dest));
    }
    let mut s = if suspended { pop_entry(start) } else { start };
    let mut pops = 0u32;
    while s > dest {
        s = pop_entry(s);
        pops += 1;
    }
    Ok(RetargetPlan { target, pops })
}
