use std::error::Error;
use std::fmt;

use super::vm::FrameState;

/// Reportable allocation failure. The process allocator aborts on real OOM,
/// so exhaustion is surfaced through explicit budgets instead: the arena's
/// slot limit and the heap byte budget charged by promotion copies and
/// generator frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    pub kind: AllocErrorKind,
    pub requested: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocErrorKind {
    ArenaExhausted,
    HeapBudgetExhausted,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AllocErrorKind::ArenaExhausted => write!(
                f,
                "frame arena exhausted: {} slots requested, limit {}",
                self.requested, self.limit
            ),
            AllocErrorKind::HeapBudgetExhausted => write!(
                f,
                "heap budget exhausted: {} bytes requested, limit {}",
                self.requested, self.limit
            ),
        }
    }
}

impl Error for AllocError {}

/// Why a requested jump retarget was refused. Each reason is distinct so
/// callers (debugger front ends) can present the right message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpRejection {
    /// The symbolic stack at the source overflowed the model.
    SourceTooDeep,
    /// The source sits inside an exception handler the model never reached.
    SourceUnreachable,
    /// The symbolic stack at the target overflowed the model.
    StackTooDeep,
    /// Target is inside an exception handler, or the model never reached it.
    IntoHandlerOrUnreachable,
    /// Target expects a pushed exception triple the source cannot provide.
    IntoExceptBlock,
    /// Target expects a live iterator the source cannot provide.
    IntoLoopBody,
    /// Same kinds, different depth.
    DepthMismatch,
    /// Target index is past the end of the instruction stream.
    TargetOutOfRange,
    /// Only executing or suspended frames may be retargeted.
    BadFrameState(FrameState),
}

impl fmt::Display for JumpRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JumpRejection::SourceTooDeep | JumpRejection::StackTooDeep => {
                write!(f, "stack is too deep to analyze")
            }
            JumpRejection::SourceUnreachable => {
                write!(f, "can't jump from within an exception handler")
            }
            JumpRejection::IntoHandlerOrUnreachable => write!(
                f,
                "can't jump into an exception handler, or code may be unreachable"
            ),
            JumpRejection::IntoExceptBlock => write!(
                f,
                "can't jump into an 'except' block as there's no exception"
            ),
            JumpRejection::IntoLoopBody => {
                write!(f, "can't jump into the body of a for loop")
            }
            JumpRejection::DepthMismatch => write!(f, "differing stack depth"),
            JumpRejection::TargetOutOfRange => write!(f, "jump target out of range"),
            JumpRejection::BadFrameState(state) => {
                write!(f, "can't retarget a frame in state {state:?}")
            }
        }
    }
}

impl Error for JumpRejection {}
