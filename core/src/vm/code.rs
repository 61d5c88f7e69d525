use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use once_cell::unsync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cache::QuickenedCode;
use super::opcode::Opcode;
use crate::val::Const;

/// One 16-bit instruction word: opcode byte, operand byte.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit(u16);

impl CodeUnit {
    pub fn new(op: Opcode, oparg: u8) -> CodeUnit {
        CodeUnit(((op as u16) << 8) | oparg as u16)
    }

    pub fn opcode(self) -> Opcode {
        let byte = (self.0 >> 8) as u8;
        debug_assert!(Opcode::from_u8(byte).is_some(), "corrupt opcode byte {byte}");
        Opcode::from_u8(byte).unwrap_or(Opcode::Nop)
    }

    pub fn oparg(self) -> u8 {
        self.0 as u8
    }

    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.opcode(), self.oparg())
    }
}

// Locals-plus slot kinds, combinable.
pub const CO_FAST_LOCAL: u8 = 0x20;
pub const CO_FAST_CELL: u8 = 0x40;
pub const CO_FAST_FREE: u8 = 0x80;

// Code flags.
pub const CO_GENERATOR: u32 = 0x0020;

/// Calls before a code object is quickened.
pub const QUICKENING_WARMUP_DELAY: i32 = 8;
pub const QUICKENING_INITIAL_WARMUP_VALUE: i32 = -QUICKENING_WARMUP_DELAY;
/// A warmup value the per-call increment can never drive to zero.
pub const QUICKENING_WARMUP_COLDEST: i32 = 1;
/// Instruction-count ceiling above which code is never quickened.
pub const MAX_SIZE_TO_QUICKEN: usize = 5000;

fn initial_warmup() -> Cell<i32> {
    Cell::new(QUICKENING_INITIAL_WARMUP_VALUE)
}

/// An immutable compiled function body plus its mutable execution-side
/// counters. The instruction stream in `code` is never rewritten; quickening
/// produces a separate stream inside [`QuickenedCode`].
#[derive(Debug, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: Arc<str>,
    pub code: Vec<CodeUnit>,
    pub consts: Vec<Const>,
    pub names: Vec<Arc<str>>,
    pub localsplus_names: Vec<Arc<str>>,
    pub localsplus_kinds: Vec<u8>,
    pub argcount: u32,
    pub stacksize: u32,
    pub flags: u32,
    #[serde(skip, default = "initial_warmup")]
    warmup: Cell<i32>,
    #[serde(skip)]
    quickened: OnceCell<QuickenedCode>,
}

impl CodeObject {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        code: Vec<CodeUnit>,
        consts: Vec<Const>,
        names: Vec<Arc<str>>,
        localsplus_names: Vec<Arc<str>>,
        localsplus_kinds: Vec<u8>,
        argcount: u32,
        stacksize: u32,
        flags: u32,
    ) -> CodeObject {
        debug_assert_eq!(localsplus_names.len(), localsplus_kinds.len());
        CodeObject {
            name: Arc::from(name),
            code,
            consts,
            names,
            localsplus_names,
            localsplus_kinds,
            argcount,
            stacksize,
            flags,
            warmup: initial_warmup(),
            quickened: OnceCell::new(),
        }
    }

    pub fn nlocalsplus(&self) -> usize {
        self.localsplus_names.len()
    }

    /// Slots a frame for this code needs: locals-plus then operand stack.
    pub fn frame_size(&self) -> usize {
        self.nlocalsplus() + self.stacksize as usize
    }

    pub fn instruction_count(&self) -> usize {
        self.code.len()
    }

    pub fn is_generator(&self) -> bool {
        self.flags & CO_GENERATOR != 0
    }

    pub fn increment_warmup(&self) {
        self.warmup.set(self.warmup.get() + 1);
    }

    pub fn is_warmed_up(&self) -> bool {
        self.warmup.get() == 0
    }

    /// Park the warmup counter where the per-call increment never reaches
    /// the quicken threshold again.
    pub fn exempt_from_quickening(&self) {
        self.warmup.set(QUICKENING_WARMUP_COLDEST);
    }

    pub(crate) fn warmup_value(&self) -> i32 {
        self.warmup.get()
    }

    /// True once the code object is permanently excluded from quickening.
    pub fn is_quicken_exempt(&self) -> bool {
        self.warmup.get() > 0
    }

    pub fn quickened(&self) -> Option<&QuickenedCode> {
        self.quickened.get()
    }

    /// Claim-once install. Returns false when another build got there
    /// first; the redundant block is simply dropped.
    pub(crate) fn install_quickened(&self, block: QuickenedCode) -> bool {
        let installed = self.quickened.set(block).is_ok();
        if !installed {
            debug!(target: "quill::vm::quicken", code = %self.name, "redundant quickened block discarded");
        }
        installed
    }

    /// The instruction word executed at index `i`: quickened stream when
    /// present, otherwise the original.
    pub fn unit(&self, i: usize) -> CodeUnit {
        match self.quickened.get() {
            Some(q) => q.instruction(i),
            None => self.code[i],
        }
    }
}
