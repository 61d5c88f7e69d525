//! Quickened code cache layout.
//!
//! One contiguous allocation of 8-byte records per quickened code object.
//! Cache records grow downward from record 0 (which always stores the cache
//! record count), instruction words pack upward from index `cache_count`.
//! Knowing the count recovers the instruction base, so the block needs no
//! side table.

use std::cell::Cell;

use super::code::CodeUnit;

/// Instruction words per 8-byte `Code` record. The safe discriminant byte
/// occupies the slot an untyped layout would give to a fourth word.
pub const INSTRUCTIONS_PER_ENTRY: usize = 3;

/// One cache record. Every variant is exactly 8 bytes so records are
/// binary-interchangeable and offset arithmetic never depends on the kind
/// occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntry {
    /// Record 0: the self-describing cache-record count.
    Zero { cache_count: u32 },
    /// Generic adaptive record. `index` stores the resolved slot once a
    /// specialized form is installed.
    Adaptive {
        original_oparg: u8,
        counter: u8,
        index: u16,
    },
    /// Instance attribute guard.
    Attr { shape_version: u32 },
    /// Namespace key-space guards for global loads.
    Global {
        globals_version: u32,
        builtins_version: u16,
    },
    /// Callable identity guard.
    Call { callee_version: u32, arity: u16 },
    /// Packed instruction words, the upward-indexed half of the dual array.
    Code { units: [CodeUnit; 3] },
}

const _: () = assert!(std::mem::size_of::<CacheEntry>() == 8);
const _: () = assert!(std::mem::size_of::<Cell<CacheEntry>>() == 8);

/// Cache offset addressed by an instruction at index `nexti - 1` carrying
/// operand `oparg`.
pub fn offset_from_oparg_and_nexti(oparg: i32, nexti: i32) -> i32 {
    (nexti >> 1) + oparg
}

/// Inverse of [`offset_from_oparg_and_nexti`].
pub fn oparg_from_offset_and_nexti(offset: i32, nexti: i32) -> i32 {
    offset - (nexti >> 1)
}

/// The quickened block. Interior mutability is `Cell`: records are mutated
/// only under the owning interpreter's exclusion, never concurrently.
#[derive(Debug)]
pub struct QuickenedCode {
    data: Box<[Cell<CacheEntry>]>,
}

impl QuickenedCode {
    /// Allocate a block for `cache_count` cache records (count header
    /// included) and `instruction_count` instruction words. Never resized.
    pub(crate) fn allocate(cache_count: usize, instruction_count: usize) -> QuickenedCode {
        debug_assert!(cache_count >= 1);
        let code_records = instruction_count.div_ceil(INSTRUCTIONS_PER_ENTRY);
        let mut data = Vec::with_capacity(cache_count + code_records);
        data.push(Cell::new(CacheEntry::Zero {
            cache_count: cache_count as u32,
        }));
        for _ in 1..cache_count {
            data.push(Cell::new(CacheEntry::Adaptive {
                original_oparg: 0,
                counter: 0,
                index: 0,
            }));
        }
        for _ in 0..code_records {
            data.push(Cell::new(CacheEntry::Code {
                units: [CodeUnit::new(super::opcode::Opcode::Nop, 0); 3],
            }));
        }
        QuickenedCode {
            data: data.into_boxed_slice(),
        }
    }

    /// Total records in the block.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cache-record count recovered from record 0.
    pub fn cache_count(&self) -> usize {
        match self.data[0].get() {
            CacheEntry::Zero { cache_count } => cache_count as usize,
            _ => unreachable!("record 0 always stores the cache count"),
        }
    }

    /// Base index of the instruction half of the dual array.
    pub fn instruction_base(&self) -> usize {
        self.cache_count()
    }

    /// Cache record `n`, counting downward from the instruction base.
    pub fn entry(&self, n: usize) -> CacheEntry {
        self.data[self.cache_count() - 1 - n].get()
    }

    pub fn set_entry(&self, n: usize, entry: CacheEntry) {
        debug_assert!(!matches!(entry, CacheEntry::Code { .. }));
        self.data[self.cache_count() - 1 - n].set(entry);
    }

    /// The cache record addressed by the instruction at `nexti - 1` with
    /// operand `oparg`.
    pub fn entry_for_instruction(&self, nexti: usize, oparg: u8) -> CacheEntry {
        self.entry(offset_from_oparg_and_nexti(oparg as i32, nexti as i32) as usize)
    }

    pub fn instruction(&self, i: usize) -> CodeUnit {
        let record = self.cache_count() + i / INSTRUCTIONS_PER_ENTRY;
        match self.data[record].get() {
            CacheEntry::Code { units } => units[i % INSTRUCTIONS_PER_ENTRY],
            _ => unreachable!("instruction half of the block holds only code records"),
        }
    }

    pub(crate) fn set_instruction(&self, i: usize, unit: CodeUnit) {
        let record = self.cache_count() + i / INSTRUCTIONS_PER_ENTRY;
        let CacheEntry::Code { mut units } = self.data[record].get() else {
            unreachable!("instruction half of the block holds only code records");
        };
        units[i % INSTRUCTIONS_PER_ENTRY] = unit;
        self.data[record].set(CacheEntry::Code { units });
    }

    pub(crate) fn copy_instructions(&self, code: &[CodeUnit]) {
        for (i, unit) in code.iter().enumerate() {
            self.set_instruction(i, *unit);
        }
    }
}
