//! Chunked bump-pointer arena for frame slot storage.
//!
//! Frames acquire a contiguous run of slots on call and release it on
//! return, strictly LIFO. Chunks never move or shrink while any frame is
//! live, so a [`SlotRange`] stays valid for the lifetime of its frame.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use super::error::{AllocError, AllocErrorKind};
use crate::val::Value;

/// One frame slot. `None` models an empty (unbound) slot.
pub type Slot = Option<Value>;

const DEFAULT_CHUNK_SLOTS: usize = 1024;

/// A frame's run of slots: chunk index, base offset, length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    chunk: u32,
    base: u32,
    len: u32,
}

impl SlotRange {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Chunk {
    slots: Vec<Slot>,
    top: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Chunk {
        Chunk {
            slots: vec![None; capacity],
            top: 0,
        }
    }

    fn free(&self) -> usize {
        self.slots.len() - self.top
    }
}

pub struct FrameArena {
    chunks: Vec<Chunk>,
    current: usize,
    limit: usize,
    in_use: usize,
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameArena {
    pub fn new() -> FrameArena {
        Self::with_limit(usize::MAX)
    }

    /// An arena that refuses to hold more than `limit` slots at once.
    pub fn with_limit(limit: usize) -> FrameArena {
        FrameArena {
            chunks: Vec::new(),
            current: 0,
            limit,
            in_use: 0,
        }
    }

    /// Acquire `size` zeroed slots. Amortized O(1): a chunk boundary costs
    /// one allocation, after which chunks are reused across call waves.
    pub fn push(&mut self, size: usize) -> Result<SlotRange, AllocError> {
        if size > self.limit - self.in_use.min(self.limit) {
            return Err(AllocError {
                kind: AllocErrorKind::ArenaExhausted,
                requested: size,
                limit: self.limit,
            });
        }
        if self.chunks.is_empty() {
            self.chunks.push(Chunk::new(DEFAULT_CHUNK_SLOTS.max(size)));
            trace!(target: "quill::vm::arena", slots = DEFAULT_CHUNK_SLOTS.max(size), "arena chunk allocated");
        } else if self.chunks[self.current].free() < size {
            // Advance to the next chunk, reusing a retired one if large enough.
            let next = self.current + 1;
            if next >= self.chunks.len() || self.chunks[next].slots.len() < size {
                let cap = DEFAULT_CHUNK_SLOTS.max(size);
                self.chunks.insert(next, Chunk::new(cap));
                trace!(target: "quill::vm::arena", slots = cap, "arena chunk allocated");
            }
            debug_assert_eq!(self.chunks[next].top, 0);
            self.current = next;
        }
        let chunk = &mut self.chunks[self.current];
        let base = chunk.top;
        for slot in &mut chunk.slots[base..base + size] {
            *slot = None;
        }
        chunk.top = base + size;
        self.in_use += size;
        Ok(SlotRange {
            chunk: self.current as u32,
            base: base as u32,
            len: size as u32,
        })
    }

    /// Release a range acquired by [`push`](Self::push). Ranges must be
    /// released in reverse acquisition order; a violation is fatal in debug
    /// builds.
    pub fn pop(&mut self, range: SlotRange) {
        let chunk_idx = range.chunk as usize;
        let base = range.base as usize;
        let len = range.len as usize;
        debug_assert_eq!(chunk_idx, self.current, "arena pop out of order");
        let chunk = &mut self.chunks[chunk_idx];
        debug_assert_eq!(chunk.top, base + len, "arena pop out of order");
        for slot in &mut chunk.slots[base..base + len] {
            *slot = None;
        }
        chunk.top = base;
        self.in_use -= len;
        while self.current > 0 && self.chunks[self.current].top == 0 {
            self.current -= 1;
        }
    }

    pub fn slots(&self, range: SlotRange) -> &[Slot] {
        let chunk = &self.chunks[range.chunk as usize];
        &chunk.slots[range.base as usize..(range.base + range.len) as usize]
    }

    pub fn slots_mut(&mut self, range: SlotRange) -> &mut [Slot] {
        let chunk = &mut self.chunks[range.chunk as usize];
        &mut chunk.slots[range.base as usize..(range.base + range.len) as usize]
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Current bump position, for LIFO accounting in tests.
    pub fn position(&self) -> (usize, usize) {
        (
            self.current,
            self.chunks.get(self.current).map_or(0, |c| c.top),
        )
    }
}

/// Byte budget for heap copies made outside the arena (frame promotion,
/// generator frames). Accumulates monotonically; the default is unlimited.
#[derive(Debug)]
pub struct MemoryBudget {
    used: AtomicU64,
    limit: u64,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl MemoryBudget {
    pub fn unlimited() -> MemoryBudget {
        Self::with_limit(u64::MAX)
    }

    pub fn with_limit(limit: u64) -> MemoryBudget {
        MemoryBudget {
            used: AtomicU64::new(0),
            limit,
        }
    }

    pub fn charge(&self, bytes: u64) -> Result<(), AllocError> {
        let used = self.used.load(Ordering::Relaxed);
        if bytes > self.limit - used.min(self.limit) {
            return Err(AllocError {
                kind: AllocErrorKind::HeapBudgetExhausted,
                requested: bytes as usize,
                limit: self.limit as usize,
            });
        }
        self.used.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}
