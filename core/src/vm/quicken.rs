//! Quickening: build the dual-array cache block for a warmed-up code object
//! and rewrite specializable instructions to their adaptive forms.

use tracing::debug;

use super::arena::MemoryBudget;
use super::cache::{
    CacheEntry, INSTRUCTIONS_PER_ENTRY, QuickenedCode, offset_from_oparg_and_nexti,
    oparg_from_offset_and_nexti,
};
use super::code::{CodeObject, CodeUnit, MAX_SIZE_TO_QUICKEN};
use super::error::AllocError;
use super::opcode::Opcode;
use super::specialize::{adaptive_form, cache_requirement};

/// Operand an adaptive instruction at `index` gets so that it addresses its
/// cache records, advancing `cache_offset` past them. `None` when the
/// offset is not representable in a byte operand; that occurrence then
/// stays unspecialized and consumes no cache records.
fn assign_cache_oparg(
    index: usize,
    opcode: Opcode,
    original_oparg: u8,
    cache_offset: &mut i32,
) -> Option<u8> {
    let need = cache_requirement(opcode) as i32;
    if need == 0 {
        return Some(original_oparg);
    }
    let nexti = index as i32 + 1;
    let mut oparg = oparg_from_offset_and_nexti(*cache_offset, nexti);
    if oparg < 0 {
        // The running offset lags this site; bump it forward to the first
        // offset the operand encoding can express here.
        oparg = 0;
        *cache_offset = offset_from_oparg_and_nexti(0, nexti);
    } else if oparg > 255 {
        return None;
    }
    *cache_offset += need;
    Some(oparg as u8)
}

/// One forward pass counting the cache records the stream will consume,
/// count header included. Must walk exactly like
/// [`insert_adaptive_instructions`].
fn entries_needed(code: &[CodeUnit]) -> usize {
    let mut cache_offset = 0i32;
    let mut previous = None;
    for (i, unit) in code.iter().enumerate() {
        let opcode = unit.opcode();
        if previous != Some(Opcode::ExtendedArg) {
            let _ = assign_cache_oparg(i, opcode, unit.oparg(), &mut cache_offset);
        }
        previous = Some(opcode);
    }
    cache_offset as usize + 1
}

fn insert_adaptive_instructions(q: &QuickenedCode, instruction_count: usize) {
    let mut cache_offset = 0i32;
    let mut previous: Option<Opcode> = None;
    for i in 0..instruction_count {
        let unit = q.instruction(i);
        let opcode = unit.opcode();
        if previous == Some(Opcode::ExtendedArg) {
            // An extended operand would collide with the cache-offset
            // encoding; such instructions are never made adaptive.
            previous = Some(opcode);
            continue;
        }
        previous = Some(opcode);
        let Some(adaptive) = adaptive_form(opcode) else {
            continue;
        };
        let original_oparg = unit.oparg();
        match assign_cache_oparg(i, opcode, original_oparg, &mut cache_offset) {
            None => {
                debug!(
                    target: "quill::vm::quicken",
                    index = i,
                    op = ?opcode,
                    "cache offset not operand-representable; occurrence left generic"
                );
            }
            Some(cache_oparg) => {
                q.set_instruction(i, CodeUnit::new(adaptive, cache_oparg));
                let adaptive_record = (cache_offset - cache_requirement(opcode) as i32) as usize;
                q.set_entry(adaptive_record, CacheEntry::Adaptive {
                    original_oparg,
                    counter: 0,
                    index: 0,
                });
            }
        }
    }
    debug_assert_eq!(cache_offset as usize + 1, q.cache_count());
}

/// Quicken a code object: idempotent, and a permanent no-op for oversized
/// or empty bodies.
pub fn quicken(code: &CodeObject) -> Result<(), AllocError> {
    quicken_with_budget(code, None)
}

/// Quicken, charging the block against `budget` when one is given. A failed
/// charge marks the code object exempt so the site is never retried.
pub fn quicken_with_budget(
    code: &CodeObject,
    budget: Option<&MemoryBudget>,
) -> Result<(), AllocError> {
    if code.quickened().is_some() || code.is_quicken_exempt() {
        return Ok(());
    }
    let instruction_count = code.instruction_count();
    if instruction_count == 0 || instruction_count > MAX_SIZE_TO_QUICKEN {
        code.exempt_from_quickening();
        return Ok(());
    }
    let cache_count = entries_needed(&code.code);
    if let Some(budget) = budget {
        let records = cache_count + instruction_count.div_ceil(INSTRUCTIONS_PER_ENTRY);
        if let Err(err) = budget.charge((records * 8) as u64) {
            code.exempt_from_quickening();
            return Err(err);
        }
    }
    let q = QuickenedCode::allocate(cache_count, instruction_count);
    q.copy_instructions(&code.code);
    insert_adaptive_instructions(&q, instruction_count);
    code.install_quickened(q);
    debug!(
        target: "quill::vm::quicken",
        code = %code.name,
        caches = cache_count,
        instructions = instruction_count,
        "code quickened"
    );
    Ok(())
}
