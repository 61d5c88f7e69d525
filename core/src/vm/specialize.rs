//! Counter-driven specialization of adaptive instructions.
//!
//! The dispatch loop calls in here when an adaptive instruction's counter
//! reaches zero. Success rewrites the instruction word in the quickened
//! stream and fills the payload record; failure re-arms the counter with a
//! fixed backoff so the site stays generic for a while.

use once_cell::sync::Lazy;
use tracing::debug;

use super::cache::{CacheEntry, QuickenedCode};
use super::code::CodeUnit;
use super::context::Namespace;
use super::opcode::Opcode;
use crate::val::Value;

/// Calls a failed site waits before the next specialization attempt.
pub const ADAPTIVE_CACHE_BACKOFF: u8 = 64;

struct FamilySpec {
    adaptive: Opcode,
    cache_entries: u8,
}

/// Process-wide adaptive tables, initialized once and immutable after.
static FAMILIES: Lazy<[Option<FamilySpec>; 256]> = Lazy::new(|| {
    let mut table: [Option<FamilySpec>; 256] = [const { None }; 256];
    table[Opcode::LoadAttr as usize] = Some(FamilySpec {
        adaptive: Opcode::LoadAttrAdaptive,
        cache_entries: 2,
    });
    table[Opcode::LoadGlobal as usize] = Some(FamilySpec {
        adaptive: Opcode::LoadGlobalAdaptive,
        cache_entries: 2,
    });
    table[Opcode::Call as usize] = Some(FamilySpec {
        adaptive: Opcode::CallAdaptive,
        cache_entries: 2,
    });
    table[Opcode::BinarySubscr as usize] = Some(FamilySpec {
        adaptive: Opcode::BinarySubscrAdaptive,
        cache_entries: 1,
    });
    table
});

/// Adaptive form of a specializable opcode.
pub(crate) fn adaptive_form(op: Opcode) -> Option<Opcode> {
    FAMILIES[op as usize].as_ref().map(|spec| spec.adaptive)
}

/// Cache records the opcode consumes (adaptive record plus payload).
pub(crate) fn cache_requirement(op: Opcode) -> u8 {
    FAMILIES[op as usize]
        .as_ref()
        .map_or(0, |spec| spec.cache_entries)
}

/// Always-on specialization counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpecializationStats {
    /// Adaptive sites rewritten to a specialized form.
    pub success: u64,
    /// Specialization attempts that found no applicable form.
    pub failure: u64,
    /// Specialized executions whose guard passed.
    pub hit: u64,
    /// Adaptive executions spent counting down the backoff.
    pub deferred: u64,
    /// Specialized executions whose guard failed (per-call fallback).
    pub deopt: u64,
    /// Guard misses spent counting down before respecialization.
    pub miss: u64,
    /// Frames executed on never-quickened code.
    pub unquickened: u64,
}

fn adaptive_at(q: &QuickenedCode, offset: usize) -> (u8, u8, u16) {
    match q.entry(offset) {
        CacheEntry::Adaptive {
            original_oparg,
            counter,
            index,
        } => (original_oparg, counter, index),
        other => unreachable!("adaptive record expected at cache offset {offset}, found {other:?}"),
    }
}

fn record_failure(q: &QuickenedCode, offset: usize, stats: &mut SpecializationStats) {
    let (original_oparg, _, index) = adaptive_at(q, offset);
    q.set_entry(offset, CacheEntry::Adaptive {
        original_oparg,
        counter: ADAPTIVE_CACHE_BACKOFF,
        index,
    });
    stats.failure += 1;
}

fn install(
    q: &QuickenedCode,
    i: usize,
    offset: usize,
    specialized: Opcode,
    index: u16,
    stats: &mut SpecializationStats,
) {
    let (original_oparg, _, _) = adaptive_at(q, offset);
    q.set_entry(offset, CacheEntry::Adaptive {
        original_oparg,
        counter: 0,
        index,
    });
    let oparg = q.instruction(i).oparg();
    q.set_instruction(i, CodeUnit::new(specialized, oparg));
    stats.success += 1;
    debug!(target: "quill::vm::specialize", index = i, op = ?specialized, "site specialized");
}

/// Attribute load against the owner about to be popped.
pub(crate) fn specialize_load_attr(
    q: &QuickenedCode,
    i: usize,
    offset: usize,
    owner: &Value,
    name: &str,
    stats: &mut SpecializationStats,
) -> bool {
    if let Value::Instance(inst) = owner
        && let Some(slot) = inst.shape.slot_of(name)
    {
        q.set_entry(offset + 1, CacheEntry::Attr {
            shape_version: inst.shape.version(),
        });
        install(q, i, offset, Opcode::LoadAttrInstance, slot, stats);
        return true;
    }
    record_failure(q, offset, stats);
    false
}

/// Global load, resolved to the module namespace or to builtins.
pub(crate) fn specialize_load_global(
    q: &QuickenedCode,
    i: usize,
    offset: usize,
    globals: &Namespace,
    builtins: &Namespace,
    name: &str,
    stats: &mut SpecializationStats,
) -> bool {
    if let Some(slot) = globals.slot_of(name)
        && globals.get_slot(slot).is_some()
    {
        q.set_entry(offset + 1, CacheEntry::Global {
            globals_version: globals.version(),
            builtins_version: 0,
        });
        install(q, i, offset, Opcode::LoadGlobalModule, slot, stats);
        return true;
    }
    if globals.get(name).is_none()
        && let Some(slot) = builtins.slot_of(name)
        && builtins.get_slot(slot).is_some()
    {
        // The globals version is cached too: defining the name there later
        // must shadow the builtin and invalidate this record.
        q.set_entry(offset + 1, CacheEntry::Global {
            globals_version: globals.version(),
            builtins_version: builtins.version() as u16,
        });
        install(q, i, offset, Opcode::LoadGlobalBuiltin, slot, stats);
        return true;
    }
    record_failure(q, offset, stats);
    false
}

/// Subscript on the container/index pair at the top of the stack.
pub(crate) fn specialize_binary_subscr(
    q: &QuickenedCode,
    i: usize,
    offset: usize,
    container: &Value,
    index: &Value,
    stats: &mut SpecializationStats,
) -> bool {
    let specialized = match (container, index) {
        (Value::List(_), Value::Int(_)) => Opcode::BinarySubscrList,
        (Value::Map(_), Value::Str(_)) => Opcode::BinarySubscrMap,
        _ => {
            record_failure(q, offset, stats);
            return false;
        }
    };
    install(q, i, offset, specialized, 0, stats);
    true
}

/// Call with a resolved callee and known argument count.
pub(crate) fn specialize_call(
    q: &QuickenedCode,
    i: usize,
    offset: usize,
    callee: &Value,
    argc: u16,
    stats: &mut SpecializationStats,
) -> bool {
    if let Value::Native(native) = callee
        && native.arity == argc
    {
        q.set_entry(offset + 1, CacheEntry::Call {
            callee_version: native.version(),
            arity: argc,
        });
        install(q, i, offset, Opcode::CallNative, 0, stats);
        return true;
    }
    record_failure(q, offset, stats);
    false
}
