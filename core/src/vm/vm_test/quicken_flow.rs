use super::*;

use crate::vm::{CacheEntry, MAX_SIZE_TO_QUICKEN, offset_from_oparg_and_nexti};

fn attr_code() -> Arc<CodeObject> {
    CodeBuilder::new("reads_x")
        .arg("obj")
        .op(Opcode::LoadFast, 0)
        .name_op(Opcode::LoadAttr, "x")
        .op(Opcode::ReturnValue, 0)
        .stacksize(2)
        .build()
}

fn point(x: i64) -> Value {
    let shape = Shape::new(&["x", "y"]);
    Value::Instance(Instance::new(shape, vec![Value::Int(x), Value::Int(0)]))
}

#[test]
fn code_quickens_exactly_at_the_warmup_threshold() {
    init_tracing();
    let ctx = VmContext::new();
    let func = ctx.function(attr_code());
    let mut vm = Vm::new();
    let obj = point(3);
    for call in 1..QUICKENING_WARMUP_DELAY {
        assert_eq!(vm.call_function(&func, &[obj.clone()]).unwrap(), Value::Int(3));
        assert!(func.code.quickened().is_none(), "quickened after call {call}");
    }
    assert_eq!(vm.call_function(&func, &[obj]).unwrap(), Value::Int(3));
    assert!(func.code.quickened().is_some());
    // Only the pre-threshold calls ran on the original stream.
    assert_eq!(vm.stats().unquickened, QUICKENING_WARMUP_DELAY as u64 - 1);
}

#[test]
fn quickened_stream_carries_adaptive_forms() {
    use crate::val::MapObject;
    let ctx = VmContext::new();
    let func = ctx.function(attr_code());
    let mut vm = Vm::new();
    // A map owner resolves the attribute generically but defeats
    // specialization, so the site stays in its adaptive form.
    let map = MapObject::new();
    map.insert("x", Value::Int(1));
    warm_up(&mut vm, &func, &[Value::Map(map)]);
    let q = func.code.quickened().unwrap();
    assert_eq!(q.instruction(0).opcode(), Opcode::LoadFast);
    let unit = q.instruction(1);
    assert_eq!(unit.opcode(), Opcode::LoadAttrAdaptive);
    let offset = offset_from_oparg_and_nexti(unit.oparg() as i32, 2) as usize;
    assert!(matches!(q.entry(offset), CacheEntry::Adaptive { original_oparg: 0, .. }));
    // The compiler-visible stream is untouched.
    assert_eq!(func.code.code[1].opcode(), Opcode::LoadAttr);
}

#[test]
fn oversized_code_never_quickens_through_the_vm() {
    let mut builder = CodeBuilder::new("huge");
    for _ in 0..MAX_SIZE_TO_QUICKEN {
        builder = builder.op(Opcode::Nop, 0);
    }
    let code = builder
        .load_const(Const::Int(1))
        .op(Opcode::ReturnValue, 0)
        .build();
    let ctx = VmContext::new();
    let func = ctx.function(code);
    let mut vm = Vm::new();
    for _ in 0..QUICKENING_WARMUP_DELAY + 2 {
        assert_eq!(vm.call_function(&func, &[]).unwrap(), Value::Int(1));
    }
    assert!(func.code.quickened().is_none());
    assert!(func.code.is_quicken_exempt());
}

#[test]
fn quickening_charges_the_heap_budget() {
    let ctx = VmContext::new();
    let func = ctx.function(attr_code());
    let mut vm = Vm::with_limits(1 << 16, 1 << 20);
    warm_up(&mut vm, &func, &[point(1)]);
    assert!(vm.heap_used() > 0);
}

#[test]
fn exhausted_budget_leaves_code_generic_but_running() {
    let ctx = VmContext::new();
    let func = ctx.function(attr_code());
    let mut vm = Vm::with_limits(1 << 16, 0);
    let obj = point(5);
    for _ in 0..QUICKENING_WARMUP_DELAY + 4 {
        // Calls keep succeeding on the original stream.
        assert_eq!(vm.call_function(&func, &[obj.clone()]).unwrap(), Value::Int(5));
    }
    assert!(func.code.quickened().is_none());
    assert!(func.code.is_quicken_exempt());
}
