use super::*;

use crate::vm::{INSTRUCTIONS_PER_ENTRY, quicken};

#[test]
fn cache_block_layout_for_a_mixed_stream() {
    // 100 instructions, 10 of them attribute loads: one count header,
    // two records per attribute site, then the copied stream packed
    // three words to a record. The first site sits at instruction 1,
    // whose invertible oparg would be negative at offset 0, so its
    // cache block is bumped past an unused record.
    let mut builder = CodeBuilder::new("mixed");
    for _ in 0..10 {
        builder = builder
            .load_const(Const::Int(0))
            .name_op(Opcode::LoadAttr, "x")
            .op(Opcode::PopTop, 0);
    }
    for _ in 0..68 {
        builder = builder.op(Opcode::Nop, 0);
    }
    let code = builder
        .load_const(Const::Nil)
        .op(Opcode::ReturnValue, 0)
        .build();
    assert_eq!(code.instruction_count(), 100);

    quicken(&code).unwrap();
    let q = code.quickened().unwrap();
    assert_eq!(q.cache_count(), 1 + 1 + 10 * 2);
    assert_eq!(q.instruction_base(), q.cache_count());
    assert_eq!(q.len(), 22 + 100usize.div_ceil(INSTRUCTIONS_PER_ENTRY));
    // Every attribute site was rewritten; nothing else was.
    for i in 0..100 {
        let op = q.instruction(i).opcode();
        assert_ne!(op, Opcode::LoadAttr);
        if i < 30 {
            assert_eq!(op == Opcode::LoadAttrAdaptive, i % 3 == 1, "index {i}");
        }
    }
}

#[test]
fn warmup_to_specialization_pipeline() {
    init_tracing();
    let ctx = VmContext::new();
    ctx.define_native("add1", 1, |args| match &args[0] {
        Value::Int(n) => Ok(Value::Int(n + 1)),
        other => anyhow::bail!("add1 expects an int, got {}", other.type_name()),
    });
    // obj.x + add1(1)
    let code = CodeBuilder::new("hot")
        .arg("obj")
        .op(Opcode::LoadFast, 0)
        .name_op(Opcode::LoadAttr, "x")
        .name_op(Opcode::LoadGlobal, "add1")
        .load_const(Const::Int(1))
        .op(Opcode::Call, 1)
        .op(Opcode::BinaryAdd, 0)
        .op(Opcode::ReturnValue, 0)
        .stacksize(3)
        .build();
    let func = ctx.function(code);
    let mut vm = Vm::new();
    let shape = Shape::new(&["x"]);
    let obj = Value::Instance(Instance::new(shape, vec![Value::Int(40)]));

    for call in 1..=30 {
        let out = vm.call_function(&func, &[obj.clone()]).unwrap();
        assert_eq!(out, Value::Int(42), "call {call}");
    }

    // Generic warmup calls, then one quickening, then steady-state hits.
    assert_eq!(vm.stats().unquickened, QUICKENING_WARMUP_DELAY as u64 - 1);
    let q = func.code.quickened().unwrap();
    assert_eq!(q.instruction(1).opcode(), Opcode::LoadAttrInstance);
    assert_eq!(q.instruction(2).opcode(), Opcode::LoadGlobalBuiltin);
    assert_eq!(q.instruction(4).opcode(), Opcode::CallNative);
    assert_eq!(vm.stats().success, 3);
    assert_eq!(vm.stats().deopt, 0);
    // 23 post-quicken calls, three specialized sites each.
    assert_eq!(vm.stats().hit, 23 * 3);
    assert_eq!(vm.depth(), 0);
    assert_eq!(vm.arena_in_use(), 0);
}

#[test]
fn quickened_generators_still_suspend_and_resume() {
    let ctx = VmContext::new();
    let code = CodeBuilder::new("counter")
        .generator()
        .arg("n")
        .op(Opcode::LoadFast, 0)
        .op(Opcode::YieldValue, 0)
        .op(Opcode::PopTop, 0)
        .op(Opcode::LoadFast, 0)
        .load_const(Const::Int(1))
        .op(Opcode::BinaryAdd, 0)
        .op(Opcode::ReturnValue, 0)
        .build();
    let func = ctx.function(code);
    let mut vm = Vm::new();
    // Enough instantiations to quicken the generator body itself.
    for _ in 0..QUICKENING_WARMUP_DELAY {
        vm.call_function(&func, &[Value::Int(0)]).unwrap();
    }
    assert!(func.code.quickened().is_some());

    let Value::Generator(generator) = vm.call_function(&func, &[Value::Int(10)]).unwrap() else {
        panic!("generator flag did not produce a generator");
    };
    assert_eq!(vm.resume(&generator, Value::Nil).unwrap(), GenExit::Yield(Value::Int(10)));
    assert_eq!(vm.resume(&generator, Value::Nil).unwrap(), GenExit::Return(Value::Int(11)));
    assert!(generator.is_finished());
}
