use super::*;

use crate::vm::JumpRejection;

fn straight_line() -> Arc<CodeObject> {
    CodeBuilder::new("straight")
        .load_const(Const::Int(1))
        .load_const(Const::Int(2))
        .load_const(Const::Int(3))
        .op(Opcode::Nop, 0)
        .op(Opcode::BinaryAdd, 0)
        .op(Opcode::PopTop, 0)
        .op(Opcode::ReturnValue, 0)
        .stacksize(3)
        .build()
}

/// A frame paused at `lasti` with the matching operand depth, as a trace
/// hook would see it.
fn paused_frame(vm: &mut Vm, func: &Arc<crate::val::FunctionObject>, lasti: i32, depth: u32) -> usize {
    let at = vm.push_frame(func, None, &[]).unwrap();
    vm.call_stack[at].set_state(FrameState::Executing);
    for _ in 0..depth {
        vm.push_operand(at, Value::Int(0)).unwrap();
    }
    vm.call_stack[at].lasti = lasti;
    at
}

/// Finish a frame the test left mid-execution so it may be popped.
fn settle(vm: &mut Vm, at: usize) {
    vm.call_stack[at].set_state(FrameState::Returned);
    vm.pop_frame().unwrap();
}

#[test]
fn backward_retarget_pops_to_the_target_depth() {
    init_tracing();
    let ctx = VmContext::new();
    let func = ctx.function(straight_line());
    let mut vm = Vm::new();
    let at = paused_frame(&mut vm, &func, 3, 3);
    let plan = vm.retarget_frame(at, 1).unwrap();
    assert_eq!(plan.pops, 2);
    assert_eq!(vm.call_stack[at].operand_depth(), 1);
    assert_eq!(vm.call_stack[at].lasti(), 0);
    settle(&mut vm, at);
}

#[test]
fn same_depth_retarget_pops_nothing() {
    let ctx = VmContext::new();
    let func = ctx.function(straight_line());
    let mut vm = Vm::new();
    let at = paused_frame(&mut vm, &func, 1, 1);
    // Index 6 sits past the add and the pop, one deep like here.
    let plan = vm.retarget_frame(at, 6).unwrap();
    assert_eq!(plan.pops, 0);
    assert_eq!(vm.call_stack[at].operand_depth(), 1);
    settle(&mut vm, at);
}

#[test]
fn deeper_target_is_rejected() {
    let ctx = VmContext::new();
    let func = ctx.function(straight_line());
    let mut vm = Vm::new();
    let at = paused_frame(&mut vm, &func, 0, 0);
    assert_eq!(vm.retarget_frame(at, 2), Err(JumpRejection::DepthMismatch));
    // The frame is untouched on rejection.
    assert_eq!(vm.call_stack[at].lasti(), 0);
    assert_eq!(vm.call_stack[at].operand_depth(), 0);
    settle(&mut vm, at);
}

#[test]
fn jump_into_a_loop_body_is_rejected() {
    let code = CodeBuilder::new("loops")
        .load_const(Const::Int(0))
        .op(Opcode::GetIter, 0)
        .op(Opcode::ForIter, 2)
        .op(Opcode::PopTop, 0)
        .op(Opcode::Jump, 2)
        .load_const(Const::Nil)
        .op(Opcode::ReturnValue, 0)
        .stacksize(2)
        .build();
    let ctx = VmContext::new();
    let func = ctx.function(code);
    let mut vm = Vm::new();
    let at = paused_frame(&mut vm, &func, 0, 0);
    assert_eq!(vm.retarget_frame(at, 2), Err(JumpRejection::IntoLoopBody));
    settle(&mut vm, at);
}

#[test]
fn retarget_requires_an_executing_frame() {
    let ctx = VmContext::new();
    let func = ctx.function(straight_line());
    let mut vm = Vm::new();
    let at = vm.push_frame(&func, None, &[]).unwrap();
    assert_eq!(
        vm.retarget_frame(at, 1),
        Err(JumpRejection::BadFrameState(FrameState::Created))
    );
    vm.pop_frame().unwrap();
}

#[test]
fn target_out_of_range_is_rejected() {
    let ctx = VmContext::new();
    let func = ctx.function(straight_line());
    let mut vm = Vm::new();
    let at = paused_frame(&mut vm, &func, 0, 0);
    assert_eq!(vm.retarget_frame(at, 99), Err(JumpRejection::TargetOutOfRange));
    settle(&mut vm, at);
}

fn two_values_gen(ctx: &VmContext) -> Arc<crate::val::FunctionObject> {
    let code = CodeBuilder::new("two_values")
        .generator()
        .load_const(Const::Int(1))
        .op(Opcode::YieldValue, 0)
        .op(Opcode::PopTop, 0)
        .load_const(Const::Int(2))
        .op(Opcode::YieldValue, 0)
        .op(Opcode::PopTop, 0)
        .load_const(Const::Int(3))
        .op(Opcode::ReturnValue, 0)
        .build();
    ctx.function(code)
}

#[test]
fn suspended_generator_replays_from_the_start() {
    let ctx = VmContext::new();
    let func = two_values_gen(&ctx);
    let mut vm = Vm::new();
    let Value::Generator(generator) = vm.call_function(&func, &[]).unwrap() else {
        panic!("generator flag did not produce a generator");
    };
    assert_eq!(vm.resume(&generator, Value::Nil).unwrap(), GenExit::Yield(Value::Int(1)));
    let plan = vm.retarget_suspended(&generator, 0).unwrap();
    assert_eq!(plan.pops, 0);
    assert_eq!(vm.resume(&generator, Value::Nil).unwrap(), GenExit::Yield(Value::Int(1)));
}

#[test]
fn suspended_generator_skips_forward() {
    let ctx = VmContext::new();
    let func = two_values_gen(&ctx);
    let mut vm = Vm::new();
    let Value::Generator(generator) = vm.call_function(&func, &[]).unwrap() else {
        panic!("generator flag did not produce a generator");
    };
    assert_eq!(vm.resume(&generator, Value::Nil).unwrap(), GenExit::Yield(Value::Int(1)));
    // Jump past the PopTop to the load feeding the second yield.
    vm.retarget_suspended(&generator, 3).unwrap();
    assert_eq!(vm.resume(&generator, Value::Nil).unwrap(), GenExit::Yield(Value::Int(2)));
    assert_eq!(vm.resume(&generator, Value::Nil).unwrap(), GenExit::Return(Value::Int(3)));
}

#[test]
fn fresh_generator_cannot_be_retargeted() {
    let ctx = VmContext::new();
    let func = two_values_gen(&ctx);
    let mut vm = Vm::new();
    let Value::Generator(generator) = vm.call_function(&func, &[]).unwrap() else {
        panic!("generator flag did not produce a generator");
    };
    assert_eq!(
        vm.retarget_suspended(&generator, 0),
        Err(JumpRejection::BadFrameState(FrameState::Created))
    );
}
