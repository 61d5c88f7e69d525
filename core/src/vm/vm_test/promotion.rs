use super::*;

use crate::val::ListObject;

fn identity_code() -> Arc<CodeObject> {
    CodeBuilder::new("identity")
        .arg("a")
        .op(Opcode::LoadFast, 0)
        .op(Opcode::ReturnValue, 0)
        .stacksize(2)
        .build()
}

#[test]
fn repeated_requests_return_the_same_handle() {
    let ctx = VmContext::new();
    let func = ctx.function(identity_code());
    let mut vm = Vm::new();
    let depth = vm.push_frame(&func, None, &[Value::Int(1)]).unwrap();
    let a = vm.get_or_create_handle(depth);
    let b = vm.get_or_create_handle(depth);
    assert!(Arc::ptr_eq(&a, &b));
    let name = vm
        .with_handle_record(&a, |r| r.code().name.clone())
        .unwrap();
    assert_eq!(name.as_ref(), "identity");
    vm.pop_frame().unwrap();
}

#[test]
fn unique_handle_dies_with_its_frame() {
    let ctx = VmContext::new();
    let func = ctx.function(identity_code());
    let mut vm = Vm::new();
    let depth = vm.push_frame(&func, None, &[Value::Int(1)]).unwrap();
    drop(vm.get_or_create_handle(depth));
    vm.pop_frame().unwrap();
    // No external holder, so nothing was copied to the heap.
    assert_eq!(vm.heap_used(), 0);
    assert_eq!(vm.arena_in_use(), 0);
}

#[test]
fn shared_handle_takes_a_heap_copy() {
    init_tracing();
    let ctx = VmContext::new();
    let func = ctx.function(identity_code());
    let mut vm = Vm::new();
    let list = ListObject::new(vec![Value::Int(9)]);
    let depth = vm
        .push_frame(&func, None, &[Value::List(list.clone())])
        .unwrap();
    assert_eq!(Arc::strong_count(&list), 2);
    vm.push_operand(depth, Value::Int(5)).unwrap();
    let handle = vm.get_or_create_handle(depth);
    vm.pop_frame().unwrap();

    assert!(handle.is_promoted());
    assert!(vm.heap_used() > 0);
    assert_eq!(vm.arena_in_use(), 0);
    // The copy keeps the argument alive; the arena slot was released.
    assert_eq!(Arc::strong_count(&list), 2);
    let (depth_copied, local) = handle
        .with_promoted(|r| (r.operand_depth(), r.slots(&vm.arena)[0].clone()))
        .unwrap();
    assert_eq!(depth_copied, 1);
    assert_eq!(local, Some(Value::List(list.clone())));
    drop(local);

    // Dropping the last handle releases the copy and its slot contents.
    drop(handle);
    assert_eq!(Arc::strong_count(&list), 1);
}

#[test]
fn promotion_failure_is_detectable() {
    let ctx = VmContext::new();
    let func = ctx.function(identity_code());
    let mut vm = Vm::with_limits(1024, 0);
    let depth = vm.push_frame(&func, None, &[Value::Int(1)]).unwrap();
    let handle = vm.get_or_create_handle(depth);
    assert!(vm.pop_frame().is_err());
    assert!(handle.is_failed());
    assert!(!handle.is_promoted());
    assert!(vm.with_handle_record(&handle, |_| ()).is_none());
    // The slots were still released.
    assert_eq!(vm.arena_in_use(), 0);
}

#[test]
fn promotion_rewires_the_caller_link() {
    let ctx = VmContext::new();
    let func = ctx.function(identity_code());
    let mut vm = Vm::new();
    vm.push_frame(&func, None, &[Value::Int(1)]).unwrap();
    let inner = vm.push_frame(&func, None, &[Value::Int(2)]).unwrap();
    let handle = vm.get_or_create_handle(inner);
    vm.pop_frame().unwrap();

    assert!(handle.is_promoted());
    let back = handle.back().expect("caller link was not rewired");
    let outer_handle = vm.get_or_create_handle(0);
    assert!(Arc::ptr_eq(&back, &outer_handle));
    vm.pop_frame().unwrap();
    // The outer frame was itself externally held, so it promoted too.
    assert!(outer_handle.is_promoted());
}

#[test]
fn unhandled_frames_promote_nothing() {
    let ctx = VmContext::new();
    let func = ctx.function(identity_code());
    let mut vm = Vm::new();
    vm.push_frame(&func, None, &[Value::Int(1)]).unwrap();
    vm.pop_frame().unwrap();
    assert_eq!(vm.heap_used(), 0);
    assert_eq!(vm.arena_in_use(), 0);
}
