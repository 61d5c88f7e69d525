//! The dispatch loop: executes quickened or original instruction streams,
//! drives adaptive counters and specialization guards, and handles calls,
//! returns, unwinding and generator suspension.

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tracing::warn;

use super::Vm;
use super::frame::{ActivationRecord, CallerLink, FrameState, FrameStorage};
use super::handle::{park_handle, reattach_handle};
use crate::val::{CellObject, FunctionObject, GeneratorObject, IterObject, Value};
use crate::vm::arena::Slot;
use crate::vm::cache::{CacheEntry, QuickenedCode, offset_from_oparg_and_nexti};
use crate::vm::code::CodeObject;
use crate::vm::opcode::Opcode;
use crate::vm::specialize;

/// How a frame left the dispatch loop.
pub(crate) enum FrameExit {
    Return(Value),
    Yield(Value),
}

/// Outcome of one generator resume.
#[derive(Debug, Clone, PartialEq)]
pub enum GenExit {
    Yield(Value),
    Return(Value),
    /// The generator completed on an earlier resume.
    Finished,
}

fn quickened(code: &CodeObject) -> Result<&QuickenedCode> {
    code.quickened()
        .ok_or_else(|| anyhow!("adaptive instruction outside quickened code"))
}

fn name_of(code: &CodeObject, index: u32) -> Result<Arc<str>> {
    code.names
        .get(index as usize)
        .cloned()
        .ok_or_else(|| anyhow!("name index {index} out of range in {}", code.name))
}

fn adaptive_parts(q: &QuickenedCode, offset: usize) -> Result<(u8, u8, u16)> {
    match q.entry(offset) {
        CacheEntry::Adaptive {
            original_oparg,
            counter,
            index,
        } => Ok((original_oparg, counter, index)),
        other => bail!("adaptive record expected at cache offset {offset}, found {other:?}"),
    }
}

fn defer(q: &QuickenedCode, offset: usize, original_oparg: u8, counter: u8, index: u16) {
    q.set_entry(offset, CacheEntry::Adaptive {
        original_oparg,
        counter: counter - 1,
        index,
    });
}

impl Vm {
    /// Call a function value to completion (or, for generator code, to a
    /// fresh suspended generator). The public entry point.
    pub fn call_function(&mut self, func: &Arc<FunctionObject>, args: &[Value]) -> Result<Value> {
        self.quicken_if_due(&func.code);
        if func.code.is_generator() {
            let generator = self.make_generator(func, args)?;
            return Ok(Value::Generator(generator));
        }
        let depth = self.push_frame(func, None, args)?;
        match self.run_frame(depth) {
            Ok(FrameExit::Return(value)) => {
                self.call_stack[depth].set_state(FrameState::Returned);
                self.pop_frame()?;
                Ok(value)
            }
            Ok(FrameExit::Yield(_)) => {
                self.fault_frame(depth);
                bail!("yield outside a generator in {}", func.code.name)
            }
            Err(err) => {
                self.fault_frame(depth);
                Err(err)
            }
        }
    }

    /// Dispatch any callable value.
    pub fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<Value> {
        match callee {
            Value::Function(func) => self.call_function(func, args),
            Value::Native(native) => {
                if args.len() != native.arity as usize {
                    bail!(
                        "{} expects {} arguments, got {}",
                        native.name,
                        native.arity,
                        args.len()
                    );
                }
                (native.f)(args)
            }
            other => bail!("{} is not callable", other.type_name()),
        }
    }

    /// Resume a generator, delivering `send` as the value of the suspended
    /// yield expression.
    pub fn resume(&mut self, generator: &Arc<GeneratorObject>, send: Value) -> Result<GenExit> {
        if generator.is_finished() {
            return Ok(GenExit::Finished);
        }
        let record = generator
            .record
            .borrow_mut()
            .take()
            .ok_or_else(|| anyhow!("generator '{}' is already running", generator.name))?;
        let started = record.lasti() >= 0;
        let depth = self.call_stack.len();
        let mut record = record;
        record.previous = match depth {
            0 => CallerLink::None,
            n => CallerLink::Stack(n - 1),
        };
        reattach_handle(&record, depth);
        self.call_stack.push(record);
        if started && self.resumes_at_yield(depth) {
            if let Err(err) = self.push_operand(depth, send) {
                let mut record = self.call_stack.pop().ok_or(err)?;
                record.previous = CallerLink::None;
                park_handle(&record);
                *generator.record.borrow_mut() = Some(record);
                bail!("generator '{}' cannot accept a value here", generator.name);
            }
        }
        let outcome = self.run_frame(depth);
        let mut record = self
            .call_stack
            .pop()
            .ok_or_else(|| anyhow!("generator frame vanished from the call stack"))?;
        record.previous = CallerLink::None;
        match outcome {
            Ok(FrameExit::Yield(value)) => {
                record.set_state(FrameState::Suspended);
                park_handle(&record);
                *generator.record.borrow_mut() = Some(record);
                Ok(GenExit::Yield(value))
            }
            Ok(FrameExit::Return(value)) => {
                record.set_state(FrameState::Returned);
                generator.finished.set(true);
                self.clear_frame(record)?;
                Ok(GenExit::Return(value))
            }
            Err(err) => {
                record.set_state(FrameState::Unwinding);
                record.set_state(FrameState::Raised);
                generator.finished.set(true);
                if let Err(clear_err) = self.clear_frame(record) {
                    warn!(target: "quill::vm::frames", "generator clear during unwind failed: {clear_err}");
                }
                Err(err)
            }
        }
    }

    fn resumes_at_yield(&self, depth: usize) -> bool {
        let record = &self.call_stack[depth];
        let lasti = record.lasti();
        if lasti < 0 {
            return false;
        }
        record.code.unit(lasti as usize).opcode().generic_form() == Opcode::YieldValue
    }

    /// Unwind bookkeeping for a frame that failed or misbehaved.
    fn fault_frame(&mut self, depth: usize) {
        self.call_stack[depth].set_state(FrameState::Unwinding);
        self.call_stack[depth].set_state(FrameState::Raised);
        if let Err(clear_err) = self.pop_frame() {
            warn!(target: "quill::vm::frames", "frame clear during unwind failed: {clear_err}");
        }
    }

    fn make_generator(
        &mut self,
        func: &Arc<FunctionObject>,
        args: &[Value],
    ) -> Result<Arc<GeneratorObject>> {
        let code = func.code.clone();
        let size = code.frame_size();
        self.budget
            .charge((size * std::mem::size_of::<Slot>()) as u64)?;
        let storage = FrameStorage::Owned(vec![None; size].into_boxed_slice());
        let mut record = ActivationRecord::new(func.clone(), None, storage, CallerLink::None);
        record.initialize_slots(&mut self.arena, args)?;
        Ok(GeneratorObject::new(func.name.clone(), record))
    }

    pub(crate) fn run_frame(&mut self, depth: usize) -> Result<FrameExit> {
        debug_assert_eq!(depth + 1, self.call_stack.len(), "only the top frame executes");
        let code = self.call_stack[depth].code.clone();
        self.call_stack[depth].set_state(FrameState::Executing);
        if code.quickened().is_none() {
            self.stats.unquickened += 1;
        }
        let mut i = (self.call_stack[depth].lasti() + 1) as usize;
        let mut ext: u32 = 0;
        loop {
            if i >= code.instruction_count() {
                bail!("execution fell off the end of {}", code.name);
            }
            self.call_stack[depth].lasti = i as i32;
            let unit = code.unit(i);
            let opcode = unit.opcode();
            let oparg = unit.oparg();
            let arg = (ext << 8) | oparg as u32;
            ext = 0;
            match opcode {
                Opcode::Nop => i += 1,
                Opcode::ExtendedArg => {
                    ext = arg;
                    i += 1;
                }
                Opcode::PopTop => {
                    self.pop_operand(depth)?;
                    i += 1;
                }
                Opcode::LoadConst => {
                    let value = code
                        .consts
                        .get(arg as usize)
                        .ok_or_else(|| anyhow!("constant index {arg} out of range in {}", code.name))?
                        .to_value();
                    self.push_operand(depth, value)?;
                    i += 1;
                }
                Opcode::LoadFast => {
                    let value = self.load_local(depth, arg as usize, &code)?;
                    self.push_operand(depth, value)?;
                    i += 1;
                }
                Opcode::StoreFast => {
                    let value = self.pop_operand(depth)?;
                    self.store_local(depth, arg as usize, value, &code)?;
                    i += 1;
                }
                Opcode::LoadDeref => {
                    let cell = self.local_cell(depth, arg as usize, &code)?;
                    let value = cell.get().ok_or_else(|| {
                        anyhow!("free variable in slot {arg} referenced before assignment")
                    })?;
                    self.push_operand(depth, value)?;
                    i += 1;
                }
                Opcode::StoreDeref => {
                    let value = self.pop_operand(depth)?;
                    let cell = self.local_cell(depth, arg as usize, &code)?;
                    cell.set(Some(value));
                    i += 1;
                }
                Opcode::LoadGlobal => {
                    let name = name_of(&code, arg)?;
                    self.op_load_global(depth, &name)?;
                    i += 1;
                }
                Opcode::StoreGlobal => {
                    let name = name_of(&code, arg)?;
                    let value = self.pop_operand(depth)?;
                    self.call_stack[depth].globals.set(&name, value);
                    i += 1;
                }
                Opcode::LoadAttr => {
                    let name = name_of(&code, arg)?;
                    self.op_load_attr(depth, &name)?;
                    i += 1;
                }
                Opcode::StoreAttr => {
                    let name = name_of(&code, arg)?;
                    self.op_store_attr(depth, &name)?;
                    i += 1;
                }
                Opcode::BinarySubscr => {
                    self.op_binary_subscr(depth)?;
                    i += 1;
                }
                Opcode::BinaryAdd => {
                    self.op_binary_add(depth)?;
                    i += 1;
                }
                Opcode::CompareLt => {
                    self.op_compare_lt(depth)?;
                    i += 1;
                }
                Opcode::Jump => {
                    i = arg as usize;
                }
                Opcode::PopJumpIfFalse => {
                    let value = self.pop_operand(depth)?;
                    i = if value.is_truthy() { i + 1 } else { arg as usize };
                }
                Opcode::PopJumpIfTrue => {
                    let value = self.pop_operand(depth)?;
                    i = if value.is_truthy() { arg as usize } else { i + 1 };
                }
                Opcode::GetIter => {
                    self.op_get_iter(depth)?;
                    i += 1;
                }
                Opcode::ForIter => {
                    let top = self.peek_operand(depth, 0)?;
                    let Value::Iter(iter) = top else {
                        bail!("for loop over non-iterator {}", top.type_name());
                    };
                    match iter.next() {
                        Some(item) => {
                            self.push_operand(depth, item)?;
                            i += 1;
                        }
                        None => {
                            self.pop_operand(depth)?;
                            i = i + 1 + arg as usize;
                        }
                    }
                }
                Opcode::Call => {
                    self.op_call(depth, arg as usize)?;
                    i += 1;
                }
                Opcode::ReturnValue => {
                    let value = self.pop_operand(depth)?;
                    return Ok(FrameExit::Return(value));
                }
                Opcode::YieldValue => {
                    let value = self.pop_operand(depth)?;
                    return Ok(FrameExit::Yield(value));
                }
                Opcode::PushExcInfo => {
                    for _ in 0..3 {
                        self.push_operand(depth, Value::Nil)?;
                    }
                    i += 1;
                }
                Opcode::PopExcept => {
                    for _ in 0..3 {
                        self.pop_operand(depth)?;
                    }
                    i += 1;
                }
                Opcode::LoadAttrAdaptive => {
                    i = self.adaptive_load_attr(depth, &code, i, oparg)?;
                }
                Opcode::LoadGlobalAdaptive => {
                    i = self.adaptive_load_global(depth, &code, i, oparg)?;
                }
                Opcode::BinarySubscrAdaptive => {
                    i = self.adaptive_binary_subscr(depth, &code, i, oparg)?;
                }
                Opcode::CallAdaptive => {
                    i = self.adaptive_call(depth, &code, i, oparg)?;
                }
                Opcode::LoadAttrInstance => {
                    i = self.exec_load_attr_instance(depth, &code, i, oparg)?;
                }
                Opcode::LoadGlobalModule | Opcode::LoadGlobalBuiltin => {
                    i = self.exec_load_global_specialized(depth, &code, i, oparg, opcode)?;
                }
                Opcode::BinarySubscrList | Opcode::BinarySubscrMap => {
                    i = self.exec_binary_subscr_specialized(depth, &code, i, oparg, opcode)?;
                }
                Opcode::CallNative => {
                    i = self.exec_call_native(depth, &code, i, oparg)?;
                }
            }
        }
    }

    // Adaptive dispatch: counter at zero attempts specialization and
    // re-dispatches the rewritten word; otherwise count down and run the
    // generic operation.

    fn adaptive_load_attr(
        &mut self,
        depth: usize,
        code: &CodeObject,
        i: usize,
        oparg: u8,
    ) -> Result<usize> {
        let q = quickened(code)?;
        let offset = offset_from_oparg_and_nexti(oparg as i32, i as i32 + 1) as usize;
        let (original_oparg, counter, index) = adaptive_parts(q, offset)?;
        let name = name_of(code, original_oparg as u32)?;
        if counter == 0 {
            let owner = self.peek_operand(depth, 0)?;
            if specialize::specialize_load_attr(q, i, offset, &owner, &name, &mut self.stats) {
                return Ok(i);
            }
        } else {
            defer(q, offset, original_oparg, counter, index);
            self.stats.deferred += 1;
        }
        self.op_load_attr(depth, &name)?;
        Ok(i + 1)
    }

    fn adaptive_load_global(
        &mut self,
        depth: usize,
        code: &CodeObject,
        i: usize,
        oparg: u8,
    ) -> Result<usize> {
        let q = quickened(code)?;
        let offset = offset_from_oparg_and_nexti(oparg as i32, i as i32 + 1) as usize;
        let (original_oparg, counter, index) = adaptive_parts(q, offset)?;
        let name = name_of(code, original_oparg as u32)?;
        if counter == 0 {
            let globals = self.call_stack[depth].globals.clone();
            let builtins = self.call_stack[depth].builtins.clone();
            if specialize::specialize_load_global(q, i, offset, &globals, &builtins, &name, &mut self.stats) {
                return Ok(i);
            }
        } else {
            defer(q, offset, original_oparg, counter, index);
            self.stats.deferred += 1;
        }
        self.op_load_global(depth, &name)?;
        Ok(i + 1)
    }

    fn adaptive_binary_subscr(
        &mut self,
        depth: usize,
        code: &CodeObject,
        i: usize,
        oparg: u8,
    ) -> Result<usize> {
        let q = quickened(code)?;
        let offset = offset_from_oparg_and_nexti(oparg as i32, i as i32 + 1) as usize;
        let (original_oparg, counter, index) = adaptive_parts(q, offset)?;
        if counter == 0 {
            let subscript = self.peek_operand(depth, 0)?;
            let container = self.peek_operand(depth, 1)?;
            if specialize::specialize_binary_subscr(q, i, offset, &container, &subscript, &mut self.stats) {
                return Ok(i);
            }
        } else {
            defer(q, offset, original_oparg, counter, index);
            self.stats.deferred += 1;
        }
        self.op_binary_subscr(depth)?;
        Ok(i + 1)
    }

    fn adaptive_call(
        &mut self,
        depth: usize,
        code: &CodeObject,
        i: usize,
        oparg: u8,
    ) -> Result<usize> {
        let q = quickened(code)?;
        let offset = offset_from_oparg_and_nexti(oparg as i32, i as i32 + 1) as usize;
        let (original_oparg, counter, index) = adaptive_parts(q, offset)?;
        let argc = original_oparg as usize;
        if counter == 0 {
            let callee = self.peek_operand(depth, argc)?;
            if specialize::specialize_call(q, i, offset, &callee, argc as u16, &mut self.stats) {
                return Ok(i);
            }
        } else {
            defer(q, offset, original_oparg, counter, index);
            self.stats.deferred += 1;
        }
        self.op_call(depth, argc)?;
        Ok(i + 1)
    }

    // Specialized execution: re-validate the guard every time; a miss falls
    // back to the generic operation for this call only, with the adaptive
    // counter deciding when to attempt respecialization.

    fn exec_load_attr_instance(
        &mut self,
        depth: usize,
        code: &CodeObject,
        i: usize,
        oparg: u8,
    ) -> Result<usize> {
        let q = quickened(code)?;
        let offset = offset_from_oparg_and_nexti(oparg as i32, i as i32 + 1) as usize;
        let (original_oparg, counter, index) = adaptive_parts(q, offset)?;
        let CacheEntry::Attr { shape_version } = q.entry(offset + 1) else {
            bail!("attribute payload expected at cache offset {}", offset + 1);
        };
        let owner = self.peek_operand(depth, 0)?;
        if let Value::Instance(instance) = &owner
            && instance.shape.version() == shape_version
        {
            self.stats.hit += 1;
            self.pop_operand(depth)?;
            let value = instance.field(index);
            self.push_operand(depth, value)?;
            return Ok(i + 1);
        }
        self.stats.deopt += 1;
        let name = name_of(code, original_oparg as u32)?;
        if counter == 0 {
            let before = q.instruction(i).raw();
            if specialize::specialize_load_attr(q, i, offset, &owner, &name, &mut self.stats)
                && q.instruction(i).raw() != before
            {
                return Ok(i);
            }
        } else {
            defer(q, offset, original_oparg, counter, index);
            self.stats.miss += 1;
        }
        self.op_load_attr(depth, &name)?;
        Ok(i + 1)
    }

    fn exec_load_global_specialized(
        &mut self,
        depth: usize,
        code: &CodeObject,
        i: usize,
        oparg: u8,
        opcode: Opcode,
    ) -> Result<usize> {
        let q = quickened(code)?;
        let offset = offset_from_oparg_and_nexti(oparg as i32, i as i32 + 1) as usize;
        let (original_oparg, counter, index) = adaptive_parts(q, offset)?;
        let CacheEntry::Global {
            globals_version,
            builtins_version,
        } = q.entry(offset + 1)
        else {
            bail!("global payload expected at cache offset {}", offset + 1);
        };
        let globals = self.call_stack[depth].globals.clone();
        let builtins = self.call_stack[depth].builtins.clone();
        let guard_ok = match opcode {
            Opcode::LoadGlobalModule => globals.version() == globals_version,
            _ => {
                globals.version() == globals_version
                    && builtins.version() as u16 == builtins_version
            }
        };
        if guard_ok {
            let source = if opcode == Opcode::LoadGlobalModule {
                &globals
            } else {
                &builtins
            };
            if let Some(value) = source.get_slot(index) {
                self.stats.hit += 1;
                self.push_operand(depth, value)?;
                return Ok(i + 1);
            }
        }
        self.stats.deopt += 1;
        let name = name_of(code, original_oparg as u32)?;
        if counter == 0 {
            let before = q.instruction(i).raw();
            if specialize::specialize_load_global(q, i, offset, &globals, &builtins, &name, &mut self.stats)
                && q.instruction(i).raw() != before
            {
                return Ok(i);
            }
        } else {
            defer(q, offset, original_oparg, counter, index);
            self.stats.miss += 1;
        }
        self.op_load_global(depth, &name)?;
        Ok(i + 1)
    }

    fn exec_binary_subscr_specialized(
        &mut self,
        depth: usize,
        code: &CodeObject,
        i: usize,
        oparg: u8,
        opcode: Opcode,
    ) -> Result<usize> {
        let q = quickened(code)?;
        let offset = offset_from_oparg_and_nexti(oparg as i32, i as i32 + 1) as usize;
        let (original_oparg, counter, index) = adaptive_parts(q, offset)?;
        let subscript = self.peek_operand(depth, 0)?;
        let container = self.peek_operand(depth, 1)?;
        let fast = match (opcode, &container, &subscript) {
            (Opcode::BinarySubscrList, Value::List(list), Value::Int(n)) => {
                usize::try_from(*n).ok().and_then(|n| list.get(n))
            }
            (Opcode::BinarySubscrMap, Value::Map(map), Value::Str(key)) => map.get(key),
            _ => None,
        };
        if let Some(value) = fast {
            self.stats.hit += 1;
            self.pop_operand(depth)?;
            self.pop_operand(depth)?;
            self.push_operand(depth, value)?;
            return Ok(i + 1);
        }
        self.stats.deopt += 1;
        if counter == 0 {
            let before = q.instruction(i).raw();
            if specialize::specialize_binary_subscr(q, i, offset, &container, &subscript, &mut self.stats)
                && q.instruction(i).raw() != before
            {
                return Ok(i);
            }
        } else {
            defer(q, offset, original_oparg, counter, index);
            self.stats.miss += 1;
        }
        self.op_binary_subscr(depth)?;
        Ok(i + 1)
    }

    fn exec_call_native(
        &mut self,
        depth: usize,
        code: &CodeObject,
        i: usize,
        oparg: u8,
    ) -> Result<usize> {
        let q = quickened(code)?;
        let offset = offset_from_oparg_and_nexti(oparg as i32, i as i32 + 1) as usize;
        let (original_oparg, counter, index) = adaptive_parts(q, offset)?;
        let CacheEntry::Call {
            callee_version,
            arity,
        } = q.entry(offset + 1)
        else {
            bail!("call payload expected at cache offset {}", offset + 1);
        };
        let argc = original_oparg as usize;
        let callee = self.peek_operand(depth, argc)?;
        if let Value::Native(native) = &callee
            && native.version() == callee_version
            && argc as u16 == arity
        {
            self.stats.hit += 1;
            let mut args = vec![Value::Nil; argc];
            for slot in args.iter_mut().rev() {
                *slot = self.pop_operand(depth)?;
            }
            self.pop_operand(depth)?;
            let result = (native.f)(&args)?;
            self.push_operand(depth, result)?;
            return Ok(i + 1);
        }
        self.stats.deopt += 1;
        if counter == 0 {
            let before = q.instruction(i).raw();
            if specialize::specialize_call(q, i, offset, &callee, argc as u16, &mut self.stats)
                && q.instruction(i).raw() != before
            {
                return Ok(i);
            }
        } else {
            defer(q, offset, original_oparg, counter, index);
            self.stats.miss += 1;
        }
        self.op_call(depth, argc)?;
        Ok(i + 1)
    }

    // Generic operations, shared by plain, adaptive and deoptimized paths.

    fn load_local(&self, depth: usize, index: usize, code: &CodeObject) -> Result<Value> {
        match self.call_stack[depth].slots(&self.arena).get(index) {
            Some(Some(value)) => Ok(value.clone()),
            _ => bail!(
                "local '{}' referenced before assignment",
                code.localsplus_names
                    .get(index)
                    .map(|n| n.as_ref())
                    .unwrap_or("?")
            ),
        }
    }

    fn store_local(&mut self, depth: usize, index: usize, value: Value, code: &CodeObject) -> Result<()> {
        if index >= code.nlocalsplus() {
            bail!("local slot {index} out of range in {}", code.name);
        }
        self.call_stack[depth].slots_mut(&mut self.arena)[index] = Some(value);
        Ok(())
    }

    fn local_cell(&self, depth: usize, index: usize, code: &CodeObject) -> Result<Arc<CellObject>> {
        match self.call_stack[depth].slots(&self.arena).get(index) {
            Some(Some(Value::Cell(cell))) => Ok(cell.clone()),
            _ => bail!("slot {index} of {} does not hold a cell", code.name),
        }
    }

    fn op_load_global(&mut self, depth: usize, name: &str) -> Result<()> {
        let value = {
            let record = &self.call_stack[depth];
            record
                .globals
                .get(name)
                .or_else(|| record.builtins.get(name))
                .ok_or_else(|| anyhow!("name '{name}' is not defined"))?
        };
        self.push_operand(depth, value)
    }

    fn op_load_attr(&mut self, depth: usize, name: &str) -> Result<()> {
        let owner = self.pop_operand(depth)?;
        let value = match &owner {
            Value::Instance(instance) => instance
                .get_attr(name)
                .ok_or_else(|| anyhow!("instance has no attribute '{name}'"))?,
            Value::Map(map) => map
                .get(name)
                .ok_or_else(|| anyhow!("map has no key '{name}'"))?,
            other => bail!("{} has no attributes", other.type_name()),
        };
        self.push_operand(depth, value)
    }

    fn op_store_attr(&mut self, depth: usize, name: &str) -> Result<()> {
        let owner = self.pop_operand(depth)?;
        let value = self.pop_operand(depth)?;
        match &owner {
            Value::Instance(instance) => {
                if !instance.set_attr(name, value) {
                    bail!("instance has no attribute '{name}'");
                }
            }
            Value::Map(map) => map.insert(name, value),
            other => bail!("cannot set attributes on {}", other.type_name()),
        }
        Ok(())
    }

    fn op_binary_subscr(&mut self, depth: usize) -> Result<()> {
        let subscript = self.pop_operand(depth)?;
        let container = self.pop_operand(depth)?;
        let value = match (&container, &subscript) {
            (Value::List(list), Value::Int(n)) => usize::try_from(*n)
                .ok()
                .and_then(|n| list.get(n))
                .ok_or_else(|| anyhow!("list index {n} out of range"))?,
            (Value::Map(map), Value::Str(key)) => map
                .get(key)
                .ok_or_else(|| anyhow!("map has no key '{key}'"))?,
            (c, s) => bail!(
                "cannot index {} with {}",
                c.type_name(),
                s.type_name()
            ),
        };
        self.push_operand(depth, value)
    }

    fn op_binary_add(&mut self, depth: usize) -> Result<()> {
        let rhs = self.pop_operand(depth)?;
        let lhs = self.pop_operand(depth)?;
        let value = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
            (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
            (Value::Int(a), Value::Float(b)) => Value::Float(*a as f64 + b),
            (Value::Float(a), Value::Int(b)) => Value::Float(a + *b as f64),
            (Value::Str(a), Value::Str(b)) => {
                let mut joined = String::with_capacity(a.len() + b.len());
                joined.push_str(a);
                joined.push_str(b);
                Value::Str(Arc::from(joined.as_str()))
            }
            (a, b) => bail!("cannot add {} and {}", a.type_name(), b.type_name()),
        };
        self.push_operand(depth, value)
    }

    fn op_compare_lt(&mut self, depth: usize) -> Result<()> {
        let rhs = self.pop_operand(depth)?;
        let lhs = self.pop_operand(depth)?;
        let ordered = match (&lhs, &rhs) {
            (Value::Int(a), Value::Int(b)) => a < b,
            (Value::Float(a), Value::Float(b)) => a < b,
            (Value::Int(a), Value::Float(b)) => (*a as f64) < *b,
            (Value::Float(a), Value::Int(b)) => *a < *b as f64,
            (Value::Str(a), Value::Str(b)) => a < b,
            (a, b) => bail!("cannot order {} and {}", a.type_name(), b.type_name()),
        };
        self.push_operand(depth, Value::Bool(ordered))
    }

    fn op_get_iter(&mut self, depth: usize) -> Result<()> {
        let value = self.pop_operand(depth)?;
        let iter = match &value {
            Value::List(list) => IterObject::new(list.snapshot()),
            Value::Map(map) => IterObject::new(map.keys().into_iter().map(Value::Str).collect()),
            Value::Str(s) => {
                IterObject::new(s.chars().map(|c| Value::str(&c.to_string())).collect())
            }
            Value::Iter(iter) => iter.clone(),
            other => bail!("{} is not iterable", other.type_name()),
        };
        self.push_operand(depth, Value::Iter(iter))
    }

    fn op_call(&mut self, depth: usize, argc: usize) -> Result<()> {
        let mut args = vec![Value::Nil; argc];
        for slot in args.iter_mut().rev() {
            *slot = self.pop_operand(depth)?;
        }
        let callee = self.pop_operand(depth)?;
        let result = self.call_value(&callee, &args)?;
        self.push_operand(depth, result)
    }
}
