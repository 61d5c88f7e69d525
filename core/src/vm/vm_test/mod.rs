pub(super) use std::sync::Arc;

pub(super) use crate::{
    val::{Const, Instance, Shape, Value},
    vm::{
        CO_FAST_CELL, CO_FAST_FREE, CO_FAST_LOCAL, CO_GENERATOR, CodeObject, CodeUnit, FrameState,
        GenExit, Opcode, QUICKENING_WARMUP_DELAY, Vm, VmContext,
    },
};

pub(super) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Hand-assembles code objects for the scenarios below.
pub(super) struct CodeBuilder {
    name: String,
    units: Vec<CodeUnit>,
    consts: Vec<Const>,
    names: Vec<Arc<str>>,
    localsplus_names: Vec<Arc<str>>,
    localsplus_kinds: Vec<u8>,
    argcount: u32,
    stacksize: u32,
    flags: u32,
}

impl CodeBuilder {
    pub(super) fn new(name: &str) -> CodeBuilder {
        CodeBuilder {
            name: name.to_string(),
            units: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            localsplus_names: Vec::new(),
            localsplus_kinds: Vec::new(),
            argcount: 0,
            stacksize: 8,
            flags: 0,
        }
    }

    pub(super) fn op(mut self, op: Opcode, arg: u8) -> Self {
        self.units.push(CodeUnit::new(op, arg));
        self
    }

    pub(super) fn load_const(mut self, c: Const) -> Self {
        let idx = match self.consts.iter().position(|k| *k == c) {
            Some(i) => i,
            None => {
                self.consts.push(c);
                self.consts.len() - 1
            }
        };
        self.units.push(CodeUnit::new(Opcode::LoadConst, idx as u8));
        self
    }

    /// Emit an instruction whose operand is a name-table index.
    pub(super) fn name_op(mut self, op: Opcode, name: &str) -> Self {
        let idx = match self.names.iter().position(|n| n.as_ref() == name) {
            Some(i) => i,
            None => {
                self.names.push(Arc::from(name));
                self.names.len() - 1
            }
        };
        self.units.push(CodeUnit::new(op, idx as u8));
        self
    }

    pub(super) fn arg(mut self, name: &str) -> Self {
        self.localsplus_names.push(Arc::from(name));
        self.localsplus_kinds.push(CO_FAST_LOCAL);
        self.argcount += 1;
        self
    }

    pub(super) fn cell_arg(mut self, name: &str) -> Self {
        self.localsplus_names.push(Arc::from(name));
        self.localsplus_kinds.push(CO_FAST_CELL);
        self.argcount += 1;
        self
    }

    pub(super) fn local(mut self, name: &str) -> Self {
        self.localsplus_names.push(Arc::from(name));
        self.localsplus_kinds.push(CO_FAST_LOCAL);
        self
    }

    pub(super) fn free(mut self, name: &str) -> Self {
        self.localsplus_names.push(Arc::from(name));
        self.localsplus_kinds.push(CO_FAST_FREE);
        self
    }

    pub(super) fn stacksize(mut self, n: u32) -> Self {
        self.stacksize = n;
        self
    }

    pub(super) fn generator(mut self) -> Self {
        self.flags |= CO_GENERATOR;
        self
    }

    pub(super) fn build(self) -> Arc<CodeObject> {
        Arc::new(CodeObject::new(
            &self.name,
            self.units,
            self.consts,
            self.names,
            self.localsplus_names,
            self.localsplus_kinds,
            self.argcount,
            self.stacksize,
            self.flags,
        ))
    }
}

/// Run enough calls that the next one executes quickened code.
pub(super) fn warm_up(vm: &mut Vm, func: &Arc<crate::val::FunctionObject>, args: &[Value]) {
    for _ in 0..QUICKENING_WARMUP_DELAY {
        vm.call_function(func, args).unwrap();
    }
    assert!(func.code.quickened().is_some(), "warmup did not quicken");
}

mod end_to_end;
mod promotion;
mod quicken_flow;
mod retarget;
