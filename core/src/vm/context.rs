//! Versioned namespaces for globals and builtins.
//!
//! A namespace assigns each key a stable slot on first insert and bumps its
//! version only when the key space changes (insert of a new key, delete).
//! Value updates through an existing key keep the version, so a global-load
//! cache that resolved a slot stays valid across plain reassignment.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::val::{FunctionObject, NativeFunction, Value};

#[derive(Debug)]
pub struct Namespace {
    entries: RefCell<Vec<(Arc<str>, Option<Value>)>>,
    index: RefCell<FxHashMap<Arc<str>, u32>>,
    version: Cell<u32>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    pub fn new() -> Namespace {
        Namespace {
            entries: RefCell::new(Vec::new()),
            index: RefCell::new(FxHashMap::default()),
            version: Cell::new(1),
        }
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    fn bump_version(&self) {
        // Zero is reserved so a blank cache record can never match.
        let next = self.version.get().wrapping_add(1);
        self.version.set(if next == 0 { 1 } else { next });
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.index.borrow().get(name).map(|&i| i as usize)
    }

    /// Slot a cache record can guard on; `None` once the key count has
    /// outgrown the record's slot width, so those keys stay uncacheable.
    pub fn slot_of(&self, name: &str) -> Option<u16> {
        u16::try_from(*self.index.borrow().get(name)?).ok()
    }

    /// Slot read; `None` for a deleted (tombstoned) entry.
    pub fn get_slot(&self, slot: u16) -> Option<Value> {
        self.entries.borrow().get(slot as usize)?.1.clone()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let i = self.position(name)?;
        self.entries.borrow().get(i)?.1.clone()
    }

    pub fn set(&self, name: &str, value: Value) {
        if let Some(i) = self.position(name) {
            let revived = self.entries.borrow_mut()[i].1.replace(value).is_none();
            if revived {
                // Reviving a tombstone changes key visibility, same as an insert.
                self.bump_version();
            }
            return;
        }
        let key: Arc<str> = Arc::from(name);
        let slot = self.entries.borrow().len() as u32;
        self.entries.borrow_mut().push((key.clone(), Some(value)));
        self.index.borrow_mut().insert(key, slot);
        self.bump_version();
    }

    /// Tombstones the entry; the slot stays assigned to the key.
    pub fn remove(&self, name: &str) -> Option<Value> {
        let i = self.position(name)?;
        let old = self.entries.borrow_mut()[i].1.take();
        if old.is_some() {
            self.bump_version();
        }
        old
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().iter().filter(|(_, v)| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Globals/builtins pair shared by every function defined in one module.
#[derive(Debug, Default)]
pub struct VmContext {
    pub globals: Arc<Namespace>,
    pub builtins: Arc<Namespace>,
}

impl VmContext {
    pub fn new() -> VmContext {
        VmContext::default()
    }

    pub fn define_native(&self, name: &str, arity: u16, f: crate::val::NativeFn) -> Arc<NativeFunction> {
        let native = NativeFunction::new(name, arity, f);
        self.builtins.set(name, Value::Native(native.clone()));
        trace!(target: "quill::vm::frames", name, "native registered");
        native
    }

    /// Build a function bound to this context's namespaces.
    pub fn function(&self, code: Arc<super::code::CodeObject>) -> Arc<FunctionObject> {
        Arc::new(FunctionObject {
            name: code.name.clone(),
            code,
            globals: self.globals.clone(),
            builtins: self.builtins.clone(),
            closure: Vec::new(),
        })
    }
}
