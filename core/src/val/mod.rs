//! Minimal refcounted value model.
//!
//! Just enough object kinds to exercise slot acquire/release in frames and
//! every specialization family: shaped instances for attribute caches,
//! versioned namespaces for global caches, native functions for call caches,
//! lists/maps for subscript caches.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::vm::{ActivationRecord, CodeObject, FrameState, Namespace};

pub type NativeFn = fn(&[Value]) -> anyhow::Result<Value>;

/// A runtime value. Scalars are inline; everything else is an `Arc` so that
/// frame slots model acquire/release as refcount traffic.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<ListObject>),
    Map(Arc<MapObject>),
    Instance(Arc<Instance>),
    Function(Arc<FunctionObject>),
    Native(Arc<NativeFunction>),
    Generator(Arc<GeneratorObject>),
    Cell(Arc<CellObject>),
    Iter(Arc<IterObject>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Arc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(ListObject::new(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Instance(_) => "instance",
            Value::Function(_) => "function",
            Value::Native(_) => "native",
            Value::Generator(_) => "generator",
            Value::Cell(_) => "cell",
            Value::Iter(_) => "iterator",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil | Value::Bool(false) => false,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => l.len() != 0,
            _ => true,
        }
    }
}

// Scalars compare by value, objects by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            (Value::Generator(a), Value::Generator(b)) => Arc::ptr_eq(a, b),
            (Value::Cell(a), Value::Cell(b)) => Arc::ptr_eq(a, b),
            (Value::Iter(a), Value::Iter(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Compile-time constant, the serializable half of the value model. The
/// compiler boundary ships these; the dispatch loop materializes them into
/// [`Value`]s on `LoadConst`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
}

impl Const {
    pub fn to_value(&self) -> Value {
        match self {
            Const::Nil => Value::Nil,
            Const::Bool(b) => Value::Bool(*b),
            Const::Int(n) => Value::Int(*n),
            Const::Float(f) => Value::Float(*f),
            Const::Str(s) => Value::Str(s.clone()),
        }
    }
}

static NEXT_SHAPE_VERSION: AtomicU32 = AtomicU32::new(1);
static NEXT_CALLABLE_VERSION: AtomicU32 = AtomicU32::new(1);

/// Field layout shared by instances. Each distinct shape gets a process-wide
/// version number; attribute caches guard on it instead of walking the name
/// table.
#[derive(Debug)]
pub struct Shape {
    version: u32,
    names: Vec<Arc<str>>,
    index: FxHashMap<Arc<str>, u16>,
}

impl Shape {
    pub fn new(names: &[&str]) -> Arc<Shape> {
        let names: Vec<Arc<str>> = names.iter().map(|n| Arc::from(*n)).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u16))
            .collect();
        Arc::new(Shape {
            version: NEXT_SHAPE_VERSION.fetch_add(1, Ordering::Relaxed),
            names,
            index,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn slot_of(&self, name: &str) -> Option<u16> {
        self.index.get(name).copied()
    }

    pub fn field_count(&self) -> usize {
        self.names.len()
    }
}

#[derive(Debug)]
pub struct Instance {
    pub shape: Arc<Shape>,
    fields: RefCell<Vec<Value>>,
}

impl Instance {
    pub fn new(shape: Arc<Shape>, fields: Vec<Value>) -> Arc<Instance> {
        debug_assert_eq!(fields.len(), shape.field_count());
        Arc::new(Instance {
            shape,
            fields: RefCell::new(fields),
        })
    }

    pub fn field(&self, slot: u16) -> Value {
        self.fields.borrow()[slot as usize].clone()
    }

    pub fn set_field(&self, slot: u16, value: Value) {
        self.fields.borrow_mut()[slot as usize] = value;
    }

    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.shape.slot_of(name).map(|slot| self.field(slot))
    }

    /// Returns false when the shape has no such field.
    pub fn set_attr(&self, name: &str, value: Value) -> bool {
        match self.shape.slot_of(name) {
            Some(slot) => {
                self.set_field(slot, value);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ListObject {
    items: RefCell<Vec<Value>>,
}

impl ListObject {
    pub fn new(items: Vec<Value>) -> Arc<ListObject> {
        Arc::new(ListObject {
            items: RefCell::new(items),
        })
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.borrow().get(index).cloned()
    }

    pub fn push(&self, value: Value) {
        self.items.borrow_mut().push(value);
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }
}

#[derive(Debug, Default)]
pub struct MapObject {
    entries: RefCell<FxHashMap<Arc<str>, Value>>,
}

impl MapObject {
    pub fn new() -> Arc<MapObject> {
        Arc::new(MapObject::default())
    }

    pub fn insert(&self, key: &str, value: Value) {
        self.entries.borrow_mut().insert(Arc::from(key), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<Arc<str>> {
        self.entries.borrow().keys().cloned().collect()
    }
}

/// Closure cell. Empty until first store, like an unbound local.
#[derive(Debug, Default)]
pub struct CellObject {
    value: RefCell<Option<Value>>,
}

impl CellObject {
    pub fn new(value: Option<Value>) -> Arc<CellObject> {
        Arc::new(CellObject {
            value: RefCell::new(value),
        })
    }

    pub fn get(&self) -> Option<Value> {
        self.value.borrow().clone()
    }

    pub fn set(&self, value: Option<Value>) {
        *self.value.borrow_mut() = value;
    }
}

/// Host function. The version is a process-wide identity that call caches
/// guard on.
pub struct NativeFunction {
    pub name: Arc<str>,
    pub arity: u16,
    version: u32,
    pub f: NativeFn,
}

impl NativeFunction {
    pub fn new(name: &str, arity: u16, f: NativeFn) -> Arc<NativeFunction> {
        Arc::new(NativeFunction {
            name: Arc::from(name),
            arity,
            version: NEXT_CALLABLE_VERSION.fetch_add(1, Ordering::Relaxed),
            f,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("version", &self.version)
            .finish()
    }
}

#[derive(Debug)]
pub struct FunctionObject {
    pub name: Arc<str>,
    pub code: Arc<CodeObject>,
    pub globals: Arc<Namespace>,
    pub builtins: Arc<Namespace>,
    pub closure: Vec<Arc<CellObject>>,
}

/// Snapshot iterator produced by `GetIter`.
#[derive(Debug)]
pub struct IterObject {
    items: Vec<Value>,
    pos: Cell<usize>,
}

impl IterObject {
    pub fn new(items: Vec<Value>) -> Arc<IterObject> {
        Arc::new(IterObject {
            items,
            pos: Cell::new(0),
        })
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> Option<Value> {
        let i = self.pos.get();
        let item = self.items.get(i).cloned()?;
        self.pos.set(i + 1);
        Some(item)
    }
}

/// A generator owns its activation record while suspended; the record moves
/// onto the VM call stack for the duration of each resume.
#[derive(Debug)]
pub struct GeneratorObject {
    pub name: Arc<str>,
    pub(crate) record: RefCell<Option<ActivationRecord>>,
    pub(crate) finished: Cell<bool>,
}

impl GeneratorObject {
    pub(crate) fn new(name: Arc<str>, record: ActivationRecord) -> Arc<GeneratorObject> {
        Arc::new(GeneratorObject {
            name,
            record: RefCell::new(Some(record)),
            finished: Cell::new(false),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// None while the generator is running on the VM stack.
    pub fn state(&self) -> Option<FrameState> {
        self.record.borrow().as_ref().map(|r| r.state())
    }
}
