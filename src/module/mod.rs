/// Runtime modules and the function lookup protocol
///
/// A [`Module`] is a shared handle to a [`ModuleNode`]. Callers ask a module for a
/// named function and get back a [`PackedFunc`] taking and returning [`Value`]s.
/// Modules form a one-directional import graph that lookups may search.
///
/// ## Module Structure
/// - `native`: modules holding an IR module and a lazily built JIT engine
/// - `metadata`: composite modules carrying metadata or a function registry
mod metadata;
mod native;

pub use metadata::{
    codegen_blob, create_cpp_metadata_module, create_crt_metadata_module, Metadata, MetadataModule, RuntimeConfig, RuntimeKind,
};
pub use native::{GeneratedModule, NativeModule};

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Dynamically typed argument or return value of a [`PackedFunc`].
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Module(Module),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Module(_) => "module",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Bool(value) => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            Value::Int(value) => Some(*value != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&Module> {
        match self {
            Value::Module(module) => Some(module),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(value) => write!(f, "Bool({})", value),
            Value::Int(value) => write!(f, "Int({})", value),
            Value::Str(text) => write!(f, "Str({:?})", text),
            Value::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Module(module) => write!(f, "Module({})", module.type_key()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

type PackedBody = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

/// Type-erased callable returned by function lookups.
#[derive(Clone)]
pub struct PackedFunc {
    name: Arc<str>,
    body: Arc<PackedBody>,
}

impl PackedFunc {
    pub fn new(name: &str, body: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self { name: name.into(), body: Arc::new(body) }
    }

    /// Function ignoring its arguments and returning `value`.
    pub fn constant(name: &str, value: Value) -> Self {
        Self::new(name, move |_| Ok(value.clone()))
    }

    /// Wrap compiled code at `address` taking `arity` 64-bit integer arguments.
    /// `owner` is kept alive as long as the function.
    ///
    /// # Safety
    ///
    /// `address` must be the entry of a C-ABI function with exactly `arity` integer
    /// parameters returning a 64-bit integer, valid while `owner` is alive.
    pub unsafe fn native(name: &str, address: usize, arity: usize, owner: Module) -> Self {
        let function = name.to_string();
        Self::new(name, move |args| {
            let _owner = &owner;
            if args.len() != arity {
                return Err(Error::argument(&function, format!("expected {} arguments, got {}", arity, args.len())));
            }
            let mut words = [0i64; 6];
            for (slot, arg) in words.iter_mut().zip(args) {
                *slot = arg
                    .as_int()
                    .ok_or_else(|| Error::argument(&function, format!("expected int argument, got {}", arg.type_name())))?;
            }
            Ok(Value::Int(invoke(address, arity, &words)))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.body)(args)
    }
}

impl fmt::Debug for PackedFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackedFunc({})", self.name)
    }
}

fn invoke(address: usize, arity: usize, w: &[i64; 6]) -> i64 {
    unsafe {
        match arity {
            0 => std::mem::transmute::<usize, extern "C" fn() -> i64>(address)(),
            1 => std::mem::transmute::<usize, extern "C" fn(i64) -> i64>(address)(w[0]),
            2 => std::mem::transmute::<usize, extern "C" fn(i64, i64) -> i64>(address)(w[0], w[1]),
            3 => std::mem::transmute::<usize, extern "C" fn(i64, i64, i64) -> i64>(address)(w[0], w[1], w[2]),
            4 => std::mem::transmute::<usize, extern "C" fn(i64, i64, i64, i64) -> i64>(address)(w[0], w[1], w[2], w[3]),
            5 => std::mem::transmute::<usize, extern "C" fn(i64, i64, i64, i64, i64) -> i64>(address)(
                w[0], w[1], w[2], w[3], w[4],
            ),
            _ => std::mem::transmute::<usize, extern "C" fn(i64, i64, i64, i64, i64, i64) -> i64>(address)(
                w[0], w[1], w[2], w[3], w[4], w[5],
            ),
        }
    }
}

/// Children of a module, searched by import-aware lookups.
#[derive(Default)]
pub struct Imports(RwLock<Vec<Module>>);

impl Imports {
    pub fn push(&self, child: Module) {
        self.0.write().push(child);
    }

    pub fn snapshot(&self) -> Vec<Module> {
        self.0.read().clone()
    }
}

/// Behaviour shared by every kind of runtime module.
pub trait ModuleNode: Send + Sync + 'static {
    fn type_key(&self) -> &'static str;

    /// Look up `name` in this module only. `this` is the handle owning `self`, for
    /// functions that must keep the module alive.
    fn get_function(&self, name: &str, this: &Module) -> Result<Option<PackedFunc>>;

    fn imports(&self) -> &Imports;

    fn save_to_file(&self, _path: &Path, format: &str) -> Result<()> {
        Err(Error::UnsupportedFormat(format.to_string()))
    }

    fn get_source(&self, format: &str) -> Result<String> {
        Err(Error::UnsupportedFormat(format.to_string()))
    }

    fn save_to_binary(&self) -> Result<Vec<u8>> {
        Err(Error::BinarySerializationUnsupported)
    }

    fn implements_function(&self, _name: &str) -> bool {
        false
    }

    /// Host address of a function this module provides to importing modules.
    fn symbol_address(&self, _name: &str) -> Option<usize> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a [`ModuleNode`].
#[derive(Clone)]
pub struct Module(Arc<dyn ModuleNode>);

impl Module {
    pub fn new(node: impl ModuleNode) -> Self {
        Module(Arc::new(node))
    }

    pub fn type_key(&self) -> &'static str {
        self.0.type_key()
    }

    /// Look up `name` here and, when `query_imports` is set, depth-first through
    /// imported modules.
    pub fn get_function(&self, name: &str, query_imports: bool) -> Result<Option<PackedFunc>> {
        if let Some(function) = self.0.get_function(name, self)? {
            return Ok(Some(function));
        }
        if query_imports {
            for child in self.imports() {
                if let Some(function) = child.get_function(name, true)? {
                    return Ok(Some(function));
                }
            }
        }
        Ok(None)
    }

    /// Import `child`. A child that already reaches this module through its own
    /// imports is rejected: lookups and JIT symbol resolution walk the import graph.
    pub fn import(&self, child: Module) -> Result<()> {
        if child.reaches(self) {
            return Err(Error::ImportCycle { module: self.type_key(), child: child.type_key() });
        }
        self.0.imports().push(child);
        Ok(())
    }

    fn reaches(&self, target: &Module) -> bool {
        self.ptr_eq(target) || self.imports().iter().any(|child| child.reaches(target))
    }

    pub fn imports(&self) -> Vec<Module> {
        self.0.imports().snapshot()
    }

    pub fn save_to_file(&self, path: &Path, format: &str) -> Result<()> {
        self.0.save_to_file(path, format)
    }

    pub fn get_source(&self, format: &str) -> Result<String> {
        self.0.get_source(format)
    }

    pub fn save_to_binary(&self) -> Result<Vec<u8>> {
        self.0.save_to_binary()
    }

    pub fn implements_function(&self, name: &str, query_imports: bool) -> bool {
        self.0.implements_function(name)
            || (query_imports && self.imports().iter().any(|child| child.implements_function(name, true)))
    }

    /// Address of `name` in this module or, failing that, in its imports.
    pub fn symbol_address(&self, name: &str) -> Option<usize> {
        self.0.symbol_address(name).or_else(|| self.imports().iter().find_map(|child| child.symbol_address(name)))
    }

    pub fn downcast_ref<T: ModuleNode>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Module) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Module({})", self.type_key())
    }
}
