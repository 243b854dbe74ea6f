/// Native code modules: artifact emission and lazy in-process execution
///
/// - `ir`: the module representation handed over by a code generator
/// - `target`: target strings and target machines
/// - `codegen`: lowering to x86-64 and AArch64 machine code
/// - `emit`: object, assembly, textual IR and bitcode artifacts
/// - `jit`: execution engine and symbol resolution
/// - `module`: runtime modules, the native module wrapper and metadata modules
/// - `registry`: named entry points for drivers
pub mod codegen;
pub mod emit;
pub mod error;
pub mod ir;
pub mod jit;
pub mod module;
pub mod registry;
pub mod symbol;
pub mod target;

pub use error::{Error, Result};
pub use module::{GeneratedModule, Module, NativeModule, PackedFunc, Value};
