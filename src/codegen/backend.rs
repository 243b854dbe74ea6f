/// Architecture-agnostic code generation backend trait
///
/// A backend lowers one IR function at a time into an [`Assembler`]; the shared driver
/// in `api` handles function layout, call fixups and data.
use super::assembler::Assembler;
use crate::ir::{IRFunction, IRModule, Linkage};
use crate::target::Arch;

/// 64-bit absolute relocation against a named function or global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub offset: usize,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweredFunction {
    pub name: String,
    pub linkage: Linkage,
    pub offset: usize,
    pub size: usize,
}

/// Machine code for a whole module.
#[derive(Debug, Clone, Default)]
pub struct LoweredModule {
    pub code: Vec<u8>,
    pub functions: Vec<LoweredFunction>,
    pub relocations: Vec<Relocation>,
    pub listing: Vec<String>,
}

impl LoweredModule {
    pub fn function(&self, name: &str) -> Option<&LoweredFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// High-level interface each target backend must implement.
pub trait TargetBackend {
    fn arch(&self) -> Arch;

    /// Lower one defined function. `depths[i]` is the evaluation-stack depth before
    /// instruction `i`, `None` when unreachable.
    fn lower_function(&self, asm: &mut Assembler, module: &IRModule, function: &IRFunction, depths: &[Option<usize>]);
}
