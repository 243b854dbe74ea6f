use super::aarch64::Aarch64Backend;
use super::assembler::Assembler;
use super::backend::{LoweredModule, TargetBackend};
use super::x86_64::X86_64Backend;
/// Public API for code generation
///
/// Lowers verified IR modules to machine code for a target machine.
use crate::error::{Error, Result};
use crate::ir::{verifier::stack_depths, IRModule, Verifier};
use crate::target::{Arch, TargetMachine};
use tracing::debug;

/// Backend for an architecture, if one exists.
pub fn backend_for(arch: Arch) -> Option<Box<dyn TargetBackend>> {
    match arch {
        Arch::X86_64 => Some(Box::new(X86_64Backend)),
        Arch::Aarch64 => Some(Box::new(Aarch64Backend)),
        Arch::Riscv64 => None,
    }
}

/// Lower every defined function of `module` for `machine`.
///
/// The module is verified first; lowering never sees a malformed body.
pub fn lower_module(module: &IRModule, machine: &TargetMachine) -> Result<LoweredModule> {
    let backend = backend_for(machine.arch()).ok_or_else(|| Error::NoBackend(machine.triple_string()))?;

    let result = Verifier::new().verify(module);
    if !result.is_valid() {
        return Err(Error::InvalidModule { module: module.name.clone(), report: result.report() });
    }

    let mut asm = Assembler::new();
    asm.directive(backend_header(backend.arch()));
    for function in module.functions.iter().filter(|f| !f.is_declaration()) {
        let depths = stack_depths(function)
            .map_err(|e| Error::InvalidModule { module: module.name.clone(), report: e.to_string() })?;
        asm.begin_function(&function.name, function.linkage);
        backend.lower_function(&mut asm, module, function, &depths);
        asm.end_function();
    }
    let lowered = asm.finish();

    debug!(
        module = %module.name,
        arch = backend.arch().as_str(),
        functions = lowered.functions.len(),
        code_bytes = lowered.code.len(),
        relocations = lowered.relocations.len(),
        "lowered module"
    );
    Ok(lowered)
}

fn backend_header(arch: Arch) -> &'static str {
    match arch {
        Arch::X86_64 => "\t.intel_syntax noprefix\n\t.text",
        _ => "\t.text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IRFunction, IRInstruction::*};

    fn machine(triple: &str) -> TargetMachine {
        TargetMachine::new(format!("native -mtriple={}", triple).parse().unwrap())
    }

    fn module() -> IRModule {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::declare("__rt_alloc", 1));
        module.add_function(IRFunction::new("alloc8", 0).with_body(vec![Push(8), Call("__rt_alloc".into(), 1), Return]));
        module.add_function(IRFunction::new("twice", 0).with_body(vec![Call("alloc8".into(), 0), Return]));
        module
    }

    #[test]
    fn lowers_for_both_backends() {
        for triple in ["x86_64-unknown-linux-gnu", "aarch64-unknown-linux-gnu"] {
            let lowered = lower_module(&module(), &machine(triple)).unwrap();
            assert_eq!(lowered.functions.len(), 2);
            assert_eq!(lowered.functions[1].offset, lowered.functions[0].size);
            // only the declared runtime function needs a relocation
            assert_eq!(lowered.relocations.len(), 1);
            assert_eq!(lowered.relocations[0].symbol, "__rt_alloc");
            assert!(lowered.listing.iter().any(|line| line == "alloc8:"));
        }
    }

    #[test]
    fn riscv_has_no_backend() {
        let err = lower_module(&module(), &machine("riscv64-unknown-linux-gnu")).unwrap_err();
        assert!(matches!(err, Error::NoBackend(ref triple) if triple == "riscv64-unknown-linux-gnu"));
    }

    #[test]
    fn malformed_modules_are_rejected() {
        let mut module = IRModule::new("bad");
        module.add_function(IRFunction::new("f", 0).with_body(vec![Add, Return]));
        let err = lower_module(&module, &machine("x86_64-unknown-linux-gnu")).unwrap_err();
        assert!(err.to_string().contains("underflows"));
    }
}
