use super::{Arch, Os, Target, TargetError};
use crate::ir::{FlagBehavior, IRModule};

/// Resolved code generation target: the parsed [`Target`] plus its data layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMachine {
    target: Target,
    data_layout: String,
}

impl TargetMachine {
    pub fn new(target: Target) -> Self {
        let data_layout = data_layout_for(target.triple.arch, target.triple.os).to_string();
        Self { target, data_layout }
    }

    pub fn host() -> Result<Self, TargetError> {
        Ok(Self::new(Target::host()?))
    }

    /// Machine described by a module's stamped target metadata.
    pub fn from_module(module: &IRModule) -> Result<Self, TargetError> {
        Ok(Self::new(Target::from_module(module)?))
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn arch(&self) -> Arch {
        self.target.arch()
    }

    pub fn triple_string(&self) -> String {
        self.target.triple.to_string()
    }

    pub fn data_layout(&self) -> &str {
        &self.data_layout
    }

    pub fn has_backend(&self) -> bool {
        target_enabled(self.arch())
    }

    /// Stamp target metadata, triple, data layout and the debug-info module flags.
    pub fn stamp(&self, module: &mut IRModule) {
        self.target.stamp(module);
        module.target_triple = self.triple_string();
        module.data_layout = self.data_layout.clone();
        module.add_flag(FlagBehavior::Override, "Debug Info Version", 3);
        if self.target.is_darwin() {
            module.add_flag(FlagBehavior::Override, "Dwarf Version", 2);
        }
    }
}

pub fn data_layout_for(arch: Arch, os: Os) -> &'static str {
    match (arch, os) {
        (Arch::X86_64, Os::Darwin) => "e-m:o-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128",
        (Arch::X86_64, _) => "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128",
        (Arch::Aarch64, Os::Darwin) => "e-m:o-i64:64-i128:128-n32:64-S128",
        (Arch::Aarch64, _) => "e-m:e-i8:8:32-i16:16:32-i64:64-i128:128-n32:64-S128",
        (Arch::Riscv64, _) => "e-m:e-p:64:64-i64:64-i128:128-n32:64-S128",
    }
}

/// Whether a lowering backend exists for `arch`.
pub fn target_enabled(arch: Arch) -> bool {
    matches!(arch, Arch::X86_64 | Arch::Aarch64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_dwarf_version_only_for_darwin() {
        let linux = TargetMachine::new("native -mtriple=x86_64-unknown-linux-gnu".parse().unwrap());
        let mut module = IRModule::new("m");
        linux.stamp(&mut module);
        assert_eq!(module.target_triple, "x86_64-unknown-linux-gnu");
        assert!(module.data_layout.starts_with("e-m:e-"));
        assert_eq!(module.get_flag("Debug Info Version"), Some(3));
        assert_eq!(module.get_flag("Dwarf Version"), None);

        let darwin = TargetMachine::new("native -mtriple=aarch64-apple-darwin".parse().unwrap());
        let mut module = IRModule::new("m");
        darwin.stamp(&mut module);
        assert_eq!(module.get_flag("Dwarf Version"), Some(2));
        assert_eq!(module.data_layout, "e-m:o-i64:64-i128:128-n32:64-S128");
    }

    #[test]
    fn riscv_has_no_backend() {
        let machine = TargetMachine::new("native -mtriple=riscv64-unknown-linux-gnu".parse().unwrap());
        assert!(!machine.has_backend());
        assert!(target_enabled(Arch::Aarch64));
    }
}
