use super::{GlobalInit, IRFunction, IRGlobal, IRInstruction, IRModule, Linkage};

/// Builds one function body, handing out fresh labels and local slots.
#[derive(Debug)]
pub struct FunctionBuilder {
    function: IRFunction,
    next_label: u32,
}

impl FunctionBuilder {
    pub fn new(name: &str, param_count: usize) -> Self {
        Self {
            function: IRFunction::new(name, param_count),
            next_label: 0,
        }
    }

    pub fn internal(mut self) -> Self {
        self.function.linkage = Linkage::Internal;
        self
    }

    pub fn new_label(&mut self) -> u32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    /// Reserve a new local slot.
    pub fn new_local(&mut self) -> usize {
        let slot = self.function.local_count;
        self.function.local_count += 1;
        slot
    }

    pub fn emit(&mut self, instruction: IRInstruction) -> &mut Self {
        self.function.add_instruction(instruction);
        self
    }

    pub fn push(&mut self, value: i64) -> &mut Self {
        self.emit(IRInstruction::Push(value))
    }

    pub fn param(&mut self, index: usize) -> &mut Self {
        self.emit(IRInstruction::LoadParam(index))
    }

    pub fn global_address(&mut self, name: &str) -> &mut Self {
        self.emit(IRInstruction::GlobalAddress(name.to_string()))
    }

    pub fn call(&mut self, name: &str, arg_count: usize) -> &mut Self {
        self.emit(IRInstruction::Call(name.to_string(), arg_count))
    }

    pub fn label(&mut self, label: u32) -> &mut Self {
        self.emit(IRInstruction::Label(label))
    }

    pub fn ret(&mut self) -> &mut Self {
        self.emit(IRInstruction::Return)
    }

    pub fn finish(self) -> IRFunction {
        self.function
    }
}

/// Collects functions and globals into a module and remembers which functions are
/// exported.
#[derive(Debug)]
pub struct ModuleBuilder {
    module: IRModule,
    exported: Vec<String>,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            module: IRModule::new(name),
            exported: Vec::new(),
        }
    }

    /// Add a function; external definitions are recorded as exports.
    pub fn function(&mut self, function: IRFunction) -> &mut Self {
        if !function.is_declaration() && function.linkage == Linkage::External && !self.exported.contains(&function.name) {
            self.exported.push(function.name.clone());
        }
        self.module.add_function(function);
        self
    }

    /// Declare an external function unless the module already knows it.
    pub fn declare(&mut self, name: &str, param_count: usize) -> &mut Self {
        if self.module.get_function(name).is_none() {
            self.module.add_function(IRFunction::declare(name, param_count));
        }
        self
    }

    pub fn global(&mut self, global: IRGlobal) -> &mut Self {
        self.module.add_global(global);
        self
    }

    /// Writable pointer-sized slot, zero-initialized.
    pub fn slot(&mut self, name: &str) -> &mut Self {
        self.global(IRGlobal::new(name, GlobalInit::Zero(8)))
    }

    pub fn ctor(&mut self, priority: u32, function: &str) -> &mut Self {
        self.module.add_ctor(priority, function);
        self
    }

    pub fn dtor(&mut self, priority: u32, function: &str) -> &mut Self {
        self.module.add_dtor(priority, function);
        self
    }

    pub fn exported(&self) -> &[String] {
        &self.exported
    }

    pub fn into_parts(self) -> (IRModule, Vec<String>) {
        (self.module, self.exported)
    }

    pub fn build(self) -> IRModule {
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_and_locals_are_fresh() {
        let mut f = FunctionBuilder::new("f", 0);
        assert_eq!(f.new_label(), 0);
        assert_eq!(f.new_label(), 1);
        assert_eq!(f.new_local(), 0);
        assert_eq!(f.new_local(), 1);
        f.push(1).ret();
        let function = f.finish();
        assert_eq!(function.local_count, 2);
        assert_eq!(function.instructions(), &[IRInstruction::Push(1), IRInstruction::Return]);
    }

    #[test]
    fn only_external_definitions_are_exported() {
        let mut helper = FunctionBuilder::new("helper", 0).internal();
        helper.push(0).ret();
        let mut main = FunctionBuilder::new("main", 0);
        main.call("helper", 0).ret();

        let mut builder = ModuleBuilder::new("m");
        builder.declare("__rt_alloc", 1).function(helper.finish()).function(main.finish());
        builder.declare("__rt_alloc", 1);
        let (module, exported) = builder.into_parts();
        assert_eq!(exported, vec!["main".to_string()]);
        assert_eq!(module.functions.len(), 3);
    }
}
