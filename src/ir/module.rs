use super::IRInstruction;
use std::collections::BTreeMap;

/// Maximum number of parameters a function can take (integer argument registers
/// shared by every supported calling convention).
pub const MAX_PARAMS: usize = 6;

/// Maximum number of parameter + local slots in one frame.
pub const MAX_FRAME_SLOTS: usize = 500;

/// Largest alignment a global may request (one page).
pub const MAX_GLOBAL_ALIGN: u64 = 4096;

/// Upper bound on the bytes of each data section, padding included.
pub const MAX_SECTION_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    External,
    Internal,
}

impl Linkage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Linkage::External => "external",
            Linkage::Internal => "internal",
        }
    }
}

/// How a module flag merges when the same key is set twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagBehavior {
    Error,
    Warning,
    Override,
}

impl FlagBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagBehavior::Error => "error",
            FlagBehavior::Warning => "warning",
            FlagBehavior::Override => "override",
        }
    }

    pub fn parse(text: &str) -> Option<FlagBehavior> {
        match text {
            "error" => Some(FlagBehavior::Error),
            "warning" => Some(FlagBehavior::Warning),
            "override" => Some(FlagBehavior::Override),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFlag {
    pub behavior: FlagBehavior,
    pub key: String,
    pub value: i64,
}

/// Static initializer of a global variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalInit {
    Zero(usize),          // N zero bytes
    Word(i64),            // One 64-bit little-endian word
    Bytes(Vec<u8>),       // Raw bytes
    Pointers(Vec<String>), // Addresses of functions or globals, one word each
}

impl GlobalInit {
    pub fn size(&self) -> usize {
        match self {
            GlobalInit::Zero(size) => *size,
            GlobalInit::Word(_) => 8,
            GlobalInit::Bytes(bytes) => bytes.len(),
            GlobalInit::Pointers(targets) => 8 * targets.len(),
        }
    }

    /// Initial bytes with pointer words left as zero (they are filled by relocations).
    pub fn initial_bytes(&self) -> Vec<u8> {
        match self {
            GlobalInit::Zero(size) => vec![0; *size],
            GlobalInit::Word(value) => value.to_le_bytes().to_vec(),
            GlobalInit::Bytes(bytes) => bytes.clone(),
            GlobalInit::Pointers(targets) => vec![0; 8 * targets.len()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IRGlobal {
    pub name: String,
    pub linkage: Linkage,
    pub constant: bool,
    pub align: u64,
    pub init: GlobalInit,
}

impl IRGlobal {
    /// Writable, externally visible global.
    pub fn new(name: &str, init: GlobalInit) -> Self {
        Self {
            name: name.to_string(),
            linkage: Linkage::External,
            constant: false,
            align: 8,
            init,
        }
    }

    /// Read-only global holding `bytes`.
    pub fn constant_bytes(name: &str, bytes: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            linkage: Linkage::Internal,
            constant: true,
            align: 1,
            init: GlobalInit::Bytes(bytes),
        }
    }

    pub fn with_linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    pub fn with_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    pub fn size(&self) -> usize {
        self.init.size()
    }
}

/// A function definition, or a declaration when `body` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IRFunction {
    pub name: String,
    pub linkage: Linkage,
    pub param_count: usize,
    pub local_count: usize,
    pub body: Option<Vec<IRInstruction>>,
}

impl IRFunction {
    pub fn new(name: &str, param_count: usize) -> Self {
        Self {
            name: name.to_string(),
            linkage: Linkage::External,
            param_count,
            local_count: 0,
            body: Some(Vec::new()),
        }
    }

    /// External symbol provided by the runtime or another module.
    pub fn declare(name: &str, param_count: usize) -> Self {
        Self {
            name: name.to_string(),
            linkage: Linkage::External,
            param_count,
            local_count: 0,
            body: None,
        }
    }

    pub fn with_locals(mut self, local_count: usize) -> Self {
        self.local_count = local_count;
        self
    }

    pub fn with_linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    pub fn with_body(mut self, body: Vec<IRInstruction>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn add_instruction(&mut self, instruction: IRInstruction) {
        self.body.get_or_insert_with(Vec::new).push(instruction);
    }

    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }

    pub fn instructions(&self) -> &[IRInstruction] {
        self.body.as_deref().unwrap_or(&[])
    }
}

/// Static constructor or destructor entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticInitializer {
    pub priority: u32,
    pub function: String,
}

/// In-memory program representation ready for lowering or execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IRModule {
    pub name: String,
    pub target_triple: String,
    pub data_layout: String,
    pub metadata: BTreeMap<String, String>,
    pub flags: Vec<ModuleFlag>,
    pub globals: Vec<IRGlobal>,
    pub functions: Vec<IRFunction>,
    pub ctors: Vec<StaticInitializer>,
    pub dtors: Vec<StaticInitializer>,
}

impl IRModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn add_function(&mut self, function: IRFunction) {
        self.functions.push(function);
    }

    pub fn add_global(&mut self, global: IRGlobal) {
        self.globals.push(global);
    }

    pub fn add_ctor(&mut self, priority: u32, function: &str) {
        self.ctors.push(StaticInitializer { priority, function: function.to_string() });
    }

    pub fn add_dtor(&mut self, priority: u32, function: &str) {
        self.dtors.push(StaticInitializer { priority, function: function.to_string() });
    }

    /// Function (defined or declared) called `name`.
    pub fn get_function(&self, name: &str) -> Option<&IRFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Defined function called `name`; declarations are skipped.
    pub fn get_definition(&self, name: &str) -> Option<&IRFunction> {
        self.get_function(name).filter(|f| !f.is_declaration())
    }

    pub fn get_global(&self, name: &str) -> Option<&IRGlobal> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Set a module flag, replacing an existing entry with the same key when the
    /// new flag overrides.
    pub fn add_flag(&mut self, behavior: FlagBehavior, key: &str, value: i64) {
        if behavior == FlagBehavior::Override {
            self.flags.retain(|flag| flag.key != key);
        }
        self.flags.push(ModuleFlag { behavior, key: key.to_string(), value });
    }

    pub fn get_flag(&self, key: &str) -> Option<i64> {
        self.flags.iter().rev().find(|flag| flag.key == key).map(|flag| flag.value)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Defined functions with external linkage, in definition order.
    pub fn external_definitions(&self) -> impl Iterator<Item = &IRFunction> {
        self.functions.iter().filter(|f| !f.is_declaration() && f.linkage == Linkage::External)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_flag_replaces_previous_value() {
        let mut module = IRModule::new("m");
        module.add_flag(FlagBehavior::Override, "Dwarf Version", 4);
        module.add_flag(FlagBehavior::Override, "Dwarf Version", 2);
        assert_eq!(module.flags.len(), 1);
        assert_eq!(module.get_flag("Dwarf Version"), Some(2));
    }

    #[test]
    fn definitions_skip_declarations() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::declare("__rt_alloc", 1));
        module.add_function(IRFunction::new("f", 0).with_body(vec![IRInstruction::Push(1), IRInstruction::Return]));
        assert!(module.get_function("__rt_alloc").is_some());
        assert!(module.get_definition("__rt_alloc").is_none());
        let names: Vec<_> = module.external_definitions().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["f"]);
    }

    #[test]
    fn pointer_initializers_reserve_words() {
        let init = GlobalInit::Pointers(vec!["a".into(), "b".into()]);
        assert_eq!(init.size(), 16);
        assert_eq!(init.initial_bytes(), vec![0; 16]);
        assert_eq!(GlobalInit::Word(-1).initial_bytes(), vec![0xff; 8]);
    }
}
