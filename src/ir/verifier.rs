/// Structural verification of IR modules
///
/// Checks everything the lowering backends rely on: unique symbols, resolvable
/// references, call arity, frame limits, and a consistent evaluation-stack depth at
/// every instruction.
use super::module::{
    GlobalInit, IRFunction, IRGlobal, IRModule, MAX_FRAME_SLOTS, MAX_GLOBAL_ALIGN, MAX_PARAMS, MAX_SECTION_BYTES,
};
use super::IRInstruction;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Verification error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    DuplicateSymbol(String),
    InvalidSymbolName(String),
    TooManyParams { function: String, count: usize },
    FrameTooLarge { function: String, slots: usize },
    UndefinedFunction { function: String, callee: String },
    UndefinedGlobal { function: String, global: String },
    ArityMismatch { function: String, callee: String, expected: usize, actual: usize },
    ParamOutOfRange { function: String, index: usize },
    LocalOutOfRange { function: String, index: usize },
    DuplicateLabel { function: String, label: u32 },
    UndefinedLabel { function: String, label: u32 },
    StackUnderflow { function: String, position: usize },
    InconsistentStack { function: String, label: u32, expected: usize, actual: usize },
    MissingTerminator(String),
    BadInitializer { function: String, reason: String },
    UndefinedPointerTarget { global: String, target: String },
    BadAlignment { global: String, align: u64 },
    SectionTooLarge { global: String },
    MissingExport(String),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::DuplicateSymbol(name) => write!(f, "symbol @{} is defined more than once", name),
            VerifyError::InvalidSymbolName(name) => write!(f, "invalid symbol name '{}'", name),
            VerifyError::TooManyParams { function, count } => {
                write!(f, "@{} takes {} parameters (limit: {})", function, count, MAX_PARAMS)
            }
            VerifyError::FrameTooLarge { function, slots } => {
                write!(f, "@{} needs {} frame slots (limit: {})", function, slots, MAX_FRAME_SLOTS)
            }
            VerifyError::UndefinedFunction { function, callee } => {
                write!(f, "@{} calls undefined function @{}", function, callee)
            }
            VerifyError::UndefinedGlobal { function, global } => {
                write!(f, "@{} references undefined global @{}", function, global)
            }
            VerifyError::ArityMismatch { function, callee, expected, actual } => write!(
                f,
                "@{} calls @{} with {} arguments, expected {}",
                function, callee, actual, expected
            ),
            VerifyError::ParamOutOfRange { function, index } => {
                write!(f, "@{} reads parameter {} out of range", function, index)
            }
            VerifyError::LocalOutOfRange { function, index } => {
                write!(f, "@{} uses local slot {} out of range", function, index)
            }
            VerifyError::DuplicateLabel { function, label } => write!(f, "@{} defines L{} twice", function, label),
            VerifyError::UndefinedLabel { function, label } => {
                write!(f, "@{} jumps to undefined label L{}", function, label)
            }
            VerifyError::StackUnderflow { function, position } => {
                write!(f, "@{} underflows the stack at instruction {}", function, position)
            }
            VerifyError::InconsistentStack { function, label, expected, actual } => write!(
                f,
                "@{} reaches L{} with stack depth {} and {}",
                function, label, expected, actual
            ),
            VerifyError::MissingTerminator(function) => {
                write!(f, "@{} falls off the end of its body without ret or jmp", function)
            }
            VerifyError::BadInitializer { function, reason } => {
                write!(f, "static initializer @{}: {}", function, reason)
            }
            VerifyError::UndefinedPointerTarget { global, target } => {
                write!(f, "global @{} points to undefined symbol @{}", global, target)
            }
            VerifyError::BadAlignment { global, align } => write!(
                f,
                "global @{} has alignment {} (must be a power of two up to {})",
                global, align, MAX_GLOBAL_ALIGN
            ),
            VerifyError::SectionTooLarge { global } => {
                write!(f, "global @{} grows its data section past {} bytes", global, MAX_SECTION_BYTES)
            }
            VerifyError::MissingExport(name) => {
                write!(f, "exported function @{} is not an external definition", name)
            }
        }
    }
}

/// Module statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ModuleStats {
    pub function_count: usize,
    pub instruction_count: usize,
    pub max_stack_depth: usize,
}

/// Verification result
#[derive(Debug, Default)]
pub struct VerifyResult {
    pub errors: Vec<VerifyError>,
    pub stats: ModuleStats,
}

impl VerifyResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// One error per line, for fatal reports.
    pub fn report(&self) -> String {
        self.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug, Default)]
pub struct Verifier<'a> {
    exports: &'a [String],
}

impl<'a> Verifier<'a> {
    pub fn new() -> Self {
        Self { exports: &[] }
    }

    /// Also require every name in `exports` to be an external definition.
    pub fn with_exports(mut self, exports: &'a [String]) -> Self {
        self.exports = exports;
        self
    }

    pub fn verify(&self, module: &IRModule) -> VerifyResult {
        let mut result = VerifyResult::default();
        let errors = &mut result.errors;

        let mut seen = HashSet::new();
        for name in module.functions.iter().map(|f| &f.name).chain(module.globals.iter().map(|g| &g.name)) {
            if !is_valid_symbol(name) {
                errors.push(VerifyError::InvalidSymbolName(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                errors.push(VerifyError::DuplicateSymbol(name.clone()));
            }
        }

        for global in &module.globals {
            if !global.align.is_power_of_two() || global.align > MAX_GLOBAL_ALIGN {
                errors.push(VerifyError::BadAlignment { global: global.name.clone(), align: global.align });
            }
            if let GlobalInit::Pointers(targets) = &global.init {
                for target in targets {
                    if module.get_function(target).is_none() && module.get_global(target).is_none() {
                        errors.push(VerifyError::UndefinedPointerTarget {
                            global: global.name.clone(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }

        for constant in [false, true] {
            let section = module.globals.iter().filter(|g| g.constant == constant);
            if let Err(global) = section_extent(section) {
                errors.push(VerifyError::SectionTooLarge { global: global.name.clone() });
            }
        }

        for function in &module.functions {
            result.stats.function_count += 1;
            if function.param_count > MAX_PARAMS {
                errors.push(VerifyError::TooManyParams { function: function.name.clone(), count: function.param_count });
            }
            if function.param_count + function.local_count > MAX_FRAME_SLOTS {
                errors.push(VerifyError::FrameTooLarge {
                    function: function.name.clone(),
                    slots: function.param_count + function.local_count,
                });
            }
            if function.is_declaration() {
                continue;
            }

            result.stats.instruction_count += function.instructions().len();
            check_references(module, function, errors);
            match stack_depths(function) {
                Ok(depths) => {
                    let deepest = depths.iter().flatten().copied().max().unwrap_or(0);
                    result.stats.max_stack_depth = result.stats.max_stack_depth.max(deepest + 1);
                }
                Err(error) => errors.push(error),
            }
        }

        for init in module.ctors.iter().chain(module.dtors.iter()) {
            match module.get_function(&init.function) {
                Some(function) if function.is_declaration() => errors.push(VerifyError::BadInitializer {
                    function: init.function.clone(),
                    reason: "function is only declared".to_string(),
                }),
                Some(function) if function.param_count != 0 => errors.push(VerifyError::BadInitializer {
                    function: init.function.clone(),
                    reason: format!("takes {} parameters", function.param_count),
                }),
                Some(_) => {}
                None => errors.push(VerifyError::BadInitializer {
                    function: init.function.clone(),
                    reason: "function is not defined".to_string(),
                }),
            }
        }

        for name in self.exports {
            if !module.external_definitions().any(|f| &f.name == name) {
                errors.push(VerifyError::MissingExport(name.clone()));
            }
        }

        result
    }
}

/// Bytes a data section holding `globals` occupies, or the first global that would
/// push it past [`MAX_SECTION_BYTES`].
pub fn section_extent<'g>(globals: impl IntoIterator<Item = &'g IRGlobal>) -> Result<usize, &'g IRGlobal> {
    globals.into_iter().try_fold(0usize, |end, global| {
        usize::try_from(global.align.max(1))
            .ok()
            .and_then(|align| end.checked_next_multiple_of(align))
            .and_then(|offset| offset.checked_add(global.size()))
            .filter(|&end| end <= MAX_SECTION_BYTES)
            .ok_or(global)
    })
}

fn is_valid_symbol(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$' | '-'))
}

fn check_references(module: &IRModule, function: &IRFunction, errors: &mut Vec<VerifyError>) {
    for inst in function.instructions() {
        match inst {
            IRInstruction::Call(callee, arg_count) => match module.get_function(callee) {
                Some(target) if target.param_count != *arg_count => errors.push(VerifyError::ArityMismatch {
                    function: function.name.clone(),
                    callee: callee.clone(),
                    expected: target.param_count,
                    actual: *arg_count,
                }),
                Some(_) => {}
                None => errors.push(VerifyError::UndefinedFunction {
                    function: function.name.clone(),
                    callee: callee.clone(),
                }),
            },
            IRInstruction::CallIndirect(arg_count) if *arg_count > MAX_PARAMS => {
                errors.push(VerifyError::TooManyParams { function: function.name.clone(), count: *arg_count })
            }
            IRInstruction::GlobalAddress(global) if module.get_global(global).is_none() => {
                errors.push(VerifyError::UndefinedGlobal {
                    function: function.name.clone(),
                    global: global.clone(),
                })
            }
            IRInstruction::LoadParam(index) if *index >= function.param_count => {
                errors.push(VerifyError::ParamOutOfRange { function: function.name.clone(), index: *index })
            }
            IRInstruction::LoadLocal(index) | IRInstruction::StoreLocal(index) if *index >= function.local_count => {
                errors.push(VerifyError::LocalOutOfRange { function: function.name.clone(), index: *index })
            }
            _ => {}
        }
    }
}

/// Evaluation-stack depth before each instruction of `function`.
///
/// `None` marks unreachable instructions. Labels that are only reached by backward
/// jumps start at the depth recorded by the fall-through, or zero if nothing reaches
/// them before their definition.
pub fn stack_depths(function: &IRFunction) -> Result<Vec<Option<usize>>, VerifyError> {
    let body = function.instructions();
    let name = || function.name.clone();

    let mut defined = HashSet::new();
    for inst in body {
        if let IRInstruction::Label(label) = inst {
            if !defined.insert(*label) {
                return Err(VerifyError::DuplicateLabel { function: name(), label: *label });
            }
        }
    }

    let mut label_depths: HashMap<u32, usize> = HashMap::new();
    let mut depths = Vec::with_capacity(body.len());
    let mut current = Some(0usize);

    let record = |label: u32, depth: usize, label_depths: &mut HashMap<u32, usize>| -> Result<(), VerifyError> {
        if !defined.contains(&label) {
            return Err(VerifyError::UndefinedLabel { function: function.name.clone(), label });
        }
        match label_depths.get(&label) {
            Some(&expected) if expected != depth => Err(VerifyError::InconsistentStack {
                function: function.name.clone(),
                label,
                expected,
                actual: depth,
            }),
            Some(_) => Ok(()),
            None => {
                label_depths.insert(label, depth);
                Ok(())
            }
        }
    };

    for (position, inst) in body.iter().enumerate() {
        if let IRInstruction::Label(label) = inst {
            let depth = match (current, label_depths.get(label).copied()) {
                (Some(fallthrough), _) => fallthrough,
                (None, Some(jumped)) => jumped,
                (None, None) => 0,
            };
            record(*label, depth, &mut label_depths)?;
            current = Some(depth);
        }

        depths.push(current);
        let Some(depth) = current else {
            continue;
        };

        let (pops, pushes) = inst.stack_effect();
        if pops > depth {
            return Err(VerifyError::StackUnderflow { function: name(), position });
        }
        let after = depth - pops + pushes;

        match inst {
            IRInstruction::Jump(label) => {
                record(*label, after, &mut label_depths)?;
                current = None;
            }
            IRInstruction::JumpIfZero(label) => {
                record(*label, after, &mut label_depths)?;
                current = Some(after);
            }
            IRInstruction::Return => current = None,
            _ => current = Some(after),
        }
    }

    if current.is_some() {
        return Err(VerifyError::MissingTerminator(name()));
    }
    Ok(depths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IRGlobal, IRInstruction::*};

    fn module_with(function: IRFunction) -> IRModule {
        let mut module = IRModule::new("test");
        module.add_function(function);
        module
    }

    #[test]
    fn accepts_simple_function() {
        let module = module_with(IRFunction::new("add_one", 1).with_body(vec![LoadParam(0), Push(1), Add, Return]));
        let result = Verifier::new().verify(&module);
        assert!(result.is_valid(), "{}", result.report());
        assert_eq!(result.stats.instruction_count, 4);
    }

    #[test]
    fn rejects_stack_underflow() {
        let module = module_with(IRFunction::new("bad", 0).with_body(vec![Push(1), Add, Return]));
        let result = Verifier::new().verify(&module);
        assert_eq!(result.errors, vec![VerifyError::StackUnderflow { function: "bad".into(), position: 1 }]);
    }

    #[test]
    fn rejects_missing_terminator() {
        let module = module_with(IRFunction::new("f", 0).with_body(vec![Push(1)]));
        let result = Verifier::new().verify(&module);
        assert_eq!(result.errors, vec![VerifyError::MissingTerminator("f".into())]);
    }

    #[test]
    fn rejects_inconsistent_depth_at_label() {
        let body = vec![Push(1), JumpIfZero(0), Push(5), Label(0), Push(2), Return];
        let result = Verifier::new().verify(&module_with(IRFunction::new("f", 0).with_body(body)));
        assert!(matches!(result.errors[0], VerifyError::InconsistentStack { label: 0, .. }));
    }

    #[test]
    fn loop_depths_are_consistent() {
        // countdown(n): while n != 0 { n = n - 1 }; return 0
        let body = vec![
            LoadParam(0),
            StoreLocal(0),
            Label(0),
            LoadLocal(0),
            JumpIfZero(1),
            LoadLocal(0),
            Push(1),
            Sub,
            StoreLocal(0),
            Jump(0),
            Label(1),
            Push(0),
            Return,
        ];
        let function = IRFunction::new("countdown", 1).with_locals(1).with_body(body);
        let depths = stack_depths(&function).unwrap();
        assert_eq!(depths[2], Some(0));
        assert_eq!(depths[10], Some(0));
        assert!(Verifier::new().verify(&module_with(function)).is_valid());
    }

    #[test]
    fn reports_unresolved_references() {
        let mut module = module_with(IRFunction::new("f", 0).with_body(vec![
            GlobalAddress("missing".into()),
            Drop,
            Call("nowhere".into(), 0),
            Return,
        ]));
        module.add_global(IRGlobal::new("g", GlobalInit::Pointers(vec!["ghost".into()])));
        let errors = Verifier::new().verify(&module).errors;
        assert!(errors.contains(&VerifyError::UndefinedGlobal { function: "f".into(), global: "missing".into() }));
        assert!(errors.contains(&VerifyError::UndefinedFunction { function: "f".into(), callee: "nowhere".into() }));
        assert!(errors.contains(&VerifyError::UndefinedPointerTarget { global: "g".into(), target: "ghost".into() }));
    }

    #[test]
    fn checks_arity_and_exports() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::declare("__rt_alloc", 1));
        module.add_function(IRFunction::new("f", 0).with_body(vec![Call("__rt_alloc".into(), 2), Return]));
        let exports = vec!["f".to_string(), "g".to_string()];
        let errors = Verifier::new().with_exports(&exports).verify(&module).errors;
        assert!(errors.iter().any(|e| matches!(e, VerifyError::ArityMismatch { expected: 1, actual: 2, .. })));
        assert!(errors.contains(&VerifyError::MissingExport("g".into())));
    }

    #[test]
    fn rejects_bad_alignment_and_oversized_sections() {
        let mut module = IRModule::new("m");
        module.add_global(IRGlobal::new("huge", GlobalInit::Zero(usize::MAX)));
        module.add_global(IRGlobal::new("odd", GlobalInit::Word(0)).with_align(3));
        module.add_global(IRGlobal::new("unaligned", GlobalInit::Word(0)).with_align(0));
        module.add_global(IRGlobal::constant_bytes("paged", vec![1]).with_align(1 << 20));
        let errors = Verifier::new().verify(&module).errors;

        assert!(errors.contains(&VerifyError::SectionTooLarge { global: "huge".into() }));
        assert!(errors.contains(&VerifyError::BadAlignment { global: "odd".into(), align: 3 }));
        assert!(errors.contains(&VerifyError::BadAlignment { global: "unaligned".into(), align: 0 }));
        assert!(errors.contains(&VerifyError::BadAlignment { global: "paged".into(), align: 1 << 20 }));
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn section_extent_counts_padding() {
        let globals = [
            IRGlobal::constant_bytes("a", vec![1, 2, 3]),
            IRGlobal::new("b", GlobalInit::Word(0)).with_align(16),
        ];
        assert_eq!(section_extent(&globals), Ok(24));
        let over = [IRGlobal::new("big", GlobalInit::Zero(MAX_SECTION_BYTES)).with_align(8), globals[0].clone()];
        assert_eq!(section_extent(&over).map_err(|g| g.name.as_str()), Err("a"));
    }

    #[test]
    fn static_initializers_must_be_nullary_definitions() {
        let mut module = module_with(IRFunction::new("init", 1).with_body(vec![Push(0), Return]));
        module.add_ctor(65535, "init");
        module.add_dtor(65535, "gone");
        let errors = Verifier::new().verify(&module).errors;
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, VerifyError::BadInitializer { .. })));
    }
}
