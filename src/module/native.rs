/// Native modules: an IR module plus a lazily built JIT engine
///
/// The IR module is immutable once wrapped. The wrapper and, after the first
/// non-administrative lookup, the execution engine share it. One lock per wrapper
/// guards the JIT state so the engine is built at most once and never observed
/// half-built; emission reads the shared module and never takes that lock.
use super::{Imports, Module, ModuleNode, PackedFunc, Value};
use crate::codegen::lower_module;
use crate::emit;
use crate::error::{Error, Result};
use crate::ir::{decode_bitcode, parse_module, IRGlobal, IRModule, Linkage, Verifier, BITCODE_MAGIC};
use crate::jit::{EngineError, EngineId, ExecutionEngine, RuntimeSymbols, SymbolLookup, SymbolResolver};
use crate::symbol;
use crate::target::{Target, TargetMachine};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Output of a code generator: a finished module, the name of its entry function
/// and the functions it exports.
#[derive(Debug, Clone)]
pub struct GeneratedModule {
    pub module: IRModule,
    pub entry_function: Option<String>,
    pub exported: Vec<String>,
}

impl GeneratedModule {
    pub fn new(module: IRModule, entry_function: Option<&str>, exported: Vec<String>) -> Self {
        Self { module, entry_function: entry_function.map(str::to_string), exported }
    }
}

enum JitState {
    Uninitialized,
    Ready(Box<ExecutionEngine>),
    /// An engine build started and did not finish; every later lookup reports it.
    Failed(String),
}

pub struct NativeModule {
    name: String,
    target: String,
    catalog: Vec<String>,
    system_lib: bool,
    module: Arc<IRModule>,
    state: RwLock<JitState>,
    imports: Imports,
}

/// Functions provided by imported modules.
struct ImportSymbols(Vec<Module>);

impl SymbolLookup for ImportSymbols {
    fn lookup_symbol(&self, name: &str) -> Option<usize> {
        self.0.iter().find_map(|module| module.symbol_address(name))
    }
}

impl NativeModule {
    fn with_catalog(module: IRModule, catalog: Vec<String>) -> Self {
        let target = Target::from_module(&module).map(|t| t.to_string()).unwrap_or_default();
        Self {
            name: module.name.clone(),
            target,
            catalog,
            system_lib: module.get_definition(symbol::MODULE_STARTUP).is_some(),
            module: Arc::new(module),
            state: RwLock::new(JitState::Uninitialized),
            imports: Imports::default(),
        }
    }

    /// Take ownership of freshly generated code for `target`.
    ///
    /// # Panics
    ///
    /// If the stamped module fails verification; generated code must always verify.
    pub fn from_generated(generated: GeneratedModule, target: &Target) -> Self {
        let GeneratedModule { mut module, entry_function, exported } = generated;

        if let Some(entry) = entry_function {
            module.globals.retain(|global| global.name != symbol::MODULE_MAIN);
            let mut bytes = entry.into_bytes();
            bytes.push(0);
            module.add_global(IRGlobal::constant_bytes(symbol::MODULE_MAIN, bytes).with_linkage(Linkage::External));
        }
        TargetMachine::new(target.clone()).stamp(&mut module);

        let result = Verifier::new().with_exports(&exported).verify(&module);
        if !result.is_valid() {
            error!(module = %module.name, "generated module failed verification");
            panic!("generated module {} failed verification:\n{}", module.name, result.report());
        }
        Self::with_catalog(module, exported)
    }

    /// Take ownership of an existing module as is. The catalog is every external
    /// definition outside the reserved `__` namespace.
    pub fn from_existing(module: IRModule) -> Self {
        let catalog = module
            .external_definitions()
            .map(|function| function.name.clone())
            .filter(|name| !symbol::is_reserved(name))
            .collect();
        Self::with_catalog(module, catalog)
    }

    /// Load textual IR or bitcode. Bitcode is recognized by extension or magic.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let is_bitcode = bytes.starts_with(BITCODE_MAGIC) || path.extension().is_some_and(|ext| ext == "bc");
        let module = if is_bitcode {
            decode_bitcode(&bytes).map_err(|source| Error::Bitcode { path: path.to_path_buf(), source })?
        } else {
            parse_module(&String::from_utf8_lossy(&bytes)).map_err(|source| Error::Parse { path: path.to_path_buf(), source })?
        };
        debug!(path = %path.display(), module = %module.name, bitcode = is_bitcode, "module loaded");
        Ok(Self::from_existing(module))
    }

    /// Empty module named `name`, carrying target metadata, triple and data layout.
    pub fn create_empty(target: &Target, name: &str) -> Self {
        let machine = TargetMachine::new(target.clone());
        let mut module = IRModule::new(name);
        target.stamp(&mut module);
        module.target_triple = machine.triple_string();
        module.data_layout = machine.data_layout().to_string();
        Self::from_existing(module)
    }

    pub fn module_name(&self) -> &str {
        &self.name
    }

    pub fn target_string(&self) -> &str {
        &self.target
    }

    pub fn catalog(&self) -> &[String] {
        &self.catalog
    }

    pub fn is_system_lib(&self) -> bool {
        self.system_lib
    }

    pub fn is_jit_ready(&self) -> bool {
        matches!(&*self.state.read(), JitState::Ready(_))
    }

    /// Value written into `__module_ctx`: the address of this wrapper.
    pub fn identity(&self) -> usize {
        self as *const Self as usize
    }

    /// Run `f` on the IR module. Never waits for a JIT build.
    pub fn with_module<R>(&self, f: impl FnOnce(&IRModule) -> R) -> R {
        f(&self.module)
    }

    fn settled(&self, state: &JitState) -> Option<Result<EngineId>> {
        match state {
            JitState::Uninitialized => None,
            JitState::Ready(engine) => Some(Ok(engine.id())),
            JitState::Failed(reason) => {
                Some(Err(Error::JitFailed { module: self.name.clone(), reason: reason.clone() }))
            }
        }
    }

    /// Build the JIT engine unless it already exists.
    ///
    /// Target, architecture, data layout and lowering errors leave the wrapper
    /// untouched, so a later call may succeed. Anything failing once the engine build
    /// has started panics, and the wrapper then reports `Error::JitFailed` forever.
    pub fn ensure_jit(&self) -> Result<EngineId> {
        if let Some(settled) = self.settled(&self.state.read()) {
            return settled;
        }

        let state = self.state.upgradable_read();
        if let Some(settled) = self.settled(&state) {
            return settled;
        }
        let module = &*self.module;

        let machine = TargetMachine::from_module(module)?;
        let host = TargetMachine::host()?;
        if host.arch() != machine.arch() {
            info!(module = %machine.triple_string(), host = %host.triple_string(), "architecture mismatch");
            return Err(Error::ArchMismatch { target: machine.triple_string(), host: host.triple_string() });
        }
        if machine.data_layout() != module.data_layout {
            return Err(Error::DataLayoutMismatch {
                host: machine.data_layout().to_string(),
                module: module.data_layout.clone(),
            });
        }
        let lowered = lower_module(module, &machine)?;

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        // Stays in place if anything below unwinds.
        *state = JitState::Failed("engine construction panicked".to_string());

        let name = &self.name;
        let imports = Box::new(ImportSymbols(self.imports.snapshot()));
        let mut engine = ExecutionEngine::new(self.module.clone(), machine, lowered, imports)
            .unwrap_or_else(|e| fatal(&mut state, name, e));

        engine.run_static_constructors().unwrap_or_else(|e| fatal(&mut state, name, e));

        if let Some(slot) = SymbolResolver::new(&engine).global_address(symbol::MODULE_CTX) {
            write_slot(&mut engine, symbol::MODULE_CTX, slot, self.identity());
        }
        for (slot_name, entry) in symbol::CONTEXT_FUNCTIONS {
            let Some(slot) = SymbolResolver::new(&engine).global_address(slot_name) else {
                continue;
            };
            match RuntimeSymbols.lookup_symbol(entry) {
                Some(address) => write_slot(&mut engine, slot_name, slot, address),
                None => fatal(&mut state, name, EngineError::Unresolved(vec![entry.to_string()])),
            }
        }

        engine.get_function_address(symbol::FORCE_FINALIZE_SYMBOL).unwrap_or_else(|e| fatal(&mut state, name, e));

        let id = engine.id();
        *state = JitState::Ready(Box::new(engine));
        debug!(module = %name, engine = %id, "JIT ready");
        Ok(id)
    }

    fn lookup(&self, name: &str, this: &Module) -> Result<Option<PackedFunc>> {
        self.ensure_jit()?;
        let state = self.state.read();
        let JitState::Ready(engine) = &*state else {
            unreachable!("JIT state regressed after a successful build");
        };
        let resolver = SymbolResolver::new(engine);

        let target = if name == symbol::MODULE_MAIN {
            resolver.global_address(symbol::MODULE_MAIN).ok_or(Error::MissingModuleMain(symbol::MODULE_MAIN))?;
            match resolver.read_c_string(symbol::MODULE_MAIN) {
                Some(entry) => entry,
                None => return Ok(None),
            }
        } else {
            name.to_string()
        };

        let Some(address) = resolver.function_address(&target) else {
            return Ok(None);
        };
        let arity = engine.module().get_function(&target).map_or(0, |f| f.param_count);
        Ok(Some(unsafe { PackedFunc::native(name, address, arity, this.clone()) }))
    }
}

fn write_slot(engine: &mut ExecutionEngine, name: &str, slot: usize, value: usize) {
    if !engine.write_word(slot, value as u64) {
        warn!(slot = name, "context slot is smaller than a pointer, left untouched");
    }
}

fn fatal(state: &mut JitState, module: &str, err: EngineError) -> ! {
    error!(module, error = %err, "JIT engine construction failed");
    *state = JitState::Failed(err.to_string());
    panic!("failed to build JIT engine for {}: {}", module, err);
}

impl ModuleNode for NativeModule {
    fn type_key(&self) -> &'static str {
        "native"
    }

    fn get_function(&self, name: &str, this: &Module) -> Result<Option<PackedFunc>> {
        match name {
            symbol::IS_SYSTEM_LIB => Ok(Some(PackedFunc::constant(name, Value::Bool(self.system_lib)))),
            symbol::GET_FUNC_NAMES => {
                let names = self.catalog.iter().cloned().map(Value::Str).collect();
                Ok(Some(PackedFunc::constant(name, Value::Array(names))))
            }
            symbol::GET_TARGET_STRING => Ok(Some(PackedFunc::constant(name, Value::Str(self.target.clone())))),
            symbol::GET_SYMBOL | symbol::GET_CONST_VARS => Ok(None),
            _ => self.lookup(name, this),
        }
    }

    fn imports(&self) -> &Imports {
        &self.imports
    }

    fn save_to_file(&self, path: &Path, format: &str) -> Result<()> {
        self.with_module(|module| emit::save_to_file(module, path, format))
    }

    fn get_source(&self, format: &str) -> Result<String> {
        self.with_module(|module| emit::get_source(module, format))
    }

    fn implements_function(&self, name: &str) -> bool {
        self.catalog.iter().any(|export| export == name)
    }

    fn symbol_address(&self, name: &str) -> Option<usize> {
        if !self.module.external_definitions().any(|f| f.name == name) {
            return None;
        }
        self.ensure_jit().ok()?;
        match &*self.state.read() {
            JitState::Ready(engine) => SymbolResolver::new(engine).function_address(name),
            JitState::Uninitialized | JitState::Failed(_) => None,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
