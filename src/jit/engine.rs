/// In-process execution engine
///
/// Owns a lowered module mapped into memory. Relocations against functions and
/// globals of the module itself are applied when the engine is built; relocations
/// against declarations stay pending until the first function-address query
/// finalizes them and flips the code region to executable.
use super::memory::{CodeRegion, DataRegion};
use super::resolver::{LookupChain, SymbolLookup};
use crate::codegen::{layout_data, LoweredModule, Relocation};
use crate::ir::{IRModule, VerifyError};
use crate::target::TargetMachine;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to map JIT memory: {0}")]
    Map(#[from] io::Error),

    #[error("unresolved external symbols: {}", .0.join(", "))]
    Unresolved(Vec<String>),

    #[error("data layout: {0}")]
    Layout(VerifyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Code,
    Data,
}

#[derive(Debug)]
struct PendingRelocation {
    region: Region,
    offset: usize,
    symbol: String,
}

pub struct ExecutionEngine {
    id: EngineId,
    module: Arc<IRModule>,
    machine: TargetMachine,
    code: CodeRegion,
    data: DataRegion,
    functions: HashMap<String, usize>,
    globals: HashMap<String, (usize, usize)>,
    mappings: HashMap<String, usize>,
    imports: Box<dyn SymbolLookup>,
    pending: Vec<PendingRelocation>,
    constructors_run: bool,
}

impl ExecutionEngine {
    /// Map `lowered` (the machine code of `module`) and its data into memory.
    pub fn new(
        module: Arc<IRModule>,
        machine: TargetMachine,
        lowered: LoweredModule,
        imports: Box<dyn SymbolLookup>,
    ) -> Result<Self, EngineError> {
        let image = layout_data(&module).map_err(EngineError::Layout)?;
        let rodata_offset = image.data.bytes.len().next_multiple_of(image.rodata.align.max(1));

        let code = CodeRegion::new(&lowered.code)?;
        let mut data = DataRegion::new(rodata_offset + image.rodata.bytes.len())?;
        data.write(0, &image.data.bytes);
        data.write(rodata_offset, &image.rodata.bytes);

        let functions = lowered.functions.iter().map(|f| (f.name.clone(), f.offset)).collect();
        let mut globals = HashMap::new();
        for symbol in &image.data.symbols {
            globals.insert(symbol.name.clone(), (symbol.offset, symbol.size));
        }
        for symbol in &image.rodata.symbols {
            globals.insert(symbol.name.clone(), (rodata_offset + symbol.offset, symbol.size));
        }

        let mut engine = Self {
            id: EngineId(NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed)),
            module,
            machine,
            code,
            data,
            functions,
            globals,
            mappings: HashMap::new(),
            imports,
            pending: Vec::new(),
            constructors_run: false,
        };

        for reloc in &lowered.relocations {
            engine.relocate(Region::Code, reloc)?;
        }
        for reloc in &image.data.relocations {
            engine.relocate(Region::Data, reloc)?;
        }
        for reloc in &image.rodata.relocations {
            let shifted = Relocation { offset: rodata_offset + reloc.offset, symbol: reloc.symbol.clone() };
            engine.relocate(Region::Data, &shifted)?;
        }

        debug!(
            engine = %engine.id,
            module = %engine.module.name,
            code_bytes = engine.code.len(),
            data_bytes = engine.data.len(),
            pending = engine.pending.len(),
            "execution engine built"
        );
        Ok(engine)
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn module(&self) -> &IRModule {
        &self.module
    }

    pub fn machine(&self) -> &TargetMachine {
        &self.machine
    }

    pub fn is_finalized(&self) -> bool {
        self.code.is_executable()
    }

    /// Resolve `name` to `address` for relocations that are still pending.
    pub fn add_global_mapping(&mut self, name: &str, address: usize) {
        self.mappings.insert(name.to_string(), address);
    }

    fn local_address(&self, symbol: &str) -> Option<usize> {
        self.defined_function_address(symbol).or_else(|| self.global_address(symbol))
    }

    fn relocate(&mut self, region: Region, reloc: &Relocation) -> Result<(), EngineError> {
        match self.local_address(&reloc.symbol) {
            Some(address) => self.patch(region, reloc.offset, address as u64),
            None => {
                self.pending.push(PendingRelocation { region, offset: reloc.offset, symbol: reloc.symbol.clone() });
                Ok(())
            }
        }
    }

    fn patch(&mut self, region: Region, offset: usize, value: u64) -> Result<(), EngineError> {
        match region {
            Region::Code => self.code.patch_u64(offset, value)?,
            Region::Data => self.data.write(offset, &value.to_le_bytes()),
        }
        Ok(())
    }

    /// Resolve every pending relocation and make the code executable. A no-op once
    /// finalized.
    pub fn finalize(&mut self) -> Result<(), EngineError> {
        if self.code.is_executable() {
            return Ok(());
        }

        let chain = LookupChain { mappings: &self.mappings, imports: self.imports.as_ref() };
        let mut resolved = Vec::with_capacity(self.pending.len());
        let mut unresolved: Vec<String> = Vec::new();
        for pending in &self.pending {
            match chain.resolve(&pending.symbol) {
                Some(address) => resolved.push((pending.region, pending.offset, address)),
                None => unresolved.push(pending.symbol.clone()),
            }
        }
        if !unresolved.is_empty() {
            unresolved.sort();
            unresolved.dedup();
            return Err(EngineError::Unresolved(unresolved));
        }

        for (region, offset, address) in resolved {
            self.patch(region, offset, address as u64)?;
        }
        let count = self.pending.len();
        self.pending.clear();
        self.code.make_exec()?;
        debug!(engine = %self.id, relocations = count, "relocations finalized");
        Ok(())
    }

    /// Address of a defined function, finalizing pending relocations first.
    pub fn get_function_address(&mut self, name: &str) -> Result<Option<usize>, EngineError> {
        self.finalize()?;
        Ok(self.defined_function_address(name))
    }

    pub(crate) fn defined_function_address(&self, name: &str) -> Option<usize> {
        self.functions.get(name).map(|offset| self.code.base() + offset)
    }

    pub fn global_address(&self, name: &str) -> Option<usize> {
        self.globals.get(name).map(|(offset, _)| self.data.base() + offset)
    }

    pub fn global_bytes(&self, name: &str) -> Option<&[u8]> {
        self.globals.get(name).map(|&(offset, size)| self.data.bytes(offset, size))
    }

    /// Store a word at `address`, which must lie inside the data region.
    pub fn write_word(&mut self, address: usize, value: u64) -> bool {
        if !self.data.contains(address, 8) {
            return false;
        }
        let offset = address - self.data.base();
        self.data.write(offset, &value.to_le_bytes());
        true
    }

    /// Run static constructors in ascending priority.
    pub fn run_static_constructors(&mut self) -> Result<(), EngineError> {
        self.finalize()?;
        let mut ctors = self.module.ctors.clone();
        ctors.sort_by_key(|entry| entry.priority);
        for entry in &ctors {
            if let Some(address) = self.defined_function_address(&entry.function) {
                unsafe { call_initializer(address) };
            }
        }
        self.constructors_run = true;
        debug!(engine = %self.id, count = ctors.len(), "static constructors run");
        Ok(())
    }

    fn run_static_destructors(&mut self) {
        let mut dtors = self.module.dtors.clone();
        dtors.sort_by_key(|entry| std::cmp::Reverse(entry.priority));
        for entry in &dtors {
            if let Some(address) = self.defined_function_address(&entry.function) {
                unsafe { call_initializer(address) };
            }
        }
        debug!(engine = %self.id, count = dtors.len(), "static destructors run");
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        if self.is_finalized() {
            self.run_static_destructors();
        }
    }
}

unsafe fn call_initializer(address: usize) {
    let func: extern "C" fn() -> i64 = std::mem::transmute(address);
    func();
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::codegen::lower_module;
    use crate::ir::{GlobalInit, IRFunction, IRGlobal, IRInstruction::*};
    use crate::jit::resolver::{NoSymbols, SymbolResolver};
    use std::sync::atomic::AtomicI64;

    fn build(mut module: IRModule, imports: Box<dyn SymbolLookup>) -> Result<ExecutionEngine, EngineError> {
        let machine = TargetMachine::new("native -mtriple=x86_64-unknown-linux-gnu".parse().unwrap());
        machine.stamp(&mut module);
        let lowered = lower_module(&module, &machine).unwrap();
        ExecutionEngine::new(Arc::new(module), machine, lowered, imports)
    }

    #[test]
    fn calls_lowered_function() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::new("add_one", 1).with_body(vec![LoadParam(0), Push(1), Add, Return]));
        let mut engine = build(module, Box::new(NoSymbols)).unwrap();

        assert!(SymbolResolver::new(&engine).function_address("add_one").is_none());
        let address = engine.get_function_address("add_one").unwrap().unwrap();
        assert_eq!(SymbolResolver::new(&engine).function_address("add_one"), Some(address));

        let func: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(address) };
        assert_eq!(func(41), 42);
        assert_eq!(engine.get_function_address("subtract_one").unwrap(), None);
    }

    #[test]
    fn constructors_run_in_priority_order() {
        // counter = counter * 10 + n
        let step = |name: &str, n: i64| {
            IRFunction::new(name, 0).with_body(vec![
                GlobalAddress("counter".into()),
                GlobalAddress("counter".into()),
                Load,
                Push(10),
                Mul,
                Push(n),
                Add,
                Store,
                Push(0),
                Return,
            ])
        };
        let mut module = IRModule::new("m");
        module.add_global(IRGlobal::new("counter", GlobalInit::Word(0)));
        module.add_function(step("second", 2));
        module.add_function(step("first", 1));
        module.add_ctor(200, "second");
        module.add_ctor(100, "first");

        let mut engine = build(module, Box::new(NoSymbols)).unwrap();
        engine.run_static_constructors().unwrap();
        let bytes = engine.global_bytes("counter").unwrap();
        assert_eq!(i64::from_le_bytes(bytes.try_into().unwrap()), 12);
    }

    static DESTROYED: AtomicI64 = AtomicI64::new(0);

    extern "C" fn host_bump() -> i64 {
        DESTROYED.fetch_add(1, Ordering::SeqCst) + 1
    }

    extern "C" fn host_double(x: i64) -> i64 {
        x * 2
    }

    #[test]
    fn external_calls_resolve_through_the_chain() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::declare("host_double", 1));
        module.add_function(IRFunction::declare("from_import", 0));
        module.add_function(IRFunction::declare("__rt_alloc", 1));
        module.add_function(
            IRFunction::new("quad", 1).with_body(vec![LoadParam(0), Call("host_double".into(), 1), Call("host_double".into(), 1), Return]),
        );
        module.add_function(IRFunction::new("imported", 0).with_body(vec![Call("from_import".into(), 0), Return]));
        module.add_function(IRFunction::new("alloc", 0).with_body(vec![Push(32), Call("__rt_alloc".into(), 1), Return]));

        let imports = |name: &str| (name == "from_import").then_some(host_bump as *const () as usize);
        let mut engine = build(module, Box::new(imports)).unwrap();
        engine.add_global_mapping("host_double", host_double as *const () as usize);

        let quad: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(engine.get_function_address("quad").unwrap().unwrap()) };
        assert_eq!(quad(5), 20);

        let alloc: extern "C" fn() -> *mut u8 = unsafe { std::mem::transmute(engine.get_function_address("alloc").unwrap().unwrap()) };
        let ptr = alloc();
        assert!(!ptr.is_null());
        unsafe { nativemod_runtime::__rt_free(ptr) };
    }

    #[test]
    fn unresolved_symbols_are_reported() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::declare("missing", 0));
        module.add_function(IRFunction::new("f", 0).with_body(vec![Call("missing".into(), 0), Return]));
        let mut engine = build(module, Box::new(NoSymbols)).unwrap();

        match engine.get_function_address("f") {
            Err(EngineError::Unresolved(names)) => assert_eq!(names, vec!["missing".to_string()]),
            other => panic!("expected unresolved symbols, got {:?}", other.map(|_| ())),
        }
        assert!(!engine.is_finalized());
    }

    #[test]
    fn destructors_run_on_drop() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::declare("bump", 0));
        module.add_function(IRFunction::new("fini", 0).with_body(vec![Call("bump".into(), 0), Return]));
        module.add_dtor(100, "fini");

        let mut engine = build(module, Box::new(NoSymbols)).unwrap();
        engine.add_global_mapping("bump", host_bump as *const () as usize);
        engine.run_static_constructors().unwrap();

        let before = DESTROYED.load(Ordering::SeqCst);
        drop(engine);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn data_pointers_are_relocated() {
        let mut module = IRModule::new("m");
        module.add_global(IRGlobal::constant_bytes("msg", b"hi\0".to_vec()));
        module.add_global(IRGlobal::new("ptr", GlobalInit::Pointers(vec!["msg".into()])));
        module.add_function(IRFunction::new("f", 0).with_body(vec![Push(0), Return]));
        let engine = build(module, Box::new(NoSymbols)).unwrap();

        let msg = engine.global_address("msg").unwrap();
        let ptr = engine.global_bytes("ptr").unwrap();
        assert_eq!(u64::from_le_bytes(ptr.try_into().unwrap()), msg as u64);
        assert_eq!(SymbolResolver::new(&engine).read_c_string("msg").as_deref(), Some("hi"));
    }
}
