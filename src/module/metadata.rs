/// Metadata and function-registry modules
///
/// Two composite shapes:
/// - C++ runtime: a [`MetadataModule`] answering `get_metadata` that imports a
///   synthesized native module exposing each entry through an accessor function
/// - C runtime: a synthesized native module holding a registry of every function
///   its children export, registered with the runtime by a static constructor
///
/// Registry layout in memory:
/// ```text
/// __module_func_names:    u16 count | name0 \0 | name1 \0 | ...
/// __module_func_ptrs:     &name0_fn | &name1_fn | ...
/// __module_func_registry: &__module_func_names | &__module_func_ptrs
/// ```
use super::{GeneratedModule, Imports, Module, ModuleNode, NativeModule, PackedFunc, Value};
use crate::error::{Error, Result};
use crate::ir::{FunctionBuilder, GlobalInit, IRFunction, IRGlobal, IRInstruction, Linkage, ModuleBuilder};
use crate::symbol;
use crate::target::Target;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

const STARTUP_PRIORITY: u32 = 65535;

pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Cpp,
    Crt,
}

/// Runtime the compiled code is linked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub system_lib: bool,
}

impl RuntimeConfig {
    pub fn new(kind: RuntimeKind, system_lib: bool) -> Self {
        Self { kind, system_lib }
    }

    /// `cpp` or `crt`, optionally followed by `--system-lib` or `-system-lib=0|1`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = text.split_whitespace();
        let kind = match tokens.next() {
            Some("cpp") => RuntimeKind::Cpp,
            Some("crt") => RuntimeKind::Crt,
            other => return Err(Error::argument("runtime", format!("unknown runtime '{}'", other.unwrap_or("")))),
        };
        let mut system_lib = false;
        for token in tokens {
            system_lib = match token {
                "--system-lib" | "-system-lib=1" => true,
                "-system-lib=0" => false,
                other => return Err(Error::argument("runtime", format!("unknown runtime option '{}'", other))),
            };
        }
        Ok(Self { kind, system_lib })
    }
}

impl fmt::Display for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RuntimeKind::Cpp => "cpp",
            RuntimeKind::Crt => "crt",
        };
        write!(f, "{}", kind)?;
        if self.system_lib {
            write!(f, " --system-lib")?;
        }
        Ok(())
    }
}

/// Module carrying metadata for the C++ runtime.
pub struct MetadataModule {
    metadata: Metadata,
    imports: Imports,
}

impl MetadataModule {
    pub fn new(metadata: Metadata) -> Self {
        Self { metadata, imports: Imports::default() }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl ModuleNode for MetadataModule {
    fn type_key(&self) -> &'static str {
        "metadata"
    }

    fn get_function(&self, name: &str, _this: &Module) -> Result<Option<PackedFunc>> {
        if name != "get_metadata" {
            return Ok(None);
        }
        let metadata = self.metadata.clone();
        Ok(Some(PackedFunc::new(name, move |args| {
            let key = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| Error::argument("get_metadata", "expected a key string"))?;
            Ok(metadata.get(key).cloned().unwrap_or(Value::Null))
        })))
    }

    fn imports(&self) -> &Imports {
        &self.imports
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn symbol_suffix(key: &str) -> String {
    key.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect()
}

fn accessor(name: &str, global: &str, load: bool) -> IRFunction {
    let mut function = FunctionBuilder::new(name, 0);
    function.global_address(global);
    if load {
        function.emit(IRInstruction::Load);
    }
    function.ret();
    function.finish()
}

/// Add the function registry for `names` plus the startup constructor that hands it
/// to the runtime.
fn add_registry(builder: &mut ModuleBuilder, names: &[String]) -> Result<()> {
    let count = u16::try_from(names.len())
        .map_err(|_| Error::argument("registry", format!("{} functions exceed the registry limit", names.len())))?;

    let mut table = count.to_le_bytes().to_vec();
    for name in names {
        table.extend_from_slice(name.as_bytes());
        table.push(0);
        builder.declare(name, 0);
    }
    builder.global(IRGlobal::constant_bytes(symbol::FUNC_NAMES, table).with_linkage(Linkage::External));
    builder.global(IRGlobal::new(symbol::FUNC_PTRS, GlobalInit::Pointers(names.to_vec())));
    builder.global(IRGlobal::new(
        symbol::FUNC_REGISTRY,
        GlobalInit::Pointers(vec![symbol::FUNC_NAMES.to_string(), symbol::FUNC_PTRS.to_string()]),
    ));
    builder.function(accessor(symbol::REGISTRY_ACCESSOR, symbol::FUNC_REGISTRY, false));

    builder.declare(symbol::RT_REGISTER_SYSTEM_LIB, 1);
    let mut startup = FunctionBuilder::new(symbol::MODULE_STARTUP, 0);
    startup
        .global_address(symbol::FUNC_REGISTRY)
        .call(symbol::RT_REGISTER_SYSTEM_LIB, 1)
        .emit(IRInstruction::Drop)
        .push(0)
        .ret();
    builder.function(startup.finish());
    builder.ctor(STARTUP_PRIORITY, symbol::MODULE_STARTUP);
    Ok(())
}

/// Wrap a synthesized module; administrative plumbing stays out of the catalog.
fn finish(builder: ModuleBuilder, target: &Target) -> NativeModule {
    let (module, exported) = builder.into_parts();
    let exported = exported.into_iter().filter(|name| !symbol::is_reserved(name)).collect();
    NativeModule::from_generated(GeneratedModule::new(module, None, exported), target)
}

/// Metadata module for the C++ runtime. Integer and boolean entries are stored as
/// words; strings and bytes as NUL-terminated constants whose address the accessor
/// returns.
pub fn create_cpp_metadata_module(metadata: Metadata, target: &Target, runtime: &RuntimeConfig) -> Result<Module> {
    let mut suffixes: BTreeMap<String, &str> = BTreeMap::new();
    for key in metadata.keys() {
        if let Some(previous) = suffixes.insert(symbol_suffix(key), key) {
            return Err(Error::argument(
                "create_cpp_metadata_module",
                format!("metadata keys '{}' and '{}' map to the same symbol name", previous, key),
            ));
        }
    }

    let mut builder = ModuleBuilder::new("nativemod_metadata");
    let mut accessors = Vec::new();

    for (suffix, key) in &suffixes {
        let value = &metadata[*key];
        let global_name = format!("{}{}", symbol::METADATA_PREFIX, suffix);
        let getter = format!("{}{}", symbol::METADATA_ACCESSOR_PREFIX, suffix);
        let (init, load) = match value {
            Value::Int(_) | Value::Bool(_) => (GlobalInit::Word(value.as_int().unwrap_or_default()), true),
            Value::Str(text) => (GlobalInit::Bytes([text.as_bytes(), &[0]].concat()), false),
            Value::Bytes(bytes) => (GlobalInit::Bytes([bytes.as_slice(), &[0]].concat()), false),
            other => {
                return Err(Error::argument(
                    "create_cpp_metadata_module",
                    format!("metadata entry '{}' has unsupported type {}", key, other.type_name()),
                ))
            }
        };
        let align = if load { 8 } else { 1 };
        let mut global = IRGlobal::new(&global_name, init).with_align(align);
        global.constant = true;
        builder.global(global);
        builder.function(accessor(&getter, &global_name, load));
        accessors.push(getter);
    }
    if runtime.system_lib {
        add_registry(&mut builder, &accessors)?;
    }

    let wrapper = Module::new(finish(builder, target));
    let meta = Module::new(MetadataModule::new(metadata));
    meta.import(wrapper)?;
    debug!(entries = accessors.len(), %runtime, "cpp metadata module created");
    Ok(meta)
}

/// Registry module for the C runtime, importing every module in `modules`.
pub fn create_crt_metadata_module(modules: &[Module], target: &Target, runtime: &RuntimeConfig) -> Result<Module> {
    let mut names = Vec::new();
    for module in modules {
        let Some(list) = module.get_function(symbol::GET_FUNC_NAMES, false)? else {
            continue;
        };
        if let Value::Array(items) = list.call(&[])? {
            names.extend(items.iter().filter_map(|item| item.as_str().map(str::to_string)));
        }
    }

    if !(runtime.system_lib && runtime.kind == RuntimeKind::Crt) {
        return Err(Error::RegistryRequiresCrt(format!("runtime '{}' for target '{}'", runtime, target)));
    }

    let mut builder = ModuleBuilder::new("nativemod_metadata");
    add_registry(&mut builder, &names)?;
    let registry = Module::new(finish(builder, target));
    for module in modules {
        registry.import(module.clone())?;
    }
    debug!(functions = names.len(), children = modules.len(), "crt registry module created");
    Ok(registry)
}

/// Module embedding `data` as a length-prefixed blob.
pub fn codegen_blob(data: &[u8], system_lib: bool, target: &Target) -> Result<Module> {
    let mut blob = (data.len() as u64).to_le_bytes().to_vec();
    blob.extend_from_slice(data);

    let mut builder = ModuleBuilder::new("nativemod_blob");
    builder.global(IRGlobal::constant_bytes(symbol::DEV_MBLOB, blob).with_linkage(Linkage::External).with_align(8));
    builder.function(accessor(symbol::DEV_MBLOB_ACCESSOR, symbol::DEV_MBLOB, false));
    if system_lib {
        add_registry(&mut builder, &[symbol::DEV_MBLOB_ACCESSOR.to_string()])?;
    }
    Ok(Module::new(finish(builder, target)))
}
