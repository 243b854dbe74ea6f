/// Process-wide table of named entry points
///
/// Build, load and metadata operations are reachable by name so that drivers can
/// dispatch on strings. Every entry is a [`PackedFunc`]; arguments are checked and
/// converted here, mismatches become `Error::ArgumentMismatch`.
use crate::error::{Error, Result};
use crate::ir::parse_module;
use crate::module::{
    codegen_blob, create_cpp_metadata_module, create_crt_metadata_module, GeneratedModule, Metadata, Module, NativeModule,
    PackedFunc, RuntimeConfig, Value,
};
use crate::symbol;
use crate::target::{target_enabled, Target};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

static REGISTRY: OnceLock<RwLock<BTreeMap<String, PackedFunc>>> = OnceLock::new();

fn table() -> &'static RwLock<BTreeMap<String, PackedFunc>> {
    REGISTRY.get_or_init(|| RwLock::new(builtin_functions()))
}

/// Register `function` under `name`, replacing any previous entry.
pub fn register(name: &str, function: PackedFunc) {
    table().write().insert(name.to_string(), function);
}

pub fn get(name: &str) -> Option<PackedFunc> {
    table().read().get(name).cloned()
}

pub fn list_names() -> Vec<String> {
    table().read().keys().cloned().collect()
}

/// Call the entry registered as `name`.
pub fn call(name: &str, args: &[Value]) -> Result<Value> {
    let function = get(name).ok_or_else(|| Error::argument(name, "no function registered under this name"))?;
    function.call(args)
}

fn arg<'a>(function: &str, args: &'a [Value], index: usize) -> Result<&'a Value> {
    args.get(index)
        .ok_or_else(|| Error::argument(function, format!("missing argument {}", index)))
}

fn str_arg<'a>(function: &str, args: &'a [Value], index: usize) -> Result<&'a str> {
    let value = arg(function, args, index)?;
    value
        .as_str()
        .ok_or_else(|| Error::argument(function, format!("argument {} must be a string, got {}", index, value.type_name())))
}

fn target_arg(function: &str, args: &[Value], index: usize) -> Result<Target> {
    Ok(str_arg(function, args, index)?.parse()?)
}

fn module_list(function: &str, value: &Value) -> Result<Vec<Module>> {
    let Value::Array(items) = value else {
        return Err(Error::argument(function, format!("expected an array of modules, got {}", value.type_name())));
    };
    items
        .iter()
        .map(|item| item.as_module().cloned().ok_or_else(|| Error::argument(function, "array holds a non-module value")))
        .collect()
}

fn metadata_arg(function: &str, value: &Value) -> Result<Metadata> {
    let Value::Array(entries) = value else {
        return Err(Error::argument(function, format!("expected an array of [key, value] pairs, got {}", value.type_name())));
    };
    let mut metadata = Metadata::new();
    for entry in entries {
        match entry {
            Value::Array(pair) if pair.len() == 2 => {
                let key = pair[0].as_str().ok_or_else(|| Error::argument(function, "metadata key must be a string"))?;
                metadata.insert(key.to_string(), pair[1].clone());
            }
            _ => return Err(Error::argument(function, "metadata entry must be a [key, value] pair")),
        }
    }
    Ok(metadata)
}

fn load_file(function: &str, args: &[Value]) -> Result<Value> {
    let path = str_arg(function, args, 0)?;
    Ok(Value::Module(Module::new(NativeModule::load_from_file(Path::new(path))?)))
}

/// Identifier of a runtime support entry point, starting at 1. Zero means the name
/// is not an intrinsic.
pub fn lookup_intrinsic_id(name: &str) -> i64 {
    nativemod_runtime::support_symbols()
        .iter()
        .position(|(symbol, _)| *symbol == name)
        .map_or(0, |index| index as i64 + 1)
}

pub fn intrinsic_name(id: i64) -> Option<&'static str> {
    let index = usize::try_from(id).ok()?.checked_sub(1)?;
    nativemod_runtime::support_symbols().get(index).map(|(name, _)| *name)
}

fn builtin_functions() -> BTreeMap<String, PackedFunc> {
    let mut functions = BTreeMap::new();
    let mut add = |name: &str, body: fn(&str, &[Value]) -> Result<Value>| {
        let owned = name.to_string();
        functions.insert(owned.clone(), PackedFunc::new(name, move |args| body(&owned, args)));
    };

    // (module text, entry function or null, target)
    add("target.build.native", |f, args| {
        let module = parse_module(str_arg(f, args, 0)?).map_err(|e| Error::argument(f, e.to_string()))?;
        let entry = match arg(f, args, 1)? {
            Value::Null => None,
            other => Some(other.as_str().ok_or_else(|| Error::argument(f, "entry function must be a string or null"))?),
        };
        let target = target_arg(f, args, 2)?;
        let exported = module
            .external_definitions()
            .map(|function| function.name.clone())
            .filter(|name| !symbol::is_reserved(name))
            .collect();
        let generated = GeneratedModule::new(module, entry, exported);
        Ok(Value::Module(Module::new(NativeModule::from_generated(generated, &target))))
    });
    add("codegen.create_native_module", |f, args| {
        let target = target_arg(f, args, 0)?;
        let name = str_arg(f, args, 1)?;
        Ok(Value::Module(Module::new(NativeModule::create_empty(&target, name))))
    });
    add("runtime.module.loadfile_ll", load_file);
    add("runtime.module.loadfile_bc", load_file);
    add("runtime.create_crt_metadata_module", |f, args| {
        let modules = module_list(f, arg(f, args, 0)?)?;
        let target = target_arg(f, args, 1)?;
        let runtime = RuntimeConfig::parse(str_arg(f, args, 2)?)?;
        Ok(Value::Module(create_crt_metadata_module(&modules, &target, &runtime)?))
    });
    add("runtime.create_cpp_metadata_module", |f, args| {
        let metadata = metadata_arg(f, arg(f, args, 0)?)?;
        let target = target_arg(f, args, 1)?;
        let runtime = RuntimeConfig::parse(str_arg(f, args, 2)?)?;
        Ok(Value::Module(create_cpp_metadata_module(metadata, &target, &runtime)?))
    });
    add("codegen.codegen_blob", |f, args| {
        let data = match arg(f, args, 0)? {
            Value::Bytes(bytes) => bytes.clone(),
            Value::Str(text) => text.clone().into_bytes(),
            other => return Err(Error::argument(f, format!("blob must be bytes, got {}", other.type_name()))),
        };
        let system_lib = arg(f, args, 1)?.as_bool().ok_or_else(|| Error::argument(f, "system_lib must be a bool"))?;
        let target = target_arg(f, args, 2)?;
        Ok(Value::Module(codegen_blob(&data, system_lib, &target)?))
    });
    add("target.lookup_intrinsic_id", |f, args| Ok(Value::Int(lookup_intrinsic_id(str_arg(f, args, 0)?))));
    add("target.get_intrinsic_name", |f, args| {
        let id = arg(f, args, 0)?.as_int().ok_or_else(|| Error::argument(f, "intrinsic id must be an int"))?;
        Ok(Value::Str(intrinsic_name(id).unwrap_or_default().to_string()))
    });
    add("target.backend_version_major", |_, _| {
        Ok(Value::Int(env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or_default()))
    });
    add("codegen.target_enabled", |f, args| {
        let enabled = str_arg(f, args, 0)?.parse::<Target>().is_ok_and(|target| target_enabled(target.arch()));
        Ok(Value::Bool(enabled))
    });
    functions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::print_module;

    #[test]
    fn builtins_are_registered() {
        let names = list_names();
        for name in [
            "target.build.native",
            "codegen.create_native_module",
            "runtime.module.loadfile_ll",
            "runtime.module.loadfile_bc",
            "runtime.create_crt_metadata_module",
            "runtime.create_cpp_metadata_module",
            "codegen.codegen_blob",
            "target.lookup_intrinsic_id",
            "target.get_intrinsic_name",
            "target.backend_version_major",
            "codegen.target_enabled",
        ] {
            assert!(names.iter().any(|n| n == name), "{} missing", name);
        }
    }

    #[test]
    fn intrinsic_ids_round_trip() {
        let id = call("target.lookup_intrinsic_id", &[Value::Str("__rt_free".into())]).unwrap();
        assert_eq!(id, Value::Int(2));
        let name = call("target.get_intrinsic_name", &[id]).unwrap();
        assert_eq!(name, Value::Str("__rt_free".into()));
        assert_eq!(lookup_intrinsic_id("memcpy"), 0);
        assert_eq!(intrinsic_name(0), None);
    }

    #[test]
    fn target_enabled_checks_backends() {
        let enabled = |t: &str| call("codegen.target_enabled", &[Value::Str(t.into())]).unwrap();
        assert_eq!(enabled("native -mtriple=aarch64-unknown-linux-gnu"), Value::Bool(true));
        assert_eq!(enabled("native -mtriple=riscv64-unknown-linux-gnu"), Value::Bool(false));
        assert_eq!(enabled("cuda"), Value::Bool(false));
    }

    #[test]
    fn creates_and_loads_modules() {
        let target = Value::Str("native -mtriple=x86_64-unknown-linux-gnu".into());
        let created = call("codegen.create_native_module", &[target.clone(), Value::Str("empty".into())]).unwrap();
        let created = created.as_module().unwrap();
        let native = created.downcast_ref::<NativeModule>().unwrap();
        assert_eq!(native.module_name(), "empty");

        let path = std::env::temp_dir().join("nativemod_registry_load.ll");
        native.with_module(|module| std::fs::write(&path, print_module(module))).unwrap();
        let loaded = call("runtime.module.loadfile_ll", &[Value::Str(path.display().to_string()), Value::Str("ll".into())]).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.as_module().unwrap().type_key(), "native");
    }

    #[test]
    fn builds_from_module_text() {
        let text = "; ModuleID = 'gen'\nsource_filename = \"gen\"\n\ndefine external @one(0) locals 0 {\n  push 1\n  ret\n}\n";
        let target = Value::Str("native -mtriple=aarch64-unknown-linux-gnu".into());
        let built = call("target.build.native", &[Value::Str(text.into()), Value::Str("one".into()), target]).unwrap();
        let module = built.as_module().unwrap();
        assert!(module.implements_function("one", false));
        assert!(module.get_source("ll").unwrap().contains("@__module_main"));
    }

    #[test]
    fn argument_errors_name_the_function() {
        let err = call("codegen.codegen_blob", &[Value::Int(1)]).unwrap_err();
        assert!(matches!(&err, Error::ArgumentMismatch { function, .. } if function == "codegen.codegen_blob"));

        let runtime = Value::Str("cpp".into());
        let target = Value::Str("native -mtriple=x86_64-unknown-linux-gnu".into());
        let err = call("runtime.create_crt_metadata_module", &[Value::Array(vec![]), target, runtime]).unwrap_err();
        assert!(matches!(err, Error::RegistryRequiresCrt(_)));
        assert!(call("no.such.function", &[]).is_err());
    }
}
