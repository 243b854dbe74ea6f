use nativemod::module::RuntimeConfig;
use nativemod::{registry, Module, NativeModule, Value};
use std::env;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn usage() {
    println!("nativemod v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage:");
    println!("  nativemod emit <input.ll|input.bc> -o <output> [--format o|s|ll|bc]");
    println!("  nativemod run <input.ll|input.bc> <function> [int args...]");
    println!("  nativemod registry <output> [--runtime \"crt --system-lib\"] [--target <target>] <inputs...>");
    println!("  nativemod blob <data-file> -o <output> [--system-lib] [--target <target>]");
    println!("  nativemod functions");
    println!();
    println!("Targets look like: native -mtriple=x86_64-unknown-linux-gnu -mcpu=generic");
    println!("Set NATIVEMOD_LOG (e.g. NATIVEMOD_LOG=debug) for diagnostics.");
}

/// Value following `flag`, removed from `args` together with the flag.
fn take_option(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let index = args.iter().position(|arg| arg == flag)?;
    if index + 1 >= args.len() {
        return None;
    }
    let value = args.remove(index + 1);
    args.remove(index);
    Some(value)
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    match args.iter().position(|arg| arg == flag) {
        Some(index) => {
            args.remove(index);
            true
        }
        None => false,
    }
}

fn load(path: &str) -> Result<Module, String> {
    NativeModule::load_from_file(Path::new(path)).map(Module::new).map_err(|e| e.to_string())
}

fn emit(mut args: Vec<String>) -> Result<(), String> {
    let output = take_option(&mut args, "-o").ok_or("emit requires -o <output>")?;
    let format = take_option(&mut args, "--format").unwrap_or_default();
    let input = args.first().ok_or("emit requires an input file")?;
    load(input)?.save_to_file(Path::new(&output), &format).map_err(|e| e.to_string())?;
    println!("Wrote '{}'", output);
    Ok(())
}

fn run(args: Vec<String>) -> Result<(), String> {
    let [input, function, rest @ ..] = args.as_slice() else {
        return Err("run requires an input file and a function name".to_string());
    };
    let values = rest
        .iter()
        .map(|arg| arg.parse::<i64>().map(Value::Int).map_err(|_| format!("'{}' is not an integer", arg)))
        .collect::<Result<Vec<_>, _>>()?;

    let module = load(input)?;
    let packed = module
        .get_function(function, true)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("function '{}' not found", function))?;
    let result = packed.call(&values).map_err(|e| e.to_string())?;
    println!("{:?}", result);
    Ok(())
}

fn build_registry(mut args: Vec<String>) -> Result<(), String> {
    let runtime = take_option(&mut args, "--runtime").unwrap_or_else(|| "crt --system-lib".to_string());
    let target = take_option(&mut args, "--target").unwrap_or_else(|| "native".to_string());
    let (output, inputs) = args.split_first().ok_or("registry requires an output file")?;

    RuntimeConfig::parse(&runtime).map_err(|e| e.to_string())?;
    let modules = inputs.iter().map(|input| load(input).map(Value::Module)).collect::<Result<Vec<_>, _>>()?;
    let registry = registry::call(
        "runtime.create_crt_metadata_module",
        &[Value::Array(modules), Value::Str(target), Value::Str(runtime)],
    )
    .map_err(|e| e.to_string())?;
    let module = registry.as_module().ok_or("registry builder returned no module")?;
    module.save_to_file(Path::new(output), "").map_err(|e| e.to_string())?;
    println!("Wrote registry of {} modules to '{}'", inputs.len(), output);
    Ok(())
}

fn blob(mut args: Vec<String>) -> Result<(), String> {
    let output = take_option(&mut args, "-o").ok_or("blob requires -o <output>")?;
    let target = take_option(&mut args, "--target").unwrap_or_else(|| "native".to_string());
    let system_lib = take_flag(&mut args, "--system-lib");
    let input = args.first().ok_or("blob requires a data file")?;
    let data = std::fs::read(input).map_err(|e| format!("Failed to read '{}': {}", input, e))?;

    let module = registry::call("codegen.codegen_blob", &[Value::Bytes(data), Value::Bool(system_lib), Value::Str(target)])
        .map_err(|e| e.to_string())?;
    let module = module.as_module().ok_or("blob builder returned no module")?;
    module.save_to_file(Path::new(&output), "").map_err(|e| e.to_string())?;
    println!("Wrote '{}'", output);
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("NATIVEMOD_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        usage();
        return ExitCode::SUCCESS;
    }
    let command = args.remove(0);

    let result = match command.as_str() {
        "emit" => emit(args),
        "run" => run(args),
        "registry" => build_registry(args),
        "blob" => blob(args),
        "functions" => {
            registry::list_names().iter().for_each(|name| println!("{}", name));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            usage();
            Ok(())
        }
        other => Err(format!("unknown command '{}'", other)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
