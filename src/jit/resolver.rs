/// Symbol resolution for JIT engines
///
/// Two directions: names referenced by generated code are resolved to host
/// addresses through a [`LookupChain`], and globals or functions of a built engine
/// are located by name through a [`SymbolResolver`].
use super::engine::ExecutionEngine;
use std::collections::HashMap;

/// Source of host addresses for names a module declares but does not define.
pub trait SymbolLookup: Send + Sync {
    fn lookup_symbol(&self, name: &str) -> Option<usize>;
}

/// Entry points exported by `nativemod-runtime`.
pub struct RuntimeSymbols;

impl SymbolLookup for RuntimeSymbols {
    fn lookup_symbol(&self, name: &str) -> Option<usize> {
        nativemod_runtime::lookup(name)
    }
}

/// Resolves nothing.
pub struct NoSymbols;

impl SymbolLookup for NoSymbols {
    fn lookup_symbol(&self, _name: &str) -> Option<usize> {
        None
    }
}

impl<F> SymbolLookup for F
where
    F: Fn(&str) -> Option<usize> + Send + Sync,
{
    fn lookup_symbol(&self, name: &str) -> Option<usize> {
        self(name)
    }
}

/// Lookup order for pending relocations: explicit engine mappings, the runtime
/// support table, then whatever the owner of the engine imports.
pub struct LookupChain<'a> {
    pub mappings: &'a HashMap<String, usize>,
    pub imports: &'a dyn SymbolLookup,
}

impl LookupChain<'_> {
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.mappings
            .get(name)
            .copied()
            .or_else(|| RuntimeSymbols.lookup_symbol(name))
            .or_else(|| self.imports.lookup_symbol(name))
    }
}

/// Name-based access to the globals and functions of a built engine.
///
/// Both lookups first check that the module actually has a symbol of that kind, so a
/// function name never resolves as a global and vice versa.
pub struct SymbolResolver<'a> {
    engine: &'a ExecutionEngine,
}

impl<'a> SymbolResolver<'a> {
    pub fn new(engine: &'a ExecutionEngine) -> Self {
        Self { engine }
    }

    pub fn global_address(&self, name: &str) -> Option<usize> {
        self.engine.module().get_global(name)?;
        self.engine.global_address(name)
    }

    /// Address of a defined function. Declarations never resolve here, and nothing
    /// resolves before pending relocations are finalized.
    pub fn function_address(&self, name: &str) -> Option<usize> {
        self.engine.module().get_definition(name)?;
        if !self.engine.is_finalized() {
            return None;
        }
        self.engine.defined_function_address(name)
    }

    /// NUL-terminated string stored in the global `name`.
    pub fn read_c_string(&self, name: &str) -> Option<String> {
        self.global_address(name)?;
        let bytes = self.engine.global_bytes(name)?;
        let end = bytes.iter().position(|&b| b == 0)?;
        String::from_utf8(bytes[..end].to_vec()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_prefers_explicit_mappings() {
        let mut mappings = HashMap::new();
        mappings.insert("__rt_alloc".to_string(), 0x1234);
        let imports = |name: &str| (name == "child_fn").then_some(0x5678);
        let chain = LookupChain { mappings: &mappings, imports: &imports };

        assert_eq!(chain.resolve("__rt_alloc"), Some(0x1234));
        assert_eq!(chain.resolve("__rt_free"), nativemod_runtime::lookup("__rt_free"));
        assert_eq!(chain.resolve("child_fn"), Some(0x5678));
        assert_eq!(chain.resolve("missing"), None);
    }
}
