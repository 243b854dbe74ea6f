/// Well-known symbol names shared by generated modules, the JIT and the metadata builder

/// Global holding the NUL-terminated name of the module entry function.
pub const MODULE_MAIN: &str = "__module_main";

/// Pointer-sized slot receiving the identity of the owning module wrapper.
pub const MODULE_CTX: &str = "__module_ctx";

/// Static constructor registering a system-lib module with the runtime.
pub const MODULE_STARTUP: &str = "__module_startup";

/// Named metadata carrying the canonical target string.
pub const TARGET_METADATA_KEY: &str = "nativemod.target";

/// Looked up once after the engine is built to force finalization of pending relocations.
pub const FORCE_FINALIZE_SYMBOL: &str = "__nativemod_nonexistent_symbol_b49f8aaade5877eaba7583b91";

// Administrative lookups answered without the JIT engine
pub const IS_SYSTEM_LIB: &str = "__module_is_system_lib";
pub const GET_FUNC_NAMES: &str = "get_func_names";
pub const GET_TARGET_STRING: &str = "_get_target_string";
pub const GET_SYMBOL: &str = "get_symbol";
pub const GET_CONST_VARS: &str = "get_const_vars";

// Registry module
pub const FUNC_NAMES: &str = "__module_func_names";
pub const FUNC_PTRS: &str = "__module_func_ptrs";
pub const FUNC_REGISTRY: &str = "__module_func_registry";
pub const REGISTRY_ACCESSOR: &str = "__module_registry";

// Embedded device blob
pub const DEV_MBLOB: &str = "__module_dev_mblob";
pub const DEV_MBLOB_ACCESSOR: &str = "__module_dev_mblob_get";

pub const METADATA_PREFIX: &str = "__metadata_";
pub const METADATA_ACCESSOR_PREFIX: &str = "__get_metadata_";

/// Runtime support entry points and the context slot each one is written into.
pub const CONTEXT_FUNCTIONS: [(&str, &str); 4] = [
    ("__ctx_alloc", "__rt_alloc"),
    ("__ctx_free", "__rt_free"),
    ("__ctx_set_last_error", "__rt_set_last_error"),
    ("__ctx_register_system_lib", "__rt_register_system_lib"),
];

pub const RT_REGISTER_SYSTEM_LIB: &str = "__rt_register_system_lib";

/// Names reserved for administrative plumbing; never part of a function catalog.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with("__")
}
