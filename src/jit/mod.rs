/// Just-in-time execution of lowered modules
///
/// ## Module Structure
/// - `memory`: executable code and writable data maps
/// - `engine`: the execution engine built from one module
/// - `resolver`: symbol lookup in both directions
mod engine;
mod memory;
mod resolver;

pub use engine::{EngineError, EngineId, ExecutionEngine};
pub use memory::{CodeRegion, DataRegion};
pub use resolver::{LookupChain, NoSymbols, RuntimeSymbols, SymbolLookup, SymbolResolver};
