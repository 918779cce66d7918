//! Configuration types and helpers.

mod defaults;
mod fleet;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use fleet::*;
