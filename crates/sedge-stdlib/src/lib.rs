//! Standard library modules for the Sedge runtime.
//!
//! Each module is a table of host callbacks built on the engine's
//! C-callback ABI: `(vm, self, args) -> value`. Modules construct a
//! namespace hash that the embedder binds into a script's scope.

pub mod math;
