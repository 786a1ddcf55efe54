// Purpose: Define the crate-level module surface for the test build pipeline.
// Inputs/Outputs: Re-exports internal modules for the binary and integration callers.
// Invariants: Public module boundaries should remain stable for internal callers.
// Gotchas: Keep module wiring consistent with the src/main.rs entry path.

pub mod buildctx;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod dag;
pub mod errors;
pub mod gosrc;
pub mod hasher;
pub mod linker;
pub mod maingen;
pub mod pkg;
pub mod rewrite;
pub mod util;
