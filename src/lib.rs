// Purpose: Define the crate-level module surface for the module manager.
// Inputs/Outputs: Re-exports internal modules for the binary and integration tests.
// Invariants: Public module boundaries should remain stable for internal callers.
// Gotchas: Keep module wiring consistent with the src/main.rs entry path.

pub mod cli;
pub mod config;
pub mod dirhash;
pub mod fetch;
pub mod load;
pub mod modconv;
pub mod modfile;
pub mod module;
pub mod mvs;
pub mod par;
pub mod repo;
pub mod semver;
pub mod vendor;
pub mod web;
