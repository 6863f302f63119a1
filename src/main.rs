// Purpose: Provide the binary entry for the vmod CLI.
// Inputs/Outputs: Reads process args and returns the exit code from the CLI dispatcher.
// Invariants: Main must not bypass centralized CLI argument/diagnostic handling.
// Gotchas: VMOD_LOG controls the debug tracer; keep subscriber setup ahead of any work.

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("VMOD_LOG"))
        .with_writer(std::io::stderr)
        .init();
    let code = vmod::cli::run_cli(std::env::args().skip(1));
    std::process::exit(code);
}
