// Purpose: Provide the binary entry for the test build pipeline.
// Inputs/Outputs: Reads process args and returns the process exit code from the CLI dispatcher.
// Invariants: Main must not bypass centralized CLI argument handling.
// Gotchas: Exit codes are the only channel callers script against; keep them stable.

fn main() {
    let code = gophertest::cli::run_cli();
    std::process::exit(code);
}
