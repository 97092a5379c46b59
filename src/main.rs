// TamperStack - a composable, tamper-evident I/O layer stack.
//
// A TOML configuration declares a DAG of typed layers; the binary builds
// the tree and runs file operations against the root layer.

mod allocator;

use std::process;

use tamperstack::cli::Cli;

/// Entry point for the stack command wrapper.
///
/// # Exit Codes
/// * 0 - Graceful shutdown
/// * 1 - Fatal configuration or initialization error (message on stderr)
fn main() {
    if let Err(e) = Cli::init().execute() {
        eprintln!("Error: {e:?}");
        process::exit(1);
    }
}
