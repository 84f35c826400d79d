//! Stakecache.
//!
//! Keeps stake account and stake pool facts from a Koios instance in memory, either for a single
//! lookup or as a long running process that keeps a fixed set of keys fresh.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod caches;
mod cli;
mod keys;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            stakecache::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
