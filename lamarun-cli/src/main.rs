//! lamarun: run a compiled Lama bytefile.
//!
//! Exit codes:
//! - 0: the program ran to completion
//! - 1: usage or load error
//! - 3: runtime error

use std::process;

use lamarun_common::Bytefile;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: lamarun <file.bc>");
        eprintln!();
        eprintln!("Runs the Lama bytefile at the given path.");
        process::exit(1);
    }

    let bytefile = match Bytefile::read(&args[1]) {
        Ok(bytefile) => bytefile,
        Err(errors) => {
            for e in &errors {
                eprintln!("error: {e}");
            }
            process::exit(1);
        }
    };

    tracing::debug!(
        target: "lamarun",
        code_bytes = bytefile.code_len(),
        pool_bytes = bytefile.pool_len(),
        globals = bytefile.globals_size(),
        public_symbols = bytefile.public_symbols_len(),
        "bytefile loaded"
    );

    if let Err(fault) = lamarun_vm::run(bytefile) {
        eprintln!("error: {fault}");
        process::exit(3);
    }
}
