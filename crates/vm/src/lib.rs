//! The Lama bytecode execution engine.
//!
//! The machine is a value stack of tagged words driven by a dispatch
//! loop over the bytefile's instruction stream. Boxed values live in a
//! garbage-collected [`heap::Heap`] that scans the stack's root window
//! between instructions; the calling convention keeps every scanned
//! word either a boxed small integer or a validated heap handle.
//!
//! # Usage
//!
//! ```no_run
//! use lamarun_common::Bytefile;
//!
//! let bytefile = Bytefile::read("program.bc").expect("a valid bytefile");
//! lamarun_vm::run(bytefile).expect("the program runs to completion");
//! ```

pub mod error;
pub mod execute;
pub mod heap;
pub mod machine;
pub mod stack;

use std::io::{BufRead, Write};

pub use error::{Fault, RuntimeError};
pub use machine::Interp;

use lamarun_common::Bytefile;

/// Execute a bytefile against the process console.
pub fn run(code: Bytefile) -> Result<(), Fault> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_with_io(code, stdin.lock(), stdout.lock())
}

/// Execute a bytefile with injected console streams.
///
/// On failure the returned [`Fault`] carries the last LINE value and the
/// offset and mnemonic of the instruction that faulted.
pub fn run_with_io<R: BufRead, W: Write>(
    code: Bytefile,
    input: R,
    output: W,
) -> Result<(), Fault> {
    let mut interp = match Interp::new(code, input, output) {
        Ok(interp) => interp,
        Err(error) => {
            return Err(Fault {
                line: 0,
                offset: None,
                opcode: None,
                error,
            })
        }
    };
    interp.execute().map_err(|error| Fault {
        line: interp.code.line(),
        offset: interp.code.prev_offset(),
        opcode: interp.code.prev_opcode(),
        error,
    })
}
