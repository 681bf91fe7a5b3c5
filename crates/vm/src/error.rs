//! Runtime errors for the interpreter.
//!
//! Every variant that can be tied to an instruction carries `at`, the
//! bytecode offset of the opcode that faulted. The [`Fault`] wrapper is
//! what leaves the crate: it adds the source line and mnemonic context
//! expected of the final diagnostic.

use std::fmt;

use lamarun_common::{DecodeError, Opcode, Scope};
use thiserror::Error;

use crate::heap::HeapError;

/// Errors that abort execution. There is no recovery: the first error
/// unwinds through the dispatch loop and stops the machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The instruction stream could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A push or prologue would cross the lower bound of the stack.
    #[error("value stack overflow at {at:#x}")]
    StackOverflow { at: usize },

    /// A pop or epilogue would consume more than the stack holds.
    #[error("value stack underflow at {at:#x}")]
    StackUnderflow { at: usize },

    /// A jump, call, or return target lies outside the bytecode.
    #[error("target {target:#x} is outside the bytecode, at {at:#x}")]
    JumpOutOfBounds { at: usize, target: usize },

    /// A call landed on something other than a function prologue.
    #[error("call target {target:#x} starts with {found:#04x}, not a BEGIN, at {at:#x}")]
    CallTargetNotBegin { at: usize, target: u32, found: u8 },

    /// A variable reference was out of bounds for its kind.
    #[error("cannot reference {scope}({index}) at {at:#x}")]
    BadReference { at: usize, scope: Scope, index: u32 },

    /// A heap operation was applied to the wrong kind of word or object.
    #[error("{source}, at {at:#x}")]
    Heap { at: usize, source: HeapError },

    /// STA received a sink that is neither an index nor a reference.
    #[error("store target is not a reference at {at:#x}")]
    BadStoreTarget { at: usize },

    /// Integer division or remainder by zero.
    #[error("division by zero at {at:#x}")]
    DivisionByZero { at: usize },

    /// The bytecode executed FAIL.
    #[error("match failure on {a}, {b} at {at:#x}")]
    Failure { at: usize, a: String, b: String },

    /// STI is reserved and never emitted by the compiler.
    #[error("reserved instruction STI at {at:#x}")]
    ReservedInstruction { at: usize },

    /// Console input could not produce an integer.
    #[error("cannot read an integer: {reason}")]
    Input { reason: String },

    /// Console output failed.
    #[error("cannot write output: {reason}")]
    Output { reason: String },
}

/// A terminal diagnostic: the runtime error plus where it happened.
///
/// `line` is the most recent LINE value (zero when none was executed),
/// `offset` and `opcode` locate the faulting instruction when one was
/// fetched at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub line: u32,
    pub offset: Option<usize>,
    pub opcode: Option<u8>,
    pub error: RuntimeError,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(offset) => {
                write!(f, "at {offset:#x}")?;
                let mnemonic = self
                    .opcode
                    .and_then(|b| Opcode::try_from(b).ok())
                    .map(|op| op.mnemonic());
                if let Some(m) = mnemonic {
                    write!(f, " ({m})")?;
                }
            }
            None => write!(f, "before the first opcode")?,
        }
        if self.line != 0 {
            write!(f, ", source line {}", self.line)?;
        }
        write!(f, ": {}", self.error)
    }
}

impl std::error::Error for Fault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
