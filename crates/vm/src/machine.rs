//! Interpreter state: the bytefile cursor, the value stack, the heap,
//! and the console.

use std::io::{BufRead, Write};

use lamarun_common::{Bytefile, Scope, Word};

use crate::error::RuntimeError;
use crate::heap::{Heap, HeapError};
use crate::stack::{Place, StackError, ValueStack};

/// What one dispatched instruction asks of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// The interpreter. `R` feeds `Lread`, `W` receives `Lwrite` output.
pub struct Interp<R, W> {
    pub(crate) code: Bytefile,
    pub(crate) stack: ValueStack,
    pub(crate) heap: Heap,
    /// Set by CALLC so the matching epilogue pops the closure handle.
    pub(crate) closure_call: bool,
    pub(crate) input: R,
    pub(crate) output: W,
}

impl<R: BufRead, W: Write> Interp<R, W> {
    /// Build an interpreter over a loaded bytefile. Sizes the global
    /// area from the header and initializes the heap.
    pub fn new(code: Bytefile, input: R, output: W) -> Result<Self, RuntimeError> {
        let stack = ValueStack::new(code.globals_size())
            .map_err(|_| RuntimeError::StackOverflow { at: 0 })?;
        Ok(Self {
            code,
            stack,
            heap: Heap::new(),
            closure_call: false,
            input,
            output,
        })
    }

    /// The bytecode offset blamed in errors: the opcode being executed,
    /// or the cursor when none has been fetched yet.
    pub(crate) fn at(&self) -> usize {
        self.code.prev_offset().unwrap_or_else(|| self.code.offset())
    }

    /// Check that `n` operand bytes remain at the cursor.
    pub(crate) fn need(&self, n: usize) -> Result<(), RuntimeError> {
        if self.code.enough_bytes(n) {
            Ok(())
        } else {
            Err(lamarun_common::DecodeError::OutOfInput {
                at: self.code.offset(),
                needed: n,
            }
            .into())
        }
    }

    pub(crate) fn stack_err(&self, e: StackError) -> RuntimeError {
        match e {
            StackError::Overflow => RuntimeError::StackOverflow { at: self.at() },
            StackError::Underflow => RuntimeError::StackUnderflow { at: self.at() },
        }
    }

    pub(crate) fn heap_err(&self, source: HeapError) -> RuntimeError {
        RuntimeError::Heap {
            at: self.at(),
            source,
        }
    }

    pub(crate) fn push(&mut self, w: Word) -> Result<(), RuntimeError> {
        self.stack.push(w).map_err(|e| self.stack_err(e))
    }

    pub(crate) fn pop(&mut self) -> Result<Word, RuntimeError> {
        self.stack.pop().map_err(|e| self.stack_err(e))
    }

    /// Resolve a variable, or report which reference was bad.
    pub(crate) fn resolve(&self, scope: Scope, index: u32) -> Result<Place, RuntimeError> {
        self.stack
            .reference(scope, index)
            .ok_or(RuntimeError::BadReference {
                at: self.at(),
                scope,
                index,
            })
    }

    /// Read through a resolved place.
    pub(crate) fn read_place(
        &self,
        place: Place,
        scope: Scope,
        index: u32,
    ) -> Result<Word, RuntimeError> {
        match place {
            Place::Slot(slot) => self.stack.get(slot).ok_or(RuntimeError::BadReference {
                at: self.at(),
                scope,
                index,
            }),
            Place::Capture { closure, cell } => {
                self.heap.capture(closure, cell).map_err(|e| self.heap_err(e))
            }
        }
    }

    /// Write through a resolved place.
    pub(crate) fn write_place(
        &mut self,
        place: Place,
        value: Word,
        scope: Scope,
        index: u32,
    ) -> Result<(), RuntimeError> {
        match place {
            Place::Slot(slot) => {
                if self.stack.set(slot, value) {
                    Ok(())
                } else {
                    Err(RuntimeError::BadReference {
                        at: self.at(),
                        scope,
                        index,
                    })
                }
            }
            Place::Capture { closure, cell } => self
                .heap
                .set_capture(closure, cell, value)
                .map_err(|e| self.heap_err(e)),
        }
    }
}
