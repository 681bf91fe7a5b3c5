//! Load and decode errors for Lama bytefiles.

use thiserror::Error;

/// Errors detected while loading a bytefile from disk.
///
/// The loader validates every declared region before handing out a
/// [`crate::Bytefile`], and reports all problems it found at once rather
/// than stopping at the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The file could not be opened or read.
    #[error("cannot read '{path}': {reason}")]
    Io { path: String, reason: String },

    /// The file is too short to contain the 12-byte header.
    #[error("file is {file_size} bytes, header alone needs 12")]
    HeaderTooShort { file_size: usize },

    /// The declared public-symbol table runs past the end of the file.
    #[error("public symbol table is {table_bytes} bytes, while file size is {file_size} bytes")]
    PublicSymbolsOverrun { table_bytes: u64, file_size: usize },

    /// The declared string pool runs past the end of the file, or leaves
    /// no room for bytecode.
    #[error("string pool is {pool_bytes} bytes, while remaining file size is {remaining} bytes")]
    StringPoolOverrun { pool_bytes: u64, remaining: u64 },
}

/// Errors detected while decoding the instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The opcode byte does not name any instruction.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// An instruction needed more operand bytes than the bytecode holds.
    #[error("bytecode ends at {at:#x}, {needed} more byte(s) required")]
    OutOfInput { at: usize, needed: usize },

    /// A string operand pointed outside the string pool.
    #[error("string offset {offset} is outside the {pool_size}-byte pool")]
    BadStringOffset { offset: usize, pool_size: usize },

    /// A closure capture descriptor carried an unknown variable kind.
    #[error("unknown capture kind {kind:#04x}")]
    BadCaptureKind { kind: u8 },
}
