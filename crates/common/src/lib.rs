//! Shared foundations of the Lama bytecode interpreter:
//!
//! - [`word`]: the machine [`Word`], the low-bit tagging convention, and
//!   the reference-word encoding used by the LDA/STA pair
//! - [`Opcode`]: the instruction set with its decode table
//! - [`Bytefile`]: the on-disk container with header validation, string
//!   pool, public symbols, and the instruction cursor
//! - [`LoadError`] / [`DecodeError`]: everything that can go wrong
//!   before an instruction executes

pub mod bytefile;
pub mod error;
pub mod opcode;
pub mod word;

pub use bytefile::Bytefile;
pub use error::{DecodeError, LoadError};
pub use opcode::{Opcode, Scope};
pub use word::Word;
