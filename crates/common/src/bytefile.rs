//! Lama bytefile: loading, validation, and the instruction cursor.
//!
//! On disk a bytefile is partitioned as
//!
//! ```text
//! offset 0   u32  string pool size, bytes
//! offset 4   u32  global area size, words
//! offset 8   u32  public symbol count, pairs of u32
//! offset 12  public symbol table, 8 bytes per entry
//!            string pool, NUL-terminated strings back to back
//!            bytecode, to the end of the file
//! ```
//!
//! with every 32-bit field little-endian. The loader checks that each
//! declared region fits strictly inside the file and that at least one
//! byte of bytecode remains, collecting every violation it finds.
//!
//! After loading, the bytefile also plays the role of the instruction
//! cursor: `next_*` reads advance an offset into the bytecode region, and
//! the last opcode position is remembered for diagnostics.

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{DecodeError, LoadError};
use crate::opcode::Scope;

const HEADER_BYTES: u64 = 12;
const SYMBOL_ENTRY_BYTES: u64 = 8;
const CAPTURE_RECORD_BYTES: usize = 5;

/// A loaded, validated bytefile with its read cursor.
#[derive(Debug, Clone)]
pub struct Bytefile {
    data: Vec<u8>,
    globals_size: u32,
    symbol_count: u32,
    pool_start: usize,
    pool_size: usize,
    code_start: usize,
    /// Offset of the next byte to read, relative to the bytecode region.
    ip: usize,
    /// Offset of the most recently fetched opcode byte.
    prev_ip: Option<usize>,
    /// Most recent LINE value, zero before the first LINE instruction.
    line: u32,
}

impl Bytefile {
    /// Load a bytefile from disk.
    ///
    /// Returns either a ready bytefile or the non-empty list of problems
    /// found while validating the header regions.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Vec<LoadError>> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            vec![LoadError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            }]
        })?;
        Self::from_bytes(data)
    }

    /// Validate an in-memory buffer as a bytefile.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, Vec<LoadError>> {
        let file_size = data.len();
        if (file_size as u64) < HEADER_BYTES {
            return Err(vec![LoadError::HeaderTooShort { file_size }]);
        }

        let pool_size = LittleEndian::read_u32(&data[0..4]);
        let globals_size = LittleEndian::read_u32(&data[4..8]);
        let symbol_count = LittleEndian::read_u32(&data[8..12]);

        let mut bag = Vec::new();
        let table_bytes = symbol_count as u64 * SYMBOL_ENTRY_BYTES;
        if HEADER_BYTES + table_bytes >= file_size as u64 {
            bag.push(LoadError::PublicSymbolsOverrun {
                table_bytes,
                file_size,
            });
        }
        // Checked independently so a broken header reports every problem.
        let before_code = HEADER_BYTES + table_bytes + pool_size as u64;
        if before_code >= file_size as u64 {
            bag.push(LoadError::StringPoolOverrun {
                pool_bytes: pool_size as u64,
                remaining: (file_size as u64).saturating_sub(HEADER_BYTES + table_bytes),
            });
        }
        if !bag.is_empty() {
            return Err(bag);
        }

        let pool_start = (HEADER_BYTES + table_bytes) as usize;
        let code_start = before_code as usize;
        Ok(Self {
            data,
            globals_size,
            symbol_count,
            pool_start,
            pool_size: pool_size as usize,
            code_start,
            ip: 0,
            prev_ip: None,
            line: 0,
        })
    }

    /// Size of the global variable area, in words.
    pub fn globals_size(&self) -> u32 {
        self.globals_size
    }

    /// Number of entries in the public symbol table.
    pub fn public_symbols_len(&self) -> usize {
        self.symbol_count as usize
    }

    /// One public symbol table entry: a string-pool offset and a
    /// bytecode offset. Not interpreted by the execution engine.
    pub fn public_symbol(&self, index: usize) -> Option<(u32, u32)> {
        if index >= self.symbol_count as usize {
            return None;
        }
        let at = HEADER_BYTES as usize + index * SYMBOL_ENTRY_BYTES as usize;
        Some((
            LittleEndian::read_u32(&self.data[at..at + 4]),
            LittleEndian::read_u32(&self.data[at + 4..at + 8]),
        ))
    }

    fn code(&self) -> &[u8] {
        &self.data[self.code_start..]
    }

    /// Size of the bytecode region in bytes. Always at least one.
    pub fn code_len(&self) -> usize {
        self.data.len() - self.code_start
    }

    /// Size of the string pool in bytes.
    pub fn pool_len(&self) -> usize {
        self.pool_size
    }

    /// The NUL-terminated string starting at a pool offset, without its
    /// terminator. `None` when the offset is outside the pool.
    pub fn string_at(&self, offset: usize) -> Option<&[u8]> {
        if offset >= self.pool_size {
            return None;
        }
        let pool = &self.data[self.pool_start..self.pool_start + self.pool_size];
        let tail = &pool[offset..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Some(&tail[..end])
    }

    /// Are there at least `bytes` more bytes at the cursor?
    pub fn enough_bytes(&self, bytes: usize) -> bool {
        self.code_len() - self.ip >= bytes
    }

    /// Read the next opcode byte and remember its position.
    ///
    /// The caller must have confirmed one byte remains.
    pub fn next_code(&mut self) -> u8 {
        self.prev_ip = Some(self.ip);
        let byte = self.code()[self.ip];
        self.ip += 1;
        byte
    }

    /// Look at the next byte without advancing.
    pub fn peek_code(&self) -> Option<u8> {
        self.code().get(self.ip).copied()
    }

    /// Read a little-endian u32 operand and advance by four.
    ///
    /// The caller must have confirmed four bytes remain.
    pub fn next_u32(&mut self) -> u32 {
        let value = LittleEndian::read_u32(&self.code()[self.ip..]);
        self.ip += 4;
        value
    }

    /// Read a signed 32-bit operand and advance by four.
    pub fn next_i32(&mut self) -> i32 {
        self.next_u32() as i32
    }

    /// Read a u32 pool offset and resolve it to its string.
    pub fn next_string(&mut self) -> Result<&[u8], DecodeError> {
        if !self.enough_bytes(4) {
            return Err(DecodeError::OutOfInput {
                at: self.ip,
                needed: 4,
            });
        }
        let offset = self.next_u32() as usize;
        if offset >= self.pool_size {
            return Err(DecodeError::BadStringOffset {
                offset,
                pool_size: self.pool_size,
            });
        }
        Ok(self.string_at(offset).expect("offset checked against pool"))
    }

    /// Read `n` packed closure capture records, 5 bytes each.
    pub fn closure_args(&mut self, n: u32) -> Result<Vec<(Scope, u32)>, DecodeError> {
        let needed = (n as usize).saturating_mul(CAPTURE_RECORD_BYTES);
        if !self.enough_bytes(needed) {
            return Err(DecodeError::OutOfInput {
                at: self.ip,
                needed,
            });
        }
        let mut args = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let kind = self.code()[self.ip];
            self.ip += 1;
            let index = self.next_u32();
            args.push((Scope::try_from(kind)?, index));
        }
        Ok(args)
    }

    /// Move the cursor to an absolute bytecode offset, if it is in range.
    pub fn try_set_addr(&mut self, addr: u32) -> bool {
        if (addr as usize) < self.code_len() {
            self.ip = addr as usize;
            true
        } else {
            false
        }
    }

    /// Current cursor offset into the bytecode region.
    pub fn offset(&self) -> usize {
        self.ip
    }

    /// Offset of the most recently fetched opcode, for diagnostics.
    pub fn prev_offset(&self) -> Option<usize> {
        self.prev_ip
    }

    /// The byte at [`Bytefile::prev_offset`].
    pub fn prev_opcode(&self) -> Option<u8> {
        self.prev_ip.map(|at| self.code()[at])
    }

    /// Record the current source line from a LINE instruction.
    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    /// The most recent LINE value, zero when none was seen.
    pub fn line(&self) -> u32 {
        self.line
    }
}
