//! The dispatch loop and one handler per opcode family.

use std::io::{BufRead, Write};

use lamarun_common::word::{self, Word};
use lamarun_common::{Opcode, Scope};

use crate::error::RuntimeError;
use crate::machine::{Flow, Interp};
use crate::stack::Place;

/// Which scope a load/store family member addresses.
fn scope_of(op: Opcode) -> Scope {
    match op {
        Opcode::LdGlobal | Opcode::LdaGlobal | Opcode::StGlobal => Scope::Global,
        Opcode::LdLocal | Opcode::LdaLocal | Opcode::StLocal => Scope::Local,
        Opcode::LdArgument | Opcode::LdaArgument | Opcode::StArgument => Scope::Argument,
        _ => Scope::Captured,
    }
}

impl<R: BufRead, W: Write> Interp<R, W> {
    /// Run until the program stops or an instruction faults.
    pub fn execute(&mut self) -> Result<(), RuntimeError> {
        loop {
            match self.step()? {
                Flow::Continue => {}
                Flow::Stop => return Ok(()),
            }
        }
    }

    /// Fetch, decode, and execute one instruction.
    pub(crate) fn step(&mut self) -> Result<Flow, RuntimeError> {
        self.need(1)?;
        let byte = self.code.next_code();
        let op = Opcode::try_from(byte)?;
        tracing::trace!(target: "lamarun::interp", at = self.at(), op = op.mnemonic());

        match op {
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Rem
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::And
            | Opcode::Or => self.exec_binop(op)?,

            Opcode::Const => self.exec_const()?,
            Opcode::String => self.exec_string()?,
            Opcode::Sexp => self.exec_sexp()?,
            Opcode::Sti => {
                return Err(RuntimeError::ReservedInstruction { at: self.at() });
            }
            Opcode::Sta => self.exec_sta()?,
            Opcode::Jmp => self.exec_jmp()?,
            Opcode::End | Opcode::Ret => return self.exec_leave(),
            Opcode::Drop => {
                self.require_pop(1)?;
                self.pop()?;
            }
            Opcode::Dup => self.exec_dup()?,
            Opcode::Swap => self.exec_swap()?,
            Opcode::Elem => self.exec_elem()?,

            Opcode::LdGlobal | Opcode::LdLocal | Opcode::LdArgument | Opcode::LdCaptured => {
                self.exec_load(scope_of(op))?
            }
            Opcode::LdaGlobal | Opcode::LdaLocal | Opcode::LdaArgument | Opcode::LdaCaptured => {
                self.exec_load_address(scope_of(op))?
            }
            Opcode::StGlobal | Opcode::StLocal | Opcode::StArgument | Opcode::StCaptured => {
                self.exec_store(scope_of(op))?
            }

            Opcode::CJmpZ => self.exec_cond_jump(false)?,
            Opcode::CJmpNz => self.exec_cond_jump(true)?,
            Opcode::Begin | Opcode::CBegin => self.exec_begin()?,
            Opcode::Closure => self.exec_closure()?,
            Opcode::CallC => self.exec_call_closure()?,
            Opcode::Call => self.exec_call()?,
            Opcode::Tag => self.exec_tag()?,
            Opcode::Array => self.exec_array()?,
            Opcode::Fail => return Err(self.exec_fail()),
            Opcode::Line => {
                self.need(4)?;
                let line = self.code.next_u32();
                self.code.set_line(line);
            }

            Opcode::PattStrEq
            | Opcode::PattString
            | Opcode::PattArray
            | Opcode::PattSexp
            | Opcode::PattBoxed
            | Opcode::PattUnboxed
            | Opcode::PattClosure => self.exec_pattern(op)?,

            Opcode::CallRead => self.exec_read()?,
            Opcode::CallWrite => self.exec_write()?,
            Opcode::CallLength => self.exec_length()?,
            Opcode::CallString => self.exec_to_string()?,
            Opcode::CallArray => self.exec_build_array()?,
        }
        Ok(Flow::Continue)
    }

    fn require_pop(&self, n: usize) -> Result<(), RuntimeError> {
        if self.stack.enough_to_pop(n) {
            Ok(())
        } else {
            Err(RuntimeError::StackUnderflow { at: self.at() })
        }
    }

    fn require_push(&self, n: usize) -> Result<(), RuntimeError> {
        if self.stack.enough_to_push(n) {
            Ok(())
        } else {
            Err(RuntimeError::StackOverflow { at: self.at() })
        }
    }

    // ---- arithmetic ----

    fn exec_binop(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        self.require_pop(2)?;
        let rhs = word::unbox_int(self.pop()?);
        let lhs = word::unbox_int(self.pop()?);
        let result = match op {
            Opcode::Add => lhs.wrapping_add(rhs),
            Opcode::Sub => lhs.wrapping_sub(rhs),
            Opcode::Mul => lhs.wrapping_mul(rhs),
            Opcode::Div => {
                if rhs == 0 {
                    return Err(RuntimeError::DivisionByZero { at: self.at() });
                }
                lhs.wrapping_div(rhs)
            }
            Opcode::Rem => {
                if rhs == 0 {
                    return Err(RuntimeError::DivisionByZero { at: self.at() });
                }
                lhs.wrapping_rem(rhs)
            }
            Opcode::Lt => (lhs < rhs) as i32,
            Opcode::Le => (lhs <= rhs) as i32,
            Opcode::Gt => (lhs > rhs) as i32,
            Opcode::Ge => (lhs >= rhs) as i32,
            Opcode::Eq => (lhs == rhs) as i32,
            Opcode::Ne => (lhs != rhs) as i32,
            Opcode::And => (lhs != 0 && rhs != 0) as i32,
            Opcode::Or => (lhs != 0 || rhs != 0) as i32,
            _ => unreachable!("dispatch sends only binary operators here"),
        };
        self.push(word::box_int(result))
    }

    fn exec_const(&mut self) -> Result<(), RuntimeError> {
        self.need(4)?;
        let value = self.code.next_i32();
        self.require_push(1)?;
        self.push(word::box_int(value))
    }

    // ---- heap construction ----

    fn exec_string(&mut self) -> Result<(), RuntimeError> {
        let bytes = self.code.next_string()?.to_vec();
        self.require_push(1)?;
        let handle = self.heap.alloc_string(&bytes, self.stack.roots());
        self.push(handle)
    }

    fn exec_sexp(&mut self) -> Result<(), RuntimeError> {
        let tag = self.code.next_string()?.to_vec();
        self.need(4)?;
        let arity = self.code.next_u32() as usize;
        self.require_pop(arity)?;
        let hash = self.heap.tag_hash(&tag);
        // Allocate before popping the fields: a collection triggered
        // here still sees them on the stack.
        let handle = self.heap.alloc_sexp(hash, arity, self.stack.roots());
        for index in (0..arity).rev() {
            let value = self.pop()?;
            self.heap
                .set_element(handle, index, value)
                .map_err(|e| self.heap_err(e))?;
        }
        self.push(handle)
    }

    fn exec_build_array(&mut self) -> Result<(), RuntimeError> {
        self.need(4)?;
        let len = self.code.next_u32() as usize;
        self.require_pop(len)?;
        let handle = self.heap.alloc_array(len, self.stack.roots());
        for index in (0..len).rev() {
            let value = self.pop()?;
            self.heap
                .set_element(handle, index, value)
                .map_err(|e| self.heap_err(e))?;
        }
        self.push(handle)
    }

    fn exec_closure(&mut self) -> Result<(), RuntimeError> {
        self.need(8)?;
        let entry = self.code.next_u32();
        let count = self.code.next_u32();
        let captures = self.code.closure_args(count)?;
        self.require_push(1)?;
        let handle = self
            .heap
            .alloc_closure(entry, count as usize, self.stack.roots());
        for (cell, (scope, index)) in captures.into_iter().enumerate() {
            let place = self.resolve(scope, index)?;
            let value = self.read_place(place, scope, index)?;
            self.heap
                .set_capture(handle, cell, value)
                .map_err(|e| self.heap_err(e))?;
        }
        self.push(handle)
    }

    // ---- element access ----

    fn exec_elem(&mut self) -> Result<(), RuntimeError> {
        self.require_pop(2)?;
        let index = self.pop()?;
        let collection = self.pop()?;
        let element = self
            .heap
            .elem(collection, index)
            .map_err(|e| self.heap_err(e))?;
        self.push(element)
    }

    fn exec_sta(&mut self) -> Result<(), RuntimeError> {
        self.require_pop(3)?;
        let value = self.pop()?;
        let sink = self.pop()?;
        let target = self.pop()?;
        if word::is_unboxed(sink) {
            let stored = self
                .heap
                .store_at(value, sink, target)
                .map_err(|e| self.heap_err(e))?;
            return self.push(stored);
        }
        // The sink came from LDA: store straight through the reference;
        // `target` is its duplicate.
        match word::decode_ref(sink) {
            Some(word::Ref::Stack(slot)) => {
                if !self.stack.set(slot, value) {
                    return Err(RuntimeError::BadStoreTarget { at: self.at() });
                }
            }
            Some(word::Ref::Capture { closure, cell }) => {
                let handle = word::handle(closure);
                self.heap
                    .set_capture(handle, cell, value)
                    .map_err(|e| self.heap_err(e))?;
            }
            None => return Err(RuntimeError::BadStoreTarget { at: self.at() }),
        }
        self.push(value)
    }

    // ---- variables ----

    fn exec_load(&mut self, scope: Scope) -> Result<(), RuntimeError> {
        self.need(4)?;
        let index = self.code.next_u32();
        let place = self.resolve(scope, index)?;
        let value = self.read_place(place, scope, index)?;
        self.require_push(1)?;
        self.push(value)
    }

    fn exec_load_address(&mut self, scope: Scope) -> Result<(), RuntimeError> {
        self.need(4)?;
        let index = self.code.next_u32();
        let reference = match self.resolve(scope, index)? {
            Place::Slot(slot) => word::stack_ref(slot),
            Place::Capture { closure, cell } => {
                // Validates the closure handle and bounds the cell.
                self.heap.capture(closure, cell).map_err(|e| self.heap_err(e))?;
                if cell > word::MAX_CAPTURE_CELL {
                    return Err(RuntimeError::BadReference {
                        at: self.at(),
                        scope,
                        index,
                    });
                }
                let slot = word::handle_slot(closure).expect("capture() validated the handle");
                word::capture_ref(slot, cell)
            }
        };
        self.require_push(2)?;
        self.push(reference)?;
        self.push(reference)
    }

    fn exec_store(&mut self, scope: Scope) -> Result<(), RuntimeError> {
        self.need(4)?;
        let index = self.code.next_u32();
        self.require_pop(1)?;
        let value = self.stack.top().map_err(|e| self.stack_err(e))?;
        let place = self.resolve(scope, index)?;
        self.write_place(place, value, scope, index)
    }

    // ---- stack shuffles ----

    fn exec_dup(&mut self) -> Result<(), RuntimeError> {
        self.require_pop(1)?;
        self.require_push(1)?;
        let top = self.stack.top().map_err(|e| self.stack_err(e))?;
        self.push(top)
    }

    fn exec_swap(&mut self) -> Result<(), RuntimeError> {
        self.require_pop(2)?;
        let first = self.pop()?;
        let second = self.pop()?;
        self.push(first)?;
        self.push(second)
    }

    // ---- control ----

    fn exec_jmp(&mut self) -> Result<(), RuntimeError> {
        self.need(4)?;
        let target = self.code.next_u32();
        if self.code.try_set_addr(target) {
            Ok(())
        } else {
            Err(RuntimeError::JumpOutOfBounds {
                at: self.at(),
                target: target as usize,
            })
        }
    }

    fn exec_cond_jump(&mut self, jump_if_nonzero: bool) -> Result<(), RuntimeError> {
        self.need(4)?;
        let target = self.code.next_u32();
        self.require_pop(1)?;
        let value = word::unbox_int(self.pop()?);
        if (value != 0) == jump_if_nonzero {
            if !self.code.try_set_addr(target) {
                return Err(RuntimeError::JumpOutOfBounds {
                    at: self.at(),
                    target: target as usize,
                });
            }
        }
        Ok(())
    }

    fn exec_begin(&mut self) -> Result<(), RuntimeError> {
        // BEGIN and CBEGIN run the same prologue; whether the call was
        // closure-flavored is tracked at the CALLC site instead.
        self.need(8)?;
        let n_args = self.code.next_u32();
        let n_locals = self.code.next_u32();
        self.stack
            .prologue(n_args, n_locals)
            .map_err(|e| self.stack_err(e))
    }

    fn exec_call(&mut self) -> Result<(), RuntimeError> {
        self.need(8)?;
        let target = self.code.next_u32();
        let _n_args = self.code.next_u32();
        self.require_push(1)?;
        self.push(self.code.offset() as Word)?;
        if !self.code.try_set_addr(target) {
            return Err(RuntimeError::JumpOutOfBounds {
                at: self.at(),
                target: target as usize,
            });
        }
        let found = self.code.peek_code().unwrap_or_default();
        if found != Opcode::Begin as u8 {
            return Err(RuntimeError::CallTargetNotBegin {
                at: self.at(),
                target,
                found,
            });
        }
        Ok(())
    }

    fn exec_call_closure(&mut self) -> Result<(), RuntimeError> {
        self.need(4)?;
        let n_args = self.code.next_u32();
        let closure = self
            .stack
            .closure_word(n_args)
            .map_err(|e| self.stack_err(e))?;
        let entry = self
            .heap
            .closure_entry(closure)
            .map_err(|e| self.heap_err(e))?;
        self.require_push(1)?;
        self.push(self.code.offset() as Word)?;
        self.closure_call = true;
        if !self.code.try_set_addr(entry) {
            return Err(RuntimeError::JumpOutOfBounds {
                at: self.at(),
                target: entry as usize,
            });
        }
        let found = self.code.peek_code().unwrap_or_default();
        if found != Opcode::Begin as u8 && found != Opcode::CBegin as u8 {
            return Err(RuntimeError::CallTargetNotBegin {
                at: self.at(),
                target: entry,
                found,
            });
        }
        Ok(())
    }

    /// END and RET: leave the frame, or stop at the bottom of the world.
    fn exec_leave(&mut self) -> Result<Flow, RuntimeError> {
        let was_closure = self.closure_call;
        self.closure_call = false;
        if self.stack.bp() == self.stack.begin() {
            return Ok(Flow::Stop);
        }
        let ret_addr = self
            .stack
            .epilogue(was_closure)
            .map_err(|e| self.stack_err(e))?;
        if ret_addr == word::NULL {
            return Ok(Flow::Stop);
        }
        if !self.code.try_set_addr(ret_addr as u32) {
            return Err(RuntimeError::JumpOutOfBounds {
                at: self.at(),
                target: ret_addr,
            });
        }
        Ok(Flow::Continue)
    }

    // ---- shape tests ----

    fn exec_tag(&mut self) -> Result<(), RuntimeError> {
        let name = self.code.next_string()?.to_vec();
        self.need(4)?;
        let arity = self.code.next_u32() as usize;
        self.require_pop(1)?;
        let value = self.pop()?;
        let hash = self.heap.tag_hash(&name);
        let matches = self.heap.check_tag(value, hash, arity);
        self.push(word::box_int(matches as i32))
    }

    fn exec_array(&mut self) -> Result<(), RuntimeError> {
        self.need(4)?;
        let len = self.code.next_u32() as usize;
        self.require_pop(1)?;
        let value = self.pop()?;
        let matches = self.heap.check_array_shape(value, len);
        self.push(word::box_int(matches as i32))
    }

    fn exec_pattern(&mut self, op: Opcode) -> Result<(), RuntimeError> {
        if op == Opcode::PattStrEq {
            self.require_pop(2)?;
            let lhs = self.pop()?;
            let rhs = self.pop()?;
            let equal = self.heap.string_eq(lhs, rhs);
            return self.push(word::box_int(equal as i32));
        }
        self.require_pop(1)?;
        let value = self.pop()?;
        let holds = match op {
            Opcode::PattString => self.heap.is_string(value),
            Opcode::PattArray => self.heap.is_array(value),
            Opcode::PattSexp => self.heap.is_sexp(value),
            Opcode::PattBoxed => word::is_boxed(value),
            Opcode::PattUnboxed => word::is_unboxed(value),
            Opcode::PattClosure => self.heap.is_closure(value),
            _ => unreachable!("dispatch sends only pattern tests here"),
        };
        self.push(word::box_int(holds as i32))
    }

    fn exec_fail(&mut self) -> RuntimeError {
        let at = self.at();
        if self.stack.enough_to_pop(2) {
            let a = self.pop().expect("two words checked");
            let b = self.pop().expect("two words checked");
            RuntimeError::Failure {
                at,
                a: self.heap.render(a),
                b: self.heap.render(b),
            }
        } else {
            RuntimeError::Failure {
                at,
                a: "?".to_string(),
                b: "?".to_string(),
            }
        }
    }

    // ---- console and library calls ----

    fn exec_read(&mut self) -> Result<(), RuntimeError> {
        self.require_push(1)?;
        let mut line = String::new();
        let n = self
            .input
            .read_line(&mut line)
            .map_err(|e| RuntimeError::Input {
                reason: e.to_string(),
            })?;
        if n == 0 {
            return Err(RuntimeError::Input {
                reason: "end of input".to_string(),
            });
        }
        let value: i32 = line.trim().parse().map_err(|_| RuntimeError::Input {
            reason: format!("'{}' is not an integer", line.trim()),
        })?;
        self.push(word::box_int(value))
    }

    fn exec_write(&mut self) -> Result<(), RuntimeError> {
        self.require_pop(1)?;
        let value = word::unbox_int(self.pop()?);
        writeln!(self.output, "{value}").map_err(|e| RuntimeError::Output {
            reason: e.to_string(),
        })?;
        self.push(word::box_int(0))
    }

    fn exec_length(&mut self) -> Result<(), RuntimeError> {
        self.require_pop(1)?;
        let value = self.pop()?;
        let len = self.heap.length(value).map_err(|e| self.heap_err(e))?;
        self.push(word::box_int(len as i32))
    }

    fn exec_to_string(&mut self) -> Result<(), RuntimeError> {
        self.require_pop(1)?;
        let value = self.pop()?;
        // Render first: the value may be unrooted once popped, but its
        // text no longer needs it when a collection runs.
        let text = self.heap.render(value);
        self.require_push(1)?;
        let handle = self.heap.alloc_string(text.as_bytes(), self.stack.roots());
        self.push(handle)
    }
}
