//! Integration tests for the lamarun binary: exit codes, stdout, stderr.

use assert_cmd::Command;
use lamarun_common::Opcode;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn lamarun() -> Command {
    Command::cargo_bin("lamarun").unwrap()
}

/// A minimal assembler mirroring the byte layout the loader expects.
#[derive(Default)]
struct Asm {
    code: Vec<u8>,
}

impl Asm {
    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn hole(&mut self) -> usize {
        let at = self.code.len();
        self.u32(0);
        at
    }

    fn patch(&mut self, at: usize, value: u32) {
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn begin(&mut self, n_args: u32, n_locals: u32) -> &mut Self {
        self.op(Opcode::Begin).u32(n_args).u32(n_locals)
    }

    fn const_(&mut self, value: i32) -> &mut Self {
        self.op(Opcode::Const).u32(value as u32)
    }
}

/// Write a complete bytefile into `dir` and return its path.
fn write_bytefile(dir: &TempDir, globals: u32, pool: &[u8], code: &[u8]) -> PathBuf {
    let mut data = Vec::new();
    data.extend_from_slice(&(pool.len() as u32).to_le_bytes());
    data.extend_from_slice(&globals.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(pool);
    data.extend_from_slice(code);
    let path = dir.path().join("program.bc");
    fs::write(&path, data).unwrap();
    path
}

// ---- usage ----

#[test]
fn no_arguments_prints_usage_and_exits_1() {
    lamarun()
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Usage: lamarun"));
}

#[test]
fn extra_arguments_exit_1() {
    lamarun()
        .args(["one.bc", "two.bc"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Usage: lamarun"));
}

#[test]
fn missing_file_exits_1() {
    lamarun()
        .arg("does-not-exist.bc")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cannot read"));
}

// ---- load errors ----

#[test]
fn short_header_exits_1() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.bc");
    fs::write(&path, [0u8; 7]).unwrap();
    lamarun()
        .arg(path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("header"));
}

#[test]
fn oversized_pool_exits_1_with_diagnostics() {
    let dir = TempDir::new().unwrap();
    let mut data = Vec::new();
    data.extend_from_slice(&1000u32.to_le_bytes()); // pool claims 1000 bytes
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.push(0x16);
    let path = dir.path().join("bad.bc");
    fs::write(&path, data).unwrap();
    lamarun()
        .arg(path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("string pool"));
}

// ---- end-to-end programs ----

#[test]
fn arithmetic_program_prints_seven() {
    let dir = TempDir::new().unwrap();
    let mut a = Asm::default();
    a.begin(2, 0)
        .const_(3)
        .const_(4)
        .op(Opcode::Add)
        .op(Opcode::CallWrite)
        .op(Opcode::End);
    let path = write_bytefile(&dir, 0, b"", &a.code);
    lamarun()
        .arg(path)
        .assert()
        .success()
        .stdout("7\n")
        .stderr(predicate::str::is_empty());
}

#[test]
fn conditional_program_prints_two() {
    let mut a = Asm::default();
    a.begin(2, 0).const_(0).op(Opcode::CJmpZ);
    let to_then = a.hole();
    a.const_(1).op(Opcode::Jmp);
    let to_join = a.hole();
    let then = a.here();
    a.const_(2);
    let join = a.here();
    a.op(Opcode::CallWrite).op(Opcode::End);
    a.patch(to_then, then);
    a.patch(to_join, join);

    let dir = TempDir::new().unwrap();
    let path = write_bytefile(&dir, 0, b"", &a.code);
    lamarun().arg(path).assert().success().stdout("2\n");
}

#[test]
fn array_program_prints_the_middle_element() {
    let mut a = Asm::default();
    a.begin(2, 0).const_(10).const_(20).const_(30);
    a.op(Opcode::CallArray).u32(3);
    a.const_(1);
    a.op(Opcode::Elem);
    a.op(Opcode::CallWrite).op(Opcode::End);

    let dir = TempDir::new().unwrap();
    let path = write_bytefile(&dir, 0, b"", &a.code);
    lamarun().arg(path).assert().success().stdout("20\n");
}

#[test]
fn function_call_program_prints_twelve() {
    let mut a = Asm::default();
    a.begin(2, 0).const_(5).const_(7);
    a.op(Opcode::Call);
    let target = a.hole();
    a.u32(2);
    a.op(Opcode::CallWrite).op(Opcode::End);
    let f = a.here();
    a.begin(2, 0);
    a.op(Opcode::LdArgument).u32(0);
    a.op(Opcode::LdArgument).u32(1);
    a.op(Opcode::Add);
    a.op(Opcode::End);
    a.patch(target, f);

    let dir = TempDir::new().unwrap();
    let path = write_bytefile(&dir, 0, b"", &a.code);
    lamarun().arg(path).assert().success().stdout("12\n");
}

#[test]
fn closure_program_prints_eleven() {
    let mut a = Asm::default();
    a.begin(2, 1).const_(9);
    a.op(Opcode::StLocal).u32(0);
    a.op(Opcode::Drop);
    a.op(Opcode::Closure);
    let entry = a.hole();
    a.u32(1);
    a.code.push(0x01); // capture the local
    a.u32(0);
    a.const_(2);
    a.op(Opcode::CallC).u32(1);
    a.op(Opcode::CallWrite).op(Opcode::End);
    let f = a.here();
    a.op(Opcode::CBegin).u32(1).u32(0);
    a.op(Opcode::LdCaptured).u32(0);
    a.op(Opcode::LdArgument).u32(0);
    a.op(Opcode::Add);
    a.op(Opcode::End);
    a.patch(entry, f);

    let dir = TempDir::new().unwrap();
    let path = write_bytefile(&dir, 0, b"", &a.code);
    lamarun().arg(path).assert().success().stdout("11\n");
}

#[test]
fn reads_integers_from_stdin() {
    let mut a = Asm::default();
    a.begin(2, 0);
    a.op(Opcode::CallRead);
    a.op(Opcode::CallRead);
    a.op(Opcode::Add);
    a.op(Opcode::CallWrite).op(Opcode::End);

    let dir = TempDir::new().unwrap();
    let path = write_bytefile(&dir, 0, b"", &a.code);
    lamarun()
        .arg(path)
        .write_stdin("5\n7\n")
        .assert()
        .success()
        .stdout("12\n");
}

// ---- runtime failures ----

#[test]
fn fail_exits_3_and_keeps_earlier_output() {
    let mut a = Asm::default();
    a.begin(2, 0).const_(1);
    a.op(Opcode::CallWrite);
    a.const_(5).const_(6);
    a.op(Opcode::Fail);

    let dir = TempDir::new().unwrap();
    let path = write_bytefile(&dir, 0, b"", &a.code);
    lamarun()
        .arg(path)
        .assert()
        .failure()
        .code(3)
        .stdout("1\n")
        .stderr(predicate::str::contains("match failure"));
}

#[test]
fn division_by_zero_exits_3_with_the_mnemonic() {
    let mut a = Asm::default();
    a.begin(2, 0);
    a.op(Opcode::Line).u32(7);
    a.const_(1).const_(0);
    a.op(Opcode::Div);
    a.op(Opcode::CallWrite).op(Opcode::End);

    let dir = TempDir::new().unwrap();
    let path = write_bytefile(&dir, 0, b"", &a.code);
    lamarun()
        .arg(path)
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("BINOP /"))
        .stderr(predicate::str::contains("source line 7"))
        .stderr(predicate::str::contains("division by zero"));
}
