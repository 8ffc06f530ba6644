// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![allow(missing_docs, reason = "integration test crate")]

use stack_tape::asm::ModuleBuilder;
use stack_tape::decode::VarKind;
use stack_tape::idiom::find_idioms;
use stack_tape::interp::{Fault, Interpreter, Limits, RuntimeError};
use stack_tape::loader;
use stack_tape::module::Module;
use stack_tape::runtime::Runtime;
use stack_tape::verifier::{VerifyError, verify};
use stack_tape_conformance::runtime_lock;

#[cfg(not(feature = "dynamic-checks"))]
fn run_with_limits(
    module: &Module,
    input: &str,
    limits: Limits,
) -> Result<String, RuntimeError> {
    let _guard = runtime_lock();
    let info = verify(module).expect("conformance modules must verify");
    let mut out = Vec::new();
    let result = Interpreter::new(module, &info, input.as_bytes(), &mut out)
        .with_limits(limits)
        .run();
    let rendered = String::from_utf8(out).expect("program output must be UTF-8");
    result.map(|()| rendered)
}

#[cfg(feature = "dynamic-checks")]
fn run_with_limits(
    module: &Module,
    input: &str,
    limits: Limits,
) -> Result<String, RuntimeError> {
    let _guard = runtime_lock();
    let mut out = Vec::new();
    let result = Interpreter::new(module, input.as_bytes(), &mut out)
        .with_limits(limits)
        .run();
    let rendered = String::from_utf8(out).expect("program output must be UTF-8");
    result.map(|()| rendered)
}

fn run(module: &Module, input: &str) -> Result<String, RuntimeError> {
    run_with_limits(module, input, Limits::default())
}

#[test]
fn arithmetic_writes_the_sum() {
    let mut b = ModuleBuilder::new("arith");
    let a = b.asm();
    a.begin(2, 0);
    a.const_(1);
    a.const_(2);
    a.add();
    a.call_lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = b.build().unwrap();
    assert_eq!(run(&m, "").unwrap(), "3\n");
}

#[test]
fn recursive_factorial() {
    let mut b = ModuleBuilder::new("fact");
    let a = b.asm();
    let fact = a.label();

    a.begin(2, 0);
    a.const_(5);
    a.call(fact, 1);
    a.call_lwrite();
    a.end();

    a.place(fact);
    a.begin(1, 0);
    let rec = a.label();
    let done = a.label();
    a.ld(VarKind::Param, 0);
    a.const_(0);
    a.eq();
    a.cjmpz(rec);
    a.const_(1);
    a.jmp(done);
    a.place(rec);
    a.ld(VarKind::Param, 0);
    a.ld(VarKind::Param, 0);
    a.const_(1);
    a.sub();
    a.call(fact, 1);
    a.mul();
    a.place(done);
    a.end();

    b.symbol("fact", fact);
    let m = b.build().unwrap();
    assert_eq!(run(&m, "").unwrap(), "120\n");
}

#[test]
fn sexp_tag_matching() {
    let mut b = ModuleBuilder::new("sexps");
    let cons = b.intern("Cons");
    let nil = b.intern("Nil");
    let a = b.asm();
    a.begin(2, 1);
    a.const_(1);
    a.sexp(nil, 0);
    a.sexp(cons, 2);
    a.st(VarKind::Local, 0);
    a.drop_();
    a.ld(VarKind::Local, 0);
    a.tag(cons, 2);
    a.call_lwrite();
    a.drop_();
    a.ld(VarKind::Local, 0);
    a.tag(nil, 0);
    a.call_lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = b.build().unwrap();
    assert_eq!(run(&m, "").unwrap(), "1\n0\n");
}

#[test]
fn match_failure_reports_scrutinee_and_location() {
    let mut b = ModuleBuilder::new("patterns");
    let a = b.asm();
    let entry = a.label();
    a.place(entry);
    a.begin(2, 0);
    a.line(7);
    a.const_(42);
    a.fail(7, 17);
    b.symbol("main", entry);
    let m = b.build().unwrap();

    let err = run(&m, "").unwrap_err();
    assert!(matches!(
        err.fault,
        Fault::MatchFailure {
            line: 7,
            col: 17,
            ..
        }
    ));

    let rendered = err.to_string();
    assert!(rendered.contains("match failure for 42 at L7:17"), "got {rendered}");
    assert!(rendered.contains("main"), "got {rendered}");
    assert_eq!(err.backtrace.frames[0].line, 7);
}

#[test]
fn closures_capture_by_value() {
    let mut b = ModuleBuilder::new("closures");
    let a = b.asm();
    let f = a.label();

    a.begin(2, 2);
    a.const_(41);
    a.st(VarKind::Local, 0);
    a.drop_();
    a.closure(f, &[(VarKind::Local, 0)]);
    a.st(VarKind::Local, 1);
    a.drop_();
    a.ld(VarKind::Local, 1);
    a.callc(0);
    a.call_lwrite();
    a.drop_();
    a.ld(VarKind::Local, 1);
    a.callc(0);
    a.call_lwrite();
    a.drop_();
    a.const_(0);
    a.end();

    a.place(f);
    a.cbegin(0, 0);
    a.ld(VarKind::Capture, 0);
    a.end();

    let m = b.build().unwrap();
    assert_eq!(run(&m, "").unwrap(), "41\n41\n");
}

#[test]
fn runaway_recursion_overflows_the_virtual_stack() {
    let mut b = ModuleBuilder::new("overflow");
    let a = b.asm();
    let r = a.label();

    a.begin(2, 0);
    a.const_(0);
    a.call(r, 1);
    a.end();

    a.place(r);
    a.begin(1, 0);
    a.ld(VarKind::Param, 0);
    a.call(r, 1);
    a.end();

    let m = b.build().unwrap();
    let err = run_with_limits(
        &m,
        "",
        Limits {
            max_stack_values: 4096,
            ..Limits::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err.fault, Fault::StackOverflow));
}

#[test]
fn division_and_remainder_by_zero_fault() {
    for emit_rem in [false, true] {
        let mut b = ModuleBuilder::new("div0");
        let a = b.asm();
        a.begin(2, 0);
        a.const_(1);
        a.const_(0);
        if emit_rem {
            a.mod_();
        } else {
            a.div();
        }
        a.end();
        let m = b.build().unwrap();
        let err = run(&m, "").unwrap_err();
        assert!(matches!(err.fault, Fault::DivisionByZero));
    }
}

#[test]
fn aggregate_index_bounds() {
    for bad_index in [-1, 2] {
        let mut b = ModuleBuilder::new("bounds");
        let a = b.asm();
        a.begin(2, 0);
        a.const_(10);
        a.const_(20);
        a.call_barray(2);
        a.const_(bad_index);
        a.elem();
        a.end();
        let m = b.build().unwrap();
        let err = run(&m, "").unwrap_err();
        assert!(
            matches!(
                err.fault,
                Fault::IndexOutOfRange { index, len: 2 } if index == bad_index as isize
            ),
            "index {bad_index}: got {:?}",
            err.fault
        );
    }
}

#[test]
fn string_elements_read_and_write_as_bytes() {
    let mut b = ModuleBuilder::new("strings");
    let hello = b.intern("abc");
    let a = b.asm();
    a.begin(2, 1);
    a.string(hello);
    a.st(VarKind::Local, 0);
    a.drop_();
    a.ld(VarKind::Local, 0);
    a.const_(1);
    a.const_(88);
    a.sta();
    a.drop_();
    a.ld(VarKind::Local, 0);
    a.const_(1);
    a.elem();
    a.call_lwrite();
    a.drop_();
    a.ld(VarKind::Local, 0);
    a.call_llength();
    a.call_lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = b.build().unwrap();
    assert_eq!(run(&m, "").unwrap(), "88\n3\n");
}

#[test]
fn string_pattern_compares_contents() {
    let mut b = ModuleBuilder::new("streq");
    let hi = b.intern("hi");
    let ho = b.intern("ho");
    let a = b.asm();
    a.begin(2, 0);
    a.string(hi);
    a.string(hi);
    a.patt_eq_str();
    a.call_lwrite();
    a.drop_();
    a.string(hi);
    a.string(ho);
    a.patt_eq_str();
    a.call_lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = b.build().unwrap();
    assert_eq!(run(&m, "").unwrap(), "1\n0\n");
}

#[test]
fn pattern_classifiers_discriminate_shapes() {
    let mut b = ModuleBuilder::new("patts");
    let hi = b.intern("hi");
    let a = b.asm();
    let f = a.label();
    a.begin(2, 0);
    a.const_(5);
    a.patt_val();
    a.call_lwrite();
    a.drop_();
    a.string(hi);
    a.patt_ref();
    a.call_lwrite();
    a.drop_();
    a.closure(f, &[]);
    a.patt_fun();
    a.call_lwrite();
    a.drop_();
    a.const_(5);
    a.patt_string();
    a.call_lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    a.place(f);
    a.cbegin(0, 0);
    a.const_(0);
    a.end();
    let m = b.build().unwrap();
    assert_eq!(run(&m, "").unwrap(), "1\n1\n1\n0\n");
}

#[test]
fn lstring_renders_structured_values() {
    let mut b = ModuleBuilder::new("render");
    let cons = b.intern("Cons");
    let nil = b.intern("Nil");
    let a = b.asm();
    a.begin(2, 0);
    a.const_(1);
    a.sexp(nil, 0);
    a.sexp(cons, 2);
    a.call_lstring();
    a.call_llength();
    a.call_lwrite();
    a.drop_();
    a.const_(0);
    a.end();
    let m = b.build().unwrap();
    // "Cons (1, Nil)" is 13 bytes long.
    assert_eq!(run(&m, "").unwrap(), "13\n");
}

#[test]
fn lread_feeds_the_program() {
    let mut b = ModuleBuilder::new("reader");
    let a = b.asm();
    a.begin(2, 0);
    a.call_lread();
    a.const_(2);
    a.mul();
    a.call_lwrite();
    a.end();
    let m = b.build().unwrap();
    assert_eq!(run(&m, "21\n").unwrap(), " > 42\n");
}

#[test]
fn interpreter_rejects_concurrent_runs() {
    let _guard = runtime_lock();
    let mut b = ModuleBuilder::new("reentrant");
    let a = b.asm();
    a.begin(2, 0);
    a.const_(0);
    a.end();
    let m = b.build().unwrap();

    let held = Runtime::init(1).unwrap();
    let mut out = Vec::new();
    #[cfg(not(feature = "dynamic-checks"))]
    let result = {
        let info = verify(&m).unwrap();
        Interpreter::new(&m, &info, "".as_bytes(), &mut out).run()
    };
    #[cfg(feature = "dynamic-checks")]
    let result = Interpreter::new(&m, "".as_bytes(), &mut out).run();
    let err = result.unwrap_err();
    assert!(matches!(err.fault, Fault::Reentrance));
    drop(held);
}

#[test]
fn verifier_rejects_unbalanced_branches() {
    let mut b = ModuleBuilder::new("unbalanced");
    let a = b.asm();
    a.begin(2, 0);
    let join = a.label();
    a.const_(1);
    a.cjmpz(join);
    a.const_(2);
    a.place(join);
    a.const_(3);
    a.end();
    let m = b.build().unwrap();
    let err = verify(&m).unwrap_err();
    assert!(matches!(err, VerifyError::StackHeightMismatch { .. }));
}

#[test]
fn loader_rejects_an_early_eof_marker() {
    let mut image = Vec::new();
    image.extend_from_slice(&0_u32.to_le_bytes()); // strtab size
    image.extend_from_slice(&0_u32.to_le_bytes()); // global count
    image.extend_from_slice(&0_u32.to_le_bytes()); // symtab count
    image.extend_from_slice(&[0x18, 0xff, 0x18, 0xff]);
    let err = loader::load("early", &image).unwrap_err();
    assert!(matches!(
        err.kind,
        stack_tape::loader::LoadErrorKind::EarlyEofMarker
    ));
}

#[test]
fn idiom_analysis_is_deterministic_end_to_end() {
    let mut b = ModuleBuilder::new("idioms");
    let a = b.asm();
    let f = a.label();
    a.begin(2, 0);
    a.const_(1);
    a.drop_();
    a.const_(1);
    a.drop_();
    a.call(f, 0);
    a.end();
    a.place(f);
    a.begin(0, 0);
    a.const_(1);
    a.drop_();
    a.const_(0);
    a.end();
    let m = b.build().unwrap();
    let info = verify(&m).unwrap();

    let first = find_idioms(&m, &info);
    let second = find_idioms(&m, &info);
    assert_eq!(first, second);

    // `const 1` occurs three times across both procedures.
    assert_eq!(first[0].instrs, &[0x10, 1, 0, 0, 0]);
    assert_eq!(first[0].occurrences, 3);
}

#[cfg(feature = "dynamic-checks")]
#[test]
fn dynamic_mode_rejects_stack_underflow() {
    let mut b = ModuleBuilder::new("underflow");
    let a = b.asm();
    a.begin(2, 0);
    a.drop_();
    a.drop_();
    a.drop_();
    a.end();
    let m = b.build().unwrap();
    let err = run(&m, "").unwrap_err();
    assert!(matches!(err.fault, Fault::StackUnderflow { .. }));
}
