// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Verifier and interpreter micro-benchmarks on a recursive workload.

use criterion::{Criterion, criterion_group, criterion_main};
use stack_tape::asm::ModuleBuilder;
use stack_tape::decode::VarKind;
use stack_tape::idiom::find_idioms;
use stack_tape::module::Module;
use stack_tape::verifier::verify;

/// `main` computes `fact(18)` and writes the result.
fn fact_module() -> Module {
    let mut b = ModuleBuilder::new("fact");
    let a = b.asm();
    let fact = a.label();

    a.begin(2, 0);
    a.const_(18);
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
    b.build().expect("benchmark module must assemble")
}

fn bench_verify(c: &mut Criterion) {
    let module = fact_module();
    c.bench_function("verify/fact", |b| {
        b.iter(|| verify(&module).expect("benchmark module must verify"));
    });
}

fn bench_idiom(c: &mut Criterion) {
    let module = fact_module();
    let info = verify(&module).expect("benchmark module must verify");
    c.bench_function("idiom/fact", |b| {
        b.iter(|| find_idioms(&module, &info));
    });
}

fn bench_run(c: &mut Criterion) {
    let module = fact_module();
    c.bench_function("run/fact", |b| {
        b.iter(|| {
            let mut out = Vec::new();
            #[cfg(not(feature = "dynamic-checks"))]
            {
                let info = verify(&module).expect("benchmark module must verify");
                stack_tape::interp::Interpreter::new(&module, &info, "".as_bytes(), &mut out)
                    .run()
                    .expect("benchmark module must run");
            }
            #[cfg(feature = "dynamic-checks")]
            {
                stack_tape::interp::Interpreter::new(&module, "".as_bytes(), &mut out)
                    .run()
                    .expect("benchmark module must run");
            }
            out
        });
    });
}

criterion_group!(benches, bench_verify, bench_idiom, bench_run);
criterion_main!(benches);
