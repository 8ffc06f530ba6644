// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Idiom analysis: occurrence counts for one- and two-instruction sequences
//! in reachable code.
//!
//! Reachability starts from every verified procedure entry and follows
//! fall-through (except after terminal instructions) plus jump targets.
//! Two-instruction sequences are not counted across *split points*: jump
//! targets, and the boundary after `JMP`/`CALL`/`CALLC`/`RET`/`END`/`FAIL`.
//!
//! Instruction identity is the literal byte span, so immediates (including
//! jump targets) distinguish otherwise-equal instructions.

use hashbrown::{HashMap, HashSet};

use crate::decode::{Decoder, Event};
use crate::module::Module;
use crate::opcode::Opcode;
use crate::verifier::ModuleInfo;

/// An instruction sequence and its occurrence count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Idiom<'a> {
    /// The raw bytes of the sequence.
    pub instrs: &'a [u8],
    /// How many times the sequence occurs in reachable code.
    pub occurrences: u32,
}

#[derive(Copy, Clone, Debug)]
struct InstrSpan {
    start: u32,
    end: u32,
    opcode: Opcode,
    jump_target: Option<u32>,
}

fn decode_one(decoder: &mut Decoder<'_>, addr: u32) -> Option<InstrSpan> {
    decoder.seek(addr);
    let mut opcode = None;
    let mut end = addr;
    let mut first_imm = None;
    decoder
        .next(&mut |ev| match ev {
            Event::InstrStart { opcode: op, .. } => opcode = Some(op),
            Event::Imm32 { imm, .. } => {
                if first_imm.is_none() {
                    first_imm = Some(imm);
                }
            }
            Event::InstrEnd { end: e, .. } => end = e,
            Event::Varspec { .. } => {}
        })
        .ok()?;
    let opcode = opcode?;
    Some(InstrSpan {
        start: addr,
        end,
        opcode,
        jump_target: if opcode.is_jump() { first_imm } else { None },
    })
}

fn walk_reachable(module: &Module, info: &ModuleInfo, mut visit: impl FnMut(&InstrSpan)) {
    let mut decoder = Decoder::new(&module.bytecode);
    let mut processed = vec![false; module.bytecode.len()];
    let mut to_process: Vec<u32> = info.procs.keys().copied().collect();

    while let Some(addr) = to_process.pop() {
        let Some(seen) = processed.get_mut(addr as usize) else {
            continue;
        };
        if std::mem::replace(seen, true) {
            continue;
        }
        let Some(span) = decode_one(&mut decoder, addr) else {
            continue;
        };
        visit(&span);
        if !span.opcode.is_terminator() {
            to_process.push(span.end);
        }
        if let Some(target) = span.jump_target {
            to_process.push(target);
        }
    }
}

fn find_split_points(module: &Module, info: &ModuleInfo) -> HashSet<u32> {
    let mut split = HashSet::new();
    walk_reachable(module, info, |span| {
        if let Some(target) = span.jump_target {
            split.insert(target);
        }
        if span.opcode.splits_after() {
            split.insert(span.end);
        }
    });
    split
}

/// Counts one- and two-instruction idioms in `module`'s reachable code.
///
/// The result is sorted by descending occurrence count; ties break by
/// lexicographic comparison of the raw byte spans, so the ordering is
/// deterministic.
#[must_use]
pub fn find_idioms<'m>(module: &'m Module, info: &ModuleInfo) -> Vec<Idiom<'m>> {
    let split = find_split_points(module, info);
    let bc: &'m [u8] = &module.bytecode;
    let mut occurrences: HashMap<&'m [u8], u32> = HashMap::new();
    let mut pair_decoder = Decoder::new(bc);

    walk_reachable(module, info, |span| {
        let single = &bc[span.start as usize..span.end as usize];
        *occurrences.entry(single).or_insert(0) += 1;

        if !split.contains(&span.end)
            && let Some(next) = decode_one(&mut pair_decoder, span.end)
        {
            let pair = &bc[span.start as usize..next.end as usize];
            *occurrences.entry(pair).or_insert(0) += 1;
        }
    });

    let mut idioms: Vec<Idiom<'m>> = occurrences
        .into_iter()
        .map(|(instrs, occurrences)| Idiom {
            instrs,
            occurrences,
        })
        .collect();
    idioms.sort_unstable_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then_with(|| a.instrs.cmp(b.instrs))
    });
    idioms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::ModuleBuilder;
    use crate::verifier::verify;

    fn sample() -> (Module, ModuleInfo) {
        let mut b = ModuleBuilder::new("idioms");
        let a = b.asm();
        a.begin(2, 0);
        a.const_(1);
        a.drop_();
        a.const_(1);
        a.drop_();
        a.const_(0);
        a.end();
        let m = b.build().unwrap();
        let info = verify(&m).unwrap();
        (m, info)
    }

    #[test]
    fn counts_repeated_sequences() {
        let (m, info) = sample();
        let idioms = find_idioms(&m, &info);

        // `const 1`, `const 1; drop`, and `drop` each occur twice; ties
        // break lexicographically on the raw bytes.
        assert_eq!(idioms[0].instrs, &[0x10, 1, 0, 0, 0]);
        assert_eq!(idioms[0].occurrences, 2);
        assert_eq!(idioms[1].instrs, &[0x10, 1, 0, 0, 0, 0x18]);
        assert_eq!(idioms[1].occurrences, 2);
        assert_eq!(idioms[2].instrs, &[0x18]);
        assert_eq!(idioms[2].occurrences, 2);
        assert!(idioms[3..].iter().all(|i| i.occurrences == 1));
    }

    #[test]
    fn analysis_is_idempotent() {
        let (m, info) = sample();
        let first = find_idioms(&m, &info);
        let second = find_idioms(&m, &info);
        assert_eq!(first, second);
    }

    #[test]
    fn no_pairs_across_calls() {
        let mut b = ModuleBuilder::new("splits");
        let a = b.asm();
        a.begin(2, 0);
        let f = a.label();
        a.call(f, 0);
        a.end();
        a.place(f);
        a.begin(0, 0);
        a.const_(0);
        a.end();
        let m = b.build().unwrap();
        let info = verify(&m).unwrap();
        let idioms = find_idioms(&m, &info);

        // The boundary after `call` is a split point, so no pair starts
        // with the call instruction.
        assert!(
            idioms
                .iter()
                .all(|i| !(i.instrs[0] == 0x56 && i.instrs.len() > 9))
        );
    }
}
