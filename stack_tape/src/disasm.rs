// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Disassembly.
//!
//! The listing is a pure function of the bytecode bytes: no module context
//! is consulted, so disassembling a byte-for-byte copy yields identical
//! text. Undecodable input renders inline (`[illop 0xNN]`, `[error: …]`)
//! and the listing continues at the next byte.

use core::fmt;

use crate::decode::{DecodeErrorKind, Decoder, Event};

/// Disassembly rendering options.
#[derive(Copy, Clone, Debug)]
pub struct DisasOpts {
    /// Prefix each instruction with its address.
    pub print_addr: bool,
    /// Separator printed between instructions.
    pub instr_sep: &'static str,
}

impl Default for DisasOpts {
    fn default() -> Self {
        Self {
            print_addr: false,
            instr_sep: "\n",
        }
    }
}

/// A lazily rendered disassembly of `bc`.
#[derive(Copy, Clone, Debug)]
pub struct Disassembly<'a> {
    bc: &'a [u8],
    opts: DisasOpts,
}

/// Disassembles `bc` with default options (one instruction per line, no
/// addresses).
#[must_use]
pub fn disassemble(bc: &[u8]) -> Disassembly<'_> {
    disassemble_with(bc, DisasOpts::default())
}

/// Disassembles `bc` with explicit rendering options.
#[must_use]
pub fn disassemble_with(bc: &[u8], opts: DisasOpts) -> Disassembly<'_> {
    Disassembly { bc, opts }
}

fn write_instr_head(
    f: &mut fmt::Formatter<'_>,
    first: &mut bool,
    opts: DisasOpts,
    addr: u32,
    width: usize,
) -> fmt::Result {
    if !*first {
        f.write_str(opts.instr_sep)?;
    }
    *first = false;
    if opts.print_addr {
        write!(f, "{addr:>width$x}:  ")?;
    }
    Ok(())
}

impl fmt::Display for Disassembly<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.bc.len().max(1).ilog(16) as usize + 1;
        let mut decoder = Decoder::new(self.bc);
        let mut first = true;

        while (decoder.pos() as usize) < self.bc.len() {
            let start = decoder.pos();
            let mut emitted = false;
            let mut out: fmt::Result = Ok(());
            let opts = self.opts;
            let result = decoder.next(&mut |ev| {
                if out.is_err() {
                    return;
                }
                out = match ev {
                    Event::InstrStart { addr, opcode } => {
                        emitted = true;
                        write_instr_head(f, &mut first, opts, addr, width)
                            .and_then(|()| f.write_str(opcode.mnemonic()))
                    }
                    Event::Imm32 { imm, .. } => write!(f, " {imm}"),
                    Event::Varspec { kind, idx, .. } => {
                        write!(f, " {}({idx})", kind.letter())
                    }
                    Event::InstrEnd { .. } => Ok(()),
                };
            });
            out?;

            if let Err(e) = result {
                match e.kind {
                    DecodeErrorKind::IllegalOp { opcode } => {
                        write_instr_head(f, &mut first, self.opts, start, width)?;
                        write!(f, "[illop {opcode:#04x}]")?;
                    }
                    _ => {
                        if !emitted {
                            write_instr_head(f, &mut first, self.opts, start, width)?;
                        }
                        write!(f, " [error: {e}]")?;
                    }
                }
                // Resynchronize on the next byte if the decoder is stuck.
                if decoder.pos() == start {
                    decoder.seek(start + 1);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::ModuleBuilder;
    use crate::decode::VarKind;

    #[test]
    fn renders_a_listing() {
        let mut b = ModuleBuilder::new("listing");
        let a = b.asm();
        a.begin(2, 1);
        let exit = a.label();
        a.const_(1);
        a.cjmpz(exit);
        a.ld(VarKind::Local, 0);
        a.call_lwrite();
        a.drop_();
        a.place(exit);
        a.const_(0);
        a.end();
        let m = b.build().unwrap();

        let text = disassemble(&m.bytecode).to_string();
        assert_eq!(
            text,
            "begin 2 1\n\
             const 1\n\
             cjmpz 26\n\
             ld L(0)\n\
             call Lwrite\n\
             drop\n\
             const 0\n\
             end\n\
             <eof>"
        );
    }

    #[test]
    fn listing_is_a_pure_function_of_bytes() {
        let mut b = ModuleBuilder::new("pure");
        let a = b.asm();
        a.begin(2, 0);
        a.const_(3);
        a.call_lwrite();
        a.end();
        let m = b.build().unwrap();

        let copy = m.bytecode.clone();
        assert_eq!(
            disassemble(&m.bytecode).to_string(),
            disassemble(&copy).to_string()
        );
    }

    #[test]
    fn renders_addresses_and_custom_separators() {
        let bc = [0x10, 7, 0, 0, 0, 0x18, 0xff];
        let text = disassemble_with(
            &bc,
            DisasOpts {
                print_addr: true,
                instr_sep: "; ",
            },
        )
        .to_string();
        assert_eq!(text, "0:  const 7; 5:  drop; 6:  <eof>");
    }

    #[test]
    fn renders_illegal_and_truncated_input_inline() {
        let text = disassemble(&[0x0e, 0x18]).to_string();
        assert_eq!(text, "[illop 0x0e]\ndrop");

        let text = disassemble(&[0x10, 1, 0]).to_string();
        assert!(text.starts_with("const [error: "), "got {text}");
    }
}
