// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bytecode builder ("assembler").
//!
//! A small, public helper for constructing modules without hand-computing
//! byte offsets, string-table layout, or the end-of-file marker. Control
//! flow uses [`Label`]s that are back-patched when the module is built.
//!
//! This is the fixture factory for the test suites; it is also usable as a
//! lightweight embedding API.

use core::fmt;

use hashbrown::HashMap;

use crate::decode::VarKind;
use crate::module::{Module, Sym};
use crate::opcode::Opcode;
use crate::verifier::{ModuleInfo, VerifyError, verify};

/// A control-flow target that is resolved when the module is built.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// A builder error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AsmError {
    /// A label was referenced or exported but never placed.
    UnresolvedLabel {
        /// The label's index.
        label: u32,
    },
    /// The assembled module failed verification.
    Verify(VerifyError),
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedLabel { label } => {
                write!(f, "label {label} was referenced but never placed")
            }
            Self::Verify(e) => write!(f, "verification failed: {e}"),
        }
    }
}

impl std::error::Error for AsmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Verify(e) => Some(e),
            Self::UnresolvedLabel { .. } => None,
        }
    }
}

impl From<VerifyError> for AsmError {
    fn from(e: VerifyError) -> Self {
        Self::Verify(e)
    }
}

/// An instruction stream under construction.
#[derive(Clone, Debug, Default)]
pub struct Asm {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    uses: Vec<(usize, Label)>,
}

impl Asm {
    /// Creates an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current emission address.
    #[must_use]
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Creates a fresh, unplaced label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Places `label` at the current emission address.
    pub fn place(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.here());
    }

    fn op(&mut self, op: Opcode) {
        self.code.push(op.byte());
    }

    fn imm(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn imm_label(&mut self, label: Label) {
        self.uses.push((self.code.len(), label));
        self.imm(0);
    }

    /// `BINOP +`.
    pub fn add(&mut self) {
        self.op(Opcode::Add);
    }

    /// `BINOP -`.
    pub fn sub(&mut self) {
        self.op(Opcode::Sub);
    }

    /// `BINOP *`.
    pub fn mul(&mut self) {
        self.op(Opcode::Mul);
    }

    /// `BINOP /`.
    pub fn div(&mut self) {
        self.op(Opcode::Div);
    }

    /// `BINOP %`.
    pub fn mod_(&mut self) {
        self.op(Opcode::Mod);
    }

    /// `BINOP <`.
    pub fn lt(&mut self) {
        self.op(Opcode::Lt);
    }

    /// `BINOP <=`.
    pub fn le(&mut self) {
        self.op(Opcode::Le);
    }

    /// `BINOP >`.
    pub fn gt(&mut self) {
        self.op(Opcode::Gt);
    }

    /// `BINOP >=`.
    pub fn ge(&mut self) {
        self.op(Opcode::Ge);
    }

    /// `BINOP ==`.
    pub fn eq(&mut self) {
        self.op(Opcode::Eq);
    }

    /// `BINOP !=`.
    pub fn ne(&mut self) {
        self.op(Opcode::Ne);
    }

    /// `BINOP &&`.
    pub fn and_(&mut self) {
        self.op(Opcode::And);
    }

    /// `BINOP !!`.
    pub fn or_(&mut self) {
        self.op(Opcode::Or);
    }

    /// `CONST k`.
    pub fn const_(&mut self, k: i32) {
        self.op(Opcode::Const);
        self.imm(k as u32);
    }

    /// `STRING s`, with `s` a string-table offset.
    pub fn string(&mut self, offset: u32) {
        self.op(Opcode::String);
        self.imm(offset);
    }

    /// `SEXP s n`, with `s` a string-table offset.
    pub fn sexp(&mut self, tag: u32, n: u32) {
        self.op(Opcode::Sexp);
        self.imm(tag);
        self.imm(n);
    }

    /// `STA`.
    pub fn sta(&mut self) {
        self.op(Opcode::Sta);
    }

    /// `JMP l`.
    pub fn jmp(&mut self, target: Label) {
        self.op(Opcode::Jmp);
        self.imm_label(target);
    }

    /// `JMP` to a raw bytecode address.
    pub fn jmp_to(&mut self, target: u32) {
        self.op(Opcode::Jmp);
        self.imm(target);
    }

    /// `END`.
    pub fn end(&mut self) {
        self.op(Opcode::End);
    }

    /// `RET`.
    pub fn ret(&mut self) {
        self.op(Opcode::Ret);
    }

    /// `DROP`.
    pub fn drop_(&mut self) {
        self.op(Opcode::Drop);
    }

    /// `DUP`.
    pub fn dup(&mut self) {
        self.op(Opcode::Dup);
    }

    /// `SWAP`.
    pub fn swap(&mut self) {
        self.op(Opcode::Swap);
    }

    /// `ELEM`.
    pub fn elem(&mut self) {
        self.op(Opcode::Elem);
    }

    /// `LD kind(idx)`.
    pub fn ld(&mut self, kind: VarKind, idx: u32) {
        self.op(match kind {
            VarKind::Global => Opcode::LdG,
            VarKind::Local => Opcode::LdL,
            VarKind::Param => Opcode::LdA,
            VarKind::Capture => Opcode::LdC,
        });
        self.imm(idx);
    }

    /// `ST kind(idx)`.
    pub fn st(&mut self, kind: VarKind, idx: u32) {
        self.op(match kind {
            VarKind::Global => Opcode::StG,
            VarKind::Local => Opcode::StL,
            VarKind::Param => Opcode::StA,
            VarKind::Capture => Opcode::StC,
        });
        self.imm(idx);
    }

    /// `CJMPz l`.
    pub fn cjmpz(&mut self, target: Label) {
        self.op(Opcode::CjmpZ);
        self.imm_label(target);
    }

    /// `CJMPnz l`.
    pub fn cjmpnz(&mut self, target: Label) {
        self.op(Opcode::CjmpNz);
        self.imm_label(target);
    }

    /// `BEGIN params locals`.
    pub fn begin(&mut self, params: u32, locals: u32) {
        self.op(Opcode::Begin);
        self.imm(params);
        self.imm(locals);
    }

    /// `CBEGIN params locals`.
    pub fn cbegin(&mut self, params: u32, locals: u32) {
        self.op(Opcode::Cbegin);
        self.imm(params);
        self.imm(locals);
    }

    /// `CLOSURE l n captures…`.
    pub fn closure(&mut self, target: Label, captures: &[(VarKind, u32)]) {
        self.op(Opcode::Closure);
        self.imm_label(target);
        self.imm(captures.len() as u32);
        for &(kind, idx) in captures {
            self.code.push(kind.byte());
            self.imm(idx);
        }
    }

    /// `CALLC n`.
    pub fn callc(&mut self, n: u32) {
        self.op(Opcode::CallC);
        self.imm(n);
    }

    /// `CALL l n`.
    pub fn call(&mut self, target: Label, n: u32) {
        self.op(Opcode::Call);
        self.imm_label(target);
        self.imm(n);
    }

    /// `TAG s n`, with `s` a string-table offset.
    pub fn tag(&mut self, tag: u32, n: u32) {
        self.op(Opcode::Tag);
        self.imm(tag);
        self.imm(n);
    }

    /// `ARRAY n`.
    pub fn array(&mut self, n: u32) {
        self.op(Opcode::Array);
        self.imm(n);
    }

    /// `FAIL line col`.
    pub fn fail(&mut self, line: u32, col: u32) {
        self.op(Opcode::Fail);
        self.imm(line);
        self.imm(col);
    }

    /// `LINE n`.
    pub fn line(&mut self, line: u32) {
        self.op(Opcode::Line);
        self.imm(line);
    }

    /// `PATT =str`.
    pub fn patt_eq_str(&mut self) {
        self.op(Opcode::PattEqStr);
    }

    /// `PATT #str`.
    pub fn patt_string(&mut self) {
        self.op(Opcode::PattString);
    }

    /// `PATT #array`.
    pub fn patt_array(&mut self) {
        self.op(Opcode::PattArray);
    }

    /// `PATT #sexp`.
    pub fn patt_sexp(&mut self) {
        self.op(Opcode::PattSexp);
    }

    /// `PATT #ref`.
    pub fn patt_ref(&mut self) {
        self.op(Opcode::PattRef);
    }

    /// `PATT #val`.
    pub fn patt_val(&mut self) {
        self.op(Opcode::PattVal);
    }

    /// `PATT #fun`.
    pub fn patt_fun(&mut self) {
        self.op(Opcode::PattFun);
    }

    /// `CALL Lread`.
    pub fn call_lread(&mut self) {
        self.op(Opcode::CallLread);
    }

    /// `CALL Lwrite`.
    pub fn call_lwrite(&mut self) {
        self.op(Opcode::CallLwrite);
    }

    /// `CALL Llength`.
    pub fn call_llength(&mut self) {
        self.op(Opcode::CallLlength);
    }

    /// `CALL Lstring`.
    pub fn call_lstring(&mut self) {
        self.op(Opcode::CallLstring);
    }

    /// `CALL Barray n`.
    pub fn call_barray(&mut self, n: u32) {
        self.op(Opcode::CallBarray);
        self.imm(n);
    }

    /// Emits raw bytes verbatim.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }
}

/// A module under construction: string table, globals, symbols, and one
/// instruction stream.
#[derive(Clone, Debug)]
pub struct ModuleBuilder {
    name: String,
    global_count: u32,
    strtab: Vec<u8>,
    interned: HashMap<String, u32>,
    symbols: Vec<(u32, Label)>,
    asm: Asm,
}

impl ModuleBuilder {
    /// Creates a builder for a module named `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            global_count: 0,
            strtab: Vec::new(),
            interned: HashMap::new(),
            symbols: Vec::new(),
            asm: Asm::new(),
        }
    }

    /// Declares `n` module-level variable slots.
    pub fn globals(&mut self, n: u32) {
        self.global_count = n;
    }

    /// Interns `s` into the string table and returns its offset.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.interned.get(s) {
            return offset;
        }
        let offset = self.strtab.len() as u32;
        self.strtab.extend_from_slice(s.as_bytes());
        self.strtab.push(0);
        self.interned.insert(s.to_string(), offset);
        offset
    }

    /// Exports the procedure placed at `at` under `name`.
    pub fn symbol(&mut self, name: &str, at: Label) {
        let name_offset = self.intern(name);
        self.symbols.push((name_offset, at));
    }

    /// Returns the instruction stream.
    pub fn asm(&mut self) -> &mut Asm {
        &mut self.asm
    }

    /// Resolves labels, appends the end-of-file marker, and produces the
    /// module.
    pub fn build(self) -> Result<Module, AsmError> {
        let Self {
            name,
            global_count,
            strtab,
            interned: _,
            symbols,
            asm,
        } = self;

        let resolve = |label: Label| -> Result<u32, AsmError> {
            asm.labels[label.0 as usize].ok_or(AsmError::UnresolvedLabel { label: label.0 })
        };

        let mut bytecode = asm.code.clone();
        for &(offset, label) in &asm.uses {
            let addr = resolve(label)?;
            bytecode[offset..offset + 4].copy_from_slice(&addr.to_le_bytes());
        }
        bytecode.push(Opcode::Eof.byte());

        let mut symtab = Vec::with_capacity(symbols.len());
        for (i, &(name_offset, label)) in symbols.iter().enumerate() {
            symtab.push(Sym {
                file_offset: 12 + i * 8,
                addr: resolve(label)?,
                name_offset,
            });
        }

        Ok(Module {
            name,
            global_count,
            symtab,
            strtab,
            bytecode,
        })
    }

    /// Builds the module and runs the verifier over it.
    pub fn build_verified(self) -> Result<(Module, ModuleInfo), AsmError> {
        let module = self.build()?;
        let info = verify(&module)?;
        Ok((module, info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_patches_forward_labels() {
        let mut b = ModuleBuilder::new("labels");
        let a = b.asm();
        a.begin(2, 0);
        let target = a.label();
        a.jmp(target);
        a.place(target);
        a.const_(0);
        a.end();
        let m = b.build().unwrap();

        // The jump immediate holds the address of the CONST.
        let imm = u32::from_le_bytes([
            m.bytecode[10],
            m.bytecode[11],
            m.bytecode[12],
            m.bytecode[13],
        ]);
        assert_eq!(imm, 14);
        assert_eq!(m.bytecode.last(), Some(&0xff));
    }

    #[test]
    fn unplaced_labels_are_build_errors() {
        let mut b = ModuleBuilder::new("dangling");
        let a = b.asm();
        a.begin(2, 0);
        let nowhere = a.label();
        a.jmp(nowhere);
        let err = b.build().unwrap_err();
        assert_eq!(err, AsmError::UnresolvedLabel { label: 0 });
    }

    #[test]
    fn interning_deduplicates() {
        let mut b = ModuleBuilder::new("strings");
        let a1 = b.intern("Cons");
        let a2 = b.intern("Nil");
        let a3 = b.intern("Cons");
        assert_eq!(a1, a3);
        assert_ne!(a1, a2);
        assert_eq!(&b.strtab, b"Cons\0Nil\0");
    }

    #[test]
    fn build_verified_surfaces_verifier_errors() {
        let mut b = ModuleBuilder::new("bad");
        let a = b.asm();
        a.begin(2, 0);
        a.add(); // nothing on the stack
        a.end();
        let err = b.build_verified().unwrap_err();
        assert!(matches!(err, AsmError::Verify(_)));
    }
}
