// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Whole-module static verification.
//!
//! The verifier proves that every reachable instruction is well-formed,
//! that the static stack height is balanced at every control-flow merge,
//! that jumps land on instruction boundaries inside the same procedure, and
//! that calls and closure instantiations match their target signatures. The
//! interpreter's trusted build relies on these proofs to skip per-instruction
//! shape checks.
//!
//! The algorithm is a work-list pass over per-byte states. Procedure starts
//! are discovered at the top level (address 0, the byte after each `END`,
//! and `CALL`/`CLOSURE` targets); body instructions carry a
//! `(procedure, stack height)` state, and revisiting a byte with a
//! different height is an error. `CALL` and `CLOSURE` validations that need
//! the target's metadata are deferred until the work-list drains.

use core::fmt;

use hashbrown::HashMap;

use crate::decode::{VarKind, read_u32_at};
use crate::module::Module;
use crate::opcode::Opcode;

/// The largest representable static stack height.
pub const MAX_STACK_HEIGHT: u32 = 0x7fff_ffff;

/// The largest usable capture index.
pub const MAX_CAPTURES: u32 = 0x7fff_ffff;

/// The largest parameter count a procedure may declare.
///
/// Parameter counts must stay packable into the low 16 bits of the `BEGIN`
/// immediate, so the on-disk format keeps room for implementations that
/// stash the frame size in the upper bits.
pub const MAX_PARAMS: u32 = 0xffff;

/// The largest member count for `SEXP` construction and `Barray`.
pub const MAX_MEMBERS: u32 = 0x7fff_ffff;

/// Verified metadata for one procedure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcInfo {
    /// Declared parameter count.
    pub params: u32,
    /// Declared local count.
    pub locals: u32,
    /// High-water mark of capture indices used inside the procedure.
    pub captures: u32,
    /// Maximum static operand-stack height observed anywhere in the body.
    pub stack_size: u32,
    /// True when declared with `CBEGIN` (callable only through a closure).
    pub is_closure: bool,
}

/// Verified per-module metadata: the procedure table and the symbol map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Procedure entry address to metadata.
    pub procs: HashMap<u32, ProcInfo>,
    /// Public symbol name to procedure address.
    pub symtab_map: HashMap<String, u32>,
}

impl ModuleInfo {
    /// Returns the public name of the procedure at `addr`, if it has one.
    #[must_use]
    pub fn name_of(&self, addr: u32) -> Option<&str> {
        self.symtab_map
            .iter()
            .find(|&(_, &a)| a == addr)
            .map(|(name, _)| name.as_str())
    }
}

/// A verification error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VerifyError {
    /// A symbol's address lies beyond the bytecode section.
    SymbolAddrOutOfRange {
        /// File offset of the symbol entry.
        offset: usize,
        /// The out-of-range address.
        addr: u32,
        /// The bytecode length.
        len: usize,
    },
    /// Two symbols share one name.
    DuplicateSymbol {
        /// File offset of the second entry.
        offset: usize,
        /// The duplicated name.
        name: String,
    },
    /// A symbol's address is not a verified procedure start.
    SymbolNotProcedure {
        /// File offset of the symbol entry.
        offset: usize,
        /// The symbol's address.
        addr: u32,
    },
    /// A string-table offset lies beyond the table.
    StringTableOutOfRange {
        /// Where the reference was made.
        offset: usize,
        /// The out-of-range table offset.
        str_offset: u32,
        /// The table length.
        len: usize,
    },
    /// A string-table offset does not begin a NUL-terminated string.
    UnterminatedString {
        /// Where the reference was made.
        offset: usize,
        /// The offending table offset.
        str_offset: u32,
    },
    /// The bytecode ended inside an instruction.
    UnexpectedEof {
        /// The bytecode address of the failure.
        offset: u32,
        /// What was being read.
        what: &'static str,
    },
    /// An immediate that must be non-negative had its top bit set.
    NegativeImmediate {
        /// The immediate's address.
        offset: u32,
        /// The raw value.
        value: u32,
        /// Which immediate.
        what: &'static str,
    },
    /// A varspec kind byte is not a recognized storage class.
    IllegalVarKind {
        /// The kind byte's address.
        offset: u32,
        /// The raw kind byte.
        kind: u8,
    },
    /// The top-level scan ran off the end without an end-of-file marker.
    NoEofMarker {
        /// The address past the last byte.
        offset: u32,
    },
    /// Address 0 holds the end-of-file marker; there is no entry procedure.
    NoMainProcedure,
    /// The entry procedure is declared with `CBEGIN`.
    MainIsClosure,
    /// The entry procedure does not take exactly two parameters.
    MainParamCount {
        /// The declared parameter count.
        params: u32,
    },
    /// A procedure declares more parameters than [`MAX_PARAMS`].
    TooManyParams {
        /// The procedure address.
        offset: u32,
        /// The declared parameter count.
        params: u32,
    },
    /// A byte at the top level is neither a procedure start nor the marker.
    IllegalTopLevel {
        /// The byte's address.
        offset: u32,
        /// The raw byte.
        opcode: u8,
    },
    /// A reachable body byte is not a decodable opcode.
    IllegalOp {
        /// The byte's address.
        offset: u32,
        /// The raw byte.
        opcode: u8,
    },
    /// `BEGIN`/`CBEGIN` appeared inside a procedure body.
    NestedProcedure {
        /// The instruction's address.
        offset: u32,
        /// The enclosing procedure.
        proc: u32,
    },
    /// The end-of-file marker appeared inside a procedure body.
    EofInsideProcedure {
        /// The marker's address.
        offset: u32,
    },
    /// One instruction is reachable from two different procedures.
    ProcedureOverlap {
        /// The instruction's address.
        offset: u32,
        /// The procedure that claimed it first.
        first: u32,
        /// The procedure that claimed it second.
        second: u32,
    },
    /// A byte serves both as an opcode and as immediate data.
    InstructionOverlap {
        /// The conflicting byte's address.
        offset: u32,
    },
    /// A jump target lands inside an instruction's immediate bytes.
    JumpIntoImmediate {
        /// The target address.
        offset: u32,
    },
    /// Two paths reach one instruction with different stack heights.
    StackHeightMismatch {
        /// The instruction's address.
        offset: u32,
        /// The height recorded first.
        first: u32,
        /// The height on the conflicting path.
        second: u32,
    },
    /// An instruction pops more operands than the stack holds.
    StackUnderflow {
        /// The instruction's address.
        offset: u32,
        /// Operands required.
        need: u32,
        /// Static height available.
        have: u32,
    },
    /// The static stack height exceeded [`MAX_STACK_HEIGHT`].
    StackHeightOverflow {
        /// The instruction's address.
        offset: u32,
    },
    /// A global index is out of range for the module.
    GlobalOutOfRange {
        /// The varspec's address.
        offset: u32,
        /// The index.
        idx: u32,
        /// The module's global count.
        count: u32,
    },
    /// A local index is out of range for the procedure.
    LocalOutOfRange {
        /// The varspec's address.
        offset: u32,
        /// The index.
        idx: u32,
        /// The procedure's local count.
        count: u32,
    },
    /// A parameter index is out of range for the procedure.
    ParamOutOfRange {
        /// The varspec's address.
        offset: u32,
        /// The index.
        idx: u32,
        /// The procedure's parameter count.
        count: u32,
    },
    /// A capture index exceeds [`MAX_CAPTURES`].
    CaptureIndexTooLarge {
        /// The varspec's address.
        offset: u32,
        /// The index.
        idx: u32,
    },
    /// A jump target lies beyond the bytecode section.
    JumpOutOfRange {
        /// The jump immediate's address.
        offset: u32,
        /// The target.
        target: u32,
        /// The bytecode length.
        len: usize,
    },
    /// A jump target is a `BEGIN`/`CBEGIN` byte.
    JumpToProcStart {
        /// The jump immediate's address.
        offset: u32,
        /// The target.
        target: u32,
    },
    /// A jump target is the end-of-file marker.
    JumpToEofMarker {
        /// The jump immediate's address.
        offset: u32,
        /// The target.
        target: u32,
    },
    /// A closure instantiation's target lies beyond the bytecode section.
    ClosureTargetOutOfRange {
        /// The instruction's address.
        offset: u32,
        /// The target.
        target: u32,
        /// The bytecode length.
        len: usize,
    },
    /// A closure instantiation's target is not a procedure start.
    ClosureTargetNotProcedure {
        /// The instruction's address.
        offset: u32,
        /// The target.
        target: u32,
    },
    /// A closure captures fewer variables than its target uses.
    ClosureCaptureMismatch {
        /// The instruction's address.
        offset: u32,
        /// Captures provided at the instantiation site.
        captured: u32,
        /// Captures the target procedure requires.
        required: u32,
    },
    /// A call target lies beyond the bytecode section.
    CallTargetOutOfRange {
        /// The instruction's address.
        offset: u32,
        /// The target.
        target: u32,
        /// The bytecode length.
        len: usize,
    },
    /// A call target is not a procedure start.
    CallTargetNotProcedure {
        /// The instruction's address.
        offset: u32,
        /// The target.
        target: u32,
    },
    /// A direct call targets a `CBEGIN` procedure.
    CallTargetIsClosure {
        /// The instruction's address.
        offset: u32,
        /// The target.
        target: u32,
    },
    /// A call's argument count differs from the target's parameter count.
    CallArityMismatch {
        /// The instruction's address.
        offset: u32,
        /// The target's parameter count.
        expected: u32,
        /// The call's argument count.
        actual: u32,
    },
    /// A direct call targets a procedure that uses captured variables.
    CallTargetCaptures {
        /// The instruction's address.
        offset: u32,
        /// The target.
        target: u32,
    },
    /// The entry procedure uses captured variables.
    MainUsesCaptures,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SymbolAddrOutOfRange { offset, addr, len } => write!(
                f,
                "the symbol at file offset {offset} points to address {addr:#x}, beyond the bytecode of size {len:#x}"
            ),
            Self::DuplicateSymbol { name, .. } => {
                write!(f, "the symbol named `{name}` is defined multiple times")
            }
            Self::SymbolNotProcedure { addr, .. } => write!(
                f,
                "the symbol points to address {addr:#x}, which is not a procedure definition"
            ),
            Self::StringTableOutOfRange {
                str_offset, len, ..
            } => write!(
                f,
                "the string table offset {str_offset:#x} is out of bounds for the string table of size {len:#x}"
            ),
            Self::UnterminatedString { str_offset, .. } => write!(
                f,
                "the string at offset {str_offset:#x} in the string table is not NUL-terminated"
            ),
            Self::UnexpectedEof { offset, what } => write!(
                f,
                "encountered the end of the bytecode at {offset:#x} while reading the {what}"
            ),
            Self::NegativeImmediate {
                offset,
                value,
                what,
            } => write!(f, "the value {value:#x} at {offset:#x} is too large for the {what}"),
            Self::IllegalVarKind { offset, kind } => write!(
                f,
                "unrecognized variable kind encoding {kind:#04x} at {offset:#x}"
            ),
            Self::NoEofMarker { offset } => write!(
                f,
                "no end-of-file marker found in the bytecode section (scan reached {offset:#x})"
            ),
            Self::NoMainProcedure => write!(f, "no entry procedure definition found"),
            Self::MainIsClosure => write!(
                f,
                "the entry procedure must not close over variables, but it's declared with CBEGIN"
            ),
            Self::MainParamCount { params } => write!(
                f,
                "the entry procedure must take exactly 2 parameters, got {params}"
            ),
            Self::TooManyParams { offset, params } => write!(
                f,
                "the procedure at {offset:#x} declares {params} parameters; the maximum is {MAX_PARAMS}"
            ),
            Self::IllegalTopLevel { offset, opcode } => write!(
                f,
                "encountered an illegal top-level bytecode byte {opcode:#04x} at {offset:#x}"
            ),
            Self::IllegalOp { offset, opcode } => {
                write!(f, "encountered an illegal opcode {opcode:#04x} at {offset:#x}")
            }
            Self::NestedProcedure { offset, proc } => write!(
                f,
                "encountered a procedure declaration at {offset:#x} nested inside the procedure at {proc:#x}"
            ),
            Self::EofInsideProcedure { offset } => write!(
                f,
                "encountered an unexpected end-of-file marker at {offset:#x} inside a procedure definition"
            ),
            Self::ProcedureOverlap {
                offset,
                first,
                second,
            } => write!(
                f,
                "the instruction at {offset:#x} is part of multiple procedure definitions (at {first:#x} and {second:#x})"
            ),
            Self::InstructionOverlap { offset } => write!(
                f,
                "the byte at {offset:#x} is used both as an opcode and as immediate data"
            ),
            Self::JumpIntoImmediate { offset } => write!(
                f,
                "the jump target {offset:#x} is not an instruction boundary"
            ),
            Self::StackHeightMismatch {
                offset,
                first,
                second,
            } => write!(
                f,
                "detected unbalanced static stack heights at {offset:#x}: {first} and {second}"
            ),
            Self::StackUnderflow { offset, need, have } => write!(
                f,
                "not enough operands on the stack at {offset:#x}: expected at least {need}, have {have}"
            ),
            Self::StackHeightOverflow { offset } => write!(
                f,
                "exceeded the maximum static stack height of {MAX_STACK_HEIGHT} at {offset:#x}"
            ),
            Self::GlobalOutOfRange { offset, idx, count } => write!(
                f,
                "the global index {idx} at {offset:#x} is out of bounds: the module only has {count}"
            ),
            Self::LocalOutOfRange { offset, idx, count } => write!(
                f,
                "the local index {idx} at {offset:#x} is out of bounds: the procedure only has {count}"
            ),
            Self::ParamOutOfRange { offset, idx, count } => write!(
                f,
                "the parameter index {idx} at {offset:#x} is out of bounds: the procedure only has {count}"
            ),
            Self::CaptureIndexTooLarge { offset, idx } => write!(
                f,
                "the captured variable index {idx} at {offset:#x} is too large: the maximum is {MAX_CAPTURES}"
            ),
            Self::JumpOutOfRange {
                offset,
                target,
                len,
            } => write!(
                f,
                "the jump target {target:#x} at {offset:#x} is out of bounds for the bytecode section of size {len:#x}"
            ),
            Self::JumpToProcStart { target, .. } => write!(
                f,
                "the jump target {target:#x} refers to the beginning of a procedure declaration"
            ),
            Self::JumpToEofMarker { target, .. } => write!(
                f,
                "the jump target {target:#x} refers to the end-of-file marker"
            ),
            Self::ClosureTargetOutOfRange { target, len, .. } => write!(
                f,
                "the closure instantiation refers to address {target:#x}, which is out of bounds for the bytecode section of size {len:#x}"
            ),
            Self::ClosureTargetNotProcedure { target, .. } => write!(
                f,
                "the closure instantiation refers to address {target:#x}, which is not a procedure definition"
            ),
            Self::ClosureCaptureMismatch {
                captured, required, ..
            } => write!(
                f,
                "the closure instantiation captures {captured} variables while the procedure needs at least {required}"
            ),
            Self::CallTargetOutOfRange { target, len, .. } => write!(
                f,
                "the call refers to address {target:#x}, which is out of bounds for the bytecode section of size {len:#x}"
            ),
            Self::CallTargetNotProcedure { target, .. } => write!(
                f,
                "the call refers to address {target:#x}, which is not a procedure definition"
            ),
            Self::CallTargetIsClosure { .. } => write!(
                f,
                "a closure cannot be called directly, as the call does not capture variables"
            ),
            Self::CallArityMismatch {
                expected, actual, ..
            } => write!(
                f,
                "the call has a wrong number of arguments: the procedure expects {expected}, got {actual}"
            ),
            Self::CallTargetCaptures { target, .. } => write!(
                f,
                "the procedure at {target:#x} uses captured variables and must be called through a closure"
            ),
            Self::MainUsesCaptures => {
                write!(f, "the entry procedure must not use captured variables")
            }
        }
    }
}

impl std::error::Error for VerifyError {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ByteState {
    Unknown,
    Proc,
    Eof,
    Imm { proc: u32 },
    Body { proc: u32, height: u32 },
}

#[derive(Copy, Clone, Debug)]
enum WorkItem {
    TopLevel { addr: u32, main: bool },
    Body { addr: u32, proc: u32, height: u32 },
}

#[derive(Copy, Clone, Debug)]
enum Deferred {
    Closure { addr: u32, target: u32, captures: u32 },
    Call { addr: u32, target: u32, args: u32 },
}

/// Verifies `module` and returns its procedure metadata and symbol map.
pub fn verify(module: &Module) -> Result<ModuleInfo, VerifyError> {
    Verifier::new(module).run()
}

struct Verifier<'m> {
    module: &'m Module,
    bc: &'m [u8],
    states: Vec<ByteState>,
    procs: HashMap<u32, ProcInfo>,
    symtab_map: HashMap<String, u32>,
    worklist: Vec<WorkItem>,
    deferred: Vec<Deferred>,
}

fn read_imm(
    bc: &[u8],
    what: &'static str,
    at: &mut u32,
    allow_negative: bool,
) -> Result<u32, VerifyError> {
    let Some(value) = read_u32_at(bc, *at) else {
        return Err(VerifyError::UnexpectedEof { offset: *at, what });
    };
    if !allow_negative && value >> 31 != 0 {
        return Err(VerifyError::NegativeImmediate {
            offset: *at,
            value,
            what,
        });
    }
    *at += 4;
    Ok(value)
}

fn read_varspec(
    bc: &[u8],
    at: &mut u32,
    ignore_hi: bool,
) -> Result<(u32, VarKind, u32), VerifyError> {
    let addr = *at;
    if u64::from(addr) + 5 > bc.len() as u64 {
        return Err(VerifyError::UnexpectedEof {
            offset: addr,
            what: "variable descriptor",
        });
    }
    let mut kind_byte = bc[addr as usize];
    if ignore_hi {
        kind_byte &= 0xf;
    }
    let Some(kind) = VarKind::from_byte(kind_byte) else {
        return Err(VerifyError::IllegalVarKind {
            offset: addr,
            kind: kind_byte,
        });
    };
    let idx = read_u32_at(bc, addr + 1).unwrap_or(0);
    *at = addr + 5;
    Ok((addr, kind, idx))
}

fn bump(
    offset: u32,
    height: &mut u32,
    max_seen: &mut u32,
    pops: u32,
    pushes: u32,
) -> Result<(), VerifyError> {
    if *height < pops {
        return Err(VerifyError::StackUnderflow {
            offset,
            need: pops,
            have: *height,
        });
    }
    let after_pop = *height - pops;
    if MAX_STACK_HEIGHT - after_pop < pushes {
        return Err(VerifyError::StackHeightOverflow { offset });
    }
    *height = after_pop + pushes;
    *max_seen = (*max_seen).max(*height);
    Ok(())
}

fn check_varspec(
    addr: u32,
    kind: VarKind,
    idx: u32,
    global_count: u32,
    params: u32,
    locals: u32,
    capture_watermark: &mut u32,
) -> Result<(), VerifyError> {
    match kind {
        VarKind::Global if idx >= global_count => Err(VerifyError::GlobalOutOfRange {
            offset: addr,
            idx,
            count: global_count,
        }),
        VarKind::Local if idx >= locals => Err(VerifyError::LocalOutOfRange {
            offset: addr,
            idx,
            count: locals,
        }),
        VarKind::Param if idx >= params => Err(VerifyError::ParamOutOfRange {
            offset: addr,
            idx,
            count: params,
        }),
        VarKind::Capture => {
            if idx >= MAX_CAPTURES {
                return Err(VerifyError::CaptureIndexTooLarge { offset: addr, idx });
            }
            *capture_watermark = (*capture_watermark).max(idx + 1);
            Ok(())
        }
        _ => Ok(()),
    }
}

impl<'m> Verifier<'m> {
    fn new(module: &'m Module) -> Self {
        Self {
            module,
            bc: &module.bytecode,
            states: vec![ByteState::Unknown; module.bytecode.len()],
            procs: HashMap::new(),
            symtab_map: HashMap::new(),
            worklist: vec![WorkItem::TopLevel {
                addr: 0,
                main: true,
            }],
            deferred: Vec::new(),
        }
    }

    fn run(mut self) -> Result<ModuleInfo, VerifyError> {
        self.verify_symtab()?;

        while let Some(item) = self.worklist.pop() {
            match item {
                WorkItem::TopLevel { addr, main } => self.verify_top_level(addr, main)?,
                WorkItem::Body { addr, proc, height } => self.verify_body(addr, proc, height)?,
            }
        }

        self.post_validate()?;

        Ok(ModuleInfo {
            procs: self.procs,
            symtab_map: self.symtab_map,
        })
    }

    fn check_strtab(&self, str_offset: u32, offset: usize) -> Result<&'m [u8], VerifyError> {
        let strtab = &self.module.strtab;
        let Some(rest) = strtab.get(str_offset as usize..) else {
            return Err(VerifyError::StringTableOutOfRange {
                offset,
                str_offset,
                len: strtab.len(),
            });
        };
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            return Err(VerifyError::UnterminatedString { offset, str_offset });
        };
        Ok(&rest[..nul])
    }

    fn verify_symtab(&mut self) -> Result<(), VerifyError> {
        for sym in &self.module.symtab {
            if sym.addr as usize > self.bc.len() {
                return Err(VerifyError::SymbolAddrOutOfRange {
                    offset: sym.file_offset,
                    addr: sym.addr,
                    len: self.bc.len(),
                });
            }
            let name_bytes = self.check_strtab(sym.name_offset, sym.file_offset)?;
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            if self.symtab_map.insert(name.clone(), sym.addr).is_some() {
                return Err(VerifyError::DuplicateSymbol {
                    offset: sym.file_offset,
                    name,
                });
            }
        }
        Ok(())
    }

    /// Marks the immediate bytes of the instruction at `op_addr` as owned by
    /// it, so jumps into the middle of the instruction are detectable.
    fn claim_imm(&mut self, start: u32, end: u32, proc: u32) -> Result<(), VerifyError> {
        for addr in start..end {
            match self.states[addr as usize] {
                ByteState::Unknown => self.states[addr as usize] = ByteState::Imm { proc },
                _ => return Err(VerifyError::InstructionOverlap { offset: addr }),
            }
        }
        Ok(())
    }

    fn verify_top_level(&mut self, addr: u32, main: bool) -> Result<(), VerifyError> {
        if addr as usize >= self.bc.len() {
            return Err(VerifyError::NoEofMarker { offset: addr });
        }
        match self.states[addr as usize] {
            ByteState::Proc | ByteState::Eof => return Ok(()),
            ByteState::Imm { .. } => {
                return Err(VerifyError::InstructionOverlap { offset: addr });
            }
            ByteState::Body { .. } | ByteState::Unknown => {}
        }

        let byte = self.bc[addr as usize];
        match Opcode::from_byte(byte) {
            Some(op @ (Opcode::Begin | Opcode::Cbegin)) => {
                if main && op == Opcode::Cbegin {
                    return Err(VerifyError::MainIsClosure);
                }
                let mut at = addr + 1;
                let params = read_imm(self.bc, "parameter count", &mut at, false)?;
                let locals = read_imm(self.bc, "local count", &mut at, false)?;
                if params > MAX_PARAMS {
                    return Err(VerifyError::TooManyParams {
                        offset: addr,
                        params,
                    });
                }
                if main && params != 2 {
                    return Err(VerifyError::MainParamCount { params });
                }
                self.procs.insert(
                    addr,
                    ProcInfo {
                        params,
                        locals,
                        captures: 0,
                        stack_size: 0,
                        is_closure: op == Opcode::Cbegin,
                    },
                );
                self.states[addr as usize] = ByteState::Proc;
                self.claim_imm(addr + 1, at, addr)?;
                self.worklist.push(WorkItem::Body {
                    addr: at,
                    proc: addr,
                    height: 0,
                });
                Ok(())
            }
            Some(Opcode::Eof) => {
                if main {
                    return Err(VerifyError::NoMainProcedure);
                }
                self.states[addr as usize] = ByteState::Eof;
                Ok(())
            }
            _ => Err(VerifyError::IllegalTopLevel {
                offset: addr,
                opcode: byte,
            }),
        }
    }

    fn check_jmp_target(&self, target: u32, imm_addr: u32) -> Result<(), VerifyError> {
        if target as usize >= self.bc.len() {
            return Err(VerifyError::JumpOutOfRange {
                offset: imm_addr,
                target,
                len: self.bc.len(),
            });
        }
        match self.bc[target as usize] {
            b if b == Opcode::Begin.byte() || b == Opcode::Cbegin.byte() => {
                Err(VerifyError::JumpToProcStart {
                    offset: imm_addr,
                    target,
                })
            }
            0xff => Err(VerifyError::JumpToEofMarker {
                offset: imm_addr,
                target,
            }),
            _ => Ok(()),
        }
    }

    fn verify_body(&mut self, addr: u32, proc: u32, height: u32) -> Result<(), VerifyError> {
        if addr as usize >= self.bc.len() {
            return Err(VerifyError::UnexpectedEof {
                offset: addr,
                what: "next instruction",
            });
        }
        match self.states[addr as usize] {
            ByteState::Body {
                proc: first,
                height: recorded,
            } => {
                if first != proc {
                    return Err(VerifyError::ProcedureOverlap {
                        offset: addr,
                        first,
                        second: proc,
                    });
                }
                if recorded != height {
                    return Err(VerifyError::StackHeightMismatch {
                        offset: addr,
                        first: recorded,
                        second: height,
                    });
                }
                return Ok(());
            }
            ByteState::Imm { .. } => {
                return Err(VerifyError::JumpIntoImmediate { offset: addr });
            }
            ByteState::Proc | ByteState::Eof | ByteState::Unknown => {}
        }

        let op_addr = addr;
        let byte = self.bc[op_addr as usize];
        let Some(op) = Opcode::from_byte(byte) else {
            return Err(VerifyError::IllegalOp {
                offset: op_addr,
                opcode: byte,
            });
        };

        let (params, locals) = {
            let Some(info) = self.procs.get(&proc) else {
                unreachable!("body work item for an unknown procedure");
            };
            (info.params, info.locals)
        };
        let global_count = self.module.global_count;

        self.states[op_addr as usize] = ByteState::Body {
            proc,
            height,
        };

        let mut at = op_addr + 1;
        let mut h = height;
        let mut max_seen = height;
        let mut capture_watermark = 0_u32;
        let mut fall_through = true;

        match op {
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::And
            | Opcode::Or => bump(op_addr, &mut h, &mut max_seen, 2, 1)?,

            Opcode::Const => {
                read_imm(self.bc, "integer constant", &mut at, true)?;
                bump(op_addr, &mut h, &mut max_seen, 0, 1)?;
            }

            Opcode::String => {
                let s_addr = at;
                let s = read_imm(self.bc, "string table offset", &mut at, false)?;
                self.check_strtab(s, s_addr as usize)?;
                bump(op_addr, &mut h, &mut max_seen, 0, 1)?;
            }

            Opcode::Sexp => {
                let s_addr = at;
                let s = read_imm(self.bc, "string table offset", &mut at, false)?;
                let n = read_imm(self.bc, "sexp member count", &mut at, false)?;
                self.check_strtab(s, s_addr as usize)?;
                bump(op_addr, &mut h, &mut max_seen, n, 1)?;
            }

            Opcode::Sti => bump(op_addr, &mut h, &mut max_seen, 2, 1)?,
            Opcode::Sta => bump(op_addr, &mut h, &mut max_seen, 3, 1)?,

            Opcode::Jmp => {
                let l_addr = at;
                let l = read_imm(self.bc, "jump target", &mut at, false)?;
                self.check_jmp_target(l, l_addr)?;
                self.worklist.push(WorkItem::Body {
                    addr: l,
                    proc,
                    height: h,
                });
                fall_through = false;
            }

            Opcode::End => {
                bump(op_addr, &mut h, &mut max_seen, 1, 1)?;
                self.worklist.push(WorkItem::TopLevel {
                    addr: at,
                    main: false,
                });
                fall_through = false;
            }

            Opcode::Ret => {
                bump(op_addr, &mut h, &mut max_seen, 1, 1)?;
                fall_through = false;
            }

            Opcode::Drop => bump(op_addr, &mut h, &mut max_seen, 1, 0)?,
            Opcode::Dup => bump(op_addr, &mut h, &mut max_seen, 1, 2)?,
            Opcode::Swap => bump(op_addr, &mut h, &mut max_seen, 2, 2)?,
            Opcode::Elem => bump(op_addr, &mut h, &mut max_seen, 2, 1)?,

            Opcode::LdG
            | Opcode::LdL
            | Opcode::LdA
            | Opcode::LdC
            | Opcode::LdaG
            | Opcode::LdaL
            | Opcode::LdaA
            | Opcode::LdaC => {
                at = op_addr;
                let (vs_addr, kind, idx) = read_varspec(self.bc, &mut at, true)?;
                check_varspec(
                    vs_addr,
                    kind,
                    idx,
                    global_count,
                    params,
                    locals,
                    &mut capture_watermark,
                )?;
                bump(op_addr, &mut h, &mut max_seen, 0, 1)?;
            }

            Opcode::StG | Opcode::StL | Opcode::StA | Opcode::StC => {
                at = op_addr;
                let (vs_addr, kind, idx) = read_varspec(self.bc, &mut at, true)?;
                check_varspec(
                    vs_addr,
                    kind,
                    idx,
                    global_count,
                    params,
                    locals,
                    &mut capture_watermark,
                )?;
                bump(op_addr, &mut h, &mut max_seen, 1, 1)?;
            }

            Opcode::CjmpZ | Opcode::CjmpNz => {
                let l_addr = at;
                let l = read_imm(self.bc, "jump target", &mut at, false)?;
                self.check_jmp_target(l, l_addr)?;
                bump(op_addr, &mut h, &mut max_seen, 1, 0)?;
                // Both successors observe the height after the condition pops.
                self.worklist.push(WorkItem::Body {
                    addr: l,
                    proc,
                    height: h,
                });
            }

            Opcode::Begin | Opcode::Cbegin => {
                return Err(VerifyError::NestedProcedure {
                    offset: op_addr,
                    proc,
                });
            }

            Opcode::Closure => {
                let l = read_imm(self.bc, "call target", &mut at, false)?;
                let n = read_imm(self.bc, "captured variable count", &mut at, false)?;
                for _ in 0..n {
                    let (vs_addr, kind, idx) = read_varspec(self.bc, &mut at, false)?;
                    check_varspec(
                        vs_addr,
                        kind,
                        idx,
                        global_count,
                        params,
                        locals,
                        &mut capture_watermark,
                    )?;
                }
                bump(op_addr, &mut h, &mut max_seen, 0, 1)?;
                self.deferred.push(Deferred::Closure {
                    addr: op_addr,
                    target: l,
                    captures: n,
                });
                self.worklist.push(WorkItem::TopLevel {
                    addr: l,
                    main: false,
                });
            }

            Opcode::CallC => {
                let n = read_imm(self.bc, "argument count", &mut at, false)?;
                bump(op_addr, &mut h, &mut max_seen, n + 1, 1)?;
            }

            Opcode::Call => {
                let l = read_imm(self.bc, "call target", &mut at, false)?;
                let n = read_imm(self.bc, "argument count", &mut at, false)?;
                bump(op_addr, &mut h, &mut max_seen, n, 1)?;
                self.deferred.push(Deferred::Call {
                    addr: op_addr,
                    target: l,
                    args: n,
                });
                self.worklist.push(WorkItem::TopLevel {
                    addr: l,
                    main: false,
                });
            }

            Opcode::Tag => {
                let s_addr = at;
                let s = read_imm(self.bc, "string table offset", &mut at, false)?;
                read_imm(self.bc, "member count", &mut at, false)?;
                self.check_strtab(s, s_addr as usize)?;
                bump(op_addr, &mut h, &mut max_seen, 1, 1)?;
            }

            Opcode::Array => {
                read_imm(self.bc, "element count", &mut at, false)?;
                bump(op_addr, &mut h, &mut max_seen, 1, 1)?;
            }

            Opcode::Fail => {
                read_imm(self.bc, "line number", &mut at, false)?;
                read_imm(self.bc, "column number", &mut at, false)?;
                bump(op_addr, &mut h, &mut max_seen, 1, 0)?;
                fall_through = false;
            }

            Opcode::Line => {
                read_imm(self.bc, "line number", &mut at, false)?;
            }

            Opcode::PattEqStr => bump(op_addr, &mut h, &mut max_seen, 2, 1)?,
            Opcode::PattString
            | Opcode::PattArray
            | Opcode::PattSexp
            | Opcode::PattRef
            | Opcode::PattVal
            | Opcode::PattFun => bump(op_addr, &mut h, &mut max_seen, 1, 1)?,

            Opcode::CallLread => bump(op_addr, &mut h, &mut max_seen, 0, 1)?,
            Opcode::CallLwrite | Opcode::CallLlength | Opcode::CallLstring => {
                bump(op_addr, &mut h, &mut max_seen, 1, 1)?;
            }
            Opcode::CallBarray => {
                let n = read_imm(self.bc, "element count", &mut at, false)?;
                bump(op_addr, &mut h, &mut max_seen, n, 1)?;
            }

            Opcode::Eof => {
                return Err(VerifyError::EofInsideProcedure { offset: op_addr });
            }
        }

        self.claim_imm(op_addr + 1, at, proc)?;

        if fall_through {
            self.worklist.push(WorkItem::Body {
                addr: at,
                proc,
                height: h,
            });
        }

        let Some(info) = self.procs.get_mut(&proc) else {
            unreachable!("body work item for an unknown procedure");
        };
        info.stack_size = info.stack_size.max(max_seen);
        info.captures = info.captures.max(capture_watermark);

        Ok(())
    }

    fn post_validate(&self) -> Result<(), VerifyError> {
        for d in &self.deferred {
            match *d {
                Deferred::Closure {
                    addr,
                    target,
                    captures,
                } => {
                    if target as usize >= self.bc.len() {
                        return Err(VerifyError::ClosureTargetOutOfRange {
                            offset: addr,
                            target,
                            len: self.bc.len(),
                        });
                    }
                    let Some(info) = self.procs.get(&target) else {
                        return Err(VerifyError::ClosureTargetNotProcedure {
                            offset: addr,
                            target,
                        });
                    };
                    if captures < info.captures {
                        return Err(VerifyError::ClosureCaptureMismatch {
                            offset: addr,
                            captured: captures,
                            required: info.captures,
                        });
                    }
                }
                Deferred::Call { addr, target, args } => {
                    if target as usize >= self.bc.len() {
                        return Err(VerifyError::CallTargetOutOfRange {
                            offset: addr,
                            target,
                            len: self.bc.len(),
                        });
                    }
                    let Some(info) = self.procs.get(&target) else {
                        return Err(VerifyError::CallTargetNotProcedure {
                            offset: addr,
                            target,
                        });
                    };
                    if info.is_closure {
                        return Err(VerifyError::CallTargetIsClosure {
                            offset: addr,
                            target,
                        });
                    }
                    if args != info.params {
                        return Err(VerifyError::CallArityMismatch {
                            offset: addr,
                            expected: info.params,
                            actual: args,
                        });
                    }
                    // The capture region only exists in closure frames.
                    if info.captures > 0 {
                        return Err(VerifyError::CallTargetCaptures {
                            offset: addr,
                            target,
                        });
                    }
                }
            }
        }

        if self.procs.get(&0).is_some_and(|p| p.captures > 0) {
            return Err(VerifyError::MainUsesCaptures);
        }

        for sym in &self.module.symtab {
            if !self.procs.contains_key(&sym.addr) {
                return Err(VerifyError::SymbolNotProcedure {
                    offset: sym.file_offset,
                    addr: sym.addr,
                });
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

    fn raw_module(global_count: u32, bytecode: &[u8]) -> Module {
        Module {
            name: "test".into(),
            global_count,
            symtab: Vec::new(),
            strtab: b"main\0".to_vec(),
            bytecode: bytecode.to_vec(),
        }
    }

    fn begin(params: u32, locals: u32) -> Vec<u8> {
        let mut v = vec![Opcode::Begin.byte()];
        v.extend_from_slice(&params.to_le_bytes());
        v.extend_from_slice(&locals.to_le_bytes());
        v
    }

    #[test]
    fn accepts_a_minimal_module() {
        // BEGIN 2 0; CONST 0; END; EOF
        let mut bc = begin(2, 0);
        bc.extend_from_slice(&[0x10, 0, 0, 0, 0, 0x16, 0xff]);
        let m = raw_module(0, &bc);
        let info = verify(&m).unwrap();
        let proc = &info.procs[&0];
        assert_eq!(proc.params, 2);
        assert_eq!(proc.locals, 0);
        assert_eq!(proc.stack_size, 1);
        assert!(!proc.is_closure);
    }

    #[test]
    fn rejects_main_with_wrong_arity() {
        let mut bc = begin(1, 0);
        bc.extend_from_slice(&[0x10, 0, 0, 0, 0, 0x16, 0xff]);
        let err = verify(&raw_module(0, &bc)).unwrap_err();
        assert_eq!(err, VerifyError::MainParamCount { params: 1 });
    }

    #[test]
    fn rejects_cbegin_main() {
        let mut bc = vec![Opcode::Cbegin.byte()];
        bc.extend_from_slice(&2_u32.to_le_bytes());
        bc.extend_from_slice(&0_u32.to_le_bytes());
        bc.extend_from_slice(&[0x10, 0, 0, 0, 0, 0x16, 0xff]);
        let err = verify(&raw_module(0, &bc)).unwrap_err();
        assert_eq!(err, VerifyError::MainIsClosure);
    }

    #[test]
    fn rejects_unbalanced_branch_heights() {
        let mut b = ModuleBuilder::new("unbalanced");
        let a = b.asm();
        a.begin(2, 0);
        let join = a.label();
        a.const_(1);
        a.cjmpz(join);
        // Fall-through path pushes an extra value before the merge point.
        a.const_(2);
        a.place(join);
        a.const_(3);
        a.end();
        let m = b.build().unwrap();
        let err = verify(&m).unwrap_err();
        assert!(
            matches!(err, VerifyError::StackHeightMismatch { first: 0, second: 1, .. })
                || matches!(err, VerifyError::StackHeightMismatch { first: 1, second: 0, .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn branch_targets_observe_post_pop_height() {
        // A diamond: both arms leave one value for the join.
        let mut b = ModuleBuilder::new("diamond");
        let a = b.asm();
        a.begin(2, 0);
        let other = a.label();
        let join = a.label();
        a.const_(1);
        a.cjmpz(other);
        a.const_(10);
        a.jmp(join);
        a.place(other);
        a.const_(20);
        a.place(join);
        a.end();
        let m = b.build().unwrap();
        verify(&m).unwrap();
    }

    #[test]
    fn rejects_jump_to_proc_start_and_eof() {
        let mut bc = begin(2, 0);
        // JMP 0 targets our own BEGIN.
        bc.extend_from_slice(&[0x15, 0, 0, 0, 0]);
        bc.push(0xff);
        let err = verify(&raw_module(0, &bc)).unwrap_err();
        assert!(matches!(err, VerifyError::JumpToProcStart { target: 0, .. }));

        let mut bc = begin(2, 0);
        let eof_addr = (bc.len() + 5) as u32;
        bc.push(0x15);
        bc.extend_from_slice(&eof_addr.to_le_bytes());
        bc.push(0xff);
        let err = verify(&raw_module(0, &bc)).unwrap_err();
        assert!(matches!(err, VerifyError::JumpToEofMarker { .. }));
    }

    #[test]
    fn rejects_jump_into_immediate_bytes() {
        let mut b = ModuleBuilder::new("midjump");
        let a = b.asm();
        a.begin(2, 0);
        let start = a.here();
        a.const_(0x10101010);
        a.drop_();
        // Jump into the middle of the CONST immediate.
        a.jmp_to(start + 2);
        let m = b.build().unwrap();
        let err = verify(&m).unwrap_err();
        assert!(
            matches!(
                err,
                VerifyError::JumpIntoImmediate { .. } | VerifyError::InstructionOverlap { .. }
            ),
            "got {err:?}"
        );
    }

    #[test]
    fn rejects_call_to_cbegin() {
        let mut b = ModuleBuilder::new("callc");
        let a = b.asm();
        a.begin(2, 0);
        let f = a.label();
        a.call(f, 0);
        a.end();
        a.place(f);
        a.cbegin(0, 0);
        a.const_(0);
        a.end();
        let m = b.build().unwrap();
        let err = verify(&m).unwrap_err();
        assert!(matches!(err, VerifyError::CallTargetIsClosure { .. }));
    }

    #[test]
    fn rejects_call_arity_mismatch() {
        let mut b = ModuleBuilder::new("arity");
        let a = b.asm();
        a.begin(2, 0);
        let f = a.label();
        a.const_(1);
        a.call(f, 1);
        a.end();
        a.place(f);
        a.begin(2, 0);
        a.const_(0);
        a.end();
        let m = b.build().unwrap();
        let err = verify(&m).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::CallArityMismatch {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn rejects_undercapturing_closure() {
        let mut b = ModuleBuilder::new("caps");
        let a = b.asm();
        a.begin(2, 1);
        let f = a.label();
        a.closure(f, &[(VarKind::Local, 0)]);
        a.drop_();
        a.const_(0);
        a.end();
        a.place(f);
        a.cbegin(0, 0);
        // Uses captures 0 and 1, but the site above only provides one.
        a.ld(VarKind::Capture, 1);
        a.end();
        let m = b.build().unwrap();
        let err = verify(&m).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::ClosureCaptureMismatch {
                captured: 1,
                required: 2,
                ..
            }
        ));
    }

    #[test]
    fn tracks_capture_watermarks_and_stack_sizes() {
        let mut b = ModuleBuilder::new("watermark");
        let a = b.asm();
        a.begin(2, 1);
        let f = a.label();
        a.closure(f, &[(VarKind::Local, 0), (VarKind::Param, 1)]);
        a.drop_();
        a.const_(0);
        a.end();
        a.place(f);
        let f_addr = a.here();
        a.cbegin(0, 0);
        a.ld(VarKind::Capture, 1);
        a.ld(VarKind::Capture, 0);
        a.add();
        a.end();
        let m = b.build().unwrap();
        let info = verify(&m).unwrap();
        let proc = &info.procs[&f_addr];
        assert_eq!(proc.captures, 2);
        assert_eq!(proc.stack_size, 2);
        assert!(proc.is_closure);
    }

    #[test]
    fn rejects_out_of_range_varspecs() {
        let mut b = ModuleBuilder::new("vars");
        let a = b.asm();
        a.begin(2, 1);
        a.ld(VarKind::Local, 3);
        a.end();
        let m = b.build().unwrap();
        let err = verify(&m).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::LocalOutOfRange { idx: 3, count: 1, .. }
        ));

        let mut b = ModuleBuilder::new("globals");
        b.globals(1);
        let a = b.asm();
        a.begin(2, 0);
        a.ld(VarKind::Global, 4);
        a.end();
        let m = b.build().unwrap();
        let err = verify(&m).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::GlobalOutOfRange { idx: 4, count: 1, .. }
        ));
    }

    #[test]
    fn rejects_duplicate_symbols() {
        let mut b = ModuleBuilder::new("dups");
        let a = b.asm();
        let entry = a.label();
        a.place(entry);
        a.begin(2, 0);
        a.const_(0);
        a.end();
        b.symbol("main", entry);
        b.symbol("main", entry);
        let m = b.build().unwrap();
        let err = verify(&m).unwrap_err();
        assert!(matches!(err, VerifyError::DuplicateSymbol { ref name, .. } if name == "main"));
    }

    #[test]
    fn rejects_symbols_that_are_not_procedures() {
        let mut b = ModuleBuilder::new("sym");
        let a = b.asm();
        let entry = a.label();
        a.place(entry);
        a.begin(2, 0);
        let mid = a.label();
        a.place(mid);
        a.const_(0);
        a.end();
        b.symbol("mid", mid);
        let m = b.build().unwrap();
        let err = verify(&m).unwrap_err();
        assert!(matches!(err, VerifyError::SymbolNotProcedure { .. }));
    }

    #[test]
    fn accepts_reserved_opcodes_syntactically() {
        // STI pops two and pushes one; the verifier treats it as any other
        // balanced instruction even though the interpreter will not run it.
        let mut bc = begin(2, 0);
        bc.extend_from_slice(&[0x10, 1, 0, 0, 0]); // const 1
        bc.extend_from_slice(&[0x10, 2, 0, 0, 0]); // const 2
        bc.push(0x13); // sti
        bc.push(0x16); // end
        bc.push(0xff);
        verify(&raw_module(0, &bc)).unwrap();
    }

    #[test]
    fn rejects_negative_jump_immediates() {
        let mut bc = begin(2, 0);
        bc.push(0x15);
        bc.extend_from_slice(&0x8000_0000_u32.to_le_bytes());
        bc.push(0xff);
        let err = verify(&raw_module(0, &bc)).unwrap_err();
        assert!(matches!(
            err,
            VerifyError::NegativeImmediate {
                what: "jump target",
                ..
            }
        ));
    }
}
