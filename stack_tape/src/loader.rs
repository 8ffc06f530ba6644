// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Container loading.
//!
//! The file layout is little-endian: string-table size, global count, symbol
//! count, `count × (address, name offset)` symbol entries, the string table
//! bytes, and the bytecode terminated by a `0xff` end-of-file marker that
//! must be the final byte. Header counts and offsets with the top bit set
//! are rejected as negative.

use core::fmt;

use crate::module::{Module, Sym};

/// Why loading failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadErrorKind {
    /// The file ended before the named field was complete.
    UnexpectedEof {
        /// What was being read when the file ran out.
        what: &'static str,
        /// How many more bytes were needed.
        missing: usize,
    },
    /// A header count or offset had the top bit set.
    NegativeField {
        /// The offending field.
        what: &'static str,
        /// The raw value.
        value: u32,
    },
    /// The bytecode section carries no end-of-file marker.
    NoEofMarker,
    /// An end-of-file marker appeared before the final bytecode byte.
    EarlyEofMarker,
}

/// A loading error with the file offset where it was detected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadError {
    /// The byte offset into the file.
    pub offset: usize,
    /// The failure kind.
    pub kind: LoadErrorKind,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LoadErrorKind::UnexpectedEof { what, missing } => write!(
                f,
                "unexpected end of file at offset {} while reading the {what}: need {missing} more bytes",
                self.offset
            ),
            LoadErrorKind::NegativeField { what, value } => write!(
                f,
                "the {what} at offset {} must not be negative (got {value:#x})",
                self.offset
            ),
            LoadErrorKind::NoEofMarker => write!(
                f,
                "no end-of-file marker found in the bytecode section starting at offset {}",
                self.offset
            ),
            LoadErrorKind::EarlyEofMarker => write!(
                f,
                "the end-of-file marker at offset {} must be the final byte of the file",
                self.offset
            ),
        }
    }
}

impl std::error::Error for LoadError {}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, what: &'static str, len: usize) -> Result<&'a [u8], LoadError> {
        let end = self.offset.saturating_add(len);
        let Some(slice) = self.bytes.get(self.offset..end) else {
            return Err(LoadError {
                offset: self.bytes.len(),
                kind: LoadErrorKind::UnexpectedEof {
                    what,
                    missing: end - self.bytes.len(),
                },
            });
        };
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, LoadError> {
        let at = self.offset;
        let b = self.take(what, 4)?;
        let value = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        if value >> 31 != 0 {
            return Err(LoadError {
                offset: at,
                kind: LoadErrorKind::NegativeField { what, value },
            });
        }
        Ok(value)
    }
}

/// Loads a module named `name` from the in-memory file image `bytes`.
pub fn load(name: &str, bytes: &[u8]) -> Result<Module, LoadError> {
    let mut r = Reader { bytes, offset: 0 };

    let strtab_size = r.read_u32("string table size")? as usize;
    let global_count = r.read_u32("global count")?;
    let symtab_count = r.read_u32("symbol table entry count")? as usize;

    let mut symtab = Vec::with_capacity(symtab_count);
    for _ in 0..symtab_count {
        let file_offset = r.offset;
        let addr = r.read_u32("symbol table entry's address")?;
        let name_offset = r.read_u32("symbol table entry's name")?;
        symtab.push(Sym {
            file_offset,
            addr,
            name_offset,
        });
    }

    let strtab = r.take("string table", strtab_size)?.to_vec();

    let bytecode_start = r.offset;
    let bytecode = bytes[bytecode_start..].to_vec();

    match bytecode.iter().position(|&b| b == 0xff) {
        None => {
            return Err(LoadError {
                offset: bytecode_start,
                kind: LoadErrorKind::NoEofMarker,
            });
        }
        Some(pos) if pos + 1 != bytecode.len() => {
            return Err(LoadError {
                offset: bytecode_start + pos,
                kind: LoadErrorKind::EarlyEofMarker,
            });
        }
        Some(_) => {}
    }

    Ok(Module {
        name: name.to_string(),
        global_count,
        symtab,
        strtab,
        bytecode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(strtab: &[u8], syms: &[(u32, u32)], globals: u32, bytecode: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(strtab.len() as u32).to_le_bytes());
        out.extend_from_slice(&globals.to_le_bytes());
        out.extend_from_slice(&(syms.len() as u32).to_le_bytes());
        for &(addr, name) in syms {
            out.extend_from_slice(&addr.to_le_bytes());
            out.extend_from_slice(&name.to_le_bytes());
        }
        out.extend_from_slice(strtab);
        out.extend_from_slice(bytecode);
        out
    }

    #[test]
    fn loads_a_minimal_module() {
        let bytes = image(b"main\0", &[(0, 0)], 2, &[0x52, 2, 0, 0, 0, 0, 0, 0, 0, 0x16, 0xff]);
        let m = load("m", &bytes).unwrap();
        assert_eq!(m.global_count, 2);
        assert_eq!(m.symtab.len(), 1);
        assert_eq!(m.str_at(m.symtab[0].name_offset), Some(&b"main"[..]));
        assert_eq!(m.bytecode.last(), Some(&0xff));
    }

    #[test]
    fn rejects_negative_header_fields() {
        let mut bytes = image(b"", &[], 0, &[0xff]);
        bytes[4..8].copy_from_slice(&0x8000_0000_u32.to_le_bytes());
        let err = load("m", &bytes).unwrap_err();
        assert_eq!(
            err.kind,
            LoadErrorKind::NegativeField {
                what: "global count",
                value: 0x8000_0000
            }
        );
        assert_eq!(err.offset, 4);
    }

    #[test]
    fn rejects_truncated_symtab() {
        // Claim one symbol entry but provide none.
        let mut bytes = image(b"", &[], 0, &[0xff]);
        bytes[8..12].copy_from_slice(&1_u32.to_le_bytes());
        let err = load("m", &bytes).unwrap_err();
        assert!(matches!(
            err.kind,
            LoadErrorKind::UnexpectedEof {
                what: "symbol table entry's address",
                ..
            }
        ));
    }

    #[test]
    fn rejects_missing_eof_marker() {
        let bytes = image(b"", &[], 0, &[0x18, 0x18]);
        let err = load("m", &bytes).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::NoEofMarker);
    }

    #[test]
    fn rejects_early_eof_marker() {
        let bytes = image(b"", &[], 0, &[0x18, 0xff, 0x18, 0xff]);
        let err = load("m", &bytes).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::EarlyEofMarker);
        assert_eq!(err.offset, 13);
    }
}
