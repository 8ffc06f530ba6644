// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The runtime bridge: the virtual stack and the allocation entry points.
//!
//! The collector sees one contiguous region of live values, delimited by
//! [`Runtime::stack_top`] and [`Runtime::stack_bottom`]. Every cell in
//! between is a potential root; anything that must survive an allocation has
//! to be stored there first. Raw borrows into heap payloads must not be held
//! across an allocation call; re-derive them from the rooted value instead.
//!
//! The runtime is a process-wide singleton: at most one [`Runtime`] may be
//! live at a time, and [`Runtime::init`] rejects a second with
//! [`Reentrance`]. Shutdown happens in `Drop`, so it runs exactly once,
//! including on error paths.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::heap::Heap;
use crate::value::Value;

static RUNNING: AtomicBool = AtomicBool::new(false);

/// A second interpreter instance was started while one is live.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reentrance;

impl fmt::Display for Reentrance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "detected multiple concurrent interpreter instances")
    }
}

impl std::error::Error for Reentrance {}

/// The process-wide runtime handle.
///
/// Owns the heap and the virtual stack. Interpreter internals manipulate the
/// stack region directly; embedders and the collector observe it through
/// [`Runtime::roots`].
#[derive(Debug)]
pub struct Runtime {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    /// One past the last live stack value.
    pub(crate) bottom: usize,
}

impl Runtime {
    /// Initializes the runtime with `root_cells` default-initialized live
    /// cells (the globals region plus any entry arguments).
    ///
    /// Fails with [`Reentrance`] if another [`Runtime`] is live in this
    /// process.
    pub fn init(root_cells: usize) -> Result<Self, Reentrance> {
        if RUNNING.swap(true, Ordering::AcqRel) {
            return Err(Reentrance);
        }
        Ok(Self {
            heap: Heap::new(),
            stack: vec![Value::default(); root_cells],
            bottom: root_cells,
        })
    }

    /// Returns the index of the first root cell.
    #[must_use]
    pub fn stack_top(&self) -> usize {
        0
    }

    /// Returns the index one past the last live root cell.
    #[must_use]
    pub fn stack_bottom(&self) -> usize {
        self.bottom
    }

    /// Returns the live root region as a contiguous slice.
    #[must_use]
    pub fn roots(&self) -> &[Value] {
        &self.stack[..self.bottom]
    }

    /// Allocates a string holding a copy of `bytes`.
    pub fn alloc_string(&mut self, bytes: &[u8]) -> Value {
        self.heap.alloc_string(bytes)
    }

    /// Allocates an array of `len` default-initialized slots.
    pub fn alloc_array(&mut self, len: usize) -> Value {
        self.heap.alloc_array(len)
    }

    /// Allocates an S-expression tagged with the string-table offset `tag`.
    pub fn alloc_sexp(&mut self, tag: u32, len: usize) -> Value {
        self.heap.alloc_sexp(tag, len)
    }

    /// Allocates a closure over `captures` capture slots targeting `entry`.
    pub fn alloc_closure(&mut self, entry: u32, captures: usize) -> Value {
        self.heap.alloc_closure(entry, captures)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        RUNNING.store(false, Ordering::Release);
    }
}

/// Serializes tests that initialize the process-wide runtime.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
