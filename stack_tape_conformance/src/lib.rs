// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared helpers for the conformance suite.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Serializes tests that initialize the process-wide interpreter runtime.
pub fn runtime_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}
