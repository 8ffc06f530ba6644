// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Benchmark-only crate; see `benches/vm.rs`.
