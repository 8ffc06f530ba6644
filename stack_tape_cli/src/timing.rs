// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-stage wall-clock measurements for the `-t` flag.

use std::time::{Duration, Instant};

/// Collects named wall-clock measurements.
pub struct Timings {
    enabled: bool,
    measurements: Vec<(&'static str, Duration)>,
}

impl Timings {
    /// Creates a collector; when `enabled` is false, [`Timings::measure`]
    /// runs its closure without measuring.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            measurements: Vec::new(),
        }
    }

    /// Runs `f`, recording its elapsed time under `name`.
    pub fn measure<T>(&mut self, name: &'static str, f: impl FnOnce() -> T) -> T {
        if !self.enabled {
            return f();
        }
        let start = Instant::now();
        let result = f();
        self.measurements.push((name, start.elapsed()));
        result
    }

    /// Prints the recorded measurements to stderr.
    pub fn report(&self) {
        for &(name, elapsed) in &self.measurements {
            eprintln!("{name}: {elapsed:?}");
        }
    }
}
