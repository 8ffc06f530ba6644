// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `stack-tape` command-line driver.
//!
//! Exit codes: 0 on success, 1 on any loader/verifier/runtime error, 2 on
//! argument parsing errors. Program output goes to stdout; diagnostics and
//! timings go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};

use stack_tape::disasm::{DisasOpts, disassemble_with};
use stack_tape::idiom::find_idioms;
use stack_tape::interp::Interpreter;
use stack_tape::loader;

mod timing;

use timing::Timings;

const USAGE: &str = "\
Usage: stack-tape [-h] [-t] [--mode=MODE] [--] <input>

  <input>       A path to the bytecode file to interpret.

Options:
  -h, --help    Print this help message.

  -t, --time    Measure the execution time.

  --mode=MODE   Select the execution mode. Available choices:
                - disas: disassemble the bytecode and exit.
                - verify: only perform bytecode verification.
                - idiom: search for bytecode idioms.
                - run: execute the bytecode (default).";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Disas,
    Verify,
    Idiom,
    Run,
}

struct Args {
    input: PathBuf,
    mode: Mode,
    time: bool,
}

fn usage_error(msg: &str) -> ! {
    eprintln!("{msg}");
    eprintln!("{USAGE}");
    std::process::exit(2);
}

fn parse_args() -> Args {
    let mut input: Option<PathBuf> = None;
    let mut mode = Mode::Run;
    let mut time = false;
    let mut positional_only = false;

    for arg in std::env::args().skip(1) {
        if !positional_only && arg == "--" {
            positional_only = true;
        } else if !positional_only && arg.starts_with('-') {
            match arg.as_str() {
                "-h" | "--help" => {
                    eprintln!("{USAGE}");
                    std::process::exit(0);
                }
                "-t" | "--time" => time = true,
                "--mode" => usage_error("--mode requires a value"),
                _ => {
                    if let Some(value) = arg.strip_prefix("--mode=") {
                        mode = match value {
                            "disas" => Mode::Disas,
                            "verify" => Mode::Verify,
                            "idiom" => Mode::Idiom,
                            "run" => Mode::Run,
                            _ => usage_error(&format!("Unrecognized mode: {value}")),
                        };
                    } else {
                        usage_error(&format!("Unrecognized option: {arg}"));
                    }
                }
            }
        } else if input.is_none() {
            input = Some(PathBuf::from(arg));
        } else {
            usage_error(&format!("Unexpected positional argument: {arg}"));
        }
    }

    let Some(input) = input else {
        usage_error("No input path given.");
    };
    Args { input, mode, time }
}

fn drive(args: &Args) -> Result<()> {
    let mut timings = Timings::new(args.time);

    let bytes = timings
        .measure("read", || std::fs::read(&args.input))
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let name = args.input.display().to_string();
    let module = timings.measure("load", || loader::load(&name, &bytes))?;

    match args.mode {
        Mode::Disas => {
            let listing = disassemble_with(
                &module.bytecode,
                DisasOpts {
                    print_addr: true,
                    instr_sep: "\n",
                },
            );
            timings.measure("disas", || println!("{listing}"));
        }

        Mode::Verify => {
            timings.measure("verify", || stack_tape::verifier::verify(&module))?;
        }

        Mode::Idiom => {
            let info = timings.measure("verify", || stack_tape::verifier::verify(&module))?;
            let idioms = timings.measure("idiom", || find_idioms(&module, &info));
            for idiom in &idioms {
                println!(
                    "{:>8}  {}",
                    idiom.occurrences,
                    disassemble_with(
                        idiom.instrs,
                        DisasOpts {
                            print_addr: false,
                            instr_sep: "; ",
                        },
                    )
                );
            }
        }

        Mode::Run => {
            #[cfg(not(feature = "dynamic-checks"))]
            {
                let info = timings.measure("verify", || stack_tape::verifier::verify(&module))?;
                timings.measure("run", || {
                    let stdin = std::io::stdin();
                    let stdout = std::io::stdout();
                    Interpreter::new(&module, &info, stdin.lock(), stdout.lock()).run()
                })?;
            }
            #[cfg(feature = "dynamic-checks")]
            {
                timings.measure("run", || {
                    let stdin = std::io::stdin();
                    let stdout = std::io::stdout();
                    Interpreter::new(&module, stdin.lock(), stdout.lock()).run()
                })?;
            }
        }
    }

    timings.report();
    Ok(())
}

fn main() -> ExitCode {
    let args = parse_args();
    match drive(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("stack-tape: {e:#}");
            ExitCode::FAILURE
        }
    }
}
