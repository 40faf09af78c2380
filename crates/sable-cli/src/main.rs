//! The `sable` command-line driver
//!
//! `sable <path>` compiles and executes a script, writing script output to
//! stdout and diagnostics to stderr. Exit code 0 on a clean interpretation,
//! 1 on any diagnostic. With no path it prints the version banner and
//! exits 1.

use clap::Parser;
use sable_runtime::{Diagnostic, Options, Sable, SourceFile};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "sable", version, about = "The Sable interpreter")]
struct Cli {
    /// Script to compile and execute
    path: Option<PathBuf>,

    /// Disable the bytecode optimizer
    #[arg(long)]
    no_optimize: bool,

    /// Compile nested functions on worker threads
    #[arg(long)]
    threads: bool,

    /// Print each compiled function's disassembly to stderr
    #[arg(long)]
    dump_bytecode: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let Some(path) = cli.path else {
        println!("sable {}", sable_runtime::VERSION);
        return ExitCode::FAILURE;
    };

    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("sable: {}: {}", path.display(), err);
            return ExitCode::FAILURE;
        }
    };
    let source = SourceFile::new(path.display().to_string(), text.clone());

    let options = Options {
        optimize: !cli.no_optimize,
        threaded_compile: cli.threads,
        dump_bytecode: cli.dump_bytecode,
    };
    let mut sable = Sable::with_options(options);

    match sable.eval(&source.name, &text) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            Diagnostic::from_error(&err).emit(&source);
            ExitCode::FAILURE
        }
    }
}
