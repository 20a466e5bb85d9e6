/// Quill CLI (quill)
/// Runs, disassembles and tokenizes Quill scripts (.ql).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};
use miette::IntoDiagnostic;

use quill::{compile, disassemble_function, GcConfig, Heap, InterpretError, Scanner, TokenKind,
            Vm, VmOptions};

// Exit codes follow the sysexits convention the test harness expects.
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_IO_ERROR: u8 = 74;

#[derive(ClapParser)]
#[command(
    name = "quill",
    version = "0.1.0",
    about = "The Quill Language Toolchain",
    long_about = "quill — run, disassemble, and inspect Quill (.ql) scripts."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a Quill script (.ql)
    Run {
        path: PathBuf,
        /// Disassemble each instruction to stderr as it executes
        #[arg(long)]
        trace: bool,
        /// Log garbage collections to stderr
        #[arg(long)]
        log_gc: bool,
        /// Collect on every allocation (slow; shakes out GC bugs)
        #[arg(long)]
        stress_gc: bool,
    },
    /// Compile a script and print its disassembly (does NOT execute)
    Dis {
        path: PathBuf,
    },
    /// Print the token stream of a script
    Tokens {
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{:?}", report);
            ExitCode::from(EXIT_IO_ERROR)
        }
    }
}

fn run(cli: Cli) -> miette::Result<ExitCode> {
    match cli.command {
        // ----------------------------------------------------------------
        // quill run <file.ql>
        // ----------------------------------------------------------------
        Commands::Run { path, trace, log_gc, stress_gc } => {
            let source = read_source(&path)?;
            let mut vm = Vm::with_options(VmOptions { trace, stress_gc, log_gc });
            match vm.interpret(&source) {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(InterpretError::Compile) => Ok(ExitCode::from(EXIT_COMPILE_ERROR)),
                Err(InterpretError::Runtime(_)) => Ok(ExitCode::from(EXIT_RUNTIME_ERROR)),
            }
        }

        // ----------------------------------------------------------------
        // quill dis <file.ql>
        // ----------------------------------------------------------------
        Commands::Dis { path } => {
            let source = read_source(&path)?;
            let mut heap = Heap::new(GcConfig::default());
            match compile(&source, &mut heap) {
                Some(function) => {
                    print!("{}", disassemble_function(&heap, function));
                    std::io::stdout().flush().into_diagnostic()?;
                    Ok(ExitCode::SUCCESS)
                }
                None => Ok(ExitCode::from(EXIT_COMPILE_ERROR)),
            }
        }

        // ----------------------------------------------------------------
        // quill tokens <file.ql>
        // ----------------------------------------------------------------
        Commands::Tokens { path } => {
            let source = read_source(&path)?;
            let mut scanner = Scanner::new(&source);
            let mut line = 0;
            loop {
                let token = scanner.scan_token();
                if token.line != line {
                    print!("{:4} ", token.line);
                    line = token.line;
                } else {
                    print!("   | ");
                }
                println!("{:?} '{}'", token.kind, token.lexeme);
                if token.kind == TokenKind::Eof {
                    break;
                }
            }
            std::io::stdout().flush().into_diagnostic()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_source(path: &Path) -> miette::Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| miette::miette!("Cannot read '{}': {}", path.display(), e))
}
