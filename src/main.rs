//! Ember Compiler
//!
//! Reads a parsed compilation unit (JSON), checks it and lowers it to IR.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ember::feedback::CompilationFeedback;
use ember::frontend::syntax::Unit;
use ember::middle::ir_printer::print_program;
use ember::{Options, Session};

/// Ember Compiler
#[derive(Parser, Debug)]
#[command(name = "emberc")]
#[command(version = "0.1.0")]
#[command(about = "Ember compiler - name resolution, type checking and IR lowering")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input unit (parser output, JSON)
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Emit Ember IR
    #[arg(long, global = true)]
    emit_ir: bool,

    /// Report diagnostics as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Optimization level (0 disables the IR optimizer)
    #[arg(short = 'O', default_value = "1", global = true)]
    opt_level: u8,

    /// Name of the entry function
    #[arg(long, default_value = "main", global = true)]
    entry: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check and lower a unit
    Build {
        /// Input unit
        input: PathBuf,
    },
    /// Check a unit for errors
    Check {
        /// Input unit
        input: PathBuf,
    },
    /// Print version information
    Version,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Some(Commands::Build { input }) => compile_file(input, &cli, true),
        Some(Commands::Check { input }) => compile_file(input, &cli, false),
        Some(Commands::Version) => {
            println!("emberc 0.1.0");
            return;
        }
        None => match &cli.input {
            Some(input) => compile_file(input, &cli, true),
            None => {
                eprintln!("Error: No input file specified");
                eprintln!("Usage: emberc <FILE> or emberc build <FILE>");
                process::exit(1);
            }
        },
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn load_unit(input: &Path) -> Result<Unit> {
    let text = fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    serde_json::from_str(&text).with_context(|| format!("decoding {}", input.display()))
}

/// Run the pipeline on one unit; returns whether it compiled cleanly
fn compile_file(input: &Path, cli: &Cli, lower: bool) -> Result<bool> {
    let unit = load_unit(input)?;
    let options = Options {
        entry_point: cli.entry.clone(),
        optimize: cli.opt_level > 0,
        ..Options::default()
    };
    let mut session = Session::from_unit(&unit, options);

    let program = if lower {
        session.lower()
    } else {
        session.analyze();
        None
    };
    let ok = !session.diags.has_errors();

    if cli.json {
        let feedback = CompilationFeedback::collect(
            &input.display().to_string(),
            &session.diags,
            program.as_ref(),
        );
        println!("{}", feedback.to_json());
    } else {
        for d in session.diags.items() {
            eprintln!("{}", d);
        }
        if ok {
            log::info!("{}: no errors", input.display());
        } else {
            eprintln!(
                "{} error(s), {} warning(s)",
                session.diags.error_count(),
                session.diags.warning_count()
            );
        }
    }

    if let (true, Some(p)) = (cli.emit_ir, program.as_ref()) {
        print!("{}", print_program(p, &session.types));
    }
    session.teardown(program);
    Ok(ok)
}
