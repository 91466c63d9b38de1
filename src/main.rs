use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bci::asm::{assemble, disassemble};
use bci::vm::{Module, VM};

#[derive(Parser)]
#[command(name = "bci", version, about = "Bytecode assembler, disassembler and virtual machine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a .bci source file into a binary module
    Asm {
        /// Path to .bci file
        file: PathBuf,
        /// Output path (defaults to the input with a .bin extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the instructions and data of a binary module
    Dis {
        /// Path to .bin file
        file: PathBuf,
        /// Emit the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a binary module
    Run {
        /// Path to .bin file
        file: PathBuf,
        /// Trace every instruction to stderr
        #[arg(short, long)]
        debug: bool,
    },
    /// Assemble a .bci source file in memory and run it
    Exec {
        /// Path to .bci file
        file: PathBuf,
        /// Trace every instruction to stderr
        #[arg(short, long)]
        debug: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let debug = matches!(
        cli.command,
        Commands::Run { debug: true, .. } | Commands::Exec { debug: true, .. }
    );
    init_logging(debug);

    let exit_code = match cli.command {
        Commands::Asm { file, output } => cmd_asm(&file, output),
        Commands::Dis { file, json } => cmd_dis(&file, json),
        Commands::Run { file, .. } => cmd_run(&file),
        Commands::Exec { file, .. } => cmd_exec(&file),
    };
    process::exit(exit_code);
}

/// `RUST_LOG` wins; otherwise warnings only, or the per-instruction trace with `-d`.
fn init_logging(debug: bool) {
    let default = if debug { "bci=trace" } else { "bci=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();
}

const MAX_SOURCE_SIZE: u64 = 10 * 1024 * 1024; // 10 MB

fn read_source(path: &Path) -> Result<String, i32> {
    let filename = path.to_string_lossy();

    // Check file size before reading
    match std::fs::metadata(path) {
        Ok(meta) => {
            if meta.len() > MAX_SOURCE_SIZE {
                eprintln!(
                    "Error: file {} is too large ({} bytes, max {} bytes)",
                    filename,
                    meta.len(),
                    MAX_SOURCE_SIZE
                );
                return Err(1);
            }
        }
        Err(e) => {
            eprintln!("Error: cannot read file {}: {}", filename, e);
            return Err(1);
        }
    }

    std::fs::read_to_string(path).map_err(|e| {
        eprintln!("Error: cannot read file {}: {}", filename, e);
        1
    })
}

fn assemble_file(path: &Path) -> Result<Module, i32> {
    let source = read_source(path)?;
    assemble(&source).map_err(|e| {
        eprintln!("Assembly error in {}: {}", path.display(), e);
        1
    })
}

fn load_module(path: &Path) -> Result<Module, i32> {
    Module::load(path).map_err(|e| {
        eprintln!("Error: {}", e);
        1
    })
}

/// `prog.bci` becomes `prog.bin`; any other name gets `.bin` appended.
fn default_output(input: &Path) -> PathBuf {
    match input.extension() {
        Some(ext) if ext == "bci" => input.with_extension("bin"),
        _ => {
            let mut name = input.as_os_str().to_owned();
            name.push(".bin");
            PathBuf::from(name)
        }
    }
}

fn cmd_asm(path: &Path, output: Option<PathBuf>) -> i32 {
    let module = match assemble_file(path) {
        Ok(m) => m,
        Err(code) => return code,
    };

    let output = output.unwrap_or_else(|| default_output(path));
    if let Err(e) = module.save(&output) {
        eprintln!("Error: cannot write {}: {}", output.display(), e);
        return 1;
    }
    0
}

fn cmd_dis(path: &Path, json: bool) -> i32 {
    let module = match load_module(path) {
        Ok(m) => m,
        Err(code) => return code,
    };

    let listing = match disassemble(&module) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Disassembly error: {}", e);
            return 1;
        }
    };

    if json {
        match listing.to_json() {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    } else {
        print!("{}", listing);
    }
    0
}

fn cmd_run(path: &Path) -> i32 {
    match load_module(path) {
        Ok(module) => execute(module),
        Err(code) => code,
    }
}

fn cmd_exec(path: &Path) -> i32 {
    match assemble_file(path) {
        Ok(module) => execute(module),
        Err(code) => code,
    }
}

fn execute(module: Module) -> i32 {
    let mut vm = VM::new(module);
    match vm.run() {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}
