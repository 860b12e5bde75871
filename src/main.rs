//! asmlift - x86バイナリの関数をシンボリックIRへリフトする
//!
//! Usage:
//!   asmlift ./a.out symbols
//!   asmlift ./a.out blocks main
//!   asmlift ./a.out lift main --json

use anyhow::{anyhow, Context, Result};
use asmlift::lifter::{CapstoneDecoder, FunctionReport, LiftSession};
use asmlift::{Architecture, LiftConfig, LoadedBinary};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "asmlift")]
#[command(about = "Lift x86 functions from ELF/PE binaries into a symbolic IR", long_about = None)]
struct Cli {
    /// Target binary (ELF or PE)
    binary: PathBuf,

    /// JSON config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override architecture (x86_64 or x86)
    #[arg(short, long)]
    arch: Option<Architecture>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List function symbols
    Symbols,

    /// Print the basic blocks of a function
    Blocks {
        /// Function name
        function: String,
    },

    /// Lift one function, or every function when omitted
    Lift {
        /// Function name
        function: Option<String>,

        /// Emit JSON reports instead of pseudocode
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LiftConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => LiftConfig::default(),
    };
    config.apply_env().context("Invalid environment override")?;
    if let Some(arch) = cli.arch {
        config.arch = Some(arch);
    }
    match cli.verbose {
        0 => {}
        1 => config.log_level = "debug".to_string(),
        _ => config.log_level = "trace".to_string(),
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(config.tracing_level())
        .with_writer(std::io::stderr)
        .init();

    let binary = LoadedBinary::open(&cli.binary)
        .with_context(|| format!("Failed to load {}", cli.binary.display()))?;
    let arch = config
        .arch
        .or(binary.arch)
        .ok_or_else(|| anyhow!("Unknown architecture; pass --arch"))?;
    info!("Architecture: {}", arch);

    match cli.command {
        Commands::Symbols => cmd_symbols(&binary),
        Commands::Blocks { function } => {
            let mut decoder = CapstoneDecoder::new(arch)?;
            let mut session = LiftSession::new(&binary, config);
            let lift = session
                .lift_named(&function, &mut decoder)
                .with_context(|| format!("Failed to segment {}", function))?;
            print!("{}", lift.listing());
            Ok(())
        }
        Commands::Lift { function, json } => {
            let mut decoder = CapstoneDecoder::new(arch)?;
            let mut session = LiftSession::new(&binary, config);
            let lifts = match function {
                Some(name) => vec![session
                    .lift_named(&name, &mut decoder)
                    .with_context(|| format!("Failed to lift {}", name))?],
                None => session.lift_all(&mut decoder)?,
            };

            if json {
                let reports: Vec<FunctionReport> = lifts.iter().map(FunctionReport::from).collect();
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for lift in &lifts {
                    println!("{}", lift.pseudocode());
                }
            }
            info!("Symbol table: {} entries", session.symbols().len());
            Ok(())
        }
    }
}

fn cmd_symbols(binary: &LoadedBinary) -> Result<()> {
    for (_, symbol) in binary.functions() {
        let aliases = if symbol.aliases.is_empty() {
            String::new()
        } else {
            format!("  ({})", symbol.aliases.join(", "))
        };
        println!("0x{:016x}  {:>8}  {}{}", symbol.address, symbol.size, symbol.name, aliases);
    }
    Ok(())
}
