mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use imgforge_lib::consts::DEFAULT_BUILD_FILE;

use crate::cmd::BuildOptions;
use crate::output::{OutputFormat, print_error};

/// imgforge - Declarative disk image builder
#[derive(Parser)]
#[command(name = "imgforge")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Path to the root build script
  #[arg(short, long, global = true, default_value = DEFAULT_BUILD_FILE)]
  file: PathBuf,

  /// Output format
  #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build targets and write their artifacts
  Build {
    /// Targets to build (default: every target nothing depends on)
    targets: Vec<String>,

    /// Directory artifacts are written to (default: `out` next to the build script)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Maximum number of targets evaluated in parallel
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Compiler driver; selects the command toolchain
    #[arg(long)]
    cc: Option<String>,
  },

  /// List declared targets
  List,

  /// Print the evaluation order of a target
  Order {
    /// Target to order, e.g. `src/arch/kim-1+diskimage`
    target: String,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  // RUST_LOG wins over -v
  let default_level = if cli.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Build {
      targets,
      out_dir,
      jobs,
      cc,
    } => {
      let options = BuildOptions { out_dir, jobs, cc };
      cmd::cmd_build(&cli.file, &targets, &options, cli.output)
    }
    Commands::List => cmd::cmd_list(&cli.file, cli.output).map(|()| true),
    Commands::Order { target } => cmd::cmd_order(&cli.file, &target, cli.output).map(|()| true),
  };

  match result {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(err) => {
      print_error(&format!("{:#}", err));
      ExitCode::FAILURE
    }
  }
}
