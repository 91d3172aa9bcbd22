use clap::Parser;
use std::path::PathBuf;
use tinytpu::simulator::config::config::{load_and_merge_configs, CliOverrides};
use tinytpu::simulator::utils::log::init_log;
use tinytpu::simulator::Simulator;

/// tinytpu - fixed-point CNN accelerator datapath simulator
#[derive(Parser, Debug)]
#[command(name = "tinytpu")]
#[command(version = "0.1.0")]
#[command(about = "Cycle-counting model of a small int8 CNN accelerator", long_about = None)]
struct Args {
  /// Configuration file layered over the built-in defaults
  #[arg(short, long, value_name = "FILE")]
  config: Option<String>,

  /// Input image as a hex byte file, channel-last
  #[arg(short, long, value_name = "FILE")]
  image: Option<String>,

  /// Enable step mode (interactive stepping, one pipeline stage at a time)
  #[arg(short, long)]
  step: bool,

  /// Quiet mode (suppress log messages)
  #[arg(short, long)]
  quiet: bool,

  /// Output trace file path
  #[arg(long, value_name = "FILE")]
  trace_file: Option<String>,

  /// Give up after this many simulated cycles
  #[arg(long, value_name = "N")]
  max_cycles: Option<u64>,
}

fn main() -> std::io::Result<()> {
  init_log();

  let args = Args::parse();
  let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

  let cli = CliOverrides {
    quiet: args.quiet,
    step: args.step,
    trace_file: args.trace_file,
    image: args.image,
    max_cycles: args.max_cycles,
  };
  let config = load_and_merge_configs(args.config.as_deref(), &root, &cli)?;

  let mut simulator = Simulator::from_app_config(&config)?;

  simulator.run()
}
