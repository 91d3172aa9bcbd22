use crate::arch::tinytpu::{DatapathParams, NetworkShape};
use crate::memdomain::BiasFormat;
use crate::simulator::sim::mode::{SimConfig, StepMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const DEFAULT_TOML: &str = include_str!("default.toml");

/// Prefix of environment overrides, e.g. `TINYTPU_SIMULATION__MAX_CYCLES=500`.
pub const ENV_PREFIX: &str = "TINYTPU";

/// Table and image locations
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSection {
  pub weights: String,
  pub biases: String,
  pub quant: String,
  pub bias_format: BiasFormat,
  /// Hex byte file, channel-last. Empty selects a synthetic image.
  pub image: String,
  /// Seed for synthetic tables and images
  pub seed: u64,
}

impl Default for StorageSection {
  fn default() -> Self {
    Self {
      weights: String::new(),
      biases: String::new(),
      quant: String::new(),
      bias_format: BiasFormat::default(),
      image: String::new(),
      seed: 1,
    }
  }
}

impl StorageSection {
  /// True when all three table paths are set.
  pub fn has_tables(&self) -> bool {
    !self.weights.is_empty() && !self.biases.is_empty() && !self.quant.is_empty()
  }

  fn table_paths_set(&self) -> usize {
    [&self.weights, &self.biases, &self.quant].iter().filter(|p| !p.is_empty()).count()
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationSection {
  pub quiet: bool,
  pub step_mode: bool,
  pub trace_file: String,
  pub max_cycles: u64,
  pub cycle_time: f64,
}

impl Default for SimulationSection {
  fn default() -> Self {
    let sim = SimConfig::default();
    Self {
      quiet: sim.quiet,
      step_mode: false,
      trace_file: String::new(),
      max_cycles: sim.max_cycles,
      cycle_time: sim.cycle_time,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
  #[serde(default)]
  pub network: NetworkShape,
  #[serde(default)]
  pub datapath: DatapathParams,
  #[serde(default)]
  pub storage: StorageSection,
  #[serde(default)]
  pub simulation: SimulationSection,
}

impl AppConfig {
  pub fn sim_config(&self) -> SimConfig {
    SimConfig {
      quiet: self.simulation.quiet,
      step_mode: if self.simulation.step_mode {
        StepMode::Step
      } else {
        StepMode::Continuous
      },
      trace_file: if self.simulation.trace_file.is_empty() {
        None
      } else {
        Some(self.simulation.trace_file.clone())
      },
      max_cycles: self.simulation.max_cycles,
      cycle_time: self.simulation.cycle_time,
    }
  }
}

/// Command-line values that take precedence over every config layer
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
  pub quiet: bool,
  pub step: bool,
  pub trace_file: Option<String>,
  pub image: Option<String>,
  pub max_cycles: Option<u64>,
}

/// Built-in defaults shipped with the crate
pub fn load_default_config() -> io::Result<AppConfig> {
  toml::from_str::<AppConfig>(DEFAULT_TOML)
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad built-in config: {}", e)))
}

/// Load a single TOML file, no layering
pub fn load_config_file(path: &Path) -> io::Result<AppConfig> {
  let content = fs::read_to_string(path)
    .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("cannot read config file {:?}: {}", path, e)))?;

  toml::from_str::<AppConfig>(&content)
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("failed to parse TOML config {:?}: {}", path, e)))
}

/// Defaults, then each file in order, then `TINYTPU_*` environment
/// variables. Later layers win key by key.
pub fn load_layered_config(files: &[PathBuf]) -> io::Result<AppConfig> {
  let mut builder =
    ::config::Config::builder().add_source(::config::File::from_str(DEFAULT_TOML, ::config::FileFormat::Toml));
  for file in files {
    builder = builder.add_source(::config::File::from(file.as_path()).required(true));
  }
  builder = builder.add_source(
    ::config::Environment::with_prefix(ENV_PREFIX)
      .prefix_separator("_")
      .separator("__")
      .try_parsing(true),
  );

  builder
    .build()
    .and_then(|c| c.try_deserialize::<AppConfig>())
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("config error: {}", e)))
}

pub fn apply_cli_overrides(config: &mut AppConfig, cli: &CliOverrides) {
  if cli.quiet {
    config.simulation.quiet = true;
  }
  if cli.step {
    config.simulation.step_mode = true;
  }
  if let Some(file) = &cli.trace_file {
    config.simulation.trace_file = file.clone();
  }
  if let Some(image) = &cli.image {
    config.storage.image = image.clone();
  }
  if let Some(max_cycles) = cli.max_cycles {
    config.simulation.max_cycles = max_cycles;
  }
}

fn invalid(msg: impl Into<String>) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

pub fn validate_config(config: &AppConfig) -> io::Result<()> {
  config.network.validate()?;

  let dp = &config.datapath;
  if dp.qmin < i8::MIN as i32 || dp.qmax > i8::MAX as i32 || dp.qmin >= dp.qmax {
    return Err(invalid(format!("clamp range [{}, {}] is not a sub-range of int8", dp.qmin, dp.qmax)));
  }
  if dp.softmax_beta <= 0 {
    return Err(invalid(format!("softmax_beta {} must be positive", dp.softmax_beta)));
  }

  match config.storage.table_paths_set() {
    0 | 3 => {},
    _ => {
      return Err(invalid(
        "weights, biases and quant must be given together, or all left empty for synthetic tables",
      ))
    },
  }

  if config.simulation.max_cycles == 0 {
    return Err(invalid("max_cycles must be greater than 0"));
  }
  if !(config.simulation.cycle_time.is_finite() && config.simulation.cycle_time > 0.0) {
    return Err(invalid(format!("cycle_time {} must be positive", config.simulation.cycle_time)));
  }

  Ok(())
}

/// Make relative paths absolute against `root`
pub fn resolve_paths(config: &mut AppConfig, root: &Path) -> io::Result<()> {
  let storage = &mut config.storage;
  for path in [&mut storage.weights, &mut storage.biases, &mut storage.quant, &mut storage.image] {
    *path = resolve_single_path(path, root);
  }
  config.simulation.trace_file = resolve_single_path(&config.simulation.trace_file, root);
  Ok(())
}

fn resolve_single_path(path_str: &str, root: &Path) -> String {
  if path_str.is_empty() {
    return String::new();
  }
  let path = Path::new(path_str);
  if path.is_absolute() {
    return path_str.to_string();
  }
  root.join(path).to_string_lossy().to_string()
}

/// Load and merge configuration
///
/// 1. built-in defaults
/// 2. the custom file, if any (relative to `root`)
/// 3. `TINYTPU_*` environment variables
/// 4. CLI overrides
/// 5. path resolution and validation
pub fn load_and_merge_configs(custom_config_path: Option<&str>, root: &Path, cli: &CliOverrides) -> io::Result<AppConfig> {
  let mut files = Vec::new();
  if let Some(custom_path) = custom_config_path {
    let custom = PathBuf::from(custom_path);
    files.push(if custom.is_absolute() { custom } else { root.join(custom) });
  }

  let mut config = load_layered_config(&files)?;
  apply_cli_overrides(&mut config, cli);
  resolve_paths(&mut config, root)?;
  validate_config(&config)?;

  log::debug!("effective config: {:?}", config);
  Ok(config)
}
