#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
  Continuous,
  Step,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
  pub quiet: bool,
  pub step_mode: StepMode,
  pub trace_file: Option<String>,
  /// Upper bound on simulated datapath cycles for one inference
  pub max_cycles: u64,
  /// Simulation time units per datapath cycle
  pub cycle_time: f64,
}

impl Default for SimConfig {
  fn default() -> Self {
    Self {
      quiet: false,
      step_mode: StepMode::Continuous,
      trace_file: None,
      max_cycles: 10_000_000,
      cycle_time: 1.0,
    }
  }
}
