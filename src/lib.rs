pub mod arch;
pub mod builtin;
pub mod error;
pub mod memdomain;
pub mod simulator;

pub use arch::tinytpu::{Datapath, DatapathParams, InferenceResult, NetworkShape, Stage};
pub use error::{Result, TpuError};
pub use simulator::sim::mode::{SimConfig, StepMode};
