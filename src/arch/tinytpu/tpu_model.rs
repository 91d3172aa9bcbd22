use serde::{Deserialize, Serialize};
use sim::models::model_trait::{DevsModel, Reportable, ReportableModel, SerializableModel};
use sim::models::{ModelMessage, ModelRecord};
use sim::simulator::Services;
use sim::utils::errors::SimulationError;
use std::f64::INFINITY;
use std::sync::{Arc, Mutex};

use super::datapath::{Datapath, InferenceResult};
use crate::model_record;

pub const INFER_PORT: &str = "infer";
pub const OUTPUT_PORT: &str = "output";

/// Content of a message on the `infer` port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferRequest {
  pub image: Vec<i8>,
}

/// Finished results, shared with whoever drives the simulation.
pub type Outbox = Arc<Mutex<Option<InferenceResult>>>;

/// Event-driven wrapper around the datapath. One inference runs per
/// `infer` message; the result leaves on `output` once the datapath's
/// cycle count has elapsed in simulation time.
#[derive(Clone)]
pub struct TpuModel {
  datapath: Arc<Mutex<Datapath>>,
  outbox: Outbox,
  cycle_time: f64,
  pending: Option<InferenceResult>,
  until_next_event: f64,
  records: Vec<ModelRecord>,
}

impl TpuModel {
  pub fn new(datapath: Arc<Mutex<Datapath>>, outbox: Outbox, cycle_time: f64) -> Self {
    Self {
      datapath,
      outbox,
      cycle_time,
      pending: None,
      until_next_event: INFINITY,
      records: Vec::new(),
    }
  }

  pub fn busy(&self) -> bool {
    self.pending.is_some()
  }
}

impl DevsModel for TpuModel {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    if incoming_message.port_name != INFER_PORT {
      model_record!(self, services, "ignored", format!("port={}", incoming_message.port_name));
      return Ok(());
    }
    if self.pending.is_some() {
      log::error!("tpu: infer request while an inference is in flight");
      return Err(SimulationError::InvalidModelState);
    }

    let request: InferRequest = serde_json::from_str(&incoming_message.content).map_err(|e| {
      log::error!("tpu: bad infer request: {}", e);
      SimulationError::InvalidModelState
    })?;
    let result = {
      let mut datapath = self.datapath.lock().map_err(|_| SimulationError::InvalidModelState)?;
      datapath.infer(&request.image).map_err(|e| {
        log::error!("tpu: inference failed: {}", e);
        SimulationError::InvalidModelState
      })?
    };

    model_record!(self, services, "infer_start", format!("pixels={}, cycles={}", request.image.len(), result.cycles));
    self.until_next_event = (result.cycles.max(1)) as f64 * self.cycle_time;
    self.pending = Some(result);
    Ok(())
  }

  fn events_int(&mut self, services: &mut Services) -> Result<Vec<ModelMessage>, SimulationError> {
    let mut messages = Vec::new();

    if let Some(result) = self.pending.take() {
      messages.push(ModelMessage {
        content: serde_json::to_string(&result).map_err(|_| SimulationError::InvalidModelState)?,
        port_name: OUTPUT_PORT.to_string(),
      });
      model_record!(self, services, "infer_done", format!("predicted={}", result.predicted));
      *self.outbox.lock().map_err(|_| SimulationError::InvalidModelState)? = Some(result);
    }
    self.until_next_event = INFINITY;

    Ok(messages)
  }

  fn time_advance(&mut self, time_delta: f64) {
    self.until_next_event -= time_delta;
  }

  fn until_next_event(&self) -> f64 {
    self.until_next_event
  }
}

impl Reportable for TpuModel {
  fn status(&self) -> String {
    if self.busy() {
      "busy".to_string()
    } else {
      "idle".to_string()
    }
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for TpuModel {}

impl SerializableModel for TpuModel {
  fn get_type(&self) -> &'static str {
    "TpuModel"
  }
}
