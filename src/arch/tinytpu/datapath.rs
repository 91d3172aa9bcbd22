/// Datapath - top of the accelerator model
///
/// Owns every unit and the parameter tables and sequences one inference
/// stage at a time: conv1..conv4, flatten, dense1, dense2, softmax.
use super::conv_layer::ConvEngine;
use super::dense::{DenseEngine, DenseSlices};
use super::requantize::{Requantizer, RequantIn, ZeroPoint, QMAX_DEFAULT, QMIN_DEFAULT};
use super::softmax::{argmax, SoftmaxUnit, BETA_ONE, PHASE_CYCLES};
use super::topology::{DenseLayerShape, NetworkShape, CONV_LAYERS, NUM_CLASSES};
use crate::builtin::Module;
use crate::error::{Result, TpuError};
use crate::memdomain::{ModelTables, TensorRam};
use serde::{Deserialize, Serialize};

/// Knobs of the datapath that are not part of the network shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapathParams {
  pub qmin: i32,
  pub qmax: i32,
  /// Softmax inverse temperature, Q8.8
  pub softmax_beta: i32,
}

impl Default for DatapathParams {
  fn default() -> Self {
    Self {
      qmin: QMIN_DEFAULT,
      qmax: QMAX_DEFAULT,
      softmax_beta: BETA_ONE,
    }
  }
}

/// Pipeline position: the stage the next `step_stage` call will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
  Idle,
  Conv(usize),
  Flatten,
  Dense(usize),
  Softmax,
  Done,
}

impl std::fmt::Display for Stage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Stage::Idle => write!(f, "idle"),
      Stage::Conv(i) => write!(f, "conv{}", i + 1),
      Stage::Flatten => write!(f, "flatten"),
      Stage::Dense(i) => write!(f, "dense{}", i + 1),
      Stage::Softmax => write!(f, "softmax"),
      Stage::Done => write!(f, "done"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResult {
  /// Q1.31 class probabilities
  pub probabilities: [i32; NUM_CLASSES],
  pub predicted: usize,
  pub logits: [i8; NUM_CLASSES],
  pub cycles: u64,
}

pub struct Datapath {
  name: String,
  shape: NetworkShape,
  tables: ModelTables,
  params: DatapathParams,

  conv: ConvEngine,
  dense: DenseEngine,
  dense_requant: Requantizer,
  softmax: SoftmaxUnit,

  stage: Stage,
  activation: Option<TensorRam>,
  vector: Vec<i8>,
  logits: [i8; NUM_CLASSES],
  cycles: u64,
}

impl Datapath {
  pub fn new(shape: NetworkShape, tables: ModelTables, params: DatapathParams) -> Result<Self> {
    shape.validate()?;
    tables.validate(&shape)?;
    let mut softmax = SoftmaxUnit::new("softmax");
    softmax.set_beta(params.softmax_beta)?;
    Ok(Self {
      name: "tinytpu".to_string(),
      shape,
      tables,
      params,
      conv: ConvEngine::new(params.qmin, params.qmax)?,
      dense: DenseEngine::new("dense"),
      dense_requant: Requantizer::new("dense_requant").with_clamp(params.qmin, params.qmax)?,
      softmax,
      stage: Stage::Idle,
      activation: None,
      vector: Vec::new(),
      logits: [0; NUM_CLASSES],
      cycles: 0,
    })
  }

  pub fn shape(&self) -> &NetworkShape {
    &self.shape
  }

  pub fn params(&self) -> DatapathParams {
    self.params
  }

  pub fn stage(&self) -> Stage {
    self.stage
  }

  pub fn cycles(&self) -> u64 {
    self.cycles
  }

  /// Current activation map, between conv stages.
  pub fn activation(&self) -> Option<&TensorRam> {
    self.activation.as_ref()
  }

  /// Current int8 vector, between dense stages.
  pub fn vector(&self) -> &[i8] {
    &self.vector
  }

  /// Load a channel-last input image and arm the pipeline.
  pub fn load_image(&mut self, image: &[i8]) -> Result<()> {
    let s = &self.shape;
    let ram = TensorRam::from_hwc("input", s.input_height, s.input_width, s.input_channels, image)?;
    self.reset()?;
    self.activation = Some(ram);
    self.stage = Stage::Conv(0);
    log::info!(
      "image loaded: {}x{}x{}",
      self.shape.input_height,
      self.shape.input_width,
      self.shape.input_channels
    );
    Ok(())
  }

  /// Run the next stage. Returns the stage that ran.
  pub fn step_stage(&mut self) -> Result<Stage> {
    let ran = self.stage;
    match self.stage {
      Stage::Idle => return Err(TpuError::config("no image loaded")),
      Stage::Done => return Ok(Stage::Done),
      Stage::Conv(i) => {
        let layer = self.shape.conv_layers()[i];
        let mut input = self.take_activation()?;
        let output = self.conv.run_layer(&layer, &mut input, &self.tables)?;
        self.cycles += self.conv.stats().cycles;
        log::info!(
          "{}: {}x{}x{} out, {} cycles",
          ran,
          output.height(),
          output.width(),
          output.channels(),
          self.conv.stats().cycles
        );
        self.activation = Some(output);
        self.stage = if i + 1 < CONV_LAYERS { Stage::Conv(i + 1) } else { Stage::Flatten };
      },
      Stage::Flatten => {
        let fmap = self.take_activation()?;
        self.vector = fmap.to_hwc();
        log::info!("{}: {} values", ran, self.vector.len());
        self.stage = Stage::Dense(0);
      },
      Stage::Dense(i) => {
        let layer = self.shape.dense_layers()[i];
        self.vector = self.run_dense(&layer)?;
        self.stage = if i == 0 {
          Stage::Dense(1)
        } else {
          self.logits.copy_from_slice(&self.vector);
          Stage::Softmax
        };
      },
      Stage::Softmax => {
        self.softmax.logits = self.logits;
        let probs = self.softmax.run_to_completion()?;
        self.cycles += 1 + 3 * PHASE_CYCLES as u64;
        log::info!("{}: predicted class {}", ran, argmax(&probs));
        self.stage = Stage::Done;
      },
    }
    Ok(ran)
  }

  fn take_activation(&mut self) -> Result<TensorRam> {
    self
      .activation
      .take()
      .ok_or_else(|| TpuError::config(format!("{}: no activation for {}", self.name, self.stage)))
  }

  fn run_dense(&mut self, layer: &DenseLayerShape) -> Result<Vec<i8>> {
    let tag = format!("dense{}", layer.index + 1);
    if self.vector.len() != layer.input_size {
      return Err(TpuError::config(format!(
        "{}: got {} inputs, layer takes {}",
        tag,
        self.vector.len(),
        layer.input_size
      )));
    }
    self.dense.configure(layer.input_size, layer.output_size)?;
    let mem = DenseSlices {
      input: &self.vector,
      weights: self.tables.weights.region(layer.weight_offset, layer.weight_len(), &tag)?,
      biases: self.tables.biases.region(layer.bias_offset, layer.output_size, &tag)?,
    };
    let outs = self.dense.run_to_completion(&mem)?;
    self.cycles += self.dense.cycles();

    self.dense_requant.configure(self.tables.quant.entry(layer.quant_index)?, layer.zero_point);
    let mut result = vec![0i8; layer.output_size];
    for out in outs {
      self.dense_requant.input.set(RequantIn {
        acc: out.value,
        row: 0,
        col: out.index,
      });
      self.dense_requant.run();
      if let Some(q) = self.dense_requant.output.take() {
        result[q.col] = q.value;
      }
    }
    self.dense_requant.input.clear();
    self.cycles += layer.output_size as u64;
    log::info!(
      "{}: {} -> {} ({:?} zero point), {} cycles",
      tag,
      layer.input_size,
      layer.output_size,
      layer.zero_point,
      self.dense.cycles()
    );
    Ok(result)
  }

  /// Run every remaining stage.
  pub fn run_to_end(&mut self) -> Result<InferenceResult> {
    while self.stage != Stage::Done {
      self.step_stage()?;
    }
    self.result()
  }

  pub fn infer(&mut self, image: &[i8]) -> Result<InferenceResult> {
    self.load_image(image)?;
    self.run_to_end()
  }

  pub fn result(&self) -> Result<InferenceResult> {
    if self.stage != Stage::Done {
      return Err(TpuError::config(format!("inference not finished, at {}", self.stage)));
    }
    let probabilities = self.softmax.probabilities();
    Ok(InferenceResult {
      probabilities,
      predicted: argmax(&probabilities),
      logits: self.logits,
      cycles: self.cycles,
    })
  }

  /// Global reset: abandon in-flight work and return every unit to power-on.
  /// Return every unit to power-on state, then re-apply the configured
  /// softmax temperature.
  pub fn reset(&mut self) -> Result<()> {
    self.conv.reset();
    self.dense.reset();
    self.dense_requant.reset();
    self.softmax.reset();
    self.softmax.set_beta(self.params.softmax_beta)?;
    self.stage = Stage::Idle;
    self.activation = None;
    self.vector.clear();
    self.logits = [0; NUM_CLASSES];
    self.cycles = 0;
    Ok(())
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn datapath() -> Datapath {
    let shape = NetworkShape::default();
    let tables = ModelTables::synthetic(&shape, 3);
    Datapath::new(shape, tables, DatapathParams::default()).unwrap()
  }

  fn image() -> Vec<i8> {
    (0..32 * 32).map(|i| ((i * 13) % 97) as i8 - 48).collect()
  }

  #[test]
  fn test_stage_order() {
    let mut dp = datapath();
    assert!(dp.step_stage().is_err(), "no image");
    dp.load_image(&image()).unwrap();
    let mut ran = Vec::new();
    while dp.stage() != Stage::Done {
      ran.push(dp.step_stage().unwrap().to_string());
    }
    assert_eq!(
      ran,
      vec!["conv1", "conv2", "conv3", "conv4", "flatten", "dense1", "dense2", "softmax"]
    );
    let result = dp.result().unwrap();
    assert!(result.cycles > 0);
    assert_eq!(result.predicted, argmax(&result.probabilities));
  }

  #[test]
  fn test_repeatable_and_reset() {
    let mut dp = datapath();
    let first = dp.infer(&image()).unwrap();
    let second = dp.infer(&image()).unwrap();
    assert_eq!(first, second);

    dp.reset().unwrap();
    assert_eq!(dp.stage(), Stage::Idle);
    assert!(dp.result().is_err());
    dp.reset().unwrap();
    assert_eq!(dp.cycles(), 0);
  }

  #[test]
  fn test_configured_beta_survives_reset() {
    let shape = NetworkShape::default();
    let params = DatapathParams {
      softmax_beta: 3 * BETA_ONE,
      ..DatapathParams::default()
    };
    let mut dp = Datapath::new(shape.clone(), ModelTables::synthetic(&shape, 3), params).unwrap();
    let before = dp.infer(&image()).unwrap();
    dp.reset().unwrap();
    let after = dp.infer(&image()).unwrap();
    assert_eq!(before, after);
    assert_eq!(after.probabilities, crate::arch::tinytpu::softmax::softmax_q31(&after.logits, 3 * BETA_ONE));
  }

  #[test]
  fn test_bad_image_size() {
    let mut dp = datapath();
    assert!(dp.load_image(&[0; 10]).is_err());
  }
}
