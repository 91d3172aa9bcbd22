use super::config::AppConfig;
use super::sim::inject::inject_message;
use super::sim::mode::{SimConfig, StepMode};
use super::sim::model::model_step;
use super::sim::shell::{Command, Shell};
use super::utils::log::set_log;
use super::utils::report::{print_inference_result, print_simulation_records};
use crate::arch::tinytpu::tpu_model::{InferRequest, Outbox, TpuModel, INFER_PORT};
use crate::arch::tinytpu::{Datapath, InferenceResult, Stage};
use crate::memdomain::{load_image, synthetic_image, ModelTables};
use sim::models::model_trait::DevsModel;
use sim::models::Model;
use sim::simulator::Simulation;
use std::fs::File;
use std::io::{self, BufWriter, Result};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub const TPU_MODEL_ID: &str = "tpu";

pub struct Simulator {
  config: SimConfig,
  datapath: Arc<Mutex<Datapath>>,
  outbox: Outbox,
  simulation: Simulation,
  image: Vec<i8>,
  trace_writer: Option<BufWriter<File>>,
  last_result: Option<InferenceResult>,
}

fn poisoned<T>(_: T) -> io::Error {
  io::Error::new(io::ErrorKind::Other, "datapath lock poisoned")
}

impl Simulator {
  pub fn new(config: SimConfig, datapath: Datapath, image: Vec<i8>) -> Result<Self> {
    let datapath = Arc::new(Mutex::new(datapath));
    let outbox: Outbox = Arc::new(Mutex::new(None));
    let model = TpuModel::new(Arc::clone(&datapath), Arc::clone(&outbox), config.cycle_time);
    let models = vec![Model::new(TPU_MODEL_ID.to_string(), Box::new(model))];
    let simulation = Simulation::post(models, vec![]);

    let trace_writer = match &config.trace_file {
      Some(path) => Some(BufWriter::new(File::create(path)?)),
      None => None,
    };

    Ok(Self {
      config,
      datapath,
      outbox,
      simulation,
      image,
      trace_writer,
      last_result: None,
    })
  }

  /// Build tables, image and datapath from a resolved configuration.
  pub fn from_app_config(app: &AppConfig) -> Result<Self> {
    let storage = &app.storage;
    let tables = if storage.has_tables() {
      ModelTables::load(
        Path::new(&storage.weights),
        Path::new(&storage.biases),
        Path::new(&storage.quant),
        storage.bias_format,
      )?
    } else {
      log::info!("no table files configured, using synthetic tables (seed {})", storage.seed);
      ModelTables::synthetic(&app.network, storage.seed)
    };

    let image = if storage.image.is_empty() {
      synthetic_image(&app.network, storage.seed)
    } else {
      load_image(Path::new(&storage.image), &app.network)?
    };

    let datapath = Datapath::new(app.network.clone(), tables, app.datapath)?;
    Self::new(app.sim_config(), datapath, image)
  }

  pub fn last_result(&self) -> Option<&InferenceResult> {
    self.last_result.as_ref()
  }

  pub fn run(&mut self) -> Result<()> {
    if self.config.quiet {
      set_log(false);
    }
    match self.config.step_mode {
      StepMode::Continuous => self.run_continuous(),
      StepMode::Step => self.run_step_mode(),
    }
  }

  fn lock_datapath(&self) -> Result<MutexGuard<'_, Datapath>> {
    self.datapath.lock().map_err(poisoned)
  }

  /// Send the image through the event simulation and wait for the result.
  pub fn infer(&mut self) -> Result<InferenceResult> {
    let request = InferRequest { image: self.image.clone() };
    let content = serde_json::to_string(&request)?;
    inject_message(&mut self.simulation, TPU_MODEL_ID, None, INFER_PORT, &content);

    let deadline = self.config.max_cycles as f64 * self.config.cycle_time;
    loop {
      model_step(&mut self.simulation, &mut self.trace_writer)?;
      if let Some(result) = self.outbox.lock().map_err(poisoned)?.take() {
        if result.cycles > self.config.max_cycles {
          return Err(self.timed_out());
        }
        self.last_result = Some(result.clone());
        return Ok(result);
      }
      if self.simulation.get_global_time() > deadline {
        return Err(self.timed_out());
      }
      let idle = self.simulation.get_messages().is_empty()
        && self.simulation.models().iter().all(|m| m.until_next_event() == f64::INFINITY);
      if idle {
        return Err(io::Error::new(io::ErrorKind::Other, "simulation went idle without a result"));
      }
    }
  }

  fn timed_out(&self) -> io::Error {
    io::Error::new(
      io::ErrorKind::TimedOut,
      format!("no result within {} cycles", self.config.max_cycles),
    )
  }

  fn run_continuous(&mut self) -> Result<()> {
    log::info!("Continuous mode");
    let result = self.infer()?;
    if !self.config.quiet {
      print_simulation_records(&mut self.simulation);
    }
    print_inference_result(&result);
    Ok(())
  }

  fn run_step_mode(&mut self) -> Result<()> {
    println!("Step mode - Enter runs one stage, 'si N' runs N, 'i' shows state, 'c' continues, 'q' quits");
    let image = self.image.clone();
    self.lock_datapath()?.load_image(&image)?;

    let mut shell = Shell::new()?;
    loop {
      match shell.read_command()? {
        Command::Quit => return Ok(()),
        Command::Info => {
          let dp = self.lock_datapath()?;
          println!("next stage: {}, cycles: {}", dp.stage(), dp.cycles());
        },
        Command::Step(n) => {
          for _ in 0..n {
            if self.step_stage()? == Stage::Done {
              break;
            }
          }
        },
        Command::Continue => while self.step_stage()? != Stage::Done {},
      }
      if self.lock_datapath()?.stage() == Stage::Done {
        let result = self.lock_datapath()?.result()?;
        print_inference_result(&result);
        self.last_result = Some(result);
        return Ok(());
      }
    }
  }

  /// Run one pipeline stage directly on the datapath, bypassing the event
  /// queue. Returns the stage that is now next.
  fn step_stage(&mut self) -> Result<Stage> {
    let mut dp = self.lock_datapath()?;
    let ran = dp.step_stage()?;
    if ran != Stage::Done {
      println!("ran {}, cycles so far {}", ran, dp.cycles());
    }
    Ok(dp.stage())
  }
}
