use log::LevelFilter;
use sim::models::model_trait::DevsModel;
use sim::simulator::Simulation;
use crate::simulator::utils::log::is_log_enabled;
use std::fs::File;
use std::io::{self, BufWriter, Result, Write};

fn step_error(e: impl std::fmt::Debug) -> io::Error {
  io::Error::new(io::ErrorKind::Other, format!("Simulation error: {:?}", e))
}

/// Deliver pending messages, then run internal events until simulation
/// time advances or every model is passive.
pub fn model_step(simulation: &mut Simulation, trace_writer: &mut Option<BufWriter<File>>) -> Result<()> {
  let mut messages_to_process = simulation.get_messages();

  while !messages_to_process.is_empty() {
    if is_log_enabled() && log::max_level() >= LevelFilter::Info {
      for msg in messages_to_process.iter() {
        println!(
          "[MSG] t={:.1} {}:{} -> {}:{} | {} bytes",
          msg.time(),
          msg.source_id(),
          msg.source_port(),
          msg.target_id(),
          msg.target_port(),
          msg.content().len()
        );
      }
    }

    if let Some(writer) = trace_writer {
      for msg in messages_to_process.iter() {
        let trace_entry = serde_json::json!({
          "time": msg.time(),
          "source": msg.source_id(),
          "source_port": msg.source_port(),
          "target": msg.target_id(),
          "target_port": msg.target_port(),
          "content": msg.content()
        });
        writeln!(writer, "{}", trace_entry)?;
      }
      writer.flush()?;
    }

    let time0 = simulation.get_global_time();
    simulation.step().map_err(step_error)?;
    if simulation.get_global_time() > time0 {
      break;
    }

    messages_to_process = simulation.get_messages();
  }

  loop {
    let until_next_event = simulation
      .models()
      .iter()
      .fold(f64::INFINITY, |min, model| f64::min(min, model.until_next_event()));

    if until_next_event == f64::INFINITY {
      break;
    }

    let time0 = simulation.get_global_time();
    simulation.step().map_err(step_error)?;
    if simulation.get_global_time() > time0 {
      break;
    }
  }

  Ok(())
}
