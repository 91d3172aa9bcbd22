use crate::arch::tinytpu::softmax::q31_to_f64;
use crate::arch::tinytpu::InferenceResult;
use sim::models::{Model, Reportable};
use sim::simulator::Simulation;

pub fn print_simulation_records(simulation: &mut Simulation) {
  println!("\n--- Simulation Records ---");

  for model in simulation.models().iter() {
    print_model_records(model);
  }

  println!("--- End Records ---\n");
}

fn print_model_records(model: &Model) {
  let records = model.records();
  if !records.is_empty() {
    println!("\n[{}] {}", model.id(), model.status());
    for record in records {
      println!("  Time {:.1}: {} ({})", record.time, record.action, record.subject);
    }
  }
}

pub fn print_inference_result(result: &InferenceResult) {
  println!("\n--- Inference Result ---");
  for (class, (&p, &logit)) in result.probabilities.iter().zip(result.logits.iter()).enumerate() {
    let marker = if class == result.predicted { " <" } else { "" };
    println!("  class {}: p={:.6} logit={:4}{}", class, q31_to_f64(p), logit, marker);
  }
  println!("  predicted: {}", result.predicted);
  println!("  cycles:    {}", result.cycles);
  println!("--- End Result ---\n");
}
