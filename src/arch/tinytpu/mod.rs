pub mod conv_layer;
pub mod datapath;
pub mod dense;
pub mod maxpool;
pub mod output_buffer;
pub mod patch_buffer;
pub mod requantize;
pub mod softmax;
pub mod systolic_array;
pub mod topology;
pub mod tpu_model;

pub use datapath::{Datapath, DatapathParams, InferenceResult, Stage};
pub use topology::NetworkShape;
pub use tpu_model::{InferRequest, TpuModel};
