pub use clap::{Args, Parser, Subcommand, ValueEnum};
pub use log::info;

pub type Mat = nalgebra::DMatrix<f32>;

pub use candle_bayes::{candle_core, candle_nn};

use candle_core::Device;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

pub fn select_device(device: &ComputeDevice, device_no: usize) -> anyhow::Result<Device> {
    Ok(match device {
        ComputeDevice::Metal => Device::new_metal(device_no)?,
        ComputeDevice::Cuda => Device::new_cuda(device_no)?,
        ComputeDevice::Cpu => Device::Cpu,
    })
}

/// Architecture sidecar stored next to the weights so that a model
/// can be rebuilt before loading its parameters.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct ModelConfig {
    pub neurons_per_layer: Vec<usize>,
    pub constant_prior: bool,
}

impl ModelConfig {
    pub fn write_json(&self, file_path: &str) -> anyhow::Result<()> {
        std::fs::write(file_path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn read_json(file_path: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(file_path)?)?)
    }
}
