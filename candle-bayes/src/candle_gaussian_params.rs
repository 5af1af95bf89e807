use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::error::{BayesError, Result};

/// Bounds for the log variance ln(σ²) applied before every
/// exponentiation, keeping σ² within [e⁻⁸, e⁸] ≈ [3.4e-4, 3e3].
pub const LOG_VAR_MIN: f64 = -8.0;
pub const LOG_VAR_MAX: f64 = 8.0;

/// Diagonal Gaussian N(μ, σ²I) over one layer's weight matrix
///
/// Parameters are stored as mean μ and log variance ln(σ²), both of
/// shape `(d_in, d_out)` where row 0 of μ and ln(σ²) describes the
/// bias term. A trainable pair registers both tensors with the
/// `VarBuilder`; a constant pair holds plain zero tensors that no
/// optimizer will ever touch.
pub struct GaussianParams {
    /// Mean μ: shape (d_in, d_out)
    mean: Tensor,
    /// Log variance ln(σ²): shape (d_in, d_out)
    log_var: Tensor,
}

impl GaussianParams {
    /// Create a trainable pair, zero-initialized so that the initial
    /// distribution is N(0, I).
    pub fn trainable(vb: VarBuilder, d_in: usize, d_out: usize) -> Result<Self> {
        let mean = vb.get_with_hints((d_in, d_out), "mean", candle_nn::Init::Const(0.0))?;
        let log_var = vb.get_with_hints((d_in, d_out), "log_var", candle_nn::Init::Const(0.0))?;
        Ok(Self { mean, log_var })
    }

    /// Create a fixed N(0, I) pair outside of any variable map.
    pub fn constant(d_in: usize, d_out: usize, dtype: DType, device: &Device) -> Result<Self> {
        let mean = Tensor::zeros((d_in, d_out), dtype, device)?;
        let log_var = Tensor::zeros((d_in, d_out), dtype, device)?;
        Ok(Self { mean, log_var })
    }

    /// Get the mean μ.
    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Get the log variance ln(σ²), clamped to
    /// [`LOG_VAR_MIN`, `LOG_VAR_MAX`]. All consumers read the log
    /// variance through this accessor, so the raw parameter may drift
    /// outside the bounds without ever reaching an `exp`.
    pub fn log_var(&self) -> candle_core::Result<Tensor> {
        self.log_var.clamp(LOG_VAR_MIN, LOG_VAR_MAX)
    }

    /// Reparameterized draw: z = μ + exp(ln(σ²)/2) ⊙ ε with ε ~ N(0, I).
    /// Gradients flow into μ and ln(σ²) but not into ε.
    pub fn reparameterized_sample(&self) -> candle_core::Result<Tensor> {
        let eps = Tensor::randn_like(&self.mean, 0., 1.)?;
        self.mean() + (self.log_var()? * 0.5)?.exp()? * eps
    }

    /// Shape (d_in, d_out) of the underlying weight matrix.
    pub fn dims(&self) -> (usize, usize) {
        let dims = self.mean.dims();
        (dims[0], dims[1])
    }

    /// Get the device of the parameters.
    pub fn device(&self) -> &Device {
        self.mean.device()
    }

    /// Get the dtype of the parameters.
    pub fn dtype(&self) -> DType {
        self.mean.dtype()
    }
}

/// Per-transition weight shapes for a stack of fully-connected layers.
///
/// Each transition i maps `neurons[i] + 1` inputs (one extra row for
/// the bias) onto `neurons[i+1]` outputs.
pub fn layer_dims(neurons_per_layer: &[usize]) -> Result<Vec<(usize, usize)>> {
    if neurons_per_layer.len() < 2 {
        return Err(BayesError::Config(format!(
            "need at least two layer widths, found {}",
            neurons_per_layer.len()
        )));
    }
    if let Some(zero) = neurons_per_layer.iter().position(|&d| d == 0) {
        return Err(BayesError::Config(format!(
            "layer {} has zero width",
            zero
        )));
    }
    Ok(neurons_per_layer
        .windows(2)
        .map(|w| (w[0] + 1, w[1]))
        .collect())
}

/// One `GaussianParams` per layer transition of a feedforward network
pub struct WeightStore {
    layers: Vec<GaussianParams>,
}

impl WeightStore {
    /// Trainable store; parameters are registered under
    /// `layer{i}.mean` and `layer{i}.log_var` below the builder prefix.
    pub fn trainable(vb: VarBuilder, neurons_per_layer: &[usize]) -> Result<Self> {
        let mut layers = vec![];
        for (i, (d_in, d_out)) in layer_dims(neurons_per_layer)?.into_iter().enumerate() {
            layers.push(GaussianParams::trainable(
                vb.pp(format!("layer{}", i)),
                d_in,
                d_out,
            )?);
        }
        Ok(Self { layers })
    }

    /// Fixed N(0, I) store with no registered variables.
    pub fn constant(neurons_per_layer: &[usize], dtype: DType, device: &Device) -> Result<Self> {
        let mut layers = vec![];
        for (d_in, d_out) in layer_dims(neurons_per_layer)? {
            layers.push(GaussianParams::constant(d_in, d_out, dtype, device)?);
        }
        Ok(Self { layers })
    }

    pub fn num_transitions(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[GaussianParams] {
        &self.layers
    }

    /// One independent reparameterized draw for every layer transition.
    pub fn sample_weights(&self) -> candle_core::Result<Vec<Tensor>> {
        self.layers
            .iter()
            .map(|layer| layer.reparameterized_sample())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn layer_dims_add_bias_row() -> Result<()> {
        let dims = layer_dims(&[784, 128, 64, 128, 784])?;
        assert_eq!(dims, vec![(785, 128), (129, 64), (65, 128), (129, 784)]);
        Ok(())
    }

    #[test]
    fn layer_dims_reject_degenerate_stacks() {
        assert!(layer_dims(&[5]).is_err());
        assert!(layer_dims(&[]).is_err());
        assert!(layer_dims(&[5, 0, 5]).is_err());
    }

    #[test]
    fn trainable_store_registers_all_variables() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let store = WeightStore::trainable(vb.pp("posterior"), &[4, 3, 4])?;
        assert_eq!(store.num_transitions(), 2);
        assert_eq!(store.layers()[0].dims(), (5, 3));
        assert_eq!(store.layers()[1].dims(), (4, 4));

        let samples = store.sample_weights()?;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].dims(), &[5, 3]);
        assert_eq!(samples[1].dims(), &[4, 4]);

        // mean and log_var per transition
        assert_eq!(varmap.all_vars().len(), 4);

        let names = {
            let data = varmap.data().lock().unwrap();
            let mut names: Vec<String> = data.keys().cloned().collect();
            names.sort();
            names
        };
        assert_eq!(
            names,
            vec![
                "posterior.layer0.log_var",
                "posterior.layer0.mean",
                "posterior.layer1.log_var",
                "posterior.layer1.mean"
            ]
        );
        Ok(())
    }

    #[test]
    fn constant_store_registers_nothing() -> Result<()> {
        let store = WeightStore::constant(&[4, 3, 4], DType::F32, &Device::Cpu)?;
        assert_eq!(store.num_transitions(), 2);

        let zeros = store.layers()[0].mean().abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(zeros, 0.0);
        Ok(())
    }

    #[test]
    fn log_var_is_clamped_before_use() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let params = GaussianParams::trainable(vb, 3, 2)?;

        let huge = Tensor::full(30f32, (3, 2), &Device::Cpu)?;
        varmap
            .data()
            .lock()
            .unwrap()
            .get("log_var")
            .unwrap()
            .set(&huge)?;

        let max = params.log_var()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(max, LOG_VAR_MAX as f32);
        Ok(())
    }

    #[test]
    fn samples_are_stochastic_and_centred() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let params = GaussianParams::trainable(vb, 50, 40)?;

        let a = params.reparameterized_sample()?;
        let b = params.reparameterized_sample()?;
        assert_eq!(a.dims(), &[50, 40]);

        let diff = (&a - &b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 0.0);

        // zero mean, unit variance at initialization
        let sample_mean = a.mean_all()?.to_scalar::<f32>()?;
        assert!(sample_mean.abs() < 0.2);
        Ok(())
    }
}
