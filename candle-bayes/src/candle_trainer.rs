use candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

use crate::candle_bayes_autoencoder::BayesianAutoencoder;
use crate::candle_data_loader::DataLoader;
use crate::candle_matrix_io::write_lines;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub mc_samples: usize,
    pub device: candle_core::Device,
    pub show_progress: bool,
    pub verbose: bool,
}

/// Per-epoch averages of the training objective and its two pieces
pub struct TrainTrace {
    pub nelbo: Vec<f32>,
    pub kl: Vec<f32>,
    pub ell: Vec<f32>,
}

impl TrainTrace {
    fn push(&mut self, nelbo: f32, kl: f32, ell: f32) {
        self.nelbo.push(nelbo);
        self.kl.push(kl);
        self.ell.push(ell);
    }

    /// Tab-separated epoch trace, one line per epoch.
    pub fn write_tsv(&self, output_file: &str) -> anyhow::Result<()> {
        let mut lines: Vec<Box<str>> = Vec::with_capacity(self.nelbo.len() + 1);
        lines.push("epoch\tnelbo\tkl\tell".into());
        for (epoch, ((nelbo, kl), ell)) in self
            .nelbo
            .iter()
            .zip(self.kl.iter())
            .zip(self.ell.iter())
            .enumerate()
        {
            lines.push(format!("{}\t{}\t{}\t{}", epoch + 1, nelbo, kl, ell).into_boxed_str());
        }
        write_lines(&lines, output_file)
    }
}

/// Fit the model by stochastic gradient descent on the negative ELBO.
///
/// Minibatches are redrawn every epoch; every gradient step samples
/// fresh weights, so `mc_samples = 1` already gives an unbiased
/// gradient estimate and larger values only reduce its variance.
///
/// * `model` - Bayesian autoencoder under training
/// * `data` - data loader; rows are reconstructed onto themselves
///   unless the loader carries an output channel
/// * `parameters` - variable map holding the trainable parameters
/// * `train_config` - training configuration
pub fn train_autoencoder<DataL>(
    model: &BayesianAutoencoder,
    data: &mut DataL,
    parameters: &VarMap,
    train_config: &TrainConfig,
) -> anyhow::Result<TrainTrace>
where
    DataL: DataLoader,
{
    let device = &train_config.device;
    let mut adam = AdamW::new_lr(
        parameters.all_vars(),
        train_config.learning_rate.into(),
    )?;

    let pb = ProgressBar::new(train_config.num_epochs as u64);

    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut trace = TrainTrace {
        nelbo: vec![],
        kl: vec![],
        ell: vec![],
    };

    for epoch in 0..train_config.num_epochs {
        data.shuffle_minibatch(train_config.batch_size)?;

        let mut nelbo_tot = 0f32;
        let mut kl_tot = 0f32;
        let mut ell_tot = 0f32;

        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_data(b, device)?;
            let x_nd = &mb.input;
            let y_nd = mb.output.as_ref().unwrap_or(x_nd);

            let nelbo = model.negative_elbo(x_nd, y_nd, train_config.mc_samples)?;
            adam.backward_step(&nelbo.loss)?;

            nelbo_tot += nelbo.loss_scalar()?;
            kl_tot += nelbo.kl_scalar()?;
            ell_tot += nelbo.ell_scalar()?;
        }

        let nbatch = data.num_minibatch() as f32;
        trace.push(nelbo_tot / nbatch, kl_tot / nbatch, ell_tot / nbatch);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] nelbo: {:.4} kl: {:.4} ell: {:.4}",
                epoch + 1,
                nelbo_tot / nbatch,
                kl_tot / nbatch,
                ell_tot / nbatch
            );
        }
    } // each epoch

    pb.finish_and_clear();
    Ok(trace)
}

/// Average held-out negative ELBO without touching the parameters.
pub fn validate_autoencoder<DataL>(
    model: &BayesianAutoencoder,
    data: &mut DataL,
    train_config: &TrainConfig,
) -> anyhow::Result<f32>
where
    DataL: DataLoader,
{
    data.shuffle_minibatch(train_config.batch_size)?;

    let mut nelbo_tot = 0f32;
    for b in 0..data.num_minibatch() {
        let mb = data.minibatch_data(b, &train_config.device)?;
        let x_nd = &mb.input;
        let y_nd = mb.output.as_ref().unwrap_or(x_nd);

        let nelbo = model.negative_elbo(x_nd, y_nd, train_config.mc_samples)?;
        nelbo_tot += nelbo.loss_scalar()?;
    }
    Ok(nelbo_tot / data.num_minibatch() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle_bayes_autoencoder::{BayesianAutoencoder, BayesianAutoencoderArgs};
    use crate::candle_data_loader::InMemoryData;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    fn striped_data(n: usize, d: usize) -> candle_core::Result<Tensor> {
        // two alternating prototypes, values pushed toward 0 and 1
        Tensor::from_iter(
            (0..n * d).map(|k| {
                let (i, j) = (k / d, k % d);
                if (i + j) % 2 == 0 {
                    0.9f32
                } else {
                    0.1f32
                }
            }),
            &Device::Cpu,
        )?
        .reshape((n, d))
    }

    #[test]
    fn training_reduces_the_objective() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let parameters = VarMap::new();
        let vs = VarBuilder::from_varmap(&parameters, DType::F32, &dev);

        let model = BayesianAutoencoder::new(
            BayesianAutoencoderArgs {
                neurons_per_layer: &[8, 4, 8],
                constant_prior: true,
            },
            vs,
        )?;

        let x_nd = striped_data(30, 8)?;
        let mut data = InMemoryData::new(&x_nd)?;

        let config = TrainConfig {
            learning_rate: 5e-2,
            batch_size: 10,
            num_epochs: 60,
            mc_samples: 2,
            device: dev.clone(),
            show_progress: false,
            verbose: false,
        };

        let trace = train_autoencoder(&model, &mut data, &parameters, &config)?;
        assert_eq!(trace.nelbo.len(), 60);
        assert!(trace.nelbo.iter().all(|x| x.is_finite()));

        let head = trace.nelbo[..5].iter().sum::<f32>() / 5.0;
        let tail = trace.nelbo[trace.nelbo.len() - 5..].iter().sum::<f32>() / 5.0;
        assert!(
            tail < head,
            "nelbo did not improve: head {} tail {}",
            head,
            tail
        );

        let held_out = validate_autoencoder(&model, &mut data, &config)?;
        assert!(held_out.is_finite());
        Ok(())
    }

    #[test]
    fn trace_rows_line_up() -> anyhow::Result<()> {
        use tempfile::tempdir;

        let trace = TrainTrace {
            nelbo: vec![3.0, 2.0, 1.0],
            kl: vec![0.5, 0.6, 0.7],
            ell: vec![-2.5, -1.4, -0.3],
        };

        let dir = tempdir()?;
        let path = dir.path().join("trace.tsv.gz");
        let path = path.to_str().expect("utf-8 path");
        trace.write_tsv(path)?;

        let mat = crate::candle_matrix_io::read_matrix(path, &['\t'], Some(1))?;
        assert_eq!(mat.dims(), &[3, 4]);
        assert_eq!(mat.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?, vec![1f32, 2., 3.]);
        Ok(())
    }
}
