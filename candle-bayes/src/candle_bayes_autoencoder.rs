use candle_core::Tensor;
use candle_nn::ops;
use candle_nn::VarBuilder;

use crate::candle_gaussian_params::WeightStore;
use crate::candle_loss_functions::{bernoulli_likelihood, gaussian_kl_divergence};
use crate::error::{BayesError, Result};

/// Arguments for [`BayesianAutoencoder::new`]
pub struct BayesianAutoencoderArgs<'a> {
    /// Width of every layer, input first and output last; the two
    /// ends must agree with the data dimension.
    pub neurons_per_layer: &'a [usize],
    /// Freeze the prior at N(0, I) instead of learning it.
    pub constant_prior: bool,
}

/// Fully-connected autoencoder with a Gaussian distribution over
/// every weight
///
/// Two [`WeightStore`]s of identical shapes: the approximate
/// posterior q(W), always trainable, and the prior p(W), trainable or
/// frozen at N(0, I). A forward pass draws fresh weights from q, so
/// repeated passes over the same input differ; Monte Carlo averaging
/// over `mc_samples` draws recovers the expectations.
///
/// Hidden transitions apply `tanh`, the final transition `sigmoid`,
/// so outputs live in (0, 1) and pair with the Bernoulli likelihood.
///
/// Variables land in the builder's map as:
///
/// * `posterior.layer{i}.mean` and `posterior.layer{i}.log_var`
/// * `prior.layer{i}.mean` and `prior.layer{i}.log_var` (trainable prior only)
pub struct BayesianAutoencoder {
    neurons: Vec<usize>,
    prior: WeightStore,
    posterior: WeightStore,
}

/// Pieces of the negative evidence lower bound for one minibatch
///
/// `loss` keeps the computation graph alive for backpropagation;
/// `recon` is the Monte Carlo average of the stochastic outputs.
pub struct Nelbo {
    pub loss: Tensor,
    pub kl: Tensor,
    pub ell: Tensor,
    pub recon: Tensor,
}

impl Nelbo {
    /// Scalar loss for bookkeeping; reports divergence as an error
    /// instead of letting NaN leak into a training trace.
    pub fn loss_scalar(&self) -> Result<f32> {
        let loss = self.loss.to_scalar::<f32>()?;
        if loss.is_finite() {
            Ok(loss)
        } else {
            Err(BayesError::NonFinite(loss))
        }
    }

    pub fn kl_scalar(&self) -> Result<f32> {
        Ok(self.kl.to_scalar::<f32>()?)
    }

    pub fn ell_scalar(&self) -> Result<f32> {
        Ok(self.ell.to_scalar::<f32>()?)
    }
}

impl BayesianAutoencoder {
    /// Build prior and posterior stores over the given layer stack.
    /// All means and log variances start at zero, so q and p coincide
    /// at N(0, I) and the initial KL term vanishes.
    pub fn new(args: BayesianAutoencoderArgs, vs: VarBuilder) -> Result<Self> {
        let neurons = args.neurons_per_layer.to_vec();

        let prior = if args.constant_prior {
            WeightStore::constant(&neurons, vs.dtype(), vs.device())?
        } else {
            WeightStore::trainable(vs.pp("prior"), &neurons)?
        };
        let posterior = WeightStore::trainable(vs.pp("posterior"), &neurons)?;

        Ok(Self {
            neurons,
            prior,
            posterior,
        })
    }

    pub fn neurons_per_layer(&self) -> &[usize] {
        &self.neurons
    }

    pub fn num_transitions(&self) -> usize {
        self.neurons.len() - 1
    }

    pub fn dim_obs(&self) -> usize {
        self.neurons[0]
    }

    pub fn dim_out(&self) -> usize {
        self.neurons[self.neurons.len() - 1]
    }

    pub fn prior(&self) -> &WeightStore {
        &self.prior
    }

    pub fn posterior(&self) -> &WeightStore {
        &self.posterior
    }

    /// Stochastic outputs of `mc_samples` independent forward passes,
    /// each with its own weight draw from the posterior.
    ///
    /// With `stop_after = Some(k)` propagation halts after the k-th
    /// layer transition (activation included) and returns the hidden
    /// representation instead of the reconstruction.
    pub fn forward(
        &self,
        x_nd: &Tensor,
        mc_samples: usize,
        stop_after: Option<usize>,
    ) -> Result<Vec<Tensor>> {
        if mc_samples < 1 {
            return Err(BayesError::Config(
                "need at least one Monte Carlo sample".into(),
            ));
        }
        self.check_input(x_nd)?;
        let stop = self.resolve_stop(stop_after)?;

        (0..mc_samples)
            .map(|_| self.feedforward_once(x_nd, stop))
            .collect()
    }

    /// Monte Carlo mean of `mc_samples` reconstructions.
    pub fn predict(&self, x_nd: &Tensor, mc_samples: usize) -> Result<Tensor> {
        let outputs = self.forward(x_nd, mc_samples, None)?;
        average_outputs(&outputs)
    }

    /// Monte Carlo mean of the hidden representation after
    /// `stop_after_layer` transitions.
    pub fn predict_partial(
        &self,
        x_nd: &Tensor,
        mc_samples: usize,
        stop_after_layer: usize,
    ) -> Result<Tensor> {
        let outputs = self.forward(x_nd, mc_samples, Some(stop_after_layer))?;
        average_outputs(&outputs)
    }

    /// KL(q ‖ p) summed over every layer transition. Depends only on
    /// the stored parameters, not on data or weight samples.
    pub fn kl_total(&self) -> Result<Tensor> {
        let mut kl_nn: Option<Tensor> = None;
        for (q, p) in self
            .posterior
            .layers()
            .iter()
            .zip(self.prior.layers().iter())
        {
            let kl = gaussian_kl_divergence(q.mean(), &q.log_var()?, p.mean(), &p.log_var()?)?;
            kl_nn = Some(match kl_nn {
                Some(acc) => (acc + kl)?,
                None => kl,
            });
        }
        kl_nn.ok_or_else(|| BayesError::Config("no layer transitions".into()))
    }

    /// Monte Carlo estimate of E_q[log p(y | x, W)] over `mc_samples`
    /// weight draws, averaged over draws and summed over the
    /// minibatch. Also returns the averaged reconstruction.
    pub fn expected_log_likelihood(
        &self,
        x_nd: &Tensor,
        y_nd: &Tensor,
        mc_samples: usize,
    ) -> Result<(Tensor, Tensor)> {
        self.check_target(x_nd, y_nd)?;
        debug_assert!(y_nd.min_all()?.to_scalar::<f32>()? >= 0_f32);
        debug_assert!(y_nd.max_all()?.to_scalar::<f32>()? <= 1_f32);

        let outputs = self.forward(x_nd, mc_samples, None)?;

        let mut log_p = bernoulli_likelihood(y_nd, &outputs[0])?.sum_all()?;
        for recon in &outputs[1..] {
            log_p = (log_p + bernoulli_likelihood(y_nd, recon)?.sum_all()?)?;
        }

        let ell = (log_p / mc_samples as f64)?;
        Ok((ell, average_outputs(&outputs)?))
    }

    /// Negative evidence lower bound on one minibatch,
    ///
    /// nelbo = KL(q ‖ p) - E_q[log p(y | x, W)]
    ///
    /// For a plain autoencoder pass `y_nd = x_nd`.
    pub fn negative_elbo(&self, x_nd: &Tensor, y_nd: &Tensor, mc_samples: usize) -> Result<Nelbo> {
        let kl = self.kl_total()?;
        let (ell, recon) = self.expected_log_likelihood(x_nd, y_nd, mc_samples)?;
        let loss = (&kl - &ell)?;
        Ok(Nelbo {
            loss,
            kl,
            ell,
            recon,
        })
    }

    /// One pass with one weight draw. Row 0 of each sampled matrix is
    /// the bias, the rest multiplies the activations.
    fn feedforward_once(&self, x_nd: &Tensor, stop: usize) -> Result<Tensor> {
        let last = self.num_transitions();
        let mut h_nd = x_nd.clone();

        for (j, w) in self.posterior.sample_weights()?.iter().enumerate() {
            let d_in = w.dim(0)?;
            let bias = w.narrow(0, 0, 1)?;
            let affine = h_nd.matmul(&w.narrow(0, 1, d_in - 1)?)?.broadcast_add(&bias)?;

            h_nd = if j + 1 == last {
                ops::sigmoid(&affine)?
            } else {
                affine.tanh()?
            };

            if j + 1 == stop {
                break;
            }
        }
        Ok(h_nd)
    }

    fn check_input(&self, x_nd: &Tensor) -> Result<()> {
        let (_n, d) = x_nd.dims2()?;
        if d != self.dim_obs() {
            return Err(BayesError::Shape {
                what: "input columns",
                expected: self.dim_obs(),
                found: d,
            });
        }
        Ok(())
    }

    fn check_target(&self, x_nd: &Tensor, y_nd: &Tensor) -> Result<()> {
        self.check_input(x_nd)?;
        let (n, _) = x_nd.dims2()?;
        let (n_out, d_out) = y_nd.dims2()?;
        if d_out != self.dim_out() {
            return Err(BayesError::Shape {
                what: "target columns",
                expected: self.dim_out(),
                found: d_out,
            });
        }
        if n_out != n {
            return Err(BayesError::Shape {
                what: "target rows",
                expected: n,
                found: n_out,
            });
        }
        Ok(())
    }

    fn resolve_stop(&self, stop_after: Option<usize>) -> Result<usize> {
        match stop_after {
            None => Ok(self.num_transitions()),
            Some(k) if k >= 1 && k <= self.num_transitions() => Ok(k),
            Some(k) => Err(BayesError::Config(format!(
                "stop_after_layer must lie in 1..={}, found {}",
                self.num_transitions(),
                k
            ))),
        }
    }
}

fn average_outputs(outputs: &[Tensor]) -> Result<Tensor> {
    Ok(Tensor::stack(outputs, 0)?.mean(0)?)
}
