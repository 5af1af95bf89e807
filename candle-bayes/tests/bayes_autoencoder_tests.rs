use candle_bayes::candle_bayes_autoencoder::{BayesianAutoencoder, BayesianAutoencoderArgs};
use candle_bayes::candle_core::{DType, Device, Tensor};
use candle_bayes::candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};

fn new_model(
    neurons: &[usize],
    constant_prior: bool,
) -> anyhow::Result<(BayesianAutoencoder, VarMap)> {
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = BayesianAutoencoder::new(
        BayesianAutoencoderArgs {
            neurons_per_layer: neurons,
            constant_prior,
        },
        vs,
    )?;
    Ok((model, varmap))
}

fn sum_abs(t: &Tensor) -> anyhow::Result<f32> {
    Ok(t.abs()?.sum_all()?.to_scalar::<f32>()?)
}

#[test]
fn every_parameter_sits_in_the_gradient_graph() -> anyhow::Result<()> {
    let (model, parameters) = new_model(&[6, 4, 6], false)?;
    let x_nd = Tensor::rand(0f32, 1f32, (9, 6), &Device::Cpu)?;

    let nelbo = model.negative_elbo(&x_nd, &x_nd, 1)?;
    let grads = nelbo.loss.backward()?;

    assert_eq!(parameters.all_vars().len(), 8);
    for var in parameters.all_vars() {
        let grad = grads.get(&var).expect("gradient for every parameter");
        assert!(sum_abs(grad)?.is_finite());
    }
    Ok(())
}

#[test]
fn trainable_prior_follows_the_posterior() -> anyhow::Result<()> {
    let (model, parameters) = new_model(&[5, 3, 5], false)?;
    let x_nd = Tensor::rand(0f32, 1f32, (20, 5), &Device::Cpu)?;

    let mut adam = AdamW::new_lr(parameters.all_vars(), 1e-2)?;

    // first step: only the likelihood pulls, so the posterior moves
    // while the prior gradient is exactly zero at q = p
    let nelbo = model.negative_elbo(&x_nd, &x_nd, 1)?;
    adam.backward_step(&nelbo.loss)?;

    let posterior_moved: f32 = model
        .posterior()
        .layers()
        .iter()
        .map(|layer| sum_abs(layer.mean()).unwrap())
        .sum();
    assert!(posterior_moved > 0.0);

    let prior_still: f32 = model
        .prior()
        .layers()
        .iter()
        .map(|layer| sum_abs(layer.mean()).unwrap())
        .sum();
    assert_eq!(prior_still, 0.0);

    // second step: q and p now disagree, so the KL pulls the prior
    let nelbo = model.negative_elbo(&x_nd, &x_nd, 1)?;
    adam.backward_step(&nelbo.loss)?;

    let prior_moved: f32 = model
        .prior()
        .layers()
        .iter()
        .map(|layer| sum_abs(layer.mean()).unwrap())
        .sum();
    assert!(prior_moved > 0.0);
    Ok(())
}

#[test]
fn constant_prior_never_moves() -> anyhow::Result<()> {
    let (model, parameters) = new_model(&[5, 3, 5], true)?;
    let x_nd = Tensor::rand(0f32, 1f32, (20, 5), &Device::Cpu)?;

    let mut adam = AdamW::new_lr(parameters.all_vars(), 1e-2)?;
    for _ in 0..3 {
        let nelbo = model.negative_elbo(&x_nd, &x_nd, 1)?;
        adam.backward_step(&nelbo.loss)?;
    }

    for layer in model.prior().layers() {
        assert_eq!(sum_abs(layer.mean())?, 0.0);
        assert_eq!(sum_abs(&layer.log_var()?)?, 0.0);
    }

    // posterior should have wandered away and paid a KL price
    let kl = model.kl_total()?.to_scalar::<f32>()?;
    assert!(kl > 0.0);
    Ok(())
}

#[test]
fn more_samples_calm_the_prediction() -> anyhow::Result<()> {
    let (model, _) = new_model(&[6, 3, 6], false)?;
    let x_nd = Tensor::rand(0f32, 1f32, (4, 6), &Device::Cpu)?;

    let repeats = 12;
    let spread = |mc_samples: usize| -> anyhow::Result<f32> {
        let stats = (0..repeats)
            .map(|_| -> anyhow::Result<f32> {
                let recon = model.predict(&x_nd, mc_samples)?;
                Ok(recon.mean_all()?.to_scalar::<f32>()?)
            })
            .collect::<anyhow::Result<Vec<f32>>>()?;
        let mean = stats.iter().sum::<f32>() / repeats as f32;
        Ok(stats.iter().map(|s| (s - mean) * (s - mean)).sum::<f32>() / (repeats - 1) as f32)
    };

    let var_single = spread(1)?;
    let var_many = spread(64)?;
    assert!(
        var_many < var_single,
        "averaging {} draws did not stabilize: {} vs {}",
        64,
        var_many,
        var_single
    );
    Ok(())
}

#[test]
fn feedforward_applies_bias_then_tanh_then_sigmoid() -> anyhow::Result<()> {
    let (model, parameters) = new_model(&[4, 2, 4], false)?;
    let dev = Device::Cpu;

    // pin the posterior at handpicked means with negligible variance
    {
        let data = parameters.data().lock().unwrap();

        let w0 = Tensor::from_vec(
            vec![
                0.1f32, -0.2, // bias row
                0.25, 0.25, //
                0.25, 0.25, //
                0.25, 0.25, //
                0.25, 0.25,
            ],
            (5, 2),
            &dev,
        )?;
        data.get("posterior.layer0.mean").unwrap().set(&w0)?;

        let mut w1 = vec![0.0f32; 4]; // bias row
        w1.extend(std::iter::repeat(0.5f32).take(8));
        let w1 = Tensor::from_vec(w1, (3, 4), &dev)?;
        data.get("posterior.layer1.mean").unwrap().set(&w1)?;

        for name in [
            "posterior.layer0.log_var",
            "posterior.layer1.log_var",
        ] {
            let dims = data.get(name).unwrap().dims().to_vec();
            data.get(name).unwrap().set(&Tensor::full(-40f32, dims, &dev)?)?;
        }
    }

    let x_nd = Tensor::ones((1, 4), DType::F32, &dev)?;
    let recon = model.predict(&x_nd, 200)?;

    // x·W + b = [1.1, 0.8]; h = tanh; out = sigmoid(0.5 h1 + 0.5 h2)
    let h = (1.1f32.tanh(), 0.8f32.tanh());
    let expected = 1.0 / (1.0 + (-(0.5 * h.0 + 0.5 * h.1)).exp());

    for value in recon.flatten_all()?.to_vec1::<f32>()? {
        assert!((value - expected).abs() < 0.02, "{} vs {}", value, expected);
    }

    let hidden = model.predict_partial(&x_nd, 200, 1)?;
    for (value, expected) in hidden.flatten_all()?.to_vec1::<f32>()?.iter().zip([h.0, h.1]) {
        assert!((value - expected).abs() < 0.02, "{} vs {}", value, expected);
    }
    Ok(())
}

#[test]
fn saved_parameters_rebuild_the_same_model() -> anyhow::Result<()> {
    use tempfile::tempdir;

    let (model, parameters) = new_model(&[6, 4, 6], false)?;
    let x_nd = Tensor::rand(0f32, 1f32, (15, 6), &Device::Cpu)?;

    let mut adam = AdamW::new_lr(parameters.all_vars(), 1e-2)?;
    for _ in 0..2 {
        let nelbo = model.negative_elbo(&x_nd, &x_nd, 1)?;
        adam.backward_step(&nelbo.loss)?;
    }

    let dir = tempdir()?;
    let path = dir.path().join("model.safetensors");
    parameters.save(&path)?;

    let (restored, mut restored_parameters) = new_model(&[6, 4, 6], false)?;
    restored_parameters.load(&path)?;

    for (a, b) in model
        .posterior()
        .layers()
        .iter()
        .zip(restored.posterior().layers())
    {
        assert_eq!(sum_abs(&(a.mean() - b.mean())?)?, 0.0);
        assert_eq!(sum_abs(&(a.log_var()? - b.log_var()?)?)?, 0.0);
    }

    let kl = model.kl_total()?.to_scalar::<f32>()?;
    let restored_kl = restored.kl_total()?.to_scalar::<f32>()?;
    assert_eq!(kl, restored_kl);

    assert_eq!(restored.predict(&x_nd, 3)?.dims(), &[15, 6]);
    Ok(())
}
