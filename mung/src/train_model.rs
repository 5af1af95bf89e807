use crate::common::*;

use candle_bayes::candle_bayes_autoencoder::{BayesianAutoencoder, BayesianAutoencoderArgs};
use candle_bayes::candle_data_loader::InMemoryData;
use candle_bayes::candle_matrix_io::read_matrix;
use candle_bayes::candle_trainer::{train_autoencoder, validate_autoencoder, TrainConfig};
use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rayon::ThreadPoolBuilder;

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        required = true,
        help = "Data file",
        long_help = "Data matrix to be reconstructed.\n\
		     Delimited text (tab, comma, or space), optionally gzipped.\n\
		     One sample per row; every value must lie in [0, 1]."
    )]
    data_file: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results.\n\
		     Specify the prefix for generated files:\n\
		     - {out}.safetensors\n\
		     - {out}.json\n\
		     - {out}.trace.tsv.gz\n"
    )]
    out: Box<str>,

    #[arg(
        long,
        short = 'l',
        value_delimiter(','),
        default_values_t = vec![784, 128, 64, 128, 784],
        help = "Layer widths (comma-separated)",
        long_help = "Width of every layer, input first and output last.\n\
		     Both ends must match the number of data columns.\n\
		     Example: 784,128,64,128,784"
    )]
    layers: Vec<usize>,

    #[arg(
        long,
        default_value_t = false,
        help = "Freeze the prior at N(0, I)",
        long_help = "Keep the weight prior fixed at the standard Gaussian\n\
		     instead of learning its means and variances."
    )]
    constant_prior: bool,

    #[arg(
        long,
        short = 'i',
        default_value_t = 100,
        help = "Number of training epochs"
    )]
    epochs: usize,

    #[arg(long, default_value_t = 100, help = "Minibatch size")]
    minibatch_size: usize,

    #[arg(
        long,
        short = 's',
        default_value_t = 1,
        help = "Monte Carlo samples per gradient step",
        long_help = "Number of weight samples per gradient step.\n\
		     One sample already gives an unbiased gradient;\n\
		     more samples reduce its variance."
    )]
    mc_samples: usize,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate")]
    learning_rate: f32,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Computing device",
        long_help = "Computing device, e.g., cpu, cuda, metal"
    )]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "Device number")]
    device_no: usize,

    #[arg(
        long,
        help = "Validation data file",
        long_help = "Held-out data matrix in the same format as the training data.\n\
		     After training, reports the average negative ELBO on it."
    )]
    validation_file: Option<Box<str>>,

    #[arg(long, default_value_t = usize::MAX, help = "Maximum number of threads")]
    max_threads: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

pub fn train_bayesian_autoencoder(args: &TrainArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let max_threads = num_cpus::get().min(args.max_threads);

    ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build_global()?;

    info!("will use {} threads", rayon::current_num_threads());

    let x_nd = read_bernoulli_matrix(&args.data_file)?;
    let (nrow, ncol) = x_nd.dims2()?;
    info!("read {} x {} data from {}", nrow, ncol, &args.data_file);

    if args.layers.len() < 2 {
        return Err(anyhow::anyhow!(
            "need at least two layer widths, found {:?}",
            &args.layers
        ));
    }
    if args.layers[0] != ncol || args.layers[args.layers.len() - 1] != ncol {
        return Err(anyhow::anyhow!(
            "layer widths {:?} do not close the loop over {} data columns",
            &args.layers,
            ncol
        ));
    }

    let dev = select_device(&args.device, args.device_no)?;

    let parameters = VarMap::new();
    let param_builder = VarBuilder::from_varmap(&parameters, DType::F32, &dev);

    let model = BayesianAutoencoder::new(
        BayesianAutoencoderArgs {
            neurons_per_layer: &args.layers,
            constant_prior: args.constant_prior,
        },
        param_builder,
    )?;

    info!(
        "built {} weight distributions over layers {:?}",
        model.num_transitions() * 2,
        model.neurons_per_layer()
    );

    let mut data_loader = InMemoryData::new(&x_nd)?;

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.minibatch_size,
        num_epochs: args.epochs,
        mc_samples: args.mc_samples,
        device: dev.clone(),
        show_progress: true,
        verbose: args.verbose,
    };

    let trace = train_autoencoder(&model, &mut data_loader, &parameters, &train_config)?;
    trace.write_tsv(&format!("{}.trace.tsv.gz", &args.out))?;

    info!("writing down the model parameters");

    parameters.save(format!("{}.safetensors", &args.out).as_str())?;

    ModelConfig {
        neurons_per_layer: args.layers.clone(),
        constant_prior: args.constant_prior,
    }
    .write_json(&format!("{}.json", &args.out))?;

    if let Some(validation_file) = &args.validation_file {
        let v_nd = read_bernoulli_matrix(validation_file)?;
        let (_, v_ncol) = v_nd.dims2()?;
        if v_ncol != ncol {
            return Err(anyhow::anyhow!(
                "validation data has {} columns, expected {}",
                v_ncol,
                ncol
            ));
        }
        let mut validation_loader = InMemoryData::new(&v_nd)?;
        let nelbo = validate_autoencoder(&model, &mut validation_loader, &train_config)?;
        info!("validation nelbo: {:.4}", nelbo);
    }

    info!("done training");
    Ok(())
}

/// Read a matrix and insist on [0, 1] values; anything outside breaks
/// the Bernoulli likelihood downstream.
fn read_bernoulli_matrix(data_file: &str) -> anyhow::Result<Tensor> {
    let x_nd = read_matrix(data_file, &['\t', ',', ' '], None)?;

    let min = x_nd.min_all()?.to_scalar::<f32>()?;
    let max = x_nd.max_all()?.to_scalar::<f32>()?;
    if min < 0. || max > 1. {
        return Err(anyhow::anyhow!(
            "{} holds values in [{}, {}], outside [0, 1]",
            data_file,
            min,
            max
        ));
    }
    Ok(x_nd)
}
