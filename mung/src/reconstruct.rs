use crate::common::*;

use candle_bayes::candle_bayes_autoencoder::{BayesianAutoencoder, BayesianAutoencoderArgs};
use candle_bayes::candle_matrix_io::{read_matrix, write_matrix};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

#[derive(Args, Debug)]
pub struct ReconstructArgs {
    #[arg(
        required = true,
        help = "Data file",
        long_help = "Data matrix to be pushed through the model.\n\
		     Delimited text (tab, comma, or space), optionally gzipped.\n\
		     Columns must match the model's input width."
    )]
    data_file: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Model header",
        long_help = "Header used at training time; reads\n\
		     - {model}.safetensors\n\
		     - {model}.json\n"
    )]
    model: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output file",
        long_help = "Where the averaged reconstruction (or hidden representation)\n\
		     is written as a tab-separated matrix; \".gz\" compresses."
    )]
    out: Box<str>,

    #[arg(
        long,
        short = 's',
        default_value_t = 10,
        help = "Monte Carlo samples",
        long_help = "Number of posterior weight samples averaged per output row."
    )]
    mc_samples: usize,

    #[arg(
        long,
        help = "Stop after this many layer transitions",
        long_help = "Halt propagation after this many layer transitions and\n\
		     emit the hidden representation instead of the reconstruction.\n\
		     1 yields the first hidden layer."
    )]
    stop_after_layer: Option<usize>,

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

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

pub fn reconstruct_data(args: &ReconstructArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let config = ModelConfig::read_json(&format!("{}.json", &args.model))?;
    info!(
        "restoring a model over layers {:?}",
        &config.neurons_per_layer
    );

    let dev = select_device(&args.device, args.device_no)?;

    let mut parameters = VarMap::new();
    let param_builder = VarBuilder::from_varmap(&parameters, DType::F32, &dev);

    let model = BayesianAutoencoder::new(
        BayesianAutoencoderArgs {
            neurons_per_layer: &config.neurons_per_layer,
            constant_prior: config.constant_prior,
        },
        param_builder,
    )?;

    parameters.load(format!("{}.safetensors", &args.model))?;

    let x_nd = read_matrix(&args.data_file, &['\t', ',', ' '], None)?.to_device(&dev)?;
    let (nrow, _) = x_nd.dims2()?;
    info!("read {} samples from {}", nrow, &args.data_file);

    let out_nd = match args.stop_after_layer {
        Some(depth) => model.predict_partial(&x_nd, args.mc_samples, depth)?,
        None => model.predict(&x_nd, args.mc_samples)?,
    };

    let out_nd = out_nd.to_device(&Device::Cpu)?;
    write_matrix(&out_nd, &args.out, "\t")?;

    let dims = out_nd.dims();
    info!("wrote {} x {} matrix to {}", dims[0], dims[1], &args.out);
    Ok(())
}
