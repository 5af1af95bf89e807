use crate::common::*;

use candle_bayes::candle_matrix_io::write_lines;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.tsv.gz (data matrix)\n\
		     - {out}.labels.tsv.gz (cluster memberships)\n"
    )]
    out: Box<str>,

    #[arg(long, short = 'n', default_value_t = 500, help = "Number of samples")]
    num_samples: usize,

    #[arg(long, short = 'd', default_value_t = 784, help = "Number of features")]
    num_features: usize,

    #[arg(long, short = 'k', default_value_t = 4, help = "Number of clusters")]
    num_clusters: usize,

    #[arg(
        long,
        default_value_t = 0.05,
        help = "Noise level",
        long_help = "Standard deviation of Gaussian jitter added to each\n\
		     prototype; values are clamped back into [0, 1]."
    )]
    noise_sd: f32,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

pub fn simulate_clustered_data(args: &SimulateArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    if args.num_samples < 1 || args.num_features < 1 || args.num_clusters < 1 {
        return Err(anyhow::anyhow!(
            "need positive sample, feature, and cluster counts"
        ));
    }

    let mut rng = StdRng::seed_from_u64(args.seed);

    let unif = Uniform::new(0f32, 1f32).expect("unif [0, 1)");
    let noise = Normal::new(0f32, args.noise_sd)?;

    let prototypes = Mat::from_fn(args.num_clusters, args.num_features, |_, _| {
        unif.sample(&mut rng)
    });

    let membership: Vec<usize> = (0..args.num_samples)
        .map(|_| rng.random_range(0..args.num_clusters))
        .collect();

    let x_nd = Mat::from_fn(args.num_samples, args.num_features, |i, j| {
        (prototypes[(membership[i], j)] + noise.sample(&mut rng)).clamp(0., 1.)
    });

    let lines: Vec<Box<str>> = (0..x_nd.nrows())
        .map(|i| {
            x_nd.row(i)
                .iter()
                .map(|x| format!("{}", x))
                .collect::<Vec<_>>()
                .join("\t")
                .into_boxed_str()
        })
        .collect();
    write_lines(&lines, &format!("{}.tsv.gz", &args.out))?;

    let labels: Vec<Box<str>> = membership
        .iter()
        .map(|k| k.to_string().into_boxed_str())
        .collect();
    write_lines(&labels, &format!("{}.labels.tsv.gz", &args.out))?;

    info!(
        "simulated {} x {} data over {} clusters",
        args.num_samples, args.num_features, args.num_clusters
    );
    Ok(())
}
