use candle_core::{Result, Tensor};

/// Guards log(0) in the Bernoulli log-likelihood.
pub const LLIK_EPS: f64 = 1e-10;

/// KL divergence between two diagonal Gaussian distributions
///
/// KL(q ‖ p) = 0.5 * sum( ln(σ²ₚ) - ln(σ²_q)
///                        + (μ_q - μₚ)² / σ²ₚ
///                        + σ²_q / σ²ₚ - 1 )
///
/// Both distributions factorize over elements, so the divergence of
/// the whole matrix is the sum of elementwise divergences. Returns a
/// scalar tensor.
///
/// * `mean_q`, `log_var_q` - approximate posterior q
/// * `mean_p`, `log_var_p` - prior p
///
pub fn gaussian_kl_divergence(
    mean_q: &Tensor,
    log_var_q: &Tensor,
    mean_p: &Tensor,
    log_var_p: &Tensor,
) -> Result<Tensor> {
    let log_var_ratio = (log_var_p - log_var_q)?;
    let mean_term = (mean_q - mean_p)?.sqr()?.div(&log_var_p.exp()?)?;
    let var_term = (log_var_q - log_var_p)?.exp()?;
    (((log_var_ratio + mean_term)? + var_term)? - 1.)?.sum_all()? * 0.5
}

/// Bernoulli log-likelihood of [0, 1]-valued data
///
/// llik(i) = sum_w x(i,w) * log(recon(i,w) + ε)
///           + (1 - x(i,w)) * log(1 - recon(i,w) + ε)
///
/// * `x_nd` - data tensor (observed data)
/// * `recon_nd` - probability tensor (reconstruction)
///
pub fn bernoulli_likelihood(x_nd: &Tensor, recon_nd: &Tensor) -> Result<Tensor> {
    let log_recon = (recon_nd + LLIK_EPS)?.log()?;
    let log_recon_c = (recon_nd.affine(-1., 1.)? + LLIK_EPS)?.log()?;

    x_nd.mul(&log_recon)?
        .add(&x_nd.affine(-1., 1.)?.mul(&log_recon_c)?)?
        .sum(x_nd.rank() - 1)
}
