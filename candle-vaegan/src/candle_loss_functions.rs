use candle_core::{Result, Tensor};

/// ln(2π)
pub const LN_2PI: f64 = 1.8378770664093453;

/// Mean square error, optionally masked
///
/// mse = mean( (pred - true)^2 * mask )
///
/// * `pred_nd` - predicted data
/// * `true_nd` - observed data
/// * `mask_nd` - binary mask broadcastable to the data; zero entries
///   do not contribute to the loss (but still count in the mean)
///
pub fn mse(pred_nd: &Tensor, true_nd: &Tensor, mask_nd: Option<&Tensor>) -> Result<Tensor> {
    let diff_sq = pred_nd.sub(true_nd)?.sqr()?;
    match mask_nd {
        Some(mask) => diff_sq.broadcast_mul(mask)?.mean_all(),
        None => diff_sq.mean_all(),
    }
}

/// Gaussian log-likelihood with a fixed isotropic variance `std^2`,
/// summed over all non-frame dimensions and averaged over frames
///
/// llik(n) = -(0.5 ln 2π + 0.5 ln std²) * D - 0.5 / std² * sum_d mask(n,d) (x(n,d) - mu(n,d))^2
///
/// Caveat: `D` is the full number of entries per frame; masked-out
/// entries drop out of the squared error but not out of `D`.
///
/// * `pred_nd` - data tensor with a leading frame axis
/// * `mean_nd` - Gaussian mean (reconstruction), same shape
/// * `mask_nd` - optional binary mask
/// * `std` - fixed standard deviation
///
pub fn gaussian_ll(
    pred_nd: &Tensor,
    mean_nd: &Tensor,
    mask_nd: Option<&Tensor>,
    std: f64,
) -> Result<Tensor> {
    let n_dims = non_frame_dims(pred_nd);
    let var = std * std;
    let log_var = var.ln();

    let diff_sq = pred_nd.sub(mean_nd)?.sqr()?;
    let diff_sq = match mask_nd {
        Some(mask) => diff_sq.broadcast_mul(mask)?,
        None => diff_sq,
    };

    let diff_sq_n = if diff_sq.rank() > 1 {
        diff_sq.flatten_from(1)?.sum(1)?
    } else {
        diff_sq
    };

    let constant = -(0.5 * LN_2PI + 0.5 * log_var) * n_dims as f64;
    ((diff_sq_n * (-0.5 / var))? + constant)?.mean_all()
}

/// Undo the Gaussian constants of [`gaussian_ll`] to get back a mean
/// square error scaled by `mse_std^2`.
///
/// Only an exact inverse when the log-likelihood was computed without a mask.
pub fn gaussian_ll_to_mse(ll: f64, n_dims: usize, gaussian_std: f64, mse_std: f64) -> f64 {
    let n_dims = n_dims as f64;
    let gaussian_var = gaussian_std * gaussian_std;
    let mut llc = ll;
    llc += (0.5 * LN_2PI + 0.5 * gaussian_var.ln()) * n_dims;
    llc *= -gaussian_var / 0.5;
    llc /= n_dims;
    llc / (mse_std * mse_std)
}

/// KL divergence between two Gaussian distributions for each row
///
/// -0.5 * (1 + log(sigma^2) - mu^2 - sigma^2)
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    let z_var = z_lnvar.exp()?;
    (z_var - 1. + z_mean.powf(2.)? - z_lnvar)?.sum(z_mean.rank() - 1)? * 0.5
}

/// KL(q || N(0, I)) summed across latent dimensions, averaged over frames
pub fn kl_div_to_std_normal(z_mean: &Tensor, z_lnvar: &Tensor) -> Result<Tensor> {
    gaussian_kl_loss(z_mean, z_lnvar)?.mean_all()
}

/// Element-wise log density of a diagonal Gaussian, before summing
/// over dimensions. Arguments broadcast against each other.
///
/// log N(z; mu, exp(lnvar)) = -0.5 * (exp(-lnvar) (z - mu)^2 + lnvar + ln 2π)
///
pub fn gaussian_log_density_unsummed(z: &Tensor, mu: &Tensor, lnvar: &Tensor) -> Result<Tensor> {
    let diff_sq = z.broadcast_sub(mu)?.sqr()?;
    let inv_var = lnvar.neg()?.exp()?;
    (diff_sq.broadcast_mul(&inv_var)?.broadcast_add(lnvar)? + LN_2PI)? * (-0.5)
}

/// Element-wise log density of the standard normal
pub fn gaussian_log_density_unsummed_std_normal(z: &Tensor) -> Result<Tensor> {
    (z.sqr()? + LN_2PI)? * (-0.5)
}

/// Squared deviation from orthonormality of the rows of `a` and `b`
/// taken together
///
/// C = [a; b]
/// overlap = mean( (C C' - I)^2 )
///
/// * `a_kd` - (a x d) basis
/// * `b_kd` - (c x d) basis
///
pub fn subspace_overlap(a_kd: &Tensor, b_kd: &Tensor) -> Result<Tensor> {
    let c_kd = Tensor::cat(&[a_kd, b_kd], 0)?;
    let k = c_kd.dim(0)?;
    let eye = Tensor::eye(k, c_kd.dtype(), c_kd.device())?;
    c_kd.matmul(&c_kd.t()?)?.sub(&eye)?.sqr()?.mean_all()
}

/// number of entries per frame
pub fn non_frame_dims(x: &Tensor) -> usize {
    x.dims().iter().skip(1).product()
}
