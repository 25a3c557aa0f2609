use candle_core::{Result, Tensor};

/// Diagonal Gaussian posterior over the latent code, plus whatever
/// the encoder needs to hand over to the decoder
pub struct LatentGaussian {
    /// posterior mean (n x k)
    pub mean_nk: Tensor,
    /// posterior log variance (n x k)
    pub lnvar_nk: Tensor,
    /// shape of the last feature map before flattening, without the
    /// frame axis
    pub feature_shape: Vec<usize>,
}

pub trait GaussianEncoderT {
    /// Evaluate the latent Gaussian parameters
    ///
    /// # Arguments
    /// * `x` - input data with a leading frame axis
    /// * `dataset` - selects the dataset-specific input layer
    fn latent_gaussian(&self, x: &Tensor, dataset: Option<usize>) -> Result<LatentGaussian>;

    ///
    /// z = mu + sigma * eps
    /// where eps ~ N(0, 1)
    ///
    /// # Arguments
    /// * `z_mean` - mean of Gaussian distribution
    /// * `z_lnvar` - log variance of Gaussian distribution
    /// * `use_mean` - skip sampling and return the mean
    fn reparameterize(&self, z_mean: &Tensor, z_lnvar: &Tensor, use_mean: bool) -> Result<Tensor> {
        if use_mean {
            Ok(z_mean.clone())
        } else {
            let eps = Tensor::randn_like(z_mean, 0., 1.)?;
            z_mean + (z_lnvar * 0.5)?.exp()? * eps
        }
    }

    fn dim_latent(&self) -> usize;
}

pub trait GaussianDecoderT {
    /// A decoder that spits out reconstruction
    ///
    /// # Arguments
    /// * `z_nk` - latent states (n x k)
    /// * `feature_shape` - handed over by the encoder
    /// * `dataset` - selects the dataset-specific output layer
    fn forward(&self, z_nk: &Tensor, feature_shape: &[usize], dataset: Option<usize>)
        -> Result<Tensor>;

    fn dim_latent(&self) -> usize;
}
