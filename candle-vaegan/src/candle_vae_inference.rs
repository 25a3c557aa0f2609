use crate::candle_beta_schedule::BetaSchedule;
use crate::candle_conv_decoder::ConvVaeDecoder;
use crate::candle_conv_encoder::ConvVaeEncoder;
use crate::candle_inference::{ModelType, VaeGanConfig, DEFAULT_CHUNK_SIZE};
use crate::candle_kl_decomposition::{decomposed_kl, KlDecomposition};
use crate::candle_loss_functions::*;
use crate::candle_model_traits::{GaussianDecoderT, GaussianEncoderT};

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use log::{debug, warn};

/// A minibatch of frames
pub struct Batch {
    /// the first tensor is the one being reconstructed
    pub images: Vec<Tensor>,
    /// 1 = included, 0 = excluded from the loss
    pub masks: Option<Vec<Tensor>>,
}

impl Batch {
    pub fn new(images: Tensor) -> Self {
        Self {
            images: vec![images],
            masks: None,
        }
    }

    pub fn with_mask(images: Tensor, mask: Tensor) -> Self {
        Self {
            images: vec![images],
            masks: Some(vec![mask]),
        }
    }

    fn primary(&self) -> Result<(&Tensor, Option<&Tensor>)> {
        let Some(x) = self.images.first() else {
            candle_core::bail!("batch has no images");
        };
        let mask = self.masks.as_ref().and_then(|m| m.first());
        Ok((x, mask))
    }
}

/// How to evaluate [`Vae::loss`]
#[derive(Clone, Debug)]
pub struct LossOptions {
    /// current training epoch, indexes the beta schedule
    pub epoch: usize,
    /// dataset-specific input/output layers
    pub dataset: Option<usize>,
    /// back-propagate each chunk and return the summed gradients of
    /// the trainable variables
    pub accumulate_grad: bool,
    /// maximum number of frames per forward pass
    pub chunk_size: usize,
    /// skip the sampling step
    pub use_mean: bool,
}

impl Default for LossOptions {
    fn default() -> Self {
        Self {
            epoch: 0,
            dataset: None,
            accumulate_grad: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            use_mean: false,
        }
    }
}

impl LossOptions {
    pub fn at_epoch(epoch: usize) -> Self {
        Self {
            epoch,
            ..Default::default()
        }
    }
}

/// Batch-level ELBO terms, each a frame-weighted mean over chunks
pub struct ElboLoss {
    /// -loss_ll + beta * loss_kl
    pub loss: f64,
    /// Gaussian log-likelihood of the reconstruction
    pub loss_ll: f64,
    /// KL to the standard normal prior
    pub loss_kl: f64,
    /// `loss_ll` converted back to a mean square error
    pub loss_mse: f64,
    pub beta: f64,
    /// gradients summed over chunks, if requested
    pub grads: Option<GradStore>,
}

impl ElboLoss {
    pub fn entries(&self) -> [(&'static str, f64); 5] {
        [
            ("loss", self.loss),
            ("loss_ll", self.loss_ll),
            ("loss_kl", self.loss_kl),
            ("loss_mse", self.loss_mse),
            ("beta", self.beta),
        ]
    }
}

pub struct VaeForward {
    /// reconstruction, same shape as the input
    pub recon: Tensor,
    /// latent sample (or mean)
    pub z: Tensor,
    pub mean: Tensor,
    pub lnvar: Tensor,
}

pub struct Vae<Enc, Dec>
where
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
{
    pub encoder: Enc,
    pub decoder: Dec,
    variables: Vec<Var>,
    beta_schedule: BetaSchedule,
}

/// Convolutional VAE trained with the (beta-weighted) ELBO
pub type VaeGan = Vae<ConvVaeEncoder, ConvVaeDecoder>;

impl<Enc, Dec> Vae<Enc, Dec>
where
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
{
    /// Build a VAE model
    /// * `encoder` - encoder module
    /// * `decoder` - decoder module
    /// * `variable_map` - holds every trainable variable of both
    /// * `beta_schedule` - KL weight per epoch
    pub fn build(
        encoder: Enc,
        decoder: Dec,
        variable_map: &VarMap,
        beta_schedule: BetaSchedule,
    ) -> Result<Self> {
        if encoder.dim_latent() != decoder.dim_latent() {
            candle_core::bail!(
                "encoder has {} latent dimensions, decoder {}",
                encoder.dim_latent(),
                decoder.dim_latent()
            );
        }

        Ok(Self {
            encoder,
            decoder,
            variables: variable_map.all_vars(),
            beta_schedule,
        })
    }

    pub fn beta_schedule(&self) -> &BetaSchedule {
        &self.beta_schedule
    }

    /// x -> (mu, logvar) -> z -> x_hat
    ///
    /// * `x` - input frames
    /// * `dataset` - dataset-specific input/output layers
    /// * `use_mean` - take z = mu instead of sampling
    pub fn forward(
        &self,
        x: &Tensor,
        dataset: Option<usize>,
        use_mean: bool,
    ) -> Result<VaeForward> {
        let latent = self.encoder.latent_gaussian(x, dataset)?;
        let z = self
            .encoder
            .reparameterize(&latent.mean_nk, &latent.lnvar_nk, use_mean)?;
        let recon = self.decoder.forward(&z, &latent.feature_shape, dataset)?;
        Ok(VaeForward {
            recon,
            z,
            mean: latent.mean_nk,
            lnvar: latent.lnvar_nk,
        })
    }

    /// Index-code MI, total correlation and dimension-wise KL of the
    /// latent codes of `x`
    pub fn decomposed_kl(
        &self,
        x: &Tensor,
        dataset: Option<usize>,
        use_mean: bool,
    ) -> Result<KlDecomposition> {
        let latent = self.encoder.latent_gaussian(x, dataset)?;
        let z = self
            .encoder
            .reparameterize(&latent.mean_nk, &latent.lnvar_nk, use_mean)?;
        decomposed_kl(&z, &latent.mean_nk, &latent.lnvar_nk)
    }

    /// ELBO loss of a batch, evaluated in chunks along the frame axis
    ///
    /// Each chunk is back-propagated right away (when
    /// `accumulate_grad`) so that only one chunk's graph is alive at a
    /// time; gradients of all chunks are summed.
    pub fn loss(&self, batch: &Batch, opts: &LossOptions) -> Result<ElboLoss> {
        let (x, mask) = batch.primary()?;
        let beta = self.beta_schedule.beta(opts.epoch)?;

        let batch_size = x.dim(0)?;
        if batch_size == 0 {
            candle_core::bail!("empty batch");
        }
        if opts.chunk_size == 0 {
            candle_core::bail!("chunk size must be positive");
        }

        let n_dims = non_frame_dims(x);
        let n_chunks = batch_size.div_ceil(opts.chunk_size);

        let mut loss_val = 0_f64;
        let mut loss_ll_val = 0_f64;
        let mut loss_kl_val = 0_f64;
        let mut loss_mse_val = 0_f64;
        let mut var_grads: Vec<Option<Tensor>> = vec![None; self.variables.len()];

        for chunk in 0..n_chunks {
            let lb = chunk * opts.chunk_size;
            let ub = ((chunk + 1) * opts.chunk_size).min(batch_size);
            let size = ub - lb;

            let x_in = x.narrow(0, lb, size)?;
            let m_in = match mask {
                Some(m) if m.rank() == x.rank() && m.dim(0)? == batch_size => {
                    Some(m.narrow(0, lb, size)?)
                }
                Some(m) => Some(m.clone()),
                None => None,
            };

            let out = self.forward(&x_in, opts.dataset, opts.use_mean)?;

            let loss_ll = gaussian_ll(&x_in, &out.recon, m_in.as_ref(), 1.)?;
            let loss_kl = kl_div_to_std_normal(&out.mean, &out.lnvar)?;
            let loss = ((&loss_kl * beta)? - &loss_ll)?;

            if opts.accumulate_grad {
                self.accumulate_grads(&mut var_grads, loss.backward()?)?;
            }

            let ll = to_f64(&loss_ll)?;
            let kl = to_f64(&loss_kl)?;
            let weight = size as f64;

            loss_val += to_f64(&loss)? * weight;
            loss_ll_val += ll * weight;
            loss_kl_val += kl * weight;
            loss_mse_val += gaussian_ll_to_mse(ll, n_dims, 1., 1.) * weight;

            debug!(
                "chunk {}/{} [{}, {}): ll = {:.4}, kl = {:.4}",
                chunk + 1,
                n_chunks,
                lb,
                ub,
                ll,
                kl
            );
        }

        let grads = if opts.accumulate_grad {
            Some(self.collect_grads(var_grads, x.device())?)
        } else {
            None
        };

        let n = batch_size as f64;
        Ok(ElboLoss {
            loss: loss_val / n,
            loss_ll: loss_ll_val / n,
            loss_kl: loss_kl_val / n,
            loss_mse: loss_mse_val / n,
            beta,
            grads,
        })
    }

    /// Evaluate the chunked loss and take one optimizer step with the
    /// accumulated gradients
    pub fn train_step<Opt>(
        &self,
        batch: &Batch,
        opts: &LossOptions,
        optimizer: &mut Opt,
    ) -> Result<ElboLoss>
    where
        Opt: Optimizer,
    {
        let opts = LossOptions {
            accumulate_grad: true,
            ..opts.clone()
        };
        let out = self.loss(batch, &opts)?;
        if let Some(grads) = out.grads.as_ref() {
            optimizer.step(grads)?;
        }
        Ok(out)
    }

    /// Fold one chunk's variable gradients into the running sums.
    /// Everything else in `chunk` (activation gradients) is dropped here.
    fn accumulate_grads(&self, acc: &mut [Option<Tensor>], mut chunk: GradStore) -> Result<()> {
        for (var, sum) in self.variables.iter().zip(acc.iter_mut()) {
            if let Some(g) = chunk.remove(var.as_tensor()) {
                *sum = Some(match sum.take() {
                    Some(prev) => prev.add(&g)?,
                    None => g,
                });
            }
        }
        Ok(())
    }

    /// A gradient store holding exactly the trainable variables
    fn collect_grads(&self, var_grads: Vec<Option<Tensor>>, device: &Device) -> Result<GradStore> {
        // an untracked scalar back-propagates into a store holding only itself
        let root = Tensor::zeros((), DType::F32, device)?;
        let mut store = root.backward()?;
        store.remove(&root);

        for (var, grad) in self.variables.iter().zip(var_grads) {
            if let Some(g) = grad {
                store.insert(var.as_tensor(), g);
            }
        }
        Ok(store)
    }
}

impl VaeGan {
    /// Build the convolutional VAE-GAN from its hyper-parameters
    ///
    /// * `config` - hyper-parameters; `model_type` must be `conv`
    /// * `variable_map` - receives the trainable variables
    pub fn from_config(
        config: &VaeGanConfig,
        variable_map: &VarMap,
        dtype: DType,
        device: &Device,
    ) -> anyhow::Result<Self> {
        match config.model_type()? {
            ModelType::Linear => {
                anyhow::bail!("linear model_type is not implemented for the VAE-GAN")
            }
            ModelType::Conv => {}
        }

        if config.beta_anneal_epochs > config.max_n_epochs {
            warn!(
                "beta annealing ({} epochs) outlasts training ({} epochs)",
                config.beta_anneal_epochs, config.max_n_epochs
            );
        }

        if config.beta == 0. && config.beta_anneal_epochs > 0 {
            warn!("annealing towards beta = 0 leaves the KL term unweighted");
        }

        let arch = config.architecture();
        let vs = VarBuilder::from_varmap(variable_map, dtype, device);
        let encoder = ConvVaeEncoder::new(&arch, vs.clone())?;
        let decoder = ConvVaeDecoder::new(&arch, vs)?;

        let beta_schedule =
            BetaSchedule::new(config.beta, config.beta_anneal_epochs, config.max_n_epochs);

        Ok(Self::build(encoder, decoder, variable_map, beta_schedule)?)
    }
}

fn to_f64(x: &Tensor) -> Result<f64> {
    x.to_dtype(DType::F64)?.to_scalar::<f64>()
}
