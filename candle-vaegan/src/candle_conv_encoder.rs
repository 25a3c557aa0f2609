use crate::candle_aux_layers::{DatasetLayers, StackLayers};
use crate::candle_inference::ConvArchitecture;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Conv2d, Conv2dConfig, Linear, Module, VarBuilder};

pub const LEAKY_RELU_SLOPE: f64 = 0.05;

pub fn leaky_relu() -> Activation {
    Activation::LeakyRelu(LEAKY_RELU_SLOPE)
}

pub struct ConvVaeEncoder {
    n_latents: usize,
    input_layer: DatasetLayers<Conv2d>,
    conv: StackLayers<Conv2d>,
    feature_shape: Vec<usize>,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl GaussianEncoderT for ConvVaeEncoder {
    ///
    /// Evaluate latent Gaussian parameters: mu and log_var
    /// z ~ (mu(x), log_var(x))
    fn latent_gaussian(&self, x: &Tensor, dataset: Option<usize>) -> Result<LatentGaussian> {
        let min_lv = -8.; // stabilize log variance
        let max_lv = 8.; //

        let h = self.input_layer.forward_dataset(x, dataset)?;
        let h = self.conv.forward(&h)?;
        let h_nf = h.flatten_from(1)?;

        let mean_nk = self.z_mean.forward(&h_nf)?;
        let lnvar_nk = self.z_lnvar.forward(&h_nf)?.clamp(min_lv, max_lv)?;

        Ok(LatentGaussian {
            mean_nk,
            lnvar_nk,
            feature_shape: self.feature_shape.clone(),
        })
    }

    fn dim_latent(&self) -> usize {
        self.n_latents
    }
}

impl ConvVaeEncoder {
    /// Will create a new convolutional encoder with these variables:
    ///
    /// * `nn.enc.conv.0.{d}.weight` where {d} is the dataset index
    /// * `nn.enc.conv.{j}.weight` where {j} is the layer index
    /// * `nn.enc.z.mean.weight`
    /// * `nn.enc.z.lnvar.weight`
    pub fn new(arch: &ConvArchitecture, vs: VarBuilder) -> Result<Self> {
        let (shapes, _) = arch.feature_shapes()?;
        let conv_layer = |j: usize, vs: VarBuilder| -> Result<Conv2d> {
            let spec = &arch.layers[j];
            let config = Conv2dConfig {
                padding: spec.padding,
                stride: spec.stride,
                ..Default::default()
            };
            candle_nn::conv2d(shapes[j].0, shapes[j + 1].0, spec.kernel_size, config, vs)
        };

        // (1) dataset-specific first layer
        let input_layer = if arch.n_datasets > 1 {
            let layers = (0..arch.n_datasets)
                .map(|d| conv_layer(0, vs.pp(format!("nn.enc.conv.0.{}", d))))
                .collect::<Result<Vec<_>>>()?;
            DatasetLayers::new(layers, Some(leaky_relu()))
        } else {
            DatasetLayers::new(vec![conv_layer(0, vs.pp("nn.enc.conv.0"))?], Some(leaky_relu()))
        };

        // (2) shared convolutions
        let mut conv = StackLayers::<Conv2d>::new();
        for j in 1..arch.layers.len() {
            let _name = format!("nn.enc.conv.{}", j);
            conv.push_with_act(conv_layer(j, vs.pp(_name))?, leaky_relu());
        }

        // (3) features -> K
        let &(c, h, w) = shapes.last().unwrap_or(&(0, 0, 0));
        let dim_features = c * h * w;
        let z_mean = candle_nn::linear(dim_features, arch.n_latents, vs.pp("nn.enc.z.mean"))?;
        let z_lnvar = candle_nn::linear(dim_features, arch.n_latents, vs.pp("nn.enc.z.lnvar"))?;

        Ok(Self {
            n_latents: arch.n_latents,
            input_layer,
            conv,
            feature_shape: vec![c, h, w],
            z_mean,
            z_lnvar,
        })
    }

    pub fn num_datasets(&self) -> usize {
        self.input_layer.num_datasets()
    }
}
