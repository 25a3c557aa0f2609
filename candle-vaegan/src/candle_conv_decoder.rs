use crate::candle_aux_layers::{DatasetLayers, StackLayers};
use crate::candle_conv_encoder::leaky_relu;
use crate::candle_inference::ConvArchitecture;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, ConvTranspose2d, ConvTranspose2dConfig, Linear, Module, VarBuilder};

/// Mirror image of [`crate::candle_conv_encoder::ConvVaeEncoder`]:
/// latent -> linear -> transposed convolutions -> sigmoid
pub struct ConvVaeDecoder {
    n_latents: usize,
    fc: Linear,
    deconv: StackLayers<ConvTranspose2d>,
    output_layer: DatasetLayers<ConvTranspose2d>,
}

impl GaussianDecoderT for ConvVaeDecoder {
    fn forward(
        &self,
        z_nk: &Tensor,
        feature_shape: &[usize],
        dataset: Option<usize>,
    ) -> Result<Tensor> {
        let h = leaky_relu().forward(&self.fc.forward(z_nk)?)?;

        let mut dims = Vec::with_capacity(feature_shape.len() + 1);
        dims.push(z_nk.dim(0)?);
        dims.extend_from_slice(feature_shape);

        let h = self.deconv.forward(&h.reshape(dims)?)?;
        self.output_layer.forward_dataset(&h, dataset)
    }

    fn dim_latent(&self) -> usize {
        self.n_latents
    }
}

impl ConvVaeDecoder {
    /// Will create a new convolutional decoder with these variables:
    ///
    /// * `nn.dec.fc.weight`
    /// * `nn.dec.deconv.{j}.weight` where {j} is the mirrored encoder layer
    /// * `nn.dec.out.{d}.weight` where {d} is the dataset index
    pub fn new(arch: &ConvArchitecture, vs: VarBuilder) -> Result<Self> {
        let (shapes, output_padding) = arch.feature_shapes()?;

        // undo the j-th convolution: shapes[j + 1] -> shapes[j]
        let deconv_layer = |j: usize, vs: VarBuilder| -> Result<ConvTranspose2d> {
            let spec = &arch.layers[j];
            let config = ConvTranspose2dConfig {
                padding: spec.padding,
                output_padding: output_padding[j],
                stride: spec.stride,
                ..Default::default()
            };
            let (c_in, c_out) = (shapes[j + 1].0, shapes[j].0);
            candle_nn::conv_transpose2d(c_in, c_out, spec.kernel_size, config, vs)
        };

        let &(c, h, w) = shapes.last().unwrap_or(&(0, 0, 0));
        let fc = candle_nn::linear(arch.n_latents, c * h * w, vs.pp("nn.dec.fc"))?;

        let mut deconv = StackLayers::<ConvTranspose2d>::new();
        for j in (1..arch.layers.len()).rev() {
            let _name = format!("nn.dec.deconv.{}", j);
            deconv.push_with_act(deconv_layer(j, vs.pp(_name))?, leaky_relu());
        }

        let output_layer = if arch.n_datasets > 1 {
            let layers = (0..arch.n_datasets)
                .map(|d| deconv_layer(0, vs.pp(format!("nn.dec.out.{}", d))))
                .collect::<Result<Vec<_>>>()?;
            DatasetLayers::new(layers, Some(Activation::Sigmoid))
        } else {
            DatasetLayers::new(
                vec![deconv_layer(0, vs.pp("nn.dec.out"))?],
                Some(Activation::Sigmoid),
            )
        };

        Ok(Self {
            n_latents: arch.n_latents,
            fc,
            deconv,
            output_layer,
        })
    }
}
