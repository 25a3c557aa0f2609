use candle_core::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const DEFAULT_CHUNK_SIZE: usize = 200;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub chunk_size: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum ModelType {
    Conv,
    Linear,
}

impl FromStr for ModelType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "conv" => Ok(ModelType::Conv),
            "linear" => Ok(ModelType::Linear),
            _ => Err(anyhow::anyhow!("\"{}\" is an invalid model_type", s)),
        }
    }
}

/// One convolution of the encoder; the decoder mirrors it with a
/// transposed convolution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvLayerSpec {
    pub n_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvLayerSpec {
    pub fn new(n_channels: usize, kernel_size: usize, stride: usize, padding: usize) -> Self {
        Self {
            n_channels,
            kernel_size,
            stride,
            padding,
        }
    }

    /// spatial size after this convolution and the remainder the
    /// transposed convolution has to pad back
    fn conv_out(&self, size: usize) -> Result<(usize, usize)> {
        if self.stride == 0 || self.kernel_size == 0 {
            candle_core::bail!("kernel size and stride must be positive: {:?}", self);
        }
        let padded = size + 2 * self.padding;
        if padded < self.kernel_size {
            candle_core::bail!(
                "kernel {} does not fit a padded input of size {}",
                self.kernel_size,
                padded
            );
        }
        let span = padded - self.kernel_size;
        Ok((span / self.stride + 1, span % self.stride))
    }
}

/// Geometry of a convolutional encoder/decoder pair
#[derive(Clone, Debug)]
pub struct ConvArchitecture {
    pub n_input_channels: usize,
    pub y_pixels: usize,
    pub x_pixels: usize,
    pub n_latents: usize,
    pub layers: Vec<ConvLayerSpec>,
    pub n_datasets: usize,
}

/// (channels, height, width) of one feature map
pub type FeatureShape = (usize, usize, usize);

impl ConvArchitecture {
    /// Feature map shapes from the input image to the last
    /// convolution, and the output padding each transposed
    /// convolution needs to restore its input size
    pub fn feature_shapes(&self) -> Result<(Vec<FeatureShape>, Vec<usize>)> {
        if self.layers.is_empty() {
            candle_core::bail!("need at least one convolution layer");
        }

        let (mut h, mut w) = (self.y_pixels, self.x_pixels);
        let mut shapes = vec![(self.n_input_channels, h, w)];
        let mut output_padding = Vec::with_capacity(self.layers.len());

        for (j, layer) in self.layers.iter().enumerate() {
            let (h_out, h_rem) = layer.conv_out(h)?;
            let (w_out, w_rem) = layer.conv_out(w)?;
            if h_rem != w_rem {
                candle_core::bail!(
                    "layer {}: rows and columns need different output padding ({} vs {})",
                    j,
                    h_rem,
                    w_rem
                );
            }
            shapes.push((layer.n_channels, h_out, w_out));
            output_padding.push(h_rem);
            (h, w) = (h_out, w_out);
        }
        Ok((shapes, output_padding))
    }

    /// number of entries in the last feature map
    pub fn dim_features(&self) -> Result<usize> {
        let (shapes, _) = self.feature_shapes()?;
        Ok(shapes.last().map(|&(c, h, w)| c * h * w).unwrap_or(0))
    }
}

fn default_beta() -> f64 {
    1.0
}

fn default_n_datasets() -> usize {
    1
}

fn default_layers() -> Vec<ConvLayerSpec> {
    vec![ConvLayerSpec::new(16, 5, 2, 2), ConvLayerSpec::new(32, 5, 2, 2)]
}

/// Hyper-parameters of the convolutional VAE-GAN
///
/// Keys follow the `ae_model.json` naming (`vae.beta`,
/// `vae.beta_anneal_epochs`, ...).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaeGanConfig {
    pub model_type: String,
    pub n_ae_latents: usize,
    #[serde(rename = "vae.beta", default = "default_beta")]
    pub beta: f64,
    #[serde(rename = "vae.beta_anneal_epochs", default)]
    pub beta_anneal_epochs: usize,
    pub max_n_epochs: usize,
    pub n_input_channels: usize,
    pub y_pixels: usize,
    pub x_pixels: usize,
    #[serde(default = "default_layers")]
    pub layers: Vec<ConvLayerSpec>,
    #[serde(default = "default_n_datasets")]
    pub n_datasets: usize,
}

impl VaeGanConfig {
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn model_type(&self) -> anyhow::Result<ModelType> {
        self.model_type.parse()
    }

    pub fn architecture(&self) -> ConvArchitecture {
        ConvArchitecture {
            n_input_channels: self.n_input_channels,
            y_pixels: self.y_pixels,
            x_pixels: self.x_pixels,
            n_latents: self.n_ae_latents,
            layers: self.layers.clone(),
            n_datasets: self.n_datasets.max(1),
        }
    }
}
