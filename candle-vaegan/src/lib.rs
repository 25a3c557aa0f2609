pub mod candle_aux_layers;
pub mod candle_beta_schedule;
pub mod candle_conv_decoder;
pub mod candle_conv_encoder;
pub mod candle_inference;
pub mod candle_kl_decomposition;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_vae_inference;
pub mod cli;

pub use candle_core;
pub use candle_nn;
