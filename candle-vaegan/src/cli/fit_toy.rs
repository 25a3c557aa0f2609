use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, VarMap};
use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

use crate::candle_inference::{ConvLayerSpec, TrainConfig, VaeGanConfig, DEFAULT_CHUNK_SIZE};
use crate::candle_vae_inference::{Batch, LossOptions, VaeGan};

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct FitToyArgs {
    #[arg(long, default_value_t = 512, help = "Number of generated frames")]
    pub n_frames: usize,

    #[arg(long, default_value_t = 16, help = "Frame height and width in pixels")]
    pub pixels: usize,

    #[arg(short = 'k', long, default_value_t = 4, help = "Number of latent dimensions")]
    pub latents: usize,

    #[arg(long, default_value_t = 1.0, help = "Weight of the KL term after annealing")]
    pub beta: f64,

    #[arg(
        long,
        default_value_t = 0,
        help = "Epochs of linear KL warm-up",
        long_help = "Epochs of linear KL warm-up.\n\
		     The KL weight grows linearly from 0 to `beta`\n\
		     over this many epochs (0: no warm-up)."
    )]
    pub anneal_epochs: usize,

    #[arg(short = 'i', long, default_value_t = 50)]
    pub epochs: usize,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    #[arg(
        long,
        default_value_t = DEFAULT_CHUNK_SIZE,
        help = "Frames per forward pass",
        long_help = "Frames per forward pass.\n\
		     Each minibatch is split into chunks of this size;\n\
		     gradients are accumulated across chunks."
    )]
    pub chunk_size: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub learning_rate: f32,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, value_enum, default_value = "cpu")]
    pub device: ComputeDevice,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Frames with one Gaussian blob at a random position
fn simulate_blobs(n: usize, pixels: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0_f32, 0.02)?;
    let width = pixels as f32 / 6.;

    let mut data = Vec::with_capacity(n * pixels * pixels);
    for _ in 0..n {
        let cy = rng.random_range(0.0..pixels as f32);
        let cx = rng.random_range(0.0..pixels as f32);
        for y in 0..pixels {
            for x in 0..pixels {
                let d2 = (y as f32 - cy).powi(2) + (x as f32 - cx).powi(2);
                let v = (-0.5 * d2 / (width * width)).exp() + rng.sample(noise);
                data.push(v.clamp(0., 1.));
            }
        }
    }
    Ok(Tensor::from_vec(data, (n, 1, pixels, pixels), device)?)
}

pub fn run(args: &FitToyArgs) -> Result<()> {
    if args.n_frames == 0 {
        anyhow::bail!("need at least one frame");
    }
    if args.pixels == 0 {
        anyhow::bail!("frames need at least one pixel");
    }

    let device = match args.device {
        ComputeDevice::Metal => Device::new_metal(0)?,
        ComputeDevice::Cuda => Device::new_cuda(0)?,
        _ => Device::Cpu,
    };

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.batch_size.max(1),
        num_epochs: args.epochs,
        chunk_size: args.chunk_size,
        device,
        verbose: args.verbose,
        show_progress: true,
    };

    let config = VaeGanConfig {
        model_type: "conv".to_string(),
        n_ae_latents: args.latents,
        beta: args.beta,
        beta_anneal_epochs: args.anneal_epochs,
        max_n_epochs: args.epochs,
        n_input_channels: 1,
        y_pixels: args.pixels,
        x_pixels: args.pixels,
        layers: vec![ConvLayerSpec::new(8, 4, 2, 1), ConvLayerSpec::new(16, 4, 2, 1)],
        n_datasets: 1,
    };

    info!("Simulating {} frames of {}x{} pixels", args.n_frames, args.pixels, args.pixels);
    let images = simulate_blobs(args.n_frames, args.pixels, args.seed, &train_config.device)?;

    let parameters = VarMap::new();
    let model = VaeGan::from_config(&config, &parameters, DType::F32, &train_config.device)?;

    let trace = train(&model, &parameters, &images, &train_config)?;
    if let Some(last) = trace.last() {
        info!("final loss: {:.4}", last);
    }

    let n_probe = args.n_frames.min(train_config.batch_size);
    let kl = model.decomposed_kl(&images.narrow(0, 0, n_probe)?, None, false)?;
    info!(
        "KL decomposition: index-code MI = {:.4}, total correlation = {:.4}, dimension-wise KL = {:.4}",
        kl.index_code_mi.to_scalar::<f32>()?,
        kl.total_correlation.to_scalar::<f32>()?,
        kl.dimension_wise_kl.to_scalar::<f32>()?
    );

    info!("Done");
    Ok(())
}

fn train(
    model: &VaeGan,
    parameters: &VarMap,
    images: &Tensor,
    train_config: &TrainConfig,
) -> Result<Vec<f64>> {
    let mut adam = AdamW::new_lr(parameters.all_vars(), train_config.learning_rate.into())?;

    let pb = ProgressBar::new(train_config.num_epochs as u64);

    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let n_frames = images.dim(0)?;
    let num_minibatches = n_frames.div_ceil(train_config.batch_size);
    let mut loss_trace = Vec::with_capacity(train_config.num_epochs);

    info!("Start training VAE...");

    for epoch in 0..train_config.num_epochs {
        let opts = LossOptions {
            chunk_size: train_config.chunk_size,
            ..LossOptions::at_epoch(epoch)
        };

        let mut loss_tot = 0_f64;
        let mut mse_tot = 0_f64;
        let mut beta = 0_f64;

        for b in 0..num_minibatches {
            let lb = b * train_config.batch_size;
            let size = train_config.batch_size.min(n_frames - lb);
            let batch = Batch::new(images.narrow(0, lb, size)?);

            let out = model.train_step(&batch, &opts, &mut adam)?;
            loss_tot += out.loss;
            mse_tot += out.loss_mse;
            beta = out.beta;
        }

        loss_trace.push(loss_tot / num_minibatches as f64);
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}] loss = {:.4}, mse = {:.5}, beta = {:.3}",
                epoch + 1,
                loss_tot / num_minibatches as f64,
                mse_tot / num_minibatches as f64,
                beta
            );
        }
    }

    pb.finish_and_clear();
    info!("done model training");
    Ok(loss_trace)
}
