use approx::assert_abs_diff_eq;
use candle_vaegan::candle_core::{DType, Device, Result, Tensor};
use candle_vaegan::candle_inference::{ConvLayerSpec, VaeGanConfig};
use candle_vaegan::candle_loss_functions::{gaussian_ll, mse};
use candle_vaegan::candle_nn::{AdamW, VarMap};
use candle_vaegan::candle_vae_inference::{Batch, LossOptions, VaeGan};

fn small_config() -> VaeGanConfig {
    VaeGanConfig {
        model_type: "conv".to_string(),
        n_ae_latents: 3,
        beta: 2.0,
        beta_anneal_epochs: 4,
        max_n_epochs: 6,
        n_input_channels: 1,
        y_pixels: 8,
        x_pixels: 8,
        layers: vec![ConvLayerSpec::new(4, 4, 2, 1), ConvLayerSpec::new(6, 4, 2, 1)],
        n_datasets: 1,
    }
}

fn build(config: &VaeGanConfig) -> anyhow::Result<(VaeGan, VarMap)> {
    let varmap = VarMap::new();
    let model = VaeGan::from_config(config, &varmap, DType::F64, &Device::Cpu)?;
    Ok((model, varmap))
}

fn frames(n: usize) -> Result<Tensor> {
    Tensor::rand(0f64, 1., (n, 1, 8, 8), &Device::Cpu)
}

/// frame f hides row f % 8 and the first f columns
fn frame_masks(n: usize) -> Result<Tensor> {
    let mut data = Vec::with_capacity(n * 64);
    for f in 0..n {
        for r in 0..8 {
            for c in 0..8 {
                let hidden = r == f % 8 || c < f;
                data.push(if hidden { 0_f64 } else { 1. });
            }
        }
    }
    Tensor::from_vec(data, (n, 1, 8, 8), &Device::Cpu)
}

fn eval_opts(chunk_size: usize) -> LossOptions {
    LossOptions {
        epoch: 6,
        chunk_size,
        accumulate_grad: false,
        use_mean: true,
        ..Default::default()
    }
}

#[test]
fn chunking_does_not_change_the_loss() -> anyhow::Result<()> {
    let (model, _) = build(&small_config())?;
    let batch = Batch::new(frames(7)?);

    let single = LossOptions {
        epoch: 5,
        chunk_size: 200,
        accumulate_grad: false,
        use_mean: true,
        ..Default::default()
    };
    let many = LossOptions {
        chunk_size: 1,
        ..single.clone()
    };
    let uneven = LossOptions {
        chunk_size: 3,
        ..single.clone()
    };

    let a = model.loss(&batch, &single)?;
    let b = model.loss(&batch, &many)?;
    let c = model.loss(&batch, &uneven)?;

    for other in [&b, &c] {
        assert_abs_diff_eq!(a.loss, other.loss, epsilon = 1e-9);
        assert_abs_diff_eq!(a.loss_ll, other.loss_ll, epsilon = 1e-9);
        assert_abs_diff_eq!(a.loss_kl, other.loss_kl, epsilon = 1e-9);
        assert_abs_diff_eq!(a.loss_mse, other.loss_mse, epsilon = 1e-9);
    }
    assert!(a.grads.is_none());
    Ok(())
}

#[test]
fn loss_combines_likelihood_and_weighted_kl() -> anyhow::Result<()> {
    let (model, _) = build(&small_config())?;
    let x = frames(5)?;
    let batch = Batch::new(x.clone());
    let opts = LossOptions {
        epoch: 1,
        accumulate_grad: false,
        use_mean: true,
        ..Default::default()
    };
    let out = model.loss(&batch, &opts)?;

    assert_abs_diff_eq!(out.beta, 2.0 / 3.0, epsilon = 1e-12);
    assert_abs_diff_eq!(out.loss, -out.loss_ll + out.beta * out.loss_kl, epsilon = 1e-9);

    let recon = model.forward(&x, None, true)?.recon;
    let direct = mse(&x, &recon, None)?.to_scalar::<f64>()?;
    assert_abs_diff_eq!(out.loss_mse, direct, epsilon = 1e-9);

    let names: Vec<&str> = out.entries().iter().map(|(k, _)| *k).collect();
    assert_eq!(names, vec!["loss", "loss_ll", "loss_kl", "loss_mse", "beta"]);
    Ok(())
}

#[test]
fn all_ones_mask_matches_unmasked_loss() -> anyhow::Result<()> {
    let (model, _) = build(&small_config())?;
    let x = frames(4)?;
    let opts = LossOptions {
        epoch: 6,
        chunk_size: 3,
        accumulate_grad: false,
        use_mean: true,
        ..Default::default()
    };
    let plain = model.loss(&Batch::new(x.clone()), &opts)?;
    let masked = model.loss(&Batch::with_mask(x.clone(), x.ones_like()?), &opts)?;
    assert_abs_diff_eq!(plain.loss, masked.loss, epsilon = 1e-9);
    Ok(())
}

#[test]
fn per_frame_mask_stays_aligned_with_chunks() -> anyhow::Result<()> {
    let (model, _) = build(&small_config())?;
    let x = frames(5)?;
    let mask = frame_masks(5)?;
    let batch = Batch::with_mask(x.clone(), mask.clone());

    let whole = model.loss(&batch, &eval_opts(200))?;
    let single = model.loss(&batch, &eval_opts(1))?;
    let uneven = model.loss(&batch, &eval_opts(2))?;
    assert_abs_diff_eq!(whole.loss_ll, single.loss_ll, epsilon = 1e-9);
    assert_abs_diff_eq!(whole.loss_ll, uneven.loss_ll, epsilon = 1e-9);

    let recon = model.forward(&x, None, true)?.recon;
    let direct = gaussian_ll(&x, &recon, Some(&mask), 1.)?.to_scalar::<f64>()?;
    assert_abs_diff_eq!(single.loss_ll, direct, epsilon = 1e-9);

    // hidden pixels no longer count against the likelihood
    let plain = model.loss(&Batch::new(x), &eval_opts(1))?;
    assert!(single.loss_ll > plain.loss_ll);
    Ok(())
}

#[test]
fn shared_mask_applies_to_every_chunk() -> anyhow::Result<()> {
    let (model, _) = build(&small_config())?;
    let x = frames(5)?;
    // (1, 8, 8): no frame axis
    let shared = frame_masks(3)?.narrow(0, 2, 1)?.squeeze(0)?;
    let batch = Batch::with_mask(x.clone(), shared.clone());

    let whole = model.loss(&batch, &eval_opts(200))?;
    let chunked = model.loss(&batch, &eval_opts(2))?;
    assert_abs_diff_eq!(whole.loss_ll, chunked.loss_ll, epsilon = 1e-9);

    let recon = model.forward(&x, None, true)?.recon;
    let direct = gaussian_ll(&x, &recon, Some(&shared), 1.)?.to_scalar::<f64>()?;
    assert_abs_diff_eq!(chunked.loss_ll, direct, epsilon = 1e-9);
    Ok(())
}

#[test]
fn accumulated_gradients_cover_only_variables() -> anyhow::Result<()> {
    let (model, varmap) = build(&small_config())?;
    let opts = LossOptions {
        epoch: 6,
        chunk_size: 2,
        use_mean: true,
        ..Default::default()
    };
    let grads = model.loss(&Batch::new(frames(6)?), &opts)?.grads.expect("gradients");

    let vars = varmap.all_vars();
    assert_eq!(grads.get_ids().count(), vars.len());
    for var in vars.iter() {
        assert!(grads.get(var.as_tensor()).is_some());
    }
    Ok(())
}

#[test]
fn mean_codes_do_not_depend_on_sampling() -> anyhow::Result<()> {
    let (model, _) = build(&small_config())?;
    let x = frames(4)?;

    let a = model.forward(&x, None, true)?;
    let b = model.forward(&x, None, true)?;
    let diff = a.recon.sub(&b.recon)?.abs()?.max_all()?.to_scalar::<f64>()?;
    assert_eq!(diff, 0.);

    let kl_a = model.decomposed_kl(&x, None, true)?.total()?.to_scalar::<f64>()?;
    let kl_b = model.decomposed_kl(&x, None, true)?.total()?.to_scalar::<f64>()?;
    assert_eq!(kl_a, kl_b);
    Ok(())
}

#[test]
fn chunk_gradients_are_summed() -> anyhow::Result<()> {
    let (model, varmap) = build(&small_config())?;
    let x = frames(1)?;
    let batch = Batch::new(Tensor::cat(&[&x, &x], 0)?);

    let whole = LossOptions {
        epoch: 6,
        chunk_size: 2,
        use_mean: true,
        ..Default::default()
    };
    let halves = LossOptions {
        chunk_size: 1,
        ..whole.clone()
    };

    let g_whole = model.loss(&batch, &whole)?.grads.expect("gradients");
    let g_halves = model.loss(&batch, &halves)?.grads.expect("gradients");

    for var in varmap.all_vars() {
        let a = g_whole.get(var.as_tensor()).expect("whole-batch gradient");
        let b = g_halves.get(var.as_tensor()).expect("chunked gradient");
        // two identical chunks, each contributing the gradient of its own mean
        let diff = (a * 2.0)?.sub(b)?.abs()?.max_all()?.to_scalar::<f64>()?;
        assert!(diff < 1e-8, "gradient mismatch {}", diff);
    }
    Ok(())
}

#[test]
fn train_step_updates_parameters() -> anyhow::Result<()> {
    let (model, varmap) = build(&small_config())?;
    let batch = Batch::new(frames(6)?);

    let before = varmap
        .all_vars()
        .iter()
        .map(|v| v.as_tensor().copy())
        .collect::<Result<Vec<_>>>()?;

    let mut adam = AdamW::new_lr(varmap.all_vars(), 1e-2)?;
    let opts = LossOptions {
        epoch: 6,
        chunk_size: 4,
        ..Default::default()
    };
    let out = model.train_step(&batch, &opts, &mut adam)?;
    assert!(out.loss.is_finite());

    let changed = varmap
        .all_vars()
        .iter()
        .zip(before.iter())
        .map(|(v, b)| -> Result<f64> {
            v.as_tensor().sub(b)?.abs()?.max_all()?.to_scalar::<f64>()
        })
        .collect::<Result<Vec<_>>>()?;
    assert!(changed.iter().any(|&d| d > 0.));
    Ok(())
}

#[test]
fn linear_model_type_is_not_implemented() {
    let config = VaeGanConfig {
        model_type: "linear".to_string(),
        ..small_config()
    };
    let err = build(&config).err().expect("linear must be rejected");
    assert!(err.to_string().contains("not implemented"));
}

#[test]
fn unknown_model_type_is_rejected() {
    let config = VaeGanConfig {
        model_type: "transformer".to_string(),
        ..small_config()
    };
    let err = build(&config).err().expect("unknown model type must be rejected");
    assert!(err.to_string().contains("invalid model_type"));
}

#[test]
fn epoch_beyond_schedule_is_an_error() -> anyhow::Result<()> {
    let (model, _) = build(&small_config())?;
    assert_eq!(model.beta_schedule().len(), 4 + 7);
    let opts = LossOptions {
        epoch: 11,
        accumulate_grad: false,
        ..Default::default()
    };
    assert!(model.loss(&Batch::new(frames(2)?), &opts).is_err());
    Ok(())
}

#[test]
fn dataset_specific_layers() -> anyhow::Result<()> {
    let config = VaeGanConfig {
        n_datasets: 2,
        ..small_config()
    };
    let (model, _) = build(&config)?;
    let batch = Batch::new(frames(3)?);
    let mut opts = LossOptions {
        epoch: 0,
        dataset: Some(1),
        accumulate_grad: false,
        ..Default::default()
    };
    assert!(model.loss(&batch, &opts)?.loss.is_finite());
    opts.dataset = Some(2);
    assert!(model.loss(&batch, &opts).is_err());
    Ok(())
}

#[test]
fn decomposition_of_model_latents_adds_up() -> anyhow::Result<()> {
    let (model, _) = build(&small_config())?;
    let kl = model.decomposed_kl(&frames(5)?, None, false)?;
    let total = kl.total()?.to_scalar::<f64>()?;
    let parts = kl.index_code_mi.to_scalar::<f64>()?
        + kl.total_correlation.to_scalar::<f64>()?
        + kl.dimension_wise_kl.to_scalar::<f64>()?;
    assert_abs_diff_eq!(total, parts, epsilon = 1e-9);
    Ok(())
}
