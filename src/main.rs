use std::{fs, path::PathBuf};

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, ValueEnum};

use facefit::batch::run_batch;
use facefit::export::ExportOptions;
use facefit::model::linear::{LinearModel, LinearModelData};
use facefit::model::ModelVariant;
use facefit::track::FitConfig;

/// Fit a 3D morphable face model to video sequences.
#[derive(Parser)]
#[command(name = "facefit", version)]
struct Args {
    /// Sequence directory (or, with --batch, a directory containing many sequence directories).
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory.
    #[arg(short, long, default_value = "facefit-out")]
    output: PathBuf,

    /// Model data file. A small built-in synthetic model is used when omitted.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Model variant.
    #[arg(long, value_enum, default_value = "full")]
    variant: VariantArg,

    /// Side length of the square fitting/rendering window.
    #[arg(long, default_value_t = 512)]
    tar_size: u32,

    /// Landmark-fitting iterations for the first frame.
    #[arg(long, default_value_t = 500)]
    first_rf_iters: u32,

    /// Differentiable-rendering iterations for the first frame.
    #[arg(long, default_value_t = 300)]
    first_nrf_iters: u32,

    /// Landmark-fitting iterations for the remaining frames.
    #[arg(long, default_value_t = 50)]
    rest_rf_iters: u32,

    /// Differentiable-rendering iterations for the remaining frames.
    #[arg(long, default_value_t = 30)]
    rest_nrf_iters: u32,

    /// Learning rate for landmark fitting.
    #[arg(long, default_value_t = 1e-2)]
    rf_lr: f32,

    /// Learning rate for differentiable fitting.
    #[arg(long, default_value_t = 1e-2)]
    nrf_lr: f32,

    /// Weight for the landmark loss.
    #[arg(long, default_value_t = 3e3)]
    lm_loss_w: f32,

    /// Weight for the photometric loss.
    #[arg(long, default_value_t = 1.6)]
    rgb_loss_w: f32,

    /// Weight for the identity coefficient regularizer.
    #[arg(long, default_value_t = 1e-3)]
    id_reg_w: f32,

    /// Weight for the expression coefficient regularizer.
    #[arg(long, default_value_t = 1.5e-4)]
    exp_reg_w: f32,

    /// Weight for the texture coefficient regularizer.
    #[arg(long, default_value_t = 3e-4)]
    tex_reg_w: f32,

    /// Weight for the texture reflectance loss.
    #[arg(long, default_value_t = 1.0)]
    tex_w: f32,

    /// Save a per-frame mesh.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    save_ply: bool,

    /// Save per-frame coefficients.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    save_coeffs: bool,

    /// Override the model variant's negative-expression clamp policy.
    #[arg(long)]
    expression_clamp: Option<bool>,

    /// Process every subdirectory of the input as its own sequence, continuing past failures.
    #[arg(long)]
    batch: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VariantArg {
    Full,
    Simplified,
}

impl From<VariantArg> for ModelVariant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Full => ModelVariant::Full,
            VariantArg::Simplified => ModelVariant::Simplified,
        }
    }
}

fn main() -> anyhow::Result<()> {
    facefit::init_logger!();
    let args = Args::parse();

    let variant = ModelVariant::from(args.variant);
    let data = match &args.model {
        Some(path) => {
            let data = LinearModelData::load(path)
                .with_context(|| format!("failed to load model data from {}", path.display()))?;
            if data.variant != variant {
                bail!(
                    "model file is a {:?} model but --variant {:?} was requested",
                    data.variant,
                    variant,
                );
            }
            data
        }
        None => {
            log::info!("no --model given, using the built-in synthetic model");
            LinearModelData::synthetic(variant)
        }
    };

    let cfg = FitConfig {
        tar_size: args.tar_size,
        first_rigid_iters: args.first_rf_iters,
        first_nonrigid_iters: args.first_nrf_iters,
        rigid_iters: args.rest_rf_iters,
        nonrigid_iters: args.rest_nrf_iters,
        rigid_lr: args.rf_lr,
        nonrigid_lr: args.nrf_lr,
        lm_weight: args.lm_loss_w,
        rgb_weight: args.rgb_loss_w,
        id_reg_weight: args.id_reg_w,
        exp_reg_weight: args.exp_reg_w,
        tex_reg_weight: args.tex_reg_w,
        reflect_weight: args.tex_w,
        expression_clamp: args.expression_clamp,
    };
    let opts = ExportOptions {
        meshes: args.save_ply,
        coeffs: args.save_coeffs,
    };

    let sequences = if args.batch {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&args.input)
            .with_context(|| format!("failed to list {}", args.input.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        if dirs.is_empty() {
            bail!("{} contains no sequence directories", args.input.display());
        }
        dirs
    } else {
        vec![args.input.clone()]
    };

    let report = run_batch(
        &sequences,
        || {
            LinearModel::new(data.clone(), args.tar_size)
                .expect("model data was validated on load")
        },
        &cfg,
        opts,
        &args.output,
    );
    report.log();

    // A failing sequence aborts a single-sequence run but not a batch.
    if !args.batch {
        if let Some((_, err)) = report.failures.into_iter().next() {
            return Err(err.into());
        }
    }
    Ok(())
}
