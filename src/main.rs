//! nervus CLI
//!
//! Builds and trains multi-task clinical models from a TOML config.

#![recursion_limit = "256"]

use clap::{Parser, Subcommand};
use nervus::{Config, Result};

#[derive(Parser)]
#[command(name = "nervus")]
#[command(about = "Multi-task clinical outcome prediction", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Use the wgpu backend instead of ndarray
    #[arg(long)]
    gpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a default configuration file
    Init,
    /// Build the configured model and show its heads
    Inspect,
    /// Train on seeded synthetic data and write weights and learning curves
    DryRun {
        /// Number of synthetic samples
        #[arg(long, default_value = "128")]
        samples: usize,
        /// Override number of epochs
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Write per-sample likelihoods of trained weights and report AUC
    Evaluate {
        /// Weight file (defaults to the best weights of the latest run)
        #[arg(long)]
        weights: Option<String>,
        /// Number of synthetic samples
        #[arg(long, default_value = "128")]
        samples: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    let config = if std::path::Path::new(&cli.config).exists() {
        match Config::load(&cli.config) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    let result = match cli.command {
        Commands::Init => commands::init(&cli.config),
        Commands::Inspect => {
            if cli.gpu {
                commands::inspect::<burn::backend::Wgpu<f32, i32>>(
                    &config,
                    &burn::backend::wgpu::WgpuDevice::default(),
                )
            } else {
                commands::inspect::<burn::backend::NdArray<f32>>(&config, &Default::default())
            }
        }
        Commands::DryRun { samples, epochs } => {
            use burn::backend::{Autodiff, NdArray, Wgpu};

            if cli.gpu {
                commands::dry_run::<Autodiff<Wgpu<f32, i32>>>(
                    &config,
                    samples,
                    epochs,
                    burn::backend::wgpu::WgpuDevice::default(),
                )
            } else {
                commands::dry_run::<Autodiff<NdArray<f32>>>(
                    &config,
                    samples,
                    epochs,
                    Default::default(),
                )
            }
        }
        Commands::Evaluate { weights, samples } => {
            if cli.gpu {
                commands::evaluate::<burn::backend::Wgpu<f32, i32>>(
                    &config,
                    weights.as_deref(),
                    samples,
                    burn::backend::wgpu::WgpuDevice::default(),
                )
            } else {
                commands::evaluate::<burn::backend::NdArray<f32>>(
                    &config,
                    weights.as_deref(),
                    samples,
                    Default::default(),
                )
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

mod commands {
    use super::*;
    use burn::data::dataset::Dataset;
    use burn::module::{AutodiffModule, Module};
    use burn::tensor::backend::{AutodiffBackend, Backend};
    use nervus::data::{synthetic_samples, ClinicalDataset, SyntheticConfig};
    use nervus::model::{build_model, ClinicalModel, ImageShape, ModelSpec};
    use nervus::predict::{Likelihood, Predictor, Split};
    use nervus::training::{RunDir, Trainer, TrainerSettings};
    use nervus::NervusError;
    use std::path::{Path, PathBuf};

    /// Share of synthetic samples used for training
    const TRAIN_RATIO: f32 = 0.8;

    pub fn init(config_path: &str) -> Result<()> {
        let config = Config::default();
        config.save(config_path)?;
        println!("Created default config at {}", config_path);

        std::fs::create_dir_all(&config.output.results_dir)?;
        println!("Created {}/ directory", config.output.results_dir);

        println!("\nNext steps:");
        println!("  1. Edit {} to set the labels and model", config_path);
        println!("  2. Run 'nervus inspect' to check the model heads");
        println!("  3. Run 'nervus dry-run' to train on synthetic data");

        Ok(())
    }

    fn image_shape(config: &Config) -> ImageShape {
        ImageShape {
            channels: config.model.in_channel,
            size: config.model.image_size,
        }
    }

    fn model_from_config<B: Backend>(
        config: &Config,
        device: &B::Device,
    ) -> Result<(ModelSpec, ClinicalModel<B>)> {
        let spec = ModelSpec::parse(&config.model.model)?;
        let model = build_model(
            device,
            config.task.kind,
            &spec,
            &config.task.labels,
            config.model.num_inputs,
            image_shape(config),
        )?;
        Ok((spec, model))
    }

    /// Seeded synthetic samples shaped for the configured model
    fn synthetic_dataset(
        config: &Config,
        spec: &ModelSpec,
        samples: usize,
        seed: u64,
    ) -> Result<ClinicalDataset> {
        let synthetic = SyntheticConfig {
            num_samples: samples,
            num_inputs: if spec.mlp { config.model.num_inputs } else { 0 },
            image: spec.net.map(|_| image_shape(config)),
            kind: config.task.kind,
            seed,
        };
        ClinicalDataset::new(
            synthetic_samples(&synthetic, &config.task.labels),
            &config.task.labels,
        )
    }

    /// Predict every split, save `likelihood_<run>.csv` and print the AUCs
    fn export_likelihood<B: Backend>(
        predictor: &Predictor<B>,
        config: &Config,
        splits: &[(Split, &ClinicalDataset)],
        run: &RunDir,
    ) -> Result<PathBuf> {
        let mut likelihood = Likelihood::new(config.task.kind, &config.task.labels);
        for (split, dataset) in splits {
            likelihood.extend(predictor.predict(dataset, *split)?);
        }
        let file = run.likelihoods().join(format!("likelihood_{}.csv", run.name()));
        let path = likelihood.save(&file)?;

        for task in likelihood.binary_tasks() {
            for (split, _) in splits {
                match likelihood.roc(task, *split)? {
                    Some(roc) => println!("  {} {} AUC: {:.3}", task, split, roc.auc),
                    None => println!("  {} {} AUC: n/a (single class)", task, split),
                }
            }
        }
        Ok(path)
    }

    pub fn inspect<B: Backend>(config: &Config, device: &B::Device) -> Result<()> {
        let settings = TrainerSettings::from_config(config)?;
        let (spec, model) = model_from_config::<B>(config, device)?;

        println!("Model");
        println!("───────────────────────────────");
        println!("  Model:       {}", spec);
        println!("  Task:        {}", config.task.kind);
        println!("  Criterion:   {}", settings.criterion);
        println!("  Optimizer:   {}", settings.optimizer);
        println!("  Save weight: {}", settings.save_weight);
        println!("  Parameters:  {}", model.num_params());
        println!("  Heads:");
        for head in model.head_names() {
            println!("    {}", head);
        }

        Ok(())
    }

    pub fn dry_run<B: AutodiffBackend>(
        config: &Config,
        samples: usize,
        epochs: Option<usize>,
        device: B::Device,
    ) -> Result<()> {
        let mut config = config.clone();
        if let Some(e) = epochs {
            config.training.epochs = e;
        }

        let settings = TrainerSettings::from_config(&config)?;
        let batch_size = settings.batch_size;
        let (spec, model) = model_from_config::<B>(&config, &device)?;
        let shape = image_shape(&config);

        let dataset = synthetic_dataset(&config, &spec, samples, config.training.seed)?;
        let (train_dataset, val_dataset) = dataset.split(TRAIN_RATIO, config.training.seed);
        log::info!(
            "Synthetic data: {} train, {} val samples",
            train_dataset.len(),
            val_dataset.len()
        );

        let run = RunDir::create(Path::new(&config.output.results_dir))?;
        log::info!("Results in {}", run.root().display());

        let trainer = Trainer::new(
            model,
            settings,
            config.task.labels.clone(),
            shape,
            device.clone(),
        )
        .with_weights_dir(run.weights());
        let outcome = trainer.train(train_dataset, val_dataset.clone())?;
        outcome.save(&run)?;

        println!("\nDry run complete!");
        if let Some(epoch) = outcome.losses.total().display_best_epoch() {
            println!("  Best epoch:     {}", epoch);
        }
        if let Some(loss) = outcome.losses.total().best_val_loss() {
            println!("  Best val loss:  {:.4}", loss);
        }

        let best = outcome
            .best
            .into_model()
            .ok_or_else(|| NervusError::MissingData("no best model kept".to_string()))?;
        let predictor = Predictor::<B::InnerBackend>::new(
            best.valid(),
            config.task.kind,
            config.task.labels.clone(),
            shape,
            batch_size,
            device,
        )?;
        let validation = [(Split::Validation, &val_dataset)];
        let path = export_likelihood(&predictor, &config, &validation, &run)?;
        println!("  Likelihood:     {}", path.display());
        println!("  Results:        {}", run.root().display());

        Ok(())
    }

    /// Score saved weights on regenerated synthetic data. The validation
    /// split matches the one `dry-run` trained with; the test set uses the
    /// next seed.
    pub fn evaluate<B: Backend>(
        config: &Config,
        weights: Option<&str>,
        samples: usize,
        device: B::Device,
    ) -> Result<()> {
        let settings = TrainerSettings::from_config(config)?;
        let (spec, model) = model_from_config::<B>(config, &device)?;
        let seed = config.training.seed;

        let run = match weights {
            Some(_) => RunDir::create(Path::new(&config.output.results_dir))?,
            None => RunDir::latest(Path::new(&config.output.results_dir))?,
        };
        let weights = match weights {
            Some(path) => PathBuf::from(path),
            None => run.best_weights()?,
        };

        let predictor = Predictor::load(
            model,
            &weights,
            config.task.kind,
            config.task.labels.clone(),
            image_shape(config),
            settings.batch_size,
            device,
        )?;

        let (train_dataset, val_dataset) =
            synthetic_dataset(config, &spec, samples, seed)?.split(TRAIN_RATIO, seed);
        let test_dataset = synthetic_dataset(config, &spec, samples, seed.wrapping_add(1))?;
        log::info!(
            "Evaluating {} on {} train, {} val, {} test samples",
            weights.display(),
            train_dataset.len(),
            val_dataset.len(),
            test_dataset.len()
        );

        println!("Evaluation");
        println!("───────────────────────────────");
        let path = export_likelihood(
            &predictor,
            config,
            &[
                (Split::Train, &train_dataset),
                (Split::Validation, &val_dataset),
                (Split::Test, &test_dataset),
            ],
            &run,
        )?;
        println!("  Likelihood: {}", path.display());

        Ok(())
    }
}
