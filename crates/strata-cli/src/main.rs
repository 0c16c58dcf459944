//! strata CLI - merge pretrained model checkpoints.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use strata_merge::{
    create_merge_method, parse_kmb, run_merge_with_progress, Device, LoaderCache, LoaderOptions,
    MergeConfig, MergeMethodConfig, MergeOptions, MergePlanner, MergeProgress,
};

/// Where a resource lives.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum DeviceArg {
    /// Host memory and CPU workers
    #[default]
    Cpu,
    /// Accelerator (one merge at a time)
    Accelerator,
}

impl From<DeviceArg> for Device {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Cpu => Device::Cpu,
            DeviceArg::Accelerator => Device::Accelerator,
        }
    }
}

#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about = "Merge pretrained transformer checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Run options shared by `merge` and `plan`.
#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    /// Allow merging models of different architectures
    #[arg(long)]
    allow_architecture_mixing: bool,

    /// Where merge arithmetic runs
    #[arg(long, value_enum, default_value_t = DeviceArg::Cpu)]
    compute_device: DeviceArg,

    /// Where intermediate weights are kept
    #[arg(long, value_enum, default_value_t = DeviceArg::Cpu)]
    storage_device: DeviceArg,

    /// Maximum shard size (e.g. 5B, 500M, 64K)
    #[arg(long, default_value = "5B")]
    max_shard_size: String,

    /// Do not copy the donor tokenizer when none is built
    #[arg(long)]
    no_copy_tokenizer: bool,

    /// Copy merged weights into the writer instead of moving them
    #[arg(long)]
    clone_buffers: bool,

    /// Accept models that declare custom modelling code
    #[arg(long)]
    trust_remote_code: bool,

    /// Seed for stochastic merge methods
    #[arg(long)]
    random_seed: Option<u64>,

    /// Memory-map source weights instead of reading them up front
    #[arg(long)]
    lazy: bool,

    /// Hub download cache
    #[arg(long)]
    hub_cache: Option<PathBuf>,

    /// Cache for models with adapters merged in
    #[arg(long)]
    adapter_cache: Option<PathBuf>,

    /// Concurrent CPU merge workers
    #[arg(long)]
    cpu_workers: Option<usize>,

    /// Concurrent load/save workers
    #[arg(long, default_value = "2")]
    io_workers: usize,
}

impl RunArgs {
    fn options(&self) -> anyhow::Result<MergeOptions> {
        Ok(MergeOptions {
            allow_architecture_mixing: self.allow_architecture_mixing,
            compute_device: self.compute_device.into(),
            storage_device: self.storage_device.into(),
            max_shard_size: parse_kmb(&self.max_shard_size)?,
            copy_tokenizer: !self.no_copy_tokenizer,
            clone_buffers: self.clone_buffers,
            trust_remote_code: self.trust_remote_code,
            random_seed: self.random_seed,
            lazy_loading: self.lazy,
            hub_cache_dir: self.hub_cache.clone(),
            adapter_cache_dir: self.adapter_cache.clone(),
            cpu_workers: self.cpu_workers,
            io_workers: self.io_workers,
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Merge models as described by a YAML configuration
    Merge {
        /// Merge configuration (YAML)
        config: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Plan a merge and print what would be written, without loading weights
    Plan {
        /// Merge configuration (YAML)
        config: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// List merge methods and their parameters
    Methods,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Merge {
            config,
            output,
            run,
        } => {
            let options = run.options()?;
            let merge_config = MergeConfig::from_yaml_file(&config)?;

            println!("========================================");
            println!("  strata merge");
            println!("========================================");
            println!("Config:  {}", config.display());
            println!("Method:  {:?}", merge_config.merge_method);
            for (i, model) in merge_config.referenced_models().iter().enumerate() {
                println!("Model {}: {}", i + 1, model);
            }
            println!("Output:  {}", output.display());
            println!("========================================\n");

            let progress = ProgressBar::new(0);
            progress.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                    .progress_chars("#>-"),
            );

            let report = run_merge_with_progress(&merge_config, &output, &options, |event| {
                match event {
                    MergeProgress::Planned { weights, .. } => progress.set_length(weights as u64),
                    MergeProgress::ModelsReady { models } => {
                        progress.set_message(format!("{} models open", models))
                    }
                    MergeProgress::Saved { name, done, .. } => {
                        progress.set_position(done as u64);
                        progress.set_message(name);
                    }
                    MergeProgress::TokenizerBuilt { vocab_size } => match vocab_size {
                        Some(n) => progress.println(format!("Tokenizer built ({} tokens)", n)),
                        None => progress.println("No tokenizer available"),
                    },
                    MergeProgress::Finalized { shards } => {
                        progress.set_message(format!("{} shards written", shards))
                    }
                }
            })
            .await;
            progress.finish_and_clear();
            let report = report?;

            println!("\n========================================");
            println!("  Merge Complete!");
            println!("========================================");
            println!("Weights:    {}", report.manifest.weight_count());
            println!("Shards:     {}", report.manifest.shard_count());
            println!("Layers:     {}", report.output_layers);
            if let Some(vocab) = report.vocab_size {
                println!("Vocab size: {}", vocab);
            }
            println!("Tokenizer:  {}", if report.tokenizer_written { "yes" } else { "no" });
            println!("Output:     {}", report.out_path.display());
            println!("========================================");
        }

        Commands::Plan { config, run } => {
            let options = run.options()?;
            let merge_config = MergeConfig::from_yaml_file(&config)?;
            let loaders = LoaderCache::new(LoaderOptions::from(&options));
            let plan = MergePlanner::new(&merge_config, &options, "<dry-run>").plan(&loaders)?;

            println!("Architecture: {}", plan.arch.name());
            println!("Layers:       {}", plan.output_layers);
            println!("Weights:      {}", plan.save_tasks.len());
            println!("Tasks:        {}", plan.graph.len());
            for (i, slice) in plan.slices.iter().enumerate() {
                println!("Slice {}:", i);
                for source in &slice.sources {
                    println!(
                        "  {} layers {}..{}",
                        source.model, source.layer_range[0], source.layer_range[1]
                    );
                }
            }
            if let Some(tokenizer) = &plan.tokenizer_task {
                println!("Tokenizer:    {}", tokenizer.key());
            }
        }

        Commands::Methods => {
            for config in [
                MergeMethodConfig::Linear,
                MergeMethodConfig::Slerp,
                MergeMethodConfig::TaskArithmetic,
                MergeMethodConfig::Ties,
                MergeMethodConfig::DareTies,
                MergeMethodConfig::DareLinear,
                MergeMethodConfig::Passthrough,
            ] {
                let method = create_merge_method(config);
                println!("{} - {}", method.name(), method.description());
                if method.requires_base_model() {
                    println!("  requires base_model");
                }
                for def in method.parameters() {
                    println!(
                        "  {} (global{})",
                        def.name,
                        if def.required { ", required" } else { "" }
                    );
                }
                for def in method.per_model_parameters() {
                    println!(
                        "  {} (per model{})",
                        def.name,
                        if def.required { ", required" } else { "" }
                    );
                }
            }
        }
    }

    Ok(())
}
