use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trail_sage::datasets::{
    DatabaseConfig, GraphLoader, JsonExportLoader, LabelPolicy, PartitionPolicy, PostgisLoader,
    PostgisTables,
};
use trail_sage::predictions::{JsonArtifactWriter, PostgisPredictionStore, PredictionSink};
use trail_sage::{Pipeline, PipelineConfig, Preset};

/// Train a GraphSAGE classifier that recommends keep / merge / split
/// operations for the nodes of a trail network.
#[derive(Parser)]
#[command(name = "trail-sage", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    source: Source,

    /// TOML file with a full pipeline configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Start from a named configuration (ignored with --config)
    #[arg(long, value_enum, global = true)]
    preset: Option<Preset>,

    #[arg(long, global = true)]
    epochs: Option<usize>,

    /// Convolution width; an MLP head is resized to half of it
    #[arg(long, global = true)]
    hidden_dim: Option<usize>,

    #[arg(long, global = true)]
    lr: Option<f64>,

    #[arg(long, global = true)]
    weight_decay: Option<f64>,

    /// Predictions below this softmax confidence fall back to "keep"
    #[arg(long, global = true)]
    confidence_threshold: Option<f32>,

    /// Seed for the train/val/test split
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[arg(long, value_enum, global = true)]
    labels: Option<LabelPolicy>,

    #[arg(long, value_enum, global = true)]
    partition: Option<PartitionPolicy>,

    /// Store per-node class probabilities in the artifact
    #[arg(long, global = true)]
    include_probabilities: bool,

    /// Directory the JSON artifact is written to
    #[arg(long, default_value = "test-output", global = true)]
    output_dir: PathBuf,

    /// Also write the trained parameters (safetensors)
    #[arg(long, global = true)]
    save_model: Option<PathBuf>,

    /// Show an epoch progress bar
    #[arg(long, global = true)]
    progress: bool,

    #[arg(
        long,
        value_enum,
        default_value_t = LogFormat::Text,
        env = "TRAIL_SAGE_LOG_FORMAT",
        global = true
    )]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Source {
    /// Train on a flat JSON export
    File { path: PathBuf },
    /// Train on a noded PostGIS schema and upsert predictions back into it
    Postgis {
        schema: String,

        #[command(flatten)]
        db: DbArgs,

        #[arg(long, default_value = "ways_noded_vertices_pgr")]
        vertices_table: String,

        #[arg(long, default_value = "ways_noded")]
        edges_table: String,

        #[arg(long, default_value = "length_km")]
        length_column: String,

        /// Skip writing the predictions table
        #[arg(long)]
        no_store: bool,
    },
}

#[derive(Args)]
struct DbArgs {
    #[arg(long = "db-host", env = "PGHOST", default_value = "localhost")]
    host: String,
    #[arg(long = "db-port", env = "PGPORT", default_value_t = 5432)]
    port: u16,
    #[arg(long = "db-name", env = "PGDATABASE", default_value = "trail_master_db")]
    database: String,
    #[arg(long = "db-user", env = "PGUSER", default_value = "postgres")]
    user: String,
    #[arg(long = "db-password", env = "PGPASSWORD", default_value = "", hide_env_values = true)]
    password: String,
}
impl From<DbArgs> for DatabaseConfig {
    fn from(args: DbArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            database: args.database,
            user: args.user,
            password: args.password,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().flatten_event(true))
            .with(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(filter)
            .init(),
    }
}

impl Cli {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match (&self.config, self.preset) {
            (Some(path), _) => PipelineConfig::from_toml_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            (None, Some(preset)) => preset.config(),
            (None, None) => PipelineConfig::default(),
        };
        if let Some(epochs) = self.epochs {
            config.trainer.epochs = epochs;
        }
        if let Some(hidden_dim) = self.hidden_dim {
            config.set_hidden_dim(hidden_dim);
        }
        if let Some(lr) = self.lr {
            config.trainer.learning_rate = lr;
        }
        if let Some(weight_decay) = self.weight_decay {
            config.trainer.weight_decay = weight_decay;
        }
        if let Some(threshold) = self.confidence_threshold {
            config.confidence_threshold = threshold;
        }
        if let Some(labels) = self.labels {
            config.labels = labels;
        }
        if let Some(partition) = self.partition {
            config.partition = partition;
        }
        config.seed = self.seed.or(config.seed);
        config.include_probabilities |= self.include_probabilities;
        config.trainer.show_progress = self.progress;
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.pipeline_config()?;
    let artifact_path = cli.output_dir.join(&config.artifact_name);
    let pipeline = Pipeline::new(config).context("failed to set up pipeline")?;

    let mut sinks: Vec<Box<dyn PredictionSink>> =
        vec![Box::new(JsonArtifactWriter::new(&artifact_path))];
    let loader: Box<dyn GraphLoader> = match cli.source {
        Source::File { path } => {
            if !path.is_file() {
                bail!("input file not found: {}", path.display());
            }
            Box::new(JsonExportLoader::new(path))
        }
        Source::Postgis {
            schema,
            db,
            vertices_table,
            edges_table,
            length_column,
            no_store,
        } => {
            let database = DatabaseConfig::from(db);
            if !no_store {
                sinks.push(Box::new(PostgisPredictionStore::new(database.clone(), schema.clone())));
            }
            let tables = PostgisTables {
                vertices_table,
                edges_table,
                length_column,
            };
            Box::new(PostgisLoader::new(database, tables, schema))
        }
    };

    let outcome = pipeline
        .run(loader.as_ref())
        .with_context(|| format!("training on {} failed", loader.describe()))?;

    for sink in &sinks {
        sink.write(&outcome.artifact)
            .with_context(|| format!("failed to write {}", sink.describe()))?;
    }
    if let Some(path) = &cli.save_model {
        outcome
            .model
            .save(path)
            .with_context(|| format!("failed to save model to {}", path.display()))?;
        tracing::info!(path = %path.display(), "saved model parameters");
    }

    let metadata = &outcome.artifact.metadata;
    tracing::info!(
        test_accuracy = ?metadata.test_accuracy,
        best_val_acc = ?metadata.best_val_acc,
        epochs = metadata.epochs_run,
        confident = metadata.confident_predictions,
        nodes = metadata.num_nodes,
        "done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(args: &[&str]) -> PipelineConfig {
        let argv = ["trail-sage"].iter().chain(args).chain(&["file", "network.json"]);
        Cli::try_parse_from(argv).unwrap().pipeline_config().unwrap()
    }

    #[test]
    fn training_flags_override_the_preset() {
        let config = config_from(&[
            "--preset",
            "high-confidence",
            "--hidden-dim",
            "96",
            "--lr",
            "0.02",
            "--weight-decay",
            "0.001",
        ]);
        assert_eq!(config.model.hidden_dim, 96);
        assert_eq!(config.model.head_hidden, Some(48));
        assert_eq!(config.trainer.learning_rate, 0.02);
        assert_eq!(config.trainer.weight_decay, 0.001);
        assert_eq!(config.trainer.validate_every, 15);
    }

    #[test]
    fn defaults_without_flags() {
        assert_eq!(config_from(&[]), PipelineConfig::default());
    }

    #[test]
    fn negative_weight_decay_is_rejected() {
        let argv = ["trail-sage", "--weight-decay=-1", "file", "network.json"];
        let cli = Cli::try_parse_from(argv).unwrap();
        assert!(cli.pipeline_config().is_err());
    }
}
