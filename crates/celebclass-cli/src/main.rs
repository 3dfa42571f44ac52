use anyhow::{bail, Context, Result};
use celebclass_core::decoder;
use celebclass_core::{
    ArtifactPaths, ArtifactStore, CascadePaths, ClassificationService, DetectorConfig, FaceEyeDetector, ImageSource,
    LabelMap, DEFAULT_ARTIFACT_DIR, DEFAULT_CASCADE_DIR,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "celebclass", about = "Celebrity face classification, offline")]
struct Cli {
    /// Directory with class_dictionary.json and saved_model.onnx
    #[arg(long, global = true, env = "CELEBCLASS_ARTIFACT_DIR", default_value = DEFAULT_ARTIFACT_DIR)]
    artifacts: PathBuf,
    /// Use this classifier file instead of the one in --artifacts (.onnx or .json)
    #[arg(long, global = true, env = "CELEBCLASS_MODEL_PATH")]
    model: Option<PathBuf>,
    /// Directory with the Haar cascade XML descriptors
    #[arg(long, global = true, env = "CELEBCLASS_CASCADE_DIR", default_value = DEFAULT_CASCADE_DIR)]
    cascades: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every face in an image
    Classify(ClassifyInput),
    /// Show the faces (and eyes) the detector accepts
    Detect {
        /// Image file
        path: PathBuf,
    },
    /// Print the label dictionary
    Labels,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ClassifyInput {
    /// Image file
    #[arg(long)]
    file: Option<PathBuf>,
    /// Text file holding a data URI or base64 payload
    #[arg(long)]
    b64: Option<PathBuf>,
    /// Data URI or base64 payload given inline
    #[arg(long)]
    data: Option<String>,
}

impl ClassifyInput {
    fn source(&self) -> Result<ImageSource> {
        if let Some(path) = &self.file {
            return Ok(ImageSource::Path(path.clone()));
        }
        if let Some(path) = &self.b64 {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            return Ok(ImageSource::Encoded(text.trim().to_string()));
        }
        match &self.data {
            Some(data) => Ok(ImageSource::Encoded(data.clone())),
            None => bail!("one of --file, --b64 or --data is required"),
        }
    }
}

impl Cli {
    fn artifact_paths(&self) -> ArtifactPaths {
        let mut paths = ArtifactPaths::in_dir(&self.artifacts);
        if let Some(model) = &self.model {
            paths.classifier = model.clone();
        }
        paths
    }

    fn detector(&self) -> Result<FaceEyeDetector> {
        FaceEyeDetector::load(&CascadePaths::in_dir(&self.cascades), DetectorConfig::default())
            .with_context(|| format!("loading Haar cascades from {}", self.cascades.display()))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Classify(input) => {
            let source = input.source()?;

            let store = Arc::new(ArtifactStore::load(&cli.artifact_paths()));
            let service = ClassificationService::new(cli.detector()?, store);
            if !service.is_ready() {
                bail!("artifacts in {} could not be loaded", cli.artifacts.display());
            }

            let results = service.classify(&source)?;
            tracing::info!(faces = results.len(), "classification finished");
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Detect { path } => {
            let grid = decoder::decode_file(path)?;
            let regions = cli.detector()?.detect(&grid);
            let report: Vec<_> = regions
                .iter()
                .map(|r| serde_json::json!({ "face": r.rect, "eyes": r.eyes }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Labels => {
            let path = cli.artifact_paths().labels;
            let labels = LabelMap::load(&path).with_context(|| format!("loading {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&labels)?);
        }
    }

    Ok(())
}
