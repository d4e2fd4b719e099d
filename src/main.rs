use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::debug;

use assay_catalog::ToolCatalog;
use assay_pipeline::{Pipeline, ValidationError, validate};
use assay_runtime::EngineConfig;

/// Assay - an adaptive image-analysis pipeline engine
#[derive(Parser)]
#[command(name = "assay")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.assay)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Engine config file (default: <data-dir>/config.json, if present)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// List or search the tool catalog
  Tools {
    /// Path to the catalog manifest (default: <data-dir>/catalog.json)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Only show tools in this category
    #[arg(long)]
    category: Option<String>,

    /// Case-insensitive search over ids, names, descriptions and tags
    #[arg(long)]
    search: Option<String>,
  },

  /// Validate a pipeline against the catalog
  Validate {
    /// Path to the catalog manifest (default: <data-dir>/catalog.json)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,
  },

  /// Validate a pipeline and print its execution plan
  Plan {
    /// Path to the catalog manifest (default: <data-dir>/catalog.json)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,
  },
}

fn main() -> Result<()> {
  init_tracing();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".assay"),
  };

  let rt = tokio::runtime::Runtime::new()?;

  match cli.command {
    Some(Commands::Tools {
      catalog,
      category,
      search,
    }) => rt.block_on(list_tools(
      catalog_path(catalog, &data_dir),
      category,
      search,
    )),
    Some(Commands::Validate {
      catalog,
      pipeline_file,
    }) => rt.block_on(validate_pipeline(
      catalog_path(catalog, &data_dir),
      pipeline_file,
    )),
    Some(Commands::Plan {
      catalog,
      pipeline_file,
    }) => rt.block_on(plan_pipeline(
      catalog_path(catalog, &data_dir),
      pipeline_file,
      cli.config,
      data_dir,
    )),
    None => {
      println!("assay - use --help to see available commands");
      Ok(())
    }
  }
}

fn init_tracing() {
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .try_init();
}

fn catalog_path(catalog: Option<PathBuf>, data_dir: &Path) -> PathBuf {
  catalog.unwrap_or_else(|| data_dir.join("catalog.json"))
}

async fn load_catalog(path: &Path) -> Result<ToolCatalog> {
  let catalog = ToolCatalog::from_manifest(path)
    .await
    .with_context(|| format!("failed to load catalog: {}", path.display()))?;
  eprintln!("Loaded catalog with {} tools", catalog.len());
  Ok(catalog)
}

async fn load_pipeline(path: &Path) -> Result<Pipeline> {
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read pipeline file: {}", path.display()))?;

  let pipeline: Pipeline = serde_json::from_str(&content)
    .with_context(|| format!("failed to parse pipeline file: {}", path.display()))?;

  eprintln!("Loaded pipeline: {} ({} nodes)", pipeline.name, pipeline.nodes.len());
  Ok(pipeline)
}

/// Engine config from `--config`, else `<data-dir>/config.json`, else defaults.
async fn load_config(config: Option<PathBuf>, data_dir: &Path) -> Result<EngineConfig> {
  let path = match config {
    Some(path) => path,
    None => {
      let path = data_dir.join("config.json");
      if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        debug!(path = %path.display(), "config_not_found");
        return Ok(EngineConfig::default());
      }
      path
    }
  };

  EngineConfig::from_file(&path)
    .await
    .with_context(|| format!("failed to load config: {}", path.display()))
}

async fn list_tools(
  catalog_file: PathBuf,
  category: Option<String>,
  search: Option<String>,
) -> Result<()> {
  let catalog = load_catalog(&catalog_file).await?;

  let tools = match &search {
    Some(query) => catalog.search(query, category.as_deref()),
    None => catalog.list(category.as_deref()),
  };

  for tool in tools {
    println!("{}", tool.describe());
  }

  Ok(())
}

async fn validate_pipeline(catalog_file: PathBuf, pipeline_file: PathBuf) -> Result<()> {
  let catalog = load_catalog(&catalog_file).await?;
  let pipeline = load_pipeline(&pipeline_file).await?;

  let report = validate(&pipeline, &catalog);
  if !report.is_valid() {
    for error in report.errors() {
      println!("[{}] {}", error.kind(), error);
    }
    bail!("pipeline '{}' is invalid", pipeline.pipeline_id);
  }

  println!("pipeline '{}' is valid", pipeline.pipeline_id);
  Ok(())
}

async fn plan_pipeline(
  catalog_file: PathBuf,
  pipeline_file: PathBuf,
  config: Option<PathBuf>,
  data_dir: PathBuf,
) -> Result<()> {
  let catalog = load_catalog(&catalog_file).await?;
  let pipeline = load_pipeline(&pipeline_file).await?;
  let config = load_config(config, &data_dir).await?;

  let report = validate(&pipeline, &catalog);
  let unresolved = pipeline.unresolved_inputs();

  // Unresolved inputs are filled at submission, so they are listed rather
  // than treated as fatal here.
  let fatal: Vec<_> = report
    .errors()
    .iter()
    .filter(|e| match e {
      ValidationError::UnsatisfiedInput { node_id, port } => !unresolved
        .iter()
        .any(|(n, p, _)| n == node_id && p == port),
      _ => true,
    })
    .collect();
  if !fatal.is_empty() {
    for error in fatal {
      println!("[{}] {}", error.kind(), error);
    }
    bail!("pipeline '{}' is invalid", pipeline.pipeline_id);
  }

  let order = pipeline
    .graph()
    .topological_order()
    .map_err(|cycle| anyhow::anyhow!("cycle among nodes: {}", cycle.join(", ")))?;

  println!("max concurrency: {}", config.max_concurrency);
  for (position, node_id) in order.iter().enumerate() {
    let Some(node) = pipeline.node(node_id) else {
      continue;
    };

    let mut line = format!("{:>3}. {} ({})", position + 1, node.display_name(), node.tool_id);
    if node.adaptive {
      let budget = node
        .refinement
        .as_ref()
        .and_then(|r| r.max_iterations)
        .unwrap_or(config.default_max_iterations)
        .max(1);
      line.push_str(&format!(" adaptive, up to {} iterations", budget));
      if node.optional {
        line.push_str(", removable");
      }
    }
    println!("{}", line);
  }

  for (node_id, port, prompt) in unresolved {
    println!(
      "needs input {}.{}{}",
      node_id,
      port,
      prompt.map(|p| format!(": {}", p)).unwrap_or_default()
    );
  }

  Ok(())
}
