//! Map command
//!
//! Usage: relgraph map --schema <FILE> --mapping <NAME> --data <FILE> --db <PATH> [--config <FILE>]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use relgraph_core::logging_facility;
use relgraph_core::{CollectionDefinition, Graph, GraphConfig};
use relgraph_store::SqliteDocumentStore;
use serde_json::{json, Value};

#[derive(Debug, Args)]
pub struct MapArgs {
    /// Collection definition (JSON, or TOML with a .toml extension)
    #[arg(long)]
    pub schema: PathBuf,

    /// Mapping of the collection the records belong to
    #[arg(long)]
    pub mapping: String,

    /// JSON file holding one record or an array of records
    #[arg(long)]
    pub data: PathBuf,

    #[arg(long, default_value = ".relgraph/graph.db")]
    pub db: PathBuf,

    /// Graph configuration (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: MapArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => GraphConfig::load(path)?,
        None => GraphConfig::default(),
    };
    logging_facility::init(config.logging.profile);

    let definition = load_schema(&args.schema)?;
    let data = load_data(&args.data)?;

    if let Some(parent) = args.db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteDocumentStore::open(&args.db)?);
    let graph = Graph::with_config(store, config);
    graph.register_collection(&definition)?;

    let result = graph.map(&definition.name, &args.mapping, data).await?;
    let report = graph.merge_changes().await?;

    let summary = json!({
        "instances": result
            .objects
            .iter()
            .map(|o| o.as_ref().map(|i| i.local_id().to_string()))
            .collect::<Vec<_>>(),
        "errors": result
            .errors
            .iter()
            .map(|e| e.as_ref().map(|e| e.to_string()))
            .collect::<Vec<_>>(),
        "merged": {
            "documents": report.document_count(),
            "changes": report.change_count,
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn load_schema(path: &Path) -> Result<CollectionDefinition> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading schema {}", path.display()))?;
    let definition = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&source).with_context(|| format!("parsing schema {}", path.display()))?
    } else {
        CollectionDefinition::from_json(&source)
            .with_context(|| format!("parsing schema {}", path.display()))?
    };
    Ok(definition)
}

fn load_data(path: &Path) -> Result<Vec<Value>> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading data {}", path.display()))?;
    let value: Value = serde_json::from_str(&source)
        .with_context(|| format!("parsing data {}", path.display()))?;
    Ok(match value {
        Value::Array(records) => records,
        record => vec![record],
    })
}
