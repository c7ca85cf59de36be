//! List command
//!
//! Usage: relgraph list --collection <NAME> [--mapping <NAME>] [--field <KEY=VALUE>]...

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Args;
use relgraph_store::SqliteDocumentStore;
use serde_json::{Map, Value};

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    pub collection: String,

    #[arg(long)]
    pub mapping: Option<String>,

    /// Only documents whose field equals the value; the value is parsed as
    /// JSON, falling back to a plain string
    #[arg(long = "field", value_name = "KEY=VALUE")]
    pub fields: Vec<String>,

    #[arg(long, default_value = ".relgraph/graph.db")]
    pub db: PathBuf,
}

pub fn execute(args: ListArgs) -> Result<()> {
    let mut filter = Map::new();
    for entry in &args.fields {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got {}", entry))?;
        let value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        filter.insert(key.to_string(), value);
    }

    let store = SqliteDocumentStore::open(&args.db)?;
    let documents = store.query(&args.collection, args.mapping.as_deref(), &filter)?;
    println!("{}", serde_json::to_string_pretty(&documents)?);
    Ok(())
}
