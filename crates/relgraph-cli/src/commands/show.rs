//! Show command

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Args;
use relgraph_core::{DocumentStore, LocalId};
use relgraph_store::SqliteDocumentStore;

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Local id of the document
    pub local_id: String,

    #[arg(long, default_value = ".relgraph/graph.db")]
    pub db: PathBuf,
}

pub async fn execute(args: ShowArgs) -> Result<()> {
    let store = SqliteDocumentStore::open(&args.db)?;
    let document = store
        .get(&LocalId::from(args.local_id.as_str()))
        .await?
        .ok_or_else(|| anyhow!("no document with local id {}", args.local_id))?;
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}
