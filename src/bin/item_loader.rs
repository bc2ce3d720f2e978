use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use cluster_tree::{Backend, EmbeddedItemRecord, PgBackend, StoreArgs};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cluster-tree-load",
    about = "Load pre-embedded records into the items table"
)]
struct LoadCli {
    /// Path to the JSONL file of {key, text, embedding} records
    #[arg(long, env = "CLUSTER_TREE_INPUT", default_value = "embeddings.jsonl")]
    input: PathBuf,

    #[command(flatten)]
    store: StoreArgs,

    /// Number of rows buffered per INSERT transaction
    #[arg(long, env = "CLUSTER_TREE_LOAD_BATCH", default_value_t = 128)]
    batch_size: usize,

    /// Create the vector extension and tables automatically if missing
    #[arg(long, env = "CLUSTER_TREE_PREPARE", default_value_t = true, action = ArgAction::Set)]
    prepare_tables: bool,

    /// Update rows whose key already exists (clearing their path)
    #[arg(long, env = "CLUSTER_TREE_LOAD_UPSERT", default_value_t = true, action = ArgAction::Set)]
    upsert: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = LoadCli::parse();
    let batch_size = cli.batch_size.max(1);
    let tables = cli.store.tables()?;
    let dims = tables.dims;
    let file = File::open(&cli.input)
        .with_context(|| format!("failed to open embedding input {:?}", cli.input))?;
    let mut lines = BufReader::new(file).lines().enumerate();

    let Some(first_record) = next_record(&mut lines)? else {
        println!("No embeddings to insert; nothing to do.");
        return Ok(());
    };
    anyhow::ensure!(
        first_record.embedding.len() == dims,
        "first record has {} dimensions but the table expects {}",
        first_record.embedding.len(),
        dims
    );

    let backend = PgBackend::new(cli.store.database_url.clone(), tables);
    let mut store = backend
        .acquire()
        .await
        .context("failed to connect to Postgres")?;
    if cli.prepare_tables {
        store.prepare().await.context("failed to prepare tables")?;
    }

    let mut batch = Vec::with_capacity(batch_size);
    batch.push(first_record);
    let mut total_inserted = 0u64;
    while let Some(record) = next_record(&mut lines)? {
        batch.push(record);
        if batch.len() >= batch_size {
            total_inserted += store
                .insert_records(&batch, cli.upsert)
                .await
                .with_context(|| {
                    format!(
                        "failed to insert batch ending at record {}",
                        total_inserted + batch.len() as u64
                    )
                })?;
            render_progress(total_inserted)?;
            batch.clear();
        }
    }

    if !batch.is_empty() {
        total_inserted += store
            .insert_records(&batch, cli.upsert)
            .await
            .context("failed to insert final batch")?;
        render_progress(total_inserted)?;
    }

    if total_inserted > 0 {
        println!();
    }
    println!(
        "Successfully wrote {} record{} into {}.",
        total_inserted,
        if total_inserted == 1 { "" } else { "s" },
        backend.tables().items.qualified()
    );
    Ok(())
}

fn render_progress(inserted: u64) -> Result<()> {
    let plural = if inserted == 1 { "" } else { "s" };
    print!("\rWrote {} record{}...", inserted, plural);
    io::stdout().flush()?;
    Ok(())
}

fn next_record<I>(lines: &mut I) -> Result<Option<EmbeddedItemRecord>>
where
    I: Iterator<Item = (usize, io::Result<String>)>,
{
    for (line_no, line) in lines.by_ref() {
        let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EmbeddedItemRecord = serde_json::from_str(&line)
            .with_context(|| format!("invalid embedding record at line {}", line_no + 1))?;
        return Ok(Some(record));
    }
    Ok(None)
}
