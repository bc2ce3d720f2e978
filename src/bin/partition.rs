use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use cluster_tree::{
    Backend, BuildReport, ClusterArgs, PathStore, PgBackend, StoreArgs, TreeBuilder, TreeStore,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cluster-tree-partition",
    about = "Recursively partition stored embeddings into a centroid tree"
)]
struct PartitionCli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    cluster: ClusterArgs,

    /// Create the vector extension and tables automatically if missing
    #[arg(long, env = "CLUSTER_TREE_PREPARE", default_value_t = true, action = ArgAction::Set)]
    prepare_tables: bool,

    /// Clear item paths and tree rows before building
    #[arg(long, env = "CLUSTER_TREE_RESET", default_value_t = true, action = ArgAction::Set)]
    reset: bool,

    /// Optional path to write the run report as JSON
    #[arg(long, env = "CLUSTER_TREE_REPORT_JSON")]
    report_json: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = PartitionCli::parse();
    let controls = cli
        .cluster
        .build_controls()
        .context("invalid cluster controls")?;
    let tables = cli.store.tables()?;
    let backend = Arc::new(PgBackend::new(cli.store.database_url.clone(), tables));

    {
        let store = backend
            .acquire()
            .await
            .context("failed to connect to Postgres")?;
        if cli.prepare_tables {
            store.prepare().await.context("failed to prepare tables")?;
        }
        if cli.reset {
            let paths = store.reset_paths().await.context("failed to reset paths")?;
            let nodes = store.clear_nodes().await.context("failed to clear tree")?;
            tracing::info!(paths, nodes, "cleared previous tree");
        }
    }

    let builder = TreeBuilder::new(Arc::clone(&backend), controls);
    let report = builder.build().await;
    print_summary(&report, backend.tables().tree.qualified());

    if let Some(path) = &cli.report_json {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    if !report.is_complete() {
        anyhow::bail!(
            "{} subtree{} failed; rerun with --reset to rebuild from scratch",
            report.failures.len(),
            if report.failures.len() == 1 { "" } else { "s" }
        );
    }
    Ok(())
}

fn print_summary(report: &BuildReport, tree_table: &str) {
    println!("Partition finished in {} ms (seed {}).", report.elapsed_ms, report.seed);
    println!(
        "  nodes written : {} into {}",
        report.nodes_written, tree_table
    );
    println!("  splits        : {}", report.splits);
    println!(
        "  leaves        : {} ({} items)",
        report.leaves, report.leaf_items
    );
    println!(
        "  dropped       : {} groups ({} items)",
        report.dropped_groups, report.dropped_items
    );
    println!("  max depth     : {}", report.max_depth);
    for failure in &report.failures {
        println!("  FAILED {} : {}", failure.path, failure.error);
    }
}
