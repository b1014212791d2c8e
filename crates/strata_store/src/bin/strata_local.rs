//! Local demo: run an in-process cluster and drive document writes through
//! the replicated index action, printing the shard-info tallies.

use std::path::PathBuf;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use strata_cluster::cluster::IndexSettings;
use strata_store::action::consistency::WriteConsistencyLevel;
use strata_store::action::index::IndexRequest;
use strata_store::node::{LocalCluster, LocalClusterOptions};

#[derive(Parser, Debug)]
#[command(name = "strata-local", about = "Run an in-process strata cluster and index documents")]
struct Args {
    /// Number of nodes in the cluster.
    #[arg(long, default_value_t = 3)]
    nodes: u64,

    /// Primary shards for the demo index.
    #[arg(long, default_value_t = 2)]
    shards: u32,

    /// Replicas per shard.
    #[arg(long, default_value_t = 1)]
    replicas: u32,

    /// Documents to index.
    #[arg(long, default_value_t = 100)]
    docs: u32,

    /// Write consistency level (one|quorum|all).
    #[arg(long, default_value = "quorum")]
    consistency: WriteConsistencyLevel,

    /// Data directory. A temporary directory is used when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let cluster = LocalCluster::start(LocalClusterOptions {
        nodes: args.nodes,
        data_dir: args.data_dir.clone(),
        ..LocalClusterOptions::default()
    })?;
    let settings = IndexSettings {
        number_of_shards: args.shards,
        number_of_replicas: args.replicas,
        ..IndexSettings::default()
    };
    cluster.create_index("events", settings)?;

    let mut created = 0u32;
    let mut replica_failures = 0usize;
    let mut total_successful = 0u64;
    for doc in 0..args.docs {
        // Rotate the coordinating node so reroutes go both local and remote.
        let coordinator = cluster.node((doc as u64 % args.nodes) + 1);
        let request = IndexRequest::new(
            "events",
            format!("doc-{doc}"),
            json!({ "message": format!("event number {doc}"), "sequence": doc }),
        )
        .with_consistency(args.consistency);
        let response = coordinator.index_action.clone().execute(request).await?;
        if response.created {
            created += 1;
        }
        replica_failures += response.shard_info.failed();
        total_successful += u64::from(response.shard_info.successful);
    }

    println!(
        "indexed {} documents across {} nodes ({} created, {} copy writes, {} replica failures)",
        args.docs, args.nodes, created, total_successful, replica_failures
    );
    Ok(())
}
