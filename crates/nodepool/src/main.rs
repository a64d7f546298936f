use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use nodepool::{
    api::OperationOutcome,
    config::{ClusterConnection, NodePoolConfig, PoolArgs},
    drain::TracingObserver,
    lifecycle::{self, Intervals},
    nodes::KubeNodePoolApi,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    connection: ClusterConnection,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Wait for a new node pool to have enough ready nodes, then print its state
    Create(PoolArgs),
    /// Cordon every node of a node pool, then drain them one by one
    Delete(PoolArgs),
    /// Output the JSON schema of the node pool state
    Schema,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env())
        .try_init()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Create(args) => {
            let config = args.resolve()?;
            let api = KubeNodePoolApi::new(cli.connection.client().await?);
            let cancel = cancel_on_ctrl_c();

            let outcome = lifecycle::create(&api, &config, &Intervals::default(), &cancel).await;
            check(outcome).context("Error waiting for nodes to be ready")?;

            print!("{}", config.to_yaml()?);
        }
        Commands::Delete(args) => {
            let config = args.resolve()?;
            let api = KubeNodePoolApi::new(cli.connection.client().await?);
            let cancel = cancel_on_ctrl_c();

            let outcome = lifecycle::delete(
                &api,
                &config,
                &Intervals::default(),
                &TracingObserver,
                &cancel,
            )
            .await;
            check(outcome).context("Error deleting node pool")?;

            tracing::info!("node pool {} drained", config.node_pool_name);
        }
        Commands::Schema => {
            let schema = schemars::schema_for!(NodePoolConfig);
            println!("{}", serde_yaml_ng::to_string(&schema)?);
        }
    }

    Ok(())
}

fn check(outcome: OperationOutcome) -> anyhow::Result<()> {
    match outcome {
        OperationOutcome::Success => Ok(()),
        OperationOutcome::Failure {
            reason,
            progress: None,
        } => Err(reason.into()),
        OperationOutcome::Failure {
            reason,
            progress: Some(progress),
        } => Err(anyhow!("{reason}; {progress}")),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling in-flight operation");
            token.cancel();
        }
    });

    cancel
}
