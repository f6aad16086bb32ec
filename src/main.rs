use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use a3s_audit::provider::nats::NatsBroker;
use a3s_audit::sink::ElasticsearchSink;
use a3s_audit::store::SqliteAuditStore;
use a3s_audit::{
    AuditConfig, AuditFilter, AuditPipeline, AuditQueryService, BrokerKind, BrokerProvider,
    DeadLetterReplayer, PageRequest,
};

#[derive(Parser)]
#[command(name = "a3s-audit", version, about = "Audit event pipeline")]
struct Cli {
    /// Config file (defaults to $A3S_AUDIT_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consumer workers until interrupted
    Serve,

    /// Move dead-lettered records back to the work queue
    ReplayDlq {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Search records, search sink first
    Search {
        #[arg(short, long)]
        keyword: Option<String>,

        /// RFC 3339 lower bound (inclusive)
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// RFC 3339 upper bound (inclusive)
        #[arg(long)]
        end: Option<DateTime<Utc>>,
    },

    /// Page through the relational store, newest first
    List {
        #[arg(short, long)]
        keyword: Option<String>,

        #[arg(long, default_value_t = 0)]
        page: u32,

        #[arg(long, default_value_t = 20)]
        size: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => AuditConfig::load(path)?,
        None => AuditConfig::load_default()?,
    };

    match cli.command {
        Commands::Serve => serve(&config).await?,
        Commands::ReplayDlq { limit } => replay_dlq(&config, limit).await?,
        Commands::Search {
            keyword,
            start,
            end,
        } => {
            let query = query_service(&config).await?;
            let records = query.search(keyword.as_deref(), start, end).await;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::List {
            keyword,
            page,
            size,
        } => {
            let query = query_service(&config).await?;
            let filter = AuditFilter::new(keyword.as_deref(), None, None);
            let page = query.page(&filter, PageRequest::new(page, size)).await;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
    }

    Ok(())
}

async fn serve(config: &AuditConfig) -> anyhow::Result<()> {
    let pipeline = AuditPipeline::from_config(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    let report = pipeline.shutdown().await;
    tracing::info!(
        acked = report.acked,
        requeued = report.requeued,
        dead_lettered = report.dead_lettered,
        failed = report.failed,
        "Consumers drained"
    );
    Ok(())
}

async fn replay_dlq(config: &AuditConfig, limit: usize) -> anyhow::Result<()> {
    let broker: Arc<dyn BrokerProvider> = match config.broker {
        BrokerKind::Nats => Arc::new(NatsBroker::connect(config.nats.clone()).await?),
        BrokerKind::Memory => anyhow::bail!("replay-dlq needs a persistent broker"),
    };
    broker.declare(&config.topology).await?;

    let replayer = DeadLetterReplayer::new(broker, config.topology.clone())
        .with_confirm_timeout(Duration::from_millis(config.publisher.confirm_timeout_ms));
    let report = replayer
        .replay(limit, Duration::from_millis(config.consumer.idle_timeout_ms))
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn query_service(config: &AuditConfig) -> anyhow::Result<AuditQueryService> {
    let sink = Arc::new(ElasticsearchSink::new(config.elasticsearch.clone())?);
    let store = Arc::new(SqliteAuditStore::connect(&config.database).await?);
    Ok(AuditQueryService::new(sink, store).with_config(config.query.clone()))
}
