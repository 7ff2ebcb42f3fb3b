use anyhow::Context;
use clap::Parser;
use schema_sync::config::SourceConfig;
use schema_sync::{Config, Replicator};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "schema-sync")]
#[command(about = "Change capture with consistent backfills", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(short, long, help = "Run the configured backfills after startup")]
    backfill: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting schema-sync");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).with_context(|| format!("loading {:?}", args.config));
        }
    };

    let source_kind = match &config.source {
        SourceConfig::Postgres(_) => "postgres",
        SourceConfig::Mysql(_) => "mysql",
    };
    info!(
        source = source_kind,
        backfills = config.sync.backfills.len(),
        queue_capacity = config.sync.queue_capacity,
        "Configuration summary"
    );

    let replicator = Replicator::new(config).context("building replicator")?;
    replicator
        .run(args.backfill)
        .await
        .context("replication failed")?;

    Ok(())
}

fn init_logging(args: &Args) {
    let default_directives = if args.verbose {
        "schema_sync=debug,mysql_async=info,info"
    } else {
        "schema_sync=info,warn"
    };
    let env_filter = match (args.verbose, EnvFilter::try_from_default_env()) {
        (false, Ok(filter)) => filter,
        _ => EnvFilter::new(default_directives),
    };

    let fmt_layer = if args.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
