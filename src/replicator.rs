//! Wires a configured source and sink to a [`SyncController`].

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::{Config, SinkConfig, SourceConfig};
use crate::mysql::MysqlSource;
use crate::postgres::PostgresSource;
use crate::sink::{FileSink, KafkaSink, PostgresSink};
use crate::sync::{BackfillOutcome, ControllerConfig, Sink, Source, SyncController};
use crate::{Error, Result};

pub struct Replicator {
    config: Config,
    controller: SyncController,
}

impl Replicator {
    pub fn new(config: Config) -> Result<Self> {
        let source = build_source(&config);
        let sink = build_sink(&config.sink)?;
        let controller = SyncController::new(
            source,
            sink,
            ControllerConfig {
                backfill_timeout: config.backfill_timeout(),
            },
        );
        Ok(Self { config, controller })
    }

    pub fn controller(&self) -> &SyncController {
        &self.controller
    }

    /// Streams changes until interrupted, running the configured backfills
    /// first when `run_backfills` is set.
    pub async fn run(&self, run_backfills: bool) -> Result<()> {
        info!("Replicator starting");
        self.controller.start().await?;

        let result = tokio::select! {
            result = self.run_until_stopped(run_backfills) => result,
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Received interrupt, shutting down"),
                    Err(e) => error!(error = %e, "Failed to listen for interrupt"),
                }
                Ok(())
            }
        };

        self.controller.stop().await;
        info!("Replicator stopped");
        result
    }

    async fn run_until_stopped(&self, run_backfills: bool) -> Result<()> {
        if run_backfills {
            self.run_backfills().await?;
        }
        self.controller.wait().await;
        warn!("Change stream ended");
        Ok(())
    }

    async fn run_backfills(&self) -> Result<()> {
        for (index, backfill) in self.config.sync.backfills.iter().enumerate() {
            info!(index, sql = %backfill.sql, "Running configured backfill");
            match self
                .controller
                .start_backfill(backfill.sources.clone(), &backfill.sql, &backfill.params)
                .await?
            {
                BackfillOutcome::Completed {
                    backfill_id,
                    emitted,
                    dropped,
                } => info!(
                    index,
                    backfill_id = %backfill_id,
                    emitted,
                    dropped,
                    "Backfill completed"
                ),
                BackfillOutcome::TimedOut { backfill_id } => {
                    return Err(Error::Timeout {
                        message: format!("backfill {} did not complete", backfill_id),
                    });
                }
            }
        }
        Ok(())
    }
}

fn build_source(config: &Config) -> Arc<dyn Source> {
    let capacity = config.sync.queue_capacity;
    match &config.source {
        SourceConfig::Postgres(pg) => {
            info!(
                host = %pg.host,
                port = pg.port,
                database = %pg.database,
                publication = %pg.publication,
                slot = %pg.slot_name,
                "Using Postgres source"
            );
            Arc::new(PostgresSource::new(pg.clone(), capacity))
        }
        SourceConfig::Mysql(my) => {
            info!(
                host = %my.host,
                port = my.port,
                database = %my.database,
                server_id = my.server_id,
                "Using MySQL source"
            );
            Arc::new(MysqlSource::new(my.clone(), capacity))
        }
    }
}

fn build_sink(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    Ok(match config {
        SinkConfig::File(file) => {
            info!(path = %file.path, "Using file sink");
            Arc::new(FileSink::new(file.path.clone()))
        }
        SinkConfig::Kafka(kafka) => {
            info!(brokers = ?kafka.brokers, topic = %kafka.topic, "Using Kafka sink");
            Arc::new(KafkaSink::new(kafka)?)
        }
        SinkConfig::Postgres(pg) => {
            info!("Using Postgres sink");
            Arc::new(PostgresSink::new(pg.clone()))
        }
    })
}
