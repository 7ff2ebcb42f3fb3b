use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::listener::PgReplicationListener;
use super::sql::{query_json_rows, quote_ident};
use crate::config::PostgresConfig;
use crate::sync::{Source, Subscription, Watermark};
use crate::types::{Row, RowChange, TableOperation, TableRef, TransformedOperation};
use crate::{Error, Result};

const DUPLICATE_OBJECT: &str = "42710";

/// Postgres change source backed by a `pgoutput` logical replication slot.
pub struct PostgresSource {
    config: PostgresConfig,
    queue_capacity: usize,
    transformations: HashMap<String, String>,
    watermark_table: TableRef,
    client: OnceCell<Client>,
    listener: Mutex<Option<Arc<PgReplicationListener>>>,
    cancel: CancellationToken,
}

impl PostgresSource {
    pub fn new(config: PostgresConfig, queue_capacity: usize) -> Self {
        let transformations = config
            .transformations
            .iter()
            .map(|t| {
                let table = TableRef::parse(&t.table);
                // Unqualified names resolve the way the default search_path does.
                let table = if table.schema.is_empty() {
                    TableRef::new("public", table.table)
                } else {
                    table
                };
                (table.to_string(), t.sql.clone())
            })
            .collect();
        let watermark_table =
            TableRef::new(config.watermark_schema.clone(), config.watermark_table.clone());
        Self {
            config,
            queue_capacity,
            transformations,
            watermark_table,
            client: OnceCell::new(),
            listener: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.config.host)
            .port(self.config.port)
            .dbname(&self.config.database)
            .user(&self.config.username)
            .password(&self.config.password)
            .application_name("schema-sync")
            // Same zone as the replication session, so both render timestamptz alike.
            .options("-c TimeZone=UTC")
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs));
        pg
    }

    async fn connect(&self) -> Result<Client> {
        let (client, connection) = self.pg_config().connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Postgres connection error");
            }
        });
        Ok(client)
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .get()
            .ok_or_else(|| Error::Connection("postgres source is not prepared".to_string()))
    }

    async fn check_logical_replication(&self, client: &Client) -> Result<()> {
        let row = client
            .query_opt("SELECT setting FROM pg_settings WHERE name = 'wal_level'", &[])
            .await?;
        let level: Option<String> = row.map(|r| r.try_get(0)).transpose()?;
        if level.as_deref() != Some("logical") {
            return Err(Error::Prerequisite(format!(
                "logical replication is not enabled (wal_level = {}); set wal_level=logical",
                level.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        Ok(())
    }

    async fn ensure_watermark_table(&self, client: &Client) -> Result<()> {
        let schema = quote_ident(&self.watermark_table.schema);
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema};
                 CREATE TABLE IF NOT EXISTS {schema}.{table} (
                     id SERIAL PRIMARY KEY,
                     backfill TEXT NOT NULL,
                     type TEXT NOT NULL CHECK (type IN ('low', 'high'))
                 );",
                schema = schema,
                table = quote_ident(&self.watermark_table.table),
            ))
            .await?;
        debug!(table = %self.watermark_table, "Watermark table ready");
        Ok(())
    }

    async fn ensure_replication_slot(&self, client: &Client) -> Result<()> {
        let slot = &self.config.slot_name;
        let row = client
            .query_opt(
                "SELECT plugin, database FROM pg_replication_slots WHERE slot_name = $1",
                &[slot],
            )
            .await?;

        match row {
            Some(row) => {
                let plugin: Option<String> = row.try_get(0)?;
                let database: Option<String> = row.try_get(1)?;
                if database.as_deref() != Some(self.config.database.as_str()) {
                    return Err(Error::Prerequisite(format!(
                        "replication slot '{}' belongs to database '{}', expected '{}'",
                        slot,
                        database.unwrap_or_default(),
                        self.config.database
                    )));
                }
                if plugin.as_deref() != Some("pgoutput") {
                    return Err(Error::Prerequisite(format!(
                        "replication slot '{}' uses plugin '{}', expected pgoutput",
                        slot,
                        plugin.unwrap_or_default()
                    )));
                }
                debug!(slot = %slot, "Replication slot exists");
            }
            None if self.config.create_slot => {
                client
                    .execute(
                        "SELECT pg_create_logical_replication_slot($1, 'pgoutput')",
                        &[slot],
                    )
                    .await?;
                info!(slot = %slot, "Created replication slot");
            }
            None => {
                return Err(Error::Prerequisite(format!(
                    "replication slot '{}' does not exist and create_slot is false",
                    slot
                )));
            }
        }
        Ok(())
    }

    async fn ensure_publication(&self, client: &Client) -> Result<()> {
        let publication = &self.config.publication;
        let row = client
            .query_opt(
                "SELECT puballtables FROM pg_publication WHERE pubname = $1",
                &[publication],
            )
            .await?;

        match row {
            Some(row) if row.try_get::<_, bool>(0)? => {
                debug!(publication = %publication, "Publication covers all tables");
            }
            Some(_) => {
                let sql = format!(
                    "ALTER PUBLICATION {} ADD TABLE {}.{}",
                    quote_ident(publication),
                    quote_ident(&self.watermark_table.schema),
                    quote_ident(&self.watermark_table.table)
                );
                match client.batch_execute(&sql).await {
                    Ok(()) => info!(
                        publication = %publication,
                        table = %self.watermark_table,
                        "Added watermark table to publication"
                    ),
                    Err(e) if e.code().map(|c| c.code()) == Some(DUPLICATE_OBJECT) => {
                        debug!(publication = %publication, "Watermark table already published");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None if self.config.create_publication => {
                client
                    .batch_execute(&format!(
                        "CREATE PUBLICATION {} FOR ALL TABLES",
                        quote_ident(publication)
                    ))
                    .await?;
                info!(publication = %publication, "Created publication");
            }
            None => {
                return Err(Error::Prerequisite(format!(
                    "publication '{}' does not exist and create_publication is false",
                    publication
                )));
            }
        }
        Ok(())
    }

    async fn transform(&self, sql: &str, operation: &TableOperation) -> Result<Option<Row>> {
        let params = operation.key_values();
        let mut rows = query_json_rows(self.client()?, sql, &params).await?;
        if rows.len() != 1 {
            warn!(
                table = %operation.table_ref(),
                rows = rows.len(),
                "Expected exactly one row from transformation"
            );
            return Ok(None);
        }
        Ok(rows.pop())
    }
}

#[async_trait]
impl Source for PostgresSource {
    async fn prepare(&self) -> Result<()> {
        let client = self.client.get_or_try_init(|| self.connect()).await?;
        self.check_logical_replication(client).await?;
        self.ensure_watermark_table(client).await?;
        self.ensure_replication_slot(client).await?;
        self.ensure_publication(client).await?;
        info!(
            database = %self.config.database,
            slot = %self.config.slot_name,
            "Postgres source prepared"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            listener.stop();
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let listener = {
            let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(Error::Connection(
                    "postgres source is already subscribed".to_string(),
                ));
            }
            let listener = Arc::new(PgReplicationListener::new(
                self.config.clone(),
                self.queue_capacity,
                self.cancel.child_token(),
            ));
            *slot = Some(listener.clone());
            listener
        };
        listener.start().await
    }

    async fn apply_transformations(
        &self,
        operation: &TableOperation,
    ) -> Option<TransformedOperation> {
        let table = operation.table_ref().to_string();
        let Some(sql) = self.transformations.get(&table) else {
            debug!(table = %table, "No transformation for table");
            return None;
        };

        let key_columns = operation.key_columns.clone();
        match &operation.change {
            RowChange::Delete { old_keys } => Some(TransformedOperation::Delete {
                key_columns,
                object_keys: old_keys.clone(),
            }),
            RowChange::Insert { .. } | RowChange::Update { .. } => {
                match self.transform(sql, operation).await {
                    Ok(Some(object)) => Some(if operation.kind() == "insert" {
                        TransformedOperation::Insert {
                            key_columns,
                            object,
                        }
                    } else {
                        TransformedOperation::Update {
                            key_columns,
                            object,
                        }
                    }),
                    Ok(None) => None,
                    Err(e) => {
                        error!(table = %table, error = %e, "Transformation failed");
                        None
                    }
                }
            }
        }
    }

    async fn get_backfill_records(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let client = self.connect().await?;
        let rows = query_json_rows(&client, sql, params).await?;
        debug!(rows = rows.len(), "Backfill query returned");
        Ok(rows)
    }

    async fn write_watermark(&self, watermark: &Watermark) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}.{} (type, backfill) VALUES ($1, $2)",
            quote_ident(&self.watermark_table.schema),
            quote_ident(&self.watermark_table.table)
        );
        self.client()?
            .execute(
                sql.as_str(),
                &[&watermark.kind.as_str(), &watermark.backfill_id],
            )
            .await?;
        debug!(kind = %watermark.kind, backfill_id = %watermark.backfill_id, "Wrote watermark");
        Ok(())
    }

    fn watermark_table(&self) -> TableRef {
        self.watermark_table.clone()
    }
}
