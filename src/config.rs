use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::BackfillSource;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Postgres(PostgresConfig),
    Mysql(MysqlConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub publication: String,
    pub slot_name: String,
    #[serde(default = "default_true")]
    pub create_publication: bool,
    #[serde(default = "default_true")]
    pub create_slot: bool,
    #[serde(default = "default_proto_version")]
    pub proto_version: u8,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    #[serde(default = "default_watermark_schema")]
    pub watermark_schema: String,
    #[serde(default = "default_watermark_table")]
    pub watermark_table: String,
    #[serde(default)]
    pub transformations: Vec<TransformationConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MysqlConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_server_id")]
    pub server_id: u32,
    #[serde(default = "default_mysql_watermark_table")]
    pub watermark_table: String,
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: PathBuf,
    #[serde(default)]
    pub transformations: Vec<TransformationConfig>,
}

/// Public-schema projection of one source table.
///
/// `sql` is run with the changed row's key values as parameters and must
/// return exactly one row.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransformationConfig {
    pub table: String,
    pub sql: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    File(FileSinkConfig),
    Kafka(KafkaConfig),
    Postgres(PostgresSinkConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSinkConfig {
    /// Output path, or `-` for stdout.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_buffer_memory")]
    pub buffer_memory: usize,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresSinkConfig {
    pub url: String,
    pub upsert_sql: String,
    #[serde(default)]
    pub delete_sql: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub backfill_timeout_secs: Option<u64>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub backfills: Vec<BackfillConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backfill_timeout_secs: None,
            queue_capacity: default_queue_capacity(),
            backfills: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackfillConfig {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub sources: Vec<BackfillSource>,
}

impl Config {
    /// Loads a TOML file, then applies `SCHEMA_SYNC__SECTION__KEY`
    /// environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("SCHEMA_SYNC")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.source {
            SourceConfig::Postgres(pg) => {
                if pg.publication.is_empty() || pg.slot_name.is_empty() {
                    return Err(Error::Config(
                        "postgres source needs a publication and a slot_name".to_string(),
                    ));
                }
                if !(1..=4).contains(&pg.proto_version) {
                    return Err(Error::Config(format!(
                        "unsupported pgoutput proto_version {}",
                        pg.proto_version
                    )));
                }
                validate_transformations(&pg.transformations)?;
            }
            SourceConfig::Mysql(my) => {
                if my.server_id == 0 {
                    return Err(Error::Config("mysql server_id must not be 0".to_string()));
                }
                validate_transformations(&my.transformations)?;
            }
        }

        match &self.sink {
            SinkConfig::Kafka(kafka) if kafka.brokers.is_empty() => {
                return Err(Error::Config("kafka sink needs at least one broker".to_string()));
            }
            SinkConfig::File(file) if file.path.is_empty() => {
                return Err(Error::Config("file sink needs a path".to_string()));
            }
            _ => {}
        }

        if self.sync.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".to_string()));
        }
        for backfill in &self.sync.backfills {
            if backfill.sources.is_empty() {
                return Err(Error::Config(format!(
                    "backfill `{}` declares no sources",
                    backfill.sql
                )));
            }
        }
        Ok(())
    }

    pub fn backfill_timeout(&self) -> Option<Duration> {
        self.sync.backfill_timeout_secs.map(Duration::from_secs)
    }
}

fn validate_transformations(transformations: &[TransformationConfig]) -> Result<()> {
    for t in transformations {
        if t.sql.trim().is_empty() {
            return Err(Error::Config(format!(
                "transformation for `{}` has no SQL",
                t.table
            )));
        }
    }
    Ok(())
}

impl MysqlConfig {
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

fn default_true() -> bool {
    true
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_proto_version() -> u8 {
    1
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_status_interval() -> u64 {
    10
}

fn default_watermark_schema() -> String {
    "schema_sync".to_string()
}

fn default_watermark_table() -> String {
    "watermarks".to_string()
}

fn default_mysql_watermark_table() -> String {
    "schema_sync_watermarks".to_string()
}

/// Replica server id derived from the process id, kept clear of the
/// small ids usually given to real replicas.
pub fn default_server_id() -> u32 {
    10_000 + std::process::id() % 1_000_000
}

fn default_checkpoint_file() -> PathBuf {
    PathBuf::from("schema-sync.checkpoint")
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    100
}

fn default_batch_size() -> usize {
    16384
}

fn default_buffer_memory() -> usize {
    33_554_432 // 32MB
}

fn default_send_timeout() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    16
}
