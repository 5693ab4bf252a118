use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row as _;
use tracing::{debug, info};

use crate::config::{is_identifier, DatabaseConfig};
use crate::transport::{Row, RowStream, Transport, TransportError};

/// PostgreSQL transport backed by a connection pool
#[derive(Clone)]
pub struct PgTransport {
    pool: PgPool,
}

impl PgTransport {
    /// Connect with a pool of `max_connections`. Size it to at least
    /// entity concurrency × workers per entity, or workers will queue on the pool.
    pub async fn connect(config: &DatabaseConfig, max_connections: u32) -> Result<Self, TransportError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .max_lifetime(config.max_lifetime())
            .connect_with(options)
            .await?;

        info!(
            host = %config.host,
            database = %config.database,
            max_connections = max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// `CALL namespace.operation($1)`
pub fn call_statement(namespace: &str, operation: &str) -> Result<String, TransportError> {
    for name in [namespace, operation] {
        if !is_identifier(name) {
            return Err(TransportError::InvalidIdentifier(name.to_string()));
        }
    }
    Ok(format!("CALL {}.{}($1)", namespace, operation))
}

fn decode_row(row: PgRow) -> Result<Row, TransportError> {
    (0..row.len())
        .map(|i| row.try_get::<Option<String>, _>(i).map_err(TransportError::from))
        .collect()
}

#[async_trait]
impl Transport for PgTransport {
    async fn invoke(&self, namespace: &str, operation: &str, entity_id: &str) -> Result<(), TransportError> {
        let statement = call_statement(namespace, operation)?;
        debug!(statement = %statement, entity = %entity_id, "Invoking procedure");

        sqlx::query(&statement)
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn query<'a>(&'a self, sql: &'a str, entity_id: &'a str) -> RowStream<'a> {
        debug!(sql = %sql, entity = %entity_id, "Executing query");
        sqlx::query(sql)
            .bind(entity_id)
            .fetch(&self.pool)
            .map(|row| row.map_err(TransportError::from).and_then(decode_row))
            .boxed()
    }
}
