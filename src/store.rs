use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

use crate::error::{BettingError, Result};
use crate::types::EventRecord;

/// Append-only record store keyed by the event hash
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a record. A record with the same hash is left untouched and
    /// `BettingError::DuplicateEvent` is returned.
    async fn create_event_record(&self, record: &EventRecord) -> Result<()>;
}

pub struct PgEventStore {
    client: Client,
}

impl PgEventStore {
    /// Connect and apply the schema (idempotent DDL)
    pub async fn connect(dsn: &str, schema: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {:?}", e);
            }
        });

        // Create schema if not exists
        client.batch_execute(schema).await?;

        info!("PostgreSQL ready");

        Ok(Self { client })
    }

    pub async fn test_connection(&self) -> Result<()> {
        self.client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| BettingError::Storage(format!("PostgreSQL connection test failed: {}", e)))?;
        info!("PostgreSQL connection test successful");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create_event_record(&self, record: &EventRecord) -> Result<()> {
        let query = r#"
            INSERT INTO bet_events (
                hash,
                name,
                address,
                data
            ) VALUES ($1, $2, $3, $4::jsonb)
            ON CONFLICT (hash) DO NOTHING
        "#;

        let data = serde_json::to_value(&record.data)
            .map_err(|e| BettingError::Storage(format!("Failed to serialize event data: {}", e)))?;

        let inserted = self
            .client
            .execute(query, &[&record.hash, &record.name.as_str(), &record.address, &data])
            .await?;

        if inserted == 0 {
            return Err(BettingError::DuplicateEvent {
                hash: record.hash.clone(),
            });
        }

        Ok(())
    }
}
