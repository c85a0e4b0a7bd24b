use crate::errors::{Error, Result};
use crate::model::DeviceStatusRow;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Durable record of each device's last known status.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn upsert_status(&self, device_id: &str, is_active: bool) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgStatusStore {
    pool: PgPool,
    max_attempts: u32,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: 3,
        }
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn upsert_status(&self, device_id: &str, is_active: bool) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match upsert_status_inner(&self.pool, device_id, is_active).await {
                Ok(()) => {
                    debug!(device_id = %device_id, is_active, "Device status stored");
                    return Ok(());
                }
                Err(Error::Database(db_err)) => {
                    if attempts >= self.max_attempts || !is_transient_error(&db_err) {
                        error!(
                            "Status upsert for {} failed permanently after {} attempts: {}",
                            device_id, attempts, db_err
                        );
                        return Err(Error::Database(db_err));
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Status upsert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, self.max_attempts, wait_ms, db_err
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn upsert_status_inner(pool: &PgPool, device_id: &str, is_active: bool) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO device_status (device_id, is_active, updated_at)
        VALUES ($1, $2, now())
        ON CONFLICT (device_id) DO UPDATE
        SET is_active = EXCLUDED.is_active, updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(device_id)
    .bind(is_active)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_statuses(
    pool: &PgPool,
    device_id: Option<&str>,
    limit: usize,
    offset: usize,
) -> Result<Vec<DeviceStatusRow>> {
    let rows = sqlx::query_as::<_, DeviceStatusRow>(
        r#"
        SELECT device_id, is_active, updated_at
        FROM device_status
        WHERE $1::text IS NULL OR device_id = $1
        ORDER BY device_id
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(device_id)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-class SQLSTATEs
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
        assert!(!is_transient_error(&sqlx::Error::ColumnNotFound("is_active".to_string())));
    }
}
