use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    migrate::Migrator,
    sqlite::{SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use tokio::fs;

use crate::{
    models::{NewSandbox, ResourceUsage, SandboxRecord, SandboxStatus},
    FleetError, FleetResult,
};

use super::SandboxStore;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the sandbox database
pub static SANDBOX_DB_MIGRATOR: Migrator = sqlx::migrate!("lib/store/migrations");

const SANDBOX_COLUMNS: &str = r#"
    id, task_id, user_id, container_id, metro_url, status,
    resource_usage_json, error_message, created_at, updated_at, last_activity_at
"#;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`SandboxStore`] backed by SQLite.
///
/// Timestamps are stored as milliseconds since the Unix epoch so the inactivity query can
/// compare them directly.
#[derive(Debug, Clone)]
pub struct SqliteSandboxStore {
    pool: Pool<Sqlite>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SqliteSandboxStore {
    /// Opens the database at `db_path`, creating it and running migrations if needed.
    pub async fn open(db_path: impl AsRef<Path>) -> FleetResult<Self> {
        Ok(Self {
            pool: init_db(db_path, &SANDBOX_DB_MIGRATOR).await?,
        })
    }

    /// Wraps an existing, migrated pool.
    pub fn with_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Initializes a new SQLite database if it doesn't already exist at the specified path.
///
/// ## Arguments
///
/// * `db_path` - Path where the SQLite database file should be created
/// * `migrator` - SQLx migrator containing database schema migrations to run
pub async fn init_db(db_path: impl AsRef<Path>, migrator: &Migrator) -> FleetResult<Pool<Sqlite>> {
    let db_path = db_path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    // Create an empty database file if it doesn't exist
    if !fs::try_exists(db_path).await? {
        fs::File::create(db_path).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("sqlite://{}?mode=rwc", db_path.display()))
        .await?;

    migrator.run(&pool).await?;

    Ok(pool)
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(column: &str, millis: i64) -> FleetResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        FleetError::custom(anyhow::anyhow!(
            "timestamp out of range in column {column}: {millis}"
        ))
    })
}

fn row_to_record(row: &SqliteRow) -> FleetResult<SandboxRecord> {
    let status: String = row.try_get("status")?;
    let resource_usage = row
        .try_get::<Option<String>, _>("resource_usage_json")?
        .map(|json| serde_json::from_str::<ResourceUsage>(&json))
        .transpose()?;

    Ok(SandboxRecord {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        user_id: row.try_get("user_id")?,
        container_id: row.try_get("container_id")?,
        metro_url: row.try_get("metro_url")?,
        status: status.parse()?,
        resource_usage,
        error_message: row.try_get("error_message")?,
        created_at: from_millis("created_at", row.try_get("created_at")?)?,
        updated_at: from_millis("updated_at", row.try_get("updated_at")?)?,
        last_activity_at: from_millis("last_activity_at", row.try_get("last_activity_at")?)?,
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxStore for SqliteSandboxStore {
    async fn insert(&self, sandbox: NewSandbox, now: DateTime<Utc>) -> FleetResult<SandboxRecord> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO sandboxes (
                id, task_id, user_id, container_id, metro_url, status,
                created_at, updated_at, last_activity_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {SANDBOX_COLUMNS}
            "#
        ))
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&sandbox.task_id)
        .bind(&sandbox.user_id)
        .bind(&sandbox.container_id)
        .bind(&sandbox.metro_url)
        .bind(SandboxStatus::Starting.as_str())
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await?;

        row_to_record(&row)
    }

    async fn get(&self, id: &str) -> FleetResult<Option<SandboxRecord>> {
        sqlx::query(&format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_record)
            .transpose()
    }

    async fn get_by_container_id(&self, container_id: &str) -> FleetResult<Option<SandboxRecord>> {
        sqlx::query(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE container_id = ?"
        ))
        .bind(container_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(row_to_record)
        .transpose()
    }

    async fn get_by_task_id(&self, task_id: &str) -> FleetResult<Option<SandboxRecord>> {
        sqlx::query(&format!(
            r#"
            SELECT {SANDBOX_COLUMNS} FROM sandboxes
            WHERE task_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(row_to_record)
        .transpose()
    }

    async fn update(&self, record: &SandboxRecord) -> FleetResult<()> {
        let resource_usage = record
            .resource_usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = ?,
                metro_url = ?,
                resource_usage_json = ?,
                error_message = ?,
                updated_at = ?,
                last_activity_at = MAX(last_activity_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(&record.metro_url)
        .bind(resource_usage)
        .bind(&record.error_message)
        .bind(to_millis(record.updated_at))
        .bind(to_millis(record.last_activity_at))
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::SandboxNotFound(record.container_id.clone()));
        }

        Ok(())
    }

    async fn find_inactive(
        &self,
        status: SandboxStatus,
        cutoff: DateTime<Utc>,
    ) -> FleetResult<Vec<SandboxRecord>> {
        sqlx::query(&format!(
            r#"
            SELECT {SANDBOX_COLUMNS} FROM sandboxes
            WHERE status = ? AND last_activity_at < ?
            ORDER BY last_activity_at ASC
            "#
        ))
        .bind(status.as_str())
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(row_to_record)
        .collect()
    }

    async fn list(&self) -> FleetResult<Vec<SandboxRecord>> {
        sqlx::query(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(row_to_record)
        .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
