//! Postgres-backed ledger.
//!
//! Tables:
//! - `deployment`: one lifecycle record per node
//! - `servers`: connection details referenced by `deployment.server_uuid`
//! - `node_logs`: operator-visible log lines, purged on node removal

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::store::Ledger;
use crate::types::{
    DeploymentStatus, LifecycleRecord, LogLevel, NodeId, NodeLogRecord, ServerAuth, ServerRecord,
};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/canopy".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/canopy".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Ledger stored in Postgres.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Create a connection pool and wrap it.
    pub async fn connect(config: &DbConfig) -> LedgerResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to ledger database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.database_url)
            .await
            .map_err(LedgerError::Connect)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations, loading them from disk at runtime.
    pub async fn run_migrations(&self) -> LedgerResult<()> {
        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("libs/ledger/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded ledger migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(LedgerError::Migration)?;
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(LedgerError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    async fn current_status(&self, node_id: NodeId) -> LedgerResult<Option<DeploymentStatus>> {
        Ok(self.get_record(node_id).await?.map(|r| r.status))
    }
}

const RECORD_COLUMNS: &str = "node_id, parent_node_id, process_status, wait_for, server_uuid";

fn record_from_row(row: &PgRow) -> LedgerResult<LifecycleRecord> {
    let node_id: i32 = row.try_get("node_id").map_err(LedgerError::Query)?;
    let parent_id: i32 = row.try_get("parent_node_id").map_err(LedgerError::Query)?;
    let status: String = row.try_get("process_status").map_err(LedgerError::Query)?;
    let wait_for: Vec<i32> = row.try_get("wait_for").map_err(LedgerError::Query)?;
    let server_uuid: String = row.try_get("server_uuid").map_err(LedgerError::Query)?;

    let status = status
        .parse::<DeploymentStatus>()
        .map_err(|e| LedgerError::Corrupt(format!("node {node_id}: {e}")))?;
    let server_ref = Uuid::parse_str(&server_uuid)
        .map_err(|e| LedgerError::Corrupt(format!("node {node_id}: bad server_uuid: {e}")))?;

    Ok(LifecycleRecord {
        node_id: NodeId::new(node_id),
        parent_id: NodeId::new(parent_id),
        status,
        wait_for: wait_for.into_iter().map(NodeId::new).collect(),
        server_ref,
    })
}

fn server_from_row(row: &PgRow) -> LedgerResult<ServerRecord> {
    let server_uuid: String = row.try_get("server_uuid").map_err(LedgerError::Query)?;
    let auth_type: String = row.try_get("auth_type").map_err(LedgerError::Query)?;
    let password: Option<String> = row.try_get("password").map_err(LedgerError::Query)?;
    let private_key_path: Option<String> =
        row.try_get("private_key_path").map_err(LedgerError::Query)?;
    let passphrase: Option<String> = row.try_get("passphrase").map_err(LedgerError::Query)?;
    let ssh_port: i32 = row.try_get("ssh_port").map_err(LedgerError::Query)?;
    let control_port: i32 = row.try_get("control_port").map_err(LedgerError::Query)?;

    let auth = match (auth_type.as_str(), password, private_key_path) {
        ("password", Some(password), _) => ServerAuth::Password { password },
        ("identity", _, Some(private_key_path)) => ServerAuth::Identity {
            private_key_path,
            passphrase,
        },
        (other, _, _) => {
            return Err(LedgerError::Corrupt(format!(
                "server {server_uuid}: incomplete '{other}' credentials"
            )))
        }
    };

    let port = |value: i32, column: &str| {
        u16::try_from(value).map_err(|_| {
            LedgerError::Corrupt(format!("server {server_uuid}: {column} {value} out of range"))
        })
    };

    Ok(ServerRecord {
        server_uuid: Uuid::parse_str(&server_uuid)
            .map_err(|e| LedgerError::Corrupt(format!("bad server_uuid {server_uuid}: {e}")))?,
        ip: row.try_get("ip").map_err(LedgerError::Query)?,
        username: row.try_get("username").map_err(LedgerError::Query)?,
        auth,
        ssh_port: port(ssh_port, "ssh_port")?,
        control_port: port(control_port, "control_port")?,
        name: row.try_get("name").map_err(LedgerError::Query)?,
    })
}

fn ids(nodes: &[NodeId]) -> Vec<i32> {
    nodes.iter().map(NodeId::get).collect()
}

#[async_trait]
impl Ledger for PgLedger {
    async fn list_records(&self) -> LedgerResult<Vec<LifecycleRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM deployment ORDER BY node_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn children_of(&self, parent: NodeId) -> LedgerResult<Vec<LifecycleRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM deployment WHERE parent_node_id = $1 ORDER BY node_id"
        ))
        .bind(parent.get())
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn get_record(&self, node_id: NodeId) -> LedgerResult<Option<LifecycleRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM deployment WHERE node_id = $1"
        ))
        .bind(node_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert_record(&self, record: &LifecycleRecord) -> LedgerResult<()> {
        record.validate().map_err(LedgerError::InvalidRecord)?;

        let result = sqlx::query(
            r#"
            INSERT INTO deployment (node_id, parent_node_id, process_status, wait_for, server_uuid)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (node_id) DO NOTHING
            "#,
        )
        .bind(record.node_id.get())
        .bind(record.parent_id.get())
        .bind(record.status.as_str())
        .bind(ids(&record.wait_for))
        .bind(record.server_ref.to_string())
        .execute(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::Duplicate(record.node_id));
        }
        Ok(())
    }

    async fn transition(
        &self,
        node_id: NodeId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
    ) -> LedgerResult<()> {
        if !expected.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE deployment
            SET process_status = $1, updated_at = now()
            WHERE node_id = $2 AND process_status = $3
            "#,
        )
        .bind(next.as_str())
        .bind(node_id.get())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::Conflict {
                node_id,
                expected,
                actual: self.current_status(node_id).await?,
            });
        }

        debug!(node_id = %node_id, from = %expected, to = %next, "Ledger transition");
        Ok(())
    }

    async fn request_removal(&self, node_id: NodeId, wait_for: &[NodeId]) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deployment
            SET process_status = $1, wait_for = $2, updated_at = now()
            WHERE node_id = $3 AND process_status = $4
            "#,
        )
        .bind(DeploymentStatus::WaitingRemoval.as_str())
        .bind(ids(wait_for))
        .bind(node_id.get())
        .bind(DeploymentStatus::Deployed.as_str())
        .execute(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::Conflict {
                node_id,
                expected: DeploymentStatus::Deployed,
                actual: self.current_status(node_id).await?,
            });
        }
        Ok(())
    }

    async fn delete_record(&self, node_id: NodeId) -> LedgerResult<()> {
        let result = sqlx::query("DELETE FROM deployment WHERE node_id = $1")
            .bind(node_id.get())
            .execute(&self.pool)
            .await
            .map_err(LedgerError::Query)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(node_id));
        }
        Ok(())
    }

    async fn get_server(&self, server_uuid: Uuid) -> LedgerResult<Option<ServerRecord>> {
        let row = sqlx::query(
            r#"
            SELECT server_uuid, ip, username, auth_type, password, private_key_path,
                   passphrase, ssh_port, control_port, name
            FROM servers
            WHERE server_uuid = $1
            "#,
        )
        .bind(server_uuid.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        row.as_ref().map(server_from_row).transpose()
    }

    async fn upsert_server(&self, server: &ServerRecord) -> LedgerResult<()> {
        let (password, private_key_path, passphrase) = match &server.auth {
            ServerAuth::Password { password } => (Some(password.clone()), None, None),
            ServerAuth::Identity {
                private_key_path,
                passphrase,
            } => (None, Some(private_key_path.clone()), passphrase.clone()),
        };

        sqlx::query(
            r#"
            INSERT INTO servers (
                server_uuid, ip, username, auth_type, password, private_key_path,
                passphrase, ssh_port, control_port, name
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (server_uuid) DO UPDATE SET
                ip = excluded.ip,
                username = excluded.username,
                auth_type = excluded.auth_type,
                password = excluded.password,
                private_key_path = excluded.private_key_path,
                passphrase = excluded.passphrase,
                ssh_port = excluded.ssh_port,
                control_port = excluded.control_port,
                name = excluded.name
            "#,
        )
        .bind(server.server_uuid.to_string())
        .bind(&server.ip)
        .bind(&server.username)
        .bind(server.auth.kind())
        .bind(password)
        .bind(private_key_path)
        .bind(passphrase)
        .bind(i32::from(server.ssh_port))
        .bind(i32::from(server.control_port))
        .bind(&server.name)
        .execute(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        Ok(())
    }

    async fn append_log(
        &self,
        node_id: NodeId,
        level: LogLevel,
        message: &str,
    ) -> LedgerResult<()> {
        sqlx::query("INSERT INTO node_logs (node_id, log_level, message) VALUES ($1, $2, $3)")
            .bind(node_id.get())
            .bind(level.as_str())
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(LedgerError::Query)?;
        Ok(())
    }

    async fn logs_for(&self, node_id: NodeId) -> LedgerResult<Vec<NodeLogRecord>> {
        let rows = sqlx::query(
            "SELECT node_id, log_level, message, logged_at FROM node_logs WHERE node_id = $1 ORDER BY id",
        )
        .bind(node_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(LedgerError::Query)?;

        rows.iter()
            .map(|row| {
                let level: String = row.try_get("log_level").map_err(LedgerError::Query)?;
                Ok(NodeLogRecord {
                    node_id: NodeId::new(row.try_get("node_id").map_err(LedgerError::Query)?),
                    level: LogLevel::parse(&level)
                        .ok_or_else(|| LedgerError::Corrupt(format!("log level '{level}'")))?,
                    message: row.try_get("message").map_err(LedgerError::Query)?,
                    logged_at: row.try_get("logged_at").map_err(LedgerError::Query)?,
                })
            })
            .collect()
    }

    async fn purge_node_state(&self, node_id: NodeId) -> LedgerResult<u64> {
        let result = sqlx::query("DELETE FROM node_logs WHERE node_id = $1")
            .bind(node_id.get())
            .execute(&self.pool)
            .await
            .map_err(LedgerError::Query)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert!(config.database_url.starts_with("postgres://"));
    }
}
