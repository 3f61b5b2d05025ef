//! Database connection helper.
//!
//! Both the collector (monitored server) and the writer (repository) keep a
//! single lazily opened connection and install their expected schema on
//! first contact. Result sets that are only ever copied into the repository
//! stay in text form end to end: they are fetched over the simple-query
//! protocol and re-emitted as quoted literals, so the repository server
//! performs all type coercion.

use anyhow::{anyhow, bail, Context, Result};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, info};

/// Rows of a text-mode result set; `None` is SQL NULL.
pub type TextRows = Vec<Vec<Option<String>>>;

pub struct Db {
    client: Client,
}

impl Db {
    /// Make sure `slot` holds a live connection, reconnecting and
    /// installing `schema` if necessary. On failure the slot is cleared.
    pub async fn ensure(
        slot: &mut Option<Db>,
        conninfo: &str,
        schema: Option<&str>,
        share_path: &str,
    ) -> Result<()> {
        if let Some(db) = slot.as_ref() {
            if db.is_alive() {
                return Ok(());
            }
        }
        *slot = None;

        match Db::connect(conninfo, schema, share_path).await {
            Ok(db) => {
                *slot = Some(db);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn connect(conninfo: &str, schema: Option<&str>, share_path: &str) -> Result<Db> {
        let (client, connection) = tokio_postgres::connect(conninfo, NoTls)
            .await
            .context("could not connect")?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("connection terminated: {}", e);
            }
        });

        client
            .batch_execute("SET search_path = 'pg_catalog', 'public'")
            .await?;

        let db = Db { client };
        if let Some(schema) = schema {
            db.ensure_schema(schema, share_path).await?;
        }
        Ok(db)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn is_alive(&self) -> bool {
        !self.client.is_closed()
    }

    pub async fn server_version_num(&self) -> Result<i32> {
        server_version_num(&self.client).await
    }

    /// Install the schema from `<share_path>/contrib/pg_<schema>.sql` when
    /// it is not present yet. The repository schema additionally needs
    /// plpgsql, a partition-aware script on 8.4+, and the alert script.
    async fn ensure_schema(&self, schema: &str, share_path: &str) -> Result<()> {
        if schema.is_empty() {
            return Ok(());
        }

        let installed = self
            .client
            .query(
                "SELECT nspname FROM pg_namespace WHERE nspname = $1",
                &[&schema],
            )
            .await?;
        if !installed.is_empty() {
            return Ok(());
        }

        let mut script_schema = schema.to_string();
        if schema == "statsrepo" {
            let version = self.server_version_num().await?;
            script_schema = if version >= 80400 {
                "statsrepo_partition".to_string()
            } else {
                "statsrepo83".to_string()
            };

            let plpgsql = self
                .client
                .simple_query("SELECT 1 FROM pg_language WHERE lanname = 'plpgsql'")
                .await?;
            if !has_rows(&plpgsql) {
                self.client.batch_execute("CREATE LANGUAGE plpgsql").await?;
            }
        }

        info!("installing schema: {}", script_schema);
        self.execute_script(&format!("{}/contrib/pg_{}.sql", share_path, script_schema))
            .await?;

        if schema == "statsrepo" {
            self.execute_script(&format!("{}/contrib/pg_statsrepo_alert.sql", share_path))
                .await?;
        }
        Ok(())
    }

    async fn execute_script(&self, path: &str) -> Result<()> {
        let script = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("could not read file \"{}\"", path))?;
        self.client
            .batch_execute(&script)
            .await
            .with_context(|| format!("could not execute script \"{}\"", path))
    }
}

/// Run a query over the simple-query protocol, collecting every value as
/// text.
pub async fn simple_rows(client: &Client, sql: &str) -> Result<TextRows> {
    let messages = client.simple_query(sql).await?;
    let mut rows = Vec::new();
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            let mut values = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                values.push(row.get(i).map(|v| v.to_string()));
            }
            rows.push(values);
        }
    }
    Ok(rows)
}

fn has_rows(messages: &[SimpleQueryMessage]) -> bool {
    messages
        .iter()
        .any(|m| matches!(m, SimpleQueryMessage::Row(_)))
}

pub async fn server_version_num(client: &Client) -> Result<i32> {
    let rows = simple_rows(client, "SHOW server_version_num").await?;
    rows.first()
        .and_then(|r| r.first())
        .and_then(|v| v.as_deref())
        .and_then(|v| v.parse::<i32>().ok())
        .ok_or_else(|| anyhow!("could not read server_version_num"))
}

/// Quote a text value as an SQL literal. Unknown-typed literals are coerced
/// by the server to the target column type, which is what the generic
/// snapshot copy relies on.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "''");
    if value.contains('\\') {
        format!("E'{}'", escaped)
    } else {
        format!("'{}'", escaped)
    }
}

/// Render a text value (or NULL) for interpolation into a statement.
pub fn literal_or_null(value: Option<&str>) -> String {
    match value {
        Some(v) => quote_literal(v),
        None => "NULL".to_string(),
    }
}

/// Cluster state from the control file, read before the first connection so
/// the agent does not hammer a server that is not accepting connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    InProduction,
    InArchiveRecovery,
    Other(u32),
}

impl ClusterState {
    pub fn accepts_connections(&self) -> bool {
        matches!(
            self,
            ClusterState::InProduction | ClusterState::InArchiveRecovery
        )
    }
}

/// Read the `state` field of `<data_directory>/global/pg_control`. Layout:
/// u64 system identifier, u32 control version, u32 catalog version, then
/// the state word.
pub async fn read_cluster_state(data_directory: &str) -> Result<ClusterState> {
    let path = format!("{}/global/pg_control", data_directory);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("could not read control file \"{}\"", path))?;
    if bytes.len() < 20 {
        bail!("control file \"{}\" is truncated", path);
    }

    let state = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    Ok(match state {
        6 => ClusterState::InProduction,
        5 => ClusterState::InArchiveRecovery,
        other => ClusterState::Other(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_literals() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("a\\b"), "E'a\\\\b'");
        assert_eq!(literal_or_null(None), "NULL");
        assert_eq!(literal_or_null(Some("x")), "'x'");
    }

    #[tokio::test]
    async fn control_file_state_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global");
        std::fs::create_dir(&global).unwrap();

        let mut control = vec![0u8; 64];
        control[16..20].copy_from_slice(&6u32.to_le_bytes());
        std::fs::write(global.join("pg_control"), &control).unwrap();

        let state = read_cluster_state(dir.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(state, ClusterState::InProduction);
        assert!(state.accepts_connections());
    }
}
