//! Snapshot collection and repository write.
//!
//! Collection runs on the collector against the monitored server and keeps
//! every result set in text form; the write runs later on the writer, all
//! inserts and the closing UPDATE inside one repository transaction so a
//! snapshot is either fully visible or absent.

use anyhow::{anyhow, Result};
use chrono::Local;
use tokio_postgres::Client;

use crate::collector::sql;
use crate::collector::CollectorConn;
use crate::config::Config;
use crate::db::{literal_or_null, simple_rows, TextRows};
use crate::logger::record::Severity;
use crate::queue::DB_MAX_RETRY;
use crate::state::{Shared, ShutdownState};

const SQL_NEW_SNAPSHOT: &str = "\
INSERT INTO statsrepo.snapshot(instid, time, comment) VALUES \
($1, $2::text::timestamptz, $3) RETURNING snapid, CAST(time AS DATE)";

const SQL_UPDATE_SNAPSHOT: &str = "\
UPDATE \
    statsrepo.snapshot \
SET \
    exec_time = pg_catalog.age($2::text::timestamptz, $3::text::timestamptz), \
    snapshot_increase_size = ((SELECT pg_catalog.sum(pg_catalog.pg_relation_size(oid)) FROM pg_class \
                                WHERE relnamespace = (SELECT oid FROM pg_namespace WHERE nspname = 'statsrepo')) - $4::text::bigint), \
    xid_current = pg_catalog.pg_snapshot_xmax(pg_catalog.pg_current_snapshot()) \
WHERE \
    snapid = $1";

const SQL_SELECT_REPOSIZE: &str = "\
SELECT \
    sum(pg_relation_size(oid)) \
FROM \
    pg_class \
WHERE \
    relnamespace = (SELECT oid FROM pg_namespace WHERE nspname = 'statsrepo')";

const HAS_STATSREPO_ALERT: &str = "\
SELECT 1 FROM pg_proc, pg_namespace n \
 WHERE nspname = 'statsrepo' \
   AND proname = 'alert' \
   AND pronamespace = n.oid \
 LIMIT 1";

/// Instance-level collection, in insert order. Activity is queried in its
/// own transaction and prepended; statements are appended when the
/// extension exists, so the insert list carries both ends.
const INSTANCE_GETS: &[&str] = &[
    sql::SELECT_TABLESPACE,
    sql::SELECT_SETTING,
    sql::SELECT_ROLE,
    sql::SELECT_CPU,
    sql::SELECT_DEVICE,
    sql::SELECT_LOADAVG,
    sql::SELECT_MEMORY,
    sql::SELECT_PROFILE,
    sql::SELECT_LOCK,
];

const INSTANCE_PUTS: &[&str] = &[
    "INSERT INTO statsrepo.activity VALUES",
    "INSERT INTO statsrepo.tablespace VALUES",
    "INSERT INTO statsrepo.setting VALUES",
    "INSERT INTO statsrepo.role VALUES",
    "INSERT INTO statsrepo.cpu VALUES",
    "INSERT INTO statsrepo.device VALUES",
    "INSERT INTO statsrepo.loadavg VALUES",
    "INSERT INTO statsrepo.memory VALUES",
    "INSERT INTO statsrepo.profile VALUES",
    "INSERT INTO statsrepo.lock VALUES",
    "INSERT INTO statsrepo.replication VALUES",
    "INSERT INTO statsrepo.statement VALUES",
];

const DATABASE_GETS: &[&str] = &[
    sql::SELECT_SCHEMA,
    sql::SELECT_TABLE,
    sql::SELECT_COLUMN,
    sql::SELECT_INDEX,
    sql::SELECT_INHERITS,
    sql::SELECT_FUNCTION,
];

const DATABASE_PUTS: &[&str] = &[
    "INSERT INTO statsrepo.schema VALUES",
    "INSERT INTO statsrepo.table VALUES",
    "INSERT INTO statsrepo.column VALUES",
    "INSERT INTO statsrepo.index VALUES",
    "INSERT INTO statsrepo.inherits VALUES",
    "INSERT INTO statsrepo.function VALUES",
];

/// One collected snapshot, queued for the writer.
pub struct SnapshotData {
    pub comment: Option<String>,
    pub start: String,
    /// Database list; dbid in column 0, datname in column 1.
    pub dbnames: TextRows,
    /// Instance-level result sets, aligned with `INSTANCE_PUTS`.
    pub instance: Vec<TextRows>,
    /// Per-database result sets, aligned with `DATABASE_PUTS`.
    pub dbsnaps: Vec<Vec<TextRows>>,
}

fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Collect a snapshot from the monitored server. Returns `None` when
/// collection failed (after bounded retries) or shutdown was requested.
pub async fn build_snapshot(
    shared: &Shared,
    conn: &mut Option<CollectorConn>,
    config: &Config,
    comment: Option<String>,
) -> Option<SnapshotData> {
    let start = local_timestamp();

    let mut activity: Option<TextRows> = None;
    let mut dbnames: Option<TextRows> = None;
    let mut instance: Vec<TextRows> = Vec::new();
    let mut statements: Option<TextRows> = None;

    let mut retry = 0;
    while shared.shutdown_state() < ShutdownState::ShutdownRequested && retry < DB_MAX_RETRY {
        retry += 1;
        let Ok(client) = super::collector_connect(shared, conn, config, None).await else {
            super::delay(shared).await;
            continue;
        };

        // activity is queried as its own transaction
        if activity.is_none() {
            match simple_rows(client, sql::SELECT_ACTIVITY).await {
                Ok(rows) => activity = Some(rows),
                Err(e) => {
                    tracing::debug!("snapshot activity failed: {}", e);
                    super::delay(shared).await;
                    continue;
                }
            }
        }

        if dbnames.is_none() {
            match simple_rows(client, &sql::select_database(&config.excluded_dbnames)).await {
                Ok(rows) => dbnames = Some(rows),
                Err(e) => {
                    tracing::debug!("snapshot database list failed: {}", e);
                    super::delay(shared).await;
                    continue;
                }
            }
        }

        match collect_in_transaction(client, instance_gets(config)).await {
            Ok(sets) => {
                instance = sets;
                // statements ride along when the extension is present
                if let Ok(rows) = simple_rows(client, sql::HAS_PG_STAT_STATEMENTS).await {
                    if !rows.is_empty() {
                        statements = simple_rows(client, sql::SELECT_STATEMENT).await.ok();
                    }
                }
                break;
            }
            Err(e) => {
                tracing::debug!("snapshot instance statistics failed: {}", e);
                super::delay(shared).await;
            }
        }
    }

    if instance.is_empty() {
        return None;
    }

    let mut sets = Vec::with_capacity(instance.len() + 2);
    sets.push(activity.unwrap_or_default());
    sets.extend(instance);
    if config.server_version_num < 90100 {
        // keep alignment with the insert list: no replication on old servers
        sets.push(TextRows::new());
    }
    sets.push(statements.unwrap_or_default());

    let dbnames = dbnames.unwrap_or_default();
    let mut dbsnaps = Vec::with_capacity(dbnames.len());
    for db in &dbnames {
        let Some(datname) = db.get(1).and_then(|v| v.as_deref()) else {
            return None;
        };

        let mut dbsnap: Option<Vec<TextRows>> = None;
        let mut retry = 0;
        while shared.shutdown_state() < ShutdownState::ShutdownRequested && retry < DB_MAX_RETRY {
            retry += 1;
            let Ok(client) = super::collector_connect(shared, conn, config, Some(datname)).await
            else {
                super::delay(shared).await;
                continue;
            };
            match collect_in_transaction(client, database_gets(config)).await {
                Ok(sets) => {
                    dbsnap = Some(sets);
                    break;
                }
                Err(e) => {
                    tracing::debug!("snapshot of database \"{}\" failed: {}", datname, e);
                    super::delay(shared).await;
                }
            }
        }

        // a database that cannot be collected aborts the whole snapshot
        dbsnaps.push(dbsnap?);
    }

    Some(SnapshotData {
        comment,
        start,
        dbnames,
        instance: sets,
        dbsnaps,
    })
}

fn instance_gets(config: &Config) -> Vec<&'static str> {
    let mut gets: Vec<&'static str> = INSTANCE_GETS.to_vec();
    if config.server_version_num >= 90100 {
        gets.push(sql::SELECT_REPLICATION);
    }
    gets
}

fn database_gets(config: &Config) -> Vec<&'static str> {
    let mut gets: Vec<&'static str> = DATABASE_GETS[..DATABASE_GETS.len() - 1].to_vec();
    if config.server_version_num >= 80400 {
        gets.push(sql::SELECT_FUNCTION);
    }
    gets
}

async fn collect_in_transaction(client: &Client, gets: Vec<&str>) -> Result<Vec<TextRows>> {
    client.batch_execute("BEGIN").await?;

    let mut sets = Vec::with_capacity(gets.len());
    for get in gets {
        match simple_rows(client, get).await {
            Ok(rows) => sets.push(rows),
            Err(e) => {
                let _ = client.batch_execute("ROLLBACK").await;
                return Err(e);
            }
        }
    }

    client.batch_execute("COMMIT").await?;
    Ok(sets)
}

impl SnapshotData {
    pub async fn execute(&self, client: &Client, instid: i64, shared: &Shared) -> Result<()> {
        let repo_size = simple_rows(client, SQL_SELECT_REPOSIZE)
            .await?
            .first()
            .and_then(|row| row.first().cloned())
            .flatten();

        client.batch_execute("BEGIN").await?;
        let result = self.write_all(client, instid, repo_size).await;
        let snapid = match result {
            Ok(snapid) => {
                client.batch_execute("COMMIT").await?;
                snapid
            }
            Err(e) => {
                let _ = client.batch_execute("ROLLBACK").await;
                return Err(e);
            }
        };

        // alert computation runs outside the snapshot transaction; the
        // snapshot is committed, so alert trouble must not retry the item
        match simple_rows(client, HAS_STATSREPO_ALERT).await {
            Ok(has_alert) if !has_alert.is_empty() => {
                match client
                    .query("SELECT * FROM statsrepo.alert($1)", &[&snapid])
                    .await
                {
                    Ok(alerts) => {
                        for alert in alerts {
                            let message: &str = alert.get(0);
                            shared.elog(Severity::Alert, message);
                        }
                    }
                    Err(e) => tracing::debug!("alert(snapid={}) failed: {}", snapid, e),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("alert check failed: {}", e),
        }
        Ok(())
    }

    async fn write_all(
        &self,
        client: &Client,
        instid: i64,
        repo_size: Option<String>,
    ) -> Result<i64> {
        let rows = client
            .query(SQL_NEW_SNAPSHOT, &[&instid, &self.start, &self.comment])
            .await?;
        let snapid: i64 = rows
            .first()
            .ok_or_else(|| anyhow!("could not create snapshot row"))?
            .get(0);

        put_rows(
            client,
            "INSERT INTO statsrepo.database VALUES",
            &self.dbnames,
            snapid,
            None,
        )
        .await?;

        for (put, set) in INSTANCE_PUTS.iter().zip(self.instance.iter()) {
            put_rows(client, put, set, snapid, None).await?;
        }

        for (db, dbsnap) in self.dbnames.iter().zip(self.dbsnaps.iter()) {
            let dbid = db
                .first()
                .and_then(|v| v.as_deref())
                .ok_or_else(|| anyhow!("database row without dbid"))?;
            for (put, set) in DATABASE_PUTS.iter().zip(dbsnap.iter()) {
                put_rows(client, put, set, snapid, Some(dbid)).await?;
            }
        }

        let end = local_timestamp();
        client
            .execute(
                SQL_UPDATE_SNAPSHOT,
                &[&snapid, &end, &self.start, &repo_size],
            )
            .await?;
        Ok(snapid)
    }
}

/// Copy one text result set into the repository; every value is emitted as
/// a quoted literal and coerced by the server.
async fn put_rows(
    client: &Client,
    insert_prefix: &str,
    rows: &TextRows,
    snapid: i64,
    dbid: Option<&str>,
) -> Result<()> {
    for row in rows {
        let mut stmt = String::with_capacity(64 + row.len() * 16);
        stmt.push_str(insert_prefix);
        stmt.push_str(" (");
        stmt.push_str(&snapid.to_string());
        if let Some(dbid) = dbid {
            stmt.push_str(", ");
            stmt.push_str(&crate::db::quote_literal(dbid));
        }
        for value in row {
            stmt.push_str(", ");
            stmt.push_str(&literal_or_null(value.as_deref()));
        }
        stmt.push(')');
        client.batch_execute(&stmt).await?;
    }
    Ok(())
}
