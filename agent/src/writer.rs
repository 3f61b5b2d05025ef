//! The repository writer worker.
//!
//! Sole consumer of the work queue. Keeps one repository connection open
//! across items, resolves the instance id once per drain cycle, executes
//! items in submission order, and applies the bounded head-of-line retry
//! policy: a failing item stops the cycle and stays at the head until it
//! succeeds or its retry count reaches the bound.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::time::sleep;
use tokio_postgres::Client;
use tracing::debug;

use crate::config::Config;
use crate::db::Db;
use crate::logger::record::Severity;
use crate::queue::{disposition, Disposition, Queued, WriterQueue, DB_MAX_RETRY};
use crate::state::{Shared, ShutdownState};

const TICK: Duration = Duration::from_millis(200);

/// An idle repository connection is closed after this grace window.
const CONN_KEEP: Duration = Duration::from_secs(60);

const SQL_SELECT_INSTANCE: &str = "\
SELECT instid, pg_version FROM statsrepo.instance \
 WHERE name = $1 AND hostname = $2 AND port = $3";

const SQL_UPDATE_INSTANCE: &str =
    "UPDATE statsrepo.instance SET pg_version = $1 WHERE instid = $2";

const SQL_INSERT_INSTANCE: &str = "\
INSERT INTO statsrepo.instance (name, hostname, port, pg_version) \
 VALUES ($1, $2, $3, $4) RETURNING instid";

pub async fn run(shared: Arc<Shared>, queue: Arc<WriterQueue>) {
    let mut conn: Option<Db> = None;
    let mut generation = shared.config.generation();
    let mut config = shared.config.snapshot();
    let mut last_used = Instant::now();

    // whether the connecting role may lower log_statement is checked once,
    // and again whenever the repository conninfo changes
    let mut superuser = probe_superuser(&shared, &config).await;

    while shared.shutdown_state() < ShutdownState::CollectorDown {
        let current = shared.config.generation();
        if current != generation {
            generation = current;
            conn = None;
            let updated = shared.config.snapshot();
            if updated.repository_server != config.repository_server {
                superuser = probe_superuser(&shared, &updated).await;
            }
            config = updated;
        }

        let remaining =
            process_queue(&shared, &queue, &mut conn, &config, superuser, &mut last_used).await;

        if remaining == 0
            && conn.is_some()
            && last_used.elapsed() > CONN_KEEP
        {
            debug!("disconnect unused writer connection");
            conn = None;
        }

        sleep(TICK).await;
    }

    // one final drain; whatever still fails is discarded
    let remaining =
        process_queue(&shared, &queue, &mut conn, &config, superuser, &mut last_used).await;
    if remaining > 0 {
        shared.elog(
            Severity::Warning,
            format!("writer discards {} items", remaining),
        );
        queue.drain_for_processing();
    }

    drop(conn);
    shared.shutdown_progress(ShutdownState::WriterDown);
}

/// Process the current backlog once; returns the number of items left in
/// the queue afterwards.
async fn process_queue(
    shared: &Shared,
    queue: &WriterQueue,
    conn: &mut Option<Db>,
    config: &Config,
    superuser: bool,
    last_used: &mut Instant,
) -> usize {
    let backlog = queue.drain_for_processing();
    if backlog.is_empty() {
        return 0;
    }

    if !writer_connect(shared, conn, config, superuser).await {
        shared.elog(Severity::Error, "could not connect to repository");
        // nothing can be written; drop the whole backlog
        shared.elog(
            Severity::Warning,
            format!("writer discards {} items", backlog.len()),
        );
        return 0;
    }
    let client = conn.as_ref().expect("writer connection is open").client();

    let mut pending: VecDeque<Queued> = backlog.into();
    let mut connection_used = false;

    match get_instance_id(client, config).await {
        Ok(instid) => {
            connection_used = true;
            while let Some(mut entry) = pending.pop_front() {
                let outcome = entry.item.execute(client, instid, shared).await;
                if let Err(e) = &outcome {
                    debug!("writer item failed: {}", e);
                }
                match disposition(outcome.is_ok(), &mut entry.retry) {
                    Disposition::Done => {}
                    Disposition::Discard => {
                        shared.elog(Severity::Warning, "writer discard an item");
                    }
                    Disposition::Retry => {
                        pending.push_front(entry);
                        break;
                    }
                }
            }
        }
        Err(e) => debug!("could not resolve instance id: {}", e),
    }

    // back off before the failed head is retried
    if !pending.is_empty() {
        crate::collector::delay(shared).await;
    }
    queue.requeue_head(pending.into());

    if connection_used {
        *last_used = Instant::now();
    }
    queue.len()
}

/// Open (or reuse) the repository connection, retrying up to the bound.
async fn writer_connect(
    shared: &Shared,
    conn: &mut Option<Db>,
    config: &Config,
    superuser: bool,
) -> bool {
    let conninfo = config.repository_conninfo(superuser);
    let mut retry = 0;
    loop {
        match Db::ensure(conn, &conninfo, Some("statsrepo"), &config.share_path).await {
            Ok(()) => return true,
            Err(e) => debug!("repository connect failed: {}", e),
        }
        retry += 1;
        if shared.shutdown_state() >= ShutdownState::ShutdownRequested || retry >= DB_MAX_RETRY {
            return false;
        }
        crate::collector::delay(shared).await;
    }
}

/// Resolve this instance's repository id, registering it on first contact
/// and refreshing the stored server version when it changed.
async fn get_instance_id(client: &Client, config: &Config) -> Result<i64> {
    let port = config.port_number()?;
    let host = nodename();

    client.batch_execute("BEGIN TRANSACTION READ WRITE").await?;
    let result = resolve_instance(client, config, host, port).await;
    match result {
        Ok(instid) => {
            client.batch_execute("COMMIT").await?;
            Ok(instid)
        }
        Err(e) => {
            let _ = client.batch_execute("ROLLBACK").await;
            Err(e)
        }
    }
}

async fn resolve_instance(
    client: &Client,
    config: &Config,
    host: &str,
    port: i32,
) -> Result<i64> {
    let rows = client
        .query(SQL_SELECT_INSTANCE, &[&config.instance_id, &host, &port])
        .await?;

    if let Some(row) = rows.first() {
        let instid: i64 = row.get(0);
        let pg_version: String = row.get(1);
        if pg_version != config.server_version_string {
            client
                .execute(
                    SQL_UPDATE_INSTANCE,
                    &[&config.server_version_string, &instid],
                )
                .await?;
        }
        return Ok(instid);
    }

    let inserted = client
        .query(
            SQL_INSERT_INSTANCE,
            &[
                &config.instance_id,
                &host,
                &port,
                &config.server_version_string,
            ],
        )
        .await?;
    inserted
        .first()
        .map(|row| row.get(0))
        .ok_or_else(|| anyhow!("could not register instance"))
}

/// Is the repository role a superuser? Decides whether connections may set
/// log_statement=none.
async fn probe_superuser(shared: &Shared, config: &Config) -> bool {
    let mut conn: Option<Db> = None;
    let conninfo = config.repository_conninfo(false);
    if Db::ensure(&mut conn, &conninfo, Some("statsrepo"), &config.share_path)
        .await
        .is_err()
    {
        shared.elog(Severity::Error, "could not connect to repository");
        return false;
    }

    let client = conn.as_ref().expect("probe connection is open").client();
    match client
        .query("SELECT rolsuper FROM pg_roles WHERE rolname = current_user", &[])
        .await
    {
        Ok(rows) => rows.first().map(|row| row.get::<_, bool>(0)).unwrap_or(false),
        Err(e) => {
            debug!("superuser probe failed: {}", e);
            false
        }
    }
}

/// This host's name, as registered in `statsrepo.instance`.
fn nodename() -> &'static str {
    static NODENAME: OnceLock<String> = OnceLock::new();
    NODENAME.get_or_init(|| {
        hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodename_is_stable_and_non_empty() {
        let first = nodename();
        assert!(!first.is_empty());
        assert_eq!(first, nodename());
    }
}
