//! The sampling and scheduling worker.
//!
//! One loop drives everything that runs against the monitored server:
//! periodic `statsinfo.sample()` calls, snapshot collection (periodic or
//! requested through the log stream), scheduled maintenance, the external
//! log-maintenance child, and the one-shot hardware-info refresh. The
//! collector is also where configuration reloads enter the process, by
//! re-reading the launcher's parameter stream.

pub mod hardware;
pub mod snapshot;
pub mod sql;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{Local, TimeZone};
use tokio::io::Stdin;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tokio_postgres::Client;
use tracing::debug;

use crate::config::{self, decode_time, Config};
use crate::db::{read_cluster_state, simple_rows, Db};
use crate::logger::record::Severity;
use crate::maintenance::{
    expand_log_maintenance_command, spawn_log_maintenance, LogMaintenanceChild, MaintenanceItem,
};
use crate::queue::{QueueItem, QueueKind, WriterQueue, DB_MAX_RETRY};
use crate::state::{Shared, ShutdownState};

use hardware::HardwareInfo;

const TICK: Duration = Duration::from_millis(200);
const SECS_PER_DAY: i64 = 86_400;

/// The collector's connection to the monitored server, tagged with the
/// database it is pointed at.
pub struct CollectorConn {
    db: Db,
    dbname: String,
}

pub async fn run(shared: Arc<Shared>, queue: Arc<WriterQueue>, stdin: Arc<AsyncMutex<Stdin>>) {
    let mut conn: Option<CollectorConn> = None;
    let mut config = shared.config.snapshot();

    let now = epoch_now();
    let mut next_sample = next_time(now, config.sampling_interval);
    let mut next_snapshot = next_time(now, config.snapshot_interval);
    let mut next_maintenance = next_maintenance_time(&config.maintenance_time, now);
    let mut log_child: Option<LogMaintenanceChild> = None;
    let mut need_hw_update = true;

    while shared.shutdown_state() < ShutdownState::ShutdownRequested {
        let now = epoch_now();

        if shared.take_reload_request() {
            reload(&shared, &stdin, &mut conn).await;
            config = shared.config.snapshot();
            next_maintenance = next_maintenance_time(&config.maintenance_time, now);
        }

        if now >= next_sample {
            debug!("sample ({} sec for next snapshot)", next_snapshot - now);
            do_sample(&shared, &mut conn, &config).await;
            next_sample = next_time(epoch_now(), config.sampling_interval);
        }

        if let Some(comment) = shared.take_snapshot_request() {
            do_snapshot(&shared, &queue, &mut conn, &config, Some(comment)).await;
        }

        if now >= next_snapshot {
            do_snapshot(&shared, &queue, &mut conn, &config, None).await;
            next_snapshot = next_time(epoch_now(), config.snapshot_interval);
        }

        if let Some(period) = shared.take_maintenance_request() {
            match period.trim().parse::<i64>() {
                Ok(period) => queue.send(QueueItem::Maintenance(
                    MaintenanceItem::snapshot_retention(period),
                )),
                Err(_) => shared.elog(
                    Severity::Warning,
                    format!("invalid maintenance request: {}", period),
                ),
            }
        }

        if config.enable_maintenance.enabled() && now >= next_maintenance {
            run_scheduled_maintenance(&shared, &queue, &config, &mut log_child, now);
            next_maintenance += SECS_PER_DAY;
        }

        if let Some(child) = log_child.as_mut() {
            if child.try_reap(&shared).await {
                log_child = None;
            }
        }

        if need_hw_update && update_hardware_info(&shared, &queue, &mut conn, &config).await {
            need_hw_update = false;
        }

        sleep(TICK).await;
    }

    drop(conn);
    shared.shutdown_progress(ShutdownState::CollectorDown);
}

/// Re-read the parameter stream after a reload signal. A changed target
/// server drops the current connection.
async fn reload(shared: &Shared, stdin: &AsyncMutex<Stdin>, conn: &mut Option<CollectorConn>) {
    let mut updated = (*shared.config.snapshot()).clone();
    let prev_target = updated.target_server.clone();

    let mut guard = stdin.lock().await;
    match config::read_frames(&mut *guard, &mut updated).await {
        Ok(()) => {
            if updated.target_server != prev_target {
                *conn = None;
            }
            shared.config.install(updated);
            debug!("configuration reloaded");
        }
        Err(e) => {
            shared.elog(
                Severity::Error,
                format!("could not reload parameters: {}", e),
            );
        }
    }
}

async fn do_sample(shared: &Shared, conn: &mut Option<CollectorConn>, config: &Config) {
    let mut retry = 0;
    while shared.shutdown_state() < ShutdownState::ShutdownRequested && retry < DB_MAX_RETRY {
        retry += 1;
        match collector_connect(shared, conn, config, None).await {
            Ok(client) => match client.batch_execute("SELECT statsinfo.sample()").await {
                Ok(()) => return,
                Err(e) => debug!("sample failed: {}", e),
            },
            Err(e) => debug!("sample connect failed: {}", e),
        }
        delay(shared).await;
    }
}

async fn do_snapshot(
    shared: &Shared,
    queue: &WriterQueue,
    conn: &mut Option<CollectorConn>,
    config: &Config,
    comment: Option<String>,
) {
    // skip when the previous snapshot has not reached the repository yet
    if queue.has_kind(QueueKind::Snapshot) {
        shared.elog(
            Severity::Warning,
            "previous snapshot is not complete, so current snapshot was skipped",
        );
        return;
    }

    let snap = {
        let _guard = shared.maintenance_lock.lock().await;
        snapshot::build_snapshot(shared, conn, config, comment).await
    };

    if let Some(snap) = snap {
        queue.send(QueueItem::Snapshot(snap));
    }
}

fn run_scheduled_maintenance(
    shared: &Shared,
    queue: &WriterQueue,
    config: &Config,
    log_child: &mut Option<LogMaintenanceChild>,
    now: i64,
) {
    // retention cutoffs are relative to today's local midnight
    if config.enable_maintenance.snapshot {
        let period = local_midnight(now) - config.repository_keepday * SECS_PER_DAY;
        queue.send(QueueItem::Maintenance(MaintenanceItem::snapshot_retention(
            period,
        )));
    }

    if config.enable_maintenance.repolog {
        let period = local_midnight(now) - config.repolog_keepday * SECS_PER_DAY;
        queue.send(QueueItem::Maintenance(MaintenanceItem::repolog_retention(
            period,
        )));
    }

    if config.enable_maintenance.log {
        if log_child.is_some() {
            shared.elog(
                Severity::Warning,
                "previous log maintenance is not complete, so current log maintenance was skipped",
            );
        } else {
            let command = expand_log_maintenance_command(
                &config.log_maintenance_command,
                &config.absolute_log_directory(),
            );
            match spawn_log_maintenance(&command) {
                Ok(child) => *log_child = Some(child),
                Err(e) => shared.elog(
                    Severity::Error,
                    format!("could not run the log maintenance command: {}", e),
                ),
            }
        }
    }
}

async fn update_hardware_info(
    shared: &Shared,
    queue: &WriterQueue,
    conn: &mut Option<CollectorConn>,
    config: &Config,
) -> bool {
    let Ok(client) = collector_connect(shared, conn, config, None).await else {
        return false;
    };

    let cpuinfo = simple_rows(client, hardware::SELECT_CPUINFO).await;
    let meminfo = simple_rows(client, hardware::SELECT_MEMINFO).await;
    match (cpuinfo, meminfo) {
        (Ok(cpuinfo), Ok(meminfo)) if !cpuinfo.is_empty() && !meminfo.is_empty() => {
            queue.send(QueueItem::HardwareInfo(HardwareInfo { cpuinfo, meminfo }));
            true
        }
        _ => false,
    }
}

/// Connect to the monitored server. With `db == None` the target database
/// is used and the statsinfo schema is ensured; per-database collection
/// passes an explicit name and needs no schema.
pub async fn collector_connect<'a>(
    shared: &Shared,
    conn: &'a mut Option<CollectorConn>,
    config: &Config,
    db: Option<&str>,
) -> Result<&'a Client> {
    let (dbname, schema) = match db {
        None => (config.target_dbname(), Some("statsinfo")),
        Some(name) => (name.to_string(), None),
    };

    if let Some(existing) = conn.as_ref() {
        if existing.dbname != dbname || !existing.db.is_alive() {
            *conn = None;
        }
    }

    if conn.is_none() {
        // avoid connection attempts during crash recovery and warm standby
        match read_cluster_state(&config.data_directory).await {
            Ok(state) if state.accepts_connections() => {}
            _ => {
                delay(shared).await;
                bail!("server is not ready for accepting connections");
            }
        }

        let conninfo = config.server_conninfo(&dbname);
        let mut slot: Option<Db> = None;
        Db::ensure(&mut slot, &conninfo, schema, &config.share_path).await?;
        *conn = slot.map(|db| CollectorConn { db, dbname });
    }

    Ok(conn
        .as_ref()
        .expect("collector connection just established")
        .db
        .client())
}

/// Pause between retries unless shutdown has been requested.
pub async fn delay(shared: &Shared) {
    if shared.shutdown_state() < ShutdownState::ShutdownRequested {
        sleep(Duration::from_secs(1)).await;
    }
}

fn epoch_now() -> i64 {
    Local::now().timestamp()
}

/// Next firing on the aligned interval, e.g. every full 10 minutes for a
/// 600-second snapshot interval.
fn next_time(now: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return now + 1;
    }
    now + interval - now.rem_euclid(interval)
}

/// Local wall-clock midnight of the day containing `epoch`.
fn local_midnight(epoch: i64) -> i64 {
    let midnight = Local
        .timestamp_opt(epoch, 0)
        .single()
        .and_then(|dt| dt.date_naive().and_hms_opt(0, 0, 0))
        .and_then(|naive| Local.from_local_datetime(&naive).earliest());
    match midnight {
        Some(dt) => dt.timestamp(),
        None => epoch - epoch.rem_euclid(SECS_PER_DAY),
    }
}

/// First firing of the daily maintenance moment at or after `now`.
fn next_maintenance_time(maintenance_time: &str, now: i64) -> i64 {
    let offset = decode_time(maintenance_time).unwrap_or(120);
    let mut at = local_midnight(now) + offset;
    if now >= at {
        at += SECS_PER_DAY;
    }
    at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_interval_scheduling() {
        assert_eq!(next_time(1000, 600), 1200);
        assert_eq!(next_time(1200, 600), 1800);
        assert_eq!(next_time(1199, 600), 1200);
        // degenerate interval still advances
        assert!(next_time(1000, 0) > 1000);
    }

    #[test]
    fn maintenance_moment_is_today_or_tomorrow() {
        let now = epoch_now();
        let at = next_maintenance_time("00:02", now);
        assert!(at > now);
        assert!(at <= now + SECS_PER_DAY);

        let midnight = local_midnight(now);
        assert!(midnight <= now);
        assert!(now - midnight < SECS_PER_DAY);
    }
}
