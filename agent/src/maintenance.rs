//! Scheduled maintenance: repository retention sweeps and the external
//! log-maintenance command.
//!
//! Retention runs as queue items so it shares the writer's connection and
//! retry policy. The log-maintenance command is an operator-supplied shell
//! command spawned in the background; the collector reaps it without
//! blocking and reports a failing exit with a stderr snippet.

use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use chrono::{Local, TimeZone};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio_postgres::Client;
use tracing::debug;

use crate::db::server_version_num;
use crate::logger::record::Severity;
use crate::state::Shared;

const SQL_MAINTENANCE_PARTITION: &str =
    "SELECT statsrepo.del_snapshot2($1::text::timestamptz)";
const SQL_MAINTENANCE: &str = "SELECT statsrepo.del_snapshot($1::text::timestamptz)";
const SQL_MAINTENANCE_REPOLOG: &str = "SELECT statsrepo.del_repolog($1::text::timestamptz)";

/// The original reads at most 256 bytes of the child's stderr; longer
/// output is truncated.
const STDERR_SNIPPET_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionKind {
    /// `statsrepo.del_snapshot[2]`: snapshot rows older than the cutoff.
    Snapshot,
    /// `statsrepo.del_repolog`: shipped server log rows.
    RepoLog,
}

/// A retention sweep with its cutoff as local epoch seconds.
pub struct MaintenanceItem {
    kind: RetentionKind,
    period_epoch: i64,
}

impl MaintenanceItem {
    pub fn snapshot_retention(period_epoch: i64) -> MaintenanceItem {
        MaintenanceItem {
            kind: RetentionKind::Snapshot,
            period_epoch,
        }
    }

    pub fn repolog_retention(period_epoch: i64) -> MaintenanceItem {
        MaintenanceItem {
            kind: RetentionKind::RepoLog,
            period_epoch,
        }
    }

    pub fn kind(&self) -> RetentionKind {
        self.kind
    }

    pub fn period_epoch(&self) -> i64 {
        self.period_epoch
    }

    pub async fn execute(&self, client: &Client, shared: &Shared) -> Result<()> {
        let cutoff = format_cutoff(self.period_epoch)?;

        match self.kind {
            RetentionKind::RepoLog => {
                client
                    .execute(SQL_MAINTENANCE_REPOLOG, &[&cutoff])
                    .await?;
            }
            RetentionKind::Snapshot => {
                let version = server_version_num(client).await?;
                if version >= 80400 {
                    // partitioned sweep must not overlap a snapshot build
                    let _guard = shared.maintenance_lock.lock().await;
                    client
                        .execute(SQL_MAINTENANCE_PARTITION, &[&cutoff])
                        .await?;
                } else {
                    client.execute(SQL_MAINTENANCE, &[&cutoff]).await?;
                }
            }
        }
        Ok(())
    }
}

fn format_cutoff(period_epoch: i64) -> Result<String> {
    let cutoff = Local
        .timestamp_opt(period_epoch, 0)
        .single()
        .ok_or_else(|| anyhow!("invalid retention cutoff: {}", period_epoch))?;
    Ok(cutoff.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Expand the log-maintenance command template: `%l` is the absolute log
/// directory, `%%` a literal percent; any other `%` is kept as-is.
pub fn expand_log_maintenance_command(template: &str, log_directory: &str) -> String {
    let mut out = String::with_capacity(template.len() + log_directory.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('l') => out.push_str(log_directory),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// A running log-maintenance child with its stderr pipe.
pub struct LogMaintenanceChild {
    child: Child,
    stderr: Option<ChildStderr>,
}

/// Spawn the expanded command via `/bin/sh -c` with stderr piped.
pub fn spawn_log_maintenance(command: &str) -> Result<LogMaintenanceChild> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("could not run the log maintenance command")?;

    let stderr = child.stderr.take();
    Ok(LogMaintenanceChild { child, stderr })
}

impl LogMaintenanceChild {
    /// Non-blocking reap. Returns true once the child has exited; a
    /// failing status is reported with up to a 256-byte stderr snippet.
    pub async fn try_reap(&mut self, shared: &Shared) -> bool {
        match self.child.try_wait() {
            Ok(None) => {
                debug!("log maintenance command is running");
                false
            }
            Ok(Some(status)) => {
                if !status.success() {
                    let snippet = self.read_stderr_snippet().await;
                    let message = match (status.code(), signal_of(&status)) {
                        (Some(code), _) => format!(
                            "log maintenance command failed with exit code {}: {}",
                            code, snippet
                        ),
                        (None, Some(signal)) => format!(
                            "log maintenance command was terminated by signal {}: {}",
                            signal, snippet
                        ),
                        (None, None) => format!(
                            "log maintenance command exited with unrecognized status: {}",
                            snippet
                        ),
                    };
                    shared.elog(Severity::Error, message);
                }
                true
            }
            Err(e) => {
                shared.elog(
                    Severity::Error,
                    format!("failed to wait for the log maintenance command: {}", e),
                );
                true
            }
        }
    }

    async fn read_stderr_snippet(&mut self) -> String {
        let Some(stderr) = self.stderr.as_mut() else {
            return String::new();
        };
        let mut buf = vec![0u8; STDERR_SNIPPET_MAX];
        match tokio::time::timeout(std::time::Duration::from_secs(1), stderr.read(&mut buf)).await
        {
            Ok(Ok(n)) => String::from_utf8_lossy(&buf[..n]).trim_end().to_string(),
            _ => String::new(),
        }
    }
}

fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn command_template_expands_log_directory() {
        assert_eq!(
            expand_log_maintenance_command(
                "find %l -name '*.log' -mtime +7 -delete",
                "/var/lib/pgsql/data/pg_log"
            ),
            "find /var/lib/pgsql/data/pg_log -name '*.log' -mtime +7 -delete"
        );
        assert_eq!(
            expand_log_maintenance_command("rate is 100%% for %l", "/logs"),
            "rate is 100% for /logs"
        );
        assert_eq!(expand_log_maintenance_command("odd %x stays", "/logs"), "odd %x stays");
    }

    #[tokio::test]
    async fn failing_child_reports_exit_code_and_stderr() {
        let shared = crate::state::Shared::new(Config::default());
        let mut child =
            spawn_log_maintenance("echo boom >&2; exit 3").expect("spawn must work");

        // wait for the child to finish, then reap
        let mut reaped = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if child.try_reap(&shared).await {
                reaped = true;
                break;
            }
        }
        assert!(reaped, "child was never reaped");

        let logs = shared.drain_self_log();
        let error = logs
            .iter()
            .find(|l| l.severity == Severity::Error)
            .expect("an ERROR self-log");
        assert!(error.message.contains("exit code 3"), "got: {}", error.message);
        assert!(error.message.contains("boom"), "got: {}", error.message);
    }

    #[tokio::test]
    async fn successful_child_is_reaped_quietly() {
        let shared = crate::state::Shared::new(Config::default());
        let mut child = spawn_log_maintenance("true").expect("spawn must work");

        let mut reaped = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if child.try_reap(&shared).await {
                reaped = true;
                break;
            }
        }
        assert!(reaped);
        assert!(shared
            .drain_self_log()
            .iter()
            .all(|l| l.severity < Severity::Error));
    }

    #[test]
    fn cutoff_formats_as_local_timestamp() {
        let s = format_cutoff(0).unwrap();
        assert_eq!(s.len(), "1970-01-01 00:00:00".len());
    }
}
