//! The log tailing worker.
//!
//! Drives the CSV tailer, recognizes performance logs and control
//! sentinels, applies severity adjustment, and emits surviving records to
//! syslog and the text log. The worker is also the drain for the agent's
//! own log queue, and it is the last component to exit: it keeps tailing
//! until the server's shutdown marker is seen or a grace window elapses.

pub mod autovacuum;
pub mod checkpoint;
pub mod output;
pub mod pattern;
pub mod record;
pub mod repolog;
pub mod tailer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::{Config, Messages};
use crate::queue::{QueueItem, WriterQueue};
use crate::state::{SelfLogRecord, Shared, ShutdownState};
use crate::PROGRAM_NAME;

use autovacuum::VacuumKind;
use checkpoint::CheckpointRecognizer;
use output::{format_record, Syslog, TextLog, Verbosity};
use record::{csv_columns, log_required, LogRecord, Severity};
use repolog::{repo_log_row, LogBatch, RepoLogRow};
use tailer::CsvTailer;

/// Control sentinels the in-server functions write at LOG level.
const LOGMSG_SNAPSHOT: &str = "snapshot requested";
const LOGMSG_MAINTENANCE: &str = "maintenance requested";
const LOGMSG_RESTART: &str = "restart requested";

const TICK: Duration = Duration::from_millis(200);

/// The server's own logger can outlive the postmaster by a moment, so keep
/// tailing briefly after everyone else is done.
const LOGGER_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Logger parameters cached from one configuration generation.
struct LoggerParams {
    log_directory: PathBuf,
    verbosity: Verbosity,
    syslog_prefix: String,
    syslog_min: Severity,
    textlog_prefix: String,
    textlog_min: Severity,
    repolog_min: Severity,
    adjust_enabled: bool,
    adjust_rules: Vec<(String, Severity)>,
    csv_columns: usize,
    msgs: Messages,
}

fn load_params(config: &Config) -> LoggerParams {
    LoggerParams {
        log_directory: PathBuf::from(config.absolute_log_directory()),
        verbosity: Verbosity::parse(&config.log_error_verbosity),
        syslog_prefix: config.syslog_line_prefix.clone(),
        syslog_min: config.syslog_min_messages,
        textlog_prefix: config.textlog_line_prefix.clone(),
        textlog_min: config.textlog_min_messages,
        repolog_min: config.repolog_min_messages,
        adjust_enabled: config.adjust_log_level,
        adjust_rules: build_adjust_rules(config),
        csv_columns: csv_columns(config.server_version_num),
        msgs: config.msg.clone(),
    }
}

/// Severity-adjust rules in their fixed precedence order; the first
/// matching sqlstate wins.
fn build_adjust_rules(config: &Config) -> Vec<(String, Severity)> {
    let mut rules = Vec::new();
    for (severity, raw) in [
        (Severity::Fatal, &config.adjust_log_fatal),
        (Severity::Log, &config.adjust_log_log),
        (Severity::Error, &config.adjust_log_error),
        (Severity::Warning, &config.adjust_log_warning),
        (Severity::Notice, &config.adjust_log_notice),
        (Severity::Info, &config.adjust_log_info),
    ] {
        for state in raw.split(',') {
            let state = state.trim();
            if !state.is_empty() {
                rules.push((state.to_string(), severity));
            }
        }
    }
    rules
}

fn adjust_severity(rules: &[(String, Severity)], sqlstate: &str) -> Option<Severity> {
    rules
        .iter()
        .find(|(state, _)| state == sqlstate)
        .map(|(_, severity)| *severity)
}

fn textlog_path(params: &LoggerParams, config: &Config) -> PathBuf {
    if config.textlog_filename.starts_with('/') {
        PathBuf::from(&config.textlog_filename)
    } else {
        params.log_directory.join(&config.textlog_filename)
    }
}

pub async fn run(shared: Arc<Shared>, queue: Arc<WriterQueue>) {
    let mut generation = shared.config.generation();
    let config = shared.config.snapshot();
    let mut params = load_params(&config);

    let mut textlog = TextLog::new(textlog_path(&params, &config), config.textlog_permission);
    let mut syslog = Syslog::new(config.syslog_ident.clone(), config.syslog_facility);
    let mut tailer = CsvTailer::new(
        shared.clone(),
        params.log_directory.clone(),
        config.prev_csv_name.clone(),
    );
    let mut checkpoints = CheckpointRecognizer::new();
    let mut batch: Vec<RepoLogRow> = Vec::new();

    // The logger must not exit while other workers are alive, nor while
    // the postmaster lives and its shutdown message has not been seen.
    while shared.shutdown_state() < ShutdownState::WriterDown
        || (!shared.shutdown_message_found() && shared.postmaster_is_alive())
    {
        let current = shared.config.generation();
        if current != generation {
            generation = current;
            let config = shared.config.snapshot();
            params = load_params(&config);
            textlog.reconfigure(textlog_path(&params, &config), config.textlog_permission);
            syslog.reconfigure(config.syslog_ident.clone(), config.syslog_facility);
        }

        parse_available(
            &shared,
            &queue,
            &params,
            &mut tailer,
            &mut checkpoints,
            &mut textlog,
            &mut syslog,
            &mut batch,
        );
        flush_batch(&queue, &mut batch);

        sleep(TICK).await;

        if shared.shutdown_state() < ShutdownState::ShutdownRequested
            && !shared.postmaster_is_alive()
        {
            shared.shutdown_progress(ShutdownState::ShutdownRequested);
        }

        drain_self_log(&shared, &params, &mut textlog, &mut syslog);
    }

    // Wait a little for the final shutdown marker to reach the log.
    if !shared.shutdown_message_found() {
        let deadline = Instant::now() + LOGGER_EXIT_GRACE;
        loop {
            parse_available(
                &shared,
                &queue,
                &params,
                &mut tailer,
                &mut checkpoints,
                &mut textlog,
                &mut syslog,
                &mut batch,
            );
            drain_self_log(&shared, &params, &mut textlog, &mut syslog);
            if shared.shutdown_message_found() || Instant::now() > deadline {
                break;
            }
            sleep(TICK).await;
        }
    }

    if shared.shutdown_message_found() {
        shared.elog(Severity::Log, "shutdown");
    } else {
        shared.elog(
            Severity::Warning,
            "shutdown because server process exited abnormally",
        );
    }
    drain_self_log(&shared, &params, &mut textlog, &mut syslog);

    shared.shutdown_progress(ShutdownState::LoggerDown);
}

#[allow(clippy::too_many_arguments)]
fn parse_available(
    shared: &Shared,
    queue: &WriterQueue,
    params: &LoggerParams,
    tailer: &mut CsvTailer,
    checkpoints: &mut CheckpointRecognizer,
    textlog: &mut TextLog,
    syslog: &mut Syslog,
    batch: &mut Vec<RepoLogRow>,
) {
    while let Some(fields) = tailer.next(params.csv_columns, textlog) {
        let record = LogRecord::from_fields(fields, &params.msgs);
        process_record(
            shared,
            queue,
            params,
            checkpoints,
            textlog,
            syslog,
            batch,
            record,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn process_record(
    shared: &Shared,
    queue: &WriterQueue,
    params: &LoggerParams,
    checkpoints: &mut CheckpointRecognizer,
    textlog: &mut TextLog,
    syslog: &mut Syslog,
    batch: &mut Vec<RepoLogRow>,
    mut record: LogRecord,
) {
    // Performance logs and control sentinels are consumed, not routed.
    if record.severity == Severity::Log {
        match checkpoints.offer(&record.message, &record.timestamp, &params.msgs) {
            checkpoint::Recognized::Consumed => return,
            checkpoint::Recognized::Emit(log) => {
                queue.send(QueueItem::Checkpoint(log));
                return;
            }
            checkpoint::Recognized::NotMine => {}
        }

        match autovacuum::recognize(&record.message, &record.timestamp, &params.msgs) {
            autovacuum::Recognized::Emit(VacuumKind::Vacuum, log) => {
                queue.send(QueueItem::Autovacuum(log));
                return;
            }
            autovacuum::Recognized::Emit(VacuumKind::Analyze, log) => {
                queue.send(QueueItem::Autoanalyze(log));
                return;
            }
            autovacuum::Recognized::Dropped(trailer) => {
                shared.elog(
                    Severity::Warning,
                    format!("cannot parse rusage: {}", trailer),
                );
                return;
            }
            autovacuum::Recognized::NotMine => {}
        }

        match record.message.as_str() {
            LOGMSG_SNAPSHOT => {
                shared.request_snapshot(record.detail.clone());
                return;
            }
            LOGMSG_MAINTENANCE => {
                shared.request_maintenance(record.detail.clone());
                return;
            }
            LOGMSG_RESTART => {
                shared.set_shutdown_message_found();
                shared.shutdown_progress(ShutdownState::ShutdownRequested);
                return;
            }
            _ => {}
        }
    }

    let original_severity = record.severity;
    if params.adjust_enabled {
        if let Some(adjusted) = adjust_severity(&params.adjust_rules, &record.sqlstate) {
            debug!(
                "adjust log level {:?} -> {:?}: sqlstate=\"{}\"",
                record.severity, adjusted, record.sqlstate
            );
            record.severity = adjusted;
        }
    }

    emit(params, textlog, syslog, &record);

    if params.repolog_min < Severity::Disable
        && log_required(record.severity, params.repolog_min)
    {
        batch.push(repo_log_row(&record, &params.msgs));
    }

    // Well-known markers still drive supervisor state after routing.
    if original_severity == Severity::Log {
        let message = record.message.as_str();
        if message == params.msgs.sighup {
            debug!("server reloaded configuration files");
        } else if message == params.msgs.shutdown {
            shared.set_shutdown_message_found();
        } else if message == params.msgs.shutdown_smart
            || message == params.msgs.shutdown_fast
            || message == params.msgs.shutdown_immediate
        {
            shared.shutdown_progress(ShutdownState::ShutdownRequested);
        }
    }
}

fn emit(params: &LoggerParams, textlog: &mut TextLog, syslog: &mut Syslog, record: &LogRecord) {
    if log_required(record.severity, params.syslog_min) {
        let chunk = format_record(record, &params.syslog_prefix, params.verbosity, &params.msgs);
        syslog.write(record.severity, chunk.trim_end());
    }

    if log_required(record.severity, params.textlog_min) {
        let chunk = format_record(
            record,
            &params.textlog_prefix,
            params.verbosity,
            &params.msgs,
        );
        textlog.append(&chunk);
    }
}

/// Route the agent's own queued log records. These skip the recognizers
/// and severity adjustment; draining a snapshot of the queue also bounds
/// self-log recursion to one level.
fn drain_self_log(
    shared: &Shared,
    params: &LoggerParams,
    textlog: &mut TextLog,
    syslog: &mut Syslog,
) {
    for entry in shared.drain_self_log() {
        let record = self_log_record(entry);
        emit(params, textlog, syslog, &record);
    }
}

fn self_log_record(entry: SelfLogRecord) -> LogRecord {
    LogRecord {
        timestamp: entry.timestamp,
        user: PROGRAM_NAME.to_string(),
        pid: std::process::id().to_string(),
        ps_display: PROGRAM_NAME.to_string(),
        severity: entry.severity,
        sqlstate: "00000".to_string(),
        message: format!("{}: {}", PROGRAM_NAME, entry.message),
        detail: entry.detail,
        application_name: PROGRAM_NAME.to_string(),
        ..LogRecord::default()
    }
}

fn flush_batch(queue: &WriterQueue, batch: &mut Vec<RepoLogRow>) {
    if !batch.is_empty() {
        queue.send(QueueItem::LogBatch(LogBatch {
            rows: std::mem::take(batch),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_adjust() -> Config {
        let mut c = Config::default();
        c.adjust_log_level = true;
        c.adjust_log_fatal = "57P01, 57P02".to_string();
        c.adjust_log_error = "57P01".to_string(); // overlaps: fatal wins
        c.adjust_log_info = "00000".to_string();
        c
    }

    #[test]
    fn adjust_rule_order_is_fatal_first() {
        let rules = build_adjust_rules(&config_with_adjust());
        assert_eq!(adjust_severity(&rules, "57P01"), Some(Severity::Fatal));
        assert_eq!(adjust_severity(&rules, "57P02"), Some(Severity::Fatal));
        assert_eq!(adjust_severity(&rules, "00000"), Some(Severity::Info));
        assert_eq!(adjust_severity(&rules, "42601"), None);
    }

    #[test]
    fn self_log_records_carry_the_program_identity() {
        let record = self_log_record(SelfLogRecord {
            timestamp: "2024-01-01 00:00:00.000 UTC".to_string(),
            severity: Severity::Warning,
            message: "writer discards 3 items".to_string(),
            detail: String::new(),
        });
        assert_eq!(record.user, PROGRAM_NAME);
        assert_eq!(record.sqlstate, "00000");
        assert!(record.message.contains("writer discards 3 items"));
    }
}
