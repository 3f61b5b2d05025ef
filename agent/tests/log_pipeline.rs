//! End-to-end tests for the log intake path: CSV files on disk, through
//! the tailer and record parser, into the recognizers and the writer
//! queue.

use std::path::PathBuf;

use agent::config::{Config, Messages};
use agent::logger::autovacuum::{self, VacuumKind};
use agent::logger::checkpoint::{CheckpointRecognizer, Recognized};
use agent::logger::output::TextLog;
use agent::logger::record::{csv_columns, LogRecord, Severity};
use agent::logger::tailer::CsvTailer;
use agent::queue::{QueueItem, QueueKind, WriterQueue};
use agent::state::Shared;

fn messages() -> Messages {
    let mut m = Messages::default();
    m.checkpoint_starting = "%s starting:%s".to_string();
    m.checkpoint_complete = "%s complete: wrote %d buffers (%f%%); \
                             %d transaction log file(s) added, %d removed, %d recycled; \
                             write=%d.%d s, sync=%d.%d s, total=%d.%d s"
        .to_string();
    m.autoanalyze = "automatic analyze of table \"%s.%s.%s\" system usage: %s".to_string();
    m
}

/// One CSV log line the way a 9.x server writes it: 23 columns, the
/// message quoted.
fn csv_line(timestamp: &str, severity: &str, message: &str) -> String {
    let quoted = format!("\"{}\"", message.replace('"', "\"\""));
    let mut fields = vec![
        timestamp.to_string(),
        "postgres".to_string(),
        "postgres".to_string(),
        "12345".to_string(),
        String::new(),
        "65df3e60.3039".to_string(),
        "1".to_string(),
        String::new(),
        "2024-01-01 09:59:00 UTC".to_string(),
        String::new(),
        "0".to_string(),
        severity.to_string(),
        "00000".to_string(),
        quoted,
    ];
    fields.extend(std::iter::repeat(String::new()).take(9));
    fields.join(",") + "\n"
}

struct Pipeline {
    _dir: tempfile::TempDir,
    log_dir: PathBuf,
    shared: std::sync::Arc<Shared>,
    tailer: CsvTailer,
    textlog: TextLog,
    msgs: Messages,
    columns: usize,
}

impl Pipeline {
    fn new() -> Pipeline {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().to_path_buf();

        let mut config = Config::default();
        config.server_version_num = 90100;
        let shared = Shared::new(config);

        let tailer = CsvTailer::new(
            shared.clone(),
            log_dir.clone(),
            "0000-00-00_000000.csv".to_string(),
        );
        let textlog = TextLog::new(log_dir.join("pg_statsinfo.log"), 0o600);

        Pipeline {
            _dir: dir,
            log_dir,
            shared,
            tailer,
            textlog,
            msgs: messages(),
            columns: csv_columns(90100),
        }
    }

    fn write_log(&self, name: &str, content: &str) {
        std::fs::write(self.log_dir.join(name), content).unwrap();
    }

    fn next_record(&mut self) -> Option<LogRecord> {
        self.tailer
            .next(self.columns, &mut self.textlog)
            .map(|fields| LogRecord::from_fields(fields, &self.msgs))
    }
}

#[test]
fn checkpoint_pair_from_csv_becomes_one_queue_item() {
    let mut pipeline = Pipeline::new();
    let content = csv_line(
        "2024-01-01 10:00:00.000 UTC",
        "LOG",
        "checkpoint starting: time",
    ) + &csv_line(
        "2024-01-01 10:00:10.000 UTC",
        "LOG",
        "checkpoint complete: wrote 42 buffers (1.6%); \
         0 transaction log file(s) added, 1 removed, 3 recycled; \
         write=9.250 s, sync=0.130 s, total=9.400 s",
    );
    pipeline.write_log("2024-01-01_100000.csv", &content);

    let queue = WriterQueue::new();
    let mut recognizer = CheckpointRecognizer::new();

    while let Some(record) = pipeline.next_record() {
        assert_eq!(record.severity, Severity::Log);
        match recognizer.offer(&record.message, &record.timestamp, &pipeline.msgs) {
            Recognized::Emit(log) => queue.send(QueueItem::Checkpoint(log)),
            Recognized::Consumed => {}
            Recognized::NotMine => panic!("line was not recognized: {}", record.message),
        }
    }

    assert!(queue.has_kind(QueueKind::Checkpoint));
    let drained = queue.drain_for_processing();
    assert_eq!(drained.len(), 1);
    match &drained[0].item {
        QueueItem::Checkpoint(log) => {
            assert_eq!(log.start, "2024-01-01 10:00:00.000 UTC");
            assert_eq!(log.flags, " time");
            assert_eq!(log.num_buffers, 42);
            assert_eq!(log.xlog_added, 0);
            assert_eq!(log.xlog_removed, 1);
            assert_eq!(log.xlog_recycled, 3);
            assert_eq!(log.write_duration, 9.250);
            assert_eq!(log.sync_duration, 0.130);
            assert_eq!(log.total_duration, 9.400);
        }
        _ => panic!("expected a checkpoint item"),
    }
}

#[test]
fn autoanalyze_line_is_recognized_with_rusage() {
    let mut pipeline = Pipeline::new();
    pipeline.write_log(
        "2024-03-04_091500.csv",
        &csv_line(
            "2024-03-04 09:15:00.000 UTC",
            "LOG",
            "automatic analyze of table \"db.sch.tab\" system usage: \
             CPU 0.01s/0.02u sec elapsed 0.30 sec",
        ),
    );

    let record = pipeline.next_record().expect("one record");
    match autovacuum::recognize(&record.message, &record.timestamp, &pipeline.msgs) {
        autovacuum::Recognized::Emit(VacuumKind::Analyze, log) => {
            assert_eq!(log.database, "db");
            assert_eq!(log.schema, "sch");
            assert_eq!(log.table, "tab");
            assert_eq!(log.rusage.cpu_sys, 0.01);
            assert_eq!(log.rusage.cpu_user, 0.02);
            assert_eq!(log.rusage.elapsed, 0.30);
            assert_eq!(log.finish, "2024-03-04 09:15:00.000 UTC");
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn control_sentinel_detail_lands_in_the_shared_cell() {
    let mut pipeline = Pipeline::new();

    // the detail column (index 14) carries the sentinel payload
    let mut fields: Vec<String> = csv_line(
        "2024-01-01 10:00:00.000 UTC",
        "LOG",
        "snapshot requested",
    )
    .trim_end()
    .split(',')
    .map(|s| s.trim_matches('"').to_string())
    .collect();
    fields[14] = "manual comment".to_string();
    pipeline.write_log("2024-01-01_100000.csv", &(fields.join(",") + "\n"));

    let record = pipeline.next_record().expect("one record");
    assert_eq!(record.message, "snapshot requested");
    assert_eq!(record.detail, "manual comment");

    // what the logger does with it
    pipeline.shared.request_snapshot(record.detail.clone());
    assert_eq!(
        pipeline.shared.take_snapshot_request().as_deref(),
        Some("manual comment")
    );
}

#[test]
fn embedded_newlines_in_messages_survive_the_round_trip() {
    let mut pipeline = Pipeline::new();
    pipeline.write_log(
        "2024-01-01_100000.csv",
        &csv_line(
            "2024-01-01 10:00:00.000 UTC",
            "ERROR",
            "syntax error at or near \"selct\"\nLINE 1: selct 1",
        ),
    );

    let record = pipeline.next_record().expect("one record");
    assert_eq!(record.severity, Severity::Error);
    assert!(record.message.contains('\n'));
    assert!(record.message.contains("\"selct\""));
}

#[test]
fn rotation_preserves_reading_order_across_files() {
    let mut pipeline = Pipeline::new();
    pipeline.write_log(
        "2024-01-01_100000.csv",
        &csv_line("2024-01-01 10:00:00.000 UTC", "LOG", "first window"),
    );

    let record = pipeline.next_record().expect("record from first file");
    assert_eq!(record.message, "first window");
    assert!(pipeline.next_record().is_none());

    pipeline.write_log(
        "2024-01-01_110000.csv",
        &csv_line("2024-01-01 11:00:00.000 UTC", "LOG", "second window"),
    );

    let record = pipeline.next_record().expect("record from second file");
    assert_eq!(record.message, "second window");
    assert_eq!(pipeline.tailer.current_name(), "2024-01-01_110000.csv");
}
