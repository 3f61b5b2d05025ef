//! Checkpoint log recognition.
//!
//! A checkpoint produces two server log lines: "starting" and "complete".
//! The starting line is stashed in a single pending slot; when the matching
//! complete line arrives the pair becomes one repository row. Shutdown
//! checkpoints are never recorded, and a complete line without a pending
//! start is swallowed.

use anyhow::{anyhow, Result};
use tokio_postgres::Client;
use tracing::warn;

use crate::config::Messages;
use crate::logger::pattern::capture;

const SQL_INSERT_CHECKPOINT: &str = "\
INSERT INTO statsrepo.checkpoint VALUES \
($1, $2::text::timestamptz, $3, $4, $5, $6, $7, $8, $9, $10)";

/// A matched starting/complete pair, ready for the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointLog {
    pub start: String,
    pub flags: String,
    pub num_buffers: i64,
    pub xlog_added: i64,
    pub xlog_removed: i64,
    pub xlog_recycled: i64,
    pub write_duration: f64,
    pub sync_duration: f64,
    pub total_duration: f64,
}

impl CheckpointLog {
    pub async fn execute(&self, client: &Client, instid: i64) -> Result<()> {
        client
            .execute(
                SQL_INSERT_CHECKPOINT,
                &[
                    &instid,
                    &self.start,
                    &self.flags,
                    &self.num_buffers,
                    &self.xlog_added,
                    &self.xlog_removed,
                    &self.xlog_recycled,
                    &self.write_duration,
                    &self.sync_duration,
                    &self.total_duration,
                ],
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub enum Recognized {
    /// Not a checkpoint message; offer it to the next recognizer.
    NotMine,
    /// Handled without producing a queue item.
    Consumed,
    /// A complete pair; enqueue it.
    Emit(CheckpointLog),
}

#[derive(Debug, Clone)]
struct Pending {
    start: String,
    flags: String,
}

/// Holds the single pending "starting" slot between log lines.
#[derive(Debug, Default)]
pub struct CheckpointRecognizer {
    pending: Option<Pending>,
}

impl CheckpointRecognizer {
    pub fn new() -> CheckpointRecognizer {
        CheckpointRecognizer { pending: None }
    }

    pub fn offer(&mut self, message: &str, timestamp: &str, msgs: &Messages) -> Recognized {
        if let Some(caps) = capture(message, &msgs.checkpoint_starting) {
            if caps.len() < 2 {
                return Recognized::NotMine;
            }
            let kind = &caps[0];
            let flags = &caps[1];

            if kind != "checkpoint" && kind != "restartpoint" {
                return Recognized::NotMine;
            }

            if flags.contains("shutdown") {
                // a shutdown checkpoint also invalidates any partial state
                self.pending = None;
                return Recognized::Consumed;
            }

            // a second "starting" replaces an unmatched first one
            self.pending = Some(Pending {
                start: timestamp.to_string(),
                flags: flags.clone(),
            });
            return Recognized::Consumed;
        }

        if let Some(caps) = capture(message, &msgs.checkpoint_complete) {
            let Some(pending) = self.pending.take() else {
                return Recognized::Consumed;
            };

            match build_log(pending, &caps) {
                Ok(log) => return Recognized::Emit(log),
                Err(e) => {
                    warn!("cannot parse checkpoint complete message: {}", e);
                    return Recognized::Consumed;
                }
            }
        }

        Recognized::NotMine
    }
}

/// Field order in the complete message, after the leading checkpoint type:
/// buffers, percent, xlog added/removed/recycled, then three durations each
/// captured as whole seconds and milliseconds.
fn build_log(pending: Pending, caps: &[String]) -> Result<CheckpointLog> {
    if caps.len() < 12 {
        return Err(anyhow!("expected at least 12 fields, found {}", caps.len()));
    }

    let int = |i: usize| -> Result<i64> {
        caps[i]
            .parse::<i64>()
            .map_err(|_| anyhow!("bad integer field: {}", caps[i]))
    };
    let duration = |sec: usize, msec: usize| -> Result<f64> {
        format!("{}.{}", caps[sec], caps[msec])
            .parse::<f64>()
            .map_err(|_| anyhow!("bad duration: {}.{}", caps[sec], caps[msec]))
    };

    Ok(CheckpointLog {
        start: pending.start,
        flags: pending.flags,
        num_buffers: int(1)?,
        xlog_added: int(3)?,
        xlog_removed: int(4)?,
        xlog_recycled: int(5)?,
        write_duration: duration(6, 7)?,
        sync_duration: duration(8, 9)?,
        total_duration: duration(10, 11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs() -> Messages {
        let mut m = Messages::default();
        m.checkpoint_starting = "%s starting:%s".to_string();
        m.checkpoint_complete = "%s complete: wrote %d buffers (%f%%); \
                                 %d transaction log file(s) added, %d removed, %d recycled; \
                                 write=%d.%d s, sync=%d.%d s, total=%d.%d s"
            .to_string();
        m
    }

    const COMPLETE: &str = "checkpoint complete: wrote 42 buffers (1.6%); \
                            0 transaction log file(s) added, 1 removed, 3 recycled; \
                            write=9.250 s, sync=0.130 s, total=9.400 s";

    #[test]
    fn starting_and_complete_pair_emits_one_item() {
        let m = msgs();
        let mut rec = CheckpointRecognizer::new();

        assert_eq!(
            rec.offer("checkpoint starting: time", "2024-01-01 10:00:00 UTC", &m),
            Recognized::Consumed
        );

        match rec.offer(COMPLETE, "2024-01-01 10:00:10 UTC", &m) {
            Recognized::Emit(log) => {
                assert_eq!(log.start, "2024-01-01 10:00:00 UTC");
                assert_eq!(log.flags, " time");
                assert_eq!(log.num_buffers, 42);
                assert_eq!(log.xlog_added, 0);
                assert_eq!(log.xlog_removed, 1);
                assert_eq!(log.xlog_recycled, 3);
                assert_eq!(log.write_duration, 9.250);
                assert_eq!(log.sync_duration, 0.130);
                assert_eq!(log.total_duration, 9.400);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // the pending slot is cleared
        assert_eq!(
            rec.offer(COMPLETE, "2024-01-01 10:00:20 UTC", &m),
            Recognized::Consumed
        );
    }

    #[test]
    fn shutdown_checkpoint_is_suppressed_and_clears_pending() {
        let m = msgs();
        let mut rec = CheckpointRecognizer::new();

        rec.offer("checkpoint starting: time", "2024-01-01 10:00:00 UTC", &m);
        assert_eq!(
            rec.offer(
                "checkpoint starting: shutdown immediate",
                "2024-01-01 10:00:05 UTC",
                &m
            ),
            Recognized::Consumed
        );

        // the earlier pending start must be gone
        assert_eq!(
            rec.offer(COMPLETE, "2024-01-01 10:00:10 UTC", &m),
            Recognized::Consumed
        );
    }

    #[test]
    fn second_starting_replaces_the_first() {
        let m = msgs();
        let mut rec = CheckpointRecognizer::new();

        rec.offer("checkpoint starting: time", "2024-01-01 10:00:00 UTC", &m);
        rec.offer("checkpoint starting: xlog", "2024-01-01 10:05:00 UTC", &m);

        match rec.offer(COMPLETE, "2024-01-01 10:05:10 UTC", &m) {
            Recognized::Emit(log) => {
                assert_eq!(log.start, "2024-01-01 10:05:00 UTC");
                assert_eq!(log.flags, " xlog");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn restartpoint_counts_as_checkpoint() {
        let m = msgs();
        let mut rec = CheckpointRecognizer::new();
        assert_eq!(
            rec.offer("restartpoint starting: time", "2024-01-01 10:00:00 UTC", &m),
            Recognized::Consumed
        );
    }

    #[test]
    fn unrelated_message_is_not_mine() {
        let m = msgs();
        let mut rec = CheckpointRecognizer::new();
        assert_eq!(
            rec.offer("autovacuum launcher started", "ts", &m),
            Recognized::NotMine
        );
    }
}
