//! Autovacuum and autoanalyze log recognition.
//!
//! Both messages end with an rusage trailer in the fixed, non-localized
//! shape `CPU %fs/%fu sec elapsed %f sec`; it is re-parsed separately. The
//! repository rows back-compute the start time as "reported time minus
//! elapsed seconds" in SQL.

use anyhow::{anyhow, Result};
use tokio_postgres::Client;

use crate::config::Messages;
use crate::logger::pattern::capture;

const MSG_RUSAGE: &str = "CPU %fs/%fu sec elapsed %f sec";

const SQL_INSERT_AUTOVACUUM: &str = "\
INSERT INTO statsrepo.autovacuum VALUES \
($1, $2::text::timestamptz - interval '1sec' * $16, \
 $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)";

const SQL_INSERT_AUTOANALYZE: &str = "\
INSERT INTO statsrepo.autoanalyze VALUES \
($1, $2::text::timestamptz - interval '1sec' * $6, $3, $4, $5, $6)";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rusage {
    pub cpu_sys: f64,
    pub cpu_user: f64,
    pub elapsed: f64,
}

/// One recognized autovacuum or autoanalyze event.
#[derive(Debug, Clone, PartialEq)]
pub struct AutovacuumLog {
    /// Timestamp of the log line; the event finished at this moment.
    pub finish: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub index_scans: i64,
    pub pages_removed: i64,
    pub pages_remain: i64,
    pub tuples_removed: i64,
    pub tuples_remain: i64,
    /// Buffer statistics, present from server 9.2 message formats on.
    pub page_hit: Option<i64>,
    pub page_miss: Option<i64>,
    pub page_dirty: Option<i64>,
    pub read_rate: Option<f64>,
    pub write_rate: Option<f64>,
    pub rusage: Rusage,
}

impl AutovacuumLog {
    pub async fn execute_vacuum(&self, client: &Client, instid: i64) -> Result<()> {
        client
            .execute(
                SQL_INSERT_AUTOVACUUM,
                &[
                    &instid,
                    &self.finish,
                    &self.database,
                    &self.schema,
                    &self.table,
                    &self.index_scans,
                    &self.pages_removed,
                    &self.pages_remain,
                    &self.tuples_removed,
                    &self.tuples_remain,
                    &self.page_hit,
                    &self.page_miss,
                    &self.page_dirty,
                    &self.read_rate,
                    &self.write_rate,
                    &self.rusage.elapsed,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn execute_analyze(&self, client: &Client, instid: i64) -> Result<()> {
        client
            .execute(
                SQL_INSERT_AUTOANALYZE,
                &[
                    &instid,
                    &self.finish,
                    &self.database,
                    &self.schema,
                    &self.table,
                    &self.rusage.elapsed,
                ],
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumKind {
    Vacuum,
    Analyze,
}

#[derive(Debug, PartialEq)]
pub enum Recognized {
    NotMine,
    /// Matched, but the rusage trailer could not be parsed; the event is
    /// dropped with the offending trailer for the warning.
    Dropped(String),
    Emit(VacuumKind, AutovacuumLog),
}

pub fn recognize(message: &str, timestamp: &str, msgs: &Messages) -> Recognized {
    let (kind, caps) = if let Some(caps) = capture(message, &msgs.autovacuum) {
        (VacuumKind::Vacuum, caps)
    } else if let Some(caps) = capture(message, &msgs.autoanalyze) {
        (VacuumKind::Analyze, caps)
    } else {
        return Recognized::NotMine;
    };

    let Some(trailer) = caps.last() else {
        return Recognized::NotMine;
    };
    let Some(usage) = capture(trailer, MSG_RUSAGE) else {
        return Recognized::Dropped(trailer.clone());
    };
    let rusage = Rusage {
        cpu_sys: usage[0].parse().unwrap_or(0.0),
        cpu_user: usage[1].parse().unwrap_or(0.0),
        elapsed: usage[2].parse().unwrap_or(0.0),
    };

    match build_log(kind, timestamp, &caps, rusage) {
        Ok(log) => Recognized::Emit(kind, log),
        Err(_) => Recognized::Dropped(trailer.clone()),
    }
}

fn build_log(
    kind: VacuumKind,
    timestamp: &str,
    caps: &[String],
    rusage: Rusage,
) -> Result<AutovacuumLog> {
    let fields = caps.len() - 1; // without the rusage trailer
    let int = |i: usize| -> Result<i64> {
        caps[i]
            .parse::<i64>()
            .map_err(|_| anyhow!("bad integer field: {}", caps[i]))
    };
    let float = |i: usize| -> Result<f64> {
        caps[i]
            .parse::<f64>()
            .map_err(|_| anyhow!("bad float field: {}", caps[i]))
    };

    let mut log = AutovacuumLog {
        finish: timestamp.to_string(),
        database: caps[0].clone(),
        schema: caps[1].clone(),
        table: caps[2].clone(),
        index_scans: 0,
        pages_removed: 0,
        pages_remain: 0,
        tuples_removed: 0,
        tuples_remain: 0,
        page_hit: None,
        page_miss: None,
        page_dirty: None,
        read_rate: None,
        write_rate: None,
        rusage,
    };

    match kind {
        VacuumKind::Analyze => {
            if fields != 3 {
                return Err(anyhow!("unexpected autoanalyze field count: {}", fields));
            }
        }
        VacuumKind::Vacuum => {
            if fields != 8 && fields != 13 {
                return Err(anyhow!("unexpected autovacuum field count: {}", fields));
            }
            log.index_scans = int(3)?;
            log.pages_removed = int(4)?;
            log.pages_remain = int(5)?;
            log.tuples_removed = int(6)?;
            log.tuples_remain = int(7)?;
            if fields == 13 {
                log.page_hit = Some(int(8)?);
                log.page_miss = Some(int(9)?);
                log.page_dirty = Some(int(10)?);
                log.read_rate = Some(float(11)?);
                log.write_rate = Some(float(12)?);
            }
        }
    }
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs() -> Messages {
        let mut m = Messages::default();
        m.autovacuum = "automatic vacuum of table \"%s.%s.%s\": index scans: %d\n\
                        pages: %d removed, %d remain\n\
                        tuples: %d removed, %d remain\n\
                        system usage: %s"
            .to_string();
        m.autoanalyze = "automatic analyze of table \"%s.%s.%s\" system usage: %s".to_string();
        m
    }

    #[test]
    fn recognizes_autoanalyze() {
        let message = "automatic analyze of table \"db.sch.tab\" system usage: \
                       CPU 0.01s/0.02u sec elapsed 0.30 sec";
        match recognize(message, "2024-03-04 09:15:00 UTC", &msgs()) {
            Recognized::Emit(VacuumKind::Analyze, log) => {
                assert_eq!(log.database, "db");
                assert_eq!(log.schema, "sch");
                assert_eq!(log.table, "tab");
                assert_eq!(log.rusage.cpu_sys, 0.01);
                assert_eq!(log.rusage.cpu_user, 0.02);
                assert_eq!(log.rusage.elapsed, 0.30);
                assert_eq!(log.finish, "2024-03-04 09:15:00 UTC");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn recognizes_autovacuum_with_numeric_fields() {
        let message = "automatic vacuum of table \"db.public.t1\": index scans: 2\n\
                       pages: 10 removed, 90 remain\n\
                       tuples: 1000 removed, 5000 remain\n\
                       system usage: CPU 0.10s/0.20u sec elapsed 1.50 sec";
        match recognize(message, "ts", &msgs()) {
            Recognized::Emit(VacuumKind::Vacuum, log) => {
                assert_eq!(log.index_scans, 2);
                assert_eq!(log.pages_removed, 10);
                assert_eq!(log.pages_remain, 90);
                assert_eq!(log.tuples_removed, 1000);
                assert_eq!(log.tuples_remain, 5000);
                assert_eq!(log.page_hit, None);
                assert_eq!(log.rusage.elapsed, 1.50);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unreadable_rusage_drops_the_event() {
        let message = "automatic analyze of table \"db.sch.tab\" system usage: garbage";
        match recognize(message, "ts", &msgs()) {
            Recognized::Dropped(trailer) => assert_eq!(trailer, "garbage"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn other_messages_are_not_mine() {
        assert_eq!(
            recognize("checkpoint starting: time", "ts", &msgs()),
            Recognized::NotMine
        );
    }
}
