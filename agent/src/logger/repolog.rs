//! Repository log shipping.
//!
//! Routed records that pass `repolog_min_messages` are buffered per tick
//! and flushed to the writer as one batch; the batch inserts into
//! `statsrepo.log` in a single transaction. Values travel as text and the
//! repository coerces them, so empty CSV fields become NULLs here.

use anyhow::Result;
use tokio_postgres::Client;

use crate::config::Messages;
use crate::db::literal_or_null;
use crate::logger::record::{severity_label, LogRecord};

/// One `statsrepo.log` row, without the leading instid.
pub type RepoLogRow = Vec<Option<String>>;

pub struct LogBatch {
    pub rows: Vec<RepoLogRow>,
}

/// Shape a routed record into repository column order.
pub fn repo_log_row(record: &LogRecord, msgs: &Messages) -> RepoLogRow {
    let opt = |s: &str| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    };

    vec![
        opt(&record.timestamp),
        opt(&record.user),
        opt(&record.database),
        opt(&record.pid),
        opt(&record.client_addr),
        opt(&record.session_id),
        opt(&record.session_line_num),
        opt(&record.ps_display),
        opt(&record.session_start),
        opt(&record.vxid),
        opt(&record.xid),
        Some(severity_label(msgs, record.severity).to_string()),
        opt(&record.sqlstate),
        opt(&record.message),
        opt(&record.detail),
        opt(&record.hint),
        opt(&record.query),
        opt(&record.query_pos),
        opt(&record.context),
        opt(&record.user_query),
        opt(&record.user_query_pos),
        opt(&record.error_location),
        opt(&record.application_name),
    ]
}

impl LogBatch {
    pub async fn execute(&self, client: &Client, instid: i64) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }

        let mut sql = String::from("BEGIN;\n");
        for row in &self.rows {
            sql.push_str("INSERT INTO statsrepo.log VALUES (");
            sql.push_str(&instid.to_string());
            for value in row {
                sql.push_str(", ");
                sql.push_str(&literal_or_null(value.as_deref()));
            }
            sql.push_str(");\n");
        }
        sql.push_str("COMMIT;");

        if let Err(e) = client.simple_query(&sql).await {
            let _ = client.batch_execute("ROLLBACK").await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::record::Severity;

    #[test]
    fn empty_fields_become_nulls() {
        let record = LogRecord {
            timestamp: "2024-01-01 10:00:00.000 UTC".to_string(),
            pid: "99".to_string(),
            severity: Severity::Error,
            sqlstate: "42601".to_string(),
            message: "syntax error".to_string(),
            ..LogRecord::default()
        };
        let row = repo_log_row(&record, &Messages::default());

        assert_eq!(row.len(), 23);
        assert_eq!(row[0].as_deref(), Some("2024-01-01 10:00:00.000 UTC"));
        assert_eq!(row[1], None); // user
        assert_eq!(row[3].as_deref(), Some("99"));
        assert_eq!(row[11].as_deref(), Some("ERROR"));
        assert_eq!(row[13].as_deref(), Some("syntax error"));
        assert_eq!(row[14], None); // detail
    }
}
