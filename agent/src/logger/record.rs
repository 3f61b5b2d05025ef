//! Server log records: severity levels and the CSV log grammar.
//!
//! The server writes one CSV record per log entry. Fields are comma
//! separated, quoted when they contain commas, quotes or newlines, and
//! embedded quotes are doubled. A record therefore may span multiple lines;
//! the reader below is a streaming parser and never assumes one record per
//! line.

use std::io::BufRead;

use crate::config::Messages;

/// Log severities, ordered so that `a >= b` means "a is at least as severe
/// as b". `Alert` is agent-private (repository alert output) and `Disable`
/// is only meaningful as a threshold that suppresses everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Log,
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
    Panic,
    Alert,
    Disable,
}

/// Whether a record at `severity` passes the `min` threshold.
pub fn log_required(severity: Severity, min: Severity) -> bool {
    severity >= min
}

/// Parse a severity name. Localized names from the message templates win
/// over the English names so the agent follows the server's lc_messages.
pub fn str_to_severity(msgs: &Messages, value: &str) -> Option<Severity> {
    let eq = |t: &str| !t.is_empty() && t.eq_ignore_ascii_case(value);

    if eq(&msgs.debug) {
        return Some(Severity::Debug);
    } else if eq(&msgs.info) {
        return Some(Severity::Info);
    } else if eq(&msgs.notice) {
        return Some(Severity::Notice);
    } else if eq(&msgs.log) {
        return Some(Severity::Log);
    } else if eq(&msgs.warning) {
        return Some(Severity::Warning);
    } else if eq(&msgs.error) {
        return Some(Severity::Error);
    } else if eq(&msgs.fatal) {
        return Some(Severity::Fatal);
    } else if eq(&msgs.panic) {
        return Some(Severity::Panic);
    }

    match value.to_ascii_uppercase().as_str() {
        "DEBUG" | "DEBUG1" | "DEBUG2" | "DEBUG3" | "DEBUG4" | "DEBUG5" => Some(Severity::Debug),
        "LOG" => Some(Severity::Log),
        "INFO" => Some(Severity::Info),
        "NOTICE" => Some(Severity::Notice),
        "WARNING" => Some(Severity::Warning),
        "ERROR" => Some(Severity::Error),
        "FATAL" => Some(Severity::Fatal),
        "PANIC" => Some(Severity::Panic),
        "ALERT" => Some(Severity::Alert),
        "DISABLE" => Some(Severity::Disable),
        _ => None,
    }
}

/// Severity tag for emitted log lines, localized when templates are loaded.
pub fn severity_label<'a>(msgs: &'a Messages, severity: Severity) -> &'a str {
    let localized = match severity {
        Severity::Debug => &msgs.debug,
        Severity::Log => &msgs.log,
        Severity::Info => &msgs.info,
        Severity::Notice => &msgs.notice,
        Severity::Warning => &msgs.warning,
        Severity::Error => &msgs.error,
        Severity::Fatal => &msgs.fatal,
        Severity::Panic => &msgs.panic,
        Severity::Alert | Severity::Disable => "",
    };
    if !localized.is_empty() {
        return localized;
    }
    match severity {
        Severity::Debug => "DEBUG",
        Severity::Log => "LOG",
        Severity::Info => "INFO",
        Severity::Notice => "NOTICE",
        Severity::Warning => "WARNING",
        Severity::Error => "ERROR",
        Severity::Fatal => "FATAL",
        Severity::Panic => "PANIC",
        Severity::Alert => "ALERT",
        Severity::Disable => "DISABLE",
    }
}

/// Number of CSV columns the server writes; application_name was appended
/// in 9.0.
pub fn csv_columns(server_version_num: i32) -> usize {
    if server_version_num >= 90000 {
        23
    } else {
        22
    }
}

/// One parsed CSV log record.
#[derive(Debug, Clone, Default)]
pub struct LogRecord {
    pub timestamp: String,
    pub user: String,
    pub database: String,
    pub pid: String,
    pub client_addr: String,
    pub session_id: String,
    pub session_line_num: String,
    pub ps_display: String,
    pub session_start: String,
    pub vxid: String,
    pub xid: String,
    pub severity: Severity,
    pub sqlstate: String,
    pub message: String,
    pub detail: String,
    pub hint: String,
    pub query: String,
    pub query_pos: String,
    pub context: String,
    pub user_query: String,
    pub user_query_pos: String,
    pub error_location: String,
    pub application_name: String,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Log
    }
}

impl LogRecord {
    /// Build a record from the raw CSV fields, in server column order.
    /// `fields` has already been validated to hold 22 or 23 entries.
    pub fn from_fields(fields: Vec<String>, msgs: &Messages) -> LogRecord {
        let mut it = fields.into_iter();
        let mut next = || it.next().unwrap_or_default();

        let mut rec = LogRecord {
            timestamp: next(),
            user: next(),
            database: next(),
            pid: next(),
            client_addr: next(),
            session_id: next(),
            session_line_num: next(),
            ps_display: next(),
            session_start: next(),
            vxid: next(),
            xid: next(),
            severity: Severity::Log,
            sqlstate: String::new(),
            message: String::new(),
            detail: String::new(),
            hint: String::new(),
            query: String::new(),
            query_pos: String::new(),
            context: String::new(),
            user_query: String::new(),
            user_query_pos: String::new(),
            error_location: String::new(),
            application_name: String::new(),
        };
        let level = next();
        rec.severity = str_to_severity(msgs, &level).unwrap_or(Severity::Log);
        rec.sqlstate = next();
        rec.message = next();
        rec.detail = next();
        rec.hint = next();
        rec.query = next();
        rec.query_pos = next();
        rec.context = next();
        rec.user_query = next();
        rec.user_query_pos = next();
        rec.error_location = next();
        rec.application_name = next();
        rec
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CsvReadError {
    #[error("malformed CSV record: expected {expected} columns, found {found}")]
    MalformedRecord { expected: usize, found: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of one read attempt.
#[derive(Debug)]
pub enum CsvRead {
    /// A complete record with exactly the expected column count.
    Record(Vec<String>),
    /// Clean EOF at a record boundary or in the middle of a record; the
    /// caller must not advance its offset and should retry later.
    Incomplete,
}

/// Read one CSV record (exactly `ncolumns` fields, newline terminated)
/// from the reader's current position.
pub fn read_csv_record<R: BufRead>(
    reader: &mut R,
    ncolumns: usize,
) -> Result<CsvRead, CsvReadError> {
    let mut fields: Vec<String> = Vec::with_capacity(ncolumns);
    let mut field: Vec<u8> = Vec::new();
    let mut in_quotes = false;

    loop {
        let byte = match next_byte(reader)? {
            Some(b) => b,
            None => return Ok(CsvRead::Incomplete),
        };

        if in_quotes {
            if byte == b'"' {
                // doubled quote is a literal quote, lone quote ends the field
                match peek_byte(reader)? {
                    Some(b'"') => {
                        next_byte(reader)?;
                        field.push(b'"');
                    }
                    _ => in_quotes = false,
                }
            } else {
                field.push(byte);
            }
            continue;
        }

        match byte {
            b'"' if field.is_empty() => in_quotes = true,
            b',' => {
                fields.push(String::from_utf8_lossy(&field).into_owned());
                field.clear();
            }
            b'\r' => {}
            b'\n' => {
                fields.push(String::from_utf8_lossy(&field).into_owned());
                if fields.len() != ncolumns {
                    return Err(CsvReadError::MalformedRecord {
                        expected: ncolumns,
                        found: fields.len(),
                    });
                }
                return Ok(CsvRead::Record(fields));
            }
            _ => field.push(byte),
        }
    }
}

fn next_byte<R: BufRead>(reader: &mut R) -> Result<Option<u8>, CsvReadError> {
    let buf = reader.fill_buf()?;
    if buf.is_empty() {
        return Ok(None);
    }
    let b = buf[0];
    reader.consume(1);
    Ok(Some(b))
}

fn peek_byte<R: BufRead>(reader: &mut R) -> Result<Option<u8>, CsvReadError> {
    let buf = reader.fill_buf()?;
    Ok(buf.first().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn msgs() -> Messages {
        Messages::default()
    }

    #[test]
    fn reads_simple_record() {
        let data = "a,b,c\n";
        let mut r = Cursor::new(data.as_bytes());
        match read_csv_record(&mut r, 3).unwrap() {
            CsvRead::Record(fields) => assert_eq!(fields, vec!["a", "b", "c"]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn reads_quoted_fields_with_embedded_newline_and_quotes() {
        let data = "x,\"line one\nline \"\"two\"\"\",z\n";
        let mut r = Cursor::new(data.as_bytes());
        match read_csv_record(&mut r, 3).unwrap() {
            CsvRead::Record(fields) => {
                assert_eq!(fields[0], "x");
                assert_eq!(fields[1], "line one\nline \"two\"");
                assert_eq!(fields[2], "z");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn partial_record_is_incomplete() {
        let data = "a,b"; // no terminating newline yet
        let mut r = Cursor::new(data.as_bytes());
        assert!(matches!(
            read_csv_record(&mut r, 3).unwrap(),
            CsvRead::Incomplete
        ));
    }

    #[test]
    fn wrong_column_count_is_malformed() {
        let data = "a,b\n";
        let mut r = Cursor::new(data.as_bytes());
        assert!(matches!(
            read_csv_record(&mut r, 3),
            Err(CsvReadError::MalformedRecord {
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn severity_falls_back_to_english_names() {
        let m = msgs();
        assert_eq!(str_to_severity(&m, "WARNING"), Some(Severity::Warning));
        assert_eq!(str_to_severity(&m, "debug2"), Some(Severity::Debug));
        assert_eq!(str_to_severity(&m, "ALERT"), Some(Severity::Alert));
        assert_eq!(str_to_severity(&m, "nonsense"), None);
    }

    #[test]
    fn localized_severity_wins() {
        let mut m = msgs();
        m.warning = "WARNUNG".to_string();
        assert_eq!(str_to_severity(&m, "WARNUNG"), Some(Severity::Warning));
    }

    #[test]
    fn severity_order_matches_routing_thresholds() {
        assert!(log_required(Severity::Error, Severity::Warning));
        assert!(!log_required(Severity::Info, Severity::Warning));
        assert!(log_required(Severity::Log, Severity::Log));
        assert!(!log_required(Severity::Panic, Severity::Disable));
    }
}
