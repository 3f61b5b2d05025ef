//! Text log and syslog emitters.
//!
//! Both destinations share the server-style line prefix expansion. The
//! text log is opened lazily under a umask derived from the configured
//! permission bits and is renamed to the retired CSV's base name on
//! rotation, so each `.log` file covers the same time window as its `.csv`
//! sibling.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::Messages;
use crate::logger::record::{severity_label, LogRecord, Severity};
use crate::logger::tailer::log_buddy_path;

/// How much of a record is written out, mirroring log_error_verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Terse,
    Default,
    Verbose,
}

impl Verbosity {
    pub fn parse(value: &str) -> Verbosity {
        if value.eq_ignore_ascii_case("terse") {
            Verbosity::Terse
        } else if value.eq_ignore_ascii_case("verbose") {
            Verbosity::Verbose
        } else {
            Verbosity::Default
        }
    }
}

/// Expand a log_line_prefix style template for one record.
pub fn expand_prefix(template: &str, record: &LogRecord) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('u') => out.push_str(&record.user),
            Some('d') => out.push_str(&record.database),
            Some('p') => out.push_str(&record.pid),
            Some('t') | Some('m') => out.push_str(&record.timestamp),
            Some('i') => out.push_str(&record.ps_display),
            Some('c') => out.push_str(&record.session_id),
            Some('l') => out.push_str(&record.session_line_num),
            Some('s') => out.push_str(&record.session_start),
            Some('v') => out.push_str(&record.vxid),
            Some('x') => out.push_str(&record.xid),
            Some('a') => out.push_str(&record.application_name),
            Some('e') => out.push_str(&record.sqlstate),
            Some('r') => {
                out.push_str(&record.client_addr);
            }
            Some('h') => out.push_str(&record.client_addr),
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

/// Render one record as text log lines (terminated by a newline).
pub fn format_record(
    record: &LogRecord,
    prefix: &str,
    verbosity: Verbosity,
    msgs: &Messages,
) -> String {
    let mut out = String::new();
    let tag = severity_label(msgs, record.severity);

    out.push_str(&expand_prefix(prefix, record));
    out.push_str(tag);
    out.push_str(":  ");
    out.push_str(&record.message);
    out.push('\n');

    if verbosity == Verbosity::Terse {
        return out;
    }

    for (label, value) in [
        ("DETAIL", &record.detail),
        ("HINT", &record.hint),
        ("QUERY", &record.query),
        ("CONTEXT", &record.context),
    ] {
        if !value.is_empty() {
            out.push_str(label);
            out.push_str(":  ");
            out.push_str(value);
            out.push('\n');
        }
    }

    if verbosity == Verbosity::Verbose && !record.error_location.is_empty() {
        out.push_str("LOCATION:  ");
        out.push_str(&record.error_location);
        out.push('\n');
    }
    out
}

/// The agent-managed text log file.
pub struct TextLog {
    path: PathBuf,
    permission: u32,
    file: Option<File>,
}

impl TextLog {
    pub fn new(path: PathBuf, permission: u32) -> TextLog {
        TextLog {
            path,
            permission: permission & 0o666,
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point at a (possibly) new path and permission after a reload; an
    /// open file keeps its handle but gets the permission reapplied.
    pub fn reconfigure(&mut self, path: PathBuf, permission: u32) {
        self.permission = permission & 0o666;
        if self.file.is_some() {
            let _ = std::fs::set_permissions(
                &self.path,
                std::fs::Permissions::from_mode(self.permission),
            );
        } else {
            self.path = path;
        }
    }

    /// Append one pre-formatted chunk, opening the file lazily. On write
    /// failure the file is closed so the next write reopens it.
    pub fn append(&mut self, chunk: &str) -> bool {
        if self.file.is_none() {
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
            {
                Ok(file) => {
                    let _ = std::fs::set_permissions(
                        &self.path,
                        std::fs::Permissions::from_mode(self.permission),
                    );
                    self.file = Some(file);
                }
                Err(e) => {
                    debug!("could not open textlog \"{}\": {}", self.path.display(), e);
                    return false;
                }
            }
        }

        let file = self.file.as_mut().expect("textlog file just opened");
        if let Err(e) = file.write_all(chunk.as_bytes()).and_then(|_| file.flush()) {
            debug!("could not write textlog \"{}\": {}", self.path.display(), e);
            self.file = None;
            return false;
        }
        true
    }

    /// The CSV file at `csv_path` is being retired: close the text log and
    /// rename it to the CSV's base name so the pair stays together.
    pub fn retire(&mut self, csv_path: &Path) {
        self.file = None;
        if csv_path.exists() && self.path.exists() {
            let target = log_buddy_path(csv_path);
            if let Err(e) = std::fs::rename(&self.path, &target) {
                debug!(
                    "could not rename \"{}\" to \"{}\": {}",
                    self.path.display(),
                    target.display(),
                    e
                );
            }
        }
    }
}

/// Syslog destination, reopened whenever the identity or facility changes.
pub struct Syslog {
    ident: String,
    facility: i32,
    logger: Option<syslog::Logger<syslog::LoggerBackend, syslog::Formatter3164>>,
}

impl Syslog {
    pub fn new(ident: String, facility: i32) -> Syslog {
        Syslog {
            ident,
            facility,
            logger: None,
        }
    }

    pub fn reconfigure(&mut self, ident: String, facility: i32) {
        if self.ident != ident || self.facility != facility {
            self.ident = ident;
            self.facility = facility;
            self.logger = None;
        }
    }

    pub fn write(&mut self, severity: Severity, line: &str) {
        if self.logger.is_none() {
            let formatter = syslog::Formatter3164 {
                facility: facility_of(self.facility),
                hostname: None,
                process: self.ident.clone(),
                pid: std::process::id(),
            };
            match syslog::unix(formatter) {
                Ok(logger) => self.logger = Some(logger),
                Err(e) => {
                    debug!("could not open syslog: {}", e);
                    return;
                }
            }
        }

        let logger = self.logger.as_mut().expect("syslog just opened");
        let line = line.to_string();
        let result = match severity {
            Severity::Panic | Severity::Fatal => logger.crit(line),
            Severity::Alert => logger.alert(line),
            Severity::Error => logger.err(line),
            Severity::Warning => logger.warning(line),
            Severity::Notice => logger.notice(line),
            Severity::Debug => logger.debug(line),
            _ => logger.info(line),
        };
        if result.is_err() {
            self.logger = None;
        }
    }
}

fn facility_of(n: i32) -> syslog::Facility {
    match n {
        1 => syslog::Facility::LOG_LOCAL1,
        2 => syslog::Facility::LOG_LOCAL2,
        3 => syslog::Facility::LOG_LOCAL3,
        4 => syslog::Facility::LOG_LOCAL4,
        5 => syslog::Facility::LOG_LOCAL5,
        6 => syslog::Facility::LOG_LOCAL6,
        7 => syslog::Facility::LOG_LOCAL7,
        _ => syslog::Facility::LOG_LOCAL0,
    }
}
