//! Agent configuration.
//!
//! The launcher (the in-server library that spawns this daemon) feeds the
//! agent a stream of length-prefixed name/value frames on standard input:
//! `u32 name_len, name, u32 value_len, value`, little endian, terminated by
//! a frame with `name_len == 0`. The same stream delivers updated values on
//! reload. Unknown names are rejected.
//!
//! Workers never lock the live configuration: they snapshot an
//! `Arc<Config>` from [`ConfigHandle`] and compare generations to notice a
//! reload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::logger::record::{str_to_severity, Severity};

/// Prefix of the agent's own GUC-style options.
pub const GUC_PREFIX: &str = "pg_statsinfo";

/// Localized message templates, delivered with `:`-prefixed keys so the
/// recognizers can follow the server's lc_messages.
#[derive(Debug, Clone, Default)]
pub struct Messages {
    pub debug: String,
    pub info: String,
    pub notice: String,
    pub log: String,
    pub warning: String,
    pub error: String,
    pub fatal: String,
    pub panic: String,
    pub shutdown: String,
    pub shutdown_smart: String,
    pub shutdown_fast: String,
    pub shutdown_immediate: String,
    pub sighup: String,
    pub autovacuum: String,
    pub autoanalyze: String,
    pub checkpoint_starting: String,
    pub checkpoint_complete: String,
}

/// Which scheduled maintenance actions are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceMode {
    pub snapshot: bool,
    pub log: bool,
    pub repolog: bool,
}

impl MaintenanceMode {
    pub fn enabled(&self) -> bool {
        self.snapshot || self.log || self.repolog
    }

    fn parse(value: &str) -> Result<MaintenanceMode> {
        match value.to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" | "1" => {
                return Ok(MaintenanceMode {
                    snapshot: true,
                    log: true,
                    repolog: true,
                })
            }
            "off" | "false" | "no" | "0" => return Ok(MaintenanceMode::default()),
            _ => {}
        }

        let mut mode = MaintenanceMode::default();
        for word in value.split(',') {
            match word.trim().to_ascii_lowercase().as_str() {
                "snapshot" => mode.snapshot = true,
                "log" => mode.log = true,
                "repolog" => mode.repolog = true,
                other => bail!("invalid maintenance mode: {}", other),
            }
        }
        Ok(mode)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /*---- system parameters from the launcher ----*/
    pub instance_id: String,
    pub postmaster_pid: i32,
    pub port: String,
    pub share_path: String,
    pub prev_csv_name: String,
    pub server_version_num: i32,
    pub server_version_string: String,
    pub server_encoding: i32,
    pub data_directory: String,
    pub log_timezone: String,
    pub log_directory: String,
    pub log_filename: String,
    pub log_error_verbosity: String,
    pub syslog_facility: i32,
    pub syslog_ident: String,

    /*---- collector options ----*/
    pub target_server: String,
    pub excluded_dbnames: String,
    pub sampling_interval: i64,
    pub snapshot_interval: i64,

    /*---- logger options ----*/
    pub syslog_line_prefix: String,
    pub syslog_min_messages: Severity,
    pub textlog_filename: String,
    pub textlog_line_prefix: String,
    pub textlog_min_messages: Severity,
    pub textlog_permission: u32,
    pub repolog_min_messages: Severity,
    pub adjust_log_level: bool,
    pub adjust_log_info: String,
    pub adjust_log_notice: String,
    pub adjust_log_warning: String,
    pub adjust_log_error: String,
    pub adjust_log_log: String,
    pub adjust_log_fatal: String,

    /*---- writer / maintenance options ----*/
    pub repository_server: String,
    pub enable_maintenance: MaintenanceMode,
    pub maintenance_time: String,
    pub repository_keepday: i64,
    pub repolog_keepday: i64,
    pub log_maintenance_command: String,

    pub msg: Messages,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            instance_id: String::new(),
            postmaster_pid: 0,
            port: String::new(),
            share_path: String::new(),
            prev_csv_name: String::new(),
            server_version_num: 0,
            server_version_string: String::new(),
            server_encoding: -1,
            data_directory: String::new(),
            log_timezone: "UTC".to_string(),
            log_directory: String::new(),
            log_filename: "postgresql-%Y-%m-%d_%H%M%S.log".to_string(),
            log_error_verbosity: "default".to_string(),
            syslog_facility: 0,
            syslog_ident: "postgres".to_string(),

            target_server: String::new(),
            excluded_dbnames: String::new(),
            sampling_interval: 5,
            snapshot_interval: 600,

            syslog_line_prefix: String::new(),
            syslog_min_messages: Severity::Disable,
            textlog_filename: "pg_statsinfo.log".to_string(),
            textlog_line_prefix: String::new(),
            textlog_min_messages: Severity::Warning,
            textlog_permission: 0o600,
            repolog_min_messages: Severity::Disable,
            adjust_log_level: false,
            adjust_log_info: String::new(),
            adjust_log_notice: String::new(),
            adjust_log_warning: String::new(),
            adjust_log_error: String::new(),
            adjust_log_log: String::new(),
            adjust_log_fatal: String::new(),

            repository_server: String::new(),
            enable_maintenance: MaintenanceMode::default(),
            maintenance_time: "00:02:00".to_string(),
            repository_keepday: 7,
            repolog_keepday: 7,
            log_maintenance_command: String::new(),

            msg: Messages::default(),
        }
    }
}

impl Config {
    /// Assign one parameter. Unknown names are an error; the supervisor
    /// treats that as fatal at startup.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<()> {
        let guc = name
            .strip_prefix(GUC_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'));

        if let Some(option) = guc {
            return self
                .apply_guc(option, value)
                .with_context(|| format!("unexpected parameter: {} = {}", name, value));
        }

        match name {
            "instance_id" => self.instance_id = value.to_string(),
            "postmaster_pid" => self.postmaster_pid = parse_int(value)? as i32,
            "port" => self.port = value.to_string(),
            "share_path" => self.share_path = value.to_string(),
            "prev_csv_name" => self.prev_csv_name = value.to_string(),
            "server_version_num" => self.server_version_num = parse_int(value)? as i32,
            "server_version_string" => self.server_version_string = value.to_string(),
            "server_encoding" => self.server_encoding = parse_int(value)? as i32,
            "data_directory" => self.data_directory = value.to_string(),
            "log_timezone" => self.log_timezone = value.to_string(),
            "log_directory" => self.log_directory = value.to_string(),
            "log_filename" => self.log_filename = value.to_string(),
            "log_error_verbosity" => self.log_error_verbosity = value.to_string(),
            "syslog_facility" => self.syslog_facility = parse_syslog_facility(value),
            "syslog_ident" => self.syslog_ident = value.to_string(),
            ":debug" => self.msg.debug = value.to_string(),
            ":info" => self.msg.info = value.to_string(),
            ":notice" => self.msg.notice = value.to_string(),
            ":log" => self.msg.log = value.to_string(),
            ":warning" => self.msg.warning = value.to_string(),
            ":error" => self.msg.error = value.to_string(),
            ":fatal" => self.msg.fatal = value.to_string(),
            ":panic" => self.msg.panic = value.to_string(),
            ":shutdown" => self.msg.shutdown = value.to_string(),
            ":shutdown_smart" => self.msg.shutdown_smart = value.to_string(),
            ":shutdown_fast" => self.msg.shutdown_fast = value.to_string(),
            ":shutdown_immediate" => self.msg.shutdown_immediate = value.to_string(),
            ":sighup" => self.msg.sighup = value.to_string(),
            ":autovacuum" => self.msg.autovacuum = value.to_string(),
            ":autoanalyze" => self.msg.autoanalyze = value.to_string(),
            ":checkpoint_starting" => self.msg.checkpoint_starting = value.to_string(),
            ":checkpoint_complete" => self.msg.checkpoint_complete = value.to_string(),
            _ => bail!("unexpected parameter: {} = {}", name, value),
        }
        Ok(())
    }

    fn apply_guc(&mut self, option: &str, value: &str) -> Result<()> {
        match option {
            "target_server" => self.target_server = value.to_string(),
            "excluded_dbnames" => self.excluded_dbnames = value.to_string(),
            "sampling_interval" => self.sampling_interval = parse_int(value)?,
            "snapshot_interval" => self.snapshot_interval = parse_int(value)?,
            "syslog_line_prefix" => self.syslog_line_prefix = value.to_string(),
            "syslog_min_messages" => self.syslog_min_messages = self.parse_severity(value)?,
            "textlog_min_messages" => self.textlog_min_messages = self.parse_severity(value)?,
            "textlog_filename" => self.textlog_filename = value.to_string(),
            "textlog_line_prefix" => self.textlog_line_prefix = value.to_string(),
            "textlog_permission" => self.textlog_permission = parse_int(value)? as u32,
            "repolog_min_messages" => self.repolog_min_messages = self.parse_severity(value)?,
            "repolog_keepday" => self.repolog_keepday = parse_int(value)?,
            "adjust_log_level" => self.adjust_log_level = parse_bool(value)?,
            "adjust_log_info" => self.adjust_log_info = value.to_string(),
            "adjust_log_notice" => self.adjust_log_notice = value.to_string(),
            "adjust_log_warning" => self.adjust_log_warning = value.to_string(),
            "adjust_log_error" => self.adjust_log_error = value.to_string(),
            "adjust_log_log" => self.adjust_log_log = value.to_string(),
            "adjust_log_fatal" => self.adjust_log_fatal = value.to_string(),
            "repository_server" => self.repository_server = value.to_string(),
            "enable_maintenance" => self.enable_maintenance = MaintenanceMode::parse(value)?,
            "maintenance_time" => {
                decode_time(value)?;
                self.maintenance_time = value.to_string();
            }
            "repository_keepday" => self.repository_keepday = parse_int(value)?,
            "log_maintenance_command" => self.log_maintenance_command = value.to_string(),
            other => bail!("unknown option: {}", other),
        }
        Ok(())
    }

    fn parse_severity(&self, value: &str) -> Result<Severity> {
        str_to_severity(&self.msg, value).ok_or_else(|| anyhow!("invalid log level: {}", value))
    }

    /// The `port` parameter as a number, for the instance registration.
    pub fn port_number(&self) -> Result<i32> {
        self.port
            .parse::<i32>()
            .with_context(|| format!("invalid port: {}", self.port))
    }

    /// Conninfo for the monitored server, optionally overriding dbname.
    pub fn server_conninfo(&self, dbname: &str) -> String {
        format!(
            "port={} {} dbname={} connect_timeout=2{} options='-c log_statement=none'",
            self.port,
            self.target_server,
            dbname,
            self.client_encoding_param()
        )
    }

    /// Conninfo for the repository server.
    pub fn repository_conninfo(&self, superuser: bool) -> String {
        let mut info = format!(
            "{} connect_timeout=2{}",
            self.repository_server,
            self.client_encoding_param()
        );
        if superuser {
            info.push_str(" options='-c log_statement=none'");
        }
        info
    }

    fn client_encoding_param(&self) -> String {
        match encoding_name(self.server_encoding) {
            Some(name) => format!(" client_encoding={}", name),
            None => String::new(),
        }
    }

    /// Database name embedded in `target_server`, or the default.
    pub fn target_dbname(&self) -> String {
        for piece in self.target_server.split_whitespace() {
            if let Some(db) = piece.strip_prefix("dbname=") {
                if !db.is_empty() {
                    return db.trim_matches('\'').to_string();
                }
            }
        }
        "postgres".to_string()
    }

    /// Absolute log directory, resolving a relative `log_directory` against
    /// the data directory.
    pub fn absolute_log_directory(&self) -> String {
        if self.log_directory.starts_with('/') {
            self.log_directory.clone()
        } else {
            format!("{}/{}", self.data_directory, self.log_directory)
        }
    }

    /// Check all fields the agent cannot run without.
    pub fn validate(&self) -> Result<()> {
        let mut missing: Vec<&str> = Vec::new();
        let mut check = |ok: bool, what: &'static str| {
            if !ok {
                missing.push(what);
            }
        };

        check(!self.instance_id.is_empty(), "instance_id");
        check(self.postmaster_pid != 0, "postmaster_pid");
        check(!self.port.is_empty(), "port");
        check(!self.share_path.is_empty(), "share_path");
        check(!self.prev_csv_name.is_empty(), "prev_csv_name");
        check(!self.data_directory.is_empty(), "data_directory");
        check(!self.log_directory.is_empty(), "log_directory");
        check(!self.msg.shutdown.is_empty(), ":shutdown");
        check(!self.msg.shutdown_smart.is_empty(), ":shutdown_smart");
        check(!self.msg.shutdown_fast.is_empty(), ":shutdown_fast");
        check(
            !self.msg.shutdown_immediate.is_empty(),
            ":shutdown_immediate",
        );
        check(!self.msg.sighup.is_empty(), ":sighup");
        check(!self.msg.autovacuum.is_empty(), ":autovacuum");
        check(!self.msg.autoanalyze.is_empty(), ":autoanalyze");

        if !missing.is_empty() {
            bail!(
                "cannot run without required parameters: {}",
                missing.join(", ")
            );
        }
        if !is_valid_server_encoding(self.server_encoding) {
            bail!("invalid server encoding: {}", self.server_encoding);
        }
        if !log_filename_orders_chronologically(&self.log_filename) {
            bail!(
                "log_filename must contain %Y, %m, %d, %H, %M and %S in this order: {}",
                self.log_filename
            );
        }
        Ok(())
    }
}

/// Read name/value frames until the zero-length terminator, assigning each
/// into `config`.
pub async fn read_frames<R: AsyncRead + Unpin>(reader: &mut R, config: &mut Config) -> Result<()> {
    loop {
        let name_len = reader
            .read_u32_le()
            .await
            .context("invalid option stream")?;
        if name_len == 0 {
            return Ok(());
        }

        let name = read_string(reader, name_len as usize).await?;
        let value_len = reader
            .read_u32_le()
            .await
            .context("invalid option stream")?;
        let value = read_string(reader, value_len as usize).await?;

        config.apply(&name, &value)?;
    }
}

async fn read_string<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<String> {
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("invalid option stream")?;
    String::from_utf8(buf).context("option stream is not valid UTF-8")
}

/// Live configuration shared between workers. Reload installs a fresh
/// immutable snapshot and bumps the generation; readers clone the `Arc`.
pub struct ConfigHandle {
    current: RwLock<Arc<Config>>,
    generation: AtomicU64,
}

impl ConfigHandle {
    pub fn new(config: Config) -> ConfigHandle {
        ConfigHandle {
            current: RwLock::new(Arc::new(config)),
            generation: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().expect("config lock poisoned").clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn install(&self, config: Config) -> u64 {
        let mut slot = self.current.write().expect("config lock poisoned");
        *slot = Arc::new(config);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

fn parse_int(value: &str) -> Result<i64> {
    value
        .trim()
        .parse::<i64>()
        .with_context(|| format!("invalid integer: {}", value))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(anyhow!("invalid boolean: {}", value)),
    }
}

fn parse_syslog_facility(value: &str) -> i32 {
    let n = value
        .to_ascii_lowercase()
        .strip_prefix("local")
        .and_then(|n| n.parse::<i32>().ok())
        .unwrap_or(0);
    if (0..=7).contains(&n) {
        n
    } else {
        0
    }
}

/// Parse "HH:MM" or "HH:MM:SS" into seconds after midnight.
pub fn decode_time(value: &str) -> Result<i64> {
    let mut parts = value.split(':');
    let hour: i64 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| anyhow!("invalid time: {}", value))?;
    let min: i64 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| anyhow!("invalid time: {}", value))?;
    let sec: i64 = match parts.next() {
        Some(p) => p.parse().map_err(|_| anyhow!("invalid time: {}", value))?,
        None => 0,
    };
    if parts.next().is_some()
        || !(0..=23).contains(&hour)
        || !(0..=59).contains(&min)
        || !(0..=59).contains(&sec)
    {
        bail!("invalid time: {}", value);
    }
    Ok(hour * 3600 + min * 60 + sec)
}

/// The server's CSV log names embed a strftime pattern; tailing only works
/// when lexicographic file-name order equals chronological order, which
/// requires %Y %m %d %H %M %S in that order. `%%` is tolerated.
pub fn log_filename_orders_chronologically(template: &str) -> bool {
    const ORDER: [char; 6] = ['Y', 'm', 'd', 'H', 'M', 'S'];
    let mut next = 0;

    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        match chars.next() {
            Some('%') => {}
            Some(c) if next < ORDER.len() && c == ORDER[next] => next += 1,
            Some(c) if ORDER.contains(&c) => return false, // out of order
            _ => {}
        }
    }
    next == ORDER.len()
}

/// Server encoding id to the libpq client encoding name.
pub fn encoding_name(id: i32) -> Option<&'static str> {
    const NAMES: [&str; 35] = [
        "SQL_ASCII",
        "EUC_JP",
        "EUC_CN",
        "EUC_KR",
        "EUC_TW",
        "EUC_JIS_2004",
        "UTF8",
        "MULE_INTERNAL",
        "LATIN1",
        "LATIN2",
        "LATIN3",
        "LATIN4",
        "LATIN5",
        "LATIN6",
        "LATIN7",
        "LATIN8",
        "LATIN9",
        "LATIN10",
        "WIN1256",
        "WIN1258",
        "WIN866",
        "WIN874",
        "KOI8R",
        "WIN1251",
        "WIN1252",
        "ISO_8859_5",
        "ISO_8859_6",
        "ISO_8859_7",
        "ISO_8859_8",
        "WIN1250",
        "WIN1253",
        "WIN1254",
        "WIN1255",
        "WIN1257",
        "KOI8U",
    ];
    usize::try_from(id).ok().and_then(|i| NAMES.get(i)).copied()
}

pub fn is_valid_server_encoding(id: i32) -> bool {
    encoding_name(id).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let mut c = Config::default();
        for (name, value) in [
            ("instance_id", "main"),
            ("postmaster_pid", "4242"),
            ("port", "5432"),
            ("share_path", "/usr/share/postgresql"),
            ("prev_csv_name", "postgresql-2024-01-01_000000.csv"),
            ("server_version_num", "90100"),
            ("server_version_string", "9.1.0"),
            ("server_encoding", "6"),
            ("data_directory", "/var/lib/pgsql/data"),
            ("log_directory", "pg_log"),
            (":shutdown", "database system is shut down"),
            (":shutdown_smart", "received smart shutdown request"),
            (":shutdown_fast", "received fast shutdown request"),
            (":shutdown_immediate", "received immediate shutdown request"),
            (":sighup", "received SIGHUP, reloading configuration files"),
            (
                ":autovacuum",
                "automatic vacuum of table \"%s.%s.%s\": index scans: %d",
            ),
            (
                ":autoanalyze",
                "automatic analyze of table \"%s.%s.%s\" system usage: %s",
            ),
        ] {
            c.apply(name, value).unwrap();
        }
        c
    }

    #[test]
    fn applies_and_validates_required_parameters() {
        let c = base_config();
        c.validate().unwrap();
        assert_eq!(c.postmaster_pid, 4242);
        assert_eq!(c.server_encoding, 6);
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let mut c = Config::default();
        assert!(c.apply("no_such_thing", "1").is_err());
        assert!(c.apply("pg_statsinfo.no_such_thing", "1").is_err());
    }

    #[test]
    fn missing_required_parameter_fails_validation() {
        let mut c = base_config();
        c.instance_id = String::new();
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("instance_id"), "got: {}", err);
    }

    #[test]
    fn maintenance_mode_parses_keywords_and_booleans() {
        let on = MaintenanceMode::parse("on").unwrap();
        assert!(on.snapshot && on.log && on.repolog);

        let some = MaintenanceMode::parse("snapshot, repolog").unwrap();
        assert!(some.snapshot && !some.log && some.repolog);

        assert!(!MaintenanceMode::parse("off").unwrap().enabled());
        assert!(MaintenanceMode::parse("nonsense").is_err());
    }

    #[test]
    fn log_filename_template_ordering() {
        assert!(log_filename_orders_chronologically(
            "postgresql-%Y-%m-%d_%H%M%S.log"
        ));
        assert!(log_filename_orders_chronologically(
            "%Y%m%d-%H%M%S-%%srv.log"
        ));
        assert!(!log_filename_orders_chronologically(
            "postgresql-%d-%m-%Y_%H%M%S.log"
        ));
        assert!(!log_filename_orders_chronologically("postgresql-%Y-%m-%d.log"));
    }

    #[test]
    fn decode_time_accepts_hms() {
        assert_eq!(decode_time("00:02").unwrap(), 120);
        assert_eq!(decode_time("23:59:59").unwrap(), 23 * 3600 + 59 * 60 + 59);
        assert!(decode_time("24:00").is_err());
        assert!(decode_time("aa:bb").is_err());
    }

    #[tokio::test]
    async fn reads_frame_stream() {
        let mut buf: Vec<u8> = Vec::new();
        for (name, value) in [("instance_id", "main"), ("port", "5432")] {
            buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
        buf.extend_from_slice(&0u32.to_le_bytes());

        let mut config = Config::default();
        read_frames(&mut buf.as_slice(), &mut config).await.unwrap();
        assert_eq!(config.instance_id, "main");
        assert_eq!(config.port, "5432");
    }

    #[tokio::test]
    async fn truncated_frame_stream_is_an_error() {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(b"po"); // shorter than advertised

        let mut config = Config::default();
        assert!(read_frames(&mut buf.as_slice(), &mut config).await.is_err());
    }
}
