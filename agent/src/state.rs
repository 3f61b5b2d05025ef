//! Process-wide state shared by the three workers.
//!
//! The supervisor owns one [`Shared`] and hands clones of the `Arc` to the
//! collector, writer and logger. All cells use plain mutexes that are never
//! held across an await; the maintenance lock is a tokio mutex because it
//! is held across repository round trips.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigHandle};
use crate::logger::record::Severity;

/// Orderly-termination phases. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Startup,
    Running,
    ShutdownRequested,
    CollectorDown,
    WriterDown,
    LoggerDown,
}

/// One entry in the agent's own log queue. These records are drained by the
/// logger every tick and pushed through the same routing pipeline as server
/// log records.
#[derive(Debug, Clone)]
pub struct SelfLogRecord {
    pub timestamp: String,
    pub severity: Severity,
    pub message: String,
    pub detail: String,
}

pub struct Shared {
    pub config: ConfigHandle,

    shutdown: Mutex<ShutdownState>,
    shutdown_message_found: AtomicBool,
    reload_requested: AtomicBool,
    postmaster_pid: AtomicI32,

    snapshot_requested: Mutex<Option<String>>,
    maintenance_requested: Mutex<Option<String>>,
    self_log: Mutex<Vec<SelfLogRecord>>,

    /// Serializes snapshot collection against retention maintenance.
    pub maintenance_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    pub fn new(config: Config) -> Arc<Shared> {
        let pid = config.postmaster_pid;
        Arc::new(Shared {
            config: ConfigHandle::new(config),
            shutdown: Mutex::new(ShutdownState::Startup),
            shutdown_message_found: AtomicBool::new(false),
            reload_requested: AtomicBool::new(false),
            postmaster_pid: AtomicI32::new(pid),
            snapshot_requested: Mutex::new(None),
            maintenance_requested: Mutex::new(None),
            self_log: Mutex::new(Vec::new()),
            maintenance_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        *self.shutdown.lock().expect("shutdown lock poisoned")
    }

    /// Raise the shutdown state; lower states never overwrite higher ones.
    pub fn shutdown_progress(&self, state: ShutdownState) {
        let mut current = self.shutdown.lock().expect("shutdown lock poisoned");
        if *current < state {
            debug!("shutdown state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub fn shutdown_message_found(&self) -> bool {
        self.shutdown_message_found.load(Ordering::Acquire)
    }

    pub fn set_shutdown_message_found(&self) {
        self.shutdown_message_found.store(true, Ordering::Release);
    }

    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Release);
    }

    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::AcqRel)
    }

    pub fn set_postmaster_pid(&self, pid: i32) {
        self.postmaster_pid.store(pid, Ordering::Release);
    }

    /// Signal-0 probe of the server process the agent was launched by.
    pub fn postmaster_is_alive(&self) -> bool {
        let pid = self.postmaster_pid.load(Ordering::Acquire);
        if pid <= 0 {
            return false;
        }
        unsafe { libc::kill(pid, 0) == 0 }
    }

    pub fn request_snapshot(&self, comment: String) {
        let mut cell = self
            .snapshot_requested
            .lock()
            .expect("snapshot cell poisoned");
        *cell = Some(comment);
    }

    pub fn take_snapshot_request(&self) -> Option<String> {
        self.snapshot_requested
            .lock()
            .expect("snapshot cell poisoned")
            .take()
    }

    pub fn request_maintenance(&self, period: String) {
        let mut cell = self
            .maintenance_requested
            .lock()
            .expect("maintenance cell poisoned");
        *cell = Some(period);
    }

    pub fn take_maintenance_request(&self) -> Option<String> {
        self.maintenance_requested
            .lock()
            .expect("maintenance cell poisoned")
            .take()
    }

    /// Queue a self-log record for the routing pipeline and mirror it to
    /// the tracing subscriber.
    pub fn elog(&self, severity: Severity, message: impl Into<String>) {
        self.elog_detail(severity, message, String::new());
    }

    pub fn elog_detail(
        &self,
        severity: Severity,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) {
        let message = message.into();
        let detail = detail.into();

        match severity {
            Severity::Error | Severity::Fatal | Severity::Panic => error!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Debug => debug!("{}", message),
            _ => info!("{}", message),
        }

        let record = SelfLogRecord {
            timestamp: self.format_log_time(),
            severity,
            message,
            detail,
        };
        self.self_log
            .lock()
            .expect("self-log lock poisoned")
            .push(record);
    }

    pub fn drain_self_log(&self) -> Vec<SelfLogRecord> {
        std::mem::take(&mut *self.self_log.lock().expect("self-log lock poisoned"))
    }

    /// Timestamp in the server's CSV log shape, with millisecond precision
    /// and the configured timezone abbreviation pasted on.
    pub fn format_log_time(&self) -> String {
        let tz = self.config.snapshot().log_timezone.clone();
        let now = Local::now();
        if tz.eq_ignore_ascii_case("GMT") || tz.eq_ignore_ascii_case("UTC") {
            format!(
                "{} {}",
                now.to_utc().format("%Y-%m-%d %H:%M:%S%.3f"),
                tz
            )
        } else {
            format!("{} {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), tz)
        }
    }
}
