//! Startup, worker lifecycle and signals.
//!
//! The agent is launched by the server with a pipe on standard input that
//! carries its configuration frames; a terminal on stdin means a human
//! started it by hand. Startup validation failures exit with 0xFF, which
//! the launcher reads as "do not restart".

use std::io::IsTerminal;
use std::sync::Arc;

use futures::future::join_all;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex as AsyncMutex;
use tracing::error;

use crate::config::{self, Config};
use crate::logger::record::Severity;
use crate::queue::WriterQueue;
use crate::state::{Shared, ShutdownState};
use crate::{collector, logger, writer, PROGRAM_NAME, PROGRAM_VERSION};

/// Server major version this agent is built for.
const BUILT_SERVER_VERSION_NUM: i32 = 90100;

/// Fatal startup error; the launcher will not restart the agent.
const EXIT_FATAL: i32 = 0xFF;

pub async fn run() -> i32 {
    if std::env::args().skip(1).any(|a| a == "--help" || a == "-?")
        || std::io::stdin().is_terminal()
    {
        return help();
    }

    let mut stdin = tokio::io::stdin();
    let mut config = Config::default();
    if let Err(e) = config::read_frames(&mut stdin, &mut config).await {
        error!("{:#}", e);
        return EXIT_FATAL;
    }
    if let Err(e) = config.validate() {
        error!("{:#}", e);
        return EXIT_FATAL;
    }
    if config.server_version_num / 100 != BUILT_SERVER_VERSION_NUM / 100 {
        error!(
            "incompatible server: version mismatch (server is version {}, {} was built with version {})",
            config.server_version_num, PROGRAM_NAME, BUILT_SERVER_VERSION_NUM
        );
        return EXIT_FATAL;
    }

    let shared = Shared::new(config);
    let queue = Arc::new(WriterQueue::new());
    let stdin = Arc::new(AsyncMutex::new(stdin));

    shared.shutdown_progress(ShutdownState::Running);
    shared.elog(Severity::Log, "start");

    spawn_signal_handlers(shared.clone());

    let workers = vec![
        tokio::spawn(collector::run(shared.clone(), queue.clone(), stdin)),
        tokio::spawn(writer::run(shared.clone(), queue.clone())),
        tokio::spawn(logger::run(shared.clone(), queue)),
    ];
    join_all(workers).await;

    0
}

/// SIGHUP re-reads the parameter stream; SIGTERM and SIGINT request an
/// orderly shutdown.
fn spawn_signal_handlers(shared: Arc<Shared>) {
    tokio::spawn(async move {
        let (Ok(mut hangup), Ok(mut terminate), Ok(mut interrupt)) = (
            signal(SignalKind::hangup()),
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            error!("could not install signal handlers");
            return;
        };

        loop {
            tokio::select! {
                _ = hangup.recv() => shared.request_reload(),
                _ = terminate.recv() => {
                    shared.shutdown_progress(ShutdownState::ShutdownRequested)
                }
                _ = interrupt.recv() => {
                    shared.shutdown_progress(ShutdownState::ShutdownRequested)
                }
            }
        }
    });
}

fn help() -> i32 {
    println!("{} {}", PROGRAM_NAME, PROGRAM_VERSION);
    println!("  This program must be launched by the PostgreSQL server.");
    println!("  Add the statsinfo library to shared_preload_libraries in postgresql.conf.");
    1
}
