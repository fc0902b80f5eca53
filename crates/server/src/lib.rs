//! Server assembly: recovery, the worker/logger thread pools, the TLS
//! acceptor, and the session monitor.

use std::{
    fs,
    net::{
        TcpListener,
        TcpStream,
    },
    path::PathBuf,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use common::{
    epoch::EpochState,
    knobs::{
        LOGGER_NUM,
        LOG_DIR,
        WORKER_NUM,
    },
    shutdown::ShutdownSignal,
};
use database::TxExecutor;
use durability::{
    perform_recovery,
    Logger,
    LogQueue,
    Notifier,
};
use indexing::Masstree;
use rustls::ServerConnection;

pub mod balancer;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod tls;
pub mod worker;

use crate::{
    balancer::TransactionBalancer,
    session::{
        Session,
        SessionHandler,
        SessionNotificationSink,
        SessionRead,
    },
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub port: u16,
    /// Keep accepting new sessions; without it the server exits when its
    /// single session closes.
    pub server_in_loop: bool,
}

pub fn run_server(options: ServerOptions) -> anyhow::Result<()> {
    let worker_num = (*WORKER_NUM).max(1);
    let logger_num = (*LOGGER_NUM).clamp(1, worker_num);
    let log_dir = PathBuf::from(&*LOG_DIR);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    // Recover before opening any service: replay to the durable epoch and
    // seed the epoch state past it.
    let tree = Arc::new(Masstree::new());
    let outcome = perform_recovery(&tree, &log_dir, logger_num)?;
    let epochs = Arc::new(EpochState::new(worker_num, logger_num));
    epochs.set_global_epoch(outcome.durable_epoch + 1);
    for worker in 0..worker_num {
        epochs.store_local_epoch(worker, outcome.durable_epoch + 1);
    }
    for logger in 0..logger_num {
        epochs.store_logger_durable_epoch(logger, outcome.durable_epoch);
    }
    epochs.try_advance_durable_epoch(outcome.durable_epoch);

    let quit = ShutdownSignal::new();
    let sessions = Arc::new(SessionHandler::new());
    let sink = Arc::new(SessionNotificationSink::new(Arc::clone(&sessions)));
    let notifier = Arc::new(Notifier::new(Arc::clone(&epochs), &log_dir, sink));

    let queues: Vec<Arc<LogQueue>> = (0..logger_num).map(|_| Arc::new(LogQueue::new())).collect();
    let mut logger_handles = Vec::with_capacity(logger_num);
    for logger_id in 0..logger_num {
        let bound_workers: Vec<usize> = (0..worker_num)
            .filter(|worker| worker % logger_num == logger_id)
            .collect();
        let mut logger = Logger::new(
            logger_id,
            Arc::clone(&queues[logger_id]),
            Arc::clone(&epochs),
            Arc::clone(&notifier),
            bound_workers,
            &log_dir,
            outcome.logger_resume[logger_id].clone(),
        );
        let handle = thread::Builder::new()
            .name(format!("logger-{logger_id}"))
            .spawn(move || {
                if let Err(err) = logger.run() {
                    errors::report_error(&err);
                }
            })?;
        logger_handles.push(handle);
    }

    let balancer = Arc::new(TransactionBalancer::new(worker_num));
    let mut worker_handles = Vec::with_capacity(worker_num);
    for worker_id in 0..worker_num {
        let executor = TxExecutor::new(
            worker_id,
            Arc::clone(&tree),
            Arc::clone(&epochs),
            Arc::clone(&queues[worker_id % logger_num]),
            quit.clone(),
        );
        let balancer = Arc::clone(&balancer);
        let sessions = Arc::clone(&sessions);
        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || worker::worker_task(executor, balancer, sessions))?;
        worker_handles.push(handle);
    }

    {
        let quit = quit.clone();
        ctrlc::set_handler(move || quit.signal()).context("installing signal handler")?;
    }

    let tls_config = tls::server_config()?;
    let listener = TcpListener::bind(("0.0.0.0", options.port))
        .with_context(|| format!("binding port {}", options.port))?;
    listener.set_nonblocking(true)?;
    tracing::info!("Listening on port {}", options.port);

    let accepted_once = Arc::new(AtomicBool::new(false));
    let acceptor = {
        let sessions = Arc::clone(&sessions);
        let quit = quit.clone();
        let accepted_once = Arc::clone(&accepted_once);
        let server_in_loop = options.server_in_loop;
        thread::Builder::new().name("acceptor".to_owned()).spawn(move || {
            accept_loop(
                listener,
                tls_config,
                sessions,
                quit,
                accepted_once,
                server_in_loop,
            )
        })?
    };
    let monitor = {
        let sessions = Arc::clone(&sessions);
        let balancer = Arc::clone(&balancer);
        let quit = quit.clone();
        let accepted_once = Arc::clone(&accepted_once);
        let server_in_loop = options.server_in_loop;
        thread::Builder::new().name("session-monitor".to_owned()).spawn(move || {
            session_monitor(sessions, balancer, quit, accepted_once, server_in_loop)
        })?
    };

    acceptor.join().expect("acceptor thread panicked");
    monitor.join().expect("monitor thread panicked");
    quit.signal();
    for handle in worker_handles {
        handle.join().expect("worker thread panicked");
    }
    for queue in &queues {
        queue.terminate();
    }
    for handle in logger_handles {
        handle.join().expect("logger thread panicked");
    }
    tracing::info!("Server stopped");
    Ok(())
}

fn accept_loop(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    sessions: Arc<SessionHandler>,
    quit: ShutdownSignal,
    accepted_once: Arc<AtomicBool>,
    server_in_loop: bool,
) {
    loop {
        if quit.is_signaled() {
            return;
        }
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
                continue;
            },
            Err(err) => {
                tracing::warn!("Accept failed: {err}");
                thread::sleep(Duration::from_millis(100));
                continue;
            },
        };
        match establish_session(&tls_config, &sessions, stream) {
            Ok(session_id) => {
                tracing::info!("Accepted client connection from {peer} (session_id: {session_id})");
                metrics::log_session_accepted();
                accepted_once.store(true, Ordering::Release);
                if !server_in_loop {
                    return;
                }
            },
            Err(err) => tracing::warn!("TLS session with {peer} failed: {err:#}"),
        }
    }
}

/// Handshake on the blocking socket, push the session id as the first
/// frame, then hand the session (non-blocking) to the monitor.
fn establish_session(
    tls_config: &Arc<rustls::ServerConfig>,
    sessions: &SessionHandler,
    stream: TcpStream,
) -> anyhow::Result<String> {
    stream.set_nonblocking(false)?;
    let mut conn = ServerConnection::new(Arc::clone(tls_config))?;
    let mut stream = stream;
    while conn.is_handshaking() {
        conn.complete_io(&mut stream).context("TLS handshake")?;
    }
    let session_id = sessions.add_session(Session::new(conn, stream));
    if !sessions.send(&session_id, session_id.as_bytes()) {
        anyhow::bail!("failed to push session id");
    }
    sessions.set_nonblocking(&session_id)?;
    Ok(session_id)
}

/// Poll every session for complete request frames; feed them to the
/// balancer and reap closed sessions. Never blocks indefinitely.
fn session_monitor(
    sessions: Arc<SessionHandler>,
    balancer: Arc<TransactionBalancer>,
    quit: ShutdownSignal,
    accepted_once: Arc<AtomicBool>,
    server_in_loop: bool,
) {
    loop {
        if quit.is_signaled() {
            return;
        }
        for session_id in sessions.session_ids() {
            match sessions.try_read(&session_id) {
                SessionRead::Idle => {},
                SessionRead::Closed => sessions.remove_session(&session_id),
                SessionRead::Frames(frames) => {
                    for frame in frames {
                        match String::from_utf8(frame) {
                            Ok(json) => {
                                metrics::log_request_received();
                                balancer.put_transaction(json);
                            },
                            Err(_) => {
                                tracing::warn!(
                                    "Non-UTF-8 frame from session {session_id}; dropping"
                                );
                            },
                        }
                    }
                },
            }
        }
        if !server_in_loop && accepted_once.load(Ordering::Acquire) && sessions.is_empty() {
            // The only session is gone; shut the server down.
            quit.signal();
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
