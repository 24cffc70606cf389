//! Threaded Unix-socket RPC server.
//!
//! One accept thread feeds accepted connections to a bounded pool of
//! workers; a worker owns its connection until the peer disconnects. A
//! blocking method call (waiting for the operational state) suspends only
//! the worker executing it.

use core::sync::atomic::{AtomicBool, Ordering};
use std::ffi::CString;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use zeroize::Zeroize;

use super::proto::{read_msg, write_msg, Envelope, Response};

/// Poll interval for the shutdown flag in accept and worker loops.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A dispatchable RPC service.
pub trait RpcService: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;

    fn name(&self) -> &'static str;

    fn dispatch(&self, request: Self::Request) -> Response;
}

pub struct RpcServer {
    path: PathBuf,
    threads: Vec<JoinHandle<()>>,
}

impl RpcServer {
    /// Binds `path` with the given file mode and spawns the accept thread
    /// plus `workers` handler threads. The server runs until `shutdown` is
    /// raised.
    pub fn start<S: RpcService>(
        path: &Path,
        mode: u32,
        workers: usize,
        service: Arc<S>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        // A stale socket from a crashed daemon blocks the bind.
        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        chmod(path, mode)?;
        log::info!(
            "{} RPC service listening on {} ({} workers)",
            service.name(),
            path.display(),
            workers
        );

        let (tx, rx) = mpsc::channel::<UnixStream>();
        let rx = Arc::new(Mutex::new(rx));
        let mut threads = Vec::with_capacity(workers + 1);

        {
            let shutdown = shutdown.clone();
            threads.push(std::thread::spawn(move || {
                accept_loop(listener, tx, shutdown);
            }));
        }

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let service = service.clone();
            let shutdown = shutdown.clone();
            threads.push(std::thread::spawn(move || {
                worker_loop(rx, service, shutdown);
            }));
        }

        Ok(Self {
            path: path.to_path_buf(),
            threads,
        })
    }

    /// Waits for all threads; call after raising the shutdown flag.
    pub fn join(self) {
        for t in self.threads {
            let _ = t.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    let c_path = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    if unsafe { libc::chmod(c_path.as_ptr(), mode as libc::mode_t) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn accept_loop(
    listener: UnixListener,
    tx: mpsc::Sender<UnixStream>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                if tx.send(stream).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                log::warn!("accept failed: {}", e);
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn worker_loop<S: RpcService>(
    rx: Arc<Mutex<mpsc::Receiver<UnixStream>>>,
    service: Arc<S>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        // Holding the receiver lock only while polling keeps the pool
        // available to other idle workers.
        let stream = {
            let rx = rx.lock();
            rx.recv_timeout(POLL_INTERVAL)
        };
        match stream {
            Ok(stream) => handle_connection(stream, &*service, &shutdown),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn handle_connection<S: RpcService>(
    mut stream: UnixStream,
    service: &S,
    shutdown: &AtomicBool,
) {
    if stream.set_read_timeout(Some(POLL_INTERVAL)).is_err() {
        return;
    }

    while !shutdown.load(Ordering::Relaxed) {
        let envelope: Envelope<S::Request> = match read_msg(&mut stream) {
            Ok(env) => env,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            // Disconnect or garbage: drop the connection.
            Err(_) => return,
        };

        let mut response = service.dispatch(envelope.msg);
        let result = write_msg(&mut stream, envelope.call_id, &response);
        // Random data must not linger in the worker after the send.
        response.data.zeroize();
        if result.is_err() {
            return;
        }
    }
}
