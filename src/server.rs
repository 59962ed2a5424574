/*!
HTTP/WebSocket server: listener, accept loop and public start/serve API.

The accept loop runs on its own thread over a non-blocking listener and hands every
connection to a fresh thread. Connections are never kept alive.
*/

pub mod auth;
pub mod bridge;
pub mod dispatch;
pub mod http;
pub mod listing;
pub mod stream;

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// A running server. Dropping the handle leaves the server running; call `stop`.
pub struct ServerHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting connections and wait for the accept loop to exit. Connections
    /// already being served run to completion on their own threads.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    /// Block until the accept loop exits.
    pub fn join(mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Bind `config.bind():config.port()` (port 0 picks a free port) and start serving.
pub fn start(config: Config) -> io::Result<ServerHandle> {
    let listener = TcpListener::bind((config.bind(), config.port()))?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    let config = Arc::new(config);
    let running = Arc::new(AtomicBool::new(true));
    let running_cl = running.clone();

    info!(
        %addr,
        root = %config.root().display(),
        auth = config.credentials().is_some(),
        exec_timeout = ?config.exec_timeout(),
        "listening"
    );

    let handle = std::thread::spawn(move || {
        while running_cl.load(Ordering::SeqCst) {
            let (stream, peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    std::thread::sleep(ACCEPT_POLL);
                    continue;
                }
            };
            if let Err(e) = stream.set_nonblocking(false) {
                warn!(error = %e, "configuring connection failed");
                continue;
            }
            let _ = stream.set_nodelay(true);
            let config = config.clone();
            std::thread::spawn(move || dispatch::handle_connection(config, stream, peer));
        }
        debug!("accept loop stopped");
    });

    Ok(ServerHandle {
        addr,
        running,
        handle: Some(handle),
    })
}

/// Serve until the process exits.
pub fn serve(config: Config) -> io::Result<()> {
    start(config)?.join();
    Ok(())
}
