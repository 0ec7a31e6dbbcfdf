//! UDP connection
//!
//! `udpin` binds the given address and learns its peers from the traffic it
//! receives. `udpout` binds an ephemeral port and sends to a fixed remote,
//! still learning any other peer that answers.
//!
//! A learned remote is dropped once it has been silent for
//! [`REMOTE_TIMEOUT`]; fixed remotes never expire.

use super::{Connection, ConnectionCore, READ_TIMEOUT, resolve};
use crate::connection_url::{ConnectionDescriptor, Mode, WILDCARD_HOST};
use crate::error::ConnectionError;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Silence after which a learned remote is forgotten
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest UDP payload
const RECV_BUFFER_SIZE: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteKind {
    /// Learned from received traffic
    Found,
    /// Given by a `udpout` URL
    Fixed,
}

#[derive(Debug, Clone)]
struct Remote {
    addr: SocketAddr,
    kind: RemoteKind,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Remotes(Vec<Remote>);

impl Remotes {
    fn add_fixed(&mut self, addr: SocketAddr) {
        self.0.retain(|r| r.addr != addr);
        self.0.push(Remote {
            addr,
            kind: RemoteKind::Fixed,
            last_seen: Instant::now(),
        });
    }

    fn seen(&mut self, addr: SocketAddr) {
        match self.0.iter_mut().find(|r| r.addr == addr) {
            Some(remote) => remote.last_seen = Instant::now(),
            None => {
                log::info!("New UDP remote: {}", addr);
                self.0.push(Remote {
                    addr,
                    kind: RemoteKind::Found,
                    last_seen: Instant::now(),
                });
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        self.0.retain(|r| {
            let keep = r.kind == RemoteKind::Fixed || now.duration_since(r.last_seen) < REMOTE_TIMEOUT;
            if !keep {
                log::info!("UDP remote {} timed out", r.addr);
            }
            keep
        });
    }

    fn addrs(&self) -> Vec<SocketAddr> {
        self.0.iter().map(|r| r.addr).collect()
    }
}

pub struct UdpConnection {
    core: Arc<ConnectionCore>,
    descriptor: ConnectionDescriptor,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    remotes: Arc<Mutex<Remotes>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpConnection {
    pub fn new(core: ConnectionCore, descriptor: ConnectionDescriptor) -> Self {
        Self {
            core: Arc::new(core),
            descriptor,
            socket: Mutex::new(None),
            remotes: Arc::new(Mutex::new(Remotes::default())),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Local address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Remotes datagrams are currently sent to
    pub fn remotes(&self) -> Vec<SocketAddr> {
        self.remotes.lock().addrs()
    }

    fn bind(&self) -> Result<UdpSocket, ConnectionError> {
        let ConnectionDescriptor::Udp { mode, host, port } = &self.descriptor else {
            return Err(ConnectionError::Resolve(self.descriptor.to_string()));
        };

        let local = match mode {
            Mode::In => resolve(host, *port)?,
            Mode::Out => {
                let remote = resolve(host, *port)?;
                self.remotes.lock().add_fixed(remote);
                resolve(WILDCARD_HOST, 0)?
            }
        };

        let socket = UdpSocket::bind(local).map_err(|source| ConnectionError::Bind {
            addr: local.to_string(),
            source,
        })?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(socket)
    }
}

impl Connection for UdpConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    fn start(&self) -> Result<(), ConnectionError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyStarted);
        }

        let socket = match self.bind() {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        log::info!("UDP connection {} bound to {:?}", self.core.id(), socket.local_addr());
        *self.socket.lock() = Some(Arc::clone(&socket));

        let core = Arc::clone(&self.core);
        let remotes = Arc::clone(&self.remotes);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("udp-rx".to_string())
            .spawn(move || receive_loop(socket, core, remotes, running))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ConnectionError::ThreadSpawn(e.to_string())
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<(), ConnectionError> {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().take();
        *self.socket.lock() = None;
        if let Some(handle) = handle {
            handle.join().map_err(|_| ConnectionError::ThreadPanic)?;
            log::info!("UDP connection {} stopped", self.core.id());
        }
        Ok(())
    }

    fn send_raw_bytes(&self, bytes: &[u8]) -> Result<(), String> {
        let Some(socket) = self.socket.lock().clone() else {
            return Err("UDP connection not started".to_string());
        };

        let targets = {
            let mut remotes = self.remotes.lock();
            remotes.prune(Instant::now());
            remotes.addrs()
        };
        if targets.is_empty() {
            return Err("no remotes".to_string());
        }

        let errors: Vec<String> = targets
            .iter()
            .filter_map(|addr| {
                socket
                    .send_to(bytes, addr)
                    .err()
                    .map(|e| format!("{}: {}", addr, e))
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn receive_loop(
    socket: Arc<UdpSocket>,
    core: Arc<ConnectionCore>,
    remotes: Arc<Mutex<Remotes>>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    while running.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((0, _)) => {}
            Ok((len, from)) => {
                let senders = core.process_bytes(&buf[..len]);
                // Only peers speaking MAVLink as a real system are replied to.
                if senders.iter().any(|&id| id != 0) {
                    remotes.lock().seen(from);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                log::warn!("UDP receive error on connection {}: {}", core.id(), e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    log::debug!("UDP receive loop exiting");
}
