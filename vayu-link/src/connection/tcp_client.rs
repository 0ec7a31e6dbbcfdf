//! Outgoing TCP connection (`tcpout://`)
//!
//! The first connect happens in `start()` so an unreachable server is
//! reported to the caller. After that the receive thread reconnects on its
//! own whenever the server goes away.

use super::{Connection, ConnectionCore, READ_TIMEOUT, resolve};
use crate::connection_url::ConnectionDescriptor;
use crate::error::ConnectionError;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const RECV_BUFFER_SIZE: usize = 2048;

pub struct TcpClientConnection {
    core: Arc<ConnectionCore>,
    descriptor: ConnectionDescriptor,
    /// Write half of the current stream
    writer: Arc<Mutex<Option<TcpStream>>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpClientConnection {
    pub fn new(core: ConnectionCore, descriptor: ConnectionDescriptor) -> Self {
        Self {
            core: Arc::new(core),
            descriptor,
            writer: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    fn remote(&self) -> Result<SocketAddr, ConnectionError> {
        match &self.descriptor {
            ConnectionDescriptor::Tcp { host, port, .. } => resolve(host, *port),
            other => Err(ConnectionError::Resolve(other.to_string())),
        }
    }
}

/// Connect and split into (reader, writer)
fn connect(remote: SocketAddr) -> Result<(TcpStream, TcpStream), ConnectionError> {
    let stream = TcpStream::connect_timeout(&remote, CONNECT_TIMEOUT).map_err(|source| {
        ConnectionError::Connect {
            addr: remote.to_string(),
            source,
        }
    })?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    if let Err(e) = stream.set_nodelay(true) {
        log::warn!("Failed to set TCP_NODELAY: {}", e);
    }
    let writer = stream.try_clone()?;
    Ok((stream, writer))
}

impl Connection for TcpClientConnection {
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

        let connected = self.remote().and_then(|remote| Ok((remote, connect(remote)?)));
        let (remote, (reader, writer)) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        log::info!("TCP connection {} connected to {}", self.core.id(), remote);
        *self.writer.lock() = Some(writer);

        let core = Arc::clone(&self.core);
        let shared_writer = Arc::clone(&self.writer);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("tcp-client-rx".to_string())
            .spawn(move || receive_loop(remote, reader, core, shared_writer, running))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ConnectionError::ThreadSpawn(e.to_string())
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<(), ConnectionError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.thread.lock().take() {
            handle.join().map_err(|_| ConnectionError::ThreadPanic)?;
            log::info!("TCP connection {} stopped", self.core.id());
        }
        Ok(())
    }

    fn send_raw_bytes(&self, bytes: &[u8]) -> Result<(), String> {
        let mut writer = self.writer.lock();
        let Some(stream) = writer.as_mut() else {
            return Err("TCP connection not connected".to_string());
        };
        stream.write_all(bytes).map_err(|e| e.to_string())
    }
}

impl Drop for TcpClientConnection {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn receive_loop(
    remote: SocketAddr,
    mut reader: TcpStream,
    core: Arc<ConnectionCore>,
    writer: Arc<Mutex<Option<TcpStream>>>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    while running.load(Ordering::Relaxed) {
        let lost = match reader.read(&mut buf) {
            Ok(0) => {
                log::info!("TCP server {} closed the connection", remote);
                true
            }
            Ok(len) => {
                core.process_bytes(&buf[..len]);
                false
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => false,
            Err(e) => {
                log::warn!("TCP receive error from {}: {}", remote, e);
                true
            }
        };
        if !lost {
            continue;
        }

        *writer.lock() = None;
        match reconnect(remote, &running) {
            Some((new_reader, new_writer)) => {
                if install_writer(&writer, &running, new_writer) {
                    reader = new_reader;
                } else {
                    let _ = new_reader.shutdown(Shutdown::Both);
                    break;
                }
            }
            None => break,
        }
    }
    log::debug!("TCP client receive loop exiting");
}

/// Publish a reconnected stream unless `stop()` ran meanwhile
///
/// The flag is checked under the writer lock, which `stop()` takes after
/// clearing it, so a stream is either shut down here or by `stop()`.
fn install_writer(
    writer: &Mutex<Option<TcpStream>>,
    running: &AtomicBool,
    stream: TcpStream,
) -> bool {
    let mut slot = writer.lock();
    if !running.load(Ordering::SeqCst) {
        let _ = stream.shutdown(Shutdown::Both);
        return false;
    }
    *slot = Some(stream);
    true
}

/// Retry until connected or stopped
fn reconnect(remote: SocketAddr, running: &AtomicBool) -> Option<(TcpStream, TcpStream)> {
    while running.load(Ordering::Relaxed) {
        thread::sleep(RECONNECT_INTERVAL);
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match connect(remote) {
            Ok(streams) => {
                log::info!("Reconnected to {}", remote);
                return Some(streams);
            }
            Err(e) => log::debug!("Reconnect to {} failed: {}", remote, e),
        }
    }
    None
}
