//! Listening TCP connection (`tcpin://`)
//!
//! Serves one client at a time. A newly accepted client replaces the current
//! one; sends go to whoever is connected at that moment.

use super::{Connection, ConnectionCore, resolve};
use crate::connection_url::ConnectionDescriptor;
use crate::error::ConnectionError;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Short so pending clients are accepted while one is being served
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(50);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const RECV_BUFFER_SIZE: usize = 2048;

pub struct TcpServerConnection {
    core: Arc<ConnectionCore>,
    descriptor: ConnectionDescriptor,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Write half of the current client
    client: Arc<Mutex<Option<TcpStream>>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServerConnection {
    pub fn new(core: ConnectionCore, descriptor: ConnectionDescriptor) -> Self {
        Self {
            core: Arc::new(core),
            descriptor,
            local_addr: Mutex::new(None),
            client: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    /// Listening address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn has_client(&self) -> bool {
        self.client.lock().is_some()
    }

    fn listen(&self) -> Result<TcpListener, ConnectionError> {
        let local = match &self.descriptor {
            ConnectionDescriptor::Tcp { host, port, .. } => resolve(host, *port)?,
            other => return Err(ConnectionError::Resolve(other.to_string())),
        };
        let listener = TcpListener::bind(local).map_err(|source| ConnectionError::Bind {
            addr: local.to_string(),
            source,
        })?;
        // Non-blocking so the loop can check the running flag
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

impl Connection for TcpServerConnection {
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

        let listener = match self.listen() {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let local = listener.local_addr()?;
        log::info!("TCP connection {} listening on {}", self.core.id(), local);
        *self.local_addr.lock() = Some(local);

        let core = Arc::clone(&self.core);
        let client = Arc::clone(&self.client);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("tcp-server-rx".to_string())
            .spawn(move || serve(listener, core, client, running))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ConnectionError::ThreadSpawn(e.to_string())
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<(), ConnectionError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            handle.join().map_err(|_| ConnectionError::ThreadPanic)?;
            log::info!("TCP connection {} stopped", self.core.id());
        }
        if let Some(stream) = self.client.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn send_raw_bytes(&self, bytes: &[u8]) -> Result<(), String> {
        let mut client = self.client.lock();
        let Some(stream) = client.as_mut() else {
            return Err("no TCP client connected".to_string());
        };
        stream.write_all(bytes).map_err(|e| e.to_string())
    }
}

impl Drop for TcpServerConnection {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn accept_client(stream: TcpStream) -> std::io::Result<(TcpStream, TcpStream)> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
    let _ = stream.set_nodelay(true);
    let writer = stream.try_clone()?;
    Ok((stream, writer))
}

fn serve(
    listener: TcpListener,
    core: Arc<ConnectionCore>,
    client: Arc<Mutex<Option<TcpStream>>>,
    running: Arc<AtomicBool>,
) {
    let mut reader: Option<TcpStream> = None;
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => match accept_client(stream) {
                Ok((new_reader, writer)) => {
                    log::info!("TCP client connected from {}", addr);
                    if let Some(old) = client.lock().replace(writer) {
                        log::info!("Replacing previous TCP client");
                        let _ = old.shutdown(Shutdown::Both);
                    }
                    reader = Some(new_reader);
                }
                Err(e) => log::warn!("Failed to configure client {}: {}", addr, e),
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => log::error!("Failed to accept connection: {}", e),
        }

        let Some(stream) = reader.as_mut() else {
            thread::sleep(ACCEPT_POLL_INTERVAL);
            continue;
        };

        let disconnected = match stream.read(&mut buf) {
            Ok(0) => true,
            Ok(len) => {
                core.process_bytes(&buf[..len]);
                false
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => false,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof || e.kind() == ErrorKind::ConnectionReset => {
                true
            }
            Err(e) => {
                log::warn!("TCP receive error: {}", e);
                true
            }
        };

        if disconnected {
            log::info!("TCP client disconnected");
            reader = None;
            if let Some(old) = client.lock().take() {
                let _ = old.shutdown(Shutdown::Both);
            }
        }
    }
    log::debug!("TCP server loop exiting");
}
