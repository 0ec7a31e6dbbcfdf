//! Serial connection (`serial://`, `serial_flowcontrol://`)

use super::{Connection, ConnectionCore, READ_TIMEOUT};
use crate::connection_url::ConnectionDescriptor;
use crate::error::ConnectionError;
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Used when the URL carries no baud rate
pub const DEFAULT_SERIAL_BAUDRATE: u32 = 57_600;

/// Rates every supported platform can set
const SUPPORTED_BAUDRATES: &[u32] = &[
    9_600, 19_200, 38_400, 57_600, 115_200, 230_400, 460_800, 500_000, 576_000, 921_600,
    1_000_000, 1_500_000, 2_000_000, 3_000_000, 4_000_000,
];

const RECV_BUFFER_SIZE: usize = 2048;
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Baud rate to open the device with
pub(crate) fn effective_baudrate(requested: u32) -> Result<u32, ConnectionError> {
    match requested {
        0 => Ok(DEFAULT_SERIAL_BAUDRATE),
        rate if SUPPORTED_BAUDRATES.contains(&rate) => Ok(rate),
        rate => Err(ConnectionError::UnsupportedBaudrate(rate)),
    }
}

pub struct SerialConnection {
    core: Arc<ConnectionCore>,
    descriptor: ConnectionDescriptor,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialConnection {
    pub fn new(core: ConnectionCore, descriptor: ConnectionDescriptor) -> Self {
        Self {
            core: Arc::new(core),
            descriptor,
            writer: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<Box<dyn SerialPort>, ConnectionError> {
        let ConnectionDescriptor::Serial {
            path,
            baudrate,
            flow_control,
        } = &self.descriptor
        else {
            return Err(ConnectionError::Resolve(self.descriptor.to_string()));
        };

        let baudrate = effective_baudrate(*baudrate)?;
        let flow_control = if *flow_control {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };

        let port = serialport::new(path.as_str(), baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(flow_control)
            .timeout(READ_TIMEOUT)
            .open()?;

        log::info!("Opened serial port: {} at {} baud ({:?})", path, baudrate, flow_control);
        Ok(port)
    }
}

impl Connection for SerialConnection {
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

        let opened = self
            .open()
            .and_then(|port| Ok((port.try_clone()?, port)));
        let (reader, writer) = match opened {
            Ok(ports) => ports,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.writer.lock() = Some(writer);

        let core = Arc::clone(&self.core);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("serial-rx".to_string())
            .spawn(move || receive_loop(reader, core, running))
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
            log::info!("Serial connection {} stopped", self.core.id());
        }
        *self.writer.lock() = None;
        Ok(())
    }

    fn send_raw_bytes(&self, bytes: &[u8]) -> Result<(), String> {
        let mut writer = self.writer.lock();
        let Some(port) = writer.as_mut() else {
            return Err("serial port not open".to_string());
        };
        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|e| e.to_string())
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn receive_loop(mut port: Box<dyn SerialPort>, core: Arc<ConnectionCore>, running: Arc<AtomicBool>) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    while running.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(len) => {
                core.process_bytes(&buf[..len]);
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("Serial read error: {}", e);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    log::debug!("Serial receive loop exiting");
}
