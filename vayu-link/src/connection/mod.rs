//! Connections: the physical and virtual links carrying MAVLink
//!
//! Every variant owns a [`ConnectionCore`] holding its receivers, the system
//! ids seen on the link and its forwarding setting. Receive threads hand raw
//! bytes to [`ConnectionCore::process_bytes`], which decodes them and passes
//! each message to the SDK's [`MessageSink`] after the receiver locks are
//! released.
//!
//! | Variant | URL | Receive context |
//! |---------|-----|-----------------|
//! | [`UdpConnection`] | `udpin://`, `udpout://` | `udp-rx` thread |
//! | [`TcpClientConnection`] | `tcpout://` | `tcp-client-rx` thread |
//! | [`TcpServerConnection`] | `tcpin://` | `tcp-server-rx` thread |
//! | [`SerialConnection`] | `serial://`, `serial_flowcontrol://` | `serial-rx` thread |
//! | [`RawConnection`] | `raw://` | caller of `receive` |

mod raw;
mod serial;
mod tcp_client;
mod tcp_server;
mod udp;

pub use raw::{RawConnection, RawSender};
pub use serial::{DEFAULT_SERIAL_BAUDRATE, SerialConnection};
pub use tcp_client::TcpClientConnection;
pub use tcp_server::TcpServerConnection;
pub use udp::UdpConnection;

use crate::connection_url::{ConnectionDescriptor, Mode};
use crate::core::handle::Handle;
use crate::core::types::{ConnectionId, DecodedMessage};
use crate::error::ConnectionError;
use crate::protocol::{DynamicReceiver, FixedReceiver, MessageReceiver, SchemaRegistry};
use mavlink::MavHeader;
use mavlink::common::MavMessage;
use parking_lot::Mutex;
use std::io::Cursor;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Read timeout so receive loops notice `stop()` promptly
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle identifying a connection added to the SDK
pub type ConnectionHandle = Handle<dyn Connection>;

/// Whether frames received on a connection are relayed to the others
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ForwardingOption {
    #[default]
    ForwardingOff,
    ForwardingOn,
}

impl From<bool> for ForwardingOption {
    fn from(on: bool) -> Self {
        if on {
            ForwardingOption::ForwardingOn
        } else {
            ForwardingOption::ForwardingOff
        }
    }
}

/// Consumer of everything decoded on any connection
pub trait MessageSink: Send + Sync {
    /// Called once per decoded message, off every receiver lock
    ///
    /// `message.connection_id` names the connection it arrived on.
    fn on_message(&self, message: DecodedMessage);
}

/// What each connection shares with the SDK instance that owns it
#[derive(Clone)]
pub struct ConnectionContext {
    pub sink: Weak<dyn MessageSink>,
    pub registry: Arc<SchemaRegistry>,
    /// Forwarding connections alive in this SDK instance
    pub forwarding_count: Arc<AtomicUsize>,
    pub dynamic_decoding: bool,
}

impl ConnectionContext {
    /// Context delivering to `sink`, with its own forwarding counter
    pub fn new(sink: Weak<dyn MessageSink>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            sink,
            registry,
            forwarding_count: Arc::new(AtomicUsize::new(0)),
            dynamic_decoding: true,
        }
    }
}

/// State common to every connection variant
pub struct ConnectionCore {
    id: ConnectionId,
    fixed: Mutex<FixedReceiver>,
    dynamic: Option<Mutex<DynamicReceiver>>,
    system_ids: Mutex<Vec<u8>>,
    forwarding: bool,
    forwarding_count: Arc<AtomicUsize>,
    sink: Weak<dyn MessageSink>,
}

impl ConnectionCore {
    pub fn new(id: ConnectionId, context: &ConnectionContext, forwarding: ForwardingOption) -> Self {
        let forwarding = forwarding == ForwardingOption::ForwardingOn;
        if forwarding {
            context.forwarding_count.fetch_add(1, Ordering::SeqCst);
        }

        let dynamic = context
            .dynamic_decoding
            .then(|| Mutex::new(DynamicReceiver::new(Arc::clone(&context.registry))));

        Self {
            id,
            fixed: Mutex::new(FixedReceiver::new(Some(Arc::clone(&context.registry)))),
            dynamic,
            // System id 0 is broadcast and reachable over every link.
            system_ids: Mutex::new(vec![0]),
            forwarding,
            forwarding_count: Arc::clone(&context.forwarding_count),
            sink: context.sink.clone(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Decode received bytes and deliver the messages
    ///
    /// Returns the system ids of the frames decoded by the fixed receiver,
    /// in arrival order.
    pub fn process_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        let fixed = {
            let mut receiver = self.fixed.lock();
            receiver.set_new_datagram(bytes);
            receiver.drain()
        };
        let dynamic = match &self.dynamic {
            Some(receiver) => {
                let mut receiver = receiver.lock();
                receiver.set_new_datagram(bytes);
                receiver.drain()
            }
            None => Vec::new(),
        };

        let senders: Vec<u8> = fixed.iter().map(|m| m.system_id).collect();
        {
            let mut known = self.system_ids.lock();
            for id in senders.iter().chain(dynamic.iter().map(|m| &m.system_id)) {
                if !known.contains(id) {
                    log::debug!("Connection {}: discovered system {}", self.id, id);
                    known.push(*id);
                }
            }
        }

        let Some(sink) = self.sink.upgrade() else {
            return senders;
        };
        for mut message in fixed.into_iter().chain(dynamic) {
            message.connection_id = self.id;
            sink.on_message(message);
        }
        senders
    }

    pub fn has_system_id(&self, system_id: u8) -> bool {
        self.system_ids.lock().contains(&system_id)
    }

    pub fn forwarding_enabled(&self) -> bool {
        self.forwarding
    }

    /// Forwarding is on and some other forwarding connection exists
    pub fn should_forward_messages(&self) -> bool {
        self.forwarding && self.forwarding_count.load(Ordering::SeqCst) > 1
    }
}

impl Drop for ConnectionCore {
    fn drop(&mut self) {
        if self.forwarding {
            self.forwarding_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A link carrying MAVLink frames
///
/// All methods take `&self`: connections are shared between the SDK, its
/// receive threads and callers sending from any thread.
pub trait Connection: Send + Sync {
    fn core(&self) -> &ConnectionCore;

    fn descriptor(&self) -> &ConnectionDescriptor;

    /// Open the link and start receiving
    fn start(&self) -> Result<(), ConnectionError>;

    /// Stop receiving and release the link
    fn stop(&self) -> Result<(), ConnectionError>;

    /// Write bytes to the link; writes are serialized
    fn send_raw_bytes(&self, bytes: &[u8]) -> Result<(), String>;

    /// Serialize as MAVLink v2 and send
    fn send_message(&self, header: MavHeader, message: &MavMessage) -> Result<(), String> {
        let bytes = encode_message(header, message)?;
        self.send_raw_bytes(&bytes)
    }

    fn id(&self) -> ConnectionId {
        self.core().id()
    }

    fn has_system_id(&self, system_id: u8) -> bool {
        self.core().has_system_id(system_id)
    }

    fn should_forward_messages(&self) -> bool {
        self.core().should_forward_messages()
    }

    fn forwarding_enabled(&self) -> bool {
        self.core().forwarding_enabled()
    }

    /// The application-fed connection behind this link, if it is one
    fn as_raw(&self) -> Option<&RawConnection> {
        None
    }
}

/// MAVLink v2 frame for a compiled message
pub fn encode_message(header: MavHeader, message: &MavMessage) -> Result<Vec<u8>, String> {
    let mut buf = Cursor::new(Vec::with_capacity(crate::protocol::frame::MAX_FRAME_LEN));
    mavlink::write_v2_msg(&mut buf, header, message).map_err(|e| format!("{:?}", e))?;
    Ok(buf.into_inner())
}

/// Create (but don't start) the connection a descriptor asks for
pub fn create_connection(
    id: ConnectionId,
    descriptor: ConnectionDescriptor,
    context: &ConnectionContext,
    forwarding: ForwardingOption,
    raw_sender: Option<RawSender>,
) -> Arc<dyn Connection> {
    let core = ConnectionCore::new(id, context, forwarding);
    match &descriptor {
        ConnectionDescriptor::Udp { .. } => Arc::new(UdpConnection::new(core, descriptor)),
        ConnectionDescriptor::Tcp { mode: Mode::In, .. } => {
            Arc::new(TcpServerConnection::new(core, descriptor))
        }
        ConnectionDescriptor::Tcp { mode: Mode::Out, .. } => {
            Arc::new(TcpClientConnection::new(core, descriptor))
        }
        ConnectionDescriptor::Serial { .. } => Arc::new(SerialConnection::new(core, descriptor)),
        ConnectionDescriptor::Raw => Arc::new(RawConnection::new(core, descriptor, raw_sender)),
    }
}

/// Resolve `host:port`, preferring IPv4
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectionError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| {
            log::warn!("Could not resolve {}: {}", host, e);
            ConnectionError::Resolve(host.to_string())
        })?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ConnectionError::Resolve(host.to_string()))
}

/// Core with the builtin schema and nobody listening
#[cfg(test)]
pub(crate) fn detached_core(id: ConnectionId) -> ConnectionCore {
    struct Detached;
    impl MessageSink for Detached {
        fn on_message(&self, _message: DecodedMessage) {}
    }

    let sink: Weak<dyn MessageSink> = Weak::<Detached>::new();
    let registry = Arc::new(SchemaRegistry::with_builtin().unwrap());
    ConnectionCore::new(id, &ConnectionContext::new(sink, registry), ForwardingOption::ForwardingOff)
}
