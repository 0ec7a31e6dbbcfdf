//! Top-level SDK hub
//!
//! [`Vayu`] owns the connections, the runtime schema registry and the user
//! subscriptions of one SDK instance:
//!
//! ```text
//!  connection rx thread ──► ConnectionCore::process_bytes
//!                              │ (decoded, no receiver lock held)
//!                              ▼
//!                      VayuInner::on_message ──► forward raw frame to other links
//!                              │
//!                              ▼ CallbackList::queue
//!                      vayu-callbacks thread ──► user callbacks
//! ```
//!
//! # Example
//!
//! ```no_run
//! use vayu_link::{ForwardingOption, Vayu};
//!
//! let vayu = Vayu::new()?;
//! vayu.add_any_connection("udpin://0.0.0.0:14540", ForwardingOption::ForwardingOff)?;
//! vayu.subscribe_messages(|msg| println!("{} from system {}", msg.message_name, msg.system_id));
//! # Ok::<(), vayu_link::Error>(())
//! ```

use crate::config::{IdentityConfig, SdkConfig};
use crate::connection::{
    Connection, ConnectionContext, ConnectionHandle, ForwardingOption, MessageSink, RawSender,
    create_connection, encode_message,
};
use crate::connection_url::{self, ConnectionDescriptor};
use crate::core::callback_list::{CallbackHandle, CallbackList};
use crate::core::executor::CallbackExecutor;
use crate::core::handle::HandleFactory;
use crate::core::types::{DecodedMessage, JsonMessage, MessagePayload};
use crate::error::{Error, Result, SchemaError};
use crate::protocol::SchemaRegistry;
use crate::protocol::frame::{HEADER_LEN_V2, build_v2_frame};
use mavlink::common::MavMessage;
use mavlink::{MavHeader, Message};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fs;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Handle of a typed message subscription
pub type MessageHandle = CallbackHandle<Arc<DecodedMessage>>;
/// Handle of a JSON message subscription
pub type JsonMessageHandle = CallbackHandle<Arc<JsonMessage>>;
/// Handle of an outgoing raw bytes subscription
pub type RawBytesHandle = CallbackHandle<Arc<[u8]>>;

/// One SDK instance
pub struct Vayu {
    inner: Arc<VayuInner>,
}

struct VayuInner {
    identity: IdentityConfig,
    config: SdkConfig,
    registry: Arc<SchemaRegistry>,
    context: ConnectionContext,
    this: Weak<VayuInner>,
    connections: Mutex<Vec<Arc<dyn Connection>>>,
    connection_handles: HandleFactory<dyn Connection>,
    sequence: AtomicU8,
    message_callbacks: CallbackList<Arc<DecodedMessage>>,
    json_callbacks: CallbackList<Arc<JsonMessage>>,
    raw_sent_callbacks: CallbackList<Arc<[u8]>>,
    executor: CallbackExecutor,
}

impl Vayu {
    /// Instance with the default (ground station) identity and no connections
    pub fn new() -> Result<Self> {
        Self::with_config(SdkConfig::default())
    }

    /// Instance configured from `config`
    ///
    /// Loads the configured custom schemas; connections are only brought up
    /// by [`connect_configured`](Self::connect_configured).
    pub fn with_config(config: SdkConfig) -> Result<Self> {
        let registry = Arc::new(SchemaRegistry::with_builtin()?);
        for path in &config.receiver.custom_schemas {
            let xml = fs::read_to_string(path)?;
            let count = registry.load_xml(&xml)?;
            log::info!("Loaded {} message definitions from {}", count, path.display());
        }

        let executor = CallbackExecutor::spawn("vayu-callbacks")?;

        let inner = Arc::new_cyclic(|this: &Weak<VayuInner>| {
            let sink: Weak<dyn MessageSink> = this.clone();
            let mut context = ConnectionContext::new(sink, Arc::clone(&registry));
            context.dynamic_decoding = config.receiver.dynamic_decoding;

            VayuInner {
                identity: config.identity,
                config: config.clone(),
                registry,
                context,
                this: this.clone(),
                connections: Mutex::new(Vec::new()),
                connection_handles: HandleFactory::new(),
                sequence: AtomicU8::new(0),
                message_callbacks: CallbackList::new(),
                json_callbacks: CallbackList::new(),
                raw_sent_callbacks: CallbackList::new(),
                executor,
            }
        });

        log::info!(
            "Vayu started as system {} component {}",
            inner.identity.system_id,
            inner.identity.component_id
        );
        Ok(Self { inner })
    }

    pub fn identity(&self) -> IdentityConfig {
        self.inner.identity
    }

    /// Parse `url`, create the connection and start it
    pub fn add_any_connection(&self, url: &str, forwarding: ForwardingOption) -> Result<ConnectionHandle> {
        let descriptor = connection_url::parse(url)?;
        self.inner.add_connection(descriptor, forwarding)
    }

    /// Bring up every `[[connections]]` entry of the configuration
    pub fn connect_configured(&self) -> Result<Vec<ConnectionHandle>> {
        self.inner
            .config
            .connections
            .iter()
            .map(|entry| self.add_any_connection(&entry.url, entry.forwarding.into()))
            .collect()
    }

    /// Stop and forget a connection
    pub fn remove_connection(&self, handle: ConnectionHandle) -> Result<()> {
        let connection = {
            let mut connections = self.inner.connections.lock();
            let index = connections
                .iter()
                .position(|c| c.id() == handle.id())
                .ok_or(Error::UnknownConnection)?;
            connections.remove(index)
        };
        connection.stop()?;
        log::info!("Removed connection {} ({})", handle.id(), connection.descriptor());
        Ok(())
    }

    /// Handles of all live connections, oldest first
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.inner
            .snapshot()
            .iter()
            .map(|c| ConnectionHandle::from_id(c.id()))
            .collect()
    }

    /// Send a compiled message, stamped with our identity
    ///
    /// Goes to every connection that has seen the target system, or to all
    /// connections for broadcast messages.
    pub fn send_message(&self, message: &MavMessage) -> Result<()> {
        let header = self.inner.next_header();
        let frame = encode_message(header, message).map_err(Error::Send)?;

        let payload_len = frame.get(1).copied().unwrap_or(0) as usize;
        let target_system = frame
            .get(HEADER_LEN_V2..HEADER_LEN_V2 + payload_len)
            .and_then(|payload| {
                self.inner
                    .registry
                    .message(message.message_id())
                    .map(|def| def.target_ids(payload).0)
            })
            .unwrap_or(0);

        self.inner.route(&frame, target_system)
    }

    /// Send a message known to the runtime schema, given as a JSON object of
    /// its fields
    ///
    /// Fields missing from the object are sent as zero.
    pub fn send_json_message(&self, message_name: &str, fields_json: &str) -> Result<()> {
        let def = self
            .inner
            .registry
            .message_by_name(message_name)
            .ok_or_else(|| SchemaError::UnknownMessageName(message_name.to_string()))?;
        let fields: Map<String, Value> = serde_json::from_str(fields_json)?;
        let payload = def.encode(&fields)?;

        let header = self.inner.next_header();
        let frame = build_v2_frame(
            header.sequence,
            header.system_id,
            header.component_id,
            def.id,
            def.crc_extra,
            &payload,
        );
        let (target_system, _) = def.target_ids(&payload);
        self.inner.route(&frame, target_system)
    }

    /// Feed bytes received by the application into the `raw://` connections
    ///
    /// The bytes are also sent out unchanged on every other connection.
    pub fn pass_received_raw_bytes(&self, bytes: &[u8]) -> Result<()> {
        let connections = self.inner.snapshot();
        if !connections.iter().any(|c| c.as_raw().is_some()) {
            log::error!("No raw connection; add \"raw://\" before passing raw bytes");
            return Err(Error::UnknownConnection);
        }

        for connection in &connections {
            match connection.as_raw() {
                Some(raw) => raw.receive(bytes),
                None => {
                    if let Err(e) = connection.send_raw_bytes(bytes) {
                        log::debug!("Raw bytes not sent on connection {}: {}", connection.id(), e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Called (on the callback thread) with every compiled message received
    pub fn subscribe_messages<F>(&self, callback: F) -> MessageHandle
    where
        F: Fn(Arc<DecodedMessage>) + Send + Sync + 'static,
    {
        self.inner.message_callbacks.subscribe(callback)
    }

    pub fn unsubscribe_messages(&self, handle: MessageHandle) {
        self.inner.message_callbacks.unsubscribe(handle);
    }

    /// Called with compiled messages until `callback` returns `true`
    pub fn subscribe_message_once<F>(&self, callback: F)
    where
        F: Fn(Arc<DecodedMessage>) -> bool + Send + Sync + 'static,
    {
        self.inner.message_callbacks.subscribe_conditional(callback);
    }

    /// Called with every message the runtime schema can decode
    pub fn subscribe_messages_json<F>(&self, callback: F) -> JsonMessageHandle
    where
        F: Fn(Arc<JsonMessage>) + Send + Sync + 'static,
    {
        self.inner.json_callbacks.subscribe(callback)
    }

    pub fn unsubscribe_messages_json(&self, handle: JsonMessageHandle) {
        self.inner.json_callbacks.unsubscribe(handle);
    }

    /// Called with every frame sent over a `raw://` connection
    pub fn subscribe_raw_bytes_to_be_sent<F>(&self, callback: F) -> RawBytesHandle
    where
        F: Fn(Arc<[u8]>) + Send + Sync + 'static,
    {
        self.inner.raw_sent_callbacks.subscribe(callback)
    }

    pub fn unsubscribe_raw_bytes_to_be_sent(&self, handle: RawBytesHandle) {
        self.inner.raw_sent_callbacks.unsubscribe(handle);
    }

    /// Merge MAVLink XML message definitions into the runtime schema
    pub fn load_custom_schema(&self, xml: &str) -> bool {
        match self.inner.registry.load_xml(xml) {
            Ok(count) => {
                log::info!("Loaded {} custom message definitions", count);
                true
            }
            Err(e) => {
                log::error!("Failed to load custom schema: {}", e);
                false
            }
        }
    }

    pub fn message_id_to_name(&self, id: u32) -> Result<String> {
        Ok(self.inner.registry.id_to_name(id)?)
    }

    pub fn message_name_to_id(&self, name: &str) -> Result<u32> {
        Ok(self.inner.registry.name_to_id(name)?)
    }

    /// Runtime schema shared by every connection of this instance
    pub fn schema_registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }
}

impl Drop for Vayu {
    fn drop(&mut self) {
        let connections: Vec<_> = self.inner.connections.lock().drain(..).collect();
        for connection in connections {
            if let Err(e) = connection.stop() {
                log::warn!("Failed to stop connection {}: {}", connection.id(), e);
            }
        }
        self.inner.message_callbacks.clear();
        self.inner.json_callbacks.clear();
        self.inner.raw_sent_callbacks.clear();
        log::info!("Vayu stopped");
    }
}

impl VayuInner {
    fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.lock().clone()
    }

    fn next_header(&self) -> MavHeader {
        MavHeader {
            system_id: self.identity.system_id,
            component_id: self.identity.component_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn add_connection(&self, descriptor: ConnectionDescriptor, forwarding: ForwardingOption) -> Result<ConnectionHandle> {
        let handle = self.connection_handles.create();

        let raw_sender = matches!(descriptor, ConnectionDescriptor::Raw).then(|| {
            let this = self.this.clone();
            let sender: RawSender = Arc::new(move |bytes: &[u8]| {
                if let Some(inner) = this.upgrade() {
                    inner
                        .raw_sent_callbacks
                        .queue(Arc::from(bytes), |work| inner.executor.enqueue(work));
                }
            });
            sender
        });

        let connection = create_connection(handle.id(), descriptor, &self.context, forwarding, raw_sender);
        connection.start()?;
        log::info!(
            "Added connection {} ({}, {:?})",
            handle.id(),
            connection.descriptor(),
            forwarding
        );

        self.connections.lock().push(connection);
        Ok(handle)
    }

    /// Send a frame to the connections that can reach `target_system`
    fn route(&self, frame: &[u8], target_system: u8) -> Result<()> {
        let connections = self.snapshot();
        if connections.is_empty() {
            return Err(Error::Send("no connections".to_string()));
        }

        let mut sent = 0usize;
        let mut errors = Vec::new();
        for connection in connections
            .iter()
            .filter(|c| target_system == 0 || c.has_system_id(target_system))
        {
            match connection.send_raw_bytes(frame) {
                Ok(()) => sent += 1,
                Err(e) => errors.push(format!("connection {}: {}", connection.id(), e)),
            }
        }

        if sent > 0 {
            for e in &errors {
                log::debug!("Send failed on {}", e);
            }
            Ok(())
        } else if errors.is_empty() {
            log::warn!("No connection has seen system {}", target_system);
            Err(Error::Send(format!("no connection to system {}", target_system)))
        } else {
            Err(Error::Send(errors.join("; ")))
        }
    }

    /// Relay a received frame byte-exact to the other forwarding connections
    fn forward(&self, message: &DecodedMessage) {
        if message.target_system_id == self.identity.system_id
            && message.target_component_id == self.identity.component_id
        {
            return;
        }

        let connections = self.snapshot();
        if connections.len() < 2 || self.context.forwarding_count.load(Ordering::SeqCst) == 0 {
            return;
        }
        let Some(source) = connections.iter().find(|c| c.id() == message.connection_id) else {
            return;
        };
        // Bytes fed through the raw API are already fanned out.
        if source.as_raw().is_some() {
            return;
        }
        if source.forwarding_enabled() && !source.should_forward_messages() {
            return;
        }

        for target in connections
            .iter()
            .filter(|c| c.id() != source.id() && c.forwarding_enabled())
        {
            if let Err(e) = target.send_raw_bytes(&message.raw_frame) {
                log::debug!("Forwarding to connection {} failed: {}", target.id(), e);
            }
        }
    }
}

impl MessageSink for VayuInner {
    fn on_message(&self, message: DecodedMessage) {
        let enqueue = |work| self.executor.enqueue(work);
        match &message.payload {
            MessagePayload::Typed(_) => {
                self.forward(&message);
                if !self.message_callbacks.empty() {
                    self.message_callbacks.queue(Arc::new(message), enqueue);
                }
            }
            MessagePayload::Fields(_) => {
                if self.json_callbacks.empty() {
                    return;
                }
                if let Some(json) = message.to_json_message() {
                    self.json_callbacks.queue(Arc::new(json), enqueue);
                }
            }
        }
    }
}
