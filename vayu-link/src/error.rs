//! Error types for vayu-link

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Connection string rejected by the URL resolver
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Scheme is missing or not one of the supported ones
    #[error("Unknown protocol in connection url: {0}")]
    UnknownProtocol(String),

    /// Serial connection without a device path
    #[error("Path for serial device required")]
    MissingSerialPath,

    /// Path made of digits only (most likely a port without host)
    #[error("Path can't be numbers only: {0}")]
    NumericPath(String),

    /// Serial path neither absolute nor a COM port
    #[error("Invalid serial path: {0}")]
    InvalidSerialPath(String),

    /// `COM` without a port number, or with non-digits after it
    #[error("Invalid COM port: {0}")]
    InvalidComPort(String),

    /// Port missing, non-numeric, or outside 1..=65535
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Baud rate is not a non-negative integer
    #[error("Invalid baudrate: {0}")]
    InvalidBaudrate(String),

    /// Outgoing connection aimed at the wildcard address
    #[error("Can't send to wildcard address {0}")]
    WildcardRemote(String),
}

/// Failure to bring a connection up or down
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Socket could not be bound to the local address
    #[error("Bind to {addr} failed: {source}")]
    Bind {
        /// Local address
        addr: String,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// Outgoing TCP connection failed
    #[error("Connect to {addr} failed: {source}")]
    Connect {
        /// Remote address
        addr: String,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// Host name did not resolve to an IPv4/IPv6 address
    #[error("Could not resolve address: {0}")]
    Resolve(String),

    /// Serial device could not be opened
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Baud rate has no platform equivalent
    #[error("Unsupported baudrate: {0}")]
    UnsupportedBaudrate(u32),

    /// `start()` called twice
    #[error("Connection already started")]
    AlreadyStarted,

    /// Receive thread could not be spawned
    #[error("Failed to spawn receive thread: {0}")]
    ThreadSpawn(String),

    /// Receive thread panicked
    #[error("Receive thread panicked")]
    ThreadPanic,

    /// I/O error while configuring the socket or device
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Problems with runtime-loaded message definitions
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Document is not well-formed XML
    #[error("XML error: {0}")]
    Xml(#[from] roxmltree::Error),

    /// Message or field element missing a required attribute
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    /// Field type not part of the protocol's type system
    #[error("Unknown field type: {0}")]
    UnknownFieldType(String),

    /// Message name not present in the registry
    #[error("Unknown message name: {0}")]
    UnknownMessageName(String),

    /// Message id not present in the registry
    #[error("Unknown message id: {0}")]
    UnknownMessageId(u32),

    /// JSON value does not fit the field it is assigned to
    #[error("Invalid value for field {field}: {reason}")]
    InvalidFieldValue {
        /// Field name
        field: String,
        /// What was wrong
        reason: String,
    },
}

/// vayu-link error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection URL rejected
    #[error("Connection url invalid: {0}")]
    Parse(#[from] ParseError),

    /// Connection start/stop failure
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Message definition problem
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// JSON field map could not be parsed or produced
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sending on a connection failed
    #[error("Send failed: {0}")]
    Send(String),

    /// Handle does not refer to a live connection
    #[error("Unknown connection handle")]
    UnknownConnection,
}
