//! Connection URL resolver
//!
//! Turns a connection string into a [`ConnectionDescriptor`]:
//!
//! | URL | Descriptor |
//! |-----|------------|
//! | `udpin://0.0.0.0:14540` | listen for UDP on 14540 |
//! | `udpout://192.168.1.12:14550` | send UDP to a fixed remote |
//! | `tcpin://0.0.0.0:5760` | accept one TCP client |
//! | `tcpout://127.0.0.1:5760` | connect to a TCP server |
//! | `serial:///dev/ttyUSB0:57600` | serial device, no flow control |
//! | `serial_flowcontrol://COM3:115200` | serial device, RTS/CTS |
//! | `raw://` | virtual link fed through the raw bytes API |
//!
//! The legacy `udp://` and `tcp://` schemes are still accepted; the mode is
//! inferred from the host (empty or `0.0.0.0` listens, anything else sends).

use crate::error::ParseError;
use std::fmt;

/// Wildcard address used when a listening URL has no host
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// Direction of a socket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Bind locally and wait for the peer
    In,
    /// Reach out to a known remote
    Out,
}

/// Parsed connection string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionDescriptor {
    Udp {
        mode: Mode,
        host: String,
        port: u16,
    },
    Tcp {
        mode: Mode,
        host: String,
        port: u16,
    },
    Serial {
        path: String,
        baudrate: u32,
        flow_control: bool,
    },
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Udp(Option<Mode>),
    Tcp(Option<Mode>),
    Serial { flow_control: bool },
    Raw,
}

const SCHEMES: &[(&str, Scheme)] = &[
    ("udpin", Scheme::Udp(Some(Mode::In))),
    ("udpout", Scheme::Udp(Some(Mode::Out))),
    ("udp", Scheme::Udp(None)),
    ("tcpin", Scheme::Tcp(Some(Mode::In))),
    ("tcpout", Scheme::Tcp(Some(Mode::Out))),
    ("tcp", Scheme::Tcp(None)),
    ("serial_flowcontrol", Scheme::Serial { flow_control: true }),
    ("serial", Scheme::Serial { flow_control: false }),
    ("raw", Scheme::Raw),
];

/// Parse a connection URL
///
/// Pure function: a failed attempt produces no descriptor and leaves nothing
/// behind for the next call.
pub fn parse(url: &str) -> Result<ConnectionDescriptor, ParseError> {
    let (scheme_str, rest) = url
        .split_once("://")
        .ok_or_else(|| ParseError::UnknownProtocol(url.to_string()))?;

    let scheme = SCHEMES
        .iter()
        .find(|(name, _)| *name == scheme_str)
        .map(|(_, scheme)| *scheme)
        .ok_or_else(|| {
            log::warn!("Unknown protocol: {}", scheme_str);
            ParseError::UnknownProtocol(scheme_str.to_string())
        })?;

    match scheme {
        Scheme::Udp(mode) => {
            let (mode, host, port) = parse_network(rest, mode)?;
            Ok(ConnectionDescriptor::Udp { mode, host, port })
        }
        Scheme::Tcp(mode) => {
            let (mode, host, port) = parse_network(rest, mode)?;
            Ok(ConnectionDescriptor::Tcp { mode, host, port })
        }
        Scheme::Serial { flow_control } => {
            let (path, baudrate) = parse_serial(rest)?;
            Ok(ConnectionDescriptor::Serial {
                path,
                baudrate,
                flow_control,
            })
        }
        Scheme::Raw => Ok(ConnectionDescriptor::Raw),
    }
}

fn parse_network(rest: &str, explicit: Option<Mode>) -> Result<(Mode, String, u16), ParseError> {
    let (host, port_str) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => {
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                log::warn!("Path can't be numbers only");
                return Err(ParseError::NumericPath(rest.to_string()));
            }
            log::warn!("Port missing in {}", rest);
            return Err(ParseError::InvalidPort(String::new()));
        }
    };

    let port = parse_port(port_str)?;

    let host = if host.is_empty() { WILDCARD_HOST } else { host };

    let mode = match explicit {
        Some(mode) => mode,
        None => {
            log::warn!("udp:// and tcp:// are deprecated, use udpin/udpout or tcpin/tcpout");
            if host == WILDCARD_HOST {
                Mode::In
            } else {
                Mode::Out
            }
        }
    };

    if mode == Mode::Out && host == WILDCARD_HOST {
        log::warn!("Can't send to {}", WILDCARD_HOST);
        return Err(ParseError::WildcardRemote(host.to_string()));
    }

    Ok((mode, host.to_string(), port))
}

fn parse_port(port_str: &str) -> Result<u16, ParseError> {
    if port_str.is_empty() || !port_str.bytes().all(|b| b.is_ascii_digit()) {
        log::warn!("Non-numeric char found in port");
        return Err(ParseError::InvalidPort(port_str.to_string()));
    }
    match port_str.parse::<u32>() {
        Ok(port) if (1..=u16::MAX as u32).contains(&port) => Ok(port as u16),
        _ => {
            log::warn!("Port out of range: {}", port_str);
            Err(ParseError::InvalidPort(port_str.to_string()))
        }
    }
}

fn parse_serial(rest: &str) -> Result<(String, u32), ParseError> {
    if rest.is_empty() {
        log::warn!("Path for serial device required");
        return Err(ParseError::MissingSerialPath);
    }

    let (path, baud_str) = match rest.rsplit_once(':') {
        Some((path, baud)) => (path, Some(baud)),
        None => (rest, None),
    };

    if !path.is_empty() && path.bytes().all(|b| b.is_ascii_digit()) {
        log::warn!("Path can't be numbers only");
        return Err(ParseError::NumericPath(path.to_string()));
    }

    validate_serial_path(path)?;

    let baudrate = match baud_str {
        None => 0,
        Some(baud) => {
            if baud.is_empty() || !baud.bytes().all(|b| b.is_ascii_digit()) {
                log::warn!("Non-numeric char found in baudrate");
                return Err(ParseError::InvalidBaudrate(baud.to_string()));
            }
            baud.parse::<u32>()
                .map_err(|_| ParseError::InvalidBaudrate(baud.to_string()))?
        }
    };

    Ok((path.to_string(), baudrate))
}

fn validate_serial_path(path: &str) -> Result<(), ParseError> {
    if path.starts_with('/') {
        return Ok(());
    }

    if let Some(number) = path.strip_prefix("COM") {
        if number.is_empty() {
            log::warn!("COM port number missing");
            return Err(ParseError::InvalidComPort(path.to_string()));
        }
        if !number.bytes().all(|b| b.is_ascii_digit()) {
            log::warn!("COM port number invalid");
            return Err(ParseError::InvalidComPort(path.to_string()));
        }
        return Ok(());
    }

    if path.is_empty() {
        log::warn!("Path for serial device required");
        return Err(ParseError::MissingSerialPath);
    }

    log::warn!("Invalid serial path: {}", path);
    Err(ParseError::InvalidSerialPath(path.to_string()))
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode_suffix = |mode: &Mode| match mode {
            Mode::In => "in",
            Mode::Out => "out",
        };
        match self {
            ConnectionDescriptor::Udp { mode, host, port } => {
                write!(f, "udp{}://{}:{}", mode_suffix(mode), host, port)
            }
            ConnectionDescriptor::Tcp { mode, host, port } => {
                write!(f, "tcp{}://{}:{}", mode_suffix(mode), host, port)
            }
            ConnectionDescriptor::Serial {
                path,
                baudrate,
                flow_control,
            } => {
                let scheme = if *flow_control {
                    "serial_flowcontrol"
                } else {
                    "serial"
                };
                write!(f, "{}://{}:{}", scheme, path, baudrate)
            }
            ConnectionDescriptor::Raw => write!(f, "raw://"),
        }
    }
}

impl std::str::FromStr for ConnectionDescriptor {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}
