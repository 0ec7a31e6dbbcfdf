//! Configuration for vayu-link
//!
//! Loads the SDK identity, the connections to bring up and the receiver
//! options from a TOML file.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level SDK configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SdkConfig {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Our own address on the MAVLink network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct IdentityConfig {
    /// System id stamped on outgoing frames
    pub system_id: u8,
    /// Component id stamped on outgoing frames
    pub component_id: u8,
}

impl Default for IdentityConfig {
    /// Ground station identity (system 245, component MAV_COMP_ID_MISSIONPLANNER)
    fn default() -> Self {
        Self {
            system_id: 245,
            component_id: 190,
        }
    }
}

/// One connection to bring up with `Vayu::connect_configured`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Connection URL
    ///
    /// Examples:
    /// - `udpin://0.0.0.0:14540` - Listen for a vehicle on port 14540
    /// - `serial:///dev/ttyUSB0:57600` - Telemetry radio
    pub url: String,

    /// Relay frames received here to the other forwarding connections
    #[serde(default)]
    pub forwarding: bool,
}

/// Message receiver options
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReceiverConfig {
    /// Run the runtime-schema decoder next to the compiled one
    #[serde(default = "default_dynamic_decoding")]
    pub dynamic_decoding: bool,

    /// MAVLink XML documents merged into the runtime schema at startup
    #[serde(default)]
    pub custom_schemas: Vec<PathBuf>,
}

fn default_dynamic_decoding() -> bool {
    true
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            dynamic_decoding: true,
            custom_schemas: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install env_logger with this level as the fallback filter
    ///
    /// `RUST_LOG` still wins when set. Meant for host applications; the
    /// library never installs a logger on its own.
    pub fn init(&self) {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.level.as_str()),
        )
        .try_init();
    }
}

impl SdkConfig {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use vayu_link::config::SdkConfig;
    ///
    /// let config = SdkConfig::from_file("vayu.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: SdkConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Ground station defaults listening on the standard GCS port
    pub fn ground_station_defaults() -> Self {
        Self {
            connections: vec![ConnectionConfig {
                url: "udpin://0.0.0.0:14550".to_string(),
                forwarding: false,
            }],
            ..Self::default()
        }
    }
}
