//! Static server configuration, loaded once at startup.

use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Result, WsError};

/// Listening transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Tls,
}

/// Paths to the PEM certificate chain and private key used when TLS is
/// enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslCertPath {
    pub crt: PathBuf,
    pub key: PathBuf,
}

/// Server configuration.
///
/// ```json
/// {
///   "transport": "tcp",
///   "host": "0.0.0.0",
///   "port": 9090,
///   "enableSsl": false,
///   "sslCertPath": { "crt": "cert.pem", "key": "key.pem" },
///   "lockPath": "LOCK"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// `tcp` or `tls`.
    pub transport: Transport,
    /// Bind address.
    pub host: String,
    /// TCP port, restricted to the registered range 1024-49151.
    pub port: u16,
    /// Enables TLS regardless of `transport`.
    pub enable_ssl: bool,
    /// Certificate and key paths, required when TLS is enabled.
    pub ssl_cert_path: Option<SslCertPath>,
    /// Location of the single-instance lockfile.
    pub lock_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            host: "0.0.0.0".to_string(),
            port: 9090,
            enable_ssl: false,
            ssl_cert_path: None,
            lock_path: PathBuf::from("LOCK"),
        }
    }
}

impl Config {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| WsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the port range and the TLS path requirements.
    pub fn validate(&self) -> Result<()> {
        if !(1024..=49151).contains(&self.port) {
            return Err(WsError::Config(format!(
                "port {} outside the allowed range 1024-49151",
                self.port
            )));
        }
        if self.wants_tls() && self.ssl_cert_path.is_none() {
            return Err(WsError::Config(
                "TLS enabled but sslCertPath is not set".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the listener should wrap accepted sockets in TLS.
    ///
    /// The original configuration surface carries both a `transport` value
    /// and an `enableSsl` flag; either one switches TLS on.
    pub fn wants_tls(&self) -> bool {
        self.enable_ssl || self.transport == Transport::Tls
    }
}
