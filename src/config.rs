use crate::conn::{ConnOptions, DEFAULT_MAX_MESSAGE_SIZE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server URL: ldap://host[:port] or ldaps://host[:port].
    pub url: String,
    /// Simple bind performed right after connecting. Anonymous when absent.
    pub bind: Option<BindConfig>,
    /// Per-request deadline in milliseconds. No deadline when absent.
    pub timeout_ms: Option<u64>,
    /// TCP connect plus TLS handshake deadline in milliseconds (default 5000).
    pub connect_timeout_ms: Option<u64>,
    /// Fail on mismatched response tags instead of logging them.
    #[serde(default)]
    pub strict_responses: bool,
    /// Largest accepted inbound message in bytes (default 16 MiB).
    pub max_message_size: Option<usize>,
    #[serde(default)]
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    pub dn: String,
    #[serde(default)]
    pub password: String,
}

/// Client-side TLS for ldaps:// URLs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Extra PEM CA bundle trusted in addition to the system roots.
    pub ca_file: Option<String>,
    /// Client certificate for mutual TLS (requires key_file).
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Не проверять сертификат сервера (только для тестов/внутренней сети).
    #[serde(default)]
    pub skip_verify: bool,
}

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }

    pub fn conn_options(&self) -> ConnOptions {
        ConnOptions {
            timeout: self.timeout_ms.map(Duration::from_millis),
            strict_responses: self.strict_responses,
            max_message_size: self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ldap://127.0.0.1:389".to_string(),
            bind: None,
            timeout_ms: Some(30_000),
            connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
            strict_responses: false,
            max_message_size: None,
            tls: TlsSettings::default(),
        }
    }
}
