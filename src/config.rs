// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Configuration types for [`Reader`](crate::reader::Reader) and
//! [`Writer`](crate::writer::Writer), and the per-connection `IDENTIFY`
//! payload they negotiate.
//!
//! Validation happens at construction (`build()`), not lazily: a malformed
//! `topic`/`channel` or a negative `max_in_flight` is a [`ConfigError`],
//! surfaced synchronously, never discovered mid-run.

use std::time::Duration;

use serde::Serialize;

use crate::error::{ConfigError, Result};

fn validate_name(field: &'static str, value: &str) -> Result<()> {
    let (core, ephemeral) = match value.strip_suffix("#ephemeral") {
        Some(rest) => (rest, true),
        None => (value, false),
    };
    let len_ok = !core.is_empty() && core.len() <= 64;
    let chars_ok = core
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    let _ = ephemeral;
    if len_ok && chars_ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            field,
            value: value.to_string(),
        }
        .into())
    }
}

/// Builder/config for a [`Reader`](crate::reader::Reader).
#[derive(Clone, Debug)]
pub struct ReaderConfig {
    pub topic: String,
    pub channel: String,
    pub nsqd_tcp_addresses: Vec<String>,
    pub lookupd_http_addresses: Vec<String>,
    pub lookupd_poll_interval: Duration,
    pub lookupd_poll_jitter: f32,
    pub max_in_flight: i64,
    pub max_tries: u16,
    pub low_rdy_idle_timeout: Duration,
    pub heartbeat_interval: i32,
    pub backoff_enabled: bool,
    pub max_backoff_duration: Duration,
    pub identify: IdentifyConfig,
    pub auth_secret: Option<Vec<u8>>,
}

impl ReaderConfig {
    /// Start a builder for topic/channel, pre-filled with sensible defaults.
    pub fn new(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            nsqd_tcp_addresses: Vec::new(),
            lookupd_http_addresses: Vec::new(),
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            max_in_flight: 1,
            max_tries: 5,
            low_rdy_idle_timeout: Duration::from_secs(15),
            heartbeat_interval: 30_000,
            backoff_enabled: true,
            max_backoff_duration: Duration::from_secs(120),
            identify: IdentifyConfig::default(),
            auth_secret: None,
        }
    }

    pub fn nsqd_tcp_addresses(mut self, addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.nsqd_tcp_addresses = addrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn lookupd_http_addresses(mut self, addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.lookupd_http_addresses = addrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_in_flight(mut self, n: i64) -> Self {
        self.max_in_flight = n;
        self
    }

    pub fn max_tries(mut self, n: u16) -> Self {
        self.max_tries = n;
        self
    }

    pub fn backoff_enabled(mut self, enabled: bool) -> Self {
        self.backoff_enabled = enabled;
        self
    }

    pub fn auth_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.auth_secret = Some(secret.into());
        self
    }

    /// Validate and finalize the configuration.
    pub fn build(self) -> Result<Self> {
        validate_name("topic", &self.topic)?;
        validate_name("channel", &self.channel)?;
        if self.max_in_flight < 0 {
            return Err(ConfigError::NegativeMaxInFlight(self.max_in_flight).into());
        }
        if self.nsqd_tcp_addresses.is_empty() && self.lookupd_http_addresses.is_empty() {
            return Err(ConfigError::NoProducerSource.into());
        }
        Ok(self)
    }
}

/// Builder/config for a [`Writer`](crate::writer::Writer).
#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub nsqd_tcp_addresses: Vec<String>,
    pub identify: IdentifyConfig,
    pub auth_secret: Option<Vec<u8>>,
    pub max_reconnect_delay: Duration,
}

impl WriterConfig {
    pub fn new(addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            nsqd_tcp_addresses: addrs.into_iter().map(Into::into).collect(),
            identify: IdentifyConfig::default(),
            auth_secret: None,
            max_reconnect_delay: Duration::from_secs(60),
        }
    }

    pub fn build(self) -> Result<Self> {
        if self.nsqd_tcp_addresses.is_empty() {
            return Err(ConfigError::NoProducerSource.into());
        }
        Ok(self)
    }
}

/// TLS options, consumed when [`IdentifyConfig::tls_v1`] is set and the
/// `tls` feature is enabled.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    pub cert_chain_pem: Option<Vec<u8>>,
    pub private_key_pem: Option<Vec<u8>>,
    pub root_ca_pem: Option<Vec<u8>>,
    pub insecure_skip_verify: bool,
}

/// The per-connection `IDENTIFY` payload. Field names match the wire protocol
/// exactly (`#[serde(rename_all)]` would hide typos, so each field is
/// explicit) since this struct is serialized verbatim as the IDENTIFY body.
#[derive(Clone, Debug, Serialize)]
pub struct IdentifyConfig {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub heartbeat_interval: i32,
    pub feature_negotiation: bool,
    pub tls_v1: bool,
    pub snappy: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
    pub sample_rate: i32,
    pub msg_timeout: i64,

    #[serde(skip)]
    pub tls_config: Option<TlsConfig>,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        let hostname = hostname_or_default();
        Self {
            client_id: hostname.clone(),
            hostname,
            user_agent: concat!("nsq-rs/", env!("CARGO_PKG_VERSION")).to_string(),
            heartbeat_interval: 30_000,
            feature_negotiation: true,
            tls_v1: false,
            snappy: false,
            deflate: false,
            deflate_level: 6,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: 250,
            sample_rate: 0,
            msg_timeout: 60_000,
            tls_config: None,
        }
    }
}

/// The actual machine hostname, not a stand-in for one -- `nsqadmin` and
/// broker-side tooling display this verbatim as the client's identity.
#[cfg(unix)]
fn hostname_or_default() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is a valid mutable buffer of known size; `gethostname`
    // writes at most `buf.len()` bytes, including the NUL terminator, on
    // success.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return "unknown-host".to_string();
    }
    // SAFETY: `gethostname` returned success, so `buf` holds a
    // NUL-terminated C string within its bounds.
    let hostname = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr().cast()) }.to_string_lossy().into_owned();
    if hostname.is_empty() {
        "unknown-host".to_string()
    } else {
        hostname
    }
}

#[cfg(windows)]
fn hostname_or_default() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(not(any(unix, windows)))]
fn hostname_or_default() -> String {
    "unknown-host".to_string()
}
