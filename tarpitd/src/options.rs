use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use shared::protocol::{
    DEFAULT_LISTEN_ADDRESS, DEFAULT_PORTS, DEFAULT_RESPONSE_TEXT, DEFAULT_SEND_TIMEOUT_MS,
    DEFAULT_TIMEOUT_SECS, DEFAULT_UPDATE_INTERVAL_SECS, DEFAULT_WRITE_INTERVAL_MS,
    DEFAULT_WRITE_SIZE,
};
use crate::error::TarpitError;
use crate::ports;

/// Upper bound for every interval, size and timeout option.
const MAX_OPTION_VALUE: u64 = i32::MAX as u64;

/// Where the bytes trickled to peers come from. Exactly one form is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSource {
    Payload(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarpitOptions {
    pub listen_address: String,
    pub ports: String,
    pub ipv4_only: bool,
    /// Tick cadence of the update scheduler
    pub write_interval_ms: u64,
    /// Bytes per send, also the socket send buffer size
    pub write_size: usize,
    /// Cadence of the aggregated "connections updated" event
    pub update_interval_secs: u64,
    /// Maximum time a connection is held
    pub timeout_secs: u64,
    pub send_timeout_ms: u64,
    response: ResponseSource,
}

impl Default for TarpitOptions {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            ports: DEFAULT_PORTS.to_string(),
            ipv4_only: false,
            write_interval_ms: DEFAULT_WRITE_INTERVAL_MS,
            write_size: DEFAULT_WRITE_SIZE,
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            response: ResponseSource::Payload(DEFAULT_RESPONSE_TEXT.as_bytes().to_vec()),
        }
    }
}

impl TarpitOptions {
    pub fn response(&self) -> &ResponseSource {
        &self.response
    }

    /// Literal payload, if the response is not file backed.
    pub fn response_payload(&self) -> Option<&[u8]> {
        match &self.response {
            ResponseSource::Payload(bytes) => Some(bytes),
            ResponseSource::File(_) => None,
        }
    }

    pub fn response_file(&self) -> Option<&Path> {
        match &self.response {
            ResponseSource::File(path) => Some(path),
            ResponseSource::Payload(_) => None,
        }
    }

    /// Replaces any response file.
    pub fn set_response_text(&mut self, text: impl Into<String>) {
        self.response = ResponseSource::Payload(text.into().into_bytes());
    }

    /// Replaces any response file.
    pub fn set_response_payload(&mut self, payload: impl Into<Vec<u8>>) {
        self.response = ResponseSource::Payload(payload.into());
    }

    /// Replaces any literal payload.
    pub fn set_response_file(&mut self, path: impl Into<PathBuf>) {
        self.response = ResponseSource::File(path.into());
    }

    pub fn listen_ip(&self) -> Result<IpAddr, TarpitError> {
        self.listen_address
            .parse()
            .map_err(|_| TarpitError::invalid_option("listen_address", format!("{:?} is not a valid IP address", self.listen_address)))
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Check every field, reporting the first one that is unusable.
    pub fn validate(&self) -> Result<(), TarpitError> {
        if self.listen_address.trim().is_empty() {
            return Err(TarpitError::invalid_option("listen_address", "should not be empty"));
        }
        let ip = self.listen_ip()?;
        if self.ipv4_only && ip.is_ipv6() {
            return Err(TarpitError::invalid_option(
                "listen_address",
                format!("{ip} is an IPv6 address but ipv4_only is set"),
            ));
        }

        ports::validate(&self.ports)?;

        check_range("write_interval_ms", self.write_interval_ms)?;
        check_range("write_size", self.write_size as u64)?;
        check_range("update_interval_secs", self.update_interval_secs)?;
        check_range("timeout_secs", self.timeout_secs)?;
        check_range("send_timeout_ms", self.send_timeout_ms)?;

        if let ResponseSource::Payload(bytes) = &self.response {
            if bytes.is_empty() {
                return Err(TarpitError::invalid_option("response_text", "should not be empty"));
            }
        }

        Ok(())
    }
}

fn check_range(field: &'static str, value: u64) -> Result<(), TarpitError> {
    if value == 0 {
        return Err(TarpitError::invalid_option(field, "should be greater than 0"));
    }
    if value > MAX_OPTION_VALUE {
        return Err(TarpitError::invalid_option(
            field,
            format!("should not exceed {MAX_OPTION_VALUE}"),
        ));
    }
    Ok(())
}

/// Partial options; only the fields that are set get applied.
/// This is also the `[tarpit]` section of the daemon config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TarpitOptionsUpdate {
    pub listen_address: Option<String>,
    pub ports: Option<String>,
    pub ipv4_only: Option<bool>,
    pub write_interval_ms: Option<u64>,
    pub write_size: Option<usize>,
    pub update_interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub send_timeout_ms: Option<u64>,
    pub response_text: Option<String>,
    pub response_file: Option<PathBuf>,
}

impl TarpitOptionsUpdate {
    /// Merge onto `base`, returning the combined options. `base` is not
    /// modified, so a failed merge leaves the caller's options intact.
    pub fn apply_to(&self, base: &TarpitOptions) -> Result<TarpitOptions, TarpitError> {
        let mut merged = base.clone();

        if let Some(listen_address) = &self.listen_address {
            merged.listen_address = listen_address.clone();
        }
        if let Some(ports) = &self.ports {
            merged.ports = ports.clone();
        }
        if let Some(ipv4_only) = self.ipv4_only {
            merged.ipv4_only = ipv4_only;
        }
        if let Some(value) = self.write_interval_ms {
            merged.write_interval_ms = value;
        }
        if let Some(value) = self.write_size {
            merged.write_size = value;
        }
        if let Some(value) = self.update_interval_secs {
            merged.update_interval_secs = value;
        }
        if let Some(value) = self.timeout_secs {
            merged.timeout_secs = value;
        }
        if let Some(value) = self.send_timeout_ms {
            merged.send_timeout_ms = value;
        }

        match (&self.response_text, &self.response_file) {
            (Some(_), Some(_)) => {
                return Err(TarpitError::invalid_option(
                    "response_text",
                    "response_text and response_file are mutually exclusive",
                ));
            }
            (Some(text), None) => merged.set_response_text(text.clone()),
            (None, Some(path)) => merged.set_response_file(path.clone()),
            (None, None) => {}
        }

        Ok(merged)
    }
}
