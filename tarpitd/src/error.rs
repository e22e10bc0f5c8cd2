use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TarpitError {
    #[error("{field}: {reason}")]
    InvalidOption { field: &'static str, reason: String },

    #[error("ports: invalid port specification {spec:?}: {reason}")]
    InvalidPorts { spec: String, reason: String },

    #[error("options cannot be changed while listeners are active")]
    Locked,

    #[error("service has no options configured")]
    NotConfigured,

    #[error("service is already running")]
    AlreadyRunning,

    #[error("service is not running")]
    NotRunning,

    #[error("response source has no data")]
    EmptySource,

    #[error("failed to read response file {}", .path.display())]
    ResponseFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no port could be bound")]
    NoListeners,

    #[error("{event} observer panicked: {message}")]
    ObserverPanicked { event: &'static str, message: String },

    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl TarpitError {
    pub(crate) fn invalid_option(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption { field, reason: reason.into() }
    }

    /// True for the configuration family: bad option values, bad ports,
    /// reconfiguring a live service, or an unusable response source.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidOption { .. }
                | Self::InvalidPorts { .. }
                | Self::Locked
                | Self::NotConfigured
                | Self::EmptySource
                | Self::ResponseFile { .. }
        )
    }
}
