use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Point-in-time view of one tarpitted connection.
/// Copied out of the live connection so observers cannot mutate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Unique while the service runs, assigned in acceptance order
    pub id: u32,

    /// Time the connection was accepted
    pub created: DateTime<Utc>,

    /// Time the connection completed, if it has
    pub ended: Option<DateTime<Utc>>,

    /// Time held so far (frozen once completed)
    pub duration: Duration,

    /// Total bytes written to the peer
    pub bytes_sent: u64,

    /// Local endpoint, e.g. "10.0.0.5:8022"
    pub local_endpoint: String,

    /// Remote endpoint, e.g. "203.0.113.9:51122"
    pub remote_endpoint: String,

    /// Whether the connection has been closed
    pub completed: bool,
}
