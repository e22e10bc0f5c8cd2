pub mod api;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod listeners;
pub mod net;
pub mod options;
pub mod ports;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod source;

pub use error::TarpitError;
pub use events::{ErrorEvent, SubscriptionId, TarpitEvent};
pub use options::{ResponseSource, TarpitOptions, TarpitOptionsUpdate};
pub use service::{Collaborators, ServiceState, TarpitService};
